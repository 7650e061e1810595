use crate::util::DynError;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use teloxide::types::{ChatId, UserId};

/// The persistence layer could not be read or written. The decider never
/// retries and never swallows this: doing so could award points twice or
/// lose a recorded award.
#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("Score storage is unavailable")]
    Unavailable { source: Box<DynError> },
}

/// One leaderboard row. `full_name`/`username` are last-observed snapshots
/// refreshed on every award, never identity.
#[derive(Debug, Clone)]
pub(crate) struct ScoreRecord {
    pub(crate) chat_id: ChatId,
    pub(crate) user_id: UserId,
    pub(crate) points: i64,
    pub(crate) full_name: String,
    pub(crate) username: Option<String>,
}

impl ScoreRecord {
    pub(crate) fn display_name(&self) -> &str {
        if self.full_name.is_empty() {
            self.username.as_deref().unwrap_or("???")
        } else {
            &self.full_name
        }
    }
}

/// A single successful award to be recorded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NewAward<'a> {
    pub(crate) chat_id: ChatId,
    pub(crate) user_id: UserId,
    pub(crate) points: i64,
    pub(crate) full_name: &'a str,
    pub(crate) username: Option<&'a str>,
    pub(crate) awarded_on: NaiveDate,
}

/// Storage port of the award decider. Identity is strictly the
/// `(chat_id, user_id)` pair.
///
/// [`Self::record_award`] must apply the points increment and the award-mark
/// overwrite as one atomic unit. The decider serializes calls per
/// `(chat_id, user_id)` key, so implementations don't need their own
/// compare-and-swap on the mark, only transactionality of the two writes.
#[async_trait]
pub(crate) trait ScoreStore: Send + Sync + 'static {
    async fn balance(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<i64>, StoreError>;

    async fn last_award_date(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Option<NaiveDate>, StoreError>;

    /// Upserts the score record (creating it with zero points if new), adds
    /// the points, overwrites the award mark and returns the new balance.
    async fn record_award(&self, award: NewAward<'_>) -> Result<i64, StoreError>;

    async fn top(&self, chat_id: ChatId, limit: u32) -> Result<Vec<ScoreRecord>, StoreError>;
}

/// Ephemeral backend. Used in tests and usable as a throwaway runtime store;
/// everything is gone on restart.
#[derive(Default)]
pub(crate) struct MemoryStore {
    records: SyncMutex<HashMap<(ChatId, UserId), MemoryRecord>>,
}

#[derive(Default)]
struct MemoryRecord {
    points: i64,
    full_name: String,
    username: Option<String>,
    last_award_date: Option<NaiveDate>,
}

#[async_trait]
impl ScoreStore for MemoryStore {
    async fn balance(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<i64>, StoreError> {
        let records = self.records.lock();
        Ok(records.get(&(chat_id, user_id)).map(|record| record.points))
    }

    async fn last_award_date(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let records = self.records.lock();
        Ok(records
            .get(&(chat_id, user_id))
            .and_then(|record| record.last_award_date))
    }

    async fn record_award(&self, award: NewAward<'_>) -> Result<i64, StoreError> {
        let mut records = self.records.lock();
        let record = records.entry((award.chat_id, award.user_id)).or_default();

        record.points += award.points;
        record.full_name = award.full_name.to_owned();
        record.username = award.username.map(ToOwned::to_owned);
        record.last_award_date = Some(award.awarded_on);

        Ok(record.points)
    }

    async fn top(&self, chat_id: ChatId, limit: u32) -> Result<Vec<ScoreRecord>, StoreError> {
        let records = self.records.lock();

        let mut top: Vec<_> = records
            .iter()
            .filter(|((chat, _), _)| *chat == chat_id)
            .map(|(&(chat_id, user_id), record)| ScoreRecord {
                chat_id,
                user_id,
                points: record.points,
                full_name: record.full_name.clone(),
                username: record.username.clone(),
            })
            .collect();

        top.sort_by_key(|record| (std::cmp::Reverse(record.points), record.user_id));
        top.truncate(limit as usize);

        Ok(top)
    }
}
