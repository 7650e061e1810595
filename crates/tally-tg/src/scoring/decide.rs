use super::{extract, normalize_tag, Config, ScoreStore, StoreError, TagSpan};
use crate::prelude::*;
use chrono::{FixedOffset, NaiveDate};
use parking_lot::Mutex as SyncMutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use teloxide::types::{ChatId, UserId};
use tokio::sync::Mutex as AsyncMutex;

/// Everything the decider needs to know about one inbound message.
/// The transport layer builds this from the Telegram update.
#[derive(Debug, Clone)]
pub(crate) struct InboundMessage {
    pub(crate) chat_id: ChatId,
    pub(crate) user_id: UserId,
    pub(crate) full_name: String,
    pub(crate) username: Option<String>,
    /// Message text or media caption, whichever is populated.
    pub(crate) text: String,
    pub(crate) spans: Vec<TagSpan>,
}

/// Result of running one message through the award state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// No configured tag matched. No side effect.
    NoMatch,

    /// A tag matched, but the user was already credited today in this chat.
    AlreadyAwarded { balance: i64 },

    /// First qualifying message of the day: points were added and the
    /// award mark overwritten.
    Awarded { points_added: i64, new_balance: i64 },
}

pub(crate) struct ScoreService {
    /// Normalized tag -> points.
    tag_table: HashMap<String, i64>,
    tz: FixedOffset,
    store: Arc<dyn ScoreStore>,
    award_locks: AwardLocks,
}

impl ScoreService {
    pub(crate) fn new(cfg: &Config, store: Arc<dyn ScoreStore>) -> Self {
        let tag_table = cfg
            .tag_table
            .iter()
            .map(|(tag, &points)| (normalize_tag(tag), i64::from(points)))
            .collect();

        let tz = FixedOffset::east_opt(cfg.utc_offset_hours * 3600).unwrap_or_else(|| {
            panic!(
                "BUG: invalid UTC offset in config: {} hours",
                cfg.utc_offset_hours
            )
        });

        Self {
            tag_table,
            tz,
            store,
            award_locks: AwardLocks::default(),
        }
    }

    /// Runs the message through the state machine using the current calendar
    /// date in the configured time zone.
    pub(crate) async fn process(&self, msg: &InboundMessage) -> Result<Outcome, StoreError> {
        self.decide(msg, self.tz.today()).await
    }

    /// Same as [`Self::process`], but with an explicit decision date.
    ///
    /// The read-modify-write against the store is serialized per
    /// `(chat_id, user_id)`: two concurrent qualifying messages from the
    /// same user in the same chat yield exactly one `Awarded`. Different
    /// keys never block each other.
    pub(crate) async fn decide(
        &self,
        msg: &InboundMessage,
        today: NaiveDate,
    ) -> Result<Outcome, StoreError> {
        let tags = extract(Some(&msg.text), Some(&msg.spans));
        let raw_text = msg.text.to_lowercase();

        let Some(points) = self.best_match(&tags, &raw_text) else {
            return Ok(Outcome::NoMatch);
        };

        let key = (msg.chat_id, msg.user_id);
        let lock = self.award_locks.acquire(key);

        let outcome = {
            let _guard = lock.lock().await;
            self.try_award(msg, points, today).await
        };

        self.award_locks.release(key, lock);
        outcome
    }

    async fn try_award(
        &self,
        msg: &InboundMessage,
        points: i64,
        today: NaiveDate,
    ) -> Result<Outcome, StoreError> {
        let last = self.store.last_award_date(msg.chat_id, msg.user_id).await?;

        // `>=` also covers a future-dated mark, which can only mean clock
        // drift; treating it as already-awarded keeps points from doubling.
        if last.is_some_and(|date| date >= today) {
            let balance = self.store.balance(msg.chat_id, msg.user_id).await?.unwrap_or(0);
            debug!(balance, "User already awarded today");
            return Ok(Outcome::AlreadyAwarded { balance });
        }

        let new_balance = self
            .store
            .record_award(super::NewAward {
                chat_id: msg.chat_id,
                user_id: msg.user_id,
                points,
                full_name: &msg.full_name,
                username: msg.username.as_deref(),
                awarded_on: today,
            })
            .await?;

        info!(points, new_balance, "Awarded points");

        Ok(Outcome::Awarded {
            points_added: points,
            new_balance,
        })
    }

    /// Entity-derived tags take precedence. The raw-substring fallback is
    /// consulted only when they yield nothing, because some message sources
    /// strip the span annotations. When several tags match, the single award
    /// is worth the maximum of their values, never the sum.
    fn best_match(&self, tags: &HashSet<String>, raw_text_lowercased: &str) -> Option<i64> {
        tags.iter()
            .filter_map(|tag| self.tag_table.get(tag))
            .copied()
            .max()
            .or_else(|| self.fallback_match(raw_text_lowercased))
    }

    fn fallback_match(&self, raw_text_lowercased: &str) -> Option<i64> {
        self.tag_table
            .iter()
            .filter(|(tag, _)| contains_with_boundaries(raw_text_lowercased, tag))
            .map(|(_, &points)| points)
            .max()
    }
}

/// Substring search with a word-boundary check on both sides, so that a tag
/// never matches inside a longer word (`#балл` must not match `#баллон`).
fn contains_with_boundaries(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }

    let mut from = 0;
    while let Some(pos) = haystack[from..].find(needle) {
        let start = from + pos;
        let end = start + needle.len();

        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());

        if before_ok && after_ok {
            return true;
        }

        from = end;
    }

    false
}

type LockKey = (ChatId, UserId);

/// Map of in-flight award decisions, one async mutex per `(chat, user)`.
/// Entries are evicted as soon as the last interested task releases them,
/// so the map only ever holds keys with messages currently in flight.
#[derive(Default)]
struct AwardLocks {
    map: SyncMutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl AwardLocks {
    fn acquire(&self, key: LockKey) -> Arc<AsyncMutex<()>> {
        self.map.lock().entry(key).or_default().clone()
    }

    fn release(&self, key: LockKey, lock: Arc<AsyncMutex<()>>) {
        let mut map = self.map.lock();

        // 2 = the map's reference plus ours: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::MemoryStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::NaiveDate;

    const CHAT_A: ChatId = ChatId(-1001);
    const CHAT_B: ChatId = ChatId(-1002);
    const USER: UserId = UserId(42);

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, n).unwrap()
    }

    fn config() -> Config {
        Config {
            tag_table: HashMap::from([
                ("#балл".to_owned(), 1),
                ("#ЧЕЛЛЕНДЖ1".to_owned(), 5),
            ]),
            utc_offset_hours: 3,
            reply_ttl_secs: 5,
        }
    }

    fn service() -> ScoreService {
        ScoreService::new(&config(), Arc::new(MemoryStore::default()))
    }

    /// Message without span annotations: only the fallback path can match.
    fn bare_msg(chat_id: ChatId, text: &str) -> InboundMessage {
        InboundMessage {
            chat_id,
            user_id: USER,
            full_name: "Мария".to_owned(),
            username: Some("maria".to_owned()),
            text: text.to_owned(),
            spans: vec![],
        }
    }

    /// Message with hashtag spans computed for every `#word` in the text.
    fn spanned_msg(chat_id: ChatId, text: &str) -> InboundMessage {
        let chars: Vec<char> = text.chars().collect();
        let mut spans = vec![];
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '#' {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                spans.push(TagSpan {
                    offset: start,
                    len: i - start,
                    is_hashtag: true,
                });
            } else {
                i += 1;
            }
        }

        InboundMessage {
            spans,
            ..bare_msg(chat_id, text)
        }
    }

    #[test_log::test(tokio::test)]
    async fn awards_only_once_per_day() {
        let service = service();
        let msg = spanned_msg(CHAT_A, "#балл");

        let first = service.decide(&msg, day(1)).await.unwrap();
        assert_eq!(
            first,
            Outcome::Awarded {
                points_added: 1,
                new_balance: 1
            }
        );

        for _ in 0..2 {
            let repeat = service.decide(&msg, day(1)).await.unwrap();
            assert_eq!(repeat, Outcome::AlreadyAwarded { balance: 1 });
        }
    }

    #[test_log::test(tokio::test)]
    async fn day_rollover_allows_a_new_award() {
        let service = service();
        let msg = spanned_msg(CHAT_A, "#балл");

        assert_matches!(
            service.decide(&msg, day(1)).await.unwrap(),
            Outcome::Awarded { .. }
        );
        assert_eq!(
            service.decide(&msg, day(2)).await.unwrap(),
            Outcome::Awarded {
                points_added: 1,
                new_balance: 2
            }
        );
    }

    #[test_log::test(tokio::test)]
    async fn multiple_matching_tags_award_the_maximum_once() {
        let service = service();
        let msg = spanned_msg(CHAT_A, "#балл и #челлендж1 в одном сообщении");

        let outcome = service.decide(&msg, day(1)).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Awarded {
                points_added: 5,
                new_balance: 5
            }
        );
    }

    #[test_log::test(tokio::test)]
    async fn unknown_tags_do_not_match() {
        let service = service();
        let msg = spanned_msg(CHAT_A, "привет #другое");

        assert_eq!(service.decide(&msg, day(1)).await.unwrap(), Outcome::NoMatch);
    }

    #[test_log::test(tokio::test)]
    async fn fallback_matches_bare_text_on_word_boundaries() {
        let service = service();

        let matching = bare_msg(CHAT_A, "держите #балл!");
        assert_matches!(
            service.decide(&matching, day(1)).await.unwrap(),
            Outcome::Awarded { points_added: 1, .. }
        );

        // The tag inside a longer word must not count.
        let inside_word = bare_msg(CHAT_B, "#баллон с водой");
        assert_eq!(
            service.decide(&inside_word, day(1)).await.unwrap(),
            Outcome::NoMatch
        );
    }

    #[test_log::test(tokio::test)]
    async fn entity_match_wins_over_fallback() {
        let service = service();

        // The annotations mark only #балл as a hashtag. The raw text also
        // contains the 5-point #челлендж1, but since the entity-derived set
        // already matched, the fallback is never consulted.
        let msg = InboundMessage {
            spans: vec![TagSpan {
                offset: 0,
                len: 5,
                is_hashtag: true,
            }],
            ..bare_msg(CHAT_A, "#балл не #челлендж1")
        };
        assert_matches!(
            service.decide(&msg, day(1)).await.unwrap(),
            Outcome::Awarded { points_added: 1, .. }
        );
    }

    #[test_log::test(tokio::test)]
    async fn chats_are_independent() {
        let service = service();
        let msg_a = spanned_msg(CHAT_A, "#балл");
        let msg_b = spanned_msg(CHAT_B, "#балл");

        assert_matches!(
            service.decide(&msg_a, day(1)).await.unwrap(),
            Outcome::Awarded { .. }
        );
        assert_matches!(
            service.decide(&msg_b, day(1)).await.unwrap(),
            Outcome::Awarded { .. }
        );
    }

    #[test_log::test(tokio::test)]
    async fn balance_accumulates_across_days() {
        let service = service();

        let outcome = service
            .decide(&spanned_msg(CHAT_A, "привет #челлендж1"), day(1))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Awarded {
                points_added: 5,
                new_balance: 5
            }
        );

        let outcome = service
            .decide(&spanned_msg(CHAT_A, "#балл"), day(1))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::AlreadyAwarded { balance: 5 });

        let outcome = service
            .decide(&spanned_msg(CHAT_A, "#балл"), day(2))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Awarded {
                points_added: 1,
                new_balance: 6
            }
        );
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_messages_award_exactly_once() {
        let service = Arc::new(service());
        let msg = spanned_msg(CHAT_A, "#балл");

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let service = service.clone();
                let msg = msg.clone();
                tokio::spawn(async move { service.decide(&msg, day(1)).await.unwrap() })
            })
            .collect();

        let mut outcomes = vec![];
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }

        let awarded = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Outcome::Awarded { .. }))
            .count();
        let already = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Outcome::AlreadyAwarded { .. }))
            .count();

        assert_eq!((awarded, already), (1, 1), "outcomes: {outcomes:?}");
    }

    #[test_log::test(tokio::test)]
    async fn lock_map_does_not_leak_entries() {
        let service = service();
        let msg = spanned_msg(CHAT_A, "#балл");

        service.decide(&msg, day(1)).await.unwrap();
        assert!(service.award_locks.map.lock().is_empty());
    }

    struct BrokenStore;

    #[async_trait]
    impl ScoreStore for BrokenStore {
        async fn balance(&self, _: ChatId, _: UserId) -> Result<Option<i64>, StoreError> {
            Err(unavailable())
        }

        async fn last_award_date(
            &self,
            _: ChatId,
            _: UserId,
        ) -> Result<Option<NaiveDate>, StoreError> {
            Err(unavailable())
        }

        async fn record_award(&self, _: crate::scoring::NewAward<'_>) -> Result<i64, StoreError> {
            Err(unavailable())
        }

        async fn top(&self, _: ChatId, _: u32) -> Result<Vec<crate::scoring::ScoreRecord>, StoreError> {
            Err(unavailable())
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable {
            source: "the database file ran away".into(),
        }
    }

    #[test_log::test(tokio::test)]
    async fn storage_failure_is_surfaced_not_swallowed() {
        let service = ScoreService::new(&config(), Arc::new(BrokenStore));
        let msg = spanned_msg(CHAT_A, "#балл");

        let result = service.decide(&msg, day(1)).await;
        assert_matches!(result, Err(StoreError::Unavailable { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn no_match_never_touches_storage() {
        // With a broken store this would error out if storage were consulted.
        let service = ScoreService::new(&config(), Arc::new(BrokenStore));
        let msg = spanned_msg(CHAT_A, "просто сообщение");

        assert_eq!(service.decide(&msg, day(1)).await.unwrap(), Outcome::NoMatch);
    }

    #[test]
    fn boundary_check_examples() {
        assert!(contains_with_boundaries("привет #балл", "#балл"));
        assert!(contains_with_boundaries("#балл", "#балл"));
        assert!(contains_with_boundaries("(#балл)", "#балл"));
        assert!(!contains_with_boundaries("#баллон", "#балл"));
        assert!(!contains_with_boundaries("какой-то текст", "#балл"));
        // Second occurrence qualifies even though the first doesn't.
        assert!(contains_with_boundaries("#баллон #балл", "#балл"));
    }
}
