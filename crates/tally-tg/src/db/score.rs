use crate::scoring::{NewAward, ScoreRecord, ScoreStore, StoreError};
use async_trait::async_trait;
use chrono::NaiveDate;
use teloxide::types::{ChatId, UserId};

/// SQLite-backed implementation of the scoring storage port.
///
/// `score` and `award_mark` are separate tables keyed by the same
/// `(chat_id, user_id)` pair; [`Self::record_award`] updates both inside one
/// transaction so they can never drift apart.
pub(crate) struct ScoreRepo {
    db: sqlx::SqlitePool,
}

impl ScoreRepo {
    pub(crate) fn new(db: sqlx::SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ScoreStore for ScoreRepo {
    async fn balance(&self, chat_id: ChatId, user_id: UserId) -> Result<Option<i64>, StoreError> {
        sqlx::query_scalar(
            "select points from score
            where chat_id = ? and user_id = ?",
        )
        .bind(chat_id.0)
        .bind(user_id.0 as i64)
        .fetch_optional(&self.db)
        .await
        .map_err(unavailable)
    }

    async fn last_award_date(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Option<NaiveDate>, StoreError> {
        sqlx::query_scalar(
            "select last_award_date from award_mark
            where chat_id = ? and user_id = ?",
        )
        .bind(chat_id.0)
        .bind(user_id.0 as i64)
        .fetch_optional(&self.db)
        .await
        .map_err(unavailable)
    }

    async fn record_award(&self, award: NewAward<'_>) -> Result<i64, StoreError> {
        let mut tx = self.db.begin().await.map_err(unavailable)?;

        let new_balance: i64 = sqlx::query_scalar(
            "insert into score (chat_id, user_id, points, full_name, username)
            values (?, ?, ?, ?, ?)
            on conflict (chat_id, user_id) do update set
                points = score.points + excluded.points,
                full_name = excluded.full_name,
                username = excluded.username
            returning points",
        )
        .bind(award.chat_id.0)
        .bind(award.user_id.0 as i64)
        .bind(award.points)
        .bind(award.full_name)
        .bind(award.username)
        .fetch_one(&mut *tx)
        .await
        .map_err(unavailable)?;

        sqlx::query(
            "insert into award_mark (chat_id, user_id, last_award_date)
            values (?, ?, ?)
            on conflict (chat_id, user_id) do update set
                last_award_date = excluded.last_award_date",
        )
        .bind(award.chat_id.0)
        .bind(award.user_id.0 as i64)
        .bind(award.awarded_on)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;

        Ok(new_balance)
    }

    async fn top(&self, chat_id: ChatId, limit: u32) -> Result<Vec<ScoreRecord>, StoreError> {
        let rows: Vec<ScoreRow> = sqlx::query_as(
            "select chat_id, user_id, points, full_name, username from score
            where chat_id = ?
            order by points desc, user_id asc
            limit ?",
        )
        .bind(chat_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.db)
        .await
        .map_err(unavailable)?;

        Ok(rows.into_iter().map(ScoreRow::into_record).collect())
    }
}

#[derive(sqlx::FromRow)]
struct ScoreRow {
    chat_id: i64,
    user_id: i64,
    points: i64,
    full_name: String,
    username: Option<String>,
}

impl ScoreRow {
    fn into_record(self) -> ScoreRecord {
        ScoreRecord {
            chat_id: ChatId(self.chat_id),
            user_id: UserId(self.user_id as u64),
            points: self.points,
            full_name: self.full_name,
            username: self.username,
        }
    }
}

fn unavailable(source: sqlx::Error) -> StoreError {
    StoreError::Unavailable {
        source: source.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const CHAT: ChatId = ChatId(-1001);
    const USER: UserId = UserId(7);

    async fn repo() -> ScoreRepo {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        ScoreRepo::new(pool)
    }

    fn award(points: i64, day: u32) -> NewAward<'static> {
        NewAward {
            chat_id: CHAT,
            user_id: USER,
            points,
            full_name: "Мария",
            username: Some("maria"),
            awarded_on: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
        }
    }

    #[tokio::test]
    async fn award_upserts_both_tables() {
        let repo = repo().await;

        assert_eq!(repo.balance(CHAT, USER).await.unwrap(), None);
        assert_eq!(repo.last_award_date(CHAT, USER).await.unwrap(), None);

        assert_eq!(repo.record_award(award(5, 1)).await.unwrap(), 5);
        assert_eq!(repo.record_award(award(1, 2)).await.unwrap(), 6);

        assert_eq!(repo.balance(CHAT, USER).await.unwrap(), Some(6));
        assert_eq!(
            repo.last_award_date(CHAT, USER).await.unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 2)
        );
    }

    #[tokio::test]
    async fn top_is_scoped_to_the_chat_and_ordered() {
        let repo = repo().await;

        let other_user = NewAward {
            user_id: UserId(8),
            points: 10,
            ..award(0, 1)
        };
        let other_chat = NewAward {
            chat_id: ChatId(-1002),
            points: 100,
            ..award(0, 1)
        };

        repo.record_award(award(5, 1)).await.unwrap();
        repo.record_award(other_user).await.unwrap();
        repo.record_award(other_chat).await.unwrap();

        let top = repo.top(CHAT, 10).await.unwrap();
        let points: Vec<_> = top.iter().map(|record| (record.user_id, record.points)).collect();
        assert_eq!(points, [(UserId(8), 10), (USER, 5)]);
    }
}
