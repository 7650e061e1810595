mod cfg;
mod score;

use crate::prelude::*;
use crate::Result;
use sqlx::sqlite::SqlitePoolOptions;

pub(crate) use cfg::Config;
pub(crate) use score::ScoreRepo;

/// Most likely unrecoverable errors from database communication layer
#[derive(Debug, thiserror::Error)]
pub(crate) enum DbError {
    #[error("Failed to connect to the database")]
    Connect { source: sqlx::Error },

    #[error("Failed to migrate the database")]
    Migrate { source: sqlx::migrate::MigrateError },
}

pub(crate) async fn init(cfg: Config) -> Result<ScoreRepo> {
    // Verify that the connection is working early.
    // The pool created here is reused by the migrations down the road.
    let pool = SqlitePoolOptions::new()
        .max_connections(cfg.pool_size)
        .connect(cfg.url.as_str())
        .await
        .map_err(err_ctx!(DbError::Connect))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(err_ctx!(DbError::Migrate))?;

    info!("Database is ready");

    Ok(ScoreRepo::new(pool))
}
