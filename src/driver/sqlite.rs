//! SQLite backend.
//!
//! SQLite has no row locks. A dequeue transaction that has read a row and then
//! loses the race for the database write lock fails with `SQLITE_BUSY`, which
//! is classified as retryable, so two consumers still never both stamp the
//! same row.

use futures_util::future::BoxFuture;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    Executor, SqlitePool,
};
use tokio_stream::StreamExt;

use crate::{
    message::{MessageRow, NewMessage},
    schema::Platform,
};

use super::{pool_driver, Driver, Eligibility};

#[derive(Clone)]
pub struct SqliteDriver {
    pool: SqlitePool,
}

impl SqliteDriver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens a pool on `url`, creating the database file if needed.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let opts = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pool_driver!(SqliteDriver, Platform::Sqlite);
