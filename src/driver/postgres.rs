//! PostgreSQL backend.

use futures_util::future::BoxFuture;
use sqlx::{postgres::PgPoolOptions, Executor, PgPool};
use tokio_stream::StreamExt;

use crate::{
    message::{MessageRow, NewMessage},
    schema::Platform,
};

use super::{pool_driver, Driver, Eligibility};

#[derive(Clone)]
pub struct PostgresDriver {
    pool: PgPool,
}

impl PostgresDriver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().connect(url).await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pool_driver!(PostgresDriver, Platform::Postgres);
