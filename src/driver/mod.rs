//! Execution of the connection's SQL on a concrete database engine.
//!
//! The [`Connection`](crate::connection::Connection) owns every statement it
//! runs. A [`Driver`] only knows how to bind the parameters for each kind of
//! statement on its engine and how to run the locked read-then-stamp sequence
//! of a dequeue inside one transaction.
//!
//! Parameter order is fixed across engines:
//! - eligibility queries bind `queue_name`, the redelivery limit and `now`
//!   as `$1`, `$2`, `$3` (and the row limit as `$4` where there is one)
//! - inserts bind `body`, `headers`, `queue_name`, `created_at`, `available_at`
//! - the delivery stamp binds `delivered_at`, `id`

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

use crate::{
    message::{MessageRow, NewMessage},
    schema::Platform,
};

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

/// Parameters of the eligibility predicate.
#[derive(Debug, Clone, Copy)]
pub struct Eligibility<'a> {
    pub queue_name: &'a str,
    /// Rows delivered before this instant are handed out again
    pub redeliver_limit: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

pub trait Driver: Send + Sync {
    fn platform(&self) -> Platform;

    /// Inserts a row and returns its id.
    fn insert<'a>(
        &'a self,
        sql: &'a str,
        message: NewMessage<'a>,
    ) -> BoxFuture<'a, Result<i64, sqlx::Error>>;

    /// Runs `select_sql` (which must lock the row it returns) and stamps the
    /// row with `update_sql`, committing both or neither.
    fn claim<'a>(
        &'a self,
        select_sql: &'a str,
        update_sql: &'a str,
        filter: Eligibility<'a>,
    ) -> BoxFuture<'a, Result<Option<MessageRow>, sqlx::Error>>;

    /// Returns the number of affected rows.
    fn delete<'a>(&'a self, sql: &'a str, id: i64) -> BoxFuture<'a, Result<u64, sqlx::Error>>;

    fn count<'a>(
        &'a self,
        sql: &'a str,
        filter: Eligibility<'a>,
    ) -> BoxFuture<'a, Result<i64, sqlx::Error>>;

    fn fetch_eligible<'a>(
        &'a self,
        sql: &'a str,
        filter: Eligibility<'a>,
        limit: Option<i64>,
    ) -> BoxFuture<'a, Result<Vec<MessageRow>, sqlx::Error>>;

    fn fetch_by_id<'a>(
        &'a self,
        sql: &'a str,
        id: i64,
        queue_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<MessageRow>, sqlx::Error>>;

    /// Runs DDL statements in one transaction.
    fn execute_all<'a>(&'a self, statements: &'a [String])
        -> BoxFuture<'a, Result<(), sqlx::Error>>;
}

/// Implements [`Driver`] for a newtype over an `sqlx` pool. Both engines bind
/// the same Rust types, so only the pool and the platform differ. The
/// invoking module must have the names used here in scope.
macro_rules! pool_driver {
    ($driver:ty, $platform:expr) => {
        impl Driver for $driver {
            fn platform(&self) -> Platform {
                $platform
            }

            fn insert<'a>(
                &'a self,
                sql: &'a str,
                message: NewMessage<'a>,
            ) -> BoxFuture<'a, Result<i64, sqlx::Error>> {
                Box::pin(async move {
                    sqlx::query_scalar(sql)
                        .bind(message.body)
                        .bind(message.headers)
                        .bind(message.queue_name)
                        .bind(message.created_at)
                        .bind(message.available_at)
                        .fetch_one(&self.pool)
                        .await
                })
            }

            fn claim<'a>(
                &'a self,
                select_sql: &'a str,
                update_sql: &'a str,
                filter: Eligibility<'a>,
            ) -> BoxFuture<'a, Result<Option<MessageRow>, sqlx::Error>> {
                Box::pin(async move {
                    // On PostgreSQL the select carries FOR UPDATE, so the row stays
                    // locked until the commit. Dropping the transaction on an error
                    // path rolls it back.
                    let mut tx = self.pool.begin().await?;

                    let row: Option<MessageRow> = sqlx::query_as(select_sql)
                        .bind(filter.queue_name)
                        .bind(filter.redeliver_limit)
                        .bind(filter.now)
                        .fetch_optional(tx.as_mut())
                        .await?;

                    let Some(mut row) = row else {
                        tx.commit().await?;
                        return Ok(None);
                    };

                    sqlx::query(update_sql)
                        .bind(filter.now)
                        .bind(row.id)
                        .execute(tx.as_mut())
                        .await?;

                    tx.commit().await?;

                    row.delivered_at = Some(filter.now);
                    Ok(Some(row))
                })
            }

            fn delete<'a>(&'a self, sql: &'a str, id: i64) -> BoxFuture<'a, Result<u64, sqlx::Error>> {
                Box::pin(async move {
                    let result = sqlx::query(sql).bind(id).execute(&self.pool).await?;
                    Ok(result.rows_affected())
                })
            }

            fn count<'a>(
                &'a self,
                sql: &'a str,
                filter: Eligibility<'a>,
            ) -> BoxFuture<'a, Result<i64, sqlx::Error>> {
                Box::pin(async move {
                    sqlx::query_scalar(sql)
                        .bind(filter.queue_name)
                        .bind(filter.redeliver_limit)
                        .bind(filter.now)
                        .fetch_one(&self.pool)
                        .await
                })
            }

            fn fetch_eligible<'a>(
                &'a self,
                sql: &'a str,
                filter: Eligibility<'a>,
                limit: Option<i64>,
            ) -> BoxFuture<'a, Result<Vec<MessageRow>, sqlx::Error>> {
                Box::pin(async move {
                    let mut query = sqlx::query_as::<_, MessageRow>(sql)
                        .bind(filter.queue_name)
                        .bind(filter.redeliver_limit)
                        .bind(filter.now);
                    if let Some(limit) = limit {
                        query = query.bind(limit);
                    }

                    let mut stream = query.fetch(&self.pool);

                    let mut rows = Vec::new();
                    while let Some(row) = stream.next().await.transpose()? {
                        rows.push(row);
                    }

                    Ok(rows)
                })
            }

            fn fetch_by_id<'a>(
                &'a self,
                sql: &'a str,
                id: i64,
                queue_name: &'a str,
            ) -> BoxFuture<'a, Result<Option<MessageRow>, sqlx::Error>> {
                Box::pin(async move {
                    sqlx::query_as(sql)
                        .bind(id)
                        .bind(queue_name)
                        .fetch_optional(&self.pool)
                        .await
                })
            }

            fn execute_all<'a>(
                &'a self,
                statements: &'a [String],
            ) -> BoxFuture<'a, Result<(), sqlx::Error>> {
                Box::pin(async move {
                    let mut tx = self.pool.begin().await?;

                    for statement in statements {
                        tx.as_mut().execute(statement.as_str()).await?;
                    }

                    tx.commit().await
                })
            }
        }
    };
}

pub(crate) use pool_driver;
