//! A message queue stored in a single SQL table.
//!
//! Producers insert rows, consumers claim the oldest eligible row and delete it
//! once processed. Works on SQLite and PostgreSQL; on PostgreSQL idle consumers
//! wait on LISTEN/NOTIFY instead of polling.

use std::{collections::HashMap, sync::Arc};

use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod clock;
pub mod codec;
pub mod config;
pub mod connection;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod message;
pub mod postgres;
pub mod receiver;
pub mod schema;
pub mod sender;
pub mod transport;

pub use codec::{Codec, JsonCodec};
pub use config::Configuration;
pub use connection::{Connection, QueueConnection};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use message::MessageId;
pub use postgres::PostgresConnection;
pub use receiver::RetryPolicy;
pub use transport::Transport;

use driver::{PostgresDriver, SqliteDriver};
use schema::Platform;

/// Installs the global tracing subscriber, filtered by `TABLEMQ_LOG`.
pub fn init_tracing() -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("TABLEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("TABLEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    Ok(())
}

/// Opens the queue connection described by a DSN such as
/// `sqlite:///var/lib/app/queue.db?queue_name=mail`.
pub async fn open_connection(
    dsn: &str,
    options: &HashMap<String, String>,
) -> Result<Arc<dyn QueueConnection>> {
    let dsn = Configuration::from_dsn(dsn, options)?;

    info!(
        platform = %dsn.platform,
        table = %dsn.configuration.table_name,
        queue = %dsn.configuration.queue_name,
        "opening queue connection"
    );

    let connection: Arc<dyn QueueConnection> = match dsn.platform {
        Platform::Sqlite => {
            let driver = SqliteDriver::connect(&dsn.database_url).await?;

            Arc::new(
                Connection::builder()
                    .configuration(dsn.configuration)
                    .driver(Arc::new(driver))
                    .build()?,
            )
        }
        Platform::Postgres => {
            let driver = PostgresDriver::connect(&dsn.database_url).await?;

            Arc::new(
                PostgresConnection::builder()
                    .configuration(dsn.configuration)
                    .pool(driver.pool().clone())
                    .build()?,
            )
        }
    };

    Ok(connection)
}

/// Returns a builder for a [`Transport`] over the queue described by `dsn`.
///
/// ```no_run
/// # async fn run() -> tablemq::Result<()> {
/// let transport = tablemq::connect()
///     .dsn("sqlite:///tmp/queue.db")
///     .codec(tablemq::JsonCodec::<String>::new())
///     .open()
///     .await?;
///
/// transport.send(tablemq::Envelope::new("hello".to_owned())).await?;
/// # Ok(())
/// # }
/// ```
#[bon::builder(finish_fn = open)]
pub async fn connect<S: Codec>(
    #[builder(into)] dsn: String,
    /// Transport options, overridden by the ones in the DSN query string
    #[builder(default)]
    options: HashMap<String, String>,
    codec: S,
    retry: Option<RetryPolicy>,
) -> Result<Transport<S>> {
    let connection = open_connection(&dsn, &options).await?;

    Ok(Transport::new(connection, codec).with_retry_policy(retry.unwrap_or_default()))
}
