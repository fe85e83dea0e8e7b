//! PostgreSQL connection with LISTEN/NOTIFY.
//!
//! A trigger on the queue table sends a notification on a channel named after
//! the table, with the queue name as payload, whenever a row is inserted or
//! updated. Once a worker has seen its queue empty it stops polling and waits
//! for such a notification instead, falling back to a regular poll every
//! `check_delayed_interval` so delayed and redelivered messages are still
//! picked up.
//!
//! A `PostgresConnection` owns a dedicated listening connection. It cannot be
//! cloned or serialized; build one per worker.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use sqlx::{postgres::PgListener, PgPool};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    clock::Clock,
    config::Configuration,
    connection::{Connection, QueueConnection},
    driver::PostgresDriver,
    error::Result,
    message::{Headers, MessageId, StoredMessage},
    schema::{Schema, SchemaSynchronizer},
};

pub struct PostgresConnection {
    inner: Connection,
    pool: PgPool,
    listener: Mutex<Option<PgListener>>,
}

#[bon::bon]
impl PostgresConnection {
    #[builder]
    pub fn new(
        configuration: Configuration,
        pool: PgPool,
        clock: Option<Arc<dyn Clock>>,
        synchronizer: Option<Arc<dyn SchemaSynchronizer>>,
    ) -> Result<Self> {
        let extra_setup_sql = trigger_sql(&configuration.table_name);

        let inner = Connection::builder()
            .configuration(configuration)
            .driver(Arc::new(PostgresDriver::new(pool.clone())))
            .maybe_clock(clock)
            .maybe_synchronizer(synchronizer)
            .extra_setup_sql(extra_setup_sql)
            .build()?;

        Ok(Self {
            inner,
            pool,
            listener: Mutex::new(None),
        })
    }
}

impl PostgresConnection {
    pub fn inner(&self) -> &Connection {
        &self.inner
    }

    /// Waits up to `get_notify_timeout` for a notification about this queue.
    async fn wait_for_notification(&self) -> Result<bool> {
        let configuration = self.inner.configuration();
        let mut guard = self.listener.lock().await;

        let listener = match &mut *guard {
            Some(listener) => listener,
            slot => slot.insert(self.listen().await?),
        };

        let deadline = tokio::time::Instant::now() + configuration.notify_timeout();

        loop {
            match tokio::time::timeout_at(deadline, listener.try_recv()).await {
                Err(_elapsed) => return Ok(false),
                Ok(Ok(Some(notification))) => {
                    if notification.channel() == configuration.table_name
                        && notification.payload() == configuration.queue_name
                    {
                        trace!("queue notified");
                        return Ok(true);
                    }

                    trace!(
                        channel = notification.channel(),
                        payload = notification.payload(),
                        "ignoring notification for another queue"
                    );
                }
                Ok(Ok(None)) => {
                    // Notifications sent while disconnected are gone, so poll.
                    warn!("lost the listening connection, reconnecting on next receive");
                    return Ok(true);
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn listen(&self) -> Result<PgListener> {
        let channel = &self.inner.configuration().table_name;

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;

        info!(%channel, "listening for queue notifications");

        Ok(listener)
    }
}

impl QueueConnection for PostgresConnection {
    fn configuration(&self) -> &Configuration {
        self.inner.configuration()
    }

    fn send<'a>(
        &'a self,
        body: &'a str,
        headers: &'a Headers,
        delay: Duration,
    ) -> BoxFuture<'a, Result<MessageId>> {
        self.inner.send(body, headers, delay)
    }

    fn dequeue(&self) -> BoxFuture<'_, Result<Option<StoredMessage>>> {
        Box::pin(async move {
            let Some(emptied_at) = self.inner.queue_emptied_at() else {
                return self.inner.dequeue().await;
            };

            let notified = self.wait_for_notification().await?;
            let idle_for = self.inner.clock().now() - emptied_at;

            if !notified && idle_for < self.configuration().delayed_check_interval() {
                return Ok(None);
            }

            debug!(notified, "polling queue");

            self.inner.dequeue().await
        })
    }

    fn ack(&self, id: MessageId) -> BoxFuture<'_, Result<bool>> {
        self.inner.ack(id)
    }

    fn reject(&self, id: MessageId) -> BoxFuture<'_, Result<bool>> {
        self.inner.reject(id)
    }

    fn message_count(&self) -> BoxFuture<'_, Result<u64>> {
        self.inner.message_count()
    }

    fn find_all(&self, limit: Option<u32>) -> BoxFuture<'_, Result<Vec<StoredMessage>>> {
        self.inner.find_all(limit)
    }

    fn find(&self, id: MessageId) -> BoxFuture<'_, Result<Option<StoredMessage>>> {
        self.inner.find(id)
    }

    /// Creates the table and (re)installs the notify trigger.
    fn setup(&self) -> BoxFuture<'_, Result<()>> {
        self.inner.setup()
    }

    fn configure_schema(&self, schema: &mut Schema) {
        self.inner.configure_schema(schema)
    }

    fn reset(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.inner.reset().await?;

            if let Some(mut listener) = self.listener.lock().await.take() {
                listener.unlisten_all().await?;
                debug!("stopped listening for queue notifications");
            }

            Ok(())
        })
    }
}

/// Name of the trigger function, in the same schema as the table.
fn notify_function_name(table_name: &str) -> String {
    match table_name.rsplit_once('.') {
        Some((schema, table)) => format!("{schema}.notify_{table}"),
        None => format!("notify_{table_name}"),
    }
}

/// Statements installing the notify trigger. Safe to run repeatedly.
pub fn trigger_sql(table_name: &str) -> Vec<String> {
    let function = notify_function_name(table_name);

    vec![
        format!(
            "CREATE OR REPLACE FUNCTION {function}() RETURNS TRIGGER AS $$
    BEGIN
        PERFORM pg_notify('{table_name}', NEW.queue_name::text);
        RETURN NEW;
    END;
$$ LANGUAGE plpgsql"
        ),
        format!("DROP TRIGGER IF EXISTS notify_trigger ON {table_name}"),
        format!(
            "CREATE TRIGGER notify_trigger AFTER INSERT OR UPDATE ON {table_name} \
             FOR EACH ROW EXECUTE PROCEDURE {function}()"
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_for_plain_table() {
        let sql = trigger_sql("messenger_messages");

        assert!(sql[0].starts_with(
            "CREATE OR REPLACE FUNCTION notify_messenger_messages() RETURNS TRIGGER AS $$"
        ));
        assert!(sql[0].contains("PERFORM pg_notify('messenger_messages', NEW.queue_name::text);"));
        assert_eq!(sql[1], "DROP TRIGGER IF EXISTS notify_trigger ON messenger_messages");
        assert_eq!(
            sql[2],
            "CREATE TRIGGER notify_trigger AFTER INSERT OR UPDATE ON messenger_messages \
             FOR EACH ROW EXECUTE PROCEDURE notify_messenger_messages()"
        );
    }

    #[test]
    fn trigger_function_follows_table_schema() {
        assert_eq!(notify_function_name("jobs.messages"), "jobs.notify_messages");

        let sql = trigger_sql("jobs.messages");
        assert!(sql[0].contains("pg_notify('jobs.messages'"));
        assert!(sql[2].ends_with("EXECUTE PROCEDURE jobs.notify_messages()"));
    }
}
