//! The queue engine.
//!
//! [`QueueConnection`] is the contract everything above this layer depends on.
//! [`Connection`] implements it for any [`Driver`]; the PostgreSQL
//! specialisation in [`crate::postgres`] wraps a `Connection` and only changes
//! how `dequeue`, `setup` and `reset` behave.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use snafu::ResultExt;
use tracing::{debug, info};

use crate::{
    clock::{Clock, SystemClock},
    config::Configuration,
    driver::{Driver, Eligibility},
    error::{self, EncodeHeadersSnafu, Error, Result},
    message::{Headers, MessageId, NewMessage, StoredMessage},
    schema::{add_table_to_schema, Platform, Schema, SchemaSynchronizer},
};

pub trait QueueConnection: Send + Sync {
    fn configuration(&self) -> &Configuration;

    /// Stores a message that becomes available after `delay`.
    fn send<'a>(
        &'a self,
        body: &'a str,
        headers: &'a Headers,
        delay: Duration,
    ) -> BoxFuture<'a, Result<MessageId>>;

    /// Hands out the oldest eligible message and marks it delivered.
    fn dequeue(&self) -> BoxFuture<'_, Result<Option<StoredMessage>>>;

    /// Deletes a processed message. Returns `false` if it was already gone.
    fn ack(&self, id: MessageId) -> BoxFuture<'_, Result<bool>>;

    /// Deletes a message that must not be redelivered. Returns `false` if it
    /// was already gone.
    fn reject(&self, id: MessageId) -> BoxFuture<'_, Result<bool>>;

    /// Number of messages that are currently eligible for delivery.
    fn message_count(&self) -> BoxFuture<'_, Result<u64>>;

    /// Eligible messages, oldest first.
    fn find_all(&self, limit: Option<u32>) -> BoxFuture<'_, Result<Vec<StoredMessage>>>;

    /// Looks up a message of this queue by id, whether or not it is eligible.
    fn find(&self, id: MessageId) -> BoxFuture<'_, Result<Option<StoredMessage>>>;

    /// Creates the table and its indexes if they are missing.
    fn setup(&self) -> BoxFuture<'_, Result<()>>;

    /// Adds the queue table to `schema` unless a table of that name is already there.
    fn configure_schema(&self, schema: &mut Schema);

    /// Drops per-worker state. Called between worker loop iterations.
    fn reset(&self) -> BoxFuture<'_, Result<()>>;
}

/// SQL for every statement the engine runs, rendered once per connection.
#[derive(Debug, Clone)]
struct Statements {
    insert: String,
    select_for_update: String,
    mark_delivered: String,
    delete: String,
    count: String,
    find_all: String,
    find_all_limited: String,
    find: String,
}

/// `$1` queue name, `$2` redelivery limit, `$3` now.
const ELIGIBLE: &str = "m.queue_name = $1 \
     AND (m.delivered_at IS NULL OR m.delivered_at < $2) \
     AND m.available_at <= $3";

impl Statements {
    fn new(configuration: &Configuration, platform: Platform) -> Self {
        let table = &configuration.table_name;

        let lock = match platform {
            // The whole database is the lock on SQLite.
            Platform::Sqlite => "",
            Platform::Postgres if configuration.skip_locked => " FOR UPDATE SKIP LOCKED",
            Platform::Postgres => " FOR UPDATE",
        };

        Self {
            insert: format!(
                "INSERT INTO {table} (body, headers, queue_name, created_at, available_at) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id"
            ),
            select_for_update: format!(
                "SELECT m.* FROM {table} m WHERE {ELIGIBLE} \
                 ORDER BY m.available_at ASC, m.id ASC LIMIT 1{lock}"
            ),
            mark_delivered: format!("UPDATE {table} SET delivered_at = $1 WHERE id = $2"),
            delete: format!("DELETE FROM {table} WHERE id = $1"),
            count: format!("SELECT COUNT(m.id) AS message_count FROM {table} m WHERE {ELIGIBLE}"),
            find_all: format!(
                "SELECT m.* FROM {table} m WHERE {ELIGIBLE} ORDER BY m.available_at ASC, m.id ASC"
            ),
            find_all_limited: format!(
                "SELECT m.* FROM {table} m WHERE {ELIGIBLE} \
                 ORDER BY m.available_at ASC, m.id ASC LIMIT $4"
            ),
            find: format!("SELECT m.* FROM {table} m WHERE m.id = $1 AND m.queue_name = $2"),
        }
    }
}

/// Queue engine over any [`Driver`].
pub struct Connection {
    configuration: Configuration,
    driver: Arc<dyn Driver>,
    synchronizer: Option<Arc<dyn SchemaSynchronizer>>,
    clock: Arc<dyn Clock>,
    extra_setup_sql: Vec<String>,
    statements: Statements,
    auto_setup: AtomicBool,
    queue_emptied_at: Mutex<Option<DateTime<Utc>>>,
}

#[bon::bon]
impl Connection {
    #[builder]
    pub fn new(
        configuration: Configuration,
        driver: Arc<dyn Driver>,
        /// Defaults to the system clock
        clock: Option<Arc<dyn Clock>>,
        /// Applies the table definition; when absent the driver runs the DDL itself
        synchronizer: Option<Arc<dyn SchemaSynchronizer>>,
        /// Statements run after the table is created
        #[builder(default)]
        extra_setup_sql: Vec<String>,
    ) -> Result<Self> {
        configuration.validate()?;

        let statements = Statements::new(&configuration, driver.platform());
        let auto_setup = AtomicBool::new(configuration.auto_setup);

        Ok(Self {
            configuration,
            driver,
            synchronizer,
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock)),
            extra_setup_sql,
            statements,
            auto_setup,
            queue_emptied_at: Mutex::new(None),
        })
    }
}

impl Connection {
    pub fn platform(&self) -> Platform {
        self.driver.platform()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// When the last dequeue found nothing, if the queue has not yielded a
    /// message since.
    pub fn queue_emptied_at(&self) -> Option<DateTime<Utc>> {
        *self
            .queue_emptied_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_queue_emptied_at(&self, at: Option<DateTime<Utc>>) {
        *self
            .queue_emptied_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = at;
    }

    fn eligibility(&self) -> Eligibility<'_> {
        let now = self.clock.now();
        // Clamped so the bound stays storable on every engine; no row is
        // delivered before the epoch.
        let redeliver_limit = now
            .checked_sub_signed(self.configuration.redeliver_window())
            .map_or(DateTime::<Utc>::UNIX_EPOCH, |limit| {
                limit.max(DateTime::<Utc>::UNIX_EPOCH)
            });

        Eligibility {
            queue_name: &self.configuration.queue_name,
            redeliver_limit,
            now,
        }
    }

    /// Runs `op`, creating the table and running it once more if the table is
    /// missing and auto-setup is still enabled. A successful setup disables
    /// auto-setup, so a table that is still missing afterwards is an error.
    async fn with_auto_setup<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut set_up = false;

        loop {
            match op().await {
                Err(e)
                    if !set_up
                        && error::is_table_not_found(&e)
                        && self.auto_setup.load(Ordering::Acquire) =>
                {
                    debug!(table = %self.configuration.table_name, "queue table missing, setting it up");
                    self.run_setup().await?;
                    set_up = true;
                }
                result => return result.map_err(Error::from),
            }
        }
    }

    async fn run_setup(&self) -> Result<()> {
        let platform = self.platform();

        let mut schema = Schema::new();
        add_table_to_schema(&mut schema, &self.configuration.table_name);

        match &self.synchronizer {
            Some(synchronizer) => synchronizer.update_schema(&schema, platform).await?,
            None => self.driver.execute_all(&schema.create_sql(platform)).await?,
        }

        if !self.extra_setup_sql.is_empty() {
            self.driver.execute_all(&self.extra_setup_sql).await?;
        }

        self.auto_setup.store(false, Ordering::Release);

        info!(
            table = %self.configuration.table_name,
            %platform,
            "queue table is set up"
        );

        Ok(())
    }

    async fn delete(&self, id: MessageId) -> Result<bool> {
        let deleted = self.driver.delete(&self.statements.delete, id.get()).await?;
        Ok(deleted > 0)
    }
}

impl QueueConnection for Connection {
    fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    fn send<'a>(
        &'a self,
        body: &'a str,
        headers: &'a Headers,
        delay: Duration,
    ) -> BoxFuture<'a, Result<MessageId>> {
        Box::pin(async move {
            let now = self.clock.now();
            let available_at = TimeDelta::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .ok_or(Error::InvalidDelay { delay })?;

            let message = NewMessage {
                body,
                headers: serde_json::to_string(headers).context(EncodeHeadersSnafu)?,
                queue_name: &self.configuration.queue_name,
                created_at: now,
                available_at,
            };

            let id = self
                .with_auto_setup(|| self.driver.insert(&self.statements.insert, message.clone()))
                .await?;

            debug!(id, queue = %self.configuration.queue_name, ?delay, "message sent");

            Ok(MessageId::new(id))
        })
    }

    fn dequeue(&self) -> BoxFuture<'_, Result<Option<StoredMessage>>> {
        Box::pin(async move {
            let row = self
                .with_auto_setup(|| {
                    self.driver.claim(
                        &self.statements.select_for_update,
                        &self.statements.mark_delivered,
                        self.eligibility(),
                    )
                })
                .await?;

            let Some(row) = row else {
                self.set_queue_emptied_at(Some(self.clock.now()));
                return Ok(None);
            };

            // Notifications with the same channel and payload may be folded
            // into one, so keep polling until the queue is seen empty again.
            self.set_queue_emptied_at(None);

            debug!(id = row.id, "message delivered");

            row.decode().map(Some)
        })
    }

    fn ack(&self, id: MessageId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(self.delete(id))
    }

    fn reject(&self, id: MessageId) -> BoxFuture<'_, Result<bool>> {
        Box::pin(self.delete(id))
    }

    fn message_count(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            let count = self
                .with_auto_setup(|| self.driver.count(&self.statements.count, self.eligibility()))
                .await?;

            Ok(u64::try_from(count).unwrap_or_default())
        })
    }

    fn find_all(&self, limit: Option<u32>) -> BoxFuture<'_, Result<Vec<StoredMessage>>> {
        Box::pin(async move {
            let sql = match limit {
                Some(_) => &self.statements.find_all_limited,
                None => &self.statements.find_all,
            };

            let rows = self
                .with_auto_setup(|| {
                    self.driver
                        .fetch_eligible(sql, self.eligibility(), limit.map(i64::from))
                })
                .await?;

            rows.into_iter().map(|row| row.decode()).collect()
        })
    }

    fn find(&self, id: MessageId) -> BoxFuture<'_, Result<Option<StoredMessage>>> {
        Box::pin(async move {
            let row = self
                .with_auto_setup(|| {
                    self.driver.fetch_by_id(
                        &self.statements.find,
                        id.get(),
                        &self.configuration.queue_name,
                    )
                })
                .await?;

            row.map(|row| row.decode()).transpose()
        })
    }

    fn setup(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.run_setup())
    }

    fn configure_schema(&self, schema: &mut Schema) {
        if schema.has_table(&self.configuration.table_name) {
            return;
        }

        add_table_to_schema(schema, &self.configuration.table_name);
    }

    fn reset(&self) -> BoxFuture<'_, Result<()>> {
        self.set_queue_emptied_at(None);
        Box::pin(std::future::ready(Ok(())))
    }
}
