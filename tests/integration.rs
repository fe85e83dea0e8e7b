use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use tablemq::{
    clock::ManualClock,
    codec::TYPE_HEADER,
    driver::SqliteDriver,
    message::Headers,
    schema::{Schema, TABLE_OPTION_NAME},
    Configuration, Connection, Envelope, Error, JsonCodec, MessageId, QueueConnection, Transport,
};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

struct TmpQueue {
    transport: Transport<JsonCodec<Ping>>,
    connection: Arc<Connection>,
    driver: SqliteDriver,
    clock: ManualClock,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl std::ops::Deref for TmpQueue {
    type Target = Transport<JsonCodec<Ping>>;

    fn deref(&self) -> &Self::Target {
        &self.transport
    }
}

fn start_time() -> DateTime<chrono::Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

async fn setup_with(configuration: Configuration) -> TmpQueue {
    let tmpdir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", tmpdir.path().join("queue.db").display());

    let driver = SqliteDriver::connect(&url).await.unwrap();
    let clock = ManualClock::new(start_time());

    let connection = Arc::new(
        Connection::builder()
            .configuration(configuration)
            .driver(Arc::new(driver.clone()))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap(),
    );

    let transport = Transport::new(connection.clone(), JsonCodec::new());

    TmpQueue {
        transport,
        connection,
        driver,
        clock,
        tmpdir,
    }
}

async fn setup() -> TmpQueue {
    setup_with(Configuration::default()).await
}

/// Another queue on the same database and table.
fn sibling(queue: &TmpQueue, queue_name: &str) -> Transport<JsonCodec<Ping>> {
    let connection = Connection::builder()
        .configuration(Configuration {
            queue_name: queue_name.to_owned(),
            ..Default::default()
        })
        .driver(Arc::new(queue.driver.clone()))
        .clock(Arc::new(queue.clock.clone()))
        .build()
        .unwrap();

    Transport::new(Arc::new(connection), JsonCodec::new())
}

fn ping_headers() -> Headers {
    HashMap::from([(TYPE_HEADER.to_owned(), std::any::type_name::<Ping>().to_owned())])
}

#[tokio::test]
async fn test_send_get_ack() {
    let queue = setup().await;

    let sent = queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    let id = sent.transport_message_id().unwrap().id;

    assert_eq!(queue.message_count().await.unwrap(), 1);

    let received = queue.get().await.unwrap().unwrap();
    assert_eq!(received.message(), &Ping { n: 1 });
    assert_eq!(received.received().unwrap().id, id);
    assert_eq!(received.transport_message_id().unwrap().id, id);

    // Delivered but not yet acknowledged.
    assert_eq!(queue.message_count().await.unwrap(), 0);
    assert!(queue.get().await.unwrap().is_none());

    assert!(queue.ack(&received).await.unwrap());
    assert!(queue.find(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_ack_twice() {
    let queue = setup().await;

    queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    let received = queue.get().await.unwrap().unwrap();

    assert!(queue.ack(&received).await.unwrap());
    assert!(!queue.ack(&received).await.unwrap());
    assert!(!queue.reject(&received).await.unwrap());
}

#[tokio::test]
async fn test_reject_deletes() {
    let queue = setup().await;

    queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    let received = queue.get().await.unwrap().unwrap();

    assert!(queue.reject(&received).await.unwrap());

    queue.clock.advance(TimeDelta::hours(2));
    assert!(queue.get().await.unwrap().is_none());
}

#[tokio::test]
async fn test_ack_requires_received_envelope() {
    let queue = setup().await;

    let sent = queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();

    assert!(matches!(
        queue.ack(&sent).await,
        Err(Error::MissingReceivedStamp)
    ));
}

#[tokio::test]
async fn test_delayed_message() {
    let queue = setup().await;

    queue
        .send(Envelope::new(Ping { n: 1 }).with_delay(Duration::from_secs(10)))
        .await
        .unwrap();

    assert!(queue.get().await.unwrap().is_none());
    assert_eq!(queue.message_count().await.unwrap(), 0);

    queue.clock.advance(TimeDelta::seconds(10));

    assert_eq!(queue.message_count().await.unwrap(), 1);
    let received = queue.get().await.unwrap().unwrap();
    assert_eq!(received.message(), &Ping { n: 1 });
}

#[tokio::test]
async fn test_fifo_by_availability() {
    let queue = setup().await;

    queue
        .send(Envelope::new(Ping { n: 1 }).with_delay(Duration::from_secs(5)))
        .await
        .unwrap();
    queue.send(Envelope::new(Ping { n: 2 })).await.unwrap();
    queue.send(Envelope::new(Ping { n: 3 })).await.unwrap();

    queue.clock.advance(TimeDelta::seconds(5));

    let mut order = Vec::new();
    while let Some(envelope) = queue.get().await.unwrap() {
        order.push(envelope.message().n);
        queue.ack(&envelope).await.unwrap();
    }

    assert_eq!(order, [2, 3, 1]);
}

#[tokio::test]
async fn test_redelivery_after_timeout() {
    let queue = setup_with(Configuration {
        redeliver_timeout: 60,
        ..Default::default()
    })
    .await;

    queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    let first = queue.get().await.unwrap().unwrap();

    queue.clock.advance(TimeDelta::seconds(30));
    assert!(queue.get().await.unwrap().is_none());

    // Exactly at the timeout the delivery still holds.
    queue.clock.advance(TimeDelta::seconds(30));
    assert!(queue.get().await.unwrap().is_none());

    queue.clock.advance(TimeDelta::seconds(1));
    let second = queue.get().await.unwrap().unwrap();

    assert_eq!(second.received().unwrap().id, first.received().unwrap().id);
    assert_eq!(second.message(), first.message());
}

#[tokio::test]
async fn test_huge_redeliver_timeout_never_redelivers() {
    let dsn = Configuration::from_dsn(
        "sqlite://queue.db?redeliver_timeout=10000000000000000",
        &HashMap::new(),
    )
    .unwrap();
    let queue = setup_with(dsn.configuration).await;

    queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    assert!(queue.get().await.unwrap().is_some());

    queue.clock.advance(TimeDelta::days(100_000));
    assert!(queue.get().await.unwrap().is_none());
    assert_eq!(queue.message_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_queues_share_a_table() {
    let queue = setup().await;
    let other = sibling(&queue, "other");

    let sent = queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    let id = sent.transport_message_id().unwrap().id;

    assert!(other.get().await.unwrap().is_none());
    assert_eq!(other.message_count().await.unwrap(), 0);
    assert!(other.find(id).await.unwrap().is_none());

    assert!(queue.find(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_all_and_find() {
    let queue = setup().await;

    let mut ids = Vec::new();
    for n in 1..=3 {
        let sent = queue.send(Envelope::new(Ping { n })).await.unwrap();
        ids.push(sent.transport_message_id().unwrap().id);
    }

    let all = queue.all(None).await.unwrap();
    let numbers: Vec<u32> = all.iter().map(|e| e.message().n).collect();
    assert_eq!(numbers, [1, 2, 3]);
    assert_eq!(all[0].received().unwrap().id, ids[0]);

    assert_eq!(queue.all(Some(2)).await.unwrap().len(), 2);

    // Listing does not deliver.
    assert_eq!(queue.message_count().await.unwrap(), 3);

    let found = queue.find(ids[1]).await.unwrap().unwrap();
    assert_eq!(found.message(), &Ping { n: 2 });

    assert!(queue.find(MessageId::new(9_999)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_find_ignores_eligibility() {
    let queue = setup().await;

    let sent = queue
        .send(Envelope::new(Ping { n: 1 }).with_delay(Duration::from_secs(60)))
        .await
        .unwrap();
    let id = sent.transport_message_id().unwrap().id;

    assert!(queue.all(None).await.unwrap().is_empty());
    assert!(queue.find(id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_stored_row() {
    let queue = setup().await;

    let sent = queue
        .send(Envelope::new(Ping { n: 7 }).with_delay(Duration::from_millis(1_500)))
        .await
        .unwrap();
    let id = sent.transport_message_id().unwrap().id;

    let row = queue.connection.find(id).await.unwrap().unwrap();
    assert_eq!(row.body, r#"{"n":7}"#);
    assert_eq!(row.headers, ping_headers());
    assert_eq!(row.queue_name, "default");
    assert_eq!(row.created_at, start_time());
    assert_eq!(row.available_at, start_time() + TimeDelta::milliseconds(1_500));
    assert_eq!(row.delivered_at, None);
}

#[tokio::test]
async fn test_auto_setup() {
    let queue = setup().await;

    // The table does not exist yet, the first send creates it.
    assert_eq!(queue.message_count().await.unwrap(), 0);
    queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    assert_eq!(queue.message_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_auto_setup_disabled() {
    let queue = setup_with(Configuration {
        auto_setup: false,
        ..Default::default()
    })
    .await;

    let err = queue.send(Envelope::new(Ping { n: 1 })).await.unwrap_err();
    assert!(matches!(err, Error::Transport { .. }));
    assert!(err.is_table_not_found());

    queue.setup().await.unwrap();
    queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();
}

#[tokio::test]
async fn test_setup_is_idempotent() {
    let queue = setup().await;

    queue.setup().await.unwrap();
    queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    queue.setup().await.unwrap();

    assert_eq!(queue.message_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_configure_schema() {
    let queue = setup().await;

    let mut schema = Schema::new();
    queue.configure_schema(&mut schema);
    queue.configure_schema(&mut schema);

    assert_eq!(schema.tables().len(), 1);
    let table = schema.table("messenger_messages").unwrap();
    assert!(table
        .options
        .contains(&(TABLE_OPTION_NAME.to_owned(), "messenger_messages".to_owned())));
}

#[tokio::test]
async fn test_undecodable_body_is_rejected() {
    let queue = setup().await;

    let id = queue
        .connection()
        .send("not json", &ping_headers(), Duration::ZERO)
        .await
        .unwrap();

    let err = queue.get().await.unwrap_err();
    assert!(matches!(err, Error::Decode { id: failed, .. } if failed == id));

    assert!(queue.find(id).await.unwrap().is_none());
    assert!(queue.get().await.unwrap().is_none());
}

#[tokio::test]
async fn test_wrong_type_is_rejected() {
    let queue = setup().await;

    let headers = HashMap::from([(TYPE_HEADER.to_owned(), "app::Other".to_owned())]);
    let id = queue
        .connection()
        .send(r#"{"n":1}"#, &headers, Duration::ZERO)
        .await
        .unwrap();

    assert!(matches!(queue.get().await, Err(Error::Decode { .. })));
    assert!(queue.connection().find(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_corrupt_headers_are_rejected() {
    let queue = setup().await;
    queue.setup().await.unwrap();

    let id: i64 = sqlx::query_scalar(
        "INSERT INTO messenger_messages (body, headers, queue_name, created_at, available_at) \
         VALUES ('{}', '{broken', 'default', $1, $1) RETURNING id",
    )
    .bind(start_time())
    .fetch_one(queue.driver.pool())
    .await
    .unwrap();

    let err = queue.get().await.unwrap_err();
    assert!(matches!(err, Error::Headers { id: failed, .. } if failed == MessageId::new(id)));

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messenger_messages")
        .fetch_one(queue.driver.pool())
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_queue_emptied_marker() {
    let queue = setup().await;

    assert_eq!(queue.connection.queue_emptied_at(), None);

    assert!(queue.get().await.unwrap().is_none());
    assert_eq!(queue.connection.queue_emptied_at(), Some(start_time()));

    queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    queue.get().await.unwrap().unwrap();
    assert_eq!(queue.connection.queue_emptied_at(), None);

    assert!(queue.get().await.unwrap().is_none());
    queue.reset().await.unwrap();
    assert_eq!(queue.connection.queue_emptied_at(), None);
}

#[tokio::test]
async fn test_concurrent_consumers() {
    let queue = setup().await;
    queue.send(Envelope::new(Ping { n: 1 })).await.unwrap();

    let (a, b) = tokio::join!(queue.connection.dequeue(), queue.connection.dequeue());

    let mut delivered = 0;
    for result in [a, b] {
        match result {
            Ok(Some(_)) => delivered += 1,
            Ok(None) => {}
            Err(e) => assert!(e.is_retryable(), "unexpected error: {e}"),
        }
    }

    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn test_connect_builder() {
    let tmpdir = tempfile::tempdir().unwrap();
    let dsn = format!(
        "sqlite://{}?queue_name=mail",
        tmpdir.path().join("queue.db").display()
    );

    let transport = tablemq::connect()
        .dsn(dsn)
        .options(HashMap::from([(
            "table_name".to_owned(),
            "app_messages".to_owned(),
        )]))
        .codec(JsonCodec::<Ping>::new())
        .open()
        .await
        .unwrap();

    let configuration = transport.connection().configuration();
    assert_eq!(configuration.queue_name, "mail");
    assert_eq!(configuration.table_name, "app_messages");

    transport.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    let received = transport.get().await.unwrap().unwrap();
    assert_eq!(received.message(), &Ping { n: 1 });
    assert!(transport.ack(&received).await.unwrap());
}

#[tokio::test]
async fn test_schema_qualified_table_on_sqlite() {
    let tmpdir = tempfile::tempdir().unwrap();
    let dsn = format!(
        "sqlite://{}?table_name=main.messages",
        tmpdir.path().join("queue.db").display()
    );

    let transport = tablemq::connect()
        .dsn(dsn)
        .codec(JsonCodec::<Ping>::new())
        .open()
        .await
        .unwrap();

    transport.setup().await.unwrap();
    transport.setup().await.unwrap();

    transport.send(Envelope::new(Ping { n: 1 })).await.unwrap();
    let received = transport.get().await.unwrap().unwrap();
    assert_eq!(received.message(), &Ping { n: 1 });
    assert!(transport.ack(&received).await.unwrap());
    assert_eq!(transport.message_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_connect_rejects_unknown_options() {
    let result = tablemq::connect()
        .dsn("sqlite://queue.db")
        .options(HashMap::from([("new_option".to_owned(), "1".to_owned())]))
        .codec(JsonCodec::<Ping>::new())
        .open()
        .await;

    assert!(matches!(result, Err(Error::InvalidConfiguration { .. })));
}
