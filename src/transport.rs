//! The transport facade.

use std::sync::{Arc, OnceLock};

use crate::{
    codec::Codec,
    connection::QueueConnection,
    envelope::Envelope,
    error::Result,
    message::MessageId,
    receiver::{Receiver, RetryPolicy},
    schema::Schema,
    sender::Sender,
};

/// Sends and receives through one [`QueueConnection`].
///
/// The receiver and sender are built on first use and share the connection.
pub struct Transport<S: Codec> {
    connection: Arc<dyn QueueConnection>,
    codec: Arc<S>,
    retry: RetryPolicy,
    receiver: OnceLock<Receiver<S>>,
    sender: OnceLock<Sender<S>>,
}

impl<S: Codec> Transport<S> {
    pub fn new(connection: Arc<dyn QueueConnection>, codec: S) -> Self {
        Self {
            connection,
            codec: Arc::new(codec),
            retry: RetryPolicy::default(),
            receiver: OnceLock::new(),
            sender: OnceLock::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn connection(&self) -> &Arc<dyn QueueConnection> {
        &self.connection
    }

    fn receiver(&self) -> &Receiver<S> {
        self.receiver.get_or_init(|| {
            Receiver::new(self.connection.clone(), self.codec.clone())
                .with_retry_policy(self.retry.clone())
        })
    }

    fn sender(&self) -> &Sender<S> {
        self.sender
            .get_or_init(|| Sender::new(self.connection.clone(), self.codec.clone()))
    }

    pub async fn send(&self, envelope: Envelope<S::Message>) -> Result<Envelope<S::Message>> {
        self.sender().send(envelope).await
    }

    pub async fn get(&self) -> Result<Option<Envelope<S::Message>>> {
        self.receiver().get().await
    }

    pub async fn ack(&self, envelope: &Envelope<S::Message>) -> Result<bool> {
        self.receiver().ack(envelope).await
    }

    pub async fn reject(&self, envelope: &Envelope<S::Message>) -> Result<bool> {
        self.receiver().reject(envelope).await
    }

    pub async fn message_count(&self) -> Result<u64> {
        self.receiver().message_count().await
    }

    pub async fn all(&self, limit: Option<u32>) -> Result<Vec<Envelope<S::Message>>> {
        self.receiver().all(limit).await
    }

    pub async fn find(&self, id: MessageId) -> Result<Option<Envelope<S::Message>>> {
        self.receiver().find(id).await
    }

    pub async fn setup(&self) -> Result<()> {
        self.connection.setup().await
    }

    pub fn configure_schema(&self, schema: &mut Schema) {
        self.connection.configure_schema(schema)
    }

    pub async fn reset(&self) -> Result<()> {
        self.connection.reset().await
    }
}
