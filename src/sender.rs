use std::sync::Arc;

use snafu::ResultExt;
use tracing::debug;

use crate::{
    codec::Codec,
    connection::QueueConnection,
    envelope::Envelope,
    error::{EncodeSnafu, Error, Result},
};

/// Producing side of the transport.
pub struct Sender<S: Codec> {
    connection: Arc<dyn QueueConnection>,
    codec: Arc<S>,
}

impl<S: Codec> Sender<S> {
    pub fn new(connection: Arc<dyn QueueConnection>, codec: Arc<S>) -> Self {
        Self { connection, codec }
    }

    /// Stores the message, honouring its delay stamp, and returns the envelope
    /// stamped with the id it was stored under.
    pub async fn send(&self, envelope: Envelope<S::Message>) -> Result<Envelope<S::Message>> {
        let encoded = self.codec.encode(&envelope).context(EncodeSnafu)?;
        let delay = envelope.delay().map(|stamp| stamp.delay).unwrap_or_default();

        let id = self
            .connection
            .send(&encoded.body, &encoded.headers, delay)
            .await
            .map_err(Error::transport)?;

        debug!(%id, ?delay, "message queued");

        Ok(envelope.with_transport_message_id(id))
    }
}
