//! Consuming side of the transport.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng;
use tracing::{debug, warn};

use crate::{
    codec::{Codec, Encoded},
    connection::QueueConnection,
    envelope::Envelope,
    error::{Error, Result},
    message::{MessageId, StoredMessage},
};

/// Exponential backoff applied to acknowledgements.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Also the number of consecutive
    /// retryable `get` failures that are swallowed.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
    /// Each wait is randomized by up to this fraction in either direction
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            multiplier: 2,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Nominal wait before retry number `retry` (zero based).
    pub fn delay(&self, retry: u32) -> Duration {
        self.initial_delay
            .saturating_mul(self.multiplier.saturating_pow(retry))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let spread = delay.as_secs_f64() * self.jitter.clamp(0.0, 1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);

        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

pub struct Receiver<S: Codec> {
    connection: Arc<dyn QueueConnection>,
    codec: Arc<S>,
    retry: RetryPolicy,
    retryable_failures: AtomicU32,
}

impl<S: Codec> Receiver<S> {
    pub fn new(connection: Arc<dyn QueueConnection>, codec: Arc<S>) -> Self {
        Self {
            connection,
            codec,
            retry: RetryPolicy::default(),
            retryable_failures: AtomicU32::new(0),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetches the next message, if any.
    ///
    /// Retryable database errors are reported as an empty queue until more
    /// than `max_retries` of them happen in a row. A message that cannot be
    /// decoded is rejected before the error is returned, so it is never seen
    /// again.
    pub async fn get(&self) -> Result<Option<Envelope<S::Message>>> {
        let message = match self.connection.dequeue().await {
            Ok(message) => {
                self.retryable_failures.store(0, Ordering::Relaxed);
                message
            }
            Err(e) if e.is_retryable() => {
                let failures = self.retryable_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures > self.retry.max_retries {
                    self.retryable_failures.store(0, Ordering::Relaxed);
                    return Err(Error::transport(e));
                }

                warn!(failures, "retryable error while fetching a message: {e}");
                return Ok(None);
            }
            Err(Error::Headers { id, source }) => {
                self.retryable_failures.store(0, Ordering::Relaxed);
                self.reject_undecodable(id).await?;
                return Err(Error::Headers { id, source });
            }
            Err(e) => return Err(Error::transport(e)),
        };

        match message {
            Some(message) => self.decode(message).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn ack(&self, envelope: &Envelope<S::Message>) -> Result<bool> {
        let id = received_id(envelope)?;
        self.with_retry(|| self.connection.ack(id)).await
    }

    pub async fn reject(&self, envelope: &Envelope<S::Message>) -> Result<bool> {
        let id = received_id(envelope)?;
        self.with_retry(|| self.connection.reject(id)).await
    }

    pub async fn message_count(&self) -> Result<u64> {
        self.connection
            .message_count()
            .await
            .map_err(Error::transport)
    }

    /// Eligible messages, oldest first, without delivering them.
    pub async fn all(&self, limit: Option<u32>) -> Result<Vec<Envelope<S::Message>>> {
        let messages = self
            .connection
            .find_all(limit)
            .await
            .map_err(Error::transport)?;

        let mut envelopes = Vec::with_capacity(messages.len());
        for message in messages {
            envelopes.push(self.decode(message).await?);
        }

        Ok(envelopes)
    }

    pub async fn find(&self, id: MessageId) -> Result<Option<Envelope<S::Message>>> {
        let message = self.connection.find(id).await.map_err(Error::transport)?;

        match message {
            Some(message) => self.decode(message).await.map(Some),
            None => Ok(None),
        }
    }

    async fn decode(&self, message: StoredMessage) -> Result<Envelope<S::Message>> {
        let id = message.id;
        let encoded = Encoded {
            body: message.body,
            headers: message.headers,
        };

        match self.codec.decode(encoded) {
            Ok(envelope) => Ok(envelope
                .with_received(id)
                .with_transport_message_id(id)),
            Err(source) => {
                self.reject_undecodable(id).await?;
                Err(Error::Decode { id, source })
            }
        }
    }

    async fn reject_undecodable(&self, id: MessageId) -> Result<()> {
        warn!(%id, "rejecting message that cannot be decoded");
        self.connection
            .reject(id)
            .await
            .map(drop)
            .map_err(Error::transport)
    }

    /// Runs `op`, retrying retryable failures with jittered exponential backoff.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retries < self.retry.max_retries => {
                    let wait = self.retry.jittered(self.retry.delay(retries));
                    retries += 1;

                    debug!(retries, ?wait, "retrying after error: {e}");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(Error::transport(e)),
            }
        }
    }
}

fn received_id<M>(envelope: &Envelope<M>) -> Result<MessageId> {
    envelope
        .received()
        .map(|stamp| stamp.id)
        .ok_or(Error::MissingReceivedStamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();

        for _ in 0..100 {
            let wait = policy.jittered(Duration::from_millis(100));
            assert!(wait >= Duration::from_millis(89), "{wait:?}");
            assert!(wait <= Duration::from_millis(111), "{wait:?}");
        }
    }

    #[test]
    fn no_jitter() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(
            policy.jittered(Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }
}
