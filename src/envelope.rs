//! Application messages wrapped with the metadata the transport attaches.

use std::time::Duration;

use crate::message::MessageId;

/// Delays delivery of a sent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayStamp {
    pub delay: Duration,
}

/// Marks an envelope as handed out by a receiver. Carries the row id needed to
/// ack or reject this particular delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedStamp {
    pub id: MessageId,
}

/// The id the transport assigned to the message when it was stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportMessageIdStamp {
    pub id: MessageId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope<M> {
    message: M,
    delay: Option<DelayStamp>,
    received: Option<ReceivedStamp>,
    transport_message_id: Option<TransportMessageIdStamp>,
}

impl<M> Envelope<M> {
    pub fn new(message: M) -> Self {
        Self {
            message,
            delay: None,
            received: None,
            transport_message_id: None,
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(DelayStamp { delay });
        self
    }

    pub fn with_received(mut self, id: MessageId) -> Self {
        self.received = Some(ReceivedStamp { id });
        self
    }

    pub fn with_transport_message_id(mut self, id: MessageId) -> Self {
        self.transport_message_id = Some(TransportMessageIdStamp { id });
        self
    }

    pub fn delay(&self) -> Option<&DelayStamp> {
        self.delay.as_ref()
    }

    pub fn received(&self) -> Option<&ReceivedStamp> {
        self.received.as_ref()
    }

    pub fn transport_message_id(&self) -> Option<&TransportMessageIdStamp> {
        self.transport_message_id.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_are_replaced_not_accumulated() {
        let envelope = Envelope::new("x")
            .with_received(MessageId::new(1))
            .with_received(MessageId::new(2));

        assert_eq!(envelope.received().unwrap().id, MessageId::new(2));
        assert!(envelope.transport_message_id().is_none());
        assert!(envelope.delay().is_none());
    }
}
