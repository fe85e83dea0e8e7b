//! Rows of the queue table.
//!
//! A message is a single row: an opaque body, the headers the codec needs to
//! rebuild the application message, and three timestamps that drive its
//! lifecycle.
//!
//! # Message Lifecycle
//!
//! 1. `send` inserts the row with `available_at = now + delay`
//! 2. `dequeue` stamps `delivered_at` on the oldest eligible row
//! 3. `ack` / `reject` delete the row
//!
//! A row that is neither acked nor rejected within the redelivery window becomes
//! eligible again, which is how crashed consumers are recovered.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use sqlx::prelude::FromRow;

use crate::error::{HeadersSnafu, Result};

/// Metadata stored next to the body.
pub type Headers = HashMap<String, String>;

/// Surrogate key assigned by the database. It is the only handle used for
/// acknowledging a delivery and is never reused.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct MessageId(i64);

impl MessageId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A row exactly as it is stored, with the headers still serialized.
#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: i64,
    pub body: String,
    pub headers: String,
    pub queue_name: String,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl MessageRow {
    pub fn decode(self) -> Result<StoredMessage> {
        let id = MessageId(self.id);
        let headers = serde_json::from_str(&self.headers).context(HeadersSnafu { id })?;

        Ok(StoredMessage {
            id,
            body: self.body,
            headers,
            queue_name: self.queue_name,
            created_at: self.created_at,
            available_at: self.available_at,
            delivered_at: self.delivered_at,
        })
    }
}

/// A message row with its headers decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Unique identifier for the message
    pub id: MessageId,
    /// Payload produced by the codec
    pub body: String,
    /// Codec metadata
    pub headers: Headers,
    /// Logical queue within the table
    pub queue_name: String,
    pub created_at: DateTime<Utc>,
    /// Earliest time the message may be dequeued
    pub available_at: DateTime<Utc>,
    /// Time of the last delivery, if any. A stale value means the redelivery
    /// window has expired.
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Values for a row about to be inserted.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub body: &'a str,
    pub headers: String,
    pub queue_name: &'a str,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}
