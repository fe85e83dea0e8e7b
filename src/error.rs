use snafu::Snafu;

use crate::{codec::CodecError, message::MessageId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Stored headers of message {id} are not valid JSON"))]
    Headers {
        id: MessageId,
        source: serde_json::Error,
    },

    #[snafu(display("Could not serialize message headers"))]
    EncodeHeaders { source: serde_json::Error },

    #[snafu(display("Could not encode message"))]
    Encode { source: CodecError },

    #[snafu(display("Could not decode message {id}"))]
    Decode { id: MessageId, source: CodecError },

    #[snafu(display("Invalid configuration: {message}"))]
    InvalidConfiguration { message: String },

    #[snafu(display("Delay of {delay:?} is out of range"))]
    InvalidDelay { delay: std::time::Duration },

    /// Raised by the receiver for failures the caller cannot do anything about
    /// besides retrying later.
    #[snafu(display("Transport failure: {source}"))]
    Transport {
        #[snafu(source(from(Error, Box::new)))]
        source: Box<Error>,
    },

    /// The envelope was never handed out by a receiver, so there is no row to
    /// acknowledge. This is a bug in the caller.
    #[snafu(display("Envelope carries no received stamp"))]
    MissingReceivedStamp,
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl Error {
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    pub fn transport(source: Error) -> Self {
        match source {
            // Already attributed to the transport, don't nest it twice.
            e @ Self::Transport { .. } => e,
            e => Self::Transport {
                source: Box::new(e),
            },
        }
    }

    /// Returns the database error underneath this error, looking through
    /// transport wrapping.
    pub fn as_sqlx(&self) -> Option<&sqlx::Error> {
        match self {
            Self::Sqlx { source } => Some(source),
            Self::Transport { source } => source.as_sqlx(),
            _ => None,
        }
    }

    /// Lock contention, deadlocks and connection blips. These usually resolve on
    /// their own once the competing transaction finishes.
    pub fn is_retryable(&self) -> bool {
        self.as_sqlx().is_some_and(is_retryable)
    }

    pub fn is_table_not_found(&self) -> bool {
        self.as_sqlx().is_some_and(is_table_not_found)
    }
}

/// SQLSTATE codes reported by PostgreSQL for transient conflicts.
const PG_RETRYABLE: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
];

/// SQLite primary result codes for lock contention. Extended codes carry the
/// primary code in their low byte.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

pub(crate) fn is_retryable(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            let Some(code) = db.code() else {
                return false;
            };

            let code: &str = &code;
            if PG_RETRYABLE.contains(&code) {
                return true;
            }

            code.parse::<i64>()
                .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
                .unwrap_or(false)
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed => true,
        _ => false,
    }
}

pub(crate) fn is_table_not_found(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("42P01") || db.message().contains("no such table")
        }
        _ => false,
    }
}
