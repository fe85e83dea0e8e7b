//! Encoding of application messages into table rows.
//!
//! The transport never looks inside a message. A [`Codec`] turns an envelope
//! into a `{body, headers}` pair on the way in and back on the way out.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{envelope::Envelope, message::Headers};

/// Header naming the Rust type a [`JsonCodec`] encoded.
pub const TYPE_HEADER: &str = "type";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CodecError {
    #[snafu(display("Invalid JSON payload"))]
    Json { source: serde_json::Error },

    #[snafu(display("Missing header: {header}"))]
    MissingHeader { header: String },

    #[snafu(display("Unexpected message type {found}, expected {expected}"))]
    UnexpectedType { expected: String, found: String },

    /// For codecs with failure modes of their own.
    #[snafu(display("{message}"))]
    Other { message: String },
}

/// Body and headers as stored in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub body: String,
    pub headers: Headers,
}

pub trait Codec: Send + Sync {
    type Message: Send + Sync;

    fn encode(&self, envelope: &Envelope<Self::Message>) -> Result<Encoded, CodecError>;

    fn decode(&self, encoded: Encoded) -> Result<Envelope<Self::Message>, CodecError>;
}

/// Serializes the message itself as the JSON body and records its type name in
/// the `type` header, refusing to decode rows written for another type.
pub struct JsonCodec<M> {
    type_name: String,
    _message: PhantomData<fn() -> M>,
}

impl<M> JsonCodec<M> {
    pub fn new() -> Self {
        Self::with_type_name(std::any::type_name::<M>())
    }

    /// Uses `type_name` instead of the Rust type path, which keeps stored rows
    /// readable after the type is moved or renamed.
    pub fn with_type_name(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            _message: PhantomData,
        }
    }
}

impl<M> Default for JsonCodec<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Codec for JsonCodec<M>
where
    M: Serialize + DeserializeOwned + Send + Sync,
{
    type Message = M;

    fn encode(&self, envelope: &Envelope<M>) -> Result<Encoded, CodecError> {
        let body = serde_json::to_string(envelope.message()).context(JsonSnafu)?;

        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER.to_owned(), self.type_name.clone());

        Ok(Encoded { body, headers })
    }

    fn decode(&self, encoded: Encoded) -> Result<Envelope<M>, CodecError> {
        let found = encoded
            .headers
            .get(TYPE_HEADER)
            .context(MissingHeaderSnafu {
                header: TYPE_HEADER,
            })?;

        if *found != self.type_name {
            return UnexpectedTypeSnafu {
                expected: self.type_name.clone(),
                found: found.clone(),
            }
            .fail();
        }

        let message = serde_json::from_str(&encoded.body).context(JsonSnafu)?;

        Ok(Envelope::new(message))
    }
}
