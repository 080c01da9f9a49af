//! Body codecs, selected by content type.

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

/// Content type of [`Codec::Cbor`].
pub const CONTENT_TYPE_CBOR: &str = "application/cbor";

/// Content type of [`Codec::Json`].
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A symmetric body encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Codec {
    /// CBOR via `ciborium`.
    #[default]
    Cbor,
    /// JSON via `serde_json`.
    Json,
}

impl Codec {
    /// Picks the codec for a content type. Parameters such as `; charset=`
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] for an unsupported content type.
    pub fn for_content_type(content_type: &str) -> Result<Self> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            CONTENT_TYPE_CBOR => Ok(Self::Cbor),
            CONTENT_TYPE_JSON => Ok(Self::Json),
            _ => Err(Error::Codec(format!(
                "unsupported content type {content_type}"
            ))),
        }
    }

    /// The content type this codec produces.
    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Cbor => CONTENT_TYPE_CBOR,
            Self::Json => CONTENT_TYPE_JSON,
        }
    }

    /// Encode a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized.
    pub fn encode<T: Serialize + ?Sized>(self, msg: &T) -> Result<Bytes> {
        match self {
            Self::Cbor => {
                let mut vec = Vec::new();
                ciborium::ser::into_writer(msg, &mut vec)
                    .map_err(|e| Error::Codec(format!("serialization failed: {e}")))?;
                Ok(Bytes::from(vec))
            }
            Self::Json => serde_json::to_vec(msg)
                .map(Bytes::from)
                .map_err(|e| Error::Codec(format!("serialization failed: {e}"))),
        }
    }

    /// Decode a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is invalid or the message cannot be deserialized.
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            Self::Cbor => ciborium::de::from_reader(data)
                .map_err(|e| Error::Codec(format!("deserialization failed: {e}"))),
            Self::Json => serde_json::from_slice(data)
                .map_err(|e| Error::Codec(format!("deserialization failed: {e}"))),
        }
    }
}
