//! Application-level message units.

use crate::error::Status;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// One payload flowing on a stream channel in one direction.
///
/// The payload is opaque to the core. The tag is a logical type name the
/// handler and caller agree on; the core never inspects it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    tag: String,
    payload: Bytes,
}

impl Frame {
    pub fn new(tag: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            tag: tag.into(),
            payload: payload.into(),
        }
    }

    /// Builds a frame from a UTF-8 string tagged `text`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::new("text", Bytes::from(body.into()))
    }

    /// Serializes `value` as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Code::Internal`](crate::Code::Internal) if `value` cannot be
    /// serialized, which only happens for types with non-string map keys or
    /// failing `Serialize` impls.
    pub fn json<T: Serialize + ?Sized>(tag: impl Into<String>, value: &T) -> Result<Self, Status> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| Status::internal(format!("Failed to encode payload: {e}")))?;
        Ok(Self::new(tag, payload))
    }

    /// Deserializes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Code::InvalidArgument`](crate::Code::InvalidArgument) if the
    /// payload does not decode into `T`.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, Status> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The payload as UTF-8, if it is valid UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }

    #[must_use]
    pub fn into_parts(self) -> (String, Bytes) {
        (self.tag, self.payload)
    }
}
