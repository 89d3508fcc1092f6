//! Message type and payload helpers

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// An immutable message addressed to a named destination queue.
///
/// Equality is structural: two messages with the same destination and
/// payload are indistinguishable, and both may sit in a queue at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Name of the queue the message is delivered to and made available from
    pub destination: String,

    /// Opaque payload carried by the message
    pub payload: Value,
}

impl Message {
    /// Create a new message
    pub fn new(destination: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
        }
    }

    /// Create a message from any serializable payload
    pub fn with_payload<T: Serialize>(
        destination: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            destination: destination.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Deserialize the payload into a concrete type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// The payload as a string slice, if it is a JSON string
    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// Serialize to JSON bytes
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <- {}", self.destination, self.payload)
    }
}
