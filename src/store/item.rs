//! Work item definition.
//!
//! A `WorkItem` pairs the identity key of a queued entry with the raw payload
//! stored under it. The key is what a caller hands back to the store once the
//! item has been delivered; the payload is opaque to the scheduler.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A unit of work fetched from the queue store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identity key of the item in the store.
    pub key: String,
    /// Raw payload stored under the key.
    pub payload: String,
}

impl WorkItem {
    /// Creates a new work item.
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }

    /// Creates an item by serializing `value` to JSON.
    pub fn from_json<T: Serialize>(
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(key, serde_json::to_string(value)?))
    }

    /// Parses the payload as JSON into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    /// Replaces the payload, keeping the key.
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }
}
