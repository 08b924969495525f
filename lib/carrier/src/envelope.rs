//! Versioned wrapper for every message put on the event bus.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// A bus message with its version header.
///
/// `event_id` lets consumers drop duplicate deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    pub event_id: Ulid,
    pub published_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> Envelope<T> {
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            event_id: Ulid::new(),
            published_at: Utc::now(),
            payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }

    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    #[must_use]
    pub fn is_current_version(&self) -> bool {
        self.version == CURRENT_VERSION
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// An envelope whose payload has not been decoded yet.
///
/// Read the version first, then decode the payload for versions the
/// consumer understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEnvelope {
    pub version: u32,
    pub event_id: Ulid,
    pub published_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl RawEnvelope {
    /// Deserializes from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not an envelope.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Decodes the payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not decode into `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<Envelope<T>, serde_json::Error> {
        let payload: T = serde_json::from_value(self.payload)?;
        Ok(Envelope {
            version: self.version,
            event_id: self.event_id,
            published_at: self.published_at,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_envelope_defers_payload_decoding() {
        let envelope = Envelope::new(json!({"count": 3}));
        let bytes = envelope.to_json_bytes().unwrap();

        let raw = RawEnvelope::from_json_bytes(&bytes).unwrap();
        assert_eq!(raw.version(), CURRENT_VERSION);
        assert_eq!(raw.event_id, envelope.event_id);

        let decoded: Envelope<serde_json::Value> = raw.decode().unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.is_current_version());
    }

    #[test]
    fn wrong_payload_shape_fails_decode() {
        let bytes = Envelope::new("text").to_json_bytes().unwrap();
        let raw = RawEnvelope::from_json_bytes(&bytes).unwrap();
        assert!(raw.decode::<Vec<u32>>().is_err());
    }
}
