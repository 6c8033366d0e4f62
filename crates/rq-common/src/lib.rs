use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod backoff;
pub mod logging;
pub mod shutdown;

pub use backoff::{backoff, backoff_ms};
pub use logging::Environment;
pub use shutdown::Shutdown;

/// Default maximum number of retries for a message
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ============================================================================
// Core Message Types
// ============================================================================

/// The envelope that travels through the broker and the outbox.
///
/// `body` is an opaque, already-serialized payload. On the wire it is a
/// base64 string so existing JSON-encoded rows and broker payloads stay
/// readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique ID of the message, kept across retries
    pub id: String,
    /// Discriminator used by handlers to pick the message up
    pub name: String,
    #[serde(with = "body_encoding")]
    pub body: Vec<u8>,
    /// Delay in milliseconds before the message becomes visible
    #[serde(default)]
    pub delay: u64,
    /// Number of times the message has been retried
    #[serde(default)]
    pub retry_count: u32,
    /// Maximum number of times the message can be retried
    #[serde(default)]
    pub max_retries: u32,
}

impl Message {
    /// Build a message whose body is the JSON encoding of `body`.
    pub fn new<T: Serialize + ?Sized>(name: impl Into<String>, body: &T) -> Result<Self> {
        let encoded = serde_json::to_vec(body).map_err(MessageError::Encode)?;
        Ok(Self::from_bytes(name, encoded))
    }

    /// Build a message around an already-serialized body.
    pub fn from_bytes(name: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            body,
            delay: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = delay_ms;
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// The message to publish when handling this one failed.
    ///
    /// Same id, name and body; the retry count is bumped and the
    /// backoff delay for the new count is attached.
    pub fn next_retry(&self) -> Self {
        let retry_count = self.retry_count.saturating_add(1);
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            body: self.body.clone(),
            delay: backoff_ms(retry_count),
            retry_count,
            max_retries: self.max_retries,
        }
    }

    /// Decode the JSON body into `T`.
    pub fn decode_body<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(MessageError::Decode)
    }

    /// Wire encoding used for broker payloads and outbox rows.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(MessageError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(MessageError::Decode)
    }
}

mod body_encoding {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    // A missing body is encoded as `null` by older producers
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD.decode(encoded).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MessageError>;
