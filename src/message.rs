//! Message types: validated identifiers, delivery tokens, receipt handles,
//! and the JSON wire codec (typed value ⇄ bytes).

use crate::error::{SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Content type tag applied to every wire payload produced by this crate.
pub const CONTENT_TYPE_JSON: &str = "application/json";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated broker entity name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityName(String);

impl EntityName {
    /// Create new entity name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        // Validate length
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "entity_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // Validate characters (ASCII alphanumeric, hyphens, underscores)
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidFormat {
                field: "entity_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, and underscores allowed".to_string(),
            });
        }

        // Validate no consecutive hyphens or leading/trailing hyphens
        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "entity_name".to_string(),
                message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Derive an entity name from a message type label.
    ///
    /// Takes the last path segment of the label, strips generic parameters,
    /// and converts it to lowercase hyphenated form, so
    /// `my_app::events::OrderPlaced` becomes `order-placed`. An optional
    /// prefix is prepended with a hyphen.
    pub fn for_type_label(label: &str, prefix: Option<&str>) -> Result<Self, ValidationError> {
        let segment = label.rsplit("::").next().unwrap_or(label);
        let segment = segment.split('<').next().unwrap_or(segment);

        let mut base = String::with_capacity(segment.len() + 8);
        for c in segment.chars() {
            if c.is_ascii_uppercase() {
                if !base.is_empty() && !base.ends_with('-') {
                    base.push('-');
                }
                base.push(c.to_ascii_lowercase());
            } else if c.is_ascii_alphanumeric() || c == '_' {
                base.push(c);
            } else if !base.is_empty() && !base.ends_with('-') {
                base.push('-');
            }
        }
        while base.ends_with('-') {
            base.pop();
        }

        let full = match prefix {
            Some(p) => format!("{}-{}", p, base),
            None => base,
        };
        Self::new(full)
    }

    /// Get entity name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Unique identifier assigned to messages by the broker
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-delivery receipt handed to subscribers alongside the decoded
/// payload. Lifecycle calls (`lock`/`complete`/`abandon`/`error`) are keyed
/// by this token rather than by value identity, so two equal payloads
/// delivered concurrently never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryToken(uuid::Uuid);

impl DeliveryToken {
    /// Generate a fresh token for a newly received message
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for DeliveryToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

/// Opaque token identifying one peek-locked delivery at the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptHandle {
    handle: String,
    entity: String,
    expires_at: Timestamp,
}

impl ReceiptHandle {
    /// Create new receipt handle
    pub fn new(handle: String, entity: String, expires_at: Timestamp) -> Self {
        Self {
            handle,
            entity,
            expires_at,
        }
    }

    /// Get handle string
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Get the broker entity this receipt belongs to
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Check if the peek-lock lease has expired
    pub fn is_expired(&self) -> bool {
        Timestamp::now() >= self.expires_at
    }

    /// Get time until lease expiry
    pub fn time_until_expiry(&self) -> Duration {
        let now = Timestamp::now();
        if now >= self.expires_at {
            Duration::zero()
        } else {
            self.expires_at.as_datetime() - now.as_datetime()
        }
    }
}

// ============================================================================
// Wire Payload and Codec
// ============================================================================

/// A serialized message as it crosses the broker boundary.
///
/// The label carries the fully qualified message type name for diagnostics
/// only; routing is always by adapter, never by label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    pub content_type: String,
    pub label: String,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

/// Encode a typed value into a JSON wire payload
pub fn encode<T: Serialize>(value: &T) -> Result<WirePayload, SerializationError> {
    let body = serde_json::to_vec(value)?;
    Ok(WirePayload {
        body: Bytes::from(body),
        content_type: CONTENT_TYPE_JSON.to_string(),
        label: std::any::type_name::<T>().to_string(),
    })
}

/// Decode a wire payload back into a typed value
pub fn decode<T: DeserializeOwned>(payload: &WirePayload) -> Result<T, SerializationError> {
    if payload.content_type != CONTENT_TYPE_JSON {
        return Err(SerializationError::UnsupportedContentType {
            content_type: payload.content_type.clone(),
        });
    }
    Ok(serde_json::from_slice(&payload.body)?)
}

// ============================================================================
// Typed Message Surface
// ============================================================================

/// Marker trait for values that can travel through the messenger.
///
/// Blanket-implemented for every type that is serde-serializable, cloneable,
/// and thread-safe; applications never implement it by hand.
pub trait BusMessage: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Fully qualified type name, used as the diagnostic wire label and to
    /// derive the backing entity name.
    fn type_label() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<T> BusMessage for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A decoded message together with the receipt token that lifecycle calls
/// (`lock`/`complete`/`abandon`/`error`) must be given to resolve it.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    pub body: T,
    pub token: DeliveryToken,
    pub delivery_count: u32,
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
