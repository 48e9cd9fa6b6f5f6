//! Error types for messenger and broker operations.

use crate::message::DeliveryToken;
use chrono::Duration;
use thiserror::Error;

/// Top-level error type surfaced by the [`crate::Messenger`] API.
#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("A handler for message type '{type_label}' is already subscribed")]
    DuplicateSubscription { type_label: String },

    #[error("No in-flight record for delivery token {token}")]
    UnknownMessage { token: DeliveryToken },

    #[error("Send failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("Broker operation failed: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Errors produced by broker clients, senders, and receivers.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("Message lock lost or receipt unknown: {receipt}")]
    ReceiptNotFound { receipt: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderFault {
        provider: String,
        code: String,
        message: String,
    },
}

impl BrokerError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::EntityNotFound { .. } => false,
            Self::ReceiptNotFound { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::Timeout { .. } => true,
            Self::ProviderFault { .. } => true,
        }
    }

    /// Check if error should be retried
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }
}

/// Errors during payload serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Unsupported wire content type: {content_type}")]
    UnsupportedContentType { content_type: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
