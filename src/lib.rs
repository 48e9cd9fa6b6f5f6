//! # Typed Messenger
//!
//! Typed messaging client abstraction over a managed queue/topic broker.
//!
//! Applications send strongly-typed messages and register at most one
//! in-process handler per message type; this library transparently handles
//! peek-lock lease renewal, transient-fault retry with handle rebuild, and
//! the terminal message-lifecycle transitions (complete, abandon,
//! dead-letter). Delivery is at-least-once.
//!
//! ## Module Organization
//!
//! - [`error`] - Error taxonomy for messenger and broker operations
//! - [`message`] - Identifiers, delivery tokens, and the JSON wire codec
//! - [`config`] - Messenger configuration and retry policy
//! - [`broker`] - Broker-facing traits implemented by providers
//! - [`providers`] - Broker implementations (in-memory)
//! - [`hub`] - In-process fan-out hub and the handler trait
//! - [`messenger`] - The dispatcher façade

// Module declarations
pub mod broker;
pub mod config;
pub mod error;
pub mod hub;
pub mod message;
pub mod messenger;
pub mod providers;

mod adapter;

// Re-export commonly used types at crate root for convenience
pub use broker::{
    BrokerClient, BrokerReceiver, BrokerSender, EntityAddress, EntityDescription, RawDelivery,
};
pub use config::{Addressing, MessengerConfig, RetryPolicy};
pub use error::{
    BrokerError, ConfigurationError, MessengerError, SerializationError, ValidationError,
};
pub use hub::MessageHandler;
pub use message::{
    decode, encode, BusMessage, Delivery, DeliveryToken, EntityName, MessageId, ReceiptHandle,
    Timestamp, WirePayload, CONTENT_TYPE_JSON,
};
pub use messenger::Messenger;
pub use providers::{InMemoryBroker, InMemoryBrokerConfig};
