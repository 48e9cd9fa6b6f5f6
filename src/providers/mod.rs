//! Broker provider implementations.

pub mod memory;

pub use memory::{InMemoryBroker, InMemoryBrokerConfig};
