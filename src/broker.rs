//! Broker-facing traits and addressing types.
//!
//! The messenger talks to the broker exclusively through these traits:
//! [`BrokerClient`] for entity provisioning and handle construction,
//! [`BrokerSender`] for sends, and [`BrokerReceiver`] for peek-lock receives
//! and the terminal message operations. Sender and receiver handles are
//! rebuildable: a fresh handle can always be obtained from the client for the
//! same address, which is how the adapter recovers from poisoned connections.

use crate::error::BrokerError;
use crate::message::{EntityName, MessageId, ReceiptHandle, WirePayload};
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;

/// Address of a physical broker entity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityAddress {
    /// Point-to-point queue
    Queue(EntityName),
    /// Publish side of a topic
    Topic(EntityName),
    /// Receive side of a topic: one named subscription
    Subscription {
        topic: EntityName,
        subscription: EntityName,
    },
}

impl EntityAddress {
    /// Storage key uniquely identifying the addressed entity
    pub fn key(&self) -> String {
        match self {
            Self::Queue(name) => name.to_string(),
            Self::Topic(name) => name.to_string(),
            Self::Subscription {
                topic,
                subscription,
            } => format!("{}/{}", topic, subscription),
        }
    }
}

impl std::fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Broker-reported properties of a provisioned entity
#[derive(Debug, Clone)]
pub struct EntityDescription {
    /// Peek-lock lease configured on the entity
    pub lease: Duration,
}

/// One peek-locked message as handed over by the broker
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub message_id: MessageId,
    pub payload: WirePayload,
    pub receipt: ReceiptHandle,
    pub delivery_count: u32,
}

/// Control-plane and handle factory for one broker connection
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Resolve the addressed entity, creating it if absent
    async fn ensure_entity(
        &self,
        address: &EntityAddress,
    ) -> Result<EntityDescription, BrokerError>;

    /// Open a sender handle against the addressed entity
    async fn create_sender(
        &self,
        address: &EntityAddress,
    ) -> Result<Arc<dyn BrokerSender>, BrokerError>;

    /// Open a peek-lock receiver handle against the addressed entity
    async fn create_receiver(
        &self,
        address: &EntityAddress,
    ) -> Result<Arc<dyn BrokerReceiver>, BrokerError>;
}

/// Send side of one broker entity
#[async_trait]
pub trait BrokerSender: Send + Sync {
    /// Send a single payload
    async fn send(&self, payload: &WirePayload) -> Result<MessageId, BrokerError>;

    /// Close the handle; subsequent sends fail
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Peek-lock receive side of one broker entity
#[async_trait]
pub trait BrokerReceiver: Send + Sync {
    /// Receive up to `max_messages` peek-locked messages; returns immediately
    /// with whatever is available
    async fn receive(&self, max_messages: u32) -> Result<Vec<RawDelivery>, BrokerError>;

    /// Extend the peek-lock lease for a delivery
    async fn renew_lock(&self, receipt: &ReceiptHandle) -> Result<(), BrokerError>;

    /// Acknowledge and remove a delivery
    async fn complete(&self, receipt: &ReceiptHandle) -> Result<(), BrokerError>;

    /// Return a delivery to the entity for redelivery
    async fn abandon(&self, receipt: &ReceiptHandle) -> Result<(), BrokerError>;

    /// Move a delivery to the entity's dead-letter store
    async fn dead_letter(&self, receipt: &ReceiptHandle, reason: &str)
        -> Result<(), BrokerError>;

    /// Close the handle; subsequent operations fail
    async fn close(&self) -> Result<(), BrokerError>;
}
