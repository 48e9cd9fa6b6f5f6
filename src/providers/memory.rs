//! In-memory broker implementation for testing and development.
//!
//! This module provides a fully functional in-memory broker that:
//! - Implements peek-lock receive with lease expiry and redelivery
//! - Fans topic sends out to every registered subscription
//! - Keeps a per-entity dead-letter store
//! - Exposes fault-injection counters so transient-failure handling can be
//!   exercised deterministically in tests

use crate::broker::{
    BrokerClient, BrokerReceiver, BrokerSender, EntityAddress, EntityDescription, RawDelivery,
};
use crate::error::BrokerError;
use crate::message::{MessageId, ReceiptHandle, Timestamp, WirePayload};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the in-memory broker
#[derive(Debug, Clone)]
pub struct InMemoryBrokerConfig {
    /// Peek-lock lease applied to every entity
    pub lease: Duration,
    /// Deliveries after which a message is dead-lettered by the broker itself
    pub max_delivery_count: u32,
}

impl Default for InMemoryBrokerConfig {
    fn default() -> Self {
        Self {
            lease: Duration::seconds(30),
            max_delivery_count: 10,
        }
    }
}

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored in an entity with metadata
#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    payload: WirePayload,
    delivery_count: u32,
    available_at: Timestamp,
}

impl StoredMessage {
    fn new(payload: WirePayload) -> Self {
        Self {
            message_id: MessageId::new(),
            payload,
            delivery_count: 0,
            available_at: Timestamp::now(),
        }
    }

    /// Check if message is available for receiving
    fn is_available(&self) -> bool {
        Timestamp::now() >= self.available_at
    }
}

/// A message currently peek-locked by a consumer
struct LockedMessage {
    message: StoredMessage,
    lock_expires_at: Timestamp,
}

impl LockedMessage {
    fn is_expired(&self) -> bool {
        Timestamp::now() >= self.lock_expires_at
    }
}

/// Internal state for a single queue or subscription
struct EntityState {
    messages: VecDeque<StoredMessage>,
    in_flight: HashMap<String, LockedMessage>,
    dead_letter: VecDeque<StoredMessage>,
}

impl EntityState {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            in_flight: HashMap::new(),
            dead_letter: VecDeque::new(),
        }
    }

    /// Return expired peek-locks to the entity for redelivery
    fn reclaim_expired_locks(&mut self) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, locked)| locked.is_expired())
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(locked) = self.in_flight.remove(&receipt) {
                let mut message = locked.message;
                message.available_at = Timestamp::now();
                self.messages.push_back(message);
            }
        }
    }
}

/// Thread-safe storage for all entities
struct BrokerStorage {
    entities: HashMap<String, EntityState>,
    /// Topic name -> entity keys of its subscriptions
    topics: HashMap<String, Vec<String>>,
}

impl BrokerStorage {
    fn new() -> Self {
        Self {
            entities: HashMap::new(),
            topics: HashMap::new(),
        }
    }

    fn entity_mut(&mut self, key: &str) -> Result<&mut EntityState, BrokerError> {
        self.entities
            .get_mut(key)
            .ok_or_else(|| BrokerError::EntityNotFound {
                entity: key.to_string(),
            })
    }
}

// ============================================================================
// Fault Injection
// ============================================================================

/// Counters of operations that should fail with a transient connection fault
#[derive(Default)]
struct FaultInjection {
    sends: AtomicU32,
    receives: AtomicU32,
    renewals: AtomicU32,
    completes: AtomicU32,
    abandons: AtomicU32,
    dead_letters: AtomicU32,
}

impl FaultInjection {
    /// Consume one armed fault, returning true when the operation must fail
    fn trip(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current > 0 {
                    Some(current - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

fn injected_fault(operation: &str) -> BrokerError {
    BrokerError::ConnectionFailed {
        message: format!("injected {} fault", operation),
    }
}

// ============================================================================
// InMemoryBroker
// ============================================================================

/// In-memory broker implementation
pub struct InMemoryBroker {
    storage: Arc<RwLock<BrokerStorage>>,
    config: InMemoryBrokerConfig,
    faults: Arc<FaultInjection>,
}

impl InMemoryBroker {
    /// Create new in-memory broker with configuration
    pub fn new(config: InMemoryBrokerConfig) -> Self {
        Self {
            storage: Arc::new(RwLock::new(BrokerStorage::new())),
            config,
            faults: Arc::new(FaultInjection::default()),
        }
    }

    /// Arm the next `count` sends to fail with a transient fault
    pub fn fail_next_sends(&self, count: u32) {
        self.faults.sends.store(count, Ordering::SeqCst);
    }

    /// Arm the next `count` receives to fail with a transient fault
    pub fn fail_next_receives(&self, count: u32) {
        self.faults.receives.store(count, Ordering::SeqCst);
    }

    /// Arm the next `count` lock renewals to fail with a transient fault
    pub fn fail_next_renewals(&self, count: u32) {
        self.faults.renewals.store(count, Ordering::SeqCst);
    }

    /// Arm the next `count` complete calls to fail with a transient fault
    pub fn fail_next_completes(&self, count: u32) {
        self.faults.completes.store(count, Ordering::SeqCst);
    }

    /// Arm the next `count` abandon calls to fail with a transient fault
    pub fn fail_next_abandons(&self, count: u32) {
        self.faults.abandons.store(count, Ordering::SeqCst);
    }

    /// Arm the next `count` dead-letter calls to fail with a transient fault
    pub fn fail_next_dead_letters(&self, count: u32) {
        self.faults.dead_letters.store(count, Ordering::SeqCst);
    }

    /// Number of messages waiting in the addressed entity
    pub fn queued_len(&self, address: &EntityAddress) -> usize {
        self.storage
            .read()
            .ok()
            .and_then(|s| s.entities.get(&address.key()).map(|e| e.messages.len()))
            .unwrap_or(0)
    }

    /// Number of peek-locked messages in the addressed entity
    pub fn in_flight_len(&self, address: &EntityAddress) -> usize {
        self.storage
            .read()
            .ok()
            .and_then(|s| s.entities.get(&address.key()).map(|e| e.in_flight.len()))
            .unwrap_or(0)
    }

    /// Number of dead-lettered messages in the addressed entity
    pub fn dead_letter_len(&self, address: &EntityAddress) -> usize {
        self.storage
            .read()
            .ok()
            .and_then(|s| s.entities.get(&address.key()).map(|e| e.dead_letter.len()))
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryBrokerConfig::default())
    }
}

fn storage_write(
    storage: &RwLock<BrokerStorage>,
) -> Result<RwLockWriteGuard<'_, BrokerStorage>, BrokerError> {
    storage.write().map_err(|_| BrokerError::ProviderFault {
        provider: "in-memory".to_string(),
        code: "PoisonedLock".to_string(),
        message: "broker storage lock poisoned".to_string(),
    })
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn ensure_entity(
        &self,
        address: &EntityAddress,
    ) -> Result<EntityDescription, BrokerError> {
        let mut storage = storage_write(&self.storage)?;
        match address {
            EntityAddress::Queue(name) => {
                storage
                    .entities
                    .entry(name.to_string())
                    .or_insert_with(EntityState::new);
            }
            EntityAddress::Topic(name) => {
                storage.topics.entry(name.to_string()).or_default();
            }
            EntityAddress::Subscription {
                topic,
                subscription: _,
            } => {
                let key = address.key();
                storage
                    .entities
                    .entry(key.clone())
                    .or_insert_with(EntityState::new);
                let members = storage.topics.entry(topic.to_string()).or_default();
                if !members.contains(&key) {
                    members.push(key);
                }
            }
        }
        Ok(EntityDescription {
            lease: self.config.lease,
        })
    }

    async fn create_sender(
        &self,
        address: &EntityAddress,
    ) -> Result<Arc<dyn BrokerSender>, BrokerError> {
        Ok(Arc::new(MemorySender {
            storage: Arc::clone(&self.storage),
            faults: Arc::clone(&self.faults),
            address: address.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn create_receiver(
        &self,
        address: &EntityAddress,
    ) -> Result<Arc<dyn BrokerReceiver>, BrokerError> {
        Ok(Arc::new(MemoryReceiver {
            storage: Arc::clone(&self.storage),
            faults: Arc::clone(&self.faults),
            entity_key: address.key(),
            lease: self.config.lease,
            max_delivery_count: self.config.max_delivery_count,
            closed: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// MemorySender
// ============================================================================

struct MemorySender {
    storage: Arc<RwLock<BrokerStorage>>,
    faults: Arc<FaultInjection>,
    address: EntityAddress,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerSender for MemorySender {
    async fn send(&self, payload: &WirePayload) -> Result<MessageId, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionFailed {
                message: "sender is closed".to_string(),
            });
        }
        if FaultInjection::trip(&self.faults.sends) {
            return Err(injected_fault("send"));
        }

        let message = StoredMessage::new(payload.clone());
        let message_id = message.message_id.clone();
        let mut storage = storage_write(&self.storage)?;
        match &self.address {
            EntityAddress::Queue(name) => {
                storage.entity_mut(name.as_str())?.messages.push_back(message);
            }
            EntityAddress::Topic(name) => {
                let members = storage.topics.get(name.as_str()).cloned().ok_or_else(|| {
                    BrokerError::EntityNotFound {
                        entity: name.to_string(),
                    }
                })?;
                for key in members {
                    storage.entity_mut(&key)?.messages.push_back(message.clone());
                }
            }
            EntityAddress::Subscription { .. } => {
                // Sending directly into a subscription bypasses the topic;
                // only tests ever do this.
                let key = self.address.key();
                storage.entity_mut(&key)?.messages.push_back(message);
            }
        }
        Ok(message_id)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// MemoryReceiver
// ============================================================================

struct MemoryReceiver {
    storage: Arc<RwLock<BrokerStorage>>,
    faults: Arc<FaultInjection>,
    entity_key: String,
    lease: Duration,
    max_delivery_count: u32,
    closed: AtomicBool,
}

impl MemoryReceiver {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionFailed {
                message: "receiver is closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerReceiver for MemoryReceiver {
    async fn receive(&self, max_messages: u32) -> Result<Vec<RawDelivery>, BrokerError> {
        self.ensure_open()?;
        if FaultInjection::trip(&self.faults.receives) {
            return Err(injected_fault("receive"));
        }

        let mut storage = storage_write(&self.storage)?;
        let lease = self.lease;
        let max_delivery_count = self.max_delivery_count;
        let entity = storage.entity_mut(&self.entity_key)?;
        entity.reclaim_expired_locks();

        let mut delivered = Vec::new();
        let mut remaining = VecDeque::with_capacity(entity.messages.len());
        while let Some(mut message) = entity.messages.pop_front() {
            if delivered.len() as u32 >= max_messages || !message.is_available() {
                remaining.push_back(message);
                continue;
            }
            if message.delivery_count >= max_delivery_count {
                entity.dead_letter.push_back(message);
                continue;
            }

            message.delivery_count += 1;
            let receipt = uuid::Uuid::new_v4().to_string();
            let expires_at = Timestamp::from_datetime(Timestamp::now().as_datetime() + lease);
            delivered.push(RawDelivery {
                message_id: message.message_id.clone(),
                payload: message.payload.clone(),
                receipt: ReceiptHandle::new(
                    receipt.clone(),
                    self.entity_key.clone(),
                    expires_at.clone(),
                ),
                delivery_count: message.delivery_count,
            });
            entity.in_flight.insert(
                receipt,
                LockedMessage {
                    message,
                    lock_expires_at: expires_at,
                },
            );
        }
        entity.messages = remaining;
        Ok(delivered)
    }

    async fn renew_lock(&self, receipt: &ReceiptHandle) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if FaultInjection::trip(&self.faults.renewals) {
            return Err(injected_fault("renew"));
        }

        let mut storage = storage_write(&self.storage)?;
        let lease = self.lease;
        let entity = storage.entity_mut(&self.entity_key)?;
        let locked = entity.in_flight.get_mut(receipt.handle()).ok_or_else(|| {
            BrokerError::ReceiptNotFound {
                receipt: receipt.handle().to_string(),
            }
        })?;
        locked.lock_expires_at = Timestamp::from_datetime(Timestamp::now().as_datetime() + lease);
        Ok(())
    }

    async fn complete(&self, receipt: &ReceiptHandle) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if FaultInjection::trip(&self.faults.completes) {
            return Err(injected_fault("complete"));
        }

        let mut storage = storage_write(&self.storage)?;
        let entity = storage.entity_mut(&self.entity_key)?;
        entity.in_flight.remove(receipt.handle()).ok_or_else(|| {
            BrokerError::ReceiptNotFound {
                receipt: receipt.handle().to_string(),
            }
        })?;
        Ok(())
    }

    async fn abandon(&self, receipt: &ReceiptHandle) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if FaultInjection::trip(&self.faults.abandons) {
            return Err(injected_fault("abandon"));
        }

        let mut storage = storage_write(&self.storage)?;
        let entity = storage.entity_mut(&self.entity_key)?;
        let locked = entity.in_flight.remove(receipt.handle()).ok_or_else(|| {
            BrokerError::ReceiptNotFound {
                receipt: receipt.handle().to_string(),
            }
        })?;
        let mut message = locked.message;
        message.available_at = Timestamp::now();
        entity.messages.push_back(message);
        Ok(())
    }

    async fn dead_letter(
        &self,
        receipt: &ReceiptHandle,
        _reason: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if FaultInjection::trip(&self.faults.dead_letters) {
            return Err(injected_fault("dead-letter"));
        }

        let mut storage = storage_write(&self.storage)?;
        let entity = storage.entity_mut(&self.entity_key)?;
        let locked = entity.in_flight.remove(receipt.handle()).ok_or_else(|| {
            BrokerError::ReceiptNotFound {
                receipt: receipt.handle().to_string(),
            }
        })?;
        entity.dead_letter.push_back(locked.message);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
