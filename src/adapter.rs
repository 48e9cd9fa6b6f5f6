//! Per-message-type adapter: one broker entity's full send/receive pipeline.
//!
//! Each adapter owns a sender and receiver handle for its entity, a periodic
//! poll loop performing batched peek-lock receives, and the in-flight table
//! correlating delivery tokens with receipt handles and renewal timers. All
//! transient-fault recovery (retry with backoff, handle rebuild) happens
//! here; the dispatcher above only routes.

use crate::broker::{BrokerClient, BrokerReceiver, BrokerSender, EntityAddress};
use crate::config::{MessengerConfig, RetryPolicy};
use crate::error::{ConfigurationError, MessengerError};
use crate::hub::FanoutHub;
use crate::message::{decode, encode, BusMessage, Delivery, DeliveryToken, EntityName, ReceiptHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "adapter_tests.rs"]
mod tests;

// ============================================================================
// In-Flight Tracking
// ============================================================================

/// One peek-locked delivery awaiting terminal resolution
struct InFlightRecord {
    receipt: ReceiptHandle,
    renewal: Option<JoinHandle<()>>,
}

// ============================================================================
// Shared Adapter State
// ============================================================================

/// State shared between the adapter and its background tasks.
///
/// Kept separate from [`Adapter`] so the poll loop and renewal timers hold an
/// `Arc` to this alone, not to the adapter itself.
struct AdapterShared {
    send_address: EntityAddress,
    receive_address: EntityAddress,
    broker: Arc<dyn BrokerClient>,
    sender: RwLock<Arc<dyn BrokerSender>>,
    receiver: RwLock<Arc<dyn BrokerReceiver>>,
    renewal_interval: Duration,
    receive_batch_size: u32,
    in_flight: Mutex<HashMap<DeliveryToken, InFlightRecord>>,
}

impl AdapterShared {
    async fn current_sender(&self) -> Arc<dyn BrokerSender> {
        Arc::clone(&*self.sender.read().await)
    }

    async fn current_receiver(&self) -> Arc<dyn BrokerReceiver> {
        Arc::clone(&*self.receiver.read().await)
    }

    /// Replace the sender handle with a freshly opened one; the old handle
    /// may be poisoned, so its close is best effort.
    async fn rebuild_sender(&self) {
        match self.broker.create_sender(&self.send_address).await {
            Ok(fresh) => {
                let old = {
                    let mut guard = self.sender.write().await;
                    std::mem::replace(&mut *guard, fresh)
                };
                if let Err(err) = old.close().await {
                    debug!(entity = %self.send_address, %err, "closing stale sender failed");
                }
            }
            Err(err) => {
                warn!(entity = %self.send_address, %err, "sender rebuild failed");
            }
        }
    }

    /// Replace the receiver handle with a freshly opened one
    async fn rebuild_receiver(&self) {
        match self.broker.create_receiver(&self.receive_address).await {
            Ok(fresh) => {
                let old = {
                    let mut guard = self.receiver.write().await;
                    std::mem::replace(&mut *guard, fresh)
                };
                if let Err(err) = old.close().await {
                    debug!(entity = %self.receive_address, %err, "closing stale receiver failed");
                }
            }
            Err(err) => {
                warn!(entity = %self.receive_address, %err, "receiver rebuild failed");
            }
        }
    }

    /// Spawn the periodic lease-renewal timer for one in-flight record.
    ///
    /// The timer keeps renewing until the record is resolved; renewal faults
    /// are logged and retried on the next tick, since overlapping renewals
    /// are idempotent lease extensions.
    fn spawn_renewal(self: &Arc<Self>, token: DeliveryToken, receipt: ReceiptHandle) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(shared.renewal_interval).await;
                if !shared.in_flight.lock().await.contains_key(&token) {
                    break;
                }
                let receiver = shared.current_receiver().await;
                match receiver.renew_lock(&receipt).await {
                    Ok(()) => {
                        debug!(%token, entity = %shared.receive_address, "lease renewed");
                    }
                    Err(err) => {
                        warn!(%token, %err, "lease renewal failed");
                    }
                }
            }
        })
    }
}

// ============================================================================
// Poll Loop
// ============================================================================

/// One poll tick: batched peek-lock receive, decode, track, publish
async fn poll_once<T: BusMessage>(shared: &Arc<AdapterShared>, hub: &Arc<FanoutHub>) {
    let receiver = shared.current_receiver().await;
    let deliveries = match receiver.receive(shared.receive_batch_size).await {
        Ok(deliveries) => deliveries,
        Err(err) => {
            warn!(entity = %shared.receive_address, %err, "receive failed, rebuilding receiver");
            shared.rebuild_receiver().await;
            return;
        }
    };

    for raw in deliveries {
        let body: T = match decode(&raw.payload) {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    label = %raw.payload.label,
                    message_id = %raw.message_id,
                    %err,
                    "undecodable payload, abandoning for broker-side redelivery policy"
                );
                if let Err(err) = receiver.abandon(&raw.receipt).await {
                    warn!(message_id = %raw.message_id, %err, "abandon of undecodable payload failed");
                }
                continue;
            }
        };

        let token = DeliveryToken::new();
        shared.in_flight.lock().await.insert(
            token.clone(),
            InFlightRecord {
                receipt: raw.receipt.clone(),
                renewal: None,
            },
        );
        debug!(%token, message_id = %raw.message_id, entity = %shared.receive_address, "message delivered");
        hub.publish(Delivery {
            body,
            token,
            delivery_count: raw.delivery_count,
        })
        .await;
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Type-erased control surface used by the dispatcher at teardown
#[async_trait]
pub(crate) trait AdapterControl: Send + Sync {
    async fn shutdown(&self);
}

/// The per-message-type binding between the application and one broker entity
pub(crate) struct Adapter<T: BusMessage> {
    shared: Arc<AdapterShared>,
    hub: Arc<FanoutHub>,
    retry: RetryPolicy,
    poll_interval: Duration,
    polling: Mutex<Option<JoinHandle<()>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: BusMessage> Adapter<T> {
    /// Resolve or create the backing entity, read its lease, and open the
    /// initial sender and receiver handles
    pub(crate) async fn connect(
        broker: Arc<dyn BrokerClient>,
        hub: Arc<FanoutHub>,
        config: &MessengerConfig,
    ) -> Result<Self, MessengerError> {
        let entity = EntityName::for_type_label(T::type_label(), config.entity_prefix.as_deref())?;
        let (send_address, receive_address) = match &config.addressing {
            crate::config::Addressing::Queue => (
                EntityAddress::Queue(entity.clone()),
                EntityAddress::Queue(entity),
            ),
            crate::config::Addressing::Topic { subscription } => {
                let subscription = EntityName::new(subscription.clone())?;
                (
                    EntityAddress::Topic(entity.clone()),
                    EntityAddress::Subscription {
                        topic: entity,
                        subscription,
                    },
                )
            }
        };

        if send_address != receive_address {
            broker.ensure_entity(&send_address).await?;
        }
        let description = broker.ensure_entity(&receive_address).await?;
        let lease = description
            .lease
            .to_std()
            .map_err(|_| ConfigurationError::Invalid {
                message: format!("entity '{}' reports a non-positive lease", receive_address),
            })?;
        let renewal_interval = Duration::from_millis(lease.as_millis() as u64 * 8 / 10);
        if renewal_interval.is_zero() {
            return Err(ConfigurationError::Invalid {
                message: format!("entity '{}' lease is too short to renew", receive_address),
            }
            .into());
        }

        let sender = broker.create_sender(&send_address).await?;
        let receiver = broker.create_receiver(&receive_address).await?;
        info!(
            entity = %receive_address,
            lease_ms = lease.as_millis() as u64,
            renewal_ms = renewal_interval.as_millis() as u64,
            "adapter connected"
        );

        Ok(Self {
            shared: Arc::new(AdapterShared {
                send_address,
                receive_address,
                broker,
                sender: RwLock::new(sender),
                receiver: RwLock::new(receiver),
                renewal_interval,
                receive_batch_size: config.receive_batch_size,
                in_flight: Mutex::new(HashMap::new()),
            }),
            hub,
            retry: config.retry.clone(),
            poll_interval: config.poll_interval(),
            polling: Mutex::new(None),
            _marker: PhantomData,
        })
    }

    /// Serialize and send one message through the bounded retry policy.
    ///
    /// Every failed attempt rebuilds the sender before the next attempt or
    /// before the terminal failure surfaces; non-transient faults surface
    /// immediately.
    pub(crate) async fn send(&self, message: &T) -> Result<(), MessengerError> {
        let payload = encode(message)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.shared.current_sender().await.send(&payload).await {
                Ok(message_id) => {
                    debug!(%message_id, entity = %self.shared.send_address, "message sent");
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        attempt,
                        entity = %self.shared.send_address,
                        %err,
                        "send attempt failed"
                    );
                    self.shared.rebuild_sender().await;
                    if !err.is_transient() {
                        return Err(MessengerError::Broker(err));
                    }
                    if attempt >= self.retry.max_attempts {
                        return Err(MessengerError::RetriesExhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    tokio::time::sleep(self.retry.delay_before(attempt + 1)).await;
                }
            }
        }
    }

    /// Start the periodic poll loop; no-op if already polling
    pub(crate) async fn start_reading(&self) {
        let mut polling = self.polling.lock().await;
        if polling.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let hub = Arc::clone(&self.hub);
        let poll_interval = self.poll_interval;
        debug!(entity = %shared.receive_address, "poll loop started");
        *polling = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                poll_once::<T>(&shared, &hub).await;
            }
        }));
    }

    /// Cancel the poll loop. Already-delivered messages stay tracked and
    /// must still be resolved by the caller.
    pub(crate) async fn stop_reading(&self) {
        if let Some(handle) = self.polling.lock().await.take() {
            handle.abort();
            debug!(entity = %self.shared.receive_address, "poll loop stopped");
        }
    }

    /// Renew the lease for a tracked delivery immediately, then keep it
    /// renewed on a periodic timer until the record is resolved.
    ///
    /// Re-entrant: repeated calls renew immediately but install no second
    /// timer.
    pub(crate) async fn lock(&self, token: &DeliveryToken) -> Result<(), MessengerError> {
        let (receipt, has_timer) = {
            let in_flight = self.shared.in_flight.lock().await;
            let record = in_flight
                .get(token)
                .ok_or_else(|| MessengerError::UnknownMessage {
                    token: token.clone(),
                })?;
            (record.receipt.clone(), record.renewal.is_some())
        };

        self.shared.current_receiver().await.renew_lock(&receipt).await?;

        if !has_timer {
            let timer = self.shared.spawn_renewal(token.clone(), receipt);
            let mut in_flight = self.shared.in_flight.lock().await;
            match in_flight.get_mut(token) {
                Some(record) if record.renewal.is_none() => record.renewal = Some(timer),
                // Resolved (or locked concurrently) in the meantime.
                _ => timer.abort(),
            }
        }
        Ok(())
    }

    /// Acknowledge and remove a delivery; released only once the broker call
    /// succeeds
    pub(crate) async fn complete(&self, token: &DeliveryToken) -> Result<(), MessengerError> {
        self.resolve(token, TerminalOp::Complete).await
    }

    /// Return a delivery to the entity; released only once the broker call
    /// succeeds
    pub(crate) async fn abandon(&self, token: &DeliveryToken) -> Result<(), MessengerError> {
        self.resolve(token, TerminalOp::Abandon).await
    }

    /// Dead-letter a delivery.
    ///
    /// The in-flight record is released before the broker call resolves, so
    /// a dead-letter failure never leaks tracking state; the failure is
    /// still returned to the caller.
    pub(crate) async fn error(
        &self,
        token: &DeliveryToken,
        reason: &str,
    ) -> Result<(), MessengerError> {
        let record = self.shared.in_flight.lock().await.remove(token).ok_or_else(|| {
            MessengerError::UnknownMessage {
                token: token.clone(),
            }
        })?;
        if let Some(timer) = record.renewal {
            timer.abort();
        }

        let receiver = self.shared.current_receiver().await;
        match receiver.dead_letter(&record.receipt, reason).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(%token, %err, "dead-letter failed; in-flight record already released");
                Err(MessengerError::Broker(err))
            }
        }
    }

    async fn resolve(&self, token: &DeliveryToken, op: TerminalOp) -> Result<(), MessengerError> {
        // The record stays in the table for the duration of the broker call:
        // a renewal tick landing mid-call must still find its token, or the
        // timer exits and a failed resolution is left unrenewed.
        let receipt = {
            let in_flight = self.shared.in_flight.lock().await;
            in_flight
                .get(token)
                .map(|record| record.receipt.clone())
                .ok_or_else(|| MessengerError::UnknownMessage {
                    token: token.clone(),
                })?
        };

        let receiver = self.shared.current_receiver().await;
        let outcome = match op {
            TerminalOp::Complete => receiver.complete(&receipt).await,
            TerminalOp::Abandon => receiver.abandon(&receipt).await,
        };
        match outcome {
            Ok(()) => {
                if let Some(record) = self.shared.in_flight.lock().await.remove(token) {
                    if let Some(timer) = record.renewal {
                        timer.abort();
                    }
                }
                debug!(%token, ?op, "delivery resolved");
                Ok(())
            }
            // Record and renewal timer are untouched, so the caller can
            // retry or escalate.
            Err(err) => Err(MessengerError::Broker(err)),
        }
    }

    #[cfg(test)]
    pub(crate) async fn in_flight_len(&self) -> usize {
        self.shared.in_flight.lock().await.len()
    }
}

#[derive(Debug, Clone, Copy)]
enum TerminalOp {
    Complete,
    Abandon,
}

#[async_trait]
impl<T: BusMessage> AdapterControl for Adapter<T> {
    /// Stop polling, cancel all renewal timers, and close both handles
    async fn shutdown(&self) {
        self.stop_reading().await;

        let records: Vec<InFlightRecord> = {
            let mut in_flight = self.shared.in_flight.lock().await;
            in_flight.drain().map(|(_, record)| record).collect()
        };
        for record in records {
            if let Some(timer) = record.renewal {
                timer.abort();
            }
        }

        if let Err(err) = self.shared.current_sender().await.close().await {
            debug!(entity = %self.shared.send_address, %err, "sender close failed");
        }
        if let Err(err) = self.shared.current_receiver().await.close().await {
            debug!(entity = %self.shared.receive_address, %err, "receiver close failed");
        }
        info!(entity = %self.shared.receive_address, "adapter shut down");
    }
}
