//! The dispatcher façade.
//!
//! [`Messenger`] owns one lazily constructed [`Adapter`](crate::adapter) per
//! message type, the shared in-process fan-out hub, and the single-subscriber
//! registry. It routes typed sends, subscriptions, and lifecycle calls to the
//! right adapter; all broker interaction lives below it.

use crate::adapter::{Adapter, AdapterControl};
use crate::broker::BrokerClient;
use crate::config::MessengerConfig;
use crate::error::MessengerError;
use crate::hub::{FanoutHub, MessageHandler};
use crate::message::{BusMessage, DeliveryToken};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

#[cfg(test)]
#[path = "messenger_tests.rs"]
mod tests;

/// One registered adapter: the typed handle plus its type-erased control
/// surface for teardown
struct AdapterEntry {
    typed: Arc<dyn Any + Send + Sync>,
    control: Arc<dyn AdapterControl>,
}

/// Typed messaging client over one broker connection.
///
/// Exactly one adapter is ever constructed per message type; adapters are
/// created lazily on first use and live until [`Messenger::close`].
pub struct Messenger {
    broker: Arc<dyn BrokerClient>,
    config: MessengerConfig,
    hub: Arc<FanoutHub>,
    adapters: RwLock<HashMap<TypeId, AdapterEntry>>,
}

impl Messenger {
    /// Create a messenger over the given broker client
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        config: MessengerConfig,
    ) -> Result<Self, MessengerError> {
        config.validate()?;
        Ok(Self {
            broker,
            config,
            hub: Arc::new(FanoutHub::new()),
            adapters: RwLock::new(HashMap::new()),
        })
    }

    /// Send one message to its type's entity.
    ///
    /// Fails with `RetriesExhausted` once the adapter's bounded retry policy
    /// is spent.
    pub async fn send<T: BusMessage>(&self, message: &T) -> Result<(), MessengerError> {
        let adapter = self.adapter::<T>().await?;
        adapter.send(message).await
    }

    /// Register the single handler for `T` and start delivering to it.
    ///
    /// Fails with `DuplicateSubscription` if a handler for `T` is already
    /// registered, without touching the existing registration.
    pub async fn subscribe<T: BusMessage>(
        &self,
        handler: Arc<dyn MessageHandler<T>>,
    ) -> Result<(), MessengerError> {
        self.hub.bind::<T>(handler).await?;
        match self.adapter::<T>().await {
            Ok(adapter) => {
                adapter.start_reading().await;
                Ok(())
            }
            Err(err) => {
                self.hub.unbind::<T>().await;
                Err(err)
            }
        }
    }

    /// Stop polling for `T` and unregister its handler.
    ///
    /// Messages already delivered and mid-handling are untouched and can
    /// still be completed, abandoned, or errored.
    pub async fn cancel_receive<T: BusMessage>(&self) -> Result<(), MessengerError> {
        self.hub.unbind::<T>().await;
        if let Some(adapter) = self.try_adapter::<T>().await {
            adapter.stop_reading().await;
        }
        debug!(type_label = T::type_label(), "receive cancelled");
        Ok(())
    }

    /// Start polling for `T` (if not already) and return a live stream of
    /// delivered values.
    ///
    /// Unlike [`subscribe`](Self::subscribe), any number of observers may
    /// coexist per type, and each call returns a fresh, restartable stream.
    pub async fn observe<T: BusMessage>(&self) -> Result<BroadcastStream<T>, MessengerError> {
        let adapter = self.adapter::<T>().await?;
        adapter.start_reading().await;
        let receiver = self.hub.observer_channel::<T>().await;
        Ok(BroadcastStream::new(receiver))
    }

    /// Renew the lease for a delivery now and keep renewing it periodically
    /// until it is resolved
    pub async fn lock<T: BusMessage>(&self, token: &DeliveryToken) -> Result<(), MessengerError> {
        self.tracked_adapter::<T>(token).await?.lock(token).await
    }

    /// Acknowledge and remove a delivery
    pub async fn complete<T: BusMessage>(
        &self,
        token: &DeliveryToken,
    ) -> Result<(), MessengerError> {
        self.tracked_adapter::<T>(token).await?.complete(token).await
    }

    /// Return a delivery to its entity for redelivery
    pub async fn abandon<T: BusMessage>(
        &self,
        token: &DeliveryToken,
    ) -> Result<(), MessengerError> {
        self.tracked_adapter::<T>(token).await?.abandon(token).await
    }

    /// Move a delivery to its entity's dead-letter store
    pub async fn error<T: BusMessage>(
        &self,
        token: &DeliveryToken,
        reason: &str,
    ) -> Result<(), MessengerError> {
        self.tracked_adapter::<T>(token).await?.error(token, reason).await
    }

    /// Stop all polling, cancel outstanding renewal timers, and close every
    /// adapter's handles
    pub async fn close(&self) {
        let entries: Vec<AdapterEntry> = {
            let mut adapters = self.adapters.write().await;
            adapters.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.control.shutdown().await;
        }
        debug!("messenger closed");
    }

    /// Get or lazily construct the adapter for `T`.
    ///
    /// Unguarded fast-path read for the common already-initialized case; on
    /// miss, the write lock is taken and re-checked before constructing, so
    /// exactly one adapter per type is ever built.
    async fn adapter<T: BusMessage>(&self) -> Result<Arc<Adapter<T>>, MessengerError> {
        if let Some(adapter) = self.try_adapter::<T>().await {
            return Ok(adapter);
        }

        let mut adapters = self.adapters.write().await;
        if let Some(entry) = adapters.get(&TypeId::of::<T>()) {
            return Ok(downcast_adapter::<T>(entry));
        }

        let adapter = Arc::new(
            Adapter::<T>::connect(
                Arc::clone(&self.broker),
                Arc::clone(&self.hub),
                &self.config,
            )
            .await?,
        );
        adapters.insert(
            TypeId::of::<T>(),
            AdapterEntry {
                typed: Arc::clone(&adapter) as Arc<dyn Any + Send + Sync>,
                control: Arc::clone(&adapter) as Arc<dyn AdapterControl>,
            },
        );
        Ok(adapter)
    }

    async fn try_adapter<T: BusMessage>(&self) -> Option<Arc<Adapter<T>>> {
        let adapters = self.adapters.read().await;
        adapters.get(&TypeId::of::<T>()).map(downcast_adapter::<T>)
    }

    /// Adapter lookup for lifecycle calls: an absent adapter means the token
    /// cannot be tracked
    async fn tracked_adapter<T: BusMessage>(
        &self,
        token: &DeliveryToken,
    ) -> Result<Arc<Adapter<T>>, MessengerError> {
        self.try_adapter::<T>()
            .await
            .ok_or_else(|| MessengerError::UnknownMessage {
                token: token.clone(),
            })
    }

    #[cfg(test)]
    pub(crate) async fn adapter_count(&self) -> usize {
        self.adapters.read().await.len()
    }
}

fn downcast_adapter<T: BusMessage>(entry: &AdapterEntry) -> Arc<Adapter<T>> {
    Arc::clone(&entry.typed)
        .downcast::<Adapter<T>>()
        .expect("adapter registered under a foreign TypeId")
}
