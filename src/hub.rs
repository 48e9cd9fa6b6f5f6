//! In-process fan-out hub.
//!
//! One hub is shared by every adapter. It keys both the single-subscriber
//! registry and the observer channels by runtime type tag (`TypeId`), so
//! dispatch never depends on value equality or a broadcast-then-filter pass.

use crate::error::MessengerError;
use crate::message::{BusMessage, Delivery};
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Buffered capacity of each per-type observer channel
const OBSERVER_CHANNEL_CAPACITY: usize = 64;

/// Callback invoked for every delivered message of one type.
///
/// At most one handler per message type may be registered at a time; the
/// handler receives the decoded body together with the delivery token it
/// needs for `lock`/`complete`/`abandon`/`error`.
#[async_trait]
pub trait MessageHandler<T: BusMessage>: Send + Sync {
    async fn handle(&self, delivery: Delivery<T>);
}

/// Type-keyed registry of handlers and observer channels
pub(crate) struct FanoutHub {
    handlers: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    observers: RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl FanoutHub {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            observers: RwLock::new(HashMap::new()),
        }
    }

    /// Bind the single handler for `T`.
    ///
    /// Fails with `DuplicateSubscription` if one is already bound, leaving
    /// the existing registration untouched.
    pub(crate) async fn bind<T: BusMessage>(
        &self,
        handler: Arc<dyn MessageHandler<T>>,
    ) -> Result<(), MessengerError> {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&TypeId::of::<T>()) {
            return Err(MessengerError::DuplicateSubscription {
                type_label: T::type_label().to_string(),
            });
        }
        handlers.insert(TypeId::of::<T>(), Box::new(handler));
        Ok(())
    }

    /// Remove the handler for `T`, if any
    pub(crate) async fn unbind<T: BusMessage>(&self) -> bool {
        self.handlers
            .write()
            .await
            .remove(&TypeId::of::<T>())
            .is_some()
    }

    /// Subscribe a new observer channel for `T`.
    ///
    /// Observers are unlimited and independent of the single-handler
    /// invariant; every call returns a fresh receiver, which is what makes
    /// observed streams restartable.
    pub(crate) async fn observer_channel<T: BusMessage>(&self) -> broadcast::Receiver<T> {
        let mut observers = self.observers.write().await;
        let entry = observers
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(broadcast::channel::<T>(OBSERVER_CHANNEL_CAPACITY).0));
        match entry.downcast_ref::<broadcast::Sender<T>>() {
            Some(sender) => sender.subscribe(),
            // Unreachable: entries are only ever inserted under their own TypeId.
            None => broadcast::channel::<T>(OBSERVER_CHANNEL_CAPACITY).1,
        }
    }

    /// Publish one delivery to the bound handler and to all observers
    pub(crate) async fn publish<T: BusMessage>(&self, delivery: Delivery<T>) {
        {
            let observers = self.observers.read().await;
            if let Some(entry) = observers.get(&TypeId::of::<T>()) {
                if let Some(sender) = entry.downcast_ref::<broadcast::Sender<T>>() {
                    // A send error just means no observer is currently listening.
                    let _ = sender.send(delivery.body.clone());
                }
            }
        }

        let handler = {
            let handlers = self.handlers.read().await;
            handlers
                .get(&TypeId::of::<T>())
                .and_then(|entry| entry.downcast_ref::<Arc<dyn MessageHandler<T>>>())
                .map(Arc::clone)
        };
        if let Some(handler) = handler {
            tokio::spawn(async move {
                handler.handle(delivery).await;
            });
        }
    }

    /// Check whether a handler for `T` is bound
    #[cfg(test)]
    pub(crate) async fn is_bound<T: BusMessage>(&self) -> bool {
        self.handlers.read().await.contains_key(&TypeId::of::<T>())
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
