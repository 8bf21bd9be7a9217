//! Lifecycle notifications
//!
//! Observers register on the store and receive every notification
//! synchronously, in emission order.

use std::sync::{Arc, PoisonError, RwLock};

/// Fixed set of lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Metadata record written for the first time
    Created { name: String, version: u64 },
    WillUpgrade { from: u64, to: u64 },
    DidUpgrade { from: u64, to: u64 },
    /// Engine is about to create collections or indexes (pass-through)
    WillMigrate { collection: String },
    DidMigrate { collection: String },
    DidInitialize,
}

impl StoreEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreEvent::Created { .. } => "created",
            StoreEvent::WillUpgrade { .. } => "will-upgrade",
            StoreEvent::DidUpgrade { .. } => "did-upgrade",
            StoreEvent::WillMigrate { .. } => "will-migrate",
            StoreEvent::DidMigrate { .. } => "did-migrate",
            StoreEvent::DidInitialize => "did-initialize",
        }
    }
}

pub trait StoreObserver: Send + Sync {
    fn on_event(&self, event: &StoreEvent);
}

impl<F> StoreObserver for F
where
    F: Fn(&StoreEvent) + Send + Sync,
{
    fn on_event(&self, event: &StoreEvent) {
        self(event)
    }
}

/// Observer registry owned by a store and shared with its engine
#[derive(Default)]
pub struct EventBus {
    observers: RwLock<Vec<Arc<dyn StoreObserver>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn StoreObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn emit(&self, event: StoreEvent) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_event(&event);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .observers
            .read()
            .map(|observers| observers.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("observers", &count).finish()
    }
}
