//! Lifecycle Manager
//!
//! `Uninitialized → Initializing → Initialized`, driven lazily by the first
//! storage operation. Setup is single-flight per store: concurrent callers
//! wait on the same run and then find the store initialized.
//!
//! The metadata record `{name, version}` lives in `STORE_COLLECTION` under
//! the store name. Creating it happens inside one engine transaction;
//! upgrading an existing record happens under the engine's store-wide lock.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{
    run_transaction, EngineHandle, EventBus, GetOptions, Instance, PutOptions, StorageEngine,
    StoreEvent,
};
use crate::error::{Result, StorageError};

/// Persisted layout version written by this build
pub const CURRENT_VERSION: u64 = 1;

/// Collection holding metadata records
pub const STORE_COLLECTION: &str = "$Store";

/// Layout migration from `from` to `from + 1`
#[derive(Clone, Copy)]
pub(crate) struct UpgradeStep {
    pub from: u64,
    pub apply: for<'a> fn(&'a dyn StorageEngine) -> BoxFuture<'a, Result<()>>,
}

/// Version 1 is the first persisted layout, nothing upgrades into it yet.
const UPGRADE_STEPS: &[UpgradeStep] = &[];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Initialized,
}

/// Metadata record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub name: String,
    pub version: u64,
}

impl StoreMetadata {
    fn to_instance(&self) -> Result<Instance> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(StorageError::serialization(
                "Store metadata must serialize to an object",
            )),
        }
    }

    fn from_instance(instance: Instance) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(instance))?)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<LifecycleState>,
    initialized: AtomicBool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Uninitialized),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(AtomicOrdering::Acquire)
    }

    /// Current state; `Initializing` while a run holds the lock
    pub fn state(&self) -> LifecycleState {
        match self.state.try_lock() {
            Ok(state) => *state,
            Err(_) => LifecycleState::Initializing,
        }
    }

    /// Run setup unless already done
    ///
    /// On failure the state returns to `Uninitialized` so a later call can
    /// retry.
    pub async fn ensure_initialized(
        &self,
        name: &str,
        engine: &dyn StorageEngine,
        events: &EventBus,
    ) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        if *state == LifecycleState::Initialized {
            return Ok(());
        }

        *state = LifecycleState::Initializing;
        let outcome = self.run(name, engine, events).await;
        match outcome {
            Ok(()) => {
                *state = LifecycleState::Initialized;
                self.initialized.store(true, AtomicOrdering::Release);
                info!("Store '{}' initialized (version {})", name, CURRENT_VERSION);
                events.emit(StoreEvent::DidInitialize);
                Ok(())
            }
            Err(err) => {
                *state = LifecycleState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Forget initialization, e.g. after the engine data was destroyed
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        *state = LifecycleState::Uninitialized;
        self.initialized.store(false, AtomicOrdering::Release);
    }

    async fn run(&self, name: &str, engine: &dyn StorageEngine, events: &EventBus) -> Result<()> {
        engine.initialize(events).await?;

        if create_metadata(name, engine).await? {
            info!("Store '{}' created (version {})", name, CURRENT_VERSION);
            events.emit(StoreEvent::Created {
                name: name.to_string(),
                version: CURRENT_VERSION,
            });
            return Ok(());
        }

        engine.lock().await?;
        let upgraded = upgrade(name, engine, events, UPGRADE_STEPS, CURRENT_VERSION).await;
        let unlocked = engine.unlock().await;
        upgraded?;
        unlocked
    }
}

/// Create the metadata record if absent; returns whether it was created
async fn create_metadata(name: &str, engine: &dyn StorageEngine) -> Result<bool> {
    run_transaction(engine, move |transaction| async move {
        let existing = transaction
            .get(STORE_COLLECTION, name, GetOptions::allow_missing())
            .await?;
        if existing.is_some() {
            return Ok(false);
        }

        let record = StoreMetadata {
            name: name.to_string(),
            version: CURRENT_VERSION,
        };
        transaction
            .put(
                STORE_COLLECTION,
                name,
                record.to_instance()?,
                PutOptions::create_only(),
            )
            .await?;
        Ok(true)
    })
    .await
}

async fn load_metadata(name: &str, handle: &dyn EngineHandle) -> Result<StoreMetadata> {
    let document = handle
        .get(STORE_COLLECTION, name, GetOptions::default())
        .await?
        .ok_or_else(|| StorageError::not_found(STORE_COLLECTION, name))?;
    StoreMetadata::from_instance(document.value)
}

/// Bring the metadata record at `name` to version `target`
async fn upgrade(
    name: &str,
    engine: &dyn StorageEngine,
    events: &EventBus,
    steps: &[UpgradeStep],
    target: u64,
) -> Result<()> {
    let record = load_metadata(name, engine.as_handle()).await?;

    match record.version.cmp(&target) {
        Ordering::Equal => {
            debug!("Store '{}' is up to date (version {})", name, record.version);
            Ok(())
        }
        Ordering::Greater => Err(StorageError::lifecycle(format!(
            "Store '{}' has version {}, newer than supported version {}",
            name, record.version, target
        ))),
        Ordering::Less => {
            let from = record.version;
            info!("Upgrading store '{}' from version {} to {}", name, from, target);
            events.emit(StoreEvent::WillUpgrade { from, to: target });

            let mut version = from;
            while version < target {
                let step = steps
                    .iter()
                    .find(|step| step.from == version)
                    .ok_or_else(|| {
                        StorageError::lifecycle(format!(
                            "No upgrade path from store version {} to {}",
                            version, target
                        ))
                    })?;
                (step.apply)(engine).await?;
                version += 1;
                debug!("Store '{}' upgraded to version {}", name, version);
            }

            let record = StoreMetadata {
                name: name.to_string(),
                version,
            };
            engine
                .put(
                    STORE_COLLECTION,
                    name,
                    record.to_instance()?,
                    PutOptions::update_only(),
                )
                .await?;

            events.emit(StoreEvent::DidUpgrade { from, to: version });
            Ok(())
        }
    }
}
