//! Domain layer
//!
//! - `models`: instances, documents, class/index declarations, options
//! - `query`: query conditions
//! - `events`: lifecycle notifications and observers
//! - `ports`: the storage engine contract

pub mod events;
pub mod models;
pub mod ports;
pub mod query;

pub use events::{EventBus, StoreEvent, StoreObserver};
pub use models::{
    ClassDeclaration, ClassedInstance, CollectionSpec, CountOptions, DeleteOptions, Document,
    FindOptions, ForEachOptions, GetManyOptions, GetOptions, IndexDeclaration, IndexKey,
    IndexSpec, Instance, PutOptions, DEFAULT_BATCH_SIZE,
};
pub use ports::{run_transaction, EngineHandle, EngineTransaction, StorageEngine};
pub use query::{Condition, Query};
