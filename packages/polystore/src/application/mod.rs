//! Application layer
//!
//! - `index_compiler`: class declarations → index declarations
//! - `tagger`: class list attach/split
//! - `lifecycle`: create/upgrade sequencing of the metadata record
//! - `store`: the operation facade and transaction contexts

pub mod index_compiler;
pub mod lifecycle;
pub mod store;
pub mod tagger;

pub use index_compiler::{
    compile_indexes, instances_collection, membership_key, CLASSES_FIELD, INSTANCES_COLLECTION,
};
pub use lifecycle::{Lifecycle, LifecycleState, StoreMetadata, CURRENT_VERSION, STORE_COLLECTION};
pub use store::{Store, YIELD_INTERVAL};
