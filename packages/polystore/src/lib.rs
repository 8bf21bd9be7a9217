//! polystore - Polymorphic class-tagged instance storage
//!
//! Instances belong to one or more named classes and all live in a single
//! engine collection. Each class gets a membership index `<Class>?`, and every
//! index declared on a class is prefixed with it, so class-scoped queries are
//! ordinary indexed queries.
//!
//! # Architecture
//! ```text
//! application/ (Store facade, lifecycle, index compiler, tagger)
//!           ↓
//! domain/ (models, queries, events, engine ports)
//!           ↓
//! infrastructure/ (MemoryEngine, SqliteEngine)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use polystore::{ClassDeclaration, FindOptions, GetOptions, PutOptions, Store, StoreConfig};
//!
//! let store = Store::open(
//!     StoreConfig::new("accounts", "sqlite:accounts.db")
//!         .with_class(ClassDeclaration::new("Account"))
//!         .with_class(ClassDeclaration::new("Person").with_index("country")),
//! )?;
//!
//! store.put(&["Account", "Person"], "mvila", &instance, PutOptions::default()).await?;
//! let person = store.get("Person", "mvila", GetOptions::default()).await?;
//! let people = store.find("Person", FindOptions::new().order_by(["country"])).await?;
//! ```

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use application::{LifecycleState, Store, CURRENT_VERSION};
pub use config::{EngineLocator, StoreConfig};

pub use domain::{
    ClassDeclaration, ClassedInstance, Condition, CountOptions, DeleteOptions, Document,
    EventBus, FindOptions, ForEachOptions, GetManyOptions, GetOptions, IndexDeclaration,
    IndexKey, IndexSpec, Instance, PutOptions, Query, StoreEvent, StoreObserver,
    DEFAULT_BATCH_SIZE,
};
pub use domain::{EngineHandle, EngineTransaction, StorageEngine};

pub use infrastructure::MemoryEngine;

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteEngine;
