//! Store facade
//!
//! A `Store` is a context value: shared configuration (classes, compiled
//! indexes, lifecycle, observers, engine) plus the active storage handle.
//! The root context routes calls to the engine itself; `transaction`
//! produces a fresh context routed through a transaction handle, with the
//! same operation surface.
//!
//! Every class-scoped query gets the membership condition `{"<Class>?": true}`
//! injected, so it is served by the class's compiled index.

use futures::TryStreamExt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use super::index_compiler::{
    compile_indexes, membership_key, CLASSES_FIELD, INSTANCES_COLLECTION,
};
use super::lifecycle::{Lifecycle, LifecycleState};
use super::tagger::{tag, untag, untag_member, validate_class_name};
use crate::config::{EngineLocator, StoreConfig};
use crate::domain::{
    run_transaction, ClassedInstance, CountOptions, DeleteOptions, EngineHandle,
    EngineTransaction, EventBus, FindOptions, ForEachOptions, GetManyOptions, GetOptions,
    IndexDeclaration, Instance, PutOptions, StorageEngine, StoreObserver,
};
use crate::error::{Result, StorageError};
use crate::infrastructure::MemoryEngine;

#[cfg(feature = "sqlite")]
use crate::infrastructure::SqliteEngine;

/// Items processed between cooperative yields during batch traversal
pub const YIELD_INTERVAL: usize = 100;

async fn yield_point(processed: usize) {
    if processed % YIELD_INTERVAL == 0 {
        tokio::task::yield_now().await;
    }
}

struct StoreShared {
    config: StoreConfig,
    engine: Arc<dyn StorageEngine>,
    indexes: Vec<IndexDeclaration>,
    lifecycle: Lifecycle,
    events: EventBus,
}

#[derive(Clone)]
enum ActiveHandle {
    Root,
    Transaction(Arc<dyn EngineTransaction>),
}

#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
    active: ActiveHandle,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.shared.config.name)
            .field("url", &self.shared.config.url)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

impl Store {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Construction
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Open a store on the engine named by `config.url`
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let engine: Arc<dyn StorageEngine> = match config.locator()? {
            EngineLocator::Memory => Arc::new(MemoryEngine::new(config.collections())),
            #[cfg(feature = "sqlite")]
            EngineLocator::Sqlite(path) => {
                Arc::new(SqliteEngine::open(path, config.collections())?)
            }
            #[cfg(not(feature = "sqlite"))]
            EngineLocator::Sqlite(_) => {
                return Err(StorageError::config(
                    "sqlite: urls require the 'sqlite' feature",
                ))
            }
        };
        Self::with_engine(config, engine)
    }

    /// Open a store on a caller-supplied engine
    ///
    /// The engine should have been built with `config.collections()`.
    pub fn with_engine(config: StoreConfig, engine: Arc<dyn StorageEngine>) -> Result<Self> {
        config.validate()?;
        let indexes = compile_indexes(&config.classes);
        debug!(
            "Store '{}' compiled {} indexes for {} classes",
            config.name,
            indexes.len(),
            config.classes.len()
        );

        Ok(Self {
            shared: Arc::new(StoreShared {
                config,
                engine,
                indexes,
                lifecycle: Lifecycle::new(),
                events: EventBus::new(),
            }),
            active: ActiveHandle::Root,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Index declarations compiled from the class declarations
    pub fn indexes(&self) -> &[IndexDeclaration] {
        &self.shared.indexes
    }

    pub fn subscribe(&self, observer: Arc<dyn StoreObserver>) {
        self.shared.events.subscribe(observer);
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Lifecycle & Context
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn in_transaction(&self) -> bool {
        matches!(self.active, ActiveHandle::Transaction(_))
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.lifecycle.is_initialized()
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.shared.lifecycle.state()
    }

    /// Run initialization now instead of on first use
    pub async fn initialize(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(StorageError::usage(
                "Cannot initialize a store inside a transaction",
            ));
        }
        self.ensure_initialized().await
    }

    async fn ensure_initialized(&self) -> Result<()> {
        // A transaction context only exists once the root is initialized
        if self.in_transaction() {
            return Ok(());
        }
        self.shared
            .lifecycle
            .ensure_initialized(
                &self.shared.config.name,
                self.shared.engine.as_ref(),
                &self.shared.events,
            )
            .await
    }

    fn handle(&self) -> &dyn EngineHandle {
        match &self.active {
            ActiveHandle::Root => self.shared.engine.as_handle(),
            ActiveHandle::Transaction(transaction) => transaction.as_handle(),
        }
    }

    /// Run `f` with a transaction-scoped store
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. Inside a
    /// transaction, `f` runs on the current context: transactions do not
    /// nest.
    pub async fn transaction<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Store) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.in_transaction() {
            return f(self.clone()).await;
        }

        self.ensure_initialized().await?;
        let shared = Arc::clone(&self.shared);
        run_transaction(self.shared.engine.as_ref(), move |transaction| {
            f(Store {
                shared,
                active: ActiveHandle::Transaction(transaction),
            })
        })
        .await
    }

    /// Drop every collection and document; the next operation initializes
    /// the store again
    pub async fn destroy_all(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(StorageError::usage(
                "Cannot destroy a store inside a transaction",
            ));
        }
        self.shared.engine.destroy_all().await?;
        self.shared.lifecycle.reset().await;
        info!("Store '{}' destroyed", self.shared.config.name);
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(StorageError::usage(
                "Cannot close a store inside a transaction",
            ));
        }
        self.shared.engine.close().await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Keyed Operations
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Fetch `key` as a member of `class`
    ///
    /// `Ok(None)` only when the key is missing and `error_if_missing` is
    /// false. Fails with `Membership` when the instance is not a `class`.
    pub async fn get(
        &self,
        class: &str,
        key: &str,
        options: GetOptions,
    ) -> Result<Option<ClassedInstance>> {
        validate_class_name(class)?;
        self.ensure_initialized().await?;

        self.handle()
            .get(INSTANCES_COLLECTION, key, options)
            .await?
            .map(|document| untag_member(class, document))
            .transpose()
    }

    /// Store `instance` under `key`, tagged with `classes`
    pub async fn put<C: AsRef<str>>(
        &self,
        classes: &[C],
        key: &str,
        instance: &Instance,
        options: PutOptions,
    ) -> Result<()> {
        let document = tag(classes, instance)?;
        self.ensure_initialized().await?;

        self.handle()
            .put(INSTANCES_COLLECTION, key, document, options)
            .await
    }

    /// Delete `key` if it is a `class`, returning whether it was deleted
    ///
    /// Fetch, membership check and delete run in one transaction.
    pub async fn delete(&self, class: &str, key: &str, options: DeleteOptions) -> Result<bool> {
        validate_class_name(class)?;

        self.transaction(|store| async move {
            let get_options = GetOptions {
                error_if_missing: options.error_if_missing,
            };
            let Some(document) = store
                .handle()
                .get(INSTANCES_COLLECTION, key, get_options)
                .await?
            else {
                return Ok(false);
            };
            untag_member(class, document)?;

            let deleted = store
                .handle()
                .delete(INSTANCES_COLLECTION, key, DeleteOptions::default())
                .await?;
            debug!("Deleted {} '{}'", class, key);
            Ok(deleted)
        })
        .await
    }

    /// Fetch several keys, all of which must be members of `class`
    pub async fn get_many(
        &self,
        class: &str,
        keys: &[String],
        options: GetManyOptions,
    ) -> Result<Vec<ClassedInstance>> {
        validate_class_name(class)?;
        self.ensure_initialized().await?;

        let documents = self
            .handle()
            .get_many(INSTANCES_COLLECTION, keys, options)
            .await?;

        let mut results = Vec::with_capacity(documents.len());
        for document in documents {
            results.push(untag_member(class, document)?);
            yield_point(results.len()).await;
        }
        Ok(results)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Class-Scoped Queries
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn find(&self, class: &str, options: FindOptions) -> Result<Vec<ClassedInstance>> {
        let options = scope_to_class(class, options)?;
        self.ensure_initialized().await?;

        let documents = self.handle().find(INSTANCES_COLLECTION, &options).await?;

        let mut results = Vec::with_capacity(documents.len());
        for document in documents {
            results.push(untag(document)?);
            yield_point(results.len()).await;
        }
        Ok(results)
    }

    pub async fn count(&self, class: &str, options: CountOptions) -> Result<usize> {
        validate_class_name(class)?;
        let options = CountOptions {
            query: options.query.eq(membership_key(class), true),
        };
        self.ensure_initialized().await?;

        self.handle().count(INSTANCES_COLLECTION, &options).await
    }

    /// Call `f` once per match, in query order
    ///
    /// Results are fetched `batch_size` at a time. An error from `f` stops
    /// the traversal and is returned.
    pub async fn for_each<F, Fut>(
        &self,
        class: &str,
        options: ForEachOptions,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(ClassedInstance) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let find = scope_to_class(class, options.find)?;
        self.ensure_initialized().await?;

        let mut documents = self
            .handle()
            .scan(INSTANCES_COLLECTION, find, options.batch_size);
        let mut processed = 0;
        while let Some(document) = documents.try_next().await? {
            f(untag(document)?).await?;
            processed += 1;
            yield_point(processed).await;
        }
        Ok(())
    }

    /// Delete every match, returning how many were deleted
    pub async fn find_and_delete(&self, class: &str, options: FindOptions) -> Result<usize> {
        let options = scope_to_class(class, options)?;
        self.ensure_initialized().await?;

        let deleted = self
            .handle()
            .find_and_delete(INSTANCES_COLLECTION, &options)
            .await?;
        debug!("Deleted {} {} instances", deleted, class);
        Ok(deleted)
    }
}

/// Inject the membership condition and keep the class field in projections
fn scope_to_class(class: &str, mut options: FindOptions) -> Result<FindOptions> {
    validate_class_name(class)?;
    options.query = options.query.eq(membership_key(class), true);
    if let Some(properties) = options.properties.as_mut() {
        if !properties.iter().any(|p| p == CLASSES_FIELD) {
            properties.push(CLASSES_FIELD.to_string());
        }
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClassDeclaration, Condition, Query, StoreEvent};
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::sync::Mutex;

    fn config() -> StoreConfig {
        StoreConfig::new("accounts", "memory:")
            .with_class(ClassDeclaration::new("Account"))
            .with_class(
                ClassDeclaration::new("Person")
                    .with_index("accountNumber")
                    .with_index("country"),
            )
            .with_class(ClassDeclaration::new("Company"))
    }

    fn instance(value: serde_json::Value) -> Instance {
        value.as_object().cloned().unwrap()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Construction Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[test]
    fn test_open_validates_config() {
        let err = Store::open(StoreConfig::new("", "memory:")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        let err = Store::open(StoreConfig::new("accounts", "redis:")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn test_indexes_compiled_once() {
        let store = Store::open(config()).unwrap();
        let names: Vec<_> = store.indexes().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Account?",
                "Person?",
                "Person?+accountNumber",
                "Person?+country",
                "Company?"
            ]
        );
    }

    #[test]
    fn test_scope_to_class() {
        let options = FindOptions::new()
            .with_query(Query::new().eq("country", "France"))
            .with_properties(["firstName"]);
        let scoped = scope_to_class("Person", options).unwrap();

        assert_eq!(
            scoped.query.conditions("Person?"),
            &[Condition::Eq(json!(true))]
        );
        assert_eq!(scoped.query.conditions("country").len(), 1);
        assert_eq!(
            scoped.properties,
            Some(vec!["firstName".to_string(), CLASSES_FIELD.to_string()])
        );
        assert!(scope_to_class("", FindOptions::new()).is_err());
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Operation Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_operations_initialize_lazily() {
        let store = Store::open(config()).unwrap();
        assert!(!store.is_initialized());
        assert_eq!(store.lifecycle_state(), LifecycleState::Uninitialized);

        store
            .get("Person", "nobody", GetOptions::allow_missing())
            .await
            .unwrap();
        assert!(store.is_initialized());
        assert_eq!(store.lifecycle_state(), LifecycleState::Initialized);
    }

    #[tokio::test]
    async fn test_class_name_validation() {
        let store = Store::open(config()).unwrap();
        let empty: [&str; 0] = [];

        assert_eq!(
            store
                .get("", "k", GetOptions::default())
                .await
                .unwrap_err()
                .kind,
            ErrorKind::Validation
        );
        assert_eq!(
            store
                .put(&empty, "k", &Instance::new(), PutOptions::default())
                .await
                .unwrap_err()
                .kind,
            ErrorKind::Validation
        );
        assert_eq!(
            store.count(" ", CountOptions::new()).await.unwrap_err().kind,
            ErrorKind::Validation
        );
        // Validation fails before initialization is attempted
        assert!(!store.is_initialized());
    }

    #[tokio::test]
    async fn test_projection_keeps_classes() {
        let store = Store::open(config()).unwrap();
        store
            .put(
                &["Person"],
                "mvila",
                &instance(json!({"firstName": "Manuel", "country": "France"})),
                PutOptions::default(),
            )
            .await
            .unwrap();

        let found = store
            .find("Person", FindOptions::new().with_properties(["firstName"]))
            .await
            .unwrap();
        assert_eq!(found[0].classes, vec!["Person"]);
        assert_eq!(found[0].instance, instance(json!({"firstName": "Manuel"})));
    }

    #[tokio::test]
    async fn test_for_each_callback_error_stops_traversal() {
        let store = Store::open(config()).unwrap();
        for key in ["a", "b", "c"] {
            store
                .put(&["Company"], key, &Instance::new(), PutOptions::default())
                .await
                .unwrap();
        }

        let visited = Mutex::new(Vec::new());
        let err = store
            .for_each("Company", ForEachOptions::default().with_batch_size(1), |item| {
                visited.lock().unwrap().push(item.key.clone());
                let stop = item.key == "b";
                async move {
                    if stop {
                        return Err(StorageError::validation("stop"));
                    }
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(*visited.lock().unwrap(), vec!["a", "b"]);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Context Tests
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test]
    async fn test_transaction_context_rules() {
        let store = Store::open(config()).unwrap();
        assert!(!store.in_transaction());

        store
            .transaction(|tx| async move {
                assert!(tx.in_transaction());
                assert_eq!(
                    tx.initialize().await.unwrap_err().kind,
                    ErrorKind::Usage
                );
                assert_eq!(tx.destroy_all().await.unwrap_err().kind, ErrorKind::Usage);

                // Reentrant calls share the outer context
                tx.transaction(|inner| async move {
                    assert!(inner.in_transaction());
                    inner
                        .put(&["Account"], "k", &Instance::new(), PutOptions::default())
                        .await
                })
                .await?;
                assert!(tx.get("Account", "k", GetOptions::default()).await.is_ok());
                Ok(())
            })
            .await
            .unwrap();

        assert!(store.get("Account", "k", GetOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_all_resets_lifecycle() {
        let store = Store::open(config()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.subscribe(Arc::new(move |event: &StoreEvent| {
            sink.lock().unwrap().push(event.kind());
        }));

        store
            .put(&["Account"], "k", &Instance::new(), PutOptions::default())
            .await
            .unwrap();
        store.destroy_all().await.unwrap();
        assert!(!store.is_initialized());

        assert!(store
            .get("Account", "k", GetOptions::allow_missing())
            .await
            .unwrap()
            .is_none());
        let created = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|kind| **kind == "created")
            .count();
        assert_eq!(created, 2);
    }
}
