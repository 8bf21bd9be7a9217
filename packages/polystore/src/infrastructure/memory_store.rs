//! In-Memory Engine
//!
//! Ordered maps per collection, for tests and `memory:` stores.
//! Transactions buffer writes in an overlay that only the transaction sees;
//! commit applies it atomically, rollback or drop discards it.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Semaphore;
use tracing::debug;

use super::eval::{self, ComputedKeys};
use crate::domain::{
    CollectionSpec, CountOptions, DeleteOptions, Document, EngineHandle, EngineTransaction,
    EventBus, FindOptions, GetOptions, Instance, PutOptions, Query, StorageEngine, StoreEvent,
};
use crate::error::{Result, StorageError};

type Collection = BTreeMap<String, Instance>;
type Collections = HashMap<String, Collection>;
type Overlay = BTreeMap<(String, String), Option<Instance>>;

struct MemoryShared {
    collections: HashMap<String, CollectionSpec>,
    computed: HashMap<String, ComputedKeys>,
    data: RwLock<Collections>,
    migrated: AtomicBool,
    closed: AtomicBool,
    lock: Semaphore,
}

impl MemoryShared {
    fn read(&self) -> Result<RwLockReadGuard<'_, Collections>> {
        self.ensure_open()?;
        self.data
            .read()
            .map_err(|_| StorageError::database("Memory engine lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Collections>> {
        self.ensure_open()?;
        self.data
            .write()
            .map_err(|_| StorageError::database("Memory engine lock poisoned"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::database("Memory engine is closed"));
        }
        Ok(())
    }

    fn computed(&self, collection: &str) -> &ComputedKeys {
        static EMPTY: std::sync::OnceLock<ComputedKeys> = std::sync::OnceLock::new();
        self.computed
            .get(collection)
            .unwrap_or_else(|| EMPTY.get_or_init(ComputedKeys::new))
    }

    /// Log the index serving a query, or that none does
    fn plan(&self, collection: &str, query: &Query, order: &[String]) {
        if query.is_empty() && order.is_empty() {
            return;
        }
        let indexes = self
            .collections
            .get(collection)
            .map(|spec| spec.indexes.as_slice())
            .unwrap_or(&[]);
        match eval::select_index(indexes, query, order) {
            Some(index) => debug!("{}: query served by index '{}'", collection, index.name),
            None => debug!("{}: unindexed query", collection),
        }
    }
}

fn fetch(
    document: Option<&Instance>,
    collection: &str,
    key: &str,
    options: GetOptions,
) -> Result<Option<Document>> {
    match document {
        Some(value) => Ok(Some(Document::new(key, value.clone()))),
        None if options.error_if_missing => Err(StorageError::not_found(collection, key)),
        None => Ok(None),
    }
}

fn count_matches(documents: Option<&Collection>, query: &Query, computed: &ComputedKeys) -> usize {
    documents.map_or(0, |documents| {
        documents
            .values()
            .filter(|value| eval::matches_query(value, query, computed))
            .count()
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Root Engine
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct MemoryEngine {
    shared: Arc<MemoryShared>,
}

impl MemoryEngine {
    pub fn new(collections: Vec<CollectionSpec>) -> Self {
        let computed = collections
            .iter()
            .map(|spec| (spec.name.clone(), spec.computed_keys()))
            .collect();
        let collections = collections
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();

        Self {
            shared: Arc::new(MemoryShared {
                collections,
                computed,
                data: RwLock::new(HashMap::new()),
                migrated: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                lock: Semaphore::new(1),
            }),
        }
    }

    /// Whether the store-wide lock is currently free
    pub fn is_unlocked(&self) -> bool {
        self.shared.lock.available_permits() == 1
    }

    /// Name of the declared index that would serve a query
    pub fn explain(&self, collection: &str, query: &Query, order: &[String]) -> Option<String> {
        let spec = self.shared.collections.get(collection)?;
        eval::select_index(&spec.indexes, query, order).map(|index| index.name.clone())
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl EngineHandle for MemoryEngine {
    async fn get(
        &self,
        collection: &str,
        key: &str,
        options: GetOptions,
    ) -> Result<Option<Document>> {
        let data = self.shared.read()?;
        let document = data.get(collection).and_then(|docs| docs.get(key));
        fetch(document, collection, key, options)
    }

    async fn put(
        &self,
        collection: &str,
        key: &str,
        value: Instance,
        options: PutOptions,
    ) -> Result<()> {
        let mut data = self.shared.write()?;
        let documents = data.entry(collection.to_string()).or_default();
        options.check(documents.contains_key(key), collection, key)?;
        documents.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str, options: DeleteOptions) -> Result<bool> {
        let mut data = self.shared.write()?;
        let removed = data
            .get_mut(collection)
            .and_then(|documents| documents.remove(key))
            .is_some();
        if !removed && options.error_if_missing {
            return Err(StorageError::not_found(collection, key));
        }
        Ok(removed)
    }

    async fn find(&self, collection: &str, options: &FindOptions) -> Result<Vec<Document>> {
        self.shared.plan(collection, &options.query, &options.order);
        let data = self.shared.read()?;
        let computed = self.shared.computed(collection);
        Ok(data
            .get(collection)
            .map(|documents| eval::execute(documents, options, computed))
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str, options: &CountOptions) -> Result<usize> {
        self.shared.plan(collection, &options.query, &[]);
        let data = self.shared.read()?;
        Ok(count_matches(
            data.get(collection),
            &options.query,
            self.shared.computed(collection),
        ))
    }

    async fn find_and_delete(&self, collection: &str, options: &FindOptions) -> Result<usize> {
        self.shared.plan(collection, &options.query, &options.order);
        let mut data = self.shared.write()?;
        let computed = self.shared.computed(collection);
        let Some(documents) = data.get_mut(collection) else {
            return Ok(0);
        };

        let matches = eval::execute(&*documents, options, computed);
        for document in &matches {
            documents.remove(&document.key);
        }
        Ok(matches.len())
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    fn as_handle(&self) -> &dyn EngineHandle {
        self
    }

    async fn initialize(&self, events: &EventBus) -> Result<()> {
        self.shared.ensure_open()?;
        if self.shared.migrated.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut names: Vec<&String> = self.shared.collections.keys().collect();
        names.sort();
        let mut data = self.shared.write()?;
        for name in names {
            events.emit(StoreEvent::WillMigrate {
                collection: name.clone(),
            });
            data.entry(name.clone()).or_default();
            debug!("Created in-memory collection '{}'", name);
            events.emit(StoreEvent::DidMigrate {
                collection: name.clone(),
            });
        }
        Ok(())
    }

    async fn destroy_all(&self) -> Result<()> {
        self.shared.write()?.clear();
        self.shared.migrated.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shared.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn lock(&self) -> Result<()> {
        self.shared
            .lock
            .acquire()
            .await
            .map_err(|_| StorageError::database("Memory engine lock closed"))?
            .forget();
        Ok(())
    }

    async fn unlock(&self) -> Result<()> {
        if self.shared.lock.available_permits() == 0 {
            self.shared.lock.add_permits(1);
        }
        Ok(())
    }

    async fn begin(&self) -> Result<Arc<dyn EngineTransaction>> {
        self.shared.ensure_open()?;
        debug!("Memory transaction started");
        Ok(Arc::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            overlay: Mutex::new(Some(Overlay::new())),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Transactions
// ═══════════════════════════════════════════════════════════════════════════

pub struct MemoryTransaction {
    shared: Arc<MemoryShared>,
    overlay: Mutex<Option<Overlay>>,
}

impl MemoryTransaction {
    fn with_overlay<T>(&self, f: impl FnOnce(&mut Overlay) -> Result<T>) -> Result<T> {
        let mut guard = self
            .overlay
            .lock()
            .map_err(|_| StorageError::transaction("Transaction state poisoned"))?;
        match guard.as_mut() {
            Some(overlay) => f(overlay),
            None => Err(StorageError::transaction("Transaction already finished")),
        }
    }

    fn take_overlay(&self) -> Result<Overlay> {
        self.overlay
            .lock()
            .map_err(|_| StorageError::transaction("Transaction state poisoned"))?
            .take()
            .ok_or_else(|| StorageError::transaction("Transaction already finished"))
    }

    /// Committed document, shadowed by this transaction's own writes
    fn lookup(&self, collection: &str, key: &str) -> Result<Option<Instance>> {
        let pending = self.with_overlay(|overlay| {
            Ok(overlay
                .get(&(collection.to_string(), key.to_string()))
                .cloned())
        })?;
        match pending {
            Some(value) => Ok(value),
            None => Ok(self
                .shared
                .read()?
                .get(collection)
                .and_then(|documents| documents.get(key))
                .cloned()),
        }
    }

    /// Committed collection merged with this transaction's writes
    fn view(&self, collection: &str) -> Result<Collection> {
        let mut view = self
            .shared
            .read()?
            .get(collection)
            .cloned()
            .unwrap_or_default();
        self.with_overlay(|overlay| {
            for ((name, key), value) in overlay.iter() {
                if name != collection {
                    continue;
                }
                match value {
                    Some(value) => view.insert(key.clone(), value.clone()),
                    None => view.remove(key),
                };
            }
            Ok(())
        })?;
        Ok(view)
    }

    fn stage(&self, collection: &str, key: &str, value: Option<Instance>) -> Result<()> {
        self.with_overlay(|overlay| {
            overlay.insert((collection.to_string(), key.to_string()), value);
            Ok(())
        })
    }
}

#[async_trait]
impl EngineHandle for MemoryTransaction {
    async fn get(
        &self,
        collection: &str,
        key: &str,
        options: GetOptions,
    ) -> Result<Option<Document>> {
        let document = self.lookup(collection, key)?;
        fetch(document.as_ref(), collection, key, options)
    }

    async fn put(
        &self,
        collection: &str,
        key: &str,
        value: Instance,
        options: PutOptions,
    ) -> Result<()> {
        let exists = self.lookup(collection, key)?.is_some();
        options.check(exists, collection, key)?;
        self.stage(collection, key, Some(value))
    }

    async fn delete(&self, collection: &str, key: &str, options: DeleteOptions) -> Result<bool> {
        let exists = self.lookup(collection, key)?.is_some();
        if !exists {
            if options.error_if_missing {
                return Err(StorageError::not_found(collection, key));
            }
            return Ok(false);
        }
        self.stage(collection, key, None)?;
        Ok(true)
    }

    async fn find(&self, collection: &str, options: &FindOptions) -> Result<Vec<Document>> {
        self.shared.plan(collection, &options.query, &options.order);
        let view = self.view(collection)?;
        Ok(eval::execute(&view, options, self.shared.computed(collection)))
    }

    async fn count(&self, collection: &str, options: &CountOptions) -> Result<usize> {
        self.shared.plan(collection, &options.query, &[]);
        let view = self.view(collection)?;
        Ok(count_matches(
            Some(&view),
            &options.query,
            self.shared.computed(collection),
        ))
    }

    async fn find_and_delete(&self, collection: &str, options: &FindOptions) -> Result<usize> {
        let matches = self.find(collection, options).await?;
        for document in &matches {
            self.stage(collection, &document.key, None)?;
        }
        Ok(matches.len())
    }
}

#[async_trait]
impl EngineTransaction for MemoryTransaction {
    fn as_handle(&self) -> &dyn EngineHandle {
        self
    }

    async fn commit(&self) -> Result<()> {
        let overlay = self.take_overlay()?;
        let mut data = self.shared.write()?;
        let writes = overlay.len();
        for ((collection, key), value) in overlay {
            let documents = data.entry(collection).or_default();
            match value {
                Some(value) => documents.insert(key, value),
                None => documents.remove(&key),
            };
        }
        debug!("Memory transaction committed ({} writes)", writes);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let overlay = self.take_overlay()?;
        debug!("Memory transaction rolled back ({} writes discarded)", overlay.len());
        Ok(())
    }
}
