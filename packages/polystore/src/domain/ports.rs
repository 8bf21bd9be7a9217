//! Storage Engine Ports (Trait Interface)
//!
//! The document-store engine is an external collaborator. These traits are
//! the fixed contract the store consumes:
//! - `EngineHandle`: keyed storage and queries (root or transactional)
//! - `StorageEngine`: lifecycle, store-wide lock, transaction entry
//! - `EngineTransaction`: a transactional handle with commit/rollback

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use super::events::EventBus;
use super::models::{
    CountOptions, DeleteOptions, Document, FindOptions, GetManyOptions, GetOptions, Instance,
    PutOptions,
};
use crate::error::{Result, StorageError};

/// Keyed storage and query surface
///
/// Implemented by the root engine and by every transaction handle.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Keyed Storage
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Get a document by key
    ///
    /// Returns `Ok(None)` for a missing key only when `error_if_missing` is
    /// false, otherwise fails with `NotFound`.
    async fn get(&self, collection: &str, key: &str, options: GetOptions)
        -> Result<Option<Document>>;

    /// Store a document
    ///
    /// - key exists and `error_if_exists`: `AlreadyExists`
    /// - key missing and not `create_if_missing`: `NotFound`
    async fn put(
        &self,
        collection: &str,
        key: &str,
        value: Instance,
        options: PutOptions,
    ) -> Result<()>;

    /// Delete a document, returning whether one was removed
    async fn delete(&self, collection: &str, key: &str, options: DeleteOptions) -> Result<bool>;

    /// Fetch several documents in key-list order
    async fn get_many(
        &self,
        collection: &str,
        keys: &[String],
        options: GetManyOptions,
    ) -> Result<Vec<Document>> {
        let get_options = GetOptions {
            error_if_missing: options.error_if_missing,
        };
        let mut documents = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(document) = self.get(collection, key, get_options).await? {
                documents.push(document);
            }
        }
        Ok(documents)
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Queries
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn find(&self, collection: &str, options: &FindOptions) -> Result<Vec<Document>>;

    async fn count(&self, collection: &str, options: &CountOptions) -> Result<usize>;

    /// Delete every match, returning the number deleted
    async fn find_and_delete(&self, collection: &str, options: &FindOptions) -> Result<usize>;

    /// Stream query results, fetching `batch_size` documents per page
    fn scan<'a>(
        &'a self,
        collection: &'a str,
        options: FindOptions,
        batch_size: usize,
    ) -> BoxStream<'a, Result<Document>> {
        let batch_size = batch_size.max(1);
        let remaining = options.limit;

        stream::try_unfold(Some((options, remaining)), move |state| async move {
            let Some((mut options, remaining)) = state else {
                return Ok::<_, StorageError>(None);
            };
            let page_size = remaining.map_or(batch_size, |r| r.min(batch_size));
            if page_size == 0 {
                return Ok(None);
            }

            let offset = options.offset.unwrap_or(0);
            let mut page_options = options.clone();
            page_options.limit = Some(page_size);
            let page = self.find(collection, &page_options).await?;

            let fetched = page.len();
            options.offset = Some(offset + fetched);
            let next = if fetched < page_size {
                None
            } else {
                Some((options, remaining.map(|r| r - fetched)))
            };
            Ok::<_, StorageError>(Some((page, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Document, StorageError>)))
        .try_flatten()
        .boxed()
    }
}

/// Root engine: lifecycle, lock and transactions
#[async_trait]
pub trait StorageEngine: EngineHandle {
    fn as_handle(&self) -> &dyn EngineHandle;

    /// Create collections and indexes
    ///
    /// Emits `WillMigrate`/`DidMigrate` through `events` when anything new
    /// is created.
    async fn initialize(&self, events: &EventBus) -> Result<()>;

    /// Remove every collection and document
    async fn destroy_all(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Acquire the store-wide exclusive lock
    async fn lock(&self) -> Result<()>;

    async fn unlock(&self) -> Result<()>;

    /// Open a transaction
    ///
    /// Writes through the handle become visible to other handles only after
    /// `commit`. Dropping an uncommitted handle discards its writes.
    async fn begin(&self) -> Result<Arc<dyn EngineTransaction>>;
}

#[async_trait]
pub trait EngineTransaction: EngineHandle {
    fn as_handle(&self) -> &dyn EngineHandle;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;
}

/// Engine transaction primitive
///
/// Runs `f` with a fresh transactional handle; commits when `f` returns
/// `Ok`, rolls back and propagates the error otherwise.
pub async fn run_transaction<F, Fut, T>(engine: &dyn StorageEngine, f: F) -> Result<T>
where
    F: FnOnce(Arc<dyn EngineTransaction>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let transaction = engine.begin().await?;
    match f(Arc::clone(&transaction)).await {
        Ok(value) => {
            transaction.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = transaction.rollback().await {
                warn!(
                    "Transaction rollback failed after error ({}): {}",
                    err, rollback_err
                );
            }
            Err(err)
        }
    }
}
