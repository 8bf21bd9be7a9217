//! Storage Domain Models
//!
//! - `Instance`: caller payload (property name → JSON value)
//! - `Document`: what an engine stores under a key
//! - `ClassedInstance`: a read result split into classes, key and instance
//! - Class and index declarations consumed by the index compiler and engines
//! - Per-operation option records

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::query::Query;
use crate::error::{Result, StorageError};

/// Caller-supplied payload. No structure is assumed beyond being JSON.
pub type Instance = Map<String, Value>;

/// Default page size used by `for_each`
pub const DEFAULT_BATCH_SIZE: usize = 250;

// ═══════════════════════════════════════════════════════════════════════════
// Documents
// ═══════════════════════════════════════════════════════════════════════════

/// A keyed document as stored by an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub key: String,
    pub value: Instance,
}

impl Document {
    pub fn new(key: impl Into<String>, value: Instance) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Read result of the store facade
///
/// The reserved class field is never part of `instance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassedInstance {
    pub classes: Vec<String>,
    pub key: String,
    pub instance: Instance,
}

impl ClassedInstance {
    pub fn is_member_of(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Class & Index Declarations
// ═══════════════════════════════════════════════════════════════════════════

/// Secondary index entry of a class declaration
///
/// Accepts a single property name, an ordered list of property names, or
/// `{properties, projection}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexSpec {
    Property(String),
    Properties(Vec<String>),
    Detailed {
        properties: Vec<String>,
        #[serde(default)]
        projection: Option<Vec<String>>,
    },
}

impl IndexSpec {
    /// Indexed properties in declaration order
    pub fn properties(&self) -> Vec<String> {
        match self {
            IndexSpec::Property(property) => vec![property.clone()],
            IndexSpec::Properties(properties) => properties.clone(),
            IndexSpec::Detailed { properties, .. } => properties.clone(),
        }
    }

    pub fn projection(&self) -> Option<&[String]> {
        match self {
            IndexSpec::Detailed {
                projection: Some(projection),
                ..
            } => Some(projection),
            _ => None,
        }
    }
}

impl From<&str> for IndexSpec {
    fn from(property: &str) -> Self {
        IndexSpec::Property(property.to_string())
    }
}

impl From<String> for IndexSpec {
    fn from(property: String) -> Self {
        IndexSpec::Property(property)
    }
}

impl From<Vec<String>> for IndexSpec {
    fn from(properties: Vec<String>) -> Self {
        IndexSpec::Properties(properties)
    }
}

impl From<Vec<&str>> for IndexSpec {
    fn from(properties: Vec<&str>) -> Self {
        IndexSpec::Properties(properties.into_iter().map(String::from).collect())
    }
}

/// A class: a label plus the secondary indexes declared for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDeclaration {
    pub name: String,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl ClassDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: impl Into<IndexSpec>) -> Self {
        self.indexes.push(index.into());
        self
    }
}

/// One key segment of an engine index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    /// Plain (possibly dotted) property path
    Property(String),
    /// Computed boolean: `true` when the array at `field` contains `member`,
    /// absent otherwise. Queryable under `name`.
    Membership {
        name: String,
        field: String,
        member: String,
    },
}

impl IndexKey {
    /// Name under which the key is queried and ordered
    pub fn name(&self) -> &str {
        match self {
            IndexKey::Property(path) => path,
            IndexKey::Membership { name, .. } => name,
        }
    }
}

/// Index descriptor handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDeclaration {
    pub name: String,
    pub keys: Vec<IndexKey>,
    pub projection: Option<Vec<String>>,
}

/// A physical collection and its index declarations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub indexes: Vec<IndexDeclaration>,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    pub fn with_indexes(mut self, indexes: Vec<IndexDeclaration>) -> Self {
        self.indexes = indexes;
        self
    }

    /// Computed keys declared by this collection's indexes, by query name
    pub fn computed_keys(&self) -> HashMap<String, IndexKey> {
        self.indexes
            .iter()
            .flat_map(|index| index.keys.iter())
            .filter(|key| matches!(key, IndexKey::Membership { .. }))
            .map(|key| (key.name().to_string(), key.clone()))
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Operation Options
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    pub error_if_missing: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            error_if_missing: true,
        }
    }
}

impl GetOptions {
    pub fn allow_missing() -> Self {
        Self {
            error_if_missing: false,
        }
    }
}

/// Put semantics
///
/// Default is create-or-replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    pub create_if_missing: bool,
    pub error_if_exists: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
        }
    }
}

impl PutOptions {
    /// Insert only: fail when the key already exists
    pub fn create_only() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: true,
        }
    }

    /// Replace only: fail when the key does not exist
    pub fn update_only() -> Self {
        Self {
            create_if_missing: false,
            error_if_exists: false,
        }
    }

    /// Check these options against whether `key` already exists
    pub fn check(&self, exists: bool, collection: &str, key: &str) -> Result<()> {
        if exists && self.error_if_exists {
            return Err(StorageError::already_exists(collection, key));
        }
        if !exists && !self.create_if_missing {
            return Err(StorageError::not_found(collection, key));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOptions {
    pub error_if_missing: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            error_if_missing: true,
        }
    }
}

impl DeleteOptions {
    pub fn allow_missing() -> Self {
        Self {
            error_if_missing: false,
        }
    }
}

/// Batch fetch semantics
///
/// Missing keys fail by default; with `error_if_missing = false` they are
/// skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetManyOptions {
    pub error_if_missing: bool,
}

impl Default for GetManyOptions {
    fn default() -> Self {
        Self {
            error_if_missing: true,
        }
    }
}

/// Query options shared by `find`, `for_each` and `find_and_delete`
///
/// Range bounds apply to the ascending `order` tuple and may be a prefix of
/// it. `start`/`end` are inclusive, `start_after`/`end_before` exclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub query: Query,
    pub order: Vec<String>,
    pub start: Option<Vec<Value>>,
    pub start_after: Option<Vec<Value>>,
    pub end: Option<Vec<Value>>,
    pub end_before: Option<Vec<Value>>,
    pub reverse: bool,
    pub properties: Option<Vec<String>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }

    pub fn order_by<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order = order.into_iter().map(Into::into).collect();
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn start(mut self, values: Vec<Value>) -> Self {
        self.start = Some(values);
        self
    }

    pub fn start_after(mut self, values: Vec<Value>) -> Self {
        self.start_after = Some(values);
        self
    }

    pub fn end(mut self, values: Vec<Value>) -> Self {
        self.end = Some(values);
        self
    }

    pub fn end_before(mut self, values: Vec<Value>) -> Self {
        self.end_before = Some(values);
        self
    }

    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = Some(properties.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Count options: a query without ordering or projection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountOptions {
    pub query: Query,
}

impl CountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, query: Query) -> Self {
        self.query = query;
        self
    }
}

impl From<&FindOptions> for CountOptions {
    fn from(options: &FindOptions) -> Self {
        Self {
            query: options.query.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForEachOptions {
    pub find: FindOptions,
    pub batch_size: usize,
}

impl Default for ForEachOptions {
    fn default() -> Self {
        Self {
            find: FindOptions::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ForEachOptions {
    pub fn new(find: FindOptions) -> Self {
        Self {
            find,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}
