//! Store configuration
//!
//! A store is described by its name, the connection locator of its engine
//! and its class declarations. Configurations load from YAML or JSON:
//!
//! ```yaml
//! name: accounts
//! url: sqlite:/var/lib/accounts.db
//! classes:
//!   - name: Account
//!   - name: Person
//!     indexes: [accountNumber, country]
//!   - name: Company
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::application::index_compiler::instances_collection;
use crate::application::lifecycle::STORE_COLLECTION;
use crate::application::tagger::validate_class_name;
use crate::domain::{ClassDeclaration, CollectionSpec};
use crate::error::{Result, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub classes: Vec<ClassDeclaration>,
}

impl StoreConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            classes: Vec::new(),
        }
    }

    pub fn with_class(mut self, class: ClassDeclaration) -> Self {
        self.classes.push(class);
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| StorageError::config(format!("JSON error: {}", err)).with_source(err))
    }

    /// Reject empty names/urls and empty or duplicate class names
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(StorageError::validation("Store name must be a non-empty string"));
        }
        if self.url.trim().is_empty() {
            return Err(StorageError::validation("Store url must be a non-empty string"));
        }

        let mut seen = HashSet::new();
        for class in &self.classes {
            validate_class_name(&class.name)?;
            if !seen.insert(class.name.as_str()) {
                return Err(StorageError::validation(format!(
                    "Class '{}' is declared more than once",
                    class.name
                )));
            }
        }
        Ok(())
    }

    /// Engine collections: the metadata collection and the instances
    /// collection with its compiled indexes
    pub fn collections(&self) -> Vec<CollectionSpec> {
        vec![
            CollectionSpec::new(STORE_COLLECTION),
            instances_collection(&self.classes),
        ]
    }

    pub fn locator(&self) -> Result<EngineLocator> {
        EngineLocator::parse(&self.url)
    }
}

/// Parsed connection locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLocator {
    /// `memory:`
    Memory,
    /// `sqlite:<path>`
    Sqlite(PathBuf),
}

impl EngineLocator {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url.split_once(':').ok_or_else(|| {
            StorageError::validation(format!("Store url '{}' has no scheme", url))
        })?;

        match scheme {
            "memory" => Ok(EngineLocator::Memory),
            "sqlite" if !rest.is_empty() => Ok(EngineLocator::Sqlite(PathBuf::from(rest))),
            "sqlite" => Err(StorageError::validation(format!(
                "Store url '{}' is missing a database path",
                url
            ))),
            other => Err(StorageError::validation(format!(
                "Unsupported store url scheme '{}' (expected memory: or sqlite:)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for EngineLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineLocator::Memory => write!(f, "memory:"),
            EngineLocator::Sqlite(path) => write!(f, "sqlite:{}", path.display()),
        }
    }
}
