//! Class Tagger
//!
//! Attaches the class list to a payload on write and splits it back out on
//! read. Callers never see the reserved field.

use serde_json::Value;

use super::index_compiler::CLASSES_FIELD;
use crate::domain::{ClassedInstance, Document, Instance};
use crate::error::{Result, StorageError};

/// Reject empty class names and names with quotes, backslashes or control
/// characters
///
/// Engines match membership on the encoded class list, where those
/// characters are escaped.
pub fn validate_class_name(class: &str) -> Result<()> {
    if class.trim().is_empty() {
        return Err(StorageError::validation("Class name must be a non-empty string"));
    }
    if let Some(c) = class
        .chars()
        .find(|c| matches!(c, '"' | '\\') || c.is_control())
    {
        return Err(StorageError::validation(format!(
            "Class name {:?} contains the reserved character {:?}",
            class, c
        )));
    }
    Ok(())
}

/// Copy `instance` and attach `classes` under the reserved field
pub fn tag<C: AsRef<str>>(classes: &[C], instance: &Instance) -> Result<Instance> {
    if classes.is_empty() {
        return Err(StorageError::validation(
            "Classes must be a non-empty list of class names",
        ));
    }

    let mut names = Vec::with_capacity(classes.len());
    for class in classes {
        let class = class.as_ref();
        validate_class_name(class)?;
        names.push(Value::String(class.to_string()));
    }

    let mut document = instance.clone();
    document.insert(CLASSES_FIELD.to_string(), Value::Array(names));
    Ok(document)
}

/// Split a stored document into `{classes, key, instance}`
pub fn untag(document: Document) -> Result<ClassedInstance> {
    let Document { key, value } = document;
    let mut instance = value;

    let classes = match instance.remove(CLASSES_FIELD) {
        Some(Value::Array(values)) => values
            .into_iter()
            .map(|value| match value {
                Value::String(class) => Ok(class),
                other => Err(StorageError::serialization(format!(
                    "Document '{}' has a non-string class entry: {}",
                    key, other
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        _ => {
            return Err(StorageError::serialization(format!(
                "Document '{}' has no class list",
                key
            )))
        }
    };

    Ok(ClassedInstance {
        classes,
        key,
        instance,
    })
}

/// `untag`, failing with `Membership` when `class` is not in the class list
pub fn untag_member(class: &str, document: Document) -> Result<ClassedInstance> {
    let classed = untag(document)?;
    if !classed.is_member_of(class) {
        return Err(StorageError::membership(class, &classed.key));
    }
    Ok(classed)
}
