//! Query conditions
//!
//! A `Query` is a conjunction of per-property conditions. Property names are
//! dotted paths into the document or the name of a computed index key (for
//! example the class membership key `Person?`).

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Result, StorageError};

/// Single comparison on a property
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
}

impl Condition {
    fn from_operator(operator: &str, operand: &Value) -> Result<Self> {
        let condition = match operator {
            "$eq" => Condition::Eq(operand.clone()),
            "$ne" => Condition::Ne(operand.clone()),
            "$gt" => Condition::Gt(operand.clone()),
            "$gte" => Condition::Gte(operand.clone()),
            "$lt" => Condition::Lt(operand.clone()),
            "$lte" => Condition::Lte(operand.clone()),
            "$in" => match operand {
                Value::Array(values) => Condition::In(values.clone()),
                _ => {
                    return Err(StorageError::validation(
                        "Query operator '$in' expects an array",
                    ))
                }
            },
            other => {
                return Err(StorageError::validation(format!(
                    "Unknown query operator '{}'",
                    other
                )))
            }
        };
        Ok(condition)
    }
}

/// Conjunction of property conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: BTreeMap<String, Vec<Condition>>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON query object
    ///
    /// `{"country": "France", "age": {"$gte": 18, "$lt": 65}}`. A nested
    /// object whose keys all start with `$` is read as operators, any other
    /// value is an equality match.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = match value {
            Value::Object(object) => object,
            Value::Null => return Ok(Self::new()),
            _ => return Err(StorageError::validation("Query must be a JSON object")),
        };

        let mut query = Self::new();
        for (property, condition) in object {
            match condition {
                Value::Object(operators)
                    if !operators.is_empty() && operators.keys().all(|k| k.starts_with('$')) =>
                {
                    for (operator, operand) in operators {
                        query = query.and(property, Condition::from_operator(operator, operand)?);
                    }
                }
                other => query = query.eq(property, other.clone()),
            }
        }
        Ok(query)
    }

    /// Replace every condition on `property` with `condition`
    pub fn set(mut self, property: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(property.into(), vec![condition]);
        self
    }

    /// Add `condition` next to existing conditions on `property`
    pub fn and(mut self, property: impl Into<String>, condition: Condition) -> Self {
        self.conditions
            .entry(property.into())
            .or_default()
            .push(condition);
        self
    }

    pub fn eq(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(property, Condition::Eq(value.into()))
    }

    pub fn ne(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(property, Condition::Ne(value.into()))
    }

    pub fn gt(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(property, Condition::Gt(value.into()))
    }

    pub fn gte(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(property, Condition::Gte(value.into()))
    }

    pub fn lt(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(property, Condition::Lt(value.into()))
    }

    pub fn lte(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(property, Condition::Lte(value.into()))
    }

    pub fn any_of(self, property: impl Into<String>, values: Vec<Value>) -> Self {
        self.and(property, Condition::In(values))
    }

    pub fn conditions(&self, property: &str) -> &[Condition] {
        self.conditions
            .get(property)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.conditions.iter().flat_map(|(property, conditions)| {
            conditions.iter().map(move |c| (property.as_str(), c))
        })
    }

    /// Properties constrained by equality
    pub fn equality_properties(&self) -> impl Iterator<Item = &str> {
        self.conditions
            .iter()
            .filter(|(_, conditions)| conditions.iter().any(|c| matches!(c, Condition::Eq(_))))
            .map(|(property, _)| property.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conditions.values().map(Vec::len).sum()
    }
}
