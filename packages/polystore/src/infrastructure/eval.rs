//! Document evaluation shared by in-process engines
//!
//! Property lookup, computed index keys, a total order over JSON values,
//! condition matching, range bounds, projection, and index selection.

use serde_json::Value;
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

use crate::domain::{Condition, Document, FindOptions, IndexDeclaration, IndexKey, Instance, Query};

/// Computed keys of a collection, by query name
pub type ComputedKeys = HashMap<String, IndexKey>;

// ═══════════════════════════════════════════════════════════════════════════
// Property Resolution
// ═══════════════════════════════════════════════════════════════════════════

/// Follow a dotted path through nested objects
pub fn lookup_path<'a>(document: &'a Instance, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Value of an index key; a membership key is `true` or absent
pub fn evaluate_key(document: &Instance, key: &IndexKey) -> Option<Value> {
    match key {
        IndexKey::Property(path) => lookup_path(document, path).cloned(),
        IndexKey::Membership { field, member, .. } => {
            let is_member = lookup_path(document, field)
                .and_then(Value::as_array)
                .is_some_and(|values| values.iter().any(|v| v.as_str() == Some(member)));
            is_member.then_some(Value::Bool(true))
        }
    }
}

/// Resolve a query/order property against a document
pub fn resolve(document: &Instance, property: &str, computed: &ComputedKeys) -> Option<Value> {
    match computed.get(property) {
        Some(key) => evaluate_key(document, key),
        None => lookup_path(document, property).cloned(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Ordering
// ═══════════════════════════════════════════════════════════════════════════

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order: null < bool < number < string < array < object
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => {
                let a = a.as_f64().unwrap_or(f64::NAN);
                let b = b.as_f64().unwrap_or(f64::NAN);
                a.partial_cmp(&b).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => compare_tuples(a, b),
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Lexicographic order; a shorter equal prefix sorts first
pub fn compare_tuples(a: &[Value], b: &[Value]) -> Ordering {
    for (a, b) in a.iter().zip(b) {
        let ordering = compare_values(a, b);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

/// Compare only the first `bound.len()` segments of `tuple`
fn compare_prefix(tuple: &[Value], bound: &[Value]) -> Ordering {
    for (a, b) in tuple.iter().zip(bound) {
        let ordering = compare_values(a, b);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Order tuple of a document; missing values are null
pub fn order_tuple(document: &Instance, order: &[String], computed: &ComputedKeys) -> Vec<Value> {
    order
        .iter()
        .map(|property| resolve(document, property, computed).unwrap_or(Value::Null))
        .collect()
}

pub fn within_bounds(tuple: &[Value], options: &FindOptions) -> bool {
    if let Some(start) = &options.start {
        if compare_prefix(tuple, start) == Ordering::Less {
            return false;
        }
    }
    if let Some(start_after) = &options.start_after {
        if compare_prefix(tuple, start_after) != Ordering::Greater {
            return false;
        }
    }
    if let Some(end) = &options.end {
        if compare_prefix(tuple, end) == Ordering::Greater {
            return false;
        }
    }
    if let Some(end_before) = &options.end_before {
        if compare_prefix(tuple, end_before) != Ordering::Less {
            return false;
        }
    }
    true
}

// ═══════════════════════════════════════════════════════════════════════════
// Matching
// ═══════════════════════════════════════════════════════════════════════════

fn values_equal(value: Option<&Value>, expected: &Value) -> bool {
    match value {
        Some(value) => compare_values(value, expected) == Ordering::Equal,
        None => expected.is_null(),
    }
}

/// Range comparisons only hold between values of the same JSON type
fn compare_same_type(value: Option<&Value>, operand: &Value) -> Option<Ordering> {
    let value = value?;
    (rank(value) == rank(operand)).then(|| compare_values(value, operand))
}

pub fn matches_condition(value: Option<&Value>, condition: &Condition) -> bool {
    match condition {
        Condition::Eq(expected) => values_equal(value, expected),
        Condition::Ne(expected) => !values_equal(value, expected),
        Condition::Gt(operand) => compare_same_type(value, operand) == Some(Ordering::Greater),
        Condition::Gte(operand) => matches!(
            compare_same_type(value, operand),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Condition::Lt(operand) => compare_same_type(value, operand) == Some(Ordering::Less),
        Condition::Lte(operand) => matches!(
            compare_same_type(value, operand),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Condition::In(candidates) => candidates.iter().any(|c| values_equal(value, c)),
    }
}

pub fn matches_query(document: &Instance, query: &Query, computed: &ComputedKeys) -> bool {
    query.iter().all(|(property, condition)| {
        let value = resolve(document, property, computed);
        matches_condition(value.as_ref(), condition)
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Projection & Execution
// ═══════════════════════════════════════════════════════════════════════════

/// Keep only the top-level fields named by `properties`
pub fn project(document: Instance, properties: &[String]) -> Instance {
    document
        .into_iter()
        .filter(|(field, _)| {
            properties
                .iter()
                .any(|p| p.split('.').next() == Some(field.as_str()))
        })
        .collect()
}

/// Run a query over documents supplied in key order
pub fn execute<'a, I>(documents: I, options: &FindOptions, computed: &ComputedKeys) -> Vec<Document>
where
    I: IntoIterator<Item = (&'a String, &'a Instance)>,
{
    let mut matches: Vec<(Vec<Value>, &String, &Instance)> = documents
        .into_iter()
        .filter(|(_, value)| matches_query(value, &options.query, computed))
        .map(|(key, value)| (order_tuple(value, &options.order, computed), key, value))
        .filter(|(tuple, _, _)| within_bounds(tuple, options))
        .collect();

    matches.sort_by(|a, b| compare_tuples(&a.0, &b.0).then_with(|| a.1.cmp(b.1)));
    if options.reverse {
        matches.reverse();
    }

    matches
        .into_iter()
        .skip(options.offset.unwrap_or(0))
        .take(options.limit.unwrap_or(usize::MAX))
        .map(|(_, key, value)| {
            let value = match &options.properties {
                Some(properties) => project(value.clone(), properties),
                None => value.clone(),
            };
            Document::new(key.clone(), value)
        })
        .collect()
}

/// Pick the declared index serving a query best
///
/// An index qualifies when its leading keys are equality-constrained by the
/// query. Longer equality prefixes win; remaining keys matching the requested
/// order break ties.
pub fn select_index<'a>(
    indexes: &'a [IndexDeclaration],
    query: &Query,
    order: &[String],
) -> Option<&'a IndexDeclaration> {
    let equalities: Vec<&str> = query.equality_properties().collect();

    indexes
        .iter()
        .enumerate()
        .filter_map(|(position, index)| {
            let prefix = index
                .keys
                .iter()
                .take_while(|key| equalities.contains(&key.name()))
                .count();
            if prefix == 0 {
                return None;
            }
            let ordered = index.keys[prefix..]
                .iter()
                .zip(order)
                .take_while(|(key, property)| key.name() == property.as_str())
                .count();
            Some(((prefix, ordered, Reverse(position)), index))
        })
        .max_by_key(|(score, _)| *score)
        .map(|(_, index)| index)
}
