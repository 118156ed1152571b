//! Generic N-way bucketing of keyed values against per-key lists of limits.
//!
//! The balancing strategies use this to split nodes into under and over
//! utilized sets, but nothing in here knows about nodes: values, limits and
//! classifier predicates are all supplied by the caller.

pub mod normalizer;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ClassifyError {
    /// Each classifier operates over a limit, so the amount of classifiers
    /// must match the amount of limits.
    #[error("amount of limits must match the amount of classifiers")]
    LimitsMismatch,
    #[error("limit for {0} not found")]
    LimitNotFound(String),
}

/// A classifier evaluates a value against a limit and returns true if the
/// value matches the classifier intent.
pub type Classifier<V> = Box<dyn Fn(&V, &V) -> Result<bool, ClassifyError>>;

/// Classifies values into one bucket per classifier. The classifier at
/// position n evaluates the limit at position n; the first classifier to
/// return true captures the value and the walk stops for that key. Values
/// matched by no classifier appear in no bucket, as do values whose key has
/// no limit entry at all.
pub fn classify<K, V>(
    values: &HashMap<K, V>,
    limits: &HashMap<K, Vec<V>>,
    classifiers: &[Classifier<V>],
) -> Result<Vec<HashMap<K, V>>, ClassifyError>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    let count = classifiers.len();
    if limits.values().any(|limit| limit.len() != count) {
        return Err(ClassifyError::LimitsMismatch);
    }

    let mut result: Vec<HashMap<K, V>> = (0..count).map(|_| HashMap::new()).collect();

    for (key, usage) in values {
        let Some(key_limits) = limits.get(key) else {
            continue;
        };
        for (i, limit) in key_limits.iter().enumerate() {
            if classifiers[i](usage, limit)? {
                result[i].insert(key.clone(), usage.clone());
                break;
            }
        }
    }

    Ok(result)
}

/// Lifts a scalar comparator to a classifier over maps. The returned
/// classifier matches only when the comparator orders every candidate entry
/// strictly below its limit, and fails when a candidate key has no
/// corresponding limit entry.
pub fn for_map<K, V, C>(cmp: C) -> Classifier<HashMap<K, V>>
where
    K: Eq + Hash + Display + 'static,
    V: 'static,
    C: Fn(&V, &V) -> Ordering + 'static,
{
    Box::new(move |data, limit| {
        for (key, value) in data {
            let Some(bound) = limit.get(key) else {
                return Err(ClassifyError::LimitNotFound(key.to_string()));
            };
            if cmp(value, bound) != Ordering::Less {
                return Ok(false);
            }
        }
        Ok(true)
    })
}
