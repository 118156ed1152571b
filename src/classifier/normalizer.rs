//! Conversion of raw usage values into normalized forms (typically
//! percentage of capacity) and averaging across nodes.

use std::collections::HashMap;
use std::hash::Hash;

use anyhow::{anyhow, Result};
use num_traits::{FromPrimitive, Num};

use crate::models::{Percentage, Quantity, ResourceList, ResourceName, ResourceThresholds};

/// Normalizes a set of values keyed by `K` using the provided normalizer
/// function, e.g. converting per-node memory usage in bytes into percentage
/// of the node capacity. Keys absent from `totals` are silently skipped.
pub fn normalize<K, V, N, F>(
    usages: &HashMap<K, V>,
    totals: &HashMap<K, V>,
    normalizer: F,
) -> Result<HashMap<K, N>>
where
    K: Eq + Hash + Clone,
    F: Fn(&V, &V) -> Result<N>,
{
    let mut result = HashMap::new();
    for (key, value) in usages {
        let Some(total) = totals.get(key) else {
            continue;
        };
        result.insert(key.clone(), normalizer(value, total)?);
    }
    Ok(result)
}

/// Calculates the element-wise average of a set of maps sharing a unit of
/// measure. Division happens on the numeric type, so integer instantiations
/// truncate.
pub fn average<K, J, N>(values: &HashMap<K, HashMap<J, N>>) -> HashMap<J, N>
where
    K: Eq + Hash,
    J: Eq + Hash + Clone,
    N: Num + FromPrimitive + Copy,
{
    let mut result: HashMap<J, N> = HashMap::new();
    for imap in values.values() {
        for (name, value) in imap {
            let entry = result.entry(name.clone()).or_insert_with(N::zero);
            *entry = *entry + *value;
        }
    }

    if result.is_empty() {
        return result;
    }
    let count =
        N::from_usize(values.len()).expect("map count not representable in the numeric type");
    for value in result.values_mut() {
        *value = *value / count;
    }
    result
}

/// Converts a set of resource usages and the matching totals into percentage
/// of capacity, clamped to the <0;100> interval. CPU is compared in
/// milli-units, everything else in whole units. Fails when a used resource
/// has no entry in the totals.
pub fn resource_usage_normalizer(
    usages: &ResourceList,
    totals: &ResourceList,
) -> Result<ResourceThresholds> {
    let mut result = ResourceThresholds::new();
    for (name, value) in usages {
        let total = totals
            .get(name)
            .ok_or_else(|| anyhow!("total for {name} not found"))?;

        let (used, avail) = if *name == ResourceName::Cpu {
            (value.milli_value(), total.milli_value())
        } else {
            (value.value(), total.value())
        };

        let pct = (used as f64 / avail as f64 * 100.0).clamp(0.0, 100.0);
        result.insert(name.clone(), pct);
    }
    Ok(result)
}

/// Percent-of-capacity normalizer over bare quantities. Ratios are taken in
/// milli-units so CPU keeps its precision; the result is not clamped.
pub fn quantity_percentage(usage: &Quantity, total: &Quantity) -> Percentage {
    usage.milli_value() as f64 / total.milli_value() as f64 * 100.0
}
