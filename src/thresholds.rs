//! Conversion of user supplied percentage thresholds into absolute per-node
//! resource quantities, and the node classification driven by them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::models::{Node, Percentage, Quantity, ResourceList, ResourceName, ResourceThresholds};
use crate::usage::{NodeUsage, UsageSource};

/// The minimum value of a resource's percentage.
pub const MIN_RESOURCE_PERCENTAGE: Percentage = 0.0;
/// The maximum value of a resource's percentage.
pub const MAX_RESOURCE_PERCENTAGE: Percentage = 100.0;

/// Absolute usage bounds for one node. A node above the high limit is
/// overutilized, a node below the low limit is underutilized.
#[derive(Clone, Debug, Default)]
pub struct NodeThresholds {
    pub low: ResourceList,
    pub high: ResourceList,
}

/// Callback classifying a node based on its usage. Opaque from this module's
/// point of view; whoever does the classification accumulates results on
/// their side.
pub type ClassifyNodeFn<'a> = Box<dyn FnMut(&NodeUsage, &NodeThresholds) + 'a>;

/// Assesses node thresholds. Everything starts from the thresholds provided
/// by the user for a certain list of resources; they are either absolute
/// percentages of the node capacity or deviations relative to the cluster
/// average.
pub struct NodeProcessor<'a> {
    nodes: &'a [Arc<Node>],
    low_threshold: ResourceThresholds,
    high_threshold: ResourceThresholds,
    resource_names: Vec<ResourceName>,
    use_deviation_thresholds: bool,
    usage_source: &'a dyn UsageSource,
}

impl<'a> NodeProcessor<'a> {
    pub fn new(
        nodes: &'a [Arc<Node>],
        low_threshold: ResourceThresholds,
        high_threshold: ResourceThresholds,
        resource_names: Vec<ResourceName>,
        use_deviation_thresholds: bool,
        usage_source: &'a dyn UsageSource,
    ) -> Self {
        Self {
            nodes,
            low_threshold,
            high_threshold,
            resource_names,
            use_deviation_thresholds,
            usage_source,
        }
    }

    /// The absolute threshold for one resource as a fraction of the node
    /// capacity. Percentages stay floating point up to this conversion,
    /// where the result is truncated at the unit the resource is recorded
    /// in (milli-units for CPU, whole units otherwise).
    fn resource_threshold(
        capacity: &ResourceList,
        resource_name: &ResourceName,
        threshold: Percentage,
    ) -> Quantity {
        let format = resource_name.default_format();
        let capacity_quantity = capacity
            .get(resource_name)
            .copied()
            .unwrap_or_else(|| Quantity::zero_for(resource_name));

        // threshold * 0.01 converts the <0;100> interval into <0;1>
        let fraction = |resource_capacity: i64| (threshold * 0.01 * resource_capacity as f64) as i64;

        if *resource_name == ResourceName::Cpu {
            Quantity::new_milli(fraction(capacity_quantity.milli_value()), format)
        } else {
            Quantity::new(fraction(capacity_quantity.value()), format)
        }
    }

    /// Makes sure we never return a value outside of the <0;100> interval.
    fn normalize_percentage(percent: Percentage) -> Percentage {
        percent.clamp(MIN_RESOURCE_PERCENTAGE, MAX_RESOURCE_PERCENTAGE)
    }

    /// Assesses the thresholds for a single node. In deviation mode the
    /// thresholds express a distance from the cluster average; otherwise the
    /// user percentages apply to the node capacity directly.
    fn thresholds_for_node(&self, node: &Node, average: &ResourceThresholds) -> NodeThresholds {
        let capacity = self.usage_source.node_capacity(node);

        let mut thresholds = NodeThresholds::default();
        for resource_name in &self.resource_names {
            let low_pct = self
                .low_threshold
                .get(resource_name)
                .copied()
                .unwrap_or(MIN_RESOURCE_PERCENTAGE);
            let high_pct = self
                .high_threshold
                .get(resource_name)
                .copied()
                .unwrap_or(MIN_RESOURCE_PERCENTAGE);

            if !self.use_deviation_thresholds {
                thresholds.low.insert(
                    resource_name.clone(),
                    Self::resource_threshold(&capacity, resource_name, low_pct),
                );
                thresholds.high.insert(
                    resource_name.clone(),
                    Self::resource_threshold(&capacity, resource_name, high_pct),
                );
                continue;
            }

            // a zero deviation floor disables balancing on this resource:
            // both bounds are pinned to the full capacity
            if low_pct == MIN_RESOURCE_PERCENTAGE {
                let resource_capacity = capacity
                    .get(resource_name)
                    .copied()
                    .unwrap_or_else(|| Quantity::zero_for(resource_name));
                thresholds.low.insert(resource_name.clone(), resource_capacity);
                thresholds.high.insert(resource_name.clone(), resource_capacity);
                continue;
            }

            let avg = average
                .get(resource_name)
                .copied()
                .unwrap_or(MIN_RESOURCE_PERCENTAGE);
            thresholds.low.insert(
                resource_name.clone(),
                Self::resource_threshold(
                    &capacity,
                    resource_name,
                    Self::normalize_percentage(avg - low_pct),
                ),
            );
            thresholds.high.insert(
                resource_name.clone(),
                Self::resource_threshold(
                    &capacity,
                    resource_name,
                    Self::normalize_percentage(avg + high_pct),
                ),
            );
        }

        thresholds
    }

    /// Calculates the thresholds of every node known to the processor.
    fn process(&self) -> HashMap<String, NodeThresholds> {
        // deviation thresholds indicate a distance from the mean, so the
        // cluster average has to be assessed first
        let average = if self.use_deviation_thresholds {
            self.usage_source.nodes_average_usage(self.nodes)
        } else {
            ResourceThresholds::new()
        };

        self.nodes
            .iter()
            .map(|node| (node.name.clone(), self.thresholds_for_node(node, &average)))
            .collect()
    }

    /// Runs every provided callback on every node, in the order the
    /// callbacks are provided. Unlike the generic classifier this is a plain
    /// fan-out and never short-circuits.
    pub fn classify(&self, classifiers: &mut [ClassifyNodeFn]) {
        let thresholds = self.process();
        for usage in self.usage_source.nodes_usage(self.nodes) {
            let Some(node_thresholds) = thresholds.get(&usage.node.name) else {
                continue;
            };
            for classifier in classifiers.iter_mut() {
                classifier(&usage, node_thresholds);
            }
        }
    }
}

/// True if the node is overutilized: at least one measured resource is above
/// its high threshold.
pub fn is_node_with_high_utilization(usage: &NodeUsage, threshold: &ResourceList) -> bool {
    for (name, node_value) in &usage.usage {
        if let Some(limit) = threshold.get(name) {
            if limit < node_value {
                return true;
            }
        }
    }
    false
}

/// True if the node is underutilized: every measured resource is at or below
/// its low threshold.
pub fn is_node_with_low_utilization(usage: &NodeUsage, threshold: &ResourceList) -> bool {
    for (name, node_value) in &usage.usage {
        if let Some(limit) = threshold.get(name) {
            if limit < node_value {
                return false;
            }
        }
    }
    true
}
