//! Usage sources assess node utilization. Each variant measures differently
//! (declared requests, a live metrics oracle, a user supplied time-series
//! query) but all of them expose the same capability set.

pub mod measured;
pub mod query;
pub mod requested;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::classifier::normalizer::{average, normalize, quantity_percentage};
use crate::models::{Node, Percentage, Pod, ResourceList, ResourceName, ResourceThresholds};

/// Distinguishes between the different types of usage sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsageSourceKind {
    Requested,
    Measured,
    Query,
}

#[derive(Error, Debug)]
pub enum UsageError {
    /// The operation is not supported by the usage source, either not yet
    /// implemented or not supported at all.
    #[error("{message}")]
    NotSupported {
        kind: UsageSourceKind,
        message: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl UsageError {
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Self::NotSupported { .. })
    }
}

/// Callback resolving the pods currently assigned to a node.
pub type PodsOnNodeFn = Arc<dyn Fn(&str) -> Vec<Arc<Pod>> + Send + Sync>;

/// A node's snapshot together with its pods and resource usage. Every
/// resource key present in `usage` is also present in the node's capacity.
#[derive(Clone, Debug)]
pub struct NodeUsage {
    pub node: Arc<Node>,
    pub usage: ResourceList,
    pub all_pods: Vec<Arc<Pod>>,
}

/// Capability set implemented by all usage sources.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Fetches data and assesses the usage of the given nodes. This must be
    /// called before any other method. Sync is transactional: a failed call
    /// leaves no partial state behind for a later call to observe.
    async fn sync(&mut self, nodes: &[Arc<Node>]) -> Result<()>;

    /// The utilization of the given node.
    fn node_utilization(&self, node: &str) -> ResourceList;

    /// All pods assigned to the given node at sync time.
    fn pods(&self, node: &str) -> Vec<Arc<Pod>>;

    /// The usage of the given pod.
    async fn pod_usage(&self, pod: &Pod) -> Result<ResourceList, UsageError>;

    /// The utilization of all the provided nodes, their pods included. This
    /// gives the caller more information than a plain `node_utilization`
    /// call.
    fn nodes_usage(&self, nodes: &[Arc<Node>]) -> Vec<NodeUsage> {
        nodes
            .iter()
            .map(|node| NodeUsage {
                node: node.clone(),
                usage: self.node_utilization(&node.name),
                all_pods: self.pods(&node.name),
            })
            .collect()
    }

    /// The average percent-of-capacity usage across all the provided nodes.
    fn nodes_average_usage(&self, nodes: &[Arc<Node>]) -> ResourceThresholds {
        let usages: HashMap<String, ResourceList> = nodes
            .iter()
            .map(|node| (node.name.clone(), self.node_utilization(&node.name)))
            .collect();
        let totals: HashMap<String, ResourceList> = nodes
            .iter()
            .map(|node| (node.name.clone(), self.node_capacity(node)))
            .collect();

        let normalized = normalize(&usages, &totals, |usage, total| {
            let mut percentages: HashMap<ResourceName, Percentage> = HashMap::new();
            for (name, value) in usage {
                let Some(capacity) = total.get(name) else {
                    continue;
                };
                percentages.insert(name.clone(), quantity_percentage(value, capacity));
            }
            Ok(percentages)
        })
        .expect("percent normalizer is infallible");

        average(&normalized).into_iter().collect()
    }

    /// The capacity of the given node, per single resource. Allocatable
    /// resources take precedence over the raw capacity when present.
    fn node_capacity(&self, node: &Node) -> ResourceList {
        if node.allocatable.is_empty() {
            node.capacity.clone()
        } else {
            node.allocatable.clone()
        }
    }
}
