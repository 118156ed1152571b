//! Usage assessment from declared pod requests. Fully deterministic from
//! API state, no remote calls involved.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Format, Node, Pod, Quantity, ResourceList, ResourceName};
use crate::usage::{PodsOnNodeFn, UsageError, UsageSource};

/// Assesses node usage by summing up the resource requests of the pods
/// assigned to each node.
pub struct RequestedUsageSource {
    resource_names: Vec<ResourceName>,
    pods_on_node: PodsOnNodeFn,
    pods: HashMap<String, Vec<Arc<Pod>>>,
    node_utilization: HashMap<String, ResourceList>,
}

impl RequestedUsageSource {
    pub fn new(resource_names: Vec<ResourceName>, pods_on_node: PodsOnNodeFn) -> Self {
        Self {
            resource_names,
            pods_on_node,
            pods: HashMap::new(),
            node_utilization: HashMap::new(),
        }
    }
}

/// Sums the requests of the given pods for every resource in scope. The pod
/// count itself is always recorded, whether in scope or not.
fn requests_of(pods: &[Arc<Pod>], resource_names: &[ResourceName]) -> ResourceList {
    let mut usage: ResourceList = resource_names
        .iter()
        .map(|name| (name.clone(), Quantity::zero_for(name)))
        .collect();
    usage.insert(
        ResourceName::Pods,
        Quantity::new(pods.len() as i64, Format::DecimalSI),
    );

    for pod in pods {
        for name in resource_names {
            if *name == ResourceName::Pods {
                continue;
            }
            if let Some(total) = usage.get_mut(name) {
                total.add(pod.request_for(name));
            }
        }
    }

    usage
}

#[async_trait]
impl UsageSource for RequestedUsageSource {
    async fn sync(&mut self, nodes: &[Arc<Node>]) -> Result<()> {
        let mut node_utilization = HashMap::new();
        let mut pods_by_node = HashMap::new();

        for node in nodes {
            let pods = (self.pods_on_node)(&node.name);
            node_utilization.insert(node.name.clone(), requests_of(&pods, &self.resource_names));
            pods_by_node.insert(node.name.clone(), pods);
        }

        self.node_utilization = node_utilization;
        self.pods = pods_by_node;
        Ok(())
    }

    fn node_utilization(&self, node: &str) -> ResourceList {
        self.node_utilization.get(node).cloned().unwrap_or_default()
    }

    fn pods(&self, node: &str) -> Vec<Arc<Pod>> {
        self.pods.get(node).cloned().unwrap_or_default()
    }

    async fn pod_usage(&self, pod: &Pod) -> Result<ResourceList, UsageError> {
        Ok(self
            .resource_names
            .iter()
            .map(|name| (name.clone(), pod.request_for(name)))
            .collect())
    }
}
