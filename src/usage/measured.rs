//! Usage assessment from a live metrics oracle. Unlike the requested
//! variant this reflects what the workloads actually consume.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::time::{timeout, Duration};

use crate::models::{Format, Node, Pod, Quantity, ResourceList, ResourceName};
use crate::usage::{PodsOnNodeFn, UsageError, UsageSource};

const POD_METRICS_TIMEOUT: Duration = Duration::from_secs(10);

/// Oracle serving smoothed node metrics and instantaneous pod metrics.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// Usage of every known node, fetched in one call.
    async fn all_nodes_usage(&self) -> Result<HashMap<String, ResourceList>>;

    /// Current usage of a single pod, one resource list per container. Pod
    /// metrics are read without any softening (e.g. EWMA); only a fraction
    /// of the pods is ever queried, so tracking them all would be wasteful.
    async fn pod_metrics(&self, namespace: &str, name: &str) -> Result<Vec<ResourceList>>;
}

/// Assesses node usage through a metrics oracle.
pub struct MeasuredUsageSource {
    resource_names: Vec<ResourceName>,
    pods_on_node: PodsOnNodeFn,
    collector: Arc<dyn MetricsCollector>,
    pods: HashMap<String, Vec<Arc<Pod>>>,
    node_utilization: HashMap<String, ResourceList>,
}

impl MeasuredUsageSource {
    pub fn new(
        resource_names: Vec<ResourceName>,
        pods_on_node: PodsOnNodeFn,
        collector: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            resource_names,
            pods_on_node,
            collector,
            pods: HashMap::new(),
            node_utilization: HashMap::new(),
        }
    }
}

#[async_trait]
impl UsageSource for MeasuredUsageSource {
    async fn sync(&mut self, nodes: &[Arc<Node>]) -> Result<()> {
        let mut nodes_usage = self.collector.all_nodes_usage().await?;

        let mut node_utilization = HashMap::new();
        let mut pods_by_node = HashMap::new();

        for node in nodes {
            let pods = (self.pods_on_node)(&node.name);

            let mut node_usage = nodes_usage
                .remove(&node.name)
                .ok_or_else(|| anyhow!("unable to find node {:?} in the collected metrics", node.name))?;
            node_usage.insert(
                ResourceName::Pods,
                Quantity::new(pods.len() as i64, Format::DecimalSI),
            );

            for name in &self.resource_names {
                if !node_usage.contains_key(name) {
                    bail!(
                        "unable to find {:?} resource for collected {:?} node metric",
                        name.to_string(),
                        node.name
                    );
                }
            }

            node_utilization.insert(node.name.clone(), node_usage);
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
        let containers = timeout(
            POD_METRICS_TIMEOUT,
            self.collector.pod_metrics(&pod.namespace, &pod.name),
        )
        .await
        .map_err(|_| {
            anyhow!(
                "timed out getting pod metrics for {:?}/{:?}",
                pod.namespace,
                pod.name
            )
        })?
        .map_err(|err| {
            anyhow!(
                "unable to get pod metrics for {:?}/{:?}: {err}",
                pod.namespace,
                pod.name
            )
        })?;

        let mut total_usage = ResourceList::new();
        for container in containers {
            for name in &self.resource_names {
                let Some(usage) = container.get(name) else {
                    continue;
                };
                total_usage
                    .entry(name.clone())
                    .or_insert_with(|| Quantity::zero_for(name))
                    .add(*usage);
            }
        }

        Ok(total_usage)
    }
}
