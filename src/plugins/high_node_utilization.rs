//! HighNodeUtilization drains underutilized nodes so they can be scaled
//! down: their pods are evicted for the external placer to compact onto the
//! remaining nodes. CPU/memory requests are used to calculate node
//! utilization rather than actual resource usage.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::evictions::EvictOptions;
use crate::models::{
    Namespaces, Node, Pod, ResourceList, ResourceName, ResourceThresholds,
};
use crate::plugins::{
    evict_pods_from_source_nodes, sort_nodes_by_usage, threshold_resource_names,
    validate_thresholds, BalancePlugin, Handle, NodeInfo, Plugin,
};
use crate::thresholds::{
    is_node_with_low_utilization, NodeProcessor, NodeThresholds, MAX_RESOURCE_PERCENTAGE,
};
use crate::usage::requested::RequestedUsageSource;
use crate::usage::{NodeUsage, UsageSource};

pub const HIGH_NODE_UTILIZATION_PLUGIN_NAME: &str = "HighNodeUtilization";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HighNodeUtilizationArgs {
    /// Percentages below which a node counts as underutilized and is worth
    /// draining.
    pub thresholds: ResourceThresholds,
    /// The pass is a no-op unless more than this many nodes are
    /// underutilized.
    pub number_of_nodes: usize,
    pub evictable_namespaces: Namespaces,
}

pub struct HighNodeUtilization {
    args: HighNodeUtilizationArgs,
    handle: Handle,
    resource_names: Vec<ResourceName>,
    target_thresholds: ResourceThresholds,
    usage_source: Box<dyn UsageSource>,
}

impl HighNodeUtilization {
    /// Builds the plugin from its arguments. Node usage is always assessed
    /// from declared pod requests.
    pub fn new(mut args: HighNodeUtilizationArgs, handle: Handle) -> Result<Self> {
        validate_thresholds(&args.thresholds)?;

        let mut target_thresholds = ResourceThresholds::new();
        set_default_thresholds(&mut args.thresholds, &mut target_thresholds);
        let resource_names = threshold_resource_names(&target_thresholds);

        let usage_source = Box::new(RequestedUsageSource::new(
            resource_names.clone(),
            handle.pods_on_node.clone(),
        ));

        Ok(Self {
            args,
            handle,
            resource_names,
            target_thresholds,
            usage_source,
        })
    }
}

impl Plugin for HighNodeUtilization {
    fn name(&self) -> &str {
        HIGH_NODE_UTILIZATION_PLUGIN_NAME
    }
}

#[async_trait]
impl BalancePlugin for HighNodeUtilization {
    async fn balance(&mut self, cancel: &CancellationToken, nodes: &[Arc<Node>]) -> Result<()> {
        self.usage_source
            .sync(nodes)
            .await
            .map_err(|err| anyhow!("error getting node usage: {err}"))?;

        let processor = NodeProcessor::new(
            nodes,
            self.args.thresholds.clone(),
            self.target_thresholds.clone(),
            self.resource_names.clone(),
            false,
            self.usage_source.as_ref(),
        );

        let mut low_nodes: Vec<NodeInfo> = Vec::new();
        let mut high_nodes: Vec<NodeInfo> = Vec::new();
        processor.classify(&mut [
            Box::new(|usage: &NodeUsage, thresholds: &NodeThresholds| {
                if !is_node_with_low_utilization(usage, &thresholds.low) {
                    return;
                }
                low_nodes.push(NodeInfo {
                    usage: usage.clone(),
                    thresholds: thresholds.clone(),
                });
            }),
            Box::new(|usage: &NodeUsage, thresholds: &NodeThresholds| {
                if usage.node.is_unschedulable() {
                    return;
                }
                if is_node_with_low_utilization(usage, &thresholds.low) {
                    return;
                }
                high_nodes.push(NodeInfo {
                    usage: usage.clone(),
                    thresholds: thresholds.clone(),
                });
            }),
        ]);

        log::info!("number of underutilized nodes: {}", low_nodes.len());

        if low_nodes.is_empty() {
            log::info!(
                "no node is underutilized, nothing to do here, you might tune your thresholds further"
            );
            return Ok(());
        }

        if low_nodes.len() <= self.args.number_of_nodes {
            log::info!(
                "number of nodes underutilized ({}) is less or equal than NumberOfNodes ({}), nothing to do here",
                low_nodes.len(),
                self.args.number_of_nodes
            );
            return Ok(());
        }

        if low_nodes.len() == nodes.len() {
            log::info!("all nodes are underutilized, nothing to do here");
            return Ok(());
        }

        if high_nodes.is_empty() {
            log::info!("no node is available to schedule the pods, nothing to do here");
            return Ok(());
        }

        // stop once the total available usage has dropped to zero, no more
        // pods can be scheduled anywhere
        let continue_eviction = |_node_info: &NodeInfo, total_available_usage: &ResourceList| {
            total_available_usage
                .values()
                .all(|quantity| quantity.cmp_int64(0) == Ordering::Greater)
        };

        sort_nodes_by_usage(&mut low_nodes, true);

        let filter_evictor = self.handle.evictor.clone();
        let pod_filter = move |pod: &Pod| filter_evictor.filter(pod);

        evict_pods_from_source_nodes(
            cancel,
            &self.args.evictable_namespaces,
            low_nodes,
            &high_nodes,
            self.handle.evictor.as_ref(),
            EvictOptions {
                strategy_name: self.name().to_string(),
            },
            &pod_filter,
            &self.resource_names,
            &continue_eviction,
            self.usage_source.as_ref(),
        )
        .await;

        Ok(())
    }
}

/// Basic resources missing from the user thresholds default to 100%. The
/// target thresholds are not user facing for this strategy: every resource
/// in scope gets the full 100%, extended resources included.
fn set_default_thresholds(
    thresholds: &mut ResourceThresholds,
    target_thresholds: &mut ResourceThresholds,
) {
    for name in [ResourceName::Pods, ResourceName::Cpu, ResourceName::Memory] {
        if !thresholds.contains_key(&name) {
            thresholds.insert(name, MAX_RESOURCE_PERCENTAGE);
        }
    }

    target_thresholds.insert(ResourceName::Pods, MAX_RESOURCE_PERCENTAGE);
    target_thresholds.insert(ResourceName::Cpu, MAX_RESOURCE_PERCENTAGE);
    target_thresholds.insert(ResourceName::Memory, MAX_RESOURCE_PERCENTAGE);

    for name in thresholds.keys() {
        if !name.is_basic() {
            target_thresholds.insert(name.clone(), MAX_RESOURCE_PERCENTAGE);
        }
    }
}
