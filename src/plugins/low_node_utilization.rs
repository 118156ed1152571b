//! LowNodeUtilization evicts pods from overutilized nodes so the external
//! placer can land them on underutilized ones. Unless a metrics based usage
//! source is configured, CPU/memory requests are used to calculate node
//! utilization rather than actual resource usage.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::evictions::EvictOptions;
use crate::models::{
    Namespaces, Node, Pod, ResourceList, ResourceName, ResourceThresholds,
};
use crate::plugins::{
    evict_pods_from_source_nodes, sort_nodes_by_usage, threshold_resource_names,
    validate_thresholds, BalancePlugin, Handle, MetricsUtilization, NodeInfo, Plugin,
};
use crate::thresholds::{
    is_node_with_high_utilization, is_node_with_low_utilization, NodeProcessor, NodeThresholds,
    MAX_RESOURCE_PERCENTAGE, MIN_RESOURCE_PERCENTAGE,
};
use crate::usage::measured::MeasuredUsageSource;
use crate::usage::query::QueryUsageSource;
use crate::usage::requested::RequestedUsageSource;
use crate::usage::{NodeUsage, UsageSource};

pub const LOW_NODE_UTILIZATION_PLUGIN_NAME: &str = "LowNodeUtilization";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LowNodeUtilizationArgs {
    /// Percentages below which a node counts as underutilized.
    pub thresholds: ResourceThresholds,
    /// Percentages above which a node counts as overutilized.
    pub target_thresholds: ResourceThresholds,
    /// Interpret the thresholds as deviations from the cluster mean instead
    /// of absolute percentages.
    pub use_deviation_thresholds: bool,
    /// The pass is a no-op unless more than this many nodes are
    /// underutilized.
    pub number_of_nodes: usize,
    pub evictable_namespaces: Namespaces,
    pub metrics_utilization: MetricsUtilization,
}

pub struct LowNodeUtilization {
    args: LowNodeUtilizationArgs,
    handle: Handle,
    resource_names: Vec<ResourceName>,
    usage_source: Box<dyn UsageSource>,
}

impl std::fmt::Debug for LowNodeUtilization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowNodeUtilization")
            .field("args", &self.args)
            .field("resource_names", &self.resource_names)
            .finish()
    }
}

impl LowNodeUtilization {
    /// Builds the plugin from its arguments, selecting the usage source the
    /// configuration asks for. Malformed arguments are rejected here.
    pub fn new(mut args: LowNodeUtilizationArgs, handle: Handle) -> Result<Self> {
        validate_thresholds(&args.thresholds)?;
        validate_thresholds(&args.target_thresholds)?;

        if args.metrics_utilization.metrics_server
            && args.metrics_utilization.prometheus_query.is_some()
        {
            bail!("metrics server and prometheus query usage sources are mutually exclusive");
        }

        if args.metrics_utilization.prometheus_query.is_some() {
            let name_strings = |thresholds: &ResourceThresholds| {
                threshold_resource_names(thresholds)
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            };
            let under = threshold_resource_names(&args.thresholds);
            if under != [ResourceName::Metric] {
                bail!(
                    "thresholds are expected to specify a single instance of {:?} resource, got {:?} instead",
                    ResourceName::Metric.to_string(),
                    name_strings(&args.thresholds)
                );
            }
            let over = threshold_resource_names(&args.target_thresholds);
            if over != [ResourceName::Metric] {
                bail!(
                    "targetThresholds are expected to specify a single instance of {:?} resource, got {:?} instead",
                    ResourceName::Metric.to_string(),
                    name_strings(&args.target_thresholds)
                );
            }
        } else {
            set_default_lnu_thresholds(
                &mut args.thresholds,
                &mut args.target_thresholds,
                args.use_deviation_thresholds,
            );
        }

        let resource_names = threshold_resource_names(&args.thresholds);

        let usage_source: Box<dyn UsageSource> = if args.metrics_utilization.metrics_server {
            let collector = handle
                .metrics_collector
                .clone()
                .ok_or_else(|| anyhow!("metrics collector not initialized"))?;
            Box::new(MeasuredUsageSource::new(
                resource_names.clone(),
                handle.pods_on_node.clone(),
                collector,
            ))
        } else if let Some(query) = args.metrics_utilization.prometheus_query.clone() {
            let backend = handle
                .query_backend
                .clone()
                .ok_or_else(|| anyhow!("query backend not initialized"))?;
            Box::new(QueryUsageSource::new(
                handle.pods_on_node.clone(),
                backend,
                query,
            ))
        } else {
            Box::new(RequestedUsageSource::new(
                resource_names.clone(),
                handle.pods_on_node.clone(),
            ))
        };

        Ok(Self {
            args,
            handle,
            resource_names,
            usage_source,
        })
    }
}

impl Plugin for LowNodeUtilization {
    fn name(&self) -> &str {
        LOW_NODE_UTILIZATION_PLUGIN_NAME
    }
}

#[async_trait]
impl BalancePlugin for LowNodeUtilization {
    async fn balance(&mut self, cancel: &CancellationToken, nodes: &[Arc<Node>]) -> Result<()> {
        self.usage_source
            .sync(nodes)
            .await
            .map_err(|err| anyhow!("error getting node usage: {err}"))?;

        let processor = NodeProcessor::new(
            nodes,
            self.args.thresholds.clone(),
            self.args.target_thresholds.clone(),
            self.resource_names.clone(),
            self.args.use_deviation_thresholds,
            self.usage_source.as_ref(),
        );

        let mut low_nodes: Vec<NodeInfo> = Vec::new();
        let mut high_nodes: Vec<NodeInfo> = Vec::new();
        processor.classify(&mut [
            Box::new(|usage: &NodeUsage, thresholds: &NodeThresholds| {
                if usage.node.is_unschedulable() {
                    log::debug!(
                        "node {:?} is unschedulable, thus not considered as underutilized",
                        usage.node.name
                    );
                    return;
                }
                if !is_node_with_low_utilization(usage, &thresholds.low) {
                    return;
                }
                low_nodes.push(NodeInfo {
                    usage: usage.clone(),
                    thresholds: thresholds.clone(),
                });
            }),
            Box::new(|usage: &NodeUsage, thresholds: &NodeThresholds| {
                if is_node_with_high_utilization(usage, &thresholds.high) {
                    high_nodes.push(NodeInfo {
                        usage: usage.clone(),
                        thresholds: thresholds.clone(),
                    });
                }
            }),
        ]);

        log::info!("number of underutilized nodes: {}", low_nodes.len());
        log::info!("number of overutilized nodes: {}", high_nodes.len());

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
            log::info!("all nodes are under target utilization, nothing to do here");
            return Ok(());
        }

        // stop once the node drops below the target threshold or any of the
        // available capacity on the destinations is used up
        let continue_eviction = |node_info: &NodeInfo, total_available_usage: &ResourceList| {
            if !is_node_with_high_utilization(&node_info.usage, &node_info.thresholds.high) {
                return false;
            }
            total_available_usage
                .values()
                .all(|quantity| quantity.cmp_int64(0) == Ordering::Greater)
        };

        sort_nodes_by_usage(&mut high_nodes, false);

        let filter_evictor = self.handle.evictor.clone();
        let pod_filter = move |pod: &Pod| filter_evictor.filter(pod);

        evict_pods_from_source_nodes(
            cancel,
            &self.args.evictable_namespaces,
            high_nodes,
            &low_nodes,
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

/// Any basic resource absent from the thresholds is defaulted into both
/// maps: to 100% in absolute mode (the node never counts as high on it) and
/// to 0 in deviation mode (balancing on it is disabled).
fn set_default_lnu_thresholds(
    thresholds: &mut ResourceThresholds,
    target_thresholds: &mut ResourceThresholds,
    use_deviation_thresholds: bool,
) {
    let default = if use_deviation_thresholds {
        MIN_RESOURCE_PERCENTAGE
    } else {
        MAX_RESOURCE_PERCENTAGE
    };
    for name in [ResourceName::Pods, ResourceName::Cpu, ResourceName::Memory] {
        if !thresholds.contains_key(&name) {
            thresholds.insert(name.clone(), default);
            target_thresholds.insert(name, default);
        }
    }
}
