//! Balancing plugins.
//!
//! The functionality of each plugin corresponds to its namesake in the
//! Kubernetes descheduler. This module also carries the machinery the two
//! strategies share: node and pod ordering, the destination headroom budget
//! and the eviction loop.

pub mod high_node_utilization;
pub mod low_node_utilization;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::evictions::{EvictOptions, EvictionError, Evictor};
use crate::models::{
    Format, Namespaces, Node, Pod, Quantity, ResourceList, ResourceName, ResourceThresholds, Taint,
};
use crate::thresholds::{NodeThresholds, MAX_RESOURCE_PERCENTAGE, MIN_RESOURCE_PERCENTAGE};
use crate::usage::measured::MetricsCollector;
use crate::usage::query::QueryBackend;
use crate::usage::{NodeUsage, PodsOnNodeFn, UsageSource};

pub trait Plugin {
    fn name(&self) -> &str;
}

/// A balance plugin runs one full pass over the cluster: sync usage,
/// classify nodes, evict while budget remains. Passes hold no state between
/// invocations.
#[async_trait]
pub trait BalancePlugin: Plugin {
    async fn balance(&mut self, cancel: &CancellationToken, nodes: &[Arc<Node>]) -> Result<()>;
}

/// The collaborators a plugin is built around. The metrics collector and the
/// query backend are optional; constructing a plugin configured for one of
/// them without wiring it in fails.
#[derive(Clone)]
pub struct Handle {
    pub evictor: Arc<dyn Evictor>,
    pub pods_on_node: PodsOnNodeFn,
    pub metrics_collector: Option<Arc<dyn MetricsCollector>>,
    pub query_backend: Option<Arc<dyn QueryBackend>>,
}

/// Selects which usage source feeds a strategy. By default node usage is
/// assessed from declared pod requests.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsUtilization {
    /// Assess usage from the platform metrics server instead.
    pub metrics_server: bool,
    /// Assess usage by running this query against the time-series backend.
    /// Mutually exclusive with `metrics_server`.
    pub prometheus_query: Option<String>,
}

/// A node usage snapshot paired with the thresholds derived for it, carried
/// through classification and eviction.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    pub usage: NodeUsage,
    pub thresholds: NodeThresholds,
}

pub(crate) type ContinueEvictionCond<'a> = &'a (dyn Fn(&NodeInfo, &ResourceList) -> bool + Sync);

pub(crate) fn validate_thresholds(thresholds: &ResourceThresholds) -> Result<()> {
    for (name, pct) in thresholds.iter() {
        if !(MIN_RESOURCE_PERCENTAGE..=MAX_RESOURCE_PERCENTAGE).contains(pct) {
            bail!("{name} threshold percentage {pct} is outside of <0;100> interval");
        }
    }
    Ok(())
}

/// List of resource names appearing in the given thresholds.
pub(crate) fn threshold_resource_names(thresholds: &ResourceThresholds) -> Vec<ResourceName> {
    thresholds.keys().cloned().collect()
}

/// One-line rendering of a usage map for log messages.
pub(crate) fn format_usage(usage: &ResourceList) -> String {
    let mut parts = Vec::new();
    if let Some(quantity) = usage.get(&ResourceName::Cpu) {
        parts.push(format!("CPU={}", quantity.milli_value()));
    }
    if let Some(quantity) = usage.get(&ResourceName::Memory) {
        parts.push(format!("Mem={}", quantity.value()));
    }
    if let Some(quantity) = usage.get(&ResourceName::Pods) {
        parts.push(format!("Pods={}", quantity.value()));
    }
    for (name, quantity) in usage {
        if !name.is_basic() {
            parts.push(format!("{}={}", name, quantity.value()));
        }
    }
    parts.join(" ")
}

/// Splits a node's pods into non-removable and removable according to the
/// supplied filter.
pub(crate) fn classify_pods(
    pods: &[Arc<Pod>],
    filter: &(dyn Fn(&Pod) -> bool + Sync),
) -> (Vec<Arc<Pod>>, Vec<Arc<Pod>>) {
    let mut non_removable = Vec::new();
    let mut removable = Vec::new();
    for pod in pods {
        if filter(pod) {
            removable.push(pod.clone());
        } else {
            non_removable.push(pod.clone());
        }
    }
    (non_removable, removable)
}

/// Sorts pods by ascending priority; pods carrying no priority go first.
/// Ties are broken by QoS tier so the pods most tolerant to eviction lead.
pub(crate) fn sort_pods_on_priority_low_to_high(pods: &mut [Arc<Pod>]) {
    pods.sort_by(|a, b| match (a.spec.priority, b.spec.priority) {
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(pa), Some(pb)) if pa != pb => pa.cmp(&pb),
        _ => a.qos_class().cmp(&b.qos_class()),
    });
}

/// Sorts nodes by their summed usage, ascending when draining the emptiest
/// nodes first and descending when relieving the hottest first. CPU counts
/// in milli-units, everything else in whole units. The order of nodes with
/// equal sums is unspecified.
pub(crate) fn sort_nodes_by_usage(nodes: &mut [NodeInfo], ascending: bool) {
    let total = |node: &NodeInfo| {
        node.usage
            .usage
            .iter()
            .map(|(name, quantity)| {
                if *name == ResourceName::Cpu {
                    quantity.milli_value()
                } else {
                    quantity.value()
                }
            })
            .sum::<i64>()
    };
    nodes.sort_by(|a, b| {
        if ascending {
            total(a).cmp(&total(b))
        } else {
            total(b).cmp(&total(a))
        }
    });
}

/// True when at least one destination node exists whose full taint set the
/// pod tolerates. A pod that can run on no destination is pointless to
/// evict.
pub(crate) fn pod_tolerates_taints(pod: &Pod, taints_of_nodes: &HashMap<String, Vec<Taint>>) -> bool {
    taints_of_nodes
        .values()
        .any(|taints| pod.tolerates_all(taints))
}

/// Evicts pods from the source nodes, hottest or emptiest first depending on
/// the strategy. Pods are picked by ascending priority; when all of a node's
/// pods share a priority the QoS tier decides.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn evict_pods_from_source_nodes(
    cancel: &CancellationToken,
    evictable_namespaces: &Namespaces,
    source_nodes: Vec<NodeInfo>,
    destination_nodes: &[NodeInfo],
    evictor: &dyn Evictor,
    evict_options: EvictOptions,
    pod_filter: &(dyn Fn(&Pod) -> bool + Sync),
    resource_names: &[ResourceName],
    continue_eviction: ContinueEvictionCond<'_>,
    usage_source: &dyn UsageSource,
) {
    // upper bound on the total number of pods/cpu/memory and optional
    // extended resources to be moved
    let mut total_available_usage: ResourceList = resource_names
        .iter()
        .map(|name| (name.clone(), Quantity::zero_for(name)))
        .collect();

    let mut taints_of_destination_nodes = HashMap::with_capacity(destination_nodes.len());
    for node in destination_nodes {
        taints_of_destination_nodes.insert(
            node.usage.node.name.clone(),
            node.usage.node.spec.taints.clone(),
        );

        for name in resource_names {
            let Some(usage) = node.usage.usage.get(name) else {
                log::error!(
                    "unable to find {:?} resource in node's {:?} usage, terminating eviction",
                    name.to_string(),
                    node.usage.node.name
                );
                return;
            };
            let headroom = total_available_usage
                .entry(name.clone())
                .or_insert_with(|| Quantity::zero_for(name));
            if let Some(high) = node.thresholds.high.get(name) {
                headroom.add(*high);
            }
            headroom.sub(*usage);
        }
    }

    log::info!(
        "total capacity to be moved: {}",
        format_usage(&total_available_usage)
    );

    for mut node in source_nodes {
        log::debug!(
            "evicting pods from node {:?} with usage {}",
            node.usage.node.name,
            format_usage(&node.usage.usage)
        );

        let (non_removable, mut removable) = classify_pods(&node.usage.all_pods, pod_filter);
        log::debug!(
            "pods on node {:?}: all={} nonRemovable={} removable={}",
            node.usage.node.name,
            node.usage.all_pods.len(),
            non_removable.len(),
            removable.len()
        );

        if removable.is_empty() {
            log::info!(
                "no removable pods on node {:?}, try next node",
                node.usage.node.name
            );
            continue;
        }

        sort_pods_on_priority_low_to_high(&mut removable);

        if let Err(err) = evict_pods(
            cancel,
            evictable_namespaces,
            &removable,
            &mut node,
            &mut total_available_usage,
            &taints_of_destination_nodes,
            evictor,
            &evict_options,
            continue_eviction,
            usage_source,
        )
        .await
        {
            match err {
                EvictionError::TotalLimit { .. } => return,
                _ => continue,
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn evict_pods(
    cancel: &CancellationToken,
    evictable_namespaces: &Namespaces,
    input_pods: &[Arc<Pod>],
    node_info: &mut NodeInfo,
    total_available_usage: &mut ResourceList,
    taints_of_destination_nodes: &HashMap<String, Vec<Taint>>,
    evictor: &dyn Evictor,
    evict_options: &EvictOptions,
    continue_eviction: ContinueEvictionCond<'_>,
    usage_source: &dyn UsageSource,
) -> Result<(), EvictionError> {
    let excluded_namespaces: HashSet<&str> = evictable_namespaces
        .exclude
        .iter()
        .map(String::as_str)
        .collect();

    if !continue_eviction(node_info, total_available_usage) {
        return Ok(());
    }

    for pod in input_pods {
        if cancel.is_cancelled() {
            log::debug!("balance pass cancelled, stopping eviction");
            return Ok(());
        }

        if !pod_tolerates_taints(pod, taints_of_destination_nodes) {
            log::debug!(
                "skipping eviction for pod {}/{}, doesn't tolerate node taint",
                pod.namespace,
                pod.name
            );
            continue;
        }

        if excluded_namespaces.contains(pod.namespace.as_str()) {
            continue;
        }

        if !evictor.pre_eviction_filter(pod) {
            continue;
        }

        // In case the source cannot quantify pod resource utilization only a
        // single pod is evicted per node. Running the balancing cycle more
        // often still converges toward the re-distribution.
        let mut single_eviction = false;
        let mut pod_usage = ResourceList::new();
        match usage_source.pod_usage(pod).await {
            Ok(usage) => pod_usage = usage,
            Err(err) if err.is_not_supported() => single_eviction = true,
            Err(err) => {
                log::error!(
                    "unable to get pod usage for {}/{}: {err}",
                    pod.namespace,
                    pod.name
                );
                continue;
            }
        }

        match evictor.evict(cancel, pod, evict_options).await {
            Ok(()) => {
                log::debug!("evicted pod {}/{}", pod.namespace, pod.name);
                if single_eviction {
                    log::debug!("currently, only a single pod eviction is allowed");
                    break;
                }

                let names: Vec<ResourceName> = total_available_usage.keys().cloned().collect();
                for name in names {
                    let delta = if name == ResourceName::Pods {
                        Quantity::new(1, Format::DecimalSI)
                    } else {
                        pod_usage
                            .get(&name)
                            .copied()
                            .unwrap_or_else(|| Quantity::zero_for(&name))
                    };
                    if let Some(quantity) = node_info.usage.usage.get_mut(&name) {
                        quantity.sub(delta);
                    }
                    if let Some(quantity) = total_available_usage.get_mut(&name) {
                        quantity.sub(delta);
                    }
                }

                log::debug!(
                    "updated node {:?} usage: {}",
                    node_info.usage.node.name,
                    format_usage(&node_info.usage.usage)
                );

                // check if pods can still be evicted
                if !continue_eviction(node_info, total_available_usage) {
                    break;
                }
            }
            Err(err @ EvictionError::NodeLimit { .. })
            | Err(err @ EvictionError::TotalLimit { .. }) => return Err(err),
            Err(err) => log::error!("eviction failed: {err}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PodSpec, TaintEffect, Toleration, TolerationOperator};

    fn make_pod(name: &str, priority: Option<i32>, requests: ResourceList) -> Arc<Pod> {
        Arc::new(Pod {
            namespace: "default".to_string(),
            name: name.to_string(),
            spec: PodSpec {
                priority,
                requests,
                ..Default::default()
            },
        })
    }

    fn cpu_requests(cpu_milli: i64) -> ResourceList {
        HashMap::from([(
            ResourceName::Cpu,
            Quantity::new_milli(cpu_milli, Format::DecimalSI),
        )])
    }

    fn node_info(name: &str, cpu_milli: i64, memory: i64) -> NodeInfo {
        NodeInfo {
            usage: NodeUsage {
                node: Arc::new(Node {
                    name: name.to_string(),
                    ..Default::default()
                }),
                usage: HashMap::from([
                    (
                        ResourceName::Cpu,
                        Quantity::new_milli(cpu_milli, Format::DecimalSI),
                    ),
                    (ResourceName::Memory, Quantity::new(memory, Format::BinarySI)),
                ]),
                all_pods: vec![],
            },
            thresholds: NodeThresholds::default(),
        }
    }

    #[test]
    fn test_sort_pods_by_priority_then_qos() {
        let mut limits = cpu_requests(100);
        limits.insert(ResourceName::Memory, Quantity::new(10, Format::BinarySI));

        let guaranteed = Arc::new(Pod {
            namespace: "default".to_string(),
            name: "guaranteed".to_string(),
            spec: PodSpec {
                priority: Some(5),
                requests: limits.clone(),
                limits,
                ..Default::default()
            },
        });
        let burstable = make_pod("burstable", Some(5), cpu_requests(100));
        let best_effort = make_pod("best-effort", Some(5), ResourceList::new());
        let unprioritized = make_pod("no-priority", None, cpu_requests(100));
        let important = make_pod("important", Some(100), ResourceList::new());

        let mut pods = vec![
            important.clone(),
            guaranteed.clone(),
            burstable.clone(),
            best_effort.clone(),
            unprioritized.clone(),
        ];
        sort_pods_on_priority_low_to_high(&mut pods);

        let names: Vec<&str> = pods.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["no-priority", "best-effort", "burstable", "guaranteed", "important"]
        );
    }

    #[test]
    fn test_sort_nodes_by_usage() {
        let mut nodes = vec![
            node_info("mid", 500, 50),
            node_info("hot", 900, 90),
            node_info("cold", 100, 10),
        ];

        sort_nodes_by_usage(&mut nodes, false);
        let names: Vec<&str> = nodes.iter().map(|n| n.usage.node.name.as_str()).collect();
        assert_eq!(names, vec!["hot", "mid", "cold"]);

        sort_nodes_by_usage(&mut nodes, true);
        let names: Vec<&str> = nodes.iter().map(|n| n.usage.node.name.as_str()).collect();
        assert_eq!(names, vec!["cold", "mid", "hot"]);
    }

    #[test]
    fn test_classify_pods() {
        let pods = vec![
            make_pod("keep", Some(10), ResourceList::new()),
            make_pod("move", Some(1), ResourceList::new()),
        ];
        let (non_removable, removable) = classify_pods(&pods, &|pod| pod.name == "move");
        assert_eq!(non_removable.len(), 1);
        assert_eq!(non_removable[0].name, "keep");
        assert_eq!(removable.len(), 1);
        assert_eq!(removable[0].name, "move");
    }

    #[test]
    fn test_pod_tolerates_taints_needs_one_fitting_destination() {
        let taint = Taint {
            key: "dedicated".to_string(),
            value: "batch".to_string(),
            effect: TaintEffect::NoSchedule,
        };
        let taints_of_nodes = HashMap::from([
            ("tainted".to_string(), vec![taint.clone()]),
            ("open".to_string(), vec![]),
        ]);

        let intolerant = make_pod("intolerant", None, ResourceList::new());
        // the untainted destination is enough
        assert!(pod_tolerates_taints(&intolerant, &taints_of_nodes));

        let only_tainted = HashMap::from([("tainted".to_string(), vec![taint])]);
        assert!(!pod_tolerates_taints(&intolerant, &only_tainted));

        let tolerant = Arc::new(Pod {
            namespace: "default".to_string(),
            name: "tolerant".to_string(),
            spec: PodSpec {
                tolerations: vec![Toleration {
                    key: Some("dedicated".to_string()),
                    operator: TolerationOperator::Equal,
                    value: "batch".to_string(),
                    effect: Some(TaintEffect::NoSchedule),
                }],
                ..Default::default()
            },
        });
        assert!(pod_tolerates_taints(&tolerant, &only_tainted));
    }

    #[test]
    fn test_validate_thresholds() {
        let valid: ResourceThresholds = [(ResourceName::Cpu, 20.0)].into_iter().collect();
        assert!(validate_thresholds(&valid).is_ok());

        let negative: ResourceThresholds = [(ResourceName::Cpu, -1.0)].into_iter().collect();
        assert!(validate_thresholds(&negative).is_err());

        let too_big: ResourceThresholds = [(ResourceName::Cpu, 101.0)].into_iter().collect();
        assert!(validate_thresholds(&too_big).is_err());
    }

    #[test]
    fn test_format_usage_orders_basic_resources_first() {
        let usage: ResourceList = HashMap::from([
            (ResourceName::Cpu, Quantity::new_milli(1500, Format::DecimalSI)),
            (ResourceName::Memory, Quantity::new(3, Format::BinarySI)),
            (ResourceName::Pods, Quantity::new(7, Format::DecimalSI)),
        ]);
        assert_eq!(format_usage(&usage), "CPU=1500 Mem=3 Pods=7");
    }
}
