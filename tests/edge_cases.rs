use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use librebalancer::evictions::{EvictOptions, EvictionError, Evictor};
use librebalancer::models::{
    Format, Node, NodeSpec, Pod, PodSpec, Quantity, ResourceList, ResourceName,
    ResourceThresholds, Taint, TaintEffect, Toleration, TolerationOperator,
};
use librebalancer::plugins::low_node_utilization::{LowNodeUtilization, LowNodeUtilizationArgs};
use librebalancer::plugins::{BalancePlugin, Handle, MetricsUtilization};
use librebalancer::usage::measured::MetricsCollector;
use librebalancer::usage::PodsOnNodeFn;

#[derive(Default)]
struct RecordingEvictor {
    evicted: Mutex<Vec<String>>,
}

impl RecordingEvictor {
    fn evicted_pods(&self) -> Vec<String> {
        self.evicted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Evictor for RecordingEvictor {
    async fn evict(
        &self,
        _cancel: &CancellationToken,
        pod: &Pod,
        _opts: &EvictOptions,
    ) -> Result<(), EvictionError> {
        self.evicted
            .lock()
            .unwrap()
            .push(format!("{}/{}", pod.namespace, pod.name));
        Ok(())
    }

    fn filter(&self, _pod: &Pod) -> bool {
        true
    }

    fn pre_eviction_filter(&self, _pod: &Pod) -> bool {
        true
    }
}

fn make_node(name: &str, cpu_milli: i64, memory: i64, pods: i64) -> Arc<Node> {
    Arc::new(Node {
        name: name.to_string(),
        spec: NodeSpec::default(),
        capacity: HashMap::from([
            (
                ResourceName::Cpu,
                Quantity::new_milli(cpu_milli, Format::DecimalSI),
            ),
            (ResourceName::Memory, Quantity::new(memory, Format::BinarySI)),
            (ResourceName::Pods, Quantity::new(pods, Format::DecimalSI)),
        ]),
        allocatable: ResourceList::new(),
    })
}

fn make_pod(node: &str, name: &str, cpu_milli: i64, memory: i64, priority: i32) -> Arc<Pod> {
    Arc::new(Pod {
        namespace: "default".to_string(),
        name: name.to_string(),
        spec: PodSpec {
            priority: Some(priority),
            requests: HashMap::from([
                (
                    ResourceName::Cpu,
                    Quantity::new_milli(cpu_milli, Format::DecimalSI),
                ),
                (ResourceName::Memory, Quantity::new(memory, Format::BinarySI)),
            ]),
            node_name: Some(node.to_string()),
            ..Default::default()
        },
    })
}

fn pod_lister(pods: &[Arc<Pod>]) -> PodsOnNodeFn {
    let mut by_node: HashMap<String, Vec<Arc<Pod>>> = HashMap::new();
    for pod in pods {
        if let Some(node) = &pod.spec.node_name {
            by_node.entry(node.clone()).or_default().push(pod.clone());
        }
    }
    Arc::new(move |node| by_node.get(node).cloned().unwrap_or_default())
}

fn make_handle(evictor: Arc<RecordingEvictor>, pods: &[Arc<Pod>]) -> Handle {
    Handle {
        evictor,
        pods_on_node: pod_lister(pods),
        metrics_collector: None,
        query_backend: None,
    }
}

fn cpu_mem_thresholds(pct: f64) -> ResourceThresholds {
    [(ResourceName::Cpu, pct), (ResourceName::Memory, pct)]
        .into_iter()
        .collect()
}

#[tokio::test]
async fn test_deviation_thresholds_balance_around_the_mean() {
    // the cluster averages 50% cpu/memory; with a deviation of 10 the
    // bounds land at 40% and 60%
    let mut pods = vec![make_pod("node-a", "a-light", 100, 10, 5)];
    for i in 0..9 {
        pods.push(make_pod("node-b", &format!("b-pod{i}"), 100, 10, i));
    }
    let nodes = vec![
        make_node("node-a", 1000, 100, 20),
        make_node("node-b", 1000, 100, 20),
    ];

    let evictor = Arc::new(RecordingEvictor::default());
    let args = LowNodeUtilizationArgs {
        thresholds: cpu_mem_thresholds(10.0),
        target_thresholds: cpu_mem_thresholds(10.0),
        use_deviation_thresholds: true,
        ..Default::default()
    };
    let mut plugin = LowNodeUtilization::new(args, make_handle(evictor.clone(), &pods)).unwrap();

    plugin
        .balance(&CancellationToken::new(), &nodes)
        .await
        .unwrap();

    // three evictions bring node-b from 90% down to the 60% bound
    assert_eq!(
        evictor.evicted_pods(),
        vec!["default/b-pod0", "default/b-pod1", "default/b-pod2"]
    );
}

#[tokio::test]
async fn test_qos_breaks_priority_ties() {
    let best_effort = Arc::new(Pod {
        namespace: "default".to_string(),
        name: "b-best-effort".to_string(),
        spec: PodSpec {
            priority: Some(1),
            node_name: Some("node-b".to_string()),
            ..Default::default()
        },
    });
    let burstable = make_pod("node-b", "b-burstable", 400, 40, 1);
    let guaranteed_resources: ResourceList = HashMap::from([
        (
            ResourceName::Cpu,
            Quantity::new_milli(400, Format::DecimalSI),
        ),
        (ResourceName::Memory, Quantity::new(40, Format::BinarySI)),
    ]);
    let guaranteed = Arc::new(Pod {
        namespace: "default".to_string(),
        name: "b-guaranteed".to_string(),
        spec: PodSpec {
            priority: Some(1),
            requests: guaranteed_resources.clone(),
            limits: guaranteed_resources,
            node_name: Some("node-b".to_string()),
            ..Default::default()
        },
    });

    let pods = vec![
        make_pod("node-a", "a-light", 100, 10, 5),
        guaranteed,
        best_effort,
        burstable,
    ];
    let nodes = vec![
        make_node("node-a", 1000, 100, 10),
        make_node("node-b", 1000, 100, 10),
    ];

    let evictor = Arc::new(RecordingEvictor::default());
    let args = LowNodeUtilizationArgs {
        thresholds: cpu_mem_thresholds(20.0),
        target_thresholds: cpu_mem_thresholds(50.0),
        ..Default::default()
    };
    let mut plugin = LowNodeUtilization::new(args, make_handle(evictor.clone(), &pods)).unwrap();

    plugin
        .balance(&CancellationToken::new(), &nodes)
        .await
        .unwrap();

    // all three pods share a priority: the best effort pod goes first, and
    // since it requests nothing the burstable pod has to follow
    assert_eq!(
        evictor.evicted_pods(),
        vec!["default/b-best-effort", "default/b-burstable"]
    );
}

#[tokio::test]
async fn test_extended_resources_drive_the_balance() {
    let gpu = ResourceName::Extended("nvidia.com/gpu".to_string());

    let mut gpu_pod = make_pod("node-b", "b-gpu-burner", 100, 10, 1);
    Arc::get_mut(&mut gpu_pod)
        .unwrap()
        .spec
        .requests
        .insert(gpu.clone(), Quantity::new(7, Format::DecimalSI));
    let pods = vec![make_pod("node-a", "a-light", 100, 10, 5), gpu_pod];

    let gpu_capacity = |node: Arc<Node>| {
        let mut node = Arc::try_unwrap(node).unwrap();
        node.capacity.insert(gpu.clone(), Quantity::new(8, Format::DecimalSI));
        Arc::new(node)
    };
    let nodes = vec![
        gpu_capacity(make_node("node-a", 1000, 100, 10)),
        gpu_capacity(make_node("node-b", 1000, 100, 10)),
    ];

    let evictor = Arc::new(RecordingEvictor::default());
    let args = LowNodeUtilizationArgs {
        thresholds: [
            (ResourceName::Cpu, 20.0),
            (ResourceName::Memory, 20.0),
            (gpu.clone(), 20.0),
        ]
        .into_iter()
        .collect(),
        target_thresholds: [
            (ResourceName::Cpu, 80.0),
            (ResourceName::Memory, 80.0),
            (gpu, 80.0),
        ]
        .into_iter()
        .collect(),
        ..Default::default()
    };
    let mut plugin = LowNodeUtilization::new(args, make_handle(evictor.clone(), &pods)).unwrap();

    plugin
        .balance(&CancellationToken::new(), &nodes)
        .await
        .unwrap();

    // node-b is overutilized on the gpu alone: 7 of 8 requested while cpu
    // and memory stay low
    assert_eq!(evictor.evicted_pods(), vec!["default/b-gpu-burner"]);
}

#[tokio::test]
async fn test_intolerant_pods_are_passed_over() {
    let taint = Taint {
        key: "dedicated".to_string(),
        value: "infra".to_string(),
        effect: TaintEffect::NoSchedule,
    };
    let mut tainted_destination = make_node("node-a", 1000, 100, 10);
    Arc::get_mut(&mut tainted_destination)
        .unwrap()
        .spec
        .taints = vec![taint];
    let nodes = vec![tainted_destination, make_node("node-b", 1000, 100, 10)];

    let mut tolerant = make_pod("node-b", "b-tolerant", 450, 45, 2);
    Arc::get_mut(&mut tolerant).unwrap().spec.tolerations = vec![Toleration {
        key: Some("dedicated".to_string()),
        operator: TolerationOperator::Equal,
        value: "infra".to_string(),
        effect: Some(TaintEffect::NoSchedule),
    }];
    let pods = vec![
        make_pod("node-a", "a-light", 100, 10, 5),
        make_pod("node-b", "b-intolerant", 450, 45, 1),
        tolerant,
    ];

    let evictor = Arc::new(RecordingEvictor::default());
    let args = LowNodeUtilizationArgs {
        thresholds: cpu_mem_thresholds(20.0),
        target_thresholds: cpu_mem_thresholds(80.0),
        ..Default::default()
    };
    let mut plugin = LowNodeUtilization::new(args, make_handle(evictor.clone(), &pods)).unwrap();

    plugin
        .balance(&CancellationToken::new(), &nodes)
        .await
        .unwrap();

    // the lower priority pod would go first but cannot land on the only
    // destination, so the tolerant one is evicted instead
    assert_eq!(evictor.evicted_pods(), vec!["default/b-tolerant"]);
}

struct FakeCollector {
    nodes: HashMap<String, ResourceList>,
    pod_usage: HashMap<String, ResourceList>,
}

#[async_trait]
impl MetricsCollector for FakeCollector {
    async fn all_nodes_usage(&self) -> Result<HashMap<String, ResourceList>> {
        Ok(self.nodes.clone())
    }

    async fn pod_metrics(&self, namespace: &str, name: &str) -> Result<Vec<ResourceList>> {
        Ok(vec![self
            .pod_usage
            .get(&format!("{namespace}/{name}"))
            .cloned()
            .unwrap_or_default()])
    }
}

fn measured_usage(cpu_milli: i64, memory: i64) -> ResourceList {
    HashMap::from([
        (
            ResourceName::Cpu,
            Quantity::new_milli(cpu_milli, Format::DecimalSI),
        ),
        (ResourceName::Memory, Quantity::new(memory, Format::BinarySI)),
    ])
}

#[tokio::test]
async fn test_measured_source_follows_actual_usage() {
    // declared requests are tiny everywhere; only the metrics oracle knows
    // node-b is hot
    let pods = vec![
        make_pod("node-a", "a-pod", 10, 1, 5),
        make_pod("node-b", "b-pod1", 10, 1, 1),
        make_pod("node-b", "b-pod2", 10, 1, 2),
        make_pod("node-b", "b-pod3", 10, 1, 3),
    ];
    let nodes = vec![
        make_node("node-a", 1000, 100, 10),
        make_node("node-b", 1000, 100, 10),
    ];

    let collector = Arc::new(FakeCollector {
        nodes: HashMap::from([
            ("node-a".to_string(), measured_usage(100, 10)),
            ("node-b".to_string(), measured_usage(900, 90)),
        ]),
        pod_usage: HashMap::from([
            ("default/b-pod1".to_string(), measured_usage(300, 30)),
            ("default/b-pod2".to_string(), measured_usage(300, 30)),
            ("default/b-pod3".to_string(), measured_usage(300, 30)),
        ]),
    });

    let evictor = Arc::new(RecordingEvictor::default());
    let handle = Handle {
        evictor: evictor.clone(),
        pods_on_node: pod_lister(&pods),
        metrics_collector: Some(collector),
        query_backend: None,
    };

    let args = LowNodeUtilizationArgs {
        thresholds: cpu_mem_thresholds(20.0),
        target_thresholds: cpu_mem_thresholds(80.0),
        metrics_utilization: MetricsUtilization {
            metrics_server: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut plugin = LowNodeUtilization::new(args, handle).unwrap();

    plugin
        .balance(&CancellationToken::new(), &nodes)
        .await
        .unwrap();

    // one 300m pod off node-b brings the measured usage to 60%, below the
    // 80% target
    assert_eq!(evictor.evicted_pods(), vec!["default/b-pod1"]);
}

#[tokio::test]
async fn test_measured_source_missing_node_fails_the_pass() {
    let pods = vec![make_pod("node-a", "a-pod", 10, 1, 5)];
    let nodes = vec![
        make_node("node-a", 1000, 100, 10),
        make_node("node-b", 1000, 100, 10),
    ];

    let collector = Arc::new(FakeCollector {
        nodes: HashMap::from([("node-a".to_string(), measured_usage(100, 10))]),
        pod_usage: HashMap::new(),
    });

    let evictor = Arc::new(RecordingEvictor::default());
    let handle = Handle {
        evictor: evictor.clone(),
        pods_on_node: pod_lister(&pods),
        metrics_collector: Some(collector),
        query_backend: None,
    };

    let args = LowNodeUtilizationArgs {
        thresholds: cpu_mem_thresholds(20.0),
        target_thresholds: cpu_mem_thresholds(80.0),
        metrics_utilization: MetricsUtilization {
            metrics_server: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut plugin = LowNodeUtilization::new(args, handle).unwrap();

    let err = plugin
        .balance(&CancellationToken::new(), &nodes)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unable to find node"));
    assert!(evictor.evicted_pods().is_empty());
}
