//! Usage assessment from a user supplied time-series query. We don't know
//! what the query measures (it could be cpu, memory, anything) so the result
//! is recorded under the synthetic `Metric` resource and must come back as a
//! per-node value inside the <0;1> interval.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::time::{timeout, Duration};

use crate::models::{Format, Node, Pod, Quantity, ResourceList, ResourceName};
use crate::usage::{PodsOnNodeFn, UsageError, UsageSource, UsageSourceKind};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Label carrying the node name in every vector sample.
const INSTANCE_LABEL: &str = "instance";

/// One element of a vector query result.
#[derive(Clone, Debug)]
pub struct VectorSample {
    pub labels: HashMap<String, String>,
    pub value: f64,
}

/// Result of an instant query against the time-series backend.
#[derive(Clone, Debug)]
pub enum QueryValue {
    Vector(Vec<VectorSample>),
    Scalar(f64),
    String(String),
}

impl QueryValue {
    fn kind(&self) -> &'static str {
        match self {
            Self::Vector(_) => "vector",
            Self::Scalar(_) => "scalar",
            Self::String(_) => "string",
        }
    }
}

/// Backend executing synchronous instant queries.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn instant_query(&self, query: &str) -> Result<QueryValue>;
}

/// Assesses node usage by running a scalar time-series query that is
/// expected to return one vector sample per node.
pub struct QueryUsageSource {
    pods_on_node: PodsOnNodeFn,
    backend: Arc<dyn QueryBackend>,
    query: String,
    pods: HashMap<String, Vec<Arc<Pod>>>,
    node_utilization: HashMap<String, ResourceList>,
}

impl QueryUsageSource {
    pub fn new(pods_on_node: PodsOnNodeFn, backend: Arc<dyn QueryBackend>, query: String) -> Self {
        Self {
            pods_on_node,
            backend,
            query,
            pods: HashMap::new(),
            node_utilization: HashMap::new(),
        }
    }
}

#[async_trait]
impl UsageSource for QueryUsageSource {
    async fn sync(&mut self, nodes: &[Arc<Node>]) -> Result<()> {
        let results = timeout(QUERY_TIMEOUT, self.backend.instant_query(&self.query))
            .await
            .map_err(|_| anyhow!("timed out running query {:?}", self.query))?
            .map_err(|err| anyhow!("unable to capture query metrics: {err}"))?;

        let samples = match results {
            QueryValue::Vector(samples) => samples,
            other => bail!(
                "expected query results to be of type \"vector\", got {:?} instead",
                other.kind()
            ),
        };

        let mut node_usages = HashMap::new();
        for sample in samples {
            let Some(node_name) = sample.labels.get(INSTANCE_LABEL) else {
                bail!("the collected metrics sample is missing {INSTANCE_LABEL:?} key");
            };

            if sample.value < 0.0 || sample.value > 1.0 {
                bail!(
                    "the collected metrics sample for {:?} has value {} outside of <0; 1> interval",
                    node_name,
                    sample.value
                );
            }

            node_usages.insert(
                node_name.clone(),
                HashMap::from([(
                    ResourceName::Metric,
                    Quantity::new((sample.value * 100.0) as i64, Format::DecimalSI),
                )]),
            );
        }

        let mut node_utilization = HashMap::new();
        let mut pods_by_node = HashMap::new();
        for node in nodes {
            let Some(usage) = node_usages.get(&node.name) else {
                bail!("unable to find metric entry for {}", node.name);
            };

            node_utilization.insert(node.name.clone(), usage.clone());
            pods_by_node.insert(node.name.clone(), (self.pods_on_node)(&node.name));
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

    async fn pod_usage(&self, _pod: &Pod) -> Result<ResourceList, UsageError> {
        Err(UsageError::NotSupported {
            kind: UsageSourceKind::Query,
            message: "fetching pod usage is not supported by the query usage source".to_string(),
        })
    }

    /// Whatever the query measures, a node can hold at most 100% of it.
    fn node_capacity(&self, _node: &Node) -> ResourceList {
        HashMap::from([(
            ResourceName::Metric,
            Quantity::new(100, Format::DecimalSI),
        )])
    }
}
