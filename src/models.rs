use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

/// Name of a node resource. CPU, memory and pod count are the basic
/// resources; anything else (GPUs, custom device plugins) is an extended
/// resource carried by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceName {
    Cpu,
    Memory,
    Pods,
    /// Synthetic resource recorded by the query usage source. We don't know
    /// what the user's query measures, so its result is filed under this
    /// name.
    Metric,
    Extended(String),
}

impl ResourceName {
    pub fn is_basic(&self) -> bool {
        matches!(self, Self::Cpu | Self::Memory | Self::Pods)
    }

    /// Memory is displayed in binary SI, everything else in decimal SI.
    pub fn default_format(&self) -> Format {
        match self {
            Self::Memory => Format::BinarySI,
            _ => Format::DecimalSI,
        }
    }
}

impl From<&str> for ResourceName {
    fn from(s: &str) -> Self {
        match s {
            "cpu" => Self::Cpu,
            "memory" => Self::Memory,
            "pods" => Self::Pods,
            "MetricResource" => Self::Metric,
            other => Self::Extended(other.to_string()),
        }
    }
}

impl From<String> for ResourceName {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<ResourceName> for String {
    fn from(name: ResourceName) -> Self {
        name.to_string()
    }
}

impl Display for ResourceName {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Memory => write!(f, "memory"),
            Self::Pods => write!(f, "pods"),
            Self::Metric => write!(f, "MetricResource"),
            Self::Extended(name) => write!(f, "{name}"),
        }
    }
}

/// Display format of a quantity. Affects formatting only, never arithmetic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    DecimalSI,
    BinarySI,
}

/// An amount of a resource. CPU quantities are counted in millicores, all
/// other resources in whole units. Internally everything is kept in
/// milli-units so arithmetic is exact at the unit the value was recorded in;
/// intermediate results are never rounded.
#[derive(Clone, Copy, Debug, Default)]
pub struct Quantity {
    millis: i64,
    format: Format,
}

impl Quantity {
    pub fn new(value: i64, format: Format) -> Self {
        Self {
            millis: value * 1000,
            format,
        }
    }

    pub fn new_milli(millis: i64, format: Format) -> Self {
        Self { millis, format }
    }

    pub fn zero_for(resource: &ResourceName) -> Self {
        Self::new(0, resource.default_format())
    }

    /// Whole-unit value, rounded up when a milli remainder is present.
    pub fn value(&self) -> i64 {
        if self.millis >= 0 {
            (self.millis + 999) / 1000
        } else {
            self.millis / 1000
        }
    }

    pub fn milli_value(&self) -> i64 {
        self.millis
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn is_zero(&self) -> bool {
        self.millis == 0
    }

    pub fn add(&mut self, rhs: Quantity) {
        self.millis += rhs.millis;
    }

    pub fn sub(&mut self, rhs: Quantity) {
        self.millis -= rhs.millis;
    }

    /// Compares against a whole-unit value.
    pub fn cmp_int64(&self, value: i64) -> Ordering {
        self.millis.cmp(&(value * 1000))
    }
}

/// Equality and ordering ignore the display format.
impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.millis == other.millis
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis.cmp(&other.millis)
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.millis % 1000 != 0 {
            return write!(f, "{}m", self.millis);
        }
        let mut value = self.millis / 1000;
        match self.format {
            Format::BinarySI => {
                let suffixes = ["", "Ki", "Mi", "Gi", "Ti", "Pi"];
                let mut idx = 0;
                while value != 0 && value % 1024 == 0 && idx < suffixes.len() - 1 {
                    value /= 1024;
                    idx += 1;
                }
                write!(f, "{}{}", value, suffixes[idx])
            }
            Format::DecimalSI => {
                let suffixes = ["", "k", "M", "G", "T", "P"];
                let mut idx = 0;
                while value != 0 && value % 1000 == 0 && idx < suffixes.len() - 1 {
                    value /= 1000;
                    idx += 1;
                }
                write!(f, "{}{}", value, suffixes[idx])
            }
        }
    }
}

/// Mapping from resource name to quantity. The holder owns the quantities,
/// so in-place headroom accounting needs no reference indirection.
pub type ResourceList = HashMap<ResourceName, Quantity>;

/// A floating point value in the <0;100> interval.
pub type Percentage = f64;

/// Per-resource percentage thresholds as supplied by the user.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceThresholds(HashMap<ResourceName, Percentage>);

impl ResourceThresholds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new ResourceThresholds with all its values negated.
    pub fn negative(&self) -> Self {
        Self(self.0.iter().map(|(k, v)| (k.clone(), -v)).collect())
    }

    /// Returns a new ResourceThresholds with all its values rounded to the
    /// nearest integer.
    pub fn round(&self) -> Self {
        Self(self.0.iter().map(|(k, v)| (k.clone(), v.round())).collect())
    }
}

impl Deref for ResourceThresholds {
    type Target = HashMap<ResourceName, Percentage>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ResourceThresholds {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<(ResourceName, Percentage)> for ResourceThresholds {
    fn from_iter<I: IntoIterator<Item = (ResourceName, Percentage)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Included/excluded namespaces for which a strategy is applicable. The
/// balancing core only consumes the exclusion list.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Namespaces {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct NodeSpec {
    pub unschedulable: bool,
    pub taints: Vec<Taint>,
}

/// Immutable snapshot of a worker node, valid for one balance pass.
#[derive(Clone, Debug, Default)]
pub struct Node {
    pub name: String,
    pub spec: NodeSpec,
    pub capacity: ResourceList,
    /// Capacity minus platform reservations. When non-empty it overrides
    /// `capacity`.
    pub allocatable: ResourceList,
}

impl Node {
    pub fn is_unschedulable(&self) -> bool {
        self.spec.unschedulable
    }
}

#[derive(Clone, Debug, Default)]
pub struct PodSpec {
    /// Priority of the pod, higher means more important to keep running.
    pub priority: Option<i32>,
    /// Declared minimum resources, summed over the pod's containers.
    pub requests: ResourceList,
    /// Declared resource ceilings, summed over the pod's containers.
    pub limits: ResourceList,
    pub node_name: Option<String>,
    pub tolerations: Vec<Toleration>,
}

/// Immutable snapshot of a workload unit, valid for one balance pass.
#[derive(Clone, Debug, Default)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub spec: PodSpec,
}

impl Pod {
    /// QoS class derived from the declared requests and limits.
    pub fn qos_class(&self) -> QoSClass {
        if self.spec.requests.is_empty() && self.spec.limits.is_empty() {
            return QoSClass::BestEffort;
        }
        let guaranteed = self.spec.limits.contains_key(&ResourceName::Cpu)
            && self.spec.limits.contains_key(&ResourceName::Memory)
            && self.spec.limits.len() == self.spec.requests.len()
            && self
                .spec
                .limits
                .iter()
                .all(|(name, limit)| self.spec.requests.get(name) == Some(limit));
        if guaranteed {
            QoSClass::Guaranteed
        } else {
            QoSClass::Burstable
        }
    }

    /// The declared request for a single resource, zero when absent.
    pub fn request_for(&self, resource: &ResourceName) -> Quantity {
        self.spec
            .requests
            .get(resource)
            .copied()
            .unwrap_or_else(|| Quantity::zero_for(resource))
    }

    pub fn tolerates_all(&self, taints: &[Taint]) -> bool {
        taints
            .iter()
            .all(|taint| self.spec.tolerations.iter().any(|t| t.tolerate(taint)))
    }
}

/// Coarse class of a pod, ordered by how tolerant the pod is to eviction:
/// BestEffort pods go first, Guaranteed pods last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoSClass {
    BestEffort,
    Burstable,
    Guaranteed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Clone, Debug)]
pub struct Taint {
    pub key: String,
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Clone, Debug, Default)]
pub enum TolerationOperator {
    Exists,
    #[default]
    Equal,
}

/// The pod this Toleration is attached to tolerates any taint that matches
/// the triple <key,value,effect> using the matching operator <operator>.
#[derive(Clone, Debug, Default)]
pub struct Toleration {
    /// Key is the taint key that the toleration applies to. Empty means match
    /// all taint keys; in that case the operator must be Exists.
    pub key: Option<String>,
    /// Valid operators are Exists and Equal. Defaults to Equal.
    pub operator: TolerationOperator,
    pub value: String,
    /// Effect indicates the taint effect to match. None means match all
    /// taint effects.
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    pub fn tolerate(&self, taint: &Taint) -> bool {
        if self.effect.is_some() && self.effect.as_ref() != Some(&taint.effect) {
            return false;
        }
        if self.key.is_some() && self.key.as_deref() != Some(taint.key.as_str()) {
            return false;
        }
        match self.operator {
            TolerationOperator::Equal => self.value == taint.value,
            TolerationOperator::Exists => true,
        }
    }
}
