//! The eviction seam between the balancing core and the platform. The core
//! never terminates workloads itself; it asks the evictor and respects the
//! quota errors the evictor reports back.

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::Pod;

/// Options recorded alongside each eviction request.
#[derive(Clone, Debug, Default)]
pub struct EvictOptions {
    /// Strategy that requested the eviction.
    pub strategy_name: String,
}

#[derive(Error, Debug)]
pub enum EvictionError {
    /// The per-node eviction quota was reached.
    #[error("maximum number of evicted pods per node {node:?} reached ({limit})")]
    NodeLimit { node: String, limit: usize },

    /// The per-namespace eviction quota was reached.
    #[error("maximum number of evicted pods per namespace {namespace:?} reached ({limit})")]
    NamespaceLimit { namespace: String, limit: usize },

    /// The cluster-wide eviction quota was reached.
    #[error("maximum number of evicted pods reached ({limit})")]
    TotalLimit { limit: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Eviction backend provided by the outer loop.
#[async_trait]
pub trait Evictor: Send + Sync {
    /// Requests a graceful eviction of the pod so its controller can
    /// re-create it elsewhere.
    async fn evict(
        &self,
        cancel: &CancellationToken,
        pod: &Pod,
        opts: &EvictOptions,
    ) -> Result<(), EvictionError>;

    /// Whether the pod may be considered for eviction at all.
    fn filter(&self, pod: &Pod) -> bool;

    /// Final check right before an eviction is issued.
    fn pre_eviction_filter(&self, pod: &Pod) -> bool;
}
