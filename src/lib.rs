//! Cluster rebalancing core.
//!
//! Workloads are initially placed by an external placement service. Placement
//! decisions grow stale as load shifts, so this crate periodically classifies
//! nodes by resource utilization and evicts pods from mis-utilized nodes,
//! letting the placer land them somewhere better. The two strategies are
//! `LowNodeUtilization` (relieve overutilized nodes) and `HighNodeUtilization`
//! (drain underutilized nodes so they can be scaled down).

pub mod classifier;
pub mod evictions;
pub mod models;
pub mod plugins;
pub mod thresholds;
pub mod usage;
