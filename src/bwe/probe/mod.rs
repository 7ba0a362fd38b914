//! Probing: sending short bursts above the estimate to find spare capacity.

mod cluster;
mod control;
mod estimator;

pub use cluster::{ProbeClusterConfig, ProbeClusterState};
pub(crate) use control::ProbeControl;
pub use estimator::ProbeEstimator;
