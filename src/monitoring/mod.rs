//! Observability counters for the governance layer.
//!
//! Nothing here pushes data anywhere; consumers poll `Stats` snapshots.

mod stats;

pub use stats::{Stats, StatsAggregator, StatsReport};
