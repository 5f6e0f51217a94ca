//! The GPU telemetry pipeline.
//!
//! One [`Collector`](collector::Collector) polls a [`SampleSource`](source::SampleSource)
//! on a fixed cadence and appends one [`Sample`](sample::Sample) per device to
//! the bounded [`HistoryStore`](store::HistoryStore), fanning each sample out
//! to registered observers (alert evaluation, cost recording, dashboards).
//! The [`Aggregator`](stats::Aggregator) periodically derives per-device
//! statistics, cluster rollups, trend lines, and cost estimates from the
//! stored history.
//!
//! Two source variants ship in this crate: [`SmiSource`](source::SmiSource),
//! which shells out to the vendor query tool, and
//! [`SyntheticSource`](source::SyntheticSource), which simulates a fleet for
//! development and tests.

pub mod alert;
pub mod collector;
pub mod cost;
pub mod sample;
pub mod source;
pub mod stats;
pub mod store;

pub use alert::{Alert, AlertEvaluator, AlertKind, Health, Severity, Thresholds};
pub use collector::{Collector, SampleObserver, SystemOverview};
pub use cost::{CostEstimate, CostModel};
pub use sample::{GpuProcess, Sample};
pub use source::{SampleSource, SmiSource, SourceError, SyntheticSource, WorkloadPattern};
pub use stats::{
    Aggregator, AggregatorConfig, ClusterRollup, DeviceStats, StatsError, Trend, TrendMetric,
};
pub use store::HistoryStore;
