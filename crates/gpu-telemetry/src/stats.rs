//! `stats` derives statistical and health signals from the sample history.
//!
//! The [`Aggregator`] recomputes per-device statistics and a cluster rollup
//! on a fixed cadence. Derived values are replaced whole on every pass and
//! read out as copies; a rollup is never patched after publication.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::alert::{Health, Thresholds};
use crate::cost::{CostEstimate, CostModel};
use crate::sample::Sample;
use crate::store::HistoryStore;

/// Below this utilization a device counts as idle for idle-time accounting
/// and activity classification.
const IDLE_UTILIZATION_PCT: f64 = 5.0;

/// Errors from statistics computations.
#[derive(Debug, Error)]
pub enum StatsError {
    /// No samples in the window for this device.
    #[error("no samples for device {id}")]
    NoSamples {
        /// The device in question
        id: String,
    },

    /// The computation needs more points than the window holds.
    #[error("need at least {needed} samples, got {got}")]
    NotEnoughSamples { needed: usize, got: usize },
}

/// Derived statistics for one device over one aggregation window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub device_id: String,
    /// The window the statistics cover
    pub period: Duration,
    pub average_utilization_pct: f64,
    pub average_memory_used_mb: f64,
    pub average_temperature_c: f64,
    pub average_power_draw_w: f64,
    pub peak_utilization_pct: f64,
    pub peak_memory_used_mb: u64,
    pub peak_temperature_c: f64,
    pub peak_power_draw_w: f64,
    /// Fraction of the window spent below the idle utilization cutoff
    pub idle_time_pct: f64,
    /// Average utilization per watt; 0 when no power was drawn
    pub efficiency_score: f64,
    /// Trapezoidal integral of power draw over the window
    pub total_energy_kwh: f64,
    pub uptime_hours: f64,
    /// Number of adjacent sample pairs whose process count differed
    pub process_switches: u32,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub sample_count: usize,
}

/// Point-in-time rollup across the whole fleet. Snapshots only; a published
/// rollup is never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRollup {
    pub total_devices: usize,
    /// Devices whose latest sample shows activity
    pub active_devices: usize,
    pub healthy_devices: usize,
    /// Devices not in a critical state
    pub available_devices: usize,
    pub average_utilization_pct: f64,
    pub average_temperature_c: f64,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub total_power_draw_w: f64,
    pub device_stats: HashMap<String, DeviceStats>,
    pub device_health: HashMap<String, Health>,
    /// What each device's usage over the window cost
    pub device_costs: HashMap<String, CostEstimate>,
    /// Sum of per-device totals, after discounts and tax
    pub total_cost: f64,
    /// Timestamp of the newest sample that went into this rollup
    pub generated_at: DateTime<Utc>,
}

/// Which metric a trend is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendMetric {
    Utilization,
    MemoryUsed,
    Temperature,
    PowerDraw,
}

impl TrendMetric {
    fn value(&self, sample: &Sample) -> f64 {
        match self {
            TrendMetric::Utilization => sample.utilization_pct,
            TrendMetric::MemoryUsed => sample.memory_used_mb as f64,
            TrendMetric::Temperature => sample.temperature_c,
            TrendMetric::PowerDraw => sample.power_draw_w,
        }
    }
}

/// Least-squares fit of a metric against time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    /// Metric units per hour
    pub slope_per_hour: f64,
    /// Goodness of fit in [0, 1]; 0 when the fit is degenerate
    pub r_squared: f64,
}

/// Aggregation cadence, window, and pricing.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub aggregation_interval: Duration,
    /// Window over which statistics are computed
    pub retention_period: Duration,
    /// Pricing applied to each device's windowed usage
    pub cost_model: CostModel,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            aggregation_interval: Duration::from_secs(30),
            retention_period: Duration::from_secs(3600),
            cost_model: CostModel::default(),
        }
    }
}

#[derive(Default)]
struct AggState {
    device_stats: HashMap<String, DeviceStats>,
    device_costs: HashMap<String, CostEstimate>,
    rollup: Option<ClusterRollup>,
}

/// Periodic statistics engine over a [`HistoryStore`].
pub struct Aggregator {
    store: Arc<HistoryStore>,
    thresholds: Thresholds,
    config: AggregatorConfig,
    state: RwLock<AggState>,
}

impl Aggregator {
    pub fn new(store: Arc<HistoryStore>, thresholds: Thresholds, config: AggregatorConfig) -> Self {
        Aggregator {
            store,
            thresholds,
            config,
            state: RwLock::new(AggState::default()),
        }
    }

    /// Spawn the aggregation loop.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let aggregator = self;
        let token = cancel.child_token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregator.config.aggregation_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("aggregation loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        aggregator.perform_aggregation();
                    }
                }
            }
        })
    }

    /// Recompute every device's statistics, cost estimate, and the cluster
    /// rollup, replacing the published state wholesale.
    ///
    /// The window for each device ends at its newest sample, so running this
    /// twice with no new samples produces identical output.
    #[instrument(level = "debug", skip(self))]
    pub fn perform_aggregation(&self) {
        let mut device_stats = HashMap::new();
        let mut device_costs = HashMap::new();
        let mut device_health = HashMap::new();
        let mut latest_samples = Vec::new();

        for device_id in self.store.device_ids() {
            let all = self.store.history(&device_id, None);
            let last = match all.last() {
                Some(s) => s.clone(),
                None => continue,
            };
            let window_start = last.timestamp - retention_window(self.config.retention_period);
            let windowed: Vec<Sample> = all
                .into_iter()
                .filter(|s| s.timestamp >= window_start)
                .collect();
            if let Ok(stats) =
                compute_device_stats(&device_id, &windowed, self.config.retention_period)
            {
                let cost = self.config.cost_model.estimate(
                    &device_id,
                    &last.device_name,
                    stats.average_utilization_pct,
                    stats.uptime_hours,
                );
                device_costs.insert(device_id.clone(), cost);
                device_stats.insert(device_id.clone(), stats);
            }
            device_health.insert(device_id.clone(), self.thresholds.health(&last));
            latest_samples.push(last);
        }

        let rollup = build_rollup(
            latest_samples,
            device_stats.clone(),
            device_health,
            device_costs.clone(),
        );

        let mut state = self.state.write().unwrap();
        state.device_stats = device_stats;
        state.device_costs = device_costs;
        state.rollup = rollup;
    }

    /// Copy of the latest statistics for one device.
    pub fn device_stats(&self, device_id: &str) -> Option<DeviceStats> {
        let state = self.state.read().unwrap();
        state.device_stats.get(device_id).cloned()
    }

    /// Copy of the latest cost estimate for one device.
    pub fn cost_estimate(&self, device_id: &str) -> Option<CostEstimate> {
        let state = self.state.read().unwrap();
        state.device_costs.get(device_id).cloned()
    }

    /// Copy of the latest cluster rollup, if one has been computed.
    pub fn cluster_rollup(&self) -> Option<ClusterRollup> {
        let state = self.state.read().unwrap();
        state.rollup.clone()
    }

    /// Fit a trend line for one metric over the device's windowed history.
    pub fn trend(&self, device_id: &str, metric: TrendMetric) -> Result<Trend, StatsError> {
        let samples = self.store.history(device_id, None);
        let last = samples.last().ok_or_else(|| StatsError::NoSamples {
            id: device_id.to_string(),
        })?;
        let window_start = last.timestamp - retention_window(self.config.retention_period);
        let windowed: Vec<&Sample> = samples
            .iter()
            .filter(|s| s.timestamp >= window_start)
            .collect();
        if windowed.len() < 2 {
            return Err(StatsError::NotEnoughSamples {
                needed: 2,
                got: windowed.len(),
            });
        }
        let first_ts = windowed[0].timestamp;
        let points: Vec<(f64, f64)> = windowed
            .iter()
            .map(|s| (hours_between(first_ts, s.timestamp), metric.value(s)))
            .collect();
        Ok(linear_regression(&points))
    }
}

fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 3_600_000.0
}

// An unrepresentable window clamps to roughly a century, which is as good as
// unbounded for a ring buffer.
fn retention_window(period: Duration) -> chrono::Duration {
    chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Compute one device's statistics from its windowed sample sequence.
pub fn compute_device_stats(
    device_id: &str,
    samples: &[Sample],
    period: Duration,
) -> Result<DeviceStats, StatsError> {
    if samples.is_empty() {
        return Err(StatsError::NoSamples {
            id: device_id.to_string(),
        });
    }

    let n = samples.len() as f64;
    let average_utilization_pct = samples.iter().map(|s| s.utilization_pct).sum::<f64>() / n;
    let average_memory_used_mb = samples.iter().map(|s| s.memory_used_mb as f64).sum::<f64>() / n;
    let average_temperature_c = samples.iter().map(|s| s.temperature_c).sum::<f64>() / n;
    let average_power_draw_w = samples.iter().map(|s| s.power_draw_w).sum::<f64>() / n;

    let peak_utilization_pct = samples
        .iter()
        .map(|s| s.utilization_pct)
        .fold(0.0_f64, f64::max);
    let peak_memory_used_mb = samples.iter().map(|s| s.memory_used_mb).max().unwrap_or(0);
    let peak_temperature_c = samples
        .iter()
        .map(|s| s.temperature_c)
        .fold(0.0_f64, f64::max);
    let peak_power_draw_w = samples
        .iter()
        .map(|s| s.power_draw_w)
        .fold(0.0_f64, f64::max);

    let first = &samples[0];
    let last = &samples[samples.len() - 1];
    let span_hours = hours_between(first.timestamp, last.timestamp);

    let mut idle_hours = 0.0;
    let mut total_energy_kwh = 0.0;
    let mut process_switches = 0u32;
    for pair in samples.windows(2) {
        let dt_hours = hours_between(pair[0].timestamp, pair[1].timestamp);
        if pair[1].utilization_pct < IDLE_UTILIZATION_PCT {
            idle_hours += dt_hours;
        }
        total_energy_kwh += (pair[1].power_draw_w + pair[0].power_draw_w) / 2.0 * dt_hours / 1000.0;
        if pair[1].process_count != pair[0].process_count {
            process_switches += 1;
        }
    }
    let idle_time_pct = if span_hours > 0.0 {
        idle_hours / span_hours * 100.0
    } else {
        0.0
    };

    let efficiency_score = if average_power_draw_w > 0.0 {
        average_utilization_pct / average_power_draw_w
    } else {
        0.0
    };

    Ok(DeviceStats {
        device_id: device_id.to_string(),
        period,
        average_utilization_pct,
        average_memory_used_mb,
        average_temperature_c,
        average_power_draw_w,
        peak_utilization_pct,
        peak_memory_used_mb,
        peak_temperature_c,
        peak_power_draw_w,
        idle_time_pct,
        efficiency_score,
        total_energy_kwh,
        uptime_hours: span_hours,
        process_switches,
        start_time: first.timestamp,
        end_time: last.timestamp,
        sample_count: samples.len(),
    })
}

fn build_rollup(
    latest: Vec<Sample>,
    device_stats: HashMap<String, DeviceStats>,
    device_health: HashMap<String, Health>,
    device_costs: HashMap<String, CostEstimate>,
) -> Option<ClusterRollup> {
    if latest.is_empty() {
        return None;
    }
    let total_devices = latest.len();
    let active_devices = latest
        .iter()
        .filter(|s| s.utilization_pct >= IDLE_UTILIZATION_PCT || s.process_count > 0)
        .count();
    let healthy_devices = device_health
        .values()
        .filter(|h| **h == Health::Healthy)
        .count();
    let available_devices = device_health
        .values()
        .filter(|h| **h != Health::Critical)
        .count();
    let average_utilization_pct =
        latest.iter().map(|s| s.utilization_pct).sum::<f64>() / total_devices as f64;
    let average_temperature_c =
        latest.iter().map(|s| s.temperature_c).sum::<f64>() / total_devices as f64;
    let total_memory_mb = latest.iter().map(|s| s.memory_total_mb).sum();
    let used_memory_mb = latest.iter().map(|s| s.memory_used_mb).sum();
    let total_power_draw_w = latest.iter().map(|s| s.power_draw_w).sum();
    let total_cost = device_costs.values().map(|c| c.total_cost).sum();
    let generated_at = latest
        .iter()
        .map(|s| s.timestamp)
        .max()
        .expect("non-empty latest set");

    Some(ClusterRollup {
        total_devices,
        active_devices,
        healthy_devices,
        available_devices,
        average_utilization_pct,
        average_temperature_c,
        total_memory_mb,
        used_memory_mb,
        total_power_draw_w,
        device_stats,
        device_health,
        device_costs,
        total_cost,
        generated_at,
    })
}

/// Ordinary least-squares fit over `(x, y)` points.
///
/// Degenerate inputs (zero variance in either axis, non-finite intermediate
/// values) produce an r² of 0 rather than NaN.
pub fn linear_regression(points: &[(f64, f64)]) -> Trend {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (x, y) in points {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    let slope_per_hour = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    let mut r_squared = if sxx > 0.0 && syy > 0.0 {
        (sxy * sxy) / (sxx * syy)
    } else {
        0.0
    };
    if !r_squared.is_finite() {
        r_squared = 0.0;
    }
    Trend {
        slope_per_hour,
        r_squared,
    }
}
