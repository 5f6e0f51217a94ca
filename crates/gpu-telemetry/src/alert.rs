//! `alert` evaluates incoming samples against configurable thresholds.
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collector::SampleObserver;
use crate::sample::Sample;

/// Per-device alert history is bounded at this many entries, oldest-evicted.
const HISTORY_CAPACITY: usize = 100;

/// A utilization jump larger than this between consecutive samples emits an
/// informational alert.
const UTILIZATION_JUMP_PCT: f64 = 50.0;

/// Which dimension an alert fired on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Temperature,
    Memory,
    Power,
    Utilization,
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Simplified device health, the maximum severity across dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Warning,
    Critical,
}

/// One threshold crossing on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub device_id: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    /// The observed value that crossed the threshold
    pub value: f64,
    /// The threshold it crossed
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

/// Alerting thresholds. The warning/critical pairs also drive the health
/// classification used in cluster rollups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub temperature_high_c: f64,
    pub temperature_critical_c: f64,
    pub memory_high_pct: f64,
    pub memory_critical_pct: f64,
    pub power_high_pct: f64,
    pub power_critical_pct: f64,
    pub utilization_low_pct: f64,
    pub utilization_high_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            temperature_high_c: 75.0,
            temperature_critical_c: 85.0,
            memory_high_pct: 80.0,
            memory_critical_pct: 95.0,
            power_high_pct: 80.0,
            power_critical_pct: 95.0,
            utilization_low_pct: 10.0,
            utilization_high_pct: 95.0,
        }
    }
}

impl Thresholds {
    /// Classify a sample: the worst of the temperature, memory, and power
    /// dimensions. Utilization extremes are alert-worthy but do not make a
    /// device unhealthy.
    pub fn health(&self, sample: &Sample) -> Health {
        let memory_pct = sample.memory_used_pct();
        let power_pct = sample.power_pct();
        if sample.temperature_c >= self.temperature_critical_c
            || memory_pct >= self.memory_critical_pct
            || power_pct >= self.power_critical_pct
        {
            Health::Critical
        } else if sample.temperature_c >= self.temperature_high_c
            || memory_pct >= self.memory_high_pct
            || power_pct >= self.power_high_pct
        {
            Health::Warning
        } else {
            Health::Healthy
        }
    }
}

struct EvalState {
    previous: HashMap<String, Sample>,
    history: HashMap<String, VecDeque<Alert>>,
}

/// Stateful evaluator: compares each sample against the thresholds and the
/// device's previous sample, keeping a bounded per-device alert history.
pub struct AlertEvaluator {
    thresholds: Thresholds,
    state: RwLock<EvalState>,
}

impl AlertEvaluator {
    pub fn new(thresholds: Thresholds) -> Self {
        AlertEvaluator {
            thresholds,
            state: RwLock::new(EvalState {
                previous: HashMap::new(),
                history: HashMap::new(),
            }),
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Evaluate one sample, returning the alerts it generated (possibly
    /// none). Generated alerts are also appended to the device's history.
    pub fn evaluate(&self, sample: &Sample) -> Vec<Alert> {
        let mut alerts = Vec::new();
        let t = &self.thresholds;
        let now = sample.timestamp;

        let alert = |kind, severity, message: String, value: f64, threshold: f64| Alert {
            device_id: sample.device_id.clone(),
            kind,
            severity,
            message,
            value,
            threshold,
            timestamp: now,
            acknowledged: false,
        };

        if sample.temperature_c >= t.temperature_critical_c {
            alerts.push(alert(
                AlertKind::Temperature,
                Severity::Critical,
                format!("temperature {:.0}C at critical level", sample.temperature_c),
                sample.temperature_c,
                t.temperature_critical_c,
            ));
        } else if sample.temperature_c >= t.temperature_high_c {
            alerts.push(alert(
                AlertKind::Temperature,
                Severity::Warning,
                format!("temperature {:.0}C running hot", sample.temperature_c),
                sample.temperature_c,
                t.temperature_high_c,
            ));
        }

        let memory_pct = sample.memory_used_pct();
        if memory_pct >= t.memory_critical_pct {
            alerts.push(alert(
                AlertKind::Memory,
                Severity::Critical,
                format!("memory {:.1}% nearly exhausted", memory_pct),
                memory_pct,
                t.memory_critical_pct,
            ));
        } else if memory_pct >= t.memory_high_pct {
            alerts.push(alert(
                AlertKind::Memory,
                Severity::Warning,
                format!("memory {:.1}% in use", memory_pct),
                memory_pct,
                t.memory_high_pct,
            ));
        }

        let power_pct = sample.power_pct();
        if power_pct >= t.power_critical_pct {
            alerts.push(alert(
                AlertKind::Power,
                Severity::Critical,
                format!("power draw {:.1}% of limit", power_pct),
                power_pct,
                t.power_critical_pct,
            ));
        } else if power_pct >= t.power_high_pct {
            alerts.push(alert(
                AlertKind::Power,
                Severity::Warning,
                format!("power draw {:.1}% of limit", power_pct),
                power_pct,
                t.power_high_pct,
            ));
        }

        if sample.utilization_pct >= t.utilization_high_pct {
            alerts.push(alert(
                AlertKind::Utilization,
                Severity::Warning,
                format!("utilization {:.0}% saturated", sample.utilization_pct),
                sample.utilization_pct,
                t.utilization_high_pct,
            ));
        } else if sample.utilization_pct < t.utilization_low_pct && sample.process_count > 0 {
            // A busy process list with an idle compute engine usually means a
            // stalled workload.
            alerts.push(alert(
                AlertKind::Utilization,
                Severity::Info,
                format!(
                    "utilization {:.0}% with {} processes resident",
                    sample.utilization_pct, sample.process_count
                ),
                sample.utilization_pct,
                t.utilization_low_pct,
            ));
        }

        let mut state = self.state.write().unwrap();
        if let Some(previous) = state.previous.get(&sample.device_id) {
            let jump = sample.utilization_pct - previous.utilization_pct;
            if jump > UTILIZATION_JUMP_PCT {
                alerts.push(alert(
                    AlertKind::Utilization,
                    Severity::Info,
                    format!("utilization jumped {:.0} points", jump),
                    jump,
                    UTILIZATION_JUMP_PCT,
                ));
            }
            if sample.process_count > previous.process_count {
                alerts.push(alert(
                    AlertKind::Process,
                    Severity::Info,
                    format!(
                        "process count rose {} -> {}",
                        previous.process_count, sample.process_count
                    ),
                    sample.process_count as f64,
                    previous.process_count as f64,
                ));
            }
        }
        state.previous.insert(sample.device_id.clone(), sample.clone());

        let history = state.history.entry(sample.device_id.clone()).or_default();
        for a in &alerts {
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(a.clone());
        }

        alerts
    }

    /// Copies of a device's retained alerts, oldest first.
    pub fn history(&self, device_id: &str) -> Vec<Alert> {
        let state = self.state.read().unwrap();
        state
            .history
            .get(device_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark every retained alert for a device as acknowledged.
    pub fn acknowledge_all(&self, device_id: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(history) = state.history.get_mut(device_id) {
            for alert in history.iter_mut() {
                alert.acknowledged = true;
            }
        }
    }
}

#[async_trait]
impl SampleObserver for AlertEvaluator {
    async fn on_sample(&self, sample: Sample) {
        for alert in self.evaluate(&sample) {
            match alert.severity {
                Severity::Critical | Severity::Warning => warn!(
                    device_id = %alert.device_id,
                    kind = ?alert.kind,
                    severity = ?alert.severity,
                    value = alert.value,
                    threshold = alert.threshold,
                    "{}", alert.message
                ),
                Severity::Info => info!(
                    device_id = %alert.device_id,
                    kind = ?alert.kind,
                    "{}", alert.message
                ),
            }
        }
    }
}
