//! `sample` defines the telemetry records produced by sample sources.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One timestamped telemetry record for one device.
///
/// Samples handed to observers and returned from history reads are always
/// copies; nothing retains references into the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,
    /// Model name as reported by the source, e.g. "NVIDIA A100-SXM4-40GB".
    /// Drives cost-rate normalization downstream.
    pub device_name: String,
    /// Compute utilization, 0..=100
    pub utilization_pct: f64,
    /// Memory bandwidth utilization as reported by the driver, 0..=100
    pub memory_utilization_pct: f64,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub memory_free_mb: u64,
    pub temperature_c: f64,
    pub power_draw_w: f64,
    pub power_limit_w: f64,
    pub fan_speed_pct: f64,
    pub clock_graphics_mhz: u32,
    pub clock_memory_mhz: u32,
    /// Number of compute processes resident on the device
    pub process_count: u32,
    pub encoder_util_pct: f64,
    pub decoder_util_pct: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    /// A zeroed sample for the given device, stamped now. Sources fill in
    /// whatever fields they can; unsupported fields stay zero.
    pub fn empty(device_id: impl Into<String>) -> Self {
        Sample {
            device_id: device_id.into(),
            device_name: String::new(),
            utilization_pct: 0.0,
            memory_utilization_pct: 0.0,
            memory_total_mb: 0,
            memory_used_mb: 0,
            memory_free_mb: 0,
            temperature_c: 0.0,
            power_draw_w: 0.0,
            power_limit_w: 0.0,
            fan_speed_pct: 0.0,
            clock_graphics_mhz: 0,
            clock_memory_mhz: 0,
            process_count: 0,
            encoder_util_pct: 0.0,
            decoder_util_pct: 0.0,
            timestamp: Utc::now(),
        }
    }

    /// Fraction of device memory in use, as a percentage of the total.
    pub fn memory_used_pct(&self) -> f64 {
        if self.memory_total_mb == 0 {
            return 0.0;
        }
        self.memory_used_mb as f64 / self.memory_total_mb as f64 * 100.0
    }

    /// Power draw as a percentage of the board limit, 0 when no limit is
    /// reported.
    pub fn power_pct(&self) -> f64 {
        if self.power_limit_w <= 0.0 {
            return 0.0;
        }
        self.power_draw_w / self.power_limit_w * 100.0
    }
}

/// A compute process resident on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuProcess {
    pub pid: u32,
    pub name: String,
    pub used_memory_mb: u64,
}
