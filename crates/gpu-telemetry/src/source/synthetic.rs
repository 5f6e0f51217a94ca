//! Simulated sample source for development and tests.
//!
//! Each device runs through a scripted cycle of workload phases. Values get
//! a sinusoidal drift plus uniform random jitter so dashboards and
//! aggregation behave like they would against real hardware, including
//! thermal throttling once a device runs hot.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;

use super::{SampleSource, SourceError};
use crate::sample::{GpuProcess, Sample};

/// Clock speed the simulated devices report when cool.
const BASE_GRAPHICS_CLOCK_MHZ: f64 = 1410.0;
const BASE_MEMORY_CLOCK_MHZ: f64 = 1215.0;

/// Above this core temperature the simulation throttles: utilization and
/// clocks degrade until the device cools off.
const THROTTLE_TEMPERATURE_C: f64 = 85.0;
const THROTTLE_FACTOR: f64 = 0.85;

/// A phase in a simulated device's duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPattern {
    Idle,
    LightInference,
    Training,
    HeavyInference,
    Batch,
}

impl WorkloadPattern {
    fn base_utilization_pct(&self) -> f64 {
        match self {
            WorkloadPattern::Idle => 2.0,
            WorkloadPattern::LightInference => 35.0,
            WorkloadPattern::Training => 92.0,
            WorkloadPattern::HeavyInference => 70.0,
            WorkloadPattern::Batch => 55.0,
        }
    }

    fn memory_fraction(&self) -> f64 {
        match self {
            WorkloadPattern::Idle => 0.02,
            WorkloadPattern::LightInference => 0.30,
            WorkloadPattern::Training => 0.85,
            WorkloadPattern::HeavyInference => 0.60,
            WorkloadPattern::Batch => 0.45,
        }
    }

    fn process_count(&self) -> u32 {
        match self {
            WorkloadPattern::Idle => 0,
            WorkloadPattern::LightInference => 1,
            WorkloadPattern::Training => 1,
            WorkloadPattern::HeavyInference => 3,
            WorkloadPattern::Batch => 2,
        }
    }

    fn encoder_util_pct(&self) -> f64 {
        match self {
            WorkloadPattern::LightInference | WorkloadPattern::HeavyInference => 8.0,
            _ => 0.0,
        }
    }
}

/// Static description of one simulated device.
#[derive(Debug, Clone)]
pub struct SyntheticDeviceSpec {
    pub id: String,
    pub name: String,
    pub memory_total_mb: u64,
    pub power_limit_w: f64,
    /// Phase script as (pattern, ticks) pairs; the cycle repeats forever.
    pub phases: Vec<(WorkloadPattern, u32)>,
}

impl SyntheticDeviceSpec {
    /// An A100-shaped device cycling through every pattern.
    pub fn a100(id: impl Into<String>) -> Self {
        SyntheticDeviceSpec {
            id: id.into(),
            name: "NVIDIA A100-SXM4-40GB".to_string(),
            memory_total_mb: 40960,
            power_limit_w: 400.0,
            phases: vec![
                (WorkloadPattern::Idle, 6),
                (WorkloadPattern::LightInference, 12),
                (WorkloadPattern::Training, 30),
                (WorkloadPattern::HeavyInference, 12),
                (WorkloadPattern::Batch, 18),
            ],
        }
    }
}

struct DeviceState {
    spec: SyntheticDeviceSpec,
    tick: u64,
    temperature_c: f64,
}

impl DeviceState {
    fn current_pattern(&self) -> WorkloadPattern {
        let cycle: u64 = self.spec.phases.iter().map(|(_, t)| *t as u64).sum();
        if cycle == 0 {
            return WorkloadPattern::Idle;
        }
        let mut pos = self.tick % cycle;
        for (pattern, ticks) in &self.spec.phases {
            if pos < *ticks as u64 {
                return *pattern;
            }
            pos -= *ticks as u64;
        }
        WorkloadPattern::Idle
    }
}

/// Simulated fleet. One [`DeviceState`] per device, advanced on every
/// `sample` call.
pub struct SyntheticSource {
    devices: Mutex<HashMap<String, DeviceState>>,
}

impl SyntheticSource {
    pub fn new(specs: Vec<SyntheticDeviceSpec>) -> Self {
        let devices = specs
            .into_iter()
            .map(|spec| {
                (
                    spec.id.clone(),
                    DeviceState {
                        spec,
                        tick: 0,
                        temperature_c: 30.0,
                    },
                )
            })
            .collect();
        SyntheticSource {
            devices: Mutex::new(devices),
        }
    }

    /// A fleet of `count` A100-shaped devices with ids `0..count`, each
    /// starting at a different point in the duty cycle.
    pub fn fleet(count: usize) -> Self {
        let source = SyntheticSource::new(
            (0..count)
                .map(|i| SyntheticDeviceSpec::a100(i.to_string()))
                .collect(),
        );
        {
            let mut devices = source.devices.lock().unwrap();
            for (i, state) in devices.values_mut().enumerate() {
                state.tick = (i as u64) * 7;
            }
        }
        source
    }
}

#[async_trait]
impl SampleSource for SyntheticSource {
    async fn device_ids(&self) -> Result<Vec<String>, SourceError> {
        let devices = self.devices.lock().unwrap();
        let mut ids: Vec<String> = devices.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn sample(&self, device_id: &str) -> Result<Sample, SourceError> {
        let mut devices = self.devices.lock().unwrap();
        let state = devices
            .get_mut(device_id)
            .ok_or_else(|| SourceError::UnknownDevice {
                id: device_id.to_string(),
            })?;

        let mut rng = rand::thread_rng();
        let pattern = state.current_pattern();
        state.tick += 1;

        let drift = (state.tick as f64 / 20.0 * std::f64::consts::TAU).sin() * 5.0;
        let mut utilization =
            (pattern.base_utilization_pct() + drift + rng.gen_range(-3.0..3.0)).clamp(0.0, 100.0);

        let memory_fraction =
            (pattern.memory_fraction() + rng.gen_range(-0.02..0.02)).clamp(0.0, 1.0);
        let memory_total = state.spec.memory_total_mb;
        let memory_used = (memory_total as f64 * memory_fraction) as u64;

        // First-order thermal model: temperature chases a target implied by
        // load, so it lags utilization changes the way a real heatsink does.
        let target_temp = 30.0 + utilization * 0.55;
        state.temperature_c += (target_temp - state.temperature_c) * 0.3 + rng.gen_range(-1.0..1.0);
        let temperature = state.temperature_c;

        let mut clock_scale = 0.5 + utilization / 200.0;
        if temperature > THROTTLE_TEMPERATURE_C {
            utilization *= THROTTLE_FACTOR;
            clock_scale *= THROTTLE_FACTOR;
        }

        let power =
            state.spec.power_limit_w * (0.12 + 0.78 * utilization / 100.0) + rng.gen_range(-5.0..5.0);

        let mut sample = Sample::empty(device_id);
        sample.device_name = state.spec.name.clone();
        sample.utilization_pct = utilization;
        sample.memory_utilization_pct = (utilization * 0.7).clamp(0.0, 100.0);
        sample.memory_total_mb = memory_total;
        sample.memory_used_mb = memory_used;
        sample.memory_free_mb = memory_total - memory_used;
        sample.temperature_c = temperature;
        sample.power_draw_w = power.max(0.0);
        sample.power_limit_w = state.spec.power_limit_w;
        sample.fan_speed_pct = ((temperature - 30.0) * 2.0).clamp(0.0, 100.0);
        sample.clock_graphics_mhz = (BASE_GRAPHICS_CLOCK_MHZ * clock_scale) as u32;
        sample.clock_memory_mhz = (BASE_MEMORY_CLOCK_MHZ * clock_scale) as u32;
        sample.process_count = pattern.process_count();
        sample.encoder_util_pct = pattern.encoder_util_pct();
        sample.decoder_util_pct = pattern.encoder_util_pct() / 2.0;
        sample.timestamp = Utc::now();
        Ok(sample)
    }

    async fn running_processes(&self, device_id: &str) -> Result<Vec<GpuProcess>, SourceError> {
        let devices = self.devices.lock().unwrap();
        let state = devices
            .get(device_id)
            .ok_or_else(|| SourceError::UnknownDevice {
                id: device_id.to_string(),
            })?;
        let pattern = state.current_pattern();
        let count = pattern.process_count() as u64;
        if count == 0 {
            return Ok(Vec::new());
        }
        let per_process =
            (state.spec.memory_total_mb as f64 * pattern.memory_fraction()) as u64 / count;
        Ok((0..count)
            .map(|i| GpuProcess {
                pid: 4000 + i as u32,
                name: "python3".to_string(),
                used_memory_mb: per_process,
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_samples_stay_in_range() {
        let source = SyntheticSource::fleet(2);
        for _ in 0..200 {
            let sample = source.sample("0").await.unwrap();
            assert!((0.0..=100.0).contains(&sample.utilization_pct));
            assert!(sample.memory_used_mb <= sample.memory_total_mb);
            assert_eq!(
                sample.memory_used_mb + sample.memory_free_mb,
                sample.memory_total_mb
            );
            assert!(sample.power_draw_w >= 0.0);
        }
    }

    #[tokio::test]
    async fn test_timestamps_non_decreasing() {
        let source = SyntheticSource::fleet(1);
        let mut last = None;
        for _ in 0..20 {
            let sample = source.sample("0").await.unwrap();
            if let Some(prev) = last {
                assert!(sample.timestamp >= prev);
            }
            last = Some(sample.timestamp);
        }
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let source = SyntheticSource::fleet(1);
        assert!(matches!(
            source.sample("missing").await,
            Err(SourceError::UnknownDevice { .. })
        ));
    }

    #[tokio::test]
    async fn test_training_phase_is_hotter_than_idle() {
        let mut spec = SyntheticDeviceSpec::a100("0");
        spec.phases = vec![(WorkloadPattern::Training, 1000)];
        let source = SyntheticSource::new(vec![spec]);
        // Let the thermal model settle.
        let mut sample = source.sample("0").await.unwrap();
        for _ in 0..50 {
            sample = source.sample("0").await.unwrap();
        }
        assert!(sample.utilization_pct > 60.0);
        assert!(sample.temperature_c > 55.0);
    }

    #[tokio::test]
    async fn test_processes_follow_pattern() {
        let mut spec = SyntheticDeviceSpec::a100("0");
        spec.phases = vec![(WorkloadPattern::HeavyInference, 10)];
        let source = SyntheticSource::new(vec![spec]);
        let processes = source.running_processes("0").await.unwrap();
        assert_eq!(processes.len(), 3);
    }
}
