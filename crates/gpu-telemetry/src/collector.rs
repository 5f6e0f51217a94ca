//! `collector` drives the sampling loop and fans samples out to observers.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::sample::{GpuProcess, Sample};
use crate::source::{SampleSource, SourceError};
use crate::store::HistoryStore;

/// A sink for newly-ingested samples.
///
/// Observers run on fresh tasks, one per observer per sample, so a slow
/// observer cannot stall the sampling loop. No store lock is held while an
/// observer runs, and every observer gets its own copy of the sample.
#[async_trait]
pub trait SampleObserver: Send + Sync + 'static {
    async fn on_sample(&self, sample: Sample);
}

/// Totals and averages over the latest sample of every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemOverview {
    pub device_count: usize,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub average_utilization_pct: f64,
    pub total_power_draw_w: f64,
    pub hottest_temperature_c: f64,
    pub total_processes: u32,
}

/// Periodic producer of per-device samples.
pub struct Collector {
    source: Arc<dyn SampleSource>,
    store: Arc<HistoryStore>,
    observers: RwLock<Vec<Arc<dyn SampleObserver>>>,
    collect_interval: Duration,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl Collector {
    pub fn new(
        source: Arc<dyn SampleSource>,
        store: Arc<HistoryStore>,
        collect_interval: Duration,
    ) -> Self {
        Collector {
            source,
            store,
            observers: RwLock::new(Vec::new()),
            collect_interval,
            shutdown: Mutex::new(None),
        }
    }

    pub fn store(&self) -> Arc<HistoryStore> {
        Arc::clone(&self.store)
    }

    /// Register an observer for every future successful sample.
    pub fn register_observer(&self, observer: Arc<dyn SampleObserver>) {
        let mut observers = self.observers.write().unwrap();
        observers.push(observer);
    }

    /// Spawn the sampling loop. The loop exits at its next tick once
    /// `cancel` (or [`stop`](Collector::stop)) fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let token = cancel.child_token();
        {
            let mut shutdown = self.shutdown.lock().unwrap();
            *shutdown = Some(token.clone());
        }
        let collector = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(collector.collect_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("sampling loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        collector.tick().await;
                    }
                }
            }
        })
    }

    /// Cancel the sampling loop. Idempotent, and harmless when the collector
    /// was never started.
    pub fn stop(&self) {
        let shutdown = self.shutdown.lock().unwrap();
        if let Some(token) = shutdown.as_ref() {
            token.cancel();
        }
    }

    /// One sampling pass: every known device, one sample each. A failure on
    /// one device is logged and the pass moves on to the next.
    #[instrument(level = "debug", skip(self))]
    pub async fn tick(&self) {
        let device_ids = match self.source.device_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "device enumeration failed, skipping tick");
                return;
            }
        };

        for device_id in device_ids {
            let sample = match self.source.sample(&device_id).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "sample failed");
                    continue;
                }
            };

            if !self.store.append(sample.clone()) {
                continue;
            }

            // Fan out on fresh tasks; callbacks only fire for samples that
            // made it into the store.
            let observers: Vec<Arc<dyn SampleObserver>> = {
                let guard = self.observers.read().unwrap();
                guard.clone()
            };
            for observer in observers {
                let sample = sample.clone();
                tokio::spawn(async move {
                    observer.on_sample(sample).await;
                });
            }
        }
    }

    /// The newest sample for every device.
    pub fn latest_per_device(&self) -> HashMap<String, Sample> {
        self.store.latest_per_device()
    }

    /// Copies of one device's history, optionally bounded to samples newer
    /// than `since`.
    pub fn history(
        &self,
        device_id: &str,
        since: Option<chrono::DateTime<Utc>>,
    ) -> Vec<Sample> {
        self.store.history(device_id, since)
    }

    /// Compute processes currently resident on a device, straight from the
    /// source.
    pub async fn running_processes(
        &self,
        device_id: &str,
    ) -> Result<Vec<GpuProcess>, SourceError> {
        self.source.running_processes(device_id).await
    }

    /// Totals and averages across the latest sample of every device.
    pub fn system_overview(&self) -> SystemOverview {
        let latest = self.store.latest_per_device();
        let device_count = latest.len();
        let total_memory_mb = latest.values().map(|s| s.memory_total_mb).sum();
        let used_memory_mb = latest.values().map(|s| s.memory_used_mb).sum();
        let average_utilization_pct = if device_count > 0 {
            latest.values().map(|s| s.utilization_pct).sum::<f64>() / device_count as f64
        } else {
            0.0
        };
        let total_power_draw_w = latest.values().map(|s| s.power_draw_w).sum();
        let hottest_temperature_c = latest
            .values()
            .map(|s| s.temperature_c)
            .fold(0.0_f64, f64::max);
        let total_processes = latest.values().map(|s| s.process_count).sum();
        SystemOverview {
            device_count,
            total_memory_mb,
            used_memory_mb,
            average_utilization_pct,
            total_power_draw_w,
            hottest_temperature_c,
            total_processes,
        }
    }

    /// Per-device efficiency (mean utilization per watt) over the trailing
    /// window. Devices with no samples in the window are omitted.
    pub fn efficiency_over_window(&self, window: Duration) -> HashMap<String, f64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let mut result = HashMap::new();
        for device_id in self.store.device_ids() {
            let samples = self.store.history(&device_id, Some(cutoff));
            if samples.is_empty() {
                continue;
            }
            let avg_util =
                samples.iter().map(|s| s.utilization_pct).sum::<f64>() / samples.len() as f64;
            let avg_power =
                samples.iter().map(|s| s.power_draw_w).sum::<f64>() / samples.len() as f64;
            let efficiency = if avg_power > 0.0 {
                avg_util / avg_power
            } else {
                0.0
            };
            result.insert(device_id, efficiency);
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::{SyntheticDeviceSpec, SyntheticSource};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl SampleObserver for CountingObserver {
        async fn on_sample(&self, _sample: Sample) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn collector_with_fleet(count: usize) -> Arc<Collector> {
        let source = Arc::new(SyntheticSource::fleet(count));
        let store = Arc::new(HistoryStore::new(100));
        Arc::new(Collector::new(source, store, Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn test_tick_samples_every_device() {
        let collector = collector_with_fleet(3);
        collector.tick().await;
        assert_eq!(collector.latest_per_device().len(), 3);
    }

    #[tokio::test]
    async fn test_observers_receive_samples() {
        let collector = collector_with_fleet(2);
        let observer = Arc::new(CountingObserver {
            seen: AtomicUsize::new(0),
        });
        collector.register_observer(observer.clone());
        collector.tick().await;
        // Dispatch happens on spawned tasks; give them a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(observer.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_one_bad_device_does_not_abort_tick() {
        // A source whose first device always errors.
        struct HalfBroken {
            inner: SyntheticSource,
        }

        #[async_trait]
        impl crate::source::SampleSource for HalfBroken {
            async fn device_ids(&self) -> Result<Vec<String>, crate::source::SourceError> {
                Ok(vec!["bad".to_string(), "0".to_string()])
            }
            async fn sample(
                &self,
                device_id: &str,
            ) -> Result<Sample, crate::source::SourceError> {
                self.inner.sample(device_id).await
            }
            async fn running_processes(
                &self,
                device_id: &str,
            ) -> Result<Vec<crate::sample::GpuProcess>, crate::source::SourceError> {
                self.inner.running_processes(device_id).await
            }
        }

        let source = Arc::new(HalfBroken {
            inner: SyntheticSource::new(vec![SyntheticDeviceSpec::a100("0")]),
        });
        let store = Arc::new(HistoryStore::new(100));
        let collector = Arc::new(Collector::new(source, store, Duration::from_millis(10)));
        collector.tick().await;
        let latest = collector.latest_per_device();
        assert_eq!(latest.len(), 1);
        assert!(latest.contains_key("0"));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let collector = collector_with_fleet(1);
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&collector).start(cancel);
        tokio::time::sleep(Duration::from_millis(40)).await;
        collector.stop();
        // Stop is idempotent.
        collector.stop();
        handle.await.unwrap();
        assert!(!collector.latest_per_device().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_safe() {
        let collector = collector_with_fleet(1);
        collector.stop();
    }

    #[tokio::test]
    async fn test_system_overview_totals() {
        let collector = collector_with_fleet(2);
        collector.tick().await;
        let overview = collector.system_overview();
        assert_eq!(overview.device_count, 2);
        assert_eq!(overview.total_memory_mb, 2 * 40960);
        assert!(overview.average_utilization_pct >= 0.0);
    }

    #[tokio::test]
    async fn test_efficiency_over_window() {
        let collector = collector_with_fleet(1);
        for _ in 0..5 {
            collector.tick().await;
        }
        let efficiency = collector.efficiency_over_window(Duration::from_secs(3600));
        assert_eq!(efficiency.len(), 1);
        assert!(*efficiency.get("0").unwrap() >= 0.0);
    }
}
