//! End-to-end exercise of the telemetry pipeline and the scheduler without a
//! cluster: synthetic fleet in, statistics and placements out.
use std::sync::Arc;
use std::time::Duration;

use gpu_scheduler::{Device, Policy, Scheduler, Workload};
use gpu_telemetry::{
    Aggregator, AggregatorConfig, AlertEvaluator, Collector, HistoryStore, SyntheticSource,
    Thresholds,
};

#[tokio::test]
async fn telemetry_pipeline_produces_rollups() {
    let source = Arc::new(SyntheticSource::fleet(3));
    let store = Arc::new(HistoryStore::new(100));
    let collector = Arc::new(Collector::new(
        source,
        Arc::clone(&store),
        Duration::from_millis(10),
    ));
    collector.register_observer(Arc::new(AlertEvaluator::new(Thresholds::default())));

    for _ in 0..10 {
        collector.tick().await;
    }

    let overview = collector.system_overview();
    assert_eq!(overview.device_count, 3);
    assert_eq!(overview.total_memory_mb, 3 * 40960);

    let aggregator = Aggregator::new(store, Thresholds::default(), AggregatorConfig::default());
    aggregator.perform_aggregation();

    let rollup = aggregator.cluster_rollup().expect("rollup after sampling");
    assert_eq!(rollup.total_devices, 3);
    assert_eq!(rollup.device_stats.len(), 3);
    for stats in rollup.device_stats.values() {
        assert_eq!(stats.sample_count, 10);
        assert!(stats.average_utilization_pct >= 0.0);
        assert!(stats.peak_utilization_pct >= stats.average_utilization_pct);
    }

    // The simulated fleet reports A100s, so every device prices at the A100
    // rate rather than the generic fallback.
    assert_eq!(rollup.device_costs.len(), 3);
    for cost in rollup.device_costs.values() {
        assert_eq!(cost.device_type, "a100");
        assert!(cost.total_cost >= 0.0);
    }
}

#[tokio::test]
async fn scheduler_lifecycle_round_trip() {
    let scheduler = Scheduler::new(Policy::BestFit);
    for (id, total) in [("node-a/0", 40960u64), ("node-a/1", 16384)] {
        scheduler
            .register_device(Device::new(id, "NVIDIA A100", total))
            .unwrap();
    }

    scheduler
        .submit(Workload::new("small", "small", 8192))
        .unwrap();
    scheduler
        .submit(Workload::new("large", "large", 30000))
        .unwrap();
    assert_eq!(scheduler.schedule(), 2);

    // BestFit packs the small workload onto the smaller device.
    let devices = scheduler.snapshot();
    let small_device = devices.iter().find(|d| d.id == "node-a/1").unwrap();
    assert_eq!(small_device.workload_id.as_deref(), Some("small"));

    scheduler.complete("small").unwrap();
    scheduler.complete("large").unwrap();
    assert!(scheduler
        .snapshot()
        .iter()
        .all(|d| d.memory_used_mb == 0 && d.workload_id.is_none()));
}
