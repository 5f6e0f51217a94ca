//! The `gpulet` daemon: wires the telemetry collector, the scheduler, and the
//! cluster controller together and runs them until interrupted.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gpu_controller::{Controller, ControllerConfig, KubeStore};
use gpu_scheduler::Policy;
use gpu_telemetry::{
    Aggregator, AggregatorConfig, AlertEvaluator, Collector, CostModel, HistoryStore, Sample,
    SampleObserver, SampleSource, SmiSource, SyntheticSource, Thresholds,
};

#[derive(StructOpt, Clone, Debug)]
#[structopt(name = "gpulet", about = "A GPU-aware workload scheduler for Kubernetes")]
struct Opts {
    #[structopt(
        long = "policy",
        default_value = "least-utilized",
        env = "GPULET_POLICY",
        help = "Placement policy: least-utilized, best-fit, priority, or round-robin"
    )]
    policy: Policy,

    #[structopt(
        long = "node-selector",
        default_value = "agentaflow.gpu/enabled=true",
        env = "GPULET_NODE_SELECTOR",
        help = "Label selector identifying GPU-enabled nodes"
    )]
    node_selector: String,

    #[structopt(
        long = "node-name",
        env = "NODE_NAME",
        help = "Name of the node this daemon samples, defaults to the hostname"
    )]
    node_name: Option<String>,

    #[structopt(
        long = "collect-interval",
        default_value = "10",
        env = "GPULET_COLLECT_INTERVAL",
        help = "Seconds between telemetry samples"
    )]
    collect_interval_secs: u64,

    #[structopt(
        long = "aggregation-interval",
        default_value = "30",
        env = "GPULET_AGGREGATION_INTERVAL",
        help = "Seconds between statistics aggregations"
    )]
    aggregation_interval_secs: u64,

    #[structopt(
        long = "retention-period",
        default_value = "3600",
        env = "GPULET_RETENTION_PERIOD",
        help = "Seconds of history the aggregation window covers"
    )]
    retention_period_secs: u64,

    #[structopt(
        long = "history-capacity",
        default_value = "1000",
        env = "GPULET_HISTORY_CAPACITY",
        help = "Samples retained per device"
    )]
    history_capacity: usize,

    #[structopt(
        long = "target-utilization",
        default_value = "80",
        env = "GPULET_TARGET_UTILIZATION",
        help = "Operator hint for desired fleet utilization, percent"
    )]
    target_utilization: f64,

    #[structopt(
        long = "synthetic",
        help = "Simulate devices instead of querying hardware"
    )]
    synthetic: bool,

    #[structopt(
        long = "synthetic-devices",
        default_value = "4",
        env = "GPULET_SYNTHETIC_DEVICES",
        help = "Number of simulated devices when --synthetic is set"
    )]
    synthetic_devices: usize,

    #[structopt(
        long = "smi-binary",
        default_value = "nvidia-smi",
        env = "GPULET_SMI_BINARY",
        help = "Query binary for the hardware telemetry source"
    )]
    smi_binary: String,

    #[structopt(
        long = "spot-discount",
        default_value = "1.0",
        env = "GPULET_SPOT_DISCOUNT",
        help = "Cost multiplier for spot capacity, 1.0 for on-demand"
    )]
    spot_discount: f64,

    #[structopt(
        long = "tax-rate",
        default_value = "0.0",
        env = "GPULET_TAX_RATE",
        help = "Tax rate applied to discounted cost estimates"
    )]
    tax_rate: f64,
}

/// Feeds sampled runtime state into the scheduler's device records, mapping
/// the source's local device ids onto the controller's composite ids.
struct RegistryBridge {
    controller: Arc<Controller>,
    node_name: String,
}

#[async_trait]
impl SampleObserver for RegistryBridge {
    async fn on_sample(&self, sample: Sample) {
        let device_id = format!("{}/{}", self.node_name, sample.device_id);
        if let Err(e) = self.controller.scheduler().update_device_runtime(
            &device_id,
            sample.utilization_pct,
            sample.temperature_c,
            sample.power_draw_w,
        ) {
            // Telemetry usually races ahead of discovery right after boot.
            debug!(device_id = %device_id, error = %e, "runtime update skipped");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let node_name = match opts.node_name.clone() {
        Some(name) => name,
        None => hostname::get()?
            .into_string()
            .map_err(|_| anyhow::anyhow!("invalid utf-8 hostname"))?
            .to_lowercase(),
    };
    info!(node_name = %node_name, policy = %opts.policy, "starting gpulet");

    // Tries a kubeconfig first, then falls back to in-cluster configuration.
    let client = kube::Client::try_default().await?;
    let store = Arc::new(KubeStore::new(client));

    let controller = Arc::new(Controller::new(
        store,
        opts.policy,
        ControllerConfig {
            node_selector: opts.node_selector.clone(),
            target_utilization_pct: opts.target_utilization,
            ..Default::default()
        },
    ));

    let source: Arc<dyn SampleSource> = if opts.synthetic {
        info!(devices = opts.synthetic_devices, "using synthetic telemetry");
        Arc::new(SyntheticSource::fleet(opts.synthetic_devices))
    } else {
        Arc::new(SmiSource::new(&opts.smi_binary))
    };

    let history = Arc::new(HistoryStore::new(opts.history_capacity));
    let collector = Arc::new(Collector::new(
        source,
        Arc::clone(&history),
        Duration::from_secs(opts.collect_interval_secs),
    ));
    collector.register_observer(Arc::new(AlertEvaluator::new(Thresholds::default())));
    collector.register_observer(Arc::new(RegistryBridge {
        controller: Arc::clone(&controller),
        node_name,
    }));

    let cost_model = CostModel {
        spot_discount: opts.spot_discount,
        tax_rate: opts.tax_rate,
        ..Default::default()
    };
    let aggregator = Arc::new(Aggregator::new(
        history,
        Thresholds::default(),
        AggregatorConfig {
            aggregation_interval: Duration::from_secs(opts.aggregation_interval_secs),
            retention_period: Duration::from_secs(opts.retention_period_secs),
            cost_model,
        },
    ));

    let cancel = CancellationToken::new();
    let mut handles = Arc::clone(&controller).start(cancel.clone());
    handles.push(Arc::clone(&collector).start(cancel.clone()));
    handles.push(Arc::clone(&aggregator).start(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    cancel.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "loop did not shut down cleanly");
        }
    }
    Ok(())
}
