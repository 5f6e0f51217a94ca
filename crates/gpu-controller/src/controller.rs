//! `controller` drives the outer reconciliation loops.
//!
//! Three loops run concurrently once [`Controller::start`] is called: node
//! discovery (materializing annotated devices into the scheduler), placement
//! (realizing bindings as node-pinned pods), and a metrics refresh. The loops
//! share no mutable state directly; everything goes through the scheduler's
//! and controller's own locks, none of which are held across a cluster call.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use gpu_scheduler::{Device, Error, Policy, Scheduler, SchedulingMetrics, Workload};

use crate::annotations::{
    composite_device_id, parse_gpu_node, split_device_id, utilization_tier, DeviceStatusRecord,
    GpuNode, NodePhase, KEY_AVAILABLE_COUNT, KEY_AVERAGE_UTILIZATION, KEY_LAST_UPDATE,
    KEY_SCHEDULABLE, KEY_STATUS, KEY_UTILIZATION_TIER,
};
use crate::pod::build_workload_pod;
use crate::store::ClusterStore;
use crate::workload::{GpuWorkload, WorkloadPhase};

/// Cadences and selectors for the reconciliation loops.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Label selector identifying GPU-enabled nodes
    pub node_selector: String,
    pub discovery_interval: Duration,
    pub placement_interval: Duration,
    pub metrics_interval: Duration,
    /// Operator hint forwarded into the scheduler's metrics
    pub target_utilization_pct: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            node_selector: "agentaflow.gpu/enabled=true".to_string(),
            discovery_interval: Duration::from_secs(30),
            placement_interval: Duration::from_secs(5),
            metrics_interval: Duration::from_secs(10),
            target_utilization_pct: 80.0,
        }
    }
}

/// The cluster controller.
pub struct Controller {
    store: Arc<dyn ClusterStore>,
    scheduler: RwLock<Arc<Scheduler>>,
    workloads: RwLock<HashMap<String, GpuWorkload>>,
    nodes: RwLock<HashMap<String, GpuNode>>,
    metrics: RwLock<Option<SchedulingMetrics>>,
    config: ControllerConfig,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl Controller {
    pub fn new(store: Arc<dyn ClusterStore>, policy: Policy, config: ControllerConfig) -> Self {
        let scheduler =
            Scheduler::new(policy).with_target_utilization(config.target_utilization_pct);
        Controller {
            store,
            scheduler: RwLock::new(Arc::new(scheduler)),
            workloads: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            metrics: RwLock::new(None),
            config,
            shutdown: Mutex::new(None),
        }
    }

    /// The scheduler currently in service. Strategy swaps replace it, so
    /// callers should not cache the returned handle.
    pub fn scheduler(&self) -> Arc<Scheduler> {
        let guard = self.scheduler.read().unwrap();
        Arc::clone(&guard)
    }

    /// Spawn the discovery, placement, and metrics loops. Each loop exits at
    /// its next tick once `cancel` (or [`stop`](Controller::stop)) fires.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let token = cancel.child_token();
        {
            let mut shutdown = self.shutdown.lock().unwrap();
            *shutdown = Some(token.clone());
        }
        info!(
            policy = %self.scheduler().policy(),
            selector = %self.config.node_selector,
            "starting controller loops"
        );

        let discovery = {
            let controller = Arc::clone(&self);
            let token = token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(controller.config.discovery_interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => controller.discovery_tick().await,
                    }
                }
                debug!("discovery loop exited");
            })
        };

        let placement = {
            let controller = Arc::clone(&self);
            let token = token.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(controller.config.placement_interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => controller.placement_tick().await,
                    }
                }
                debug!("placement loop exited");
            })
        };

        let metrics = {
            let controller = self;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(controller.config.metrics_interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => controller.metrics_tick(),
                    }
                }
                debug!("metrics loop exited");
            })
        };

        vec![discovery, placement, metrics]
    }

    /// Cancel the loops. Idempotent and safe to call when never started.
    pub fn stop(&self) {
        let shutdown = self.shutdown.lock().unwrap();
        if let Some(token) = shutdown.as_ref() {
            token.cancel();
        }
    }

    /// One discovery pass: list GPU-enabled nodes, register their devices,
    /// and mirror status back. A failure on one node never stops the pass.
    #[instrument(level = "debug", skip(self))]
    pub async fn discovery_tick(&self) {
        let nodes = match self.store.list_gpu_nodes(&self.config.node_selector).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "node list failed, retrying next tick");
                return;
            }
        };

        for node in &nodes {
            let parsed = match parse_gpu_node(node) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(error = %e, "skipping undiscoverable node");
                    continue;
                }
            };
            let name = parsed.name.clone();
            self.register_node(parsed);
            if let Err(e) = self.mirror_node_status(&name).await {
                warn!(node = %name, error = %e, "status mirror failed");
            }
        }
    }

    /// Register a discovered node's devices under composite ids. Devices on
    /// nodes that are not `Active` are registered unavailable so the
    /// scheduler will not place onto them.
    fn register_node(&self, node: GpuNode) {
        let scheduler = self.scheduler();
        for descriptor in &node.devices {
            let mut device = Device::new(
                composite_device_id(&node.name, &descriptor.id),
                &descriptor.name,
                descriptor.memory_total,
            );
            device.available = node.phase == NodePhase::Active;
            if let Err(e) = scheduler.register_device(device) {
                warn!(
                    node = %node.name,
                    device = %descriptor.id,
                    error = %e,
                    "device registration rejected"
                );
            }
        }
        let mut nodes = self.nodes.write().unwrap();
        nodes.insert(node.name.clone(), node);
    }

    /// Remove a node and every device registered under it. Returns how many
    /// devices were dropped.
    pub fn deregister_node(&self, name: &str) -> usize {
        let scheduler = self.scheduler();
        let prefix = format!("{}/", name);
        let mut removed = 0;
        for device in scheduler.snapshot() {
            if device.id.starts_with(&prefix) && scheduler.deregister_device(&device.id).is_some() {
                removed += 1;
            }
        }
        let mut nodes = self.nodes.write().unwrap();
        nodes.remove(name);
        info!(node = %name, devices = removed, "deregistered node");
        removed
    }

    /// Write runtime device state back onto the node object: the status
    /// annotation set plus the utilization-tier and schedulable labels.
    async fn mirror_node_status(&self, node_name: &str) -> anyhow::Result<()> {
        let prefix = format!("{}/", node_name);
        let devices: Vec<Device> = self
            .scheduler()
            .snapshot()
            .into_iter()
            .filter(|d| d.id.starts_with(&prefix))
            .collect();
        if devices.is_empty() {
            return Ok(());
        }

        let records: Vec<DeviceStatusRecord> = devices.iter().map(DeviceStatusRecord::from).collect();
        let average_utilization =
            devices.iter().map(|d| d.utilization_pct).sum::<f64>() / devices.len() as f64;
        let available_count = devices
            .iter()
            .filter(|d| d.available && d.workload_id.is_none())
            .count();

        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(KEY_STATUS.to_string(), serde_json::to_string(&records)?);
        annotations.insert(KEY_LAST_UPDATE.to_string(), Utc::now().to_rfc3339());
        annotations.insert(
            KEY_AVERAGE_UTILIZATION.to_string(),
            format!("{:.1}", average_utilization),
        );
        annotations.insert(KEY_AVAILABLE_COUNT.to_string(), available_count.to_string());

        let mut labels = std::collections::BTreeMap::new();
        labels.insert(
            KEY_UTILIZATION_TIER.to_string(),
            utilization_tier(average_utilization).to_string(),
        );
        labels.insert(
            KEY_SCHEDULABLE.to_string(),
            (available_count > 0).to_string(),
        );

        self.store
            .patch_node_annotations(node_name, annotations)
            .await?;
        self.store.patch_node_labels(node_name, labels).await?;
        Ok(())
    }

    /// Accept a workload intent. Names are unique at this level: a second
    /// submission under a live name is rejected, unlike in the queue below,
    /// which treats duplicates as independent intents.
    pub fn submit_workload(&self, workload: GpuWorkload) -> Result<(), Error> {
        {
            let workloads = self.workloads.read().unwrap();
            if let Some(existing) = workloads.get(&workload.name) {
                if !matches!(
                    existing.phase,
                    WorkloadPhase::Succeeded | WorkloadPhase::Failed
                ) {
                    return Err(Error::InvalidArgument {
                        reason: format!("workload {} already exists", workload.name),
                    });
                }
            }
        }

        let intent = Workload::new(&workload.name, &workload.name, workload.memory_required_mb)
            .with_priority(workload.priority)
            .with_estimated_duration(workload.estimated_duration);
        self.scheduler().submit(intent)?;

        let mut workloads = self.workloads.write().unwrap();
        workloads.insert(workload.name.clone(), workload);
        Ok(())
    }

    /// One placement pass: run the scheduler, then realize every fresh
    /// binding as a node-pinned pod and advance its mirror.
    #[instrument(level = "debug", skip(self))]
    pub async fn placement_tick(&self) {
        let scheduler = self.scheduler();
        let placed = scheduler.schedule();
        if placed > 0 {
            info!(placed, "scheduler bound workloads");
        }

        let bound: Vec<(String, String)> = scheduler
            .snapshot()
            .into_iter()
            .filter_map(|d| d.workload_id.clone().map(|w| (d.id, w)))
            .collect();

        for (device_id, workload_name) in bound {
            // Transition the mirror and build the pod under the lock, then
            // talk to the cluster with the lock released.
            let pending = {
                let mut workloads = self.workloads.write().unwrap();
                let mirror = match workloads.get_mut(&workload_name) {
                    Some(mirror) => mirror,
                    None => {
                        warn!(workload = %workload_name, "bound workload has no mirror");
                        continue;
                    }
                };
                if mirror.phase != WorkloadPhase::Pending {
                    continue;
                }
                let node_name = split_device_id(&device_id)
                    .map(|(node, _)| node.to_string())
                    .unwrap_or_else(|| device_id.clone());
                mirror.transition(WorkloadPhase::Scheduled);
                mirror.start_time = Some(Utc::now());
                mirror.assigned_gpu = Some(device_id.clone());
                mirror.assigned_node = Some(node_name.clone());
                let pod = build_workload_pod(mirror, &device_id, &node_name);
                Some((pod, mirror.namespace.clone()))
            };

            let (pod, namespace) = match pending {
                Some(p) => p,
                None => continue,
            };

            match self.store.create_pod(&namespace, pod).await {
                Ok(()) => {
                    let mut workloads = self.workloads.write().unwrap();
                    if let Some(mirror) = workloads.get_mut(&workload_name) {
                        mirror.transition(WorkloadPhase::Running);
                        mirror.append_condition(
                            "Ready",
                            "True",
                            "PodCreated",
                            format!("pod {} created on {}", workload_name, device_id),
                        );
                    }
                    info!(workload = %workload_name, device = %device_id, "workload running");
                }
                Err(e) => {
                    // The mirror stays Scheduled; re-submission is the
                    // operator's call, the controller does not retry.
                    error!(workload = %workload_name, error = %e, "pod creation failed");
                    let mut workloads = self.workloads.write().unwrap();
                    if let Some(mirror) = workloads.get_mut(&workload_name) {
                        mirror.append_condition(
                            "Ready",
                            "False",
                            "PodCreateFailed",
                            e.to_string(),
                        );
                    }
                }
            }
        }
    }

    /// Recompute and publish the scheduling metrics snapshot.
    pub fn metrics_tick(&self) {
        let snapshot = self.scheduler().metrics();
        let mut metrics = self.metrics.write().unwrap();
        *metrics = Some(snapshot);
    }

    /// The most recently published metrics snapshot.
    pub fn scheduling_metrics(&self) -> Option<SchedulingMetrics> {
        let metrics = self.metrics.read().unwrap();
        metrics.clone()
    }

    /// Release the device bound to `name` and retire the mirror as
    /// succeeded.
    pub fn complete_workload(&self, name: &str) -> Result<GpuWorkload, Error> {
        self.scheduler().complete(name)?;
        let mut workloads = self.workloads.write().unwrap();
        let mirror = workloads
            .get_mut(name)
            .ok_or_else(|| Error::NotFound { id: name.into() })?;
        mirror.transition(WorkloadPhase::Succeeded);
        mirror.completion_time = Some(Utc::now());
        mirror.append_condition("Complete", "True", "WorkloadFinished", "device released");
        Ok(mirror.clone())
    }

    /// Replace the scheduler with a fresh one under the new policy and
    /// re-register every known device into it.
    ///
    /// Bindings and the pending queue are not carried over: devices come back
    /// clean and anything still queued is dropped, so callers should drain or
    /// re-submit in-flight work first.
    pub fn set_strategy(&self, policy: Policy) {
        let old = self.scheduler();
        let dropped = old.pending_workloads();
        if dropped > 0 {
            warn!(dropped, "strategy swap is dropping queued workloads");
        }

        let fresh =
            Scheduler::new(policy).with_target_utilization(self.config.target_utilization_pct);
        for device in old.snapshot() {
            let mut clean = Device::new(&device.id, &device.name, device.memory_total_mb);
            clean.available = device.available;
            clean.utilization_pct = device.utilization_pct;
            clean.temperature_c = device.temperature_c;
            clean.power_draw_w = device.power_draw_w;
            clean.power_limit_w = device.power_limit_w;
            if let Err(e) = fresh.register_device(clean) {
                warn!(device = %device.id, error = %e, "device lost in strategy swap");
            }
        }

        let mut guard = self.scheduler.write().unwrap();
        *guard = Arc::new(fresh);
        info!(policy = %policy, "scheduler strategy replaced");
    }

    /// Copy of one workload mirror.
    pub fn workload(&self, name: &str) -> Option<GpuWorkload> {
        let workloads = self.workloads.read().unwrap();
        workloads.get(name).cloned()
    }

    /// Copies of every workload mirror.
    pub fn workloads(&self) -> Vec<GpuWorkload> {
        let workloads = self.workloads.read().unwrap();
        workloads.values().cloned().collect()
    }

    /// Copies of every discovered node.
    pub fn nodes(&self) -> Vec<GpuNode> {
        let nodes = self.nodes.read().unwrap();
        nodes.values().cloned().collect()
    }
}
