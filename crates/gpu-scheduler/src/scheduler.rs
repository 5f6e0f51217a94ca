//! `scheduler` matches queued workloads to devices under a placement policy.
//!
//! A [`Scheduler`] owns a device registry, a pending queue, and a map of
//! placed workloads behind one reader-writer lock, so a `schedule` call is a
//! single critical section: no registration or submission interleaves with a
//! placement pass. Placements are non-preemptive; a bound workload holds its
//! device until it is explicitly completed.
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceRegistry};
use crate::error::Error;
use crate::workload::{Workload, WorkloadQueue, WorkloadStatus};

/// Placement policy. Exactly one is active per scheduler instance; swapping
/// policies means building a new scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Policy {
    /// Pick the assignable device with the lowest compute utilization.
    LeastUtilized,
    /// Pick the assignable device with the least free memory that still
    /// fits, minimizing external fragmentation.
    BestFit,
    /// Sort the queue by descending priority, then place like LeastUtilized.
    Priority,
    /// Rotate a cursor over the device list, skipping devices that cannot
    /// take the workload.
    RoundRobin,
}

impl FromStr for Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "least-utilized" | "leastutilized" => Ok(Policy::LeastUtilized),
            "best-fit" | "bestfit" => Ok(Policy::BestFit),
            "priority" => Ok(Policy::Priority),
            "round-robin" | "roundrobin" => Ok(Policy::RoundRobin),
            other => Err(Error::invalid(format!("unknown policy {:?}", other))),
        }
    }
}

impl std::fmt::Display for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Policy::LeastUtilized => write!(f, "least-utilized"),
            Policy::BestFit => write!(f, "best-fit"),
            Policy::Priority => write!(f, "priority"),
            Policy::RoundRobin => write!(f, "round-robin"),
        }
    }
}

/// Point-in-time view of scheduler state, cheap to compute and safe to hand
/// to exporters. The window-based statistics live in `gpu-telemetry`; these
/// numbers are whatever the registry holds right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingMetrics {
    pub total_devices: usize,
    /// Devices currently carrying a workload
    pub active_devices: usize,
    /// Mean of per-device compute utilization
    pub average_utilization_pct: f64,
    /// Sum of used memory over sum of total memory, as a percentage
    pub memory_utilization_pct: f64,
    pub pending_workloads: usize,
    /// Operator hint, not enforced by any policy
    pub target_utilization_pct: f64,
}

struct Inner {
    registry: DeviceRegistry,
    queue: WorkloadQueue,
    /// Placed workloads by id. Pending workloads live in the queue only.
    workloads: HashMap<String, Workload>,
    /// Round-robin position into the sorted device id list
    cursor: usize,
}

/// The placement engine.
pub struct Scheduler {
    policy: Policy,
    target_utilization_pct: f64,
    inner: RwLock<Inner>,
}

impl Scheduler {
    pub fn new(policy: Policy) -> Self {
        Scheduler {
            policy,
            target_utilization_pct: 80.0,
            inner: RwLock::new(Inner {
                registry: DeviceRegistry::new(),
                queue: WorkloadQueue::new(),
                workloads: HashMap::new(),
                cursor: 0,
            }),
        }
    }

    pub fn with_target_utilization(mut self, pct: f64) -> Self {
        self.target_utilization_pct = pct;
        self
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Add or replace a device in the registry.
    pub fn register_device(&self, device: Device) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        inner.registry.register(device)
    }

    /// Drop a device from the registry. Does not touch the workload map; a
    /// workload orphaned this way still completes through [`complete`].
    ///
    /// [`complete`]: Scheduler::complete
    pub fn deregister_device(&self, id: &str) -> Option<Device> {
        let mut inner = self.inner.write().unwrap();
        inner.registry.deregister(id)
    }

    /// Refresh runtime telemetry for one device.
    pub fn update_device_runtime(
        &self,
        id: &str,
        utilization_pct: f64,
        temperature_c: f64,
        power_draw_w: f64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        inner
            .registry
            .update_runtime(id, utilization_pct, temperature_c, power_draw_w)
    }

    /// Queue a workload for placement on the next `schedule` call.
    pub fn submit(&self, workload: Workload) -> Result<(), Error> {
        let mut inner = self.inner.write().unwrap();
        inner.queue.submit(workload)
    }

    /// Run one placement pass over the pending queue.
    ///
    /// Workloads that no device can take stay queued for the next cycle in
    /// their original relative order. Returns the number of workloads bound
    /// during this pass.
    pub fn schedule(&self) -> usize {
        let mut inner = self.inner.write().unwrap();
        if inner.queue.is_empty() {
            return 0;
        }

        if self.policy == Policy::Priority {
            inner.queue.sort_by_priority();
        }

        let pending = inner.queue.drain();
        let mut unplaced = Vec::new();
        let mut placed = 0usize;

        for mut workload in pending {
            let choice = self.pick_device(&mut inner, &workload);
            match choice {
                Some(device_id) => match inner.registry.bind(&device_id, &mut workload) {
                    Ok(()) => {
                        info!(
                            workload_id = %workload.id,
                            device_id = %device_id,
                            policy = %self.policy,
                            "placed workload"
                        );
                        inner.workloads.insert(workload.id.clone(), workload);
                        placed += 1;
                    }
                    Err(e) => {
                        // The pick and the bind happen under the same write
                        // lock, so this indicates a policy bug. Keep the
                        // workload queued rather than losing it.
                        warn!(workload_id = %workload.id, error = %e, "bind refused a picked device");
                        unplaced.push(workload);
                    }
                },
                None => {
                    debug!(workload_id = %workload.id, "no assignable device this cycle");
                    unplaced.push(workload);
                }
            }
        }

        inner.queue.requeue(unplaced);
        placed
    }

    /// Release the device bound to `workload_id` and retire the workload as
    /// completed. Fails `NotFound` when no such placement exists.
    pub fn complete(&self, workload_id: &str) -> Result<Workload, Error> {
        self.retire(workload_id, WorkloadStatus::Completed)
    }

    /// Release the device bound to `workload_id` and retire the workload as
    /// failed.
    pub fn fail(&self, workload_id: &str) -> Result<Workload, Error> {
        self.retire(workload_id, WorkloadStatus::Failed)
    }

    fn retire(&self, workload_id: &str, status: WorkloadStatus) -> Result<Workload, Error> {
        let mut inner = self.inner.write().unwrap();
        let mut workload = inner
            .workloads
            .remove(workload_id)
            .ok_or_else(|| Error::not_found(workload_id))?;
        match inner.registry.release(&mut workload) {
            Ok(device_id) => {
                workload.status = status;
                info!(workload_id = %workload_id, device_id = %device_id, status = ?status, "retired workload");
                Ok(workload)
            }
            Err(e) => {
                // Put the workload back so the caller can retry or inspect.
                inner.workloads.insert(workload_id.to_string(), workload);
                Err(e)
            }
        }
    }

    /// Owned copies of every known device.
    pub fn snapshot(&self) -> Vec<Device> {
        let inner = self.inner.read().unwrap();
        inner.registry.snapshot()
    }

    /// A copy of a placed workload, if one with this id is currently bound.
    pub fn workload(&self, id: &str) -> Option<Workload> {
        let inner = self.inner.read().unwrap();
        inner.workloads.get(id).cloned()
    }

    pub fn pending_workloads(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.queue.len()
    }

    /// Compute the point-in-time scheduling metrics.
    pub fn metrics(&self) -> SchedulingMetrics {
        let inner = self.inner.read().unwrap();
        let devices = inner.registry.snapshot();
        let total_devices = devices.len();
        let active_devices = devices.iter().filter(|d| d.workload_id.is_some()).count();
        let average_utilization_pct = if total_devices > 0 {
            devices.iter().map(|d| d.utilization_pct).sum::<f64>() / total_devices as f64
        } else {
            0.0
        };
        let total_mem: u64 = devices.iter().map(|d| d.memory_total_mb).sum();
        let used_mem: u64 = devices.iter().map(|d| d.memory_used_mb).sum();
        let memory_utilization_pct = if total_mem > 0 {
            used_mem as f64 / total_mem as f64 * 100.0
        } else {
            0.0
        };
        SchedulingMetrics {
            total_devices,
            active_devices,
            average_utilization_pct,
            memory_utilization_pct,
            pending_workloads: inner.queue.len(),
            target_utilization_pct: self.target_utilization_pct,
        }
    }

    fn pick_device(&self, inner: &mut Inner, workload: &Workload) -> Option<String> {
        let ids = inner.registry.sorted_ids();
        match self.policy {
            // Priority reorders the queue up front and then places exactly
            // like LeastUtilized. Candidates are walked in id order and ties
            // keep the first seen, so placement is deterministic.
            Policy::LeastUtilized | Policy::Priority => {
                let mut best: Option<&Device> = None;
                for id in &ids {
                    let device = match inner.registry.get(id) {
                        Some(d) if DeviceRegistry::can_assign(d, workload) => d,
                        _ => continue,
                    };
                    if best.map_or(true, |b| device.utilization_pct < b.utilization_pct) {
                        best = Some(device);
                    }
                }
                best.map(|d| d.id.clone())
            }
            Policy::BestFit => {
                let mut best: Option<&Device> = None;
                for id in &ids {
                    let device = match inner.registry.get(id) {
                        Some(d) if DeviceRegistry::can_assign(d, workload) => d,
                        _ => continue,
                    };
                    if best.map_or(true, |b| device.memory_free_mb() < b.memory_free_mb()) {
                        best = Some(device);
                    }
                }
                best.map(|d| d.id.clone())
            }
            Policy::RoundRobin => {
                if ids.is_empty() {
                    return None;
                }
                let start = inner.cursor % ids.len();
                for offset in 0..ids.len() {
                    let idx = (start + offset) % ids.len();
                    let id = &ids[idx];
                    if let Some(device) = inner.registry.get(id) {
                        if DeviceRegistry::can_assign(device, workload) {
                            inner.cursor = idx + 1;
                            return Some(id.clone());
                        }
                    }
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn device(id: &str, total: u64, used: u64, util: f64) -> Device {
        let mut d = Device::new(id, "NVIDIA A100", total);
        d.memory_used_mb = used;
        d.utilization_pct = util;
        d
    }

    #[test]
    fn test_least_utilized_picks_minimum() {
        // Devices A (idle) and B (busy); the workload must land on A.
        let scheduler = Scheduler::new(Policy::LeastUtilized);
        scheduler.register_device(device("a", 40960, 0, 0.0)).unwrap();
        scheduler.register_device(device("b", 40960, 10240, 25.0)).unwrap();
        scheduler
            .submit(Workload::new("w", "w", 8192).with_priority(1))
            .unwrap();

        assert_eq!(scheduler.schedule(), 1);
        let metrics = scheduler.metrics();
        assert_eq!(metrics.active_devices, 1);
        let devices = scheduler.snapshot();
        let a = devices.iter().find(|d| d.id == "a").unwrap();
        let b = devices.iter().find(|d| d.id == "b").unwrap();
        assert_eq!(a.workload_id.as_deref(), Some("w"));
        assert_eq!(a.memory_used_mb, 8192);
        assert!(b.workload_id.is_none());
        assert_eq!(b.memory_used_mb, 10240);
    }

    #[test]
    fn test_best_fit_minimizes_free_memory() {
        let scheduler = Scheduler::new(Policy::BestFit);
        scheduler.register_device(device("a", 40960, 30000, 0.0)).unwrap();
        scheduler.register_device(device("b", 40960, 0, 0.0)).unwrap();
        scheduler.submit(Workload::new("w", "w", 10000)).unwrap();

        assert_eq!(scheduler.schedule(), 1);
        let devices = scheduler.snapshot();
        let a = devices.iter().find(|d| d.id == "a").unwrap();
        assert_eq!(a.workload_id.as_deref(), Some("w"));
    }

    #[test]
    fn test_best_fit_requires_fit() {
        let scheduler = Scheduler::new(Policy::BestFit);
        scheduler.register_device(device("a", 40960, 35000, 0.0)).unwrap();
        scheduler.submit(Workload::new("w", "w", 10000)).unwrap();
        assert_eq!(scheduler.schedule(), 0);
        assert_eq!(scheduler.pending_workloads(), 1);
    }

    #[test]
    fn test_priority_orders_placement() {
        // One device, two workloads; only the high-priority one fits.
        let scheduler = Scheduler::new(Policy::Priority);
        scheduler.register_device(device("d", 40960, 0, 0.0)).unwrap();
        scheduler
            .submit(Workload::new("low", "low", 8192).with_priority(1))
            .unwrap();
        scheduler
            .submit(Workload::new("high", "high", 8192).with_priority(10))
            .unwrap();

        assert_eq!(scheduler.schedule(), 1);
        let devices = scheduler.snapshot();
        assert_eq!(devices[0].workload_id.as_deref(), Some("high"));
        assert_eq!(scheduler.pending_workloads(), 1);
    }

    #[test]
    fn test_round_robin_rotates() {
        let scheduler = Scheduler::new(Policy::RoundRobin);
        for id in ["a", "b", "c"] {
            scheduler.register_device(device(id, 40960, 0, 0.0)).unwrap();
        }
        for id in ["w1", "w2", "w3"] {
            scheduler.submit(Workload::new(id, id, 1024)).unwrap();
        }

        assert_eq!(scheduler.schedule(), 3);
        let devices = scheduler.snapshot();
        // Each device got exactly one workload.
        assert!(devices.iter().all(|d| d.workload_id.is_some()));
    }

    #[test]
    fn test_round_robin_skips_full_devices() {
        let scheduler = Scheduler::new(Policy::RoundRobin);
        scheduler.register_device(device("a", 1024, 1024, 0.0)).unwrap();
        scheduler.register_device(device("b", 40960, 0, 0.0)).unwrap();
        scheduler.submit(Workload::new("w", "w", 2048)).unwrap();

        assert_eq!(scheduler.schedule(), 1);
        let devices = scheduler.snapshot();
        let b = devices.iter().find(|d| d.id == "b").unwrap();
        assert_eq!(b.workload_id.as_deref(), Some("w"));
    }

    #[test]
    fn test_round_trip_restores_memory() {
        let scheduler = Scheduler::new(Policy::LeastUtilized);
        scheduler.register_device(device("a", 40960, 0, 0.0)).unwrap();
        scheduler.register_device(device("b", 40960, 10240, 25.0)).unwrap();
        let before: HashMap<String, u64> = scheduler
            .snapshot()
            .into_iter()
            .map(|d| (d.id, d.memory_used_mb))
            .collect();

        scheduler.submit(Workload::new("w", "w", 8192)).unwrap();
        assert_eq!(scheduler.schedule(), 1);
        let completed = scheduler.complete("w").unwrap();
        assert_eq!(completed.status, WorkloadStatus::Completed);
        assert!(completed.completed_at.is_some());

        let after: HashMap<String, u64> = scheduler
            .snapshot()
            .into_iter()
            .map(|d| (d.id, d.memory_used_mb))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_complete_unknown_workload() {
        let scheduler = Scheduler::new(Policy::LeastUtilized);
        assert!(matches!(
            scheduler.complete("ghost"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_unplaceable_workload_stays_pending() {
        let scheduler = Scheduler::new(Policy::LeastUtilized);
        scheduler.register_device(device("a", 4096, 0, 0.0)).unwrap();
        scheduler.submit(Workload::new("big", "big", 8192)).unwrap();
        assert_eq!(scheduler.schedule(), 0);
        assert_eq!(scheduler.pending_workloads(), 1);
        // Still there on the next cycle too.
        assert_eq!(scheduler.schedule(), 0);
        assert_eq!(scheduler.pending_workloads(), 1);
    }

    #[test]
    fn test_progress_when_placement_possible() {
        let scheduler = Scheduler::new(Policy::LeastUtilized);
        scheduler.register_device(device("a", 40960, 0, 0.0)).unwrap();
        scheduler.submit(Workload::new("big", "big", 50000)).unwrap();
        scheduler.submit(Workload::new("fits", "fits", 8192)).unwrap();
        let before = scheduler.pending_workloads();
        let placed = scheduler.schedule();
        assert!(placed >= 1);
        assert!(scheduler.pending_workloads() < before);
    }

    #[test]
    fn test_unplaced_keep_relative_order() {
        let scheduler = Scheduler::new(Policy::LeastUtilized);
        scheduler.register_device(device("a", 4096, 0, 0.0)).unwrap();
        scheduler.submit(Workload::new("x", "x", 9000)).unwrap();
        scheduler.submit(Workload::new("y", "y", 9000)).unwrap();
        assert_eq!(scheduler.schedule(), 0);
        // Free up a bigger device; x must go first.
        scheduler.register_device(device("b", 16384, 0, 0.0)).unwrap();
        assert_eq!(scheduler.schedule(), 1);
        let devices = scheduler.snapshot();
        let b = devices.iter().find(|d| d.id == "b").unwrap();
        assert_eq!(b.workload_id.as_deref(), Some("x"));
    }

    #[test]
    fn test_running_binding_satisfies_uniqueness() {
        let scheduler = Scheduler::new(Policy::LeastUtilized);
        scheduler.register_device(device("a", 40960, 0, 0.0)).unwrap();
        scheduler.register_device(device("b", 40960, 0, 0.0)).unwrap();
        scheduler.submit(Workload::new("w", "w", 8192)).unwrap();
        scheduler.schedule();

        let carriers: Vec<_> = scheduler
            .snapshot()
            .into_iter()
            .filter(|d| d.workload_id.as_deref() == Some("w"))
            .collect();
        assert_eq!(carriers.len(), 1);
        let w = scheduler.workload("w").unwrap();
        assert_eq!(w.status, WorkloadStatus::Running);
        assert_eq!(w.assigned_device.as_deref(), Some(carriers[0].id.as_str()));
    }

    #[test]
    fn test_metrics_snapshot() {
        let scheduler = Scheduler::new(Policy::LeastUtilized).with_target_utilization(75.0);
        scheduler.register_device(device("a", 10000, 0, 40.0)).unwrap();
        scheduler.register_device(device("b", 10000, 5000, 60.0)).unwrap();
        scheduler.submit(Workload::new("w", "w", 20000)).unwrap();

        let m = scheduler.metrics();
        assert_eq!(m.total_devices, 2);
        assert_eq!(m.active_devices, 0);
        assert!((m.average_utilization_pct - 50.0).abs() < f64::EPSILON);
        assert!((m.memory_utilization_pct - 25.0).abs() < f64::EPSILON);
        assert_eq!(m.pending_workloads, 1);
        assert!((m.target_utilization_pct - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("best-fit".parse::<Policy>().unwrap(), Policy::BestFit);
        assert_eq!("RoundRobin".parse::<Policy>().unwrap(), Policy::RoundRobin);
        assert!("fifo".parse::<Policy>().is_err());
    }
}
