//! `device` holds the catalog of accelerator devices known to the scheduler.
//!
//! The registry is the canonical owner of [`Device`] state, including the
//! back-reference from a device to the workload occupying it. Callers never
//! get references into the registry; reads hand out owned copies.
use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;
use crate::workload::{Workload, WorkloadStatus};

/// An addressable compute accelerator.
///
/// Static capacity (`memory_total_mb`, `power_limit_w`) comes from node
/// discovery; the runtime fields are refreshed by telemetry ingest. A device
/// carries at most one workload at a time, referenced by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Unique id, `<node-name>/<local-device-id>` when cluster-managed
    pub id: String,
    /// Model name as reported by the driver, e.g. "NVIDIA A100-SXM4-40GB"
    pub name: String,
    /// Total device memory in MiB
    pub memory_total_mb: u64,
    /// Memory currently accounted to the bound workload, in MiB
    pub memory_used_mb: u64,
    /// Compute utilization, 0..=100
    pub utilization_pct: f64,
    /// Core temperature in degrees Celsius
    pub temperature_c: f64,
    /// Current power draw in watts
    pub power_draw_w: f64,
    /// Board power limit in watts
    pub power_limit_w: f64,
    /// Whether the device may receive new workloads
    pub available: bool,
    /// Id of the workload currently bound to this device, if any
    pub workload_id: Option<String>,
}

impl Device {
    /// Create a device with the given identity and capacity. Runtime fields
    /// start zeroed and the device starts available.
    pub fn new(id: impl Into<String>, name: impl Into<String>, memory_total_mb: u64) -> Self {
        Device {
            id: id.into(),
            name: name.into(),
            memory_total_mb,
            memory_used_mb: 0,
            utilization_pct: 0.0,
            temperature_c: 0.0,
            power_draw_w: 0.0,
            power_limit_w: 0.0,
            available: true,
            workload_id: None,
        }
    }

    /// Memory not yet claimed by a workload, in MiB.
    pub fn memory_free_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_used_mb)
    }
}

/// Canonical mapping of device id to [`Device`].
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a device, replacing any existing record with the same id.
    ///
    /// Devices are re-discovered on every node scan, so replacement is the
    /// normal path. A replacement carries identity and capacity only: a
    /// running binding (the workload back-reference and its memory
    /// accounting) and the sampled runtime fields both survive onto the new
    /// record, since discovery owns neither. Shrinking a bound device below
    /// its accounted memory is rejected, since that would corrupt the memory
    /// invariant.
    pub fn register(&mut self, mut device: Device) -> Result<(), Error> {
        if device.id.is_empty() {
            return Err(Error::invalid("device id must not be empty"));
        }
        if device.memory_total_mb == 0 {
            return Err(Error::invalid(format!(
                "device {} reports zero total memory",
                device.id
            )));
        }

        if let Some(existing) = self.devices.get(&device.id) {
            if existing.workload_id.is_some() {
                if device.memory_total_mb < existing.memory_used_mb {
                    return Err(Error::CapacityExceeded {
                        device_id: device.id,
                        requested: existing.memory_used_mb,
                        free: 0,
                    });
                }
                device.workload_id = existing.workload_id.clone();
                device.memory_used_mb = existing.memory_used_mb;
            }
            device.utilization_pct = existing.utilization_pct;
            device.temperature_c = existing.temperature_c;
            device.power_draw_w = existing.power_draw_w;
            if device.power_limit_w == 0.0 {
                device.power_limit_w = existing.power_limit_w;
            }
            debug!(device_id = %device.id, "replacing existing device record");
        }

        self.devices.insert(device.id.clone(), device);
        Ok(())
    }

    /// Remove a device from the registry, returning its last known state.
    pub fn deregister(&mut self, id: &str) -> Option<Device> {
        let removed = self.devices.remove(id);
        if let Some(ref d) = removed {
            if let Some(ref w) = d.workload_id {
                warn!(device_id = %id, workload_id = %w, "deregistered a device with a bound workload");
            }
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Owned copies of every device record. No references into the registry
    /// escape to callers.
    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    /// Device ids sorted lexically. Policies iterate in this order so that
    /// ties break deterministically.
    pub fn sorted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether `device` can accept `workload` right now: it must be marked
    /// available, carry no workload, and have enough free memory.
    pub fn can_assign(device: &Device, workload: &Workload) -> bool {
        device.available
            && device.workload_id.is_none()
            && device.memory_free_mb() >= workload.memory_required_mb
    }

    /// Atomically bind `workload` to the device: set the back-reference, add
    /// the requested memory to the accounted total, and stamp the workload as
    /// running. Fails if the assignability predicate no longer holds.
    pub fn bind(&mut self, device_id: &str, workload: &mut Workload) -> Result<(), Error> {
        let device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::not_found(device_id))?;

        if !device.available
            || device.workload_id.is_some()
            || device.memory_free_mb() < workload.memory_required_mb
        {
            return Err(Error::CapacityExceeded {
                device_id: device_id.to_string(),
                requested: workload.memory_required_mb,
                free: device.memory_free_mb(),
            });
        }

        device.workload_id = Some(workload.id.clone());
        device.memory_used_mb += workload.memory_required_mb;
        workload.status = WorkloadStatus::Running;
        workload.assigned_device = Some(device_id.to_string());
        workload.started_at = Some(Utc::now());
        Ok(())
    }

    /// Release whichever device is bound to `workload_id`, subtracting the
    /// workload's memory and clearing the back-reference. Returns the freed
    /// device's id.
    pub fn release(&mut self, workload: &mut Workload) -> Result<String, Error> {
        let device = self
            .devices
            .values_mut()
            .find(|d| d.workload_id.as_deref() == Some(workload.id.as_str()))
            .ok_or_else(|| Error::not_found(&workload.id))?;

        device.memory_used_mb = device.memory_used_mb.saturating_sub(workload.memory_required_mb);
        device.workload_id = None;
        let device_id = device.id.clone();
        workload.completed_at = Some(Utc::now());
        Ok(device_id)
    }

    /// Refresh a device's runtime telemetry fields. Memory accounting is
    /// deliberately untouched: `memory_used_mb` belongs to the binding, not
    /// to the sampler.
    pub fn update_runtime(
        &mut self,
        id: &str,
        utilization_pct: f64,
        temperature_c: f64,
        power_draw_w: f64,
    ) -> Result<(), Error> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| Error::not_found(id))?;
        device.utilization_pct = utilization_pct;
        device.temperature_c = temperature_c;
        device.power_draw_w = power_draw_w;
        Ok(())
    }
}
