//! `annotations` defines the wire format shared with node agents.
//!
//! Node agents advertise their devices through annotations on the node
//! object; the controller parses them on discovery and mirrors runtime
//! status back through a second set of annotations and labels.
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node as KubeNode;
use serde::{Deserialize, Serialize};

use gpu_scheduler::Device;

/// Label and annotation marking a node as GPU-enabled.
pub const KEY_ENABLED: &str = "agentaflow.gpu/enabled";
/// Number of devices on the node, decimal integer.
pub const KEY_COUNT: &str = "agentaflow.gpu/count";
/// JSON array of [`GpuDeviceDescriptor`].
pub const KEY_DEVICES: &str = "agentaflow.gpu/devices";
/// JSON array of [`DeviceStatusRecord`], written by the controller.
pub const KEY_STATUS: &str = "agentaflow.gpu/status";
/// RFC3339 timestamp of the last status mirror.
pub const KEY_LAST_UPDATE: &str = "agentaflow.gpu/last-update";
/// Mean utilization across the node's devices, decimal.
pub const KEY_AVERAGE_UTILIZATION: &str = "agentaflow.gpu/average-utilization";
/// Number of devices currently able to take a workload.
pub const KEY_AVAILABLE_COUNT: &str = "agentaflow.gpu/available-count";
/// Pod label marking pods created by this controller.
pub const KEY_MANAGED: &str = "agentaflow.gpu/managed";
/// Pod annotation: composite id of the assigned device.
pub const KEY_ASSIGNED_GPU: &str = "agentaflow.gpu/assigned-gpu";
/// Pod annotation: hostname of the node carrying the assigned device.
pub const KEY_ASSIGNED_NODE: &str = "agentaflow.gpu/assigned-node";
/// Pod label: name of the workload the pod realizes.
pub const KEY_WORKLOAD: &str = "agentaflow.gpu/workload";
/// Node label bucketing mean utilization into low/medium/high.
pub const KEY_UTILIZATION_TIER: &str = "agentaflow.gpu/utilization-tier";
/// Node label: whether any device can take a workload.
pub const KEY_SCHEDULABLE: &str = "agentaflow.gpu/schedulable";

/// Extended resource name for GPU limits on synthesized pods.
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";
/// Node label used for pinning pods to a host.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// One device as advertised in the node's devices annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuDeviceDescriptor {
    pub id: String,
    pub name: String,
    /// Total device memory in MiB
    pub memory_total: u64,
    #[serde(rename = "pciBusID", default)]
    pub pci_bus_id: String,
    #[serde(default)]
    pub driver_version: String,
}

/// Runtime device state as mirrored into the status annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusRecord {
    pub id: String,
    pub utilization: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub temperature: f64,
    pub power_draw: f64,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload: Option<String>,
}

impl From<&Device> for DeviceStatusRecord {
    fn from(device: &Device) -> Self {
        DeviceStatusRecord {
            id: device.id.clone(),
            utilization: device.utilization_pct,
            memory_used: device.memory_used_mb,
            memory_total: device.memory_total_mb,
            temperature: device.temperature_c,
            power_draw: device.power_draw_w,
            available: device.available,
            workload: device.workload_id.clone(),
        }
    }
}

/// Reachability of a discovered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    Active,
    Unavailable,
    Maintenance,
}

/// A discovered GPU node: identity, phase, and advertised devices.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuNode {
    pub name: String,
    pub phase: NodePhase,
    pub devices: Vec<GpuDeviceDescriptor>,
    pub last_updated: DateTime<Utc>,
}

/// Build the composite registry id for a device on a node.
pub fn composite_device_id(node: &str, local_id: &str) -> String {
    format!("{}/{}", node, local_id)
}

/// Split a composite id at the first `/` into (node, local id).
pub fn split_device_id(id: &str) -> Option<(&str, &str)> {
    id.split_once('/')
}

/// Bucket a node's mean utilization for the tier label.
pub fn utilization_tier(average_pct: f64) -> &'static str {
    if average_pct < 25.0 {
        "low"
    } else if average_pct < 75.0 {
        "medium"
    } else {
        "high"
    }
}

/// Parse a node object into a [`GpuNode`].
///
/// Fails when the node has no name, the devices annotation is missing or
/// malformed, or two devices share a local id. The caller logs the failure
/// and skips the node; one bad node never stops discovery.
pub fn parse_gpu_node(node: &KubeNode) -> anyhow::Result<GpuNode> {
    let name = node
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("node has no name"))?;

    let annotations = node.metadata.annotations.clone().unwrap_or_default();
    let raw = annotations
        .get(KEY_DEVICES)
        .ok_or_else(|| anyhow::anyhow!("node {} has no {} annotation", name, KEY_DEVICES))?;
    let devices: Vec<GpuDeviceDescriptor> = serde_json::from_str(raw)
        .map_err(|e| anyhow::anyhow!("node {}: bad devices annotation: {}", name, e))?;

    let mut seen = std::collections::HashSet::new();
    for device in &devices {
        if !seen.insert(device.id.as_str()) {
            anyhow::bail!("node {}: duplicate device id {}", name, device.id);
        }
    }

    let phase = node_phase(node);
    Ok(GpuNode {
        name,
        phase,
        devices,
        last_updated: Utc::now(),
    })
}

fn node_phase(node: &KubeNode) -> NodePhase {
    if let Some(spec) = &node.spec {
        if spec.unschedulable.unwrap_or(false) {
            return NodePhase::Maintenance;
        }
    }
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    if ready {
        NodePhase::Active
    } else {
        NodePhase::Unavailable
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn gpu_node(name: &str, devices_json: &str, ready: bool) -> KubeNode {
        let mut annotations = BTreeMap::new();
        annotations.insert(KEY_ENABLED.to_string(), "true".to_string());
        annotations.insert(KEY_DEVICES.to_string(), devices_json.to_string());
        annotations.insert(KEY_COUNT.to_string(), "2".to_string());
        KubeNode {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    const DEVICES_JSON: &str = r#"[
        {"id":"0","name":"NVIDIA A100-SXM4-40GB","memoryTotal":40960,"pciBusID":"0000:17:00.0","driverVersion":"535.104"},
        {"id":"1","name":"NVIDIA A100-SXM4-40GB","memoryTotal":40960,"pciBusID":"0000:65:00.0","driverVersion":"535.104"}
    ]"#;

    #[test]
    fn test_parse_gpu_node() {
        let node = gpu_node("node-a", DEVICES_JSON, true);
        let parsed = parse_gpu_node(&node).unwrap();
        assert_eq!(parsed.name, "node-a");
        assert_eq!(parsed.phase, NodePhase::Active);
        assert_eq!(parsed.devices.len(), 2);
        assert_eq!(parsed.devices[0].memory_total, 40960);
        assert_eq!(parsed.devices[0].pci_bus_id, "0000:17:00.0");
    }

    #[test]
    fn test_parse_rejects_duplicate_ids() {
        let json = r#"[{"id":"0","name":"A100","memoryTotal":40960},
                       {"id":"0","name":"A100","memoryTotal":40960}]"#;
        let node = gpu_node("node-a", json, true);
        assert!(parse_gpu_node(&node).is_err());
    }

    #[test]
    fn test_parse_rejects_missing_annotation() {
        let node = KubeNode {
            metadata: ObjectMeta {
                name: Some("bare".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(parse_gpu_node(&node).is_err());
    }

    #[test]
    fn test_not_ready_node_is_unavailable() {
        let node = gpu_node("node-a", DEVICES_JSON, false);
        assert_eq!(parse_gpu_node(&node).unwrap().phase, NodePhase::Unavailable);
    }

    #[test]
    fn test_unschedulable_node_is_maintenance() {
        let mut node = gpu_node("node-a", DEVICES_JSON, true);
        node.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });
        assert_eq!(parse_gpu_node(&node).unwrap().phase, NodePhase::Maintenance);
    }

    #[test]
    fn test_composite_id_round_trip() {
        let id = composite_device_id("node-a", "0");
        assert_eq!(id, "node-a/0");
        assert_eq!(split_device_id(&id), Some(("node-a", "0")));
        // Split happens at the first separator only.
        assert_eq!(split_device_id("node/with/0"), Some(("node", "with/0")));
    }

    #[test]
    fn test_utilization_tier_buckets() {
        assert_eq!(utilization_tier(0.0), "low");
        assert_eq!(utilization_tier(24.9), "low");
        assert_eq!(utilization_tier(25.0), "medium");
        assert_eq!(utilization_tier(74.9), "medium");
        assert_eq!(utilization_tier(75.0), "high");
    }

    #[test]
    fn test_status_record_serialization() {
        let mut device = Device::new("node-a/0", "NVIDIA A100", 40960);
        device.memory_used_mb = 8192;
        device.utilization_pct = 42.0;
        device.workload_id = Some("train".to_string());
        let record = DeviceStatusRecord::from(&device);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["id"], "node-a/0");
        assert_eq!(json["memoryUsed"], 8192);
        assert_eq!(json["workload"], "train");
    }
}
