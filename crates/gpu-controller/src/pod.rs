//! `pod` synthesizes node-pinned pods realizing placed workloads.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod as KubePod, PodSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use crate::annotations::{
    GPU_RESOURCE, HOSTNAME_LABEL, KEY_ASSIGNED_GPU, KEY_ASSIGNED_NODE, KEY_MANAGED, KEY_WORKLOAD,
};
use crate::workload::GpuWorkload;

/// Build the pod realizing a placed workload.
///
/// The pod is pinned to the device's node through a hostname node selector,
/// requests the device count as an extended resource limit, and carries the
/// assignment annotations so node agents and dashboards can attribute it.
pub fn build_workload_pod(workload: &GpuWorkload, device_id: &str, node_name: &str) -> KubePod {
    let mut labels = workload.pod_template.labels.clone();
    labels.insert(KEY_MANAGED.to_string(), "true".to_string());
    labels.insert(KEY_WORKLOAD.to_string(), workload.name.clone());

    let mut annotations = BTreeMap::new();
    annotations.insert(KEY_ASSIGNED_GPU.to_string(), device_id.to_string());
    annotations.insert(KEY_ASSIGNED_NODE.to_string(), node_name.to_string());

    let mut node_selector = BTreeMap::new();
    node_selector.insert(HOSTNAME_LABEL.to_string(), node_name.to_string());

    let mut limits = BTreeMap::new();
    limits.insert(
        GPU_RESOURCE.to_string(),
        Quantity(workload.gpu_count.to_string()),
    );

    let env: Vec<EnvVar> = workload
        .pod_template
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        })
        .collect();

    let container = Container {
        name: workload.name.clone(),
        image: Some(workload.pod_template.image.clone()),
        command: if workload.pod_template.command.is_empty() {
            None
        } else {
            Some(workload.pod_template.command.clone())
        },
        args: if workload.pod_template.args.is_empty() {
            None
        } else {
            Some(workload.pod_template.args.clone())
        },
        env: if env.is_empty() { None } else { Some(env) },
        resources: Some(ResourceRequirements {
            limits: Some(limits),
            requests: None,
        }),
        ..Default::default()
    };

    KubePod {
        metadata: ObjectMeta {
            name: Some(workload.name.clone()),
            namespace: Some(workload.namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            node_selector: Some(node_selector),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::workload::PodTemplate;

    fn training_workload() -> GpuWorkload {
        let mut env = BTreeMap::new();
        env.insert("BATCH_SIZE".to_string(), "64".to_string());
        GpuWorkload::new("train-llm", 32768)
            .with_namespace("ml")
            .with_gpu_count(2)
            .with_template(PodTemplate {
                image: "registry.local/trainer:1.4".to_string(),
                command: vec!["python".to_string()],
                args: vec!["train.py".to_string()],
                env,
                labels: BTreeMap::new(),
            })
    }

    #[test]
    fn test_pod_is_pinned_to_node() {
        let pod = build_workload_pod(&training_workload(), "node-a/0", "node-a");
        let spec = pod.spec.unwrap();
        let selector = spec.node_selector.unwrap();
        assert_eq!(selector.get(HOSTNAME_LABEL).unwrap(), "node-a");
    }

    #[test]
    fn test_pod_requests_gpu_limit() {
        let pod = build_workload_pod(&training_workload(), "node-a/0", "node-a");
        let spec = pod.spec.unwrap();
        let limits = spec.containers[0]
            .resources
            .as_ref()
            .unwrap()
            .limits
            .as_ref()
            .unwrap();
        assert_eq!(limits.get(GPU_RESOURCE).unwrap(), &Quantity("2".to_string()));
    }

    #[test]
    fn test_pod_carries_assignment_metadata() {
        let pod = build_workload_pod(&training_workload(), "node-a/0", "node-a");
        let annotations = pod.metadata.annotations.unwrap();
        assert_eq!(annotations.get(KEY_ASSIGNED_GPU).unwrap(), "node-a/0");
        assert_eq!(annotations.get(KEY_ASSIGNED_NODE).unwrap(), "node-a");
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(KEY_MANAGED).unwrap(), "true");
        assert_eq!(labels.get(KEY_WORKLOAD).unwrap(), "train-llm");
    }

    #[test]
    fn test_pod_container_from_template() {
        let pod = build_workload_pod(&training_workload(), "node-a/0", "node-a");
        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(container.image.as_deref(), Some("registry.local/trainer:1.4"));
        assert_eq!(container.command.as_ref().unwrap(), &vec!["python".to_string()]);
        let env = container.env.as_ref().unwrap();
        assert_eq!(env[0].name, "BATCH_SIZE");
        assert_eq!(env[0].value.as_deref(), Some("64"));
        assert_eq!(pod.metadata.namespace.as_deref(), Some("ml"));
    }
}
