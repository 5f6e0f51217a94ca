//! `store` abstracts the cluster object store behind a trait.
//!
//! The controller loops only ever talk to [`ClusterStore`], so they run
//! unmodified against the Kubernetes-backed [`KubeStore`] in production and
//! against a mock in tests.
use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node as KubeNode, Pod as KubePod};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

/// The capabilities the controller needs from the cluster.
///
/// Calls inherit the caller's context; the controller imposes no deadlines of
/// its own. Failures are transient from the loops' point of view: they log
/// and continue on the next tick.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync + 'static {
    /// List nodes matching a label selector.
    async fn list_gpu_nodes(&self, selector: &str) -> anyhow::Result<Vec<KubeNode>>;

    /// Merge annotations onto a node.
    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> anyhow::Result<()>;

    /// Merge labels onto a node.
    async fn patch_node_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> anyhow::Result<()>;

    /// Create a pod in the given namespace.
    async fn create_pod(&self, namespace: &str, pod: KubePod) -> anyhow::Result<()>;

    /// List pods matching a label selector, across namespaces.
    async fn list_managed_pods(&self, selector: &str) -> anyhow::Result<Vec<KubePod>>;
}

/// Production [`ClusterStore`] backed by a [`kube::Client`].
#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
}

impl KubeStore {
    pub fn new(client: kube::Client) -> Self {
        KubeStore { client }
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn list_gpu_nodes(&self, selector: &str) -> anyhow::Result<Vec<KubeNode>> {
        let nodes: Api<KubeNode> = Api::all(self.client.clone());
        let params = ListParams::default().labels(selector);
        let list = nodes.list(&params).await?;
        debug!(selector = %selector, count = list.items.len(), "listed GPU nodes");
        Ok(list.items)
    }

    async fn patch_node_annotations(
        &self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let nodes: Api<KubeNode> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        nodes
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_node_labels(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let nodes: Api<KubeNode> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        nodes
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, pod: KubePod) -> anyhow::Result<()> {
        let pods: Api<KubePod> = Api::namespaced(self.client.clone(), namespace);
        pods.create(&PostParams::default(), &pod).await?;
        Ok(())
    }

    async fn list_managed_pods(&self, selector: &str) -> anyhow::Result<Vec<KubePod>> {
        let pods: Api<KubePod> = Api::all(self.client.clone());
        let params = ListParams::default().labels(selector);
        Ok(pods.list(&params).await?.items)
    }
}
