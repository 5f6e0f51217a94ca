//! Reconciliation loops for the GPU control plane.
//!
//! The [`Controller`](controller::Controller) watches cluster nodes carrying
//! the GPU enablement label, materializes their annotated devices into the
//! scheduler's registry, accepts workload intents, and realizes placements as
//! node-pinned pods. Cluster access goes through the
//! [`ClusterStore`](store::ClusterStore) trait so the loops can be exercised
//! against a mock in tests.

pub mod annotations;
pub mod controller;
pub mod pod;
pub mod store;
pub mod workload;

pub use annotations::{GpuDeviceDescriptor, GpuNode, NodePhase};
pub use controller::{Controller, ControllerConfig};
pub use store::{ClusterStore, KubeStore};
pub use workload::{Condition, GpuWorkload, PodTemplate, WorkloadPhase};
