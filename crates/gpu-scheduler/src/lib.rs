//! A placement engine for GPU workloads.
//!
//! This crate contains the in-memory core of the control plane: a
//! [`DeviceRegistry`](device::DeviceRegistry) tracking accelerator devices and
//! their runtime state, a [`WorkloadQueue`](workload::WorkloadQueue) of pending
//! placement intents, and a [`Scheduler`](scheduler::Scheduler) that matches
//! one to the other under a configurable [`Policy`](scheduler::Policy). It has
//! no Kubernetes types in it; the `gpu-controller` crate maps cluster objects
//! onto these structures.

pub mod device;
pub mod error;
pub mod scheduler;
pub mod workload;

pub use device::{Device, DeviceRegistry};
pub use error::Error;
pub use scheduler::{Policy, Scheduler, SchedulingMetrics};
pub use workload::{Workload, WorkloadQueue, WorkloadStatus};
