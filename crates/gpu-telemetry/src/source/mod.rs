//! `source` abstracts where telemetry comes from.
//!
//! The collector is polymorphic over [`SampleSource`]: production deployments
//! use [`SmiSource`] to query the vendor tool, development and tests use
//! [`SyntheticSource`] to simulate a fleet. A failed sample for one device
//! never aborts the tick; the collector logs it and moves on.
mod smi;
mod synthetic;

pub use smi::SmiSource;
pub use synthetic::{SyntheticDeviceSpec, SyntheticSource, WorkloadPattern};

use async_trait::async_trait;
use thiserror::Error;

use crate::sample::{GpuProcess, Sample};

/// Errors produced while acquiring telemetry.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The query command could not be spawned or exited unsuccessfully.
    #[error("query command failed: {reason}")]
    Command {
        /// What went wrong with the invocation
        reason: String,
    },

    /// A record from the source had the wrong shape. The offending record is
    /// skipped; the tick proceeds.
    #[error("malformed record {line:?}: {reason}")]
    Parse {
        /// The raw record
        line: String,
        /// Why it failed to parse
        reason: String,
    },

    /// The source does not know the requested device.
    #[error("unknown device {id}")]
    UnknownDevice {
        /// The device id that failed to resolve
        id: String,
    },
}

/// A producer of per-device telemetry.
#[async_trait]
pub trait SampleSource: Send + Sync + 'static {
    /// Ids of every device this source can currently sample.
    async fn device_ids(&self) -> Result<Vec<String>, SourceError>;

    /// Produce one sample for the given device.
    async fn sample(&self, device_id: &str) -> Result<Sample, SourceError>;

    /// Compute processes currently resident on the given device.
    async fn running_processes(&self, device_id: &str) -> Result<Vec<GpuProcess>, SourceError>;
}
