//! Error types returned by the registry, queue, and scheduler.
use thiserror::Error;

/// Errors surfaced by placement operations.
///
/// A workload that simply cannot be placed this cycle is not an error: it
/// stays in the queue and is retried on the next `schedule` call.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller passed something that can never be accepted (empty id,
    /// zero-sized memory request). Never retried.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Why the input was rejected
        reason: String,
    },

    /// The named device or workload is not known to the registry.
    #[error("not found: {id}")]
    NotFound {
        /// The id that failed to resolve
        id: String,
    },

    /// Binding the workload would overcommit the device's memory or the
    /// device already carries a workload.
    #[error(
        "capacity exceeded on device {device_id}: requested {requested} MiB, {free} MiB free"
    )]
    CapacityExceeded {
        /// Device that rejected the binding
        device_id: String,
        /// Memory the workload asked for, in MiB
        requested: u64,
        /// Memory the device had left, in MiB
        free: u64,
    },
}

impl Error {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Error::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(id: impl Into<String>) -> Self {
        Error::NotFound { id: id.into() }
    }
}
