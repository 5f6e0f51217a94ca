//! `workload` models placement intents and the pending queue.
use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle phase of a workload. Transitions are monotonic:
/// `Pending` → `Running` → `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    /// Submitted but not yet placed on a device
    Pending,
    /// Bound to a device and occupying its memory
    Running,
    /// Released after finishing without error
    Completed,
    /// Released after an error
    Failed,
}

/// An intent to occupy one device's memory for an estimated duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    /// Unique id. The queue does not de-duplicate; uniqueness is the
    /// submitter's concern.
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Higher is more important. Only the `Priority` policy looks at this.
    pub priority: i32,
    /// Device memory the workload needs, in MiB. Must be positive.
    pub memory_required_mb: u64,
    /// Rough expected runtime, advisory only
    pub estimated_duration: Duration,
    pub status: WorkloadStatus,
    /// Weak back-lookup key to the device carrying this workload
    pub assigned_device: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workload {
    pub fn new(id: impl Into<String>, name: impl Into<String>, memory_required_mb: u64) -> Self {
        Workload {
            id: id.into(),
            name: name.into(),
            priority: 0,
            memory_required_mb,
            estimated_duration: Duration::from_secs(0),
            status: WorkloadStatus::Pending,
            assigned_device: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }
}

/// Ordered list of pending workloads.
///
/// First-in order by default. The `Priority` policy reorders by descending
/// priority before placement; the sort is stable, so equal priorities keep
/// their submission order. Workloads that cannot be placed stay in the queue
/// in their original relative order.
#[derive(Debug, Default)]
pub struct WorkloadQueue {
    pending: VecDeque<Workload>,
}

impl WorkloadQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Validate and enqueue a workload. Ids must be non-empty and the memory
    /// request positive; anything else is accepted, including duplicate ids.
    pub fn submit(&mut self, workload: Workload) -> Result<(), Error> {
        if workload.id.is_empty() {
            return Err(Error::invalid("workload id must not be empty"));
        }
        if workload.memory_required_mb == 0 {
            return Err(Error::invalid(format!(
                "workload {} requests zero memory",
                workload.id
            )));
        }
        self.pending.push_back(workload);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Workload> {
        self.pending.iter()
    }

    /// Take every pending workload out of the queue for a placement pass.
    pub fn drain(&mut self) -> Vec<Workload> {
        self.pending.drain(..).collect()
    }

    /// Put workloads that could not be placed back, preserving their order.
    pub fn requeue(&mut self, workloads: Vec<Workload>) {
        self.pending.extend(workloads);
    }

    /// Stable sort by strictly-descending priority. Submission order is the
    /// tiebreak for equal priorities.
    pub fn sort_by_priority(&mut self) {
        let mut drained: Vec<Workload> = self.pending.drain(..).collect();
        drained.sort_by_key(|w| std::cmp::Reverse(w.priority));
        self.pending.extend(drained);
    }

    /// Drop everything still pending, returning the abandoned workloads.
    pub fn clear(&mut self) -> Vec<Workload> {
        self.pending.drain(..).collect()
    }
}
