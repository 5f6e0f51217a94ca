//! `workload` models the controller-side mirror of a placement intent.
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Lifecycle of a workload mirror. Transitions only move forward:
/// `Pending` → `Scheduled` → `Running` → `Succeeded` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    /// Submitted, waiting for the scheduler to find a device
    Pending,
    /// Bound to a device; pod creation in flight or failed
    Scheduled,
    /// The realizing pod was created
    Running,
    Succeeded,
    Failed,
}

impl WorkloadPhase {
    fn rank(&self) -> u8 {
        match self {
            WorkloadPhase::Pending => 0,
            WorkloadPhase::Scheduled => 1,
            WorkloadPhase::Running => 2,
            WorkloadPhase::Succeeded | WorkloadPhase::Failed => 3,
        }
    }
}

/// A reason/message tuple recorded on phase changes and failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// What the synthesized pod should run. A deliberately small subset of a pod
/// spec; everything placement-related is filled in by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Controller-side record of a workload: the intent, its phase, and where it
/// ended up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuWorkload {
    /// Name, unique at the controller level; doubles as the scheduler id and
    /// the synthesized pod name
    pub name: String,
    pub namespace: String,
    /// GPUs requested on the synthesized pod
    pub gpu_count: u32,
    pub memory_required_mb: u64,
    pub priority: i32,
    pub estimated_duration: Duration,
    pub pod_template: PodTemplate,
    pub phase: WorkloadPhase,
    /// Composite id of the device this workload landed on
    pub assigned_gpu: Option<String>,
    pub assigned_node: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub conditions: Vec<Condition>,
}

impl GpuWorkload {
    pub fn new(name: impl Into<String>, memory_required_mb: u64) -> Self {
        GpuWorkload {
            name: name.into(),
            namespace: "default".to_string(),
            gpu_count: 1,
            memory_required_mb,
            priority: 0,
            estimated_duration: Duration::from_secs(0),
            pod_template: PodTemplate::default(),
            phase: WorkloadPhase::Pending,
            assigned_gpu: None,
            assigned_node: None,
            start_time: None,
            completion_time: None,
            conditions: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_gpu_count(mut self, count: u32) -> Self {
        self.gpu_count = count;
        self
    }

    pub fn with_template(mut self, template: PodTemplate) -> Self {
        self.pod_template = template;
        self
    }

    /// Advance the phase. Backwards transitions are refused and logged; a
    /// mirror never un-completes.
    pub fn transition(&mut self, phase: WorkloadPhase) {
        if phase.rank() < self.phase.rank() {
            warn!(
                workload = %self.name,
                from = ?self.phase,
                to = ?phase,
                "refusing backwards phase transition"
            );
            return;
        }
        self.phase = phase;
    }

    /// Append a condition recording why the mirror is in its current state.
    pub fn append_condition(
        &mut self,
        type_: impl Into<String>,
        status: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.conditions.push(Condition {
            type_: type_.into(),
            status: status.into(),
            reason: reason.into(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_phase_transitions_are_monotonic() {
        let mut w = GpuWorkload::new("train", 8192);
        w.transition(WorkloadPhase::Scheduled);
        w.transition(WorkloadPhase::Running);
        assert_eq!(w.phase, WorkloadPhase::Running);

        // Going back to Pending is refused.
        w.transition(WorkloadPhase::Pending);
        assert_eq!(w.phase, WorkloadPhase::Running);

        w.transition(WorkloadPhase::Succeeded);
        assert_eq!(w.phase, WorkloadPhase::Succeeded);
    }

    #[test]
    fn test_conditions_accumulate() {
        let mut w = GpuWorkload::new("train", 8192);
        w.append_condition("Ready", "True", "PodCreated", "pod train created");
        w.append_condition("Ready", "False", "PodCreateFailed", "quota exceeded");
        assert_eq!(w.conditions.len(), 2);
        assert_eq!(w.conditions[1].reason, "PodCreateFailed");
    }
}
