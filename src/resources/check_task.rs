use serde::{Deserialize, Serialize};

use super::{ObjectMeta, Resource, WorkloadInstance};
use crate::phase::CheckDirection;

/// One check execution, run by an external task executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckTask {
    pub metadata: ObjectMeta,
    pub spec: CheckTaskSpec,
    #[serde(default)]
    pub status: CheckTaskStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckTaskSpec {
    /// Name of the workload instance the check runs for.
    pub service: String,
    pub application: String,
    #[serde(default)]
    pub check_type: CheckDirection,
    #[serde(default)]
    pub task_payload: serde_json::Value,
}

/// Written by the task executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckTaskStatus {
    #[serde(default)]
    pub phase: TaskPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TaskPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskPhase {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPhase::Pending => "Pending",
            TaskPhase::Running => "Running",
            TaskPhase::Succeeded => "Succeeded",
            TaskPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

impl CheckTask {
    /// Unnamed task for one direction of a workload instance.
    ///
    /// Namespace and annotations come from the instance; the payload is copied
    /// verbatim. The task factory assigns the name.
    pub fn for_instance(instance: &WorkloadInstance, direction: CheckDirection) -> Self {
        Self {
            metadata: ObjectMeta {
                namespace: instance.metadata.namespace.clone(),
                annotations: instance.metadata.annotations.clone(),
                ..Default::default()
            },
            spec: CheckTaskSpec {
                service: instance.metadata.name.clone(),
                application: instance.spec.app_name.clone(),
                check_type: direction,
                task_payload: instance.check(direction).task_payload.clone(),
            },
            status: CheckTaskStatus::default(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status.phase.is_completed()
    }
}

impl Resource for CheckTask {
    const KIND: &'static str = "CheckTask";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
