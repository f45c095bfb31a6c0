use serde::{Deserialize, Serialize};

use super::{ObjectMeta, Resource};
use crate::errors::TransitionError;
use crate::phase::{CheckDirection, WorkloadPhase, check_transition};

/// One deployed revision of an application component under lifecycle gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadInstance {
    pub metadata: ObjectMeta,
    pub spec: WorkloadInstanceSpec,
    #[serde(default)]
    pub status: WorkloadInstanceStatus,
}

/// Externally set and never modified by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadInstanceSpec {
    pub app_name: String,
    #[serde(default)]
    pub pre_deployment_check: CheckDefinition,
    #[serde(default)]
    pub post_deployment_check: CheckDefinition,
}

/// Opaque description of what a check task should execute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDefinition {
    #[serde(default)]
    pub task_payload: serde_json::Value,
}

/// Written only by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadInstanceStatus {
    #[serde(default)]
    pub pre_deployment_phase: WorkloadPhase,
    #[serde(default)]
    pub post_deployment_phase: WorkloadPhase,
    #[serde(default)]
    pub pre_deployment_task_name: String,
    #[serde(default)]
    pub post_deployment_task_name: String,
}

impl WorkloadInstance {
    pub fn new(meta: ObjectMeta, spec: WorkloadInstanceSpec) -> Self {
        Self {
            metadata: meta,
            spec,
            status: WorkloadInstanceStatus::default(),
        }
    }

    /// Both check directions reached a terminal phase.
    pub fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    pub fn check(&self, direction: CheckDirection) -> &CheckDefinition {
        match direction {
            CheckDirection::PreDeployment => &self.spec.pre_deployment_check,
            CheckDirection::PostDeployment => &self.spec.post_deployment_check,
        }
    }
}

impl Resource for WorkloadInstance {
    const KIND: &'static str = "WorkloadInstance";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl WorkloadInstanceStatus {
    pub fn is_completed(&self) -> bool {
        self.pre_deployment_phase.is_terminal() && self.post_deployment_phase.is_terminal()
    }

    pub fn phase(&self, direction: CheckDirection) -> WorkloadPhase {
        match direction {
            CheckDirection::PreDeployment => self.pre_deployment_phase,
            CheckDirection::PostDeployment => self.post_deployment_phase,
        }
    }

    pub fn task_name(&self, direction: CheckDirection) -> &str {
        match direction {
            CheckDirection::PreDeployment => &self.pre_deployment_task_name,
            CheckDirection::PostDeployment => &self.post_deployment_task_name,
        }
    }

    fn slots_mut(&mut self, direction: CheckDirection) -> (&mut WorkloadPhase, &mut String) {
        match direction {
            CheckDirection::PreDeployment => (
                &mut self.pre_deployment_phase,
                &mut self.pre_deployment_task_name,
            ),
            CheckDirection::PostDeployment => (
                &mut self.post_deployment_phase,
                &mut self.post_deployment_task_name,
            ),
        }
    }

    /// NotStarted -> Running, recording the active check task.
    pub fn start(
        &mut self,
        direction: CheckDirection,
        task_name: &str,
    ) -> Result<(), TransitionError> {
        if task_name.is_empty() {
            return Err(TransitionError::EmptyTaskName { direction });
        }
        let (phase, name) = self.slots_mut(direction);
        check_transition(direction, *phase, WorkloadPhase::Running)?;
        *phase = WorkloadPhase::Running;
        *name = task_name.to_string();
        Ok(())
    }

    /// Running -> Succeeded/Failed. The task reference is cleared.
    pub fn finish(
        &mut self,
        direction: CheckDirection,
        outcome: WorkloadPhase,
    ) -> Result<(), TransitionError> {
        let (phase, name) = self.slots_mut(direction);
        if *phase != WorkloadPhase::Running || !outcome.is_terminal() {
            return Err(TransitionError::Illegal {
                direction,
                from: *phase,
                to: outcome,
            });
        }
        check_transition(direction, *phase, outcome)?;
        *phase = outcome;
        name.clear();
        Ok(())
    }

    /// Marks post-deployment checks Failed without running them.
    ///
    /// Only legal once pre-deployment checks have failed.
    pub fn skip_post_deployment(&mut self) -> Result<(), TransitionError> {
        if self.pre_deployment_phase != WorkloadPhase::Failed {
            return Err(TransitionError::SkipWithoutFailure {
                pre: self.pre_deployment_phase,
            });
        }
        let direction = CheckDirection::PostDeployment;
        let (phase, name) = self.slots_mut(direction);
        check_transition(direction, *phase, WorkloadPhase::Failed)?;
        *phase = WorkloadPhase::Failed;
        name.clear();
        Ok(())
    }
}
