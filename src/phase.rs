//! Check phase state machine.
//!
//! Each direction (pre-deployment, post-deployment) of a workload instance
//! moves through `NotStarted -> Running -> {Succeeded, Failed}`. Terminal
//! phases absorb. The one extra edge is `NotStarted -> Failed` for
//! post-deployment checks, taken only when pre-deployment checks failed.

use crate::errors::TransitionError;
use crate::resources::TaskPhase;
use crate::resources::WorkloadInstanceStatus;
use serde::{Deserialize, Serialize};

/// Which side of the deployment a check runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CheckDirection {
    #[default]
    PreDeployment,
    PostDeployment,
}

impl CheckDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckDirection::PreDeployment => "pre-deployment",
            CheckDirection::PostDeployment => "post-deployment",
        }
    }
}

impl std::fmt::Display for CheckDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of one check direction on a workload instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkloadPhase {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

impl WorkloadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadPhase::NotStarted => "NotStarted",
            WorkloadPhase::Running => "Running",
            WorkloadPhase::Succeeded => "Succeeded",
            WorkloadPhase::Failed => "Failed",
        }
    }

    /// Succeeded and Failed never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// The outcome a finished check task folds into, if it has finished.
    pub fn from_task_outcome(phase: TaskPhase) -> Option<Self> {
        match phase {
            TaskPhase::Succeeded => Some(Self::Succeeded),
            TaskPhase::Failed => Some(Self::Failed),
            TaskPhase::Pending | TaskPhase::Running => None,
        }
    }
}

impl std::fmt::Display for WorkloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkloadPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "notstarted" | "not-started" | "" => Ok(WorkloadPhase::NotStarted),
            "running" => Ok(WorkloadPhase::Running),
            "succeeded" => Ok(WorkloadPhase::Succeeded),
            "failed" => Ok(WorkloadPhase::Failed),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: NotStarted, Running, Succeeded, Failed",
                s
            ),
        }
    }
}

/// Validate a single edge of the per-direction state machine.
pub fn check_transition(
    direction: CheckDirection,
    from: WorkloadPhase,
    to: WorkloadPhase,
) -> Result<(), TransitionError> {
    let allowed = match (from, to) {
        (WorkloadPhase::NotStarted, WorkloadPhase::Running) => true,
        (WorkloadPhase::Running, WorkloadPhase::Succeeded | WorkloadPhase::Failed) => true,
        // skip edge; the caller checks that pre-deployment failed
        (WorkloadPhase::NotStarted, WorkloadPhase::Failed) => {
            direction == CheckDirection::PostDeployment
        }
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(TransitionError::Illegal {
            direction,
            from,
            to,
        })
    }
}

/// What a reconcile pass should do next for a workload instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Both directions are terminal; nothing left to do.
    Complete,
    /// Create a check task for this direction.
    Start(CheckDirection),
    /// Poll the active check task for this direction.
    Poll(CheckDirection),
    /// Pre-deployment failed; mark post-deployment Failed without running it.
    SkipPostDeployment,
}

/// Decide the single step to take for the given status.
///
/// Pre-deployment checks are always handled first. Post-deployment checks are
/// only started once pre-deployment checks succeeded.
pub fn next_step(status: &WorkloadInstanceStatus) -> NextStep {
    let pre = status.pre_deployment_phase;
    let post = status.post_deployment_phase;

    match pre {
        WorkloadPhase::NotStarted => NextStep::Start(CheckDirection::PreDeployment),
        WorkloadPhase::Running => NextStep::Poll(CheckDirection::PreDeployment),
        WorkloadPhase::Failed if post.is_terminal() => NextStep::Complete,
        WorkloadPhase::Failed => NextStep::SkipPostDeployment,
        WorkloadPhase::Succeeded => match post {
            WorkloadPhase::NotStarted => NextStep::Start(CheckDirection::PostDeployment),
            WorkloadPhase::Running => NextStep::Poll(CheckDirection::PostDeployment),
            WorkloadPhase::Succeeded | WorkloadPhase::Failed => NextStep::Complete,
        },
    }
}
