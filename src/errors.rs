//! Typed error hierarchy for the lifecycle controller.
//!
//! Four enums cover the layers of a reconcile pass:
//! - `StoreError`: object store calls (including cancellation and deadlines)
//! - `TransitionError`: illegal phase transitions on a workload instance
//! - `CreateTaskError`: check task naming and creation
//! - `ReconcileError`: a failed reconcile pass, carrying the failing step

use crate::phase::{CheckDirection, WorkloadPhase};
use crate::resources::ObjectRef;
use thiserror::Error;

/// Errors returned by an object store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: ObjectRef },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: ObjectRef },

    #[error("{kind} {key} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        kind: &'static str,
        key: ObjectRef,
        expected: u64,
        actual: u64,
    },

    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid object: {0}")]
    Invalid(String),

    #[error("Failed to (de)serialize object: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store call cancelled")]
    Cancelled,

    #[error("Store call exceeded its deadline")]
    DeadlineExceeded,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True when the call was aborted by the caller rather than failing in the store.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// An illegal move of a workload instance's check phase.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Cannot move {direction} checks from {from} to {to}")]
    Illegal {
        direction: CheckDirection,
        from: WorkloadPhase,
        to: WorkloadPhase,
    },

    #[error("Cannot start {direction} checks without a task name")]
    EmptyTaskName { direction: CheckDirection },

    #[error("Cannot skip post-deployment checks while pre-deployment checks are {pre}")]
    SkipWithoutFailure { pre: WorkloadPhase },
}

/// Errors from the check task factory.
#[derive(Debug, Error)]
pub enum CreateTaskError {
    #[error("No free check task name for {base} after {attempts} attempts")]
    Exhausted { base: String, attempts: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from a single reconcile pass. The caller retries the whole pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Could not fetch WorkloadInstance {key}: {source}")]
    FetchInstance {
        key: ObjectRef,
        #[source]
        source: StoreError,
    },

    #[error("Could not start {direction} checks for {key}: {source}")]
    CreateTask {
        key: ObjectRef,
        direction: CheckDirection,
        #[source]
        source: CreateTaskError,
    },

    #[error("Could not fetch {direction} check task {task} for {key}: {source}")]
    FetchTask {
        key: ObjectRef,
        direction: CheckDirection,
        task: String,
        #[source]
        source: StoreError,
    },

    #[error("{direction} check task {task:?} referenced by {key} does not exist")]
    MissingTask {
        key: ObjectRef,
        direction: CheckDirection,
        task: String,
    },

    #[error("Could not delete check task {task}: {source}")]
    DeleteTask {
        task: String,
        #[source]
        source: StoreError,
    },

    #[error("Could not update status of WorkloadInstance {key}: {source}")]
    UpdateStatus {
        key: ObjectRef,
        #[source]
        source: StoreError,
    },

    #[error("Could not emit {event} event for {key}: {source}")]
    EmitEvent {
        key: ObjectRef,
        event: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl ReconcileError {
    /// The store error underneath this failure, if there is one.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::FetchInstance { source, .. }
            | Self::FetchTask { source, .. }
            | Self::DeleteTask { source, .. }
            | Self::UpdateStatus { source, .. }
            | Self::EmitEvent { source, .. } => Some(source),
            Self::CreateTask {
                source: CreateTaskError::Store(source),
                ..
            } => Some(source),
            _ => None,
        }
    }

    /// True when the pass stopped because the caller cancelled it or its deadline passed.
    pub fn is_cancelled(&self) -> bool {
        self.store_error().is_some_and(StoreError::is_cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ObjectRef {
        ObjectRef::new("ns", "checkout")
    }

    #[test]
    fn store_error_not_found_is_matchable() {
        let err = StoreError::NotFound {
            kind: "WorkloadInstance",
            key: key(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
        assert!(err.to_string().contains("ns/checkout"));
    }

    #[test]
    fn store_error_conflict_carries_versions() {
        let err = StoreError::Conflict {
            kind: "WorkloadInstance",
            key: key(),
            expected: 3,
            actual: 4,
        };
        assert!(err.is_conflict());
        let msg = err.to_string();
        assert!(msg.contains('3') && msg.contains('4'));
    }

    #[test]
    fn reconcile_error_detects_cancellation() {
        let err = ReconcileError::UpdateStatus {
            key: key(),
            source: StoreError::DeadlineExceeded,
        };
        assert!(err.is_cancelled());

        let err = ReconcileError::CreateTask {
            key: key(),
            direction: CheckDirection::PreDeployment,
            source: CreateTaskError::Store(StoreError::Cancelled),
        };
        assert!(err.is_cancelled());

        let err = ReconcileError::MissingTask {
            key: key(),
            direction: CheckDirection::PreDeployment,
            task: "checkout-abc".to_string(),
        };
        assert!(!err.is_cancelled());
        assert!(err.store_error().is_none());
    }

    #[test]
    fn transition_error_converts_into_reconcile_error() {
        let inner = TransitionError::EmptyTaskName {
            direction: CheckDirection::PostDeployment,
        };
        let err: ReconcileError = inner.into();
        match &err {
            ReconcileError::Transition(TransitionError::EmptyTaskName { direction }) => {
                assert_eq!(*direction, CheckDirection::PostDeployment);
            }
            _ => panic!("Expected ReconcileError::Transition(EmptyTaskName)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::Cancelled);
        assert_std_error(&CreateTaskError::Exhausted {
            base: "checkout".into(),
            attempts: 5,
        });
        assert_std_error(&ReconcileError::Transition(
            TransitionError::SkipWithoutFailure {
                pre: WorkloadPhase::Running,
            },
        ));
    }
}
