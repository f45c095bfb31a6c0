//! Reconciliation of a single workload instance.
//!
//! One pass reads the instance, asks the phase state machine for the next
//! step and performs at most one kind of side effect: start a check task,
//! poll it, or fold its outcome into the instance status. Passes are
//! idempotent; the caller re-invokes them on every trigger and after the
//! returned requeue delay.
//!
//! Side effects are ordered so that a crash between them is repaired by the
//! next pass: a task is created or deleted before the status that refers to
//! it is written.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::context::ReconcileContext;
use crate::errors::ReconcileError;
use crate::events::{AuditEventType, EventRecorder};
use crate::naming::{DEFAULT_NAME_ATTEMPTS, DEFAULT_SUFFIX_LEN, IdSource, TaskFactory};
use crate::phase::{CheckDirection, NextStep, WorkloadPhase, next_step};
use crate::resources::{CheckTask, ObjectRef, Resource, WorkloadInstance};
use crate::store::{ObjectStore, Stores};

/// Polling delay while a check task is running
pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(5);

/// Outcome of a successful reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until the next external trigger.
    Done,
    /// Reconcile the same instance again after the delay.
    RequeueAfter(Duration),
}

/// Tunables of the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub requeue_after: Duration,
    pub task_name_attempts: usize,
    pub task_suffix_len: usize,
    pub reporting_controller: String,
    pub reporting_instance: String,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            requeue_after: DEFAULT_REQUEUE_AFTER,
            task_name_attempts: DEFAULT_NAME_ATTEMPTS,
            task_suffix_len: DEFAULT_SUFFIX_LEN,
            reporting_controller: crate::events::DEFAULT_REPORTING_CONTROLLER.to_string(),
            reporting_instance: crate::events::DEFAULT_REPORTING_CONTROLLER.to_string(),
        }
    }
}

/// Drives workload instances through their pre- and post-deployment checks.
pub struct Reconciler {
    instances: Arc<dyn ObjectStore<WorkloadInstance>>,
    tasks: Arc<dyn ObjectStore<CheckTask>>,
    factory: TaskFactory,
    recorder: EventRecorder,
    requeue_after: Duration,
}

impl Reconciler {
    pub fn new(stores: Stores, ids: Arc<dyn IdSource>, settings: ReconcilerSettings) -> Self {
        let factory = TaskFactory::new(stores.tasks.clone(), ids)
            .with_max_attempts(settings.task_name_attempts)
            .with_suffix_len(settings.task_suffix_len);
        let recorder = EventRecorder::new(stores.events)
            .with_reporter(settings.reporting_controller, settings.reporting_instance);

        Self {
            instances: stores.instances,
            tasks: stores.tasks,
            factory,
            recorder,
            requeue_after: settings.requeue_after,
        }
    }

    pub fn requeue_after(&self) -> Duration {
        self.requeue_after
    }

    /// Run one reconcile pass for the workload instance at `key`.
    #[instrument(skip_all, fields(instance = %key))]
    pub async fn reconcile(
        &self,
        key: &ObjectRef,
        ctx: &ReconcileContext,
    ) -> Result<Action, ReconcileError> {
        let mut instance = match ctx.guard(self.instances.get(key)).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => {
                debug!("workload instance is gone, nothing to do");
                return Ok(Action::Done);
            }
            Err(source) => {
                return Err(ReconcileError::FetchInstance {
                    key: key.clone(),
                    source,
                });
            }
        };

        if instance.is_completed() {
            return Ok(Action::Done);
        }

        match next_step(&instance.status) {
            NextStep::Complete => Ok(Action::Done),
            NextStep::Start(direction) => self.start_checks(ctx, &mut instance, direction).await,
            NextStep::Poll(direction) => self.poll_checks(ctx, &mut instance, direction).await,
            NextStep::SkipPostDeployment => self.skip_post_deployment(ctx, &mut instance).await,
        }
    }

    async fn start_checks(
        &self,
        ctx: &ReconcileContext,
        instance: &mut WorkloadInstance,
        direction: CheckDirection,
    ) -> Result<Action, ReconcileError> {
        let key = instance.object_ref();
        debug!(%direction, "check task does not exist, creating");

        let template = CheckTask::for_instance(instance, direction);
        let task_name = self
            .factory
            .create_task(ctx, &instance.metadata.name, &template)
            .await
            .map_err(|source| ReconcileError::CreateTask {
                key: key.clone(),
                direction,
                source,
            })?;

        instance.status.start(direction, &task_name)?;
        self.emit(ctx, instance, direction, AuditEventType::Started)
            .await?;
        self.persist_status(ctx, instance).await?;

        info!(%direction, task = %task_name, "checks started");
        Ok(Action::RequeueAfter(self.requeue_after))
    }

    async fn poll_checks(
        &self,
        ctx: &ReconcileContext,
        instance: &mut WorkloadInstance,
        direction: CheckDirection,
    ) -> Result<Action, ReconcileError> {
        let key = instance.object_ref();
        let task_name = instance.status.task_name(direction).to_string();
        if task_name.is_empty() {
            return Err(ReconcileError::MissingTask {
                key,
                direction,
                task: task_name,
            });
        }

        let task_key = ObjectRef::new(&key.namespace, &task_name);
        let task = match ctx.guard(self.tasks.get(&task_key)).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                return Err(ReconcileError::MissingTask {
                    key,
                    direction,
                    task: task_name,
                });
            }
            Err(source) => {
                return Err(ReconcileError::FetchTask {
                    key,
                    direction,
                    task: task_name,
                    source,
                });
            }
        };

        let Some(outcome) = WorkloadPhase::from_task_outcome(task.status.phase) else {
            debug!(%direction, task = %task_name, phase = %task.status.phase, "check task still running");
            return Ok(Action::RequeueAfter(self.requeue_after));
        };

        instance.status.finish(direction, outcome)?;
        let skip_post = direction == CheckDirection::PreDeployment && outcome == WorkloadPhase::Failed;
        if skip_post {
            instance.status.skip_post_deployment()?;
        }

        match ctx.guard(self.tasks.delete(&task_key)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(task = %task_name, "check task already deleted");
            }
            Err(source) => {
                return Err(ReconcileError::DeleteTask {
                    task: task_name,
                    source,
                });
            }
        }

        self.persist_status(ctx, instance).await?;
        self.emit(ctx, instance, direction, AuditEventType::Finished)
            .await?;
        if skip_post {
            self.emit(
                ctx,
                instance,
                CheckDirection::PostDeployment,
                AuditEventType::Skipped,
            )
            .await?;
        }

        info!(%direction, %outcome, task = %task_name, "checks finished");
        Ok(Action::Done)
    }

    async fn skip_post_deployment(
        &self,
        ctx: &ReconcileContext,
        instance: &mut WorkloadInstance,
    ) -> Result<Action, ReconcileError> {
        instance.status.skip_post_deployment()?;
        self.persist_status(ctx, instance).await?;
        self.emit(
            ctx,
            instance,
            CheckDirection::PostDeployment,
            AuditEventType::Skipped,
        )
        .await?;

        info!("post-deployment checks skipped after pre-deployment failure");
        Ok(Action::Done)
    }

    async fn persist_status(
        &self,
        ctx: &ReconcileContext,
        instance: &mut WorkloadInstance,
    ) -> Result<(), ReconcileError> {
        let updated = ctx
            .guard(self.instances.update_status(instance))
            .await
            .map_err(|source| ReconcileError::UpdateStatus {
                key: instance.object_ref(),
                source,
            })?;
        *instance = updated;
        Ok(())
    }

    async fn emit(
        &self,
        ctx: &ReconcileContext,
        instance: &WorkloadInstance,
        direction: CheckDirection,
        event_type: AuditEventType,
    ) -> Result<(), ReconcileError> {
        self.recorder
            .emit(ctx, instance, direction, event_type)
            .await
            .map(|_| ())
            .map_err(|source| ReconcileError::EmitEvent {
                key: instance.object_ref(),
                event: format!("{direction} {event_type}"),
                source,
            })
    }
}
