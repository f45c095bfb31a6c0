//! Audit events for check phase transitions.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::context::ReconcileContext;
use crate::errors::StoreError;
use crate::phase::CheckDirection;
use crate::resources::{
    AuditEvent, EventSource, EventType, InvolvedObject, ObjectMeta, Resource, WorkloadInstance,
};
use crate::store::ObjectStore;

pub const DEFAULT_REPORTING_CONTROLLER: &str = "workloadinstance-controller";

/// What happened to a check direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    Started,
    Finished,
    /// Post-deployment checks were not run because pre-deployment checks failed.
    Skipped,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::Started => "started",
            AuditEventType::Finished => "finished",
            AuditEventType::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes audit events for workload instances into the object store.
#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<dyn ObjectStore<AuditEvent>>,
    reporting_controller: String,
    reporting_instance: String,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn ObjectStore<AuditEvent>>) -> Self {
        Self {
            store,
            reporting_controller: DEFAULT_REPORTING_CONTROLLER.to_string(),
            reporting_instance: DEFAULT_REPORTING_CONTROLLER.to_string(),
        }
    }

    pub fn with_reporter(
        mut self,
        controller: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        self.reporting_controller = controller.into();
        self.reporting_instance = instance.into();
        self
    }

    /// Build the event record for a transition that has already been applied
    /// to `instance.status`; the reason is the direction's resulting phase.
    pub fn build(
        &self,
        instance: &WorkloadInstance,
        direction: CheckDirection,
        event_type: AuditEventType,
        now: DateTime<Utc>,
    ) -> AuditEvent {
        let meta = &instance.metadata;
        AuditEvent {
            metadata: ObjectMeta {
                generate_name: format!("{}-{}-", meta.name, event_type),
                namespace: meta.namespace.clone(),
                annotations: meta.annotations.clone(),
                ..Default::default()
            },
            involved_object: InvolvedObject {
                kind: WorkloadInstance::KIND.to_string(),
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
            },
            reason: instance.status.phase(direction).to_string(),
            message: format!("{} checks are {}", direction, event_type),
            event_type: EventType::Normal,
            source: EventSource {
                component: WorkloadInstance::KIND.to_string(),
            },
            action: event_type.to_string(),
            event_time: now,
            first_timestamp: now,
            last_timestamp: now,
            reporting_controller: self.reporting_controller.clone(),
            reporting_instance: self.reporting_instance.clone(),
        }
    }

    /// Record one event. Failure is returned to the caller unchanged.
    pub async fn emit(
        &self,
        ctx: &ReconcileContext,
        instance: &WorkloadInstance,
        direction: CheckDirection,
        event_type: AuditEventType,
    ) -> Result<AuditEvent, StoreError> {
        let event = self.build(instance, direction, event_type, Utc::now());
        let created = ctx.guard(self.store.create(&event)).await?;
        debug!(
            event = %created.metadata.name,
            reason = %created.reason,
            "{}",
            created.message
        );
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::WorkloadPhase;
    use crate::resources::WorkloadInstanceSpec;
    use crate::store::{InMemoryStore, InjectedFault, Verb};

    fn running_instance() -> WorkloadInstance {
        let mut meta = ObjectMeta::named("ns", "checkout");
        meta.annotations
            .insert("trace-id".to_string(), "4bf92f35".to_string());
        let mut wi = WorkloadInstance::new(
            meta,
            WorkloadInstanceSpec {
                app_name: "shop".to_string(),
                ..Default::default()
            },
        );
        wi.status
            .start(CheckDirection::PreDeployment, "checkout-abc")
            .unwrap();
        wi
    }

    #[test]
    fn test_build_started_event() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = EventRecorder::new(store);
        let now = Utc::now();
        let event = recorder.build(
            &running_instance(),
            CheckDirection::PreDeployment,
            AuditEventType::Started,
            now,
        );

        assert_eq!(event.metadata.generate_name, "checkout-started-");
        assert_eq!(event.metadata.namespace, "ns");
        assert_eq!(event.metadata.annotations["trace-id"], "4bf92f35");
        assert_eq!(event.involved_object.kind, "WorkloadInstance");
        assert_eq!(event.involved_object.name, "checkout");
        assert_eq!(event.reason, WorkloadPhase::Running.to_string());
        assert_eq!(event.message, "pre-deployment checks are started");
        assert_eq!(event.event_type, EventType::Normal);
        assert_eq!(event.action, "started");
        assert_eq!(event.event_time, now);
        assert_eq!(event.first_timestamp, now);
        assert_eq!(event.last_timestamp, now);
        assert_eq!(event.reporting_controller, DEFAULT_REPORTING_CONTROLLER);
    }

    #[test]
    fn test_build_uses_direction_phase_as_reason() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = EventRecorder::new(store).with_reporter("checkgate", "checkgate-0");
        let mut wi = running_instance();
        wi.status
            .finish(CheckDirection::PreDeployment, WorkloadPhase::Failed)
            .unwrap();
        wi.status.skip_post_deployment().unwrap();

        let event = recorder.build(
            &wi,
            CheckDirection::PostDeployment,
            AuditEventType::Skipped,
            Utc::now(),
        );
        assert_eq!(event.reason, "Failed");
        assert_eq!(event.message, "post-deployment checks are skipped");
        assert_eq!(event.reporting_instance, "checkgate-0");
    }

    #[tokio::test]
    async fn test_emit_writes_event_to_store() {
        let store = Arc::new(InMemoryStore::new());
        let recorder = EventRecorder::new(store.clone());
        let created = recorder
            .emit(
                &ReconcileContext::background(),
                &running_instance(),
                CheckDirection::PreDeployment,
                AuditEventType::Started,
            )
            .await
            .unwrap();

        assert!(created.metadata.name.starts_with("checkout-started-"));
        let stored = store.all::<AuditEvent>(Some("ns"));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message, "pre-deployment checks are started");
    }

    #[tokio::test]
    async fn test_emit_surfaces_store_failure() {
        let store = Arc::new(InMemoryStore::new());
        store.inject_fault(AuditEvent::KIND, Verb::Create, InjectedFault::Unavailable, 1);
        let recorder = EventRecorder::new(store.clone());
        let err = recorder
            .emit(
                &ReconcileContext::background(),
                &running_instance(),
                CheckDirection::PreDeployment,
                AuditEventType::Started,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.all::<AuditEvent>(None).is_empty());
    }
}
