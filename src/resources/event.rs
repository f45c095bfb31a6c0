use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ObjectMeta, Resource};

/// Append-only audit record of a phase transition on a workload instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub metadata: ObjectMeta,
    pub involved_object: InvolvedObject,
    /// Resulting phase of the check direction.
    pub reason: String,
    pub message: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: EventSource,
    pub action: String,
    pub event_time: DateTime<Utc>,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reporting_controller: String,
    #[serde(default)]
    pub reporting_instance: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvolvedObject {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    #[serde(default)]
    pub component: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EventType {
    #[default]
    Normal,
    Warning,
}

impl Resource for AuditEvent {
    const KIND: &'static str = "Event";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
