//! Cluster-resident resource types handled by the controller.
//!
//! Every type serializes the Kubernetes way (`metadata`, `spec`, `status`,
//! camelCase fields) so manifests written for a cluster load unchanged.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod check_task;
pub mod event;
pub mod workload_instance;

pub use check_task::{CheckTask, CheckTaskSpec, CheckTaskStatus, TaskPhase};
pub use event::{AuditEvent, EventSource, EventType, InvolvedObject};
pub use workload_instance::{
    CheckDefinition, WorkloadInstance, WorkloadInstanceSpec, WorkloadInstanceStatus,
};

/// Namespace + name key of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Metadata shared by all resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    /// Prefix the store completes with a random suffix when `name` is empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Optimistic concurrency token, assigned by the store on every write.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl ObjectMeta {
    pub fn named(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }
}

/// A typed resource the object store can hold.
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn object_ref(&self) -> ObjectRef {
        let meta = self.meta();
        ObjectRef::new(&meta.namespace, &meta.name)
    }
}
