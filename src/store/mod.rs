//! Object store abstraction.
//!
//! The controller never talks to a cluster directly. It reads and writes
//! resources through `ObjectStore<K>`, a typed CRUD interface with
//! optimistic concurrency: every write carries the `resourceVersion` it was
//! based on and a stale version fails with `StoreError::Conflict`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::StoreError;
use crate::resources::{AuditEvent, CheckTask, ObjectRef, Resource, WorkloadInstance};

pub mod memory;

pub use memory::{InMemoryStore, InjectedFault, Verb};

/// Typed CRUD access to cluster-resident objects of kind `K`.
#[async_trait]
pub trait ObjectStore<K: Resource>: Send + Sync {
    /// Fetch one object. Missing objects are `StoreError::NotFound`.
    async fn get(&self, key: &ObjectRef) -> Result<K, StoreError>;

    /// All objects of this kind, optionally limited to one namespace.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError>;

    /// Create a new object. An existing name is `StoreError::AlreadyExists`.
    ///
    /// When `metadata.name` is empty the store completes `metadata.generateName`.
    async fn create(&self, object: &K) -> Result<K, StoreError>;

    /// Replace metadata and spec, leaving status untouched.
    async fn update(&self, object: &K) -> Result<K, StoreError>;

    /// Replace status only, leaving metadata and spec untouched.
    async fn update_status(&self, object: &K) -> Result<K, StoreError>;

    async fn delete(&self, key: &ObjectRef) -> Result<(), StoreError>;
}

/// Kind of change reported on the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

/// A change notification from the store's watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: &'static str,
    pub object: ObjectRef,
    pub change: ChangeType,
}

/// The store handles the reconciler needs, one per resource kind.
#[derive(Clone)]
pub struct Stores {
    pub instances: Arc<dyn ObjectStore<WorkloadInstance>>,
    pub tasks: Arc<dyn ObjectStore<CheckTask>>,
    pub events: Arc<dyn ObjectStore<AuditEvent>>,
}

impl Stores {
    /// Use one backing store for every kind.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ObjectStore<WorkloadInstance>
            + ObjectStore<CheckTask>
            + ObjectStore<AuditEvent>
            + 'static,
    {
        Self {
            instances: store.clone(),
            tasks: store.clone(),
            events: store,
        }
    }
}
