//! In-process object store.
//!
//! Holds every resource kind in one concurrent map as JSON, the way an API
//! server stores opaque objects. Resource versions come from a single
//! monotonic counter. Status is a subresource: `update` never touches it and
//! `update_status` touches nothing else.
//!
//! Besides the `ObjectStore` implementation it offers synchronous helpers for
//! seeding and inspecting state, a broadcast watch stream, and fault
//! injection so tests can make individual calls fail or hang.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{ChangeType, ObjectStore, StoreEvent};
use crate::errors::StoreError;
use crate::resources::{ObjectRef, Resource};

/// Capacity of the watch channel
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Length of the random part appended to `generateName`
const GENERATED_SUFFIX_LEN: usize = 5;

/// Store operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

/// Failure to inject into a store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// Fail with `StoreError::Unavailable`.
    Unavailable,
    /// Fail with `StoreError::Conflict`.
    Conflict,
    /// Never complete; only a deadline or cancellation ends the call.
    Hang,
}

#[derive(Debug)]
struct FaultRule {
    kind: &'static str,
    verb: Verb,
    fault: InjectedFault,
    remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoreKey {
    kind: &'static str,
    namespace: String,
    name: String,
}

impl StoreKey {
    fn of<K: Resource>(key: &ObjectRef) -> Self {
        Self {
            kind: K::KIND,
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        }
    }
}

#[derive(Debug)]
struct Stored {
    resource_version: u64,
    value: Value,
}

pub struct InMemoryStore {
    objects: DashMap<StoreKey, Stored>,
    revision: AtomicU64,
    faults: Mutex<Vec<FaultRule>>,
    watch_tx: broadcast::Sender<StoreEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            objects: DashMap::new(),
            revision: AtomicU64::new(0),
            faults: Mutex::new(Vec::new()),
            watch_tx,
        }
    }

    /// Subscribe to change notifications for every kind.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.watch_tx.subscribe()
    }

    /// Make the next `times` calls of `verb` on `kind` fail with `fault`.
    pub fn inject_fault(&self, kind: &'static str, verb: Verb, fault: InjectedFault, times: usize) {
        if times == 0 {
            return;
        }
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.push(FaultRule {
            kind,
            verb,
            fault,
            remaining: times,
        });
    }

    /// Seed an object, exactly like `create`.
    pub fn insert<K: Resource>(&self, object: K) -> Result<K, StoreError> {
        self.create_object(&object)
    }

    /// Current copy of an object, if it exists.
    pub fn fetch<K: Resource>(&self, key: &ObjectRef) -> Option<K> {
        self.get_object(key).ok()
    }

    /// Every object of kind `K`, sorted by namespace and name.
    pub fn all<K: Resource>(&self, namespace: Option<&str>) -> Vec<K> {
        self.list_objects(namespace).unwrap_or_default()
    }

    /// Unconditional read-modify-write of a whole object, spec and status included.
    ///
    /// This is how out-of-band writers (a task executor, a test) change
    /// objects; the resource version still moves forward.
    pub fn mutate<K, F>(&self, key: &ObjectRef, f: F) -> Result<K, StoreError>
    where
        K: Resource,
        F: FnOnce(&mut K),
    {
        let updated = {
            let mut entry = self
                .objects
                .get_mut(&StoreKey::of::<K>(key))
                .ok_or_else(|| not_found::<K>(key))?;
            let mut object: K = serde_json::from_value(entry.value.clone())?;
            f(&mut object);
            let rv = self.next_revision();
            let meta = object.meta_mut();
            meta.name = key.name.clone();
            meta.namespace = key.namespace.clone();
            meta.resource_version = rv;
            entry.value = serde_json::to_value(&object)?;
            entry.resource_version = rv;
            object
        };
        self.notify(K::KIND, key.clone(), ChangeType::Modified);
        Ok(updated)
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, kind: &'static str, object: ObjectRef, change: ChangeType) {
        // no subscribers is fine
        let _ = self.watch_tx.send(StoreEvent {
            kind,
            object,
            change,
        });
    }

    fn take_fault(&self, kind: &'static str, verb: Verb) -> Option<InjectedFault> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        let index = faults
            .iter()
            .position(|rule| rule.kind == kind && rule.verb == verb)?;
        let rule = &mut faults[index];
        let fault = rule.fault;
        rule.remaining -= 1;
        if rule.remaining == 0 {
            faults.remove(index);
        }
        Some(fault)
    }

    async fn check_fault<K: Resource>(&self, verb: Verb, key: &ObjectRef) -> Result<(), StoreError> {
        let Some(fault) = self.take_fault(K::KIND, verb) else {
            return Ok(());
        };
        debug!(kind = K::KIND, key = %key, ?verb, ?fault, "injecting store fault");
        match fault {
            InjectedFault::Unavailable => Err(StoreError::Unavailable(format!(
                "injected fault on {:?} {} {}",
                verb,
                K::KIND,
                key
            ))),
            InjectedFault::Conflict => Err(StoreError::Conflict {
                kind: K::KIND,
                key: key.clone(),
                expected: 0,
                actual: 0,
            }),
            InjectedFault::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    fn get_object<K: Resource>(&self, key: &ObjectRef) -> Result<K, StoreError> {
        let entry = self
            .objects
            .get(&StoreKey::of::<K>(key))
            .ok_or_else(|| not_found::<K>(key))?;
        Ok(serde_json::from_value(entry.value.clone())?)
    }

    fn list_objects<K: Resource>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        let mut found: Vec<(StoreKey, Value)> = self
            .objects
            .iter()
            .filter(|e| {
                e.key().kind == K::KIND && namespace.is_none_or(|ns| e.key().namespace == ns)
            })
            .map(|e| (e.key().clone(), e.value().value.clone()))
            .collect();
        found.sort_by(|(a, _), (b, _)| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

        found
            .into_iter()
            .map(|(_, value)| serde_json::from_value(value).map_err(StoreError::from))
            .collect()
    }

    fn create_object<K: Resource>(&self, object: &K) -> Result<K, StoreError> {
        let mut object = object.clone();
        let rv = self.next_revision();
        {
            let meta = object.meta_mut();
            if meta.namespace.is_empty() {
                return Err(StoreError::Invalid(format!(
                    "{} requires a namespace",
                    K::KIND
                )));
            }
            if meta.name.is_empty() {
                if meta.generate_name.is_empty() {
                    return Err(StoreError::Invalid(format!(
                        "{} requires a name or generateName",
                        K::KIND
                    )));
                }
                let random = Uuid::new_v4().simple().to_string();
                meta.name = format!("{}{}", meta.generate_name, &random[..GENERATED_SUFFIX_LEN]);
            }
            meta.resource_version = rv;
            meta.creation_timestamp = Some(Utc::now());
        }

        let key = object.object_ref();
        let value = serde_json::to_value(&object)?;
        match self.objects.entry(StoreKey::of::<K>(&key)) {
            Entry::Occupied(_) => {
                return Err(StoreError::AlreadyExists { kind: K::KIND, key });
            }
            Entry::Vacant(slot) => {
                slot.insert(Stored {
                    resource_version: rv,
                    value,
                });
            }
        }

        self.notify(K::KIND, key, ChangeType::Added);
        Ok(object)
    }

    fn update_object<K: Resource>(&self, object: &K, status_only: bool) -> Result<K, StoreError> {
        let key = object.object_ref();
        let updated: K = {
            let mut entry = self
                .objects
                .get_mut(&StoreKey::of::<K>(&key))
                .ok_or_else(|| not_found::<K>(&key))?;

            let expected = object.meta().resource_version;
            if expected != entry.resource_version {
                return Err(StoreError::Conflict {
                    kind: K::KIND,
                    key,
                    expected,
                    actual: entry.resource_version,
                });
            }

            let rv = self.next_revision();
            let incoming = serde_json::to_value(object)?;
            let mut merged = if status_only {
                let mut merged = entry.value.clone();
                set_field(&mut merged, "status", incoming.get("status").cloned());
                merged
            } else {
                let mut merged = incoming;
                set_field(&mut merged, "status", entry.value.get("status").cloned());
                merged
            };
            set_resource_version(&mut merged, rv);

            let updated = serde_json::from_value(merged.clone())?;
            entry.value = merged;
            entry.resource_version = rv;
            updated
        };

        self.notify(K::KIND, key, ChangeType::Modified);
        Ok(updated)
    }

    fn delete_object<K: Resource>(&self, key: &ObjectRef) -> Result<(), StoreError> {
        self.objects
            .remove(&StoreKey::of::<K>(key))
            .ok_or_else(|| not_found::<K>(key))?;
        self.notify(K::KIND, key.clone(), ChangeType::Deleted);
        Ok(())
    }
}

fn not_found<K: Resource>(key: &ObjectRef) -> StoreError {
    StoreError::NotFound {
        kind: K::KIND,
        key: key.clone(),
    }
}

fn set_field(target: &mut Value, field: &str, value: Option<Value>) {
    if let Some(map) = target.as_object_mut() {
        match value {
            Some(v) => {
                map.insert(field.to_string(), v);
            }
            None => {
                map.remove(field);
            }
        }
    }
}

fn set_resource_version(target: &mut Value, rv: u64) {
    if let Some(meta) = target.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.insert("resourceVersion".to_string(), Value::from(rv));
    }
}

#[async_trait]
impl<K: Resource> ObjectStore<K> for InMemoryStore {
    async fn get(&self, key: &ObjectRef) -> Result<K, StoreError> {
        self.check_fault::<K>(Verb::Get, key).await?;
        self.get_object(key)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        let scope = ObjectRef::new(namespace.unwrap_or("*"), "*");
        self.check_fault::<K>(Verb::List, &scope).await?;
        self.list_objects(namespace)
    }

    async fn create(&self, object: &K) -> Result<K, StoreError> {
        self.check_fault::<K>(Verb::Create, &object.object_ref())
            .await?;
        self.create_object(object)
    }

    async fn update(&self, object: &K) -> Result<K, StoreError> {
        self.check_fault::<K>(Verb::Update, &object.object_ref())
            .await?;
        self.update_object(object, false)
    }

    async fn update_status(&self, object: &K) -> Result<K, StoreError> {
        self.check_fault::<K>(Verb::UpdateStatus, &object.object_ref())
            .await?;
        self.update_object(object, true)
    }

    async fn delete(&self, key: &ObjectRef) -> Result<(), StoreError> {
        self.check_fault::<K>(Verb::Delete, key).await?;
        self.delete_object::<K>(key)
    }
}
