//! Check task naming and creation.
//!
//! Task names are `<base>-<suffix>` where the suffix is the first few
//! characters of a fresh identifier. A name collision regenerates the suffix
//! and retries, up to a fixed number of attempts. Nothing is remembered
//! between calls, so a failed creation is simply retried from scratch.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ReconcileContext;
use crate::errors::CreateTaskError;
use crate::resources::CheckTask;
use crate::store::ObjectStore;

/// Default number of creation attempts before giving up
pub const DEFAULT_NAME_ATTEMPTS: usize = 5;

/// Default length of the random name suffix
pub const DEFAULT_SUFFIX_LEN: usize = 10;

/// Source of fresh identifiers for task name suffixes.
pub trait IdSource: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random UUID v4 identifiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIdSource;

impl IdSource for UuidIdSource {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Replays a fixed list of identifiers, then falls back to a counter.
///
/// Deterministic names for tests and simulations.
#[derive(Debug, Default)]
pub struct SequenceIdSource {
    queued: Mutex<(VecDeque<String>, u64)>,
}

impl SequenceIdSource {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queued: Mutex::new((ids.into_iter().map(Into::into).collect(), 0)),
        }
    }
}

impl IdSource for SequenceIdSource {
    fn next_id(&self) -> String {
        let mut guard = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        let (ids, counter) = &mut *guard;
        ids.pop_front().unwrap_or_else(|| {
            *counter += 1;
            format!("{:010}", counter)
        })
    }
}

/// `base-<first suffix_len chars of id>`
pub fn task_name(base: &str, id: &str, suffix_len: usize) -> String {
    let suffix: String = id.chars().take(suffix_len).collect();
    format!("{}-{}", base, suffix)
}

/// Creates check tasks under collision-resistant names.
#[derive(Clone)]
pub struct TaskFactory {
    store: Arc<dyn ObjectStore<CheckTask>>,
    ids: Arc<dyn IdSource>,
    max_attempts: usize,
    suffix_len: usize,
}

impl TaskFactory {
    pub fn new(store: Arc<dyn ObjectStore<CheckTask>>, ids: Arc<dyn IdSource>) -> Self {
        Self {
            store,
            ids,
            max_attempts: DEFAULT_NAME_ATTEMPTS,
            suffix_len: DEFAULT_SUFFIX_LEN,
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_suffix_len(mut self, len: usize) -> Self {
        self.suffix_len = len;
        self
    }

    /// Create `template` under a fresh `base-<suffix>` name and return that name.
    ///
    /// Only `AlreadyExists` is retried; any other store error aborts at once.
    pub async fn create_task(
        &self,
        ctx: &ReconcileContext,
        base: &str,
        template: &CheckTask,
    ) -> Result<String, CreateTaskError> {
        let mut task = template.clone();
        for attempt in 1..=self.max_attempts {
            task.metadata.name = task_name(base, &self.ids.next_id(), self.suffix_len);
            match ctx.guard(self.store.create(&task)).await {
                Ok(created) => {
                    debug!(task = %created.metadata.name, attempt, "created check task");
                    return Ok(created.metadata.name);
                }
                Err(e) if e.is_already_exists() => {
                    debug!(task = %task.metadata.name, attempt, "check task name taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(base, attempts = self.max_attempts, "no free check task name");
        Err(CreateTaskError::Exhausted {
            base: base.to_string(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;
    use crate::phase::CheckDirection;
    use crate::resources::{ObjectMeta, ObjectRef, WorkloadInstance, WorkloadInstanceSpec};
    use crate::store::{InMemoryStore, InjectedFault, Verb};
    use crate::resources::Resource;

    fn template() -> CheckTask {
        let wi = WorkloadInstance::new(
            ObjectMeta::named("ns", "checkout"),
            WorkloadInstanceSpec {
                app_name: "shop".to_string(),
                ..Default::default()
            },
        );
        CheckTask::for_instance(&wi, CheckDirection::PreDeployment)
    }

    fn occupy(store: &InMemoryStore, name: &str) {
        let mut task = template();
        task.metadata.name = name.to_string();
        store.insert(task).unwrap();
    }

    #[test]
    fn test_task_name_takes_uuid_prefix() {
        let id = "0f8fad5b-d9cb-469f-a165-70867728950e";
        assert_eq!(task_name("checkout", id, 10), "checkout-0f8fad5b-d");
        assert_eq!(task_name("checkout", "abc", 10), "checkout-abc");
    }

    #[test]
    fn test_uuid_source_yields_distinct_ids() {
        let ids = UuidIdSource;
        assert_ne!(ids.next_id(), ids.next_id());
        assert_eq!(ids.next_id().len(), 36);
    }

    #[test]
    fn test_sequence_source_replays_then_counts() {
        let ids = SequenceIdSource::new(["aaaa", "bbbb"]);
        assert_eq!(ids.next_id(), "aaaa");
        assert_eq!(ids.next_id(), "bbbb");
        assert_eq!(ids.next_id(), "0000000001");
        assert_eq!(ids.next_id(), "0000000002");
    }

    #[tokio::test]
    async fn test_create_task_uses_first_free_name() {
        let store = Arc::new(InMemoryStore::new());
        let factory = TaskFactory::new(
            store.clone(),
            Arc::new(SequenceIdSource::new(["aaaaaaaaaa"])),
        );
        let name = factory
            .create_task(&ReconcileContext::background(), "checkout", &template())
            .await
            .unwrap();
        assert_eq!(name, "checkout-aaaaaaaaaa");
        assert!(
            store
                .fetch::<CheckTask>(&ObjectRef::new("ns", &name))
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_create_task_retries_collisions() {
        let store = Arc::new(InMemoryStore::new());
        for taken in ["1111111111", "2222222222", "3333333333", "4444444444"] {
            occupy(&store, &format!("checkout-{taken}"));
        }
        let ids = SequenceIdSource::new([
            "1111111111",
            "2222222222",
            "3333333333",
            "4444444444",
            "5555555555",
        ]);
        let factory = TaskFactory::new(store.clone(), Arc::new(ids));

        let name = factory
            .create_task(&ReconcileContext::background(), "checkout", &template())
            .await
            .unwrap();
        assert_eq!(name, "checkout-5555555555");
        assert_eq!(store.all::<CheckTask>(Some("ns")).len(), 5);
    }

    #[tokio::test]
    async fn test_create_task_gives_up_after_max_attempts() {
        let store = Arc::new(InMemoryStore::new());
        let ids = ["1", "2", "3", "4", "5", "6"];
        for taken in ids {
            occupy(&store, &format!("checkout-{taken}"));
        }
        let factory = TaskFactory::new(store.clone(), Arc::new(SequenceIdSource::new(ids)));

        let err = factory
            .create_task(&ReconcileContext::background(), "checkout", &template())
            .await
            .unwrap_err();
        match err {
            CreateTaskError::Exhausted { base, attempts } => {
                assert_eq!(base, "checkout");
                assert_eq!(attempts, DEFAULT_NAME_ATTEMPTS);
            }
            other => panic!("Expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_task_does_not_retry_other_errors() {
        let store = Arc::new(InMemoryStore::new());
        store.inject_fault(CheckTask::KIND, Verb::Create, InjectedFault::Unavailable, 1);
        let factory = TaskFactory::new(store.clone(), Arc::new(UuidIdSource));

        let err = factory
            .create_task(&ReconcileContext::background(), "checkout", &template())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CreateTaskError::Store(StoreError::Unavailable(_))
        ));
        assert!(store.all::<CheckTask>(None).is_empty());
    }

    #[tokio::test]
    async fn test_custom_suffix_length() {
        let store = Arc::new(InMemoryStore::new());
        let factory = TaskFactory::new(store, Arc::new(SequenceIdSource::new(["abcdefghij"])))
            .with_suffix_len(4);
        let name = factory
            .create_task(&ReconcileContext::background(), "checkout", &template())
            .await
            .unwrap();
        assert_eq!(name, "checkout-abcd");
    }
}
