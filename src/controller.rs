//! Worker pool that drives the reconciler.
//!
//! The controller owns every scheduling decision the reconciler leaves to its
//! caller: which key runs when, how many run at once, and what happens after
//! a pass returns. It guarantees that one `ObjectRef` is never reconciled by
//! two passes at the same time. A key triggered while its pass is in flight
//! is marked dirty and run again once that pass finishes.
//!
//! Triggers come from three places:
//! - the store watch stream (WorkloadInstance changes)
//! - a periodic full resync, which also runs once at startup
//! - [`ControllerHandle::trigger`], for callers that know better

use futures::FutureExt;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, info, warn};

use crate::context::ReconcileContext;
use crate::errors::ReconcileError;
use crate::reconciler::{Action, Reconciler};
use crate::resources::{ObjectRef, Resource, WorkloadInstance};
use crate::store::{ChangeType, ObjectStore, StoreEvent};

/// Tunables of the worker pool.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Maximum number of passes running at once.
    pub workers: usize,
    /// Interval between full resyncs of every WorkloadInstance.
    pub resync_interval: Duration,
    /// Deadline given to each pass.
    pub store_timeout: Duration,
    pub error_backoff_base: Duration,
    pub error_backoff_max: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            resync_interval: Duration::from_secs(300),
            store_timeout: Duration::from_secs(30),
            error_backoff_base: Duration::from_millis(500),
            error_backoff_max: Duration::from_secs(300),
        }
    }
}

/// Counters reported when the controller stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    /// Reconcile passes that ran to completion, successful or not.
    pub passes: u64,
    pub errors: u64,
    /// Passes that asked to be run again later.
    pub requeues: u64,
    /// Passes stopped by shutdown.
    pub cancelled: u64,
}

/// Delay before retrying a key that has failed `failures` times in a row.
pub fn error_backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

/// Cloneable handle for triggering passes from outside the controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<ObjectRef>,
}

impl ControllerHandle {
    /// Ask for a pass over `key`. Returns false once the controller has stopped.
    pub fn trigger(&self, key: ObjectRef) -> bool {
        self.tx.send(key).is_ok()
    }
}

/// Why a pass did not produce an `Action`.
#[derive(Debug)]
struct PassFailure {
    message: String,
    /// Stopped by controller shutdown rather than failing on its own.
    shutdown: bool,
}

type PassResult = (ObjectRef, Result<Action, PassFailure>);

pub struct Controller {
    reconciler: Arc<Reconciler>,
    instances: Arc<dyn ObjectStore<WorkloadInstance>>,
    settings: ControllerSettings,
    watch: Option<broadcast::Receiver<StoreEvent>>,
    trigger_tx: mpsc::UnboundedSender<ObjectRef>,
    trigger_rx: mpsc::UnboundedReceiver<ObjectRef>,
}

impl Controller {
    pub fn new(
        reconciler: Arc<Reconciler>,
        instances: Arc<dyn ObjectStore<WorkloadInstance>>,
        settings: ControllerSettings,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        Self {
            reconciler,
            instances,
            settings,
            watch: None,
            trigger_tx,
            trigger_rx,
        }
    }

    /// Trigger passes from a store watch stream.
    pub fn with_watch(mut self, watch: broadcast::Receiver<StoreEvent>) -> Self {
        self.watch = Some(watch);
        self
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            tx: self.trigger_tx.clone(),
        }
    }

    /// Run until `shutdown` is cancelled, then wait for in-flight passes.
    pub async fn run(self, shutdown: CancellationToken) -> ControllerStats {
        let Controller {
            reconciler,
            instances,
            settings,
            mut watch,
            trigger_tx,
            trigger_rx,
        } = self;
        // only external handles keep the trigger channel open
        drop(trigger_tx);
        let mut triggers = Some(trigger_rx);

        let mut pool = WorkQueue::new(reconciler, settings.clone(), shutdown.clone());
        let mut resync = tokio::time::interval(settings.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(workers = settings.workers, "controller started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(done) = pool.passes.join_next(), if !pool.passes.is_empty() => {
                    match done {
                        Ok((key, result)) => pool.finish(key, result),
                        Err(e) => warn!(error = %e, "reconcile task was aborted"),
                    }
                }

                Some(expired) = pool.delays.next(), if !pool.delays.is_empty() => {
                    let key = expired.into_inner();
                    pool.delay_keys.remove(&key);
                    pool.enqueue(key);
                }

                event = next_watch_event(&mut watch) => match event {
                    Ok(event) => pool.observe(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "watch stream lagged, resyncing");
                        resync_all(&instances, &settings, &mut pool).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("watch stream closed");
                        watch = None;
                    }
                },

                key = next_trigger(&mut triggers) => match key {
                    Some(key) => pool.enqueue(key),
                    None => triggers = None,
                },

                _ = resync.tick() => resync_all(&instances, &settings, &mut pool).await,
            }

            pool.dispatch();
        }

        info!(in_flight = pool.passes.len(), "controller stopping");
        while let Some(done) = pool.passes.join_next().await {
            if let Ok((key, result)) = done {
                pool.record(&key, &result);
            }
        }
        info!(
            passes = pool.stats.passes,
            errors = pool.stats.errors,
            requeues = pool.stats.requeues,
            cancelled = pool.stats.cancelled,
            "controller stopped"
        );
        pool.stats
    }
}

async fn next_watch_event(
    watch: &mut Option<broadcast::Receiver<StoreEvent>>,
) -> Result<StoreEvent, broadcast::error::RecvError> {
    match watch {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_trigger(triggers: &mut Option<mpsc::UnboundedReceiver<ObjectRef>>) -> Option<ObjectRef> {
    match triggers {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn resync_all(
    instances: &Arc<dyn ObjectStore<WorkloadInstance>>,
    settings: &ControllerSettings,
    pool: &mut WorkQueue,
) {
    let ctx = ReconcileContext::new(pool.shutdown.child_token()).with_timeout(settings.store_timeout);
    match ctx.guard(instances.list(None)).await {
        Ok(all) => {
            debug!(count = all.len(), "resync");
            for instance in all {
                pool.enqueue(instance.object_ref());
            }
        }
        Err(e) => warn!(error = %e, "resync failed to list workload instances"),
    }
}

/// Scheduling state owned by the controller loop.
struct WorkQueue {
    reconciler: Arc<Reconciler>,
    settings: ControllerSettings,
    shutdown: CancellationToken,
    permits: Arc<Semaphore>,
    passes: JoinSet<PassResult>,
    ready: VecDeque<ObjectRef>,
    queued: HashSet<ObjectRef>,
    in_flight: HashSet<ObjectRef>,
    dirty: HashSet<ObjectRef>,
    delays: DelayQueue<ObjectRef>,
    delay_keys: HashMap<ObjectRef, delay_queue::Key>,
    failures: HashMap<ObjectRef, u32>,
    stats: ControllerStats,
}

impl WorkQueue {
    fn new(
        reconciler: Arc<Reconciler>,
        settings: ControllerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            permits: Arc::new(Semaphore::new(settings.workers.max(1))),
            settings,
            shutdown,
            passes: JoinSet::new(),
            ready: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            dirty: HashSet::new(),
            delays: DelayQueue::new(),
            delay_keys: HashMap::new(),
            failures: HashMap::new(),
            stats: ControllerStats::default(),
        }
    }

    fn observe(&mut self, event: StoreEvent) {
        if event.kind != WorkloadInstance::KIND {
            return;
        }
        match event.change {
            ChangeType::Added | ChangeType::Modified => self.enqueue(event.object),
            ChangeType::Deleted => {
                self.cancel_delay(&event.object);
                self.failures.remove(&event.object);
            }
        }
    }

    /// Make `key` runnable now. An in-flight key is re-run after its pass.
    fn enqueue(&mut self, key: ObjectRef) {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return;
        }
        self.cancel_delay(&key);
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    fn schedule(&mut self, key: ObjectRef, delay: Duration) {
        if let Some(existing) = self.delay_keys.get(&key) {
            self.delays.reset(existing, delay);
            return;
        }
        let handle = self.delays.insert(key.clone(), delay);
        self.delay_keys.insert(key, handle);
    }

    fn cancel_delay(&mut self, key: &ObjectRef) {
        if let Some(handle) = self.delay_keys.remove(key) {
            self.delays.remove(&handle);
        }
    }

    /// Start passes for ready keys while workers are free.
    fn dispatch(&mut self) {
        while !self.ready.is_empty() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(key) = self.ready.pop_front() else {
                break;
            };
            self.queued.remove(&key);
            self.in_flight.insert(key.clone());

            let reconciler = self.reconciler.clone();
            let ctx = ReconcileContext::new(self.shutdown.child_token())
                .with_timeout(self.settings.store_timeout);
            self.passes.spawn(async move {
                let _permit = permit;
                let outcome = AssertUnwindSafe(reconciler.reconcile(&key, &ctx))
                    .catch_unwind()
                    .await;
                let result = match outcome {
                    Ok(result) => result.map_err(|e: ReconcileError| PassFailure {
                        shutdown: ctx.is_cancelled() && e.is_cancelled(),
                        message: e.to_string(),
                    }),
                    Err(_) => Err(PassFailure {
                        message: "reconcile pass panicked".to_string(),
                        shutdown: false,
                    }),
                };
                (key, result)
            });
        }
    }

    fn record(&mut self, key: &ObjectRef, result: &Result<Action, PassFailure>) {
        self.in_flight.remove(key);
        self.stats.passes += 1;
        match result {
            Ok(Action::Done) => {}
            Ok(Action::RequeueAfter(_)) => self.stats.requeues += 1,
            Err(failure) if failure.shutdown => self.stats.cancelled += 1,
            Err(_) => self.stats.errors += 1,
        }
    }

    fn finish(&mut self, key: ObjectRef, result: Result<Action, PassFailure>) {
        self.record(&key, &result);
        let dirty = self.dirty.remove(&key);

        match result {
            Ok(action) => {
                self.failures.remove(&key);
                if dirty {
                    self.enqueue(key);
                } else if let Action::RequeueAfter(delay) = action {
                    self.schedule(key, delay);
                }
            }
            Err(failure) if failure.shutdown => {}
            Err(failure) => {
                let failures = self.failures.entry(key.clone()).or_insert(0);
                *failures += 1;
                let delay = error_backoff(
                    self.settings.error_backoff_base,
                    self.settings.error_backoff_max,
                    *failures,
                );
                warn!(
                    instance = %key,
                    failures = *failures,
                    retry_in = ?delay,
                    error = %failure.message,
                    "reconcile failed"
                );
                self.schedule(key, delay);
            }
        }
    }
}
