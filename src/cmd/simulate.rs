//! Dry-run harness: `checkgate simulate`.
//!
//! Loads WorkloadInstance manifests into an in-memory store and runs the
//! real controller against it. Check tasks are not executed; each one is
//! marked with the scripted outcome after `--task-delay-ms`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use checkgate::config::CheckgateConfig;
use checkgate::controller::{Controller, ControllerStats};
use checkgate::logging;
use checkgate::naming::UuidIdSource;
use checkgate::phase::{CheckDirection, WorkloadPhase};
use checkgate::reconciler::Reconciler;
use checkgate::resources::{
    AuditEvent, CheckTask, ObjectRef, Resource, TaskPhase, WorkloadInstance,
};
use checkgate::store::{ChangeType, InMemoryStore, StoreEvent, Stores};

use super::super::{Cli, Outcome, OutputFormat, SimulateArgs};

/// Namespace given to manifests that do not name one
const DEFAULT_NAMESPACE: &str = "default";

/// How often completion is checked
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Serialize)]
struct SimulationReport {
    completed: bool,
    elapsed_ms: u128,
    stats: ControllerStats,
    instances: Vec<InstanceReport>,
    events: Vec<EventReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceReport {
    namespace: String,
    name: String,
    pre_deployment_phase: WorkloadPhase,
    post_deployment_phase: WorkloadPhase,
}

#[derive(Debug, Serialize)]
struct EventReport {
    object: String,
    reason: String,
    message: String,
}

pub async fn cmd_simulate(cli: &Cli, args: &SimulateArgs) -> Result<()> {
    let mut config = CheckgateConfig::resolve(cli.config.as_deref())?;
    if let Some(ms) = args.requeue_after_ms {
        config.reconciler.requeue_after_ms = ms;
    }
    let errors = config.validate();
    if !errors.is_empty() {
        anyhow::bail!("Invalid configuration:\n  - {}", errors.join("\n  - "));
    }
    let _log_guard = logging::init(&config.logging, cli.verbose)?;

    let manifests = load_manifests(&args.manifests)?;
    let store = Arc::new(InMemoryStore::new());
    let mut keys = Vec::with_capacity(manifests.len());
    for instance in manifests {
        let key = instance.object_ref();
        store
            .insert(instance)
            .with_context(|| format!("Failed to load WorkloadInstance {}", key))?;
        keys.push(key);
    }
    info!(instances = keys.len(), "loaded manifests");

    let shutdown = CancellationToken::new();
    let executor = tokio::spawn(resolve_tasks(
        store.clone(),
        store.subscribe(),
        TaskScript {
            pre: task_phase(args.pre_outcome),
            post: task_phase(args.post_outcome),
            delay: Duration::from_millis(args.task_delay_ms),
        },
        shutdown.clone(),
    ));

    let reconciler = Arc::new(Reconciler::new(
        Stores::shared(store.clone()),
        Arc::new(UuidIdSource),
        config.reconciler_settings(),
    ));
    let controller = Controller::new(reconciler, store.clone(), config.controller_settings())
        .with_watch(store.subscribe());
    let controller = tokio::spawn(controller.run(shutdown.clone()));

    let started = Instant::now();
    let completed = tokio::time::timeout(Duration::from_secs(args.timeout_secs), async {
        while !all_completed(&store, &keys) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .is_ok();
    let elapsed = started.elapsed();

    shutdown.cancel();
    let stats = controller.await.context("Controller task failed")?;
    executor.await.context("Task executor failed")?;

    let report = build_report(&store, completed, elapsed, stats);
    match args.output {
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(&report)?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    if !completed {
        let pending = keys.len() - report.instances.iter().filter(|i| is_done(i)).count();
        anyhow::bail!(
            "Timed out after {}s with {} instance(s) not completed",
            args.timeout_secs,
            pending
        );
    }
    Ok(())
}

/// Parse every YAML document in `paths` as a WorkloadInstance.
fn load_manifests(paths: &[PathBuf]) -> Result<Vec<WorkloadInstance>> {
    let mut instances = Vec::new();
    for path in paths {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        for (index, document) in serde_yaml::Deserializer::from_str(&content).enumerate() {
            let value = serde_yaml::Value::deserialize(document).with_context(|| {
                format!("Invalid YAML in {} (document {})", path.display(), index + 1)
            })?;
            if value.is_null() {
                continue;
            }
            let mut instance: WorkloadInstance =
                serde_yaml::from_value(value).with_context(|| {
                    format!(
                        "Invalid WorkloadInstance in {} (document {})",
                        path.display(),
                        index + 1
                    )
                })?;
            if instance.metadata.name.is_empty() {
                anyhow::bail!(
                    "WorkloadInstance in {} (document {}) has no metadata.name",
                    path.display(),
                    index + 1
                );
            }
            if instance.metadata.namespace.is_empty() {
                instance.metadata.namespace = DEFAULT_NAMESPACE.to_string();
            }
            instance.metadata.resource_version = 0;
            instances.push(instance);
        }
    }
    Ok(instances)
}

fn task_phase(outcome: Outcome) -> TaskPhase {
    match outcome {
        Outcome::Succeeded => TaskPhase::Succeeded,
        Outcome::Failed => TaskPhase::Failed,
    }
}

fn is_done(instance: &InstanceReport) -> bool {
    instance.pre_deployment_phase.is_terminal() && instance.post_deployment_phase.is_terminal()
}

fn all_completed(store: &InMemoryStore, keys: &[ObjectRef]) -> bool {
    keys.iter().all(|key| {
        store
            .fetch::<WorkloadInstance>(key)
            .is_none_or(|instance| instance.is_completed())
    })
}

#[derive(Debug, Clone, Copy)]
struct TaskScript {
    pre: TaskPhase,
    post: TaskPhase,
    delay: Duration,
}

impl TaskScript {
    fn outcome(&self, direction: CheckDirection) -> TaskPhase {
        match direction {
            CheckDirection::PreDeployment => self.pre,
            CheckDirection::PostDeployment => self.post,
        }
    }
}

/// Stand-in for the external executor: finishes every new check task.
async fn resolve_tasks(
    store: Arc<InMemoryStore>,
    mut watch: broadcast::Receiver<StoreEvent>,
    script: TaskScript,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = watch.recv() => event,
        };
        match event {
            Ok(event) if event.kind == CheckTask::KIND && event.change == ChangeType::Added => {
                schedule_outcome(&store, event.object, script, &shutdown);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "task watch lagged, rescanning check tasks");
                for task in store.all::<CheckTask>(None) {
                    if !task.is_completed() {
                        schedule_outcome(&store, task.object_ref(), script, &shutdown);
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn schedule_outcome(
    store: &Arc<InMemoryStore>,
    task: ObjectRef,
    script: TaskScript,
    shutdown: &CancellationToken,
) {
    let store = store.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(script.delay) => {}
        }
        let result = store.mutate::<CheckTask, _>(&task, |t| {
            t.status.phase = script.outcome(t.spec.check_type);
        });
        match result {
            Ok(t) => debug!(task = %task, phase = %t.status.phase, "check task finished"),
            Err(e) => debug!(task = %task, error = %e, "check task vanished before finishing"),
        }
    });
}

fn build_report(
    store: &InMemoryStore,
    completed: bool,
    elapsed: Duration,
    stats: ControllerStats,
) -> SimulationReport {
    let instances = store
        .all::<WorkloadInstance>(None)
        .into_iter()
        .map(|wi| InstanceReport {
            namespace: wi.metadata.namespace,
            name: wi.metadata.name,
            pre_deployment_phase: wi.status.pre_deployment_phase,
            post_deployment_phase: wi.status.post_deployment_phase,
        })
        .collect();

    let mut events = store.all::<AuditEvent>(None);
    events.sort_by_key(|e| e.metadata.resource_version);
    let events = events
        .into_iter()
        .map(|e| EventReport {
            object: format!("{}/{}", e.involved_object.namespace, e.involved_object.name),
            reason: e.reason,
            message: e.message,
        })
        .collect();

    SimulationReport {
        completed,
        elapsed_ms: elapsed.as_millis(),
        stats,
        instances,
        events,
    }
}
