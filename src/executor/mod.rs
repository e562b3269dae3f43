//! Controlled DAG executor.
//!
//! Tasks are partitioned into layers by longest path to a root; tasks within
//! a layer run concurrently, layers are strictly ordered. Each workflow runs
//! as one tokio task that exclusively owns its mutable state; the outside
//! world interacts only through a FIFO command queue (continue / abort /
//! replan / approval) and observes an ordered event stream with exactly one
//! terminal event.

pub mod args;
pub mod dag;
pub mod events;
pub mod workflow;

pub use args::{TaskOutputs, resolve_arguments, resolve_expression};
pub use dag::{Dag, StaticArg, Task, TaskType};
pub use events::{ExecutionEvent, WorkflowCommand};
pub use workflow::{
    Checkpoint, TaskResult, TaskState, WorkflowHandle, WorkflowRegistry, WorkflowStatus,
};

use crate::config::ExecutorConfig;
use crate::errors::{GatewayError, GatewayResult};
use crate::storage::Db;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_BUS_CAPACITY: usize = 1024;
/// Per-value cap when embedding previous outputs into approval context.
const CONTEXT_OUTPUT_MAX_CHARS: usize = 500;

/// Seam to the thing that actually runs a task (backend tool call or
/// capability execution). Injected by the runtime.
#[async_trait]
pub trait TaskInvoker: Send + Sync {
    async fn invoke(
        &self,
        task: &Task,
        arguments: serde_json::Map<String, Value>,
    ) -> GatewayResult<Value>;
}

/// Seam to discovery for `replan_dag` commands.
#[async_trait]
pub trait Replanner: Send + Sync {
    async fn replan(
        &self,
        new_requirement: &str,
        available_context: Option<&Value>,
    ) -> GatewayResult<Vec<Task>>;
}

/// Completion callback consumed by the feedback sink.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn on_workflow_complete(&self, report: &WorkflowReport);
}

#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub workflow_id: Uuid,
    pub intent: String,
    pub dag: Dag,
    pub results: BTreeMap<String, TaskResult>,
    pub total_time_ms: u64,
    pub aborted: bool,
}

/// Event stream tap entry: the per-workflow event plus its workflow id, for
/// cross-workflow subscribers (SSE).
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub workflow_id: Uuid,
    pub event: ExecutionEvent,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub per_layer_validation: bool,
    /// Pre-resolved `parameter` bindings.
    pub parameters: serde_json::Map<String, Value>,
    /// Result of the configured approval policy: when true, a layer holding a
    /// side-effecting task suspends for human approval before running.
    pub require_approval_for_side_effects: bool,
}

pub struct WorkflowRun {
    pub workflow_id: Uuid,
    pub events: mpsc::Receiver<ExecutionEvent>,
}

pub struct ControlledDagExecutor {
    config: ExecutorConfig,
    db: Arc<Db>,
    invoker: Arc<dyn TaskInvoker>,
    replanner: Option<Arc<dyn Replanner>>,
    observer: Option<Arc<dyn ExecutionObserver>>,
    registry: Arc<WorkflowRegistry>,
    event_bus: broadcast::Sender<BusEvent>,
}

impl ControlledDagExecutor {
    pub fn new(
        config: ExecutorConfig,
        db: Arc<Db>,
        invoker: Arc<dyn TaskInvoker>,
        replanner: Option<Arc<dyn Replanner>>,
        observer: Option<Arc<dyn ExecutionObserver>>,
    ) -> Self {
        let registry = Arc::new(WorkflowRegistry::new(config.workflow_ttl_secs));
        let (event_bus, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            config,
            db,
            invoker,
            replanner,
            observer,
            registry,
            event_bus,
        }
    }

    pub fn registry(&self) -> Arc<WorkflowRegistry> {
        self.registry.clone()
    }

    /// Subscribe to every workflow's events (used by the SSE endpoint).
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.event_bus.subscribe()
    }

    /// Validate, persist, and launch a workflow. Returns immediately with the
    /// event stream; execution proceeds on its own task.
    pub fn start(&self, dag: Dag, intent: String, opts: ExecOptions) -> GatewayResult<WorkflowRun> {
        if dag.tasks.is_empty() {
            return Err(GatewayError::InvalidParams("DAG has no tasks".into()));
        }
        let layers = dag.layers()?;
        let workflow_id = Uuid::new_v4();
        self.launch(workflow_id, dag, layers, intent, opts, 0, TaskOutputs::new(), BTreeMap::new())
    }

    /// Rebuild state from a checkpoint and restart at the next layer.
    pub fn resume_from_checkpoint(
        &self,
        workflow_id: Uuid,
        checkpoint_id: &str,
        opts: ExecOptions,
    ) -> GatewayResult<WorkflowRun> {
        let (dag, intent) = workflow::load_workflow_dag(&self.db, workflow_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("workflow {workflow_id}")))?;
        let checkpoint = workflow::load_checkpoint(&self.db, workflow_id, checkpoint_id)?
            .ok_or_else(|| GatewayError::NotFound(format!("checkpoint {checkpoint_id}")))?;
        let layers = dag.layers()?;

        let mut outputs = TaskOutputs::new();
        let mut results = BTreeMap::new();
        for (task_id, result) in &checkpoint.task_snapshot {
            if let Some(output) = &result.output {
                outputs.insert(task_id.clone(), output.clone());
            }
            results.insert(task_id.clone(), result.clone());
        }
        info!(
            "resuming workflow {} from checkpoint {} at layer {}",
            workflow_id,
            checkpoint_id,
            checkpoint.layer_index + 1
        );
        self.launch(
            workflow_id,
            dag,
            layers,
            intent,
            opts,
            checkpoint.layer_index + 1,
            outputs,
            results,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        workflow_id: Uuid,
        dag: Dag,
        layers: Vec<Vec<String>>,
        intent: String,
        opts: ExecOptions,
        start_layer: usize,
        outputs: TaskOutputs,
        results: BTreeMap<String, TaskResult>,
    ) -> GatewayResult<WorkflowRun> {
        let expires_at = Utc::now() + self.registry.ttl();
        workflow::save_workflow_dag(&self.db, workflow_id, &dag, &intent, expires_at)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(WorkflowStatus::Running);
        self.registry
            .insert(workflow_id, intent.clone(), command_tx, status_rx);

        let run = WorkflowRun {
            workflow_id,
            events: event_rx,
        };
        let mut coroutine = WorkflowCoroutine {
            workflow_id,
            dag,
            layers,
            intent,
            opts,
            outputs,
            results,
            config: self.config.clone(),
            db: self.db.clone(),
            invoker: self.invoker.clone(),
            replanner: self.replanner.clone(),
            observer: self.observer.clone(),
            registry: self.registry.clone(),
            events: event_tx,
            commands: command_rx,
            status: status_tx,
            event_bus: self.event_bus.clone(),
            pending_replans: Vec::new(),
        };
        tokio::spawn(async move {
            coroutine.run(start_layer).await;
        });
        Ok(run)
    }
}

enum LayerOutcome {
    Completed,
    Aborted { reason: String },
}

/// Exclusively owns a workflow's mutable state for its whole life.
struct WorkflowCoroutine {
    workflow_id: Uuid,
    dag: Dag,
    layers: Vec<Vec<String>>,
    intent: String,
    opts: ExecOptions,
    outputs: TaskOutputs,
    results: BTreeMap<String, TaskResult>,
    config: ExecutorConfig,
    db: Arc<Db>,
    invoker: Arc<dyn TaskInvoker>,
    replanner: Option<Arc<dyn Replanner>>,
    observer: Option<Arc<dyn ExecutionObserver>>,
    registry: Arc<WorkflowRegistry>,
    events: mpsc::Sender<ExecutionEvent>,
    commands: mpsc::Receiver<WorkflowCommand>,
    status: watch::Sender<WorkflowStatus>,
    event_bus: broadcast::Sender<BusEvent>,
    pending_replans: Vec<(String, Option<Value>)>,
}

impl WorkflowCoroutine {
    async fn run(&mut self, start_layer: usize) {
        let started = Instant::now();
        self.emit(ExecutionEvent::WorkflowStart {
            workflow_id: self.workflow_id.to_string(),
            total_layers: self.layers.len(),
        })
        .await;

        let mut layer_idx = start_layer;
        while layer_idx < self.layers.len() {
            if let Some(reason) = self.drain_commands().await {
                self.finish_aborted(&reason, layer_idx, started).await;
                return;
            }
            self.apply_pending_replans().await;

            if self.layer_needs_approval(layer_idx) {
                if let Some(reason) = self.await_approval(layer_idx).await {
                    self.finish_aborted(&reason, layer_idx, started).await;
                    return;
                }
            }

            match self.run_layer(layer_idx).await {
                LayerOutcome::Aborted { reason } => {
                    self.finish_aborted(&reason, layer_idx, started).await;
                    return;
                }
                LayerOutcome::Completed => {}
            }

            let checkpoint_id = self.write_checkpoint(layer_idx).await;
            self.emit(ExecutionEvent::Checkpoint {
                checkpoint_id,
                layer_index: layer_idx,
            })
            .await;

            let more_layers = layer_idx + 1 < self.layers.len();
            if self.opts.per_layer_validation && more_layers {
                if let Some(reason) = self.await_continue().await {
                    self.finish_aborted(&reason, layer_idx + 1, started).await;
                    return;
                }
            }
            layer_idx += 1;
        }

        let successful = self
            .results
            .values()
            .filter(|r| r.status == TaskState::Completed)
            .count();
        let failed = self
            .results
            .values()
            .filter(|r| matches!(r.status, TaskState::Failed | TaskState::Cancelled))
            .count();
        self.emit(ExecutionEvent::WorkflowComplete {
            workflow_id: self.workflow_id.to_string(),
            total_time_ms: started.elapsed().as_millis() as u64,
            successful_tasks: successful,
            failed_tasks: failed,
        })
        .await;
        self.finish(WorkflowStatus::Complete, started, false).await;
    }

    /// Run every runnable task of the layer concurrently. Returns Aborted when
    /// an abort command (or disapproval) arrives while the layer is in flight;
    /// in-flight tasks are cancelled and reported as such.
    async fn run_layer(&mut self, layer_idx: usize) -> LayerOutcome {
        let task_ids = self.layers[layer_idx].clone();
        let mut join: JoinSet<(String, Result<Value, GatewayError>, u64)> = JoinSet::new();
        let mut in_flight: Vec<String> = Vec::new();

        for task_id in &task_ids {
            let Some(task) = self.dag.task(task_id).cloned() else {
                continue;
            };
            if let Some(failed_dep) = self.first_failed_dependency(&task) {
                debug!(
                    "skipping task {} (dependency {} failed)",
                    task_id, failed_dep
                );
                self.results.insert(
                    task_id.clone(),
                    TaskResult::skipped(task_id, "dependency_failed"),
                );
                continue;
            }

            let arguments = resolve_arguments(&task, &self.outputs, &self.opts.parameters);
            self.emit(ExecutionEvent::TaskStart {
                task_id: task_id.clone(),
            })
            .await;
            in_flight.push(task_id.clone());

            let invoker = self.invoker.clone();
            let timeout = Duration::from_millis(self.config.task_timeout_ms);
            let id = task_id.clone();
            join.spawn(async move {
                let start = Instant::now();
                let result = match tokio::time::timeout(timeout, invoker.invoke(&task, arguments)).await
                {
                    Ok(inner) => inner,
                    Err(_) => Err(GatewayError::Timeout(timeout.as_millis() as u64)),
                };
                (id, result, start.elapsed().as_millis() as u64)
            });
        }

        while !in_flight.is_empty() {
            tokio::select! {
                joined = join.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((task_id, result, duration_ms)) => {
                            in_flight.retain(|id| id != &task_id);
                            self.record_task_result(&task_id, result, duration_ms).await;
                        }
                        Err(join_err) => {
                            warn!("layer task join error: {}", join_err);
                        }
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(WorkflowCommand::Abort { reason }) => {
                            join.abort_all();
                            for task_id in in_flight.drain(..) {
                                let err = GatewayError::Cancelled(reason.clone());
                                self.results.insert(
                                    task_id.clone(),
                                    TaskResult::failed(&task_id, &err, 0),
                                );
                                self.emit(ExecutionEvent::TaskError {
                                    task_id,
                                    error: err.to_string(),
                                    error_kind: err.kind().to_string(),
                                })
                                .await;
                            }
                            return LayerOutcome::Aborted { reason };
                        }
                        Some(WorkflowCommand::ApprovalResponse { approved: false, feedback, .. }) => {
                            join.abort_all();
                            let reason = feedback.unwrap_or_else(|| "approval denied".to_string());
                            for task_id in in_flight.drain(..) {
                                let err = GatewayError::Cancelled(reason.clone());
                                self.results.insert(
                                    task_id.clone(),
                                    TaskResult::failed(&task_id, &err, 0),
                                );
                                self.emit(ExecutionEvent::TaskError {
                                    task_id,
                                    error: err.to_string(),
                                    error_kind: err.kind().to_string(),
                                })
                                .await;
                            }
                            return LayerOutcome::Aborted { reason };
                        }
                        Some(WorkflowCommand::ReplanDag { new_requirement, available_context }) => {
                            self.pending_replans.push((new_requirement, available_context));
                        }
                        Some(_) => {}
                        None => {}
                    }
                }
            }
        }
        LayerOutcome::Completed
    }

    async fn record_task_result(
        &mut self,
        task_id: &str,
        result: Result<Value, GatewayError>,
        duration_ms: u64,
    ) {
        match result {
            Ok(output) => {
                self.outputs.insert(task_id.to_string(), output.clone());
                self.results
                    .insert(task_id.to_string(), TaskResult::completed(task_id, output, duration_ms));
                self.emit(ExecutionEvent::TaskComplete {
                    task_id: task_id.to_string(),
                    execution_time_ms: duration_ms,
                })
                .await;
            }
            Err(err) => {
                // A task error never unwinds the workflow; descendants will be
                // skipped when their layer comes up.
                self.results
                    .insert(task_id.to_string(), TaskResult::failed(task_id, &err, duration_ms));
                self.emit(ExecutionEvent::TaskError {
                    task_id: task_id.to_string(),
                    error: err.to_string(),
                    error_kind: err.kind().to_string(),
                })
                .await;
            }
        }
    }

    fn first_failed_dependency(&self, task: &Task) -> Option<String> {
        task.depends_on
            .iter()
            .find(|dep| {
                self.results.get(*dep).is_some_and(|r| {
                    matches!(
                        r.status,
                        TaskState::Failed | TaskState::Cancelled | TaskState::Skipped
                    )
                })
            })
            .cloned()
    }

    fn layer_needs_approval(&self, layer_idx: usize) -> bool {
        self.opts.require_approval_for_side_effects
            && self.layers[layer_idx].iter().any(|id| {
                self.dag
                    .task(id)
                    .is_some_and(|t| t.side_effects.unwrap_or(false))
            })
    }

    /// Emit `decision_required` and suspend until an approval arrives.
    /// Returns Some(reason) when the workflow must abort.
    async fn await_approval(&mut self, layer_idx: usize) -> Option<String> {
        let checkpoint_id = Uuid::new_v4().to_string();
        let tasks: Vec<Value> = self.layers[layer_idx]
            .iter()
            .filter_map(|id| self.dag.task(id))
            .map(|t| {
                serde_json::json!({
                    "task_id": t.id,
                    "call_name": t.call_name,
                    "side_effects": t.side_effects.unwrap_or(false),
                })
            })
            .collect();
        let description = format!(
            "Layer {} contains side-effecting tasks and requires approval",
            layer_idx
        );
        self.emit(ExecutionEvent::DecisionRequired {
            checkpoint_id: checkpoint_id.clone(),
            decision_type: "layer_approval".to_string(),
            description,
            context: serde_json::json!({
                "layer_index": layer_idx,
                "tasks": tasks,
                "previous_outputs": self.truncated_outputs(),
            }),
        })
        .await;

        let _ = self.status.send(WorkflowStatus::AwaitingApproval);
        let outcome = loop {
            match self.commands.recv().await {
                Some(WorkflowCommand::ApprovalResponse {
                    checkpoint_id: cid,
                    approved,
                    feedback,
                }) => {
                    if cid != checkpoint_id {
                        warn!(
                            "approval for unknown checkpoint {} (expected {})",
                            cid, checkpoint_id
                        );
                    }
                    if approved {
                        break None;
                    }
                    break Some(feedback.unwrap_or_else(|| "approval denied".to_string()));
                }
                Some(WorkflowCommand::Abort { reason }) => break Some(reason),
                Some(WorkflowCommand::ReplanDag {
                    new_requirement,
                    available_context,
                }) => {
                    self.pending_replans.push((new_requirement, available_context));
                }
                Some(WorkflowCommand::Continue { .. }) => {}
                None => break Some("command channel closed".to_string()),
            }
        };
        let _ = self.status.send(WorkflowStatus::Running);
        outcome
    }

    /// Per-layer validation pause: suspend until `continue`.
    async fn await_continue(&mut self) -> Option<String> {
        let _ = self.status.send(WorkflowStatus::Paused);
        let outcome = loop {
            match self.commands.recv().await {
                Some(WorkflowCommand::Continue { reason }) => {
                    debug!(
                        "workflow {} resumed ({})",
                        self.workflow_id,
                        reason.unwrap_or_default()
                    );
                    break None;
                }
                Some(WorkflowCommand::Abort { reason }) => break Some(reason),
                Some(WorkflowCommand::ApprovalResponse { approved: false, feedback, .. }) => {
                    break Some(feedback.unwrap_or_else(|| "approval denied".to_string()));
                }
                Some(WorkflowCommand::ApprovalResponse { .. }) => {}
                Some(WorkflowCommand::ReplanDag {
                    new_requirement,
                    available_context,
                }) => {
                    self.pending_replans.push((new_requirement, available_context));
                    self.apply_pending_replans().await;
                }
                None => break Some("command channel closed".to_string()),
            }
        };
        let _ = self.status.send(WorkflowStatus::Running);
        outcome
    }

    /// Drain queued commands without blocking. Returns Some(reason) on abort.
    async fn drain_commands(&mut self) -> Option<String> {
        loop {
            match self.commands.try_recv() {
                Ok(WorkflowCommand::Abort { reason }) => return Some(reason),
                Ok(WorkflowCommand::ApprovalResponse { approved: false, feedback, .. }) => {
                    return Some(feedback.unwrap_or_else(|| "approval denied".to_string()));
                }
                Ok(WorkflowCommand::ReplanDag {
                    new_requirement,
                    available_context,
                }) => {
                    self.pending_replans.push((new_requirement, available_context));
                }
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }

    /// Turn queued replan requests into a new downstream layer. Already
    /// completed tasks keep their ids and results untouched.
    async fn apply_pending_replans(&mut self) {
        if self.pending_replans.is_empty() {
            return;
        }
        let Some(replanner) = self.replanner.clone() else {
            warn!("replan requested but no replanner configured");
            self.pending_replans.clear();
            return;
        };
        let requests = std::mem::take(&mut self.pending_replans);
        for (requirement, context) in requests {
            match replanner.replan(&requirement, context.as_ref()).await {
                Ok(new_tasks) if !new_tasks.is_empty() => {
                    let tail: Vec<String> =
                        self.layers.last().cloned().unwrap_or_default();
                    let mut new_layer = Vec::new();
                    for mut task in new_tasks {
                        if self.dag.task(&task.id).is_some() {
                            task.id = format!("{}_replan_{}", task.id, self.layers.len());
                        }
                        if task.depends_on.is_empty() {
                            task.depends_on = tail.clone();
                        }
                        new_layer.push(task.id.clone());
                        self.dag.tasks.push(task);
                    }
                    self.layers.push(new_layer);
                    let expires_at = Utc::now() + self.registry.ttl();
                    if let Err(e) = workflow::save_workflow_dag(
                        &self.db,
                        self.workflow_id,
                        &self.dag,
                        &self.intent,
                        expires_at,
                    ) {
                        warn!("failed to persist replanned dag: {}", e);
                    }
                    info!(
                        "workflow {} replanned: +{} tasks, now {} layers",
                        self.workflow_id,
                        self.layers.last().map_or(0, Vec::len),
                        self.layers.len()
                    );
                }
                Ok(_) => debug!("replan produced no tasks for '{}'", requirement),
                Err(e) => warn!("replan failed for '{}': {}", requirement, e),
            }
        }
    }

    async fn write_checkpoint(&mut self, layer_idx: usize) -> String {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            workflow_id: self.workflow_id,
            layer_index: layer_idx,
            task_snapshot: self.results.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = workflow::save_checkpoint(&self.db, &checkpoint) {
            // Checkpoint loss degrades resumability, not the current run.
            warn!("failed to persist checkpoint: {}", e);
        }
        checkpoint.id
    }

    fn truncated_outputs(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (task_id, output) in &self.outputs {
            let mut rendered = output.to_string();
            if rendered.chars().count() > CONTEXT_OUTPUT_MAX_CHARS {
                rendered = rendered.chars().take(CONTEXT_OUTPUT_MAX_CHARS).collect();
                rendered.push('…');
            }
            map.insert(task_id.clone(), Value::String(rendered));
        }
        Value::Object(map)
    }

    async fn finish_aborted(&mut self, reason: &str, completed_layers: usize, started: Instant) {
        self.emit(ExecutionEvent::WorkflowAborted {
            workflow_id: self.workflow_id.to_string(),
            reason: reason.to_string(),
            completed_layers,
        })
        .await;
        self.finish(WorkflowStatus::Aborted, started, true).await;
    }

    async fn finish(&mut self, status: WorkflowStatus, started: Instant, aborted: bool) {
        let _ = self.status.send(status);
        if let Err(e) = workflow::delete_workflow_dag(&self.db, self.workflow_id) {
            warn!("failed to delete workflow dag row: {}", e);
        }
        self.registry.remove(self.workflow_id);

        if let Some(observer) = &self.observer {
            let report = WorkflowReport {
                workflow_id: self.workflow_id,
                intent: self.intent.clone(),
                dag: self.dag.clone(),
                results: self.results.clone(),
                total_time_ms: started.elapsed().as_millis() as u64,
                aborted,
            };
            observer.on_workflow_complete(&report).await;
        }
    }

    async fn emit(&self, event: ExecutionEvent) {
        let _ = self.event_bus.send(BusEvent {
            workflow_id: self.workflow_id,
            event: event.clone(),
        });
        let _ = self.events.send(event).await;
    }
}
