//! The gateway's seven meta-tools: stable names, stable semantics.

use crate::capability::SaveRequest;
use crate::decision::ExecutionDecision;
use crate::discovery::{DiscoveryFilter, DiscoveryRequest};
use crate::errors::{GatewayError, GatewayResult};
use crate::executor::{
    Dag, ExecOptions, ExecutionEvent, WorkflowCommand, WorkflowStatus,
};
use crate::feedback::DecisionContext;
use crate::runtime::CoreRuntime;
use crate::sandbox::{InjectedTool, SandboxRequest};
use crate::threshold::context_hash;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

const MAX_CODE_BYTES: usize = 100 * 1024;
/// How long a synchronous call waits for workflow progress.
const SYNC_WAIT: Duration = Duration::from_secs(60);
/// Settling window after a checkpoint to tell "paused" from "finished".
const PAUSE_GRACE: Duration = Duration::from_millis(200);
/// Quiet period after a command before answering with the live status.
const COMMAND_QUIET: Duration = Duration::from_millis(1_500);
/// Tools injected into the sandbox from discovery matches.
const INJECTED_TOOL_LIMIT: usize = 5;

pub fn tool_definitions() -> Value {
    json!([
        {
            "name": "execute_dag",
            "description": "Resolve an intent (or an explicit workflow) into a task DAG and run it with layered, checkpointed execution",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "intent": { "type": "string" },
                    "workflow": { "type": "object" },
                    "context": { "type": "object" },
                    "config": {
                        "type": "object",
                        "properties": { "per_layer_validation": { "type": "boolean" } }
                    }
                }
            }
        },
        {
            "name": "discover",
            "description": "Rank tools and learned capabilities against a natural-language intent",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "intent": { "type": "string" },
                    "filter": {
                        "type": "object",
                        "properties": {
                            "type": { "enum": ["tool", "capability", "all"] },
                            "min_score": { "type": "number" }
                        }
                    },
                    "limit": { "type": "integer", "maximum": 50 },
                    "include_related": { "type": "boolean" }
                },
                "required": ["intent"]
            }
        },
        {
            "name": "execute_code",
            "description": "Run code in the sandbox with discovery-matched tools injected",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": { "type": "string" },
                    "intent": { "type": "string" },
                    "context": { "type": "object" },
                    "sandbox_config": {
                        "type": "object",
                        "properties": {
                            "timeout": { "type": "integer" },
                            "memory_limit": { "type": "integer" },
                            "allowed_read_paths": { "type": "array", "items": { "type": "string" } }
                        }
                    }
                },
                "required": ["code"]
            }
        },
        {
            "name": "continue",
            "description": "Resume a paused workflow",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "workflow_id": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["workflow_id"]
            }
        },
        {
            "name": "abort",
            "description": "Terminate a running workflow",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "workflow_id": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["workflow_id", "reason"]
            }
        },
        {
            "name": "replan",
            "description": "Augment a running workflow's DAG from a new requirement",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "workflow_id": { "type": "string" },
                    "new_requirement": { "type": "string" },
                    "available_context": { "type": "object" }
                },
                "required": ["workflow_id", "new_requirement"]
            }
        },
        {
            "name": "approval_response",
            "description": "Answer a human-in-the-loop approval request",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "workflow_id": { "type": "string" },
                    "checkpoint_id": { "type": "string" },
                    "approved": { "type": "boolean" },
                    "feedback": { "type": "string" }
                },
                "required": ["workflow_id", "checkpoint_id", "approved"]
            }
        }
    ])
}

pub async fn call(
    runtime: &Arc<CoreRuntime>,
    identity: &str,
    name: &str,
    params: Value,
) -> GatewayResult<Value> {
    debug!("meta-tool {} invoked by {}", name, identity);
    match name {
        "execute_dag" => execute_dag(runtime, params).await,
        "discover" => discover(runtime, params).await,
        "execute_code" => execute_code(runtime, params).await,
        "continue" => send_workflow_command(runtime, params, |p| {
            Ok(WorkflowCommand::Continue {
                reason: p.get("reason").and_then(Value::as_str).map(String::from),
            })
        })
        .await,
        "abort" => send_workflow_command(runtime, params, |p| {
            let reason = p
                .get("reason")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::InvalidParams("abort requires a reason".into()))?;
            Ok(WorkflowCommand::Abort {
                reason: reason.to_string(),
            })
        })
        .await,
        "replan" => send_workflow_command(runtime, params, |p| {
            let requirement = p.get("new_requirement").and_then(Value::as_str).ok_or_else(|| {
                GatewayError::InvalidParams("replan requires new_requirement".into())
            })?;
            Ok(WorkflowCommand::ReplanDag {
                new_requirement: requirement.to_string(),
                available_context: p.get("available_context").cloned(),
            })
        })
        .await,
        "approval_response" => send_workflow_command(runtime, params, |p| {
            let checkpoint_id = p.get("checkpoint_id").and_then(Value::as_str).ok_or_else(|| {
                GatewayError::InvalidParams("approval_response requires checkpoint_id".into())
            })?;
            let approved = p.get("approved").and_then(Value::as_bool).ok_or_else(|| {
                GatewayError::InvalidParams("approval_response requires approved".into())
            })?;
            Ok(WorkflowCommand::ApprovalResponse {
                checkpoint_id: checkpoint_id.to_string(),
                approved,
                feedback: p.get("feedback").and_then(Value::as_str).map(String::from),
            })
        })
        .await,
        other => Err(GatewayError::InvalidParams(format!(
            "unknown meta-tool '{other}'"
        ))),
    }
}

fn context_map(params: &Value) -> BTreeMap<String, String> {
    params
        .get("context")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

async fn execute_dag(runtime: &Arc<CoreRuntime>, params: Value) -> GatewayResult<Value> {
    let intent = params.get("intent").and_then(Value::as_str);
    let explicit_workflow = params.get("workflow");
    if intent.is_none() && explicit_workflow.is_none() {
        return Err(GatewayError::InvalidParams(
            "execute_dag requires 'intent' or 'workflow'".into(),
        ));
    }
    let per_layer_validation = params
        .get("config")
        .and_then(|c| c.get("per_layer_validation"))
        .and_then(Value::as_bool)
        .unwrap_or(runtime.config.executor.per_layer_validation);
    let context = context_map(&params);
    let thresholds = runtime.thresholds.load(&context)?;

    // An explicit workflow is user-approved by construction; an intent goes
    // through discovery and the decision engine.
    let (dag, confidence, can_speculate, intent_text, user_accepted) = match explicit_workflow {
        Some(raw) => {
            let dag: Dag = serde_json::from_value(raw.clone())
                .map_err(|e| GatewayError::InvalidParams(format!("invalid workflow: {e}")))?;
            (dag, 1.0, false, intent.unwrap_or("explicit workflow").to_string(), Some(true))
        }
        None => {
            let request = DiscoveryRequest::new(intent.unwrap_or_default());
            let discovery_started = std::time::Instant::now();
            let outcome = runtime.discovery.discover(&request).await?;
            record_metric(
                runtime,
                "discovery.latency_ms",
                discovery_started.elapsed().as_millis() as f64,
            );
            let Some(suggestion) = outcome.suggestion else {
                return Ok(json!({
                    "decision": "no_match",
                    "items": outcome.items,
                }));
            };
            (
                suggestion.dag,
                suggestion.confidence,
                suggestion.can_speculate,
                intent.unwrap_or_default().to_string(),
                None,
            )
        }
    };

    let (decision, safety) =
        runtime
            .decision
            .decide(&dag, confidence, can_speculate, thresholds);
    let safety_json = safety.as_ref().map(|m| {
        json!({ "task_id": m.task_id, "pattern": m.pattern, "matched": m.matched_text })
    });

    // Suggestions and explicit-approval decisions are returned, not run —
    // unless the caller handed us the workflow itself.
    let run_now = explicit_workflow.is_some()
        || decision == ExecutionDecision::SpeculativeExecution;
    if !run_now {
        return Ok(json!({
            "decision": decision.as_str(),
            "confidence": confidence,
            "can_speculate": can_speculate,
            "dag": dag,
            "safety": safety_json,
            "thresholds": { "explicit": thresholds.explicit, "suggestion": thresholds.suggestion },
        }));
    }

    let opts = ExecOptions {
        per_layer_validation,
        parameters: params
            .get("parameters")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        // Safety-flagged explicit workflows still gate side effects on HIL.
        require_approval_for_side_effects: safety.is_some(),
    };

    let run = runtime.executor.start(dag, intent_text, opts)?;
    let workflow_id = run.workflow_id;
    runtime.feedback.register_decision(
        workflow_id,
        DecisionContext {
            decision,
            confidence,
            context_hash: context_hash(&context),
            user_accepted,
        },
    );
    info!(
        "workflow {} started ({}, confidence {:.2})",
        workflow_id,
        decision.as_str(),
        confidence
    );

    let (events, status) = collect_run_events(run.events, per_layer_validation).await;
    if let Some(ExecutionEvent::WorkflowComplete { total_time_ms, .. }) =
        events.iter().find(|e| e.is_terminal())
    {
        record_metric(runtime, "workflow.total_ms", *total_time_ms as f64);
    }
    Ok(json!({
        "decision": decision.as_str(),
        "confidence": confidence,
        "workflow_id": workflow_id.to_string(),
        "status": status,
        "events": events,
        "safety": safety_json,
    }))
}

/// Metric loss is never user-visible.
fn record_metric(runtime: &Arc<CoreRuntime>, name: &str, value: f64) {
    if let Err(e) = runtime.db.record_metric(name, value, None) {
        tracing::warn!("metric {} not recorded: {}", name, e);
    }
}

/// Consume the run's event stream until it terminates or suspends.
async fn collect_run_events(
    mut rx: mpsc::Receiver<ExecutionEvent>,
    per_layer_validation: bool,
) -> (Vec<ExecutionEvent>, &'static str) {
    let deadline = tokio::time::Instant::now() + SYNC_WAIT;
    let mut events = Vec::new();
    let status = loop {
        let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break "completed",
            Err(_) => break "running",
        };
        let stop = match &event {
            ExecutionEvent::WorkflowComplete { .. } => Some("completed"),
            ExecutionEvent::WorkflowAborted { .. } => Some("aborted"),
            ExecutionEvent::DecisionRequired { .. } => Some("awaiting_approval"),
            ExecutionEvent::Checkpoint { .. } if per_layer_validation => None,
            _ => None,
        };
        let was_checkpoint =
            per_layer_validation && matches!(&event, ExecutionEvent::Checkpoint { .. });
        events.push(event);
        if let Some(status) = stop {
            break status;
        }
        if was_checkpoint {
            // Either the terminal event follows immediately (final layer) or
            // the workflow is now paused waiting for `continue`.
            match tokio::time::timeout(PAUSE_GRACE, rx.recv()).await {
                Ok(Some(next)) => {
                    let terminal = next.is_terminal();
                    let aborted = matches!(next, ExecutionEvent::WorkflowAborted { .. });
                    events.push(next);
                    if terminal {
                        break if aborted { "aborted" } else { "completed" };
                    }
                }
                Ok(None) => break "completed",
                Err(_) => break "paused",
            }
        }
    };
    if status == "paused" || status == "awaiting_approval" || status == "running" {
        // Keep draining so the workflow never blocks on a full event buffer;
        // live consumers follow the broadcast bus.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
    }
    (events, status)
}

/// Shared shape of the four workflow-command meta-tools: parse, enqueue,
/// then report the events that followed.
async fn send_workflow_command(
    runtime: &Arc<CoreRuntime>,
    params: Value,
    build: impl FnOnce(&Value) -> GatewayResult<WorkflowCommand>,
) -> GatewayResult<Value> {
    let workflow_id = params
        .get("workflow_id")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidParams("workflow_id is required".into()))?;
    let workflow_id = Uuid::parse_str(workflow_id)
        .map_err(|_| GatewayError::InvalidParams(format!("invalid workflow_id '{workflow_id}'")))?;
    let command = build(&params)?;

    let registry = runtime.executor.registry();
    let bus = runtime.executor.subscribe();
    registry.send_command(workflow_id, command).await?;

    let (events, status) = collect_bus_events(bus, workflow_id, &registry).await;
    Ok(json!({
        "workflow_id": workflow_id.to_string(),
        "status": status,
        "events": events,
    }))
}

async fn collect_bus_events(
    mut bus: broadcast::Receiver<crate::executor::BusEvent>,
    workflow_id: Uuid,
    registry: &Arc<crate::executor::WorkflowRegistry>,
) -> (Vec<ExecutionEvent>, String) {
    let deadline = tokio::time::Instant::now() + SYNC_WAIT;
    let mut events = Vec::new();
    loop {
        let recv = tokio::time::timeout(COMMAND_QUIET, bus.recv());
        match tokio::time::timeout_at(deadline, recv).await {
            Ok(Ok(Ok(bus_event))) => {
                if bus_event.workflow_id != workflow_id {
                    continue;
                }
                let event = bus_event.event;
                let terminal = event.is_terminal();
                let aborted = matches!(event, ExecutionEvent::WorkflowAborted { .. });
                let awaiting = matches!(event, ExecutionEvent::DecisionRequired { .. });
                events.push(event);
                if terminal {
                    return (events, if aborted { "aborted" } else { "completed" }.to_string());
                }
                if awaiting {
                    return (events, "awaiting_approval".to_string());
                }
            }
            Ok(Ok(Err(broadcast::error::RecvError::Lagged(_)))) => continue,
            Ok(Ok(Err(broadcast::error::RecvError::Closed))) | Ok(Err(_)) | Err(_) => {
                // Quiet (or stream gone): answer with the live status.
                let status = match registry.get(workflow_id) {
                    Some(handle) => match handle.status() {
                        WorkflowStatus::Running => "running",
                        WorkflowStatus::Paused => "paused",
                        WorkflowStatus::AwaitingApproval => "awaiting_approval",
                        WorkflowStatus::Complete => "completed",
                        WorkflowStatus::Aborted => "aborted",
                    },
                    None => "finished",
                };
                return (events, status.to_string());
            }
        }
    }
}

async fn discover(runtime: &Arc<CoreRuntime>, params: Value) -> GatewayResult<Value> {
    let intent = params
        .get("intent")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidParams("discover requires an intent".into()))?;
    let filter = match params
        .get("filter")
        .and_then(|f| f.get("type"))
        .and_then(Value::as_str)
    {
        Some("tool") => DiscoveryFilter::Tool,
        Some("capability") => DiscoveryFilter::Capability,
        Some("all") | None => DiscoveryFilter::All,
        Some(other) => {
            return Err(GatewayError::InvalidParams(format!(
                "unknown filter type '{other}'"
            )));
        }
    };
    let request = DiscoveryRequest {
        intent: intent.to_string(),
        filter,
        limit: params
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(10)
            .min(50) as usize,
        min_score: params
            .get("filter")
            .and_then(|f| f.get("min_score"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .max(0.0),
    };
    let started = std::time::Instant::now();
    let outcome = runtime.discovery.discover(&request).await?;
    record_metric(
        runtime,
        "discovery.latency_ms",
        started.elapsed().as_millis() as f64,
    );

    let related = if params
        .get("include_related")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        outcome
            .items
            .first()
            .and_then(|top| related_for(runtime, &top.name, 5))
    } else {
        None
    };

    Ok(json!({
        "items": outcome.items,
        "suggestion": outcome.suggestion,
        "related": related,
    }))
}

fn related_for(runtime: &Arc<CoreRuntime>, name: &str, limit: usize) -> Option<Value> {
    let tool_id = crate::capability::ToolId::parse(name).ok()?;
    let snapshot = runtime.graph.snapshot();
    let node = snapshot.resolve(&crate::graph::NodeRef::Tool(tool_id))?;
    let mut scored: Vec<(String, f64)> = snapshot
        .nodes
        .iter()
        .filter(|n| n.id != node)
        .map(|n| (n.kind.label(), snapshot.adamic_adar(node, &[n.id])))
        .filter(|(_, score)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    Some(json!(
        scored
            .into_iter()
            .map(|(name, score)| json!({ "name": name, "score": score }))
            .collect::<Vec<_>>()
    ))
}

async fn execute_code(runtime: &Arc<CoreRuntime>, params: Value) -> GatewayResult<Value> {
    let code = params
        .get("code")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidParams("execute_code requires code".into()))?;
    if code.len() > MAX_CODE_BYTES {
        return Err(GatewayError::InvalidParams(format!(
            "code exceeds {MAX_CODE_BYTES} bytes"
        )));
    }
    let intent = params.get("intent").and_then(Value::as_str);

    let mut sandbox_config = runtime.config.sandbox.clone();
    if let Some(overrides) = params.get("sandbox_config") {
        if let Some(timeout) = overrides.get("timeout").and_then(Value::as_u64) {
            sandbox_config.timeout_ms = timeout;
        }
        if let Some(memory) = overrides.get("memory_limit").and_then(Value::as_u64) {
            sandbox_config.memory_limit_mb = memory;
        }
        if let Some(paths) = overrides.get("allowed_read_paths").and_then(Value::as_array) {
            sandbox_config.allowed_read_paths = paths
                .iter()
                .filter_map(Value::as_str)
                .map(std::path::PathBuf::from)
                .collect();
        }
    }

    // Auto-inject the best matches for the intent as callable tools.
    let mut tools: Vec<InjectedTool> = Vec::new();
    if let Some(intent) = intent {
        let outcome = runtime
            .discovery
            .discover(&DiscoveryRequest {
                intent: intent.to_string(),
                filter: DiscoveryFilter::All,
                limit: INJECTED_TOOL_LIMIT,
                min_score: 0.0,
            })
            .await?;
        tools = outcome
            .items
            .into_iter()
            .map(|item| InjectedTool {
                name: item.name,
                description: None,
                schema: None,
            })
            .collect();
    }

    let outcome = runtime
        .sandbox
        .execute(SandboxRequest {
            code: code.to_string(),
            intent: intent.map(String::from),
            context: params.get("context").cloned(),
            config: sandbox_config,
            tools,
        })
        .await?;

    // First successful run of new code mints a capability.
    let mut capability_json = None;
    if outcome.success {
        let source_text = intent.unwrap_or(code);
        match runtime.facade.encode(source_text).await {
            Ok(embedding) => {
                let tools_used = outcome
                    .traces
                    .iter()
                    .filter_map(|t| crate::capability::ToolId::parse(&t.tool).ok())
                    .collect();
                match runtime.store.save(
                    SaveRequest::new(code, embedding.to_vec()).with_tools(tools_used),
                ) {
                    Ok(saved) => {
                        runtime.graph.ensure_capability(&saved.capability);
                        capability_json = Some(json!({
                            "fqdn": saved.capability.fqdn.to_string(),
                            "first_seen": saved.first_seen,
                        }));
                    }
                    Err(e) => tracing::warn!("capability save failed: {}", e),
                }
            }
            Err(e) => tracing::warn!("capability embedding failed: {}", e),
        }
    }

    Ok(json!({
        "success": outcome.success,
        "result": outcome.result,
        "error": outcome.error,
        "traces": outcome.traces,
        "duration_ms": outcome.duration_ms,
        "capability": capability_json,
    }))
}
