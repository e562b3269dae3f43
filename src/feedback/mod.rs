//! Feedback sink: folds execution outcomes back into the hypergraph, the
//! capability statistics, the adaptive thresholds, and the SHGAT training
//! queue. Storage failures here are logged and swallowed; feedback must never
//! affect a user-visible outcome.

use crate::capability::{CapabilityStore, ToolId};
use crate::decision::ExecutionDecision;
use crate::embedding::EmbeddingFacade;
use crate::executor::{ExecutionObserver, TaskState, TaskType, WorkflowReport};
use crate::graph::shgat::{ShgatScorer, TrainingExample};
use crate::graph::{ExecutionObservation, Hypergraph, NodeRef, ObservedStep};
use crate::threshold::{AdaptiveThresholdManager, ExecutionMode, ExecutionRecord};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Cap on the idempotence ledger; beyond it the oldest entries roll off.
const SEEN_CAP: usize = 10_000;
const TRAIN_EPOCHS: usize = 3;
const TRAIN_LEARNING_RATE: f64 = 0.01;

/// Decision metadata registered before execution so the completion report can
/// be turned into an `ExecutionRecord`.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub decision: ExecutionDecision,
    pub confidence: f64,
    pub context_hash: String,
    pub user_accepted: Option<bool>,
}

struct PendingTraining {
    intent: String,
    candidate: NodeRef,
    outcome: f64,
}

pub struct FeedbackSink {
    graph: Arc<Hypergraph>,
    store: Arc<CapabilityStore>,
    thresholds: Arc<AdaptiveThresholdManager>,
    scorer: Arc<ShgatScorer>,
    facade: Arc<EmbeddingFacade>,
    decisions: Mutex<HashMap<Uuid, DecisionContext>>,
    seen: Mutex<(VecDeque<(Uuid, String)>, HashSet<(Uuid, String)>)>,
    training_queue: Mutex<Vec<PendingTraining>>,
}

impl FeedbackSink {
    pub fn new(
        graph: Arc<Hypergraph>,
        store: Arc<CapabilityStore>,
        thresholds: Arc<AdaptiveThresholdManager>,
        scorer: Arc<ShgatScorer>,
        facade: Arc<EmbeddingFacade>,
    ) -> Self {
        Self {
            graph,
            store,
            thresholds,
            scorer,
            facade,
            decisions: Mutex::new(HashMap::new()),
            seen: Mutex::new((VecDeque::new(), HashSet::new())),
            training_queue: Mutex::new(Vec::new()),
        }
    }

    /// Attach decision metadata to a workflow before it runs.
    pub fn register_decision(&self, workflow_id: Uuid, context: DecisionContext) {
        self.decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(workflow_id, context);
    }

    /// Idempotence per (workflow, task): true the first time only.
    fn first_sighting(&self, workflow_id: Uuid, task_id: &str) -> bool {
        let mut guard = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let (order, set) = &mut *guard;
        let key = (workflow_id, task_id.to_string());
        if !set.insert(key.clone()) {
            return false;
        }
        order.push_back(key);
        while order.len() > SEEN_CAP {
            if let Some(old) = order.pop_front() {
                set.remove(&old);
            }
        }
        true
    }

    fn node_ref_for(&self, call_name: &str, task_type: TaskType) -> Option<NodeRef> {
        match task_type {
            TaskType::Tool => ToolId::parse(call_name).ok().map(NodeRef::Tool),
            TaskType::Capability => {
                let fqdn = crate::capability::Fqdn::parse(call_name).ok()?;
                match self.store.find_by_fqdn(&fqdn) {
                    Ok(Some(cap)) => Some(NodeRef::Capability(cap.id)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!("feedback lookup failed for {}: {}", call_name, e);
                        None
                    }
                }
            }
        }
    }

    fn process_report(&self, report: &WorkflowReport) {
        // 1. Hypergraph co-usage edges from the executed task graph.
        let mut index_of: HashMap<&str, usize> = HashMap::new();
        let mut steps: Vec<ObservedStep> = Vec::new();
        for task in &report.dag.tasks {
            let Some(result) = report.results.get(&task.id) else {
                continue;
            };
            if !matches!(result.status, TaskState::Completed | TaskState::Failed) {
                continue;
            }
            let Some(node) = self.node_ref_for(&task.call_name, task.task_type) else {
                continue;
            };
            let depends_on = task
                .depends_on
                .iter()
                .filter_map(|dep| index_of.get(dep.as_str()).copied())
                .collect();
            index_of.insert(task.id.as_str(), steps.len());
            steps.push(ObservedStep {
                node,
                depends_on,
                duration_ms: result.duration_ms.unwrap_or(0) as f64,
                success: result.status == TaskState::Completed,
            });
        }
        if !steps.is_empty() {
            if let Err(e) = self
                .graph
                .update_from_execution(&ExecutionObservation { steps })
            {
                warn!("hypergraph feedback failed: {}", e);
            }
        }

        // 2. Capability usage statistics, once per (workflow, task).
        for task in &report.dag.tasks {
            if task.task_type != TaskType::Capability {
                continue;
            }
            let Some(result) = report.results.get(&task.id) else {
                continue;
            };
            if !matches!(result.status, TaskState::Completed | TaskState::Failed) {
                continue;
            }
            if !self.first_sighting(report.workflow_id, &task.id) {
                continue;
            }
            let Ok(fqdn) = crate::capability::Fqdn::parse(&task.call_name) else {
                continue;
            };
            let success = result.status == TaskState::Completed;
            match self.store.find_by_fqdn(&fqdn) {
                Ok(Some(cap)) => {
                    match self.store.update_usage(
                        &cap.code_hash,
                        success,
                        result.duration_ms.unwrap_or(0) as f64,
                    ) {
                        Ok(updated) => {
                            self.graph
                                .update_capability_stats(updated.id, updated.success_rate);
                            self.enqueue_training(
                                &report.intent,
                                NodeRef::Capability(updated.id),
                                success,
                            );
                        }
                        Err(e) => warn!("usage update failed for {}: {}", fqdn, e),
                    }
                }
                Ok(None) => debug!("feedback for unknown capability {}", fqdn),
                Err(e) => warn!("capability lookup failed for {}: {}", fqdn, e),
            }
        }

        // 3. Threshold window.
        let decision = self
            .decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&report.workflow_id);
        if let Some(decision) = decision {
            let success = !report.aborted
                && report
                    .results
                    .values()
                    .all(|r| !matches!(r.status, TaskState::Failed | TaskState::Cancelled));
            let record = ExecutionRecord {
                confidence: decision.confidence,
                mode: match decision.decision {
                    ExecutionDecision::SpeculativeExecution => ExecutionMode::Speculative,
                    ExecutionDecision::Suggestion => ExecutionMode::Suggestion,
                    ExecutionDecision::ExplicitRequired => ExecutionMode::Explicit,
                },
                success,
                user_accepted: decision.user_accepted,
                execution_time_ms: Some(report.total_time_ms),
                context_hash: decision.context_hash,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.thresholds.record(record) {
                warn!("threshold feedback failed: {}", e);
            }
        }
    }

    fn enqueue_training(&self, intent: &str, candidate: NodeRef, success: bool) {
        self.training_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PendingTraining {
                intent: intent.to_string(),
                candidate,
                outcome: if success { 1.0 } else { 0.0 },
            });
    }

    pub fn pending_training(&self) -> usize {
        self.training_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Drain the training queue into one SHGAT gradient pass. Off the hot
    /// path; scoring keeps reading the previous weight snapshot meanwhile.
    pub async fn flush_training(&self) {
        let pending: Vec<PendingTraining> = std::mem::take(
            &mut *self
                .training_queue
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        if pending.is_empty() {
            return;
        }
        let mut examples = Vec::with_capacity(pending.len());
        for item in pending {
            match self.facade.encode(&item.intent).await {
                Ok(embedding) => examples.push(TrainingExample {
                    intent_embedding: embedding.to_vec(),
                    context_tools: Vec::new(),
                    candidate: item.candidate,
                    outcome: item.outcome,
                }),
                Err(e) => warn!("training encode failed: {}", e),
            }
        }
        if !examples.is_empty() {
            debug!("training shgat on {} buffered episodes", examples.len());
            self.scorer
                .train_on_episodes(&examples, TRAIN_EPOCHS, TRAIN_LEARNING_RATE);
        }
    }
}

#[async_trait]
impl ExecutionObserver for FeedbackSink {
    async fn on_workflow_complete(&self, report: &WorkflowReport) {
        self.process_report(report);
    }
}

#[cfg(test)]
mod tests;
