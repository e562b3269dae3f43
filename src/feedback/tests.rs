use super::*;
use crate::capability::SaveRequest;
use crate::config::ThresholdConfig;
use crate::embedding::HashEmbedder;
use crate::executor::{Dag, Task, TaskResult};
use crate::graph::shgat::ShgatConfig;
use crate::storage::Db;
use serde_json::json;
use std::collections::BTreeMap;

struct Fixture {
    sink: FeedbackSink,
    graph: Arc<Hypergraph>,
    store: Arc<CapabilityStore>,
    thresholds: Arc<AdaptiveThresholdManager>,
}

fn fixture() -> Fixture {
    let db = Arc::new(Db::open_in_memory().unwrap());
    let graph = Arc::new(Hypergraph::new());
    let store = Arc::new(CapabilityStore::new(db.clone()));
    let thresholds = Arc::new(AdaptiveThresholdManager::new(ThresholdConfig::default(), db));
    let facade = Arc::new(EmbeddingFacade::new(Arc::new(HashEmbedder::new(16))));
    let scorer = Arc::new(ShgatScorer::new(graph.clone(), ShgatConfig::new(16)));
    let sink = FeedbackSink::new(
        graph.clone(),
        store.clone(),
        thresholds.clone(),
        scorer,
        facade,
    );
    Fixture {
        sink,
        graph,
        store,
        thresholds,
    }
}

fn tool_report(workflow_id: Uuid) -> WorkflowReport {
    let dag = Dag::new(vec![
        Task::tool("task_0", "fs:read"),
        Task::tool("task_1", "http:post").after(&["task_0"]),
    ]);
    let mut results = std::collections::BTreeMap::new();
    results.insert(
        "task_0".to_string(),
        TaskResult::completed("task_0", json!({"ok": true}), 100),
    );
    results.insert(
        "task_1".to_string(),
        TaskResult::completed("task_1", json!({"ok": true}), 200),
    );
    WorkflowReport {
        workflow_id,
        intent: "read then post".into(),
        dag,
        results,
        total_time_ms: 300,
        aborted: false,
    }
}

#[tokio::test]
async fn test_report_strengthens_hypergraph() {
    let fx = fixture();
    fx.sink.on_workflow_complete(&tool_report(Uuid::new_v4())).await;

    let snap = fx.graph.snapshot();
    let read = snap
        .resolve(&NodeRef::Tool(ToolId::new("fs", "read")))
        .expect("fs:read node created");
    let post = snap
        .resolve(&NodeRef::Tool(ToolId::new("http", "post")))
        .unwrap();
    assert!(snap.edge(read, post).is_some());
}

#[tokio::test]
async fn test_capability_usage_updated_once_per_task() {
    let fx = fixture();
    let cap = fx
        .store
        .save(SaveRequest::new("do_work()", vec![1.0, 0.0]).named("fs", "work"))
        .unwrap()
        .capability;

    let dag = Dag::new(vec![Task::capability("task_0", cap.fqdn.to_string())]);
    let mut results = std::collections::BTreeMap::new();
    results.insert(
        "task_0".to_string(),
        TaskResult::completed("task_0", json!("done"), 50),
    );
    let report = WorkflowReport {
        workflow_id: Uuid::new_v4(),
        intent: "work".into(),
        dag,
        results,
        total_time_ms: 50,
        aborted: false,
    };

    fx.sink.on_workflow_complete(&report).await;
    // Replayed report (same workflow id, same task) must be a no-op.
    fx.sink.on_workflow_complete(&report).await;

    let updated = fx.store.find_by_id(cap.id).unwrap().unwrap();
    assert_eq!(updated.usage_count, 2);
    assert_eq!(updated.success_count, 2);
    assert_eq!(fx.sink.pending_training(), 1);
}

#[tokio::test]
async fn test_failed_capability_lowers_success_rate() {
    let fx = fixture();
    let cap = fx
        .store
        .save(SaveRequest::new("fragile()", vec![0.5, 0.5]).named("fs", "fragile"))
        .unwrap()
        .capability;

    let dag = Dag::new(vec![Task::capability("task_0", cap.fqdn.to_string())]);
    let mut results = std::collections::BTreeMap::new();
    let err = crate::errors::GatewayError::BackendTool {
        tool: "x".into(),
        message: "broke".into(),
    };
    results.insert("task_0".to_string(), TaskResult::failed("task_0", &err, 80));
    let report = WorkflowReport {
        workflow_id: Uuid::new_v4(),
        intent: "fragile".into(),
        dag,
        results,
        total_time_ms: 80,
        aborted: false,
    };
    fx.sink.on_workflow_complete(&report).await;

    let updated = fx.store.find_by_id(cap.id).unwrap().unwrap();
    assert_eq!(updated.usage_count, 2);
    assert_eq!(updated.success_count, 1);
    assert!((updated.success_rate - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_decision_context_feeds_threshold_window() {
    let fx = fixture();
    let workflow_id = Uuid::new_v4();
    fx.sink.register_decision(
        workflow_id,
        DecisionContext {
            decision: ExecutionDecision::SpeculativeExecution,
            confidence: 0.8,
            context_hash: crate::threshold::context_hash(&BTreeMap::new()),
            user_accepted: None,
        },
    );
    fx.sink.on_workflow_complete(&tool_report(workflow_id)).await;
    assert_eq!(fx.thresholds.window_len(), 1);
    let metrics = fx.thresholds.metrics();
    assert_eq!(metrics.speculative_total, 1);
    assert!((metrics.speculative_hit_rate - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_flush_training_drains_queue() {
    let fx = fixture();
    let cap = fx
        .store
        .save(SaveRequest::new("train_me()", vec![0.9, 0.1]).named("fs", "train"))
        .unwrap()
        .capability;
    fx.graph.ensure_capability(&cap);

    let dag = Dag::new(vec![Task::capability("task_0", cap.fqdn.to_string())]);
    let mut results = std::collections::BTreeMap::new();
    results.insert(
        "task_0".to_string(),
        TaskResult::completed("task_0", json!("ok"), 10),
    );
    fx.sink
        .on_workflow_complete(&WorkflowReport {
            workflow_id: Uuid::new_v4(),
            intent: "train".into(),
            dag,
            results,
            total_time_ms: 10,
            aborted: false,
        })
        .await;

    assert_eq!(fx.sink.pending_training(), 1);
    fx.sink.flush_training().await;
    assert_eq!(fx.sink.pending_training(), 0);
}
