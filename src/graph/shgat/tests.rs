use super::*;
use crate::capability::{Capability, CapabilitySource, Fqdn, ToolId};
use crate::graph::{ExecutionObservation, Hypergraph, ObservedStep};
use chrono::Utc;

const DIM: usize = 8;

fn embedding(values: &[f32]) -> Vec<f32> {
    let mut v = values.to_vec();
    v.resize(DIM, 0.0);
    crate::utils::math::l2_normalize(&mut v);
    v
}

fn capability(name: &str, emb: &[f32], success_rate: f64) -> Capability {
    let code = format!("fn {name}() {{}}");
    let code_hash = crate::capability::hash_code(&code);
    Capability {
        id: uuid::Uuid::new_v4(),
        fqdn: Fqdn::new("local", "default", "test", name, &code_hash).unwrap(),
        code_hash,
        code_snippet: code,
        intent_embedding: embedding(emb),
        parameters_schema: None,
        tools_used: vec![],
        success_rate,
        usage_count: 10,
        success_count: (10.0 * success_rate) as u64,
        avg_duration_ms: 50.0,
        community_id: None,
        created_at: Utc::now(),
        last_used: Utc::now(),
        source: CapabilitySource::Emergent,
    }
}

fn scorer_with_graph() -> (ShgatScorer, std::sync::Arc<Hypergraph>) {
    let graph = std::sync::Arc::new(Hypergraph::new());
    let scorer = ShgatScorer::new(graph.clone(), ShgatConfig::new(DIM));
    (scorer, graph)
}

#[test]
fn test_scores_are_in_unit_interval() {
    let (scorer, graph) = scorer_with_graph();
    graph.ensure_capability(&capability("a", &[1.0, 0.0], 0.9));
    graph.ensure_capability(&capability("b", &[0.0, 1.0], 0.1));
    graph.ensure_tool(&ToolId::new("fs", "read"), embedding(&[0.5, 0.5]));

    let intent = embedding(&[1.0, 0.0]);
    for cap in scorer.score_all_capabilities(&intent) {
        assert!((0.0..=1.0).contains(&cap.score), "score {}", cap.score);
        assert_eq!(cap.head_scores.len(), DEFAULT_NUM_HEADS);
        let mix: f64 = cap.head_weights.iter().sum();
        assert!((mix - 1.0).abs() < 1e-9);
    }
    for tool in scorer.score_all_tools(&intent, None) {
        assert!((0.0..=1.0).contains(&tool.score));
    }
}

#[test]
fn test_reliability_term_separates_equal_semantics() {
    let (scorer, graph) = scorer_with_graph();
    let reliable = capability("reliable", &[1.0, 0.0], 1.0);
    let flaky = capability("flaky", &[1.0, 0.0], 0.0);
    graph.ensure_capability(&reliable);
    graph.ensure_capability(&flaky);

    let scores = scorer.score_all_capabilities(&embedding(&[1.0, 0.0]));
    assert_eq!(scores.len(), 2);
    assert_eq!(scores[0].capability_id, reliable.id);
    assert!(scores[0].score > scores[1].score);
}

#[test]
fn test_results_sorted_descending() {
    let (scorer, graph) = scorer_with_graph();
    for i in 0..5 {
        graph.ensure_capability(&capability(
            &format!("cap{i}"),
            &[i as f32 * 0.2, 1.0 - i as f32 * 0.2],
            0.5 + 0.1 * i as f64,
        ));
    }
    let scores = scorer.score_all_capabilities(&embedding(&[0.3, 0.7]));
    for pair in scores.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn test_context_tools_bias_tool_scores() {
    let (scorer, graph) = scorer_with_graph();
    let read = ToolId::new("fs", "read");
    let post = ToolId::new("http", "post");
    let lone = ToolId::new("misc", "noop");
    graph.ensure_tool(&read, embedding(&[1.0, 0.0]));
    graph.ensure_tool(&post, embedding(&[0.0, 1.0]));
    graph.ensure_tool(&lone, embedding(&[0.0, 0.0]));

    // read and post share a hub neighbor; lone is isolated.
    let hub = ToolId::new("fs", "stat");
    graph.ensure_tool(&hub, embedding(&[0.5, 0.5]));
    graph
        .update_from_execution(&ExecutionObservation {
            steps: vec![
                ObservedStep {
                    node: crate::graph::NodeRef::Tool(hub.clone()),
                    depends_on: vec![],
                    duration_ms: 100.0,
                    success: true,
                },
                ObservedStep {
                    node: crate::graph::NodeRef::Tool(read.clone()),
                    depends_on: vec![0],
                    duration_ms: 100.0,
                    success: true,
                },
                ObservedStep {
                    node: crate::graph::NodeRef::Tool(post.clone()),
                    depends_on: vec![0],
                    duration_ms: 100.0,
                    success: true,
                },
            ],
        })
        .unwrap();

    let intent = embedding(&[0.0, 0.0, 1.0]);
    let scores = scorer.score_all_tools(&intent, Some(std::slice::from_ref(&read)));
    let get = |t: &ToolId| {
        scores
            .iter()
            .find(|s| &s.tool_id == t)
            .map(|s| s.score)
            .unwrap()
    };
    // post shares the hub with the context tool; lone has no graph affinity.
    assert!(get(&post) > get(&lone));
}

#[test]
fn test_training_moves_scores_toward_outcomes() {
    let (scorer, graph) = scorer_with_graph();
    let good = capability("good", &[1.0, 0.0], 0.5);
    let bad = capability("bad", &[0.9, 0.1], 0.5);
    graph.ensure_capability(&good);
    graph.ensure_capability(&bad);

    let intent = embedding(&[1.0, 0.0]);
    let before = scorer.score_all_capabilities(&intent);
    let before_good = before.iter().find(|s| s.capability_id == good.id).unwrap().score;
    let before_bad = before.iter().find(|s| s.capability_id == bad.id).unwrap().score;

    let examples = vec![
        TrainingExample {
            intent_embedding: intent.clone(),
            context_tools: vec![],
            candidate: crate::graph::NodeRef::Capability(good.id),
            outcome: 1.0,
        },
        TrainingExample {
            intent_embedding: intent.clone(),
            context_tools: vec![],
            candidate: crate::graph::NodeRef::Capability(bad.id),
            outcome: 0.0,
        },
    ];
    scorer.train_on_episodes(&examples, 200, 0.5);

    let after = scorer.score_all_capabilities(&intent);
    let after_good = after.iter().find(|s| s.capability_id == good.id).unwrap().score;
    let after_bad = after.iter().find(|s| s.capability_id == bad.id).unwrap().score;

    // Positive example pulled up relative to the negative one.
    assert!(after_good - after_bad > before_good - before_bad);
}

#[test]
fn test_training_on_empty_examples_is_noop() {
    let (scorer, graph) = scorer_with_graph();
    graph.ensure_capability(&capability("a", &[1.0], 0.8));
    let intent = embedding(&[1.0]);
    let before: Vec<f64> = scorer.score_all_capabilities(&intent).iter().map(|s| s.score).collect();
    scorer.train_on_episodes(&[], 10, 0.1);
    let after: Vec<f64> = scorer.score_all_capabilities(&intent).iter().map(|s| s.score).collect();
    assert_eq!(before, after);
}
