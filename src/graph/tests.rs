use super::*;
use crate::capability::ToolId;

fn tool(name: &str) -> ToolId {
    ToolId::new("test", name)
}

fn step(node: NodeRef, deps: Vec<usize>, duration_ms: f64, success: bool) -> ObservedStep {
    ObservedStep {
        node,
        depends_on: deps,
        duration_ms,
        success,
    }
}

fn chain_graph(names: &[&str]) -> (Hypergraph, Vec<NodeId>) {
    let graph = Hypergraph::new();
    let ids: Vec<NodeId> = names
        .iter()
        .map(|n| graph.ensure_tool(&tool(n), vec![1.0, 0.0]))
        .collect();
    let steps: Vec<ObservedStep> = names
        .iter()
        .enumerate()
        .map(|(i, n)| {
            let deps = if i == 0 { vec![] } else { vec![i - 1] };
            step(NodeRef::Tool(tool(n)), deps, 1000.0, true)
        })
        .collect();
    graph
        .update_from_execution(&ExecutionObservation { steps })
        .unwrap();
    (graph, ids)
}

#[test]
fn test_ensure_tool_is_idempotent() {
    let graph = Hypergraph::new();
    let a = graph.ensure_tool(&tool("read"), vec![1.0]);
    let b = graph.ensure_tool(&tool("read"), vec![2.0]);
    assert_eq!(a, b);
    assert_eq!(graph.snapshot().node_count(), 1);
}

#[test]
fn test_update_creates_edges_with_running_mean() {
    let graph = Hypergraph::new();
    let obs = ExecutionObservation {
        steps: vec![
            step(NodeRef::Tool(tool("read")), vec![], 1000.0, true),
            step(NodeRef::Tool(tool("post")), vec![0], 2000.0, true),
        ],
    };
    graph.update_from_execution(&obs).unwrap();

    let snap = graph.snapshot();
    let from = snap.resolve(&NodeRef::Tool(tool("read"))).unwrap();
    let to = snap.resolve(&NodeRef::Tool(tool("post"))).unwrap();
    let edge = snap.edge(from, to).unwrap();
    assert_eq!(edge.count, 1);
    assert!((edge.weight - 0.2).abs() < 1e-9);

    // Second observation folds in with the running mean: (0.2 + 1.0) / 2.
    let obs2 = ExecutionObservation {
        steps: vec![
            step(NodeRef::Tool(tool("read")), vec![], 1000.0, true),
            step(NodeRef::Tool(tool("post")), vec![0], 2000.0, false),
        ],
    };
    graph.update_from_execution(&obs2).unwrap();
    let edge = graph.snapshot().edge(from, to).unwrap();
    assert_eq!(edge.count, 2);
    assert!((edge.weight - 0.6).abs() < 1e-9);
}

#[test]
fn test_edge_weights_stay_in_unit_interval() {
    let graph = Hypergraph::new();
    let obs = ExecutionObservation {
        steps: vec![
            step(NodeRef::Tool(tool("a")), vec![], 1.0, true),
            step(NodeRef::Tool(tool("b")), vec![0], 999_999.0, true),
        ],
    };
    graph.update_from_execution(&obs).unwrap();
    let snap = graph.snapshot();
    for (_, edge) in snap.edges() {
        assert!(edge.weight > 0.0 && edge.weight <= 1.0);
    }
}

#[test]
fn test_self_loops_are_skipped() {
    let graph = Hypergraph::new();
    let obs = ExecutionObservation {
        steps: vec![step(NodeRef::Tool(tool("a")), vec![0], 10.0, true)],
    };
    graph.update_from_execution(&obs).unwrap();
    assert_eq!(graph.snapshot().edge_count(), 0);
}

#[test]
fn test_snapshot_isolation() {
    let (graph, _) = chain_graph(&["a", "b"]);
    let before = graph.snapshot();
    let obs = ExecutionObservation {
        steps: vec![
            step(NodeRef::Tool(tool("b")), vec![], 10.0, true),
            step(NodeRef::Tool(tool("c")), vec![0], 10.0, true),
        ],
    };
    graph.update_from_execution(&obs).unwrap();
    // The old snapshot is unaffected by the write.
    assert_eq!(before.node_count(), 2);
    assert_eq!(graph.snapshot().node_count(), 3);
    assert!(graph.snapshot().version() > before.version());
}

#[test]
fn test_pagerank_sums_to_one_and_favors_sinks() {
    let (graph, ids) = chain_graph(&["a", "b", "c"]);
    let ranks = graph.pagerank();
    let sum: f64 = ranks.iter().sum();
    assert!((sum - 1.0).abs() < 1e-3);
    // Rank accumulates down the chain.
    assert!(ranks[ids[2] as usize] > ranks[ids[0] as usize]);
}

#[test]
fn test_pagerank_cached_until_update() {
    let (graph, _) = chain_graph(&["a", "b"]);
    let first = graph.pagerank();
    let second = graph.pagerank();
    assert!(Arc::ptr_eq(&first, &second));

    graph
        .update_from_execution(&ExecutionObservation {
            steps: vec![
                step(NodeRef::Tool(tool("b")), vec![], 10.0, true),
                step(NodeRef::Tool(tool("a")), vec![0], 10.0, true),
            ],
        })
        .unwrap();
    let third = graph.pagerank();
    assert!(!Arc::ptr_eq(&second, &third));
}

#[test]
fn test_adaptive_alpha_bounds() {
    let graph = Hypergraph::new();
    assert!((graph.snapshot().adaptive_alpha() - 1.0).abs() < f64::EPSILON);

    // Fully connected two-node graph: density 1, alpha clamps to 0.5.
    let a = graph.ensure_tool(&tool("a"), vec![]);
    let b = graph.ensure_tool(&tool("b"), vec![]);
    graph
        .update_from_execution(&ExecutionObservation {
            steps: vec![
                step(NodeRef::Tool(tool("a")), vec![], 10.0, true),
                step(NodeRef::Tool(tool("b")), vec![0], 10.0, true),
            ],
        })
        .unwrap();
    graph
        .update_from_execution(&ExecutionObservation {
            steps: vec![
                step(NodeRef::Tool(tool("b")), vec![], 10.0, true),
                step(NodeRef::Tool(tool("a")), vec![0], 10.0, true),
            ],
        })
        .unwrap();
    let alpha = graph.snapshot().adaptive_alpha();
    assert!((0.5..=1.0).contains(&alpha));
    assert!((alpha - 0.5).abs() < f64::EPSILON);
    let _ = (a, b);
}

#[test]
fn test_shortest_path_follows_cheap_edges() {
    let (graph, ids) = chain_graph(&["a", "b", "c"]);
    let snap = graph.snapshot();
    let (path, cost) = snap.shortest_path(ids[0], ids[2]).unwrap();
    assert_eq!(path, vec![ids[0], ids[1], ids[2]]);
    assert!(cost > 0.0);
    assert!(snap.shortest_path(ids[2], ids[0]).is_none());
}

#[test]
fn test_adamic_adar_shared_neighbor() {
    let graph = Hypergraph::new();
    // hub connects to both x and y.
    graph
        .update_from_execution(&ExecutionObservation {
            steps: vec![
                step(NodeRef::Tool(tool("hub")), vec![], 10.0, true),
                step(NodeRef::Tool(tool("x")), vec![0], 10.0, true),
                step(NodeRef::Tool(tool("y")), vec![0], 10.0, true),
            ],
        })
        .unwrap();
    let snap = graph.snapshot();
    let x = snap.resolve(&NodeRef::Tool(tool("x"))).unwrap();
    let y = snap.resolve(&NodeRef::Tool(tool("y"))).unwrap();
    let score = snap.adamic_adar(x, &[y]);
    // Shared neighbor `hub` has degree 2: 1/ln(3).
    assert!((score - 1.0 / 3.0f64.ln()).abs() < 1e-9);
}

#[test]
fn test_hyperedge_validation() {
    let (graph, ids) = chain_graph(&["a", "b", "c"]);
    let sources: BTreeSet<NodeId> = [ids[0], ids[1]].into_iter().collect();
    let targets: BTreeSet<NodeId> = [ids[2]].into_iter().collect();

    graph
        .add_hyperedge("he-1", sources.clone(), targets.clone(), 0.8)
        .unwrap();
    let snap = graph.snapshot();
    assert_eq!(snap.hyperedges().len(), 1);
    assert!((snap.hyperedges()[0].weight - 1.25).abs() < 1e-9);

    // Duplicate (sources, targets) is rejected.
    assert!(graph.add_hyperedge("he-2", sources.clone(), targets.clone(), 0.5).is_err());
    // Empty side is rejected.
    assert!(graph.add_hyperedge("he-3", BTreeSet::new(), targets, 0.5).is_err());
    // Unknown node is rejected.
    let bogus: BTreeSet<NodeId> = [99].into_iter().collect();
    assert!(graph.add_hyperedge("he-4", sources, bogus, 0.5).is_err());
}

#[test]
fn test_communities_converge_on_components() {
    let graph = Hypergraph::new();
    // Two disconnected pairs.
    for (a, b) in [("a", "b"), ("c", "d")] {
        graph
            .update_from_execution(&ExecutionObservation {
                steps: vec![
                    step(NodeRef::Tool(tool(a)), vec![], 10.0, true),
                    step(NodeRef::Tool(tool(b)), vec![0], 10.0, true),
                ],
            })
            .unwrap();
    }
    let labels = graph.communities();
    let snap = graph.snapshot();
    let id = |n: &str| snap.resolve(&NodeRef::Tool(tool(n))).unwrap() as usize;
    assert_eq!(labels[id("a")], labels[id("b")]);
    assert_eq!(labels[id("c")], labels[id("d")]);
    assert_ne!(labels[id("a")], labels[id("c")]);
}
