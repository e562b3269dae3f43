use super::*;
use crate::capability::ToolId;
use crate::graph::{ExecutionObservation, Hypergraph, NodeRef, ObservedStep};
use std::collections::BTreeSet;

fn tool(name: &str) -> ToolId {
    ToolId::new("t", name)
}

fn observe_chain(graph: &Hypergraph, names: &[&str], duration_ms: f64) {
    let steps: Vec<ObservedStep> = names
        .iter()
        .enumerate()
        .map(|(i, n)| ObservedStep {
            node: NodeRef::Tool(tool(n)),
            depends_on: if i == 0 { vec![] } else { vec![i - 1] },
            duration_ms,
            success: true,
        })
        .collect();
    graph
        .update_from_execution(&ExecutionObservation { steps })
        .unwrap();
}

#[test]
fn test_simple_edge_path() {
    let graph = Hypergraph::new();
    observe_chain(&graph, &["read", "post"], 1000.0);
    let snap = graph.snapshot();
    let read = snap.resolve(&NodeRef::Tool(tool("read"))).unwrap();
    let post = snap.resolve(&NodeRef::Tool(tool("post"))).unwrap();

    let result = Pathfinder::find_shortest_hyperpath(&snap, read, post);
    assert!(result.found);
    assert_eq!(result.node_sequence, vec![read, post]);
    assert_eq!(result.path.len(), 1);
    assert!((result.total_weight - 0.1).abs() < 1e-9);
}

#[test]
fn test_unreachable_target() {
    let graph = Hypergraph::new();
    let a = graph.ensure_tool(&tool("a"), vec![]);
    let b = graph.ensure_tool(&tool("b"), vec![]);
    let result = Pathfinder::find_shortest_hyperpath(&graph.snapshot(), a, b);
    assert!(!result.found);
    assert!(result.node_sequence.is_empty());
    assert!(result.total_weight.is_infinite());
}

#[test]
fn test_source_equals_target() {
    let graph = Hypergraph::new();
    let a = graph.ensure_tool(&tool("a"), vec![]);
    let result = Pathfinder::find_shortest_hyperpath(&graph.snapshot(), a, a);
    assert!(result.found);
    assert_eq!(result.node_sequence, vec![a]);
    assert_eq!(result.total_weight, 0.0);
}

#[test]
fn test_prefers_cheaper_multi_hop() {
    let graph = Hypergraph::new();
    // a -> b -> c fast (0.05 floor each), a -> c slow (1.0 via failure).
    observe_chain(&graph, &["a", "b", "c"], 100.0);
    graph
        .update_from_execution(&ExecutionObservation {
            steps: vec![
                ObservedStep {
                    node: NodeRef::Tool(tool("a")),
                    depends_on: vec![],
                    duration_ms: 10.0,
                    success: true,
                },
                ObservedStep {
                    node: NodeRef::Tool(tool("c")),
                    depends_on: vec![0],
                    duration_ms: 10.0,
                    success: false,
                },
            ],
        })
        .unwrap();

    let snap = graph.snapshot();
    let a = snap.resolve(&NodeRef::Tool(tool("a"))).unwrap();
    let b = snap.resolve(&NodeRef::Tool(tool("b"))).unwrap();
    let c = snap.resolve(&NodeRef::Tool(tool("c"))).unwrap();

    let result = Pathfinder::find_shortest_hyperpath(&snap, a, c);
    assert!(result.found);
    assert_eq!(result.node_sequence, vec![a, b, c]);
    assert!((result.total_weight - 0.1).abs() < 1e-9);
}

#[test]
fn test_hyperedge_requires_all_sources() {
    let graph = Hypergraph::new();
    let a = graph.ensure_tool(&tool("a"), vec![]);
    let b = graph.ensure_tool(&tool("b"), vec![]);
    let c = graph.ensure_tool(&tool("c"), vec![]);

    // Hyperedge {a, b} -> {c}: unusable from a alone.
    let sources: BTreeSet<_> = [a, b].into_iter().collect();
    let targets: BTreeSet<_> = [c].into_iter().collect();
    graph.add_hyperedge("he-ab-c", sources, targets, 1.0).unwrap();

    let snap = graph.snapshot();
    let from_a = Pathfinder::find_shortest_hyperpath(&snap, a, c);
    assert!(!from_a.found);

    // Once b is reachable from a, the hyperedge opens up.
    observe_chain(&graph, &["a", "b"], 1000.0);
    let snap = graph.snapshot();
    let result = Pathfinder::find_shortest_hyperpath(&snap, a, c);
    assert!(result.found);
    assert_eq!(*result.node_sequence.last().unwrap(), c);
    // Cost: max(dist a=0, dist b=0.1) + hyperedge weight 1.0.
    assert!((result.total_weight - 1.1).abs() < 1e-9);
    assert_eq!(result.path.last().unwrap(), "he-ab-c");
}

#[test]
fn test_tie_break_is_lexical_on_edge_id() {
    let graph = Hypergraph::new();
    let a = graph.ensure_tool(&tool("a"), vec![]);
    let b = graph.ensure_tool(&tool("b"), vec![]);
    let src: BTreeSet<_> = [a].into_iter().collect();
    let dst: BTreeSet<_> = [b].into_iter().collect();
    graph.add_hyperedge("he-zzz", src.clone(), dst.clone(), 0.5).unwrap();
    // Same endpoints not allowed twice; give the second a superset target.
    let c = graph.ensure_tool(&tool("c"), vec![]);
    let dst2: BTreeSet<_> = [b, c].into_iter().collect();
    graph.add_hyperedge("he-aaa", src, dst2, 0.5).unwrap();

    let result = Pathfinder::find_shortest_hyperpath(&graph.snapshot(), a, b);
    assert!(result.found);
    // Equal costs: the lexically smaller id wins.
    assert_eq!(result.path, vec!["he-aaa".to_string()]);
}
