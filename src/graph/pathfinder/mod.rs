//! DR-DSP: shortest-hyperpath search over the tool hypergraph.
//!
//! Generalized Dijkstra: a hyperedge can be crossed only once every node in
//! its source set has been reached, and the cost to reach any of its targets
//! is `max(dist over sources) + edge weight`. Plain directed edges take part
//! as synthesized one-to-one hyperedges so sparse graphs still compose. Ties
//! are broken by lexical hyperedge id.

use super::{GraphState, NodeId};
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;

#[derive(Debug, Clone)]
pub struct HyperpathResult {
    pub found: bool,
    /// Hyperedge ids in traversal order.
    pub path: Vec<String>,
    /// Realized node traversal from source to target. Not necessarily a
    /// simple path.
    pub node_sequence: Vec<NodeId>,
    /// Crossed hyperedges, same order as `path`.
    pub hyperedges: Vec<CrossedHyperedge>,
    pub total_weight: f64,
}

#[derive(Debug, Clone)]
pub struct CrossedHyperedge {
    pub id: String,
    pub sources: Vec<NodeId>,
    pub targets: Vec<NodeId>,
    pub weight: f64,
}

impl HyperpathResult {
    fn not_found() -> Self {
        Self {
            found: false,
            path: Vec::new(),
            node_sequence: Vec::new(),
            hyperedges: Vec::new(),
            total_weight: f64::INFINITY,
        }
    }
}

#[derive(Clone)]
struct CandidateEdge {
    id: String,
    sources: Vec<NodeId>,
    targets: Vec<NodeId>,
    weight: f64,
}

/// Total order for the frontier: cost first, then lexical edge id.
#[derive(PartialEq)]
struct Frontier {
    cost: f64,
    edge_index: usize,
    edge_id: String,
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cost
            .partial_cmp(&other.cost)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.edge_id.cmp(&other.edge_id))
    }
}

pub struct Pathfinder;

impl Pathfinder {
    /// Find the shortest hyperpath from `source` to `target`.
    ///
    /// `found` is false only when the target is unreachable.
    pub fn find_shortest_hyperpath(
        state: &GraphState,
        source: NodeId,
        target: NodeId,
    ) -> HyperpathResult {
        if state.node(source).is_none() || state.node(target).is_none() {
            return HyperpathResult::not_found();
        }
        if source == target {
            return HyperpathResult {
                found: true,
                path: Vec::new(),
                node_sequence: vec![source],
                hyperedges: Vec::new(),
                total_weight: 0.0,
            };
        }

        let edges = collect_edges(state);

        let mut dist: HashMap<NodeId, f64> = HashMap::new();
        // Edge used to first settle each node, for reconstruction.
        let mut parent_edge: HashMap<NodeId, usize> = HashMap::new();
        let mut crossed: BTreeSet<usize> = BTreeSet::new();
        dist.insert(source, 0.0);

        let mut heap: BinaryHeap<Reverse<Frontier>> = BinaryHeap::new();
        push_ready_edges(&edges, &dist, &crossed, &mut heap);

        while let Some(Reverse(frontier)) = heap.pop() {
            let idx = frontier.edge_index;
            if crossed.contains(&idx) {
                continue;
            }
            let edge = &edges[idx];
            let Some(entry_cost) = edge_cost(edge, &dist) else {
                continue;
            };
            // Stale queue entry from before a source got cheaper.
            if (entry_cost - frontier.cost).abs() > 1e-12 && entry_cost > frontier.cost {
                heap.push(Reverse(Frontier {
                    cost: entry_cost,
                    edge_index: idx,
                    edge_id: edge.id.clone(),
                }));
                continue;
            }
            crossed.insert(idx);

            let mut settled_new = false;
            for &t in &edge.targets {
                let current = dist.get(&t).copied().unwrap_or(f64::INFINITY);
                if entry_cost < current {
                    dist.insert(t, entry_cost);
                    parent_edge.insert(t, idx);
                    settled_new = true;
                }
            }
            if settled_new {
                if dist.contains_key(&target) {
                    // Dijkstra admissibility: the first settle is optimal only
                    // once no cheaper frontier remains; keep draining equal
                    // costs but stop expanding past the target cost.
                    let target_cost = dist[&target];
                    if heap
                        .peek()
                        .map_or(true, |Reverse(f)| f.cost >= target_cost)
                    {
                        break;
                    }
                }
                push_ready_edges(&edges, &dist, &crossed, &mut heap);
            }
        }

        let Some(&total_weight) = dist.get(&target) else {
            return HyperpathResult::not_found();
        };

        // Reconstruct by walking parent edges back from the target through
        // each edge's binding source (the one realizing the max distance).
        let mut rev_edges: Vec<usize> = Vec::new();
        let mut node_sequence = vec![target];
        let mut cursor = target;
        while cursor != source {
            let Some(&edge_idx) = parent_edge.get(&cursor) else {
                break;
            };
            rev_edges.push(edge_idx);
            let edge = &edges[edge_idx];
            let binding = edge
                .sources
                .iter()
                .max_by(|a, b| {
                    let da = dist.get(a).copied().unwrap_or(0.0);
                    let db = dist.get(b).copied().unwrap_or(0.0);
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
                .copied()
                .unwrap_or(source);
            node_sequence.push(binding);
            cursor = binding;
        }
        node_sequence.reverse();
        rev_edges.reverse();

        let hyperedges: Vec<CrossedHyperedge> = rev_edges
            .iter()
            .map(|&i| CrossedHyperedge {
                id: edges[i].id.clone(),
                sources: edges[i].sources.clone(),
                targets: edges[i].targets.clone(),
                weight: edges[i].weight,
            })
            .collect();

        HyperpathResult {
            found: true,
            path: hyperedges.iter().map(|e| e.id.clone()).collect(),
            node_sequence,
            hyperedges,
            total_weight,
        }
    }
}

fn collect_edges(state: &GraphState) -> Vec<CandidateEdge> {
    let mut edges: Vec<CandidateEdge> = state
        .hyperedges()
        .iter()
        .map(|he| CandidateEdge {
            id: he.id.clone(),
            sources: he.sources.iter().copied().collect(),
            targets: he.targets.iter().copied().collect(),
            weight: he.weight,
        })
        .collect();
    for (&(from, to), edge) in state.edges() {
        edges.push(CandidateEdge {
            id: format!("edge:{from}->{to}"),
            sources: vec![from],
            targets: vec![to],
            weight: edge.weight,
        });
    }
    edges
}

/// Cost to cross an edge: `max(dist[s])` over its sources plus its weight.
/// None while any source is unreached.
fn edge_cost(edge: &CandidateEdge, dist: &HashMap<NodeId, f64>) -> Option<f64> {
    let mut max = 0.0f64;
    for s in &edge.sources {
        max = max.max(*dist.get(s)?);
    }
    Some(max + edge.weight)
}

fn push_ready_edges(
    edges: &[CandidateEdge],
    dist: &HashMap<NodeId, f64>,
    crossed: &BTreeSet<usize>,
    heap: &mut BinaryHeap<Reverse<Frontier>>,
) {
    for (idx, edge) in edges.iter().enumerate() {
        if crossed.contains(&idx) {
            continue;
        }
        if let Some(cost) = edge_cost(edge, dist) {
            heap.push(Reverse(Frontier {
                cost,
                edge_index: idx,
                edge_id: edge.id.clone(),
            }));
        }
    }
}

#[cfg(test)]
mod tests;
