//! Tool/capability hypergraph.
//!
//! Nodes are tools and capabilities held in an arena indexed by stable integer
//! ids; directed weighted edges record observed co-usage, hyperedges record
//! multi-source/multi-target composition. The graph is single-writer (the
//! feedback sink) and many-reader: every write clones the current state,
//! mutates the clone, and publishes it as a new `Arc` snapshot, so readers are
//! never blocked and always observe a consistent graph.

pub mod pathfinder;
pub mod shgat;

use crate::capability::{Capability, ToolId};
use anyhow::{Result, bail};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

pub type NodeId = u32;

const PAGERANK_DAMPING: f64 = 0.85;
const PAGERANK_TOLERANCE: f64 = 1e-6;
const PAGERANK_MAX_ITERATIONS: usize = 100;
const LABEL_PROP_MAX_ITERATIONS: usize = 50;
const MIN_SUCCESS_RATE: f64 = 1e-3;
/// Directed-edge weights live in (0, 1]; observations saturate here.
const MIN_EDGE_WEIGHT: f64 = 0.05;

/// Precomputed per-node feature vector carried by capability nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NodeFeatures {
    pub spectral_cluster: f64,
    pub hypergraph_pagerank: f64,
    pub cooccurrence: f64,
    pub recency: f64,
    pub adamic_adar: f64,
    pub heat_diffusion: f64,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Tool {
        tool_id: ToolId,
        embedding: Vec<f32>,
    },
    Capability {
        capability_id: Uuid,
        code_hash: String,
        embedding: Vec<f32>,
        success_rate: f64,
        features: Option<NodeFeatures>,
    },
}

impl NodeKind {
    pub fn embedding(&self) -> &[f32] {
        match self {
            NodeKind::Tool { embedding, .. } | NodeKind::Capability { embedding, .. } => embedding,
        }
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, NodeKind::Tool { .. })
    }

    pub fn label(&self) -> String {
        match self {
            NodeKind::Tool { tool_id, .. } => tool_id.to_string(),
            NodeKind::Capability { capability_id, .. } => capability_id.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy)]
pub struct DirectedEdge {
    /// Mean observed cost in (0, 1]; lower is stronger.
    pub weight: f64,
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct Hyperedge {
    pub id: String,
    pub sources: BTreeSet<NodeId>,
    pub targets: BTreeSet<NodeId>,
    pub weight: f64,
}

/// Key for node lookup across snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Tool(ToolId),
    Capability(Uuid),
}

/// One executed step reported to `update_from_execution`.
#[derive(Debug, Clone)]
pub struct ObservedStep {
    pub node: NodeRef,
    /// Indices into the observation's `steps` this step depended on.
    pub depends_on: Vec<usize>,
    pub duration_ms: f64,
    pub success: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionObservation {
    pub steps: Vec<ObservedStep>,
}

/// Immutable graph snapshot.
#[derive(Clone, Default)]
pub struct GraphState {
    pub nodes: Vec<Node>,
    index: HashMap<NodeRef, NodeId>,
    edges: BTreeMap<(NodeId, NodeId), DirectedEdge>,
    out_neighbors: HashMap<NodeId, Vec<NodeId>>,
    in_neighbors: HashMap<NodeId, Vec<NodeId>>,
    hyperedges: Vec<Hyperedge>,
    hyperedge_keys: std::collections::HashSet<(Vec<NodeId>, Vec<NodeId>)>,
    version: u64,
}

impl GraphState {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn resolve(&self, node: &NodeRef) -> Option<NodeId> {
        self.index.get(node).copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id as usize)
    }

    pub fn edge(&self, from: NodeId, to: NodeId) -> Option<DirectedEdge> {
        self.edges.get(&(from, to)).copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&(NodeId, NodeId), &DirectedEdge)> {
        self.edges.iter()
    }

    pub fn hyperedges(&self) -> &[Hyperedge] {
        &self.hyperedges
    }

    pub fn out_neighbors(&self, id: NodeId) -> &[NodeId] {
        self.out_neighbors.get(&id).map_or(&[], Vec::as_slice)
    }

    pub fn in_neighbors(&self, id: NodeId) -> &[NodeId] {
        self.in_neighbors.get(&id).map_or(&[], Vec::as_slice)
    }

    /// Undirected degree (distinct in/out neighbors).
    pub fn degree(&self, id: NodeId) -> usize {
        let mut set: BTreeSet<NodeId> = self.out_neighbors(id).iter().copied().collect();
        set.extend(self.in_neighbors(id).iter().copied());
        set.len()
    }

    fn undirected_neighbors(&self, id: NodeId) -> BTreeSet<NodeId> {
        let mut set: BTreeSet<NodeId> = self.out_neighbors(id).iter().copied().collect();
        set.extend(self.in_neighbors(id).iter().copied());
        set
    }

    /// Graph density over ordered pairs.
    pub fn density(&self) -> f64 {
        let n = self.nodes.len();
        if n < 2 {
            return 0.0;
        }
        self.edges.len() as f64 / (n as f64 * (n as f64 - 1.0))
    }

    /// Density-dependent blend factor between semantic and graph scores.
    /// Always within `[0.5, 1.0]`.
    pub fn adaptive_alpha(&self) -> f64 {
        (1.0 - 2.0 * self.density()).max(0.5)
    }

    /// Adamic-Adar affinity between `node` and a target set:
    /// `Σ_{y ∈ targets} Σ_{u ∈ N(x) ∩ N(y)} 1 / ln(1 + deg(u))`.
    pub fn adamic_adar(&self, node: NodeId, targets: &[NodeId]) -> f64 {
        let mine = self.undirected_neighbors(node);
        let mut total = 0.0;
        for &y in targets {
            if y == node {
                continue;
            }
            let theirs = self.undirected_neighbors(y);
            for u in mine.intersection(&theirs) {
                let deg = self.degree(*u);
                let denom = (1.0 + deg as f64).ln();
                if denom > 0.0 {
                    total += 1.0 / denom;
                }
            }
        }
        total
    }

    /// Dijkstra over directed edge weights. Returns the node path and cost.
    pub fn shortest_path(&self, from: NodeId, to: NodeId) -> Option<(Vec<NodeId>, f64)> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        if self.node(from).is_none() || self.node(to).is_none() {
            return None;
        }

        let mut dist: HashMap<NodeId, f64> = HashMap::new();
        let mut prev: HashMap<NodeId, NodeId> = HashMap::new();
        let mut heap: BinaryHeap<(Reverse<OrderedF64>, NodeId)> = BinaryHeap::new();
        dist.insert(from, 0.0);
        heap.push((Reverse(OrderedF64(0.0)), from));

        while let Some((Reverse(cost), node)) = heap.pop() {
            let cost = cost.0;
            if node == to {
                break;
            }
            if cost > dist.get(&node).copied().unwrap_or(f64::INFINITY) {
                continue;
            }
            for &next in self.out_neighbors(node) {
                let Some(edge) = self.edge(node, next) else {
                    continue;
                };
                let candidate = cost + edge.weight;
                if candidate < dist.get(&next).copied().unwrap_or(f64::INFINITY) {
                    dist.insert(next, candidate);
                    prev.insert(next, node);
                    heap.push((Reverse(OrderedF64(candidate)), next));
                }
            }
        }

        let total = *dist.get(&to)?;
        let mut path = vec![to];
        let mut cursor = to;
        while cursor != from {
            cursor = *prev.get(&cursor)?;
            path.push(cursor);
        }
        path.reverse();
        Some((path, total))
    }

    fn compute_pagerank(&self) -> Vec<f64> {
        let n = self.nodes.len();
        if n == 0 {
            return Vec::new();
        }
        let base = (1.0 - PAGERANK_DAMPING) / n as f64;
        let mut ranks = vec![1.0 / n as f64; n];
        for _ in 0..PAGERANK_MAX_ITERATIONS {
            let mut next = vec![base; n];
            for (node, rank) in ranks.iter().enumerate() {
                let out = self.out_neighbors(node as NodeId);
                if out.is_empty() {
                    // Dangling mass is spread uniformly.
                    let share = PAGERANK_DAMPING * rank / n as f64;
                    for slot in &mut next {
                        *slot += share;
                    }
                } else {
                    let share = PAGERANK_DAMPING * rank / out.len() as f64;
                    for &target in out {
                        next[target as usize] += share;
                    }
                }
            }
            let delta: f64 = ranks
                .iter()
                .zip(next.iter())
                .map(|(a, b)| (a - b).abs())
                .sum();
            ranks = next;
            if delta < PAGERANK_TOLERANCE {
                break;
            }
        }
        ranks
    }

    /// Label propagation over the undirected view; edge strength is the
    /// inverse weight so reliable edges pull labels harder.
    fn compute_communities(&self) -> Vec<i64> {
        let n = self.nodes.len();
        let mut labels: Vec<i64> = (0..n as i64).collect();
        if n == 0 {
            return labels;
        }
        for _ in 0..LABEL_PROP_MAX_ITERATIONS {
            let mut changed = false;
            for node in 0..n as NodeId {
                let mut votes: BTreeMap<i64, f64> = BTreeMap::new();
                for &nb in self.out_neighbors(node) {
                    let strength = self.edge(node, nb).map_or(1.0, |e| 1.0 / e.weight.max(1e-6));
                    *votes.entry(labels[nb as usize]).or_insert(0.0) += strength;
                }
                for &nb in self.in_neighbors(node) {
                    let strength = self.edge(nb, node).map_or(1.0, |e| 1.0 / e.weight.max(1e-6));
                    *votes.entry(labels[nb as usize]).or_insert(0.0) += strength;
                }
                if let Some((&best, _)) = votes
                    .iter()
                    .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                {
                    if best != labels[node as usize] {
                        labels[node as usize] = best;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        labels
    }
}

/// Total-ordered f64 wrapper for the Dijkstra heap.
#[derive(PartialEq, PartialOrd)]
struct OrderedF64(f64);

impl Eq for OrderedF64 {}

#[allow(clippy::derive_ord_xor_partial_ord)]
impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.partial_cmp(other).unwrap_or(std::cmp::Ordering::Equal)
    }
}

pub struct Hypergraph {
    state: RwLock<Arc<GraphState>>,
    pagerank_cache: Mutex<Option<(u64, Arc<Vec<f64>>)>>,
    community_cache: Mutex<Option<(u64, Arc<Vec<i64>>)>>,
}

impl Default for Hypergraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypergraph {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(GraphState::default())),
            pagerank_cache: Mutex::new(None),
            community_cache: Mutex::new(None),
        }
    }

    /// Cheap consistent snapshot for readers.
    pub fn snapshot(&self) -> Arc<GraphState> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn mutate(&self, f: impl FnOnce(&mut GraphState) -> Result<()>) -> Result<()> {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let mut next = GraphState::clone(&guard);
        f(&mut next)?;
        next.version = guard.version + 1;
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn ensure_tool(&self, tool_id: &ToolId, embedding: Vec<f32>) -> NodeId {
        let node_ref = NodeRef::Tool(tool_id.clone());
        if let Some(id) = self.snapshot().resolve(&node_ref) {
            return id;
        }
        let mut assigned = 0;
        let _ = self.mutate(|state| {
            assigned = insert_node(
                state,
                node_ref.clone(),
                NodeKind::Tool {
                    tool_id: tool_id.clone(),
                    embedding,
                },
            );
            Ok(())
        });
        assigned
    }

    pub fn ensure_capability(&self, capability: &Capability) -> NodeId {
        let node_ref = NodeRef::Capability(capability.id);
        if let Some(id) = self.snapshot().resolve(&node_ref) {
            return id;
        }
        let mut assigned = 0;
        let _ = self.mutate(|state| {
            assigned = insert_node(
                state,
                node_ref.clone(),
                NodeKind::Capability {
                    capability_id: capability.id,
                    code_hash: capability.code_hash.clone(),
                    embedding: capability.intent_embedding.clone(),
                    success_rate: capability.success_rate,
                    features: None,
                },
            );
            Ok(())
        });
        assigned
    }

    /// Refresh the stored success rate on a capability node.
    pub fn update_capability_stats(&self, capability_id: Uuid, success_rate: f64) {
        let _ = self.mutate(|state| {
            if let Some(id) = state.resolve(&NodeRef::Capability(capability_id)) {
                if let Some(node) = state.nodes.get_mut(id as usize) {
                    if let NodeKind::Capability {
                        success_rate: slot, ..
                    } = &mut node.kind
                    {
                        *slot = success_rate.clamp(0.0, 1.0);
                    }
                }
            }
            Ok(())
        });
    }

    /// Fold one observed execution into the graph: ensure nodes exist, then
    /// strengthen each `depends_on` edge with the running-mean update
    /// `w_new = (w_old·n + w_obs) / (n + 1)`.
    pub fn update_from_execution(&self, observation: &ExecutionObservation) -> Result<()> {
        self.mutate(|state| {
            let mut ids = Vec::with_capacity(observation.steps.len());
            for step in &observation.steps {
                let id = match state.resolve(&step.node) {
                    Some(id) => id,
                    None => match &step.node {
                        NodeRef::Tool(tool_id) => insert_node(
                            state,
                            step.node.clone(),
                            NodeKind::Tool {
                                tool_id: tool_id.clone(),
                                embedding: Vec::new(),
                            },
                        ),
                        NodeRef::Capability(capability_id) => insert_node(
                            state,
                            step.node.clone(),
                            NodeKind::Capability {
                                capability_id: *capability_id,
                                code_hash: String::new(),
                                embedding: Vec::new(),
                                success_rate: 1.0,
                                features: None,
                            },
                        ),
                    },
                };
                ids.push(id);
            }

            for (i, step) in observation.steps.iter().enumerate() {
                let observed = observed_weight(step);
                for &dep in &step.depends_on {
                    let Some(&from) = ids.get(dep) else {
                        bail!("depends_on index {} out of range", dep);
                    };
                    let to = ids[i];
                    if from == to {
                        continue;
                    }
                    strengthen_edge(state, from, to, observed);
                }
            }
            Ok(())
        })?;
        self.invalidate_caches();
        debug!("hypergraph updated from execution ({} steps)", observation.steps.len());
        Ok(())
    }

    /// Add a hyperedge. Duplicate (sources, targets) pairs are rejected;
    /// weight is `1 / max(success_rate, ε)` and therefore strictly positive.
    pub fn add_hyperedge(
        &self,
        id: impl Into<String>,
        sources: BTreeSet<NodeId>,
        targets: BTreeSet<NodeId>,
        success_rate: f64,
    ) -> Result<()> {
        let id = id.into();
        let result = self.mutate(|state| {
            if sources.is_empty() || targets.is_empty() {
                bail!("hyperedge '{}' must have non-empty sources and targets", id);
            }
            for node in sources.iter().chain(targets.iter()) {
                if state.node(*node).is_none() {
                    bail!("hyperedge '{}' references unknown node {}", id, node);
                }
            }
            let key = (
                sources.iter().copied().collect::<Vec<_>>(),
                targets.iter().copied().collect::<Vec<_>>(),
            );
            if state.hyperedge_keys.contains(&key) {
                bail!("duplicate hyperedge over the same sources/targets");
            }
            state.hyperedge_keys.insert(key);
            state.hyperedges.push(Hyperedge {
                id,
                sources,
                targets,
                weight: 1.0 / success_rate.max(MIN_SUCCESS_RATE),
            });
            Ok(())
        });
        self.invalidate_caches();
        result
    }

    pub fn pagerank(&self) -> Arc<Vec<f64>> {
        let snapshot = self.snapshot();
        {
            let cache = self.pagerank_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((version, ranks)) = cache.as_ref() {
                if *version == snapshot.version() {
                    return ranks.clone();
                }
            }
        }
        let ranks = Arc::new(snapshot.compute_pagerank());
        *self.pagerank_cache.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((snapshot.version(), ranks.clone()));
        ranks
    }

    pub fn communities(&self) -> Arc<Vec<i64>> {
        let snapshot = self.snapshot();
        {
            let cache = self.community_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((version, labels)) = cache.as_ref() {
                if *version == snapshot.version() {
                    return labels.clone();
                }
            }
        }
        let labels = Arc::new(snapshot.compute_communities());
        *self.community_cache.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((snapshot.version(), labels.clone()));
        labels
    }

    fn invalidate_caches(&self) {
        *self.pagerank_cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.community_cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn insert_node(state: &mut GraphState, node_ref: NodeRef, kind: NodeKind) -> NodeId {
    if let Some(id) = state.resolve(&node_ref) {
        return id;
    }
    let id = state.nodes.len() as NodeId;
    state.nodes.push(Node { id, kind });
    state.index.insert(node_ref, id);
    id
}

/// Observed cost for one execution step, in `(0, 1]`. Failures count as the
/// maximum cost; successful fast calls approach the floor.
fn observed_weight(step: &ObservedStep) -> f64 {
    if step.success {
        (step.duration_ms / 10_000.0).clamp(MIN_EDGE_WEIGHT, 1.0)
    } else {
        1.0
    }
}

fn strengthen_edge(state: &mut GraphState, from: NodeId, to: NodeId, observed: f64) {
    let entry = state.edges.entry((from, to));
    match entry {
        std::collections::btree_map::Entry::Occupied(mut slot) => {
            let edge = slot.get_mut();
            let n = edge.count as f64;
            edge.weight = ((edge.weight * n + observed) / (n + 1.0)).clamp(MIN_EDGE_WEIGHT, 1.0);
            edge.count += 1;
        }
        std::collections::btree_map::Entry::Vacant(slot) => {
            slot.insert(DirectedEdge {
                weight: observed.clamp(MIN_EDGE_WEIGHT, 1.0),
                count: 1,
            });
            state.out_neighbors.entry(from).or_default().push(to);
            state.in_neighbors.entry(to).or_default().push(from);
        }
    }
}

#[cfg(test)]
mod tests;
