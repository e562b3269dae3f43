//! SHGAT: multi-head graph-attention scorer over the hypergraph.
//!
//! Each head projects `concat(intent, node, neighborhood)` through a fixed
//! random feature map and scores it with a trained head vector; the final
//! score mixes heads through a learned softmax, adds a one-hop recursive
//! contribution through the node's strongest edges, and (for capabilities) a
//! reliability term from the stored success rate. All scores land in [0, 1].
//!
//! Scoring is lock-free with respect to training: weights are an immutable
//! `Arc` snapshot, and `train_on_episodes` publishes a new snapshot atomically
//! when it finishes.

use super::{GraphState, Hypergraph, NodeId, NodeKind, NodeRef};
use crate::capability::ToolId;
use crate::utils::math::{clamp_unit, cosine_similarity, sigmoid};
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_NUM_HEADS: usize = 4;
pub const DEFAULT_HIDDEN_DIM: usize = 64;

/// Share of the final capability score taken by each term.
const ATTENTION_COEFF: f64 = 0.65;
const RECURSIVE_COEFF: f64 = 0.10;
const RELIABILITY_COEFF: f64 = 0.25;
/// Strongest-edge fan-out for the recursive contribution and the
/// neighborhood summary.
const MAX_NEIGHBORS: usize = 8;
const WEIGHT_INIT_SEED: u64 = 0x7001_5eed;

#[derive(Debug, Clone, Copy)]
pub struct ShgatConfig {
    pub num_heads: usize,
    pub hidden_dim: usize,
    pub embedding_dim: usize,
}

impl ShgatConfig {
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            num_heads: DEFAULT_NUM_HEADS,
            hidden_dim: DEFAULT_HIDDEN_DIM,
            embedding_dim,
        }
    }

    fn input_dim(&self) -> usize {
        self.embedding_dim * 3
    }
}

/// Trainable state. `projections` are fixed random feature maps (one per
/// head); `head_vectors` and `mix_logits` are what gradient descent updates.
#[derive(Debug, Clone)]
pub struct ShgatWeights {
    projections: Vec<Vec<f64>>,
    head_vectors: Vec<Vec<f64>>,
    mix_logits: Vec<f64>,
}

impl ShgatWeights {
    fn init(config: &ShgatConfig) -> Self {
        let mut rng = fastrand::Rng::with_seed(WEIGHT_INIT_SEED);
        let mut rand_vec = |len: usize| -> Vec<f64> {
            (0..len).map(|_| rng.f64() * 0.2 - 0.1).collect()
        };
        Self {
            projections: (0..config.num_heads)
                .map(|_| rand_vec(config.hidden_dim * config.input_dim()))
                .collect(),
            head_vectors: (0..config.num_heads)
                .map(|_| rand_vec(config.hidden_dim))
                .collect(),
            mix_logits: vec![0.0; config.num_heads],
        }
    }

    fn head_weights(&self) -> Vec<f64> {
        crate::utils::math::softmax_with_temperature(&self.mix_logits, 1.0)
    }
}

/// Per-capability scoring breakdown.
#[derive(Debug, Clone)]
pub struct CapabilityScore {
    pub capability_id: Uuid,
    pub code_hash: String,
    pub score: f64,
    pub head_scores: Vec<f64>,
    pub head_weights: Vec<f64>,
    pub recursive_contribution: f64,
    pub feature_contributions: Option<super::NodeFeatures>,
}

#[derive(Debug, Clone)]
pub struct ToolScore {
    pub tool_id: ToolId,
    pub score: f64,
}

/// One labeled scoring episode for the trainer.
#[derive(Debug, Clone)]
pub struct TrainingExample {
    pub intent_embedding: Vec<f32>,
    pub context_tools: Vec<ToolId>,
    pub candidate: NodeRef,
    /// 1.0 = execution succeeded/accepted, 0.0 = failed/rejected.
    pub outcome: f64,
}

pub struct ShgatScorer {
    config: ShgatConfig,
    graph: Arc<Hypergraph>,
    weights: RwLock<Arc<ShgatWeights>>,
}

impl ShgatScorer {
    pub fn new(graph: Arc<Hypergraph>, config: ShgatConfig) -> Self {
        let weights = ShgatWeights::init(&config);
        Self {
            config,
            graph,
            weights: RwLock::new(Arc::new(weights)),
        }
    }

    fn weights_snapshot(&self) -> Arc<ShgatWeights> {
        self.weights.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Score every capability node against the intent, descending.
    pub fn score_all_capabilities(&self, intent: &[f32]) -> Vec<CapabilityScore> {
        let snapshot = self.graph.snapshot();
        let weights = self.weights_snapshot();
        let head_weights = weights.head_weights();

        let mut scores: Vec<CapabilityScore> = snapshot
            .nodes
            .iter()
            .filter_map(|node| {
                let NodeKind::Capability {
                    capability_id,
                    code_hash,
                    success_rate,
                    features,
                    ..
                } = &node.kind
                else {
                    return None;
                };
                let head_scores = self.head_scores(&snapshot, &weights, intent, node.id);
                let attention: f64 = head_scores
                    .iter()
                    .zip(head_weights.iter())
                    .map(|(s, w)| s * w)
                    .sum();
                let recursive = self.recursive_contribution(&snapshot, intent, node.id);
                let score = clamp_unit(
                    ATTENTION_COEFF * attention
                        + RECURSIVE_COEFF * recursive
                        + RELIABILITY_COEFF * success_rate,
                );
                Some(CapabilityScore {
                    capability_id: *capability_id,
                    code_hash: code_hash.clone(),
                    score,
                    head_scores,
                    head_weights: head_weights.clone(),
                    recursive_contribution: recursive,
                    feature_contributions: *features,
                })
            })
            .collect();
        scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scores
    }

    /// Score every tool node against the intent, descending. When context
    /// tools are supplied, graph affinity to that set is blended in via the
    /// graph's adaptive alpha; otherwise normalized PageRank fills that slot.
    pub fn score_all_tools(&self, intent: &[f32], context_tools: Option<&[ToolId]>) -> Vec<ToolScore> {
        let snapshot = self.graph.snapshot();
        let weights = self.weights_snapshot();
        let head_weights = weights.head_weights();
        let alpha = snapshot.adaptive_alpha();

        let context_ids: Vec<NodeId> = context_tools
            .unwrap_or(&[])
            .iter()
            .filter_map(|t| snapshot.resolve(&NodeRef::Tool(t.clone())))
            .collect();

        let pagerank = self.graph.pagerank();
        let max_rank = pagerank.iter().copied().fold(f64::MIN_POSITIVE, f64::max);

        let mut scores: Vec<ToolScore> = snapshot
            .nodes
            .iter()
            .filter_map(|node| {
                let NodeKind::Tool { tool_id, .. } = &node.kind else {
                    return None;
                };
                let head_scores = self.head_scores(&snapshot, &weights, intent, node.id);
                let attention: f64 = head_scores
                    .iter()
                    .zip(head_weights.iter())
                    .map(|(s, w)| s * w)
                    .sum();
                let recursive = self.recursive_contribution(&snapshot, intent, node.id);
                let semantic = clamp_unit((1.0 - RECURSIVE_COEFF) * attention + RECURSIVE_COEFF * recursive);

                let graph_signal = if context_ids.is_empty() {
                    pagerank.get(node.id as usize).copied().unwrap_or(0.0) / max_rank
                } else {
                    let aa = snapshot.adamic_adar(node.id, &context_ids);
                    aa / (1.0 + aa)
                };
                let score = clamp_unit(alpha * semantic + (1.0 - alpha) * graph_signal);
                Some(ToolScore {
                    tool_id: tool_id.clone(),
                    score,
                })
            })
            .collect();
        scores.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scores
    }

    /// Gradient descent on binary cross-entropy over the attention mix.
    ///
    /// Runs on a cloned weight buffer and publishes the result atomically;
    /// concurrent scorers keep reading the previous snapshot.
    pub fn train_on_episodes(&self, examples: &[TrainingExample], epochs: usize, learning_rate: f64) {
        if examples.is_empty() {
            return;
        }
        let snapshot = self.graph.snapshot();
        let mut weights = ShgatWeights::clone(&self.weights_snapshot());

        for _ in 0..epochs {
            for example in examples {
                let Some(node_id) = snapshot.resolve(&example.candidate) else {
                    continue;
                };
                let x = self.attention_input(&snapshot, &example.intent_embedding, node_id);
                let head_weights = weights.head_weights();

                // Forward pass, keeping hidden activations for the backward step.
                let mut hiddens = Vec::with_capacity(self.config.num_heads);
                let mut head_scores = Vec::with_capacity(self.config.num_heads);
                for h in 0..self.config.num_heads {
                    let hidden = project(&weights.projections[h], &x, self.config.hidden_dim);
                    let z: f64 = weights.head_vectors[h]
                        .iter()
                        .zip(hidden.iter())
                        .map(|(v, a)| v * a)
                        .sum();
                    head_scores.push(sigmoid(z));
                    hiddens.push(hidden);
                }
                let pred: f64 = head_scores
                    .iter()
                    .zip(head_weights.iter())
                    .map(|(s, w)| s * w)
                    .sum();

                // dL/dpred for BCE with sigmoid-mixed output.
                let err = pred - example.outcome;
                for h in 0..self.config.num_heads {
                    let ds = err * head_weights[h] * head_scores[h] * (1.0 - head_scores[h]);
                    for (v, a) in weights.head_vectors[h].iter_mut().zip(hiddens[h].iter()) {
                        *v -= learning_rate * ds * a;
                    }
                    let dm = err * head_weights[h] * (head_scores[h] - pred);
                    weights.mix_logits[h] -= learning_rate * dm;
                }
            }
        }

        *self.weights.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(weights);
        debug!("shgat weights updated from {} examples", examples.len());
    }

    fn head_scores(
        &self,
        snapshot: &GraphState,
        weights: &ShgatWeights,
        intent: &[f32],
        node_id: NodeId,
    ) -> Vec<f64> {
        let x = self.attention_input(snapshot, intent, node_id);
        (0..self.config.num_heads)
            .map(|h| {
                let hidden = project(&weights.projections[h], &x, self.config.hidden_dim);
                let z: f64 = weights.head_vectors[h]
                    .iter()
                    .zip(hidden.iter())
                    .map(|(v, a)| v * a)
                    .sum();
                sigmoid(z)
            })
            .collect()
    }

    /// `concat(intent, node_emb, neighborhood_summary)`, padded/truncated to
    /// the configured embedding dimension.
    fn attention_input(&self, snapshot: &GraphState, intent: &[f32], node_id: NodeId) -> Vec<f64> {
        let dim = self.config.embedding_dim;
        let node_emb = snapshot
            .node(node_id)
            .map(|n| n.kind.embedding().to_vec())
            .unwrap_or_default();
        let neighborhood = self.neighborhood_summary(snapshot, node_id);

        let mut x = Vec::with_capacity(dim * 3);
        for source in [intent, node_emb.as_slice(), neighborhood.as_slice()] {
            for i in 0..dim {
                x.push(f64::from(source.get(i).copied().unwrap_or(0.0)));
            }
        }
        x
    }

    /// Mean embedding over the strongest-edge neighbors.
    fn neighborhood_summary(&self, snapshot: &GraphState, node_id: NodeId) -> Vec<f32> {
        let neighbors = strongest_neighbors(snapshot, node_id, MAX_NEIGHBORS);
        if neighbors.is_empty() {
            return Vec::new();
        }
        let dim = self.config.embedding_dim;
        let mut sum = vec![0.0f32; dim];
        let mut counted = 0usize;
        for nb in &neighbors {
            let emb = snapshot.node(*nb).map(|n| n.kind.embedding()).unwrap_or(&[]);
            if emb.is_empty() {
                continue;
            }
            for i in 0..dim.min(emb.len()) {
                sum[i] += emb[i];
            }
            counted += 1;
        }
        if counted == 0 {
            return Vec::new();
        }
        for v in &mut sum {
            *v /= counted as f32;
        }
        sum
    }

    /// One-hop propagation through the strongest edges: how similar are the
    /// best-connected neighbors to the intent.
    fn recursive_contribution(&self, snapshot: &GraphState, intent: &[f32], node_id: NodeId) -> f64 {
        let neighbors = strongest_neighbors(snapshot, node_id, 3);
        if neighbors.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        let mut counted = 0usize;
        for nb in neighbors {
            let emb = snapshot.node(nb).map(|n| n.kind.embedding()).unwrap_or(&[]);
            if emb.is_empty() {
                continue;
            }
            total += clamp_unit(f64::from(cosine_similarity(intent, emb)));
            counted += 1;
        }
        if counted == 0 { 0.0 } else { total / counted as f64 }
    }
}

/// Neighbors sorted by ascending edge weight (strongest first), in then out.
fn strongest_neighbors(snapshot: &GraphState, node_id: NodeId, limit: usize) -> Vec<NodeId> {
    let mut weighted: Vec<(f64, NodeId)> = Vec::new();
    for &nb in snapshot.out_neighbors(node_id) {
        if let Some(edge) = snapshot.edge(node_id, nb) {
            weighted.push((edge.weight, nb));
        }
    }
    for &nb in snapshot.in_neighbors(node_id) {
        if let Some(edge) = snapshot.edge(nb, node_id) {
            weighted.push((edge.weight, nb));
        }
    }
    weighted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut seen = std::collections::HashSet::new();
    weighted
        .into_iter()
        .filter(|(_, nb)| seen.insert(*nb))
        .take(limit)
        .map(|(_, nb)| nb)
        .collect()
}

fn project(projection: &[f64], x: &[f64], hidden_dim: usize) -> Vec<f64> {
    let input_dim = x.len();
    (0..hidden_dim)
        .map(|row| {
            let offset = row * input_dim;
            let z: f64 = projection[offset..offset + input_dim]
                .iter()
                .zip(x.iter())
                .map(|(w, v)| w * v)
                .sum();
            z.tanh()
        })
        .collect()
}

#[cfg(test)]
mod tests;
