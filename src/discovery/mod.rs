//! Discovery: intent → ranked candidates → DAG suggestion.
//!
//! The intent is encoded exactly once; capabilities and tools are scored by
//! SHGAT against that embedding. A single candidate above the good-match
//! threshold becomes a one-task DAG; otherwise DR-DSP tries to compose a
//! hyperpath between the two best tools. Merged results carry both the raw
//! semantic score and a temperature-softmax relative probability.

use crate::capability::{CapabilityStore, ToolId};
use crate::config::DiscoveryConfig;
use crate::embedding::EmbeddingFacade;
use crate::errors::{GatewayError, GatewayResult};
use crate::executor::{Dag, Replanner, Task};
use crate::graph::pathfinder::Pathfinder;
use crate::graph::shgat::ShgatScorer;
use crate::graph::{Hypergraph, NodeKind, NodeRef};
use crate::utils::math::softmax_with_temperature;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const SOFTMAX_TEMPERATURE: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryFilter {
    Tool,
    Capability,
    #[default]
    All,
}

impl DiscoveryFilter {
    fn wants_tools(self) -> bool {
        matches!(self, DiscoveryFilter::Tool | DiscoveryFilter::All)
    }

    fn wants_capabilities(self) -> bool {
        matches!(self, DiscoveryFilter::Capability | DiscoveryFilter::All)
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub intent: String,
    pub filter: DiscoveryFilter,
    pub limit: usize,
    pub min_score: f64,
}

impl DiscoveryRequest {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            filter: DiscoveryFilter::All,
            limit: 10,
            min_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionOrigin {
    Capability,
    Tool,
    ComposedPath,
}

/// Executable plan for the intent plus the decision inputs derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagSuggestion {
    pub dag: Dag,
    pub confidence: f64,
    pub can_speculate: bool,
    pub origin: SuggestionOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryItem {
    /// ToolId or capability FQDN.
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: DiscoveryItemType,
    /// Raw SHGAT score.
    pub semantic_score: f64,
    /// Temperature-softmax share among the returned items.
    pub probability: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryItemType {
    Tool,
    Capability,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryOutcome {
    pub items: Vec<DiscoveryItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<DagSuggestion>,
}

pub struct DiscoveryService {
    facade: Arc<EmbeddingFacade>,
    scorer: Arc<ShgatScorer>,
    graph: Arc<Hypergraph>,
    store: Arc<CapabilityStore>,
    config: DiscoveryConfig,
}

impl DiscoveryService {
    pub fn new(
        facade: Arc<EmbeddingFacade>,
        scorer: Arc<ShgatScorer>,
        graph: Arc<Hypergraph>,
        store: Arc<CapabilityStore>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            facade,
            scorer,
            graph,
            store,
            config,
        }
    }

    pub async fn discover(&self, request: &DiscoveryRequest) -> GatewayResult<DiscoveryOutcome> {
        if request.intent.trim().is_empty() {
            return Err(GatewayError::InvalidParams("intent must not be empty".into()));
        }
        let limit = request.limit.clamp(1, self.config.result_limit);

        // One encode per intent; everything downstream reuses this vector.
        let embedding = self
            .facade
            .encode(&request.intent)
            .await
            .map_err(GatewayError::Internal)?;

        let capabilities = if request.filter.wants_capabilities() {
            self.scorer.score_all_capabilities(&embedding)
        } else {
            Vec::new()
        };
        let tools = if request.filter.wants_tools() {
            self.scorer.score_all_tools(&embedding, None)
        } else {
            Vec::new()
        };

        let best_cap_score = capabilities.first().map_or(0.0, |c| c.score);
        let best_tool_score = tools.first().map_or(0.0, |t| t.score);

        let has_candidates = !capabilities.is_empty() || !tools.is_empty();
        let suggestion = if has_candidates
            && best_cap_score.max(best_tool_score) >= self.config.good_match_threshold
        {
            if !capabilities.is_empty() && best_cap_score >= best_tool_score {
                self.single_capability_suggestion(&capabilities[0])?
            } else {
                tools
                    .first()
                    .map(|t| single_tool_suggestion(&t.tool_id, best_tool_score))
            }
        } else {
            self.composed_suggestion(&tools)
        };

        // Merge, rank, truncate, then normalize into relative probabilities.
        let mut items: Vec<DiscoveryItem> = Vec::new();
        for cap in &capabilities {
            let Some(stored) = self.store.find_by_code_hash(&cap.code_hash)? else {
                continue;
            };
            items.push(DiscoveryItem {
                name: stored.fqdn.to_string(),
                item_type: DiscoveryItemType::Capability,
                semantic_score: cap.score,
                probability: 0.0,
                success_rate: Some(stored.success_rate),
            });
        }
        for tool in &tools {
            items.push(DiscoveryItem {
                name: tool.tool_id.to_string(),
                item_type: DiscoveryItemType::Tool,
                semantic_score: tool.score,
                probability: 0.0,
                success_rate: None,
            });
        }
        items.retain(|i| i.semantic_score >= request.min_score);
        items.sort_by(|a, b| {
            b.semantic_score
                .partial_cmp(&a.semantic_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        items.truncate(limit);

        let scores: Vec<f64> = items.iter().map(|i| i.semantic_score).collect();
        let probabilities = softmax_with_temperature(&scores, SOFTMAX_TEMPERATURE);
        for (item, p) in items.iter_mut().zip(probabilities) {
            item.probability = p;
        }

        debug!(
            "discovery for '{}': {} items, suggestion={:?}",
            request.intent,
            items.len(),
            suggestion.as_ref().map(|s| s.origin)
        );
        Ok(DiscoveryOutcome { items, suggestion })
    }

    fn single_capability_suggestion(
        &self,
        cap: &crate::graph::shgat::CapabilityScore,
    ) -> GatewayResult<Option<DagSuggestion>> {
        let Some(stored) = self.store.find_by_code_hash(&cap.code_hash)? else {
            return Ok(None);
        };
        let can_speculate = cap.score >= self.config.speculation_score
            && stored.success_rate >= self.config.speculation_success_rate;
        let task = Task::capability("task_0", stored.fqdn.to_string());
        Ok(Some(DagSuggestion {
            dag: Dag::new(vec![task]),
            confidence: cap.score,
            can_speculate,
            origin: SuggestionOrigin::Capability,
        }))
    }

    /// No single good match: try a hyperpath between the two best tools that
    /// clear the composition floor.
    fn composed_suggestion(
        &self,
        tools: &[crate::graph::shgat::ToolScore],
    ) -> Option<DagSuggestion> {
        let eligible: Vec<_> = tools
            .iter()
            .filter(|t| t.score >= self.config.composition_floor)
            .take(2)
            .collect();
        let [first, second] = eligible.as_slice() else {
            return None;
        };

        let snapshot = self.graph.snapshot();
        let from = snapshot.resolve(&NodeRef::Tool(first.tool_id.clone()))?;
        let to = snapshot.resolve(&NodeRef::Tool(second.tool_id.clone()))?;
        let result = Pathfinder::find_shortest_hyperpath(&snapshot, from, to);
        if !result.found || result.node_sequence.len() < 2 {
            return None;
        }

        let tasks: Vec<Task> = result
            .node_sequence
            .iter()
            .enumerate()
            .filter_map(|(i, node_id)| {
                let node = snapshot.node(*node_id)?;
                let NodeKind::Tool { tool_id, .. } = &node.kind else {
                    return None;
                };
                Some(Task::tool(format!("task_{i}"), tool_id.to_string()))
            })
            .collect();
        if tasks.len() < 2 {
            return None;
        }

        let confidence = (first.score + second.score) / 2.0;
        info!(
            "composed {}-step path {} -> {} (total weight {:.3})",
            tasks.len(),
            first.tool_id,
            second.tool_id,
            result.total_weight
        );
        Some(DagSuggestion {
            dag: Dag::sequential(tasks),
            confidence,
            can_speculate: false,
            origin: SuggestionOrigin::ComposedPath,
        })
    }
}

fn single_tool_suggestion(tool_id: &ToolId, score: f64) -> DagSuggestion {
    DagSuggestion {
        dag: Dag::new(vec![Task::tool("task_0", tool_id.to_string())]),
        confidence: score,
        can_speculate: false,
        origin: SuggestionOrigin::Tool,
    }
}

#[async_trait]
impl Replanner for DiscoveryService {
    /// Replanning is discovery over the new requirement; the produced tasks
    /// are appended downstream by the executor.
    async fn replan(
        &self,
        new_requirement: &str,
        _available_context: Option<&serde_json::Value>,
    ) -> GatewayResult<Vec<Task>> {
        let request = DiscoveryRequest {
            intent: new_requirement.to_string(),
            filter: DiscoveryFilter::All,
            limit: 5,
            min_score: 0.0,
        };
        let outcome = self.discover(&request).await?;
        Ok(outcome.suggestion.map(|s| s.dag.tasks).unwrap_or_default())
    }
}
