//! Gateway decision: map (suggestion, confidence, thresholds) onto an
//! execution mode, with a safety predicate that can force explicit approval
//! regardless of confidence.

use crate::config::SafetyConfig;
use crate::executor::Dag;
use crate::threshold::Thresholds;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionDecision {
    ExplicitRequired,
    Suggestion,
    SpeculativeExecution,
}

impl ExecutionDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionDecision::ExplicitRequired => "explicit_required",
            ExecutionDecision::Suggestion => "suggestion",
            ExecutionDecision::SpeculativeExecution => "speculative_execution",
        }
    }
}

/// Why a DAG was forced to explicit approval.
#[derive(Debug, Clone)]
pub struct SafetyMatch {
    pub task_id: String,
    pub pattern: String,
    pub matched_text: String,
}

/// Regex safety predicate over task call names and argument values.
pub struct SafetyPredicate {
    patterns: Vec<Regex>,
    raw: Vec<String>,
}

impl SafetyPredicate {
    pub fn from_config(config: &SafetyConfig) -> Self {
        let mut patterns = Vec::new();
        let mut raw = Vec::new();
        for source in &config.patterns {
            match Regex::new(source) {
                Ok(regex) => {
                    patterns.push(regex);
                    raw.push(source.clone());
                }
                Err(e) => warn!("invalid safety pattern '{}': {}", source, e),
            }
        }
        Self { patterns, raw }
    }

    /// First safety match across the DAG, if any.
    pub fn check(&self, dag: &Dag) -> Option<SafetyMatch> {
        for task in &dag.tasks {
            let mut haystacks = vec![task.call_name.clone()];
            for value in task.arguments.values() {
                haystacks.push(value.to_string());
            }
            for haystack in &haystacks {
                for (regex, raw) in self.patterns.iter().zip(self.raw.iter()) {
                    if let Some(found) = regex.find(haystack) {
                        return Some(SafetyMatch {
                            task_id: task.id.clone(),
                            pattern: raw.clone(),
                            matched_text: found.as_str().to_string(),
                        });
                    }
                }
            }
        }
        None
    }
}

pub struct DecisionEngine {
    predicate: SafetyPredicate,
    speculative_enabled: bool,
}

impl DecisionEngine {
    pub fn new(config: &SafetyConfig) -> Self {
        Self {
            predicate: SafetyPredicate::from_config(config),
            speculative_enabled: config.speculative_enabled,
        }
    }

    /// Decide the execution mode for a suggested DAG.
    ///
    /// Safety matches dominate everything else. Otherwise the confidence is
    /// compared against the context's thresholds, with speculation allowed
    /// only when both discovery (`can_speculate`) and configuration agree.
    pub fn decide(
        &self,
        dag: &Dag,
        confidence: f64,
        can_speculate: bool,
        thresholds: Thresholds,
    ) -> (ExecutionDecision, Option<SafetyMatch>) {
        if let Some(matched) = self.predicate.check(dag) {
            debug!(
                "safety predicate forced explicit approval (task {}, pattern {})",
                matched.task_id, matched.pattern
            );
            return (ExecutionDecision::ExplicitRequired, Some(matched));
        }

        let decision = if confidence < thresholds.explicit {
            ExecutionDecision::ExplicitRequired
        } else if confidence < thresholds.suggestion {
            ExecutionDecision::Suggestion
        } else if self.speculative_enabled && can_speculate {
            ExecutionDecision::SpeculativeExecution
        } else {
            ExecutionDecision::Suggestion
        };
        (decision, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Task;

    fn thresholds() -> Thresholds {
        Thresholds {
            explicit: 0.50,
            suggestion: 0.70,
        }
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(&SafetyConfig::default())
    }

    fn dag_for(call_name: &str) -> Dag {
        Dag::new(vec![Task::tool("task_0", call_name)])
    }

    #[test]
    fn low_confidence_requires_explicit() {
        let (decision, _) = engine().decide(&dag_for("fs:read"), 0.3, true, thresholds());
        assert_eq!(decision, ExecutionDecision::ExplicitRequired);
    }

    #[test]
    fn mid_confidence_suggests() {
        let (decision, _) = engine().decide(&dag_for("fs:read"), 0.62, false, thresholds());
        assert_eq!(decision, ExecutionDecision::Suggestion);
    }

    #[test]
    fn high_confidence_speculates_when_allowed() {
        let (decision, _) = engine().decide(&dag_for("fs:read"), 0.78, true, thresholds());
        assert_eq!(decision, ExecutionDecision::SpeculativeExecution);
    }

    #[test]
    fn high_confidence_without_speculation_falls_back_to_suggestion() {
        let (decision, _) = engine().decide(&dag_for("fs:read"), 0.78, false, thresholds());
        assert_eq!(decision, ExecutionDecision::Suggestion);
    }

    #[test]
    fn destructive_call_name_forces_explicit() {
        let (decision, matched) =
            engine().decide(&dag_for("fs:delete_file"), 0.95, true, thresholds());
        assert_eq!(decision, ExecutionDecision::ExplicitRequired);
        assert_eq!(matched.unwrap().task_id, "task_0");
    }

    #[test]
    fn destructive_argument_forces_explicit() {
        let mut dag = dag_for("runner:run");
        dag.tasks[0]
            .arguments
            .insert("cmd".into(), serde_json::json!("rm -rf /tmp/scratch"));
        let (decision, matched) = engine().decide(&dag, 0.95, true, thresholds());
        assert_eq!(decision, ExecutionDecision::ExplicitRequired);
        assert!(matched.is_some());
    }

    #[test]
    fn speculation_disabled_in_config() {
        let config = SafetyConfig {
            speculative_enabled: false,
            ..SafetyConfig::default()
        };
        let engine = DecisionEngine::new(&config);
        let (decision, _) = engine.decide(&dag_for("fs:read"), 0.9, true, thresholds());
        assert_eq!(decision, ExecutionDecision::Suggestion);
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let config = SafetyConfig {
            patterns: vec!["[unclosed".into(), r"(?i)\bdrop\b".into()],
            speculative_enabled: true,
        };
        let engine = DecisionEngine::new(&config);
        let (decision, _) = engine.decide(&dag_for("db:drop_table"), 0.9, true, thresholds());
        assert_eq!(decision, ExecutionDecision::ExplicitRequired);
    }
}
