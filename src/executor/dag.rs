//! DAG model and layering.

use crate::errors::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Tool,
    Capability,
}

/// Pre-bound argument: a literal value, a reference into another task's
/// output, or a caller-supplied parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StaticArg {
    Literal { value: serde_json::Value },
    Reference { expression: String },
    Parameter { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable across replans.
    pub id: String,
    /// ToolId (`server:tool`) or capability FQDN.
    pub call_name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub static_arguments: BTreeMap<String, StaticArg>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<bool>,
}

impl Task {
    pub fn tool(id: impl Into<String>, call_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_name: call_name.into(),
            task_type: TaskType::Tool,
            arguments: serde_json::Map::new(),
            static_arguments: BTreeMap::new(),
            depends_on: Vec::new(),
            side_effects: None,
        }
    }

    pub fn capability(id: impl Into<String>, fqdn: impl Into<String>) -> Self {
        Self {
            task_type: TaskType::Capability,
            ..Self::tool(id, fqdn)
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn with_side_effects(mut self) -> Self {
        self.side_effects = Some(true);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dag {
    pub tasks: Vec<Task>,
}

impl Dag {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    /// Chain tasks sequentially: task `i` depends on task `i-1`.
    pub fn sequential(mut tasks: Vec<Task>) -> Self {
        for i in 1..tasks.len() {
            let prev = tasks[i - 1].id.clone();
            tasks[i].depends_on = vec![prev];
        }
        Self { tasks }
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Transitive descendants of `id`, used to skip tasks downstream of a
    /// failure.
    pub fn descendants(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for task in &self.tasks {
                if task.depends_on.contains(&current) && !out.contains(&task.id) {
                    out.push(task.id.clone());
                    frontier.push(task.id.clone());
                }
            }
        }
        out
    }

    /// Partition tasks into layers by longest path to a root, so that every
    /// task depends only on strictly earlier layers.
    ///
    /// Fails on duplicate ids, unknown dependencies, and cycles.
    pub fn layers(&self) -> GatewayResult<Vec<Vec<String>>> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if index.insert(task.id.as_str(), i).is_some() {
                return Err(GatewayError::InvalidParams(format!(
                    "duplicate task id '{}'",
                    task.id
                )));
            }
        }

        // Depth = longest path to a dependency-free task, via memoized DFS.
        let mut depth: Vec<Option<usize>> = vec![None; self.tasks.len()];
        let mut visiting = vec![false; self.tasks.len()];

        fn visit(
            dag: &Dag,
            index: &HashMap<&str, usize>,
            depth: &mut Vec<Option<usize>>,
            visiting: &mut Vec<bool>,
            i: usize,
        ) -> GatewayResult<usize> {
            if let Some(d) = depth[i] {
                return Ok(d);
            }
            if visiting[i] {
                return Err(GatewayError::InvalidParams(format!(
                    "dependency cycle involving task '{}'",
                    dag.tasks[i].id
                )));
            }
            visiting[i] = true;
            let mut d = 0;
            for dep in &dag.tasks[i].depends_on {
                let Some(&j) = index.get(dep.as_str()) else {
                    return Err(GatewayError::InvalidParams(format!(
                        "task '{}' depends on unknown task '{}'",
                        dag.tasks[i].id, dep
                    )));
                };
                d = d.max(visit(dag, index, depth, visiting, j)? + 1);
            }
            visiting[i] = false;
            depth[i] = Some(d);
            Ok(d)
        }

        for i in 0..self.tasks.len() {
            visit(self, &index, &mut depth, &mut visiting, i)?;
        }

        let max_depth = depth.iter().flatten().copied().max().unwrap_or(0);
        let mut layers: Vec<Vec<String>> = vec![Vec::new(); if self.tasks.is_empty() { 0 } else { max_depth + 1 }];
        for (i, task) in self.tasks.iter().enumerate() {
            layers[depth[i].unwrap_or(0)].push(task.id.clone());
        }
        Ok(layers)
    }
}
