//! Execution event stream and external command protocol.

use serde::{Deserialize, Serialize};

/// Ordered events emitted by a running workflow. Exactly one of
/// `workflow_complete` / `workflow_aborted` terminates each stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    WorkflowStart {
        workflow_id: String,
        total_layers: usize,
    },
    TaskStart {
        task_id: String,
    },
    TaskComplete {
        task_id: String,
        execution_time_ms: u64,
    },
    TaskError {
        task_id: String,
        error: String,
        error_kind: String,
    },
    Checkpoint {
        checkpoint_id: String,
        layer_index: usize,
    },
    DecisionRequired {
        checkpoint_id: String,
        decision_type: String,
        description: String,
        context: serde_json::Value,
    },
    WorkflowComplete {
        workflow_id: String,
        total_time_ms: u64,
        successful_tasks: usize,
        failed_tasks: usize,
    },
    WorkflowAborted {
        workflow_id: String,
        reason: String,
        completed_layers: usize,
    },
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::WorkflowComplete { .. } | ExecutionEvent::WorkflowAborted { .. }
        )
    }
}

/// Commands accepted by a running workflow, FIFO per workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkflowCommand {
    Continue {
        #[serde(default)]
        reason: Option<String>,
    },
    Abort {
        reason: String,
    },
    ReplanDag {
        new_requirement: String,
        #[serde(default)]
        available_context: Option<serde_json::Value>,
    },
    ApprovalResponse {
        checkpoint_id: String,
        approved: bool,
        #[serde(default)]
        feedback: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_tags() {
        let event = ExecutionEvent::TaskComplete {
            task_id: "task_0".into(),
            execution_time_ms: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_complete");
        assert_eq!(json["execution_time_ms"], 42);
    }

    #[test]
    fn terminal_classification() {
        assert!(ExecutionEvent::WorkflowComplete {
            workflow_id: "w".into(),
            total_time_ms: 1,
            successful_tasks: 1,
            failed_tasks: 0,
        }
        .is_terminal());
        assert!(!ExecutionEvent::TaskStart { task_id: "t".into() }.is_terminal());
    }

    #[test]
    fn command_deserialization() {
        let cmd: WorkflowCommand =
            serde_json::from_str(r#"{"command": "abort", "reason": "user_cancel"}"#).unwrap();
        assert!(matches!(cmd, WorkflowCommand::Abort { reason } if reason == "user_cancel"));
    }
}
