//! Workflow state, checkpoints, persistence, and the live-workflow registry.

use super::dag::Dag;
use super::events::WorkflowCommand;
use crate::errors::{GatewayError, GatewayResult};
use crate::storage::Db;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    AwaitingApproval,
    Complete,
    Aborted,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Complete | WorkflowStatus::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl TaskResult {
    pub fn completed(task_id: &str, output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskState::Completed,
            output: Some(output),
            error: None,
            error_kind: None,
            duration_ms: Some(duration_ms),
            skip_reason: None,
        }
    }

    pub fn failed(task_id: &str, error: &GatewayError, duration_ms: u64) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: if error.kind() == "cancelled" {
                TaskState::Cancelled
            } else {
                TaskState::Failed
            },
            output: None,
            error: Some(error.to_string()),
            error_kind: Some(error.kind().to_string()),
            duration_ms: Some(duration_ms),
            skip_reason: None,
        }
    }

    pub fn skipped(task_id: &str, reason: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskState::Skipped,
            output: None,
            error: None,
            error_kind: None,
            duration_ms: None,
            skip_reason: Some(reason.to_string()),
        }
    }
}

/// Append-only record of per-task outcomes after a completed layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub workflow_id: Uuid,
    pub layer_index: usize,
    pub task_snapshot: BTreeMap<String, TaskResult>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

pub fn save_workflow_dag(
    db: &Db,
    workflow_id: Uuid,
    dag: &Dag,
    intent: &str,
    expires_at: DateTime<Utc>,
) -> GatewayResult<()> {
    let dag_json =
        serde_json::to_string(dag).map_err(|e| GatewayError::Storage(e.to_string()))?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR REPLACE INTO workflow_dags
               (workflow_id, dag_json, intent, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                workflow_id.to_string(),
                dag_json,
                intent,
                Utc::now().to_rfc3339(),
                expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .map_err(|e| GatewayError::Storage(e.to_string()))?;
    Ok(())
}

pub fn load_workflow_dag(db: &Db, workflow_id: Uuid) -> GatewayResult<Option<(Dag, String)>> {
    let row: Option<(String, String)> = db
        .with_conn(|conn| {
            conn.query_row(
                "SELECT dag_json, intent FROM workflow_dags WHERE workflow_id = ?1",
                params![workflow_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
        })
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
    match row {
        None => Ok(None),
        Some((dag_json, intent)) => {
            let dag = serde_json::from_str(&dag_json)
                .map_err(|e| GatewayError::Storage(e.to_string()))?;
            Ok(Some((dag, intent)))
        }
    }
}

pub fn delete_workflow_dag(db: &Db, workflow_id: Uuid) -> GatewayResult<()> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM workflow_dags WHERE workflow_id = ?1",
            params![workflow_id.to_string()],
        )?;
        Ok(())
    })
    .map_err(|e| GatewayError::Storage(e.to_string()))?;
    Ok(())
}

pub fn save_checkpoint(db: &Db, checkpoint: &Checkpoint) -> GatewayResult<()> {
    let snapshot_json = serde_json::to_string(&checkpoint.task_snapshot)
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO workflow_checkpoints
               (id, workflow_id, layer_index, task_snapshot_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                checkpoint.id,
                checkpoint.workflow_id.to_string(),
                checkpoint.layer_index as i64,
                snapshot_json,
                checkpoint.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .map_err(|e| GatewayError::Storage(e.to_string()))?;
    Ok(())
}

pub fn load_checkpoint(
    db: &Db,
    workflow_id: Uuid,
    checkpoint_id: &str,
) -> GatewayResult<Option<Checkpoint>> {
    let row: Option<(i64, String, String)> = db
        .with_conn(|conn| {
            conn.query_row(
                "SELECT layer_index, task_snapshot_json, created_at
                 FROM workflow_checkpoints WHERE id = ?1 AND workflow_id = ?2",
                params![checkpoint_id, workflow_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
    match row {
        None => Ok(None),
        Some((layer_index, snapshot_json, created_at)) => {
            let task_snapshot = serde_json::from_str(&snapshot_json)
                .map_err(|e| GatewayError::Storage(e.to_string()))?;
            Ok(Some(Checkpoint {
                id: checkpoint_id.to_string(),
                workflow_id,
                layer_index: layer_index as usize,
                task_snapshot,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            }))
        }
    }
}

// ---------------------------------------------------------------------------
// Live-workflow registry
// ---------------------------------------------------------------------------

/// Handle to a running workflow's command queue and status.
pub struct WorkflowHandle {
    pub workflow_id: Uuid,
    pub intent: String,
    pub command_tx: mpsc::Sender<WorkflowCommand>,
    pub status_rx: watch::Receiver<WorkflowStatus>,
    expires_at: Mutex<DateTime<Utc>>,
}

impl WorkflowHandle {
    pub fn status(&self) -> WorkflowStatus {
        *self.status_rx.borrow()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        *self.expires_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh_ttl(&self, ttl: chrono::Duration) {
        *self.expires_at.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now() + ttl;
    }
}

/// Registry of live workflows, garbage-collected on access: terminal or
/// expired entries are dropped before every lookup.
pub struct WorkflowRegistry {
    ttl: chrono::Duration,
    workflows: Mutex<HashMap<Uuid, Arc<WorkflowHandle>>>,
}

impl WorkflowRegistry {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            ttl: chrono::Duration::seconds(ttl_secs as i64),
            workflows: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    pub fn insert(
        &self,
        workflow_id: Uuid,
        intent: String,
        command_tx: mpsc::Sender<WorkflowCommand>,
        status_rx: watch::Receiver<WorkflowStatus>,
    ) -> Arc<WorkflowHandle> {
        let handle = Arc::new(WorkflowHandle {
            workflow_id,
            intent,
            command_tx,
            status_rx,
            expires_at: Mutex::new(Utc::now() + self.ttl),
        });
        self.guard().insert(workflow_id, handle.clone());
        handle
    }

    pub fn get(&self, workflow_id: Uuid) -> Option<Arc<WorkflowHandle>> {
        let mut guard = self.guard();
        Self::sweep(&mut guard);
        guard.get(&workflow_id).cloned()
    }

    pub fn remove(&self, workflow_id: Uuid) {
        self.guard().remove(&workflow_id);
    }

    pub fn len(&self) -> usize {
        let mut guard = self.guard();
        Self::sweep(&mut guard);
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a command for a live workflow. `continue` refreshes the TTL.
    pub async fn send_command(
        &self,
        workflow_id: Uuid,
        command: WorkflowCommand,
    ) -> GatewayResult<()> {
        let handle = self
            .get(workflow_id)
            .ok_or_else(|| GatewayError::NotFound(format!("workflow {workflow_id}")))?;
        if matches!(command, WorkflowCommand::Continue { .. }) {
            handle.refresh_ttl(self.ttl);
        }
        handle
            .command_tx
            .send(command)
            .await
            .map_err(|_| GatewayError::NotFound(format!("workflow {workflow_id} has exited")))?;
        debug!("command queued for workflow {}", workflow_id);
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<WorkflowHandle>>> {
        self.workflows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sweep(map: &mut HashMap<Uuid, Arc<WorkflowHandle>>) {
        let now = Utc::now();
        map.retain(|_, handle| !handle.status().is_terminal() && handle.expires_at() > now);
    }
}
