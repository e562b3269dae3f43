//! Child-process backend client speaking newline-delimited JSON-RPC.
//!
//! Each configured server is spawned with piped stdin/stdout (stderr is
//! inherited for its logs). Responses are matched to requests through a
//! pending map of oneshot senders keyed by request id.

use super::{BackendFactory, ToolBackend, ToolDescriptor};
use crate::config::BackendServerConfig;
use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

pub struct StdioBackendFactory {
    servers: HashMap<String, BackendServerConfig>,
}

impl StdioBackendFactory {
    pub fn new(servers: HashMap<String, BackendServerConfig>) -> Self {
        Self { servers }
    }
}

#[async_trait::async_trait]
impl BackendFactory for StdioBackendFactory {
    async fn connect(&self, server_id: &str) -> Result<Arc<dyn ToolBackend>> {
        let Some(config) = self.servers.get(server_id) else {
            bail!("no backend server configured with id '{}'", server_id);
        };
        if !config.enabled {
            bail!("backend server '{}' is disabled", server_id);
        }
        let client = StdioBackend::spawn(server_id, config).await?;
        client.initialize().await?;
        Ok(Arc::new(client))
    }
}

pub struct StdioBackend {
    server_id: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    next_id: AtomicU64,
}

impl StdioBackend {
    async fn spawn(server_id: &str, config: &BackendServerConfig) -> Result<Self> {
        let mut command = Command::new(&config.command);
        command.args(&config.args);
        for (key, value) in &config.env {
            command.env(key, value);
        }
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::inherit());
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn backend '{}'", config.command))?;
        let stdin = child.stdin.take().context("backend stdin unavailable")?;
        let stdout = child.stdout.take().context("backend stdout unavailable")?;

        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let reader_pending = pending.clone();
        let reader_server = server_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    warn!("backend {} sent unparsable frame", reader_server);
                    continue;
                };
                let Some(id) = message.get("id").and_then(Value::as_u64) else {
                    // Notification; nothing is waiting on it.
                    continue;
                };
                let sender = reader_pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                if let Some(sender) = sender {
                    let _ = sender.send(message);
                }
            }
            debug!("backend {} stdout closed", reader_server);
        });

        Ok(Self {
            server_id: server_id.to_string(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
        })
    }

    async fn initialize(&self) -> Result<()> {
        let result = self
            .request("initialize", json!({ "client_info": { "name": "toolweave" } }))
            .await?;
        let protocol_version = result
            .get("protocol_version")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        debug!(
            "backend {} initialized (protocol {})",
            self.server_id, protocol_version
        );
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let frame = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(frame.to_string().as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
        }

        let message = rx
            .await
            .with_context(|| format!("backend '{}' closed mid-request", self.server_id))?;
        if let Some(error) = message.get("error") {
            bail!(
                "backend '{}' error on {}: {}",
                self.server_id,
                method,
                error.get("message").and_then(Value::as_str).unwrap_or("unknown")
            );
        }
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait::async_trait]
impl ToolBackend for StdioBackend {
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value> {
        self.request("tools/call", json!({ "name": tool, "arguments": arguments }))
            .await
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .iter()
            .filter_map(|tool| {
                Some(ToolDescriptor {
                    name: tool.get("name")?.as_str()?.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: tool
                        .get("inputSchema")
                        .cloned()
                        .unwrap_or(json!({ "type": "object" })),
                })
            })
            .collect())
    }

    async fn disconnect(&self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!("failed to kill backend {}: {}", self.server_id, e);
        }
    }
}
