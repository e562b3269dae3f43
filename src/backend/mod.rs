//! Backend tool-server seam.
//!
//! Tool servers are black boxes behind these traits; the session pool owns
//! client lifetimes and the runtime's task invoker calls through them.

mod stdio;

pub use stdio::{StdioBackend, StdioBackendFactory};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A connected client for one backend tool server.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value>;

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// Release transport resources. Default: nothing to do.
    async fn disconnect(&self) {}
}

/// Creates clients on demand, keyed by server id.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn connect(&self, server_id: &str) -> Result<Arc<dyn ToolBackend>>;
}
