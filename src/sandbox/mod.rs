//! Sandboxed code execution seam.
//!
//! The actual sandbox (process isolation, interpreter, resource limits) is an
//! external collaborator behind `CodeSandbox`; the gateway auto-injects the
//! discovery matches for the request's intent as callable tools and records
//! the returned traces into the feedback loop.

use crate::config::SandboxConfig;
use crate::errors::{GatewayError, GatewayResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A tool or capability made callable inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectedTool {
    /// ToolId or capability FQDN.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub code: String,
    pub intent: Option<String>,
    pub context: Option<serde_json::Value>,
    pub config: SandboxConfig,
    pub tools: Vec<InjectedTool>,
}

/// One tool invocation observed during sandboxed execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTrace {
    pub tool: String,
    pub arguments: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOutcome {
    pub success: bool,
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub traces: Vec<ToolTrace>,
    pub duration_ms: u64,
}

#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn execute(&self, request: SandboxRequest) -> GatewayResult<SandboxOutcome>;
}

/// Placeholder used when no sandbox executor is wired in: `execute_code`
/// reports the gap instead of silently succeeding.
pub struct DisabledSandbox;

#[async_trait]
impl CodeSandbox for DisabledSandbox {
    async fn execute(&self, _request: SandboxRequest) -> GatewayResult<SandboxOutcome> {
        Err(GatewayError::Internal(anyhow::anyhow!(
            "no sandbox executor configured"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_sandbox_errors() {
        let sandbox = DisabledSandbox;
        let err = sandbox
            .execute(SandboxRequest {
                code: "1 + 1".into(),
                intent: None,
                context: None,
                config: SandboxConfig::default(),
                tools: vec![],
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "internal");
    }

    #[test]
    fn outcome_serialization() {
        let outcome = SandboxOutcome {
            success: true,
            result: serde_json::json!({"answer": 42}),
            error: None,
            traces: vec![ToolTrace {
                tool: "fs:read".into(),
                arguments: serde_json::json!({"path": "x"}),
                output: Some(serde_json::json!("data")),
                error: None,
                duration_ms: 7,
            }],
            duration_ms: 12,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["traces"][0]["tool"], "fs:read");
        assert!(json.get("error").is_none());
    }
}
