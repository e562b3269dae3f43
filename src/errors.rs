use thiserror::Error;

/// Typed error hierarchy for toolweave.
///
/// Use at module boundaries (RPC dispatch, store access, executor tasks,
/// session pool). Internal/leaf functions can continue using `anyhow::Result`
/// — the `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Backend tool error: {tool}: {message}")]
    BackendTool { tool: String, message: String },

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection pool exhausted ({max} connections)")]
    PoolExhausted { max: usize },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    #[error("Blocked by safety policy: {0}")]
    SafetyBlock(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using GatewayError.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Stable machine-readable kind, used in task results and the event stream.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidParams(_) => "invalid_params",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Storage(_) => "storage",
            GatewayError::BackendTool { .. } => "backend_tool",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::PoolExhausted { .. } => "pool_exhausted",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::SafetyBlock(_) => "safety_block",
            GatewayError::Cancelled(_) => "cancelled",
            GatewayError::Internal(_) => "internal",
        }
    }

    /// JSON-RPC 2.0 error code for this error at the RPC boundary.
    ///
    /// Invalid input and unknown ids surface as -32602 per the protocol
    /// contract; everything else that escapes a handler is -32603.
    pub fn rpc_code(&self) -> i64 {
        match self {
            GatewayError::InvalidParams(_) | GatewayError::NotFound(_) => -32602,
            _ => -32603,
        }
    }

    /// Whether this error is retriable at the caller's discretion.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Storage(_) | GatewayError::RateLimited { .. } | GatewayError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_params_display_and_code() {
        let err = GatewayError::InvalidParams("missing intent".into());
        assert_eq!(err.to_string(), "Invalid parameters: missing intent");
        assert_eq!(err.rpc_code(), -32602);
        assert_eq!(err.kind(), "invalid_params");
    }

    #[test]
    fn not_found_maps_to_invalid_params_code() {
        let err = GatewayError::NotFound("workflow wf-1".into());
        assert_eq!(err.rpc_code(), -32602);
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn storage_is_retryable_internal_code() {
        let err = GatewayError::Storage("disk full".into());
        assert!(err.is_retryable());
        assert_eq!(err.rpc_code(), -32603);
    }

    #[test]
    fn backend_tool_display() {
        let err = GatewayError::BackendTool {
            tool: "filesystem:read".into(),
            message: "permission denied".into(),
        };
        assert_eq!(
            err.to_string(),
            "Backend tool error: filesystem:read: permission denied"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeout_kind() {
        let err = GatewayError::Timeout(30_000);
        assert_eq!(err.kind(), "timeout");
        assert!(err.is_retryable());
    }

    #[test]
    fn internal_from_anyhow() {
        let anyhow_err = anyhow::anyhow!("something broke");
        let err: GatewayError = anyhow_err.into();
        assert!(matches!(err, GatewayError::Internal(_)));
        assert_eq!(err.kind(), "internal");
        assert_eq!(err.rpc_code(), -32603);
    }
}
