use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18890
}

fn default_rate_limit_per_minute() -> u32 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer tokens accepted on authenticated routes. Empty means local mode:
    /// identity falls back to the peer address.
    #[serde(default, rename = "authTokens")]
    pub auth_tokens: Vec<String>,
    /// Requests per minute per identity on non-public routes.
    #[serde(default = "default_rate_limit_per_minute", rename = "rateLimitPerMinute")]
    pub rate_limit_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            auth_tokens: Vec::new(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery / scoring
// ---------------------------------------------------------------------------

fn default_good_match_threshold() -> f64 {
    0.6
}

fn default_speculation_score() -> f64 {
    0.7
}

fn default_speculation_success_rate() -> f64 {
    0.8
}

fn default_composition_floor() -> f64 {
    0.3
}

fn default_result_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// A single candidate at or above this score short-circuits composition.
    #[serde(default = "default_good_match_threshold", rename = "goodMatchThreshold")]
    pub good_match_threshold: f64,
    /// Minimum capability score for speculative execution eligibility.
    #[serde(default = "default_speculation_score", rename = "speculationScore")]
    pub speculation_score: f64,
    /// Minimum capability success rate for speculative execution eligibility.
    #[serde(default = "default_speculation_success_rate", rename = "speculationSuccessRate")]
    pub speculation_success_rate: f64,
    /// Tools below this score are not considered for hyperpath composition.
    #[serde(default = "default_composition_floor", rename = "compositionFloor")]
    pub composition_floor: f64,
    /// Hard cap on returned results per request.
    #[serde(default = "default_result_limit", rename = "resultLimit")]
    pub result_limit: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            good_match_threshold: default_good_match_threshold(),
            speculation_score: default_speculation_score(),
            speculation_success_rate: default_speculation_success_rate(),
            composition_floor: default_composition_floor(),
            result_limit: default_result_limit(),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

fn default_task_timeout_ms() -> u64 {
    30_000
}

fn default_workflow_ttl_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_task_timeout_ms", rename = "taskTimeoutMs")]
    pub task_timeout_ms: u64,
    /// Workflows idle past this TTL are garbage-collected on access.
    #[serde(default = "default_workflow_ttl_secs", rename = "workflowTtlSecs")]
    pub workflow_ttl_secs: u64,
    /// Pause after every layer for an external `continue` command.
    #[serde(default, rename = "perLayerValidation")]
    pub per_layer_validation: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: default_task_timeout_ms(),
            workflow_ttl_secs: default_workflow_ttl_secs(),
            per_layer_validation: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Safety / speculation policy
// ---------------------------------------------------------------------------

fn default_safety_patterns() -> Vec<String> {
    [
        r"(?i)\b(delete|remove|drop|destroy|wipe|truncate)",
        r"(?i)\b(kill|terminate)",
        r"(?i)\b(exec|shell|subprocess|spawn)\b",
        r"(?i)\b(credential|secret|password|token)s?\b",
        r"(?i)\brm\s+-rf\b",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Regex patterns matched against task call names and arguments. A match
    /// forces explicit approval regardless of confidence.
    #[serde(default = "default_safety_patterns")]
    pub patterns: Vec<String>,
    /// Master switch for speculative execution.
    #[serde(default = "default_true", rename = "speculativeEnabled")]
    pub speculative_enabled: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            patterns: default_safety_patterns(),
            speculative_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Adaptive thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "ThresholdConfig::default_explicit", rename = "explicitDefault")]
    pub explicit_default: f64,
    #[serde(default = "ThresholdConfig::default_suggestion", rename = "suggestionDefault")]
    pub suggestion_default: f64,
    #[serde(default = "ThresholdConfig::default_min", rename = "minThreshold")]
    pub min_threshold: f64,
    #[serde(default = "ThresholdConfig::default_max", rename = "maxThreshold")]
    pub max_threshold: f64,
    #[serde(default = "ThresholdConfig::default_lr", rename = "learningRate")]
    pub learning_rate: f64,
    #[serde(default = "ThresholdConfig::default_window", rename = "windowSize")]
    pub window_size: usize,
}

impl ThresholdConfig {
    fn default_explicit() -> f64 {
        0.50
    }
    fn default_suggestion() -> f64 {
        0.70
    }
    fn default_min() -> f64 {
        0.40
    }
    fn default_max() -> f64 {
        0.90
    }
    fn default_lr() -> f64 {
        0.05
    }
    fn default_window() -> usize {
        50
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            explicit_default: Self::default_explicit(),
            suggestion_default: Self::default_suggestion(),
            min_threshold: Self::default_min(),
            max_threshold: Self::default_max(),
            learning_rate: Self::default_lr(),
            window_size: Self::default_window(),
        }
    }
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

fn default_embedding_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embedding_cache() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Vector dimension; must match the model output.
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    #[serde(default = "default_embedding_cache", rename = "cacheSize")]
    pub cache_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            cache_size: default_embedding_cache(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions / connection pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "SessionConfig::default_max_connections", rename = "maxConnections")]
    pub max_connections: usize,
    #[serde(default = "SessionConfig::default_idle_timeout", rename = "idleTimeoutSecs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "SessionConfig::default_connection_timeout", rename = "connectionTimeoutSecs")]
    pub connection_timeout_secs: u64,
}

impl SessionConfig {
    fn default_max_connections() -> usize {
        50
    }
    fn default_idle_timeout() -> u64 {
        300
    }
    fn default_connection_timeout() -> u64 {
        30
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connections: Self::default_max_connections(),
            idle_timeout_secs: Self::default_idle_timeout(),
            connection_timeout_secs: Self::default_connection_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

fn default_sandbox_timeout_ms() -> u64 {
    10_000
}

fn default_sandbox_memory_mb() -> u64 {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_timeout_ms", rename = "timeoutMs")]
    pub timeout_ms: u64,
    #[serde(default = "default_sandbox_memory_mb", rename = "memoryLimitMb")]
    pub memory_limit_mb: u64,
    #[serde(default, rename = "allowedReadPaths")]
    pub allowed_read_paths: Vec<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout_ms(),
            memory_limit_mb: default_sandbox_memory_mb(),
            allowed_read_paths: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    /// Database file path. Defaults to `<home>/toolweave.db`; `:memory:` is
    /// accepted for ephemeral runs.
    #[serde(default, rename = "dbPath")]
    pub db_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Backend tool servers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub servers: std::collections::HashMap<String, BackendServerConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.gateway.port, 18890);
        assert!((cfg.discovery.good_match_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(cfg.executor.task_timeout_ms, 30_000);
        assert!((cfg.thresholds.min_threshold - 0.40).abs() < f64::EPSILON);
        assert!((cfg.thresholds.max_threshold - 0.90).abs() < f64::EPSILON);
        assert_eq!(cfg.thresholds.window_size, 50);
        assert_eq!(cfg.sessions.max_connections, 50);
        assert_eq!(cfg.sessions.idle_timeout_secs, 300);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"gateway": {"port": 9000}, "executor": {"perLayerValidation": true}}"#)
                .unwrap();
        assert_eq!(cfg.gateway.port, 9000);
        assert_eq!(cfg.gateway.host, "127.0.0.1");
        assert!(cfg.executor.per_layer_validation);
        assert_eq!(cfg.executor.task_timeout_ms, 30_000);
    }

    #[test]
    fn safety_defaults_cover_destructive_verbs() {
        let cfg = SafetyConfig::default();
        let joined = cfg.patterns.join(" ");
        assert!(joined.contains("delete"));
        assert!(joined.contains("shell"));
        assert!(cfg.speculative_enabled);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.gateway.port, cfg.gateway.port);
        assert_eq!(back.embedding.dimension, cfg.embedding.dimension);
    }
}
