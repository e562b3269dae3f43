pub mod fqdn;
mod store;

pub use fqdn::{Fqdn, FqdnKind};
pub use store::{CapabilityStore, SaveOutcome, SaveRequest, canonicalize_code, hash_code};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Canonical tool identifier: `server_id:tool_name`.
///
/// The parser also accepts the `mcp__server__tool` spelling some clients emit.
/// A server id never contains `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolId {
    pub server: String,
    pub tool: String,
}

impl ToolId {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("mcp__") {
            if let Some((server, tool)) = rest.split_once("__") {
                if !server.is_empty() && !tool.is_empty() {
                    return Ok(Self::new(server, tool));
                }
            }
            bail!("invalid mcp-style tool id: '{}'", s);
        }
        match s.split_once(':') {
            Some((server, tool)) if !server.is_empty() && !tool.is_empty() => {
                Ok(Self::new(server, tool))
            }
            _ => bail!("invalid tool id '{}': expected server:tool", s),
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server, self.tool)
    }
}

impl TryFrom<String> for ToolId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ToolId> for String {
    fn from(value: ToolId) -> Self {
        value.to_string()
    }
}

impl std::str::FromStr for ToolId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilitySource {
    Emergent,
    Imported,
}

impl CapabilitySource {
    pub fn as_str(self) -> &'static str {
        match self {
            CapabilitySource::Emergent => "emergent",
            CapabilitySource::Imported => "imported",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "imported" => CapabilitySource::Imported,
            _ => CapabilitySource::Emergent,
        }
    }
}

/// A content-addressed, statistically tracked reusable code snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: Uuid,
    pub fqdn: Fqdn,
    /// Full SHA-256 over the canonical code, lowercase hex.
    pub code_hash: String,
    pub code_snippet: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub intent_embedding: Vec<f32>,
    pub parameters_schema: Option<serde_json::Value>,
    pub tools_used: Vec<ToolId>,
    pub success_rate: f64,
    pub usage_count: u64,
    pub success_count: u64,
    pub avg_duration_ms: f64,
    pub community_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub source: CapabilitySource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyEdgeType {
    Contains,
    Sequence,
    Dependency,
    Alternative,
}

impl DependencyEdgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyEdgeType::Contains => "contains",
            DependencyEdgeType::Sequence => "sequence",
            DependencyEdgeType::Dependency => "dependency",
            DependencyEdgeType::Alternative => "alternative",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "contains" => Ok(Self::Contains),
            "sequence" => Ok(Self::Sequence),
            "dependency" => Ok(Self::Dependency),
            "alternative" => Ok(Self::Alternative),
            other => bail!("unknown dependency edge type '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyEdgeSource {
    Template,
    Observed,
}

impl DependencyEdgeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyEdgeSource::Template => "template",
            DependencyEdgeSource::Observed => "observed",
        }
    }
}

/// Directed dependency between two capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from_capability_id: Uuid,
    pub to_capability_id: Uuid,
    pub edge_type: DependencyEdgeType,
    pub edge_source: DependencyEdgeSource,
    pub observed_count: u64,
    pub confidence_score: f64,
    pub created_at: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
}

/// Direction selector for dependency queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyDirection {
    From,
    To,
    Both,
}
