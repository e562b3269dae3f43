//! Capability naming.
//!
//! A full FQDN is five dot-separated components `org.project.namespace.action.hash`
//! where `hash` is the first four hex characters of the capability's code hash.
//! A four-part name (no hash) is accepted for lookup. `pml.std.*` names are
//! standard mini-tools and `pml.mcp.*` names are MCP server records; everything
//! else is a user capability.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of entity an FQDN refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FqdnKind {
    /// `pml.std.*` — built-in mini-tool.
    StdTool,
    /// `pml.mcp.*` — MCP server record.
    McpServer,
    /// Anything else — user capability.
    Capability,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fqdn {
    pub org: String,
    pub project: String,
    pub namespace: String,
    pub action: String,
    /// First 4 hex chars of the code hash. `None` for lookup-only names.
    pub hash: Option<String>,
}

fn valid_component(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn valid_hash(s: &str) -> bool {
    s.len() == 4 && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

impl Fqdn {
    pub fn new(org: &str, project: &str, namespace: &str, action: &str, code_hash: &str) -> Result<Self> {
        if code_hash.len() < 4 {
            bail!("code hash too short: {}", code_hash);
        }
        let fqdn = Self {
            org: org.to_string(),
            project: project.to_string(),
            namespace: namespace.to_string(),
            action: action.to_string(),
            hash: Some(code_hash[..4].to_lowercase()),
        };
        fqdn.validate()?;
        Ok(fqdn)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        let (head, hash) = match parts.len() {
            4 => (&parts[..4], None),
            5 => (&parts[..4], Some(parts[4])),
            n => bail!("FQDN '{}' has {} components, expected 4 or 5", s, n),
        };
        let fqdn = Self {
            org: head[0].to_string(),
            project: head[1].to_string(),
            namespace: head[2].to_string(),
            action: head[3].to_string(),
            hash: hash.map(str::to_string),
        };
        fqdn.validate()?;
        Ok(fqdn)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("org", &self.org),
            ("project", &self.project),
            ("namespace", &self.namespace),
            ("action", &self.action),
        ] {
            if !valid_component(value) {
                bail!("invalid FQDN {} component: '{}'", name, value);
            }
        }
        if let Some(hash) = &self.hash {
            if !valid_hash(hash) {
                bail!("invalid FQDN hash '{}': expected 4 lowercase hex chars", hash);
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> FqdnKind {
        if self.org == "pml" && self.project == "std" {
            FqdnKind::StdTool
        } else if self.org == "pml" && self.project == "mcp" {
            FqdnKind::McpServer
        } else {
            FqdnKind::Capability
        }
    }

    /// Four-part prefix without the hash, used for lookup matching.
    pub fn stem(&self) -> String {
        format!("{}.{}.{}.{}", self.org, self.project, self.namespace, self.action)
    }

    /// Whether `other` names the same capability: equal stems, and if both
    /// carry a hash, equal hashes.
    pub fn matches(&self, other: &Fqdn) -> bool {
        if self.stem() != other.stem() {
            return false;
        }
        match (&self.hash, &other.hash) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for Fqdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hash {
            Some(hash) => write!(f, "{}.{}", self.stem(), hash),
            None => write!(f, "{}", self.stem()),
        }
    }
}

impl TryFrom<String> for Fqdn {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Fqdn> for String {
    fn from(value: Fqdn) -> Self {
        value.to_string()
    }
}

impl std::str::FromStr for Fqdn {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
