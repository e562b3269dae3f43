//! Content-addressed capability repository.
//!
//! Capabilities are keyed by the SHA-256 of their canonicalized code. Saving
//! the same code twice returns the original row unchanged; statistics are only
//! mutated through `update_usage`. Intent embeddings live in the same table as
//! little-endian f32 blobs and are cached in memory for similarity search.

use super::{
    Capability, CapabilitySource, DependencyDirection, DependencyEdge, DependencyEdgeSource,
    DependencyEdgeType, Fqdn, ToolId,
};
use crate::errors::{GatewayError, GatewayResult};
use crate::storage::Db;
use crate::utils::math::cosine_similarity;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Canonical form of capability code before hashing: CRLF normalized to LF,
/// trailing whitespace stripped per line, outer blank lines trimmed. Two
/// visually equal snippets must hash equal.
pub fn canonicalize_code(code: &str) -> String {
    let normalized = code.replace("\r\n", "\n");
    let lines: Vec<&str> = normalized.split('\n').map(str::trim_end).collect();
    let start = lines.iter().position(|l| !l.is_empty()).unwrap_or(0);
    let end = lines.iter().rposition(|l| !l.is_empty()).map_or(start, |i| i + 1);
    lines[start..end].join("\n")
}

pub fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonicalize_code(code).as_bytes());
    hex::encode(hasher.finalize())
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for v in embedding {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Parameters for `CapabilityStore::save`.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub code: String,
    pub intent_embedding: Vec<f32>,
    pub tools_used: Vec<ToolId>,
    pub parameters_schema: Option<serde_json::Value>,
    pub org: String,
    pub project: String,
    pub namespace: String,
    pub action: String,
    pub source: CapabilitySource,
}

impl SaveRequest {
    pub fn new(code: impl Into<String>, intent_embedding: Vec<f32>) -> Self {
        Self {
            code: code.into(),
            intent_embedding,
            tools_used: Vec::new(),
            parameters_schema: None,
            org: "local".to_string(),
            project: "default".to_string(),
            namespace: "general".to_string(),
            action: "run".to_string(),
            source: CapabilitySource::Emergent,
        }
    }

    pub fn named(mut self, namespace: &str, action: &str) -> Self {
        self.namespace = namespace.to_string();
        self.action = action.to_string();
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolId>) -> Self {
        self.tools_used = tools;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SaveOutcome {
    pub capability: Capability,
    /// True when this save inserted a new row.
    pub first_seen: bool,
}

struct CachedRow {
    id: Uuid,
    embedding: Vec<f32>,
    success_rate: f64,
}

pub struct CapabilityStore {
    db: Arc<Db>,
    /// Lazily loaded embedding rows; invalidated on any write.
    embedding_cache: Mutex<Option<Arc<Vec<CachedRow>>>>,
}

impl CapabilityStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            embedding_cache: Mutex::new(None),
        }
    }

    fn storage_err(e: anyhow::Error) -> GatewayError {
        GatewayError::Storage(e.to_string())
    }

    fn invalidate_cache(&self) {
        *self.embedding_cache.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Save a capability. Idempotent on code content: if the canonical code
    /// hashes to an existing row, that row is returned unchanged.
    pub fn save(&self, req: SaveRequest) -> GatewayResult<SaveOutcome> {
        let code = canonicalize_code(&req.code);
        let code_hash = hash_code(&code);

        if let Some(existing) = self.find_by_code_hash(&code_hash)? {
            debug!("capability {} already known as {}", &code_hash[..8], existing.fqdn);
            return Ok(SaveOutcome {
                capability: existing,
                first_seen: false,
            });
        }

        let fqdn = Fqdn::new(&req.org, &req.project, &req.namespace, &req.action, &code_hash)
            .map_err(|e| GatewayError::InvalidParams(e.to_string()))?;
        let now = Utc::now();
        let capability = Capability {
            id: Uuid::new_v4(),
            fqdn,
            code_hash: code_hash.clone(),
            code_snippet: code,
            intent_embedding: req.intent_embedding,
            parameters_schema: req.parameters_schema,
            tools_used: req.tools_used,
            success_rate: 1.0,
            usage_count: 1,
            success_count: 1,
            avg_duration_ms: 0.0,
            community_id: None,
            created_at: now,
            last_used: now,
            source: req.source,
        };

        let tools_json = serde_json::to_string(&capability.tools_used)
            .map_err(|e| GatewayError::InvalidParams(e.to_string()))?;
        let schema_json = capability
            .parameters_schema
            .as_ref()
            .map(std::string::ToString::to_string);
        let blob = embedding_to_blob(&capability.intent_embedding);

        let inserted = self
            .db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO capabilities
                       (id, fqdn, code_hash, code_snippet, intent_embedding, parameters_schema,
                        tools_used, success_rate, usage_count, success_count, avg_duration_ms,
                        community_id, created_at, last_used, source)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                     ON CONFLICT(code_hash) DO NOTHING",
                    params![
                        capability.id.to_string(),
                        capability.fqdn.to_string(),
                        capability.code_hash,
                        capability.code_snippet,
                        blob,
                        schema_json,
                        tools_json,
                        capability.success_rate,
                        capability.usage_count as i64,
                        capability.success_count as i64,
                        capability.avg_duration_ms,
                        capability.community_id,
                        capability.created_at.to_rfc3339(),
                        capability.last_used.to_rfc3339(),
                        capability.source.as_str(),
                    ],
                )
            })
            .map_err(Self::storage_err)?;

        if inserted == 0 {
            // Lost a race with a concurrent save of the same code.
            let existing = self
                .find_by_code_hash(&code_hash)?
                .ok_or_else(|| GatewayError::Storage("capability vanished after conflict".into()))?;
            return Ok(SaveOutcome {
                capability: existing,
                first_seen: false,
            });
        }

        self.invalidate_cache();
        info!("capability learned: {}", capability.fqdn);
        Ok(SaveOutcome {
            capability,
            first_seen: true,
        })
    }

    pub fn find_by_id(&self, id: Uuid) -> GatewayResult<Option<Capability>> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    &format!("{SELECT_CAPABILITY} WHERE id = ?1"),
                    params![id.to_string()],
                    capability_from_row,
                )
                .optional()
            })
            .map_err(Self::storage_err)
    }

    pub fn find_by_code_hash(&self, code_hash: &str) -> GatewayResult<Option<Capability>> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    &format!("{SELECT_CAPABILITY} WHERE code_hash = ?1"),
                    params![code_hash],
                    capability_from_row,
                )
                .optional()
            })
            .map_err(Self::storage_err)
    }

    /// Look up by FQDN. A four-part name matches on the stem; a five-part name
    /// must also match the hash component.
    pub fn find_by_fqdn(&self, fqdn: &Fqdn) -> GatewayResult<Option<Capability>> {
        let prefix = format!("{}.%", fqdn.stem());
        let rows: Vec<Capability> = self
            .db
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare(&format!("{SELECT_CAPABILITY} WHERE fqdn LIKE ?1"))?;
                let rows = stmt
                    .query_map(params![prefix], capability_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .map_err(Self::storage_err)?;
        Ok(rows.into_iter().find(|c| fqdn.matches(&c.fqdn)))
    }

    /// Rank stored capabilities against an intent embedding.
    ///
    /// Returns `(capability, cosine_similarity)` pairs with similarity at or
    /// above `min_score`, ordered by `similarity * success_rate` descending.
    pub fn search_by_intent(
        &self,
        embedding: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> GatewayResult<Vec<(Capability, f32)>> {
        let cache = self.load_embedding_cache()?;
        let mut scored: Vec<(Uuid, f32, f64)> = cache
            .iter()
            .map(|row| {
                (
                    row.id,
                    cosine_similarity(embedding, &row.embedding),
                    row.success_rate,
                )
            })
            .filter(|(_, sim, _)| *sim >= min_score)
            .collect();
        scored.sort_by(|a, b| {
            let ra = f64::from(a.1) * a.2;
            let rb = f64::from(b.1) * b.2;
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);

        let mut out = Vec::with_capacity(scored.len());
        for (id, sim, _) in scored {
            if let Some(cap) = self.find_by_id(id)? {
                out.push((cap, sim));
            }
        }
        Ok(out)
    }

    /// Atomically fold one execution outcome into the row's statistics.
    pub fn update_usage(
        &self,
        code_hash: &str,
        success: bool,
        duration_ms: f64,
    ) -> GatewayResult<Capability> {
        let now = Utc::now().to_rfc3339();
        let updated = self
            .db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE capabilities SET
                       usage_count = usage_count + 1,
                       success_count = success_count + ?2,
                       success_rate = CAST(success_count + ?2 AS REAL) / (usage_count + 1),
                       avg_duration_ms =
                         (avg_duration_ms * usage_count + ?3) / (usage_count + 1),
                       last_used = ?4
                     WHERE code_hash = ?1",
                    params![code_hash, i64::from(success), duration_ms, now],
                )
            })
            .map_err(Self::storage_err)?;
        if updated == 0 {
            return Err(GatewayError::NotFound(format!("capability {code_hash}")));
        }
        self.invalidate_cache();
        self.find_by_code_hash(code_hash)?
            .ok_or_else(|| GatewayError::NotFound(format!("capability {code_hash}")))
    }

    /// Record a dependency edge. Idempotent on `(from, to)`: a re-add bumps
    /// `observed_count` and `last_observed` instead of inserting.
    pub fn add_dependency(
        &self,
        from: Uuid,
        to: Uuid,
        edge_type: DependencyEdgeType,
        edge_source: DependencyEdgeSource,
        confidence_score: f64,
    ) -> GatewayResult<()> {
        let now = Utc::now().to_rfc3339();
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO capability_dependencies
                       (from_capability_id, to_capability_id, edge_type, edge_source,
                        observed_count, confidence_score, created_at, last_observed)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)
                     ON CONFLICT(from_capability_id, to_capability_id) DO UPDATE SET
                       observed_count = observed_count + 1,
                       last_observed = ?6",
                    params![
                        from.to_string(),
                        to.to_string(),
                        edge_type.as_str(),
                        edge_source.as_str(),
                        confidence_score.clamp(0.0, 1.0),
                        now,
                    ],
                )
            })
            .map_err(Self::storage_err)?;
        Ok(())
    }

    pub fn remove_dependency(&self, from: Uuid, to: Uuid) -> GatewayResult<bool> {
        let removed = self
            .db
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM capability_dependencies
                     WHERE from_capability_id = ?1 AND to_capability_id = ?2",
                    params![from.to_string(), to.to_string()],
                )
            })
            .map_err(Self::storage_err)?;
        Ok(removed > 0)
    }

    pub fn get_dependencies(
        &self,
        id: Uuid,
        direction: DependencyDirection,
    ) -> GatewayResult<Vec<DependencyEdge>> {
        let clause = match direction {
            DependencyDirection::From => "from_capability_id = ?1",
            DependencyDirection::To => "to_capability_id = ?1",
            DependencyDirection::Both => "from_capability_id = ?1 OR to_capability_id = ?1",
        };
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT from_capability_id, to_capability_id, edge_type, edge_source,
                            observed_count, confidence_score, created_at, last_observed
                     FROM capability_dependencies WHERE {clause}"
                ))?;
                let rows = stmt
                    .query_map(params![id.to_string()], dependency_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .map_err(Self::storage_err)
    }

    pub fn list(&self, limit: usize, offset: usize) -> GatewayResult<Vec<Capability>> {
        self.db
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_CAPABILITY} ORDER BY last_used DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt
                    .query_map(params![limit as i64, offset as i64], capability_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .map_err(Self::storage_err)
    }

    pub fn count(&self) -> GatewayResult<u64> {
        self.db
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM capabilities", [], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .map(|n| n as u64)
            .map_err(Self::storage_err)
    }

    fn load_embedding_cache(&self) -> GatewayResult<Arc<Vec<CachedRow>>> {
        {
            let guard = self.embedding_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cache) = guard.as_ref() {
                return Ok(cache.clone());
            }
        }
        let rows: Vec<CachedRow> = self
            .db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT id, intent_embedding, success_rate FROM capabilities")?;
                let rows = stmt
                    .query_map([], |row| {
                        let id: String = row.get(0)?;
                        let blob: Vec<u8> = row.get(1)?;
                        let success_rate: f64 = row.get(2)?;
                        Ok((id, blob, success_rate))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .map_err(Self::storage_err)?
            .into_iter()
            .filter_map(|(id, blob, success_rate)| {
                Uuid::parse_str(&id).ok().map(|id| CachedRow {
                    id,
                    embedding: blob_to_embedding(&blob),
                    success_rate,
                })
            })
            .collect();
        let cache = Arc::new(rows);
        *self.embedding_cache.lock().unwrap_or_else(|e| e.into_inner()) = Some(cache.clone());
        Ok(cache)
    }
}

const SELECT_CAPABILITY: &str = "SELECT id, fqdn, code_hash, code_snippet, intent_embedding,
    parameters_schema, tools_used, success_rate, usage_count, success_count,
    avg_duration_ms, community_id, created_at, last_used, source FROM capabilities";

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn capability_from_row(row: &Row<'_>) -> rusqlite::Result<Capability> {
    let id: String = row.get(0)?;
    let fqdn: String = row.get(1)?;
    let blob: Vec<u8> = row.get(4)?;
    let schema_json: Option<String> = row.get(5)?;
    let tools_json: String = row.get(6)?;
    let created_at: String = row.get(12)?;
    let last_used: String = row.get(13)?;
    let source: String = row.get(14)?;

    let to_parse_err = |i: usize, e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(i, rusqlite::types::Type::Text, e.into())
    };

    Ok(Capability {
        id: Uuid::parse_str(&id).map_err(|e| to_parse_err(0, e.into()))?,
        fqdn: Fqdn::parse(&fqdn).map_err(|e| to_parse_err(1, e))?,
        code_hash: row.get(2)?,
        code_snippet: row.get(3)?,
        intent_embedding: blob_to_embedding(&blob),
        parameters_schema: schema_json.and_then(|s| serde_json::from_str(&s).ok()),
        tools_used: serde_json::from_str(&tools_json).unwrap_or_default(),
        success_rate: row.get(7)?,
        usage_count: row.get::<_, i64>(8)? as u64,
        success_count: row.get::<_, i64>(9)? as u64,
        avg_duration_ms: row.get(10)?,
        community_id: row.get(11)?,
        created_at: parse_timestamp(&created_at),
        last_used: parse_timestamp(&last_used),
        source: CapabilitySource::from_str_lossy(&source),
    })
}

fn dependency_from_row(row: &Row<'_>) -> rusqlite::Result<DependencyEdge> {
    let from: String = row.get(0)?;
    let to: String = row.get(1)?;
    let edge_type: String = row.get(2)?;
    let edge_source: String = row.get(3)?;
    let created_at: String = row.get(6)?;
    let last_observed: String = row.get(7)?;

    Ok(DependencyEdge {
        from_capability_id: Uuid::parse_str(&from).unwrap_or_default(),
        to_capability_id: Uuid::parse_str(&to).unwrap_or_default(),
        edge_type: DependencyEdgeType::parse(&edge_type)
            .unwrap_or(DependencyEdgeType::Dependency),
        edge_source: if edge_source == "template" {
            DependencyEdgeSource::Template
        } else {
            DependencyEdgeSource::Observed
        },
        observed_count: row.get::<_, i64>(4)? as u64,
        confidence_score: row.get(5)?,
        created_at: parse_timestamp(&created_at),
        last_observed: parse_timestamp(&last_observed),
    })
}
