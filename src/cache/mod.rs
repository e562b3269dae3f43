//! Tool schema cache (fixed-capacity LRU with hit/miss statistics) and the
//! tool version map used to invalidate downstream caches on schema change.

use crate::capability::ToolId;
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;

const DEFAULT_MAX_SIZE: usize = 50;
/// Hex chars of the schema digest kept as the version tag.
const VERSION_TAG_LEN: usize = 12;

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

struct Entry {
    schema: serde_json::Value,
    hit_count: u64,
}

struct CacheInner {
    entries: LruCache<ToolId, Entry>,
    hits: u64,
    misses: u64,
}

/// LRU over tool schemas. `get` refreshes recency; eviction always removes
/// the least-recently-accessed entry.
pub struct SchemaCache {
    max_size: usize,
    inner: Mutex<CacheInner>,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl SchemaCache {
    pub fn new(max_size: usize) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("cache size must be > 0");
        Self {
            max_size: max_size.max(1),
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(cap),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, tool_id: &ToolId) -> Option<serde_json::Value> {
        let mut inner = self.guard();
        match inner.entries.get_mut(tool_id) {
            Some(entry) => {
                entry.hit_count += 1;
                let schema = entry.schema.clone();
                inner.hits += 1;
                Some(schema)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    pub fn set(&self, tool_id: ToolId, schema: serde_json::Value) {
        let mut inner = self.guard();
        if let Some(entry) = inner.entries.get_mut(&tool_id) {
            entry.schema = schema;
            return;
        }
        inner.entries.push(
            tool_id,
            Entry {
                schema,
                hit_count: 0,
            },
        );
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.guard();
        let total = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }

    /// Hottest tools by descending hit count.
    pub fn top_tools(&self, limit: usize) -> Vec<(ToolId, u64)> {
        let inner = self.guard();
        let mut tools: Vec<(ToolId, u64)> = inner
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.hit_count))
            .collect();
        tools.sort_by(|a, b| b.1.cmp(&a.1));
        tools.truncate(limit);
        tools
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Content-derived schema versions per tool. A changed version invalidates
/// any downstream cache whose key includes it.
#[derive(Default)]
pub struct ToolVersionMap {
    versions: Mutex<HashMap<ToolId, String>>,
}

impl ToolVersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(schema: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(schema.to_string().as_bytes());
        hex::encode(hasher.finalize())[..VERSION_TAG_LEN].to_string()
    }

    /// Record the schema for a tool. Returns true when the version changed
    /// (including the first sighting).
    pub fn set(&self, tool_id: &ToolId, schema: &serde_json::Value) -> bool {
        let version = Self::digest(schema);
        let mut versions = self.versions.lock().unwrap_or_else(|e| e.into_inner());
        match versions.insert(tool_id.clone(), version.clone()) {
            Some(previous) => previous != version,
            None => true,
        }
    }

    pub fn get(&self, tool_id: &ToolId) -> Option<String> {
        self.versions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests;
