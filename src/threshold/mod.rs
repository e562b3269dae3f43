//! Adaptive confidence thresholds.
//!
//! A sliding window over recent execution outcomes drives per-context
//! adjustment of the suggestion threshold: too many failed speculative runs
//! push it up, too many accepted near-threshold suggestions pull it down.
//! Adjusted values are upserted into the store keyed by context hash.

use crate::config::ThresholdConfig;
use crate::errors::{GatewayError, GatewayResult};
use crate::storage::Db;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Fixed, sorted key list for context hashing. Missing keys hash as
/// `default` so equivalent contexts always collide.
const CONTEXT_KEYS: [&str; 3] = ["complexity", "domain", "workflow_type"];
/// Adjustment cadence: every this many records, once the window is warm.
const ADJUST_EVERY: u64 = 10;
const MIN_WINDOW_FOR_ADJUST: usize = 20;
/// Rates are computed over this many most-recent records.
const RATE_SAMPLE: usize = 20;
const FP_RATE_LIMIT: f64 = 0.20;
const FN_RATE_LIMIT: f64 = 0.30;
/// A suggestion this close under the threshold counts as a near-miss.
const NEAR_MISS_MARGIN: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Speculative,
    Suggestion,
    Explicit,
}

/// One execution outcome, appended to the sliding window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub confidence: f64,
    pub mode: ExecutionMode,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_accepted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    pub context_hash: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub explicit: f64,
    pub suggestion: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdMetrics {
    pub window_len: usize,
    pub speculative_total: usize,
    pub speculative_hit_rate: f64,
    /// `saved_latency - wasted_compute` over the window, in ms.
    pub net_benefit_ms: f64,
    pub avg_confidence: f64,
    pub suggestion_total: usize,
    pub explicit_total: usize,
}

/// Deterministic digest of the context mapping over the fixed key list.
pub fn context_hash(context: &BTreeMap<String, String>) -> String {
    CONTEXT_KEYS
        .iter()
        .map(|key| {
            let value = context.get(*key).map_or("default", String::as_str);
            format!("{key}:{value}")
        })
        .collect::<Vec<_>>()
        .join("|")
}

struct ContextState {
    thresholds: Thresholds,
    context_keys: BTreeMap<String, String>,
    sample_count: u64,
}

pub struct AdaptiveThresholdManager {
    config: ThresholdConfig,
    db: Arc<Db>,
    inner: Mutex<Inner>,
}

struct Inner {
    window: VecDeque<ExecutionRecord>,
    contexts: HashMap<String, ContextState>,
    total_records: u64,
}

impl AdaptiveThresholdManager {
    pub fn new(config: ThresholdConfig, db: Arc<Db>) -> Self {
        Self {
            config,
            db,
            inner: Mutex::new(Inner {
                window: VecDeque::new(),
                contexts: HashMap::new(),
                total_records: 0,
            }),
        }
    }

    /// Thresholds for a context: cached, store-loaded, or defaults.
    pub fn load(&self, context: &BTreeMap<String, String>) -> GatewayResult<Thresholds> {
        let hash = context_hash(context);
        {
            let inner = self.guard();
            if let Some(state) = inner.contexts.get(&hash) {
                return Ok(state.thresholds);
            }
        }
        let loaded = self.load_stored(&hash)?;
        let thresholds = loaded.unwrap_or(Thresholds {
            explicit: self.config.explicit_default,
            suggestion: self.config.suggestion_default,
        });
        let mut inner = self.guard();
        inner.contexts.entry(hash).or_insert(ContextState {
            thresholds,
            context_keys: context.clone(),
            sample_count: 0,
        });
        Ok(thresholds)
    }

    /// Append a record; every `ADJUST_EVERY` records (window permitting) the
    /// record's context is re-adjusted and persisted on change.
    pub fn record(&self, record: ExecutionRecord) -> GatewayResult<()> {
        let hash = record.context_hash.clone();
        let adjustment = {
            let mut inner = self.guard();
            inner.window.push_back(record);
            while inner.window.len() > self.config.window_size {
                inner.window.pop_front();
            }
            inner.total_records += 1;
            let warm = inner.window.len() >= MIN_WINDOW_FOR_ADJUST;
            if warm && inner.total_records % ADJUST_EVERY == 0 {
                self.adjust_locked(&mut inner, &hash)
            } else {
                None
            }
        };
        if let Some((thresholds, context_keys, sample_count)) = adjustment {
            self.persist(&hash, &thresholds, &context_keys, sample_count)?;
        }
        Ok(())
    }

    /// Recompute false-positive / false-negative rates over the most recent
    /// records and nudge the suggestion threshold. Returns the new state when
    /// it changed, for persistence outside the lock.
    fn adjust_locked(
        &self,
        inner: &mut Inner,
        hash: &str,
    ) -> Option<(Thresholds, BTreeMap<String, String>, u64)> {
        let recent: Vec<&ExecutionRecord> =
            inner.window.iter().rev().take(RATE_SAMPLE).collect();

        let speculative: Vec<_> = recent
            .iter()
            .filter(|r| r.mode == ExecutionMode::Speculative)
            .collect();
        let suggestions: Vec<_> = recent
            .iter()
            .filter(|r| r.mode == ExecutionMode::Suggestion)
            .collect();

        let state = inner.contexts.entry(hash.to_string()).or_insert(ContextState {
            thresholds: Thresholds {
                explicit: self.config.explicit_default,
                suggestion: self.config.suggestion_default,
            },
            context_keys: BTreeMap::new(),
            sample_count: 0,
        });
        state.sample_count += ADJUST_EVERY;
        let current = state.thresholds.suggestion;

        let fp_rate = if speculative.is_empty() {
            0.0
        } else {
            speculative.iter().filter(|r| !r.success).count() as f64 / speculative.len() as f64
        };
        let fn_rate = if suggestions.is_empty() {
            0.0
        } else {
            suggestions
                .iter()
                .filter(|r| {
                    r.user_accepted.unwrap_or(false)
                        && r.confidence >= current - NEAR_MISS_MARGIN
                })
                .count() as f64
                / suggestions.len() as f64
        };

        let lr = self.config.learning_rate;
        let updated = if fp_rate > FP_RATE_LIMIT {
            (current + lr * fp_rate).min(self.config.max_threshold)
        } else if fn_rate > FN_RATE_LIMIT {
            (current - lr * fn_rate).max(self.config.min_threshold)
        } else {
            current
        };

        debug!(
            "threshold adjust for {}: fp={:.3} fn={:.3} suggestion {:.4} -> {:.4}",
            hash, fp_rate, fn_rate, current, updated
        );
        if (updated - current).abs() < f64::EPSILON {
            return None;
        }
        state.thresholds.suggestion = updated;
        info!(
            "suggestion threshold for {} adjusted to {:.4} (fp={:.2}, fn={:.2})",
            hash, updated, fp_rate, fn_rate
        );
        Some((state.thresholds, state.context_keys.clone(), state.sample_count))
    }

    pub fn metrics(&self) -> ThresholdMetrics {
        let inner = self.guard();
        let window = &inner.window;
        let speculative: Vec<_> = window
            .iter()
            .filter(|r| r.mode == ExecutionMode::Speculative)
            .collect();
        let hits = speculative.iter().filter(|r| r.success).count();
        let saved: f64 = speculative
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.execution_time_ms)
            .map(|ms| ms as f64)
            .sum();
        let wasted: f64 = speculative
            .iter()
            .filter(|r| !r.success)
            .filter_map(|r| r.execution_time_ms)
            .map(|ms| ms as f64)
            .sum();
        ThresholdMetrics {
            window_len: window.len(),
            speculative_total: speculative.len(),
            speculative_hit_rate: if speculative.is_empty() {
                0.0
            } else {
                hits as f64 / speculative.len() as f64
            },
            net_benefit_ms: saved - wasted,
            avg_confidence: if window.is_empty() {
                0.0
            } else {
                window.iter().map(|r| r.confidence).sum::<f64>() / window.len() as f64
            },
            suggestion_total: window
                .iter()
                .filter(|r| r.mode == ExecutionMode::Suggestion)
                .count(),
            explicit_total: window
                .iter()
                .filter(|r| r.mode == ExecutionMode::Explicit)
                .count(),
        }
    }

    pub fn window_len(&self) -> usize {
        self.guard().window.len()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load_stored(&self, hash: &str) -> GatewayResult<Option<Thresholds>> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT explicit_threshold, suggestion_threshold
                     FROM adaptive_thresholds WHERE context_hash = ?1",
                    params![hash],
                    |row| {
                        Ok(Thresholds {
                            explicit: row.get(0)?,
                            suggestion: row.get(1)?,
                        })
                    },
                )
                .optional()
            })
            .map_err(|e| GatewayError::Storage(e.to_string()))
    }

    fn persist(
        &self,
        hash: &str,
        thresholds: &Thresholds,
        context_keys: &BTreeMap<String, String>,
        sample_count: u64,
    ) -> GatewayResult<()> {
        let now = Utc::now().to_rfc3339();
        let keys_json = serde_json::to_string(context_keys)
            .map_err(|e| GatewayError::Storage(e.to_string()))?;
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO adaptive_thresholds
                       (context_hash, context_keys_json, suggestion_threshold,
                        explicit_threshold, success_rate, sample_count, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, NULL, ?5, ?6, ?6)
                     ON CONFLICT(context_hash) DO UPDATE SET
                       suggestion_threshold = ?3,
                       explicit_threshold = ?4,
                       sample_count = ?5,
                       updated_at = ?6",
                    params![
                        hash,
                        keys_json,
                        thresholds.suggestion,
                        thresholds.explicit,
                        sample_count as i64,
                        now,
                    ],
                )?;
                Ok(())
            })
            .map_err(|e| GatewayError::Storage(e.to_string()))?;
        Ok(())
    }
}
