//! Embedding facade: cache-and-dedupe wrapper over an external encoder.
//!
//! Every incoming intent is encoded exactly once; the resulting vector is
//! passed through the discovery pipeline so no downstream component
//! re-encodes. Concurrent callers asking for the same text share one in-flight
//! encode via a request-coalescing map.

#[cfg(feature = "embeddings")]
mod local;

#[cfg(feature = "embeddings")]
pub use local::LocalEmbedder;

use crate::utils::math::l2_normalize;
use anyhow::Result;
use async_trait::async_trait;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

const DEFAULT_CACHE_SIZE: usize = 10_000;

/// Black-box text encoder. Implementations: fastembed (`LocalEmbedder`),
/// deterministic hashing (`HashEmbedder`), stubs in tests.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;
    fn dimension(&self) -> usize;
}

#[derive(Clone)]
enum Inflight {
    Pending,
    Done(Result<Arc<Vec<f32>>, String>),
}

pub struct EmbeddingFacade {
    inner: Arc<dyn Embedder>,
    cache: std::sync::Mutex<LruCache<String, Arc<Vec<f32>>>>,
    inflight: tokio::sync::Mutex<HashMap<String, watch::Receiver<Inflight>>>,
}

impl EmbeddingFacade {
    pub fn new(inner: Arc<dyn Embedder>) -> Self {
        Self::with_cache_size(inner, DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(inner: Arc<dyn Embedder>, cache_size: usize) -> Self {
        let cap = NonZeroUsize::new(cache_size.max(1)).expect("cache size must be > 0");
        Self {
            inner,
            cache: std::sync::Mutex::new(LruCache::new(cap)),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    /// Encode `text`, returning an L2-normalized vector.
    ///
    /// At most one encode per unique text is in flight at any time; concurrent
    /// callers wait on the leader's result. Failures propagate to every waiter
    /// and clear the in-flight slot so a later call may retry.
    pub async fn encode(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        if let Some(cached) = self.cache_get(text) {
            debug!("embedding cache hit (len={})", text.len());
            return Ok(cached);
        }

        // Either join an in-flight encode or become the leader for this text.
        let tx = {
            let mut inflight = self.inflight.lock().await;
            if let Some(rx) = inflight.get(text) {
                let mut rx = rx.clone();
                drop(inflight);
                let state = rx
                    .wait_for(|s| matches!(s, Inflight::Done(_)))
                    .await
                    .map(|s| s.clone());
                return match state {
                    Ok(Inflight::Done(Ok(vec))) => Ok(vec),
                    Ok(Inflight::Done(Err(msg))) => Err(anyhow::anyhow!(msg)),
                    // Leader dropped without publishing (cancelled); retry fresh.
                    _ => Box::pin(self.encode(text)).await,
                };
            }
            let (tx, rx) = watch::channel(Inflight::Pending);
            inflight.insert(text.to_string(), rx);
            tx
        };

        let result = self.encode_inner(text).await;
        self.inflight.lock().await.remove(text);
        match result {
            Ok(vec) => {
                let _ = tx.send(Inflight::Done(Ok(vec.clone())));
                Ok(vec)
            }
            Err(e) => {
                let _ = tx.send(Inflight::Done(Err(e.to_string())));
                Err(e)
            }
        }
    }

    async fn encode_inner(&self, text: &str) -> Result<Arc<Vec<f32>>> {
        let mut vec = self.inner.encode(text).await?;
        l2_normalize(&mut vec);
        let vec = Arc::new(vec);
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(text.to_string(), vec.clone());
        Ok(vec)
    }

    fn cache_get(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(text)
            .cloned()
    }
}

/// Deterministic fallback encoder: hashes whitespace tokens into `dimension`
/// buckets. No semantic power, but keeps discovery functional when the
/// `embeddings` feature is compiled out.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    fn token_bucket(&self, token: &str) -> (usize, f32) {
        // FNV-1a over the lowercased token.
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in token.to_lowercase().bytes() {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let bucket = (hash % self.dimension as u64) as usize;
        let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let mut vec = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            let (bucket, sign) = self.token_bucket(token);
            vec[bucket] += sign;
        }
        Ok(vec)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests;
