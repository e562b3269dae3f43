use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Embedder that counts calls and optionally delays, for coalescing tests.
struct CountingEmbedder {
    calls: AtomicUsize,
    delay_ms: u64,
    fail: bool,
}

impl CountingEmbedder {
    fn new(delay_ms: u64) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay_ms,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay_ms: 0,
            fail: true,
        }
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail {
            anyhow::bail!("encoder offline");
        }
        Ok(vec![text.len() as f32, 1.0, 2.0, 3.0])
    }

    fn dimension(&self) -> usize {
        4
    }
}

#[tokio::test]
async fn test_encode_normalizes() {
    let facade = EmbeddingFacade::new(Arc::new(CountingEmbedder::new(0)));
    let vec = facade.encode("hello").await.unwrap();
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn test_cache_hit_skips_encoder() {
    let inner = Arc::new(CountingEmbedder::new(0));
    let facade = EmbeddingFacade::new(inner.clone());
    facade.encode("same text").await.unwrap();
    facade.encode("same text").await.unwrap();
    assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_calls_coalesce() {
    let inner = Arc::new(CountingEmbedder::new(50));
    let facade = Arc::new(EmbeddingFacade::new(inner.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let f = facade.clone();
        handles.push(tokio::spawn(async move { f.encode("shared intent").await }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    // All eight callers share a single in-flight encode.
    assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failure_propagates_and_allows_retry() {
    let inner = Arc::new(CountingEmbedder::failing());
    let facade = EmbeddingFacade::new(inner.clone());
    assert!(facade.encode("x").await.is_err());
    // Slot cleared; second call hits the encoder again rather than a cached error.
    assert!(facade.encode("x").await.is_err());
    assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_hash_embedder_deterministic() {
    let e = HashEmbedder::new(64);
    let a = e.encode("read the package file").await.unwrap();
    let b = e.encode("read the package file").await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a.len(), 64);

    let c = e.encode("post to http").await.unwrap();
    assert_ne!(a, c);
}
