use super::*;
use crate::backend::{BackendFactory, ToolBackend, ToolDescriptor};
use crate::config::SessionConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct FakeBackend {
    disconnects: Arc<AtomicUsize>,
}

#[async_trait]
impl ToolBackend for FakeBackend {
    async fn call_tool(&self, _tool: &str, _arguments: Value) -> anyhow::Result<Value> {
        Ok(Value::Null)
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
        Ok(vec![])
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeFactory {
    connects: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    hang: bool,
}

impl FakeFactory {
    fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            disconnects: Arc::new(AtomicUsize::new(0)),
            hang: false,
        }
    }
}

#[async_trait]
impl BackendFactory for FakeFactory {
    async fn connect(&self, _server_id: &str) -> anyhow::Result<Arc<dyn ToolBackend>> {
        if self.hang {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeBackend {
            disconnects: self.disconnects.clone(),
        }))
    }
}

fn config(max: usize, idle_secs: u64) -> SessionConfig {
    SessionConfig {
        max_connections: max,
        idle_timeout_secs: idle_secs,
        connection_timeout_secs: 1,
    }
}

#[tokio::test]
async fn test_acquire_reuses_warm_client() {
    let factory = Arc::new(FakeFactory::new());
    let pool = ConnectionPool::new(config(4, 300), factory.clone());
    pool.acquire("fs").await.unwrap();
    pool.acquire("fs").await.unwrap();
    assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    assert_eq!(pool.active_connections().await, 1);
}

#[tokio::test]
async fn test_pool_exhausted() {
    let factory = Arc::new(FakeFactory::new());
    let pool = ConnectionPool::new(config(2, 300), factory);
    pool.acquire("a").await.unwrap();
    pool.acquire("b").await.unwrap();
    let err = match pool.acquire("c").await {
        Err(e) => e,
        Ok(_) => panic!("expected acquire to fail"),
    };
    assert_eq!(err.kind(), "pool_exhausted");
}

#[tokio::test]
async fn test_connect_timeout() {
    let factory = Arc::new(FakeFactory {
        hang: true,
        ..FakeFactory::new()
    });
    let pool = ConnectionPool::new(config(2, 300), factory);
    let err = match pool.acquire("slow").await {
        Err(e) => e,
        Ok(_) => panic!("expected acquire to fail"),
    };
    assert_eq!(err.kind(), "timeout");
}

#[tokio::test]
async fn test_idle_clients_swept_on_access() {
    let factory = Arc::new(FakeFactory::new());
    let pool = ConnectionPool::new(config(4, 0), factory.clone());
    pool.acquire("a").await.unwrap();
    // idle_timeout 0: by the next acquire the client has expired.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    pool.acquire("b").await.unwrap();
    assert_eq!(factory.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(pool.active_connections().await, 1);
}

#[tokio::test]
async fn test_close_disconnects_all() {
    let factory = Arc::new(FakeFactory::new());
    let pool = ConnectionPool::new(config(4, 300), factory.clone());
    pool.acquire("a").await.unwrap();
    pool.acquire("b").await.unwrap();
    pool.close().await;
    assert_eq!(factory.disconnects.load(Ordering::SeqCst), 2);
    assert_eq!(pool.active_connections().await, 0);
}

#[test]
fn test_package_session_lifecycle() {
    let registry = PackageSessionRegistry::new(900);
    let session = registry.register("user:abc", "pml-client");
    assert_eq!(registry.active().len(), 1);

    registry.heartbeat(&session.session_id, "user:abc").unwrap();

    // Wrong identity is indistinguishable from a missing session.
    let err = registry.heartbeat(&session.session_id, "user:other").unwrap_err();
    assert_eq!(err.kind(), "not_found");
    let err = registry.unregister(&session.session_id, "user:other").unwrap_err();
    assert_eq!(err.kind(), "not_found");

    registry.unregister(&session.session_id, "user:abc").unwrap();
    assert!(registry.active().is_empty());
    let err = registry.heartbeat(&session.session_id, "user:abc").unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[test]
fn test_stale_sessions_swept() {
    let registry = PackageSessionRegistry::new(0);
    let session = registry.register("user:abc", "pml-client");
    std::thread::sleep(std::time::Duration::from_millis(10));
    assert!(registry.active().is_empty());
    assert!(registry.heartbeat(&session.session_id, "user:abc").is_err());
}
