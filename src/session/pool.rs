//! Fixed-capacity pool of backend tool-server clients.
//!
//! Clients are created lazily through the injected factory, reused while
//! warm, and disconnected once idle past the timeout. A full pool fails fast
//! with `pool_exhausted` rather than queueing.

use crate::backend::{BackendFactory, ToolBackend};
use crate::config::SessionConfig;
use crate::errors::{GatewayError, GatewayResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

struct PooledClient {
    client: Arc<dyn ToolBackend>,
    last_used: Instant,
}

pub struct ConnectionPool {
    config: SessionConfig,
    factory: Arc<dyn BackendFactory>,
    clients: Mutex<HashMap<String, PooledClient>>,
}

impl ConnectionPool {
    pub fn new(config: SessionConfig, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            config,
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Get a client for `server_id`, reusing a warm one when available.
    pub async fn acquire(&self, server_id: &str) -> GatewayResult<Arc<dyn ToolBackend>> {
        let mut clients = self.clients.lock().await;
        Self::sweep_idle(&mut clients, self.config.idle_timeout_secs).await;

        if let Some(pooled) = clients.get_mut(server_id) {
            pooled.last_used = Instant::now();
            return Ok(pooled.client.clone());
        }
        if clients.len() >= self.config.max_connections {
            return Err(GatewayError::PoolExhausted {
                max: self.config.max_connections,
            });
        }

        let connect = self.factory.connect(server_id);
        let timeout = Duration::from_secs(self.config.connection_timeout_secs);
        let client = match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                return Err(GatewayError::BackendTool {
                    tool: server_id.to_string(),
                    message: format!("connect failed: {e}"),
                });
            }
            Err(_) => return Err(GatewayError::Timeout(timeout.as_millis() as u64)),
        };
        info!("backend client connected: {}", server_id);
        clients.insert(
            server_id.to_string(),
            PooledClient {
                client: client.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(client)
    }

    /// Reset the idle timer after a completed call.
    pub async fn release(&self, server_id: &str) {
        let mut clients = self.clients.lock().await;
        if let Some(pooled) = clients.get_mut(server_id) {
            pooled.last_used = Instant::now();
        }
    }

    pub async fn active_connections(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Disconnect everything and drop all timers.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (server_id, pooled) in clients.drain() {
            debug!("disconnecting backend client {}", server_id);
            pooled.client.disconnect().await;
        }
    }

    async fn sweep_idle(clients: &mut HashMap<String, PooledClient>, idle_timeout_secs: u64) {
        let idle = Duration::from_secs(idle_timeout_secs);
        let expired: Vec<String> = clients
            .iter()
            .filter(|(_, pooled)| pooled.last_used.elapsed() > idle)
            .map(|(id, _)| id.clone())
            .collect();
        for server_id in expired {
            if let Some(pooled) = clients.remove(&server_id) {
                warn!("backend client {} idle-timed out, disconnecting", server_id);
                pooled.client.disconnect().await;
            }
        }
    }
}
