//! CoreRuntime: one explicit value owning every component, constructed at
//! startup from plain constructor injection (store, encoder, backend factory,
//! sandbox). No global singletons; everything reaches its collaborators
//! through this struct.

use crate::backend::BackendFactory;
use crate::cache::{SchemaCache, ToolVersionMap};
use crate::capability::{CapabilityStore, Fqdn, ToolId};
use crate::config::Config;
use crate::decision::DecisionEngine;
use crate::discovery::DiscoveryService;
use crate::embedding::{Embedder, EmbeddingFacade};
use crate::errors::{GatewayError, GatewayResult};
use crate::executor::{ControlledDagExecutor, Task, TaskInvoker, TaskType};
use crate::feedback::FeedbackSink;
use crate::graph::Hypergraph;
use crate::graph::shgat::{ShgatConfig, ShgatScorer};
use crate::sandbox::{CodeSandbox, InjectedTool, SandboxRequest};
use crate::session::{ConnectionPool, PackageSessionRegistry};
use crate::storage::Db;
use crate::threshold::AdaptiveThresholdManager;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct CoreRuntime {
    pub config: Config,
    pub db: Arc<Db>,
    pub facade: Arc<EmbeddingFacade>,
    pub graph: Arc<Hypergraph>,
    pub scorer: Arc<ShgatScorer>,
    pub store: Arc<CapabilityStore>,
    pub discovery: Arc<DiscoveryService>,
    pub thresholds: Arc<AdaptiveThresholdManager>,
    pub decision: DecisionEngine,
    pub executor: ControlledDagExecutor,
    pub schema_cache: SchemaCache,
    pub tool_versions: ToolVersionMap,
    pub pool: Arc<ConnectionPool>,
    pub package_sessions: PackageSessionRegistry,
    pub sandbox: Arc<dyn CodeSandbox>,
    pub feedback: Arc<FeedbackSink>,
    started_at: Instant,
}

impl CoreRuntime {
    pub fn new(
        config: Config,
        embedder: Arc<dyn Embedder>,
        backend_factory: Arc<dyn BackendFactory>,
        sandbox: Arc<dyn CodeSandbox>,
    ) -> GatewayResult<Arc<Self>> {
        let db = match &config.storage.db_path {
            Some(path) if path.as_os_str() == ":memory:" => Db::open_in_memory(),
            Some(path) => Db::open(path),
            None => {
                let home = crate::utils::get_toolweave_home().map_err(GatewayError::Internal)?;
                Db::open(&home.join("toolweave.db"))
            }
        }
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
        let db = Arc::new(db);

        let facade = Arc::new(EmbeddingFacade::with_cache_size(
            embedder,
            config.embedding.cache_size,
        ));
        let graph = Arc::new(Hypergraph::new());
        let scorer = Arc::new(ShgatScorer::new(
            graph.clone(),
            ShgatConfig::new(config.embedding.dimension),
        ));
        let store = Arc::new(CapabilityStore::new(db.clone()));
        let discovery = Arc::new(DiscoveryService::new(
            facade.clone(),
            scorer.clone(),
            graph.clone(),
            store.clone(),
            config.discovery.clone(),
        ));
        let thresholds = Arc::new(AdaptiveThresholdManager::new(
            config.thresholds.clone(),
            db.clone(),
        ));
        let decision = DecisionEngine::new(&config.safety);
        let pool = Arc::new(ConnectionPool::new(
            config.sessions.clone(),
            backend_factory,
        ));
        let feedback = Arc::new(FeedbackSink::new(
            graph.clone(),
            store.clone(),
            thresholds.clone(),
            scorer.clone(),
            facade.clone(),
        ));
        let invoker = Arc::new(RuntimeInvoker {
            pool: pool.clone(),
            store: store.clone(),
            sandbox: sandbox.clone(),
            sandbox_config: config.sandbox.clone(),
        });
        let executor = ControlledDagExecutor::new(
            config.executor.clone(),
            db.clone(),
            invoker,
            Some(discovery.clone()),
            Some(feedback.clone()),
        );

        // Warm the hypergraph with the already-learned capabilities so
        // scoring works from the first request.
        match store.list(10_000, 0) {
            Ok(capabilities) => {
                for capability in &capabilities {
                    graph.ensure_capability(capability);
                }
                info!("hypergraph seeded with {} capabilities", capabilities.len());
            }
            Err(e) => warn!("failed to seed hypergraph: {}", e),
        }

        Ok(Arc::new(Self {
            config,
            db,
            facade,
            graph,
            scorer,
            store,
            discovery,
            thresholds,
            decision,
            executor,
            schema_cache: SchemaCache::default(),
            tool_versions: ToolVersionMap::new(),
            pool,
            package_sessions: PackageSessionRegistry::default(),
            sandbox,
            feedback,
            started_at: Instant::now(),
        }))
    }

    /// Connect configured backend servers, cache their schemas, and register
    /// their tools as hypergraph nodes.
    pub async fn sync_backend_tools(&self) {
        let servers: Vec<String> = self
            .config
            .servers
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        for server_id in servers {
            let client = match self.pool.acquire(&server_id).await {
                Ok(client) => client,
                Err(e) => {
                    warn!("backend {} unavailable: {}", server_id, e);
                    continue;
                }
            };
            match client.list_tools().await {
                Ok(tools) => {
                    let count = tools.len();
                    for descriptor in tools {
                        let tool_id = ToolId::new(server_id.clone(), descriptor.name);
                        self.schema_cache
                            .set(tool_id.clone(), descriptor.input_schema.clone());
                        self.tool_versions.set(&tool_id, &descriptor.input_schema);
                        let embedding = match self.facade.encode(&descriptor.description).await {
                            Ok(v) => v.to_vec(),
                            Err(_) => Vec::new(),
                        };
                        self.graph.ensure_tool(&tool_id, embedding);
                    }
                    info!("backend {} registered {} tools", server_id, count);
                }
                Err(e) => warn!("tool listing failed for {}: {}", server_id, e),
            }
            self.pool.release(&server_id).await;
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub async fn health(&self) -> Value {
        let capability_count = self.store.count().unwrap_or(0);
        serde_json::json!({
            "status": "ok",
            "version": crate::VERSION,
            "uptime_secs": self.uptime_secs(),
            "capabilities": capability_count,
            "graph_nodes": self.graph.snapshot().node_count(),
            "active_workflows": self.executor.registry().len(),
            "pool_connections": self.pool.active_connections().await,
        })
    }
}

/// Production task invoker: tools go through the connection pool, capability
/// code runs in the sandbox with its recorded tool set injected.
struct RuntimeInvoker {
    pool: Arc<ConnectionPool>,
    store: Arc<CapabilityStore>,
    sandbox: Arc<dyn CodeSandbox>,
    sandbox_config: crate::config::SandboxConfig,
}

#[async_trait]
impl TaskInvoker for RuntimeInvoker {
    async fn invoke(
        &self,
        task: &Task,
        arguments: serde_json::Map<String, Value>,
    ) -> GatewayResult<Value> {
        match task.task_type {
            TaskType::Tool => {
                let tool_id = ToolId::parse(&task.call_name)
                    .map_err(|e| GatewayError::InvalidParams(e.to_string()))?;
                let client = self.pool.acquire(&tool_id.server).await?;
                let result = client
                    .call_tool(&tool_id.tool, Value::Object(arguments))
                    .await
                    .map_err(|e| GatewayError::BackendTool {
                        tool: tool_id.to_string(),
                        message: e.to_string(),
                    });
                self.pool.release(&tool_id.server).await;
                result
            }
            TaskType::Capability => {
                let fqdn = Fqdn::parse(&task.call_name)
                    .map_err(|e| GatewayError::InvalidParams(e.to_string()))?;
                let capability = self
                    .store
                    .find_by_fqdn(&fqdn)?
                    .ok_or_else(|| GatewayError::NotFound(format!("capability {fqdn}")))?;
                let tools = capability
                    .tools_used
                    .iter()
                    .map(|t| InjectedTool {
                        name: t.to_string(),
                        description: None,
                        schema: None,
                    })
                    .collect();
                let outcome = self
                    .sandbox
                    .execute(SandboxRequest {
                        code: capability.code_snippet.clone(),
                        intent: None,
                        context: Some(Value::Object(arguments)),
                        config: self.sandbox_config.clone(),
                        tools,
                    })
                    .await?;
                if outcome.success {
                    Ok(outcome.result)
                } else {
                    Err(GatewayError::BackendTool {
                        tool: fqdn.to_string(),
                        message: outcome
                            .error
                            .unwrap_or_else(|| "capability execution failed".to_string()),
                    })
                }
            }
        }
    }
}
