//! HTTP gateway: JSON-RPC endpoint, SSE event streams, package-session
//! routes, and the read-only inspection API.

pub mod guard;
pub mod meta;
pub mod rpc;
pub mod stdio;

pub use guard::{ApiGuard, Identity};

use crate::errors::GatewayError;
use crate::executor::BusEvent;
use crate::graph::NodeKind;
use crate::graph::pathfinder::Pathfinder;
use crate::runtime::CoreRuntime;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Cadence of the background SHGAT training flush.
const TRAINING_FLUSH_SECS: u64 = 60;

#[derive(Clone)]
pub struct GatewayState {
    pub runtime: Arc<CoreRuntime>,
    pub guard: Arc<ApiGuard>,
}

/// Error wrapper mapping gateway error kinds onto HTTP statuses.
struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            "invalid_params" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
            "pool_exhausted" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(json!({ "error": self.0.kind(), "message": self.0.to_string() })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_post).get(events_stream))
        .route("/health", get(health))
        .route("/events/stream", get(events_stream))
        .route("/pml/register", post(pml_register))
        .route("/pml/heartbeat", post(pml_heartbeat))
        .route("/pml/unregister", post(pml_unregister))
        .route("/api/capabilities", get(api_capabilities))
        .route("/api/graph/hypergraph", get(api_hypergraph))
        .route("/api/metrics", get(api_metrics))
        .route("/api/tools/search", get(api_tools_search))
        .route("/api/graph/path", get(api_graph_path))
        .route("/api/graph/related", get(api_graph_related))
        .layer(middleware::from_fn_with_state(state.clone(), guard_middleware))
        .with_state(state)
}

/// Serve HTTP until shutdown. Also kicks off backend tool sync and the
/// periodic training flush.
pub async fn serve(runtime: Arc<CoreRuntime>) -> anyhow::Result<()> {
    let state = GatewayState {
        guard: Arc::new(ApiGuard::new(&runtime.config.gateway)),
        runtime: runtime.clone(),
    };
    runtime.sync_backend_tools().await;

    {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(TRAINING_FLUSH_SECS));
            loop {
                ticker.tick().await;
                runtime.feedback.flush_training().await;
            }
        });
    }

    let addr = format!(
        "{}:{}",
        runtime.config.gateway.host, runtime.config.gateway.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("gateway listening on http://{}", addr);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

async fn guard_middleware(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if ApiGuard::is_public(&method, &path) {
        return next.run(request).await;
    }
    let Some(identity) = state.guard.identity(request.headers()) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    };
    if state.guard.check_rate(&identity).is_err() {
        warn!("rate limited: {}", identity.0);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "rate_limited" })),
        )
            .into_response();
    }
    let mut request = request;
    request.extensions_mut().insert(identity);
    next.run(request).await
}

fn caller(identity: Option<&Extension<Identity>>) -> String {
    identity.map_or_else(|| "local:shared".to_string(), |i| i.0.0.clone())
}

// ---------------------------------------------------------------------------
// JSON-RPC + events
// ---------------------------------------------------------------------------

async fn mcp_post(
    State(state): State<GatewayState>,
    identity: Option<Extension<Identity>>,
    body: axum::body::Bytes,
) -> Json<rpc::JsonRpcResponse> {
    let identity = caller(identity.as_ref());
    Json(rpc::handle_frame(&state.runtime, &identity, &body).await)
}

async fn events_stream(
    State(state): State<GatewayState>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.runtime.executor.subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(BusEvent { workflow_id, event }) => {
                    let payload = json!({
                        "workflow_id": workflow_id.to_string(),
                        "event": event,
                    });
                    let sse_event = Event::default().data(payload.to_string());
                    return Some((Ok(sse_event), rx));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event stream lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health(State(state): State<GatewayState>) -> Json<Value> {
    Json(state.runtime.health().await)
}

// ---------------------------------------------------------------------------
// Package sessions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterBody {
    package: String,
}

async fn pml_register(
    State(state): State<GatewayState>,
    identity: Option<Extension<Identity>>,
    Json(body): Json<RegisterBody>,
) -> ApiResult {
    let identity = caller(identity.as_ref());
    let session = state.runtime.package_sessions.register(&identity, &body.package);
    Ok(Json(json!({ "session_id": session.session_id })))
}

#[derive(Deserialize)]
struct SessionBody {
    session_id: String,
}

async fn pml_heartbeat(
    State(state): State<GatewayState>,
    identity: Option<Extension<Identity>>,
    Json(body): Json<SessionBody>,
) -> ApiResult {
    let identity = caller(identity.as_ref());
    state
        .runtime
        .package_sessions
        .heartbeat(&body.session_id, &identity)?;
    Ok(Json(json!({ "ok": true })))
}

async fn pml_unregister(
    State(state): State<GatewayState>,
    identity: Option<Extension<Identity>>,
    Json(body): Json<SessionBody>,
) -> ApiResult {
    let identity = caller(identity.as_ref());
    state
        .runtime
        .package_sessions
        .unregister(&body.session_id, &identity)?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Inspection API
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    50
}

async fn api_capabilities(
    State(state): State<GatewayState>,
    Query(page): Query<PageQuery>,
) -> ApiResult {
    let capabilities = state.runtime.store.list(page.limit.min(200), page.offset)?;
    let items: Vec<Value> = capabilities
        .iter()
        .map(|c| {
            json!({
                "id": c.id.to_string(),
                "fqdn": c.fqdn.to_string(),
                "tools_used": c.tools_used,
                "success_rate": c.success_rate,
                "usage_count": c.usage_count,
                "avg_duration_ms": c.avg_duration_ms,
                "last_used": c.last_used.to_rfc3339(),
                "source": c.source,
            })
        })
        .collect();
    Ok(Json(json!({
        "total": state.runtime.store.count()?,
        "items": items,
    })))
}

async fn api_hypergraph(State(state): State<GatewayState>) -> ApiResult {
    let snapshot = state.runtime.graph.snapshot();
    let pagerank = state.runtime.graph.pagerank();
    let communities = state.runtime.graph.communities();

    let nodes: Vec<Value> = snapshot
        .nodes
        .iter()
        .map(|node| {
            json!({
                "id": node.id,
                "label": node.kind.label(),
                "kind": if node.kind.is_tool() { "tool" } else { "capability" },
                "pagerank": pagerank.get(node.id as usize).copied().unwrap_or(0.0),
                "community": communities.get(node.id as usize).copied().unwrap_or(-1),
                "degree": snapshot.degree(node.id),
            })
        })
        .collect();
    let edges: Vec<Value> = snapshot
        .edges()
        .map(|(&(from, to), edge)| {
            json!({ "from": from, "to": to, "weight": edge.weight, "count": edge.count })
        })
        .collect();
    let hyperedges: Vec<Value> = snapshot
        .hyperedges()
        .iter()
        .map(|he| {
            json!({
                "id": he.id,
                "sources": he.sources,
                "targets": he.targets,
                "weight": he.weight,
            })
        })
        .collect();

    Ok(Json(json!({
        "nodes": nodes,
        "edges": edges,
        "hyperedges": hyperedges,
        "density": snapshot.density(),
        "adaptive_alpha": snapshot.adaptive_alpha(),
    })))
}

#[derive(Deserialize)]
struct MetricsQuery {
    /// When present, also return recent samples for this metric.
    name: Option<String>,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

async fn api_metrics(
    State(state): State<GatewayState>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult {
    let stored = state
        .runtime
        .db
        .metric_summary()
        .map_err(|e| GatewayError::Storage(e.to_string()))?;
    let metrics: Vec<Value> = stored
        .into_iter()
        .map(|(name, count, avg)| json!({ "name": name, "samples": count, "avg": avg }))
        .collect();
    let samples = match &query.name {
        Some(name) => Some(
            state
                .runtime
                .db
                .recent_metrics(name, query.limit.min(200))
                .map_err(|e| GatewayError::Storage(e.to_string()))?
                .into_iter()
                .map(|(ts, value)| json!({ "timestamp": ts, "value": value }))
                .collect::<Vec<_>>(),
        ),
        None => None,
    };
    let cache = state.runtime.schema_cache.stats();
    Ok(Json(json!({
        "metrics": metrics,
        "samples": samples,
        "thresholds": state.runtime.thresholds.metrics(),
        "schema_cache": cache,
        "top_tools": state
            .runtime
            .schema_cache
            .top_tools(10)
            .into_iter()
            .map(|(id, hits)| json!({ "tool_id": id.to_string(), "hits": hits }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    10
}

async fn api_tools_search(
    State(state): State<GatewayState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult {
    let embedding = state
        .runtime
        .facade
        .encode(&query.q)
        .await
        .map_err(GatewayError::Internal)?;
    let scores = state.runtime.scorer.score_all_tools(&embedding, None);
    let items: Vec<Value> = scores
        .into_iter()
        .take(query.limit.min(50))
        .map(|s| json!({ "tool_id": s.tool_id.to_string(), "score": s.score }))
        .collect();
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
struct PathQuery {
    from: String,
    to: String,
}

async fn api_graph_path(
    State(state): State<GatewayState>,
    Query(query): Query<PathQuery>,
) -> ApiResult {
    let snapshot = state.runtime.graph.snapshot();
    let resolve = |name: &str| -> Result<crate::graph::NodeId, GatewayError> {
        let tool_id = crate::capability::ToolId::parse(name)
            .map_err(|e| GatewayError::InvalidParams(e.to_string()))?;
        snapshot
            .resolve(&crate::graph::NodeRef::Tool(tool_id))
            .ok_or_else(|| GatewayError::NotFound(format!("tool {name}")))
    };
    let from = resolve(&query.from)?;
    let to = resolve(&query.to)?;
    let result = Pathfinder::find_shortest_hyperpath(&snapshot, from, to);
    let sequence: Vec<String> = result
        .node_sequence
        .iter()
        .filter_map(|id| snapshot.node(*id).map(|n| n.kind.label()))
        .collect();
    Ok(Json(json!({
        "found": result.found,
        "node_sequence": sequence,
        "path": result.path,
        "total_weight": if result.found { Some(result.total_weight) } else { None },
    })))
}

#[derive(Deserialize)]
struct RelatedQuery {
    tool_id: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

async fn api_graph_related(
    State(state): State<GatewayState>,
    Query(query): Query<RelatedQuery>,
) -> ApiResult {
    let snapshot = state.runtime.graph.snapshot();
    let tool_id = crate::capability::ToolId::parse(&query.tool_id)
        .map_err(|e| GatewayError::InvalidParams(e.to_string()))?;
    let node = snapshot
        .resolve(&crate::graph::NodeRef::Tool(tool_id))
        .ok_or_else(|| GatewayError::NotFound(format!("tool {}", query.tool_id)))?;

    let mut related: Vec<Value> = snapshot
        .nodes
        .iter()
        .filter(|n| n.id != node)
        .filter_map(|n| {
            let score = snapshot.adamic_adar(node, &[n.id]);
            (score > 0.0).then(|| {
                json!({
                    "name": n.kind.label(),
                    "kind": if matches!(n.kind, NodeKind::Tool { .. }) { "tool" } else { "capability" },
                    "score": score,
                })
            })
        })
        .collect();
    related.sort_by(|a, b| {
        b["score"]
            .as_f64()
            .partial_cmp(&a["score"].as_f64())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    related.truncate(query.limit.min(50));
    Ok(Json(json!({ "related": related })))
}

#[cfg(test)]
mod tests;
