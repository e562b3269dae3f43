use super::*;
use crate::backend::{BackendFactory, ToolBackend, ToolDescriptor};
use crate::config::Config;
use crate::embedding::HashEmbedder;
use crate::sandbox::DisabledSandbox;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use tower::ServiceExt;

struct EchoBackend;

#[async_trait]
impl ToolBackend for EchoBackend {
    async fn call_tool(&self, tool: &str, arguments: Value) -> anyhow::Result<Value> {
        Ok(json!({ "tool": tool, "echo": arguments }))
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
        Ok(vec![ToolDescriptor {
            name: "echo".into(),
            description: "echo the arguments back".into(),
            input_schema: json!({ "type": "object" }),
        }])
    }
}

struct EchoFactory;

#[async_trait]
impl BackendFactory for EchoFactory {
    async fn connect(&self, _server_id: &str) -> anyhow::Result<Arc<dyn ToolBackend>> {
        Ok(Arc::new(EchoBackend))
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.db_path = Some(":memory:".into());
    config.embedding.dimension = 16;
    config
}

fn make_state(config: Config) -> GatewayState {
    let runtime = CoreRuntime::new(
        config,
        Arc::new(HashEmbedder::new(16)),
        Arc::new(EchoFactory),
        Arc::new(DisabledSandbox),
    )
    .unwrap();
    GatewayState {
        guard: Arc::new(ApiGuard::new(&runtime.config.gateway)),
        runtime,
    }
}

async fn post_rpc(app: Router, payload: Value) -> Value {
    let req = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint_returns_json() {
    let app = build_router(make_state(test_config()));
    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"], crate::VERSION);
}

#[tokio::test]
async fn test_initialize_roundtrip() {
    let app = build_router(make_state(test_config()));
    let response = post_rpc(
        app,
        json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} }),
    )
    .await;
    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["server_info"]["name"], "toolweave");
    assert!(response["result"]["capabilities"]["tools"].is_object());
}

#[tokio::test]
async fn test_tools_list_has_all_meta_tools() {
    let app = build_router(make_state(test_config()));
    let response = post_rpc(
        app,
        json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
    )
    .await;
    let names: Vec<&str> = response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    for expected in [
        "execute_dag",
        "discover",
        "execute_code",
        "continue",
        "abort",
        "replan",
        "approval_response",
    ] {
        assert!(names.contains(&expected), "missing {expected}");
    }
}

#[tokio::test]
async fn test_parse_error_code() {
    let app = build_router(make_state(test_config()));
    let req = Request::builder()
        .method("POST")
        .uri("/mcp")
        .body(Body::from("{not json"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], -32700);
}

#[tokio::test]
async fn test_method_not_found_code() {
    let app = build_router(make_state(test_config()));
    let response = post_rpc(
        app,
        json!({ "jsonrpc": "2.0", "id": 3, "method": "bogus/method" }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32601);
}

#[tokio::test]
async fn test_execute_dag_requires_intent_or_workflow() {
    let app = build_router(make_state(test_config()));
    let response = post_rpc(
        app,
        json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call",
            "params": { "name": "execute_dag", "arguments": {} }
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn test_execute_dag_with_explicit_workflow_completes() {
    let app = build_router(make_state(test_config()));
    let response = post_rpc(
        app,
        json!({
            "jsonrpc": "2.0", "id": 5, "method": "tools/call",
            "params": {
                "name": "execute_dag",
                "arguments": {
                    "workflow": {
                        "tasks": [
                            { "id": "task_0", "call_name": "mock:echo", "type": "tool",
                              "arguments": { "path": "package.json" } },
                            { "id": "task_1", "call_name": "mock:echo", "type": "tool",
                              "depends_on": ["task_0"] }
                        ]
                    }
                }
            }
        }),
    )
    .await;
    let result = &response["result"];
    assert_eq!(result["status"], "completed");
    let events = result["events"].as_array().unwrap();
    assert_eq!(events.first().unwrap()["type"], "workflow_start");
    assert_eq!(events.last().unwrap()["type"], "workflow_complete");
    assert_eq!(events.last().unwrap()["successful_tasks"], 2);
}

#[tokio::test]
async fn test_abort_unknown_workflow_is_invalid_params_code() {
    let app = build_router(make_state(test_config()));
    let response = post_rpc(
        app,
        json!({
            "jsonrpc": "2.0", "id": 6, "method": "tools/call",
            "params": {
                "name": "abort",
                "arguments": {
                    "workflow_id": uuid::Uuid::new_v4().to_string(),
                    "reason": "cleanup"
                }
            }
        }),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn test_auth_required_when_tokens_configured() {
    let mut config = test_config();
    config.gateway.auth_tokens = vec!["sekrit".into()];
    let app = build_router(make_state(config));

    let req = Request::builder()
        .method("POST")
        .uri("/mcp")
        .body(Body::from(
            json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }).to_string(),
        ))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("authorization", "Bearer sekrit")
        .body(Body::from(
            json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize" }).to_string(),
        ))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let mut config = test_config();
    config.gateway.rate_limit_per_minute = 2;
    let app = build_router(make_state(config));

    for _ in 0..2 {
        let req = Request::builder()
            .method("GET")
            .uri("/api/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let req = Request::builder()
        .method("GET")
        .uri("/api/metrics")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_package_session_routes() {
    let app = build_router(make_state(test_config()));

    let req = Request::builder()
        .method("POST")
        .uri("/pml/register")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "package": "pml-client" }).to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    let session_id = json["session_id"].as_str().unwrap().to_string();

    let req = Request::builder()
        .method("POST")
        .uri("/pml/heartbeat")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "session_id": session_id }).to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let req = Request::builder()
        .method("POST")
        .uri("/pml/heartbeat")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "session_id": "nope" }).to_string()))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_graph_api_endpoints() {
    let state = make_state(test_config());
    state.runtime.sync_backend_tools().await;
    let app = build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/api/graph/hypergraph")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["adaptive_alpha"].as_f64().unwrap() >= 0.5);

    let req = Request::builder()
        .method("GET")
        .uri("/api/graph/path?from=ghost:one&to=ghost:two")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
