use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use loregen_api::config::ServerConfig;
use loregen_api::router::build_app_router;
use loregen_api::state::AppState;
use loregen_engine::stub::stub_collaborators;
use loregen_engine::{FlowService, FlowServiceConfig};
use loregen_events::FlowEventBus;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        max_concurrent_flows: 2,
    }
}

/// Build the application router over a fresh orchestrator whose
/// scheduler is NOT running: submitted flows stay queued, which keeps
/// control-surface assertions deterministic.
pub fn build_test_app() -> Router {
    build_app(false)
}

/// Like [`build_test_app`] but with the scheduler running, for tests
/// that need flows to actually execute.
pub fn build_running_app() -> Router {
    build_app(true)
}

fn build_app(start: bool) -> Router {
    let config = test_config();
    let service = Arc::new(FlowService::new(
        stub_collaborators(),
        Arc::new(FlowEventBus::default()),
        FlowServiceConfig {
            max_concurrent_flows: config.max_concurrent_flows,
            ..FlowServiceConfig::default()
        },
    ));
    if start {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start().await });
    }

    let state = AppState {
        service,
        config: Arc::new(config.clone()),
    };
    build_app_router(state, &config)
}

/// Issue a request against the router and return the raw response.
pub async fn request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> Response<axum::body::Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("serializable body"))
        }
        None => Body::empty(),
    };
    app.clone()
        .oneshot(builder.body(body).expect("valid request"))
        .await
        .expect("infallible service")
}

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    request(app, Method::GET, uri, None).await
}

/// Read and parse the response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("readable body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("JSON body")
}

/// Submit a minimal valid flow and return its id.
pub async fn submit_flow(app: &Router) -> String {
    let response = request(
        app,
        Method::POST,
        "/api/v1/flows",
        Some(serde_json::json!({
            "workflow_id": "w1",
            "game_ids": ["g1", "g2"],
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    json["data"]["flow_id"]
        .as_str()
        .expect("flow_id in response")
        .to_string()
}
