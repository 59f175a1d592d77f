//! Integration tests for the flow control API.

mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use common::{body_json, get, request, submit_flow};

// ---------------------------------------------------------------------------
// Health and general HTTP behaviour
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_returns_ok_with_json() {
    let app = common::build_test_app();
    let response = get(&app, "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = common::build_test_app();
    let response = get(&app, "/this-route-does-not-exist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn response_contains_x_request_id_header() {
    let app = common::build_test_app();
    let response = get(&app, "/health").await;

    let request_id = response.headers().get("x-request-id");
    assert!(
        request_id.is_some(),
        "Response must contain an x-request-id header"
    );
    let id_str = request_id.unwrap().to_str().unwrap();
    assert_eq!(id_str.len(), 36, "x-request-id should be a UUID string");
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_returns_201_with_flow_id_and_configuration() {
    let app = common::build_test_app();
    let response = request(
        &app,
        Method::POST,
        "/api/v1/flows",
        Some(serde_json::json!({
            "workflow_id": "w1",
            "game_ids": ["g1"],
            "quality_threshold": 0.9,
        })),
    )
    .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert!(json["data"]["flow_id"].is_string());
    assert_eq!(json["data"]["configuration"]["workflow_id"], "w1");
    assert_eq!(json["data"]["configuration"]["quality_threshold"], 0.9);
}

#[tokio::test]
async fn submit_with_invalid_configuration_returns_400_with_violations() {
    let app = common::build_test_app();
    let response = request(
        &app,
        Method::POST,
        "/api/v1/flows",
        Some(serde_json::json!({
            "workflow_id": "",
            "game_ids": [],
            "quality_threshold": 2.0,
        })),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
    let message = json["error"].as_str().unwrap();
    assert!(message.contains("workflow_id"));
    assert!(message.contains("game_ids"));
    assert!(message.contains("quality_threshold"));
}

#[tokio::test]
async fn submit_with_unknown_output_format_returns_400() {
    let app = common::build_test_app();
    let response = request(
        &app,
        Method::POST,
        "/api/v1/flows",
        Some(serde_json::json!({
            "workflow_id": "w1",
            "game_ids": ["g1"],
            "output_format": "docx",
        })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_query_returns_the_record() {
    let app = common::build_test_app();
    let id = submit_flow(&app).await;

    let response = get(&app, &format!("/api/v1/flows?flow_id={id}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["id"], id.as_str());
    assert_eq!(json["data"]["status"], "queued");
    assert_eq!(json["data"]["progress"]["items_total"], 2);
}

#[tokio::test]
async fn status_query_for_unknown_flow_returns_404() {
    let app = common::build_test_app();
    let response = get(&app, "/api/v1/flows?flow_id=nope").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn queue_action_returns_entries_in_dispatch_order() {
    let app = common::build_test_app();
    submit_flow(&app).await;
    submit_flow(&app).await;

    let response = get(&app, "/api/v1/flows?action=queue").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn all_action_returns_every_record() {
    let app = common::build_test_app();
    submit_flow(&app).await;
    submit_flow(&app).await;

    let response = get(&app, "/api/v1/flows?action=all").await;
    let json = body_json(response).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn no_parameters_returns_aggregate_counts() {
    let app = common::build_test_app();
    submit_flow(&app).await;

    let response = get(&app, "/api/v1/flows").await;
    let json = body_json(response).await;
    assert_eq!(json["data"]["total"], 1);
    assert_eq!(json["data"]["queued"], 1);
    assert_eq!(json["data"]["running"], 0);
}

#[tokio::test]
async fn unknown_query_action_returns_400() {
    let app = common::build_test_app();
    let response = get(&app, "/api/v1/flows?action=frobnicate").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Control operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_of_queued_flow_succeeds() {
    let app = common::build_test_app();
    let id = submit_flow(&app).await;

    let response = request(
        &app,
        Method::PUT,
        "/api/v1/flows",
        Some(serde_json::json!({ "flow_id": id, "action": "cancel" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["result"], true);

    let status = body_json(get(&app, &format!("/api/v1/flows?flow_id={id}")).await).await;
    assert_eq!(status["data"]["status"], "cancelled");
}

#[tokio::test]
async fn pause_of_non_running_flow_reports_false() {
    let app = common::build_test_app();
    let id = submit_flow(&app).await;

    let response = request(
        &app,
        Method::PUT,
        "/api/v1/flows",
        Some(serde_json::json!({ "flow_id": id, "action": "pause" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["result"], false);
}

#[tokio::test]
async fn unknown_control_action_returns_400() {
    let app = common::build_test_app();
    let id = submit_flow(&app).await;

    let response = request(
        &app,
        Method::PUT,
        "/api/v1/flows",
        Some(serde_json::json!({ "flow_id": id, "action": "explode" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("explode"));
}

#[tokio::test]
async fn control_of_unknown_flow_returns_404() {
    let app = common::build_test_app();
    let response = request(
        &app,
        Method::PUT,
        "/api/v1/flows",
        Some(serde_json::json!({ "flow_id": "nope", "action": "cancel" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn resolve_without_manual_action_returns_400() {
    let app = common::build_test_app();
    let id = submit_flow(&app).await;

    let response = request(
        &app,
        Method::PUT,
        "/api/v1/flows",
        Some(serde_json::json!({ "flow_id": id, "action": "resolve" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_removes_the_flow_and_is_idempotent() {
    let app = common::build_test_app();
    let id = submit_flow(&app).await;

    let response = request(
        &app,
        Method::DELETE,
        &format!("/api/v1/flows?flow_id={id}"),
        None,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["result"], true);

    let again = request(
        &app,
        Method::DELETE,
        &format!("/api/v1/flows?flow_id={id}"),
        None,
    )
    .await;
    assert_eq!(body_json(again).await["data"]["result"], false);

    let status = get(&app, &format!("/api/v1/flows?flow_id={id}")).await;
    assert_eq!(status.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// End to end over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submitted_flow_runs_to_completion() {
    let app = common::build_running_app();
    let id = submit_flow(&app).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let json = body_json(get(&app, &format!("/api/v1/flows?flow_id={id}")).await).await;
        if json["data"]["status"] == "completed" {
            assert_eq!(json["data"]["progress"]["overall"], 100);
            assert_eq!(json["data"]["progress"]["items_succeeded"], 2);
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "flow never completed: {json}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
