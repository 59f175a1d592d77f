//! Handlers for the `/flows` resource.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use loregen_core::config::{
    BackoffConfig, ConcurrencyLimits, FlowConfiguration, NotificationPolicy, OutputFormat,
    RecoveryPolicy, TimeoutConfig,
};
use loregen_core::error::CoreError;
use loregen_core::retry::ManualAction;
use loregen_core::types::FlowId;

use crate::error::{AppError, AppResult};
use crate::response::{ActionOutcome, DataResponse};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// POST /flows
// ---------------------------------------------------------------------------

/// Submission payload. Only `workflow_id` and `game_ids` are required;
/// everything else falls back to the orchestrator defaults.
#[derive(Debug, Deserialize)]
pub struct SubmitFlowRequest {
    pub workflow_id: String,
    pub game_ids: Vec<String>,
    pub output_format: Option<String>,
    pub enable_structured_data: Option<bool>,
    pub structured_data_types: Option<Vec<String>>,
    pub quality_threshold: Option<f64>,
    pub max_retries: Option<u32>,
    pub backoff: Option<BackoffConfig>,
    pub concurrency: Option<ConcurrencyLimits>,
    pub timeouts: Option<TimeoutConfig>,
    pub recovery: Option<RecoveryPolicy>,
    pub notifications: Option<NotificationPolicy>,
    /// Flow ids that must complete before this flow runs.
    pub dependencies: Option<Vec<FlowId>>,
}

impl SubmitFlowRequest {
    fn into_parts(self) -> Result<(FlowConfiguration, Vec<FlowId>), CoreError> {
        let mut config = FlowConfiguration::new(self.workflow_id, self.game_ids);
        if let Some(format) = self.output_format {
            config.output_format = OutputFormat::from_str(&format)?;
        }
        if let Some(enabled) = self.enable_structured_data {
            config.enable_structured_data = enabled;
        }
        if let Some(types) = self.structured_data_types {
            config.structured_data_types = types;
        }
        if let Some(threshold) = self.quality_threshold {
            config.quality_threshold = threshold;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(backoff) = self.backoff {
            config.backoff = backoff;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(timeouts) = self.timeouts {
            config.timeouts = timeouts;
        }
        if let Some(recovery) = self.recovery {
            config.recovery = recovery;
        }
        if let Some(notifications) = self.notifications {
            config.notifications = notifications;
        }
        Ok((config, self.dependencies.unwrap_or_default()))
    }
}

/// POST /flows -- validate and enqueue a new flow.
pub async fn submit_flow(
    State(state): State<AppState>,
    Json(request): Json<SubmitFlowRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)> {
    let (configuration, dependencies) = request.into_parts()?;
    let flow_id = state
        .service
        .submit_with_dependencies(configuration.clone(), dependencies)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "data": {
                "flow_id": flow_id,
                "configuration": configuration,
            }
        })),
    ))
}

// ---------------------------------------------------------------------------
// GET /flows
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct FlowQuery {
    pub flow_id: Option<String>,
    pub action: Option<String>,
}

/// GET /flows -- query flows.
///
/// - `?flow_id=X` -> single record (404 when unknown)
/// - `?action=queue` -> pending queue in dispatch order
/// - `?action=all` -> every record
/// - no parameters -> aggregate counts by status
pub async fn query_flows(
    State(state): State<AppState>,
    Query(query): Query<FlowQuery>,
) -> AppResult<Json<serde_json::Value>> {
    if let Some(flow_id) = query.flow_id {
        let record = state.service.status(&flow_id).await?;
        return Ok(Json(json!({ "data": record })));
    }

    match query.action.as_deref() {
        Some("queue") => {
            let summary = state.service.queue_status().await?;
            Ok(Json(json!({ "data": summary.queue })))
        }
        Some("all") => {
            let records = state.service.list_all().await?;
            Ok(Json(json!({ "data": records })))
        }
        Some(other) => Err(AppError::BadRequest(format!(
            "Unknown action '{other}'. Expected one of: queue, all"
        ))),
        None => {
            let summary = state.service.queue_status().await?;
            Ok(Json(json!({
                "data": {
                    "total": summary.total,
                    "running": summary.running,
                    "queued": summary.queued,
                    "completed": summary.completed,
                    "failed": summary.failed,
                }
            })))
        }
    }
}

// ---------------------------------------------------------------------------
// PUT /flows
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ControlFlowRequest {
    pub flow_id: String,
    /// One of: pause, resume, cancel, recover, resolve.
    pub action: String,
    /// Required when `action` is `resolve`: one of skip_validation,
    /// force_repair, accept_manual_edit, abort.
    pub manual_action: Option<String>,
    /// Optional `{game_id: body}` replacements for accept_manual_edit.
    pub edits: Option<serde_json::Value>,
}

/// PUT /flows -- control a flow's lifecycle.
pub async fn control_flow(
    State(state): State<AppState>,
    Json(request): Json<ControlFlowRequest>,
) -> AppResult<Json<DataResponse<ActionOutcome>>> {
    let id = request.flow_id.as_str();
    let (result, verb) = match request.action.as_str() {
        "pause" => (state.service.pause(id).await?, "paused"),
        "resume" => (state.service.resume(id).await?, "resumed"),
        "cancel" => (state.service.cancel(id).await?, "cancelled"),
        "recover" => (state.service.recover(id).await?, "recovery queued"),
        "resolve" => {
            let raw = request.manual_action.as_deref().ok_or_else(|| {
                AppError::BadRequest("Action 'resolve' requires 'manual_action'".to_string())
            })?;
            let action = ManualAction::from_str(raw).ok_or_else(|| {
                AppError::BadRequest(format!(
                    "Unknown manual_action '{raw}'. Expected one of: skip_validation, \
                     force_repair, accept_manual_edit, abort"
                ))
            })?;
            (
                state
                    .service
                    .resolve_manual_intervention(id, action, request.edits)
                    .await?,
                "manual intervention resolved",
            )
        }
        other => {
            return Err(AppError::BadRequest(format!(
                "Unknown action '{other}'. Expected one of: pause, resume, cancel, recover, resolve"
            )))
        }
    };

    let message = if result {
        format!("Flow {id} {verb}")
    } else {
        format!("Flow {id} not in an eligible state for '{}'", request.action)
    };
    Ok(Json(DataResponse {
        data: ActionOutcome { result, message },
    }))
}

// ---------------------------------------------------------------------------
// DELETE /flows
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeleteFlowQuery {
    pub flow_id: String,
}

/// DELETE /flows?flow_id=X -- remove a flow and every trace of it.
pub async fn delete_flow(
    State(state): State<AppState>,
    Query(query): Query<DeleteFlowQuery>,
) -> AppResult<Json<DataResponse<ActionOutcome>>> {
    let result = state.service.delete(&query.flow_id).await?;
    let message = if result {
        format!("Flow {} deleted", query.flow_id)
    } else {
        format!("Flow {} was already gone", query.flow_id)
    };
    Ok(Json(DataResponse {
        data: ActionOutcome { result, message },
    }))
}
