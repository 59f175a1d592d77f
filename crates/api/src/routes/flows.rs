//! Route definitions for the `/flows` resource.

use axum::routing::post;
use axum::Router;

use crate::handlers::flows;
use crate::state::AppState;

/// Routes mounted at `/flows`.
///
/// ```text
/// POST   /    -> submit_flow
/// GET    /    -> query_flows   (?flow_id=X | ?action=queue|all | none)
/// PUT    /    -> control_flow  (pause/resume/cancel/recover/resolve)
/// DELETE /    -> delete_flow   (?flow_id=X)
/// ```
pub fn router() -> Router<AppState> {
    Router::new().route(
        "/",
        post(flows::submit_flow)
            .get(flows::query_flows)
            .put(flows::control_flow)
            .delete(flows::delete_flow),
    )
}
