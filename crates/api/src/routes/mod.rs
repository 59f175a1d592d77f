pub mod flows;
pub mod health;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /flows        POST submit, GET query, PUT control, DELETE remove
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/flows", flows::router())
}
