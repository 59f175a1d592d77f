//! Shared response envelope types for API handlers.
//!
//! All API responses use a `{ "data": ... }` envelope. Use
//! [`DataResponse`] instead of ad-hoc `serde_json::json!({ "data": ... })`
//! to get compile-time type safety and consistent serialization.

use serde::Serialize;

/// Standard `{ "data": T }` response envelope.
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}

/// Outcome payload for control operations (`pause`, `resume`, ...).
#[derive(Debug, Serialize)]
pub struct ActionOutcome {
    /// Whether the operation changed anything.
    pub result: bool,
    pub message: String,
}
