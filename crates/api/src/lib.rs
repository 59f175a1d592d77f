//! HTTP control surface for the flow orchestrator.
//!
//! Exposed as a library so integration tests can build the exact router
//! and middleware stack the binary serves.

pub mod config;
pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
