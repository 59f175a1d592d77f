//! The orchestration runtime: flow registry, scheduler, stage runner,
//! and the service facade.
//!
//! Everything stateful lives here. Domain types and policy functions
//! come from `loregen-core`; content generation, data access, quality
//! scoring, and result persistence are injected collaborators defined
//! in [`collab`].

pub mod collab;
pub mod context;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod stub;

pub use service::{FlowService, FlowServiceConfig, QueueStatusSummary};
