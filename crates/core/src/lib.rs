//! Domain types and policy logic for the generation flow orchestrator.
//!
//! This crate has zero internal dependencies so it can be used by the
//! engine, the API layer, and any future worker or CLI tooling. It holds
//! the flow data model, the status state machine, the stage pipeline
//! definition, and the pure scheduling/retry policy functions. Anything
//! that performs I/O or spawns tasks lives in `loregen-engine`.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod flow;
pub mod flow_events;
pub mod queue;
pub mod retry;
pub mod stage;
pub mod types;
