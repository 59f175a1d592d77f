//! In-process eventing for flow lifecycle and progress notifications.

pub mod bus;

pub use bus::{FlowEvent, FlowEventBus};
