//! Leader Election Module
//!
//! The per-node promote/demote state machine driven by the leadership
//! lease in the coordination store.

mod engine;

pub use engine::{ElectionEngine, ElectionState};
