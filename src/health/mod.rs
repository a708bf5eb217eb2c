//! Health Monitoring Module
//!
//! Periodic probing of the local database node and publication of the
//! resulting health score into the member registry.

mod monitor;

pub use monitor::{HealthMonitor, ProbeState};
