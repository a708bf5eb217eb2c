//! Topology Module
//!
//! Publishes the current leader's connection endpoint for external routers
//! and provides the router-side reader that follows it.

mod publisher;
mod reader;

pub use publisher::TopologyPublisher;
pub use reader::TopologyReader;

use serde::{Deserialize, Serialize};

/// The published routing record external collaborators consume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRecord {
    /// Name of the current leader
    pub leader_name: String,
    /// Database endpoint of the current leader (host:port)
    pub leader_address: String,
    /// Leadership term counter, incremented on every successful change.
    /// Readers treat any non-monotonic movement as stale-cache poison.
    pub epoch: u64,
}
