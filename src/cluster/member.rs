//! Cluster member records
//!
//! Each record is owned (written) only by the member it describes, but is
//! readable by all nodes through the coordination store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::db::Offset;

/// Role of a member in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Holds the leadership lease and accepts writes
    Leader,
    /// Replicating from the leader
    Standby,
    /// Racing for an unclaimed lease
    Candidate,
    /// Lost the ability to prove leadership; rejects writes
    Fenced,
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberRole::Leader => write!(f, "LEADER"),
            MemberRole::Standby => write!(f, "STANDBY"),
            MemberRole::Candidate => write!(f, "CANDIDATE"),
            MemberRole::Fenced => write!(f, "FENCED"),
        }
    }
}

/// Discrete health score computed by the local health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthScore {
    /// Probes succeed within bounds
    Healthy,
    /// Lag or probe latency beyond the warning bound
    Degraded,
    /// Consecutive probe failures crossed the threshold
    Unreachable,
}

impl std::fmt::Display for HealthScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthScore::Healthy => write!(f, "HEALTHY"),
            HealthScore::Degraded => write!(f, "DEGRADED"),
            HealthScore::Unreachable => write!(f, "UNREACHABLE"),
        }
    }
}

/// Published state of a single cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Unique member name
    pub name: String,
    /// Database endpoint advertised to routers (host:port)
    pub address: String,
    /// Current role
    pub role: MemberRole,
    /// Current health score
    pub health: HealthScore,
    /// Last known replication offset
    pub offset: Offset,
    /// Replication lag behind the last known leader offset, in offset units
    pub lag: u64,
    /// When this record was last refreshed by its owner
    pub heartbeat: DateTime<Utc>,
    /// Leader only: instant by which the lease must be renewed
    pub lease_deadline: Option<DateTime<Utc>>,
}

impl ClusterMember {
    /// Create a freshly-registered member record
    pub fn new(name: String, address: String) -> Self {
        Self {
            name,
            address,
            role: MemberRole::Standby,
            health: HealthScore::Healthy,
            offset: 0,
            lag: 0,
            heartbeat: Utc::now(),
            lease_deadline: None,
        }
    }

    /// A heartbeat older than the staleness bound excludes the member from
    /// election eligibility until it republishes
    pub fn is_stale(&self, bound: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.heartbeat);
        age.num_milliseconds() < 0 || age.num_milliseconds() as u128 > bound.as_millis()
    }

    /// Whether this member may stand in an election
    pub fn is_eligible(&self, staleness_bound: Duration) -> bool {
        self.health == HealthScore::Healthy
            && self.role != MemberRole::Fenced
            && !self.is_stale(staleness_bound)
    }
}
