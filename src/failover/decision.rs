//! Failover decision records
//!
//! An ephemeral record produced whenever leadership is lost, published for
//! operator observability and surfaced through the status API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why leadership was lost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    /// The leader's lease expired without renewal
    HealthTimeout,
    /// An operator requested the leader step down
    Manual,
    /// The leader stepped aside after falling behind the lag policy
    LagExceeded,
}

impl std::fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverReason::HealthTimeout => write!(f, "health_timeout"),
            FailoverReason::Manual => write!(f, "manual"),
            FailoverReason::LagExceeded => write!(f, "lag_exceeded"),
        }
    }
}

/// How the failover round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverOutcome {
    /// The chosen successor was promoted and the topology committed
    Promoted,
    /// The promotion was abandoned (engine refusal or lost epoch race)
    Aborted,
    /// No member met the eligibility rules; retried next cycle
    NoEligibleCandidate,
}

impl std::fmt::Display for FailoverOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailoverOutcome::Promoted => write!(f, "promoted"),
            FailoverOutcome::Aborted => write!(f, "aborted"),
            FailoverOutcome::NoEligibleCandidate => write!(f, "no_eligible_candidate"),
        }
    }
}

/// One failover round's verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverDecision {
    /// The member whose leadership ended, when known
    pub failed_leader: Option<String>,
    /// Why leadership was lost
    pub reason: FailoverReason,
    /// The successor the selection algorithm chose
    pub chosen: Option<String>,
    /// How the round ended
    pub outcome: FailoverOutcome,
    /// When the decision was made
    pub decided_at: DateTime<Utc>,
}
