//! Steward Error Types

use thiserror::Error;

/// Result type alias for Steward operations
pub type Result<T> = std::result::Result<T, Error>;

/// Steward error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Coordination store errors
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Lease for {key} already held by {owner}")]
    LeaseHeld { key: String, owner: String },

    #[error("Lease for {0} expired or lost")]
    LeaseExpired(String),

    #[error("Compare-and-set conflict on {key}: expected version {expected}, found {found}")]
    CasConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    // Failover errors
    #[error("No eligible failover candidate")]
    NoEligibleCandidate,

    #[error("No leader available")]
    NoLeader,

    #[error("Promotion of {node} failed: {reason}")]
    PromotionFailed { node: String, reason: String },

    #[error("Demotion of {node} failed: {reason}")]
    DemotionFailed { node: String, reason: String },

    #[error("Split-brain detected: {first} and {second} both claim leadership")]
    SplitBrainDetected { first: String, second: String },

    #[error("Member not found: {0}")]
    MemberNotFound(String),

    // Database collaborator errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // HTTP / network errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_)
                | Error::NoEligibleCandidate
                | Error::NoLeader
                | Error::CasConflict { .. }
                | Error::Http(_)
        )
    }

    /// Check if this error means the node can no longer prove leadership
    /// and must stop accepting writes
    pub fn should_fence(&self) -> bool {
        matches!(
            self,
            Error::LeaseExpired(_) | Error::SplitBrainDetected { .. }
        )
    }

    /// Check if this error is an expected race outcome rather than a fault
    pub fn is_expected_race(&self) -> bool {
        matches!(self, Error::LeaseHeld { .. } | Error::CasConflict { .. })
    }
}
