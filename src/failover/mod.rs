//! Failover Module
//!
//! Candidate selection and the promotion/demotion sequence executed when
//! leadership is lost.

mod decision;
mod orchestrator;

pub use decision::{FailoverDecision, FailoverOutcome, FailoverReason};
pub use orchestrator::FailoverOrchestrator;
