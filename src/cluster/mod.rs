//! Cluster Membership Module
//!
//! The shared, coordination-store-backed view of all cluster members.

mod member;
mod registry;

pub use member::{ClusterMember, HealthScore, MemberRole};
pub use registry::MemberRegistry;
