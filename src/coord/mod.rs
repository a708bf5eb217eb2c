//! Coordination Store Client
//!
//! Wraps the external strongly-consistent key-value service behind one
//! trait boundary. Lease acquisition and renewal through this client is
//! the only mechanism that can make a node the leader; no component
//! issues raw compare-and-set calls except through this boundary, so a
//! substitute backend can be dropped in.

mod http;
mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_stream::Stream;
use uuid::Uuid;

use crate::error::Result;

/// Well-known key layout inside the store namespace
pub mod keys {
    /// Leadership lease key
    pub const LEADER_LEASE: &str = "cluster/leader";
    /// Published topology record
    pub const TOPOLOGY: &str = "cluster/topology";
    /// Last failover decision record
    pub const LAST_FAILOVER: &str = "cluster/last-failover";
    /// Prefix for per-member state records
    pub const MEMBER_PREFIX: &str = "members/";

    /// Key holding a single member's published state
    pub fn member(name: &str) -> String {
        format!("{}{}", MEMBER_PREFIX, name)
    }
}

/// A value read from the store together with its version counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Store-assigned version, increases on every write to the key
    pub version: u64,
    /// The stored JSON document
    pub value: serde_json::Value,
}

/// A single key-change notification from a watch
#[derive(Debug, Clone)]
pub struct KvEvent {
    /// Key that changed
    pub key: String,
    /// New value, or `None` when the key was deleted or its lease expired
    pub value: Option<VersionedValue>,
}

/// Lazy, infinite sequence of key-change events. The stream terminates on
/// store disconnect; callers restart it with another `watch` call.
pub type WatchStream = Pin<Box<dyn Stream<Item = KvEvent> + Send>>;

/// A held time-bounded claim on a key
#[derive(Debug, Clone)]
pub struct Lease {
    /// Leased key
    pub key: String,
    /// Member name that owns the lease
    pub owner: String,
    /// Holder token proving ownership across renewals
    pub token: Uuid,
    /// Lease duration; the claim is void once it elapses without renewal
    pub ttl: Duration,
    /// Store version of the lease record at grant/renewal time
    pub version: u64,
}

/// The lease document as stored, visible to watchers and observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Owning member name
    pub owner: String,
    /// Holder token
    pub token: Uuid,
}

/// Client contract for the external coordination service.
///
/// All operations fail fast with [`crate::Error::StoreUnavailable`] when the
/// service cannot be reached within the configured request timeout; none of
/// them block indefinitely.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Claim `key` for `owner` with a TTL. Fails with
    /// [`crate::Error::LeaseHeld`] while another valid claim exists.
    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<Lease>;

    /// Extend a held lease for another TTL. Fails with
    /// [`crate::Error::LeaseExpired`] if the claim lapsed or was taken over.
    /// Renewing an already-valid lease never changes its owner.
    async fn renew_lease(&self, lease: &Lease) -> Result<Lease>;

    /// Drop a held lease so the next election is not delayed by its TTL.
    /// Releasing an already-expired lease is not an error.
    async fn release_lease(&self, lease: &Lease) -> Result<()>;

    /// Owner of the currently valid lease on `key`, if any
    async fn lease_holder(&self, key: &str) -> Result<Option<LeaseRecord>>;

    /// Read a key with its version
    async fn get(&self, key: &str) -> Result<Option<VersionedValue>>;

    /// Unconditional write, for records owned by a single writer.
    /// Returns the new version.
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<u64>;

    /// Atomic compare-and-set keyed on the version counter. Expected
    /// version 0 means "create only if absent". Returns the new version,
    /// or [`crate::Error::CasConflict`] if the key moved underneath.
    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<u64>;

    /// Delete a key unconditionally
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all keys under a prefix with their current values
    async fn list(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>>;

    /// Watch all keys under a prefix for changes
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;
}
