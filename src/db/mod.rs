//! Database Management Collaborator
//!
//! The controller never manipulates storage files or the replication wire
//! protocol directly; everything it needs from the database engine goes
//! through this trait.

mod mariadb;

pub use mariadb::MariaDbManager;

use async_trait::async_trait;

use crate::error::Result;

/// Monotonic position in the replication stream
pub type Offset = u64;

/// Interface to the local database engine's management surface
#[async_trait]
pub trait DatabaseManager: Send + Sync {
    /// Make the local node writable (clear read-only, stop replicating)
    async fn promote(&self) -> Result<()>;

    /// Make the local node read-only so it cannot accept writes
    async fn demote(&self) -> Result<()>;

    /// Current position in the replication stream. Doubles as the liveness
    /// probe: a failure here means the engine is unreachable.
    async fn replication_offset(&self) -> Result<Offset>;

    /// Whether the engine is currently in recovery / replica mode
    async fn is_recovering(&self) -> Result<bool>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Scriptable in-memory stand-in for a database engine
    pub struct MockDb {
        offset: AtomicU64,
        recovering: AtomicBool,
        reachable: AtomicBool,
        refuse_promotion: AtomicBool,
        promote_calls: AtomicU64,
        demote_calls: AtomicU64,
    }

    impl MockDb {
        pub fn new(offset: Offset) -> Self {
            Self {
                offset: AtomicU64::new(offset),
                recovering: AtomicBool::new(true),
                reachable: AtomicBool::new(true),
                refuse_promotion: AtomicBool::new(false),
                promote_calls: AtomicU64::new(0),
                demote_calls: AtomicU64::new(0),
            }
        }

        pub fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
        }

        pub fn set_refuse_promotion(&self, refuse: bool) {
            self.refuse_promotion.store(refuse, Ordering::SeqCst);
        }

        pub fn is_writable(&self) -> bool {
            !self.recovering.load(Ordering::SeqCst)
        }

        pub fn promote_calls(&self) -> u64 {
            self.promote_calls.load(Ordering::SeqCst)
        }

        pub fn demote_calls(&self) -> u64 {
            self.demote_calls.load(Ordering::SeqCst)
        }

        fn check_reachable(&self) -> Result<()> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(crate::Error::Database(sqlx::Error::PoolTimedOut));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DatabaseManager for MockDb {
        async fn promote(&self) -> Result<()> {
            self.check_reachable()?;
            self.promote_calls.fetch_add(1, Ordering::SeqCst);
            if self.refuse_promotion.load(Ordering::SeqCst) {
                return Err(crate::Error::Database(sqlx::Error::RowNotFound));
            }
            self.recovering.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn demote(&self) -> Result<()> {
            self.check_reachable()?;
            self.demote_calls.fetch_add(1, Ordering::SeqCst);
            self.recovering.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn replication_offset(&self) -> Result<Offset> {
            self.check_reachable()?;
            Ok(self.offset.load(Ordering::SeqCst))
        }

        async fn is_recovering(&self) -> Result<bool> {
            self.check_reachable()?;
            Ok(self.recovering.load(Ordering::SeqCst))
        }
    }
}
