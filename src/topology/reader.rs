//! Router-side topology reader
//!
//! The collaborator interface for reverse proxies and connection poolers:
//! follows the topology record, hands out the current leader address for
//! new write connections, and returns a retryable error during failover
//! rather than routing to a stale address.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};

use super::TopologyRecord;
use crate::coord::{keys, CoordinationStore};
use crate::error::{Error, Result};

/// Cached view of the published topology for routing decisions
pub struct TopologyReader {
    store: Arc<dyn CoordinationStore>,
    poll_interval: Duration,
    cached: RwLock<Option<TopologyRecord>>,
}

impl TopologyReader {
    /// Create a reader polling at the given interval
    pub fn new(store: Arc<dyn CoordinationStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            cached: RwLock::new(None),
        }
    }

    /// Fetch the record once and fold it into the cache. An epoch decrease
    /// or a changed leader under an unchanged epoch poisons the cache
    /// immediately; routing resumes once a trustworthy record reappears.
    pub async fn refresh(&self) -> Result<()> {
        let fetched = match self.store.get(keys::TOPOLOGY).await? {
            Some(versioned) => serde_json::from_value::<TopologyRecord>(versioned.value)?,
            None => {
                *self.cached.write().await = None;
                return Ok(());
            }
        };

        let mut cached = self.cached.write().await;
        match cached.as_ref() {
            Some(previous)
                if fetched.epoch < previous.epoch
                    || (fetched.epoch == previous.epoch
                        && fetched.leader_name != previous.leader_name) =>
            {
                tracing::warn!(
                    "Topology epoch moved non-monotonically ({} -> {}), invalidating routing cache",
                    previous.epoch,
                    fetched.epoch
                );
                *cached = None;
            }
            _ => {
                *cached = Some(fetched);
            }
        }
        Ok(())
    }

    /// Address to which new write connections should be routed. During
    /// failover this fails with the retryable [`Error::NoLeader`] instead
    /// of returning a stale address.
    pub async fn leader_address(&self) -> Result<String> {
        self.cached
            .read()
            .await
            .as_ref()
            .map(|record| record.leader_address.clone())
            .ok_or(Error::NoLeader)
    }

    /// Current cached record, if any
    pub async fn current(&self) -> Option<TopologyRecord> {
        self.cached.read().await.clone()
    }

    /// Follow the topology until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::debug!("Topology refresh failed: {}", e);
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}
