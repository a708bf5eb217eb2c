//! Topology Publisher
//!
//! Writes `{leader_name, leader_address, epoch}` to the well-known topology
//! key, only after a promotion is confirmed locally successful. The write is
//! a compare-and-set keyed on the record's previous version, so two
//! orchestrators acting on the same observation cannot both commit — the
//! loser aborts its promotion.

use std::sync::Arc;

use super::TopologyRecord;
use crate::coord::{keys, CoordinationStore, VersionedValue};
use crate::error::Result;

/// Publisher for the cluster topology record
pub struct TopologyPublisher {
    store: Arc<dyn CoordinationStore>,
}

impl TopologyPublisher {
    /// Create a publisher over the coordination store
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Read the current record with its store version
    pub async fn current(&self) -> Result<Option<(TopologyRecord, u64)>> {
        match self.store.get(keys::TOPOLOGY).await? {
            Some(VersionedValue { version, value }) => {
                let record: TopologyRecord = serde_json::from_value(value)?;
                Ok(Some((record, version)))
            }
            None => Ok(None),
        }
    }

    /// Publish a new leadership term over a freshly-read snapshot
    pub async fn publish(&self, leader_name: &str, leader_address: &str) -> Result<TopologyRecord> {
        let observed = self.current().await?;
        self.publish_over(leader_name, leader_address, observed.as_ref())
            .await
    }

    /// Publish a new leadership term keyed on the snapshot the caller
    /// observed when it decided to act. A `CasConflict` means the epoch
    /// changed underneath — another orchestrator already acted on this
    /// term — and the caller must abort its promotion.
    pub async fn publish_over(
        &self,
        leader_name: &str,
        leader_address: &str,
        observed: Option<&(TopologyRecord, u64)>,
    ) -> Result<TopologyRecord> {
        let (epoch, expected_version) = match observed {
            Some((record, version)) => (record.epoch + 1, *version),
            None => (1, 0),
        };

        let record = TopologyRecord {
            leader_name: leader_name.to_string(),
            leader_address: leader_address.to_string(),
            epoch,
        };
        self.store
            .compare_and_set(keys::TOPOLOGY, expected_version, serde_json::to_value(&record)?)
            .await?;

        tracing::info!(
            "Published topology: leader {} at {} (epoch {})",
            leader_name,
            leader_address,
            epoch
        );
        Ok(record)
    }
}
