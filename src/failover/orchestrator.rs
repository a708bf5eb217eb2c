//! Failover Orchestrator
//!
//! Decides which eligible standby gets promoted when leadership is lost
//! and executes the promotion sequence on the node the selection picked.
//! Selection is deterministic over the shared registry view (highest
//! replication offset, ties by smallest name), so every observer reaches
//! the same verdict without extra coordination; the coordination store's
//! lease still arbitrates the final race.

use std::sync::Arc;

use chrono::Utc;

use super::{FailoverDecision, FailoverOutcome, FailoverReason};
use crate::cluster::{ClusterMember, HealthScore, MemberRegistry};
use crate::coord::{keys, CoordinationStore};
use crate::db::DatabaseManager;
use crate::error::{Error, Result};
use crate::topology::{TopologyPublisher, TopologyRecord};

/// Marker written by a leader stepping down on operator request, consumed
/// by the next promotion to label the decision
const MANUAL_MARKER_KEY: &str = "cluster/manual-failover";

/// Executes failover rounds for one node
pub struct FailoverOrchestrator {
    self_name: String,
    self_address: String,
    registry: Arc<MemberRegistry>,
    store: Arc<dyn CoordinationStore>,
    publisher: TopologyPublisher,
    db: Arc<dyn DatabaseManager>,
    max_lag_on_failover: u64,
}

impl FailoverOrchestrator {
    /// Create an orchestrator bound to this node's identity
    pub fn new(
        self_name: String,
        self_address: String,
        registry: Arc<MemberRegistry>,
        store: Arc<dyn CoordinationStore>,
        db: Arc<dyn DatabaseManager>,
        max_lag_on_failover: u64,
    ) -> Self {
        let publisher = TopologyPublisher::new(Arc::clone(&store));
        Self {
            self_name,
            self_address,
            registry,
            store,
            publisher,
            db,
            max_lag_on_failover,
        }
    }

    /// Pick the successor: among eligible members (healthy, fresh heartbeat,
    /// lag within policy), the highest replication offset wins; ties break
    /// to the lexicographically smallest name. A leader that stepped down
    /// on operator request sits the round out even though it is usually the
    /// most advanced member.
    pub async fn select_candidate(&self) -> Result<ClusterMember> {
        let mut eligible = self.registry.eligible_candidates().await;

        if self.max_lag_on_failover > 0 {
            eligible.retain(|m| m.lag <= self.max_lag_on_failover);
        }

        if let Ok(Some(versioned)) = self.store.get(MANUAL_MARKER_KEY).await {
            if let Some(stepping_down) = versioned.value.get("from").and_then(|v| v.as_str()) {
                eligible.retain(|m| m.name != stepping_down);
            }
        }

        // eligible_candidates is name-ordered, so a stable max_by_key on
        // offset lands on the smallest name among ties
        eligible
            .into_iter()
            .rev()
            .max_by_key(|m| m.offset)
            .ok_or(Error::NoEligibleCandidate)
    }

    /// Label the failover round. An operator marker means a requested
    /// step-down; a fresh old-leader record degraded by lag means the
    /// leader stepped aside over the lag policy; everything else is a
    /// health timeout.
    pub async fn derive_reason(&self) -> FailoverReason {
        match self.store.get(MANUAL_MARKER_KEY).await {
            Ok(Some(_)) => {
                let _ = self.store.delete(MANUAL_MARKER_KEY).await;
                return FailoverReason::Manual;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!("Manual-failover marker unreadable: {}", e);
            }
        }

        if let Ok(Some((record, _))) = self.publisher.current().await {
            if let Some(member) = self.registry.get(&record.leader_name).await {
                let fresh = !member.is_stale(self.registry.staleness_bound());
                if fresh && member.health == HealthScore::Degraded && member.lag > 0 {
                    return FailoverReason::LagExceeded;
                }
            }
        }

        FailoverReason::HealthTimeout
    }

    /// Leave the step-down marker for the next promotion to pick up
    pub async fn mark_manual_failover(&self) -> Result<()> {
        self.store
            .put(
                MANUAL_MARKER_KEY,
                serde_json::json!({
                    "from": self.self_name,
                    "requested_at": Utc::now().to_rfc3339(),
                }),
            )
            .await?;
        Ok(())
    }

    /// The topology snapshot an observer must capture before standing for
    /// election; the later epoch commit is keyed on it
    pub async fn observe_topology(&self) -> Result<Option<(TopologyRecord, u64)>> {
        self.publisher.current().await
    }

    /// Execute the promotion sequence on this node after it won the lease:
    /// promote the local engine, then commit the new topology epoch keyed
    /// on the snapshot observed at decision time. A lost epoch race rolls
    /// the engine back to standby and aborts.
    pub async fn execute_promotion(
        &self,
        reason: FailoverReason,
        observed: Option<&(TopologyRecord, u64)>,
    ) -> Result<TopologyRecord> {
        let failed_leader = observed
            .map(|(record, _)| record.leader_name.clone())
            .filter(|name| name != &self.self_name);

        if let Err(e) = self.db.promote().await {
            self.record_decision(&FailoverDecision {
                failed_leader,
                reason,
                chosen: Some(self.self_name.clone()),
                outcome: FailoverOutcome::Aborted,
                decided_at: Utc::now(),
            })
            .await;
            return Err(Error::PromotionFailed {
                node: self.self_name.clone(),
                reason: e.to_string(),
            });
        }

        match self
            .publisher
            .publish_over(&self.self_name, &self.self_address, observed)
            .await
        {
            Ok(record) => {
                self.record_decision(&FailoverDecision {
                    failed_leader,
                    reason,
                    chosen: Some(self.self_name.clone()),
                    outcome: FailoverOutcome::Promoted,
                    decided_at: Utc::now(),
                })
                .await;
                Ok(record)
            }
            Err(e) => {
                // Another orchestrator already acted on this term
                if let Err(rollback) = self.db.demote().await {
                    tracing::error!(
                        "Rollback demotion after lost epoch race failed: {}",
                        rollback
                    );
                }
                self.record_decision(&FailoverDecision {
                    failed_leader,
                    reason,
                    chosen: Some(self.self_name.clone()),
                    outcome: FailoverOutcome::Aborted,
                    decided_at: Utc::now(),
                })
                .await;
                Err(e)
            }
        }
    }

    /// Record a round that found nobody safe to promote; the observation
    /// cycle retries until an eligible healthy node appears
    pub async fn record_no_candidate(&self, reason: FailoverReason) {
        let failed_leader = match self.publisher.current().await {
            Ok(Some((record, _))) => Some(record.leader_name),
            _ => None,
        };
        self.record_decision(&FailoverDecision {
            failed_leader,
            reason,
            chosen: None,
            outcome: FailoverOutcome::NoEligibleCandidate,
            decided_at: Utc::now(),
        })
        .await;
    }

    /// Latest recorded decision, for the status API
    pub async fn last_decision(&self) -> Result<Option<FailoverDecision>> {
        match self.store.get(keys::LAST_FAILOVER).await? {
            Some(versioned) => Ok(Some(serde_json::from_value(versioned.value)?)),
            None => Ok(None),
        }
    }

    async fn record_decision(&self, decision: &FailoverDecision) {
        match serde_json::to_value(decision) {
            Ok(value) => {
                if let Err(e) = self.store.put(keys::LAST_FAILOVER, value).await {
                    tracing::warn!("Failed to record failover decision: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode failover decision: {}", e),
        }
        match decision.outcome {
            FailoverOutcome::Promoted => tracing::info!(
                "Failover decision: {} promoted ({})",
                decision.chosen.as_deref().unwrap_or("?"),
                decision.reason
            ),
            FailoverOutcome::Aborted => tracing::error!(
                "Failover decision: promotion of {} aborted ({})",
                decision.chosen.as_deref().unwrap_or("?"),
                decision.reason
            ),
            FailoverOutcome::NoEligibleCandidate => tracing::warn!(
                "Failover decision: no eligible candidate ({})",
                decision.reason
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemberRole;
    use crate::coord::{KvEvent, MemoryStore, VersionedValue};
    use crate::db::mock::MockDb;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<MemberRegistry>,
        db: Arc<MockDb>,
        orchestrator: FailoverOrchestrator,
    }

    async fn fixture(self_name: &str, max_lag: u64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(MemberRegistry::new(
            self_name.to_string(),
            Duration::from_secs(20),
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
        ));
        let db = Arc::new(MockDb::new(0));
        let orchestrator = FailoverOrchestrator::new(
            self_name.to_string(),
            format!("10.0.0.{}:3306", self_name.as_bytes()[0] - b'a' + 1),
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            Arc::clone(&db) as Arc<dyn DatabaseManager>,
            max_lag,
        );
        Fixture {
            store,
            registry,
            db,
            orchestrator,
        }
    }

    async fn inject_member(
        registry: &MemberRegistry,
        name: &str,
        offset: u64,
        lag: u64,
        health: HealthScore,
    ) {
        let mut member = ClusterMember::new(name.into(), format!("10.0.0.{}:3306", name));
        member.offset = offset;
        member.lag = lag;
        member.health = health;
        registry
            .apply_event(&KvEvent {
                key: keys::member(name),
                value: Some(VersionedValue {
                    version: 1,
                    value: serde_json::to_value(&member).unwrap(),
                }),
            })
            .await;
    }

    #[tokio::test]
    async fn test_selects_highest_offset() {
        let f = fixture("b", 0).await;
        inject_member(&f.registry, "b", 40, 120, HealthScore::Healthy).await;
        inject_member(&f.registry, "c", 120, 40, HealthScore::Healthy).await;

        let chosen = f.orchestrator.select_candidate().await.unwrap();
        assert_eq!(chosen.name, "c");
    }

    #[tokio::test]
    async fn test_tie_breaks_to_smallest_name() {
        let f = fixture("b", 0).await;
        inject_member(&f.registry, "c", 100, 10, HealthScore::Healthy).await;
        inject_member(&f.registry, "b", 100, 10, HealthScore::Healthy).await;
        inject_member(&f.registry, "d", 90, 20, HealthScore::Healthy).await;

        let chosen = f.orchestrator.select_candidate().await.unwrap();
        assert_eq!(chosen.name, "b");
    }

    #[tokio::test]
    async fn test_lag_policy_excludes_candidates() {
        let f = fixture("b", 50).await;
        inject_member(&f.registry, "b", 120, 80, HealthScore::Healthy).await;
        inject_member(&f.registry, "c", 100, 40, HealthScore::Healthy).await;

        // b has more data but exceeds the acceptable-loss bound
        let chosen = f.orchestrator.select_candidate().await.unwrap();
        assert_eq!(chosen.name, "c");
    }

    #[tokio::test]
    async fn test_no_eligible_candidate() {
        let f = fixture("b", 0).await;
        inject_member(&f.registry, "b", 40, 0, HealthScore::Unreachable).await;
        inject_member(&f.registry, "c", 30, 0, HealthScore::Degraded).await;

        let err = f.orchestrator.select_candidate().await.unwrap_err();
        assert!(matches!(err, Error::NoEligibleCandidate));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_promotion_publishes_topology_and_decision() {
        let f = fixture("c", 0).await;
        // A previous term exists from the failed leader
        let publisher =
            TopologyPublisher::new(Arc::clone(&f.store) as Arc<dyn CoordinationStore>);
        publisher.publish("a", "10.0.0.1:3306").await.unwrap();

        let observed = f.orchestrator.observe_topology().await.unwrap();
        let record = f
            .orchestrator
            .execute_promotion(FailoverReason::HealthTimeout, observed.as_ref())
            .await
            .unwrap();
        assert_eq!(record.epoch, 2);
        assert!(f.db.is_writable());

        let decision = f.orchestrator.last_decision().await.unwrap().unwrap();
        assert_eq!(decision.outcome, FailoverOutcome::Promoted);
        assert_eq!(decision.failed_leader.as_deref(), Some("a"));
        assert_eq!(decision.chosen.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_refused_promotion_aborts() {
        let f = fixture("c", 0).await;
        f.db.set_refuse_promotion(true);

        let err = f
            .orchestrator
            .execute_promotion(FailoverReason::HealthTimeout, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PromotionFailed { .. }));
        assert!(!f.db.is_writable());

        let decision = f.orchestrator.last_decision().await.unwrap().unwrap();
        assert_eq!(decision.outcome, FailoverOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_lost_epoch_race_rolls_back() {
        let f = fixture("c", 0).await;
        let publisher =
            TopologyPublisher::new(Arc::clone(&f.store) as Arc<dyn CoordinationStore>);
        publisher.publish("a", "10.0.0.1:3306").await.unwrap();

        // Both observers capture the same snapshot; the competitor commits
        // its epoch first
        let observed = f.orchestrator.observe_topology().await.unwrap();
        publisher
            .publish_over("b", "10.0.0.2:3306", observed.as_ref())
            .await
            .unwrap();

        let err = f
            .orchestrator
            .execute_promotion(FailoverReason::HealthTimeout, observed.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CasConflict { .. }));

        // Rolled back to standby: promoted once, then demoted once
        assert_eq!(f.db.promote_calls(), 1);
        assert_eq!(f.db.demote_calls(), 1);
        assert!(!f.db.is_writable());

        let decision = f.orchestrator.last_decision().await.unwrap().unwrap();
        assert_eq!(decision.outcome, FailoverOutcome::Aborted);
        // The committed topology still names the race winner
        let (current, _) = publisher.current().await.unwrap().unwrap();
        assert_eq!(current.leader_name, "b");
    }

    #[tokio::test]
    async fn test_manual_marker_excludes_stepping_down_leader() {
        let f = fixture("b", 0).await;
        inject_member(&f.registry, "a", 160, 0, HealthScore::Healthy).await;
        inject_member(&f.registry, "c", 120, 40, HealthScore::Healthy).await;

        // Without the marker the most advanced member wins
        let chosen = f.orchestrator.select_candidate().await.unwrap();
        assert_eq!(chosen.name, "a");

        // a stepping down on request sits the round out
        let stepping_down = FailoverOrchestrator::new(
            "a".into(),
            "10.0.0.1:3306".into(),
            Arc::clone(&f.registry),
            Arc::clone(&f.store) as Arc<dyn CoordinationStore>,
            Arc::clone(&f.db) as Arc<dyn DatabaseManager>,
            0,
        );
        stepping_down.mark_manual_failover().await.unwrap();
        let chosen = f.orchestrator.select_candidate().await.unwrap();
        assert_eq!(chosen.name, "c");
    }

    #[tokio::test]
    async fn test_manual_marker_labels_reason() {
        let f = fixture("c", 0).await;
        f.orchestrator.mark_manual_failover().await.unwrap();

        assert_eq!(f.orchestrator.derive_reason().await, FailoverReason::Manual);
        // Marker is consumed: the next round is back to health_timeout
        assert_eq!(
            f.orchestrator.derive_reason().await,
            FailoverReason::HealthTimeout
        );
    }

    #[tokio::test]
    async fn test_lagging_fresh_leader_labels_lag_exceeded() {
        let f = fixture("c", 0).await;
        let publisher =
            TopologyPublisher::new(Arc::clone(&f.store) as Arc<dyn CoordinationStore>);
        publisher.publish("a", "10.0.0.1:3306").await.unwrap();

        let mut old_leader = ClusterMember::new("a".into(), "10.0.0.1:3306".into());
        old_leader.role = MemberRole::Leader;
        old_leader.health = HealthScore::Degraded;
        old_leader.lag = 500;
        f.registry
            .apply_event(&KvEvent {
                key: keys::member("a"),
                value: Some(VersionedValue {
                    version: 1,
                    value: serde_json::to_value(&old_leader).unwrap(),
                }),
            })
            .await;

        assert_eq!(
            f.orchestrator.derive_reason().await,
            FailoverReason::LagExceeded
        );
    }
}
