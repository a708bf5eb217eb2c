//! Health Monitor
//!
//! Runs a fixed-period probe cycle against the local database engine and
//! writes the resulting score into the member registry under this node's
//! own key. Publishing health never itself triggers failover; that decision
//! belongs to the election engine reading aggregate state, so a single
//! flaky probe cannot cause a promotion storm.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::cluster::{HealthScore, MemberRegistry};
use crate::config::StewardConfig;
use crate::db::{DatabaseManager, Offset};
use crate::error::Result;

/// Loop-local probe bookkeeping
#[derive(Debug, Default)]
pub struct ProbeState {
    /// Consecutive failed probes
    pub consecutive_failures: u32,
    /// Last published score
    pub last_score: Option<HealthScore>,
}

/// Outcome of a single probe cycle
#[derive(Debug)]
struct ProbeOutcome {
    score: HealthScore,
    offset: Offset,
    lag: u64,
}

/// Periodic prober of the local database node
pub struct HealthMonitor {
    db: Arc<dyn DatabaseManager>,
    registry: Arc<MemberRegistry>,
    probe_interval: Duration,
    probe_latency_warn: Duration,
    lag_warn_threshold: u64,
    failure_threshold: u32,
}

impl HealthMonitor {
    /// Create a monitor from the failover policy config
    pub fn new(
        db: Arc<dyn DatabaseManager>,
        registry: Arc<MemberRegistry>,
        config: &StewardConfig,
    ) -> Self {
        Self {
            db,
            registry,
            probe_interval: config.probe_interval(),
            probe_latency_warn: config.probe_latency_warn(),
            lag_warn_threshold: config.failover.lag_warn_threshold,
            failure_threshold: config.failover.failure_threshold,
        }
    }

    /// Run the probe loop until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut state = ProbeState::default();
        let mut ticker = tokio::time::interval(self.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.probe_and_publish(&mut state).await {
                        // Publish failures are retried on the next cycle;
                        // the member goes stale on its own if they persist
                        tracing::warn!("Health publish failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    tracing::debug!("Health monitor stopping");
                    return;
                }
            }
        }
    }

    /// Execute one probe cycle and publish the score
    pub async fn probe_and_publish(&self, state: &mut ProbeState) -> Result<()> {
        let outcome = self.probe_once(state).await;
        state.last_score = Some(outcome.score);

        self.registry
            .publish_self(|member| {
                member.health = outcome.score;
                if outcome.score != HealthScore::Unreachable {
                    member.offset = outcome.offset;
                    member.lag = outcome.lag;
                }
            })
            .await
    }

    /// Probe the local engine once and compute the health score
    async fn probe_once(&self, state: &mut ProbeState) -> ProbeOutcome {
        let started = Instant::now();
        let probed = self.db.replication_offset().await;
        let latency = started.elapsed();

        let offset = match probed {
            Ok(offset) => {
                state.consecutive_failures = 0;
                offset
            }
            Err(e) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.failure_threshold {
                    tracing::warn!(
                        "Local database unreachable after {} consecutive probe failures: {}",
                        state.consecutive_failures,
                        e
                    );
                    return ProbeOutcome {
                        score: HealthScore::Unreachable,
                        offset: 0,
                        lag: 0,
                    };
                }
                // Single probe failures recover silently via retry
                tracing::debug!(
                    "Probe failure {}/{}: {}",
                    state.consecutive_failures,
                    self.failure_threshold,
                    e
                );
                return ProbeOutcome {
                    score: state.last_score.unwrap_or(HealthScore::Healthy),
                    offset: 0,
                    lag: 0,
                };
            }
        };

        let lag = self.replication_lag(offset).await;

        let score = if lag > self.lag_warn_threshold && self.lag_warn_threshold > 0 {
            HealthScore::Degraded
        } else if latency > self.probe_latency_warn {
            HealthScore::Degraded
        } else {
            HealthScore::Healthy
        };

        ProbeOutcome { score, offset, lag }
    }

    /// Lag of this node relative to the last known leader offset. The
    /// leader itself, or a cluster with no published leader, reports zero.
    async fn replication_lag(&self, offset: Offset) -> u64 {
        let recovering = self.db.is_recovering().await.unwrap_or(true);
        if !recovering {
            return 0;
        }
        match self.registry.current_leader().await {
            Some(leader) if leader.name != self.registry.self_name() => {
                leader.offset.saturating_sub(offset)
            }
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterMember, MemberRole};
    use crate::coord::{keys, CoordinationStore, MemoryStore};
    use crate::db::mock::MockDb;

    const CONFIG: &str = r#"
[node]
name = "b"
advertise_address = "10.0.0.2:3306"

[database]
host = "localhost"
user = "steward"
password = "secret"

[store]
backend = "memory"

[failover]
lease_ttl_ms = 10000
probe_interval_ms = 100
lag_warn_threshold = 50
failure_threshold = 3
"#;

    async fn setup(offset: u64) -> (Arc<MockDb>, Arc<MemberRegistry>, HealthMonitor) {
        let config = StewardConfig::from_toml(CONFIG).unwrap();
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(MemberRegistry::new(
            "b".to_string(),
            config.staleness_bound(),
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
        ));
        registry.register_self("10.0.0.2:3306".into()).await.unwrap();

        let db = Arc::new(MockDb::new(offset));
        let monitor = HealthMonitor::new(
            Arc::clone(&db) as Arc<dyn DatabaseManager>,
            Arc::clone(&registry),
            &config,
        );
        (db, registry, monitor)
    }

    async fn publish_leader(registry: &MemberRegistry, offset: u64) {
        let mut leader = ClusterMember::new("a".into(), "10.0.0.1:3306".into());
        leader.role = MemberRole::Leader;
        leader.offset = offset;
        registry
            .apply_event(&crate::coord::KvEvent {
                key: keys::member("a"),
                value: Some(crate::coord::VersionedValue {
                    version: 1,
                    value: serde_json::to_value(&leader).unwrap(),
                }),
            })
            .await;
    }

    #[tokio::test]
    async fn test_healthy_probe_publishes_offset() {
        let (_db, registry, monitor) = setup(40).await;
        let mut state = ProbeState::default();

        monitor.probe_and_publish(&mut state).await.unwrap();
        let member = registry.get_self().await.unwrap();
        assert_eq!(member.health, HealthScore::Healthy);
        assert_eq!(member.offset, 40);
    }

    #[tokio::test]
    async fn test_lag_beyond_warning_degrades() {
        let (_db, registry, monitor) = setup(40).await;
        publish_leader(&registry, 160).await;
        let mut state = ProbeState::default();

        monitor.probe_and_publish(&mut state).await.unwrap();
        let member = registry.get_self().await.unwrap();
        assert_eq!(member.health, HealthScore::Degraded);
        assert_eq!(member.lag, 120);
    }

    #[tokio::test]
    async fn test_single_failure_recovers_silently() {
        let (db, registry, monitor) = setup(40).await;
        let mut state = ProbeState::default();
        monitor.probe_and_publish(&mut state).await.unwrap();

        db.set_reachable(false);
        monitor.probe_and_publish(&mut state).await.unwrap();
        assert_eq!(
            registry.get_self().await.unwrap().health,
            HealthScore::Healthy
        );

        db.set_reachable(true);
        monitor.probe_and_publish(&mut state).await.unwrap();
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_consecutive_failures_mark_unreachable() {
        let (db, registry, monitor) = setup(40).await;
        let mut state = ProbeState::default();
        db.set_reachable(false);

        for _ in 0..3 {
            monitor.probe_and_publish(&mut state).await.unwrap();
        }
        assert_eq!(
            registry.get_self().await.unwrap().health,
            HealthScore::Unreachable
        );
    }

    #[tokio::test]
    async fn test_writable_leader_reports_zero_lag() {
        let (db, registry, monitor) = setup(40).await;
        publish_leader(&registry, 160).await;
        db.promote().await.unwrap();
        let mut state = ProbeState::default();

        monitor.probe_and_publish(&mut state).await.unwrap();
        assert_eq!(registry.get_self().await.unwrap().lag, 0);
    }
}
