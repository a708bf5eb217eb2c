//! Leader Election Engine
//!
//! One state machine per node, states `Follower`, `Candidate`, `Leader`,
//! `Fenced`. Leadership is proven exclusively by holding the lease in the
//! coordination store: acquiring or renewing it is the only path to the
//! `Leader` state, and a leader that cannot prove the lease within the
//! grace window demotes itself before the claim could have passed to
//! anyone else. Every transition has one guard and one side effect; races
//! between candidates are settled by the store's atomicity, never by local
//! heuristics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};

use crate::cluster::{MemberRegistry, MemberRole};
use crate::coord::{keys, CoordinationStore, Lease};
use crate::db::DatabaseManager;
use crate::error::{Error, Result};
use crate::failover::{FailoverOrchestrator, FailoverReason};
use crate::topology::TopologyRecord;

/// Election state of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Watching the lease, standing by
    Follower,
    /// Racing for an unclaimed lease
    Candidate,
    /// Holding the lease, renewing it on a single cooperative timer
    Leader,
    /// Unable to prove leadership; writes rejected until revalidation
    Fenced,
}

impl std::fmt::Display for ElectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElectionState::Follower => write!(f, "FOLLOWER"),
            ElectionState::Candidate => write!(f, "CANDIDATE"),
            ElectionState::Leader => write!(f, "LEADER"),
            ElectionState::Fenced => write!(f, "FENCED"),
        }
    }
}

/// Per-node election state machine
pub struct ElectionEngine {
    /// This node's member name
    name: String,
    /// Coordination store client
    store: Arc<dyn CoordinationStore>,
    /// Shared member state cache
    registry: Arc<MemberRegistry>,
    /// Failover selection and promotion sequence
    orchestrator: Arc<FailoverOrchestrator>,
    /// Local database management collaborator
    db: Arc<dyn DatabaseManager>,
    /// Leadership lease TTL
    lease_ttl: Duration,
    /// Renewal cadence (ttl/2)
    renew_interval: Duration,
    /// Window of failed renewals tolerated before self-fencing
    grace: Duration,
    /// Current state
    state: RwLock<ElectionState>,
    /// Held lease while Leader (kept through Fenced for release)
    lease: RwLock<Option<Lease>>,
    /// When the lease was first observed unclaimed
    unclaimed_since: RwLock<Option<Instant>>,
    /// When lease renewal started failing
    renew_failing_since: RwLock<Option<Instant>>,
    /// Self-exclusion deadline after a refused promotion or step-down
    excluded_until: RwLock<Option<Instant>>,
    /// Failover reason captured when deciding to stand
    pending_reason: RwLock<Option<FailoverReason>>,
    /// Topology snapshot captured when deciding to stand; keys the epoch CAS
    observed_topology: RwLock<Option<(TopologyRecord, u64)>>,
    /// Operator requested a step-down
    manual_requested: AtomicBool,
    /// Local demotion has completed since fencing
    demote_confirmed: AtomicBool,
}

impl ElectionEngine {
    /// Create the engine in the `Follower` state
    pub fn new(
        name: String,
        store: Arc<dyn CoordinationStore>,
        registry: Arc<MemberRegistry>,
        orchestrator: Arc<FailoverOrchestrator>,
        db: Arc<dyn DatabaseManager>,
        lease_ttl: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            name,
            store,
            registry,
            orchestrator,
            db,
            lease_ttl,
            renew_interval: lease_ttl / 2,
            grace,
            state: RwLock::new(ElectionState::Follower),
            lease: RwLock::new(None),
            unclaimed_since: RwLock::new(None),
            renew_failing_since: RwLock::new(None),
            excluded_until: RwLock::new(None),
            pending_reason: RwLock::new(None),
            observed_topology: RwLock::new(None),
            manual_requested: AtomicBool::new(false),
            demote_confirmed: AtomicBool::new(false),
        }
    }

    /// Current state
    pub async fn state(&self) -> ElectionState {
        *self.state.read().await
    }

    /// Whether this node currently believes it is the leader
    pub async fn is_leader(&self) -> bool {
        *self.state.read().await == ElectionState::Leader
    }

    /// Ask the leader to step down; takes effect on the next tick.
    /// Returns `Err` when this node is not the leader.
    pub async fn request_manual_failover(&self) -> Result<()> {
        if !self.is_leader().await {
            return Err(Error::NoLeader);
        }
        self.manual_requested.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Drive the state machine until shutdown, then leave gracefully
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.tick().await;
            tokio::select! {
                _ = tokio::time::sleep(self.tick_delay().await) => {}
                _ = shutdown.changed() => {
                    self.shutdown_graceful().await;
                    return;
                }
            }
        }
    }

    /// One observation/renewal cycle
    pub async fn tick(&self) {
        let state = *self.state.read().await;
        match state {
            ElectionState::Follower => self.follower_tick().await,
            ElectionState::Candidate => self.candidate_tick().await,
            ElectionState::Leader => self.leader_tick().await,
            ElectionState::Fenced => self.fenced_tick().await,
        }
    }

    /// Time until the next cycle. Renewal and observation run at ttl/2; a
    /// leader whose renewals are failing retries fast so the grace window
    /// is measured in attempts, not single shots.
    async fn tick_delay(&self) -> Duration {
        let state = *self.state.read().await;
        match state {
            ElectionState::Leader if self.renew_failing_since.read().await.is_some() => {
                (self.grace / 4).max(Duration::from_millis(10))
            }
            ElectionState::Candidate => Duration::from_millis(10),
            _ => self.renew_interval,
        }
    }

    // ---- Follower ----

    async fn follower_tick(&self) {
        // Expired exclusions lift silently
        {
            let mut excluded = self.excluded_until.write().await;
            if excluded.is_some_and(|until| until <= Instant::now()) {
                *excluded = None;
            }
        }

        let holder = match self.store.lease_holder(keys::LEADER_LEASE).await {
            Ok(holder) => holder,
            Err(e) => {
                tracing::debug!("Lease observation failed: {}", e);
                return;
            }
        };

        if let Some(holder) = holder {
            *self.unclaimed_since.write().await = None;
            if holder.owner == self.name {
                // A previous incarnation's claim; it expires on its own
                tracing::debug!("Observed stale own lease, waiting for expiry");
            }
            return;
        }

        // Lease is unclaimed; time the observation
        let first_seen = {
            let mut unclaimed = self.unclaimed_since.write().await;
            *unclaimed.get_or_insert_with(Instant::now)
        };

        let observed = match self.orchestrator.observe_topology().await {
            Ok(observed) => observed,
            Err(e) => {
                tracing::debug!("Topology observation failed: {}", e);
                return;
            }
        };

        // A fresh cluster elects immediately; losing an existing leader
        // waits one full TTL so a briefly-late renewal never causes a
        // promotion storm
        if observed.is_some() && first_seen.elapsed() < self.lease_ttl {
            return;
        }

        // Selection enforces the candidacy guards (healthy, fresh heartbeat,
        // lag within policy) through the registry, so a node whose own
        // health is not Healthy can never choose itself
        match self.orchestrator.select_candidate().await {
            Ok(chosen) if chosen.name == self.name => {
                if self.excluded_until.read().await.is_some() {
                    return;
                }
                let reason = self.orchestrator.derive_reason().await;
                *self.pending_reason.write().await = Some(reason);
                *self.observed_topology.write().await = observed;
                *self.unclaimed_since.write().await = None;
                self.transition(ElectionState::Candidate, MemberRole::Candidate)
                    .await;
            }
            Ok(chosen) => {
                tracing::debug!("Deferring to better-placed candidate {}", chosen.name);
            }
            Err(Error::NoEligibleCandidate) => {
                // Surfaced to operators, retried every observation cycle
                let reason = self.orchestrator.derive_reason().await;
                self.orchestrator.record_no_candidate(reason).await;
            }
            Err(e) => {
                tracing::warn!("Candidate selection failed: {}", e);
            }
        }
    }

    // ---- Candidate ----

    async fn candidate_tick(&self) {
        let acquired = self
            .store
            .acquire_lease(keys::LEADER_LEASE, &self.name, self.lease_ttl)
            .await;

        let lease = match acquired {
            Ok(lease) => lease,
            Err(Error::LeaseHeld { owner, .. }) => {
                // Lost the race; the loser never assumes partial success
                tracing::info!("Lease race lost to {}", owner);
                self.transition(ElectionState::Follower, MemberRole::Standby)
                    .await;
                return;
            }
            Err(e) => {
                tracing::warn!("Lease acquisition failed: {}", e);
                self.transition(ElectionState::Follower, MemberRole::Standby)
                    .await;
                return;
            }
        };

        *self.lease.write().await = Some(lease);

        let reason = self
            .pending_reason
            .write()
            .await
            .take()
            .unwrap_or(FailoverReason::HealthTimeout);
        let observed = self.observed_topology.write().await.take();

        match self
            .orchestrator
            .execute_promotion(reason, observed.as_ref())
            .await
        {
            Ok(record) => {
                *self.renew_failing_since.write().await = None;
                tracing::info!(
                    "Won election, now LEADER for epoch {} ({})",
                    record.epoch,
                    reason
                );
                let deadline = chrono::Utc::now()
                    + chrono::Duration::milliseconds(self.lease_ttl.as_millis() as i64);
                let _ = self
                    .registry
                    .publish_self(|m| {
                        m.role = MemberRole::Leader;
                        m.lease_deadline = Some(deadline);
                        m.lag = 0;
                    })
                    .await;
                *self.state.write().await = ElectionState::Leader;
            }
            Err(e) => {
                // Promotion refused or epoch race lost: hand the lease back
                // and stand aside for the next round
                if matches!(e, Error::PromotionFailed { .. }) {
                    tracing::error!("Promotion failed, excluded from next round: {}", e);
                    *self.excluded_until.write().await = Some(Instant::now() + self.lease_ttl);
                }
                self.release_held_lease().await;
                self.transition(ElectionState::Follower, MemberRole::Standby)
                    .await;
            }
        }
    }

    // ---- Leader ----

    async fn leader_tick(&self) {
        if self.manual_requested.swap(false, Ordering::SeqCst) {
            self.step_down_manual().await;
            return;
        }

        let Some(lease) = self.lease.read().await.clone() else {
            // Leader without a lease object cannot prove anything
            self.fence("leadership state lost its lease").await;
            return;
        };

        match self.store.renew_lease(&lease).await {
            Ok(renewed) => {
                *self.lease.write().await = Some(renewed);
                *self.renew_failing_since.write().await = None;

                let deadline = chrono::Utc::now()
                    + chrono::Duration::milliseconds(self.lease_ttl.as_millis() as i64);
                let _ = self
                    .registry
                    .publish_self(|m| {
                        m.role = MemberRole::Leader;
                        m.lease_deadline = Some(deadline);
                    })
                    .await;

                self.check_rival_leader().await;
            }
            Err(e) if e.should_fence() => {
                // The claim is provably gone; someone else may hold it
                self.fence("leadership lease expired").await;
            }
            Err(e) => {
                // Transient store trouble: retry fast, but never past the
                // grace window — a leader that cannot prove it still holds
                // the lease must not remain writable
                let failing_since = {
                    let mut failing = self.renew_failing_since.write().await;
                    *failing.get_or_insert_with(Instant::now)
                };
                tracing::warn!(
                    "Lease renewal failing for {:?}: {}",
                    failing_since.elapsed(),
                    e
                );
                if failing_since.elapsed() >= self.grace {
                    self.fence("coordination store unreachable beyond grace window")
                        .await;
                }
            }
        }
    }

    /// A rival member publishing the leader role with a fresh heartbeat
    /// while we hold the lease can only mean a coordination-store bug or
    /// misconfiguration; both nodes self-fence.
    async fn check_rival_leader(&self) {
        let members = self.registry.list_members().await;
        let rival = members.into_iter().find(|m| {
            m.name != self.name
                && m.role == MemberRole::Leader
                && !m.is_stale(self.registry.staleness_bound())
        });

        if let Some(rival) = rival {
            let err = Error::SplitBrainDetected {
                first: self.name.clone(),
                second: rival.name.clone(),
            };
            tracing::error!("{}", err);
            self.fence("split-brain detected").await;
        }
    }

    async fn step_down_manual(&self) {
        tracing::info!("Stepping down on operator request");
        if let Err(e) = self.orchestrator.mark_manual_failover().await {
            tracing::warn!("Could not leave manual-failover marker: {}", e);
        }
        if let Err(e) = self.db.demote().await {
            tracing::error!("Demotion during manual step-down failed: {}", e);
        }
        self.release_held_lease().await;
        // Stand aside for one round so the switchover actually moves
        *self.excluded_until.write().await = Some(Instant::now() + self.lease_ttl);
        self.transition(ElectionState::Follower, MemberRole::Standby)
            .await;
    }

    /// Stop accepting writes and park in the safety sink. The demotion is
    /// retried from `Fenced` until it is confirmed.
    async fn fence(&self, why: &str) {
        tracing::error!("FENCING: {}", why);
        *self.state.write().await = ElectionState::Fenced;
        *self.renew_failing_since.write().await = None;

        match self.db.demote().await {
            Ok(()) => {
                self.demote_confirmed.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                self.demote_confirmed.store(false, Ordering::SeqCst);
                tracing::error!("Local demotion failed while fencing: {}", e);
            }
        }

        // Best effort only; the store may be the reason we are fencing
        let _ = self
            .registry
            .publish_self(|m| {
                m.role = MemberRole::Fenced;
                m.lease_deadline = None;
            })
            .await;
    }

    // ---- Fenced ----

    async fn fenced_tick(&self) {
        if !self.demote_confirmed.load(Ordering::SeqCst) {
            match self.db.demote().await {
                Ok(()) => self.demote_confirmed.store(true, Ordering::SeqCst),
                Err(e) => {
                    tracing::error!("Demotion still failing while fenced: {}", e);
                    return;
                }
            }
        }

        // Re-enter Follower only after proving no stale lease is held
        let holder = match self.store.lease_holder(keys::LEADER_LEASE).await {
            Ok(holder) => holder,
            Err(e) => {
                tracing::debug!("Cannot revalidate lease while fenced: {}", e);
                return;
            }
        };

        match holder {
            Some(record) if record.owner == self.name => {
                // Our stale claim is still on the books; release it if we
                // can still prove ownership, otherwise wait out the TTL
                let lease = self.lease.read().await.clone();
                match lease {
                    Some(lease) if lease.token == record.token => {
                        if let Err(e) = self.store.release_lease(&lease).await {
                            tracing::debug!("Stale lease release failed: {}", e);
                            return;
                        }
                    }
                    _ => return,
                }
            }
            _ => {}
        }

        *self.lease.write().await = None;
        tracing::info!("Fence revalidated clean, re-entering FOLLOWER");
        self.transition(ElectionState::Follower, MemberRole::Standby)
            .await;
    }

    // ---- Shared transitions ----

    async fn transition(&self, state: ElectionState, role: MemberRole) {
        *self.state.write().await = state;
        *self.unclaimed_since.write().await = None;
        let _ = self
            .registry
            .publish_self(|m| {
                m.role = role;
                if role != MemberRole::Leader {
                    m.lease_deadline = None;
                }
            })
            .await;
    }

    async fn release_held_lease(&self) {
        let lease = self.lease.write().await.take();
        if let Some(lease) = lease {
            if let Err(e) = self.store.release_lease(&lease).await {
                tracing::warn!("Lease release failed (will expire on its own): {}", e);
            }
        }
    }

    /// Graceful exit: a departing leader demotes and releases its lease so
    /// the next election is not delayed by a stale claim's TTL
    pub async fn shutdown_graceful(&self) {
        let state = *self.state.read().await;
        if state == ElectionState::Leader {
            tracing::info!("Releasing leadership for graceful shutdown");
            if let Err(e) = self.db.demote().await {
                tracing::error!("Demotion on shutdown failed: {}", e);
            }
        }
        self.release_held_lease().await;
        if state == ElectionState::Leader || state == ElectionState::Candidate {
            self.transition(ElectionState::Follower, MemberRole::Standby)
                .await;
        }
    }
}
