//! Member Registry
//!
//! In-memory cache of every member's last-published state, hydrated and
//! kept current via the coordination store's watch mechanism. The cache is
//! rebuildable from the store at any time; nothing here is the source of
//! truth, and nothing here may be used to infer leadership.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, RwLock};
use tokio_stream::StreamExt;

use super::{ClusterMember, MemberRole};
use crate::coord::{keys, CoordinationStore, KvEvent};
use crate::error::Result;

/// Base delay before restarting a broken watch stream
const WATCH_RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// Jittered restart delay so a cluster-wide store hiccup does not bring
/// every watcher back in the same instant
fn restart_backoff() -> Duration {
    use rand::Rng;
    WATCH_RESTART_BACKOFF + Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

/// Cluster-wide member state cache
pub struct MemberRegistry {
    /// This node's member name
    self_name: String,
    /// Heartbeats older than this exclude a member from elections
    staleness_bound: Duration,
    /// Coordination store backing the registry
    store: Arc<dyn CoordinationStore>,
    /// Cached member records keyed by name
    members: RwLock<HashMap<String, ClusterMember>>,
}

impl MemberRegistry {
    /// Create an empty registry for this node
    pub fn new(
        self_name: String,
        staleness_bound: Duration,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        Self {
            self_name,
            staleness_bound,
            store,
            members: RwLock::new(HashMap::new()),
        }
    }

    /// This node's member name
    pub fn self_name(&self) -> &str {
        &self.self_name
    }

    /// The configured staleness bound
    pub fn staleness_bound(&self) -> Duration {
        self.staleness_bound
    }

    /// Register this node in the cluster with a fresh record
    pub async fn register_self(&self, address: String) -> Result<()> {
        let member = ClusterMember::new(self.self_name.clone(), address);
        self.publish(member).await
    }

    /// Publish a mutation of this node's own record. Only the owning member
    /// writes its record; the heartbeat timestamp is refreshed on every
    /// publish.
    pub async fn publish_self<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut ClusterMember),
    {
        let mut member = {
            let members = self.members.read().await;
            members
                .get(&self.self_name)
                .cloned()
                .ok_or_else(|| crate::Error::MemberNotFound(self.self_name.clone()))?
        };
        mutate(&mut member);
        member.heartbeat = Utc::now();
        self.publish(member).await
    }

    async fn publish(&self, member: ClusterMember) -> Result<()> {
        let key = keys::member(&member.name);
        let value = serde_json::to_value(&member)?;
        self.store.put(&key, value).await?;
        self.members
            .write()
            .await
            .insert(member.name.clone(), member);
        Ok(())
    }

    /// Remove this node's record on graceful departure
    pub async fn deregister_self(&self) -> Result<()> {
        self.store.delete(&keys::member(&self.self_name)).await?;
        self.members.write().await.remove(&self.self_name);
        Ok(())
    }

    /// Rebuild the cache from the store
    pub async fn hydrate(&self) -> Result<()> {
        let listing = self.store.list(keys::MEMBER_PREFIX).await?;
        let mut fresh = HashMap::new();
        for (key, versioned) in listing {
            let Some(name) = key.strip_prefix(keys::MEMBER_PREFIX) else {
                continue;
            };
            match serde_json::from_value::<ClusterMember>(versioned.value) {
                Ok(member) => {
                    fresh.insert(name.to_string(), member);
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed member record {}: {}", key, e);
                }
            }
        }
        *self.members.write().await = fresh;
        Ok(())
    }

    /// Fold one watch event into the cache
    pub async fn apply_event(&self, event: &KvEvent) {
        let Some(name) = event.key.strip_prefix(keys::MEMBER_PREFIX) else {
            return;
        };
        let mut members = self.members.write().await;
        match &event.value {
            Some(versioned) => match serde_json::from_value::<ClusterMember>(versioned.value.clone())
            {
                Ok(member) => {
                    members.insert(name.to_string(), member);
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed member update {}: {}", event.key, e);
                }
            },
            None => {
                members.remove(name);
            }
        }
    }

    /// Keep the cache current until shutdown. Hydrates, then follows the
    /// watch stream, re-hydrating whenever the stream breaks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            if let Err(e) = self.hydrate().await {
                tracing::warn!("Registry hydration failed: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(restart_backoff()) => continue,
                    _ = shutdown.changed() => return,
                }
            }

            let mut stream = match self.store.watch(keys::MEMBER_PREFIX).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Registry watch failed to start: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(restart_backoff()) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            };

            loop {
                tokio::select! {
                    event = stream.next() => {
                        match event {
                            Some(event) => self.apply_event(&event).await,
                            None => {
                                tracing::debug!("Member watch stream ended, restarting");
                                break;
                            }
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        }
    }

    /// All known members, ordered by name
    pub async fn list_members(&self) -> Vec<ClusterMember> {
        let members = self.members.read().await;
        let mut result: Vec<ClusterMember> = members.values().cloned().collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    /// Look up one member by name
    pub async fn get(&self, name: &str) -> Option<ClusterMember> {
        self.members.read().await.get(name).cloned()
    }

    /// This node's own cached record
    pub async fn get_self(&self) -> Option<ClusterMember> {
        self.get(&self.self_name).await
    }

    /// The member currently publishing the leader role, for display and lag
    /// reference only — leadership is proven solely by the lease.
    pub async fn current_leader(&self) -> Option<ClusterMember> {
        let members = self.members.read().await;
        members
            .values()
            .find(|m| m.role == MemberRole::Leader)
            .cloned()
    }

    /// Members eligible to stand in an election: healthy, not fenced, and
    /// heartbeat fresher than the staleness bound. Ordered by name.
    pub async fn eligible_candidates(&self) -> Vec<ClusterMember> {
        let members = self.members.read().await;
        let mut result: Vec<ClusterMember> = members
            .values()
            .filter(|m| m.is_eligible(self.staleness_bound))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::HealthScore;
    use crate::coord::MemoryStore;

    fn registry_with_store() -> (Arc<MemoryStore>, MemberRegistry) {
        let store = Arc::new(MemoryStore::new());
        let registry = MemberRegistry::new(
            "a".to_string(),
            Duration::from_secs(20),
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
        );
        (store, registry)
    }

    #[tokio::test]
    async fn test_register_and_list_ordering() {
        let (store, registry) = registry_with_store();
        registry.register_self("10.0.0.1:3306".into()).await.unwrap();

        // Peers publish their own records directly to the store
        for name in ["c", "b"] {
            let peer = ClusterMember::new(name.into(), format!("10.0.0.{}:3306", name.as_bytes()[0]));
            store
                .put(&keys::member(name), serde_json::to_value(&peer).unwrap())
                .await
                .unwrap();
        }

        registry.hydrate().await.unwrap();
        let names: Vec<String> = registry
            .list_members()
            .await
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_publish_self_refreshes_heartbeat() {
        let (_, registry) = registry_with_store();
        registry.register_self("10.0.0.1:3306".into()).await.unwrap();

        let before = registry.get_self().await.unwrap().heartbeat;
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry
            .publish_self(|m| m.health = HealthScore::Degraded)
            .await
            .unwrap();

        let after = registry.get_self().await.unwrap();
        assert_eq!(after.health, HealthScore::Degraded);
        assert!(after.heartbeat > before);
    }

    #[tokio::test]
    async fn test_stale_member_excluded_from_eligibility() {
        let (store, registry) = registry_with_store();
        registry.register_self("10.0.0.1:3306".into()).await.unwrap();

        let mut stale = ClusterMember::new("b".into(), "10.0.0.2:3306".into());
        stale.heartbeat = Utc::now() - chrono::Duration::seconds(120);
        store
            .put(&keys::member("b"), serde_json::to_value(&stale).unwrap())
            .await
            .unwrap();
        registry.hydrate().await.unwrap();

        assert_eq!(registry.list_members().await.len(), 2);
        let eligible = registry.eligible_candidates().await;
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].name, "a");
    }

    #[tokio::test]
    async fn test_watch_event_updates_cache() {
        let (store, registry) = registry_with_store();
        registry.register_self("10.0.0.1:3306".into()).await.unwrap();

        let peer = ClusterMember::new("b".into(), "10.0.0.2:3306".into());
        let versioned = crate::coord::VersionedValue {
            version: 1,
            value: serde_json::to_value(&peer).unwrap(),
        };
        registry
            .apply_event(&KvEvent {
                key: keys::member("b"),
                value: Some(versioned),
            })
            .await;
        assert!(registry.get("b").await.is_some());

        registry
            .apply_event(&KvEvent {
                key: keys::member("b"),
                value: None,
            })
            .await;
        assert!(registry.get("b").await.is_none());
        let _ = store;
    }

    #[tokio::test]
    async fn test_cache_rebuildable_after_loss() {
        let (store, registry) = registry_with_store();
        registry.register_self("10.0.0.1:3306".into()).await.unwrap();

        // Simulate a fresh process: new registry over the same store
        let rebuilt = MemberRegistry::new(
            "a".to_string(),
            Duration::from_secs(20),
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
        );
        rebuilt.hydrate().await.unwrap();
        assert!(rebuilt.get("a").await.is_some());
    }
}
