//! In-process coordination store
//!
//! A single-process implementation of [`CoordinationStore`] holding keys in
//! memory. Used by the test suite and for single-node/dev deployments where
//! no external coordination service exists. Lease expiry is checked on every
//! access against a monotonic clock, so a lapsed claim is never observable
//! as valid.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::{CoordinationStore, KvEvent, Lease, LeaseRecord, VersionedValue, WatchStream};
use crate::error::{Error, Result};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct LeaseMeta {
    owner: String,
    token: Uuid,
    deadline: Instant,
}

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    version: u64,
    lease: Option<LeaseMeta>,
}

/// In-memory [`CoordinationStore`] backend
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    events: broadcast::Sender<KvEvent>,
    /// Fault-injection switch: while set, every operation fails with
    /// `StoreUnavailable`, mimicking an unreachable coordination service
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Simulate the coordination service becoming unreachable (or reachable
    /// again). Only meaningful for the memory backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store offline".into()));
        }
        Ok(())
    }

    /// Drop entries whose lease deadline has passed, notifying watchers.
    /// Must run before any read so expired claims are never observed.
    fn sweep(&self, entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.lease.as_ref().is_some_and(|l| l.deadline <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            entries.remove(&key);
            let _ = self.events.send(KvEvent {
                key,
                value: None,
            });
        }
    }

    fn notify(&self, key: &str, entry: &Entry) {
        let _ = self.events.send(KvEvent {
            key: key.to_string(),
            value: Some(VersionedValue {
                version: entry.version,
                value: entry.value.clone(),
            }),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries);

        if let Some(existing) = entries.get(key) {
            if let Some(meta) = &existing.lease {
                return Err(Error::LeaseHeld {
                    key: key.to_string(),
                    owner: meta.owner.clone(),
                });
            }
            // Plain key in the way of a lease claim is a misconfiguration
            return Err(Error::Internal(format!(
                "key {} exists without lease semantics",
                key
            )));
        }

        let token = Uuid::new_v4();
        let record = LeaseRecord {
            owner: owner.to_string(),
            token,
        };
        let version = 1;
        let entry = Entry {
            value: serde_json::to_value(&record)?,
            version,
            lease: Some(LeaseMeta {
                owner: owner.to_string(),
                token,
                deadline: Instant::now() + ttl,
            }),
        };
        self.notify(key, &entry);
        entries.insert(key.to_string(), entry);

        Ok(Lease {
            key: key.to_string(),
            owner: owner.to_string(),
            token,
            ttl,
            version,
        })
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries);

        let entry = entries
            .get_mut(&lease.key)
            .ok_or_else(|| Error::LeaseExpired(lease.key.clone()))?;

        match &mut entry.lease {
            Some(meta) if meta.token == lease.token => {
                meta.deadline = Instant::now() + lease.ttl;
                entry.version += 1;
                let version = entry.version;
                let entry = entry.clone();
                self.notify(&lease.key, &entry);
                Ok(Lease {
                    version,
                    ..lease.clone()
                })
            }
            _ => Err(Error::LeaseExpired(lease.key.clone())),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries);

        let owned = entries
            .get(&lease.key)
            .and_then(|e| e.lease.as_ref())
            .is_some_and(|meta| meta.token == lease.token);

        if owned {
            entries.remove(&lease.key);
            let _ = self.events.send(KvEvent {
                key: lease.key.clone(),
                value: None,
            });
        }
        Ok(())
    }

    async fn lease_holder(&self, key: &str) -> Result<Option<LeaseRecord>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries);

        match entries.get(key) {
            Some(entry) if entry.lease.is_some() => {
                Ok(Some(serde_json::from_value(entry.value.clone())?))
            }
            _ => Ok(None),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries);

        Ok(entries.get(key).map(|e| VersionedValue {
            version: e.version,
            value: e.value.clone(),
        }))
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<u64> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries);

        let version = entries.get(key).map(|e| e.version).unwrap_or(0) + 1;
        let entry = Entry {
            value,
            version,
            lease: None,
        };
        self.notify(key, &entry);
        entries.insert(key.to_string(), entry);
        Ok(version)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<u64> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries);

        let found = entries.get(key).map(|e| e.version).unwrap_or(0);
        if found != expected_version {
            return Err(Error::CasConflict {
                key: key.to_string(),
                expected: expected_version,
                found,
            });
        }

        let version = found + 1;
        let entry = Entry {
            value,
            version,
            lease: None,
        };
        self.notify(key, &entry);
        entries.insert(key.to_string(), entry);
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            let _ = self.events.send(KvEvent {
                key: key.to_string(),
                value: None,
            });
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.sweep(&mut entries);

        let mut result: Vec<(String, VersionedValue)> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| {
                (
                    k.clone(),
                    VersionedValue {
                        version: e.version,
                        value: e.value.clone(),
                    },
                )
            })
            .collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(result)
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        self.check_available()?;
        let prefix = prefix.to_string();
        let stream = BroadcastStream::new(self.events.subscribe())
            // Lagged receivers skip missed events; the registry re-hydrates
            // from list() when it notices gaps
            .filter_map(|item| item.ok())
            .filter(move |event| event.key.starts_with(&prefix));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::keys;

    #[tokio::test]
    async fn test_lease_acquire_and_conflict() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);

        let lease = store
            .acquire_lease(keys::LEADER_LEASE, "a", ttl)
            .await
            .unwrap();
        assert_eq!(lease.owner, "a");

        let err = store
            .acquire_lease(keys::LEADER_LEASE, "b", ttl)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseHeld { ref owner, .. } if owner == "a"));
    }

    #[tokio::test]
    async fn test_lease_expiry_frees_key() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(30);

        store
            .acquire_lease(keys::LEADER_LEASE, "a", ttl)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(store.lease_holder(keys::LEADER_LEASE).await.unwrap().is_none());
        let lease = store
            .acquire_lease(keys::LEADER_LEASE, "b", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(lease.owner, "b");
    }

    #[tokio::test]
    async fn test_renew_is_idempotent_on_owner() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);

        let mut lease = store
            .acquire_lease(keys::LEADER_LEASE, "a", ttl)
            .await
            .unwrap();
        for _ in 0..5 {
            lease = store.renew_lease(&lease).await.unwrap();
            let holder = store.lease_holder(keys::LEADER_LEASE).await.unwrap().unwrap();
            assert_eq!(holder.owner, "a");
        }
    }

    #[tokio::test]
    async fn test_stale_lease_cannot_renew() {
        let store = MemoryStore::new();
        let lease = store
            .acquire_lease(keys::LEADER_LEASE, "a", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Key freed by expiry, then claimed by another owner
        store
            .acquire_lease(keys::LEADER_LEASE, "b", Duration::from_secs(5))
            .await
            .unwrap();

        let err = store.renew_lease(&lease).await.unwrap_err();
        assert!(matches!(err, Error::LeaseExpired(_)));
        let holder = store.lease_holder(keys::LEADER_LEASE).await.unwrap().unwrap();
        assert_eq!(holder.owner, "b");
    }

    #[tokio::test]
    async fn test_simultaneous_candidacy_one_winner() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(5);

        let s1 = std::sync::Arc::clone(&store);
        let s2 = std::sync::Arc::clone(&store);
        let (r1, r2) = tokio::join!(
            s1.acquire_lease(keys::LEADER_LEASE, "b", ttl),
            s2.acquire_lease(keys::LEADER_LEASE, "c", ttl),
        );

        let winners = [r1.is_ok(), r2.is_ok()];
        assert_eq!(winners.iter().filter(|w| **w).count(), 1);
        let loser = if r1.is_ok() { r2 } else { r1 };
        assert!(matches!(loser.unwrap_err(), Error::LeaseHeld { .. }));
    }

    #[tokio::test]
    async fn test_cas_create_and_conflict() {
        let store = MemoryStore::new();

        let v1 = store
            .compare_and_set(keys::TOPOLOGY, 0, serde_json::json!({"epoch": 1}))
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let err = store
            .compare_and_set(keys::TOPOLOGY, 0, serde_json::json!({"epoch": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CasConflict { found: 1, .. }));

        let v2 = store
            .compare_and_set(keys::TOPOLOGY, v1, serde_json::json!({"epoch": 2}))
            .await
            .unwrap();
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn test_watch_sees_member_updates() {
        let store = MemoryStore::new();
        let mut watch = store.watch(keys::MEMBER_PREFIX).await.unwrap();

        store
            .put(&keys::member("a"), serde_json::json!({"health": "healthy"}))
            .await
            .unwrap();
        // Unrelated key must not leak through the prefix filter
        store
            .put(keys::TOPOLOGY, serde_json::json!({"epoch": 1}))
            .await
            .unwrap();
        store.delete(&keys::member("a")).await.unwrap();

        let first = watch.next().await.unwrap();
        assert_eq!(first.key, keys::member("a"));
        assert!(first.value.is_some());

        let second = watch.next().await.unwrap();
        assert_eq!(second.key, keys::member("a"));
        assert!(second.value.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_fails_fast() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = store.get(keys::TOPOLOGY).await.unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(_)));
        assert!(err.is_retryable());

        store.set_unavailable(false);
        assert!(store.get(keys::TOPOLOGY).await.unwrap().is_none());
    }
}
