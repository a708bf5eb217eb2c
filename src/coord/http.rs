//! HTTP coordination store adapter
//!
//! Speaks a small REST contract against any key-value coordination service
//! (or a thin shim in front of one) that offers versioned writes and
//! TTL leases:
//!
//! - `GET    /v1/kv/{ns}/{key}`            -> `{version, value}` | 404
//! - `PUT    /v1/kv/{ns}/{key}`            body `{value, cas?}` -> `{version}` | 409 `{version}`
//! - `DELETE /v1/kv/{ns}/{key}`            -> 200 | 404
//! - `GET    /v1/kv/{ns}?prefix={p}`       -> `[{key, version, value}]`
//! - `POST   /v1/lease/{ns}/{key}`         body `{owner, token, ttl_ms}` -> `{version}` | 409 `{owner}`
//! - `PUT    /v1/lease/{ns}/{key}`         body `{token, ttl_ms}` -> `{version}` | 410
//! - `DELETE /v1/lease/{ns}/{key}?token=t` -> 200 (idempotent)
//! - `GET    /v1/lease/{ns}/{key}`         -> `{owner, token}` | 404
//!
//! Every request carries the configured timeout; transport failures map to
//! `StoreUnavailable` so callers can back off without ever blocking the
//! node's ability to self-demote. Watches are poll-based: the service is
//! only required to serve consistent reads, not push notifications.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CoordinationStore, KvEvent, Lease, LeaseRecord, VersionedValue, WatchStream};
use crate::config::StoreConfig;
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
struct PutBody<'a> {
    value: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    cas: Option<u64>,
}

#[derive(Debug, Serialize)]
struct AcquireBody<'a> {
    owner: &'a str,
    token: Uuid,
    ttl_ms: u64,
}

#[derive(Debug, Serialize)]
struct RenewBody {
    token: Uuid,
    ttl_ms: u64,
}

#[derive(Debug, Deserialize)]
struct VersionReply {
    version: u64,
}

#[derive(Debug, Deserialize)]
struct HolderReply {
    owner: String,
}

#[derive(Debug, Deserialize)]
struct KvItem {
    key: String,
    version: u64,
    value: serde_json::Value,
}

/// REST adapter implementing [`CoordinationStore`]
#[derive(Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base: String,
    namespace: String,
    poll_interval: Duration,
}

impl HttpStore {
    /// Build an adapter from the `[store]` config section
    pub fn new(config: &StoreConfig, poll_interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base: config.endpoint.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            poll_interval,
        })
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}/{}", self.base, self.namespace, key)
    }

    fn kv_list_url(&self, prefix: &str) -> String {
        format!("{}/v1/kv/{}?prefix={}", self.base, self.namespace, prefix)
    }

    fn lease_url(&self, key: &str) -> String {
        format!("{}/v1/lease/{}/{}", self.base, self.namespace, key)
    }

    fn transport_err(e: reqwest::Error) -> Error {
        Error::StoreUnavailable(e.to_string())
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Http(format!("malformed store response: {}", e)))
    }

    async fn list_once(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        let response = self
            .client
            .get(self.kv_list_url(prefix))
            .send()
            .await
            .map_err(Self::transport_err)?;

        match response.status() {
            StatusCode::OK => {
                let items: Vec<KvItem> = Self::parse(response).await?;
                let mut result: Vec<(String, VersionedValue)> = items
                    .into_iter()
                    .map(|i| {
                        (
                            i.key,
                            VersionedValue {
                                version: i.version,
                                value: i.value,
                            },
                        )
                    })
                    .collect();
                result.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(result)
            }
            status => Err(Error::Http(format!("list returned {}", status))),
        }
    }
}

#[async_trait]
impl CoordinationStore for HttpStore {
    async fn acquire_lease(&self, key: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        let token = Uuid::new_v4();
        let response = self
            .client
            .post(self.lease_url(key))
            .json(&AcquireBody {
                owner,
                token,
                ttl_ms: ttl.as_millis() as u64,
            })
            .send()
            .await
            .map_err(Self::transport_err)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                let reply: VersionReply = Self::parse(response).await?;
                Ok(Lease {
                    key: key.to_string(),
                    owner: owner.to_string(),
                    token,
                    ttl,
                    version: reply.version,
                })
            }
            StatusCode::CONFLICT => {
                let holder: HolderReply = Self::parse(response).await?;
                Err(Error::LeaseHeld {
                    key: key.to_string(),
                    owner: holder.owner,
                })
            }
            status => Err(Error::Http(format!("lease acquire returned {}", status))),
        }
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<Lease> {
        let response = self
            .client
            .put(self.lease_url(&lease.key))
            .json(&RenewBody {
                token: lease.token,
                ttl_ms: lease.ttl.as_millis() as u64,
            })
            .send()
            .await
            .map_err(Self::transport_err)?;

        match response.status() {
            StatusCode::OK => {
                let reply: VersionReply = Self::parse(response).await?;
                Ok(Lease {
                    version: reply.version,
                    ..lease.clone()
                })
            }
            StatusCode::GONE | StatusCode::NOT_FOUND | StatusCode::CONFLICT => {
                Err(Error::LeaseExpired(lease.key.clone()))
            }
            status => Err(Error::Http(format!("lease renew returned {}", status))),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let url = format!("{}?token={}", self.lease_url(&lease.key), lease.token);
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(Self::transport_err)?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            status => Err(Error::Http(format!("lease release returned {}", status))),
        }
    }

    async fn lease_holder(&self, key: &str) -> Result<Option<LeaseRecord>> {
        let response = self
            .client
            .get(self.lease_url(key))
            .send()
            .await
            .map_err(Self::transport_err)?;

        match response.status() {
            StatusCode::OK => Ok(Some(Self::parse(response).await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(Error::Http(format!("lease read returned {}", status))),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<VersionedValue>> {
        let response = self
            .client
            .get(self.kv_url(key))
            .send()
            .await
            .map_err(Self::transport_err)?;

        match response.status() {
            StatusCode::OK => Ok(Some(Self::parse(response).await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(Error::Http(format!("get returned {}", status))),
        }
    }

    async fn put(&self, key: &str, value: serde_json::Value) -> Result<u64> {
        let response = self
            .client
            .put(self.kv_url(key))
            .json(&PutBody {
                value: &value,
                cas: None,
            })
            .send()
            .await
            .map_err(Self::transport_err)?;

        match response.status() {
            StatusCode::OK => {
                let reply: VersionReply = Self::parse(response).await?;
                Ok(reply.version)
            }
            status => Err(Error::Http(format!("put returned {}", status))),
        }
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: u64,
        value: serde_json::Value,
    ) -> Result<u64> {
        let response = self
            .client
            .put(self.kv_url(key))
            .json(&PutBody {
                value: &value,
                cas: Some(expected_version),
            })
            .send()
            .await
            .map_err(Self::transport_err)?;

        match response.status() {
            StatusCode::OK => {
                let reply: VersionReply = Self::parse(response).await?;
                Ok(reply.version)
            }
            StatusCode::CONFLICT => {
                let reply: VersionReply = Self::parse(response).await?;
                Err(Error::CasConflict {
                    key: key.to_string(),
                    expected: expected_version,
                    found: reply.version,
                })
            }
            status => Err(Error::Http(format!("compare-and-set returned {}", status))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.kv_url(key))
            .send()
            .await
            .map_err(Self::transport_err)?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            status => Err(Error::Http(format!("delete returned {}", status))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, VersionedValue)>> {
        self.list_once(prefix).await
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        // Poll-based watch: diff successive listings by version. The stream
        // ends on the first transport failure; callers restart it.
        struct PollState {
            store: HttpStore,
            prefix: String,
            seen: HashMap<String, u64>,
            pending: Vec<KvEvent>,
            primed: bool,
        }

        let state = PollState {
            store: self.clone(),
            prefix: prefix.to_string(),
            seen: HashMap::new(),
            pending: Vec::new(),
            primed: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop() {
                    return Some((event, state));
                }

                if state.primed {
                    tokio::time::sleep(state.store.poll_interval).await;
                }

                let listing = match state.store.list_once(&state.prefix).await {
                    Ok(listing) => listing,
                    Err(_) => return None,
                };

                let mut current: HashMap<String, u64> = HashMap::new();
                for (key, versioned) in listing {
                    current.insert(key.clone(), versioned.version);
                    let changed = state.seen.get(&key) != Some(&versioned.version);
                    // The priming pass establishes the baseline silently
                    if changed && state.primed {
                        state.pending.push(KvEvent {
                            key,
                            value: Some(versioned),
                        });
                    }
                }
                if state.primed {
                    for key in state.seen.keys() {
                        if !current.contains_key(key) {
                            state.pending.push(KvEvent {
                                key: key.clone(),
                                value: None,
                            });
                        }
                    }
                }
                state.seen = current;
                state.primed = true;
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> HttpStore {
        let config = StoreConfig {
            backend: "http".into(),
            endpoint: "http://kv.internal:2379/".into(),
            namespace: "steward".into(),
            request_timeout_ms: 2000,
        };
        HttpStore::new(&config, Duration::from_millis(500)).unwrap()
    }

    #[test]
    fn test_url_layout() {
        let store = test_store();
        assert_eq!(
            store.kv_url("cluster/topology"),
            "http://kv.internal:2379/v1/kv/steward/cluster/topology"
        );
        assert_eq!(
            store.lease_url("cluster/leader"),
            "http://kv.internal:2379/v1/lease/steward/cluster/leader"
        );
        assert_eq!(
            store.kv_list_url("members/"),
            "http://kv.internal:2379/v1/kv/steward?prefix=members/"
        );
    }
}
