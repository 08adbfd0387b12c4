//! Consul-backed coordination.
//!
//! - Leader lock: a session with a TTL and `Behavior=release` acquires a KV
//!   key. A watcher renews the session at half its TTL and runs blocking
//!   queries on the key; failing renewal or seeing another session on the
//!   key marks the leadership lost.
//! - Registry: minions register an agent service with an embedded TTL check
//!   (`service:<minion>`) and pass it on every heartbeat. Dead minions are
//!   removed through the catalog, since their own agent is gone.

use std::time::Duration;

use async_trait::async_trait;
use flotilla_id::{MinionId, SessionId};
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::lock::stopped;
use crate::{CoordinationError, HealthCheck, Leadership, LockService, Registration, Registry};

/// Default timeout for non-blocking requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Consul rejects session TTLs below ten seconds.
const MIN_SESSION_TTL: Duration = Duration::from_secs(10);

const CONSUL_INDEX_HEADER: &str = "X-Consul-Index";

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

/// A KV entry as returned by `/v1/kv/<key>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvPair {
    pub key: String,
    #[serde(default)]
    pub session: Option<String>,
    pub modify_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    node: NodeInfo,
    service: ServiceInfo,
    #[serde(default)]
    checks: Vec<CheckInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    node: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceInfo {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckInfo {
    status: String,
}

fn ttl_string(d: Duration) -> String {
    format!("{}s", d.as_secs().max(1))
}

fn check_id(minion: &MinionId) -> String {
    format!("service:{minion}")
}

/// Thin Consul HTTP API client.
#[derive(Debug, Clone)]
pub struct ConsulClient {
    http: reqwest::Client,
    base_url: String,
}

impl ConsulClient {
    /// Create a client for the Consul agent at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, CoordinationError> {
        let http = reqwest::Client::builder().build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CoordinationError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(CoordinationError::Api { status, body })
    }

    /// Create a session that releases its locks when it expires.
    pub async fn create_session(&self, name: &str, ttl: Duration) -> Result<String, CoordinationError> {
        let body = serde_json::json!({
            "Name": name,
            "TTL": ttl_string(ttl),
            "Behavior": "release",
            "LockDelay": "0s",
        });
        let response = self
            .http
            .put(self.url("/v1/session/create"))
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let created: SessionCreated = Self::check(response).await?.json().await?;
        Ok(created.id)
    }

    /// Renew a session. Returns false if Consul no longer knows it.
    pub async fn renew_session(&self, id: &str) -> Result<bool, CoordinationError> {
        let response = self
            .http
            .put(self.url(&format!("/v1/session/renew/{id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    /// Try to take `key` for `session`.
    pub async fn acquire_key(&self, key: &str, session: &str) -> Result<bool, CoordinationError> {
        let response = self
            .http
            .put(self.url(&format!("/v1/kv/{key}")))
            .query(&[("acquire", session)])
            .body(session.to_string())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Release `key` if `session` holds it.
    pub async fn release_key(&self, key: &str, session: &str) -> Result<bool, CoordinationError> {
        let response = self
            .http
            .put(self.url(&format!("/v1/kv/{key}")))
            .query(&[("release", session)])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Read `key`. With an index this is a blocking query that returns when
    /// the key changes past `index` or `wait` elapses.
    pub async fn read_key(
        &self,
        key: &str,
        index: Option<u64>,
        wait: Duration,
    ) -> Result<(Option<KvPair>, u64), CoordinationError> {
        let mut request = self
            .http
            .get(self.url(&format!("/v1/kv/{key}")))
            .timeout(wait + REQUEST_TIMEOUT);
        if let Some(index) = index {
            request = request.query(&[("index", index.to_string()), ("wait", ttl_string(wait))]);
        }

        let response = request.send().await?;
        let new_index = response
            .headers()
            .get(CONSUL_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok((None, new_index));
        }

        let pairs: Vec<KvPair> = Self::check(response).await?.json().await?;
        Ok((pairs.into_iter().next(), new_index))
    }

    async fn register_service(&self, registration: &Registration) -> Result<(), CoordinationError> {
        let body = serde_json::json!({
            "ID": registration.minion.as_str(),
            "Name": registration.service,
            "Check": {
                "CheckID": check_id(&registration.minion),
                "Name": "minion heartbeat",
                "TTL": ttl_string(registration.ttl),
                "Status": "passing",
            },
        });
        let response = self
            .http
            .put(self.url("/v1/agent/service/register"))
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn pass_check(&self, minion: &MinionId) -> Result<(), CoordinationError> {
        let response = self
            .http
            .put(self.url(&format!("/v1/agent/check/pass/{}", check_id(minion))))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        match Self::check(response).await {
            Ok(_) => Ok(()),
            // Older agents answer 500 for unknown checks.
            Err(CoordinationError::Api { status, body })
                if status == 404 || (status == 500 && body.contains("Unknown check")) =>
            {
                debug!(minion = %minion, body = %body, "Heartbeat for unknown check");
                Err(CoordinationError::NotRegistered(minion.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn health(&self, service: &str) -> Result<Vec<ServiceEntry>, CoordinationError> {
        let response = self
            .http
            .get(self.url(&format!("/v1/health/service/{service}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn catalog_deregister(&self, node: &str, service_id: &str) -> Result<(), CoordinationError> {
        let body = serde_json::json!({ "Node": node, "ServiceID": service_id });
        let response = self
            .http
            .put(self.url("/v1/catalog/deregister"))
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Leader lock on a Consul KV key.
pub struct ConsulLock {
    client: ConsulClient,
    key: String,
    ttl: Duration,
    wait: Duration,
    session: SessionId,
    consul_session: Mutex<Option<String>>,
}

impl ConsulLock {
    /// Contend for `key` with sessions of the given TTL.
    pub fn new(client: ConsulClient, key: impl Into<String>, ttl: Duration) -> Self {
        let ttl = ttl.max(MIN_SESSION_TTL);
        Self {
            client,
            key: key.into().trim_start_matches('/').to_string(),
            ttl,
            wait: ttl / 2,
            session: SessionId::new(),
            consul_session: Mutex::new(None),
        }
    }

    /// This contender's session.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Reuse the current Consul session while it renews, else create one.
    async fn ensure_session(&self) -> Result<String, CoordinationError> {
        let mut current = self.consul_session.lock().await;
        if let Some(id) = current.as_ref() {
            if self.client.renew_session(id).await? {
                return Ok(id.clone());
            }
            debug!(consul_session = %id, "Consul session expired, creating a new one");
        }

        let name = format!("flotilla-scheduler {}", self.session);
        let id = self.client.create_session(&name, self.ttl).await?;
        *current = Some(id.clone());
        Ok(id)
    }
}

#[async_trait]
impl LockService for ConsulLock {
    async fn acquire(
        &self,
        mut stop: watch::Receiver<bool>,
    ) -> Result<Option<Leadership>, CoordinationError> {
        let mut index = None;

        loop {
            if *stop.borrow() {
                return Ok(None);
            }

            let consul_session = self.ensure_session().await?;
            if self.client.acquire_key(&self.key, &consul_session).await? {
                let (lost, leadership) = Leadership::channel(self.session);
                tokio::spawn(watch_leadership(
                    self.client.clone(),
                    self.key.clone(),
                    consul_session.clone(),
                    self.ttl,
                    self.wait,
                    lost,
                ));
                info!(
                    key = %self.key,
                    session = %self.session,
                    consul_session = %consul_session,
                    "Acquired leader lock"
                );
                return Ok(Some(leadership));
            }

            // Held elsewhere: block until the key changes, then try again.
            tokio::select! {
                result = self.client.read_key(&self.key, index, self.wait) => {
                    let (_, new_index) = result?;
                    index = Some(new_index);
                }
                _ = stopped(&mut stop) => return Ok(None),
            }
        }
    }

    async fn release(&self, leadership: Leadership) -> Result<(), CoordinationError> {
        let consul_session = self.consul_session.lock().await.clone();
        drop(leadership);

        if let Some(consul_session) = consul_session {
            let released = self.client.release_key(&self.key, &consul_session).await?;
            debug!(key = %self.key, released, "Released leader lock");
        }
        Ok(())
    }
}

/// Keep the session alive and watch the key until leadership is lost or
/// the holder drops its [`Leadership`].
async fn watch_leadership(
    client: ConsulClient,
    key: String,
    consul_session: String,
    ttl: Duration,
    wait: Duration,
    lost: watch::Sender<bool>,
) {
    let mut renew = tokio::time::interval(ttl / 2);
    renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
    renew.tick().await;

    let mut index = None;
    let reason = loop {
        tokio::select! {
            _ = lost.closed() => return,
            _ = renew.tick() => match client.renew_session(&consul_session).await {
                Ok(true) => {}
                Ok(false) => break "session invalidated",
                Err(e) => {
                    warn!(error = %e, "Failed to renew leader session");
                    break "session renewal failed";
                }
            },
            result = client.read_key(&key, index, wait) => match result {
                Ok((pair, new_index)) => {
                    let holder = pair.as_ref().and_then(|p| p.session.as_deref());
                    if holder != Some(consul_session.as_str()) {
                        break "lock held by another session";
                    }
                    index = Some(new_index);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to watch leader key");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
        }
    };

    warn!(key = %key, reason, "Leader lock lost");
    let _ = lost.send(true);
}

/// Minion registry on Consul agent services and TTL checks.
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    client: ConsulClient,
    service: String,
}

impl ConsulRegistry {
    /// `service` is the well-known minion service, used to locate minions
    /// when deregistering them through the catalog.
    pub fn new(client: ConsulClient, service: impl Into<String>) -> Self {
        Self {
            client,
            service: service.into(),
        }
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, registration: &Registration) -> Result<(), CoordinationError> {
        self.client.register_service(registration).await
    }

    async fn heartbeat(&self, minion: &MinionId) -> Result<(), CoordinationError> {
        self.client.pass_check(minion).await
    }

    async fn deregister(&self, minion: &MinionId) -> Result<(), CoordinationError> {
        let entries = self.client.health(&self.service).await?;
        let Some(entry) = entries.iter().find(|e| e.service.id == minion.as_str()) else {
            return Ok(());
        };
        self.client
            .catalog_deregister(&entry.node.node, &entry.service.id)
            .await
    }

    async fn checks(&self, service: &str) -> Result<Vec<HealthCheck>, CoordinationError> {
        let entries = self.client.health(service).await?;

        let mut checks = Vec::with_capacity(entries.len());
        for entry in entries {
            let minion = match MinionId::parse(&entry.service.id) {
                Ok(minion) => minion,
                Err(e) => {
                    warn!(service_id = %entry.service.id, error = %e, "Skipping unparseable minion");
                    continue;
                }
            };
            // Node-level checks (serfHealth) count too: a dead node fails them.
            let healthy = entry.checks.iter().all(|c| c.status == "passing");
            checks.push(HealthCheck {
                minion,
                healthy,
                last_heartbeat: None,
            });
        }
        Ok(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_string() {
        assert_eq!(ttl_string(Duration::from_secs(30)), "30s");
        assert_eq!(ttl_string(Duration::from_millis(200)), "1s");
    }

    #[test]
    fn test_lock_clamps_ttl() {
        let client = ConsulClient::new("http://127.0.0.1:8500/").unwrap();
        let lock = ConsulLock::new(client, "/flotilla/leader", Duration::from_secs(2));
        assert_eq!(lock.ttl, MIN_SESSION_TTL);
        assert_eq!(lock.key, "flotilla/leader");
    }

    #[test]
    fn test_health_entry_decoding() {
        let body = serde_json::json!([{
            "Node": {"Node": "node-1", "Address": "10.0.0.1"},
            "Service": {"ID": "m1", "Service": "flotilla-minions"},
            "Checks": [
                {"CheckID": "serfHealth", "Status": "passing"},
                {"CheckID": "service:m1", "Status": "critical"}
            ]
        }]);
        let entries: Vec<ServiceEntry> = serde_json::from_value(body).unwrap();
        assert_eq!(entries[0].node.node, "node-1");
        assert_eq!(entries[0].service.id, "m1");
        assert_eq!(entries[0].checks.len(), 2);
    }
}
