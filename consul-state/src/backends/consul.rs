//! Consul KV backend for state storage
//!
//! State lives under a single KV key. Locking uses a Consul session: the lock
//! key `<path>/.lock` is acquired with the session and carries the caller's
//! payload, so contenders can see who holds it. Sessions have a TTL; a
//! holder that dies stops renewing and its lock is released by the agent.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::debug;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};
use crate::config::{ConsulConfig, DEFAULT_LOCK_TTL, lock_key_for};
use crate::lock::{LockHandle, LockHolder};
use crate::state::{StatePayload, StateVersion};
use crate::transport::Transport;

/// Consul-based state backend bound to one KV path
pub struct ConsulBackend {
    transport: Transport,
    /// KV key for the state
    path: String,
    /// KV key for the lock
    lock_key: String,
    /// TTL of lock sessions
    lock_ttl: Duration,
    cancel: Option<CancellationToken>,
    /// Lock currently held through this client
    active_lock: Mutex<Option<ActiveLock>>,
}

#[derive(Debug, Clone)]
struct ActiveLock {
    session_id: String,
    info: Vec<u8>,
    state: LockState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    /// Acquired and not known to be lost
    Held,
    /// The agent reported the session gone
    Expired,
    /// A release was started but did not complete; finished on next acquire
    Releasing,
}

/// Reply of a single HTTP exchange
struct Reply {
    status: StatusCode,
    body: Vec<u8>,
}

impl Reply {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }

    /// Consul answers KV writes and lock operations with a bare `true`/`false`
    fn boolean(&self) -> BackendResult<bool> {
        match self.text().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(BackendError::InvalidResponse(format!(
                "expected true or false, got '{}'",
                other
            ))),
        }
    }

    fn json<T: for<'de> Deserialize<'de>>(&self) -> BackendResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| BackendError::InvalidResponse(e.to_string()))
    }
}

impl ConsulBackend {
    /// Create a backend for `path` over an existing transport
    pub fn new(transport: Transport, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            transport,
            lock_key: lock_key_for(&path),
            path,
            lock_ttl: DEFAULT_LOCK_TTL,
            cancel: None,
            active_lock: Mutex::new(None),
        }
    }

    /// Create a new ConsulBackend from a resolved configuration
    pub fn from_consul_config(config: &ConsulConfig) -> BackendResult<Self> {
        let transport = Transport::new(config)?;
        Ok(Self::new(transport, config.path.clone()).with_lock_ttl(config.lock_ttl))
    }

    /// Create a new ConsulBackend from the host's raw configuration
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let consul = ConsulConfig::from_backend_config(config)?;
        Self::from_consul_config(&consul)
    }

    /// Use a different TTL for lock sessions
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Abort in-flight requests when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Get the state path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the lock key
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Whether this client currently holds the lock
    pub fn is_locked(&self) -> bool {
        self.active_lock()
            .as_ref()
            .is_some_and(|active| active.state == LockState::Held)
    }

    fn active_lock(&self) -> MutexGuard<'_, Option<ActiveLock>> {
        self.active_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the active lock if it is backed by `session_id`
    fn clear_active_lock(&self, session_id: &str) {
        let mut active = self.active_lock();
        if active.as_ref().is_some_and(|a| a.session_id == session_id) {
            *active = None;
        }
    }

    /// Move the active lock to `state` if it is backed by `session_id`
    fn mark_active_lock(&self, session_id: &str, state: LockState) {
        if let Some(active) = self
            .active_lock()
            .as_mut()
            .filter(|a| a.session_id == session_id)
        {
            active.state = state;
        }
    }

    /// Release the lock key and destroy the session.
    ///
    /// A session that is already gone, or that lost the key in the meantime,
    /// leaves nothing to release.
    async fn finish_release(&self, session_id: &str) -> BackendResult<()> {
        if !self.session_exists(session_id).await? {
            debug!("session {} already expired, nothing to release", session_id);
            return Ok(());
        }

        let released = self.lock_operation("release", session_id, Vec::new()).await?;
        self.destroy_session(session_id).await?;
        if released {
            debug!("released lock on {}", self.path);
        } else {
            debug!("session {} no longer held {}", session_id, self.lock_key);
        }
        Ok(())
    }

    /// Send a request and collect the reply, honouring cancellation
    async fn send(&self, request: RequestBuilder) -> BackendResult<Reply> {
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(Reply {
                status,
                body: body.to_vec(),
            })
        };

        let result = match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(BackendError::Cancelled),
                result = exchange => result,
            },
            None => exchange.await,
        };

        Ok(result?)
    }

    /// Send a request and fail on any non-success status
    async fn send_ok(&self, request: RequestBuilder) -> BackendResult<Reply> {
        let reply = self.send(request).await?;
        if reply.status.is_success() {
            Ok(reply)
        } else {
            Err(unexpected_status(&reply))
        }
    }

    /// Read a KV entry; `None` when the key does not exist
    async fn get_kv(&self, key: &str) -> BackendResult<Option<KvPair>> {
        debug!("GET kv {}", key);
        let url = self.transport.kv_url(key)?;
        let request = self
            .transport
            .request(Method::GET, url)
            .query(&[("consistent", "")]);

        let reply = self.send(request).await?;
        if reply.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !reply.status.is_success() {
            return Err(unexpected_status(&reply));
        }

        let pairs: Vec<KvPair> = reply.json()?;
        let key = key.trim_start_matches('/');
        Ok(pairs.into_iter().find(|pair| pair.key == key))
    }

    async fn create_session(&self) -> BackendResult<String> {
        let url = self.transport.session_url("create", None)?;
        let body = SessionRequest {
            name: format!("{}-{}", env!("CARGO_PKG_NAME"), self.path),
            ttl: format!("{}s", self.lock_ttl.as_secs()),
            behavior: "release",
            lock_delay: "0s",
        };
        let reply = self
            .send_ok(self.transport.request(Method::PUT, url).json(&body))
            .await?;
        let created: SessionCreated = reply.json()?;
        debug!("created session {} for {}", created.id, self.path);
        Ok(created.id)
    }

    async fn destroy_session(&self, session_id: &str) -> BackendResult<()> {
        debug!("destroying session {}", session_id);
        let url = self.transport.session_url("destroy", Some(session_id))?;
        self.send_ok(self.transport.request(Method::PUT, url)).await?;
        Ok(())
    }

    /// Whether the session still exists on the agent
    async fn session_exists(&self, session_id: &str) -> BackendResult<bool> {
        let url = self.transport.session_url("info", Some(session_id))?;
        let reply = self.send_ok(self.transport.request(Method::GET, url)).await?;
        let sessions: Option<Vec<SessionEntry>> = reply.json()?;
        Ok(sessions
            .unwrap_or_default()
            .iter()
            .any(|session| session.id == session_id))
    }

    /// PUT on the lock key with `acquire` or `release`
    async fn lock_operation(
        &self,
        operation: &str,
        session_id: &str,
        body: Vec<u8>,
    ) -> BackendResult<bool> {
        let url = self.transport.kv_url(&self.lock_key)?;
        let request = self
            .transport
            .request(Method::PUT, url)
            .query(&[(operation, session_id)])
            .body(body);
        self.send_ok(request).await?.boolean()
    }
}

#[async_trait]
impl StateBackend for ConsulBackend {
    async fn read_state(&self) -> BackendResult<Option<StatePayload>> {
        match self.get_kv(&self.path).await? {
            Some(pair) => {
                let version = StateVersion::new(pair.modify_index);
                Ok(Some(StatePayload::new(pair.decode_value()?, version)))
            }
            None => Ok(None),
        }
    }

    async fn write_state(&self, data: &[u8], expected: Option<StateVersion>) -> BackendResult<()> {
        debug!("PUT kv {} (cas: {:?})", self.path, expected);
        let url = self.transport.kv_url(&self.path)?;
        let mut request = self.transport.request(Method::PUT, url).body(data.to_vec());
        if let Some(version) = expected {
            request = request.query(&[("cas", version.index())]);
        }

        let written = self.send_ok(request).await?.boolean()?;
        match (written, expected) {
            (true, _) => Ok(()),
            (false, Some(expected)) => Err(BackendError::Conflict {
                path: self.path.clone(),
                expected,
            }),
            (false, None) => Err(BackendError::Unavailable(format!(
                "Consul refused to write {}",
                self.path
            ))),
        }
    }

    async fn delete_state(&self) -> BackendResult<()> {
        debug!("DELETE kv {}", self.path);
        let url = self.transport.kv_url(&self.path)?;
        self.send_ok(self.transport.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn acquire_lock(&self, info: &[u8]) -> BackendResult<LockHandle> {
        let active = self.active_lock().clone();
        if let Some(active) = active {
            match active.state {
                LockState::Held => {
                    debug!("{} is already locked by this client", self.path);
                    return Err(BackendError::locked(&self.path, active.info));
                }
                LockState::Releasing => self.finish_release(&active.session_id).await?,
                LockState::Expired => {}
            }
            self.clear_active_lock(&active.session_id);
        }

        let session_id = self.create_session().await?;
        let acquired = match self.lock_operation("acquire", &session_id, info.to_vec()).await {
            Ok(acquired) => acquired,
            Err(err) => {
                // The session would otherwise linger until its TTL runs out
                let _ = self.destroy_session(&session_id).await;
                return Err(err);
            }
        };

        if !acquired {
            let holder = self.lock_holder().await;
            self.destroy_session(&session_id).await?;
            let info = holder?.map(|holder| holder.info).unwrap_or_default();
            debug!("lock on {} is held by another session", self.path);
            return Err(BackendError::locked(&self.path, info));
        }

        debug!("acquired lock on {} with session {}", self.path, session_id);
        *self.active_lock() = Some(ActiveLock {
            session_id: session_id.clone(),
            info: info.to_vec(),
            state: LockState::Held,
        });
        Ok(LockHandle::new(session_id, self.lock_key.clone(), info.to_vec()))
    }

    async fn release_lock(&self, lock: LockHandle) -> BackendResult<()> {
        let state = self
            .active_lock()
            .as_ref()
            .filter(|active| active.session_id == lock.id())
            .map(|active| active.state);
        let Some(state) = state.filter(|_| lock.key() == self.lock_key) else {
            return Err(BackendError::LockNotHeld(format!(
                "lock {} is not held by this client",
                lock.id()
            )));
        };

        if state == LockState::Expired {
            debug!("session {} already expired, nothing to release", lock.id());
            self.clear_active_lock(lock.id());
            return Ok(());
        }

        // Stays marked until the agent confirms, so a failed release is
        // completed by the next acquire
        self.mark_active_lock(lock.id(), LockState::Releasing);
        self.finish_release(lock.id()).await?;
        self.clear_active_lock(lock.id());
        Ok(())
    }

    async fn renew_lock(&self, lock: &LockHandle) -> BackendResult<()> {
        let url = self.transport.session_url("renew", Some(lock.id()))?;
        let reply = self.send(self.transport.request(Method::PUT, url)).await?;
        match reply.status {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                self.mark_active_lock(lock.id(), LockState::Expired);
                Err(BackendError::LockNotHeld(format!(
                    "session {} has expired",
                    lock.id()
                )))
            }
            _ => Err(unexpected_status(&reply)),
        }
    }

    async fn lock_holder(&self) -> BackendResult<Option<LockHolder>> {
        let Some(pair) = self.get_kv(&self.lock_key).await? else {
            return Ok(None);
        };
        let info = pair.decode_value()?;
        Ok(pair
            .session
            .filter(|session| !session.is_empty())
            .map(|session_id| LockHolder { session_id, info }))
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        let holder = self
            .lock_holder()
            .await?
            .ok_or_else(|| BackendError::LockNotFound(lock_id.to_string()))?;

        if holder.session_id != lock_id {
            return Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: holder.session_id,
            });
        }

        // Destroying the session releases every lock it holds
        self.destroy_session(lock_id).await?;
        self.clear_active_lock(lock_id);
        Ok(())
    }
}

fn unexpected_status(reply: &Reply) -> BackendError {
    BackendError::Unavailable(format!("Consul returned {}: {}", reply.status, reply.text()))
}

/// KV entry as returned by `GET /v1/kv/<key>`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvPair {
    key: String,
    /// Base64-encoded value; `null` for an empty value
    value: Option<String>,
    modify_index: u64,
    #[serde(default)]
    session: Option<String>,
}

impl KvPair {
    fn decode_value(&self) -> BackendResult<Vec<u8>> {
        match &self.value {
            Some(value) => STANDARD.decode(value).map_err(|e| {
                BackendError::InvalidResponse(format!("Invalid value for {}: {}", self.key, e))
            }),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest {
    name: String,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'static str,
    lock_delay: &'static str,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct SessionEntry {
    #[serde(rename = "ID")]
    id: String,
}
