//! Lock handles and the conventional lock payload

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An exclusive claim on a state path, tied to a store session.
///
/// Handles are not `Clone`: releasing one consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct LockHandle {
    session_id: String,
    key: String,
    info: Vec<u8>,
}

impl LockHandle {
    pub(crate) fn new(session_id: String, key: String, info: Vec<u8>) -> Self {
        Self {
            session_id,
            key,
            info,
        }
    }

    /// Store session backing this lock; also the ID accepted by `force_unlock`
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Key the lock is held on
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Payload attached when the lock was acquired
    pub fn info(&self) -> &[u8] {
        &self.info
    }
}

/// Current holder of a lock as reported by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// Session holding the lock
    pub session_id: String,
    /// Payload the holder attached
    pub info: Vec<u8>,
}

impl LockHolder {
    /// Decode the payload as [`LockInfo`], if it is one
    pub fn lock_info(&self) -> Option<LockInfo> {
        LockInfo::from_bytes(&self.info)
    }
}

/// Information about a state lock, the usual lock payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock request
    pub id: String,
    /// State path being locked
    pub path: String,
    /// The operation being performed (e.g., "apply", "destroy", "plan")
    pub operation: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    /// Version of this crate on the holder's side
    pub version: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
}

impl LockInfo {
    /// Create a new lock payload for an operation on `path`
    pub fn new(path: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.into(),
            operation: operation.into(),
            who: get_lock_owner(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created: Utc::now(),
        }
    }

    /// Serialize for use as a lock payload
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse a lock payload, returning `None` if it isn't a `LockInfo`
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Human-readable description of a lock payload for error messages
pub(crate) fn describe_lock_payload(info: &[u8]) -> String {
    match LockInfo::from_bytes(info) {
        Some(lock) => format!(
            "held by {} (lock ID: {}, operation: {}, since {})",
            lock.who,
            lock.id,
            lock.operation,
            lock.created.to_rfc3339()
        ),
        None if info.is_empty() => "holder unknown".to_string(),
        None => String::from_utf8_lossy(info).into_owned(),
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}
