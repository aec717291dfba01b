//! State backend trait and error types

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::lock::{LockHandle, LockHolder, describe_lock_payload};
use crate::state::{StatePayload, StateVersion};

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// Invalid or missing configuration
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// The HTTP transport could not be assembled from the configuration
    #[error("Failed to initialize transport: {0}")]
    TransportInit(String),

    /// Network failure or an error reply from the store
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    /// The store replied with something we could not decode
    #[error("Invalid response from state store: {0}")]
    InvalidResponse(String),

    /// Compare-and-swap write lost against a concurrent modification
    #[error("State at {path} was modified concurrently (expected version {expected})")]
    Conflict { path: String, expected: StateVersion },

    /// The state is locked by another session
    #[error("State at {path} is locked: {}", describe_lock_payload(.info))]
    Locked { path: String, info: Vec<u8> },

    /// The lock handle does not belong to an active lock of this client
    #[error("Lock not held: {0}")]
    LockNotHeld(String),

    /// No lock exists (for force-unlock operations)
    #[error("Lock not found: {0}")]
    LockNotFound(String),

    /// Lock ID mismatch when force-unlocking
    #[error("Lock ID mismatch: expected {expected}, got {actual}")]
    LockMismatch { expected: String, actual: String },

    /// The caller cancelled the in-flight request
    #[error("Operation cancelled")]
    Cancelled,
}

impl BackendError {
    /// Create a Locked error from the holder's payload
    pub fn locked(path: impl Into<String>, info: impl Into<Vec<u8>>) -> Self {
        Self::Locked {
            path: path.into(),
            info: info.into(),
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether the caller may retry the same operation unchanged.
    ///
    /// Conflicts and lock contention are not retryable as-is: the caller has
    /// to re-read state or pick a backoff policy first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Cancelled)
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Unavailable(format!("request timed out: {}", err))
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Trait for state storage backends
///
/// A backend is bound to a single state path. The state itself is an opaque
/// byte payload; locking is exclusive and non-blocking.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read the current state from the backend
    ///
    /// Returns `None` if no state exists (first-time use)
    async fn read_state(&self) -> BackendResult<Option<StatePayload>>;

    /// Write the state to the backend
    ///
    /// With `expected` set the write only succeeds if the stored version
    /// still matches, otherwise it fails with [`BackendError::Conflict`].
    async fn write_state(&self, data: &[u8], expected: Option<StateVersion>) -> BackendResult<()>;

    /// Delete the state. Deleting absent state is not an error.
    async fn delete_state(&self) -> BackendResult<()>;

    /// Acquire the exclusive lock, attaching `info` as the lock payload
    ///
    /// Fails immediately with [`BackendError::Locked`] if someone else holds it.
    async fn acquire_lock(&self, info: &[u8]) -> BackendResult<LockHandle>;

    /// Release a previously acquired lock
    async fn release_lock(&self, lock: LockHandle) -> BackendResult<()>;

    /// Extend the lifetime of a held lock
    async fn renew_lock(&self, lock: &LockHandle) -> BackendResult<()>;

    /// Inspect who currently holds the lock, if anyone
    async fn lock_holder(&self) -> BackendResult<Option<LockHolder>>;

    /// Force release a lock by its ID
    ///
    /// This is an administrative operation that should be used with caution
    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()>;
}

/// Configuration for a state backend, as collected by the host
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// Backend type (e.g., "consul")
    pub backend_type: String,
    /// Backend-specific attributes
    pub attributes: HashMap<String, String>,
}

impl BackendConfig {
    /// Create a config for the given backend type with no attributes
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Get a string attribute value, treating the empty string as unset
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}
