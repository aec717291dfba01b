//! Consul State Backend
//!
//! Stores an opaque infrastructure state blob under a key in Consul's KV
//! store and coordinates exclusive access to it with Consul sessions.
//!
//! # Overview
//!
//! - **ConsulConfig**: validated configuration with explicit defaults
//! - **Transport**: authenticated HTTP handle to a Consul agent
//! - **StateBackend**: read/write/delete/lock operations on one state path
//! - **LockInfo**: the conventional lock payload identifying the holder
//!
//! # Example
//!
//! ```ignore
//! use consul_state::{create_backend, BackendConfig, LockInfo};
//!
//! let config = BackendConfig::new("consul")
//!     .with_attribute("path", "infra/prod/terraform.tfstate")
//!     .with_attribute("address", "consul.internal:8500")
//!     .with_attribute("access_token", token);
//!
//! let backend = create_backend(&config)?;
//!
//! // Acquire lock before modifying state
//! let info = LockInfo::new("infra/prod/terraform.tfstate", "apply");
//! let lock = backend.acquire_lock(&info.to_bytes()?).await?;
//!
//! // Read current state and write it back conditionally
//! let current = backend.read_state().await?;
//! let expected = current.as_ref().map(|state| state.version);
//! backend.write_state(&new_state, expected).await?;
//!
//! // Release lock
//! backend.release_lock(lock).await?;
//! ```

pub mod backend;
pub mod backends;
pub mod config;
pub mod lock;
pub mod state;
pub mod transport;

// Re-export main types for convenience
pub use backend::{BackendConfig, BackendError, BackendResult, StateBackend};
pub use backends::{ConsulBackend, create_backend};
pub use config::{ConsulConfig, HttpBasicAuth, Scheme};
pub use lock::{LockHandle, LockHolder, LockInfo};
pub use state::{StatePayload, StateVersion};
pub use transport::Transport;
