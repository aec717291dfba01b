//! State payload as stored in the backend

use std::fmt;

use serde::{Deserialize, Serialize};

/// Store-assigned version of a state payload.
///
/// For Consul this is the key's `ModifyIndex`: opaque to callers, but it
/// grows with every modification, so it can be handed back to
/// [`write_state`](crate::StateBackend::write_state) as a compare-and-swap
/// guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVersion(u64);

impl StateVersion {
    /// Guard that only matches when no value exists yet at the path
    pub const ABSENT: StateVersion = StateVersion(0);

    pub fn new(index: u64) -> Self {
        Self(index)
    }

    /// The raw index understood by the store
    pub fn index(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A state blob together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePayload {
    /// Opaque serialized state
    pub data: Vec<u8>,
    /// Version to pass back for a conditional write
    pub version: StateVersion,
}

impl StatePayload {
    pub fn new(data: impl Into<Vec<u8>>, version: StateVersion) -> Self {
        Self {
            data: data.into(),
            version,
        }
    }

    /// Whether the stored value is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
