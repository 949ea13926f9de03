//! Explicit tenant context
//!
//! Every engine call receives the active session instead of looking up a
//! "current user" from ambient storage.

use serde::{Deserialize, Serialize};

/// The logged-in account on whose behalf the engine reads and writes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    owner_id: String,
}

impl Session {
    /// Create a session for an owner
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
        }
    }

    /// Owner stamped on every write and used to filter every read
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }
}
