//! Core types for Grapevine

pub mod contact;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use contact::{AccountId, Address, Contact, LocalContact};

/// Unique identifier for a shared data instance
///
/// Assigned by the creator and carried by every replication message for
/// that instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SharedDataId(pub Uuid);

impl SharedDataId {
    /// Create a new random SharedDataId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the hyphenated string form
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for SharedDataId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SharedDataId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sd_{}", self.0)
    }
}

/// Identifier of a search rumor, echoed back in search results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchId(pub Uuid);

impl SearchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SearchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SearchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
