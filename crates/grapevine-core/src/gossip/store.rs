//! Rumor store

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::gossip::protocol::WireRumor;
use crate::gossip::rumor::{Rumor, RumorId};

/// Live rumors, deduplicated by id
///
/// Expiry is only enforced when a snapshot is taken; there is no sweeper.
#[derive(Debug, Default)]
pub struct RumorStore {
    rumors: Mutex<HashMap<RumorId, Rumor>>,
}

impl RumorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `rumor` unless one with the same id is already stored
    ///
    /// Returns `true` when the rumor was new.
    pub fn add_rumor(&self, rumor: Rumor) -> bool {
        let mut rumors = self.rumors.lock();
        if rumors.contains_key(&rumor.id()) {
            return false;
        }
        debug!(id = %rumor.id(), "Adding rumor");
        rumors.insert(rumor.id(), rumor);
        true
    }

    /// Prune expired rumors, then return the rest in wire form
    pub fn snapshot(&self) -> Vec<WireRumor> {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<WireRumor> {
        let mut rumors = self.rumors.lock();
        rumors.retain(|id, rumor| {
            let live = !rumor.is_expired_at(now);
            if !live {
                debug!(%id, "Removing expired rumor");
            }
            live
        });

        rumors
            .values()
            .filter_map(|rumor| match rumor.to_wire() {
                Ok(wire) => Some(wire),
                Err(e) => {
                    warn!(id = %rumor.id(), error = %e, "Failed to encode rumor");
                    None
                }
            })
            .collect()
    }

    pub fn contains(&self, id: &RumorId) -> bool {
        self.rumors.lock().contains_key(id)
    }

    /// Stored entries, including expired ones not yet pruned
    pub fn len(&self) -> usize {
        self.rumors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
