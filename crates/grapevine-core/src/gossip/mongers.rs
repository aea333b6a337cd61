//! Known peers eligible to receive gossip

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use crate::types::{Address, LocalContact};

/// A known peer and when it goes stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Monger {
    pub address: Address,
    pub expires_at: Instant,
}

impl Monger {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// The monger set. Never contains the local peer.
#[derive(Debug)]
pub struct Mongers {
    me: LocalContact,
    ttl: Duration,
    mongers: RwLock<Vec<Monger>>,
}

impl Mongers {
    pub fn new(me: LocalContact, ttl: Duration) -> Self {
        Self {
            me,
            ttl,
            mongers: RwLock::new(Vec::new()),
        }
    }

    /// Add `addr`, or refresh its expiry if already known
    ///
    /// Returns `true` when a new entry was added.
    pub fn add(&self, addr: Address) -> bool {
        if self.me.is_self(&addr) {
            return false;
        }

        let expires_at = Instant::now() + self.ttl;
        let mut mongers = self.mongers.write();
        if let Some(existing) = mongers.iter_mut().find(|m| m.address == addr) {
            existing.expires_at = expires_at;
            return false;
        }

        debug!(peer = %addr, "Adding monger");
        mongers.push(Monger {
            address: addr,
            expires_at,
        });
        true
    }

    /// Remove the entry for `addr`; returns `true` if one was removed
    pub fn remove(&self, addr: &Address) -> bool {
        if self.me.is_self(addr) {
            return false;
        }

        let mut mongers = self.mongers.write();
        match mongers.iter().position(|m| m.address == *addr) {
            Some(index) => {
                mongers.remove(index);
                debug!(peer = %addr, "Removed monger");
                true
            }
            None => false,
        }
    }

    /// Uniformly random known address
    pub fn random_address(&self) -> Option<Address> {
        let mongers = self.mongers.read();
        if mongers.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..mongers.len());
        Some(mongers[index].address)
    }

    /// Evict mongers whose expiry has passed; returns how many were removed
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut mongers = self.mongers.write();
        let before = mongers.len();
        mongers.retain(|m| !m.is_expired_at(now));
        let removed = before - mongers.len();
        if removed > 0 {
            debug!(removed, "Pruned expired mongers");
        }
        removed
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.mongers.read().iter().any(|m| m.address == *addr)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.mongers.read().iter().map(|m| m.address).collect()
    }

    pub fn list(&self) -> Vec<Monger> {
        self.mongers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.mongers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
