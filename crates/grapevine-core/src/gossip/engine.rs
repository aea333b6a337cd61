//! Gossip engine: the perpetual exchange loop
//!
//! Each cycle moves through `SelectTarget → BuildPayload → Send →
//! ProcessReply` and then idles until the next tick. A cycle that has no
//! target or nothing to say is skipped without touching the network.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::config::GrapevineConfig;
use crate::gossip::mongers::Mongers;
use crate::gossip::protocol::{parse_rumors, GossipRequest, GossipResponse};
use crate::gossip::rumor::Rumor;
use crate::gossip::store::RumorStore;
use crate::transport::{ConnectionCache, Route};
use crate::types::{Address, LocalContact};

/// What one gossip cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No known peer to talk to
    NoPeers,
    /// The rumor store was empty after pruning
    NothingToSend,
    /// The exchange failed; membership was only changed if configured to
    SendFailed { peer: Address },
    /// `sent` rumors went out, `received` well-formed rumors came back
    Exchanged {
        peer: Address,
        sent: usize,
        received: usize,
    },
}

/// Owns the rumor store and monger set and drives periodic exchanges
pub struct GossipEngine {
    me: LocalContact,
    rumors: RumorStore,
    mongers: Mongers,
    cache: Arc<ConnectionCache>,
    interval: Duration,
    remove_monger_on_failure: bool,
    prune_mongers: bool,
}

impl std::fmt::Debug for GossipEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipEngine")
            .field("me", &self.me.address())
            .field("rumors", &self.rumors.len())
            .field("mongers", &self.mongers.len())
            .field("interval", &self.interval)
            .finish()
    }
}

impl GossipEngine {
    pub fn new(me: LocalContact, cache: Arc<ConnectionCache>, config: &GrapevineConfig) -> Self {
        Self {
            mongers: Mongers::new(me.clone(), config.monger_ttl()),
            rumors: RumorStore::new(),
            me,
            cache,
            interval: config.gossip_interval(),
            remove_monger_on_failure: config.remove_monger_on_failure,
            prune_mongers: config.prune_mongers,
        }
    }

    pub fn rumors(&self) -> &RumorStore {
        &self.rumors
    }

    pub fn mongers(&self) -> &Mongers {
        &self.mongers
    }

    /// Store `rumor` for dissemination and register its creator as a monger
    pub fn add_to_gossip(&self, rumor: Rumor) -> bool {
        self.mongers.add(rumor.creator().address);
        self.rumors.add_rumor(rumor)
    }

    /// Register a peer learned out of band (seed, invite)
    pub fn add_server(&self, addr: Address) -> bool {
        self.mongers.add(addr)
    }

    /// Answer an inbound exchange with our live rumors the sender lacks
    pub fn respond(&self, request: &GossipRequest) -> GossipResponse {
        let incoming: HashSet<&str> = request.rumors.iter().map(|r| r.id.as_str()).collect();
        let rumors = self
            .rumors
            .snapshot()
            .into_iter()
            .filter(|r| !incoming.contains(r.id.as_str()))
            .collect();
        GossipResponse { rumors }
    }

    /// Run a single cycle
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.prune_mongers {
            self.mongers.prune_expired();
        }

        let Some(peer) = self.mongers.random_address() else {
            debug!("No peers to gossip to");
            return CycleOutcome::NoPeers;
        };

        let rumors = self.rumors.snapshot();
        if rumors.is_empty() {
            debug!("Nothing to gossip about");
            return CycleOutcome::NothingToSend;
        }

        let sent = rumors.len();
        let request = GossipRequest {
            sender: self.me.address(),
            rumors,
        };

        debug!(%peer, sent, "Gossiping");
        let reply = self.cache.request(&peer, Route::Gossip, &request).await;
        let response: GossipResponse = match reply {
            Ok(response) => response,
            Err(e) => {
                warn!(%peer, error = %e, "Gossip exchange failed");
                if self.remove_monger_on_failure {
                    self.mongers.remove(&peer);
                }
                return CycleOutcome::SendFailed { peer };
            }
        };

        self.mongers.add(peer);

        let learned = parse_rumors(&response.rumors);
        let received = learned.len();
        for rumor in learned {
            self.add_to_gossip(rumor);
        }

        if received > 0 {
            info!(%peer, sent, received, "Gossip exchange complete");
        }
        CycleOutcome::Exchanged {
            peer,
            sent,
            received,
        }
    }

    /// Loop forever (until `shutdown`) running one cycle per interval
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; start after one full interval
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.run_cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Gossip loop stopped");
    }

    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let span = tracing::info_span!("gossip", me = %self.me.address());
        tokio::spawn(self.clone().run(shutdown).instrument(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccountId, Contact};

    fn engine(port: u16) -> GossipEngine {
        let config = GrapevineConfig::ephemeral();
        let me = LocalContact::new(Contact::new(AccountId::new("me"), Address::localhost(port)));
        GossipEngine::new(me, Arc::new(ConnectionCache::new(&config)), &config)
    }

    #[test]
    fn test_add_to_gossip_registers_creator() {
        let engine = engine(8911);
        let other = Contact::new(AccountId::new("bob"), Address::localhost(9000));
        engine.add_to_gossip(Rumor::search(other, "q", Duration::from_secs(60)));

        assert!(engine.mongers().contains(&Address::localhost(9000)));
        assert_eq!(engine.rumors().len(), 1);
    }

    #[test]
    fn test_own_rumor_does_not_add_self() {
        let engine = engine(8911);
        let me = Contact::new(AccountId::new("me"), Address::localhost(8911));
        engine.add_to_gossip(Rumor::search(me, "q", Duration::from_secs(60)));
        assert!(engine.mongers().is_empty());
        assert!(!engine.add_server(Address::localhost(8911)));
    }

    #[tokio::test]
    async fn test_cycle_without_peers_is_skipped() {
        let engine = engine(8911);
        assert_eq!(engine.run_cycle().await, CycleOutcome::NoPeers);
    }

    #[tokio::test]
    async fn test_cycle_with_empty_store_is_skipped() {
        let engine = engine(8911);
        engine.add_server(Address::localhost(9000));
        assert_eq!(engine.run_cycle().await, CycleOutcome::NothingToSend);
    }

    #[tokio::test]
    async fn test_failed_exchange_keeps_monger_by_default() {
        let engine = engine(8911);
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let peer = Address::localhost(port);
        engine.add_server(peer);
        let me = Contact::new(AccountId::new("me"), Address::localhost(8911));
        engine.add_to_gossip(Rumor::search(me, "q", Duration::from_secs(60)));

        assert_eq!(engine.run_cycle().await, CycleOutcome::SendFailed { peer });
        assert!(engine.mongers().contains(&peer));
    }

    #[test]
    fn test_respond_omits_rumors_sender_already_has() {
        let engine = engine(8911);
        let bob = Contact::new(AccountId::new("bob"), Address::localhost(9000));
        let shared = Rumor::search(bob.clone(), "a", Duration::from_secs(60));
        let ours = Rumor::search(bob, "b", Duration::from_secs(60));
        engine.add_to_gossip(shared.clone());
        engine.add_to_gossip(ours.clone());

        let response = engine.respond(&GossipRequest {
            sender: Address::localhost(9000),
            rumors: vec![shared.to_wire().unwrap()],
        });

        assert_eq!(response.rumors.len(), 1);
        assert_eq!(response.rumors[0].id, ours.id().to_string());
    }
}
