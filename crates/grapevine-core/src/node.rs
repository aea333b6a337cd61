//! Grapevine node - the entry point tying gossip and shared data together
//!
//! A [`Grapevine`] owns one listener, one gossip loop and one shared data
//! manager, all sharing a single [`ConnectionCache`]. Several nodes can run
//! in one process; nothing is global.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use grapevine_core::{Grapevine, GrapevineConfig, NoopCallback, SharedData};
//!
//! let node = Grapevine::new(GrapevineConfig::default(), Arc::new(NoopCallback));
//! node.start().await?;
//!
//! let mut game = SharedData::new(node.me());
//! game.set_me("p1")?;
//! game.create("score", 0, "p1", "public");
//! let game = node.serve(game)?;
//!
//! node.invite(&game, &friend, "p2").await?;
//! game.set("score", 5).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn, Instrument};

use crate::account::AccountService;
use crate::callback::ClientCallback;
use crate::config::GrapevineConfig;
use crate::error::{GrapevineError, GrapevineResult};
use crate::gossip::protocol::{parse_rumors, GossipRequest, GossipResponse, SearchResultResponse};
use crate::gossip::{GossipEngine, Rumor, RumorId};
use crate::shared::protocol::SharedDataInvite;
use crate::shared::{
    Delivery, SharedData, SharedDataManager, SharedDataProxy, SharedType, TypeRegistry,
};
use crate::transport::{Ack, ConnectionCache, Listener, RequestHandler, Route};
use crate::types::{AccountId, Address, Contact, LocalContact, SearchId, SharedDataId};

/// Snapshot of a node's state, for status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub me: Contact,
    pub mongers: Vec<Address>,
    pub rumors: usize,
    pub shared_data: Vec<SharedDataId>,
    pub cached_connections: usize,
}

/// State reachable from inbound requests
struct NodeInner {
    me: LocalContact,
    cache: Arc<ConnectionCache>,
    gossip: Arc<GossipEngine>,
    shared: SharedDataManager,
    callback: Arc<dyn ClientCallback>,
    /// Search rumors already offered to `on_search`, with their expiry
    considered: Mutex<HashMap<RumorId, DateTime<Utc>>>,
}

pub struct Grapevine {
    config: GrapevineConfig,
    inner: Arc<NodeInner>,
    registry: Arc<TypeRegistry>,
    shutdown: watch::Sender<bool>,
    started: Mutex<bool>,
}

impl std::fmt::Debug for Grapevine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grapevine")
            .field("me", &self.inner.me.get())
            .field("gossip", &self.inner.gossip)
            .field("shared", &self.inner.shared)
            .finish()
    }
}

impl Grapevine {
    /// Build a node; nothing touches the network until [`Grapevine::start`]
    pub fn new(config: GrapevineConfig, callback: Arc<dyn ClientCallback>) -> Self {
        let me = LocalContact::new(Contact::new(
            AccountId::nil(),
            Address::new(config.advertise_ip.unwrap_or(config.bind_ip), config.port),
        ));
        let cache = Arc::new(ConnectionCache::new(&config));
        let registry = Arc::new(TypeRegistry::new());
        let gossip = Arc::new(GossipEngine::new(me.clone(), cache.clone(), &config));
        let shared = SharedDataManager::new(
            me.clone(),
            cache.clone(),
            callback.clone(),
            registry.clone(),
            &config,
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            inner: Arc::new(NodeInner {
                me,
                cache,
                gossip,
                shared,
                callback,
                considered: Mutex::new(HashMap::new()),
            }),
            registry,
            shutdown,
            started: Mutex::new(false),
        }
    }

    /// Bind the listener, start the gossip loop and register seed peers
    ///
    /// Returns the address peers should use to reach this node.
    pub async fn start(&self) -> GrapevineResult<Address> {
        let advertised = self.config.advertised_ip()?;
        {
            let mut started = self.started.lock();
            if *started {
                return Err(GrapevineError::AlreadyStarted(self.address().to_string()));
            }
            *started = true;
        }

        let listener = match Listener::bind(&self.config).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.started.lock() = false;
                return Err(e);
            }
        };
        let bound = listener.local_addr();
        let addr = Address::new(advertised, bound.port);
        self.inner.me.set_address(addr);

        let span = tracing::info_span!("node", %addr);
        tokio::spawn(
            listener
                .serve(self.inner.clone(), self.shutdown.subscribe())
                .instrument(span),
        );
        self.inner.gossip.spawn(self.shutdown.subscribe());

        for seed in self.config.seed_addresses() {
            self.add_server(seed);
        }

        info!(%addr, %bound, "Grapevine started");
        Ok(addr)
    }

    /// Stop the listener and the gossip loop
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn me(&self) -> Contact {
        self.inner.me.get()
    }

    pub fn address(&self) -> Address {
        self.inner.me.address()
    }

    pub fn config(&self) -> &GrapevineConfig {
        &self.config
    }

    pub fn gossip(&self) -> &Arc<GossipEngine> {
        &self.inner.gossip
    }

    pub fn shared_data_manager(&self) -> &SharedDataManager {
        &self.inner.shared
    }

    pub fn mongers(&self) -> Vec<Address> {
        self.inner.gossip.mongers().addresses()
    }

    /// Add a known peer to gossip with
    pub fn add_server(&self, addr: Address) -> bool {
        self.inner.gossip.add_server(addr)
    }

    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            me: self.me(),
            mongers: self.mongers(),
            rumors: self.inner.gossip.rumors().len(),
            shared_data: self.inner.shared.ids(),
            cached_connections: self.inner.cache.len(),
        }
    }

    /// Accept records of type `T` from peers
    pub fn register_type<T: SharedType>(&self) {
        self.registry.register::<T>();
    }

    /// New, empty shared data created by this node
    pub fn new_shared_data(&self) -> SharedData {
        SharedData::new(self.me())
    }

    pub fn serve(&self, data: SharedData) -> GrapevineResult<SharedDataProxy> {
        self.inner.shared.serve(data)
    }

    pub fn shared_data(&self, id: &SharedDataId) -> Option<SharedDataProxy> {
        self.inner.shared.get(id)
    }

    /// Invite `recipient` into `proxy` as `as_role`; an acceptance also makes
    /// the recipient a monger
    pub async fn invite(
        &self,
        proxy: &SharedDataProxy,
        recipient: &Contact,
        as_role: &str,
    ) -> GrapevineResult<bool> {
        let accepted = self.inner.shared.invite(proxy, recipient, as_role).await?;
        if accepted {
            self.add_server(recipient.address);
        }
        Ok(accepted)
    }

    pub async fn join_share(&self, proxy: &SharedDataProxy) -> GrapevineResult<Delivery> {
        self.inner.shared.join_share(proxy).await
    }

    pub async fn leave_share(&self, proxy: &SharedDataProxy) -> GrapevineResult<Delivery> {
        self.inner.shared.leave_share(proxy).await
    }

    /// Start gossiping a search; answers arrive through `on_search_result`
    pub fn search(&self, query: &str) -> SearchId {
        let rumor = Rumor::search(self.me(), query, self.config.rumor_ttl());
        let id = SearchId(rumor.id().0);
        info!(search = %id, %query, "Starting search");
        self.inner.gossip.add_to_gossip(rumor);
        id
    }

    pub async fn create_account<A: AccountService>(
        &self,
        accounts: &A,
        username: &str,
        password: &str,
    ) -> GrapevineResult<AccountId> {
        accounts.create_account(username, password).await
    }

    /// Authenticate and adopt the returned account id as our identity
    pub async fn login<A: AccountService>(
        &self,
        accounts: &A,
        username: &str,
        password: &str,
    ) -> GrapevineResult<AccountId> {
        let account = accounts
            .authenticate(username, password, self.address())
            .await?;
        self.inner.me.set_account(account.clone());
        info!(%account, "Logged in");
        Ok(account)
    }

    /// Use `account` as our identity without an account service
    pub fn set_account(&self, account: AccountId) {
        self.inner.me.set_account(account);
    }
}

impl Drop for Grapevine {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> GrapevineResult<T> {
    Ok(postcard::from_bytes(body)?)
}

fn encode<T: Serialize>(message: &T) -> GrapevineResult<Vec<u8>> {
    Ok(postcard::to_allocvec(message)?)
}

impl NodeInner {
    async fn on_gossip(&self, request: GossipRequest) -> GossipResponse {
        let response = self.gossip.respond(&request);
        self.gossip.add_server(request.sender);

        let me = self.me.get();
        for rumor in parse_rumors(&request.rumors) {
            if rumor.creator().address != me.address && self.first_sighting(&rumor) {
                self.answer_search(&rumor, &me).await;
            }
            self.gossip.add_to_gossip(rumor);
        }

        response
    }

    /// Record `rumor` as considered; `false` if it already was
    fn first_sighting(&self, rumor: &Rumor) -> bool {
        let now = Utc::now();
        let mut considered = self.considered.lock();
        considered.retain(|_, expiry| *expiry >= now);
        considered.insert(rumor.id(), rumor.expiry()).is_none()
    }

    /// Offer a search rumor to the application and, if it accepts, answer
    /// the creator. Delivery is best-effort.
    async fn answer_search(&self, rumor: &Rumor, me: &Contact) {
        let Some((search_id, query)) = rumor.as_search() else {
            return;
        };
        if !self.callback.on_search(search_id, query) {
            return;
        }

        let result = SearchResultResponse {
            responder: me.clone(),
            search_id,
            response: self.callback.search_response(search_id, query),
        };
        let creator = rumor.creator().address;
        match self
            .cache
            .request::<_, Ack>(&creator, Route::SearchResult, &result)
            .await
        {
            Ok(_) => debug!(search = %search_id, peer = %creator, "Sent search result"),
            Err(e) => {
                warn!(search = %search_id, peer = %creator, error = %e, "Search result not delivered")
            }
        }
    }

    fn on_search_result(&self, result: SearchResultResponse) {
        info!(search = %result.search_id, responder = %result.responder, "Search result");
        self.gossip.add_server(result.responder.address);
        self.callback
            .on_search_result(result.search_id, &result.response, &result.responder);
    }
}

impl RequestHandler for NodeInner {
    async fn handle(&self, route: Route, body: Vec<u8>) -> GrapevineResult<Vec<u8>> {
        match route {
            Route::Gossip => encode(&self.on_gossip(decode(&body)?).await),
            Route::SearchResult => {
                self.on_search_result(decode(&body)?);
                encode(&Ack)
            }
            Route::Invite => {
                let invite: SharedDataInvite = decode(&body)?;
                let inviter = invite.inviter.address;
                let response = self.shared.handle_invite(invite)?;
                if response.accepted {
                    self.gossip.add_server(inviter);
                }
                encode(&response)
            }
            Route::SendState => encode(&self.shared.handle_send_state(decode(&body)?)?),
            Route::Create
            | Route::CreateArray
            | Route::CreateMap
            | Route::Set
            | Route::SetMap
            | Route::Append
            | Route::ChangeOwner => encode(&self.shared.handle_mutation(route, decode(&body)?)?),
            Route::Join => encode(&self.shared.handle_join(decode(&body)?)?),
            Route::Leave => encode(&self.shared.handle_leave(decode(&body)?)?),
        }
    }
}
