//! Replication-aware handle around one shared data instance

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{GrapevineError, GrapevineResult};
use crate::shared::data::{Entry, MutationOutcome, SharedData};
use crate::shared::protocol::{
    Mutation, SharedDataMutation, SharedDataMutationResponse, SharedDataSendState,
};
use crate::shared::value::Value;
use crate::transport::{Ack, ConnectionCache, Route};
use crate::types::{Address, Contact, LocalContact, SharedDataId};

/// Which invitees a message reached, by role
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
    /// Reached the peer, but its replica did not apply the mutation
    pub not_applied: Vec<(String, MutationOutcome)>,
}

impl Delivery {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.not_applied.is_empty()
    }
}

/// Local outcome of a proxy mutation plus its fan-out result
///
/// Fan-out only happens when `outcome` is [`MutationOutcome::Applied`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReport {
    pub outcome: MutationOutcome,
    pub delivery: Delivery,
}

impl MutationReport {
    fn local(outcome: MutationOutcome) -> Self {
        Self {
            outcome,
            delivery: Delivery::default(),
        }
    }
}

struct ProxyInner {
    id: SharedDataId,
    creator: Contact,
    me: LocalContact,
    origin: Mutex<SharedData>,
    invitees: Mutex<BTreeMap<String, Contact>>,
    /// Serializes local mutations so peers see them in call order
    write_gate: tokio::sync::Mutex<()>,
    cache: Arc<ConnectionCache>,
    enforce_ownership: bool,
}

/// Cloneable handle; every clone refers to the same replica
#[derive(Clone)]
pub struct SharedDataProxy {
    inner: Arc<ProxyInner>,
}

impl fmt::Debug for SharedDataProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDataProxy")
            .field("id", &self.inner.id)
            .field("me", &self.me())
            .field("invitees", &self.inner.invitees.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SharedDataProxy {
    pub(crate) fn new(
        origin: SharedData,
        me: LocalContact,
        cache: Arc<ConnectionCache>,
        enforce_ownership: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                id: origin.id(),
                creator: origin.creator().clone(),
                me,
                origin: Mutex::new(origin),
                invitees: Mutex::new(BTreeMap::new()),
                write_gate: tokio::sync::Mutex::new(()),
                cache,
                enforce_ownership,
            }),
        }
    }

    pub fn id(&self) -> SharedDataId {
        self.inner.id
    }

    pub fn creator(&self) -> &Contact {
        &self.inner.creator
    }

    pub fn me(&self) -> Option<String> {
        self.inner.origin.lock().me().map(String::from)
    }

    pub fn is_me(&self, role: &str) -> bool {
        self.inner.origin.lock().is_me(role)
    }

    pub fn get(&self, key: &str) -> Value {
        self.inner.origin.lock().get(key)
    }

    pub fn get_owner(&self, key: &str) -> Option<String> {
        self.inner.origin.lock().get_owner(key).map(String::from)
    }

    pub fn entry(&self, key: &str) -> Option<Entry> {
        self.inner.origin.lock().entry(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.origin.lock().keys()
    }

    /// Run `f` against the wrapped replica
    pub fn with_data<R>(&self, f: impl FnOnce(&SharedData) -> R) -> R {
        f(&self.inner.origin.lock())
    }

    pub fn on_data_change<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.origin.lock().on_data_change(callback);
    }

    pub fn invitees(&self) -> BTreeMap<String, Contact> {
        self.inner.invitees.lock().clone()
    }

    /// Register `contact` under `role`, replacing any previous holder
    pub fn add_invitee(&self, contact: Contact, role: &str) {
        debug!(id = %self.inner.id, %role, peer = %contact, "Adding invitee");
        self.inner.invitees.lock().insert(role.to_string(), contact);
    }

    pub fn remove_invitee(&self, role: &str) -> Option<Contact> {
        self.inner.invitees.lock().remove(role)
    }

    pub async fn create(
        &self,
        key: &str,
        value: impl Into<Value>,
        owner: &str,
        visibility: &str,
    ) -> GrapevineResult<MutationReport> {
        self.mutate(Mutation::Create {
            key: key.to_string(),
            value: value.into(),
            owner: owner.to_string(),
            visibility: visibility.to_string(),
        })
        .await
    }

    pub async fn create_array(
        &self,
        key: &str,
        values: Vec<Value>,
        owner: &str,
        visibility: &str,
    ) -> GrapevineResult<MutationReport> {
        self.mutate(Mutation::CreateArray {
            key: key.to_string(),
            values,
            owner: owner.to_string(),
            visibility: visibility.to_string(),
        })
        .await
    }

    pub async fn create_map(
        &self,
        key: &str,
        entries: BTreeMap<String, Value>,
        owner: &str,
        visibility: &str,
    ) -> GrapevineResult<MutationReport> {
        self.mutate(Mutation::CreateMap {
            key: key.to_string(),
            entries,
            owner: owner.to_string(),
            visibility: visibility.to_string(),
        })
        .await
    }

    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Value>,
    ) -> GrapevineResult<MutationReport> {
        self.mutate(Mutation::Set {
            key: key.to_string(),
            value: value.into(),
        })
        .await
    }

    pub async fn set_map(
        &self,
        key: &str,
        map_key: &str,
        value: impl Into<Value>,
    ) -> GrapevineResult<MutationReport> {
        self.mutate(Mutation::SetMap {
            key: key.to_string(),
            map_key: map_key.to_string(),
            value: value.into(),
        })
        .await
    }

    pub async fn append(
        &self,
        key: &str,
        value: impl Into<Value>,
    ) -> GrapevineResult<MutationReport> {
        self.mutate(Mutation::Append {
            key: key.to_string(),
            value: value.into(),
        })
        .await
    }

    pub async fn change_data_owner(
        &self,
        key: &str,
        owner: &str,
    ) -> GrapevineResult<MutationReport> {
        self.mutate(Mutation::ChangeOwner {
            key: key.to_string(),
            owner: owner.to_string(),
        })
        .await
    }

    /// Apply `mutation` locally, then send it to every other invitee
    ///
    /// The replica lock is released before anything goes on the network.
    pub async fn mutate(&self, mutation: Mutation) -> GrapevineResult<MutationReport> {
        let _gate = self.inner.write_gate.lock().await;

        let (outcome, callback) = {
            let mut origin = self.inner.origin.lock();
            if self.inner.enforce_ownership
                && mutation.writes_existing_key()
                && origin.owned_by_me(mutation.key()) == Some(false)
            {
                debug!(
                    id = %self.inner.id,
                    key = mutation.key(),
                    "Refusing write to key owned by another role"
                );
                return Ok(MutationReport::local(MutationOutcome::NotOwner));
            }
            let outcome = mutation.apply(&mut origin)?;
            (outcome, origin.change_callback())
        };

        if !outcome.is_applied() {
            return Ok(MutationReport::local(outcome));
        }

        if let Some(callback) = callback {
            callback(mutation.key());
        }

        let route = mutation.route();
        let message = SharedDataMutation {
            shared_data_id: self.inner.id,
            originator: self.inner.me.get(),
            mutation,
        };
        let mut delivery = Delivery::default();
        let results = self
            .fan_out::<_, SharedDataMutationResponse>(route, &message, None)
            .await;
        for (role, address, result) in results {
            match result {
                Ok(response) if response.outcome.is_applied() => delivery.delivered.push(role),
                Ok(response) => {
                    warn!(
                        id = %self.inner.id,
                        %role,
                        peer = %address,
                        %route,
                        outcome = ?response.outcome,
                        "Invitee did not apply mutation"
                    );
                    delivery.not_applied.push((role, response.outcome));
                }
                Err(e) => {
                    self.log_failure(&role, &address, route, &e);
                    delivery.failed.push(role);
                }
            }
        }

        Ok(MutationReport { outcome, delivery })
    }

    /// Apply a mutation received from a peer. Never fans out.
    pub(crate) fn apply_remote(&self, mutation: &Mutation) -> GrapevineResult<MutationOutcome> {
        let (outcome, callback) = {
            let mut origin = self.inner.origin.lock();
            (mutation.apply(&mut origin)?, origin.change_callback())
        };
        if outcome.is_applied() {
            if let Some(callback) = callback {
                callback(mutation.key());
            }
        }
        Ok(outcome)
    }

    /// Full state plus the current invitee map
    pub fn state_snapshot(&self) -> SharedDataSendState {
        let data = self
            .inner
            .origin
            .lock()
            .entries()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        SharedDataSendState {
            shared_data_id: self.inner.id,
            originator: self.inner.me.get(),
            data,
            listeners: self.invitees(),
        }
    }

    /// Register `recipient` under `role` and push it the full state
    ///
    /// Holds the write gate throughout, so no local mutation can reach the
    /// recipient ahead of the state it applies to.
    pub(crate) async fn admit(&self, recipient: &Contact, role: &str) -> GrapevineResult<()> {
        let _gate = self.inner.write_gate.lock().await;
        self.add_invitee(recipient.clone(), role);
        self.send_state_to(recipient).await
    }

    pub async fn send_state_to(&self, recipient: &Contact) -> GrapevineResult<()> {
        let state = self.state_snapshot();
        debug!(
            id = %self.inner.id,
            peer = %recipient,
            keys = state.data.len(),
            listeners = state.listeners.len(),
            "Sending state"
        );
        let _: Ack = self
            .inner
            .cache
            .request(&recipient.address, Route::SendState, &state)
            .await?;
        Ok(())
    }

    /// Adopt a state sync: every entry is recreated, every listener becomes
    /// an invitee
    pub(crate) fn apply_state(&self, state: SharedDataSendState) {
        let keys: Vec<String> = state.data.keys().cloned().collect();
        let callback = {
            let mut origin = self.inner.origin.lock();
            for (key, entry) in state.data {
                origin.restore(&key, entry);
            }
            origin.change_callback()
        };
        {
            let mut invitees = self.inner.invitees.lock();
            for (role, contact) in state.listeners {
                invitees.insert(role, contact);
            }
        }
        if let Some(callback) = callback {
            for key in &keys {
                callback(key);
            }
        }
    }

    /// Send `message` to every invitee except the local role (and the local
    /// address), plus `exclude` if given. Each address is sent to once.
    pub(crate) async fn broadcast<Req, Resp>(
        &self,
        route: Route,
        message: &Req,
        exclude: Option<&str>,
    ) -> Delivery
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut delivery = Delivery::default();
        for (role, address, result) in self.fan_out::<Req, Resp>(route, message, exclude).await {
            match result {
                Ok(_) => delivery.delivered.push(role),
                Err(e) => {
                    self.log_failure(&role, &address, route, &e);
                    delivery.failed.push(role);
                }
            }
        }
        delivery
    }

    async fn fan_out<Req, Resp>(
        &self,
        route: Route,
        message: &Req,
        exclude: Option<&str>,
    ) -> Vec<(String, Address, GrapevineResult<Resp>)>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let targets = self.targets(exclude);
        if targets.is_empty() {
            return Vec::new();
        }

        let cache = &self.inner.cache;
        join_all(targets.into_iter().map(|(role, address)| async move {
            let result = cache.request::<Req, Resp>(&address, route, message).await;
            (role, address, result)
        }))
        .await
    }

    fn log_failure(&self, role: &str, address: &Address, route: Route, error: &GrapevineError) {
        warn!(
            id = %self.inner.id,
            %role,
            peer = %address,
            %route,
            %error,
            "Replication to invitee failed"
        );
    }

    fn targets(&self, exclude: Option<&str>) -> Vec<(String, Address)> {
        let me_role = self.me();
        let me_addr = self.inner.me.address();
        let mut seen: HashSet<Address> = HashSet::new();
        self.inner
            .invitees
            .lock()
            .iter()
            .filter(|(role, _)| Some(role.as_str()) != me_role.as_deref())
            .filter(|(role, _)| Some(role.as_str()) != exclude)
            .filter(|(_, contact)| contact.address != me_addr)
            .filter(|(_, contact)| seen.insert(contact.address))
            .map(|(role, contact)| (role.clone(), contact.address))
            .collect()
    }
}
