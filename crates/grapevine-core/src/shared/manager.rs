//! Shared data manager: the table of served instances and the handshake
//!
//! ## Invite handshake
//!
//! ```text
//! inviter                                   recipient
//!    │ ── SharedDataInvite{id, as_role} ──────▶ │ on_invited? ─ no ─▶ rejected
//!    │                                          │ yes: replica with me = as_role
//!    │ ◀──────────────── accepted ───────────── │ on_shared_data_available
//!    │ add invitee(as_role)                     │
//!    │ ── SharedDataSendState ────────────────▶ │ recreate entries, adopt invitees
//!    │ ── SharedDataJoin ──▶ other invitees     │
//!    │ on_invite_accepted                       │
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::callback::ClientCallback;
use crate::config::GrapevineConfig;
use crate::error::{GrapevineError, GrapevineResult};
use crate::shared::data::SharedData;
use crate::shared::protocol::{
    SharedDataInvite, SharedDataInviteResponse, SharedDataJoin, SharedDataLeave,
    SharedDataMutation, SharedDataMutationResponse, SharedDataSendState,
};
use crate::shared::proxy::{Delivery, SharedDataProxy};
use crate::shared::value::TypeRegistry;
use crate::transport::{Ack, ConnectionCache, Route};
use crate::types::{Contact, LocalContact, SharedDataId};

pub struct SharedDataManager {
    me: LocalContact,
    cache: Arc<ConnectionCache>,
    callback: Arc<dyn ClientCallback>,
    registry: Arc<TypeRegistry>,
    proxies: RwLock<HashMap<SharedDataId, SharedDataProxy>>,
    enforce_ownership: bool,
}

impl std::fmt::Debug for SharedDataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDataManager")
            .field("me", &self.me.address())
            .field("proxies", &self.proxies.read().len())
            .field("enforce_ownership", &self.enforce_ownership)
            .finish()
    }
}

impl SharedDataManager {
    pub fn new(
        me: LocalContact,
        cache: Arc<ConnectionCache>,
        callback: Arc<dyn ClientCallback>,
        registry: Arc<TypeRegistry>,
        config: &GrapevineConfig,
    ) -> Self {
        Self {
            me,
            cache,
            callback,
            registry,
            proxies: RwLock::new(HashMap::new()),
            enforce_ownership: config.enforce_ownership,
        }
    }

    fn new_proxy(&self, data: SharedData) -> SharedDataProxy {
        SharedDataProxy::new(
            data,
            self.me.clone(),
            self.cache.clone(),
            self.enforce_ownership,
        )
    }

    /// Wrap `data` in a proxy and start serving it
    ///
    /// The local role must already be set; it becomes the first invitee.
    pub fn serve(&self, data: SharedData) -> GrapevineResult<SharedDataProxy> {
        let id = data.id();
        let role = data
            .me()
            .map(String::from)
            .ok_or_else(|| GrapevineError::RoleNotSet(id.to_string()))?;

        let mut proxies = self.proxies.write();
        if proxies.contains_key(&id) {
            return Err(GrapevineError::SharedDataAlreadyServed(id.to_string()));
        }

        let proxy = self.new_proxy(data);
        proxy.add_invitee(self.me.get(), &role);
        proxies.insert(id, proxy.clone());

        info!(%id, %role, "Serving shared data");
        Ok(proxy)
    }

    pub fn get(&self, id: &SharedDataId) -> Option<SharedDataProxy> {
        self.proxies.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<SharedDataId> {
        self.proxies.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn require(&self, id: &SharedDataId) -> GrapevineResult<SharedDataProxy> {
        self.get(id)
            .ok_or_else(|| GrapevineError::SharedDataNotFound(id.to_string()))
    }

    /// Invite `recipient` to replicate `proxy` as `as_role`
    ///
    /// Returns `Ok(false)` if the recipient declined. On acceptance the
    /// recipient gets the full state and every other invitee learns about it.
    pub async fn invite(
        &self,
        proxy: &SharedDataProxy,
        recipient: &Contact,
        as_role: &str,
    ) -> GrapevineResult<bool> {
        let proxy = self.require(&proxy.id())?;
        let id = proxy.id();

        let invite = SharedDataInvite {
            shared_data_id: id,
            creator: proxy.creator().clone(),
            inviter: self.me.get(),
            as_role: as_role.to_string(),
        };
        let response: SharedDataInviteResponse = self
            .cache
            .request(&recipient.address, Route::Invite, &invite)
            .await?;

        if !response.accepted {
            info!(%id, peer = %recipient, role = %as_role, "Invite declined");
            return Ok(false);
        }

        proxy.admit(recipient, as_role).await?;

        let join = SharedDataJoin {
            shared_data_id: id,
            role: as_role.to_string(),
            contact: recipient.clone(),
        };
        proxy
            .broadcast::<_, Ack>(Route::Join, &join, Some(as_role))
            .await;

        info!(%id, peer = %recipient, role = %as_role, "Invite accepted");
        self.callback.on_invite_accepted(&proxy, recipient);
        Ok(true)
    }

    /// Announce the local role and contact to every invitee
    pub async fn join_share(&self, proxy: &SharedDataProxy) -> GrapevineResult<Delivery> {
        let proxy = self.require(&proxy.id())?;
        let role = proxy
            .me()
            .ok_or_else(|| GrapevineError::RoleNotSet(proxy.id().to_string()))?;

        let join = SharedDataJoin {
            shared_data_id: proxy.id(),
            role,
            contact: self.me.get(),
        };
        Ok(proxy.broadcast::<_, Ack>(Route::Join, &join, None).await)
    }

    /// Tell every invitee we are leaving, then stop serving the instance
    pub async fn leave_share(&self, proxy: &SharedDataProxy) -> GrapevineResult<Delivery> {
        let proxy = self.require(&proxy.id())?;
        let id = proxy.id();
        let role = proxy
            .me()
            .ok_or_else(|| GrapevineError::RoleNotSet(id.to_string()))?;

        let leave = SharedDataLeave {
            shared_data_id: id,
            role: role.clone(),
        };
        let delivery = proxy.broadcast::<_, Ack>(Route::Leave, &leave, None).await;

        self.proxies.write().remove(&id);
        info!(%id, %role, "Left shared data");
        Ok(delivery)
    }

    pub(crate) fn handle_invite(
        &self,
        invite: SharedDataInvite,
    ) -> GrapevineResult<SharedDataInviteResponse> {
        let id = invite.shared_data_id;

        if self.get(&id).is_some() {
            debug!(%id, "Already replicating, accepting repeat invite");
            return Ok(SharedDataInviteResponse { accepted: true });
        }

        if !self
            .callback
            .on_invited(id, &invite.as_role, &invite.inviter)
        {
            info!(%id, inviter = %invite.inviter, "Declining invite");
            return Ok(SharedDataInviteResponse { accepted: false });
        }

        let mut data = SharedData::with_id(invite.creator, id);
        data.set_me(&invite.as_role)?;

        let proxy = {
            let mut proxies = self.proxies.write();
            let proxy = proxies
                .entry(id)
                .or_insert_with(|| self.new_proxy(data))
                .clone();
            proxy.add_invitee(self.me.get(), &invite.as_role);
            proxy
        };

        info!(%id, role = %invite.as_role, inviter = %invite.inviter, "Accepted invite");
        self.callback.on_shared_data_available(&proxy);
        Ok(SharedDataInviteResponse { accepted: true })
    }

    pub(crate) fn handle_send_state(&self, state: SharedDataSendState) -> GrapevineResult<Ack> {
        let proxy = self.require(&state.shared_data_id)?;
        for entry in state.data.values() {
            self.registry.validate(&entry.value.to_value())?;
        }
        debug!(
            id = %state.shared_data_id,
            from = %state.originator,
            keys = state.data.len(),
            "Applying state"
        );
        proxy.apply_state(state);
        Ok(Ack)
    }

    pub(crate) fn handle_mutation(
        &self,
        route: Route,
        message: SharedDataMutation,
    ) -> GrapevineResult<SharedDataMutationResponse> {
        if message.mutation.route() != route {
            return Err(GrapevineError::Serialization(format!(
                "{} carried a {} mutation",
                route,
                message.mutation.route()
            )));
        }
        let proxy = self.require(&message.shared_data_id)?;
        message.mutation.validate(&self.registry)?;

        let outcome = proxy.apply_remote(&message.mutation)?;
        debug!(
            id = %message.shared_data_id,
            from = %message.originator,
            %route,
            key = message.mutation.key(),
            ?outcome,
            "Applied remote mutation"
        );
        Ok(SharedDataMutationResponse { outcome })
    }

    pub(crate) fn handle_join(&self, join: SharedDataJoin) -> GrapevineResult<Ack> {
        let proxy = self.require(&join.shared_data_id)?;
        if proxy.is_me(&join.role) {
            debug!(id = %join.shared_data_id, role = %join.role, "Ignoring join for local role");
        } else {
            proxy.add_invitee(join.contact, &join.role);
        }
        Ok(Ack)
    }

    pub(crate) fn handle_leave(&self, leave: SharedDataLeave) -> GrapevineResult<Ack> {
        let proxy = self.require(&leave.shared_data_id)?;
        if !proxy.is_me(&leave.role) && proxy.remove_invitee(&leave.role).is_some() {
            info!(id = %leave.shared_data_id, role = %leave.role, "Invitee left");
        }
        Ok(Ack)
    }
}
