//! Application callback surface
//!
//! Every method has a default so an application only implements what it
//! cares about. The defaults decline searches and invitations.

use crate::shared::SharedDataProxy;
use crate::types::{Contact, SearchId, SharedDataId};

pub trait ClientCallback: Send + Sync + 'static {
    /// A search rumor arrived; return `true` to answer its creator
    fn on_search(&self, _id: SearchId, _query: &str) -> bool {
        false
    }

    /// Text sent back with an accepted search
    fn search_response(&self, _id: SearchId, _query: &str) -> String {
        String::new()
    }

    /// A peer answered one of our searches
    fn on_search_result(&self, _id: SearchId, _response: &str, _responder: &Contact) {}

    /// Invited to replicate `id` as `role`; return `true` to accept
    fn on_invited(&self, _id: SharedDataId, _role: &str, _inviter: &Contact) -> bool {
        false
    }

    /// A peer accepted our invitation and has received the full state
    fn on_invite_accepted(&self, _shared_data: &SharedDataProxy, _invitee: &Contact) {}

    /// A replica created from an accepted invitation is ready
    fn on_shared_data_available(&self, _shared_data: &SharedDataProxy) {}
}

/// Callback that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallback;

impl ClientCallback for NoopCallback {}
