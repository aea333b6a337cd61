//! Gossip wire messages

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::gossip::rumor::Rumor;
use crate::types::{Address, Contact, SearchId};

/// A rumor as carried on the wire
///
/// Items are decoded one at a time so a single malformed rumor does not
/// spoil the batch it travels in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRumor {
    /// Hyphenated UUID
    pub id: String,
    /// Absolute expiry, milliseconds since the Unix epoch
    pub expiry_ms: i64,
    pub creator: Contact,
    /// Postcard-encoded [`RumorKind`](crate::gossip::RumorKind)
    pub payload: Vec<u8>,
}

/// Sent to `/gossip` once per cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipRequest {
    /// Listening address of the sending peer
    pub sender: Address,
    pub rumors: Vec<WireRumor>,
}

/// The receiver's live rumors that the request did not already carry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipResponse {
    pub rumors: Vec<WireRumor>,
}

/// Out-of-band answer to a search rumor, sent to its creator's `/searchresult`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultResponse {
    pub responder: Contact,
    pub search_id: SearchId,
    pub response: String,
}

/// Decode every well-formed rumor in `wire`, logging and skipping the rest
pub fn parse_rumors(wire: &[WireRumor]) -> Vec<Rumor> {
    wire.iter()
        .filter_map(|item| match Rumor::from_wire(item) {
            Ok(rumor) => Some(rumor),
            Err(e) => {
                warn!(id = %item.id, error = %e, "Dropping malformed rumor");
                None
            }
        })
        .collect()
}
