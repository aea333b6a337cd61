//! Rumor types

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GrapevineError, GrapevineResult};
use crate::gossip::protocol::WireRumor;
use crate::types::{Contact, SearchId};

/// Globally unique rumor identifier, assigned at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RumorId(pub Uuid);

impl RumorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RumorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RumorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a rumor announces
///
/// Closed set: a new kind is a new variant, encoded on the wire as part of
/// the rumor payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RumorKind {
    /// Free-text search; peers that support the query answer the creator
    Search { query: String },
}

/// An immutable, expiring fact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rumor {
    id: RumorId,
    expiry: DateTime<Utc>,
    creator: Contact,
    kind: RumorKind,
}

impl Rumor {
    pub fn new(id: RumorId, expiry: DateTime<Utc>, creator: Contact, kind: RumorKind) -> Self {
        Self {
            id,
            expiry,
            creator,
            kind,
        }
    }

    /// A new search rumor that lives for `ttl`
    pub fn search(creator: Contact, query: impl Into<String>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64);
        Self::new(
            RumorId::new(),
            Utc::now() + ttl,
            creator,
            RumorKind::Search {
                query: query.into(),
            },
        )
    }

    pub fn id(&self) -> RumorId {
        self.id
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.expiry
    }

    pub fn creator(&self) -> &Contact {
        &self.creator
    }

    pub fn kind(&self) -> &RumorKind {
        &self.kind
    }

    /// Search id and query, when this is a search rumor
    pub fn as_search(&self) -> Option<(SearchId, &str)> {
        match &self.kind {
            RumorKind::Search { query } => Some((SearchId(self.id.0), query.as_str())),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expiry
    }

    pub fn to_wire(&self) -> GrapevineResult<WireRumor> {
        Ok(WireRumor {
            id: self.id.to_string(),
            expiry_ms: self.expiry.timestamp_millis(),
            creator: self.creator.clone(),
            payload: postcard::to_allocvec(&self.kind)?,
        })
    }

    pub fn from_wire(wire: &WireRumor) -> GrapevineResult<Self> {
        let id = Uuid::parse_str(&wire.id)
            .map_err(|e| GrapevineError::InvalidRumor(format!("bad id {:?}: {}", wire.id, e)))?;
        let expiry = DateTime::<Utc>::from_timestamp_millis(wire.expiry_ms).ok_or_else(|| {
            GrapevineError::InvalidRumor(format!("bad expiry {}", wire.expiry_ms))
        })?;
        let kind: RumorKind = postcard::from_bytes(&wire.payload)
            .map_err(|e| GrapevineError::InvalidRumor(format!("bad payload: {}", e)))?;

        Ok(Self::new(RumorId(id), expiry, wire.creator.clone(), kind))
    }
}

impl fmt::Display for Rumor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({}) Expiry({}) Creator({})", self.id, self.expiry, self.creator)?;
        match &self.kind {
            RumorKind::Search { query } => write!(f, " Query({})", query),
        }
    }
}
