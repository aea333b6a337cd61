//! Peer directory types
//!
//! Identity ([`AccountId`]) and network location ([`Address`]) of a peer,
//! paired as a [`Contact`]. All three are plain values compared
//! structurally; two contacts built from the same parts are the same peer.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Opaque account identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Sentinel for "no account"
    pub fn nil() -> Self {
        Self(String::new())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "<nil>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Network location of a peer
///
/// The `Display` form (`host:port`) is the canonical key used by the
/// connection cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub ip: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Loopback address on the given port
    pub fn localhost(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SocketAddr::from_str(s.trim())?.into())
    }
}

/// Who a peer is and where to reach it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub account_id: AccountId,
    pub address: Address,
}

impl Contact {
    pub fn new(account_id: AccountId, address: Address) -> Self {
        Self {
            account_id,
            address,
        }
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.account_id, self.address)
    }
}

/// Shared handle to the local peer's own contact
///
/// The address is only known once the listener is bound and the account
/// only after login, so both engines read the current value through this
/// handle instead of holding a copy.
#[derive(Debug, Clone)]
pub struct LocalContact {
    inner: Arc<RwLock<Contact>>,
}

impl LocalContact {
    pub fn new(contact: Contact) -> Self {
        Self {
            inner: Arc::new(RwLock::new(contact)),
        }
    }

    pub fn get(&self) -> Contact {
        self.inner.read().clone()
    }

    pub fn address(&self) -> Address {
        self.inner.read().address
    }

    pub fn is_self(&self, addr: &Address) -> bool {
        self.inner.read().address == *addr
    }

    pub fn set_address(&self, address: Address) {
        self.inner.write().address = address;
    }

    pub fn set_account(&self, account_id: AccountId) {
        self.inner.write().account_id = account_id;
    }
}
