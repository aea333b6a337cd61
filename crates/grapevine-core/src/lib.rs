//! Grapevine Core Library
//!
//! Peer-to-peer rumor gossip plus replicated shared data.
//!
//! ## Overview
//!
//! Every node listens on one TCP port and keeps a list of known peers
//! ("mongers"). Rumors such as searches spread by periodic random-peer
//! exchange; interested peers answer the rumor's creator directly.
//! Shared data is a keyed store replicated to invited peers, where each
//! peer plays a named role and every local change is applied at once and
//! then pushed to all other roles.
//!
//! ## Core Principles
//!
//! - **No coordinator**: any node can seed, gossip, invite and serve
//! - **Best-effort delivery**: failed pushes are reported, never rolled back
//! - **Per-node state**: several nodes can share one process
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use grapevine_core::{Grapevine, GrapevineConfig, NoopCallback};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Grapevine::new(GrapevineConfig::default(), Arc::new(NoopCallback));
//!     node.start().await?;
//!
//!     let mut game = node.new_shared_data();
//!     game.set_me("p1")?;
//!     game.create("score", 0, "p1", "public");
//!     let game = node.serve(game)?;
//!
//!     let report = game.set("score", 5).await?;
//!     println!("{:?}", report.delivery);
//!
//!     node.search("chess partner");
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod callback;
pub mod config;
pub mod error;
pub mod gossip;
pub mod logging;
pub mod node;
pub mod shared;
pub mod transport;
pub mod types;

// Re-exports
pub use account::AccountService;
pub use callback::{ClientCallback, NoopCallback};
pub use config::GrapevineConfig;
pub use error::{GrapevineError, GrapevineResult};
pub use gossip::{CycleOutcome, GossipEngine, Rumor, RumorId, RumorKind};
pub use node::{Grapevine, NodeInfo};
pub use shared::{
    Delivery, Entry, EntryValue, Mutation, MutationOutcome, MutationReport, SharedData,
    SharedDataManager, SharedDataProxy, SharedType, TypeRegistry, Value,
};
pub use transport::{ConnectionCache, Listener, RequestHandler, Route};
pub use types::*;
