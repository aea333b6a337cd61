//! Epidemic rumor dissemination
//!
//! ## Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ GossipEngine                                                 │
//! │  ├── RumorStore: live rumors keyed by id, pruned on snapshot │
//! │  └── Mongers:    known peers with refreshable expiry         │
//! │                                                              │
//! │ every interval:                                              │
//! │   random monger ──▶ snapshot ──▶ /gossip ──▶ fold reply in   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A rumor spreads one hop further on every exchange that carries it until
//! it expires. Every rumor creator a peer hears about becomes a monger, so
//! membership grows along with the rumors themselves.

pub mod engine;
pub mod mongers;
pub mod protocol;
pub mod rumor;
pub mod store;

pub use engine::{CycleOutcome, GossipEngine};
pub use mongers::{Monger, Mongers};
pub use protocol::{GossipRequest, GossipResponse, SearchResultResponse, WireRumor};
pub use rumor::{Rumor, RumorId, RumorKind};
pub use store::RumorStore;
