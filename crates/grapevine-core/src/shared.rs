//! Replicated shared data
//!
//! ## Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │ SharedDataManager: SharedDataId → SharedDataProxy                  │
//! │                                                                    │
//! │ SharedDataProxy                                                    │
//! │  ├── origin:   SharedData (key → Entry{value, owner, visibility})  │
//! │  ├── invitees: role → Contact (includes the local role)            │
//! │  └── mutate:   apply to origin, release lock, send to invitees     │
//! │                                                                    │
//! │ Invite handshake                                                   │
//! │   inviter ──/invite──▶ recipient (OnInvited? creates replica)      │
//! │   inviter ──/sendstate──▶ recipient (entries + every invitee)      │
//! │   inviter ──/join──▶ existing invitees (learn the newcomer)        │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replication is best-effort and last-write-wins: a failed delivery to one
//! invitee is reported but never rolls back the local change or delivery to
//! the others.

pub mod data;
pub mod manager;
pub mod protocol;
pub mod proxy;
pub mod value;

pub use data::{ChangeCallback, Entry, EntryValue, MutationOutcome, SharedData};
pub use manager::SharedDataManager;
pub use protocol::Mutation;
pub use proxy::{Delivery, MutationReport, SharedDataProxy};
pub use value::{SharedType, TypeRegistry, Value};
