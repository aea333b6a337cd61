//! Point-to-point request/response transport
//!
//! ## Overview
//!
//! ```text
//! ┌──────────────┐  WireRequest{route, body}   ┌──────────────┐
//! │ ConnectionCache ├──────────────────────────▶│   Listener   │
//! │ (one TCP conn │                             │ (task per    │
//! │  per address) │◀──────────────────────────┤  connection) │
//! └──────────────┘  WireResponse::Ok | Err     └──────┬───────┘
//!                                                     │ route, body
//!                                                     ▼
//!                                             RequestHandler
//! ```
//!
//! Frames are length-delimited; envelopes and bodies are postcard. The
//! transport never interprets bodies, it only carries them to the handler
//! registered for the route.

pub mod cache;
pub mod frame;
pub mod server;

pub use cache::ConnectionCache;
pub use frame::{Ack, Route, WireRequest, WireResponse};
pub use server::{Listener, RequestHandler};
