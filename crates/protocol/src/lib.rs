//! chatsync protocol
//!
//! Wire types for the assistant server that chatsync synchronizes with.
//! Everything here is serialized as JSON, either in request/response
//! bodies or inside server-sent event envelopes.

pub mod client;
pub mod event;
pub mod types;

pub use client::*;
pub use event::{Event, ProtocolError, RawEvent};
pub use types::*;
