//! chatsync
//!
//! Client-side synchronization engine for an assistant chat server. It
//! keeps a local copy of sessions, messages, parts and permissions
//! consistent with the server by combining a bootstrap fetch with the
//! server's live event stream, and serializes prompt sending through a
//! per-session outbox.
//!
//! Start it with [`SyncHandle::spawn`] over any [`Bridge`]; the HTTP one
//! is [`HttpBridge`].

pub mod batcher;
pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod error;
pub mod export;
pub mod http;
pub mod identifier;
pub mod logging;
pub mod outbox;
pub mod paths;
pub mod store;
pub mod sync_actor;
pub mod sync_command;
pub mod transition;

#[cfg(test)]
mod testing;

pub use bridge::{Bridge, ConnectionStatus, EventSubscription, StreamSignal};
pub use config::{ConfigOverrides, SyncConfig};
pub use error::{BridgeError, SyncError};
pub use http::{HttpBridge, HttpBridgeConfig};
pub use outbox::{PendingPrompt, QueuedPrompt};
pub use paths::DataDir;
pub use store::{ContextInfo, FileChanges, MessageView, SyncSnapshot, SyncStatus};
pub use sync_actor::SyncHandle;
pub use sync_command::SubmitReceipt;
