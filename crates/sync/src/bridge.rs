//! Backend bridge
//!
//! Everything the engine needs from the assistant server, behind one
//! trait so the engine can be driven by the HTTP bridge or a test double.

use std::collections::HashMap;

use async_trait::async_trait;
use chatsync_protocol::{
    Agent, CreateSessionRequest, Event, MessageWithParts, Permission, PermissionReplyRequest,
    PromptRequest, RevertRequest, Session, SessionStatus, UpdateSessionRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::BridgeResult;

/// Health of the push channel as reported by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

/// One item from the push channel
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
    Event(Event),
    Status(ConnectionStatus),
}

/// A live event subscription. Dropping it stops the underlying stream.
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::Receiver<StreamSignal>,
    task: Option<JoinHandle<()>>,
}

impl EventSubscription {
    pub fn new(rx: mpsc::Receiver<StreamSignal>, task: Option<JoinHandle<()>>) -> Self {
        Self { rx, task }
    }

    /// Next signal, or `None` once the stream has ended for good.
    pub async fn recv(&mut self) -> Option<StreamSignal> {
        self.rx.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
pub trait Bridge: Send + Sync + 'static {
    async fn list_agents(&self) -> BridgeResult<Vec<Agent>>;

    async fn list_sessions(&self, directory: Option<&str>) -> BridgeResult<Vec<Session>>;

    async fn get_session(&self, session_id: &str) -> BridgeResult<Session>;

    async fn create_session(&self, request: CreateSessionRequest) -> BridgeResult<Session>;

    async fn update_session(
        &self,
        session_id: &str,
        request: UpdateSessionRequest,
    ) -> BridgeResult<Session>;

    async fn delete_session(&self, session_id: &str) -> BridgeResult<()>;

    async fn list_messages(&self, session_id: &str) -> BridgeResult<Vec<MessageWithParts>>;

    async fn list_permissions(&self, directory: Option<&str>) -> BridgeResult<Vec<Permission>>;

    async fn session_status(
        &self,
        directory: Option<&str>,
    ) -> BridgeResult<HashMap<String, SessionStatus>>;

    async fn revert(&self, session_id: &str, request: RevertRequest) -> BridgeResult<Session>;

    /// Sends a prompt and waits for the assistant's reply message.
    async fn send_prompt(
        &self,
        session_id: &str,
        request: PromptRequest,
    ) -> BridgeResult<MessageWithParts>;

    async fn respond_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        request: PermissionReplyRequest,
    ) -> BridgeResult<()>;

    async fn abort_session(&self, session_id: &str) -> BridgeResult<()>;

    /// Open the push channel. The bridge reconnects on its own and reports
    /// each status change through the subscription.
    async fn subscribe_events(&self) -> BridgeResult<EventSubscription>;
}
