//! Test doubles and fixtures.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chatsync_protocol::{
    Agent, AgentMode, CreateSessionRequest, Message, MessageTime, MessageWithParts, Part,
    PartKind, Permission, PermissionReplyRequest, PermissionTool, PromptRequest, RevertRequest,
    Role, Session, SessionStatus, SessionTime, TokenUsage, UpdateSessionRequest,
};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::{Bridge, EventSubscription, StreamSignal};
use crate::error::{BridgeError, BridgeResult};
use crate::identifier::{self, IdKind};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn session(id: &str, parent: Option<&str>) -> Session {
    Session {
        id: id.to_string(),
        title: format!("Session {id}"),
        project_id: None,
        directory: "/tmp/project".to_string(),
        parent_id: parent.map(str::to_string),
        time: SessionTime::default(),
        summary: None,
    }
}

pub fn message(id: &str, session_id: &str, role: Role) -> Message {
    Message {
        id: id.to_string(),
        session_id: session_id.to_string(),
        role,
        time: MessageTime::default(),
        tokens: None,
        error: None,
        agent: None,
        model_id: None,
    }
}

pub fn assistant_with_tokens(id: &str, session_id: &str, input: u64) -> Message {
    let mut info = message(id, session_id, Role::Assistant);
    info.tokens = Some(TokenUsage {
        input,
        ..Default::default()
    });
    info
}

pub fn text_part(id: &str, session_id: &str, message_id: &str, text: &str) -> Part {
    Part {
        id: id.to_string(),
        session_id: session_id.to_string(),
        message_id: message_id.to_string(),
        kind: PartKind::Text {
            text: text.to_string(),
            synthetic: false,
            ignored: false,
        },
    }
}

pub fn permission(id: &str, session_id: &str, call_id: Option<&str>) -> Permission {
    Permission {
        id: id.to_string(),
        session_id: session_id.to_string(),
        permission: "bash".to_string(),
        patterns: vec!["ls".to_string()],
        metadata: HashMap::new(),
        always: vec!["ls *".to_string()],
        tool: call_id.map(|call_id| PermissionTool {
            message_id: "msg_tool".to_string(),
            call_id: call_id.to_string(),
        }),
    }
}

pub fn agent(name: &str, mode: AgentMode) -> Agent {
    Agent {
        name: name.to_string(),
        description: None,
        mode,
        built_in: true,
        color: None,
    }
}

// ---------------------------------------------------------------------------
// FakeBridge
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeState {
    agents: Vec<Agent>,
    sessions: Vec<Session>,
    messages: HashMap<String, Vec<MessageWithParts>>,
    permissions: Vec<Permission>,
    status: HashMap<String, SessionStatus>,

    failures: HashSet<String>,
    prompt_reply_error: Option<Value>,
    fetch_delay: Option<Duration>,
    prompt_delay: Option<Duration>,

    calls: Vec<String>,
    prompts: Vec<(String, PromptRequest)>,
    reverts: Vec<(String, RevertRequest)>,
    replies: Vec<(String, PermissionReplyRequest)>,
    aborted: Vec<String>,

    signal_tx: Option<mpsc::Sender<StreamSignal>>,
    subscriptions: usize,
}

/// In-memory bridge that records every call
#[derive(Default)]
pub struct FakeBridge {
    state: Mutex<FakeState>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_agents(&self, agents: Vec<Agent>) {
        self.state.lock().unwrap().agents = agents;
    }

    pub fn set_sessions(&self, sessions: Vec<Session>) {
        self.state.lock().unwrap().sessions = sessions;
    }

    pub fn set_messages(&self, session_id: &str, messages: Vec<MessageWithParts>) {
        self.state
            .lock()
            .unwrap()
            .messages
            .insert(session_id.to_string(), messages);
    }

    pub fn set_permissions(&self, permissions: Vec<Permission>) {
        self.state.lock().unwrap().permissions = permissions;
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) {
        self.state
            .lock()
            .unwrap()
            .status
            .insert(session_id.to_string(), status);
    }

    /// Make the named bridge method fail with a 500.
    pub fn fail(&self, method: &str) {
        self.state.lock().unwrap().failures.insert(method.to_string());
    }

    pub fn recover(&self, method: &str) {
        self.state.lock().unwrap().failures.remove(method);
    }

    /// The prompt call succeeds but the reply carries this error.
    pub fn reply_with_error(&self, error: Value) {
        self.state.lock().unwrap().prompt_reply_error = Some(error);
    }

    /// Delay history and listing fetches.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().unwrap().fetch_delay = Some(delay);
    }

    /// Hold every prompt call open this long before answering.
    pub fn set_prompt_delay(&self, delay: Duration) {
        self.state.lock().unwrap().prompt_delay = Some(delay);
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == method)
            .count()
    }

    pub fn prompts(&self) -> Vec<(String, PromptRequest)> {
        self.state.lock().unwrap().prompts.clone()
    }

    pub fn reverts(&self) -> Vec<(String, RevertRequest)> {
        self.state.lock().unwrap().reverts.clone()
    }

    pub fn replies(&self) -> Vec<(String, PermissionReplyRequest)> {
        self.state.lock().unwrap().replies.clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    pub fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscriptions
    }

    /// Push a signal into the latest subscription.
    pub async fn emit(&self, signal: StreamSignal) {
        let tx = self.state.lock().unwrap().signal_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(signal).await;
        }
    }

    /// Record the call and fail it if asked to.
    fn enter(&self, method: &str) -> BridgeResult<Option<Duration>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(method.to_string());
        if state.failures.contains(method) {
            return Err(BridgeError::Status {
                path: format!("/{method}"),
                status: 500,
                body: format!(r#"{{"name":"UnknownError","data":{{"message":"{method} failed"}}}}"#),
            });
        }
        Ok(state.fetch_delay)
    }
}

#[async_trait]
impl Bridge for FakeBridge {
    async fn list_agents(&self) -> BridgeResult<Vec<Agent>> {
        self.enter("list_agents")?;
        Ok(self.state.lock().unwrap().agents.clone())
    }

    async fn list_sessions(&self, _directory: Option<&str>) -> BridgeResult<Vec<Session>> {
        if let Some(delay) = self.enter("list_sessions")? {
            tokio::time::sleep(delay).await;
        }
        Ok(self.state.lock().unwrap().sessions.clone())
    }

    async fn get_session(&self, session_id: &str) -> BridgeResult<Session> {
        self.enter("get_session")?;
        self.state
            .lock()
            .unwrap()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
            .ok_or_else(|| BridgeError::Status {
                path: format!("/session/{session_id}"),
                status: 404,
                body: String::new(),
            })
    }

    async fn create_session(&self, request: CreateSessionRequest) -> BridgeResult<Session> {
        self.enter("create_session")?;
        let mut created = session(&identifier::ascending(IdKind::Session), None);
        if let Some(title) = request.title {
            created.title = title;
        }
        created.parent_id = request.parent_id;
        self.state.lock().unwrap().sessions.push(created.clone());
        Ok(created)
    }

    async fn update_session(
        &self,
        session_id: &str,
        request: UpdateSessionRequest,
    ) -> BridgeResult<Session> {
        self.enter("update_session")?;
        let mut state = self.state.lock().unwrap();
        let found = state.sessions.iter_mut().find(|s| s.id == session_id);
        match found {
            Some(s) => {
                s.title = request.title;
                Ok(s.clone())
            }
            None => Err(BridgeError::Status {
                path: format!("/session/{session_id}"),
                status: 404,
                body: String::new(),
            }),
        }
    }

    async fn delete_session(&self, session_id: &str) -> BridgeResult<()> {
        self.enter("delete_session")?;
        self.state
            .lock()
            .unwrap()
            .sessions
            .retain(|s| s.id != session_id);
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> BridgeResult<Vec<MessageWithParts>> {
        if let Some(delay) = self.enter("list_messages")? {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_permissions(&self, _directory: Option<&str>) -> BridgeResult<Vec<Permission>> {
        self.enter("list_permissions")?;
        Ok(self.state.lock().unwrap().permissions.clone())
    }

    async fn session_status(
        &self,
        _directory: Option<&str>,
    ) -> BridgeResult<HashMap<String, SessionStatus>> {
        self.enter("session_status")?;
        Ok(self.state.lock().unwrap().status.clone())
    }

    async fn revert(&self, session_id: &str, request: RevertRequest) -> BridgeResult<Session> {
        self.enter("revert")?;
        let mut state = self.state.lock().unwrap();
        state.reverts.push((session_id.to_string(), request));
        Ok(state
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
            .unwrap_or_else(|| session(session_id, None)))
    }

    async fn send_prompt(
        &self,
        session_id: &str,
        request: PromptRequest,
    ) -> BridgeResult<MessageWithParts> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.prompts.push((session_id.to_string(), request));
            state.prompt_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.enter("send_prompt")?;
        let mut info = message(
            &identifier::ascending(IdKind::Message),
            session_id,
            Role::Assistant,
        );
        info.error = self.state.lock().unwrap().prompt_reply_error.clone();
        Ok(MessageWithParts {
            info,
            parts: Vec::new(),
        })
    }

    async fn respond_permission(
        &self,
        _session_id: &str,
        permission_id: &str,
        request: PermissionReplyRequest,
    ) -> BridgeResult<()> {
        self.enter("respond_permission")?;
        let mut state = self.state.lock().unwrap();
        state.replies.push((permission_id.to_string(), request));
        state.permissions.retain(|p| p.id != permission_id);
        Ok(())
    }

    async fn abort_session(&self, session_id: &str) -> BridgeResult<()> {
        self.enter("abort_session")?;
        self.state.lock().unwrap().aborted.push(session_id.to_string());
        Ok(())
    }

    async fn subscribe_events(&self) -> BridgeResult<EventSubscription> {
        self.enter("subscribe_events")?;
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().unwrap();
        state.signal_tx = Some(tx);
        state.subscriptions += 1;
        Ok(EventSubscription::new(rx, None))
    }
}
