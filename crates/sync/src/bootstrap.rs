//! Bootstrap loader
//!
//! Fetches consistent snapshots from the bridge. Workspace-wide data is
//! all-or-nothing: any failure there fails the bootstrap. Session data
//! degrades to an empty result so one broken session never blocks the
//! rest.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chatsync_protocol::{Agent, Part, Permission, Role, Session, SessionStatus};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bridge::Bridge;
use crate::error::BridgeResult;
use crate::store::{ContextInfo, FileChanges, MessageEntry};

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GlobalData {
    /// Selectable agents only
    pub agents: Vec<Agent>,
    /// Every session, children included, ascending id
    pub sessions: Vec<Session>,
    pub session_status: HashMap<String, SessionStatus>,
    /// Pending permissions grouped by session id
    pub permissions: HashMap<String, Vec<Permission>>,
}

#[derive(Debug, Clone)]
pub struct SessionData {
    pub session_id: String,
    pub session: Option<Session>,
    pub messages: Vec<MessageEntry>,
    pub parts: HashMap<String, Vec<Part>>,
    /// Permissions for the session and each child, one key per family
    /// member (possibly empty) so a commit replaces stale entries.
    pub permissions: HashMap<String, Vec<Permission>>,
    pub context_info: Option<ContextInfo>,
    pub file_changes: Option<FileChanges>,
    /// False when the fetch failed and this is a stand-in.
    pub loaded: bool,
}

impl SessionData {
    pub fn empty(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            session: None,
            messages: Vec::new(),
            parts: HashMap::new(),
            permissions: HashMap::new(),
            context_info: None,
            file_changes: None,
            loaded: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapData {
    pub global: GlobalData,
    pub session: Option<SessionData>,
}

/// Deduplication key for concurrent bootstrap requests
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BootstrapKey {
    /// Full workspace bootstrap, optionally including one session
    Workspace(Option<String>),
    /// A single session's history (session switch)
    Session(String),
}

// ---------------------------------------------------------------------------
// Fetches
// ---------------------------------------------------------------------------

pub async fn fetch_global_data(
    bridge: &dyn Bridge,
    workspace: Option<&str>,
    hidden_agents: &[String],
) -> BridgeResult<GlobalData> {
    let (agents, mut sessions, session_status, permissions) = tokio::try_join!(
        bridge.list_agents(),
        bridge.list_sessions(workspace),
        bridge.session_status(workspace),
        bridge.list_permissions(workspace),
    )?;

    let agents = agents
        .into_iter()
        .filter(|agent| agent.is_selectable() && !hidden_agents.contains(&agent.name))
        .collect();

    sessions.sort_by(|a, b| a.id.cmp(&b.id));
    sessions.dedup_by(|a, b| a.id == b.id);

    let mut grouped: HashMap<String, Vec<Permission>> = HashMap::new();
    for permission in permissions {
        grouped
            .entry(permission.session_id.clone())
            .or_default()
            .push(permission);
    }

    Ok(GlobalData {
        agents,
        sessions,
        session_status,
        permissions: grouped,
    })
}

/// One session's history plus derived values. `family` is the session
/// followed by its known children; their permissions are included.
pub async fn fetch_session_data(
    bridge: &dyn Bridge,
    session_id: &str,
    family: &[String],
    context_limit: u64,
) -> SessionData {
    let (messages, session, permissions) = tokio::join!(
        bridge.list_messages(session_id),
        bridge.get_session(session_id),
        bridge.list_permissions(None),
    );

    let messages = match messages {
        Ok(messages) => messages,
        Err(err) => {
            warn!(
                component = "bootstrap",
                event = "bootstrap.session.fetch_failed",
                session_id = %session_id,
                error = %err,
                "Session history fetch failed, continuing with empty data"
            );
            return SessionData::empty(session_id);
        }
    };

    let session = session
        .map_err(|err| {
            debug!(
                component = "bootstrap",
                event = "bootstrap.session.get_failed",
                session_id = %session_id,
                error = %err,
                "Session row fetch failed"
            );
        })
        .ok();

    let mut entries = Vec::with_capacity(messages.len());
    let mut parts = HashMap::with_capacity(messages.len());
    for item in messages {
        let mut message_parts: Vec<Part> = item
            .parts
            .into_iter()
            .filter(|p| item.info.role != Role::User || !p.is_hidden_text())
            .collect();
        message_parts.sort_by(|a, b| a.id.cmp(&b.id));
        message_parts.dedup_by(|a, b| a.id == b.id);

        let message_id = item.info.id.clone();
        entries.push(MessageEntry::new(item.info, &message_parts));
        parts.insert(message_id, message_parts);
    }
    entries.sort_by(|a, b| a.info.id.cmp(&b.info.id));
    entries.dedup_by(|a, b| a.info.id == b.info.id);

    let mut family_permissions: HashMap<String, Vec<Permission>> = HashMap::new();
    match permissions {
        Ok(permissions) => {
            for id in family {
                family_permissions.entry(id.clone()).or_default();
            }
            family_permissions.entry(session_id.to_string()).or_default();
            for permission in permissions {
                if let Some(bucket) = family_permissions.get_mut(&permission.session_id) {
                    bucket.push(permission);
                }
            }
            for bucket in family_permissions.values_mut() {
                bucket.sort_by(|a, b| a.id.cmp(&b.id));
            }
        }
        Err(err) => {
            warn!(
                component = "bootstrap",
                event = "bootstrap.permissions.fetch_failed",
                session_id = %session_id,
                error = %err,
                "Permission fetch failed, keeping current permissions"
            );
        }
    }

    let context_info = ContextInfo::from_messages(&entries, context_limit);
    let file_changes = session.as_ref().and_then(FileChanges::from_session);

    SessionData {
        session_id: session_id.to_string(),
        session,
        messages: entries,
        parts,
        permissions: family_permissions,
        context_info,
        file_changes,
        loaded: true,
    }
}

/// Workspace data, then the session's history when one is given. The
/// session's children come from the freshly fetched session list.
pub async fn fetch_bootstrap_data(
    bridge: &dyn Bridge,
    workspace: Option<&str>,
    hidden_agents: &[String],
    session_id: Option<&str>,
    context_limit: u64,
) -> BridgeResult<BootstrapData> {
    let global = fetch_global_data(bridge, workspace, hidden_agents).await?;
    let session = match session_id {
        Some(id) => {
            let mut family = vec![id.to_string()];
            family.extend(
                global
                    .sessions
                    .iter()
                    .filter(|s| s.parent_id.as_deref() == Some(id))
                    .map(|s| s.id.clone()),
            );
            Some(fetch_session_data(bridge, id, &family, context_limit).await)
        }
        None => None,
    };
    Ok(BootstrapData { global, session })
}

// ---------------------------------------------------------------------------
// Session data cache
// ---------------------------------------------------------------------------

/// Short-lived cache of loaded session data, bounded in size. The oldest
/// inserted entry goes first when full.
#[derive(Debug)]
pub struct SessionDataCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, (Instant, SessionData)>,
    order: VecDeque<String>,
}

impl SessionDataCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, session_id: &str) -> Option<SessionData> {
        let fresh = self
            .entries
            .get(session_id)
            .is_some_and(|(at, _)| at.elapsed() < self.ttl);
        if !fresh {
            self.invalidate(session_id);
            return None;
        }
        self.entries.get(session_id).map(|(_, data)| data.clone())
    }

    /// Stand-ins from failed fetches are never cached.
    pub fn insert(&mut self, data: SessionData) {
        if !data.loaded || self.capacity == 0 {
            return;
        }
        let id = data.session_id.clone();
        self.order.retain(|existing| existing != &id);
        self.order.push_back(id.clone());
        self.entries.insert(id, (Instant::now(), data));

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn invalidate(&mut self, session_id: &str) {
        if self.entries.remove(session_id).is_some() {
            self.order.retain(|existing| existing != session_id);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
