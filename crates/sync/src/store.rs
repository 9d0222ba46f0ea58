//! Sync store
//!
//! `SyncState` owns every synchronized table. Ordering and uniqueness are
//! enforced by the upsert methods themselves: message buckets and part
//! buckets are kept sorted by id and never hold two entries with the same
//! id, whatever order events arrive in.
//!
//! `SyncSnapshot` is the read model built from the state after each
//! committed mutation. UIs only ever see snapshots.

use std::collections::{BTreeMap, HashMap, HashSet};

use chatsync_protocol::{
    flatten_text, Agent, Message, Part, Permission, Role, Session, SessionStatus, SessionSummary,
};
use serde::Serialize;

use crate::bootstrap::{GlobalData, SessionData};
use crate::outbox::QueuedPrompt;

// ---------------------------------------------------------------------------
// Connection-level status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncStatus {
    Disconnected,
    #[default]
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
    Bootstrapping,
    Error {
        message: String,
    },
}

impl SyncStatus {
    pub fn is_bootstrapping(&self) -> bool {
        matches!(self, SyncStatus::Bootstrapping)
    }

    pub fn label(&self) -> String {
        match self {
            SyncStatus::Disconnected => "disconnected".into(),
            SyncStatus::Connecting => "connecting".into(),
            SyncStatus::Connected => "connected".into(),
            SyncStatus::Reconnecting { attempt } => format!("reconnecting (attempt {attempt})"),
            SyncStatus::Bootstrapping => "bootstrapping".into(),
            SyncStatus::Error { message } => format!("error: {message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

/// Context window usage of the latest assistant turn
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContextInfo {
    pub used_tokens: u64,
    pub limit_tokens: u64,
    pub percentage: f64,
}

impl ContextInfo {
    pub fn new(used_tokens: u64, limit_tokens: u64) -> Self {
        let percentage = if limit_tokens == 0 {
            0.0
        } else {
            (used_tokens as f64 * 100.0 / limit_tokens as f64).min(100.0)
        };
        Self {
            used_tokens,
            limit_tokens,
            percentage,
        }
    }

    /// From the most recent assistant message that reported token usage.
    pub fn from_messages(messages: &[MessageEntry], limit_tokens: u64) -> Option<Self> {
        messages
            .iter()
            .rev()
            .filter(|m| m.info.role == Role::Assistant)
            .filter_map(|m| m.info.tokens.map(|t| t.total()))
            .find(|total| *total > 0)
            .map(|used| Self::new(used, limit_tokens))
    }
}

/// Change summary of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileChanges {
    pub file_count: u64,
    pub additions: u64,
    pub deletions: u64,
}

impl FileChanges {
    /// Per-file diffs win when present; otherwise fall back to the summary
    /// totals, which only count when at least one file changed.
    pub fn from_summary(summary: &SessionSummary) -> Option<Self> {
        if !summary.diffs.is_empty() {
            return Some(Self {
                file_count: summary.diffs.len() as u64,
                additions: summary.diffs.iter().map(|d| d.additions).sum(),
                deletions: summary.diffs.iter().map(|d| d.deletions).sum(),
            });
        }
        (summary.files > 0).then_some(Self {
            file_count: summary.files,
            additions: summary.additions,
            deletions: summary.deletions,
        })
    }

    pub fn from_session(session: &Session) -> Option<Self> {
        session.summary.as_ref().and_then(Self::from_summary)
    }
}

/// A message row: server metadata plus the flattened visible text
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEntry {
    pub info: Message,
    pub text: String,
}

impl MessageEntry {
    pub fn new(info: Message, parts: &[Part]) -> Self {
        Self {
            info,
            text: flatten_text(parts),
        }
    }
}

/// A message as the UI renders it
#[derive(Debug, Clone, PartialEq)]
pub struct MessageView {
    pub info: Message,
    pub text: String,
    pub parts: Vec<Part>,
}

// ---------------------------------------------------------------------------
// SyncState: the tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub status: SyncStatus,
    pub agents: Vec<Agent>,
    pub current_session_id: Option<String>,

    /// All known sessions, children included, ascending id
    sessions: Vec<Session>,
    /// Loaded message buckets by session id, ascending id
    messages: HashMap<String, Vec<MessageEntry>>,
    /// Part buckets by message id, ascending id. A bucket may exist before
    /// its message does.
    parts: HashMap<String, Vec<Part>>,
    /// Pending permissions by session id, ascending id
    permissions: HashMap<String, Vec<Permission>>,
    session_status: HashMap<String, SessionStatus>,
    thinking: HashSet<String>,
    session_errors: HashMap<String, String>,

    context_info: Option<ContextInfo>,
    file_changes: Option<FileChanges>,
    context_limit: u64,
}

impl SyncState {
    pub fn new(context_limit: u64) -> Self {
        Self {
            context_limit,
            ..Default::default()
        }
    }

    pub fn context_limit(&self) -> u64 {
        self.context_limit
    }

    // -- Sessions -------------------------------------------------------------

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions
            .binary_search_by(|s| s.id.as_str().cmp(id))
            .ok()
            .map(|idx| &self.sessions[idx])
    }

    /// Sessions shown in the listing: children are left out.
    pub fn top_level_sessions(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| !s.is_child())
            .cloned()
            .collect()
    }

    pub fn upsert_session(&mut self, session: Session) {
        match self
            .sessions
            .binary_search_by(|s| s.id.as_str().cmp(&session.id))
        {
            Ok(idx) => self.sessions[idx] = session,
            Err(idx) => self.sessions.insert(idx, session),
        }
    }

    /// Drop a session and everything loaded for it.
    pub fn remove_session(&mut self, id: &str) -> Option<Session> {
        let removed = self
            .sessions
            .binary_search_by(|s| s.id.as_str().cmp(id))
            .ok()
            .map(|idx| self.sessions.remove(idx));

        self.drop_session_tables(id);
        self.session_status.remove(id);
        self.thinking.remove(id);
        self.session_errors.remove(id);

        if self.current_session_id.as_deref() == Some(id) {
            self.current_session_id = None;
            self.context_info = None;
            self.file_changes = None;
        }
        removed
    }

    /// Children of `id` known to the store
    pub fn child_session_ids(&self, id: &str) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|s| s.parent_id.as_deref() == Some(id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// The session whose permissions aggregate `id`'s: its parent when it
    /// is a child session, otherwise itself.
    pub fn root_session_id<'a>(&'a self, id: &'a str) -> &'a str {
        self.session(id)
            .and_then(|s| s.parent_id.as_deref())
            .unwrap_or(id)
    }

    /// Switch the active session. The previous session's messages, parts
    /// and permissions are dropped; they are refetched on return.
    pub fn set_current_session(&mut self, id: Option<String>) {
        if self.current_session_id == id {
            return;
        }
        if let Some(previous) = self.current_session_id.take() {
            self.drop_session_tables(&previous);
        }
        self.current_session_id = id;
        self.context_info = None;
        self.file_changes = None;
    }

    pub fn is_current(&self, session_id: &str) -> bool {
        self.current_session_id.as_deref() == Some(session_id)
    }

    /// Message and part events only apply to sessions with loaded history.
    pub fn is_tracked(&self, session_id: &str) -> bool {
        self.is_current(session_id) || self.messages.contains_key(session_id)
    }

    fn drop_session_tables(&mut self, session_id: &str) {
        if let Some(bucket) = self.messages.remove(session_id) {
            for entry in bucket {
                self.parts.remove(&entry.info.id);
            }
        }
        self.parts
            .retain(|_, bucket| bucket.first().map(|p| p.session_id.as_str()) != Some(session_id));
        self.permissions.remove(session_id);
    }

    // -- Messages -------------------------------------------------------------

    pub fn messages(&self, session_id: &str) -> &[MessageEntry] {
        self.messages
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn message(&self, session_id: &str, message_id: &str) -> Option<&MessageEntry> {
        let bucket = self.messages.get(session_id)?;
        bucket
            .binary_search_by(|m| m.info.id.as_str().cmp(message_id))
            .ok()
            .map(|idx| &bucket[idx])
    }

    pub fn latest_message_id(&self, session_id: &str) -> Option<&str> {
        self.messages
            .get(session_id)
            .and_then(|bucket| bucket.last())
            .map(|m| m.info.id.as_str())
    }

    /// Replace by id or insert in id order. The text cache is recomputed
    /// from whatever parts are already bucketed under the message id.
    pub fn upsert_message(&mut self, info: Message) {
        let parts = self
            .parts
            .get(&info.id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let entry = MessageEntry::new(info, parts);
        let bucket = self.messages.entry(entry.info.session_id.clone()).or_default();
        match bucket.binary_search_by(|m| m.info.id.as_str().cmp(&entry.info.id)) {
            Ok(idx) => bucket[idx] = entry,
            Err(idx) => bucket.insert(idx, entry),
        }
    }

    pub fn remove_message(&mut self, session_id: &str, message_id: &str) -> bool {
        self.parts.remove(message_id);
        let Some(bucket) = self.messages.get_mut(session_id) else {
            return false;
        };
        match bucket.binary_search_by(|m| m.info.id.as_str().cmp(message_id)) {
            Ok(idx) => {
                bucket.remove(idx);
                true
            }
            Err(_) => false,
        }
    }

    /// Drop every message of a session at or after `message_id`, the way a
    /// revert does on the server.
    pub fn truncate_messages_from(&mut self, session_id: &str, message_id: &str) {
        let Some(bucket) = self.messages.get_mut(session_id) else {
            return;
        };
        let cut = bucket.partition_point(|m| m.info.id.as_str() < message_id);
        for entry in bucket.drain(cut..) {
            self.parts.remove(&entry.info.id);
        }
    }

    // -- Parts ----------------------------------------------------------------

    pub fn parts(&self, message_id: &str) -> &[Part] {
        self.parts
            .get(message_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Merge by part id into the message's bucket, creating the bucket if
    /// the message has not arrived yet.
    pub fn upsert_part(&mut self, part: Part) {
        let session_id = part.session_id.clone();
        let message_id = part.message_id.clone();
        let bucket = self.parts.entry(message_id.clone()).or_default();
        match bucket.binary_search_by(|p| p.id.as_str().cmp(&part.id)) {
            Ok(idx) => bucket[idx] = part,
            Err(idx) => bucket.insert(idx, part),
        }
        self.refresh_text(&session_id, &message_id);
    }

    pub fn remove_part(&mut self, session_id: &str, message_id: &str, part_id: &str) -> bool {
        let Some(bucket) = self.parts.get_mut(message_id) else {
            return false;
        };
        let removed = match bucket.binary_search_by(|p| p.id.as_str().cmp(part_id)) {
            Ok(idx) => {
                bucket.remove(idx);
                true
            }
            Err(_) => false,
        };
        if removed {
            self.refresh_text(session_id, message_id);
        }
        removed
    }

    fn refresh_text(&mut self, session_id: &str, message_id: &str) {
        let text = flatten_text(self.parts(message_id));
        if let Some(bucket) = self.messages.get_mut(session_id) {
            if let Ok(idx) = bucket.binary_search_by(|m| m.info.id.as_str().cmp(message_id)) {
                bucket[idx].text = text;
            }
        }
    }

    // -- Permissions ----------------------------------------------------------

    pub fn permissions(&self, session_id: &str) -> &[Permission] {
        self.permissions
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn upsert_permission(&mut self, permission: Permission) {
        let bucket = self
            .permissions
            .entry(permission.session_id.clone())
            .or_default();
        match bucket.binary_search_by(|p| p.id.as_str().cmp(&permission.id)) {
            Ok(idx) => bucket[idx] = permission,
            Err(idx) => bucket.insert(idx, permission),
        }
    }

    pub fn remove_permission(&mut self, session_id: &str, permission_id: &str) -> bool {
        let Some(bucket) = self.permissions.get_mut(session_id) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|p| p.id != permission_id);
        before != bucket.len()
    }

    pub fn find_permission(&self, permission_id: &str) -> Option<&Permission> {
        self.permissions
            .values()
            .flatten()
            .find(|p| p.id == permission_id)
    }

    /// Permissions of the root of `session_id` and all of the root's
    /// children, deduplicated by tool call (or request id).
    pub fn aggregated_permissions(&self, session_id: &str) -> BTreeMap<String, Permission> {
        let root = self.root_session_id(session_id).to_string();
        let mut family = vec![root.clone()];
        family.extend(self.child_session_ids(&root));

        let mut merged = BTreeMap::new();
        for id in &family {
            for permission in self.permissions(id) {
                merged.insert(permission.key().to_string(), permission.clone());
            }
        }
        merged
    }

    // -- Per-session status ---------------------------------------------------

    /// Returns the previous status.
    pub fn set_session_status(
        &mut self,
        session_id: &str,
        status: SessionStatus,
    ) -> Option<SessionStatus> {
        self.session_status.insert(session_id.to_string(), status)
    }

    pub fn session_status(&self, session_id: &str) -> Option<&SessionStatus> {
        self.session_status.get(session_id)
    }

    pub fn set_thinking(&mut self, session_id: &str, thinking: bool) {
        if thinking {
            self.thinking.insert(session_id.to_string());
        } else {
            self.thinking.remove(session_id);
        }
    }

    pub fn is_thinking(&self, session_id: &str) -> bool {
        self.thinking.contains(session_id)
    }

    pub fn set_session_error(&mut self, session_id: &str, error: Option<String>) {
        match error {
            Some(message) => {
                self.session_errors.insert(session_id.to_string(), message);
            }
            None => {
                self.session_errors.remove(session_id);
            }
        }
    }

    pub fn session_error(&self, session_id: &str) -> Option<&str> {
        self.session_errors.get(session_id).map(String::as_str)
    }

    // -- Derived --------------------------------------------------------------

    pub fn context_info(&self) -> Option<ContextInfo> {
        self.context_info
    }

    pub fn file_changes(&self) -> Option<FileChanges> {
        self.file_changes
    }

    pub fn recompute_context_info(&mut self) {
        self.context_info = self
            .current_session_id
            .as_deref()
            .and_then(|id| ContextInfo::from_messages(self.messages(id), self.context_limit));
    }

    pub fn recompute_file_changes(&mut self) {
        self.file_changes = self
            .current_session_id
            .as_deref()
            .and_then(|id| self.session(id))
            .and_then(FileChanges::from_session);
    }

    // -- Bootstrap commits ----------------------------------------------------

    /// Replace the workspace-wide tables.
    pub fn commit_global(&mut self, data: GlobalData) {
        self.agents = data.agents;
        self.sessions = data.sessions;
        self.sessions.sort_by(|a, b| a.id.cmp(&b.id));
        self.sessions.dedup_by(|a, b| a.id == b.id);

        self.thinking = data
            .session_status
            .iter()
            .filter(|(_, status)| !status.is_idle())
            .map(|(id, _)| id.clone())
            .collect();
        self.session_status = data.session_status;

        self.permissions = data.permissions;
        for bucket in self.permissions.values_mut() {
            bucket.sort_by(|a, b| a.id.cmp(&b.id));
        }
        self.recompute_file_changes();
    }

    /// Replace one session's history with a fetched copy. Part buckets for
    /// messages the fetch does not know about are left alone.
    pub fn commit_session(&mut self, data: SessionData) {
        let session_id = data.session_id;
        if let Some(session) = data.session {
            self.upsert_session(session);
        }
        if let Some(old) = self.messages.remove(&session_id) {
            for entry in old {
                self.parts.remove(&entry.info.id);
            }
        }
        for (message_id, parts) in data.parts {
            self.parts.insert(message_id, parts);
        }
        self.messages.insert(session_id.clone(), data.messages);
        for (id, bucket) in data.permissions {
            self.permissions.insert(id, bucket);
        }

        if self.is_current(&session_id) {
            self.context_info = data.context_info;
            self.file_changes = data.file_changes;
        }
    }

    // -- Read model -----------------------------------------------------------

    /// Messages of a session as rendered: synthetic and ignored text parts
    /// are hidden on user messages.
    pub fn message_views(&self, session_id: &str) -> Vec<MessageView> {
        self.messages(session_id)
            .iter()
            .map(|entry| {
                let parts = self
                    .parts(&entry.info.id)
                    .iter()
                    .filter(|p| entry.info.role != Role::User || !p.is_hidden_text())
                    .cloned()
                    .collect();
                MessageView {
                    info: entry.info.clone(),
                    text: entry.text.clone(),
                    parts,
                }
            })
            .collect()
    }

    pub fn snapshot(
        &self,
        revision: u64,
        queued: Vec<QueuedPrompt>,
        in_flight: Option<String>,
    ) -> SyncSnapshot {
        let current = self.current_session_id.as_deref();
        SyncSnapshot {
            revision,
            status: self.status.clone(),
            agents: self.agents.clone(),
            sessions: self.top_level_sessions(),
            current_session_id: self.current_session_id.clone(),
            messages: current.map(|id| self.message_views(id)).unwrap_or_default(),
            permissions: current
                .map(|id| self.permissions(id).to_vec())
                .unwrap_or_default(),
            aggregated_permissions: current
                .map(|id| self.aggregated_permissions(id))
                .unwrap_or_default(),
            thinking: current.is_some_and(|id| self.is_thinking(id)),
            session_error: current
                .and_then(|id| self.session_error(id))
                .map(str::to_string),
            session_status: self.session_status.clone(),
            context_info: self.context_info,
            file_changes: self.file_changes,
            queued,
            in_flight,
        }
    }
}

// ---------------------------------------------------------------------------
// SyncSnapshot: read model
// ---------------------------------------------------------------------------

/// Immutable view published after every committed mutation
#[derive(Debug, Clone, Default)]
pub struct SyncSnapshot {
    pub revision: u64,
    pub status: SyncStatus,
    pub agents: Vec<Agent>,
    /// Top-level sessions, ascending id
    pub sessions: Vec<Session>,
    pub current_session_id: Option<String>,
    /// Current session's messages, ascending id
    pub messages: Vec<MessageView>,
    /// Current session's own pending permissions
    pub permissions: Vec<Permission>,
    /// Current session family's permissions keyed by tool call
    pub aggregated_permissions: BTreeMap<String, Permission>,
    pub thinking: bool,
    pub session_error: Option<String>,
    pub session_status: HashMap<String, SessionStatus>,
    pub context_info: Option<ContextInfo>,
    pub file_changes: Option<FileChanges>,
    /// Prompts waiting behind the in-flight one in the current session
    pub queued: Vec<QueuedPrompt>,
    /// Message id of the current session's in-flight prompt
    pub in_flight: Option<String>,
}

impl SyncSnapshot {
    /// Bootstrapped and live.
    pub fn is_ready(&self) -> bool {
        self.status == SyncStatus::Connected
    }

    pub fn message(&self, message_id: &str) -> Option<&MessageView> {
        self.messages.iter().find(|m| m.info.id == message_id)
    }

    pub fn parts(&self, message_id: &str) -> &[Part] {
        self.message(message_id)
            .map(|m| m.parts.as_slice())
            .unwrap_or_default()
    }

    pub fn session_status(&self, session_id: &str) -> Option<&SessionStatus> {
        self.session_status.get(session_id)
    }
}
