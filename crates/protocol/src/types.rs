//! Core entities shared by bootstrap responses and live events

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Primary,
    Subagent,
    All,
}

/// An agent from the server's catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub mode: AgentMode,
    #[serde(default)]
    pub built_in: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl Agent {
    /// Whether a user may pick this agent for a prompt.
    pub fn is_selectable(&self) -> bool {
        matches!(self.mode, AgentMode::Primary | AgentMode::All)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub updated: u64,
}

/// Per-file diff stats inside a session summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub file: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
}

/// Aggregated change summary the server keeps per session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub files: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diffs: Vec<FileDiff>,
}

/// A chat session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "projectID", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub directory: String,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub time: SessionTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<SessionSummary>,
}

impl Session {
    /// Subagent sessions carry the id of the session that spawned them.
    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub write: u64,
}

/// Token usage reported on assistant messages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub cache: CacheTokens,
}

impl TokenUsage {
    /// Everything that occupies the context window.
    pub fn total(&self) -> u64 {
        [self.output, self.reasoning, self.cache.read, self.cache.write]
            .into_iter()
            .fold(self.input, u64::saturating_add)
    }
}

/// Message metadata (the `info` half of a message-with-parts)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: Role,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// Lifecycle of a tool call part
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Type-specific payload of a part
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartKind {
    Text {
        #[serde(default)]
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        synthetic: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        ignored: bool,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    Tool {
        #[serde(rename = "callID")]
        call_id: String,
        tool: String,
        #[serde(default)]
        state: ToolState,
    },
    StepStart,
    StepFinish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<TokenUsage>,
    },
    /// Part types this client does not render (files, patches, snapshots, ...)
    #[serde(other)]
    Other,
}

/// One piece of a message's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(flatten)]
    pub kind: PartKind,
}

impl Part {
    /// Text parts injected by the server rather than typed by a human or
    /// produced as a model turn.
    pub fn is_hidden_text(&self) -> bool {
        matches!(
            self.kind,
            PartKind::Text { synthetic, ignored, .. } if synthetic || ignored
        )
    }

    /// Visible text content, if this is a text part that counts toward the
    /// flattened message text.
    pub fn visible_text(&self) -> Option<&str> {
        match &self.kind {
            PartKind::Text {
                text,
                synthetic: false,
                ignored: false,
            } => Some(text.as_str()),
            _ => None,
        }
    }
}

/// Join the visible text parts of a message, in the order given.
pub fn flatten_text<'a>(parts: impl IntoIterator<Item = &'a Part>) -> String {
    parts
        .into_iter()
        .filter_map(Part::visible_text)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Response element of the session-messages endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: Message,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Tool call a permission request was raised for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionTool {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "callID")]
    pub call_id: String,
}

/// Pending permission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(default)]
    pub permission: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Patterns that an "always" reply would allow from now on.
    #[serde(default)]
    pub always: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<PermissionTool>,
}

impl Permission {
    /// Dedup key: the tool call when known, otherwise the request id.
    pub fn key(&self) -> &str {
        self.tool
            .as_ref()
            .map(|t| t.call_id.as_str())
            .filter(|id| !id.is_empty())
            .unwrap_or(self.id.as_str())
    }

    pub fn can_always_allow(&self) -> bool {
        !self.always.is_empty()
    }
}

/// Server-side run status of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Busy,
    Retry {
        attempt: u32,
        #[serde(default)]
        message: String,
        /// Unix millis of the next attempt.
        #[serde(default)]
        next: u64,
    },
}

impl SessionStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionStatus::Idle)
    }
}

/// Pull a human-readable message out of a server error payload.
///
/// Accepts a bare string, `{ "message": .. }`, or the named-error shape
/// `{ "name": .., "data": { "message": .. } }`.
pub fn describe_error(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            if let Some(msg) = map
                .get("data")
                .and_then(|d| d.get("message"))
                .and_then(Value::as_str)
            {
                return msg.to_string();
            }
            if let Some(msg) = map.get("message").and_then(Value::as_str) {
                return msg.to_string();
            }
            if let Some(name) = map.get("name").and_then(Value::as_str) {
                return name.to_string();
            }
            value.to_string()
        }
        Value::Null => "unknown error".to_string(),
        other => other.to_string(),
    }
}
