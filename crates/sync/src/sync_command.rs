//! Commands sent to the sync engine from `SyncHandle` callers.

use chatsync_protocol::{PermissionReply, PromptPart, Session};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::SyncError;
use crate::outbox::PendingPrompt;

pub type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

/// What happened to a submitted prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubmitReceipt {
    /// Sent right away under this client-generated id.
    Sent { message_id: String },
    /// Waiting behind the in-flight prompt.
    Queued { queue_id: u64, position: usize },
}

/// A command that can be sent to the sync engine.
pub enum SyncCommand {
    // -- Prompts --
    /// Send a prompt to the current session, or queue it when one is
    /// already in flight. Creates a session first when none is active.
    Submit {
        text: String,
        agent: Option<String>,
        parts: Vec<PromptPart>,
        reply: Reply<SubmitReceipt>,
    },
    RemoveQueued {
        queue_id: u64,
        reply: Reply<bool>,
    },
    /// Remove a queued prompt and hand it back for editing
    TakeQueued {
        queue_id: u64,
        reply: Reply<Option<PendingPrompt>>,
    },
    /// Abort the running turn and drop the queue
    Cancel {
        reply: Reply<()>,
    },
    /// Revert to the user message before an assistant message and send it again
    Retry {
        message_id: String,
        reply: Reply<SubmitReceipt>,
    },
    /// Revert to a user message and send new text in its place
    EditAndResubmit {
        message_id: String,
        text: String,
        reply: Reply<SubmitReceipt>,
    },

    // -- Sessions --
    SwitchSession {
        session_id: Option<String>,
        reply: Reply<()>,
    },
    CreateSession {
        title: Option<String>,
        reply: Reply<Session>,
    },
    DeleteSession {
        session_id: String,
        reply: Reply<()>,
    },
    RenameSession {
        session_id: String,
        title: String,
        reply: Reply<Session>,
    },
    /// Render a session transcript as Markdown
    ExportSession {
        session_id: String,
        reply: Reply<String>,
    },
    DismissError,

    // -- Permissions --
    RespondPermission {
        permission_id: String,
        decision: PermissionReply,
        message: Option<String>,
        reply: Reply<()>,
    },

    // -- Connection --
    /// Run a workspace bootstrap now (joins one already running)
    Bootstrap {
        reply: Reply<()>,
    },
    /// Drop the event stream and start over
    Reconnect,
    Shutdown,
}

impl SyncCommand {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            SyncCommand::Submit { .. } => "submit",
            SyncCommand::RemoveQueued { .. } => "remove_queued",
            SyncCommand::TakeQueued { .. } => "take_queued",
            SyncCommand::Cancel { .. } => "cancel",
            SyncCommand::Retry { .. } => "retry",
            SyncCommand::EditAndResubmit { .. } => "edit_and_resubmit",
            SyncCommand::SwitchSession { .. } => "switch_session",
            SyncCommand::CreateSession { .. } => "create_session",
            SyncCommand::DeleteSession { .. } => "delete_session",
            SyncCommand::RenameSession { .. } => "rename_session",
            SyncCommand::ExportSession { .. } => "export_session",
            SyncCommand::DismissError => "dismiss_error",
            SyncCommand::RespondPermission { .. } => "respond_permission",
            SyncCommand::Bootstrap { .. } => "bootstrap",
            SyncCommand::Reconnect => "reconnect",
            SyncCommand::Shutdown => "shutdown",
        }
    }
}
