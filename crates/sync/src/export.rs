//! Markdown transcript export

use std::fmt::Write;

use chatsync_protocol::{MessageWithParts, PartKind, Role, Session, ToolStatus};

pub fn render_markdown(session: &Session, messages: &[MessageWithParts]) -> String {
    let mut out = String::new();
    let title = if session.title.trim().is_empty() {
        "Untitled session"
    } else {
        session.title.trim()
    };
    let _ = writeln!(out, "# {title}\n");
    let _ = writeln!(out, "- Session: `{}`", session.id);
    if !session.directory.is_empty() {
        let _ = writeln!(out, "- Directory: `{}`", session.directory);
    }
    if let Some(parent) = &session.parent_id {
        let _ = writeln!(out, "- Parent: `{parent}`");
    }

    let mut ordered: Vec<&MessageWithParts> = messages.iter().collect();
    ordered.sort_by(|a, b| a.info.id.cmp(&b.info.id));

    for message in ordered {
        out.push_str("\n---\n\n");
        match message.info.role {
            Role::User => out.push_str("## User\n"),
            Role::Assistant => {
                let label = [message.info.agent.as_deref(), message.info.model_id.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" · ");
                if label.is_empty() {
                    out.push_str("## Assistant\n");
                } else {
                    let _ = writeln!(out, "## Assistant ({label})");
                }
            }
        }

        let mut parts: Vec<_> = message.parts.iter().collect();
        parts.sort_by(|a, b| a.id.cmp(&b.id));
        for part in parts {
            match &part.kind {
                PartKind::Text { .. } => {
                    if let Some(text) = part.visible_text() {
                        let _ = writeln!(out, "\n{}", text.trim_end());
                    }
                }
                PartKind::Reasoning { text } if !text.trim().is_empty() => {
                    let _ = writeln!(out, "\n_Thinking:_\n\n{}", text.trim_end());
                }
                PartKind::Tool { tool, state, .. } => {
                    let status = match state.status {
                        ToolStatus::Pending => "pending",
                        ToolStatus::Running => "running",
                        ToolStatus::Completed => "completed",
                        ToolStatus::Error => "error",
                    };
                    let _ = writeln!(out, "\n**Tool: {tool}** ({status})");
                    if !state.input.is_null() {
                        let input = serde_json::to_string_pretty(&state.input)
                            .unwrap_or_else(|_| state.input.to_string());
                        let _ = writeln!(out, "\n```json\n{input}\n```");
                    }
                    if let Some(output) = state.output.as_deref().or(state.error.as_deref()) {
                        let _ = writeln!(out, "\n```\n{}\n```", output.trim_end());
                    }
                }
                _ => {}
            }
        }

        if let Some(error) = &message.info.error {
            let _ = writeln!(
                out,
                "\n> Error: {}",
                chatsync_protocol::describe_error(error)
            );
        }
    }
    out
}
