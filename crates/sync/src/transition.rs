//! Pure event applier
//!
//! One server event in, one state out: `transition(state, event) ->
//! (state, effects)`. No IO, no async. Effects tell the engine what to do
//! next (drain an outbox, drop a cache entry, bootstrap again).

use chatsync_protocol::{describe_error, Event, Role, SessionStatus};
use serde_json::Value;

use crate::store::SyncState;

/// Abort errors are the result of a user cancel, not something to show.
const ABORTED_ERROR_NAME: &str = "MessageAbortedError";

// ---------------------------------------------------------------------------
// Effects the engine applies after a transition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The session just went from working to idle.
    SessionIdle(String),
    /// Cached session data no longer matches the server.
    InvalidateSessionCache(String),
    /// The session is gone server-side.
    SessionRemoved(String),
    /// The server instance changed; everything local is suspect.
    Rebootstrap,
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

pub fn transition(mut state: SyncState, event: Event) -> (SyncState, Vec<Effect>) {
    let mut effects = Vec::new();

    match event {
        // -- Sessions ---------------------------------------------------------
        Event::SessionCreated(session) | Event::SessionUpdated(session) => {
            let id = session.id.clone();
            state.upsert_session(session);
            if state.is_current(&id) {
                state.recompute_file_changes();
            }
            effects.push(Effect::InvalidateSessionCache(id));
        }

        Event::SessionDeleted(session) => {
            state.remove_session(&session.id);
            effects.push(Effect::InvalidateSessionCache(session.id.clone()));
            effects.push(Effect::SessionRemoved(session.id));
        }

        // -- Messages ---------------------------------------------------------
        Event::MessageUpdated(info) => {
            let session_id = info.session_id.clone();
            if state.is_tracked(&session_id) {
                let assistant = info.role == Role::Assistant;
                state.upsert_message(info);
                if assistant && state.is_current(&session_id) {
                    state.recompute_context_info();
                }
            }
            effects.push(Effect::InvalidateSessionCache(session_id));
        }

        Event::MessageRemoved {
            session_id,
            message_id,
        } => {
            if state.is_tracked(&session_id) {
                state.remove_message(&session_id, &message_id);
                if state.is_current(&session_id) {
                    state.recompute_context_info();
                }
            }
            effects.push(Effect::InvalidateSessionCache(session_id));
        }

        // -- Parts ------------------------------------------------------------
        Event::PartUpdated { part, .. } => {
            let session_id = part.session_id.clone();
            if state.is_tracked(&session_id) {
                state.upsert_part(part);
            }
            effects.push(Effect::InvalidateSessionCache(session_id));
        }

        Event::PartRemoved {
            session_id,
            message_id,
            part_id,
        } => {
            if state.is_tracked(&session_id) {
                state.remove_part(&session_id, &message_id, &part_id);
            }
            effects.push(Effect::InvalidateSessionCache(session_id));
        }

        // -- Permissions ------------------------------------------------------
        // Cached session data carries the permissions of the whole family,
        // so the root's entry goes stale too.
        Event::PermissionAsked(permission) => {
            let root = state.root_session_id(&permission.session_id).to_string();
            state.upsert_permission(permission);
            effects.push(Effect::InvalidateSessionCache(root));
        }

        Event::PermissionReplied {
            session_id,
            permission_id,
            ..
        } => {
            state.remove_permission(&session_id, &permission_id);
            let root = state.root_session_id(&session_id).to_string();
            effects.push(Effect::InvalidateSessionCache(root));
        }

        // -- Run status -------------------------------------------------------
        Event::SessionStatus { session_id, status } => {
            let idle = status.is_idle();
            let previous = state.set_session_status(&session_id, status);
            state.set_thinking(&session_id, !idle);
            if idle && entered_idle(previous.as_ref()) {
                effects.push(Effect::SessionIdle(session_id));
            }
        }

        Event::SessionIdle { session_id } => {
            let previous = state.set_session_status(&session_id, SessionStatus::Idle);
            state.set_thinking(&session_id, false);
            if entered_idle(previous.as_ref()) {
                effects.push(Effect::SessionIdle(session_id));
            }
        }

        Event::SessionError { session_id, error } => {
            if let Some(session_id) = session_id {
                let error = error.unwrap_or(Value::Null);
                if !is_aborted(&error) {
                    state.set_session_error(&session_id, Some(describe_error(&error)));
                }
            }
        }

        // -- Server -----------------------------------------------------------
        Event::InstanceDisposed { .. } => {
            effects.push(Effect::Rebootstrap);
        }

        Event::ServerConnected => {}
    }

    (state, effects)
}

/// Apply a batch in arrival order, collecting effects. Cache invalidations
/// for the same session are only reported once.
pub fn transition_batch(
    mut state: SyncState,
    events: Vec<Event>,
) -> (SyncState, Vec<Effect>) {
    let mut effects: Vec<Effect> = Vec::new();
    for event in events {
        let (next, produced) = transition(state, event);
        state = next;
        for effect in produced {
            if matches!(effect, Effect::InvalidateSessionCache(_)) && effects.contains(&effect) {
                continue;
            }
            effects.push(effect);
        }
    }
    (state, effects)
}

fn entered_idle(previous: Option<&SessionStatus>) -> bool {
    previous.is_some_and(|status| !status.is_idle())
}

/// Whether a server error is the result of a user abort.
pub(crate) fn is_aborted(error: &Value) -> bool {
    error.get("name").and_then(Value::as_str) == Some(ABORTED_ERROR_NAME)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
