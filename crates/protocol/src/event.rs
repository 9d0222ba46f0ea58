//! Server-sent events
//!
//! The server wraps every event as `{"type": "<name>", "properties": {..}}`.
//! Decoding is two-step: the envelope first, then the properties for the
//! names we understand. Unknown names decode to `None` so newer servers
//! don't break older clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::*;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed event envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("malformed properties for {event}: {source}")]
    Properties {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Undecoded event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

/// A decoded server event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SessionCreated(Session),
    SessionUpdated(Session),
    SessionDeleted(Session),

    /// `message.created` and `message.updated` both upsert by id.
    MessageUpdated(Message),
    MessageRemoved {
        session_id: String,
        message_id: String,
    },

    /// `message.part.created` and `message.part.updated` both upsert by id.
    PartUpdated {
        part: Part,
        delta: Option<String>,
    },
    PartRemoved {
        session_id: String,
        message_id: String,
        part_id: String,
    },

    PermissionAsked(Permission),
    PermissionReplied {
        session_id: String,
        permission_id: String,
        reply: Option<String>,
    },

    SessionStatus {
        session_id: String,
        status: SessionStatus,
    },
    SessionIdle {
        session_id: String,
    },
    SessionError {
        session_id: Option<String>,
        error: Option<Value>,
    },

    /// The server instance behind the stream was replaced.
    InstanceDisposed {
        directory: Option<String>,
    },
    ServerConnected,
}

#[derive(Deserialize)]
struct InfoProps<T> {
    info: T,
}

#[derive(Deserialize)]
struct MessageRemovedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
}

#[derive(Deserialize)]
struct PartProps {
    part: Part,
    #[serde(default)]
    delta: Option<String>,
}

#[derive(Deserialize)]
struct PartRemovedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
    #[serde(rename = "partID")]
    part_id: String,
}

#[derive(Deserialize)]
struct PermissionRepliedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "requestID", alias = "permissionID")]
    permission_id: String,
    #[serde(default, alias = "response")]
    reply: Option<String>,
}

#[derive(Deserialize)]
struct StatusProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    status: SessionStatus,
}

#[derive(Deserialize)]
struct SessionIdProps {
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Deserialize)]
struct SessionErrorProps {
    #[serde(rename = "sessionID", default)]
    session_id: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct DisposedProps {
    #[serde(default)]
    directory: Option<String>,
}

fn props<T: for<'de> Deserialize<'de>>(raw: RawEvent) -> Result<T, ProtocolError> {
    let properties = match raw.properties {
        Value::Null => Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(properties).map_err(|source| ProtocolError::Properties {
        event: raw.event_type,
        source,
    })
}

impl Event {
    /// Decode the `data:` payload of one SSE message.
    pub fn parse(data: &str) -> Result<Option<Event>, ProtocolError> {
        let raw: RawEvent = serde_json::from_str(data).map_err(ProtocolError::Envelope)?;
        Event::from_raw(raw)
    }

    pub fn from_raw(raw: RawEvent) -> Result<Option<Event>, ProtocolError> {
        let event = match raw.event_type.as_str() {
            "session.created" => Event::SessionCreated(props::<InfoProps<Session>>(raw)?.info),
            "session.updated" => Event::SessionUpdated(props::<InfoProps<Session>>(raw)?.info),
            "session.deleted" => Event::SessionDeleted(props::<InfoProps<Session>>(raw)?.info),
            "message.created" | "message.updated" => {
                Event::MessageUpdated(props::<InfoProps<Message>>(raw)?.info)
            }
            "message.removed" => {
                let p: MessageRemovedProps = props(raw)?;
                Event::MessageRemoved {
                    session_id: p.session_id,
                    message_id: p.message_id,
                }
            }
            "message.part.created" | "message.part.updated" => {
                let p: PartProps = props(raw)?;
                Event::PartUpdated {
                    part: p.part,
                    delta: p.delta,
                }
            }
            "message.part.removed" => {
                let p: PartRemovedProps = props(raw)?;
                Event::PartRemoved {
                    session_id: p.session_id,
                    message_id: p.message_id,
                    part_id: p.part_id,
                }
            }
            "permission.asked" | "permission.updated" => Event::PermissionAsked(props(raw)?),
            "permission.replied" => {
                let p: PermissionRepliedProps = props(raw)?;
                Event::PermissionReplied {
                    session_id: p.session_id,
                    permission_id: p.permission_id,
                    reply: p.reply,
                }
            }
            "session.status" => {
                let p: StatusProps = props(raw)?;
                Event::SessionStatus {
                    session_id: p.session_id,
                    status: p.status,
                }
            }
            "session.idle" => Event::SessionIdle {
                session_id: props::<SessionIdProps>(raw)?.session_id,
            },
            "session.error" => {
                let p: SessionErrorProps = props(raw)?;
                Event::SessionError {
                    session_id: p.session_id,
                    error: p.error,
                }
            }
            "server.instance.disposed" => Event::InstanceDisposed {
                directory: props::<DisposedProps>(raw)?.directory,
            },
            "server.connected" => Event::ServerConnected,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Stable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::SessionCreated(_) => "session.created",
            Event::SessionUpdated(_) => "session.updated",
            Event::SessionDeleted(_) => "session.deleted",
            Event::MessageUpdated(_) => "message.updated",
            Event::MessageRemoved { .. } => "message.removed",
            Event::PartUpdated { .. } => "message.part.updated",
            Event::PartRemoved { .. } => "message.part.removed",
            Event::PermissionAsked(_) => "permission.asked",
            Event::PermissionReplied { .. } => "permission.replied",
            Event::SessionStatus { .. } => "session.status",
            Event::SessionIdle { .. } => "session.idle",
            Event::SessionError { .. } => "session.error",
            Event::InstanceDisposed { .. } => "server.instance.disposed",
            Event::ServerConnected => "server.connected",
        }
    }

    /// Session the event concerns, when it names one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Event::SessionCreated(s) | Event::SessionUpdated(s) | Event::SessionDeleted(s) => {
                Some(s.id.as_str())
            }
            Event::MessageUpdated(m) => Some(m.session_id.as_str()),
            Event::PartUpdated { part, .. } => Some(part.session_id.as_str()),
            Event::PermissionAsked(p) => Some(p.session_id.as_str()),
            Event::MessageRemoved { session_id, .. }
            | Event::PartRemoved { session_id, .. }
            | Event::PermissionReplied { session_id, .. }
            | Event::SessionStatus { session_id, .. }
            | Event::SessionIdle { session_id } => Some(session_id.as_str()),
            Event::SessionError { session_id, .. } => session_id.as_deref(),
            Event::InstanceDisposed { .. } | Event::ServerConnected => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Option<Event> {
        Event::parse(&value.to_string()).unwrap()
    }

    #[test]
    fn message_created_and_updated_share_a_variant() {
        let info = json!({"id": "msg_2", "sessionID": "ses_1", "role": "user"});
        let created = parse(json!({"type": "message.created", "properties": {"info": info}}));
        let updated = parse(json!({"type": "message.updated", "properties": {"info": info}}));
        assert_eq!(created, updated);
        assert!(matches!(created, Some(Event::MessageUpdated(ref m)) if m.id == "msg_2"));
    }

    #[test]
    fn part_updated_carries_delta() {
        let event = parse(json!({
            "type": "message.part.updated",
            "properties": {
                "part": {"id": "prt_1", "sessionID": "ses_1", "messageID": "msg_1", "type": "text", "text": "he"},
                "delta": "he"
            }
        }))
        .unwrap();
        match event {
            Event::PartUpdated { part, delta } => {
                assert_eq!(part.message_id, "msg_1");
                assert_eq!(delta.as_deref(), Some("he"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn permission_replied_accepts_both_id_spellings() {
        let v2 = parse(json!({
            "type": "permission.replied",
            "properties": {"sessionID": "ses_1", "requestID": "per_1", "reply": "once"}
        }));
        let v1 = parse(json!({
            "type": "permission.replied",
            "properties": {"sessionID": "ses_1", "permissionID": "per_1", "response": "once"}
        }));
        assert_eq!(v1, v2);
    }

    #[test]
    fn session_status_busy_decodes() {
        let event = parse(json!({
            "type": "session.status",
            "properties": {"sessionID": "ses_1", "status": {"type": "busy"}}
        }));
        assert_eq!(
            event,
            Some(Event::SessionStatus {
                session_id: "ses_1".into(),
                status: SessionStatus::Busy
            })
        );
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        assert_eq!(
            parse(json!({"type": "lsp.updated", "properties": {}})),
            None
        );
    }

    #[test]
    fn instance_disposed_without_properties() {
        let event = parse(json!({"type": "server.instance.disposed"}));
        assert_eq!(event, Some(Event::InstanceDisposed { directory: None }));
        assert_eq!(event.unwrap().session_id(), None);
    }

    #[test]
    fn malformed_properties_are_reported() {
        let err = Event::parse(&json!({"type": "session.idle", "properties": {}}).to_string())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Properties { ref event, .. } if event == "session.idle"));
    }
}
