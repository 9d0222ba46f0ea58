//! Client → server request bodies

use serde::{Deserialize, Serialize};

/// Extra content attached to a prompt besides its text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptPart {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        synthetic: bool,
    },
    File {
        mime: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
}

/// Body of a send-prompt call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    #[serde(rename = "messageID", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub parts: Vec<PromptPart>,
}

impl PromptRequest {
    /// Text first, then any extra parts in the order given.
    pub fn new(
        message_id: Option<String>,
        text: &str,
        agent: Option<String>,
        extra: Vec<PromptPart>,
    ) -> Self {
        let mut parts = Vec::with_capacity(extra.len() + 1);
        parts.push(PromptPart::Text {
            text: text.to_string(),
            synthetic: false,
        });
        parts.extend(extra);
        Self {
            message_id,
            agent,
            parts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSessionRequest {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertRequest {
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "partID", default, skip_serializing_if = "Option::is_none")]
    pub part_id: Option<String>,
}

/// Decision sent back for a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionReplyRequest {
    pub reply: PermissionReply,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_request_puts_text_first() {
        let req = PromptRequest::new(
            Some("msg_1".into()),
            "hi",
            Some("build".into()),
            vec![PromptPart::File {
                mime: "text/plain".into(),
                url: "file:///tmp/a.txt".into(),
                filename: None,
            }],
        );
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            json!({
                "messageID": "msg_1",
                "agent": "build",
                "parts": [
                    {"type": "text", "text": "hi"},
                    {"type": "file", "mime": "text/plain", "url": "file:///tmp/a.txt"}
                ]
            })
        );
    }

    #[test]
    fn permission_reply_is_snake_case() {
        let body = PermissionReplyRequest {
            reply: PermissionReply::Always,
            message: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"reply": "always"})
        );
    }
}
