//! HTTP + SSE bridge to an opencode-style server.
//!
//! Request/response calls go through `reqwest`; the push channel is
//! `GET /event` read with `reqwest-eventsource`. The library's own retry is
//! turned off so that reconnects (and the status transitions the engine
//! relies on) are driven from here with exponential backoff.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chatsync_protocol::{
    Agent, CreateSessionRequest, Event, MessageWithParts, Permission, PermissionReplyRequest,
    PromptRequest, RevertRequest, Session, SessionStatus, UpdateSessionRequest,
};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use reqwest_eventsource::{Event as SseEvent, EventSource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, ConnectionStatus, EventSubscription, StreamSignal};
use crate::config::SyncConfig;
use crate::error::{BridgeError, BridgeResult};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const MAX_ERROR_BODY_LEN: usize = 240;

#[derive(Debug, Clone)]
pub struct HttpBridgeConfig {
    pub base_url: String,
    /// Workspace directory sent as `?directory=` on every call
    pub directory: Option<String>,
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&SyncConfig> for HttpBridgeConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            base_url: config.server_url.clone(),
            directory: config.workspace.clone(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            initial_backoff: Duration::from_millis(config.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.reconnect_max_backoff_ms),
        }
    }
}

pub struct HttpBridge {
    client: Client,
    config: HttpBridgeConfig,
}

impl HttpBridge {
    pub fn new(mut config: HttpBridgeConfig) -> BridgeResult<Self> {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        let client = Client::builder()
            .build()
            .map_err(|err| BridgeError::Transport {
                path: config.base_url.clone(),
                message: err.to_string(),
            })?;
        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        directory: Option<&str>,
    ) -> RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match directory.or(self.config.directory.as_deref()) {
            Some(dir) => builder.query(&[("directory", dir)]),
            None => builder,
        }
    }

    fn get(&self, path: &str, directory: Option<&str>) -> RequestBuilder {
        self.request(reqwest::Method::GET, path, directory)
            .timeout(self.config.request_timeout)
    }

    async fn send_raw(&self, path: &str, builder: RequestBuilder) -> BridgeResult<String> {
        let response = builder
            .send()
            .await
            .map_err(|err| BridgeError::Transport {
                path: path.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|err| BridgeError::Transport {
            path: path.to_string(),
            message: format!("body read failed: {err}"),
        })?;
        if !status.is_success() {
            warn!(
                component = "http_bridge",
                event = "http_bridge.request.failed",
                path = %path,
                status = status.as_u16(),
                "Server returned an error status"
            );
            return Err(BridgeError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: sanitize_error_body(&body),
            });
        }
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        path: &str,
        builder: RequestBuilder,
    ) -> BridgeResult<T> {
        let body = self.send_raw(path, builder).await?;
        serde_json::from_str(&body).map_err(|err| BridgeError::Decode {
            path: path.to_string(),
            message: format!("{err}; body: {}", sanitize_error_body(&body)),
        })
    }

    async fn send_empty(&self, path: &str, builder: RequestBuilder) -> BridgeResult<()> {
        self.send_raw(path, builder).await.map(|_| ())
    }
}

#[async_trait]
impl Bridge for HttpBridge {
    async fn list_agents(&self) -> BridgeResult<Vec<Agent>> {
        let path = "/agent";
        self.send_json(path, self.get(path, None)).await
    }

    async fn list_sessions(&self, directory: Option<&str>) -> BridgeResult<Vec<Session>> {
        let path = "/session";
        self.send_json(path, self.get(path, directory)).await
    }

    async fn get_session(&self, session_id: &str) -> BridgeResult<Session> {
        let path = format!("/session/{session_id}");
        self.send_json(&path, self.get(&path, None)).await
    }

    async fn create_session(&self, request: CreateSessionRequest) -> BridgeResult<Session> {
        let path = "/session";
        let builder = self
            .request(reqwest::Method::POST, path, None)
            .timeout(self.config.request_timeout)
            .json(&request);
        self.send_json(path, builder).await
    }

    async fn update_session(
        &self,
        session_id: &str,
        request: UpdateSessionRequest,
    ) -> BridgeResult<Session> {
        let path = format!("/session/{session_id}");
        let builder = self
            .request(reqwest::Method::PATCH, &path, None)
            .timeout(self.config.request_timeout)
            .json(&request);
        self.send_json(&path, builder).await
    }

    async fn delete_session(&self, session_id: &str) -> BridgeResult<()> {
        let path = format!("/session/{session_id}");
        let builder = self
            .request(reqwest::Method::DELETE, &path, None)
            .timeout(self.config.request_timeout);
        self.send_empty(&path, builder).await
    }

    async fn list_messages(&self, session_id: &str) -> BridgeResult<Vec<MessageWithParts>> {
        let path = format!("/session/{session_id}/message");
        self.send_json(&path, self.get(&path, None)).await
    }

    async fn list_permissions(&self, directory: Option<&str>) -> BridgeResult<Vec<Permission>> {
        let path = "/permission";
        self.send_json(path, self.get(path, directory)).await
    }

    async fn session_status(
        &self,
        directory: Option<&str>,
    ) -> BridgeResult<HashMap<String, SessionStatus>> {
        let path = "/session/status";
        self.send_json(path, self.get(path, directory)).await
    }

    async fn revert(&self, session_id: &str, request: RevertRequest) -> BridgeResult<Session> {
        let path = format!("/session/{session_id}/revert");
        let builder = self
            .request(reqwest::Method::POST, &path, None)
            .timeout(self.config.request_timeout)
            .json(&request);
        self.send_json(&path, builder).await
    }

    async fn send_prompt(
        &self,
        session_id: &str,
        request: PromptRequest,
    ) -> BridgeResult<MessageWithParts> {
        // No timeout: the call returns when the assistant turn completes.
        let path = format!("/session/{session_id}/message");
        let builder = self
            .request(reqwest::Method::POST, &path, None)
            .json(&request);
        self.send_json(&path, builder).await
    }

    async fn respond_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        request: PermissionReplyRequest,
    ) -> BridgeResult<()> {
        let path = format!("/permission/{permission_id}/reply");
        debug!(
            component = "http_bridge",
            event = "http_bridge.permission.reply",
            session_id = %session_id,
            permission_id = %permission_id,
            "Replying to permission"
        );
        let builder = self
            .request(reqwest::Method::POST, &path, None)
            .timeout(self.config.request_timeout)
            .json(&request);
        self.send_empty(&path, builder).await
    }

    async fn abort_session(&self, session_id: &str) -> BridgeResult<()> {
        let path = format!("/session/{session_id}/abort");
        let builder = self
            .request(reqwest::Method::POST, &path, None)
            .timeout(self.config.request_timeout);
        self.send_empty(&path, builder).await
    }

    async fn subscribe_events(&self) -> BridgeResult<EventSubscription> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stream = EventStreamTask {
            builder: self.request(reqwest::Method::GET, "/event", None),
            initial_backoff: self.config.initial_backoff,
            max_backoff: self.config.max_backoff,
            tx,
        };
        let task = tokio::spawn(stream.run());
        Ok(EventSubscription::new(rx, Some(task)))
    }
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

struct EventStreamTask {
    builder: RequestBuilder,
    initial_backoff: Duration,
    max_backoff: Duration,
    tx: mpsc::Sender<StreamSignal>,
}

impl EventStreamTask {
    async fn run(self) {
        let mut attempt: u32 = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let status = if attempt == 0 {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Reconnecting { attempt }
            };
            if !self.signal(StreamSignal::Status(status)).await {
                return;
            }

            let Some(builder) = self.builder.try_clone() else {
                warn!(
                    component = "http_bridge",
                    event = "http_bridge.stream.unclonable",
                    "Event stream request cannot be reissued"
                );
                let _ = self.signal(StreamSignal::Status(ConnectionStatus::Closed)).await;
                return;
            };
            let mut source = match EventSource::new(builder) {
                Ok(source) => source,
                Err(err) => {
                    warn!(
                        component = "http_bridge",
                        event = "http_bridge.stream.open_failed",
                        error = %err,
                        "Could not open event stream"
                    );
                    let _ = self.signal(StreamSignal::Status(ConnectionStatus::Closed)).await;
                    return;
                }
            };
            source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

            while let Some(item) = source.next().await {
                match item {
                    Ok(SseEvent::Open) => {
                        info!(
                            component = "http_bridge",
                            event = "http_bridge.stream.open",
                            attempt = attempt,
                            "Event stream connected"
                        );
                        attempt = 0;
                        backoff = self.initial_backoff;
                        if !self.signal(StreamSignal::Status(ConnectionStatus::Connected)).await {
                            source.close();
                            return;
                        }
                    }
                    Ok(SseEvent::Message(message)) => match Event::parse(&message.data) {
                        Ok(Some(event)) => {
                            if !self.signal(StreamSignal::Event(event)).await {
                                source.close();
                                return;
                            }
                        }
                        Ok(None) => {
                            debug!(
                                component = "http_bridge",
                                event = "http_bridge.stream.skipped",
                                "Skipping unknown event type"
                            );
                        }
                        Err(err) => {
                            warn!(
                                component = "http_bridge",
                                event = "http_bridge.stream.decode_failed",
                                error = %err,
                                "Dropping undecodable event"
                            );
                        }
                    },
                    Err(err) => {
                        warn!(
                            component = "http_bridge",
                            event = "http_bridge.stream.error",
                            error = %err,
                            "Event stream interrupted"
                        );
                        break;
                    }
                }
            }
            source.close();

            attempt = attempt.saturating_add(1);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// False once the subscriber is gone.
    async fn signal(&self, signal: StreamSignal) -> bool {
        self.tx.send(signal).await.is_ok()
    }
}

fn sanitize_error_body(body: &str) -> String {
    let collapsed = body
        .chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if collapsed.chars().count() > MAX_ERROR_BODY_LEN {
        let truncated: String = collapsed.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{truncated}...")
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_whitespace_and_truncates() {
        assert_eq!(sanitize_error_body("a\n\tb   c"), "a b c");
        let long = "é".repeat(300);
        let sanitized = sanitize_error_body(&long);
        assert!(sanitized.ends_with("..."));
        assert_eq!(sanitized.chars().count(), MAX_ERROR_BODY_LEN + 3);
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let bridge = HttpBridge::new(HttpBridgeConfig {
            base_url: "http://127.0.0.1:1/".into(),
            directory: None,
            request_timeout: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
        })
        .unwrap();
        assert_eq!(bridge.url("/agent"), "http://127.0.0.1:1/agent");
    }
}
