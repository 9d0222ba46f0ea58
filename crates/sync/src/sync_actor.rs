//! Sync actor: owns the synchronized state and processes commands sequentially.
//!
//! One tokio task owns `SyncState`, the outbox, the event batcher and the
//! session cache. Callers talk to it through `SyncHandle`, which sends
//! `SyncCommand`s over an mpsc channel. Network calls run in spawned
//! tasks and report back as `TaskResult`s, so the loop never waits on
//! I/O. Lock-free reads go through `ArcSwap`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chatsync_protocol::{
    describe_error, CreateSessionRequest, Event, MessageWithParts, PermissionReply,
    PermissionReplyRequest, PromptPart, PromptRequest, RevertRequest, Role, Session,
    UpdateSessionRequest,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batcher::{BatchDecision, EventBatcher};
use crate::bootstrap::{
    fetch_bootstrap_data, fetch_session_data, BootstrapData, BootstrapKey, SessionData,
    SessionDataCache,
};
use crate::bridge::{Bridge, ConnectionStatus, EventSubscription, StreamSignal};
use crate::config::SyncConfig;
use crate::error::{BridgeResult, SyncError};
use crate::export::render_markdown;
use crate::identifier::{self, IdKind};
use crate::outbox::{Outbox, PendingPrompt, SubmitDecision};
use crate::store::{SyncSnapshot, SyncState, SyncStatus};
use crate::sync_command::{Reply, SubmitReceipt, SyncCommand};
use crate::transition::{is_aborted, transition_batch, Effect};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const IDLE_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Handle to the running sync engine (cheap to Clone).
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    snapshot: Arc<ArcSwap<SyncSnapshot>>,
    revision_rx: watch::Receiver<u64>,
    idle_tx: broadcast::Sender<String>,
}

impl SyncHandle {
    /// Spawn the engine on the current runtime. It subscribes to the
    /// bridge's event stream right away and bootstraps once connected.
    pub fn spawn(
        bridge: Arc<dyn Bridge>,
        config: SyncConfig,
        initial_session: Option<String>,
    ) -> SyncHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (revision_tx, revision_rx) = watch::channel(0);
        let (idle_tx, _) = broadcast::channel(IDLE_CHANNEL_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(SyncSnapshot::default()));

        let mut state = SyncState::new(config.context_limit_tokens);
        state.set_current_session(initial_session);

        let engine = SyncEngine {
            cache: SessionDataCache::new(
                config.session_cache_ttl(),
                config.session_cache_capacity,
            ),
            bridge,
            config,
            state,
            outbox: Outbox::new(),
            batcher: EventBatcher::new(),
            subscription: None,
            task_tx,
            inflight: HashMap::new(),
            next_fetch_id: 0,
            bootstrap_token: 0,
            switch_token: 0,
            sending: HashSet::new(),
            flush_at: None,
            watchdog_at: None,
            revision: 0,
            snapshot: snapshot.clone(),
            revision_tx,
            idle_tx: idle_tx.clone(),
            dirty: true,
        };
        tokio::spawn(engine.run(command_rx, task_rx));

        SyncHandle {
            command_tx,
            snapshot,
            revision_rx,
            idle_tx,
        }
    }

    /// Send a command to the engine (fire-and-forget).
    pub async fn send(&self, cmd: SyncCommand) {
        let name = cmd.name();
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "sync_actor",
                command = name,
                "Engine channel closed, command dropped"
            );
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SyncCommand,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| SyncError::EngineClosed)?;
        rx.await.map_err(|_| SyncError::EngineClosed)?
    }

    // -- Reads --

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SyncSnapshot> {
        self.snapshot.load_full()
    }

    /// Bumps after every published snapshot.
    pub fn subscribe_revisions(&self) -> watch::Receiver<u64> {
        self.revision_rx.clone()
    }

    /// Session ids as they go from working to idle.
    pub fn subscribe_idle(&self) -> broadcast::Receiver<String> {
        self.idle_tx.subscribe()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl Fn(&SyncSnapshot) -> bool,
    ) -> Result<Arc<SyncSnapshot>, SyncError> {
        let mut revisions = self.revision_rx.clone();
        loop {
            revisions.borrow_and_update();
            let snapshot = self.snapshot();
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
            revisions
                .changed()
                .await
                .map_err(|_| SyncError::EngineClosed)?;
        }
    }

    // -- Prompts --

    pub async fn submit(
        &self,
        text: impl Into<String>,
        agent: Option<String>,
        parts: Vec<PromptPart>,
    ) -> Result<SubmitReceipt, SyncError> {
        let text = text.into();
        self.request(|reply| SyncCommand::Submit {
            text,
            agent,
            parts,
            reply,
        })
        .await
    }

    /// Explicit queue action. Sends right away when the session is free.
    pub async fn queue(
        &self,
        text: impl Into<String>,
        agent: Option<String>,
        parts: Vec<PromptPart>,
    ) -> Result<SubmitReceipt, SyncError> {
        self.submit(text, agent, parts).await
    }

    pub async fn remove_queued(&self, queue_id: u64) -> Result<bool, SyncError> {
        self.request(|reply| SyncCommand::RemoveQueued { queue_id, reply })
            .await
    }

    pub async fn take_queued(&self, queue_id: u64) -> Result<Option<PendingPrompt>, SyncError> {
        self.request(|reply| SyncCommand::TakeQueued { queue_id, reply })
            .await
    }

    pub async fn cancel(&self) -> Result<(), SyncError> {
        self.request(|reply| SyncCommand::Cancel { reply }).await
    }

    pub async fn retry(&self, message_id: impl Into<String>) -> Result<SubmitReceipt, SyncError> {
        let message_id = message_id.into();
        self.request(|reply| SyncCommand::Retry { message_id, reply })
            .await
    }

    pub async fn edit_and_resubmit(
        &self,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<SubmitReceipt, SyncError> {
        let message_id = message_id.into();
        let text = text.into();
        self.request(|reply| SyncCommand::EditAndResubmit {
            message_id,
            text,
            reply,
        })
        .await
    }

    // -- Sessions --

    pub async fn switch_session(&self, session_id: Option<String>) -> Result<(), SyncError> {
        self.request(|reply| SyncCommand::SwitchSession { session_id, reply })
            .await
    }

    /// Create a session and make it current.
    pub async fn create_session(&self, title: Option<String>) -> Result<Session, SyncError> {
        self.request(|reply| SyncCommand::CreateSession { title, reply })
            .await
    }

    pub async fn delete_session(&self, session_id: impl Into<String>) -> Result<(), SyncError> {
        let session_id = session_id.into();
        self.request(|reply| SyncCommand::DeleteSession { session_id, reply })
            .await
    }

    pub async fn rename_session(
        &self,
        session_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Result<Session, SyncError> {
        let session_id = session_id.into();
        let title = title.into();
        self.request(|reply| SyncCommand::RenameSession {
            session_id,
            title,
            reply,
        })
        .await
    }

    pub async fn export_session(&self, session_id: impl Into<String>) -> Result<String, SyncError> {
        let session_id = session_id.into();
        self.request(|reply| SyncCommand::ExportSession { session_id, reply })
            .await
    }

    pub async fn dismiss_error(&self) {
        self.send(SyncCommand::DismissError).await;
    }

    // -- Permissions --

    pub async fn respond_permission(
        &self,
        permission_id: impl Into<String>,
        decision: PermissionReply,
        message: Option<String>,
    ) -> Result<(), SyncError> {
        let permission_id = permission_id.into();
        self.request(|reply| SyncCommand::RespondPermission {
            permission_id,
            decision,
            message,
            reply,
        })
        .await
    }

    // -- Connection --

    /// Bootstrap now, or join the bootstrap that is already running.
    pub async fn bootstrap(&self) -> Result<(), SyncError> {
        self.request(|reply| SyncCommand::Bootstrap { reply }).await
    }

    pub async fn reconnect(&self) {
        self.send(SyncCommand::Reconnect).await;
    }

    pub async fn shutdown(&self) {
        self.send(SyncCommand::Shutdown).await;
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Results of spawned network calls, fed back into the loop.
enum TaskResult {
    Bootstrapped {
        key: BootstrapKey,
        fetch_id: u64,
        result: BridgeResult<BootstrapData>,
    },
    SessionLoaded {
        fetch_id: u64,
        data: SessionData,
    },
    PromptSent {
        session_id: String,
        message_id: String,
        result: BridgeResult<MessageWithParts>,
    },
    SessionCreated {
        result: BridgeResult<Session>,
        then: AfterCreate,
    },
    SessionDeleted {
        session_id: String,
        result: BridgeResult<()>,
        reply: Reply<()>,
    },
    SessionRenamed {
        result: BridgeResult<Session>,
        reply: Reply<Session>,
    },
    PermissionReplied {
        session_id: String,
        permission_id: String,
        result: BridgeResult<()>,
        reply: Reply<()>,
    },
    Aborted {
        session_id: String,
        result: BridgeResult<()>,
        reply: Reply<()>,
    },
    Reverted {
        session_id: String,
        message_id: String,
        prompt: PendingPrompt,
        result: BridgeResult<Session>,
        reply: Reply<SubmitReceipt>,
    },
}

enum AfterCreate {
    Reply(Reply<Session>),
    Submit {
        prompt: PendingPrompt,
        reply: Reply<SubmitReceipt>,
    },
}

/// A bootstrap or session fetch that callers are waiting on.
struct Inflight {
    fetch_id: u64,
    token: u64,
    waiters: Vec<Reply<()>>,
}

struct SyncEngine {
    bridge: Arc<dyn Bridge>,
    config: SyncConfig,
    state: SyncState,
    outbox: Outbox,
    batcher: EventBatcher,
    cache: SessionDataCache,
    subscription: Option<EventSubscription>,
    task_tx: mpsc::UnboundedSender<TaskResult>,

    inflight: HashMap<BootstrapKey, Inflight>,
    next_fetch_id: u64,
    bootstrap_token: u64,
    switch_token: u64,
    /// Message ids whose send-prompt call has not returned yet.
    sending: HashSet<String>,

    flush_at: Option<Instant>,
    watchdog_at: Option<Instant>,

    revision: u64,
    snapshot: Arc<ArcSwap<SyncSnapshot>>,
    revision_tx: watch::Sender<u64>,
    idle_tx: broadcast::Sender<String>,
    dirty: bool,
}

impl SyncEngine {
    async fn run(
        mut self,
        mut command_rx: mpsc::Receiver<SyncCommand>,
        mut task_rx: mpsc::UnboundedReceiver<TaskResult>,
    ) {
        info!(
            component = "sync_actor",
            event = "sync.started",
            workspace = ?self.config.workspace,
            current_session = ?self.state.current_session_id,
        );
        self.subscribe().await;
        self.publish();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => match cmd {
                    None | Some(SyncCommand::Shutdown) => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(result) = task_rx.recv() => self.handle_task_result(result),
                signal = next_signal(&mut self.subscription) => self.handle_signal(signal),
                _ = sleep_until_opt(self.flush_at) => self.on_flush_deadline(),
                _ = sleep_until_opt(self.watchdog_at) => self.on_watchdog().await,
            }
            if self.dirty {
                self.publish();
            }
        }

        self.subscription = None;
        self.state.status = SyncStatus::Disconnected;
        self.publish();
        info!(component = "sync_actor", event = "sync.stopped");
    }

    fn publish(&mut self) {
        self.dirty = false;
        self.revision += 1;
        let current = self.state.current_session_id.as_deref();
        let queued = current
            .map(|id| self.outbox.queued(id))
            .unwrap_or_default();
        let in_flight = current
            .and_then(|id| self.outbox.in_flight(id))
            .map(str::to_string);
        let snapshot = self.state.snapshot(self.revision, queued, in_flight);
        self.snapshot.store(Arc::new(snapshot));
        self.revision_tx.send_replace(self.revision);
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let tx = self.task_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(task.await);
        });
    }

    fn set_status(&mut self, status: SyncStatus) {
        // While loading, held events are flushed by `finish_bootstrapping` only.
        if status.is_bootstrapping() {
            self.flush_at = None;
        }
        if self.state.status != status {
            info!(
                component = "sync_actor",
                event = "sync.status",
                from = %self.state.status.label(),
                to = %status.label(),
            );
            self.state.status = status;
            self.dirty = true;
        }
    }

    // -- Connection --

    async fn subscribe(&mut self) {
        self.set_status(SyncStatus::Connecting);
        self.watchdog_at = Some(Instant::now() + self.config.connection_timeout());
        match self.bridge.subscribe_events().await {
            Ok(subscription) => self.subscription = Some(subscription),
            Err(err) => {
                warn!(
                    component = "sync_actor",
                    event = "sync.subscribe.failed",
                    error = %err,
                );
                self.watchdog_at = None;
                self.set_status(SyncStatus::Error {
                    message: err.user_message(),
                });
            }
        }
    }

    async fn reconnect(&mut self) {
        info!(component = "sync_actor", event = "sync.reconnect");
        self.subscription = None;
        self.watchdog_at = None;
        self.subscribe().await;
    }

    async fn on_watchdog(&mut self) {
        self.watchdog_at = None;
        if self.state.status == SyncStatus::Connecting {
            warn!(
                component = "sync_actor",
                event = "sync.connect.timeout",
                timeout_ms = self.config.connection_timeout_ms,
            );
            self.reconnect().await;
        }
    }

    fn handle_signal(&mut self, signal: Option<StreamSignal>) {
        match signal {
            None => {
                warn!(component = "sync_actor", event = "sync.stream.ended");
                self.subscription = None;
                self.watchdog_at = None;
                self.set_status(SyncStatus::Disconnected);
            }
            Some(StreamSignal::Status(status)) => self.on_connection_status(status),
            Some(StreamSignal::Event(event)) => self.on_event(event),
        }
    }

    fn on_connection_status(&mut self, status: ConnectionStatus) {
        match status {
            ConnectionStatus::Connecting => {
                self.set_status(SyncStatus::Connecting);
                self.watchdog_at = Some(Instant::now() + self.config.connection_timeout());
            }
            // Connected is only shown once fresh data is in.
            ConnectionStatus::Connected => {
                self.watchdog_at = None;
                self.start_bootstrap(None, true);
            }
            ConnectionStatus::Reconnecting { attempt } => {
                self.watchdog_at = None;
                self.set_status(SyncStatus::Reconnecting { attempt });
            }
            ConnectionStatus::Closed => {
                self.watchdog_at = None;
                self.set_status(SyncStatus::Disconnected);
            }
        }
    }

    // -- Events --

    fn on_event(&mut self, event: Event) {
        let disposed = matches!(event, Event::InstanceDisposed { .. });
        let decision = self
            .batcher
            .push(event, self.state.status.is_bootstrapping());
        if decision == BatchDecision::HoldForBootstrap {
            return;
        }
        if disposed {
            self.flush_now();
            return;
        }
        if decision == BatchDecision::ScheduleFlush {
            self.flush_at = Some(Instant::now() + self.config.event_batch());
        }
    }

    fn on_flush_deadline(&mut self) {
        self.flush_at = None;
        if !self.state.status.is_bootstrapping() {
            self.flush_now();
        }
    }

    fn flush_now(&mut self) {
        self.flush_at = None;
        let events = self.batcher.drain();
        if events.is_empty() {
            return;
        }
        debug!(
            component = "sync_actor",
            event = "sync.flush",
            count = events.len(),
        );
        let (state, effects) = transition_batch(std::mem::take(&mut self.state), events);
        self.state = state;
        self.dirty = true;
        for effect in effects {
            self.apply_effect(effect);
        }
    }

    fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::SessionIdle(session_id) => {
                let _ = self.idle_tx.send(session_id.clone());
                if let Some(next) = self.outbox.on_idle(&session_id) {
                    self.dispatch(&session_id, next);
                }
            }
            Effect::InvalidateSessionCache(session_id) => self.cache.invalidate(&session_id),
            Effect::SessionRemoved(session_id) => {
                self.outbox.forget(&session_id);
                self.cache.invalidate(&session_id);
            }
            Effect::Rebootstrap => {
                info!(component = "sync_actor", event = "sync.instance_disposed");
                self.cache.clear();
                self.start_bootstrap(None, true);
            }
        }
    }

    // -- Bootstrap --

    fn next_fetch_id(&mut self) -> u64 {
        self.next_fetch_id += 1;
        self.next_fetch_id
    }

    /// Workspace bootstrap for the current session. Joins an identical
    /// one already running unless `force`, which starts over and carries
    /// its waiters along.
    fn start_bootstrap(&mut self, waiter: Option<Reply<()>>, force: bool) {
        let key = BootstrapKey::Workspace(self.state.current_session_id.clone());
        if !force {
            if let Some(entry) = self.inflight.get_mut(&key) {
                entry.waiters.extend(waiter);
                debug!(
                    component = "sync_actor",
                    event = "sync.bootstrap.joined",
                    waiters = entry.waiters.len(),
                );
                return;
            }
        }

        self.bootstrap_token += 1;
        let fetch_id = self.next_fetch_id();
        let mut waiters = self
            .inflight
            .remove(&key)
            .map(|entry| entry.waiters)
            .unwrap_or_default();
        waiters.extend(waiter);
        self.inflight.insert(
            key.clone(),
            Inflight {
                fetch_id,
                token: self.bootstrap_token,
                waiters,
            },
        );
        self.set_status(SyncStatus::Bootstrapping);
        info!(
            component = "sync_actor",
            event = "sync.bootstrap.started",
            token = self.bootstrap_token,
            session_id = ?self.state.current_session_id,
        );

        let bridge = self.bridge.clone();
        let workspace = self.config.workspace.clone();
        let hidden = self.config.hidden_agents.clone();
        let session_id = self.state.current_session_id.clone();
        let limit = self.config.context_limit_tokens;
        self.spawn_task(async move {
            let result = fetch_bootstrap_data(
                bridge.as_ref(),
                workspace.as_deref(),
                &hidden,
                session_id.as_deref(),
                limit,
            )
            .await;
            TaskResult::Bootstrapped {
                key,
                fetch_id,
                result,
            }
        });
    }

    fn on_bootstrapped(
        &mut self,
        key: BootstrapKey,
        fetch_id: u64,
        result: BridgeResult<BootstrapData>,
    ) {
        if self.inflight.get(&key).map(|e| e.fetch_id) != Some(fetch_id) {
            debug!(
                component = "sync_actor",
                event = "sync.bootstrap.superseded",
                fetch_id,
            );
            return;
        }
        let Some(entry) = self.inflight.remove(&key) else {
            return;
        };

        if entry.token != self.bootstrap_token {
            debug!(
                component = "sync_actor",
                event = "sync.bootstrap.stale",
                token = entry.token,
                latest = self.bootstrap_token,
            );
            self.hand_over_waiters(entry.waiters);
            self.finish_bootstrapping();
            return;
        }

        match result {
            Ok(data) => {
                self.state.commit_global(data.global);
                if let Some(session) = data.session {
                    self.cache.insert(session.clone());
                    if self.state.is_current(&session.session_id) {
                        self.state.commit_session(session);
                    } else {
                        debug!(
                            component = "sync_actor",
                            event = "sync.bootstrap.session_stale",
                            session_id = %session.session_id,
                        );
                    }
                }
                self.reconcile_outbox();
                info!(
                    component = "sync_actor",
                    event = "sync.bootstrap.completed",
                    sessions = self.state.sessions().len(),
                    agents = self.state.agents.len(),
                );
                for waiter in entry.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(err) => {
                let message = err.user_message();
                warn!(
                    component = "sync_actor",
                    event = "sync.bootstrap.failed",
                    error = %err,
                );
                self.set_status(SyncStatus::Error {
                    message: message.clone(),
                });
                for waiter in entry.waiters {
                    let _ = waiter.send(Err(SyncError::Bootstrap(message.clone())));
                }
            }
        }
        self.dirty = true;
        self.finish_bootstrapping();
    }

    /// Waiters of a superseded bootstrap wait for the newest one instead.
    fn hand_over_waiters(&mut self, waiters: Vec<Reply<()>>) {
        let token = self.bootstrap_token;
        let latest = self.inflight.iter_mut().find(|(key, entry)| {
            matches!(key, BootstrapKey::Workspace(_)) && entry.token == token
        });
        match latest {
            Some((_, entry)) => entry.waiters.extend(waiters),
            None => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    /// Prompts whose session the server reports idle (or no longer
    /// knows) and whose send call has returned missed their idle event.
    fn reconcile_outbox(&mut self) {
        for (session_id, message_id) in self.outbox.all_in_flight() {
            if self.sending.contains(&message_id) {
                continue;
            }
            let idle = self
                .state
                .session_status(&session_id)
                .map_or(true, |status| status.is_idle());
            if idle {
                debug!(
                    component = "sync_actor",
                    event = "sync.outbox.reconciled",
                    session_id = %session_id,
                    message_id = %message_id,
                );
                if let Some(next) = self.outbox.on_idle(&session_id) {
                    self.dispatch(&session_id, next);
                }
            }
        }
    }

    /// Once nothing is loading, show Connected and apply held events.
    fn finish_bootstrapping(&mut self) {
        if !self.inflight.is_empty() {
            return;
        }
        if self.state.status.is_bootstrapping() {
            self.set_status(SyncStatus::Connected);
        }
        self.flush_now();
    }

    // -- Session switch --

    fn switch_session(&mut self, target: Option<String>, reply: Reply<()>) {
        if self.state.current_session_id == target {
            let _ = reply.send(Ok(()));
            return;
        }
        let Some(session_id) = target else {
            self.switch_token += 1;
            self.state.set_current_session(None);
            self.dirty = true;
            let _ = reply.send(Ok(()));
            return;
        };
        if self.state.status == SyncStatus::Connected && self.state.session(&session_id).is_none()
        {
            let _ = reply.send(Err(SyncError::SessionNotFound(session_id)));
            return;
        }

        self.switch_token += 1;
        let token = self.switch_token;
        self.state.set_current_session(Some(session_id.clone()));
        self.dirty = true;
        info!(
            component = "sync_actor",
            event = "sync.session.switch",
            session_id = %session_id,
            token,
        );

        if let Some(data) = self.cache.get(&session_id) {
            debug!(
                component = "sync_actor",
                event = "sync.session.cache_hit",
                session_id = %session_id,
            );
            self.state.commit_session(data);
            let _ = reply.send(Ok(()));
            return;
        }

        let key = BootstrapKey::Session(session_id.clone());
        if let Some(entry) = self.inflight.get_mut(&key) {
            entry.token = token;
            entry.waiters.push(reply);
            return;
        }

        let fetch_id = self.next_fetch_id();
        self.inflight.insert(
            key,
            Inflight {
                fetch_id,
                token,
                waiters: vec![reply],
            },
        );
        if self.state.status == SyncStatus::Connected {
            self.set_status(SyncStatus::Bootstrapping);
        }

        let mut family = vec![session_id.clone()];
        family.extend(self.state.child_session_ids(&session_id));
        let bridge = self.bridge.clone();
        let limit = self.config.context_limit_tokens;
        self.spawn_task(async move {
            let data = fetch_session_data(bridge.as_ref(), &session_id, &family, limit).await;
            TaskResult::SessionLoaded { fetch_id, data }
        });
    }

    fn on_session_loaded(&mut self, fetch_id: u64, data: SessionData) {
        let key = BootstrapKey::Session(data.session_id.clone());
        if self.inflight.get(&key).map(|e| e.fetch_id) != Some(fetch_id) {
            return;
        }
        let Some(entry) = self.inflight.remove(&key) else {
            return;
        };

        self.cache.insert(data.clone());
        if entry.token == self.switch_token && self.state.is_current(&data.session_id) {
            self.state.commit_session(data);
            self.dirty = true;
        } else {
            debug!(
                component = "sync_actor",
                event = "sync.session.stale",
                session_id = %data.session_id,
                token = entry.token,
                latest = self.switch_token,
            );
        }
        for waiter in entry.waiters {
            let _ = waiter.send(Ok(()));
        }
        self.finish_bootstrapping();
    }

    /// Make a session the server just created current. It has no history
    /// yet, so nothing is fetched.
    fn activate_new_session(&mut self, session: Session) {
        let session_id = session.id.clone();
        self.switch_token += 1;
        self.state.upsert_session(session.clone());
        self.state.set_current_session(Some(session_id.clone()));
        let mut data = SessionData::empty(&session_id);
        data.session = Some(session);
        self.state.commit_session(data);
        self.dirty = true;
    }

    // -- Outbox --

    fn current_session(&self) -> Result<String, SyncError> {
        self.state
            .current_session_id
            .clone()
            .ok_or(SyncError::NoActiveSession)
    }

    fn submit(&mut self, prompt: PendingPrompt, reply: Reply<SubmitReceipt>) {
        if prompt.text.trim().is_empty() && prompt.parts.is_empty() {
            let _ = reply.send(Err(SyncError::EmptyPrompt));
            return;
        }
        let Some(session_id) = self.state.current_session_id.clone() else {
            let bridge = self.bridge.clone();
            self.spawn_task(async move {
                let result = bridge.create_session(CreateSessionRequest::default()).await;
                TaskResult::SessionCreated {
                    result,
                    then: AfterCreate::Submit { prompt, reply },
                }
            });
            return;
        };
        let receipt = self.submit_to(&session_id, prompt);
        let _ = reply.send(Ok(receipt));
    }

    fn submit_to(&mut self, session_id: &str, prompt: PendingPrompt) -> SubmitReceipt {
        match self.outbox.submit(session_id, prompt) {
            SubmitDecision::Dispatch(prompt) => SubmitReceipt::Sent {
                message_id: self.dispatch(session_id, prompt),
            },
            SubmitDecision::Queued { queue_id, position } => {
                info!(
                    component = "sync_actor",
                    event = "sync.prompt.queued",
                    session_id = %session_id,
                    queue_id,
                    position,
                );
                self.dirty = true;
                SubmitReceipt::Queued { queue_id, position }
            }
        }
    }

    /// Send a prompt under a fresh id that sorts after everything the
    /// session already has.
    fn dispatch(&mut self, session_id: &str, prompt: PendingPrompt) -> String {
        let message_id = identifier::ascending_after(
            IdKind::Message,
            self.state.latest_message_id(session_id),
        );
        self.outbox.begin_dispatch(session_id, &message_id);
        self.sending.insert(message_id.clone());
        self.state.set_thinking(session_id, true);
        self.state.set_session_error(session_id, None);
        self.dirty = true;
        info!(
            component = "sync_actor",
            event = "sync.prompt.dispatch",
            session_id = %session_id,
            message_id = %message_id,
        );

        let request = PromptRequest::new(
            Some(message_id.clone()),
            &prompt.text,
            prompt.agent,
            prompt.parts,
        );
        let bridge = self.bridge.clone();
        let sid = session_id.to_string();
        let mid = message_id.clone();
        self.spawn_task(async move {
            let result = bridge.send_prompt(&sid, request).await;
            TaskResult::PromptSent {
                session_id: sid,
                message_id: mid,
                result,
            }
        });
        message_id
    }

    fn on_prompt_sent(
        &mut self,
        session_id: String,
        message_id: String,
        result: BridgeResult<MessageWithParts>,
    ) {
        self.sending.remove(&message_id);
        match result {
            Ok(reply) => {
                match &reply.info.error {
                    Some(error) if is_aborted(error) => {
                        debug!(
                            component = "sync_actor",
                            event = "sync.prompt.aborted",
                            session_id = %session_id,
                        );
                    }
                    Some(error) => {
                        let message = describe_error(error);
                        self.fail_dispatch(&session_id, &message_id, message);
                    }
                    None => {}
                }
                if self.state.is_tracked(&session_id) {
                    let assistant = reply.info.role == Role::Assistant;
                    self.state.upsert_message(reply.info);
                    for part in reply.parts {
                        self.state.upsert_part(part);
                    }
                    if assistant && self.state.is_current(&session_id) {
                        self.state.recompute_context_info();
                    }
                    self.dirty = true;
                }
                self.cache.invalidate(&session_id);
            }
            Err(err) => self.fail_dispatch(&session_id, &message_id, err.user_message()),
        }
    }

    /// Surface a failed send on the session. When it was the in-flight
    /// prompt the queue behind it is dropped.
    fn fail_dispatch(&mut self, session_id: &str, message_id: &str, message: String) {
        let in_flight = self.outbox.in_flight(session_id) == Some(message_id);
        let dropped = self.outbox.on_dispatch_failed(session_id, message_id);
        if in_flight {
            self.state.set_thinking(session_id, false);
        }
        warn!(
            component = "sync_actor",
            event = "sync.prompt.failed",
            session_id = %session_id,
            message_id = %message_id,
            dropped,
            error = %message,
        );
        self.state.set_session_error(session_id, Some(message));
        self.dirty = true;
    }

    fn revert_and_submit(
        &mut self,
        session_id: String,
        message_id: String,
        prompt: PendingPrompt,
        reply: Reply<SubmitReceipt>,
    ) {
        info!(
            component = "sync_actor",
            event = "sync.session.revert",
            session_id = %session_id,
            message_id = %message_id,
        );
        let bridge = self.bridge.clone();
        self.spawn_task(async move {
            let request = RevertRequest {
                message_id: message_id.clone(),
                part_id: None,
            };
            let result = bridge.revert(&session_id, request).await;
            TaskResult::Reverted {
                session_id,
                message_id,
                prompt,
                result,
                reply,
            }
        });
    }

    fn retry(&mut self, message_id: String, reply: Reply<SubmitReceipt>) {
        let session_id = match self.current_session() {
            Ok(id) => id,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if self.outbox.is_busy(&session_id) {
            let _ = reply.send(Err(SyncError::SessionBusy(session_id)));
            return;
        }
        let messages = self.state.messages(&session_id);
        let source = messages
            .iter()
            .position(|m| m.info.id == message_id)
            .and_then(|idx| {
                messages[..=idx]
                    .iter()
                    .rev()
                    .find(|m| m.info.role == Role::User)
            });
        let Some(source) = source else {
            let _ = reply.send(Err(SyncError::MessageNotFound(message_id)));
            return;
        };
        let prompt = PendingPrompt {
            text: source.text.clone(),
            agent: source.info.agent.clone(),
            parts: Vec::new(),
        };
        let target = source.info.id.clone();
        self.revert_and_submit(session_id, target, prompt, reply);
    }

    fn edit_and_resubmit(&mut self, message_id: String, text: String, reply: Reply<SubmitReceipt>) {
        let session_id = match self.current_session() {
            Ok(id) => id,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if text.trim().is_empty() {
            let _ = reply.send(Err(SyncError::EmptyPrompt));
            return;
        }
        if self.outbox.is_busy(&session_id) {
            let _ = reply.send(Err(SyncError::SessionBusy(session_id)));
            return;
        }
        let agent = match self.state.message(&session_id, &message_id) {
            Some(entry) if entry.info.role == Role::User => entry.info.agent.clone(),
            _ => {
                let _ = reply.send(Err(SyncError::MessageNotFound(message_id)));
                return;
            }
        };
        let prompt = PendingPrompt {
            text,
            agent,
            parts: Vec::new(),
        };
        self.revert_and_submit(session_id, message_id, prompt, reply);
    }

    // -- Commands --

    async fn handle_command(&mut self, cmd: SyncCommand) {
        debug!(
            component = "sync_actor",
            event = "sync.command",
            command = cmd.name(),
        );
        match cmd {
            SyncCommand::Submit {
                text,
                agent,
                parts,
                reply,
            } => self.submit(PendingPrompt { text, agent, parts }, reply),

            SyncCommand::RemoveQueued { queue_id, reply } => {
                let result = self.current_session().map(|id| {
                    let removed = self.outbox.remove_queued(&id, queue_id);
                    self.dirty |= removed;
                    removed
                });
                let _ = reply.send(result);
            }

            SyncCommand::TakeQueued { queue_id, reply } => {
                let result = self.current_session().map(|id| {
                    let taken = self.outbox.take_queued(&id, queue_id);
                    self.dirty |= taken.is_some();
                    taken
                });
                let _ = reply.send(result);
            }

            SyncCommand::Cancel { reply } => {
                let session_id = match self.current_session() {
                    Ok(id) => id,
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        return;
                    }
                };
                let dropped = self.outbox.clear_queue(&session_id);
                self.dirty = true;
                info!(
                    component = "sync_actor",
                    event = "sync.prompt.cancel",
                    session_id = %session_id,
                    dropped,
                );
                let bridge = self.bridge.clone();
                self.spawn_task(async move {
                    let result = bridge.abort_session(&session_id).await;
                    TaskResult::Aborted {
                        session_id,
                        result,
                        reply,
                    }
                });
            }

            SyncCommand::Retry { message_id, reply } => self.retry(message_id, reply),

            SyncCommand::EditAndResubmit {
                message_id,
                text,
                reply,
            } => self.edit_and_resubmit(message_id, text, reply),

            SyncCommand::SwitchSession { session_id, reply } => {
                self.switch_session(session_id, reply)
            }

            SyncCommand::CreateSession { title, reply } => {
                let bridge = self.bridge.clone();
                self.spawn_task(async move {
                    let request = CreateSessionRequest {
                        title,
                        parent_id: None,
                    };
                    let result = bridge.create_session(request).await;
                    TaskResult::SessionCreated {
                        result,
                        then: AfterCreate::Reply(reply),
                    }
                });
            }

            SyncCommand::DeleteSession { session_id, reply } => {
                let bridge = self.bridge.clone();
                self.spawn_task(async move {
                    let result = bridge.delete_session(&session_id).await;
                    TaskResult::SessionDeleted {
                        session_id,
                        result,
                        reply,
                    }
                });
            }

            SyncCommand::RenameSession {
                session_id,
                title,
                reply,
            } => {
                let bridge = self.bridge.clone();
                self.spawn_task(async move {
                    let request = UpdateSessionRequest {
                        title: title.trim().to_string(),
                    };
                    let result = bridge.update_session(&session_id, request).await;
                    TaskResult::SessionRenamed { result, reply }
                });
            }

            SyncCommand::ExportSession { session_id, reply } => {
                let bridge = self.bridge.clone();
                tokio::spawn(async move {
                    let _ = reply.send(export_transcript(bridge, session_id).await);
                });
            }

            SyncCommand::DismissError => {
                if let Some(id) = self.state.current_session_id.clone() {
                    self.state.set_session_error(&id, None);
                    self.dirty = true;
                }
            }

            SyncCommand::RespondPermission {
                permission_id,
                decision,
                message,
                reply,
            } => {
                let Some(session_id) = self
                    .state
                    .find_permission(&permission_id)
                    .map(|p| p.session_id.clone())
                else {
                    let _ = reply.send(Err(SyncError::PermissionNotFound(permission_id)));
                    return;
                };
                let bridge = self.bridge.clone();
                self.spawn_task(async move {
                    let request = PermissionReplyRequest {
                        reply: decision,
                        message,
                    };
                    let result = bridge
                        .respond_permission(&session_id, &permission_id, request)
                        .await;
                    TaskResult::PermissionReplied {
                        session_id,
                        permission_id,
                        result,
                        reply,
                    }
                });
            }

            SyncCommand::Bootstrap { reply } => self.start_bootstrap(Some(reply), false),

            SyncCommand::Reconnect => self.reconnect().await,

            // Handled by the loop.
            SyncCommand::Shutdown => {}
        }
    }

    fn handle_task_result(&mut self, result: TaskResult) {
        match result {
            TaskResult::Bootstrapped {
                key,
                fetch_id,
                result,
            } => self.on_bootstrapped(key, fetch_id, result),

            TaskResult::SessionLoaded { fetch_id, data } => self.on_session_loaded(fetch_id, data),

            TaskResult::PromptSent {
                session_id,
                message_id,
                result,
            } => self.on_prompt_sent(session_id, message_id, result),

            TaskResult::SessionCreated { result, then } => match result {
                Ok(session) => {
                    info!(
                        component = "sync_actor",
                        event = "sync.session.created",
                        session_id = %session.id,
                    );
                    let session_id = session.id.clone();
                    self.activate_new_session(session.clone());
                    match then {
                        AfterCreate::Reply(reply) => {
                            let _ = reply.send(Ok(session));
                        }
                        AfterCreate::Submit { prompt, reply } => {
                            let receipt = self.submit_to(&session_id, prompt);
                            let _ = reply.send(Ok(receipt));
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        component = "sync_actor",
                        event = "sync.session.create_failed",
                        error = %err,
                    );
                    match then {
                        AfterCreate::Reply(reply) => {
                            let _ = reply.send(Err(err.into()));
                        }
                        AfterCreate::Submit { reply, .. } => {
                            let _ = reply.send(Err(err.into()));
                        }
                    }
                }
            },

            TaskResult::SessionDeleted {
                session_id,
                result,
                reply,
            } => {
                if result.is_ok() {
                    if self.state.is_current(&session_id) {
                        self.switch_token += 1;
                    }
                    self.state.remove_session(&session_id);
                    self.outbox.forget(&session_id);
                    self.cache.invalidate(&session_id);
                    self.dirty = true;
                    info!(
                        component = "sync_actor",
                        event = "sync.session.deleted",
                        session_id = %session_id,
                    );
                }
                let _ = reply.send(result.map_err(SyncError::from));
            }

            TaskResult::SessionRenamed { result, reply } => {
                if let Ok(session) = &result {
                    let current = self.state.is_current(&session.id);
                    self.state.upsert_session(session.clone());
                    if current {
                        self.state.recompute_file_changes();
                    }
                    self.dirty = true;
                }
                let _ = reply.send(result.map_err(SyncError::from));
            }

            TaskResult::PermissionReplied {
                session_id,
                permission_id,
                result,
                reply,
            } => {
                match &result {
                    Ok(()) => {
                        self.state.remove_permission(&session_id, &permission_id);
                        let root = self.state.root_session_id(&session_id).to_string();
                        self.cache.invalidate(&root);
                    }
                    Err(err) => {
                        warn!(
                            component = "sync_actor",
                            event = "sync.permission.reply_failed",
                            permission_id = %permission_id,
                            error = %err,
                        );
                        let target = self
                            .state
                            .current_session_id
                            .clone()
                            .unwrap_or(session_id);
                        self.state
                            .set_session_error(&target, Some(err.user_message()));
                    }
                }
                self.dirty = true;
                let _ = reply.send(result.map_err(SyncError::from));
            }

            TaskResult::Aborted {
                session_id,
                result,
                reply,
            } => {
                if let Err(err) = &result {
                    warn!(
                        component = "sync_actor",
                        event = "sync.prompt.abort_failed",
                        session_id = %session_id,
                        error = %err,
                    );
                    self.state
                        .set_session_error(&session_id, Some(err.user_message()));
                    self.dirty = true;
                }
                let _ = reply.send(result.map_err(SyncError::from));
            }

            TaskResult::Reverted {
                session_id,
                message_id,
                prompt,
                result,
                reply,
            } => match result {
                Ok(session) => {
                    self.state.upsert_session(session);
                    self.state.truncate_messages_from(&session_id, &message_id);
                    if self.state.is_current(&session_id) {
                        self.state.recompute_context_info();
                    }
                    self.cache.invalidate(&session_id);
                    self.dirty = true;
                    let receipt = self.submit_to(&session_id, prompt);
                    let _ = reply.send(Ok(receipt));
                }
                Err(err) => {
                    warn!(
                        component = "sync_actor",
                        event = "sync.session.revert_failed",
                        session_id = %session_id,
                        error = %err,
                    );
                    self.state
                        .set_session_error(&session_id, Some(err.user_message()));
                    self.dirty = true;
                    let _ = reply.send(Err(err.into()));
                }
            },
        }
    }
}

async fn export_transcript(bridge: Arc<dyn Bridge>, session_id: String) -> Result<String, SyncError> {
    let (session, messages) = tokio::try_join!(
        bridge.get_session(&session_id),
        bridge.list_messages(&session_id),
    )?;
    Ok(render_markdown(&session, &messages))
}

async fn next_signal(subscription: &mut Option<EventSubscription>) -> Option<StreamSignal> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
