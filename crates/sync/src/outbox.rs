//! Outbox: at most one prompt in flight per session.
//!
//! Pure bookkeeping. The engine asks the outbox what to do with a
//! submission and tells it when a dispatch starts, fails, or the session
//! goes idle. Message ids are not chosen here; a queued prompt gets its id
//! only when it is actually dispatched.

use std::collections::{HashMap, VecDeque};

use chatsync_protocol::PromptPart;
use serde::Serialize;

/// A user prompt that has not been sent yet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingPrompt {
    pub text: String,
    pub agent: Option<String>,
    pub parts: Vec<PromptPart>,
}

impl PendingPrompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            agent: None,
            parts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedPrompt {
    pub queue_id: u64,
    pub prompt: PendingPrompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitDecision {
    /// Nothing in flight: send now.
    Dispatch(PendingPrompt),
    /// Parked behind the in-flight prompt. `position` is 1-based.
    Queued { queue_id: u64, position: usize },
}

#[derive(Debug, Default)]
struct SessionOutbox {
    in_flight: Option<InFlight>,
    queue: VecDeque<QueuedPrompt>,
}

#[derive(Debug, Default)]
pub struct Outbox {
    sessions: HashMap<String, SessionOutbox>,
    next_queue_id: u64,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch when the session is free, queue otherwise. A non-empty
    /// queue also means "busy" so queued prompts keep their order.
    pub fn submit(&mut self, session_id: &str, prompt: PendingPrompt) -> SubmitDecision {
        let entry = self.sessions.entry(session_id.to_string()).or_default();
        if entry.in_flight.is_none() && entry.queue.is_empty() {
            return SubmitDecision::Dispatch(prompt);
        }
        self.next_queue_id += 1;
        let queue_id = self.next_queue_id;
        entry.queue.push_back(QueuedPrompt { queue_id, prompt });
        SubmitDecision::Queued {
            queue_id,
            position: entry.queue.len(),
        }
    }

    /// Record that a prompt with `message_id` is being sent.
    pub fn begin_dispatch(&mut self, session_id: &str, message_id: &str) {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .in_flight = Some(InFlight {
            message_id: message_id.to_string(),
        });
    }

    /// The session went idle. Clears the in-flight marker and hands back
    /// the next queued prompt. Without an in-flight prompt this is a no-op.
    pub fn on_idle(&mut self, session_id: &str) -> Option<PendingPrompt> {
        let entry = self.sessions.get_mut(session_id)?;
        entry.in_flight.take()?;
        entry.queue.pop_front().map(|q| q.prompt)
    }

    /// A dispatch failed. When it is the in-flight one, the marker clears
    /// and the whole queue is dropped. Returns how many queued prompts
    /// were dropped.
    pub fn on_dispatch_failed(&mut self, session_id: &str, message_id: &str) -> usize {
        let Some(entry) = self.sessions.get_mut(session_id) else {
            return 0;
        };
        if entry
            .in_flight
            .as_ref()
            .is_some_and(|f| f.message_id == message_id)
        {
            entry.in_flight = None;
            let dropped = entry.queue.len();
            entry.queue.clear();
            return dropped;
        }
        0
    }

    /// Drop every queued prompt; the in-flight one is untouched.
    pub fn clear_queue(&mut self, session_id: &str) -> usize {
        self.sessions
            .get_mut(session_id)
            .map(|entry| {
                let dropped = entry.queue.len();
                entry.queue.clear();
                dropped
            })
            .unwrap_or(0)
    }

    pub fn remove_queued(&mut self, session_id: &str, queue_id: u64) -> bool {
        self.take_queued(session_id, queue_id).is_some()
    }

    /// Remove a queued prompt and return it, e.g. to edit it.
    pub fn take_queued(&mut self, session_id: &str, queue_id: u64) -> Option<PendingPrompt> {
        let entry = self.sessions.get_mut(session_id)?;
        let idx = entry.queue.iter().position(|q| q.queue_id == queue_id)?;
        entry.queue.remove(idx).map(|q| q.prompt)
    }

    pub fn queued(&self, session_id: &str) -> Vec<QueuedPrompt> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn in_flight(&self, session_id: &str) -> Option<&str> {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.in_flight.as_ref())
            .map(|f| f.message_id.as_str())
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.in_flight(session_id).is_some()
    }

    /// `(session_id, message_id)` for every session with a prompt in flight.
    pub fn all_in_flight(&self) -> Vec<(String, String)> {
        self.sessions
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .in_flight
                    .as_ref()
                    .map(|f| (id.clone(), f.message_id.clone()))
            })
            .collect()
    }

    /// Forget a deleted session.
    pub fn forget(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_submit_queues_behind_in_flight() {
        let mut outbox = Outbox::new();
        assert!(matches!(
            outbox.submit("s1", PendingPrompt::text("one")),
            SubmitDecision::Dispatch(_)
        ));
        outbox.begin_dispatch("s1", "msg_1");

        let decision = outbox.submit("s1", PendingPrompt::text("two"));
        assert!(matches!(decision, SubmitDecision::Queued { position: 1, .. }));
        assert_eq!(outbox.in_flight("s1"), Some("msg_1"));

        // Other sessions are independent.
        assert!(matches!(
            outbox.submit("s2", PendingPrompt::text("elsewhere")),
            SubmitDecision::Dispatch(_)
        ));
    }

    #[test]
    fn idle_drains_one_at_a_time() {
        let mut outbox = Outbox::new();
        outbox.begin_dispatch("s1", "msg_1");
        outbox.submit("s1", PendingPrompt::text("two"));
        outbox.submit("s1", PendingPrompt::text("three"));

        let next = outbox.on_idle("s1").unwrap();
        assert_eq!(next.text, "two");
        assert_eq!(outbox.in_flight("s1"), None);

        // Idle re-delivered before the next dispatch starts does nothing.
        assert_eq!(outbox.on_idle("s1"), None);
        assert_eq!(outbox.queued("s1").len(), 1);
    }

    #[test]
    fn dispatch_failure_drops_queue() {
        let mut outbox = Outbox::new();
        outbox.begin_dispatch("s1", "msg_1");
        outbox.submit("s1", PendingPrompt::text("two"));
        outbox.submit("s1", PendingPrompt::text("three"));

        assert_eq!(outbox.on_dispatch_failed("s1", "msg_other"), 0);
        assert_eq!(outbox.queued("s1").len(), 2);

        assert_eq!(outbox.on_dispatch_failed("s1", "msg_1"), 2);
        assert!(outbox.queued("s1").is_empty());
        assert!(!outbox.is_busy("s1"));
    }

    #[test]
    fn take_queued_removes_by_id() {
        let mut outbox = Outbox::new();
        outbox.begin_dispatch("s1", "msg_1");
        let SubmitDecision::Queued { queue_id, .. } = outbox.submit("s1", PendingPrompt::text("a"))
        else {
            panic!("expected queued");
        };
        outbox.submit("s1", PendingPrompt::text("b"));

        assert_eq!(outbox.take_queued("s1", queue_id).unwrap().text, "a");
        assert!(!outbox.remove_queued("s1", queue_id));
        assert_eq!(outbox.queued("s1")[0].prompt.text, "b");
        assert_eq!(outbox.clear_queue("s1"), 1);
    }
}
