//! Event batching
//!
//! Live events are collected and applied together once the batch window
//! closes. While a bootstrap is running nothing is flushed; the engine
//! drains the queue right after the bootstrap commits.

use chatsync_protocol::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    /// First event of a new batch: arm the flush timer.
    ScheduleFlush,
    /// A flush is already armed.
    AlreadyScheduled,
    /// Bootstrapping: keep the event, don't arm anything.
    HoldForBootstrap,
}

#[derive(Debug, Default)]
pub struct EventBatcher {
    queue: Vec<Event>,
    flush_scheduled: bool,
}

impl EventBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event, bootstrapping: bool) -> BatchDecision {
        self.queue.push(event);
        if bootstrapping {
            return BatchDecision::HoldForBootstrap;
        }
        if self.flush_scheduled {
            return BatchDecision::AlreadyScheduled;
        }
        self.flush_scheduled = true;
        BatchDecision::ScheduleFlush
    }

    /// Take everything queued and disarm the schedule.
    pub fn drain(&mut self) -> Vec<Event> {
        self.flush_scheduled = false;
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_scheduled(&self) -> bool {
        self.flush_scheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle(id: &str) -> Event {
        Event::SessionIdle {
            session_id: id.into(),
        }
    }

    #[test]
    fn only_the_first_push_schedules() {
        let mut batcher = EventBatcher::new();
        assert_eq!(batcher.push(idle("a"), false), BatchDecision::ScheduleFlush);
        assert_eq!(batcher.push(idle("b"), false), BatchDecision::AlreadyScheduled);

        let drained = batcher.drain();
        assert_eq!(drained, vec![idle("a"), idle("b")]);
        assert!(!batcher.is_scheduled());
        assert_eq!(batcher.push(idle("c"), false), BatchDecision::ScheduleFlush);
    }

    #[test]
    fn bootstrapping_holds_without_scheduling() {
        let mut batcher = EventBatcher::new();
        assert_eq!(batcher.push(idle("a"), true), BatchDecision::HoldForBootstrap);
        assert_eq!(batcher.push(idle("b"), true), BatchDecision::HoldForBootstrap);
        assert!(!batcher.is_scheduled());
        assert_eq!(batcher.len(), 2);

        // Nothing is lost once bootstrap is over.
        assert_eq!(batcher.drain().len(), 2);
        assert!(batcher.is_empty());
    }
}
