//! Timer heap for sampling, publish cycles and publish-request timeouts.
//!
//! Deadlines are offsets from the server clock's origin. The heap holds no callbacks:
//! popping a due timer yields its [`TimerKey`] and the server dispatches on it. Each key
//! has at most one live timer; rescheduling or cancelling bumps the key's generation so
//! stale heap entries are skipped when they surface.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use crate::subscription::{MonitoredItemId, SubscriptionId};

use super::session::SessionId;

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    Sample {
        session: SessionId,
        subscription: SubscriptionId,
        item: MonitoredItemId,
    },
    Publish {
        session: SessionId,
        subscription: SubscriptionId,
    },
    PublishTimeout {
        session: SessionId,
        subscription: SubscriptionId,
        request: u64,
    },
}

#[derive(Debug)]
struct TimerEntry {
    due: Duration,
    seq: u64,
    key: TimerKey,
    generation: u64,
    period: Option<Duration>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    // Reversed so the max-heap pops the earliest deadline; ties fire in scheduling order.
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct Scheduler {
    heap: BinaryHeap<TimerEntry>,
    live: HashMap<TimerKey, u64>,
    next_seq: u64,
    next_generation: u64,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, key: TimerKey, due: Duration, period: Option<Duration>) {
        self.next_generation += 1;
        self.next_seq += 1;
        let generation = self.next_generation;
        self.live.insert(key, generation);
        self.heap.push(TimerEntry {
            due,
            seq: self.next_seq,
            key,
            generation,
            period,
        });
    }

    /// Fires at `first_due`, then every `period`. Replaces any timer with the same key.
    pub(crate) fn schedule_repeating(&mut self, key: TimerKey, first_due: Duration, period: Duration) {
        self.push(key, first_due, Some(period.max(Duration::from_millis(1))));
    }

    /// Fires once at `due`. Replaces any timer with the same key.
    pub(crate) fn schedule_once(&mut self, key: TimerKey, due: Duration) {
        self.push(key, due, None);
    }

    pub(crate) fn cancel(&mut self, key: &TimerKey) {
        self.live.remove(key);
    }

    /// Cancels every timer belonging to `session`.
    pub(crate) fn cancel_session(&mut self, session: SessionId) {
        self.live.retain(|key, _| key_session(key) != session);
    }

    /// Cancels every timer belonging to one subscription.
    pub(crate) fn cancel_subscription(&mut self, session: SessionId, subscription: SubscriptionId) {
        self.live.retain(|key, _| {
            let (s, sub) = key_subscription(key);
            !(s == session && sub == subscription)
        });
    }

    fn is_live(&self, entry: &TimerEntry) -> bool {
        self.live.get(&entry.key) == Some(&entry.generation)
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.is_live(top) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Deadline of the earliest live timer.
    pub(crate) fn next_due(&mut self) -> Option<Duration> {
        self.discard_stale();
        self.heap.peek().map(|e| e.due)
    }

    /// Pops one timer due at or before `now`.
    ///
    /// A repeating timer is re-armed one period after its previous deadline, so a
    /// caller that fell behind catches up one period at a time.
    pub(crate) fn pop_due(&mut self, now: Duration) -> Option<(TimerKey, Duration)> {
        self.discard_stale();
        if self.heap.peek().map_or(true, |top| top.due > now) {
            return None;
        }
        let entry = self.heap.pop()?;

        match entry.period {
            Some(period) => {
                self.next_seq += 1;
                self.heap.push(TimerEntry {
                    due: entry.due + period,
                    seq: self.next_seq,
                    key: entry.key,
                    generation: entry.generation,
                    period: entry.period,
                });
            }
            None => {
                self.live.remove(&entry.key);
            }
        }
        Some((entry.key, entry.due))
    }

    #[cfg(test)]
    pub(crate) fn live_timers(&self) -> usize {
        self.live.len()
    }
}

const fn key_session(key: &TimerKey) -> SessionId {
    match key {
        TimerKey::Sample { session, .. }
        | TimerKey::Publish { session, .. }
        | TimerKey::PublishTimeout { session, .. } => *session,
    }
}

const fn key_subscription(key: &TimerKey) -> (SessionId, SubscriptionId) {
    match key {
        TimerKey::Sample {
            session, subscription, ..
        }
        | TimerKey::Publish { session, subscription }
        | TimerKey::PublishTimeout {
            session, subscription, ..
        } => (*session, *subscription),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_key(session: SessionId, id: u32) -> TimerKey {
        TimerKey::Publish {
            session,
            subscription: SubscriptionId::new(id),
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn repeating_timer_catches_up_one_period_at_a_time() {
        let session = SessionId::new();
        let mut s = Scheduler::new();
        s.schedule_repeating(publish_key(session, 1), ms(100), ms(100));

        let mut fired = Vec::new();
        while let Some((_, due)) = s.pop_due(ms(450)) {
            fired.push(due);
        }
        assert_eq!(fired, vec![ms(100), ms(200), ms(300), ms(400)]);
        assert_eq!(s.next_due(), Some(ms(500)));
    }

    #[test]
    fn earliest_deadline_fires_first() {
        let session = SessionId::new();
        let mut s = Scheduler::new();
        s.schedule_once(publish_key(session, 1), ms(300));
        s.schedule_once(publish_key(session, 2), ms(100));

        assert_eq!(s.pop_due(ms(1000)).map(|(k, _)| k), Some(publish_key(session, 2)));
        assert_eq!(s.pop_due(ms(1000)).map(|(k, _)| k), Some(publish_key(session, 1)));
        assert!(s.pop_due(ms(1000)).is_none());
        assert_eq!(s.live_timers(), 0);
    }

    #[test]
    fn cancel_and_reschedule_skip_stale_entries() {
        let session = SessionId::new();
        let mut s = Scheduler::new();
        let key = publish_key(session, 1);
        s.schedule_repeating(key, ms(100), ms(100));
        s.schedule_repeating(key, ms(250), ms(250));

        assert_eq!(s.pop_due(ms(300)), Some((key, ms(250))));
        assert!(s.pop_due(ms(300)).is_none());

        s.cancel(&key);
        assert_eq!(s.next_due(), None);
    }

    #[test]
    fn cancel_session_removes_only_its_timers() {
        let a = SessionId::new();
        let b = SessionId::new();
        let mut s = Scheduler::new();
        s.schedule_once(publish_key(a, 1), ms(10));
        s.schedule_once(publish_key(b, 1), ms(20));
        s.schedule_once(
            TimerKey::Sample {
                session: a,
                subscription: SubscriptionId::new(2),
                item: MonitoredItemId::new(1),
            },
            ms(30),
        );

        s.cancel_session(a);
        assert_eq!(s.pop_due(ms(100)).map(|(k, _)| k), Some(publish_key(b, 1)));
        assert!(s.pop_due(ms(100)).is_none());
    }

    #[test]
    fn nothing_due_before_deadline() {
        let mut s = Scheduler::new();
        s.schedule_once(publish_key(SessionId::new(), 1), ms(100));
        assert!(s.pop_due(ms(99)).is_none());
        assert!(s.pop_due(ms(100)).is_some());
    }
}
