//! Deadline timers owned by the pool worker.
//!
//! Each scheduled timer returns a token. The token is stored next to the
//! state it guards and cancelled in the same transition that invalidates it;
//! cancelled timers never fire.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use crate::key::Key;

use super::listener::ListenerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TimerToken(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerKind {
    IdleClose { key: Key },
    Redeliver { key: Key, listener: ListenerId },
}

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, TimerToken)>>,
    live: HashMap<TimerToken, TimerKind>,
    next: u64,
}

impl TimerQueue {
    pub fn schedule(&mut self, deadline: Instant, kind: TimerKind) -> TimerToken {
        let token = TimerToken(self.next);
        self.next = self.next.wrapping_add(1);
        self.live.insert(token, kind);
        self.heap.push(Reverse((deadline, token)));
        token
    }

    pub fn cancel(&mut self, token: TimerToken) -> bool {
        self.live.remove(&token).is_some()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Earliest live deadline, discarding cancelled heads.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, token))) = self.heap.peek().copied() {
            if self.live.contains_key(&token) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Removes and returns every live timer due at or before `now`, in deadline order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TimerToken, TimerKind)> {
        let mut due = Vec::new();
        while let Some(Reverse((deadline, token))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some(kind) = self.live.remove(&token) {
                due.push((token, kind));
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    fn idle(s: &str) -> TimerKind {
        TimerKind::IdleClose {
            key: Key::parse(s).unwrap(),
        }
    }

    #[test]
    fn due_timers_fire_in_deadline_order() {
        let t0 = Instant::now();
        let mut timers = TimerQueue::default();
        timers.schedule(t0 + Duration::from_millis(20), idle("B"));
        timers.schedule(t0 + Duration::from_millis(10), idle("A"));
        timers.schedule(t0 + Duration::from_millis(30), idle("C"));

        let fired: Vec<TimerKind> = timers
            .pop_due(t0 + Duration::from_millis(25))
            .into_iter()
            .map(|(_, k)| k)
            .collect();
        assert_eq!(fired, vec![idle("A"), idle("B")]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline(), Some(t0 + Duration::from_millis(30)));
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let t0 = Instant::now();
        let mut timers = TimerQueue::default();
        let token = timers.schedule(t0, idle("A"));
        assert!(timers.cancel(token));
        assert!(!timers.cancel(token));
        assert!(timers.pop_due(t0 + Duration::from_secs(1)).is_empty());
        assert_eq!(timers.next_deadline(), None);
    }
}
