//! Timer queue keyed to the reactor tick.
//!
//! Due timers are not run in place: the reactor moves them into the task
//! queue so they are serialized with every other reactor task.

use super::Reactor;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Timer callback. Returning `false` stops the timer early.
pub type TimerFn = Box<dyn FnMut(&mut Reactor) -> bool + Send + 'static>;

/// Runs once when a timer stops (exhausted, cancelled or returned `false`).
pub type FinishFn = Box<dyn FnOnce(&mut Reactor) + Send + 'static>;

/// Identifies a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// How often a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Fire until cancelled or the callback returns `false`.
    Forever,
    /// Fire at most this many times. `Times(1)` is a one-shot timer.
    Times(u32),
}

pub(crate) struct Timer {
    id: TimerId,
    every_ms: u64,
    due: u64,
    remaining: Option<u32>,
    task: TimerFn,
    on_finish: Option<FinishFn>,
}

impl Timer {
    pub(crate) fn id(&self) -> TimerId {
        self.id
    }

    /// Run the callback once. Returns true if the timer should be rescheduled.
    pub(crate) fn fire(&mut self, reactor: &mut Reactor) -> bool {
        let keep = (self.task)(reactor);
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                return false;
            }
        }
        keep
    }

    pub(crate) fn take_finish(&mut self) -> Option<FinishFn> {
        self.on_finish.take()
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(u64, TimerId)>>,
    timers: HashMap<TimerId, Timer>,
    /// Timers taken out of the queue whose callback has not settled yet.
    in_flight: HashSet<TimerId>,
    /// Timers cancelled while in flight.
    cancelled: HashSet<TimerId>,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn schedule(
        &mut self,
        every_ms: u64,
        repeat: Repeat,
        task: TimerFn,
        on_finish: Option<FinishFn>,
        now: u64,
    ) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        let remaining = match repeat {
            Repeat::Forever => None,
            Repeat::Times(n) => Some(n.max(1)),
        };
        let timer = Timer {
            id,
            every_ms,
            due: now + every_ms,
            remaining,
            task,
            on_finish,
        };
        self.insert(timer);
        id
    }

    fn insert(&mut self, timer: Timer) {
        self.heap.push(Reverse((timer.due, timer.id)));
        self.timers.insert(timer.id, timer);
    }

    pub(crate) fn reschedule(&mut self, mut timer: Timer, now: u64) {
        self.in_flight.remove(&timer.id);
        if self.cancelled.remove(&timer.id) {
            return;
        }
        timer.due = now + timer.every_ms;
        self.insert(timer);
    }

    /// Cancel a timer, returning it if it was waiting in the queue.
    pub(crate) fn cancel(&mut self, id: TimerId) -> Option<Timer> {
        match self.timers.remove(&id) {
            Some(timer) => Some(timer),
            None => {
                if self.in_flight.contains(&id) {
                    self.cancelled.insert(id);
                }
                None
            }
        }
    }

    /// Returns true if the in-flight timer was cancelled before firing.
    pub(crate) fn is_cancelled(&self, id: TimerId) -> bool {
        self.cancelled.contains(&id)
    }

    /// Forget an in-flight timer that will not be rescheduled.
    pub(crate) fn settle(&mut self, id: TimerId) {
        self.in_flight.remove(&id);
        self.cancelled.remove(&id);
    }

    /// Remove and return every timer due at `now`, in due order.
    pub(crate) fn take_due(&mut self, now: u64) -> Vec<Timer> {
        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            // Heap entries of cancelled or rescheduled timers are stale.
            if self.timers.get(&id).is_some_and(|t| t.due == at) {
                if let Some(timer) = self.timers.remove(&id) {
                    self.in_flight.insert(id);
                    due.push(timer);
                }
            }
        }
        due
    }

    /// Milliseconds until the next timer is due.
    pub(crate) fn next_due_in(&self, now: u64) -> Option<u64> {
        self.heap
            .iter()
            .filter(|Reverse((at, id))| self.timers.get(id).is_some_and(|t| t.due == *at))
            .map(|Reverse((at, _))| at.saturating_sub(now))
            .min()
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }

    /// Drop every timer without running finish callbacks.
    pub(crate) fn clear(&mut self) {
        self.heap.clear();
        self.timers.clear();
        self.in_flight.clear();
        self.cancelled.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerFn {
        Box::new(|_| true)
    }

    #[test]
    fn test_take_due_in_order() {
        let mut timers = TimerQueue::default();
        let late = timers.schedule(200, Repeat::Forever, noop(), None, 0);
        let early = timers.schedule(100, Repeat::Forever, noop(), None, 0);

        assert!(timers.take_due(50).is_empty());
        let due = timers.take_due(250);
        let ids: Vec<TimerId> = due.iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![early, late]);
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn test_next_due_in() {
        let mut timers = TimerQueue::default();
        assert_eq!(timers.next_due_in(0), None);
        timers.schedule(300, Repeat::Times(1), noop(), None, 1000);
        timers.schedule(100, Repeat::Times(1), noop(), None, 1000);
        assert_eq!(timers.next_due_in(1050), Some(50));
        assert_eq!(timers.next_due_in(5000), Some(0));
    }

    #[test]
    fn test_cancel_waiting_timer() {
        let mut timers = TimerQueue::default();
        let id = timers.schedule(10, Repeat::Forever, noop(), None, 0);
        assert!(timers.cancel(id).is_some());
        assert!(timers.take_due(100).is_empty());
        assert_eq!(timers.next_due_in(0), None);
    }

    #[test]
    fn test_cancel_in_flight_timer_blocks_reschedule() {
        let mut timers = TimerQueue::default();
        let id = timers.schedule(10, Repeat::Forever, noop(), None, 0);
        let mut due = timers.take_due(10);
        assert_eq!(due.len(), 1);

        assert!(timers.cancel(id).is_none());
        timers.reschedule(due.remove(0), 10);
        assert_eq!(timers.len(), 0);
    }

    #[test]
    fn test_reschedule_moves_due_time() {
        let mut timers = TimerQueue::default();
        timers.schedule(10, Repeat::Forever, noop(), None, 0);
        let timer = timers.take_due(10).remove(0);
        timers.reschedule(timer, 10);
        assert!(timers.take_due(15).is_empty());
        assert_eq!(timers.take_due(20).len(), 1);
    }
}
