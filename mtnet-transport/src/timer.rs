//! Deadline-ordered timer queue.
//!
//! The queue never blocks on its own: the reactor folds
//! [`TimerQueue::wait_timeout`] into its poll call and fires due entries
//! with [`TimerQueue::fire_due`] afterwards. Every method takes `now`
//! explicitly so tests can drive a simulated clock.

use std::time::{Duration, Instant};

/// Handle to a scheduled timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct TimerEntry {
    id: TimerId,
    deadline: Instant,
    interval: Duration,
    repeating: bool,
}

/// One-shot and repeating timers ordered by next fire time.
pub struct TimerQueue {
    /// Sorted by deadline, soonest first.
    entries: Vec<TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self { entries: Vec::new(), next_id: 1 }
    }

    /// Schedule a one-shot timer `delay` from `now`.
    ///
    /// A zero delay means "disabled" and schedules nothing.
    pub fn schedule_once(&mut self, now: Instant, delay: Duration) -> Option<TimerId> {
        self.insert(now, delay, false)
    }

    /// Schedule a repeating timer firing every `interval` from `now`.
    ///
    /// A zero interval means "disabled" and schedules nothing.
    pub fn schedule_repeating(&mut self, now: Instant, interval: Duration) -> Option<TimerId> {
        self.insert(now, interval, true)
    }

    fn insert(&mut self, now: Instant, interval: Duration, repeating: bool) -> Option<TimerId> {
        if interval.is_zero() {
            return None;
        }
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let entry = TimerEntry { id, deadline: now + interval, interval, repeating };
        let at = self.entries.partition_point(|e| e.deadline <= entry.deadline);
        self.entries.insert(at, entry);
        Some(id)
    }

    /// Remove a timer. Returns whether it was still scheduled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Deadline of the soonest timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.deadline)
    }

    /// The poll timeout: `min(max_wait, time to next timer)`.
    pub fn wait_timeout(&self, now: Instant, max_wait: Duration) -> Duration {
        match self.next_deadline() {
            Some(deadline) => max_wait.min(deadline.saturating_duration_since(now)),
            None => max_wait,
        }
    }

    /// Fire every timer due at `now`, each at most once per sweep.
    ///
    /// Repeating timers are re-anchored at `now + interval`, so a sweep that
    /// arrives several intervals late produces one fire, not a burst of
    /// catch-up fires.
    pub fn fire_due(&mut self, now: Instant) -> Vec<TimerId> {
        let mut fired = Vec::new();
        while let Some(entry) = self.entries.first() {
            if entry.deadline > now {
                break;
            }
            let entry = self.entries.remove(0);
            fired.push(entry.id);
            if entry.repeating {
                let rearmed = TimerEntry { deadline: now + entry.interval, ..entry };
                let at = self.entries.partition_point(|e| e.deadline <= rearmed.deadline);
                self.entries.insert(at, rearmed);
            }
        }
        fired
    }

    /// Number of scheduled timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self { Self::new() }
}
