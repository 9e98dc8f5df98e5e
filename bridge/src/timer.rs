//! Timer and microtask queue.
//!
//! Timers are kept in the store data and fired by the embedder through
//! `InstantiatedModule::pump`. Each firing is dispatched exactly once;
//! a cancelled timer is removed before it can fire.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Shortest interval period; keeps a zero-period interval from firing
/// forever within one pump.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
struct Timer {
    due: Instant,
    period: Option<Duration>,
    callback: i32,
}

/// Pending timers and microtasks of one session.
#[derive(Debug)]
pub struct TimerQueue {
    next_handle: i32,
    timers: BTreeMap<i32, Timer>,
    microtasks: VecDeque<i32>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        TimerQueue {
            next_handle: 1,
            timers: BTreeMap::new(),
            microtasks: VecDeque::new(),
        }
    }

    fn schedule(&mut self, timer: Timer) -> i32 {
        let handle = self.next_handle;
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        self.timers.insert(handle, timer);
        handle
    }

    /// Fire `callback` once after `delay`.
    pub fn set_timeout(&mut self, now: Instant, delay: Duration, callback: i32) -> i32 {
        self.schedule(Timer {
            due: now + delay,
            period: None,
            callback,
        })
    }

    /// Fire `callback` every `period` until cancelled.
    pub fn set_interval(&mut self, now: Instant, period: Duration, callback: i32) -> i32 {
        let period = period.max(MIN_INTERVAL);
        self.schedule(Timer {
            due: now + period,
            period: Some(period),
            callback,
        })
    }

    /// Cancel a timer. Returns whether it was still pending.
    pub fn cancel(&mut self, handle: i32) -> bool {
        self.timers.remove(&handle).is_some()
    }

    /// Number of pending timers.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Earliest due time.
    pub fn next_due(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.due).min()
    }

    /// Remove the earliest timer due at `now` and return its callback.
    /// Intervals are rescheduled one period after `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<i32> {
        let (&handle, _) = self
            .timers
            .iter()
            .filter(|(_, t)| t.due <= now)
            .min_by_key(|(h, t)| (t.due, **h))?;

        let timer = self.timers.remove(&handle)?;
        if let Some(period) = timer.period {
            self.timers.insert(
                handle,
                Timer {
                    due: now + period,
                    ..timer
                },
            );
        }
        Some(timer.callback)
    }

    /// Queue a microtask.
    pub fn queue_microtask(&mut self, callback: i32) {
        self.microtasks.push_back(callback);
    }

    /// Next microtask, in FIFO order.
    pub fn pop_microtask(&mut self) -> Option<i32> {
        self.microtasks.pop_front()
    }

    /// Number of queued microtasks.
    pub fn pending_microtasks(&self) -> usize {
        self.microtasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_fires_once() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.set_timeout(now, Duration::from_millis(10), 42);

        assert_eq!(queue.pop_due(now), None);
        let later = now + Duration::from_millis(10);
        assert_eq!(queue.pop_due(later), Some(42));
        assert_eq!(queue.pop_due(later), None);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        let handle = queue.set_timeout(now, Duration::ZERO, 1);
        assert!(queue.cancel(handle));
        assert!(!queue.cancel(handle));
        assert_eq!(queue.pop_due(now + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_due_order() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        queue.set_timeout(now, Duration::from_millis(20), 2);
        queue.set_timeout(now, Duration::from_millis(10), 1);
        queue.set_timeout(now, Duration::from_millis(20), 3);

        let later = now + Duration::from_millis(50);
        let fired: Vec<i32> = std::iter::from_fn(|| queue.pop_due(later)).collect();
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn test_interval_reschedules() {
        let now = Instant::now();
        let mut queue = TimerQueue::new();
        let handle = queue.set_interval(now, Duration::ZERO, 9);

        let t1 = now + Duration::from_millis(1);
        assert_eq!(queue.pop_due(t1), Some(9));
        assert_eq!(queue.pop_due(t1), None);
        assert_eq!(queue.next_due(), Some(t1 + MIN_INTERVAL));

        assert!(queue.cancel(handle));
        assert_eq!(queue.pop_due(t1 + Duration::from_secs(1)), None);
    }

    #[test]
    fn test_microtasks_fifo() {
        let mut queue = TimerQueue::new();
        queue.queue_microtask(1);
        queue.queue_microtask(2);
        assert_eq!(queue.pending_microtasks(), 2);
        assert_eq!(queue.pop_microtask(), Some(1));
        assert_eq!(queue.pop_microtask(), Some(2));
        assert_eq!(queue.pop_microtask(), None);
    }
}
