//! A min-heap timer wheel driving one-shot and periodic callbacks off a
//! single [`EventLoop`](super::EventLoop)'s `wait_and_process` cadence.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// A handle to a scheduled timer, for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(usize);

struct Entry {
    deadline: Instant,
    period: Option<Duration>,
    callback: Box<dyn FnMut() + Send>,
}

/// Tracks pending timers and fires the ones whose deadline has passed.
///
/// Cancelled or already-fired one-shot timers are dropped from `table`
/// immediately; their heap entries are left behind as tombstones and
/// filtered out lazily when popped, the standard trick for a heap that
/// doesn't support arbitrary removal.
#[derive(Default)]
pub struct TimerWheel {
    next_id: usize,
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    table: HashMap<TimerId, Entry>,
}

impl TimerWheel {
    /// Creates an empty wheel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `callback` to run once, after `delay`.
    pub fn set(&mut self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.schedule(delay, None, callback)
    }

    /// Schedules `callback` to run after `delay`, then every `period`
    /// thereafter until cancelled.
    pub fn set_periodic(
        &mut self,
        delay: Duration,
        period: Duration,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.schedule(delay, Some(period), callback)
    }

    fn schedule(
        &mut self,
        delay: Duration,
        period: Option<Duration>,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let deadline = Instant::now() + delay;
        self.heap.push(Reverse((deadline, id)));
        self.table.insert(
            id,
            Entry {
                deadline,
                period,
                callback: Box::new(callback),
            },
        );
        id
    }

    /// Cancels a pending timer. No-op if it already fired (and was a
    /// one-shot) or was already cancelled.
    pub fn cancel(&mut self, id: TimerId) {
        self.table.remove(&id);
    }

    /// The earliest pending deadline, if any, used to bound the event
    /// loop's next poll timeout.
    ///
    /// `BinaryHeap::iter()` yields elements in arbitrary order, so scanning
    /// it directly can't find the minimum; `peek()`/`pop()` are the only
    /// operations the heap invariant actually orders. This pops tombstones
    /// (cancelled entries) off the top permanently until it finds a live
    /// one, which by the heap invariant is the earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.table.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Fires every timer whose deadline is at or before `now`, rescheduling
    /// periodic ones. Returns the number of callbacks invoked.
    pub fn fire_expired(&mut self, now: Instant) -> usize {
        let mut fired = 0;

        loop {
            let Some(Reverse((deadline, id))) = self.heap.peek().copied() else {
                break;
            };
            if deadline > now {
                break;
            }
            self.heap.pop();

            let Some(mut entry) = self.table.remove(&id) else {
                continue; // tombstone
            };
            (entry.callback)();
            fired += 1;

            if let Some(period) = entry.period {
                entry.deadline = now + period;
                self.heap.push(Reverse((entry.deadline, id)));
                self.table.insert(id, entry);
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn one_shot_fires_once() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        wheel.set(Duration::from_millis(0), move || *c.lock().unwrap() += 1);

        assert_eq!(wheel.fire_expired(Instant::now()), 1);
        assert_eq!(wheel.fire_expired(Instant::now()), 0);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn periodic_reschedules() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        wheel.set_periodic(Duration::from_millis(0), Duration::from_millis(0), move || {
            *c.lock().unwrap() += 1
        });

        wheel.fire_expired(Instant::now());
        wheel.fire_expired(Instant::now());
        assert_eq!(*count.lock().unwrap(), 2);
    }

    #[test]
    fn cancel_prevents_firing() {
        let mut wheel = TimerWheel::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let id = wheel.set(Duration::from_millis(0), move || *c.lock().unwrap() += 1);
        wheel.cancel(id);

        assert_eq!(wheel.fire_expired(Instant::now()), 0);
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn next_deadline_skips_tombstones() {
        let mut wheel = TimerWheel::new();
        let id = wheel.set(Duration::from_secs(10), || {});
        wheel.cancel(id);
        assert!(wheel.next_deadline().is_none());

        wheel.set(Duration::from_secs(5), || {});
        assert!(wheel.next_deadline().is_some());
    }
}
