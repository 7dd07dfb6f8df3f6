//! Timer abstraction driving every timeout of the exchange layer.
//!
//! All timers are one-shot. Starting a timer returns a [TimerHandle] which is the only way
//! to cancel it. Expired timers are not invoked by the layer itself; the owner collects
//! them with [SystemLayer::take_expired] and dispatches the [TimerEvent]s on its own
//! thread, so callbacks never run re-entrantly from inside `start_timer`.

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use crate::exchange::ExchangeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Physical wake up of the reliable messaging tick engine.
    RmpTick,
    ResponseTimeout(ExchangeKey),
    TrickleTau(ExchangeKey),
    TrickleT(ExchangeKey),
    TrickleCancel(ExchangeKey),
}

pub trait SystemLayer {
    fn now(&self) -> Instant;
    fn start_timer(&self, delay: Duration, event: TimerEvent) -> TimerHandle;
    fn cancel_timer(&self, handle: TimerHandle);
    /// Earliest pending deadline.
    fn next_deadline(&self) -> Option<Instant>;
    /// Remove and return all timers due at `now()`, earliest first.
    fn take_expired(&self) -> Vec<TimerEvent>;
}

enum Clock {
    System,
    Manual(Cell<Instant>),
}

/// Ordered timer queue. Timers with equal deadline expire in start order.
pub struct TimerQueue {
    clock: Clock,
    next_id: Cell<u64>,
    timers: RefCell<BTreeMap<(Instant, u64), TimerEvent>>,
    deadlines: RefCell<HashMap<u64, Instant>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::with_clock(Clock::System)
    }

    /// Queue with a clock that only moves through [TimerQueue::advance].
    pub fn manual() -> Self {
        Self::with_clock(Clock::Manual(Cell::new(Instant::now())))
    }

    fn with_clock(clock: Clock) -> Self {
        Self {
            clock,
            next_id: Cell::new(1),
            timers: RefCell::new(BTreeMap::new()),
            deadlines: RefCell::new(HashMap::new()),
        }
    }

    pub fn advance(&self, d: Duration) {
        match &self.clock {
            Clock::Manual(now) => now.set(now.get() + d),
            Clock::System => log::warn!("advance called on system clock timer queue"),
        }
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.deadlines.borrow().contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.timers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.borrow().is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemLayer for TimerQueue {
    fn now(&self) -> Instant {
        match &self.clock {
            Clock::System => Instant::now(),
            Clock::Manual(now) => now.get(),
        }
    }

    fn start_timer(&self, delay: Duration, event: TimerEvent) -> TimerHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let deadline = self.now() + delay;
        self.timers.borrow_mut().insert((deadline, id), event);
        self.deadlines.borrow_mut().insert(id, deadline);
        log::trace!("timer {} started {:?} delay:{:?}", id, event, delay);
        TimerHandle(id)
    }

    fn cancel_timer(&self, handle: TimerHandle) {
        if let Some(deadline) = self.deadlines.borrow_mut().remove(&handle.0) {
            self.timers.borrow_mut().remove(&(deadline, handle.0));
            log::trace!("timer {} canceled", handle.0);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().keys().next().map(|(deadline, _)| *deadline)
    }

    fn take_expired(&self) -> Vec<TimerEvent> {
        let now = self.now();
        let mut timers = self.timers.borrow_mut();
        let mut deadlines = self.deadlines.borrow_mut();
        let mut out = Vec::new();
        while let Some(entry) = timers.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            out.push(entry.remove());
            deadlines.remove(&id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKey;

    #[test]
    fn expire_in_deadline_order() {
        let q = TimerQueue::manual();
        let k = ExchangeKey::new(0, 1);
        q.start_timer(Duration::from_millis(30), TimerEvent::TrickleT(k));
        q.start_timer(Duration::from_millis(10), TimerEvent::RmpTick);
        q.start_timer(Duration::from_millis(10), TimerEvent::ResponseTimeout(k));
        assert_eq!(q.next_deadline(), Some(q.now() + Duration::from_millis(10)));

        assert!(q.take_expired().is_empty());
        q.advance(Duration::from_millis(10));
        assert_eq!(
            q.take_expired(),
            vec![TimerEvent::RmpTick, TimerEvent::ResponseTimeout(k)]
        );
        q.advance(Duration::from_millis(25));
        assert_eq!(q.take_expired(), vec![TimerEvent::TrickleT(k)]);
        assert!(q.is_empty());
    }

    #[test]
    fn cancel_by_handle() {
        let q = TimerQueue::manual();
        let k = ExchangeKey::new(3, 9);
        let h1 = q.start_timer(Duration::from_millis(5), TimerEvent::TrickleTau(k));
        let h2 = q.start_timer(Duration::from_millis(5), TimerEvent::TrickleTau(k));
        q.cancel_timer(h1);
        // cancelling twice is harmless
        q.cancel_timer(h1);
        assert!(!q.is_pending(h1));
        assert!(q.is_pending(h2));
        q.advance(Duration::from_millis(5));
        assert_eq!(q.take_expired(), vec![TimerEvent::TrickleTau(k)]);
        assert!(!q.is_pending(h2));
    }

    #[test]
    fn zero_delay_is_due_on_next_pass() {
        let q = TimerQueue::manual();
        q.start_timer(Duration::ZERO, TimerEvent::RmpTick);
        assert_eq!(q.len(), 1);
        assert_eq!(q.take_expired(), vec![TimerEvent::RmpTick]);
    }
}
