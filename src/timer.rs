//! Timers and the per-shard ordered timer set
//!
//! A [`Timer`] is a one-shot or periodic callback keyed on the monotonic
//! clock. The reactor owns a [`TimerSet`] ordered by expiry (insertion
//! order among ties) and arms the backend for the earliest deadline each
//! main-loop iteration.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::Error;
use crate::future::Future;
use crate::reactor;

pub(crate) struct TimerInner {
    pub(crate) callback: Option<Box<dyn FnMut()>>,
    pub(crate) expiry: Instant,
    pub(crate) period: Option<Duration>,
    pub(crate) armed: bool,
    pub(crate) queued: bool,
    pub(crate) seq: u64,
}

/// A monotonic-expiry timer. States: unarmed, armed, fired.
///
/// At most one pending expiry exists per timer; arming an armed timer
/// panics. `cancel` is idempotent. Periodic timers automatically re-arm
/// after firing.
pub struct Timer {
    inner: Rc<RefCell<TimerInner>>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(TimerInner {
                callback: None,
                expiry: Instant::now(),
                period: None,
                armed: false,
                queued: false,
                seq: 0,
            })),
        }
    }

    /// Set the callback run on expiry. Periodic timers invoke it once per
    /// period.
    pub fn set_callback(&mut self, f: impl FnMut() + 'static) {
        self.inner.borrow_mut().callback = Some(Box::new(f));
    }

    /// Arm for an absolute deadline, with an optional re-arm period.
    pub fn arm_at(&mut self, at: Instant, period: Option<Duration>) {
        {
            let mut inner = self.inner.borrow_mut();
            assert!(!inner.armed, "timer armed while already armed");
            inner.armed = true;
            inner.expiry = at;
            inner.period = period;
        }
        reactor::current().add_timer(self.inner.clone());
    }

    /// Arm to fire once, `delta` from now.
    pub fn arm(&mut self, delta: Duration) {
        self.arm_at(Instant::now() + delta, None);
    }

    /// Arm to fire every `period`, starting one period from now.
    pub fn arm_periodic(&mut self, period: Duration) {
        self.arm_at(Instant::now() + period, Some(period));
    }

    /// Cancel if armed, then arm for the new deadline.
    pub fn rearm_at(&mut self, at: Instant, period: Option<Duration>) {
        if self.armed() {
            self.cancel();
        }
        self.arm_at(at, period);
    }

    pub fn armed(&self) -> bool {
        self.inner.borrow().armed
    }

    /// Cancel a pending expiry. Returns `false` when there is nothing to
    /// cancel, including after a one-shot timer has fired.
    pub fn cancel(&mut self) -> bool {
        let queued = {
            let mut inner = self.inner.borrow_mut();
            if !inner.armed {
                return false;
            }
            inner.armed = false;
            std::mem::replace(&mut inner.queued, false)
        };
        if queued {
            if let Some(r) = reactor::try_current() {
                r.del_timer(&self.inner);
            }
        }
        true
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let queued = self.inner.borrow().queued;
        if queued {
            if let Some(r) = reactor::try_current() {
                r.del_timer(&self.inner);
            }
        }
    }
}

/// Run a fired timer's callback, leaving the callback in place for
/// periodic re-use. The callback is taken out for the call so it may
/// re-arm or cancel its own timer without re-entrant borrows.
pub(crate) fn run_callback(inner: &Rc<RefCell<TimerInner>>) {
    let cb = inner.borrow_mut().callback.take();
    if let Some(mut cb) = cb {
        cb();
        let mut borrow = inner.borrow_mut();
        if borrow.callback.is_none() {
            borrow.callback = Some(cb);
        }
    }
}

/// Ordered set of armed timers, keyed on (expiry, insertion sequence).
pub struct TimerSet {
    entries: BTreeMap<(Instant, u64), Rc<RefCell<TimerInner>>>,
    next_seq: u64,
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerSet {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn insert(&mut self, timer: Rc<RefCell<TimerInner>>) {
        let key = {
            let mut inner = timer.borrow_mut();
            inner.seq = self.next_seq;
            inner.queued = true;
            (inner.expiry, inner.seq)
        };
        self.next_seq += 1;
        self.entries.insert(key, timer);
    }

    pub(crate) fn remove(&mut self, timer: &Rc<RefCell<TimerInner>>) {
        let key = {
            let mut inner = timer.borrow_mut();
            inner.queued = false;
            (inner.expiry, inner.seq)
        };
        self.entries.remove(&key);
    }

    /// Deadline of the next timer to fire, if any.
    pub fn earliest(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return every timer with `expiry <= now`, preserving
    /// expiry order and insertion order among ties. Periodic timers are
    /// re-inserted at `expiry + period`.
    pub(crate) fn fire_expired(&mut self, now: Instant) -> Vec<Rc<RefCell<TimerInner>>> {
        let mut fired = Vec::new();
        loop {
            let key = match self.entries.keys().next() {
                Some(&(at, seq)) if at <= now => (at, seq),
                _ => break,
            };
            let timer = self.entries.remove(&key).expect("key just observed");
            {
                let mut inner = timer.borrow_mut();
                inner.queued = false;
                match inner.period {
                    Some(period) => inner.expiry += period,
                    None => inner.armed = false,
                }
            }
            if timer.borrow().period.is_some() {
                self.insert(timer.clone());
            }
            fired.push(timer);
        }
        fired
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }
}

/// Resolve after `duration` has elapsed on the current shard.
pub fn sleep(duration: Duration) -> Future<()> {
    let (fut, promise) = Future::new();
    let mut promise = Some(promise);
    reactor::current().schedule_oneshot(Instant::now() + duration, move || {
        if let Some(p) = promise.take() {
            p.set_value(());
        }
    });
    fut
}

/// Race `fut` against a deadline. The loser's outcome is discarded; a
/// late error is routed to the unhandled-error sink.
pub fn timeout<T: 'static>(duration: Duration, fut: Future<T>) -> Future<T> {
    let (out, promise) = Future::new();
    let promise = Rc::new(RefCell::new(Some(promise)));
    let on_value = promise.clone();
    fut.consume(move |r| match on_value.borrow_mut().take() {
        Some(p) => match r {
            Ok(v) => p.set_value(v),
            Err(e) => p.set_error(e),
        },
        None => {
            if let Err(e) = r {
                reactor::report_unhandled(e);
            }
        }
    });
    reactor::current().schedule_oneshot(Instant::now() + duration, move || {
        if let Some(p) = promise.borrow_mut().take() {
            p.set_error(Error::Timeout);
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::test_util::with_reactor;
    use std::cell::Cell;

    #[test]
    fn sleep_waits_at_least_the_duration() {
        with_reactor(|r| {
            let start = Instant::now();
            r.run_until(sleep(Duration::from_millis(20))).unwrap();
            assert!(start.elapsed() >= Duration::from_millis(20));
        });
    }

    #[test]
    fn armed_timer_fires_after_deadline() {
        with_reactor(|r| {
            let fired = Rc::new(Cell::new(false));
            let fired2 = fired.clone();
            let mut t = Timer::new();
            t.set_callback(move || fired2.set(true));
            t.arm(Duration::from_millis(10));
            assert!(t.armed());
            r.run_until(sleep(Duration::from_millis(30))).unwrap();
            assert!(fired.get());
            assert!(!t.armed(), "one-shot timer disarms after firing");
            assert!(!t.cancel(), "cancel after fire reports nothing to cancel");
        });
    }

    #[test]
    fn cancel_prevents_firing() {
        with_reactor(|r| {
            let fired = Rc::new(Cell::new(false));
            let fired2 = fired.clone();
            let mut t = Timer::new();
            t.set_callback(move || fired2.set(true));
            t.arm(Duration::from_millis(10));
            assert!(t.cancel());
            assert!(!t.cancel(), "cancel is idempotent");
            r.run_until(sleep(Duration::from_millis(30))).unwrap();
            assert!(!fired.get());
        });
    }

    #[test]
    fn periodic_timer_rearms_until_cancelled() {
        with_reactor(|r| {
            let count = Rc::new(Cell::new(0u32));
            let count2 = count.clone();
            let mut t = Timer::new();
            t.set_callback(move || count2.set(count2.get() + 1));
            t.arm_periodic(Duration::from_millis(10));
            r.run_until(sleep(Duration::from_millis(45))).unwrap();
            let seen = count.get();
            assert!(seen >= 2, "expected >=2 periodic firings, got {seen}");
            assert!(t.cancel());
            r.run_until(sleep(Duration::from_millis(30))).unwrap();
            assert_eq!(count.get(), seen, "no firings after cancel");
        });
    }

    #[test]
    fn ties_fire_in_insertion_order() {
        with_reactor(|_r| {
            let mut set = TimerSet::new();
            let at = Instant::now();
            let order = Rc::new(RefCell::new(Vec::new()));
            let mut timers = Vec::new();
            for i in 0..3 {
                let order = order.clone();
                let inner = Rc::new(RefCell::new(TimerInner {
                    callback: Some(Box::new(move || order.borrow_mut().push(i))),
                    expiry: at,
                    period: None,
                    armed: true,
                    queued: false,
                    seq: 0,
                }));
                set.insert(inner.clone());
                timers.push(inner);
            }
            let fired = set.fire_expired(at + Duration::from_millis(1));
            assert_eq!(fired.len(), 3);
            for t in &fired {
                run_callback(t);
            }
            assert_eq!(*order.borrow(), vec![0, 1, 2]);
            assert_eq!(set.pending_count(), 0);
        });
    }

    #[test]
    fn timeout_returns_value_or_timeout() {
        with_reactor(|r| {
            let fast = timeout(Duration::from_millis(100), sleep(Duration::from_millis(5)));
            r.run_until(fast).unwrap();
            let slow = timeout(Duration::from_millis(5), sleep(Duration::from_millis(100)));
            assert!(matches!(r.run_until(slow), Err(Error::Timeout)));
        });
    }
}
