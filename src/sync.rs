//! Shard-local asynchronous semaphore
//!
//! Counting semaphore whose `wait` returns a future instead of blocking.
//! Waiters are served strictly in FIFO order, which is what makes it
//! usable as a fairness-preserving backpressure gate for the cross-shard
//! queues and the AIO context.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::Error;
use crate::future::{make_failed_future, make_ready_future, Future, Promise};

struct Inner {
    count: usize,
    waiters: VecDeque<(usize, Promise<()>)>,
    broken: bool,
}

/// A counting semaphore for a single shard. Cloning shares the counter.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<RefCell<Inner>>,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                count,
                waiters: VecDeque::new(),
                broken: false,
            })),
        }
    }

    /// Acquire `units`, suspending the caller while the count is
    /// insufficient. FIFO: a large waiter at the head blocks smaller
    /// waiters behind it.
    pub fn wait(&self, units: usize) -> Future<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.broken {
            return make_failed_future(Error::WaitCancelled);
        }
        if inner.waiters.is_empty() && inner.count >= units {
            inner.count -= units;
            return make_ready_future(());
        }
        let (fut, promise) = Future::new();
        inner.waiters.push_back((units, promise));
        fut
    }

    /// Release `units` and wake any waiters that now fit.
    pub fn signal(&self, units: usize) {
        let mut ready = Vec::new();
        {
            let mut inner = self.inner.borrow_mut();
            inner.count += units;
            while let Some((need, _)) = inner.waiters.front() {
                if *need > inner.count {
                    break;
                }
                let (need, promise) = inner.waiters.pop_front().expect("front checked");
                inner.count -= need;
                ready.push(promise);
            }
        }
        for promise in ready {
            promise.set_value(());
        }
    }

    /// Non-suspending acquire.
    pub fn try_wait(&self, units: usize) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.broken || !inner.waiters.is_empty() || inner.count < units {
            false
        } else {
            inner.count -= units;
            true
        }
    }

    /// Units currently available.
    pub fn available(&self) -> usize {
        self.inner.borrow().count
    }

    /// Number of suspended waiters.
    pub fn waiters(&self) -> usize {
        self.inner.borrow().waiters.len()
    }

    /// Fail all current and future waiters with
    /// [`Error::WaitCancelled`]. Used during shutdown.
    pub fn broken(&self) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            inner.broken = true;
            std::mem::take(&mut inner.waiters)
        };
        for (_, promise) in waiters {
            promise.set_error(Error::WaitCancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::test_util::with_reactor;
    use std::cell::RefCell;

    #[test]
    fn wait_succeeds_when_units_available() {
        with_reactor(|r| {
            let sem = Semaphore::new(2);
            r.run_until(sem.wait(2)).unwrap();
            assert_eq!(sem.available(), 0);
        });
    }

    #[test]
    fn waiters_are_fifo() {
        with_reactor(|r| {
            let sem = Semaphore::new(0);
            let order = Rc::new(RefCell::new(Vec::new()));
            let o1 = order.clone();
            let o2 = order.clone();
            sem.wait(1).then(move |_| o1.borrow_mut().push(1)).discard();
            let last = sem.wait(1).then(move |_| o2.borrow_mut().push(2));
            assert_eq!(sem.waiters(), 2);
            sem.signal(2);
            r.run_until(last).unwrap();
            assert_eq!(*order.borrow(), vec![1, 2]);
        });
    }

    #[test]
    fn large_waiter_blocks_followers() {
        with_reactor(|_r| {
            let sem = Semaphore::new(1);
            sem.wait(3).discard();
            // One unit is free, but the queue head needs three.
            assert!(!sem.try_wait(1));
            assert_eq!(sem.waiters(), 1);
        });
    }

    #[test]
    fn broken_fails_waiters() {
        with_reactor(|r| {
            let sem = Semaphore::new(0);
            let fut = sem.wait(1);
            sem.broken();
            assert!(matches!(r.run_until(fut), Err(Error::WaitCancelled)));
            assert!(matches!(
                r.run_until(sem.wait(1)),
                Err(Error::WaitCancelled)
            ));
        });
    }
}
