//! Continuation-chained futures and promises
//!
//! This module provides the single-assignment value channel at the core of
//! the runtime. A [`Promise`] is the producer end, a [`Future`] the
//! consumer end. Both are shard-local (`!Send`); values cross shards only
//! through the `smp` work-item machinery.
//!
//! ## Scheduling invariant
//!
//! Resolving a future never invokes its continuation on the resolver's
//! stack. The continuation is pushed onto the current shard's task FIFO,
//! so a `then` chain of any depth uses constant stack. Attaching a
//! continuation to an already-ready future performs the same enqueue.
//!
//! ## Error propagation
//!
//! Errors travel along the chain: a `then` continuation is skipped on
//! error and the error re-raises into the output future. `rescue` sees
//! the full `Result` and may recover. Dropping a future that holds an
//! unobserved error reports it to the shard's unhandled-error sink;
//! dropping a promise without resolving it resolves the future with
//! [`Error::BrokenPromise`].

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::reactor;
use crate::task::Task;

enum State<T> {
    Pending,
    Ready(Result<T>),
    Consumed,
}

struct Shared<T> {
    state: State<T>,
    continuation: Option<Box<dyn FnOnce(Result<T>)>>,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let State::Ready(Err(e)) = std::mem::replace(&mut self.state, State::Consumed) {
            reactor::report_unhandled(e);
        }
    }
}

/// The consumer end of a single-assignment channel.
///
/// Attaching a continuation consumes the future; moving transfers the
/// right to attach. A future is resolved at most once and its value is
/// observed at most once.
pub struct Future<T: 'static> {
    shared: Rc<RefCell<Shared<T>>>,
}

/// The producer end of a single-assignment channel.
///
/// Resolved exactly once via [`Promise::set_value`] or
/// [`Promise::set_error`], both of which consume the promise. Dropping an
/// unresolved promise delivers [`Error::BrokenPromise`] to the consumer.
pub struct Promise<T: 'static> {
    shared: Rc<RefCell<Shared<T>>>,
    resolved: bool,
}

impl<T: 'static> Future<T> {
    /// Create a connected future/promise pair.
    pub fn new() -> (Future<T>, Promise<T>) {
        let shared = Rc::new(RefCell::new(Shared {
            state: State::Pending,
            continuation: None,
        }));
        let future = Future {
            shared: shared.clone(),
        };
        let promise = Promise {
            shared,
            resolved: false,
        };
        (future, promise)
    }

    /// True once the producer has resolved and no consumer has taken the
    /// value yet.
    pub fn is_ready(&self) -> bool {
        matches!(self.shared.borrow().state, State::Ready(_))
    }

    /// Take the resolved value. Panics if the future is not ready; use
    /// [`Reactor::run_until`](crate::reactor::Reactor::run_until) to drive
    /// the loop first.
    pub fn take_value(self) -> Result<T> {
        let mut shared = self.shared.borrow_mut();
        match std::mem::replace(&mut shared.state, State::Consumed) {
            State::Ready(r) => r,
            _ => panic!("take_value() on a future that is not ready"),
        }
    }

    /// Core consumption primitive: run `f` with the result, via the task
    /// FIFO, once the producer has resolved.
    pub(crate) fn consume<F>(self, f: F)
    where
        F: FnOnce(Result<T>) + 'static,
    {
        let mut shared = self.shared.borrow_mut();
        match std::mem::replace(&mut shared.state, State::Consumed) {
            State::Ready(r) => {
                drop(shared);
                schedule(move || f(r));
            }
            State::Pending => {
                shared.state = State::Pending;
                shared.continuation = Some(Box::new(f));
            }
            State::Consumed => panic!("future consumed twice"),
        }
    }

    /// Chain a continuation over the value. Errors skip `f` and propagate
    /// into the returned future.
    pub fn then<U, F>(self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.rescue(move |r| r.map(f))
    }

    /// Chain an asynchronous continuation: `f` returns a future whose
    /// outcome becomes the outcome of the returned future.
    pub fn and_then<U, F>(self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> Future<U> + 'static,
    {
        let (fut, promise) = Future::new();
        self.consume(move |r| match r {
            Ok(v) => f(v).forward_to(promise),
            Err(e) => promise.set_error(e),
        });
        fut
    }

    /// Chain a continuation over the full `Result`, allowing uniform
    /// success/error handling and error recovery.
    pub fn rescue<U, F>(self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(Result<T>) -> Result<U> + 'static,
    {
        let (fut, promise) = Future::new();
        self.consume(move |r| match f(r) {
            Ok(v) => promise.set_value(v),
            Err(e) => promise.set_error(e),
        });
        fut
    }

    /// Resolve `promise` with this future's outcome.
    pub fn forward_to(self, promise: Promise<T>) {
        self.consume(move |r| match r {
            Ok(v) => promise.set_value(v),
            Err(e) => promise.set_error(e),
        });
    }

    /// Consume the future, keeping error reporting but discarding the
    /// value. Used for fire-and-forget chains.
    pub fn discard(self) {
        self.consume(|r| {
            if let Err(e) = r {
                reactor::report_unhandled(e);
            }
        });
    }
}

impl<T: 'static> Promise<T> {
    /// Resolve with a value. Consuming `self` makes a second resolve
    /// unrepresentable; the internal state machine still panics if the
    /// channel is somehow resolved twice.
    pub fn set_value(mut self, value: T) {
        self.resolve(Ok(value));
    }

    /// Resolve with an error.
    pub fn set_error(mut self, error: Error) {
        self.resolve(Err(error));
    }

    fn resolve(&mut self, r: Result<T>) {
        let mut shared = self.shared.borrow_mut();
        match shared.state {
            State::Pending => {}
            _ => panic!("promise resolved twice"),
        }
        self.resolved = true;
        if let Some(cont) = shared.continuation.take() {
            shared.state = State::Consumed;
            drop(shared);
            schedule(move || cont(r));
        } else {
            shared.state = State::Ready(r);
        }
    }
}

impl<T: 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.resolved {
            let pending = matches!(self.shared.borrow().state, State::Pending);
            if pending {
                self.resolve(Err(Error::BrokenPromise));
            }
        }
    }
}

/// Push a continuation onto the current shard's task FIFO. Outside a
/// reactor (teardown, plain unit tests) the closure runs inline.
fn schedule(f: impl FnOnce() + 'static) {
    match reactor::try_current() {
        Some(r) => r.add_task(Task::new(f)),
        None => f(),
    }
}

/// A future that is already resolved with `value`.
///
/// Its continuation still goes through the task FIFO, so `then` on a
/// ready future runs in the same main-loop iteration, not inline.
pub fn make_ready_future<T: 'static>(value: T) -> Future<T> {
    let (fut, promise) = Future::new();
    // No continuation can be attached yet, so this stores the value
    // without touching the task queue.
    promise.set_value(value);
    fut
}

/// A future that is already resolved with `error`.
pub fn make_failed_future<T: 'static>(error: Error) -> Future<T> {
    let (fut, promise) = Future::new();
    promise.set_error(error);
    fut
}

/// Resolve once every future in `futs` has resolved, yielding the values
/// in input order. The first error wins; later errors are reported to the
/// unhandled-error sink.
pub fn join_all<T: 'static>(futs: Vec<Future<T>>) -> Future<Vec<T>> {
    if futs.is_empty() {
        return make_ready_future(Vec::new());
    }
    let n = futs.len();
    let (fut, promise) = Future::new();
    let slots: Rc<RefCell<Vec<Option<T>>>> =
        Rc::new(RefCell::new((0..n).map(|_| None).collect()));
    let first_error: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
    let remaining = Rc::new(std::cell::Cell::new(n));
    let promise = Rc::new(RefCell::new(Some(promise)));

    for (i, f) in futs.into_iter().enumerate() {
        let slots = slots.clone();
        let first_error = first_error.clone();
        let remaining = remaining.clone();
        let promise = promise.clone();
        f.consume(move |r| {
            match r {
                Ok(v) => slots.borrow_mut()[i] = Some(v),
                Err(e) => {
                    let mut first = first_error.borrow_mut();
                    if first.is_none() {
                        *first = Some(e);
                    } else {
                        reactor::report_unhandled(e);
                    }
                }
            }
            remaining.set(remaining.get() - 1);
            if remaining.get() == 0 {
                let promise = promise.borrow_mut().take().expect("join_all resolved twice");
                match first_error.borrow_mut().take() {
                    Some(e) => promise.set_error(e),
                    None => {
                        let values = slots
                            .borrow_mut()
                            .drain(..)
                            .map(|v| v.expect("join_all slot missing"))
                            .collect();
                        promise.set_value(values);
                    }
                }
            }
        });
    }
    fut
}

/// Resolve once every unit future in `futs` has resolved.
pub fn when_all(futs: Vec<Future<()>>) -> Future<()> {
    join_all(futs).then(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::test_util::with_reactor;
    use std::cell::Cell;

    #[test]
    fn ready_future_then_identity() {
        with_reactor(|r| {
            let fut = make_ready_future(42).then(|v| v);
            assert_eq!(r.run_until(fut).unwrap(), 42);
        });
    }

    #[test]
    fn then_chain_transforms_value() {
        with_reactor(|r| {
            let fut = make_ready_future(1).then(|v| v + 1).then(|v| v * 10);
            assert_eq!(r.run_until(fut).unwrap(), 20);
        });
    }

    #[test]
    fn continuation_runs_once_after_resolve() {
        with_reactor(|r| {
            let (fut, promise) = Future::<u32>::new();
            let runs = Rc::new(Cell::new(0u32));
            let runs2 = runs.clone();
            let chained = fut.then(move |v| {
                runs2.set(runs2.get() + 1);
                v
            });
            // Not resolved yet, so the continuation cannot have run.
            assert_eq!(runs.get(), 0);
            promise.set_value(7);
            assert_eq!(runs.get(), 0, "continuation must go through the task FIFO");
            assert_eq!(r.run_until(chained).unwrap(), 7);
            assert_eq!(runs.get(), 1);
        });
    }

    #[test]
    fn error_skips_then_and_propagates() {
        with_reactor(|r| {
            let fut: Future<u32> = make_failed_future(Error::Timeout);
            let touched = Rc::new(Cell::new(false));
            let touched2 = touched.clone();
            let chained = fut.then(move |v| {
                touched2.set(true);
                v
            });
            let res = r.run_until(chained);
            assert!(matches!(res, Err(Error::Timeout)));
            assert!(!touched.get());
        });
    }

    #[test]
    fn rescue_recovers_from_error() {
        with_reactor(|r| {
            let fut: Future<u32> = make_failed_future(Error::Timeout);
            let chained = fut.rescue(|res| match res {
                Ok(v) => Ok(v),
                Err(_) => Ok(99),
            });
            assert_eq!(r.run_until(chained).unwrap(), 99);
        });
    }

    #[test]
    fn and_then_chains_futures() {
        with_reactor(|r| {
            let fut = make_ready_future(3).and_then(|v| make_ready_future(v * 2));
            assert_eq!(r.run_until(fut).unwrap(), 6);
        });
    }

    #[test]
    fn dropped_promise_breaks_future() {
        with_reactor(|r| {
            let (fut, promise) = Future::<u32>::new();
            drop(promise);
            let res = r.run_until(fut);
            assert!(matches!(res, Err(Error::BrokenPromise)));
        });
    }

    #[test]
    fn then_chain_is_fifo_with_plain_tasks() {
        with_reactor(|r| {
            let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
            let o1 = order.clone();
            let o2 = order.clone();
            let fut = make_ready_future(()).then(move |_| o1.borrow_mut().push(1));
            let o3 = order.clone();
            r.add_task(Task::new(move || o3.borrow_mut().push(2)));
            let fut = fut.then(move |_| o2.borrow_mut().push(3));
            r.run_until(fut).unwrap();
            assert_eq!(*order.borrow(), vec![1, 2, 3]);
        });
    }

    #[test]
    fn join_all_collects_in_order() {
        with_reactor(|r| {
            let futs = vec![
                make_ready_future(1),
                make_ready_future(2),
                make_ready_future(3),
            ];
            assert_eq!(r.run_until(join_all(futs)).unwrap(), vec![1, 2, 3]);
        });
    }

    #[test]
    fn join_all_first_error_wins() {
        with_reactor(|r| {
            let futs = vec![
                make_ready_future(1),
                make_failed_future(Error::Timeout),
                make_ready_future(3),
            ];
            let res = r.run_until(join_all(futs));
            assert!(matches!(res, Err(Error::Timeout)));
        });
    }

    #[test]
    fn unhandled_error_reaches_sink() {
        with_reactor(|r| {
            let seen = Rc::new(Cell::new(false));
            let seen2 = seen.clone();
            r.set_unhandled_error_sink(move |_| seen2.set(true));
            let fut: Future<u32> = make_failed_future(Error::Timeout);
            drop(fut);
            assert!(seen.get());
        });
    }
}
