//! Per-shard event loop
//!
//! One `Reactor` per shard, pinned to its OS thread and reachable through
//! [`current()`]. The main loop drains the pending-task FIFO (bounded by
//! `task_quota` so a ready-future chain cannot starve I/O), fires expired
//! timers, runs registered pollers and the built-in work sources
//! (cross-shard queues, AIO completions, blocking-pool completions), then
//! asks the backend to wait, blocking only when nothing reported work.
//!
//! The reactor also owns the shard's AIO context (io_uring, 128 entries
//! gated by a 128-permit semaphore) and a lazily-started helper thread for
//! unavoidable blocking syscalls.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use io_uring::{squeue, IoUring};
use once_cell::unsync::OnceCell;

use crate::backend::{new_eventfd, Backend};
use crate::blocking::BlockingPool;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::future::{make_failed_future, make_ready_future, Future, Promise};
use crate::net::NetworkStack;
use crate::smp;
use crate::sync::Semaphore;
use crate::task::Task;
use crate::timer::{self, TimerInner, TimerSet};

/// Capacity of the per-shard AIO context and its gating semaphore.
pub const AIO_DEPTH: usize = 128;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Reactor>>> = const { RefCell::new(None) };
}

/// The reactor driving the calling thread. Panics outside a shard.
pub fn current() -> Rc<Reactor> {
    try_current().expect("not running inside a reactor")
}

pub(crate) fn try_current() -> Option<Rc<Reactor>> {
    CURRENT.with(|c| c.borrow().clone())
}

pub(crate) fn install(reactor: Rc<Reactor>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(reactor));
}

pub(crate) fn uninstall() {
    CURRENT.with(|c| c.borrow_mut().take());
}

/// Deliver an error nobody consumed to the shard's unhandled-error sink
/// (stderr by default). Never silently discards.
pub(crate) fn report_unhandled(e: Error) {
    match try_current() {
        Some(r) => r.report_error(&e),
        None => eprintln!("unhandled error: {e}"),
    }
}

pub(crate) fn io_result(ret: i32) -> Result<usize> {
    if ret < 0 {
        Err(io::Error::from_raw_os_error(-ret).into())
    } else {
        Ok(ret as usize)
    }
}

type ExitHook = Box<dyn FnOnce() -> Future<()>>;

pub struct Reactor {
    id: usize,
    cfg: Config,
    backend: Backend,
    tasks: RefCell<VecDeque<Task>>,
    timers: RefCell<TimerSet>,
    armed_until: Cell<Option<Instant>>,
    pollers: RefCell<Vec<Box<dyn FnMut() -> bool>>>,
    task_quota: usize,
    stopped: Cell<bool>,
    exiting: Cell<bool>,
    exit_done: Cell<bool>,
    return_code: Cell<i32>,
    exit_hooks: RefCell<Vec<ExitHook>>,
    unhandled_sink: RefCell<Option<Box<dyn Fn(&Error)>>>,
    io: OnceCell<Option<IoEngine>>,
    blocking: OnceCell<BlockingPool>,
    net_stack: RefCell<Option<Rc<dyn NetworkStack>>>,
    idle: Arc<AtomicBool>,
}

impl Reactor {
    pub(crate) fn new(id: usize, cfg: &Config) -> io::Result<Rc<Reactor>> {
        let signal_rx = if id == 0 {
            let (tx, rx) = crossbeam_channel::unbounded();
            Some((tx, rx))
        } else {
            None
        };
        let backend = Backend::new(signal_rx.as_ref().map(|(_, rx)| rx.clone()))?;
        if let Some((tx, _)) = signal_rx {
            crate::signal::install_sink(tx, backend.wake_handle());
        }
        Ok(Rc::new(Reactor {
            id,
            cfg: cfg.clone(),
            backend,
            tasks: RefCell::new(VecDeque::with_capacity(128)),
            timers: RefCell::new(TimerSet::new()),
            armed_until: Cell::new(None),
            pollers: RefCell::new(Vec::new()),
            task_quota: cfg.task_quota,
            stopped: Cell::new(false),
            exiting: Cell::new(false),
            exit_done: Cell::new(false),
            return_code: Cell::new(0),
            exit_hooks: RefCell::new(Vec::new()),
            unhandled_sink: RefCell::new(None),
            io: OnceCell::new(),
            blocking: OnceCell::new(),
            net_stack: RefCell::new(None),
            idle: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub(crate) fn idle_flag(&self) -> Arc<AtomicBool> {
        self.idle.clone()
    }

    /// Append a task to the pending FIFO. Tasks on one shard run in FIFO
    /// order.
    pub fn add_task(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }

    pub(crate) fn add_timer(&self, inner: Rc<RefCell<TimerInner>>) {
        self.timers.borrow_mut().insert(inner);
        self.sync_timer_arm();
    }

    pub(crate) fn del_timer(&self, inner: &Rc<RefCell<TimerInner>>) {
        self.timers.borrow_mut().remove(inner);
    }

    pub(crate) fn schedule_oneshot(&self, at: Instant, f: impl FnMut() + 'static) {
        self.add_timer(Rc::new(RefCell::new(TimerInner {
            callback: Some(Box::new(f)),
            expiry: at,
            period: None,
            armed: true,
            queued: false,
            seq: 0,
        })));
    }

    /// Register a non-blocking poller, called every main-loop iteration.
    /// Returning `true` means it found work and forbids blocking in the
    /// current iteration.
    pub fn register_poller(&self, f: impl FnMut() -> bool + 'static) {
        self.pollers.borrow_mut().push(Box::new(f));
    }

    /// Register a hook run at shutdown. Hooks run in reverse registration
    /// order; each may return a future which is awaited before the next
    /// hook runs.
    pub fn at_exit(&self, f: impl FnOnce() -> Future<()> + 'static) {
        self.exit_hooks.borrow_mut().push(Box::new(f));
    }

    /// Request this shard's loop to stop with `code` after the exit hooks
    /// have run. For a whole-runtime shutdown see
    /// [`smp::exit_all`](crate::smp::exit_all).
    pub fn exit(&self, code: i32) {
        if !self.stopped.get() {
            self.return_code.set(code);
            self.stopped.set(true);
        }
    }

    /// Replace the unhandled-error sink (stderr by default).
    pub fn set_unhandled_error_sink(&self, f: impl Fn(&Error) + 'static) {
        *self.unhandled_sink.borrow_mut() = Some(Box::new(f));
    }

    fn report_error(&self, e: &Error) {
        match &*self.unhandled_sink.borrow() {
            Some(sink) => sink(e),
            None => {
                tracing::error!(shard = self.id, "unhandled error: {e}");
                eprintln!("unhandled error on shard {}: {e}", self.id);
            }
        }
    }

    /// Hand a blocking closure to the shard's helper thread.
    pub fn submit_blocking<T, F>(&self, f: F) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.blocking_pool().submit(f)
    }

    fn blocking_pool(&self) -> &BlockingPool {
        self.blocking
            .get_or_init(|| BlockingPool::new(self.id, self.backend.wake_handle()))
    }

    pub(crate) fn io_engine(&self) -> Option<&IoEngine> {
        self.io
            .get_or_init(|| match IoEngine::new(&self.backend) {
                Ok(engine) => Some(engine),
                Err(e) => {
                    tracing::warn!(
                        shard = self.id,
                        "io_uring unavailable, AIO falls back to the blocking pool: {e}"
                    );
                    None
                }
            })
            .as_ref()
    }

    /// Submit one AIO operation. Acquires one of [`AIO_DEPTH`] permits
    /// (suspending when exhausted), pushes the prepared SQE and resolves
    /// with the raw CQE result (negative values are `-errno`).
    pub fn submit_io<F>(self: &Rc<Self>, prepare: F) -> Future<i32>
    where
        F: FnOnce() -> squeue::Entry + 'static,
    {
        let permits = match self.io_engine() {
            Some(io) => io.permits.clone(),
            None => {
                return make_failed_future(Error::Io(io::Error::other(
                    "AIO context unavailable",
                )))
            }
        };
        let this = self.clone();
        permits.wait(1).and_then(move |_| {
            let io = this.io_engine().expect("AIO context initialised above");
            let id = io.next_id.get();
            io.next_id.set(id + 1);
            let entry = prepare().user_data(id);
            let (fut, promise) = Future::new();
            io.pending.borrow_mut().insert(id, promise);
            let mut ring = io.ring.borrow_mut();
            if unsafe { ring.submission().push(&entry) }.is_err() {
                drop(ring);
                io.pending.borrow_mut().remove(&id);
                io.permits.signal(1);
                return make_failed_future(Error::Io(io::Error::other(
                    "submission queue overflow",
                )));
            }
            if let Err(e) = ring.submit() {
                drop(ring);
                io.pending.borrow_mut().remove(&id);
                io.permits.signal(1);
                return make_failed_future(Error::from(e));
            }
            drop(ring);
            fut
        })
    }

    /// The shard's network stack, created from the registry on first use.
    pub fn net(&self) -> Result<Rc<dyn NetworkStack>> {
        let mut slot = self.net_stack.borrow_mut();
        if slot.is_none() {
            *slot = Some(crate::net::create_stack(&self.cfg)?);
        }
        Ok(slot.as_ref().expect("just created").clone())
    }

    fn sync_timer_arm(&self) {
        let earliest = self.timers.borrow().earliest();
        if earliest != self.armed_until.get() {
            if let Some(at) = earliest {
                self.backend.arm_timer(at);
            }
            self.armed_until.set(earliest);
        }
    }

    fn reap_io(&self) -> bool {
        match self.io.get() {
            Some(Some(engine)) => engine.reap(),
            _ => false,
        }
    }

    fn reap_blocking(&self) -> bool {
        match self.blocking.get() {
            Some(pool) => pool.reap(),
            None => false,
        }
    }

    /// One main-loop iteration.
    pub(crate) fn run_iteration(self: &Rc<Self>) {
        // 1. Drain tasks, bounded by the quota.
        let mut executed = 0usize;
        while executed < self.task_quota {
            let task = self.tasks.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task.run();
                    executed += 1;
                }
                None => break,
            }
        }

        // 2. Move expired timer callbacks into the FIFO.
        let fired = self.timers.borrow_mut().fire_expired(Instant::now());
        let timers_fired = !fired.is_empty();
        for t in fired {
            self.add_task(Task::new(move || timer::run_callback(&t)));
        }

        // 3. Pollers and built-in work sources.
        let mut work = executed > 0 || timers_fired;
        work |= smp::poll_queues();
        work |= self.reap_io();
        work |= self.reap_blocking();
        {
            let mut pollers = self.pollers.borrow_mut();
            for p in pollers.iter_mut() {
                work |= p();
            }
        }

        self.sync_timer_arm();

        // 4. Wait. Block only when no poller reported work, the FIFO is
        // empty and (after publishing the idle flag) the cross-shard
        // rings are still empty.
        let block = !work && self.tasks.borrow().is_empty() && !self.stopped.get();
        if block {
            smp::enter_idle(self.id);
            if smp::poll_queues() {
                smp::leave_idle(self.id);
                self.backend.wait_and_process(false, || {});
            } else {
                self.backend.wait_and_process(true, || {
                    smp::poll_queues();
                });
                smp::leave_idle(self.id);
            }
        } else {
            self.backend.wait_and_process(false, || {
                smp::poll_queues();
            });
        }
    }

    /// Run the main loop until `exit()` has been requested and the exit
    /// hooks have completed, then return the exit code.
    pub fn run(self: &Rc<Self>) -> i32 {
        tracing::info!(shard = self.id, "reactor started");
        loop {
            if self.stopped.get() && !self.exiting.get() {
                self.exiting.set(true);
                self.start_exit();
            }
            if self.exit_done.get() {
                let code = self.return_code.get();
                tracing::info!(shard = self.id, code, "reactor stopped");
                return code;
            }
            self.run_iteration();
        }
    }

    /// Drive the loop until `fut` resolves. The entry point for tests and
    /// single-shard embedding.
    pub fn run_until<T: 'static>(self: &Rc<Self>, fut: Future<T>) -> Result<T> {
        while !fut.is_ready() {
            self.run_iteration();
        }
        fut.take_value()
    }

    fn start_exit(self: &Rc<Self>) {
        let hooks = std::mem::take(&mut *self.exit_hooks.borrow_mut());
        tracing::debug!(shard = self.id, hooks = hooks.len(), "running exit hooks");
        let this = self.clone();
        run_hooks(hooks)
            .rescue(move |r| {
                if let Err(e) = r {
                    report_unhandled(e);
                }
                this.exit_done.set(true);
                Ok(())
            })
            .discard();
    }
}

/// Await exit hooks one at a time, last registered first.
fn run_hooks(mut hooks: Vec<ExitHook>) -> Future<()> {
    match hooks.pop() {
        None => make_ready_future(()),
        Some(hook) => hook()
            .rescue(|r| {
                if let Err(e) = r {
                    report_unhandled(e);
                }
                Ok(())
            })
            .and_then(move |_| run_hooks(hooks)),
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if let Some(pool) = self.blocking.take() {
            pool.shutdown();
        }
    }
}

/// Per-shard AIO context: an io_uring instance with [`AIO_DEPTH`] entries
/// and a semaphore gating outstanding submissions.
pub(crate) struct IoEngine {
    ring: RefCell<IoUring>,
    pub(crate) permits: Semaphore,
    pending: RefCell<HashMap<u64, Promise<i32>>>,
    next_id: Cell<u64>,
    event_fd: RawFd,
}

impl IoEngine {
    fn new(backend: &Backend) -> io::Result<Self> {
        let ring = IoUring::new(AIO_DEPTH as u32)?;
        let event_fd = new_eventfd(true)?;
        backend.add_wake_fd(event_fd)?;
        ring.submitter().register_eventfd(event_fd)?;
        Ok(Self {
            ring: RefCell::new(ring),
            permits: Semaphore::new(AIO_DEPTH),
            pending: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            event_fd,
        })
    }

    fn reap(&self) -> bool {
        let mut completions = Vec::new();
        {
            let mut ring = self.ring.borrow_mut();
            let mut cq = ring.completion();
            cq.sync();
            for cqe in &mut cq {
                completions.push((cqe.user_data(), cqe.result()));
            }
        }
        let did_work = !completions.is_empty();
        for (id, result) in completions {
            self.permits.signal(1);
            match self.pending.borrow_mut().remove(&id) {
                Some(promise) => promise.set_value(result),
                None => tracing::warn!(id, "completion for unknown AIO submission"),
            }
        }
        did_work
    }
}

impl Drop for IoEngine {
    fn drop(&mut self) {
        unsafe { libc::close(self.event_fd) };
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Run `f` with a fresh reactor installed on the calling thread.
    pub(crate) fn with_reactor<R>(f: impl FnOnce(&Rc<Reactor>) -> R) -> R {
        let reactor = Reactor::new(0, &Config::default()).expect("reactor setup");
        install(reactor.clone());
        let out = f(&reactor);
        uninstall();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::with_reactor;
    use super::*;
    use crate::future::when_all;
    use std::time::Duration;

    #[test]
    fn task_quota_bounds_one_iteration() {
        with_reactor(|r| {
            let counter = Rc::new(Cell::new(0u32));
            for _ in 0..300 {
                let counter = counter.clone();
                r.add_task(Task::new(move || counter.set(counter.get() + 1)));
            }
            r.run_iteration();
            assert_eq!(counter.get(), 256, "one iteration executes task_quota tasks");
            r.run_iteration();
            assert_eq!(counter.get(), 300);
        });
    }

    #[test]
    fn exit_hooks_run_in_reverse_order() {
        with_reactor(|r| {
            let order = Rc::new(RefCell::new(Vec::new()));
            for i in 0..3 {
                let order = order.clone();
                r.at_exit(move || {
                    order.borrow_mut().push(i);
                    make_ready_future(())
                });
            }
            r.exit(7);
            assert_eq!(r.run(), 7);
            assert_eq!(*order.borrow(), vec![2, 1, 0]);
        });
    }

    #[test]
    fn async_exit_hook_is_awaited() {
        with_reactor(|r| {
            let done = Rc::new(Cell::new(false));
            let done2 = done.clone();
            r.at_exit(move || {
                crate::timer::sleep(Duration::from_millis(10)).then(move |_| done2.set(true))
            });
            r.exit(0);
            assert_eq!(r.run(), 0);
            assert!(done.get());
        });
    }

    #[test]
    fn submit_blocking_returns_value() {
        with_reactor(|r| {
            let futs = (0..4)
                .map(|i| r.submit_blocking(move || i * 2).then(move |v| assert_eq!(v, i * 2)))
                .collect();
            r.run_until(when_all(futs)).unwrap();
        });
    }

    #[test]
    fn poller_work_is_observed() {
        with_reactor(|r| {
            let calls = Rc::new(Cell::new(0u32));
            let calls2 = calls.clone();
            r.register_poller(move || {
                calls2.set(calls2.get() + 1);
                false
            });
            r.run_iteration();
            assert_eq!(calls.get(), 1);
        });
    }
}
