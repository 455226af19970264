//! Inter-shard message queues and the shard runtime
//!
//! For `N` shards there are `N×N` queue objects; `queues[dst][src]` is
//! written by `src` and read by `dst`. Each queue pairs a `pending` ring
//! (requests) with a `completed` ring (responses), both fixed at 128
//! entries, plus start/complete eventfd notifiers for waking a blocked
//! peer.
//!
//! A work item is allocated on the source shard, shipped by ownership,
//! processed on the destination, shipped back and consumed on the source.
//! Per (source, destination) pair items are processed and completed in
//! submission order; ordering across different sources is unspecified.
//! The 128-permit semaphore per pair is the backpressure mechanism:
//! submitters suspend, they never fail.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_queue::ArrayQueue;
use once_cell::sync::OnceCell;

use crate::backend::{new_eventfd, NotifierHandle};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::future::{make_ready_future, when_all, Future, Promise};
use crate::reactor::{self, Reactor};
use crate::sync::Semaphore;
use crate::task::Task;

/// Capacity of each pending/completed ring, and the number of in-flight
/// permits per ordered shard pair.
pub const QUEUE_LENGTH: usize = 128;

pub(crate) trait WorkItem {
    /// Runs on the destination shard; resolves once the item has captured
    /// its result and is ready to ship back.
    fn process(self: Box<Self>) -> Future<ItemBox>;
    /// Runs on the origin shard; resolves the caller's promise.
    fn complete(self: Box<Self>);
}

pub(crate) struct ItemBox(Box<dyn WorkItem>);

// The promise inside an item is only touched on the source shard; the
// destination touches only the closure and the result slot. The item is
// allocated and freed on the source shard.
unsafe impl Send for ItemBox {}

struct AsyncWorkItem<T: 'static, F> {
    func: Option<F>,
    result: Option<Result<T>>,
    promise: Option<Promise<T>>,
}

impl<T, F> WorkItem for AsyncWorkItem<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> Future<T> + Send + 'static,
{
    fn process(mut self: Box<Self>) -> Future<ItemBox> {
        let func = self.func.take().expect("work item processed twice");
        let fut = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(func)) {
            Ok(fut) => fut,
            Err(payload) => crate::future::make_failed_future(Error::Remote {
                message: panic_message(payload),
            }),
        };
        fut.rescue(move |r| {
            self.result = Some(r);
            let boxed: Box<dyn WorkItem> = self;
            Ok(ItemBox(boxed))
        })
    }

    fn complete(mut self: Box<Self>) {
        let promise = self.promise.take().expect("work item completed twice");
        match self.result.take().expect("work item completed before processing") {
            Ok(v) => promise.set_value(v),
            Err(e) => promise.set_error(e),
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

struct SmpQueue {
    pending: ArrayQueue<ItemBox>,
    completed: ArrayQueue<ItemBox>,
    start: NotifierHandle,
    complete: NotifierHandle,
    start_fd: RawFd,
    complete_fd: RawFd,
}

impl SmpQueue {
    fn new() -> io::Result<Self> {
        let start_fd = new_eventfd(true)?;
        let complete_fd = new_eventfd(true)?;
        Ok(Self {
            pending: ArrayQueue::new(QUEUE_LENGTH),
            completed: ArrayQueue::new(QUEUE_LENGTH),
            start: NotifierHandle::new(start_fd),
            complete: NotifierHandle::new(complete_fd),
            start_fd,
            complete_fd,
        })
    }
}

struct ShardEntry {
    idle: OnceCell<Arc<AtomicBool>>,
}

struct Global {
    count: usize,
    shards: Vec<ShardEntry>,
    // queues[dst][src]; the diagonal is present but unused.
    queues: Vec<Vec<SmpQueue>>,
}

static RUNTIME: OnceCell<Global> = OnceCell::new();

/// Source-side and destination-side per-peer state. Lives on the shard's
/// thread; the shared matrix holds only the lock-free parts.
struct PeerState {
    permits: Semaphore,
    incoming: RefCell<VecDeque<ItemBox>>,
    busy: Cell<bool>,
}

struct LocalSmp {
    id: usize,
    peers: Vec<PeerState>,
}

thread_local! {
    static LOCAL: RefCell<Option<Rc<LocalSmp>>> = const { RefCell::new(None) };
}

fn local() -> Option<Rc<LocalSmp>> {
    LOCAL.with(|l| l.borrow().clone())
}

fn init_local(id: usize, count: usize) {
    let peers = (0..count)
        .map(|_| PeerState {
            permits: Semaphore::new(QUEUE_LENGTH),
            incoming: RefCell::new(VecDeque::new()),
            busy: Cell::new(false),
        })
        .collect();
    LOCAL.with(|l| *l.borrow_mut() = Some(Rc::new(LocalSmp { id, peers })));
}

/// Number of shards fixed at configure time (1 before configuration).
pub fn shard_count() -> usize {
    RUNTIME.get().map_or(1, |g| g.count)
}

/// Id of the shard driving the calling thread.
pub fn this_shard_id() -> usize {
    reactor::current().id()
}

/// Run `func` on shard `dst` and resolve with its return value on the
/// calling shard. A local destination runs `func` inline, wrapped into a
/// ready future. Arguments must be owned (`Send`); nothing is borrowed
/// across shards.
pub fn submit_to<T, F>(dst: usize, func: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if dst == this_shard_id() {
        let v = func();
        return make_ready_future(v);
    }
    submit_to_async(dst, move || make_ready_future(func()))
}

/// Like [`submit_to`], for closures that start asynchronous work on the
/// destination: the returned future is awaited there and only the final
/// value ships back.
pub fn submit_to_async<T, F>(dst: usize, func: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> Future<T> + Send + 'static,
{
    let src = this_shard_id();
    if dst == src {
        return func();
    }
    let g = RUNTIME.get().expect("shard runtime not configured");
    assert!(dst < g.count, "shard {dst} out of range (count {})", g.count);
    let l = local().expect("smp state missing on this thread");

    let (fut, promise) = Future::new();
    let item = ItemBox(Box::new(AsyncWorkItem {
        func: Some(func),
        result: None,
        promise: Some(promise),
    }));
    l.peers[dst].permits
        .wait(1)
        .then(move |_| {
            let g = RUNTIME.get().expect("shard runtime not configured");
            let q = &g.queues[dst][src];
            // Bounded by the permit just acquired.
            assert!(q.pending.push(item).is_ok(), "pending ring overflow");
            maybe_wake(dst, q.start);
        })
        .discard();
    fut
}

/// Permits currently available for submissions to `dst` from this shard.
pub fn submit_permits_available(dst: usize) -> usize {
    local().map_or(QUEUE_LENGTH, |l| l.peers[dst].permits.available())
}

/// Submitters currently suspended on the `dst` permit semaphore.
pub fn submit_waiters(dst: usize) -> usize {
    local().map_or(0, |l| l.peers[dst].permits.waiters())
}

/// Wake `dst` only when it is parked in its backend; a running shard
/// drains the rings on its next iteration anyway.
fn maybe_wake(dst: usize, notifier: NotifierHandle) {
    fence(Ordering::SeqCst);
    let idle = RUNTIME
        .get()
        .and_then(|g| g.shards[dst].idle.get())
        .map_or(false, |flag| flag.load(Ordering::Relaxed));
    if idle {
        notifier.signal();
    }
}

pub(crate) fn enter_idle(id: usize) {
    if let Some(flag) = RUNTIME.get().and_then(|g| g.shards[id].idle.get()) {
        flag.store(true, Ordering::Relaxed);
    }
    fence(Ordering::SeqCst);
}

pub(crate) fn leave_idle(id: usize) {
    if let Some(flag) = RUNTIME.get().and_then(|g| g.shards[id].idle.get()) {
        flag.store(false, Ordering::Relaxed);
    }
}

/// Drain this shard's cross-shard rings: move incoming requests into the
/// per-source FIFOs, keep the per-source processing chains running, and
/// consume completed responses. Returns whether anything moved.
pub(crate) fn poll_queues() -> bool {
    let Some(l) = local() else {
        return false;
    };
    let Some(g) = RUNTIME.get() else {
        return false;
    };
    let mut got = false;
    for src in 0..g.count {
        if src == l.id {
            continue;
        }
        let q = &g.queues[l.id][src];
        while let Some(item) = q.pending.pop() {
            l.peers[src].incoming.borrow_mut().push_back(item);
            got = true;
        }
        pump(src);

        let qc = &g.queues[src][l.id];
        while let Some(item) = qc.completed.pop() {
            item.0.complete();
            l.peers[src].permits.signal(1);
            got = true;
        }
    }
    got
}

/// Process the per-source FIFO one item at a time: the next item starts
/// only after the previous item's `process()` future resolved. This is
/// what turns per-queue FIFO delivery into FIFO completion.
fn pump(src: usize) {
    let Some(l) = local() else {
        return;
    };
    if l.peers[src].busy.get() {
        return;
    }
    let item = l.peers[src].incoming.borrow_mut().pop_front();
    let Some(item) = item else {
        return;
    };
    l.peers[src].busy.set(true);
    let dst = l.id;
    item.0
        .process()
        .then(move |item| {
            let g = RUNTIME.get().expect("shard runtime not configured");
            let q = &g.queues[dst][src];
            assert!(q.completed.push(item).is_ok(), "completed ring overflow");
            maybe_wake(src, q.complete);
            if let Some(l) = local() {
                l.peers[src].busy.set(false);
            }
            pump(src);
        })
        .discard();
}

/// Initiate a clean whole-runtime shutdown with `code`. Shard 0
/// broadcasts the exit to every shard; each runs its exit hooks and
/// stops.
pub fn exit_all(code: i32) {
    if this_shard_id() == 0 {
        initiate_exit(code);
    } else {
        submit_to(0, move || initiate_exit(code)).discard();
    }
}

fn initiate_exit(code: i32) {
    tracing::info!(code, "broadcasting exit to all shards");
    let count = shard_count();
    let acks: Vec<Future<()>> = (1..count)
        .map(|i| {
            submit_to(i, move || {
                reactor::current().exit(code);
            })
        })
        .collect();
    when_all(acks)
        .then(move |_| {
            reactor::current().exit(code);
        })
        .discard();
}

fn setup_shard(id: usize, cfg: &Config) -> io::Result<Rc<Reactor>> {
    let r = Reactor::new(id, cfg)?;
    reactor::install(r.clone());
    let g = RUNTIME.get().expect("shard runtime not configured");
    init_local(id, g.count);
    let _ = g.shards[id].idle.set(r.idle_flag());
    for src in 0..g.count {
        if src != id {
            if let Err(e) = r.backend().add_wake_fd(g.queues[id][src].start_fd) {
                tracing::warn!("failed to register start notifier: {e}");
            }
        }
    }
    for dst in 0..g.count {
        if dst != id {
            if let Err(e) = r.backend().add_wake_fd(g.queues[dst][id].complete_fd) {
                tracing::warn!("failed to register complete notifier: {e}");
            }
        }
    }
    Ok(r)
}

fn shard_main(id: usize, cfg: &Config) {
    set_affinity(id);
    let r = setup_shard(id, cfg).expect("shard setup failed");
    r.run();
    reactor::uninstall();
}

#[cfg(target_os = "linux")]
fn set_affinity(id: usize) {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpu = id % num_cpus::get();
    let mut cpu_set = CpuSet::new();
    if cpu_set.set(cpu).is_err() {
        return;
    }
    if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        tracing::warn!(shard = id, "failed to set CPU affinity: {e}");
    } else {
        tracing::debug!(shard = id, cpu, "pinned shard thread");
    }
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(_id: usize) {}

/// The fixed shard set: one reactor per OS thread. Construct once per
/// process, then [`run`](ShardRuntime::run) the main function on shard 0.
pub struct ShardRuntime {
    threads: Vec<thread::JoinHandle<()>>,
    reactor: Rc<Reactor>,
}

impl ShardRuntime {
    /// Allocate the queue matrix, spawn shards `1..smp` on their own
    /// pinned threads and turn the calling thread into shard 0.
    pub fn new(cfg: &Config) -> Result<ShardRuntime> {
        let count = cfg.smp.unwrap_or_else(num_cpus::get).max(1);
        let shards = (0..count)
            .map(|_| ShardEntry {
                idle: OnceCell::new(),
            })
            .collect();
        let mut queues = Vec::with_capacity(count);
        for _dst in 0..count {
            let mut row = Vec::with_capacity(count);
            for _src in 0..count {
                row.push(SmpQueue::new().map_err(Error::Io)?);
            }
            queues.push(row);
        }
        RUNTIME
            .set(Global {
                count,
                shards,
                queues,
            })
            .map_err(|_| Error::Io(io::Error::other("shard runtime already configured")))?;

        tracing::info!(shards = count, "starting shard runtime");
        let mut threads = Vec::with_capacity(count.saturating_sub(1));
        for id in 1..count {
            let cfg = cfg.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("shard-{id}"))
                    .spawn(move || shard_main(id, &cfg))
                    .map_err(|e| Error::Io(e))?,
            );
        }
        let reactor = setup_shard(0, cfg).map_err(Error::Io)?;
        if cfg.handle_sigint {
            crate::signal::start_router();
            install_default_signal_handlers(&reactor);
        }
        Ok(ShardRuntime { threads, reactor })
    }

    pub fn shard_count(&self) -> usize {
        shard_count()
    }

    /// Schedule `main` on shard 0 and drive every shard until shutdown.
    /// When the main future resolves, exit is broadcast with code 0 (an
    /// error logs and exits 1); `exit_all(code)` from anywhere overrides.
    /// Returns once all shard threads have been joined.
    pub fn run<F>(self, main: F) -> i32
    where
        F: FnOnce() -> Future<()> + 'static,
    {
        let r = self.reactor.clone();
        r.add_task(Task::new(move || {
            main()
                .rescue(|res| {
                    let code = match res {
                        Ok(()) => 0,
                        Err(e) => {
                            tracing::error!("main future failed: {e}");
                            1
                        }
                    };
                    exit_all(code);
                    Ok(())
                })
                .discard();
        }));
        let code = self.reactor.run();
        for t in self.threads {
            let _ = t.join();
        }
        reactor::uninstall();
        tracing::info!(code, "shard runtime stopped");
        code
    }
}

fn install_default_signal_handlers(r: &Rc<Reactor>) {
    for signo in [libc::SIGINT, libc::SIGTERM] {
        r.backend()
            .receive_signal(signo)
            .then(move |_| {
                tracing::info!(signo, "termination signal, shutting down");
                exit_all(0);
            })
            .discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::test_util::with_reactor;

    #[test]
    fn submit_to_own_shard_runs_inline() {
        with_reactor(|r| {
            let fut = submit_to(0, || 5);
            assert_eq!(r.run_until(fut).unwrap(), 5);
        });
    }

    #[test]
    fn submit_to_async_own_shard_returns_the_future() {
        with_reactor(|r| {
            let fut = submit_to_async(0, || make_ready_future("local"));
            assert_eq!(r.run_until(fut).unwrap(), "local");
        });
    }

    #[test]
    fn panic_message_extracts_str_payloads() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(17u32)), "task panicked");
    }
}
