//! Helper thread for unavoidable blocking syscalls
//!
//! Tasks must never block, so blocking operations are handed off through
//! an SPSC pair shaped like the cross-shard queues, except the far end is
//! a plain OS thread rather than another reactor. The worker sleeps on an
//! eventfd, processes items, and kicks the owning reactor's wake notifier
//! when completions are ready.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_queue::ArrayQueue;

use crate::backend::{eventfd_write, new_eventfd, NotifierHandle};
use crate::error::Error;
use crate::future::{Future, Promise};
use crate::sync::Semaphore;

const QUEUE_LENGTH: usize = 128;

trait SyscallItem {
    /// Runs on the worker thread.
    fn process(&mut self);
    /// Runs on the origin shard, resolving the caller's promise.
    fn complete(self: Box<Self>);
}

struct ItemBox(Box<dyn SyscallItem>);

// The promise inside an item is only touched on the origin shard; the
// worker thread touches only the closure and the result slot.
unsafe impl Send for ItemBox {}

struct Returning<T: 'static, F> {
    func: Option<F>,
    result: Option<thread::Result<T>>,
    promise: Option<Promise<T>>,
}

impl<T, F> SyscallItem for Returning<T, F>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    fn process(&mut self) {
        let func = self.func.take().expect("item processed twice");
        self.result = Some(std::panic::catch_unwind(std::panic::AssertUnwindSafe(func)));
    }

    fn complete(mut self: Box<Self>) {
        let promise = self.promise.take().expect("item completed twice");
        match self.result.take().expect("item completed before processing") {
            Ok(v) => promise.set_value(v),
            Err(payload) => promise.set_error(Error::Remote {
                message: crate::smp::panic_message(payload),
            }),
        }
    }
}

pub(crate) struct BlockingPool {
    pending: Arc<ArrayQueue<ItemBox>>,
    completed: Arc<ArrayQueue<ItemBox>>,
    permits: Semaphore,
    worker_fd: RawFd,
    stop: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BlockingPool {
    pub(crate) fn new(shard: usize, reactor_wake: NotifierHandle) -> Self {
        let pending: Arc<ArrayQueue<ItemBox>> = Arc::new(ArrayQueue::new(QUEUE_LENGTH));
        let completed: Arc<ArrayQueue<ItemBox>> = Arc::new(ArrayQueue::new(QUEUE_LENGTH));
        let worker_fd = new_eventfd(false).expect("eventfd for blocking pool");
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let pending = pending.clone();
            let completed = completed.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("shard-{shard}-blocking"))
                .spawn(move || worker_loop(&pending, &completed, &stop, worker_fd, reactor_wake))
                .expect("failed to spawn blocking worker")
        };
        Self {
            pending,
            completed,
            permits: Semaphore::new(QUEUE_LENGTH),
            worker_fd,
            stop,
            worker: Some(worker),
        }
    }

    /// Ship `f` to the worker thread and resolve with its return value. A
    /// panic in `f` crosses back as [`Error::Remote`].
    pub(crate) fn submit<T, F>(&self, f: F) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (fut, promise) = Future::new();
        let item = ItemBox(Box::new(Returning {
            func: Some(f),
            result: None,
            promise: Some(promise),
        }));
        let pending = self.pending.clone();
        let worker_fd = self.worker_fd;
        self.permits
            .wait(1)
            .then(move |_| {
                // Bounded by the permit just acquired.
                assert!(pending.push(item).is_ok(), "blocking queue overflow");
                eventfd_write(worker_fd);
            })
            .discard();
        fut
    }

    /// Drain completions on the owning shard.
    pub(crate) fn reap(&self) -> bool {
        let mut did_work = false;
        while let Some(item) = self.completed.pop() {
            item.0.complete();
            self.permits.signal(1);
            did_work = true;
        }
        did_work
    }

    pub(crate) fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        eventfd_write(self.worker_fd);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        unsafe { libc::close(self.worker_fd) };
    }
}

fn worker_loop(
    pending: &ArrayQueue<ItemBox>,
    completed: &ArrayQueue<ItemBox>,
    stop: &AtomicBool,
    worker_fd: RawFd,
    reactor_wake: NotifierHandle,
) {
    loop {
        let mut counter: u64 = 0;
        unsafe { libc::read(worker_fd, &mut counter as *mut u64 as *mut libc::c_void, 8) };
        if stop.load(Ordering::Acquire) {
            return;
        }
        let mut did_work = false;
        while let Some(mut item) = pending.pop() {
            item.0.process();
            assert!(completed.push(item).is_ok(), "completed queue overflow");
            did_work = true;
        }
        if did_work {
            reactor_wake.signal();
        }
    }
}
