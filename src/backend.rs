//! OS readiness multiplexer
//!
//! One `Backend` per reactor, wrapping a `mio::Poll`. Timers, cross-shard
//! wakeups and signals are folded into the same epoll wait: timers via a
//! timerfd, wakeups via eventfds, signals via a channel drained after
//! every wait (the router thread kicks the shard's wake eventfd so a
//! blocked shard notices).
//!
//! Readiness is one-shot per promise: each `readable`/`writable` call
//! (re)arms the interest, and delivering the event clears it. Spurious
//! wakeups are allowed; missed wakeups are not (re-registering an
//! already-ready fd delivers an event immediately).

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::future::{make_failed_future, Future, Promise};

pub(crate) const POLL_READ: u8 = 1;
pub(crate) const POLL_WRITE: u8 = 2;

fn interest(bits: u8) -> Interest {
    match bits {
        POLL_READ => Interest::READABLE,
        POLL_WRITE => Interest::WRITABLE,
        _ => Interest::READABLE.add(Interest::WRITABLE),
    }
}

/// Signalling end of a wake notifier. `Copy` and `Send`: any thread may
/// kick the owning shard out of its epoll wait.
#[derive(Clone, Copy, Debug)]
pub struct NotifierHandle {
    fd: RawFd,
}

impl NotifierHandle {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Wake the owner. Coalesces: signalling an already-signalled
    /// notifier is a no-op beyond the counter increment.
    pub fn signal(&self) {
        eventfd_write(self.fd);
    }
}

/// Create an eventfd. The runtime's notifier fds live for the process
/// lifetime, so handles never dangle.
pub(crate) fn new_eventfd(nonblocking: bool) -> io::Result<RawFd> {
    let mut flags = libc::EFD_CLOEXEC;
    if nonblocking {
        flags |= libc::EFD_NONBLOCK;
    }
    let fd = unsafe { libc::eventfd(0, flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

pub(crate) fn eventfd_write(fd: RawFd) {
    let one: u64 = 1;
    let ret = unsafe { libc::write(fd, &one as *const u64 as *const libc::c_void, 8) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            tracing::warn!("eventfd write failed: {err}");
        }
    }
}

pub(crate) fn eventfd_drain(fd: RawFd) {
    let mut counter: u64 = 0;
    unsafe { libc::read(fd, &mut counter as *mut u64 as *mut libc::c_void, 8) };
}

#[derive(Default)]
struct FdWait {
    bits: u8,
    pollin: Option<Promise<()>>,
    pollout: Option<Promise<()>>,
}

pub struct Backend {
    poll: RefCell<Poll>,
    events: RefCell<Events>,
    fds: RefCell<HashMap<RawFd, FdWait>>,
    timer_fd: RawFd,
    timer_waiter: RefCell<Option<Promise<()>>>,
    // Registered notifier read sides; the value is an optional waiter
    // from `notified()`.
    wake_fds: RefCell<HashMap<RawFd, Option<Promise<()>>>>,
    wake_fd: RawFd,
    signal_rx: Option<crossbeam_channel::Receiver<i32>>,
    signal_waiters: RefCell<HashMap<i32, Promise<()>>>,
}

impl Backend {
    pub(crate) fn new(signal_rx: Option<crossbeam_channel::Receiver<i32>>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let timer_fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if timer_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        poll.registry().register(
            &mut SourceFd(&timer_fd),
            Token(timer_fd as usize),
            Interest::READABLE,
        )?;
        let backend = Self {
            poll: RefCell::new(poll),
            events: RefCell::new(Events::with_capacity(1024)),
            fds: RefCell::new(HashMap::new()),
            timer_fd,
            timer_waiter: RefCell::new(None),
            wake_fds: RefCell::new(HashMap::new()),
            wake_fd: new_eventfd(true)?,
            signal_rx,
            signal_waiters: RefCell::new(HashMap::new()),
        };
        backend.add_wake_fd(backend.wake_fd)?;
        Ok(backend)
    }

    /// Handle that wakes this backend out of a blocking wait.
    pub fn wake_handle(&self) -> NotifierHandle {
        NotifierHandle::new(self.wake_fd)
    }

    /// Register a notifier read side. Events on it only interrupt the
    /// wait (and resolve a pending `notified()` future); the counter is
    /// drained on delivery.
    pub(crate) fn add_wake_fd(&self, fd: RawFd) -> io::Result<()> {
        self.poll.borrow().registry().register(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE,
        )?;
        self.wake_fds.borrow_mut().insert(fd, None);
        Ok(())
    }

    /// Future resolving on the next signal of a registered notifier.
    pub fn notified(&self, fd: RawFd) -> Future<()> {
        let mut wake_fds = self.wake_fds.borrow_mut();
        let slot = wake_fds
            .get_mut(&fd)
            .expect("notified() on an unregistered notifier");
        assert!(slot.is_none(), "notifier already has a waiter");
        let (fut, promise) = Future::new();
        *slot = Some(promise);
        fut
    }

    /// Future resolving when `fd` becomes readable. At most one
    /// outstanding read wait per fd.
    pub fn readable(&self, fd: RawFd) -> Future<()> {
        self.poll_dir(fd, POLL_READ)
    }

    /// Future resolving when `fd` becomes writable. At most one
    /// outstanding write wait per fd.
    pub fn writable(&self, fd: RawFd) -> Future<()> {
        self.poll_dir(fd, POLL_WRITE)
    }

    fn poll_dir(&self, fd: RawFd, bit: u8) -> Future<()> {
        let was = {
            let mut fds = self.fds.borrow_mut();
            let st = fds.entry(fd).or_default();
            let outstanding = if bit == POLL_READ {
                st.pollin.is_some()
            } else {
                st.pollout.is_some()
            };
            assert!(
                !outstanding,
                "two outstanding waits in one direction on fd {fd}"
            );
            st.bits
        };
        let res = {
            let poll = self.poll.borrow();
            let mut src = SourceFd(&fd);
            let token = Token(fd as usize);
            if was == 0 {
                poll.registry().register(&mut src, token, interest(bit))
            } else {
                poll.registry()
                    .reregister(&mut src, token, interest(was | bit))
            }
        };
        if let Err(e) = res {
            if was == 0 {
                self.fds.borrow_mut().remove(&fd);
            }
            return make_failed_future(e.into());
        }
        let (fut, promise) = Future::new();
        let mut fds = self.fds.borrow_mut();
        let st = fds.get_mut(&fd).expect("entry inserted above");
        st.bits = was | bit;
        if bit == POLL_READ {
            st.pollin = Some(promise);
        } else {
            st.pollout = Some(promise);
        }
        fut
    }

    /// Drop the registration of `fd`. Outstanding waits resolve with a
    /// broken promise.
    pub fn forget(&self, fd: RawFd) {
        if self.fds.borrow_mut().remove(&fd).is_some() {
            let _ = self.poll.borrow().registry().deregister(&mut SourceFd(&fd));
        }
    }

    /// Schedule the next timer tick. The reactor multiplexes all timers
    /// onto this single deadline.
    pub fn arm_timer(&self, deadline: Instant) {
        let delta = deadline.saturating_duration_since(Instant::now());
        let mut spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        spec.it_value.tv_sec = delta.as_secs() as libc::time_t;
        spec.it_value.tv_nsec = libc::c_long::from(delta.subsec_nanos());
        if spec.it_value.tv_sec == 0 && spec.it_value.tv_nsec == 0 {
            // An all-zero it_value disarms; fire as soon as possible instead.
            spec.it_value.tv_nsec = 1;
        }
        let ret =
            unsafe { libc::timerfd_settime(self.timer_fd, 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            tracing::warn!("timerfd_settime failed: {}", io::Error::last_os_error());
        }
    }

    /// Future resolving when at least one armed timer deadline has
    /// passed. Single outstanding waiter.
    pub fn timers_completed(&self) -> Future<()> {
        let mut slot = self.timer_waiter.borrow_mut();
        assert!(slot.is_none(), "timers_completed() already awaited");
        let (fut, promise) = Future::new();
        *slot = Some(promise);
        fut
    }

    /// Future for the next delivery of `signo`. Signals are routed to
    /// shard 0; single outstanding waiter per signal.
    pub fn receive_signal(&self, signo: i32) -> Future<()> {
        assert!(
            self.signal_rx.is_some(),
            "signals are delivered to shard 0 only"
        );
        let (fut, promise) = Future::new();
        let prev = self.signal_waiters.borrow_mut().insert(signo, promise);
        assert!(prev.is_none(), "receive_signal({signo}) already awaited");
        fut
    }

    /// Wait for events and dispatch them. With `block` the call may sleep
    /// until any registered event fires; otherwise it only collects
    /// already-pending events. `pre` runs after the wait, before
    /// dispatch.
    pub fn wait_and_process(&self, block: bool, pre: impl FnOnce()) {
        let timeout = if block {
            None
        } else {
            Some(Duration::from_millis(0))
        };
        {
            let mut events = self.events.borrow_mut();
            if let Err(e) = self.poll.borrow_mut().poll(&mut events, timeout) {
                if e.kind() != io::ErrorKind::Interrupted {
                    tracing::warn!("poll failed: {e}");
                }
            }
        }
        pre();
        let mut ready = Vec::new();
        {
            let events = self.events.borrow();
            for event in events.iter() {
                self.dispatch(event, &mut ready);
            }
        }
        for promise in ready {
            promise.set_value(());
        }
        self.drain_signals();
    }

    fn dispatch(&self, event: &mio::event::Event, ready: &mut Vec<Promise<()>>) {
        let fd = event.token().0 as RawFd;
        if fd == self.timer_fd {
            eventfd_drain(self.timer_fd);
            if let Some(promise) = self.timer_waiter.borrow_mut().take() {
                ready.push(promise);
            }
            return;
        }
        {
            let mut wake_fds = self.wake_fds.borrow_mut();
            if let Some(slot) = wake_fds.get_mut(&fd) {
                eventfd_drain(fd);
                if let Some(promise) = slot.take() {
                    ready.push(promise);
                }
                return;
            }
        }
        let mut fds = self.fds.borrow_mut();
        if let Some(st) = fds.get_mut(&fd) {
            let read_ready = event.is_readable() || event.is_read_closed() || event.is_error();
            let write_ready = event.is_writable() || event.is_write_closed() || event.is_error();
            if read_ready {
                if let Some(promise) = st.pollin.take() {
                    st.bits &= !POLL_READ;
                    ready.push(promise);
                }
            }
            if write_ready {
                if let Some(promise) = st.pollout.take() {
                    st.bits &= !POLL_WRITE;
                    ready.push(promise);
                }
            }
            let bits = st.bits;
            let poll = self.poll.borrow();
            let mut src = SourceFd(&fd);
            if bits == 0 {
                fds.remove(&fd);
                let _ = poll.registry().deregister(&mut src);
            } else {
                let _ = poll
                    .registry()
                    .reregister(&mut src, Token(fd as usize), interest(bits));
            }
        }
    }

    fn drain_signals(&self) {
        let Some(rx) = &self.signal_rx else {
            return;
        };
        while let Ok(signo) = rx.try_recv() {
            tracing::debug!(signo, "signal delivered");
            if let Some(promise) = self.signal_waiters.borrow_mut().remove(&signo) {
                promise.set_value(());
            }
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
            libc::close(self.wake_fd);
        }
    }
}
