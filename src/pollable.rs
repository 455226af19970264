//! Pollable file descriptors
//!
//! A `PollableFd` wraps a nonblocking OS descriptor plus "known events"
//! speculation bits. Every operation consults the bits first: if the
//! desired direction is believed ready the syscall is attempted without a
//! trip through the multiplexer; on `EAGAIN` the readiness future is
//! awaited instead. A syscall that transfers the full requested length
//! sets the bit speculatively for the next call.
//!
//! The bits are a cache only; correctness never depends on them and
//! [`PollableFd::set_speculation`] turns them off.

use std::cell::Cell;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::backend::{POLL_READ, POLL_WRITE};
use crate::buffer::Buf;
use crate::future::{make_failed_future, make_ready_future, Future};
use crate::reactor;

struct FdState {
    fd: RawFd,
    events_known: Cell<u8>,
    speculation: Cell<bool>,
}

impl Drop for FdState {
    fn drop(&mut self) {
        if let Some(r) = reactor::try_current() {
            r.backend().forget(self.fd);
        }
        unsafe { libc::close(self.fd) };
    }
}

/// Owning handle to a nonblocking descriptor. Clones share the fd; the
/// descriptor closes when the last clone drops.
#[derive(Clone)]
pub struct PollableFd {
    state: Rc<FdState>,
}

impl PollableFd {
    /// Take ownership of `fd`, which must already be nonblocking.
    pub fn new(fd: RawFd) -> Self {
        Self::with_speculation(fd, 0)
    }

    pub(crate) fn with_speculation(fd: RawFd, events: u8) -> Self {
        Self {
            state: Rc::new(FdState {
                fd,
                events_known: Cell::new(events),
                speculation: Cell::new(true),
            }),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.state.fd
    }

    /// Turn the speculation cache on or off. Disabling clears it, so
    /// every subsequent wait goes through the multiplexer.
    pub fn set_speculation(&self, enabled: bool) {
        self.state.speculation.set(enabled);
        if !enabled {
            self.state.events_known.set(0);
        }
    }

    fn speculate(&self, bit: u8) {
        if self.state.speculation.get() {
            self.state.events_known.set(self.state.events_known.get() | bit);
        }
    }

    /// Consume a known-ready bit, or fall back to the multiplexer.
    fn wait_for(&self, bit: u8) -> Future<()> {
        let known = self.state.events_known.get();
        if known & bit != 0 {
            self.state.events_known.set(known & !bit);
            return make_ready_future(());
        }
        let backend = reactor::current();
        let fd = self.state.fd;
        if bit == POLL_READ {
            backend.backend().readable(fd)
        } else {
            backend.backend().writable(fd)
        }
    }

    /// Read up to `len` bytes. Resolves with an empty buffer at EOF.
    pub fn read_some(&self, len: usize) -> Future<Buf> {
        let this = self.clone();
        self.wait_for(POLL_READ).and_then(move |_| {
            match sys_read(this.raw_fd(), len) {
                Ok(Some(buf)) => {
                    if buf.len() == len {
                        // Possibly more queued; skip the multiplexer next time.
                        this.speculate(POLL_READ);
                    }
                    make_ready_future(buf)
                }
                Ok(None) => this.read_some(len),
                Err(e) => make_failed_future(e.into()),
            }
        })
    }

    /// Write some of `buf`, resolving with the number of bytes accepted.
    pub fn write_some(&self, buf: Buf) -> Future<usize> {
        let this = self.clone();
        self.wait_for(POLL_WRITE).and_then(move |_| {
            match sys_send(this.raw_fd(), buf.as_slice()) {
                Ok(Some(n)) => {
                    if n == buf.len() {
                        this.speculate(POLL_WRITE);
                    }
                    make_ready_future(n)
                }
                Ok(None) => this.write_some(buf),
                Err(e) => make_failed_future(e.into()),
            }
        })
    }

    /// Write all of `buf`, retrying partial writes.
    pub fn write_all(&self, buf: Buf) -> Future<()> {
        assert!(!buf.is_empty());
        let this = self.clone();
        self.write_some(buf.clone()).and_then(move |n| {
            if n == buf.len() {
                make_ready_future(())
            } else {
                let mut rest = buf;
                rest.trim_front(n);
                this.write_all(rest)
            }
        })
    }

    /// Accept one connection from a listening socket. The accepted fd is
    /// created nonblocking with write readiness speculated.
    pub fn accept(&self) -> Future<(PollableFd, SocketAddr)> {
        let this = self.clone();
        self.wait_for(POLL_READ).and_then(move |_| {
            match sys_accept(this.raw_fd()) {
                Ok(Some((fd, addr))) => {
                    make_ready_future((PollableFd::with_speculation(fd, POLL_WRITE), addr))
                }
                Ok(None) => this.accept(),
                Err(e) => make_failed_future(e.into()),
            }
        })
    }

    /// Send one datagram to `addr`.
    pub fn sendto(&self, addr: SocketAddr, buf: Buf) -> Future<usize> {
        let this = self.clone();
        self.wait_for(POLL_WRITE).and_then(move |_| {
            match sys_sendto(this.raw_fd(), buf.as_slice(), &addr) {
                Ok(Some(n)) => {
                    // Datagram sends usually leave room; amortise the
                    // occasional mis-speculation.
                    if n == buf.len() {
                        this.speculate(POLL_WRITE);
                    }
                    make_ready_future(n)
                }
                Ok(None) => this.sendto(addr, buf),
                Err(e) => make_failed_future(e.into()),
            }
        })
    }

    /// Receive one datagram of up to `len` bytes.
    pub fn recv_from(&self, len: usize) -> Future<(Buf, SocketAddr)> {
        let this = self.clone();
        self.wait_for(POLL_READ).and_then(move |_| {
            match sys_recvfrom(this.raw_fd(), len) {
                Ok(Some(pair)) => make_ready_future(pair),
                Ok(None) => this.recv_from(len),
                Err(e) => make_failed_future(e.into()),
            }
        })
    }
}

fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

fn sys_read(fd: RawFd, len: usize) -> io::Result<Option<Buf>> {
    let mut v = vec![0u8; len];
    let ret = unsafe { libc::read(fd, v.as_mut_ptr().cast(), len) };
    if ret < 0 {
        let e = io::Error::last_os_error();
        if would_block(&e) {
            return Ok(None);
        }
        return Err(e);
    }
    v.truncate(ret as usize);
    Ok(Some(Buf::from_vec(v)))
}

fn sys_send(fd: RawFd, data: &[u8]) -> io::Result<Option<usize>> {
    let ret = unsafe {
        libc::send(
            fd,
            data.as_ptr().cast(),
            data.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if ret < 0 {
        let e = io::Error::last_os_error();
        // Pipes and regular fds reject send(); fall back to write().
        if e.raw_os_error() == Some(libc::ENOTSOCK) {
            return sys_write(fd, data);
        }
        if would_block(&e) {
            return Ok(None);
        }
        return Err(e);
    }
    Ok(Some(ret as usize))
}

fn sys_write(fd: RawFd, data: &[u8]) -> io::Result<Option<usize>> {
    let ret = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if ret < 0 {
        let e = io::Error::last_os_error();
        if would_block(&e) {
            return Ok(None);
        }
        return Err(e);
    }
    Ok(Some(ret as usize))
}

fn sys_accept(fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of_val(&storage) as libc::socklen_t;
    let new_fd = unsafe {
        libc::accept4(
            fd,
            std::ptr::addr_of_mut!(storage).cast(),
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if new_fd < 0 {
        let e = io::Error::last_os_error();
        if would_block(&e) {
            return Ok(None);
        }
        return Err(e);
    }
    let addr = decode_sockaddr(&storage)?;
    Ok(Some((new_fd, addr)))
}

fn sys_sendto(fd: RawFd, data: &[u8], addr: &SocketAddr) -> io::Result<Option<usize>> {
    let (storage, len) = encode_sockaddr(addr);
    let ret = unsafe {
        libc::sendto(
            fd,
            data.as_ptr().cast(),
            data.len(),
            libc::MSG_NOSIGNAL,
            std::ptr::addr_of!(storage).cast(),
            len,
        )
    };
    if ret < 0 {
        let e = io::Error::last_os_error();
        if would_block(&e) {
            return Ok(None);
        }
        return Err(e);
    }
    Ok(Some(ret as usize))
}

fn sys_recvfrom(fd: RawFd, len: usize) -> io::Result<Option<(Buf, SocketAddr)>> {
    let mut v = vec![0u8; len];
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of_val(&storage) as libc::socklen_t;
    let ret = unsafe {
        libc::recvfrom(
            fd,
            v.as_mut_ptr().cast(),
            len,
            0,
            std::ptr::addr_of_mut!(storage).cast(),
            &mut addr_len,
        )
    };
    if ret < 0 {
        let e = io::Error::last_os_error();
        if would_block(&e) {
            return Ok(None);
        }
        return Err(e);
    }
    v.truncate(ret as usize);
    let addr = decode_sockaddr(&storage)?;
    Ok(Some((Buf::from_vec(v), addr)))
}

pub(crate) fn encode_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe {
                &mut *std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in>()
            };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe {
                &mut *std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in6>()
            };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

pub(crate) fn decode_sockaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::test_util::with_reactor;
    use crate::task::Task;

    fn nonblocking_pipe() -> (PollableFd, PollableFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (PollableFd::new(fds[0]), PollableFd::new(fds[1]))
    }

    #[test]
    fn read_waits_for_data() {
        with_reactor(|r| {
            let (rd, wr) = nonblocking_pipe();
            let fut = rd.read_some(16);
            r.add_task(Task::new(move || {
                wr.write_all(Buf::from_slice(b"ping")).discard();
            }));
            let buf = r.run_until(fut).unwrap();
            assert_eq!(buf.as_slice(), b"ping");
        });
    }

    #[test]
    fn read_sees_eof_as_empty_buffer() {
        with_reactor(|r| {
            let (rd, wr) = nonblocking_pipe();
            drop(wr);
            let buf = r.run_until(rd.read_some(16)).unwrap();
            assert!(buf.is_empty());
        });
    }

    #[test]
    fn speculation_off_behaves_identically() {
        with_reactor(|r| {
            let (rd, wr) = nonblocking_pipe();
            rd.set_speculation(false);
            wr.set_speculation(false);
            r.run_until(wr.write_all(Buf::from_slice(b"abcdef"))).unwrap();
            let first = r.run_until(rd.read_some(3)).unwrap();
            let second = r.run_until(rd.read_some(3)).unwrap();
            assert_eq!(first.as_slice(), b"abc");
            assert_eq!(second.as_slice(), b"def");
        });
    }

    #[test]
    fn full_read_speculates_next_readiness() {
        with_reactor(|r| {
            let (rd, wr) = nonblocking_pipe();
            r.run_until(wr.write_all(Buf::from_slice(b"abcdef"))).unwrap();
            let first = r.run_until(rd.read_some(3)).unwrap();
            assert_eq!(first.as_slice(), b"abc");
            // The full-length read left the ready bit set; the next read
            // must still return correct data.
            let second = r.run_until(rd.read_some(16)).unwrap();
            assert_eq!(second.as_slice(), b"def");
        });
    }

    #[test]
    fn sockaddr_round_trip() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let (storage, _) = encode_sockaddr(&addr);
        assert_eq!(decode_sockaddr(&storage).unwrap(), addr);
        let addr6: SocketAddr = "[::1]:8080".parse().unwrap();
        let (storage6, _) = encode_sockaddr(&addr6);
        assert_eq!(decode_sockaddr(&storage6).unwrap(), addr6);
    }
}
