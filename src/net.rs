//! Network stack contract
//!
//! The runtime ferries bytes; it does not interpret protocols. The
//! [`NetworkStack`] trait is the seam: the built-in posix stack drives
//! kernel sockets through [`PollableFd`], and alternative stacks (e.g. a
//! user-space stack over a tap device) register themselves under a name
//! and are selected with the `network-stack` option.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Mutex;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::buffer::Buf;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::future::{make_failed_future, make_ready_future, Future};
use crate::pollable::{encode_sockaddr, PollableFd};
use crate::reactor;
use crate::stream::{DataSink, DataSource, InputStream, OutputStream};

const STREAM_BUFFER_SIZE: usize = 8192;
const MAX_DATAGRAM: usize = 65536;

#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub reuse_address: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
        }
    }
}

pub trait NetworkStack {
    fn listen(&self, addr: SocketAddr, opts: ListenOptions) -> Result<ServerSocket>;
    fn connect(&self, addr: SocketAddr) -> Future<ConnectedSocket>;
    fn make_udp_channel(&self, addr: SocketAddr) -> Result<UdpChannel>;
}

type StackFactory = Box<dyn Fn(&Config) -> Result<Rc<dyn NetworkStack>> + Send + Sync>;

static STACKS: Lazy<DashMap<String, StackFactory>> = Lazy::new(|| {
    let map: DashMap<String, StackFactory> = DashMap::new();
    map.insert(
        "posix".to_string(),
        Box::new(|cfg: &Config| {
            Ok(Rc::new(PosixStack::new(cfg)) as Rc<dyn NetworkStack>)
        }),
    );
    map
});

static DEFAULT_STACK: Lazy<Mutex<String>> = Lazy::new(|| Mutex::new("posix".to_string()));

/// Register a stack factory under `name`, optionally making it the
/// default. The factory runs once per shard.
pub fn register_stack(
    name: &str,
    factory: impl Fn(&Config) -> Result<Rc<dyn NetworkStack>> + Send + Sync + 'static,
    make_default: bool,
) {
    STACKS.insert(name.to_string(), Box::new(factory));
    if make_default {
        *DEFAULT_STACK.lock().expect("stack registry poisoned") = name.to_string();
    }
}

/// Registered stack names.
pub fn stack_names() -> Vec<String> {
    STACKS.iter().map(|e| e.key().clone()).collect()
}

/// Instantiate the stack selected by `cfg.network_stack` (or the
/// registry default) for the calling shard.
pub fn create_stack(cfg: &Config) -> Result<Rc<dyn NetworkStack>> {
    let name = cfg
        .network_stack
        .clone()
        .unwrap_or_else(|| DEFAULT_STACK.lock().expect("stack registry poisoned").clone());
    let factory = STACKS.get(&name).ok_or_else(|| {
        Error::Io(io::Error::other(format!("unknown network stack {name:?}")))
    })?;
    (factory.value())(cfg)
}

/// Listen on the current shard's stack.
pub fn listen(addr: SocketAddr, opts: ListenOptions) -> Result<ServerSocket> {
    reactor::current().net()?.listen(addr, opts)
}

/// Connect via the current shard's stack.
pub fn connect(addr: SocketAddr) -> Future<ConnectedSocket> {
    match reactor::current().net() {
        Ok(stack) => stack.connect(addr),
        Err(e) => make_failed_future(e),
    }
}

/// Open a UDP channel on the current shard's stack.
pub fn make_udp_channel(addr: SocketAddr) -> Result<UdpChannel> {
    reactor::current().net()?.make_udp_channel(addr)
}

pub struct ServerSocket {
    fd: PollableFd,
}

impl ServerSocket {
    pub fn accept(&self) -> Future<(ConnectedSocket, SocketAddr)> {
        self.fd
            .accept()
            .then(|(fd, addr)| (ConnectedSocket { fd }, addr))
    }
}

pub struct ConnectedSocket {
    fd: PollableFd,
}

impl ConnectedSocket {
    /// Byte input stream over the socket. EOF once the peer shuts down
    /// its write side.
    pub fn input(&self) -> InputStream {
        InputStream::new(SocketSource {
            fd: self.fd.clone(),
        })
    }

    /// Buffered byte output stream over the socket. `close()` flushes and
    /// shuts down this side's writes, delivering EOF to the peer.
    pub fn output(&self) -> OutputStream {
        OutputStream::new(
            SocketSink {
                fd: self.fd.clone(),
            },
            STREAM_BUFFER_SIZE,
        )
    }
}

struct SocketSource {
    fd: PollableFd,
}

impl DataSource for SocketSource {
    fn get(&mut self) -> Future<Buf> {
        self.fd.read_some(STREAM_BUFFER_SIZE)
    }
}

struct SocketSink {
    fd: PollableFd,
}

impl DataSink for SocketSink {
    fn put(&mut self, data: Buf) -> Future<()> {
        if data.is_empty() {
            return make_ready_future(());
        }
        self.fd.write_all(data)
    }

    fn close(&mut self) -> Future<()> {
        let ret = unsafe { libc::shutdown(self.fd.raw_fd(), libc::SHUT_WR) };
        if ret < 0 {
            return make_failed_future(io::Error::last_os_error().into());
        }
        make_ready_future(())
    }
}

pub struct UdpChannel {
    fd: PollableFd,
}

impl UdpChannel {
    pub fn send(&self, dst: SocketAddr, data: Buf) -> Future<usize> {
        self.fd.sendto(dst, data)
    }

    pub fn receive(&self) -> Future<(Buf, SocketAddr)> {
        self.fd.recv_from(MAX_DATAGRAM)
    }
}

/// The built-in stack: kernel sockets, nonblocking, driven by the
/// shard's backend.
pub struct PosixStack {
    udp_queue_size: usize,
}

impl PosixStack {
    pub fn new(cfg: &Config) -> Self {
        Self {
            udp_queue_size: cfg.udpv4_queue_size,
        }
    }
}

impl NetworkStack for PosixStack {
    fn listen(&self, addr: SocketAddr, opts: ListenOptions) -> Result<ServerSocket> {
        let fd = new_socket(&addr, libc::SOCK_STREAM)?;
        let pfd = PollableFd::new(fd);
        if opts.reuse_address {
            set_reuse_address(fd)?;
        }
        bind_fd(fd, &addr)?;
        if unsafe { libc::listen(fd, 128) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(ServerSocket { fd: pfd })
    }

    fn connect(&self, addr: SocketAddr) -> Future<ConnectedSocket> {
        let fd = match new_socket(&addr, libc::SOCK_STREAM) {
            Ok(fd) => fd,
            Err(e) => return make_failed_future(e),
        };
        let pfd = PollableFd::new(fd);
        let (storage, len) = encode_sockaddr(&addr);
        let ret = unsafe { libc::connect(fd, std::ptr::addr_of!(storage).cast(), len) };
        if ret == 0 {
            return make_ready_future(ConnectedSocket { fd: pfd });
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return make_failed_future(err.into());
        }
        // Nonblocking connect: writability reports the outcome in
        // SO_ERROR.
        reactor::current()
            .backend()
            .writable(fd)
            .and_then(move |_| match so_error(pfd.raw_fd()) {
                Ok(0) => make_ready_future(ConnectedSocket { fd: pfd }),
                Ok(errno) => {
                    make_failed_future(io::Error::from_raw_os_error(errno).into())
                }
                Err(e) => make_failed_future(e.into()),
            })
    }

    fn make_udp_channel(&self, addr: SocketAddr) -> Result<UdpChannel> {
        let fd = new_socket(&addr, libc::SOCK_DGRAM)?;
        let pfd = PollableFd::new(fd);
        // Queue depth expressed in ~MTU-sized datagrams.
        let rcvbuf = (self.udp_queue_size * 2048) as libc::c_int;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                std::ptr::addr_of!(rcvbuf).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        bind_fd(fd, &addr)?;
        Ok(UdpChannel { fd: pfd })
    }
}

fn new_socket(addr: &SocketAddr, ty: libc::c_int) -> Result<RawFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            family,
            ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(fd)
}

fn set_reuse_address(fd: RawFd) -> Result<()> {
    let on: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            std::ptr::addr_of!(on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn bind_fd(fd: RawFd, addr: &SocketAddr) -> Result<()> {
    let (storage, len) = encode_sockaddr(addr);
    let ret = unsafe { libc::bind(fd, std::ptr::addr_of!(storage).cast(), len) };
    if ret < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

fn so_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(err).cast(),
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_stack_is_registered_by_default() {
        assert!(stack_names().contains(&"posix".to_string()));
        let stack = create_stack(&Config::default());
        assert!(stack.is_ok());
    }

    #[test]
    fn unknown_stack_is_an_error() {
        let cfg = Config {
            network_stack: Some("no-such-stack".into()),
            ..Config::default()
        };
        assert!(create_stack(&cfg).is_err());
    }
}
