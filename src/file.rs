//! DMA-style file access
//!
//! `File` exposes offset-based reads and writes with 512-byte alignment
//! requirements, submitted through the shard's AIO context (or the
//! blocking pool where io_uring is unavailable). The stream wrappers
//! bridge unaligned byte streams onto the aligned interface: the sink
//! copies unaligned tails into aligned buffers, tracks the logical
//! position, and truncates the file to the logical size when it writes a
//! tail.

use std::cell::RefCell;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::Rc;

use io_uring::{opcode, types};

use crate::buffer::{align_up, Buf, DmaBuffer, DMA_ALIGNMENT};
use crate::future::{make_failed_future, make_ready_future, Future};
use crate::reactor::{self, io_result};
use crate::stream::{DataSink, DataSource, InputStream, OutputStream};

struct FileInner {
    fd: RawFd,
}

impl Drop for FileInner {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// An open file handle for DMA-style access. Clones share the
/// descriptor.
#[derive(Clone)]
pub struct File {
    inner: Rc<FileInner>,
}

/// Turn a blocking-pool result into the future's own error channel.
fn flatten<T: Send + 'static>(fut: Future<io::Result<T>>) -> Future<T> {
    fut.rescue(|r| match r {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e),
    })
}

impl File {
    /// Open (creating if needed) a file for aligned access.
    pub fn open_dma(path: impl AsRef<Path>) -> Future<File> {
        let path = match std::ffi::CString::new(path.as_ref().as_os_str().as_bytes()) {
            Ok(c) => c,
            Err(_) => {
                return make_failed_future(
                    io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL").into(),
                )
            }
        };
        flatten(reactor::current().submit_blocking(move || {
            let fd = unsafe {
                libc::open(
                    path.as_ptr(),
                    libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC,
                    0o644,
                )
            };
            if fd < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(fd)
            }
        }))
        .then(|fd| File {
            inner: Rc::new(FileInner { fd }),
        })
    }

    fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// Read up to `len` bytes at `pos` (512-aligned). The result may be
    /// short at end of file.
    pub fn dma_read_bulk(&self, pos: u64, len: usize) -> Future<Buf> {
        if len == 0 {
            return make_ready_future(Buf::empty());
        }
        assert_eq!(pos % DMA_ALIGNMENT as u64, 0, "unaligned dma read offset");
        let size = align_up(len);
        let mut dbuf = DmaBuffer::new(size);
        let fd = self.fd();
        let r = reactor::current();
        if r.io_engine().is_some() {
            let ptr = dbuf.as_mut_ptr();
            r.submit_io(move || {
                opcode::Read::new(types::Fd(fd), ptr, size as u32)
                    .offset(pos)
                    .build()
            })
            .rescue(move |res| {
                let n = io_result(res?)?;
                Ok(Buf::from_dma(dbuf, n.min(len)))
            })
        } else {
            flatten(r.submit_blocking(move || {
                let ret =
                    unsafe { libc::pread(fd, dbuf.as_mut_ptr().cast(), size, pos as libc::off_t) };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok((dbuf, ret as usize))
                }
            }))
            .then(move |(dbuf, n)| Buf::from_dma(dbuf, n.min(len)))
        }
    }

    /// Write the whole (512-aligned) buffer at `pos` (512-aligned).
    /// Resolves with the number of bytes written.
    pub fn dma_write(&self, pos: u64, buf: DmaBuffer) -> Future<usize> {
        assert_eq!(pos % DMA_ALIGNMENT as u64, 0, "unaligned dma write offset");
        let fd = self.fd();
        let r = reactor::current();
        if r.io_engine().is_some() {
            let ptr = buf.as_ptr();
            let len = buf.len();
            r.submit_io(move || {
                opcode::Write::new(types::Fd(fd), ptr, len as u32)
                    .offset(pos)
                    .build()
            })
            .rescue(move |res| {
                // The allocation must outlive the kernel's use of it.
                let _owned = buf;
                io_result(res?)
            })
        } else {
            flatten(r.submit_blocking(move || {
                let ret =
                    unsafe { libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), pos as libc::off_t) };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(ret as usize)
                }
            }))
        }
    }

    pub fn size(&self) -> Future<u64> {
        let fd = self.fd();
        flatten(reactor::current().submit_blocking(move || {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            let ret = unsafe { libc::fstat(fd, &mut st) };
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(st.st_size as u64)
            }
        }))
    }

    pub fn flush(&self) -> Future<()> {
        let fd = self.fd();
        let r = reactor::current();
        if r.io_engine().is_some() {
            r.submit_io(move || opcode::Fsync::new(types::Fd(fd)).build())
                .rescue(|res| {
                    io_result(res?)?;
                    Ok(())
                })
        } else {
            flatten(r.submit_blocking(move || {
                let ret = unsafe { libc::fsync(fd) };
                if ret < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }))
        }
    }

    pub fn truncate(&self, len: u64) -> Future<()> {
        let fd = self.fd();
        flatten(reactor::current().submit_blocking(move || {
            let ret = unsafe { libc::ftruncate(fd, len as libc::off_t) };
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }))
    }
}

/// Byte input stream reading `file` sequentially from `offset`.
pub fn make_file_input_stream(file: File, offset: u64, buffer_size: usize) -> InputStream {
    InputStream::new(FileSource {
        state: Rc::new(RefCell::new(FileSourceState {
            file,
            pos: offset,
            size: None,
            buffer_size: align_up(buffer_size.max(1)),
        })),
    })
}

struct FileSourceState {
    file: File,
    pos: u64,
    size: Option<u64>,
    buffer_size: usize,
}

struct FileSource {
    state: Rc<RefCell<FileSourceState>>,
}

impl DataSource for FileSource {
    fn get(&mut self) -> Future<Buf> {
        file_source_get(self.state.clone())
    }
}

fn file_source_get(state: Rc<RefCell<FileSourceState>>) -> Future<Buf> {
    let (file, pos, size, buffer_size) = {
        let st = state.borrow();
        (st.file.clone(), st.pos, st.size, st.buffer_size)
    };
    match size {
        None => file.size().and_then(move |n| {
            state.borrow_mut().size = Some(n);
            file_source_get(state)
        }),
        Some(fsize) => {
            if pos >= fsize {
                return make_ready_future(Buf::empty());
            }
            let want = buffer_size.min((fsize - pos) as usize);
            state.borrow_mut().pos += want as u64;
            file.dma_read_bulk(pos, want)
        }
    }
}

/// Byte output stream writing `file` from offset 0.
pub fn make_file_output_stream(file: File, buffer_size: usize) -> OutputStream {
    OutputStream::new(
        FileSink {
            state: Rc::new(RefCell::new(FileSinkState { file, pos: 0 })),
        },
        buffer_size,
    )
}

struct FileSinkState {
    file: File,
    pos: u64,
}

struct FileSink {
    state: Rc<RefCell<FileSinkState>>,
}

impl DataSink for FileSink {
    fn put(&mut self, data: Buf) -> Future<()> {
        if data.is_empty() {
            return make_ready_future(());
        }
        let (file, pos, logical_end) = {
            let mut st = self.state.borrow_mut();
            let pos = st.pos;
            st.pos += data.len() as u64;
            (st.file.clone(), pos, st.pos)
        };
        let len = data.len();
        let padded = align_up(len);
        let mut dbuf = DmaBuffer::new(padded);
        dbuf.as_mut_slice()[..len].copy_from_slice(data.as_slice());
        let write = file.dma_write(pos, dbuf);
        if padded == len {
            return write.rescue(move |r| {
                if r? != len {
                    return Err(io::Error::other("short dma write").into());
                }
                Ok(())
            });
        }
        // Unaligned tail (an output_stream flush): write the padded
        // buffer, then trim the file back to the logical size.
        let trim_file = file.clone();
        write
            .rescue(move |r| {
                if r? != padded {
                    return Err(io::Error::other("short dma write").into());
                }
                Ok(())
            })
            .and_then(move |_| trim_file.truncate(logical_end))
            .and_then(move |_| file.flush())
    }

    fn close(&mut self) -> Future<()> {
        self.state.borrow().file.flush()
    }
}
