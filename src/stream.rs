//! Byte-oriented input and output streams
//!
//! Streams adapt a producer or consumer of heap buffers into byte
//! semantics. The seams are the object-safe [`DataSource`] and
//! [`DataSink`] traits; sockets and files plug in concrete
//! implementations.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buffer::Buf;
use crate::future::{make_ready_future, Future};

/// Producer of buffers. An empty buffer signals end of stream.
pub trait DataSource {
    fn get(&mut self) -> Future<Buf>;
}

/// Consumer of buffers.
pub trait DataSink {
    fn put(&mut self, data: Buf) -> Future<()>;
    fn close(&mut self) -> Future<()>;
}

/// Verdict returned by a [`InputStream::consume`] consumer.
pub enum Consumption {
    /// Keep feeding buffers.
    Continue,
    /// Stop; any trailing bytes go back to the stream's look-ahead.
    Done(Buf),
}

struct InputInner {
    source: Box<dyn DataSource>,
    buf: Buf,
    eof: bool,
}

/// Byte input stream with a single look-ahead buffer and an EOF flag.
#[derive(Clone)]
pub struct InputStream {
    inner: Rc<RefCell<InputInner>>,
}

impl InputStream {
    pub fn new(source: impl DataSource + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(InputInner {
                source: Box::new(source),
                buf: Buf::empty(),
                eof: false,
            })),
        }
    }

    pub fn eof(&self) -> bool {
        self.inner.borrow().eof
    }

    /// The next available chunk: the look-ahead if non-empty, otherwise
    /// one pull from the source. Empty at EOF.
    pub fn read(&self) -> Future<Buf> {
        let mut st = self.inner.borrow_mut();
        if !st.buf.is_empty() {
            let buf = std::mem::replace(&mut st.buf, Buf::empty());
            return make_ready_future(buf);
        }
        if st.eof {
            return make_ready_future(Buf::empty());
        }
        let pull = st.source.get();
        drop(st);
        let inner = self.inner.clone();
        pull.then(move |b| {
            if b.is_empty() {
                inner.borrow_mut().eof = true;
            }
            b
        })
    }

    /// Read exactly `n` bytes. When the look-ahead already holds at least
    /// `n` bytes the result is a zero-copy share; otherwise bytes are
    /// copied and pulled until filled. On EOF with a partial read the
    /// short buffer is returned.
    pub fn read_exactly(&self, n: usize) -> Future<Buf> {
        read_exactly_inner(self.inner.clone(), n)
    }

    /// Repeatedly hand the look-ahead to `consumer` until it returns
    /// [`Consumption::Done`] or the source is exhausted. Trailing bytes
    /// returned via `Done` go back to the stream.
    pub fn consume(&self, consumer: impl FnMut(Buf) -> Consumption + 'static) -> Future<()> {
        consume_loop(self.inner.clone(), Box::new(consumer))
    }
}

fn read_exactly_inner(inner: Rc<RefCell<InputInner>>, n: usize) -> Future<Buf> {
    if n == 0 {
        return make_ready_future(Buf::empty());
    }
    let mut st = inner.borrow_mut();
    if st.buf.len() == n {
        // Easy case: steal the look-ahead outright.
        let buf = std::mem::replace(&mut st.buf, Buf::empty());
        return make_ready_future(buf);
    }
    if st.buf.len() > n {
        let front = st.buf.share(0, n);
        st.buf.trim_front(n);
        return make_ready_future(front);
    }
    if st.buf.is_empty() {
        if st.eof {
            return make_ready_future(Buf::empty());
        }
        let pull = st.source.get();
        drop(st);
        let inner2 = inner.clone();
        return pull.and_then(move |b| {
            if b.is_empty() {
                inner2.borrow_mut().eof = true;
                return make_ready_future(Buf::empty());
            }
            inner2.borrow_mut().buf = b;
            read_exactly_inner(inner2, n)
        });
    }
    // Look-ahead too small: switch to the copy/pull loop.
    let mut out = Vec::with_capacity(n);
    out.extend_from_slice(st.buf.as_slice());
    st.buf = Buf::empty();
    drop(st);
    read_exactly_part(inner, n, out)
}

fn read_exactly_part(inner: Rc<RefCell<InputInner>>, n: usize, mut out: Vec<u8>) -> Future<Buf> {
    let pull = inner.borrow_mut().source.get();
    let inner2 = inner.clone();
    pull.and_then(move |b| {
        if b.is_empty() {
            inner2.borrow_mut().eof = true;
            return make_ready_future(Buf::from_vec(out));
        }
        let need = n - out.len();
        let take = need.min(b.len());
        out.extend_from_slice(&b.as_slice()[..take]);
        if take < b.len() {
            let mut rest = b;
            rest.trim_front(take);
            inner2.borrow_mut().buf = rest;
        }
        if out.len() == n {
            make_ready_future(Buf::from_vec(out))
        } else {
            read_exactly_part(inner2, n, out)
        }
    })
}

fn consume_loop(
    inner: Rc<RefCell<InputInner>>,
    mut consumer: Box<dyn FnMut(Buf) -> Consumption>,
) -> Future<()> {
    let (buf, at_eof) = {
        let mut st = inner.borrow_mut();
        if st.buf.is_empty() && !st.eof {
            let pull = st.source.get();
            drop(st);
            let inner2 = inner.clone();
            return pull.and_then(move |b| {
                {
                    let mut st = inner2.borrow_mut();
                    st.eof = b.is_empty();
                    st.buf = b;
                }
                consume_loop(inner2, consumer)
            });
        }
        (std::mem::replace(&mut st.buf, Buf::empty()), st.eof)
    };
    match consumer(buf) {
        Consumption::Done(unconsumed) => {
            if !unconsumed.is_empty() {
                inner.borrow_mut().buf = unconsumed;
            }
            make_ready_future(())
        }
        Consumption::Continue => {
            if at_eof {
                make_ready_future(())
            } else {
                consume_loop(inner, consumer)
            }
        }
    }
}

struct OutputInner {
    sink: Box<dyn DataSink>,
    buf: Vec<u8>,
    size: usize,
}

/// Byte output stream with a fixed-size buffer and a bulk-write
/// threshold: writes that would overflow twice the buffer size bypass the
/// buffer entirely.
#[derive(Clone)]
pub struct OutputStream {
    inner: Rc<RefCell<OutputInner>>,
}

impl OutputStream {
    pub fn new(sink: impl DataSink + 'static, size: usize) -> Self {
        assert!(size > 0);
        Self {
            inner: Rc::new(RefCell::new(OutputInner {
                sink: Box::new(sink),
                buf: Vec::with_capacity(size),
                size,
            })),
        }
    }

    pub fn write(&self, data: &[u8]) -> Future<()> {
        if data.is_empty() {
            return make_ready_future(());
        }
        write_impl(self.inner.clone(), data.to_vec())
    }

    /// Submit the current buffer to the sink.
    pub fn flush(&self) -> Future<()> {
        let mut st = self.inner.borrow_mut();
        if st.buf.is_empty() {
            return make_ready_future(());
        }
        let size = st.size;
        let full = std::mem::replace(&mut st.buf, Vec::with_capacity(size));
        let put = st.sink.put(Buf::from_vec(full));
        drop(st);
        put
    }

    /// Flush and close the underlying sink.
    pub fn close(&self) -> Future<()> {
        let inner = self.inner.clone();
        self.flush().and_then(move |_| {
            let close = inner.borrow_mut().sink.close();
            close
        })
    }
}

fn write_impl(inner: Rc<RefCell<OutputInner>>, data: Vec<u8>) -> Future<()> {
    let mut st = inner.borrow_mut();
    let size = st.size;
    let end = st.buf.len();
    let bulk_threshold = if end > 0 { 2 * size - end } else { size };

    if data.len() >= bulk_threshold {
        // Bulk path: top up the current buffer, flush it, then submit the
        // tail directly without another copy into the stream buffer.
        if end > 0 {
            let now = size - end;
            st.buf.extend_from_slice(&data[..now]);
            let full = std::mem::replace(&mut st.buf, Vec::with_capacity(size));
            let tail = data[now..].to_vec();
            let put = st.sink.put(Buf::from_vec(full));
            drop(st);
            let inner2 = inner.clone();
            return put.and_then(move |_| {
                let put_tail = inner2.borrow_mut().sink.put(Buf::from_vec(tail));
                put_tail
            });
        }
        let put = st.sink.put(Buf::from_vec(data));
        drop(st);
        return put;
    }

    let now = data.len().min(size - end);
    st.buf.extend_from_slice(&data[..now]);
    if now == data.len() {
        if st.buf.len() == size {
            let full = std::mem::replace(&mut st.buf, Vec::with_capacity(size));
            let put = st.sink.put(Buf::from_vec(full));
            drop(st);
            return put;
        }
        return make_ready_future(());
    }
    // The buffer filled mid-write: submit it and start the next buffer
    // with the remainder.
    let full = std::mem::replace(&mut st.buf, data[now..].to_vec());
    let put = st.sink.put(Buf::from_vec(full));
    drop(st);
    put
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::test_util::with_reactor;
    use std::collections::VecDeque;

    struct ChunkSource {
        chunks: VecDeque<Vec<u8>>,
    }

    impl ChunkSource {
        fn new(chunks: Vec<&[u8]>) -> Self {
            Self {
                chunks: chunks.into_iter().map(<[u8]>::to_vec).collect(),
            }
        }
    }

    impl DataSource for ChunkSource {
        fn get(&mut self) -> Future<Buf> {
            match self.chunks.pop_front() {
                Some(c) => make_ready_future(Buf::from_vec(c)),
                None => make_ready_future(Buf::empty()),
            }
        }
    }

    #[derive(Clone)]
    struct RecordingSink {
        puts: Rc<RefCell<Vec<Vec<u8>>>>,
        closed: Rc<std::cell::Cell<bool>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                puts: Rc::new(RefCell::new(Vec::new())),
                closed: Rc::new(std::cell::Cell::new(false)),
            }
        }

        fn bytes(&self) -> Vec<u8> {
            self.puts.borrow().concat()
        }
    }

    impl DataSink for RecordingSink {
        fn put(&mut self, data: Buf) -> Future<()> {
            self.puts.borrow_mut().push(data.as_slice().to_vec());
            make_ready_future(())
        }

        fn close(&mut self) -> Future<()> {
            self.closed.set(true);
            make_ready_future(())
        }
    }

    #[test]
    fn read_exactly_shares_the_look_ahead() {
        with_reactor(|r| {
            let stream = InputStream::new(ChunkSource::new(vec![b"hello world"]));
            let hello = r.run_until(stream.read_exactly(5)).unwrap();
            assert_eq!(hello.as_slice(), b"hello");
            let rest = r.run_until(stream.read_exactly(6)).unwrap();
            assert_eq!(rest.as_slice(), b" world");
        });
    }

    #[test]
    fn read_exactly_pulls_across_chunks() {
        with_reactor(|r| {
            let stream = InputStream::new(ChunkSource::new(vec![b"ab", b"cd", b"efgh"]));
            let got = r.run_until(stream.read_exactly(6)).unwrap();
            assert_eq!(got.as_slice(), b"abcdef");
            let tail = r.run_until(stream.read_exactly(2)).unwrap();
            assert_eq!(tail.as_slice(), b"gh");
        });
    }

    #[test]
    fn read_exactly_returns_short_buffer_at_eof() {
        with_reactor(|r| {
            let stream = InputStream::new(ChunkSource::new(vec![b"abc"]));
            let got = r.run_until(stream.read_exactly(10)).unwrap();
            assert_eq!(got.as_slice(), b"abc");
            assert!(stream.eof());
        });
    }

    #[test]
    fn consume_returns_trailing_bytes_to_stream() {
        with_reactor(|r| {
            let stream = InputStream::new(ChunkSource::new(vec![b"aaab", b"bb"]));
            let seen = Rc::new(RefCell::new(Vec::new()));
            let seen2 = seen.clone();
            // Consume leading 'a's, hand anything else back.
            let done = stream.consume(move |buf| {
                if buf.is_empty() {
                    return Consumption::Done(Buf::empty());
                }
                let n = buf.iter().take_while(|&&b| b == b'a').count();
                seen2.borrow_mut().extend_from_slice(&buf.as_slice()[..n]);
                if n < buf.len() {
                    Consumption::Done(buf.share(n, buf.len() - n))
                } else {
                    Consumption::Continue
                }
            });
            r.run_until(done).unwrap();
            assert_eq!(seen.borrow().as_slice(), b"aaa");
            let rest = r.run_until(stream.read_exactly(3)).unwrap();
            assert_eq!(rest.as_slice(), b"bbb");
        });
    }

    #[test]
    fn small_writes_buffer_until_full() {
        with_reactor(|r| {
            let sink = RecordingSink::new();
            let out = OutputStream::new(sink.clone(), 8);
            r.run_until(out.write(b"abcd")).unwrap();
            assert!(sink.puts.borrow().is_empty(), "below buffer size, no put yet");
            r.run_until(out.write(b"efgh")).unwrap();
            assert_eq!(sink.puts.borrow().len(), 1, "full buffer submitted");
            assert_eq!(sink.bytes(), b"abcdefgh");
        });
    }

    #[test]
    fn large_write_takes_the_bulk_path() {
        with_reactor(|r| {
            let sink = RecordingSink::new();
            let out = OutputStream::new(sink.clone(), 8);
            let payload = vec![7u8; 32];
            r.run_until(out.write(&payload)).unwrap();
            assert_eq!(sink.puts.borrow().len(), 1, "bypasses the stream buffer");
            assert_eq!(sink.bytes(), payload);
        });
    }

    #[test]
    fn close_flushes_then_closes() {
        with_reactor(|r| {
            let sink = RecordingSink::new();
            let out = OutputStream::new(sink.clone(), 8);
            r.run_until(out.write(b"xy")).unwrap();
            r.run_until(out.close()).unwrap();
            assert_eq!(sink.bytes(), b"xy");
            assert!(sink.closed.get());
        });
    }
}
