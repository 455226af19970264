//! Byte buffers
//!
//! [`Buf`] is the shard-local buffer handed between streams, sockets and
//! files: cheap to share (reference-counted storage plus a window), never
//! sent across shards. [`DmaBuffer`] is a 512-byte-aligned allocation for
//! the DMA-style file paths.

use std::ops::Deref;
use std::rc::Rc;

/// Alignment required of buffers passed to the DMA file operations.
pub const DMA_ALIGNMENT: usize = 512;

enum Storage {
    Heap(Vec<u8>),
    Dma(DmaBuffer),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Heap(v) => v,
            Storage::Dma(b) => b.as_slice(),
        }
    }
}

/// A shareable window over immutable byte storage.
#[derive(Clone)]
pub struct Buf {
    data: Rc<Storage>,
    begin: usize,
    end: usize,
}

impl Buf {
    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(v: Vec<u8>) -> Self {
        let end = v.len();
        Self {
            data: Rc::new(Storage::Heap(v)),
            begin: 0,
            end,
        }
    }

    pub fn from_slice(s: &[u8]) -> Self {
        Self::from_vec(s.to_vec())
    }

    pub(crate) fn from_dma(b: DmaBuffer, len: usize) -> Self {
        assert!(len <= b.len());
        Self {
            data: Rc::new(Storage::Dma(b)),
            begin: 0,
            end: len,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_slice()[self.begin..self.end]
    }

    /// A new window over `[from, from + len)` of this buffer, sharing the
    /// same storage.
    pub fn share(&self, from: usize, len: usize) -> Buf {
        assert!(from + len <= self.len(), "share out of range");
        Buf {
            data: self.data.clone(),
            begin: self.begin + from,
            end: self.begin + from + len,
        }
    }

    /// Drop the first `n` bytes from the window.
    pub fn trim_front(&mut self, n: usize) {
        assert!(n <= self.len(), "trim_front out of range");
        self.begin += n;
    }

    /// Keep only the first `len` bytes of the window.
    pub fn trim(&mut self, len: usize) {
        assert!(len <= self.len(), "trim out of range");
        self.end = self.begin + len;
    }
}

impl Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Buf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for Buf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buf").field("len", &self.len()).finish()
    }
}

/// An owned, zero-initialised allocation aligned to [`DMA_ALIGNMENT`].
pub struct DmaBuffer {
    ptr: *mut u8,
    len: usize,
}

// Owned allocation with no interior sharing; safe to hand to the blocking
// pool worker.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// Allocate `len` bytes at 512-byte alignment. `len` must be a
    /// multiple of the alignment.
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "zero-sized DMA buffer");
        assert_eq!(len % DMA_ALIGNMENT, 0, "DMA buffer length must be 512-aligned");
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&mut ptr, DMA_ALIGNMENT, len) };
        assert_eq!(ret, 0, "posix_memalign failed");
        unsafe { std::ptr::write_bytes(ptr.cast::<u8>(), 0, len) };
        Self {
            ptr: ptr.cast(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr.cast()) };
    }
}

/// Round `n` up to the next multiple of [`DMA_ALIGNMENT`].
pub fn align_up(n: usize) -> usize {
    n.div_ceil(DMA_ALIGNMENT) * DMA_ALIGNMENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_and_trim_window_the_same_storage() {
        let buf = Buf::from_slice(b"hello world");
        let hello = buf.share(0, 5);
        assert_eq!(hello.as_slice(), b"hello");
        let mut rest = buf;
        rest.trim_front(6);
        assert_eq!(rest.as_slice(), b"world");
        rest.trim(3);
        assert_eq!(rest.as_slice(), b"wor");
    }

    #[test]
    fn dma_buffer_is_aligned_and_zeroed() {
        let buf = DmaBuffer::new(1024);
        assert_eq!(buf.as_ptr() as usize % DMA_ALIGNMENT, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn align_up_rounds_to_512() {
        assert_eq!(align_up(1), 512);
        assert_eq!(align_up(512), 512);
        assert_eq!(align_up(1000), 1024);
    }

    #[test]
    #[should_panic]
    fn share_out_of_range_panics() {
        let buf = Buf::from_slice(b"abc");
        let _ = buf.share(1, 3);
    }
}
