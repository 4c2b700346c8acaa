//! Fixed-capacity circular byte buffer
//!
//! The unread region starts at `offset` and is `len` bytes long, wrapping
//! around the end of the storage. Any contiguous window (readable or
//! writable) therefore splits into at most two physical spans, which map
//! directly onto one `readv`/`writev` call.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};

/// A contiguous region of the buffer storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

impl Span {
    fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    fn range(self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Circular byte store
pub struct RingBuffer {
    storage: Box<[u8]>,
    offset: usize,
    len: usize,
}

impl RingBuffer {
    /// Create an empty buffer. Storage is zero-initialised up front.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            storage: vec![0u8; capacity].into_boxed_slice(),
            offset: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of unread bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of bytes that can still be written
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Drop all unread bytes
    pub fn clear(&mut self) {
        self.offset = 0;
        self.len = 0;
    }

    /// Regions holding unread bytes, in stream order. Unused spans are empty.
    pub fn readable_spans(&self) -> [Span; 2] {
        let cap = self.capacity();
        let end = self.offset + self.len;
        if end <= cap {
            [Span::new(self.offset, self.len), Span::default()]
        } else {
            [
                Span::new(self.offset, cap - self.offset),
                Span::new(0, end - cap),
            ]
        }
    }

    /// Regions where new bytes may be written, in stream order
    pub fn writable_spans(&self) -> [Span; 2] {
        let cap = self.capacity();
        let end = self.offset + self.len;
        if self.len == cap {
            [Span::default(), Span::default()]
        } else if end < cap {
            [Span::new(end, cap - end), Span::new(0, self.offset)]
        } else {
            [Span::new(end - cap, self.offset - (end - cap)), Span::default()]
        }
    }

    /// Unread bytes as two slices, in stream order
    pub fn readable_slices(&self) -> (&[u8], &[u8]) {
        let [a, b] = self.readable_spans();
        (&self.storage[a.range()], &self.storage[b.range()])
    }

    /// Free space as two mutable slices, in stream order
    pub fn writable_slices_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let [a, b] = self.writable_spans();
        if b.len == 0 {
            return (&mut self.storage[a.range()], &mut []);
        }
        // Second span always starts at 0 and ends before the first one.
        let (head, tail) = self.storage.split_at_mut(a.offset);
        (&mut tail[..a.len], &mut head[b.range()])
    }

    /// Consume up to `n` unread bytes; returns how many were consumed
    pub fn advance_read(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        if n == self.len {
            // Restart at the front to keep the next write contiguous.
            self.offset = 0;
            self.len = 0;
        } else {
            self.offset = (self.offset + n) % self.capacity();
            self.len -= n;
        }
        n
    }

    /// Commit up to `n` bytes written into the free space
    pub fn advance_write(&mut self, n: usize) -> usize {
        let n = n.min(self.free());
        self.len += n;
        n
    }

    /// Next unread byte without consuming it
    pub fn peek_byte(&self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            Some(self.storage[self.offset])
        }
    }

    /// Copy up to `dst.len()` unread bytes without consuming them
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let (a, b) = self.readable_slices();
        let first = a.len().min(dst.len());
        dst[..first].copy_from_slice(&a[..first]);
        let second = b.len().min(dst.len() - first);
        dst[first..first + second].copy_from_slice(&b[..second]);
        first + second
    }

    /// Copy as much of `src` as fits; returns the number of bytes stored
    pub fn write_slice(&mut self, src: &[u8]) -> usize {
        let (a, b) = self.writable_slices_mut();
        let first = a.len().min(src.len());
        a[..first].copy_from_slice(&src[..first]);
        let second = b.len().min(src.len() - first);
        b[..second].copy_from_slice(&src[first..first + second]);
        self.advance_write(first + second)
    }

    /// Move up to `dst.len()` unread bytes out of the buffer
    pub fn read_slice(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.advance_read(n)
    }

    /// One vectored read from `reader` into the free space.
    ///
    /// `Ok(0)` means end of stream. Must not be called on a full buffer.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.is_full() {
            return Err(io::Error::new(io::ErrorKind::Other, "ring buffer is full"));
        }
        let (a, b) = self.writable_slices_mut();
        let mut bufs = [IoSliceMut::new(a), IoSliceMut::new(b)];
        let n = reader.read_vectored(&mut bufs)?;
        Ok(self.advance_write(n))
    }

    /// One vectored write of the unread bytes into `writer`.
    ///
    /// Must not be called on an empty buffer.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        if self.is_empty() {
            return Err(io::Error::new(io::ErrorKind::Other, "ring buffer is empty"));
        }
        let (a, b) = self.readable_slices();
        let bufs = [IoSlice::new(a), IoSlice::new(b)];
        let n = writer.write_vectored(&bufs)?;
        Ok(self.advance_read(n))
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
