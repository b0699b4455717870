// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Cyclic buffer for staging I/O bytes.
//!
//! Incoming data is pushed at the write position, outgoing data is popped
//! from the read position, both wrapping modulo the fixed capacity:
//!
//! ```text
//!   xx xx xx xx ... yy yy yy
//!   ^^                    ^^
//!   read position         write position
//!   (pop from here)       (push here)
//! ```

use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Byte order for the integer peek helpers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FifoError {
    /// Push larger than the free space. The buffer is unchanged.
    Overflow { want: usize, left: usize },

    /// Pop/peek/skip larger than the stored bytes. The buffer is unchanged.
    Underflow { want: usize, have: usize },
}

impl std::error::Error for FifoError {}

impl fmt::Display for FifoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Overflow { want, left } => {
                write!(f, "cannot append {want} bytes, only {left} left")
            }
            Self::Underflow { want, have } => {
                write!(f, "cannot pop {want} bytes, only {have} available")
            }
        }
    }
}

/// The buffer proper. All operations live here so that a caller who needs
/// several of them done atomically can work through [`Fifo::lock`].
pub struct FifoInner {
    buf: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    bytes_left: usize,
}

impl FifoInner {
    /// Append `src` at the write position. Fails without touching the buffer
    /// when `src` is larger than the free space.
    pub fn push(&mut self, src: &[u8]) -> Result<(), FifoError> {
        let n = src.len();

        if n > self.bytes_left {
            return Err(FifoError::Overflow {
                want: n,
                left: self.bytes_left,
            });
        }

        let to_end = self.capacity() - self.write_pos;

        if n <= to_end {
            self.buf[self.write_pos..self.write_pos + n].copy_from_slice(src);
        } else {
            self.buf[self.write_pos..].copy_from_slice(&src[..to_end]);
            self.buf[..n - to_end].copy_from_slice(&src[to_end..]);
        }

        self.write_pos = (self.write_pos + n) % self.capacity();
        self.bytes_left -= n;

        Ok(())
    }

    /// Copy `dst.len()` bytes out from the read position and consume them.
    /// Popping exactly `len()` bytes is allowed and empties the buffer.
    pub fn pop(&mut self, dst: &mut [u8]) -> Result<(), FifoError> {
        self.peek(dst)?;
        self.advance(dst.len());
        Ok(())
    }

    /// Copy without consuming.
    pub fn peek(&self, dst: &mut [u8]) -> Result<(), FifoError> {
        let n = dst.len();

        if n > self.len() {
            return Err(FifoError::Underflow {
                want: n,
                have: self.len(),
            });
        }

        let to_end = self.capacity() - self.read_pos;

        if n <= to_end {
            dst.copy_from_slice(&self.buf[self.read_pos..self.read_pos + n]);
        } else {
            dst[..to_end].copy_from_slice(&self.buf[self.read_pos..]);
            dst[to_end..].copy_from_slice(&self.buf[..n - to_end]);
        }

        Ok(())
    }

    /// Consume `n` bytes without copying them anywhere.
    pub fn skip(&mut self, n: usize) -> Result<(), FifoError> {
        if n > self.len() {
            return Err(FifoError::Underflow {
                want: n,
                have: self.len(),
            });
        }

        self.advance(n);
        Ok(())
    }

    /// First byte in the queue, or zero when empty.
    pub fn peek_byte(&self) -> u8 {
        if self.len() >= 1 {
            self.buf[self.read_pos]
        } else {
            0
        }
    }

    /// First four bytes as an integer, or zero when fewer are buffered.
    pub fn peek_u32(&self, endian: Endian) -> u32 {
        let mut bytes = [0u8; 4];

        if self.peek(&mut bytes).is_err() {
            return 0;
        }

        match endian {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        }
    }

    /// First eight bytes as an integer, or zero when fewer are buffered.
    pub fn peek_u64(&self, endian: Endian) -> u64 {
        let mut bytes = [0u8; 8];

        if self.peek(&mut bytes).is_err() {
            return 0;
        }

        match endian {
            Endian::Little => u64::from_le_bytes(bytes),
            Endian::Big => u64::from_be_bytes(bytes),
        }
    }

    /// Bytes currently stored.
    pub fn len(&self) -> usize {
        self.capacity() - self.bytes_left
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free space remaining. `bytes_left() + len() == capacity()` always.
    pub fn bytes_left(&self) -> usize {
        self.bytes_left
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn advance(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n) % self.capacity();
        self.bytes_left += n;
    }
}

/// A fixed-capacity cyclic byte buffer, internally locked.
///
/// The convenience methods lock per call; use [`Fifo::lock`] to hold the
/// buffer across several operations.
pub struct Fifo {
    inner: Mutex<FifoInner>,
}

impl Fifo {
    pub fn new(capacity: usize) -> Fifo {
        assert!(capacity > 0, "fifo capacity must be non-zero");

        Fifo {
            inner: Mutex::new(FifoInner {
                buf: vec![0; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                bytes_left: capacity,
            }),
        }
    }

    /// Take the internal lock for multi-operation atomicity.
    pub fn lock(&self) -> MutexGuard<'_, FifoInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, src: &[u8]) -> Result<(), FifoError> {
        self.lock().push(src)
    }

    pub fn pop(&self, dst: &mut [u8]) -> Result<(), FifoError> {
        self.lock().pop(dst)
    }

    pub fn peek(&self, dst: &mut [u8]) -> Result<(), FifoError> {
        self.lock().peek(dst)
    }

    pub fn skip(&self, n: usize) -> Result<(), FifoError> {
        self.lock().skip(n)
    }

    pub fn peek_byte(&self) -> u8 {
        self.lock().peek_byte()
    }

    pub fn peek_u32(&self, endian: Endian) -> u32 {
        self.lock().peek_u32(endian)
    }

    pub fn peek_u64(&self, endian: Endian) -> u64 {
        self.lock().peek_u64(endian)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn bytes_left(&self) -> usize {
        self.lock().bytes_left()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trip() {
        let fifo = Fifo::new(16);

        fifo.push(b"hello").unwrap();
        assert_eq!(fifo.len(), 5);
        assert_eq!(fifo.bytes_left(), 11);

        let mut out = [0u8; 5];
        fifo.pop(&mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(fifo.len(), 0);
        assert_eq!(fifo.bytes_left(), 16);
    }

    #[test]
    fn wraps_across_the_end() {
        let fifo = Fifo::new(8);

        fifo.push(b"abcdef").unwrap();
        let mut out = [0u8; 6];
        fifo.pop(&mut out).unwrap();

        // Read and write positions now sit at offset 6; this push wraps.
        fifo.push(b"123456").unwrap();
        fifo.pop(&mut out).unwrap();
        assert_eq!(&out, b"123456");
    }

    #[test]
    fn overflow_leaves_state_unchanged() {
        let fifo = Fifo::new(4);
        fifo.push(b"ab").unwrap();

        assert_eq!(
            fifo.push(b"cde"),
            Err(FifoError::Overflow { want: 3, left: 2 })
        );

        assert_eq!(fifo.len(), 2);
        let mut out = [0u8; 2];
        fifo.pop(&mut out).unwrap();
        assert_eq!(&out, b"ab");
    }

    #[test]
    fn popping_everything_is_allowed() {
        // Popping exactly len() bytes must succeed, not be off by one.
        let fifo = Fifo::new(4);
        fifo.push(b"abcd").unwrap();

        let mut out = [0u8; 4];
        fifo.pop(&mut out).unwrap();
        assert_eq!(&out, b"abcd");
        assert_eq!(fifo.bytes_left(), 4);

        assert_eq!(
            fifo.pop(&mut out),
            Err(FifoError::Underflow { want: 4, have: 0 })
        );
    }

    #[test]
    fn pop_then_push_restores_content() {
        let fifo = Fifo::new(8);
        fifo.push(b"abcdef").unwrap();

        let mut popped = [0u8; 2];
        fifo.pop(&mut popped).unwrap();
        fifo.push(&popped).unwrap();

        // Occupancy is restored and the remaining bytes come out in order,
        // followed by the recycled ones.
        assert_eq!(fifo.len(), 6);
        let mut out = [0u8; 6];
        fifo.pop(&mut out).unwrap();
        assert_eq!(&out, b"cdefab");
    }

    #[test]
    fn peek_does_not_consume() {
        let fifo = Fifo::new(8);
        fifo.push(b"xyz").unwrap();

        let mut peeked = [0u8; 3];
        fifo.peek(&mut peeked).unwrap();
        assert_eq!(&peeked, b"xyz");
        assert_eq!(fifo.len(), 3);

        assert_eq!(fifo.peek_byte(), b'x');

        let mut out = [0u8; 3];
        fifo.pop(&mut out).unwrap();
        assert_eq!(&out, b"xyz");
    }

    #[test]
    fn integer_peeks_respect_endianness() {
        let fifo = Fifo::new(16);
        fifo.push(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08])
            .unwrap();

        assert_eq!(fifo.peek_u32(Endian::Little), 0x04030201);
        assert_eq!(fifo.peek_u32(Endian::Big), 0x01020304);
        assert_eq!(fifo.peek_u64(Endian::Little), 0x0807060504030201);
        assert_eq!(fifo.peek_u64(Endian::Big), 0x0102030405060708);

        // Nothing was consumed.
        assert_eq!(fifo.len(), 8);
    }

    #[test]
    fn short_integer_peeks_return_zero() {
        let fifo = Fifo::new(16);
        assert_eq!(fifo.peek_byte(), 0);

        fifo.push(&[0xFF, 0xFF]).unwrap();
        assert_eq!(fifo.peek_u32(Endian::Little), 0);
        assert_eq!(fifo.peek_u64(Endian::Big), 0);
    }

    #[test]
    fn skip_discards() {
        let fifo = Fifo::new(8);
        fifo.push(b"abcdef").unwrap();
        fifo.skip(4).unwrap();

        let mut out = [0u8; 2];
        fifo.pop(&mut out).unwrap();
        assert_eq!(&out, b"ef");

        assert_eq!(fifo.skip(1), Err(FifoError::Underflow { want: 1, have: 0 }));
    }

    #[test]
    fn guard_keeps_multiple_ops_atomic() {
        let fifo = Fifo::new(8);

        let mut guard = fifo.lock();
        guard.push(b"abcd").unwrap();
        assert_eq!(guard.peek_u32(Endian::Little), u32::from_le_bytes(*b"abcd"));
        guard.skip(4).unwrap();
        assert!(guard.is_empty());
    }
}
