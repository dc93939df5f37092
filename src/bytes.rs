//! Low-level byte access with explicit byte order.
//!
//! [`ByteSource`] and [`ByteSink`] are the boundary abstractions consumed by
//! the element codec: position-tracked cursors with bulk primitive reads and
//! writes in the byte order the file declares. Every access is bounds
//! checked; running off the end of a source is a format error (the stream is
//! truncated), overflowing a fixed sink is a resource error (the scratch
//! buffer was sized wrong).

use crate::error::{MatError, Result};
use crate::format::ByteOrder;

macro_rules! read_primitive {
    ($name:ident, $ty:ty, $width:expr) => {
        /// Reads one value in the source's byte order.
        fn $name(&mut self) -> Result<$ty> {
            let mut raw = [0u8; $width];
            self.read_exact(&mut raw)?;
            Ok(match self.order() {
                ByteOrder::Little => <$ty>::from_le_bytes(raw),
                ByteOrder::Big => <$ty>::from_be_bytes(raw),
            })
        }
    };
}

macro_rules! write_primitive {
    ($name:ident, $ty:ty) => {
        /// Writes one value in the sink's byte order.
        fn $name(&mut self, value: $ty) -> Result<()> {
            let raw = match self.order() {
                ByteOrder::Little => value.to_le_bytes(),
                ByteOrder::Big => value.to_be_bytes(),
            };
            self.write_bytes(&raw)
        }
    };
}

/// A position-tracked reader over a byte buffer.
pub trait ByteSource {
    /// Byte order applied to multi-byte reads.
    fn order(&self) -> ByteOrder;

    /// Current read position from the start of the source.
    fn position(&self) -> u64;

    /// Number of bytes left to read.
    fn remaining(&self) -> u64;

    /// Fills `out` completely or fails with a format error.
    fn read_exact(&mut self, out: &mut [u8]) -> Result<()>;

    /// Advances the cursor by `n` bytes without inspecting them.
    fn skip(&mut self, n: u64) -> Result<()>;

    /// Reads a single byte.
    fn read_u8(&mut self) -> Result<u8> {
        let mut raw = [0u8; 1];
        self.read_exact(&mut raw)?;
        Ok(raw[0])
    }

    read_primitive!(read_u16, u16, 2);
    read_primitive!(read_u32, u32, 4);
    read_primitive!(read_u64, u64, 8);
    read_primitive!(read_i8, i8, 1);
    read_primitive!(read_i16, i16, 2);
    read_primitive!(read_i32, i32, 4);
    read_primitive!(read_i64, i64, 8);
    read_primitive!(read_f32, f32, 4);
    read_primitive!(read_f64, f64, 8);

    /// Reads `n` bytes into a fresh vector.
    fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        self.read_exact(&mut out)?;
        Ok(out)
    }

    /// Skips padding up to the next 8-byte boundary.
    fn align8(&mut self) -> Result<()> {
        let gap = crate::format::pad8_gap(self.position());
        if gap > 0 {
            self.skip(gap)?;
        }
        Ok(())
    }
}

/// A position-tracked writer over a byte buffer.
pub trait ByteSink {
    /// Byte order applied to multi-byte writes.
    fn order(&self) -> ByteOrder;

    /// Current write position from the start of the sink.
    fn position(&self) -> u64;

    /// Appends raw bytes.
    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()>;

    /// Writes a single byte.
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    write_primitive!(write_u16, u16);
    write_primitive!(write_u32, u32);
    write_primitive!(write_u64, u64);
    write_primitive!(write_i8, i8);
    write_primitive!(write_i16, i16);
    write_primitive!(write_i32, i32);
    write_primitive!(write_i64, i64);
    write_primitive!(write_f32, f32);
    write_primitive!(write_f64, f64);

    /// Writes zero bytes up to the next 8-byte boundary.
    fn align8(&mut self) -> Result<()> {
        let gap = crate::format::pad8_gap(self.position());
        for _ in 0..gap {
            self.write_u8(0)?;
        }
        Ok(())
    }
}

/// A bounds-checked [`ByteSource`] over a borrowed slice.
#[derive(Debug)]
pub struct SliceSource<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> SliceSource<'a> {
    /// Wraps `buf` with the given byte order, cursor at zero.
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self {
            buf,
            pos: 0,
            order,
        }
    }

    /// The slice still ahead of the cursor.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Reads the next word without advancing the cursor.
    pub fn peek_u32(&self) -> Result<u32> {
        let end = self
            .pos
            .checked_add(4)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                MatError::format(format!("truncated stream: need 4 bytes at offset {}", self.pos))
            })?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.pos..end]);
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        })
    }

    /// Borrows `n` bytes ahead of the cursor and advances past them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                MatError::format(format!(
                    "truncated stream: need {n} bytes at offset {}",
                    self.pos
                ))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}

impl ByteSource for SliceSource<'_> {
    fn order(&self) -> ByteOrder {
        self.order
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn remaining(&self) -> u64 {
        (self.buf.len() - self.pos) as u64
    }

    fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let src = self.take(out.len())?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        let n = usize::try_from(n)
            .map_err(|_| MatError::format(format!("skip length {n} exceeds address space")))?;
        self.take(n)?;
        Ok(())
    }
}

/// A growable [`ByteSink`] backed by an owned vector.
#[derive(Debug)]
pub struct VecSink {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl VecSink {
    /// An empty little-endian sink.
    pub fn new(order: ByteOrder) -> Self {
        Self {
            buf: Vec::new(),
            order,
        }
    }

    /// An empty sink with reserved capacity.
    pub fn with_capacity(order: ByteOrder, capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            order,
        }
    }

    /// Consumes the sink, returning the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl ByteSink for VecSink {
    fn order(&self) -> ByteOrder {
        self.order
    }

    fn position(&self) -> u64 {
        self.buf.len() as u64
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }
}

/// A fixed-capacity [`ByteSink`] over a borrowed mutable slice.
///
/// Used by pipeline tasks to serialize into an allocator-owned scratch
/// buffer; overflowing the slice means the buffer was sized below
/// `compute_size` and is reported as a resource error.
#[derive(Debug)]
pub struct SliceSink<'a> {
    buf: &'a mut [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> SliceSink<'a> {
    /// Wraps `buf` with the given byte order, cursor at zero.
    pub fn new(buf: &'a mut [u8], order: ByteOrder) -> Self {
        Self {
            buf,
            pos: 0,
            order,
        }
    }

    /// Number of bytes written so far.
    pub fn written(&self) -> usize {
        self.pos
    }
}

impl ByteSink for SliceSink<'_> {
    fn order(&self) -> ByteOrder {
        self.order
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self
            .pos
            .checked_add(bytes.len())
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                MatError::Resource(format!(
                    "scratch buffer overflow: {} bytes written, {} more requested, capacity {}",
                    self.pos,
                    bytes.len(),
                    self.buf.len()
                ))
            })?;
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }
}
