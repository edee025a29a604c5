//! Bounds-checked little-endian cursor over a mapped archive
//!
//! Every read is validated against the underlying slice, so a corrupt
//! length or offset field surfaces as `ArchiveError::OutOfBounds` instead
//! of a panic.

use crate::core::error::ArchiveError;

/// Read-only cursor over archive bytes
#[derive(Debug, Clone, Copy)]
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteCursor { bytes, pos: 0 }
    }

    /// Cursor positioned at `pos`
    pub fn at(bytes: &'a [u8], pos: usize) -> Result<Self, ArchiveError> {
        let mut cursor = ByteCursor::new(bytes);
        cursor.seek(pos)?;
        Ok(cursor)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), ArchiveError> {
        if pos > self.bytes.len() {
            return Err(self.out_of_bounds(pos, 0));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ArchiveError> {
        let target = self
            .pos
            .checked_add(n)
            .ok_or_else(|| self.out_of_bounds(self.pos, n))?;
        self.seek(target)
    }

    /// Borrow `n` bytes and advance
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ArchiveError> {
        let slice = self.peek(self.pos, n)?;
        self.pos += n;
        Ok(slice)
    }

    /// Borrow `n` bytes at an absolute offset without moving
    pub fn peek(&self, offset: usize, n: usize) -> Result<&'a [u8], ArchiveError> {
        match offset.checked_add(n) {
            Some(end) if end <= self.bytes.len() => Ok(&self.bytes[offset..end]),
            _ => Err(self.out_of_bounds(offset, n)),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, ArchiveError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, ArchiveError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, ArchiveError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16, ArchiveError> {
        let b = self.peek(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a u32 at an absolute offset without moving
    pub fn u32_at(&self, offset: usize) -> Result<u32, ArchiveError> {
        let b = self.peek(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64_at(&self, offset: usize) -> Result<u64, ArchiveError> {
        let b = self.peek(offset, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    /// Scan backward from `start` for a little-endian u32 `signature`.
    ///
    /// At most `max_distance + 1` candidate offsets are tested
    /// (`start`, `start - 1`, ...). Returns the offset of the first match.
    pub fn rfind_u32(&self, start: usize, max_distance: usize, signature: u32) -> Option<usize> {
        let floor = start.saturating_sub(max_distance);
        (floor..=start)
            .rev()
            .find(|&offset| matches!(self.u32_at(offset), Ok(v) if v == signature))
    }

    fn out_of_bounds(&self, offset: usize, len: usize) -> ArchiveError {
        ArchiveError::OutOfBounds {
            offset: offset as u64,
            len: len as u64,
            size: self.bytes.len() as u64,
        }
    }
}
