//! Growable byte buffer with an explicit read/write cursor.
//!
//! The buffer owns a heap region with `pos <= len <= capacity`. During
//! encoding `len` tracks `pos` (every write appends); during decoding `pos`
//! is the read cursor and `len` marks the end of valid input. Growth follows
//! a hybrid policy: double while small, grow by 50% once the buffer is large
//! enough that doubling would waste real memory.

use std::fmt;

use crate::error::Error;

/// Initial heap allocation for a fresh buffer.
pub const INITIAL_CAPACITY: usize = 1024;

/// Doubling/1.5x crossover point.
const GROWTH_CROSSOVER: usize = 64 * 1024;

/// Default ceiling on buffer capacity (256 MiB).
pub const DEFAULT_MAX: usize = 256 * 1024 * 1024;

/// A growable byte buffer.
///
/// `buf.len()` is the end of valid data and `buf.capacity()` the allocated
/// region; `pos` is the cursor. All appends are bounds-checked against a
/// configurable ceiling.
pub struct Buffer {
    buf: Vec<u8>,
    pos: usize,
    max: usize,
}

impl Buffer {
    /// Create an empty buffer with the default 256 MiB ceiling.
    pub fn new() -> Self {
        Self::with_max(DEFAULT_MAX)
    }

    /// Create an empty buffer with a custom capacity ceiling.
    pub fn with_max(max: usize) -> Self {
        Buffer {
            buf: Vec::with_capacity(INITIAL_CAPACITY.min(max)),
            pos: 0,
            max,
        }
    }

    /// Take ownership of already-encoded bytes, cursor at the start.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let max = bytes.len().max(DEFAULT_MAX);
        Buffer {
            buf: bytes,
            pos: 0,
            max,
        }
    }

    /// Current cursor position.
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// End of valid data.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if the buffer holds no data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Allocated capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Read-only view of the valid contents. This is the zero-copy path:
    /// callers hand the slice to vectored sends without copying out.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the buffer, returning the valid contents.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    /// Reset the cursor to the start (for re-reading).
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Guarantee room for `cnt` more bytes at the cursor, growing if needed.
    ///
    /// Fails with [`Error::BufferOverflow`] once `pos + cnt` would exceed the
    /// ceiling. Growth doubles below 64 KiB and multiplies by 1.5 at or above
    /// it; if the multiplication itself would overflow, the capacity is
    /// clamped to the exact requirement.
    pub fn require(&mut self, cnt: usize) -> Result<(), Error> {
        let required = self
            .pos
            .checked_add(cnt)
            .filter(|&n| n <= self.max)
            .ok_or(Error::BufferOverflow)?;
        if self.buf.capacity() >= required {
            return Ok(());
        }

        let mut capacity = self.buf.capacity();
        if capacity == 0 {
            capacity = INITIAL_CAPACITY;
        }
        while capacity < required {
            capacity = if capacity < GROWTH_CROSSOVER {
                capacity.checked_mul(2).unwrap_or(required)
            } else {
                capacity.checked_add(capacity / 2).unwrap_or(required)
            };
        }
        let capacity = capacity.min(self.max);
        self.buf
            .try_reserve_exact(capacity - self.buf.len())
            .map_err(|_| Error::OutOfMemory)
    }

    /// Guarantee `cnt` readable bytes at the cursor.
    #[inline]
    pub fn avail(&self, cnt: usize) -> Result<(), Error> {
        match self.pos.checked_add(cnt) {
            Some(end) if end <= self.buf.len() => Ok(()),
            _ => Err(Error::BufferUnderflow),
        }
    }

    // -- Appends (encode side) -----------------------------------------------

    /// Append a single byte.
    pub fn put_u8(&mut self, v: u8) -> Result<(), Error> {
        self.require(1)?;
        self.buf.push(v);
        self.pos += 1;
        Ok(())
    }

    /// Append raw bytes.
    pub fn put_slice(&mut self, v: &[u8]) -> Result<(), Error> {
        self.require(v.len())?;
        self.buf.extend_from_slice(v);
        self.pos += v.len();
        Ok(())
    }

    /// Append a big-endian u64.
    pub fn put_u64_be(&mut self, v: u64) -> Result<(), Error> {
        self.put_slice(&v.to_be_bytes())
    }

    /// Append a big-endian i64.
    pub fn put_i64_be(&mut self, v: i64) -> Result<(), Error> {
        self.put_slice(&v.to_be_bytes())
    }

    /// Overwrite bytes at an absolute offset inside the valid region.
    pub fn patch(&mut self, offset: usize, v: &[u8]) {
        self.buf[offset..offset + v.len()].copy_from_slice(v);
    }

    /// Open a gap of `extra` zero bytes at `offset`, shifting the tail right.
    ///
    /// Used by the table-header widening pass: the payload written after a
    /// 2-byte size placeholder is moved to make room for 16/32/64-bit counts.
    pub fn widen(&mut self, offset: usize, extra: usize) -> Result<(), Error> {
        debug_assert!(offset <= self.pos);
        self.require(extra)?;
        let old_len = self.buf.len();
        self.buf.resize(old_len + extra, 0);
        self.buf.copy_within(offset..old_len, offset + extra);
        self.pos += extra;
        Ok(())
    }

    // -- Reads (decode side) -------------------------------------------------

    /// Read a single byte at the cursor.
    pub fn get_u8(&mut self) -> Result<u8, Error> {
        self.avail(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    /// Read `cnt` raw bytes at the cursor.
    pub fn get_slice(&mut self, cnt: usize) -> Result<&[u8], Error> {
        self.avail(cnt)?;
        let v = &self.buf[self.pos..self.pos + cnt];
        self.pos += cnt;
        Ok(v)
    }

    /// Read a big-endian u64 at the cursor.
    pub fn get_u64_be(&mut self) -> Result<u64, Error> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.get_slice(8)?);
        Ok(u64::from_be_bytes(raw))
    }

    /// Read a big-endian i64 at the cursor.
    pub fn get_i64_be(&mut self) -> Result<i64, Error> {
        Ok(self.get_u64_be()? as i64)
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("pos", &self.pos)
            .field("len", &self.buf.len())
            .field("capacity", &self.buf.capacity())
            .finish()
    }
}

/// A buffer stringifies to its raw contents.
impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let mut b = Buffer::new();
        b.put_u8(0x41).unwrap();
        b.put_u64_be(0x0102030405060708).unwrap();
        b.put_i64_be(-5).unwrap();
        b.put_slice(b"tail").unwrap();
        assert_eq!(b.len(), 21);
        assert_eq!(b.pos(), 21);

        b.rewind();
        assert_eq!(b.get_u8().unwrap(), 0x41);
        assert_eq!(b.get_u64_be().unwrap(), 0x0102030405060708);
        assert_eq!(b.get_i64_be().unwrap(), -5);
        assert_eq!(b.get_slice(4).unwrap(), b"tail");
        assert_eq!(b.get_u8(), Err(Error::BufferUnderflow));
    }

    #[test]
    fn underflow_on_short_input() {
        let mut b = Buffer::from_vec(vec![1, 2, 3]);
        assert_eq!(b.get_u64_be(), Err(Error::BufferUnderflow));
        // cursor must not move on a failed read
        assert_eq!(b.pos(), 0);
        assert_eq!(b.get_slice(3).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn overflow_past_ceiling() {
        let mut b = Buffer::with_max(16);
        b.put_slice(&[0u8; 16]).unwrap();
        assert_eq!(b.put_u8(0), Err(Error::BufferOverflow));
    }

    #[test]
    fn growth_doubles_when_small() {
        let mut b = Buffer::new();
        assert_eq!(b.capacity(), INITIAL_CAPACITY);
        b.put_slice(&[0u8; INITIAL_CAPACITY + 1]).unwrap();
        assert_eq!(b.capacity(), INITIAL_CAPACITY * 2);
    }

    #[test]
    fn growth_is_3_over_2_when_large() {
        let mut b = Buffer::new();
        b.put_slice(&vec![0u8; GROWTH_CROSSOVER]).unwrap();
        assert_eq!(b.capacity(), GROWTH_CROSSOVER);
        b.put_u8(0).unwrap();
        assert_eq!(b.capacity(), GROWTH_CROSSOVER + GROWTH_CROSSOVER / 2);
    }

    #[test]
    fn widen_shifts_tail() {
        let mut b = Buffer::new();
        b.put_slice(b"ab__tail").unwrap();
        b.widen(4, 2).unwrap();
        assert_eq!(&b.as_slice()[..2], b"ab");
        assert_eq!(&b.as_slice()[6..], b"tail");
        assert_eq!(b.pos(), 10);
    }

    #[test]
    fn display_is_raw_contents() {
        let mut b = Buffer::new();
        b.put_slice(b"test").unwrap();
        assert_eq!(b.to_string(), "test");
    }
}
