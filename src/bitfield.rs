//! A packed bit vector representing piece availability, with an incrementally
//! maintained popcount so that `count()` doesn't have to rescan the backing
//! storage on every call.

use crate::Bitfield;
use bitvec::prelude::{BitVec, Msb0};

/// The piece-availability bitfield of a torrent or of a single peer.
///
/// Bit `i` set means "has piece `i`". The backing storage is always rounded
/// up to a whole number of bytes, most-significant-bit first within each
/// byte (the wire representation cratetorrent's peers exchange). Any bits
/// beyond the logical length `len` are padding and are always zero.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitField {
    inner: Bitfield,
    /// Logical number of pieces this bitfield represents. May be smaller
    /// than `inner.len()`, which is always a multiple of 8.
    len: usize,
    /// Cached number of set bits in `inner[..len]`. Kept in sync by `set`;
    /// any method that mutates `inner` directly must call
    /// `invalidate_count`.
    count: usize,
}

impl BitField {
    /// Creates a new bitfield of `len` pieces, with all bits cleared.
    pub fn new(len: usize) -> Self {
        Self {
            inner: Bitfield::repeat(false, Self::byte_len(len) * 8),
            len,
            count: 0,
        }
    }

    /// Creates a bitfield of `len` pieces from its packed wire
    /// representation.
    ///
    /// `buf` must be exactly `ceil(len / 8)` bytes long. Trailing padding
    /// bits (beyond `len`) are ignored by `get`/`count` but preserved in the
    /// backing buffer; the wire protocol expects them to be zero, but a
    /// violation is not itself an error here (the wire layer validates and
    /// rejects malformed bitfields before they reach this type).
    pub fn from_bytes(buf: &[u8], len: usize) -> Self {
        assert_eq!(buf.len(), Self::byte_len(len));
        let inner = Bitfield::from_slice(buf);
        let count = Self::count_prefix(&inner, len);
        Self { inner, len, count }
    }

    /// Creates a bitfield of `len` pieces with every piece marked as had.
    pub fn create_full(len: usize) -> Self {
        let mut inner = Bitfield::repeat(false, Self::byte_len(len) * 8);
        for i in 0..len {
            inner.set(i, true);
        }
        Self {
            inner,
            len,
            count: len,
        }
    }

    /// The number of pieces (logical bits) this bitfield represents.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether piece `i` is set. Panics if `i >= len()`.
    pub fn get(&self, i: usize) -> bool {
        assert!(i < self.len, "bitfield index {} out of range {}", i, self.len);
        self.inner[i]
    }

    /// Sets (or clears) piece `i`. Panics if `i >= len()`.
    ///
    /// Updates the cached count in O(1) if the value actually changes.
    pub fn set(&mut self, i: usize, v: bool) {
        assert!(i < self.len, "bitfield index {} out of range {}", i, self.len);
        let was = self.inner[i];
        if was != v {
            self.inner.set(i, v);
            if v {
                self.count += 1;
            } else {
                self.count -= 1;
            }
        }
    }

    /// The number of set bits among the logical `len` pieces. O(1).
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether every piece is set.
    pub fn has_all(&self) -> bool {
        self.count == self.len
    }

    /// Whether no piece is set.
    pub fn has_none(&self) -> bool {
        self.count == 0
    }

    /// Returns the packed, MSB-first, zero-padded wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.as_slice().to_vec()
    }

    /// Recomputes the cached count from scratch.
    ///
    /// Only needed if a caller obtains mutable access to the backing
    /// `BitVec` directly (this type doesn't expose that, but the method is
    /// kept for use by `from_bytes`-style reconstructions performed
    /// elsewhere).
    pub fn invalidate_count(&mut self) {
        self.count = Self::count_prefix(&self.inner, self.len);
    }

    /// Merges another bitfield of the same length into this one with
    /// bitwise-or, used when folding a peer's incremental `have` announces.
    pub fn union_with(&mut self, other: &BitField) {
        assert_eq!(self.len, other.len);
        for i in 0..self.len {
            if other.get(i) {
                self.set(i, true);
            }
        }
    }

    fn byte_len(len: usize) -> usize {
        (len + 7) / 8
    }

    fn count_prefix(inner: &Bitfield, len: usize) -> usize {
        (0..len).filter(|&i| inner[i]).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_bitfield_has_no_set_bits() {
        let b = BitField::new(10);
        assert_eq!(b.count(), 0);
        assert!(b.has_none());
        assert!(!b.has_all());
        for i in 0..10 {
            assert!(!b.get(i));
        }
    }

    #[test]
    fn create_full_sets_only_logical_bits() {
        let b = BitField::create_full(10);
        assert!(b.has_all());
        assert_eq!(b.count(), 10);
        // padding bits beyond len must remain zero
        assert_eq!(b.inner.len(), 16);
        for i in 10..16 {
            assert!(!b.inner[i]);
        }
    }

    #[test]
    fn set_updates_cached_count_incrementally() {
        let mut b = BitField::new(8);
        assert_eq!(b.count(), 0);
        b.set(0, true);
        assert_eq!(b.count(), 1);
        b.set(0, true); // no-op, already set
        assert_eq!(b.count(), 1);
        b.set(1, true);
        assert_eq!(b.count(), 2);
        b.set(0, false);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn round_trip_through_bytes_preserves_bits() {
        let mut b = BitField::new(12);
        b.set(0, true);
        b.set(1, true);
        b.set(7, true);
        b.set(11, true);
        let bytes = b.to_bytes();
        let restored = BitField::from_bytes(&bytes, 12);
        for i in 0..12 {
            assert_eq!(b.get(i), restored.get(i), "bit {} differs", i);
        }
        assert_eq!(b.count(), restored.count());
    }

    #[test]
    fn padding_bits_beyond_len_are_zero() {
        // 10 pieces requires 2 bytes (16 bits), so bits 10..16 are padding.
        let b = BitField::create_full(10);
        let bytes = b.to_bytes();
        assert_eq!(bytes.len(), 2);
        let last_byte = bytes[1];
        // top 2 bits of the second byte (pieces 8, 9) are set, the bottom 6
        // bits (padding) must be zero
        assert_eq!(last_byte & 0b0011_1111, 0);
    }

    #[test]
    #[should_panic]
    fn get_out_of_range_panics() {
        let b = BitField::new(4);
        b.get(4);
    }
}
