//! Archived object header and heap addresses
//!
//! Every archived object starts with a two-word header:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ mark word (8 bytes)                     │  ← stream slot during loading
//! ├─────────────────────────────────────────┤
//! │ layout word (8 bytes)                   │
//! │  - type index: u32 (low half)           │
//! │  - length: u32 (high half)              │
//! ├─────────────────────────────────────────┤
//! │ payload (fields or array elements)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! All words are stored little-endian. Objects are word aligned and a whole
//! number of words long.

use crate::types::TypeIndex;
use std::fmt;

/// Size of a heap word in bytes
pub const WORD_SIZE: usize = 8;

/// Size of the object header in bytes
pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

/// Byte offset of the mark word
pub const MARK_OFFSET: usize = 0;

/// Byte offset of the layout word
pub const LAYOUT_OFFSET: usize = WORD_SIZE;

/// Address in the runtime (or requested) heap address space
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

impl Address {
    /// The null address
    pub const NULL: Address = Address(0);

    /// Create an address from a raw value
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw address value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the null address
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` above this one
    #[inline]
    pub fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }

    /// Distance in bytes from `base` up to this address
    ///
    /// Returns `None` if this address lies below `base`.
    #[inline]
    pub fn offset_from(self, base: Address) -> Option<u64> {
        self.0.checked_sub(base.0)
    }

    /// Check alignment to `align` bytes (a power of two)
    #[inline]
    pub fn is_aligned(self, align: usize) -> bool {
        self.0 & (align as u64 - 1) == 0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Decoded object header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Mark word (hash and lock bits, opaque to the archive)
    pub mark: u64,

    /// Type of the object
    pub type_index: TypeIndex,

    /// Field count for instances, element count for arrays
    pub length: u32,
}

impl ObjectHeader {
    /// Create a header
    pub fn new(mark: u64, type_index: TypeIndex, length: u32) -> Self {
        Self {
            mark,
            type_index,
            length,
        }
    }

    /// Pack type index and length into the layout word
    #[inline]
    pub fn layout_word(&self) -> u64 {
        (self.type_index.as_u32() as u64) | ((self.length as u64) << 32)
    }

    /// Decode a header from its two words
    #[inline]
    pub fn from_words(mark: u64, layout: u64) -> Self {
        Self {
            mark,
            type_index: TypeIndex::new(layout as u32),
            length: (layout >> 32) as u32,
        }
    }

    /// Read a header from the first [`HEADER_SIZE`] bytes of `bytes`
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(Self::from_words(
            read_word(bytes, MARK_OFFSET),
            read_word(bytes, LAYOUT_OFFSET),
        ))
    }

    /// Write this header into the first [`HEADER_SIZE`] bytes of `bytes`
    pub fn write(&self, bytes: &mut [u8]) {
        write_word(bytes, MARK_OFFSET, self.mark);
        write_word(bytes, LAYOUT_OFFSET, self.layout_word());
    }
}

/// Read a little-endian word at `offset`
#[inline]
pub(crate) fn read_word(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

/// Write a little-endian word at `offset`
#[inline]
pub(crate) fn write_word(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read a reference slot of `width` bytes (4 or 8) at `offset`
#[inline]
pub(crate) fn read_slot(bytes: &[u8], offset: usize, width: usize) -> u64 {
    match width {
        4 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[offset..offset + 4]);
            u32::from_le_bytes(buf) as u64
        }
        _ => read_word(bytes, offset),
    }
}

/// Write a reference slot of `width` bytes (4 or 8) at `offset`
#[inline]
pub(crate) fn write_slot(bytes: &mut [u8], offset: usize, width: usize, value: u64) {
    match width {
        4 => bytes[offset..offset + 4].copy_from_slice(&(value as u32).to_le_bytes()),
        _ => write_word(bytes, offset, value),
    }
}

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two)
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_words_round_trip() {
        let header = ObjectHeader::new(0xdead_beef, TypeIndex::new(7), 42);
        let mut bytes = [0u8; HEADER_SIZE];
        header.write(&mut bytes);

        assert_eq!(read_word(&bytes, LAYOUT_OFFSET), 7 | (42 << 32));
        assert_eq!(ObjectHeader::read(&bytes), Some(header));
    }

    #[test]
    fn test_header_read_short_buffer() {
        assert!(ObjectHeader::read(&[0u8; 15]).is_none());
    }

    #[test]
    fn test_slot_widths() {
        let mut bytes = [0u8; 16];
        write_slot(&mut bytes, 4, 4, 0x1234_5678);
        assert_eq!(read_slot(&bytes, 4, 4), 0x1234_5678);
        assert_eq!(read_word(&bytes, 0), 0x1234_5678 << 32);

        write_slot(&mut bytes, 8, 8, u64::MAX);
        assert_eq!(read_slot(&bytes, 8, 8), u64::MAX);
    }

    #[test]
    fn test_address_arithmetic() {
        let base = Address::new(0x1000);
        let addr = base.add(0x28);
        assert_eq!(addr.offset_from(base), Some(0x28));
        assert_eq!(base.offset_from(addr), None);
        assert!(base.is_aligned(4096));
        assert!(!addr.is_aligned(16));
        assert!(Address::NULL.is_null());
        assert_eq!(format!("{}", addr), "0x1028");
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(8192, 4096), 8192);
    }
}
