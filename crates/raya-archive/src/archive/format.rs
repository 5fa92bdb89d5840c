//! Archive binary format definitions
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ header (padded to 4096)      │
//! ├──────────────────────────────┤ image_offset
//! │ image: open | pad | closed   │
//! ├──────────────────────────────┤ types_offset
//! │ type table                   │
//! ├──────────────────────────────┤ bitmaps_offset
//! │ open oop, open ptr,          │
//! │ closed oop, closed ptr maps  │
//! ├──────────────────────────────┤ checksum_offset
//! │ SHA-256 of everything above  │
//! └──────────────────────────────┘
//! ```

use crate::codec::ReferenceEncoding;
use crate::graph::RegionKind;
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::ops::Range;

/// Magic number for Raya heap archives: "RAYAHEAP"
pub const ARCHIVE_MAGIC: u64 = u64::from_le_bytes(*b"RAYAHEAP");

/// Current archive format version
pub const ARCHIVE_VERSION: u32 = 1;

/// Endianness marker
pub const ENDIANNESS_MARKER: u32 = 0x01020304;

/// Size of the header page; the image starts right after it
pub const HEADER_PAGE_SIZE: usize = 4096;

/// Header flag: references are narrow
pub const FLAG_NARROW: u32 = 1;

/// Size of the trailing SHA-256 checksum
pub const CHECKSUM_SIZE: usize = 32;

/// Archive header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveHeader {
    /// Magic number (must be ARCHIVE_MAGIC)
    pub magic: u64,

    /// Archive format version
    pub version: u32,

    /// Flags (FLAG_NARROW)
    pub flags: u32,

    /// Endianness marker (0x01020304)
    pub endianness: u32,

    /// Reference slot width in bytes
    pub ref_size: u32,

    /// Narrow shift at dump time
    pub narrow_shift: u32,

    /// Reserved for future use
    pub reserved: u32,

    /// Narrow base at dump time
    pub narrow_base: u64,

    /// Region alignment `G`
    pub region_alignment: u64,

    /// Requested address of the open region bottom
    pub requested_base: u64,

    /// Image offset of the open region (always 0)
    pub open_offset: u64,

    /// Open region size in bytes
    pub open_size: u64,

    /// Image offset of the closed region
    pub closed_offset: u64,

    /// Closed region size in bytes
    pub closed_size: u64,

    /// Image length, a multiple of `G`
    pub image_len: u64,

    /// Image offset of the root array
    pub root_offset: u64,

    /// Requested base of the native image
    pub native_base: u64,

    /// Size of the requested native range
    pub native_size: u64,

    /// Number of archived objects, root array included
    pub object_count: u64,

    /// File offset of the image
    pub image_offset: u64,

    /// File offset of the type table
    pub types_offset: u64,

    /// Type table length in bytes
    pub types_len: u64,

    /// File offset of the bitmaps
    pub bitmaps_offset: u64,

    /// Bitmaps length in bytes
    pub bitmaps_len: u64,

    /// Bit count of the open region's oop map
    pub open_oop_bits: u64,

    /// Bit count of the open region's ptr map
    pub open_ptr_bits: u64,

    /// Bit count of the closed region's oop map
    pub closed_oop_bits: u64,

    /// Bit count of the closed region's ptr map
    pub closed_ptr_bits: u64,

    /// File offset of the checksum
    pub checksum_offset: u64,
}

impl ArchiveHeader {
    /// Create a header with everything but the identification fields zeroed
    pub fn new() -> Self {
        Self {
            magic: ARCHIVE_MAGIC,
            version: ARCHIVE_VERSION,
            flags: 0,
            endianness: ENDIANNESS_MARKER,
            ref_size: 8,
            narrow_shift: 0,
            reserved: 0,
            narrow_base: 0,
            region_alignment: 0,
            requested_base: 0,
            open_offset: 0,
            open_size: 0,
            closed_offset: 0,
            closed_size: 0,
            image_len: 0,
            root_offset: 0,
            native_base: 0,
            native_size: 0,
            object_count: 0,
            image_offset: 0,
            types_offset: 0,
            types_len: 0,
            bitmaps_offset: 0,
            bitmaps_len: 0,
            open_oop_bits: 0,
            open_ptr_bits: 0,
            closed_oop_bits: 0,
            closed_ptr_bits: 0,
            checksum_offset: 0,
        }
    }

    /// Record the dump-time reference encoding
    pub fn set_encoding(&mut self, encoding: ReferenceEncoding) {
        match encoding {
            ReferenceEncoding::Wide => {
                self.flags &= !FLAG_NARROW;
                self.ref_size = 8;
                self.narrow_base = 0;
                self.narrow_shift = 0;
            }
            ReferenceEncoding::Narrow { base, shift } => {
                self.flags |= FLAG_NARROW;
                self.ref_size = 4;
                self.narrow_base = base;
                self.narrow_shift = shift;
            }
        }
    }

    /// Dump-time reference encoding
    pub fn encoding(&self) -> ReferenceEncoding {
        if self.flags & FLAG_NARROW != 0 {
            ReferenceEncoding::Narrow {
                base: self.narrow_base,
                shift: self.narrow_shift,
            }
        } else {
            ReferenceEncoding::Wide
        }
    }

    /// Image byte range of a sub-region
    pub fn region(&self, region: RegionKind) -> Range<usize> {
        match region {
            RegionKind::Open => {
                let start = self.open_offset as usize;
                start..start + self.open_size as usize
            }
            RegionKind::Closed => {
                let start = self.closed_offset as usize;
                start..start + self.closed_size as usize
            }
        }
    }

    /// Requested native range
    pub fn native_range(&self) -> Range<u64> {
        self.native_base..self.native_base.saturating_add(self.native_size)
    }

    /// Validate header fields
    pub fn validate(&self) -> Result<(), FormatError> {
        if self.magic != ARCHIVE_MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        if self.version != ARCHIVE_VERSION {
            return Err(FormatError::IncompatibleVersion {
                expected: ARCHIVE_VERSION,
                actual: self.version,
            });
        }

        if self.endianness != ENDIANNESS_MARKER {
            return Err(FormatError::EndiannessMismatch);
        }

        let narrow = self.flags & FLAG_NARROW != 0;
        let expected_ref_size = if narrow { 4 } else { 8 };
        if self.ref_size != expected_ref_size {
            return corrupt(format!("reference size {}", self.ref_size));
        }
        if narrow && self.narrow_shift > crate::codec::MAX_NARROW_SHIFT {
            return corrupt(format!("narrow shift {}", self.narrow_shift));
        }

        let g = self.region_alignment;
        if !g.is_power_of_two() {
            return corrupt(format!("region alignment {}", g));
        }
        if self.requested_base % g != 0 || self.requested_base == 0 {
            return corrupt(format!("requested base {:#x}", self.requested_base));
        }
        if self.open_offset != 0
            || self.open_size > self.closed_offset
            || self.closed_offset % g != 0
            || self.image_len % g != 0
            || section_end(self.closed_offset, self.closed_size, "closed region")?
                > self.image_len
        {
            return corrupt("region layout".to_string());
        }
        if self.root_offset % 8 != 0
            || section_end(self.root_offset, 16, "root array")? > self.open_size
        {
            return corrupt(format!("root offset {:#x}", self.root_offset));
        }

        let ref_size = self.ref_size as u64;
        if self.open_oop_bits != self.open_size / ref_size
            || self.open_ptr_bits != self.open_size / 8
            || self.closed_oop_bits != self.closed_size / ref_size
            || self.closed_ptr_bits != self.closed_size / 8
        {
            return corrupt("bitmap sizes".to_string());
        }

        if self.image_offset % HEADER_PAGE_SIZE as u64 != 0
            || self.types_offset < section_end(self.image_offset, self.image_len, "image")?
            || self.bitmaps_offset < section_end(self.types_offset, self.types_len, "type table")?
            || self.checksum_offset
                < section_end(self.bitmaps_offset, self.bitmaps_len, "bitmaps")?
        {
            return corrupt("section layout".to_string());
        }
        section_end(self.checksum_offset, CHECKSUM_SIZE as u64, "checksum")?;

        Ok(())
    }

    /// Encode header to writer in little-endian format
    pub fn encode(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.magic.to_le_bytes())?;
        for v in [
            self.version,
            self.flags,
            self.endianness,
            self.ref_size,
            self.narrow_shift,
            self.reserved,
        ] {
            writer.write_all(&v.to_le_bytes())?;
        }
        for v in [
            self.narrow_base,
            self.region_alignment,
            self.requested_base,
            self.open_offset,
            self.open_size,
            self.closed_offset,
            self.closed_size,
            self.image_len,
            self.root_offset,
            self.native_base,
            self.native_size,
            self.object_count,
            self.image_offset,
            self.types_offset,
            self.types_len,
            self.bitmaps_offset,
            self.bitmaps_len,
            self.open_oop_bits,
            self.open_ptr_bits,
            self.closed_oop_bits,
            self.closed_ptr_bits,
            self.checksum_offset,
        ] {
            writer.write_all(&v.to_le_bytes())?;
        }
        Ok(())
    }

    /// Decode header from reader
    pub fn decode(reader: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            magic: read_u64(reader)?,
            version: read_u32(reader)?,
            flags: read_u32(reader)?,
            endianness: read_u32(reader)?,
            ref_size: read_u32(reader)?,
            narrow_shift: read_u32(reader)?,
            reserved: read_u32(reader)?,
            narrow_base: read_u64(reader)?,
            region_alignment: read_u64(reader)?,
            requested_base: read_u64(reader)?,
            open_offset: read_u64(reader)?,
            open_size: read_u64(reader)?,
            closed_offset: read_u64(reader)?,
            closed_size: read_u64(reader)?,
            image_len: read_u64(reader)?,
            root_offset: read_u64(reader)?,
            native_base: read_u64(reader)?,
            native_size: read_u64(reader)?,
            object_count: read_u64(reader)?,
            image_offset: read_u64(reader)?,
            types_offset: read_u64(reader)?,
            types_len: read_u64(reader)?,
            bitmaps_offset: read_u64(reader)?,
            bitmaps_len: read_u64(reader)?,
            open_oop_bits: read_u64(reader)?,
            open_ptr_bits: read_u64(reader)?,
            closed_oop_bits: read_u64(reader)?,
            closed_ptr_bits: read_u64(reader)?,
            checksum_offset: read_u64(reader)?,
        })
    }
}

impl Default for ArchiveHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum for archive integrity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveChecksum {
    hash: [u8; 32], // SHA-256
}

impl ArchiveChecksum {
    /// Compute SHA-256 checksum of data
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);

        Self { hash }
    }

    /// Verify that checksum matches the given data
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Encode checksum to writer
    pub fn encode(&self, writer: &mut impl Write) -> io::Result<()> {
        writer.write_all(&self.hash)
    }

    /// Decode checksum from reader
    pub fn decode(reader: &mut impl Read) -> io::Result<Self> {
        let mut hash = [0u8; 32];
        reader.read_exact(&mut hash)?;
        Ok(Self { hash })
    }
}

/// Archive file errors
///
/// All of these disable the archive for the current run.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// Invalid magic number in archive header
    #[error("Invalid archive magic number")]
    InvalidMagic,

    /// Incompatible archive version
    #[error("Incompatible archive version (expected {expected}, got {actual})")]
    IncompatibleVersion {
        /// Expected version
        expected: u32,
        /// Actual version found
        actual: u32,
    },

    /// Endianness mismatch between archive and current system
    #[error("Endianness mismatch")]
    EndiannessMismatch,

    /// Checksum verification failed
    #[error("Checksum verification failed")]
    ChecksumMismatch,

    /// File ends before a section does
    #[error("Archive truncated in {0}")]
    Truncated(&'static str),

    /// Corrupted archive data
    #[error("Corrupted archive data: {0}")]
    Corrupt(String),

    /// I/O error during archive read/write
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn corrupt(msg: String) -> Result<(), FormatError> {
    Err(FormatError::Corrupt(msg))
}

/// End offset of a section, rejecting ends that overflow or exceed `usize`
fn section_end(offset: u64, len: u64, what: &str) -> Result<u64, FormatError> {
    offset
        .checked_add(len)
        .filter(|end| usize::try_from(*end).is_ok())
        .ok_or_else(|| FormatError::Corrupt(format!("{} extent {:#x}+{:#x}", what, offset, len)))
}

pub(crate) fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> ArchiveHeader {
        let mut header = ArchiveHeader::new();
        header.set_encoding(ReferenceEncoding::Narrow { base: 0, shift: 3 });
        header.region_alignment = 4096;
        header.requested_base = 0x7_ffff_e000;
        header.open_size = 64;
        header.closed_offset = 4096;
        header.closed_size = 32;
        header.image_len = 8192;
        header.root_offset = 40;
        header.open_oop_bits = 16;
        header.open_ptr_bits = 8;
        header.closed_oop_bits = 8;
        header.closed_ptr_bits = 4;
        header.image_offset = 4096;
        header.types_offset = 4096 + 8192;
        header.types_len = 20;
        header.bitmaps_offset = 4096 + 8192 + 24;
        header.bitmaps_len = 32;
        header.checksum_offset = 4096 + 8192 + 24 + 32;
        header
    }

    #[test]
    fn test_header_encode_decode() {
        let header = valid_header();
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        assert!(buf.len() <= HEADER_PAGE_SIZE);

        let decoded = ArchiveHeader::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.magic, ARCHIVE_MAGIC);
        assert_eq!(
            decoded.encoding(),
            ReferenceEncoding::Narrow { base: 0, shift: 3 }
        );
    }

    #[test]
    fn test_header_validation() {
        let header = valid_header();
        assert!(header.validate().is_ok());

        let mut invalid = header.clone();
        invalid.magic = 0;
        assert!(matches!(invalid.validate(), Err(FormatError::InvalidMagic)));

        let mut invalid = header.clone();
        invalid.version = 99;
        assert!(matches!(
            invalid.validate(),
            Err(FormatError::IncompatibleVersion { expected: 1, actual: 99 })
        ));

        let mut invalid = header.clone();
        invalid.closed_offset = 100;
        assert!(matches!(invalid.validate(), Err(FormatError::Corrupt(_))));

        let mut invalid = header.clone();
        invalid.ref_size = 8;
        assert!(invalid.validate().is_err());

        let mut invalid = header;
        invalid.open_oop_bits = 3;
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_region_ranges() {
        let header = valid_header();
        assert_eq!(header.region(RegionKind::Open), 0..64);
        assert_eq!(header.region(RegionKind::Closed), 4096..4128);
    }

    #[test]
    fn test_checksum_compute_verify() {
        let data = b"test data for checksum";
        let checksum = ArchiveChecksum::compute(data);
        assert!(checksum.verify(data));
        assert!(!checksum.verify(b"different data"));

        let mut buf = Vec::new();
        checksum.encode(&mut buf).unwrap();
        let decoded = ArchiveChecksum::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, checksum);
    }
}
