//! Heap archive files
//!
//! A [`HeapArchive`] is the product of a dump and the input of both loaders.
//! It can be written to a file, read back into memory, or opened with the
//! image mapped copy-on-write so Mapped mode patches private pages.

mod format;

pub use format::{
    ArchiveChecksum, ArchiveHeader, FormatError, ARCHIVE_MAGIC, ARCHIVE_VERSION, CHECKSUM_SIZE,
    FLAG_NARROW, HEADER_PAGE_SIZE,
};
pub(crate) use format::{read_u32, read_u64};

use crate::bitmap::BitMap;
use crate::codec::ReferenceEncoding;
use crate::dump::{build_region_maps, RegionMaps};
use crate::graph::RegionKind;
use crate::object::{align_up, Address};
use crate::types::TypeRegistry;
use crate::ArchiveResult;
use log::debug;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::{Deref, DerefMut};
use std::path::Path;

/// Bytes of an archive image
pub(crate) enum ArchiveImage {
    /// Image copied into memory
    Owned(Vec<u8>),
    /// Image mapped privately from the archive file
    Mapped(MmapMut),
}

impl Deref for ArchiveImage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ArchiveImage::Owned(bytes) => bytes,
            ArchiveImage::Mapped(map) => map,
        }
    }
}

impl DerefMut for ArchiveImage {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            ArchiveImage::Owned(bytes) => bytes,
            ArchiveImage::Mapped(map) => map,
        }
    }
}

impl fmt::Debug for ArchiveImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ArchiveImage::Owned(_) => "owned",
            ArchiveImage::Mapped(_) => "mapped",
        };
        write!(f, "ArchiveImage({}, {} bytes)", kind, self.len())
    }
}

/// Parts of an archive handed to a loader
pub(crate) struct ArchiveParts {
    pub header: ArchiveHeader,
    pub image: ArchiveImage,
    pub types: TypeRegistry,
    pub open: RegionMaps,
    pub closed: RegionMaps,
}

impl ArchiveParts {
    pub fn maps(&self, region: RegionKind) -> &RegionMaps {
        match region {
            RegionKind::Open => &self.open,
            RegionKind::Closed => &self.closed,
        }
    }
}

/// A dumped heap archive
#[derive(Debug)]
pub struct HeapArchive {
    header: ArchiveHeader,
    image: ArchiveImage,
    types: TypeRegistry,
    open: RegionMaps,
    closed: RegionMaps,
}

impl HeapArchive {
    /// Assemble an archive and lay out its file sections
    pub(crate) fn new(
        mut header: ArchiveHeader,
        image: Vec<u8>,
        types: TypeRegistry,
        open: RegionMaps,
        closed: RegionMaps,
    ) -> Self {
        header.open_oop_bits = open.oopmap.size() as u64;
        header.open_ptr_bits = open.ptrmap.size() as u64;
        header.closed_oop_bits = closed.oopmap.size() as u64;
        header.closed_ptr_bits = closed.ptrmap.size() as u64;

        let bitmap_words: usize = [&open.oopmap, &open.ptrmap, &closed.oopmap, &closed.ptrmap]
            .iter()
            .map(|m| m.words().len())
            .sum();

        header.image_offset = HEADER_PAGE_SIZE as u64;
        header.image_len = image.len() as u64;
        header.types_offset = header.image_offset + header.image_len;
        header.types_len = types.encoded_len() as u64;
        header.bitmaps_offset = align_up((header.types_offset + header.types_len) as usize, 8) as u64;
        header.bitmaps_len = (bitmap_words * 8) as u64;
        header.checksum_offset = header.bitmaps_offset + header.bitmaps_len;

        Self {
            header,
            image: ArchiveImage::Owned(image),
            types,
            open,
            closed,
        }
    }

    /// Archive header
    pub fn header(&self) -> &ArchiveHeader {
        &self.header
    }

    /// Image bytes (open region, padding, closed region)
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Embedded type registry
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Maps of a sub-region
    pub fn maps(&self, region: RegionKind) -> &RegionMaps {
        match region {
            RegionKind::Open => &self.open,
            RegionKind::Closed => &self.closed,
        }
    }

    /// Dump-time reference encoding
    pub fn encoding(&self) -> ReferenceEncoding {
        self.header.encoding()
    }

    /// Requested address of the open region bottom
    pub fn requested_base(&self) -> Address {
        Address::new(self.header.requested_base)
    }

    /// Check if the image is mapped from a file
    pub fn is_mapped(&self) -> bool {
        matches!(self.image, ArchiveImage::Mapped(_))
    }

    pub(crate) fn into_parts(self) -> ArchiveParts {
        ArchiveParts {
            header: self.header,
            image: self.image,
            types: self.types,
            open: self.open,
            closed: self.closed,
        }
    }

    /// Re-derive both regions' maps from the image and compare
    pub fn verify_maps(&self) -> ArchiveResult<()> {
        let ref_size = self.header.ref_size as usize;
        let native_range = self.header.native_range();
        for region in [RegionKind::Open, RegionKind::Closed] {
            let range = self.header.region(region);
            let derived = build_region_maps(&self.image[range], &self.types, ref_size, &native_range)?;
            let stored = self.maps(region);
            crate::dump::cross_check(&derived.oopmap, &stored.oopmap, 0, region)?;
            crate::dump::cross_check(&derived.ptrmap, &stored.ptrmap, 0, region)?;
        }
        Ok(())
    }

    /// Serialize the archive, checksum included
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        let h = &self.header;
        let mut buf = Vec::with_capacity(h.checksum_offset as usize + CHECKSUM_SIZE);

        h.encode(&mut buf)?;
        buf.resize(h.image_offset as usize, 0);
        buf.extend_from_slice(&self.image);
        self.types.encode(&mut buf)?;
        buf.resize(h.bitmaps_offset as usize, 0);
        for map in [
            &self.open.oopmap,
            &self.open.ptrmap,
            &self.closed.oopmap,
            &self.closed.ptrmap,
        ] {
            for word in map.words() {
                buf.write_all(&word.to_le_bytes())?;
            }
        }
        debug_assert_eq!(buf.len() as u64, h.checksum_offset);

        let checksum = ArchiveChecksum::compute(&buf);
        checksum.encode(&mut buf)?;
        Ok(buf)
    }

    /// Write the archive to a writer
    pub fn write_to(&self, writer: &mut impl Write) -> Result<(), FormatError> {
        writer.write_all(&self.to_bytes()?)?;
        Ok(())
    }

    /// Write the archive to a file
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), FormatError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Read an archive from bytes, copying the image
    pub fn from_bytes(bytes: &[u8], verify_checksum: bool) -> Result<Self, FormatError> {
        let (header, types, open, closed) = parse_metadata(bytes, verify_checksum)?;
        let start = header.image_offset as usize;
        let image = bytes
            .get(start..start + header.image_len as usize)
            .ok_or(FormatError::Truncated("image"))?
            .to_vec();
        Ok(Self {
            header,
            image: ArchiveImage::Owned(image),
            types,
            open,
            closed,
        })
    }

    /// Open an archive file, mapping the image copy-on-write
    pub fn open(path: impl AsRef<Path>, verify_checksum: bool) -> Result<Self, FormatError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: the file is only read through this mapping, and changes made
        // to it by other processes while loading are caught by the checksum.
        let whole = unsafe { Mmap::map(&file)? };
        let (header, types, open, closed) = parse_metadata(&whole, verify_checksum)?;
        drop(whole);

        // SAFETY: private copy-on-write mapping; writes never reach the file.
        let image = unsafe {
            MmapOptions::new()
                .offset(header.image_offset)
                .len(header.image_len as usize)
                .map_copy(&file)?
        };
        debug!(
            "Mapped {} byte archive image from {}",
            header.image_len,
            path.display()
        );
        Ok(Self {
            header,
            image: ArchiveImage::Mapped(image),
            types,
            open,
            closed,
        })
    }
}

type Metadata = (ArchiveHeader, TypeRegistry, RegionMaps, RegionMaps);

fn parse_metadata(bytes: &[u8], verify_checksum: bool) -> Result<Metadata, FormatError> {
    let page = bytes
        .get(..HEADER_PAGE_SIZE)
        .ok_or(FormatError::Truncated("header"))?;
    let header = ArchiveHeader::decode(&mut &page[..])?;
    header.validate()?;

    // validate() guarantees every section end fits in usize
    let checksum_offset = header.checksum_offset as usize;
    let stored = bytes
        .get(checksum_offset..checksum_offset + CHECKSUM_SIZE)
        .ok_or(FormatError::Truncated("checksum"))?;
    if verify_checksum {
        let checksum = ArchiveChecksum::decode(&mut &stored[..])?;
        if !checksum.verify(&bytes[..checksum_offset]) {
            return Err(FormatError::ChecksumMismatch);
        }
    }

    let types_start = header.types_offset as usize;
    let mut table = bytes
        .get(types_start..types_start + header.types_len as usize)
        .ok_or(FormatError::Truncated("type table"))?;
    let types = TypeRegistry::decode(&mut table)
        .map_err(|e| FormatError::Corrupt(format!("type table: {}", e)))?;

    let mut cursor = bytes
        .get(header.bitmaps_offset as usize..checksum_offset)
        .ok_or(FormatError::Truncated("bitmaps"))?;
    let mut read_map = |bits: u64| -> Result<BitMap, FormatError> {
        let bits = bits as usize;
        let mut words = Vec::with_capacity(bits.div_ceil(64).min(cursor.len() / 8));
        for _ in 0..bits.div_ceil(64) {
            words.push(read_u64(&mut cursor).map_err(|_| FormatError::Truncated("bitmaps"))?);
        }
        BitMap::from_words(words, bits)
            .ok_or_else(|| FormatError::Corrupt("stray bitmap bits".to_string()))
    };
    let open = RegionMaps {
        oopmap: read_map(header.open_oop_bits)?,
        ptrmap: read_map(header.open_ptr_bits)?,
    };
    let closed = RegionMaps {
        oopmap: read_map(header.closed_oop_bits)?,
        ptrmap: read_map(header.closed_ptr_bits)?,
    };

    Ok((header, types, open, closed))
}
