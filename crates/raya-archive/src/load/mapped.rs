//! Mapped-mode loader
//!
//! The archive image is used in place: the host grants an address range,
//! and every reference named by the oop maps is rebased from the requested
//! address to the granted one. Native pointers named by the ptr maps are
//! shifted by the native image delta.
//!
//! When dump-time and runtime encodings scale by the same shift, rebasing a
//! raw reference is a single addition of a precomputed constant.

use super::RelocationStats;
use crate::archive::{ArchiveHeader, ArchiveImage, ArchiveParts, HeapArchive};
use crate::dump::RegionMaps;
use crate::codec::{ReferenceCodec, ReferenceEncoding, SessionCodec};
use crate::graph::RegionKind;
use crate::heap::{HeapMemory, MappedRegionHost};
use crate::object::{read_slot, read_word, write_slot, write_word, Address, WORD_SIZE};
use crate::types::TypeRegistry;
use crate::{ArchiveError, ArchiveResult};
use log::{debug, info};

/// Archive image patched in place and living at its granted base
#[derive(Debug)]
pub struct MappedHeap {
    base: Address,
    image: ArchiveImage,
}

impl MappedHeap {
    /// Granted base address
    pub fn base(&self) -> Address {
        self.base
    }

    /// Image length in bytes
    pub fn len(&self) -> usize {
        self.image.len()
    }

    /// Check if the image is empty
    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// Patched image bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.image
    }
}

impl HeapMemory for MappedHeap {
    fn bytes(&self, addr: Address, len: usize) -> Option<&[u8]> {
        let start = addr.offset_from(self.base)? as usize;
        self.image.get(start..start.checked_add(len)?)
    }

    fn bytes_mut(&mut self, addr: Address, len: usize) -> Option<&mut [u8]> {
        let start = addr.offset_from(self.base)? as usize;
        self.image.get_mut(start..start.checked_add(len)?)
    }
}

/// Result of a Mapped-mode load
#[derive(Debug)]
pub struct MappedArchive {
    /// Patched image
    pub heap: MappedHeap,
    /// Materialized root array
    pub root: Address,
    /// Type registry of the archive
    pub types: TypeRegistry,
    /// Runtime reference encoding
    pub encoding: ReferenceEncoding,
    /// Loaded extents `[bottom, top)` of the non-empty sub-regions
    pub regions: Vec<(Address, Address)>,
    /// Whether references were patched through the quick path
    pub quick_path: bool,
    /// Patch counts
    pub stats: RelocationStats,
}

/// Constant to add to a raw reference when the quick path applies
///
/// Narrow to narrow with equal shifts: `raw' = raw + (delta + base_d - base_r) >> shift`,
/// valid when the numerator is a multiple of the scale. Wide to wide: `raw' = raw + delta`.
pub fn quick_path_constant(
    dump: ReferenceEncoding,
    runtime: ReferenceEncoding,
    delta: i64,
) -> Option<i64> {
    match (dump, runtime) {
        (ReferenceEncoding::Wide, ReferenceEncoding::Wide) => Some(delta),
        (
            ReferenceEncoding::Narrow { base: bd, shift: sd },
            ReferenceEncoding::Narrow { base: br, shift: sr },
        ) if sd == sr => {
            let numerator = (delta as i128) + (bd as i128) - (br as i128);
            if numerator % (1i128 << sd) != 0 {
                return None;
            }
            i64::try_from(numerator >> sd).ok()
        }
        _ => None,
    }
}

/// Map `archive` at the range granted by `host` and patch it in place
pub fn load_mapped<H>(
    archive: HeapArchive,
    host: &mut H,
    runtime: ReferenceEncoding,
    native_delta: i64,
) -> ArchiveResult<MappedArchive>
where
    H: MappedRegionHost + ?Sized,
{
    let dump = archive.encoding();
    if dump.ref_size() != runtime.ref_size() {
        return Err(ArchiveError::IncompatibleEncoding(format!(
            "archive uses {} references, runtime uses {}",
            dump, runtime
        )));
    }
    let dump_codec = dump.codec()?;
    let runtime_codec = runtime.codec()?;

    let ArchiveParts {
        header,
        mut image,
        types,
        open,
        closed,
    } = archive.into_parts();
    let requested = Address::new(header.requested_base);
    let len = image.len();

    let actual = host
        .reserve_mapped_region(requested, len)
        .ok_or_else(|| ArchiveError::MappingUnavailable(format!("{} bytes at {}", len, requested)))?;

    let patcher = Patcher {
        dump: dump_codec,
        runtime: runtime_codec,
        requested,
        actual,
        len,
        ref_size: runtime.ref_size(),
        quick: quick_path_constant(dump, runtime, delta_between(requested, actual)),
    };
    let maps = [(RegionKind::Open, &open), (RegionKind::Closed, &closed)];
    let stats = match patcher.patch_image(&header, &mut image, &maps, native_delta) {
        Ok(stats) => stats,
        Err(err) => {
            host.release_mapped_region(actual, len);
            return Err(err);
        }
    };

    let mut regions = Vec::with_capacity(2);
    for region in [RegionKind::Open, RegionKind::Closed] {
        let range = header.region(region);
        if !range.is_empty() {
            let bottom = actual.add(range.start);
            let top = actual.add(range.end);
            host.complete_mapped_region(bottom, top);
            regions.push((bottom, top));
        }
    }

    info!(
        "Mapped heap archive at {} (delta {:#x}, quick path {}, {} references patched)",
        actual,
        delta_between(requested, actual),
        patcher.quick.is_some(),
        stats.references
    );
    Ok(MappedArchive {
        heap: MappedHeap { base: actual, image },
        root: actual.add(header.root_offset as usize),
        types,
        encoding: runtime,
        regions,
        quick_path: patcher.quick.is_some(),
        stats,
    })
}

fn delta_between(requested: Address, actual: Address) -> i64 {
    actual.as_u64().wrapping_sub(requested.as_u64()) as i64
}

struct Patcher {
    dump: SessionCodec,
    runtime: SessionCodec,
    requested: Address,
    actual: Address,
    len: usize,
    ref_size: usize,
    quick: Option<i64>,
}

impl Patcher {
    /// Rebase every reference and native pointer of the image in place
    fn patch_image(
        &self,
        header: &ArchiveHeader,
        image: &mut [u8],
        maps: &[(RegionKind, &RegionMaps)],
        native_delta: i64,
    ) -> ArchiveResult<RelocationStats> {
        let g = header.region_alignment as usize;
        if !self.actual.is_aligned(g) {
            return Err(ArchiveError::MappingUnavailable(format!(
                "granted base {} is not {} byte aligned",
                self.actual, g
            )));
        }

        // Every relocated reference lands in [actual, actual + len); checking the
        // ends covers everything in between.
        for edge in [self.actual, self.actual.add(self.len.saturating_sub(WORD_SIZE))] {
            self.runtime.encode(edge).map_err(|e| {
                ArchiveError::IncompatibleEncoding(format!(
                    "runtime cannot reference the image: {}",
                    e
                ))
            })?;
        }

        let mut stats = RelocationStats::default();
        for &(region, maps) in maps {
            let range = header.region(region);
            for bit in maps.oopmap.iter_ones(0..maps.oopmap.size()) {
                let at = range.start + bit * self.ref_size;
                let raw = read_slot(image, at, self.ref_size);
                if raw == 0 {
                    stats.null_references += 1;
                    continue;
                }
                let patched = self.patch(at, raw)?;
                write_slot(image, at, self.ref_size, patched);
                stats.references += 1;
            }

            if native_delta != 0 {
                for bit in maps.ptrmap.iter_ones(0..maps.ptrmap.size()) {
                    let at = range.start + bit * WORD_SIZE;
                    let value = read_word(image, at);
                    write_word(image, at, value.wrapping_add(native_delta as u64));
                    stats.native_pointers += 1;
                }
            }
            debug!(
                "Patched {} region at {}",
                region,
                self.actual.add(range.start)
            );
        }
        Ok(stats)
    }

    fn patch(&self, at: usize, raw: u64) -> ArchiveResult<u64> {
        match self.quick {
            Some(constant) => {
                let patched = self.truncate((raw as i64).wrapping_add(constant) as u64);
                debug_assert_eq!(
                    Some(patched),
                    self.general(at, raw).ok(),
                    "quick path disagrees at image offset {:#x}",
                    at
                );
                Ok(patched)
            }
            None => self.general(at, raw),
        }
    }

    fn general(&self, at: usize, raw: u64) -> ArchiveResult<u64> {
        let decode_failure = || ArchiveError::DecodeFailure {
            offset: at,
            value: raw,
        };
        let offset = self
            .dump
            .decode(raw)
            .offset_from(self.requested)
            .filter(|off| *off < self.len as u64)
            .ok_or_else(decode_failure)?;
        self.runtime
            .encode(self.actual.add(offset as usize))
            .map_err(|_| decode_failure())
    }

    fn truncate(&self, value: u64) -> u64 {
        if self.ref_size == 4 {
            value & u32::MAX as u64
        } else {
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_path_constant_narrow() {
        let dump = ReferenceEncoding::Narrow { base: 0, shift: 3 };
        let runtime = ReferenceEncoding::Narrow { base: 0, shift: 3 };
        assert_eq!(quick_path_constant(dump, runtime, 0), Some(0));
        assert_eq!(quick_path_constant(dump, runtime, 0x1000), Some(0x200));
        assert_eq!(quick_path_constant(dump, runtime, -0x1000), Some(-0x200));

        let rebased = ReferenceEncoding::Narrow { base: 0x800, shift: 3 };
        assert_eq!(quick_path_constant(dump, rebased, 0x1000), Some(0x100));
    }

    #[test]
    fn test_quick_path_needs_matching_shift() {
        let dump = ReferenceEncoding::Narrow { base: 0, shift: 3 };
        let runtime = ReferenceEncoding::Narrow { base: 0, shift: 2 };
        assert_eq!(quick_path_constant(dump, runtime, 0x1000), None);
        assert_eq!(quick_path_constant(dump, ReferenceEncoding::Wide, 0), None);
    }

    #[test]
    fn test_quick_path_needs_scaled_numerator() {
        let dump = ReferenceEncoding::Narrow { base: 0, shift: 3 };
        let runtime = ReferenceEncoding::Narrow { base: 4, shift: 3 };
        assert_eq!(quick_path_constant(dump, runtime, 0x1000), None);
    }

    #[test]
    fn test_quick_path_wide() {
        assert_eq!(
            quick_path_constant(ReferenceEncoding::Wide, ReferenceEncoding::Wide, -64),
            Some(-64)
        );
    }
}
