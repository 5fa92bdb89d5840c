//! Reference and native-pointer maps
//!
//! For one sub-region, the oop map has one bit per `ref_size` slot and marks
//! every reference field, null or not. The ptr map has one bit per word and
//! marks native fields whose value lies in the requested native range.

use crate::bitmap::BitMap;
use crate::archive::FormatError;
use crate::graph::RegionKind;
use crate::object::{read_word, ObjectHeader, WORD_SIZE};
use crate::types::{TypeInfo, TypeRegistry};
use crate::{ArchiveError, ArchiveResult};
use std::ops::Range;

/// Maps of one sub-region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionMaps {
    /// One bit per reference slot
    pub oopmap: BitMap,
    /// One bit per word
    pub ptrmap: BitMap,
}

impl RegionMaps {
    /// Maps of an empty region
    pub fn empty() -> Self {
        Self {
            oopmap: BitMap::new(0),
            ptrmap: BitMap::new(0),
        }
    }
}

/// Derive the maps of a sub-region by walking its objects
pub fn build_region_maps(
    region: &[u8],
    registry: &TypeRegistry,
    ref_size: usize,
    native_range: &Range<u64>,
) -> ArchiveResult<RegionMaps> {
    let mut oopmap = BitMap::new(region.len() / ref_size);
    let mut ptrmap = BitMap::new(region.len() / WORD_SIZE);

    for_each_object(region, registry, ref_size, |offset, header, info| {
        info.for_each_reference_offset(header.length, ref_size, |field| {
            oopmap.set((offset + field) / ref_size);
        });
        info.for_each_native_offset(ref_size, |field| {
            let value = read_word(region, offset + field);
            if native_range.contains(&value) {
                ptrmap.set((offset + field) / WORD_SIZE);
            }
        });
    })?;

    Ok(RegionMaps { oopmap, ptrmap })
}

/// Walk the objects laid out back to back in `region`
///
/// Calls `f` with each object's offset, header and type; returns the
/// number of objects.
pub(crate) fn for_each_object<F>(
    region: &[u8],
    registry: &TypeRegistry,
    ref_size: usize,
    mut f: F,
) -> ArchiveResult<usize>
where
    F: FnMut(usize, ObjectHeader, &TypeInfo),
{
    let mut offset = 0;
    let mut count = 0;
    while offset < region.len() {
        let header = ObjectHeader::read(&region[offset..])
            .ok_or_else(|| corrupt(format!("truncated header at @{:#x}", offset)))?;
        let info = registry.require(header.type_index)?;
        if !info.accepts_length(header.length) {
            return Err(corrupt(format!(
                "{} at @{:#x} has length {}",
                info.name, offset, header.length
            )));
        }
        let size = info.object_size(header.length, ref_size);
        if offset + size > region.len() {
            return Err(corrupt(format!(
                "{} at @{:#x} runs past the region end",
                info.name, offset
            )));
        }
        f(offset, header, info);
        offset += size;
        count += 1;
    }
    Ok(count)
}

/// Compare a derived oop map with the bits recorded during relocation
///
/// `first_bit` is the recorded bit corresponding to the region's first slot.
pub(crate) fn cross_check(
    derived: &BitMap,
    recorded: &BitMap,
    first_bit: usize,
    region: RegionKind,
) -> ArchiveResult<()> {
    if recorded.size() < first_bit + derived.size() {
        return Err(ArchiveError::BitmapMismatch {
            region,
            bit: recorded.size().saturating_sub(first_bit),
        });
    }
    for bit in 0..derived.size() {
        if derived.at(bit) != recorded.at(first_bit + bit) {
            return Err(ArchiveError::BitmapMismatch { region, bit });
        }
    }
    Ok(())
}

fn corrupt(msg: String) -> ArchiveError {
    ArchiveError::Format(FormatError::Corrupt(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{write_slot, write_word};
    use crate::types::{FieldKind, TypeIndex};

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .instance(
                "Mixed",
                vec![
                    FieldKind::Scalar,
                    FieldKind::Reference,
                    FieldKind::Native,
                    FieldKind::Reference,
                ],
            )
            .reference_array("Refs")
            .build()
            .unwrap()
    }

    fn region() -> Vec<u8> {
        // Mixed (narrow): scalar@16 ref@24 native@32 ref@40 -> 48 bytes
        // Refs[3] (narrow): 16 + 12 -> 32 bytes
        let mut bytes = vec![0u8; 80];
        ObjectHeader::new(0, TypeIndex::new(1), 4).write(&mut bytes);
        write_word(&mut bytes, 16, 0x1234);
        write_slot(&mut bytes, 24, 4, 7);
        write_word(&mut bytes, 32, 0x9000);
        ObjectHeader::new(0, TypeIndex::new(2), 3).write(&mut bytes[48..]);
        bytes
    }

    #[test]
    fn test_oopmap_marks_every_reference_slot() {
        let maps = build_region_maps(&region(), &registry(), 4, &(0x8000..0xa000)).unwrap();
        let bits: Vec<_> = maps.oopmap.iter_ones(0..maps.oopmap.size()).collect();
        // Null references are marked too.
        assert_eq!(bits, vec![24 / 4, 40 / 4, 64 / 4, 68 / 4, 72 / 4]);
    }

    #[test]
    fn test_ptrmap_respects_native_range() {
        let maps = build_region_maps(&region(), &registry(), 4, &(0x8000..0xa000)).unwrap();
        assert_eq!(maps.ptrmap.count_ones(), 1);
        assert!(maps.ptrmap.at(32 / 8));

        let maps = build_region_maps(&region(), &registry(), 4, &(0..0x100)).unwrap();
        assert_eq!(maps.ptrmap.count_ones(), 0);
    }

    #[test]
    fn test_scalar_words_are_never_marked() {
        let maps = build_region_maps(&region(), &registry(), 4, &(0..u64::MAX)).unwrap();
        assert!(!maps.oopmap.at(16 / 4));
        assert!(!maps.ptrmap.at(16 / 8));
    }

    #[test]
    fn test_truncated_region() {
        let bytes = region();
        assert!(build_region_maps(&bytes[..60], &registry(), 4, &(0..1)).is_err());
    }

    #[test]
    fn test_cross_check() {
        let maps = build_region_maps(&region(), &registry(), 4, &(0..1)).unwrap();
        let mut recorded = BitMap::new(100);
        for bit in maps.oopmap.iter_ones(0..maps.oopmap.size()) {
            recorded.set(bit + 10);
        }
        assert!(cross_check(&maps.oopmap, &recorded, 10, RegionKind::Closed).is_ok());

        recorded.clear(16 + 10);
        assert!(matches!(
            cross_check(&maps.oopmap, &recorded, 10, RegionKind::Closed),
            Err(ArchiveError::BitmapMismatch { region: RegionKind::Closed, bit: 16 })
        ));
    }
}
