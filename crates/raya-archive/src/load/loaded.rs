//! Loaded-mode loader
//!
//! The archive image is treated as an input stream. Pass 1 allocates a
//! destination for every object, copies it, rebases its native pointers and
//! then overwrites the object's stream slot (its mark word in the stream)
//! with the destination address. Pass 2 walks the copies block by block and
//! replaces each dump-time reference with the address found in the stream
//! slot of its referent, which resolves forward references without a
//! separate forwarding table.

use super::RelocationStats;
use crate::archive::{ArchiveParts, HeapArchive};
use crate::bitmap::BitMap;
use crate::codec::{ReferenceCodec, ReferenceEncoding, SessionCodec};
use crate::graph::RegionKind;
use crate::heap::{AllocationShape, DestinationAllocator};
use crate::object::{read_word, write_word, Address, ObjectHeader, WORD_SIZE};
use crate::types::TypeRegistry;
use crate::{ArchiveError, ArchiveResult};
use log::{debug, info, trace};

/// Extent contiguous both in destination memory and in the stream
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Block {
    /// First destination byte
    pub dest_bottom: Address,
    /// One past the last destination byte
    pub dest_top: Address,
    /// Sub-region the block was read from
    pub region: RegionKind,
    /// Image offset of the block's first object
    pub stream_offset: usize,
}

impl Block {
    /// Block length in bytes
    pub fn len(&self) -> usize {
        (self.dest_top.as_u64() - self.dest_bottom.as_u64()) as usize
    }

    /// Check if the block is empty
    pub fn is_empty(&self) -> bool {
        self.dest_top == self.dest_bottom
    }

    fn stream_top(&self) -> usize {
        self.stream_offset + self.len()
    }
}

/// Result of a Loaded-mode load
#[derive(Debug)]
pub struct LoadedArchive {
    /// Materialized root array
    pub root: Address,
    /// Destination blocks, in stream order
    pub blocks: Vec<Block>,
    /// Number of materialized objects
    pub objects: usize,
    /// Type registry of the archive
    pub types: TypeRegistry,
    /// Runtime reference encoding
    pub encoding: ReferenceEncoding,
    /// Relocation counts
    pub stats: RelocationStats,
}

impl LoadedArchive {
    /// Loaded extents `[bottom, top)`
    pub fn regions(&self) -> Vec<(Address, Address)> {
        self.blocks
            .iter()
            .map(|b| (b.dest_bottom, b.dest_top))
            .collect()
    }
}

/// One Loaded-mode load
pub struct LoadSession<'h, A: DestinationAllocator + ?Sized> {
    parts: ArchiveParts,
    heap: &'h mut A,
    dump: SessionCodec,
    runtime: SessionCodec,
    runtime_encoding: ReferenceEncoding,
    native_delta: i64,
    blocks: Vec<Block>,
    /// One bit per image word; set where a materialized object starts
    object_starts: BitMap,
    objects: usize,
    stats: RelocationStats,
}

impl<'h, A: DestinationAllocator + ?Sized> LoadSession<'h, A> {
    /// Prepare to load `archive` into `heap`
    ///
    /// The runtime encoding must use the dump-time reference width.
    pub fn new(
        archive: HeapArchive,
        heap: &'h mut A,
        runtime: ReferenceEncoding,
        native_delta: i64,
    ) -> ArchiveResult<Self> {
        let dump_encoding = archive.encoding();
        if dump_encoding.ref_size() != runtime.ref_size() {
            return Err(ArchiveError::IncompatibleEncoding(format!(
                "archive uses {} references, runtime uses {}",
                dump_encoding, runtime
            )));
        }
        let dump = dump_encoding.codec()?;
        let runtime_codec = runtime.codec()?;
        let parts = archive.into_parts();
        let object_starts = BitMap::new(parts.image.len() / WORD_SIZE);
        Ok(Self {
            parts,
            heap,
            dump,
            runtime: runtime_codec,
            runtime_encoding: runtime,
            native_delta,
            blocks: Vec::new(),
            object_starts,
            objects: 0,
            stats: RelocationStats::default(),
        })
    }

    /// Run both passes and hand the blocks to the collector
    pub fn load(mut self) -> ArchiveResult<LoadedArchive> {
        self.materialize()?;
        self.relocate()?;
        for block in &self.blocks {
            self.heap.complete_loaded_region(block.dest_bottom, block.dest_top);
        }
        let root = resolve(
            &self.parts.image,
            &self.object_starts,
            self.parts.header.root_offset as usize,
        )?;

        info!(
            "Loaded {} archived objects in {} blocks, root {}",
            self.objects,
            self.blocks.len(),
            root
        );
        Ok(LoadedArchive {
            root,
            blocks: self.blocks,
            objects: self.objects,
            types: self.parts.types,
            encoding: self.runtime_encoding,
            stats: self.stats,
        })
    }

    /// Pass 1: copy every object to a fresh destination
    fn materialize(&mut self) -> ArchiveResult<()> {
        let ref_size = self.dump.ref_size();
        for region in [RegionKind::Open, RegionKind::Closed] {
            let range = self.parts.header.region(region);
            let mut offset = range.start;

            while offset < range.end {
                let header = ObjectHeader::read(&self.parts.image[offset..range.end])
                    .ok_or_else(|| corrupt_stream(offset, "truncated header"))?;
                let info = self
                    .parts
                    .types
                    .require(header.type_index)
                    .map_err(|_| corrupt_stream(offset, "unknown type"))?;
                if !info.accepts_length(header.length) {
                    return Err(corrupt_stream(offset, "bad length"));
                }
                let size = info.object_size(header.length, ref_size);
                if offset + size > range.end {
                    return Err(corrupt_stream(offset, "object runs past the region end"));
                }

                let shape = AllocationShape {
                    kind: info.object_kind(),
                    type_index: header.type_index,
                    length: header.length,
                    size,
                };
                let dest = self.heap.allocate(&shape)?;
                let dest_bytes = self.heap.bytes_mut(dest, size).ok_or_else(|| {
                    ArchiveError::Load(format!("allocator returned unusable memory at {}", dest))
                })?;
                dest_bytes.copy_from_slice(&self.parts.image[offset..offset + size]);
                trace!("{} @{:#x} => {}", info.name, offset, dest);

                if self.native_delta != 0 {
                    self.rebase_natives(region, offset, size, dest)?;
                }

                match self.blocks.last_mut() {
                    Some(block)
                        if block.region == region
                            && block.dest_top == dest
                            && block.stream_top() == offset =>
                    {
                        block.dest_top = dest.add(size);
                    }
                    _ => self.blocks.push(Block {
                        dest_bottom: dest,
                        dest_top: dest.add(size),
                        region,
                        stream_offset: offset,
                    }),
                }

                self.object_starts.set(offset / WORD_SIZE);
                write_word(&mut self.parts.image, offset, dest.as_u64());
                self.objects += 1;
                offset += size;
            }
        }
        debug!(
            "Materialized {} objects into {} blocks",
            self.objects,
            self.blocks.len()
        );
        Ok(())
    }

    /// Add the native delta to every native pointer of one object
    fn rebase_natives(
        &mut self,
        region: RegionKind,
        offset: usize,
        size: usize,
        dest: Address,
    ) -> ArchiveResult<()> {
        let region_start = self.parts.header.region(region).start;
        let first_word = (offset - region_start) / WORD_SIZE;
        let end_word = first_word + size / WORD_SIZE;
        let ptrmap = &self.parts.maps(region).ptrmap;

        let mut cursor = first_word;
        while let Some(bit) = ptrmap.find_first_set_bit_in(cursor, end_word) {
            let at = dest.add((bit - first_word) * WORD_SIZE);
            let value = self
                .heap
                .read_word(at)
                .ok_or_else(|| ArchiveError::Load(format!("unreadable native field at {}", at)))?;
            self.heap
                .write_word(at, value.wrapping_add(self.native_delta as u64))
                .ok_or_else(|| ArchiveError::Load(format!("unwritable native field at {}", at)))?;
            self.stats.native_pointers += 1;
            cursor = bit + 1;
        }
        Ok(())
    }

    /// Pass 2: rewrite references in every block
    fn relocate(&mut self) -> ArchiveResult<()> {
        let ref_size = self.runtime.ref_size();
        let requested = Address::new(self.parts.header.requested_base);

        for block in &self.blocks {
            let region_start = self.parts.header.region(block.region).start;
            let oopmap = &self.parts.maps(block.region).oopmap;
            let first = (block.stream_offset - region_start) / ref_size;
            let end = (block.stream_top() - region_start) / ref_size;

            for bit in oopmap.iter_ones(first..end) {
                let stream_field = region_start + bit * ref_size;
                let field = block.dest_bottom.add(stream_field - block.stream_offset);
                let raw = self.heap.read_slot(field, ref_size).ok_or_else(|| {
                    ArchiveError::Load(format!("unreadable reference at {}", field))
                })?;
                if raw == 0 {
                    self.stats.null_references += 1;
                    continue;
                }

                let pointee = self
                    .dump
                    .decode(raw)
                    .offset_from(requested)
                    .ok_or_else(|| unresolvable(field, raw))?;
                let target = resolve(&self.parts.image, &self.object_starts, pointee as usize)
                    .map_err(|_| unresolvable(field, raw))?;
                let encoded = self.runtime.encode(target).map_err(|e| {
                    ArchiveError::Load(format!("cannot encode {} at {}: {}", target, field, e))
                })?;
                self.heap.write_slot(field, ref_size, encoded).ok_or_else(|| {
                    ArchiveError::Load(format!("unwritable reference at {}", field))
                })?;
                self.stats.references += 1;
            }
            trace!(
                "Relocated block {}..{} (stream @{:#x})",
                block.dest_bottom,
                block.dest_top,
                block.stream_offset
            );
        }
        Ok(())
    }
}

/// Load `archive` into `heap` by copying every object
pub fn load_loaded<A>(
    archive: HeapArchive,
    heap: &mut A,
    runtime: ReferenceEncoding,
    native_delta: i64,
) -> ArchiveResult<LoadedArchive>
where
    A: DestinationAllocator + ?Sized,
{
    LoadSession::new(archive, heap, runtime, native_delta)?.load()
}

/// Read the materialized address from the stream slot at `offset`
fn resolve(image: &[u8], object_starts: &BitMap, offset: usize) -> ArchiveResult<Address> {
    if offset % WORD_SIZE != 0
        || offset / WORD_SIZE >= object_starts.size()
        || !object_starts.at(offset / WORD_SIZE)
    {
        return Err(ArchiveError::Load(format!(
            "no archived object starts at image offset {:#x}",
            offset
        )));
    }
    Ok(Address::new(read_word(image, offset)))
}

fn unresolvable(field: Address, raw: u64) -> ArchiveError {
    ArchiveError::Load(format!(
        "reference {:#x} at {} does not name an archived object",
        raw, field
    ))
}

fn corrupt_stream(offset: usize, what: &str) -> ArchiveError {
    ArchiveError::Load(format!("corrupt object stream at @{:#x}: {}", offset, what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_extent() {
        let block = Block {
            dest_bottom: Address::new(0x1000),
            dest_top: Address::new(0x1040),
            region: RegionKind::Open,
            stream_offset: 0x80,
        };
        assert_eq!(block.len(), 0x40);
        assert_eq!(block.stream_top(), 0xc0);
        assert!(!block.is_empty());
    }

    #[test]
    fn test_resolve_requires_object_start() {
        let mut image = vec![0u8; 64];
        write_word(&mut image, 16, 0xabc0);
        let mut starts = BitMap::new(8);
        starts.set(2);

        assert_eq!(resolve(&image, &starts, 16).unwrap(), Address::new(0xabc0));
        assert!(resolve(&image, &starts, 8).is_err());
        assert!(resolve(&image, &starts, 20).is_err());
        assert!(resolve(&image, &starts, 4096).is_err());
    }
}
