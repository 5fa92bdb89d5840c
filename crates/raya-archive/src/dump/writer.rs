//! Region assembler
//!
//! Copies staged objects into the output image, picks requested addresses
//! for the open and closed regions and relocates embedded references.
//!
//! # Image layout
//!
//! ```text
//! offset 0                       align_up(open_top, G)
//! ├── open objects ── root array ─┤ pad ├── closed objects ──┤ pad ┤
//!                                        ▲                          ▲
//!                              closed requested bottom     heap end (aligned)
//! ```

use super::buffer::{BufferSlot, StagingBuffer};
use super::maps::{build_region_maps, cross_check, RegionMaps};
use super::DumpOptions;
use crate::archive::{ArchiveHeader, HeapArchive};
use crate::bitmap::BitMap;
use crate::codec::{ReferenceCodec, SessionCodec};
use crate::graph::{ArchiveSelection, ObjectGraph, ObjectId, RegionKind};
use crate::object::{align_down, align_up, read_slot, write_slot, Address, ObjectHeader};
use crate::types::TypeRegistry;
use crate::{ArchiveError, ArchiveResult};
use log::{debug, info, trace};
use rustc_hash::FxHashMap;
use std::ops::Range;

/// Requested (dump-time) addresses of both regions
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RequestedRegions {
    /// Bottom of the open region; base of all relocation math
    pub open_bottom: Address,
    /// Top of the open region
    pub open_top: Address,
    /// Bottom of the closed region
    pub closed_bottom: Address,
    /// Top of the closed region
    pub closed_top: Address,
}

impl RequestedRegions {
    /// Requested address of an output offset
    pub fn address_of(&self, output_offset: usize) -> Address {
        self.open_bottom.add(output_offset)
    }
}

#[derive(Debug, Copy, Clone)]
struct Placement {
    offset: usize,
    size: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Staging,
    Linked,
    OpenCopied,
    Copied,
    Finalized,
    Relocated,
}

/// One dump: staging, assembly, relocation and map building
pub struct DumpSession<'r> {
    registry: &'r TypeRegistry,
    options: DumpOptions,
    codec: SessionCodec,
    buffer: StagingBuffer,
    output: Vec<u8>,
    /// Side table: staging slot -> output offset
    output_offsets: FxHashMap<BufferSlot, usize>,
    placements: Vec<Placement>,
    open_top: usize,
    closed_bottom: usize,
    closed_top: usize,
    root_offset: usize,
    requested: Option<RequestedRegions>,
    recorded_oops: Option<BitMap>,
    phase: Phase,
}

impl<'r> DumpSession<'r> {
    /// Start a dump session
    pub fn new(registry: &'r TypeRegistry, options: DumpOptions) -> ArchiveResult<Self> {
        options.validate()?;
        let codec = options.encoding.codec()?;
        let buffer = StagingBuffer::new(
            options.buffer_capacity,
            codec.ref_size(),
            options.region_alignment,
        );
        Ok(Self {
            registry,
            options,
            codec,
            buffer,
            output: Vec::new(),
            output_offsets: FxHashMap::default(),
            placements: Vec::new(),
            open_top: 0,
            closed_bottom: 0,
            closed_top: 0,
            root_offset: 0,
            requested: None,
            recorded_oops: None,
            phase: Phase::Staging,
        })
    }

    /// Dump `selection` from `graph` in one go
    pub fn run(
        registry: &TypeRegistry,
        graph: &ObjectGraph,
        selection: &ArchiveSelection,
        options: DumpOptions,
    ) -> ArchiveResult<HeapArchive> {
        let mut session = DumpSession::new(registry, options)?;
        for (id, region) in &selection.entries {
            session.allocate(graph, *id, *region)?;
        }
        session.allocate_roots(&selection.roots)?;
        session.link_buffered_references(graph)?;
        session.copy_to_output(RegionKind::Open)?;
        session.copy_to_output(RegionKind::Closed)?;
        session.finalize()?;
        session.relocate_embedded_pointers()?;
        session.into_archive()
    }

    /// Dump options in effect
    pub fn options(&self) -> &DumpOptions {
        &self.options
    }

    /// Staging buffer
    pub fn buffer(&self) -> &StagingBuffer {
        &self.buffer
    }

    /// Output image assembled so far
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Output range of a region
    pub fn region_range(&self, region: RegionKind) -> Range<usize> {
        match region {
            RegionKind::Open => 0..self.open_top,
            RegionKind::Closed => self.closed_bottom..self.closed_top,
        }
    }

    /// Output offset of the root array
    pub fn root_offset(&self) -> usize {
        self.root_offset
    }

    /// Requested addresses, once finalized
    pub fn requested(&self) -> Option<RequestedRegions> {
        self.requested
    }

    /// Output offset of a staged source object, once copied
    pub fn output_offset_of(&self, id: ObjectId) -> Option<usize> {
        let slot = self.buffer.slot_of(id)?;
        self.output_offsets.get(&slot).copied()
    }

    /// Stage one object for `region`
    pub fn allocate(
        &mut self,
        graph: &ObjectGraph,
        id: ObjectId,
        region: RegionKind,
    ) -> ArchiveResult<BufferSlot> {
        self.expect_phase(Phase::Staging, "objects must be staged before linking")?;
        self.buffer.allocate(graph, self.registry, id, region)
    }

    /// Stage the root array
    pub fn allocate_roots(&mut self, roots: &[ObjectId]) -> ArchiveResult<BufferSlot> {
        self.expect_phase(Phase::Staging, "roots must be staged before linking")?;
        self.buffer.allocate_roots(self.registry, roots)
    }

    /// Replace referents with staging identities
    pub fn link_buffered_references(&mut self, graph: &ObjectGraph) -> ArchiveResult<()> {
        self.expect_phase(Phase::Staging, "references are linked once")?;
        if self.buffer.root_array().is_none() {
            self.buffer.allocate_roots(self.registry, &[])?;
        }
        self.buffer.link_buffered_references(graph, self.registry)?;
        self.phase = Phase::Linked;
        Ok(())
    }

    /// Copy every staged object of `region` to the output
    ///
    /// The open region goes first and is followed by the root array; the
    /// closed region then starts at the next multiple of `G`.
    pub fn copy_to_output(&mut self, region: RegionKind) -> ArchiveResult<()> {
        match region {
            RegionKind::Open => {
                self.expect_phase(Phase::Linked, "open region is copied first")?
            }
            RegionKind::Closed => {
                self.expect_phase(Phase::OpenCopied, "closed region follows the open region")?
            }
        }

        let staged: Vec<_> = self
            .buffer
            .objects()
            .iter()
            .filter(|s| s.region == region)
            .copied()
            .collect();
        for object in staged {
            self.copy_one(object.slot, object.size)?;
        }

        match region {
            RegionKind::Open => {
                let root = self
                    .buffer
                    .root_array()
                    .ok_or(ArchiveError::OutOfOrder("root array missing"))?;
                self.root_offset = self.copy_one(root.slot, root.size)?;
                self.open_top = self.output.len();
                self.closed_bottom = align_up(self.open_top, self.options.region_alignment);
                self.output.resize(self.closed_bottom, 0);
                self.phase = Phase::OpenCopied;
            }
            RegionKind::Closed => {
                self.closed_top = self.output.len();
                self.phase = Phase::Copied;
            }
        }

        let range = self.region_range(region);
        info!("Size of {} region = {} bytes", region, range.len());
        Ok(())
    }

    fn copy_one(&mut self, slot: BufferSlot, size: usize) -> ArchiveResult<usize> {
        let g = self.options.region_alignment;
        let offset = self.output.len();
        if align_down(offset, g) != align_down(offset + size - 1, g) {
            return Err(ArchiveError::ObjectStraddlesBoundary {
                offset,
                size,
                alignment: g,
            });
        }

        let from = slot.offset();
        self.output
            .extend_from_slice(&self.buffer.bytes()[from..from + size]);
        self.output_offsets.insert(slot, offset);
        self.placements.push(Placement { offset, size });
        trace!("staged {:#x} => output @{:#x}", from, offset);
        Ok(offset)
    }

    /// Choose requested addresses for both regions
    ///
    /// The closed region ends just below the aligned heap end and the open
    /// region sits below it at the same distance as in the output image.
    pub fn finalize(&mut self) -> ArchiveResult<RequestedRegions> {
        self.expect_phase(Phase::Copied, "both regions must be copied first")?;
        let g = self.options.region_alignment as u64;
        let heap_end = self.options.heap_end & !(g - 1);
        let closed_size = (self.closed_top - self.closed_bottom) as u64;

        let closed_req = heap_end
            .checked_sub(closed_size)
            .map(|v| v & !(g - 1))
            .ok_or_else(|| {
                ArchiveError::RegionLayout(format!(
                    "closed region of {} bytes exceeds heap end {:#x}",
                    closed_size, heap_end
                ))
            })?;
        let open_req = closed_req
            .checked_sub(self.closed_bottom as u64)
            .filter(|v| *v != 0)
            .ok_or_else(|| {
                ArchiveError::RegionLayout(format!(
                    "{} bytes of regions do not fit below {:#x}",
                    self.closed_top, heap_end
                ))
            })?;

        let requested = RequestedRegions {
            open_bottom: Address::new(open_req),
            open_top: Address::new(open_req + self.open_top as u64),
            closed_bottom: Address::new(closed_req),
            closed_top: Address::new(closed_req + closed_size),
        };
        if requested.open_top > requested.closed_bottom {
            return Err(ArchiveError::RegionLayout(
                "open and closed regions overlap".to_string(),
            ));
        }

        for placement in &self.placements {
            self.codec.encode(requested.address_of(placement.offset))?;
        }

        let image_len = align_up(self.closed_top.max(self.closed_bottom), g as usize);
        self.output.resize(image_len, 0);

        info!(
            "Requested open region {}, closed region {}",
            requested.open_bottom, requested.closed_bottom
        );
        self.requested = Some(requested);
        self.phase = Phase::Finalized;
        Ok(requested)
    }

    /// Rewrite staging identities as encoded requested addresses
    pub fn relocate_embedded_pointers(&mut self) -> ArchiveResult<()> {
        self.expect_phase(Phase::Finalized, "finalize before relocating")?;
        let requested = self
            .requested
            .ok_or(ArchiveError::OutOfOrder("finalize before relocating"))?;
        let ref_size = self.codec.ref_size();
        let mut recorded = BitMap::new(self.output.len() / ref_size);
        let mut relocated = 0usize;

        for placement in &self.placements {
            let header = ObjectHeader::read(&self.output[placement.offset..]).ok_or_else(|| {
                ArchiveError::InvalidGraph(format!("no header at @{:#x}", placement.offset))
            })?;
            let info = self.registry.require(header.type_index)?;

            let mut fields = Vec::new();
            info.for_each_reference_offset(header.length, ref_size, |off| fields.push(off));
            for field in fields {
                let at = placement.offset + field;
                recorded.set(at / ref_size);

                let raw = read_slot(&self.output, at, ref_size);
                if raw == 0 {
                    continue;
                }
                let target = BufferSlot::from_identity(raw)
                    .and_then(|slot| self.output_offsets.get(&slot))
                    .ok_or_else(|| {
                        ArchiveError::InvalidGraph(format!(
                            "dangling staging reference {:#x} at @{:#x}",
                            raw, at
                        ))
                    })?;
                let encoded = self.codec.encode(requested.address_of(*target))?;
                write_slot(&mut self.output, at, ref_size, encoded);
                relocated += 1;
            }
        }

        debug!("Relocated {} embedded references", relocated);
        self.recorded_oops = Some(recorded);
        self.phase = Phase::Relocated;
        Ok(())
    }

    /// Build both regions' maps and cross-check them against relocation
    pub fn build_maps(&self) -> ArchiveResult<(RegionMaps, RegionMaps)> {
        self.expect_phase(Phase::Relocated, "relocate before building maps")?;
        let recorded = self
            .recorded_oops
            .as_ref()
            .ok_or(ArchiveError::OutOfOrder("relocate before building maps"))?;
        let ref_size = self.codec.ref_size();

        let mut maps = Vec::with_capacity(2);
        for region in [RegionKind::Open, RegionKind::Closed] {
            let range = self.region_range(region);
            let region_maps = build_region_maps(
                &self.output[range.clone()],
                self.registry,
                ref_size,
                &self.options.native_range,
            )?;
            cross_check(&region_maps.oopmap, recorded, range.start / ref_size, region)?;
            debug!(
                "{} region: {} reference bits, {} native pointer bits",
                region,
                region_maps.oopmap.count_ones(),
                region_maps.ptrmap.count_ones()
            );
            maps.push(region_maps);
        }
        let closed = maps.pop().unwrap_or_else(RegionMaps::empty);
        let open = maps.pop().unwrap_or_else(RegionMaps::empty);
        Ok((open, closed))
    }

    /// Finish the dump and produce the archive
    pub fn into_archive(self) -> ArchiveResult<HeapArchive> {
        let (open, closed) = self.build_maps()?;
        let requested = self
            .requested
            .ok_or(ArchiveError::OutOfOrder("finalize before building the archive"))?;

        let mut header = ArchiveHeader::new();
        header.set_encoding(self.options.encoding);
        header.region_alignment = self.options.region_alignment as u64;
        header.requested_base = requested.open_bottom.as_u64();
        header.open_size = self.open_top as u64;
        header.closed_offset = self.closed_bottom as u64;
        header.closed_size = (self.closed_top - self.closed_bottom) as u64;
        header.image_len = self.output.len() as u64;
        header.root_offset = self.root_offset as u64;
        header.native_base = self.options.native_range.start;
        header.native_size = self.options.native_range.end - self.options.native_range.start;
        header.object_count = self.placements.len() as u64;

        info!(
            "Dumped {} objects into a {} byte image",
            header.object_count, header.image_len
        );
        Ok(HeapArchive::new(
            header,
            self.output,
            self.registry.clone(),
            open,
            closed,
        ))
    }

    fn expect_phase(&self, phase: Phase, what: &'static str) -> ArchiveResult<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(ArchiveError::OutOfOrder(what))
        }
    }
}
