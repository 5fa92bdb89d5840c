//! In-process arena heap
//!
//! Memory is carved from chunks placed at increasing, non-adjacent
//! addresses. Starting a fresh chunk every few allocations makes the
//! allocator hand out non-contiguous memory, which is what a real collector
//! does under pressure.

use super::{AllocationError, AllocationShape, DestinationAllocator, HeapMemory, MappedRegionHost};
use crate::object::{align_up, Address};

const DEFAULT_BASE: u64 = 0x4_0000_0000;
const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;
const CHUNK_ALIGNMENT: usize = 4096;

/// How an [`ArenaHeap`] answers mapping reservations
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum MappingPolicy {
    /// Grant the requested address
    #[default]
    AtRequested,
    /// Grant this address instead
    At(Address),
    /// Refuse every reservation
    Unavailable,
}

struct Chunk {
    base: Address,
    bytes: Vec<u8>,
    top: usize,
}

impl Chunk {
    fn end(&self) -> u64 {
        self.base.as_u64() + self.bytes.len() as u64
    }
}

/// Chunked arena implementing every heap capability
pub struct ArenaHeap {
    chunks: Vec<Chunk>,
    next_base: u64,
    chunk_size: usize,
    /// Start a new chunk after this many allocations (0 = only when full)
    split_every: usize,
    allocations: usize,
    allocated_bytes: usize,
    /// Maximum heap size (0 = unlimited)
    max_heap_bytes: usize,
    mapping: MappingPolicy,
    reservations: Vec<(Address, usize)>,
    loaded_regions: Vec<(Address, Address)>,
    mapped_regions: Vec<(Address, Address)>,
}

impl ArenaHeap {
    /// Create an arena at the default base address
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            next_base: DEFAULT_BASE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            split_every: 0,
            allocations: 0,
            allocated_bytes: 0,
            max_heap_bytes: 0,
            mapping: MappingPolicy::default(),
            reservations: Vec::new(),
            loaded_regions: Vec::new(),
            mapped_regions: Vec::new(),
        }
    }

    /// Place the first chunk at `base`
    pub fn with_base(mut self, base: Address) -> Self {
        self.next_base = align_up(base.as_u64() as usize, CHUNK_ALIGNMENT) as u64;
        self
    }

    /// Set the default chunk size
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes.max(CHUNK_ALIGNMENT);
        self
    }

    /// Start a new, non-adjacent chunk after every `n` allocations
    pub fn with_split_every(mut self, n: usize) -> Self {
        self.split_every = n;
        self
    }

    /// Set maximum heap size
    pub fn with_max_heap_bytes(mut self, bytes: usize) -> Self {
        self.max_heap_bytes = bytes;
        self
    }

    /// Set how mapping reservations are answered
    pub fn with_mapping_policy(mut self, policy: MappingPolicy) -> Self {
        self.mapping = policy;
        self
    }

    /// Total bytes allocated
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Number of allocations served
    pub fn allocation_count(&self) -> usize {
        self.allocations
    }

    /// Number of chunks in use
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Extents handed over by the Loaded-mode loader
    pub fn loaded_regions(&self) -> &[(Address, Address)] {
        &self.loaded_regions
    }

    /// Regions handed over by the Mapped-mode loader
    pub fn mapped_regions(&self) -> &[(Address, Address)] {
        &self.mapped_regions
    }

    /// Reservations granted so far, as `(base, len)`
    pub fn reservations(&self) -> &[(Address, usize)] {
        &self.reservations
    }

    fn new_chunk(&mut self, min_size: usize) {
        let capacity = align_up(min_size.max(self.chunk_size), CHUNK_ALIGNMENT);
        let base = Address::new(self.next_base);
        // Leave a guard page so consecutive chunks are never adjacent.
        self.next_base += (capacity + CHUNK_ALIGNMENT) as u64;
        self.chunks.push(Chunk {
            base,
            bytes: vec![0; capacity],
            top: 0,
        });
    }

    fn chunk_index(&self, addr: Address) -> Option<usize> {
        let idx = self
            .chunks
            .partition_point(|c| c.base.as_u64() <= addr.as_u64());
        let idx = idx.checked_sub(1)?;
        (addr.as_u64() < self.chunks[idx].end()).then_some(idx)
    }

    fn overlaps_chunks(&self, base: Address, len: usize) -> bool {
        let end = base.as_u64() + len as u64;
        self.chunks
            .iter()
            .any(|c| base.as_u64() < c.end() && c.base.as_u64() < end)
    }
}

impl Default for ArenaHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapMemory for ArenaHeap {
    fn bytes(&self, addr: Address, len: usize) -> Option<&[u8]> {
        let chunk = &self.chunks[self.chunk_index(addr)?];
        let start = (addr.as_u64() - chunk.base.as_u64()) as usize;
        chunk.bytes.get(start..start.checked_add(len)?)
    }

    fn bytes_mut(&mut self, addr: Address, len: usize) -> Option<&mut [u8]> {
        let idx = self.chunk_index(addr)?;
        let chunk = &mut self.chunks[idx];
        let start = (addr.as_u64() - chunk.base.as_u64()) as usize;
        chunk.bytes.get_mut(start..start.checked_add(len)?)
    }
}

impl DestinationAllocator for ArenaHeap {
    fn allocate(&mut self, shape: &AllocationShape) -> Result<Address, AllocationError> {
        let size = shape.size;
        if self.max_heap_bytes > 0 && self.allocated_bytes + size > self.max_heap_bytes {
            return Err(AllocationError::HeapExhausted {
                requested: size,
                limit: self.max_heap_bytes,
            });
        }

        let split = self.split_every > 0
            && self.allocations > 0
            && self.allocations % self.split_every == 0;
        let fits = self
            .chunks
            .last()
            .is_some_and(|c| c.top + size <= c.bytes.len());
        if split || !fits {
            self.new_chunk(size);
        }

        let chunk = match self.chunks.last_mut() {
            Some(chunk) => chunk,
            None => return Err(AllocationError::Unsupported("no chunk available".into())),
        };
        let addr = chunk.base.add(chunk.top);
        chunk.top += size;
        self.allocations += 1;
        self.allocated_bytes += size;
        Ok(addr)
    }

    fn complete_loaded_region(&mut self, bottom: Address, top: Address) {
        self.loaded_regions.push((bottom, top));
    }
}

impl MappedRegionHost for ArenaHeap {
    fn reserve_mapped_region(&mut self, requested: Address, len: usize) -> Option<Address> {
        let base = match self.mapping {
            MappingPolicy::AtRequested => requested,
            MappingPolicy::At(addr) => addr,
            MappingPolicy::Unavailable => return None,
        };
        if self.overlaps_chunks(base, len) {
            return None;
        }
        self.reservations.push((base, len));
        Some(base)
    }

    fn release_mapped_region(&mut self, base: Address, len: usize) {
        if let Some(i) = self.reservations.iter().position(|r| *r == (base, len)) {
            self.reservations.swap_remove(i);
        }
    }

    fn complete_mapped_region(&mut self, bottom: Address, top: Address) {
        self.mapped_regions.push((bottom, top));
    }
}
