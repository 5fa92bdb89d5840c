//! Heap collaborators
//!
//! The loaders never own heap memory. They reach it through three
//! capabilities supplied by the runtime:
//!
//! - **HeapMemory**: byte access at an [`Address`]
//! - **DestinationAllocator**: allocate objects for Loaded mode and hand
//!   finished extents back to the collector
//! - **MappedRegionHost**: grant an address range for Mapped mode and take
//!   it back if the image cannot be used
//!
//! [`ArenaHeap`] implements all three in-process.
//!
//! # Example
//!
//! ```
//! use raya_archive::heap::{AllocationShape, ArenaHeap, DestinationAllocator, HeapMemory};
//! use raya_archive::types::{ObjectKind, TypeIndex};
//!
//! let mut heap = ArenaHeap::new();
//! let shape = AllocationShape {
//!     kind: ObjectKind::ScalarArray,
//!     type_index: TypeIndex::new(1),
//!     length: 8,
//!     size: 24,
//! };
//! let addr = heap.allocate(&shape).unwrap();
//! heap.write_word(addr, 42).unwrap();
//! assert_eq!(heap.read_word(addr), Some(42));
//! ```

mod arena;

pub use arena::{ArenaHeap, MappingPolicy};

use crate::object::{self, Address};
use crate::types::{ObjectKind, TypeIndex};

/// Byte access to heap memory
pub trait HeapMemory {
    /// Borrow `len` bytes at `addr`, if they lie in one contiguous extent
    fn bytes(&self, addr: Address, len: usize) -> Option<&[u8]>;

    /// Mutably borrow `len` bytes at `addr`
    fn bytes_mut(&mut self, addr: Address, len: usize) -> Option<&mut [u8]>;

    /// Read the word at `addr`
    fn read_word(&self, addr: Address) -> Option<u64> {
        self.bytes(addr, 8).map(|b| object::read_word(b, 0))
    }

    /// Write the word at `addr`
    fn write_word(&mut self, addr: Address, value: u64) -> Option<()> {
        self.bytes_mut(addr, 8)
            .map(|b| object::write_word(b, 0, value))
    }

    /// Read a reference slot of `width` bytes at `addr`
    fn read_slot(&self, addr: Address, width: usize) -> Option<u64> {
        self.bytes(addr, width)
            .map(|b| object::read_slot(b, 0, width))
    }

    /// Write a reference slot of `width` bytes at `addr`
    fn write_slot(&mut self, addr: Address, width: usize, value: u64) -> Option<()> {
        self.bytes_mut(addr, width)
            .map(|b| object::write_slot(b, 0, width, value))
    }
}

/// Shape of a destination object requested in Loaded mode
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocationShape {
    /// Instance, scalar array or reference array
    pub kind: ObjectKind,
    /// Type of the object
    pub type_index: TypeIndex,
    /// Field or element count
    pub length: u32,
    /// Size in bytes, header included
    pub size: usize,
}

/// Allocation failure reported by a [`DestinationAllocator`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// The heap cannot hold the archived objects
    #[error("Initial heap size too small: {requested} bytes requested, limit is {limit}")]
    HeapExhausted {
        /// Bytes requested by the failing allocation
        requested: usize,
        /// Heap limit in bytes
        limit: usize,
    },

    /// The allocator refused the shape
    #[error("Unsupported allocation: {0}")]
    Unsupported(String),
}

/// Collector-side allocator used by the Loaded-mode loader
pub trait DestinationAllocator: HeapMemory {
    /// Allocate zeroed, word-aligned memory for one object
    ///
    /// May trigger a collection; no other threads run while the archive
    /// loads.
    fn allocate(&mut self, shape: &AllocationShape) -> Result<Address, AllocationError>;

    /// Hand a fully relocated extent `[bottom, top)` to the collector
    fn complete_loaded_region(&mut self, bottom: Address, top: Address);
}

/// Collector-side host for a directly mapped archive image
pub trait MappedRegionHost {
    /// Reserve `len` bytes for the image, preferably at `requested`
    ///
    /// Returns the granted base, or `None` if no range is available.
    fn reserve_mapped_region(&mut self, requested: Address, len: usize) -> Option<Address>;

    /// Give back a reservation whose image could not be used
    fn release_mapped_region(&mut self, base: Address, len: usize);

    /// Hand a patched, pre-populated region `[bottom, top)` to the collector
    fn complete_mapped_region(&mut self, bottom: Address, top: Address);
}
