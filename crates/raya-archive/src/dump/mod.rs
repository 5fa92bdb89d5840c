//! Dump side of the heap archive
//!
//! A [`DumpSession`] turns a selection of source objects into a
//! [`HeapArchive`](crate::archive::HeapArchive):
//!
//! 1. Stage every selected object (and the root array) in a growable buffer
//! 2. Copy the open region, the root array and then the closed region into
//!    the output image, starting the closed region on a `G` boundary
//! 3. Choose requested addresses so the closed region ends at the top of
//!    the heap
//! 4. Rewrite every reference to the encoded requested address of its
//!    referent
//! 5. Build the reference and native-pointer maps and cross-check them
//!
//! # Example
//!
//! ```
//! use raya_archive::dump::{DumpOptions, DumpSession};
//! use raya_archive::graph::{ArchiveSelection, FieldValue, ObjectGraph};
//! use raya_archive::types::{FieldKind, TypeRegistry};
//!
//! let registry = TypeRegistry::builder()
//!     .instance("Node", vec![FieldKind::Reference])
//!     .build()
//!     .unwrap();
//! let node = registry.lookup("Node").unwrap();
//!
//! let mut graph = ObjectGraph::new();
//! let a = graph.instance(node, vec![FieldValue::Reference(None)]);
//! let selection = ArchiveSelection::new().open(a).root(a);
//!
//! let archive = DumpSession::run(&registry, &graph, &selection, DumpOptions::default()).unwrap();
//! assert_eq!(archive.header().object_count, 2);
//! ```

mod buffer;
mod maps;
mod writer;

pub use buffer::{BufferSlot, StagingBuffer};
pub use maps::{build_region_maps, RegionMaps};
pub(crate) use maps::cross_check;
pub use writer::{DumpSession, RequestedRegions};

use crate::codec::ReferenceEncoding;
use crate::object::HEADER_SIZE;
use crate::{ArchiveError, ArchiveResult};
use std::ops::Range;

/// Minimum region alignment used by region-based collectors (1 MiB)
pub const DEFAULT_REGION_ALIGNMENT: usize = 1024 * 1024;

/// Default end of the dump-time heap reservation (32 GiB)
pub const DEFAULT_HEAP_END: u64 = 0x8_0000_0000;

/// Default requested range of the native (metadata) image
pub const DEFAULT_NATIVE_RANGE: Range<u64> = 0x8_0000_0000..0x8_4000_0000;

/// Default staging buffer capacity (256 MiB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 256 * 1024 * 1024;

/// Dump configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOptions {
    /// Region alignment `G`; a power of two
    pub region_alignment: usize,

    /// Upper bound of the dump-time heap; the closed region ends below it
    pub heap_end: u64,

    /// Reference encoding used in the archive
    pub encoding: ReferenceEncoding,

    /// Requested address range of the native image; native fields holding
    /// values in this range are relocated at load time
    pub native_range: Range<u64>,

    /// Staging buffer capacity in bytes
    pub buffer_capacity: usize,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            region_alignment: DEFAULT_REGION_ALIGNMENT,
            heap_end: DEFAULT_HEAP_END,
            encoding: ReferenceEncoding::default(),
            native_range: DEFAULT_NATIVE_RANGE,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl DumpOptions {
    /// Set the region alignment
    pub fn with_region_alignment(mut self, bytes: usize) -> Self {
        self.region_alignment = bytes;
        self
    }

    /// Set the heap end
    pub fn with_heap_end(mut self, heap_end: u64) -> Self {
        self.heap_end = heap_end;
        self
    }

    /// Set the reference encoding
    pub fn with_encoding(mut self, encoding: ReferenceEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set the requested native image range
    pub fn with_native_range(mut self, range: Range<u64>) -> Self {
        self.native_range = range;
        self
    }

    /// Set the staging buffer capacity
    pub fn with_buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = bytes;
        self
    }

    /// Check the options are usable
    pub fn validate(&self) -> ArchiveResult<()> {
        let g = self.region_alignment;
        if !g.is_power_of_two() || g < HEADER_SIZE {
            return Err(ArchiveError::InvalidOptions(format!(
                "region alignment {} must be a power of two of at least {} bytes",
                g, HEADER_SIZE
            )));
        }
        if self.heap_end < g as u64 {
            return Err(ArchiveError::InvalidOptions(format!(
                "heap end {:#x} is below the region alignment",
                self.heap_end
            )));
        }
        if self.native_range.start > self.native_range.end {
            return Err(ArchiveError::InvalidOptions(
                "native range is reversed".to_string(),
            ));
        }
        // Staging identities are word indices plus one and must fit a narrow slot.
        if self.encoding.is_narrow() && self.buffer_capacity / 8 >= u32::MAX as usize {
            return Err(ArchiveError::InvalidOptions(format!(
                "buffer capacity {} too large for narrow references",
                self.buffer_capacity
            )));
        }
        self.encoding.codec()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_are_valid() {
        let options = DumpOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.region_alignment, 1 << 20);
    }

    #[test]
    fn test_invalid_alignment() {
        let options = DumpOptions::default().with_region_alignment(3000);
        assert!(matches!(
            options.validate(),
            Err(ArchiveError::InvalidOptions(_))
        ));
        let options = DumpOptions::default().with_region_alignment(8);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_invalid_native_range() {
        #[allow(clippy::reversed_empty_ranges)]
        let options = DumpOptions::default().with_native_range(10..5);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_invalid_shift() {
        let options =
            DumpOptions::default().with_encoding(ReferenceEncoding::Narrow { base: 0, shift: 7 });
        assert!(options.validate().is_err());
    }
}
