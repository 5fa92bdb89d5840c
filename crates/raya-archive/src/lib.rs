//! Raya Heap Archive
//!
//! This crate persists a connected subgraph of heap objects into a compact,
//! relocatable archive and rebuilds it at start-up:
//! - Dump: stage objects, assemble the open and closed regions, relocate
//!   embedded references to requested addresses and build the reference and
//!   native-pointer maps
//! - Mapped mode: map the archive image and patch references in place
//! - Loaded mode: copy every object into collector-allocated memory and
//!   rewrite references through the stream slots
//! - A process-wide gate that publishes the archived root once loading is
//!   complete

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod archive;
pub mod bitmap;
pub mod codec;
pub mod dump;
pub mod graph;
pub mod heap;
pub mod load;
pub mod object;
pub mod types;
pub mod view;

pub use archive::{ArchiveHeader, FormatError, HeapArchive};
pub use bitmap::BitMap;
pub use codec::{NarrowCodec, ReferenceCodec, ReferenceEncoding, SessionCodec, WideCodec};
pub use dump::{DumpOptions, DumpSession};
pub use graph::{ArchiveSelection, FieldValue, ObjectGraph, ObjectId, Payload, RegionKind};
pub use heap::{
    AllocationError, AllocationShape, ArenaHeap, DestinationAllocator, HeapMemory,
    MappedRegionHost, MappingPolicy,
};
pub use load::{
    bootstrap, global_gate, load_archive, ArchiveGate, ArchiveSource, LoadMode, LoadOptions,
    LoadOutcome,
};
pub use object::{Address, ObjectHeader};
pub use types::{FieldKind, TypeIndex, TypeInfo, TypeKind, TypeRegistry};
pub use view::{GraphSnapshot, ObjectView};

/// How the caller should treat an [`ArchiveError`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// A buffer or region is too small; detected before relocation
    Capacity,
    /// Internal inconsistency in the dump or the archive contents
    Consistency,
    /// The archive cannot be used for this run; start without it
    Recoverable,
    /// Loading failed after state was modified; start-up must abort
    Fatal,
}

/// Heap archive errors
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// Staging buffer capacity exceeded
    #[error("Staging buffer exhausted: need {requested} bytes, capacity is {capacity}")]
    StagingBufferExhausted {
        /// Bytes needed in total
        requested: usize,
        /// Configured capacity
        capacity: usize,
    },

    /// Object larger than the region alignment
    #[error("Object {object} is {size} bytes, larger than the {alignment} byte region alignment")]
    ObjectTooLarge {
        /// Source object
        object: ObjectId,
        /// Object size in bytes
        size: usize,
        /// Region alignment in bytes
        alignment: usize,
    },

    /// Regions do not fit below the heap end
    #[error("Archive regions do not fit: {0}")]
    RegionLayout(String),

    /// Object placement would cross a region alignment boundary
    #[error("Object at output offset {offset:#x} ({size} bytes) crosses a {alignment} byte boundary")]
    ObjectStraddlesBoundary {
        /// Output offset of the object
        offset: usize,
        /// Object size in bytes
        size: usize,
        /// Region alignment in bytes
        alignment: usize,
    },

    /// Derived reference map disagrees with the one recorded during relocation
    #[error("Reference map mismatch in {region} region at bit {bit}")]
    BitmapMismatch {
        /// Region whose map disagrees
        region: RegionKind,
        /// First differing bit
        bit: usize,
    },

    /// Type index not present in the registry
    #[error("Unknown type index {0}")]
    UnknownType(u32),

    /// Type definition rejected by the registry
    #[error("Invalid type {name}: {reason}")]
    InvalidType {
        /// Type name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// Malformed source graph or selection
    #[error("Invalid object graph: {0}")]
    InvalidGraph(String),

    /// Archived object references an object that is not archived
    #[error("Object {referrer} references {referent}, which is not archived")]
    UnarchivedReferent {
        /// Referencing object
        referrer: ObjectId,
        /// Missing referent
        referent: ObjectId,
    },

    /// Address cannot be represented by the reference encoding
    #[error("Address {address} cannot be encoded: {reason}")]
    UnencodableReference {
        /// Address to encode
        address: Address,
        /// Why encoding failed
        reason: String,
    },

    /// Invalid dump or load options
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Session operation called out of order
    #[error("Session step out of order: {0}")]
    OutOfOrder(&'static str),

    /// Malformed or corrupted archive file
    #[error(transparent)]
    Format(#[from] FormatError),

    /// Dump-time and runtime reference encodings cannot be reconciled
    #[error("Incompatible reference encoding: {0}")]
    IncompatibleEncoding(String),

    /// The requested address range cannot be mapped
    #[error("Mapped region unavailable: {0}")]
    MappingUnavailable(String),

    /// A stored reference does not decode to an archived object
    #[error("Reference at image offset {offset:#x} holds undecodable value {value:#x}")]
    DecodeFailure {
        /// Image offset of the slot
        offset: usize,
        /// Raw slot value
        value: u64,
    },

    /// Allocation failed while materializing objects
    #[error("Cannot load archived heap: {0}")]
    Allocation(#[from] AllocationError),

    /// Loading failed after objects were materialized
    #[error("Cannot load archived heap: {0}")]
    Load(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// Classify the error for the bootstrap coordinator
    pub fn class(&self) -> ErrorClass {
        match self {
            ArchiveError::StagingBufferExhausted { .. }
            | ArchiveError::ObjectTooLarge { .. }
            | ArchiveError::RegionLayout(_) => ErrorClass::Capacity,
            ArchiveError::ObjectStraddlesBoundary { .. }
            | ArchiveError::BitmapMismatch { .. }
            | ArchiveError::UnknownType(_)
            | ArchiveError::InvalidType { .. }
            | ArchiveError::InvalidGraph(_)
            | ArchiveError::UnarchivedReferent { .. }
            | ArchiveError::UnencodableReference { .. }
            | ArchiveError::InvalidOptions(_)
            | ArchiveError::OutOfOrder(_) => ErrorClass::Consistency,
            ArchiveError::Format(_)
            | ArchiveError::IncompatibleEncoding(_)
            | ArchiveError::MappingUnavailable(_)
            | ArchiveError::DecodeFailure { .. }
            | ArchiveError::Io(_) => ErrorClass::Recoverable,
            ArchiveError::Allocation(_) | ArchiveError::Load(_) => ErrorClass::Fatal,
        }
    }

    /// Check if the archive can simply be disabled for this run
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }
}

/// Heap archive result
pub type ArchiveResult<T> = Result<T, ArchiveError>;
