//! Staging buffer for objects selected for archiving
//!
//! Each object is copied into the buffer in its archived layout. Reference
//! fields are first left empty and then filled with staging identities
//! (`word index + 1`, so zero stays null) once every object has a slot; the
//! region assembler later maps identities to output offsets.

use crate::graph::{FieldValue, ObjectGraph, ObjectId, Payload, RegionKind};
use crate::object::{write_slot, write_word, ObjectHeader, HEADER_SIZE, WORD_SIZE};
use crate::types::{TypeKind, TypeRegistry, ROOT_ARRAY_TYPE};
use crate::{ArchiveError, ArchiveResult};
use log::trace;
use rustc_hash::FxHashMap;

/// Position of a staged object (byte offset into the staging buffer)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferSlot(usize);

impl BufferSlot {
    /// Byte offset in the staging buffer
    pub fn offset(self) -> usize {
        self.0
    }

    /// Value stored in a reference field that points at this slot
    pub(crate) fn identity(self) -> u64 {
        (self.0 / WORD_SIZE) as u64 + 1
    }

    /// Slot named by a staging identity
    pub(crate) fn from_identity(raw: u64) -> Option<Self> {
        let word = raw.checked_sub(1)?;
        Some(Self(word as usize * WORD_SIZE))
    }
}

/// One staged object
#[derive(Debug, Clone, Copy)]
pub(crate) struct StagedObject {
    /// Source object (`None` for the root array)
    pub source: Option<ObjectId>,
    pub region: RegionKind,
    pub slot: BufferSlot,
    pub size: usize,
}

/// Growable, bounded staging buffer
pub struct StagingBuffer {
    bytes: Vec<u8>,
    capacity: usize,
    ref_size: usize,
    alignment: usize,
    objects: Vec<StagedObject>,
    slots: FxHashMap<ObjectId, BufferSlot>,
    roots: Option<(StagedObject, Vec<ObjectId>)>,
}

impl StagingBuffer {
    /// Create an empty buffer
    pub fn new(capacity: usize, ref_size: usize, alignment: usize) -> Self {
        Self {
            bytes: Vec::new(),
            capacity,
            ref_size,
            alignment,
            objects: Vec::new(),
            slots: FxHashMap::default(),
            roots: None,
        }
    }

    /// Bytes used so far
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if nothing has been staged
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of staged objects, root array excluded
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Raw buffer contents
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Slot of a staged source object
    pub fn slot_of(&self, id: ObjectId) -> Option<BufferSlot> {
        self.slots.get(&id).copied()
    }

    pub(crate) fn objects(&self) -> &[StagedObject] {
        &self.objects
    }

    pub(crate) fn root_array(&self) -> Option<StagedObject> {
        self.roots.as_ref().map(|(staged, _)| *staged)
    }

    /// Stage one source object for `region`
    pub fn allocate(
        &mut self,
        graph: &ObjectGraph,
        registry: &TypeRegistry,
        id: ObjectId,
        region: RegionKind,
    ) -> ArchiveResult<BufferSlot> {
        if self.slots.contains_key(&id) {
            return Err(ArchiveError::InvalidGraph(format!(
                "object {} selected twice",
                id
            )));
        }
        graph.check_object(id, registry)?;
        let object = graph
            .get(id)
            .ok_or_else(|| ArchiveError::InvalidGraph(format!("no object {}", id)))?;
        let info = registry.require(object.type_index)?;
        let length = payload_length(id, &object.payload)?;
        let size = info.object_size(length, self.ref_size);
        if size > self.alignment {
            return Err(ArchiveError::ObjectTooLarge {
                object: id,
                size,
                alignment: self.alignment,
            });
        }

        let slot = self.reserve(size)?;
        let base = slot.offset();
        let header = ObjectHeader::new(object.mark, object.type_index, length);
        header.write(&mut self.bytes[base..]);

        match (&info.kind, &object.payload) {
            (TypeKind::Instance { .. }, Payload::Fields(values)) => {
                if let Some(layout) = info.instance_layout(self.ref_size) {
                    for (value, &offset) in values.iter().zip(layout.offsets()) {
                        match value {
                            FieldValue::Scalar(v) | FieldValue::Native(v) => {
                                write_word(&mut self.bytes, base + offset, *v)
                            }
                            FieldValue::Reference(_) => {}
                        }
                    }
                }
            }
            (TypeKind::ScalarArray { element_size }, Payload::Scalars(values)) => {
                let width = *element_size as usize;
                for (i, v) in values.iter().enumerate() {
                    let at = base + HEADER_SIZE + i * width;
                    self.bytes[at..at + width].copy_from_slice(&v.to_le_bytes()[..width]);
                }
            }
            _ => {}
        }

        trace!(
            "staged {} ({}, {} bytes) at {:#x}",
            id,
            info.name,
            size,
            base
        );
        self.objects.push(StagedObject {
            source: Some(id),
            region,
            slot,
            size,
        });
        self.slots.insert(id, slot);
        Ok(slot)
    }

    /// Stage the root array listing `roots`
    pub fn allocate_roots(
        &mut self,
        registry: &TypeRegistry,
        roots: &[ObjectId],
    ) -> ArchiveResult<BufferSlot> {
        if self.roots.is_some() {
            return Err(ArchiveError::OutOfOrder("root array staged twice"));
        }
        let info = registry.require(ROOT_ARRAY_TYPE)?;
        let length = u32::try_from(roots.len())
            .map_err(|_| ArchiveError::InvalidGraph("too many roots".to_string()))?;
        let size = info.object_size(length, self.ref_size);
        if size > self.alignment {
            return Err(ArchiveError::RegionLayout(format!(
                "root array of {} bytes exceeds the {} byte region alignment",
                size, self.alignment
            )));
        }

        let slot = self.reserve(size)?;
        ObjectHeader::new(0, ROOT_ARRAY_TYPE, length).write(&mut self.bytes[slot.offset()..]);
        let staged = StagedObject {
            source: None,
            region: RegionKind::Open,
            slot,
            size,
        };
        self.roots = Some((staged, roots.to_vec()));
        Ok(slot)
    }

    /// Fill every reference field with the staging identity of its referent
    pub fn link_buffered_references(
        &mut self,
        graph: &ObjectGraph,
        registry: &TypeRegistry,
    ) -> ArchiveResult<()> {
        let ref_size = self.ref_size;
        let mut links = Vec::new();

        for staged in &self.objects {
            let Some(id) = staged.source else { continue };
            let object = graph
                .get(id)
                .ok_or_else(|| ArchiveError::InvalidGraph(format!("no object {}", id)))?;
            let info = registry.require(object.type_index)?;
            let base = staged.slot.offset();

            match &object.payload {
                Payload::Fields(values) => {
                    if let Some(layout) = info.instance_layout(ref_size) {
                        for (value, &offset) in values.iter().zip(layout.offsets()) {
                            if let FieldValue::Reference(Some(target)) = value {
                                links.push((base + offset, self.resolve(id, *target)?));
                            }
                        }
                    }
                }
                Payload::References(elems) => {
                    for (i, elem) in elems.iter().enumerate() {
                        if let Some(target) = elem {
                            let at = base + HEADER_SIZE + i * ref_size;
                            links.push((at, self.resolve(id, *target)?));
                        }
                    }
                }
                Payload::Scalars(_) => {}
            }
        }

        if let Some((staged, roots)) = &self.roots {
            let base = staged.slot.offset();
            for (i, root) in roots.iter().enumerate() {
                let slot = self.slots.get(root).ok_or_else(|| {
                    ArchiveError::InvalidGraph(format!("root {} is not archived", root))
                })?;
                links.push((base + HEADER_SIZE + i * ref_size, slot.identity()));
            }
        }

        for (at, identity) in links {
            write_slot(&mut self.bytes, at, ref_size, identity);
        }
        Ok(())
    }

    fn resolve(&self, referrer: ObjectId, referent: ObjectId) -> ArchiveResult<u64> {
        self.slots
            .get(&referent)
            .map(|slot| slot.identity())
            .ok_or(ArchiveError::UnarchivedReferent { referrer, referent })
    }

    fn reserve(&mut self, size: usize) -> ArchiveResult<BufferSlot> {
        let requested = self.bytes.len() + size;
        if requested > self.capacity {
            return Err(ArchiveError::StagingBufferExhausted {
                requested,
                capacity: self.capacity,
            });
        }
        let slot = BufferSlot(self.bytes.len());
        self.bytes.resize(requested, 0);
        Ok(slot)
    }
}

fn payload_length(id: ObjectId, payload: &Payload) -> ArchiveResult<u32> {
    u32::try_from(payload.len())
        .map_err(|_| ArchiveError::InvalidGraph(format!("object {} is too long", id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{read_slot, read_word};
    use crate::types::{FieldKind, TypeIndex};

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .instance("Node", vec![FieldKind::Reference, FieldKind::Scalar])
            .scalar_array("Shorts", 2)
            .build()
            .unwrap()
    }

    const NODE: TypeIndex = TypeIndex::new(1);
    const SHORTS: TypeIndex = TypeIndex::new(2);

    #[test]
    fn test_allocate_writes_header_and_scalars() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let a = graph.instance(NODE, vec![FieldValue::Reference(None), FieldValue::Scalar(99)]);

        let mut buffer = StagingBuffer::new(1024, 4, 4096);
        let slot = buffer.allocate(&graph, &registry, a, RegionKind::Open).unwrap();
        assert_eq!(slot.offset(), 0);
        assert_eq!(buffer.len(), 32);

        let header = ObjectHeader::read(buffer.bytes()).unwrap();
        assert_eq!(header.type_index, NODE);
        assert_eq!(header.length, 2);
        assert_eq!(read_word(buffer.bytes(), 24), 99);
    }

    #[test]
    fn test_scalar_elements_are_packed() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let s = graph.scalar_array(SHORTS, vec![0xff02, 3]);

        let mut buffer = StagingBuffer::new(1024, 4, 4096);
        buffer.allocate(&graph, &registry, s, RegionKind::Closed).unwrap();
        assert_eq!(&buffer.bytes()[16..20], &[2, 0xff, 3, 0]);
    }

    #[test]
    fn test_oversized_scalar_element_rejected() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let s = graph.scalar_array(SHORTS, vec![0x1_0002, 3]);

        let mut buffer = StagingBuffer::new(1024, 4, 4096);
        assert!(matches!(
            buffer.allocate(&graph, &registry, s, RegionKind::Closed),
            Err(ArchiveError::InvalidGraph(_))
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_link_writes_identities() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let a = graph.instance(NODE, vec![FieldValue::Reference(None), FieldValue::Scalar(0)]);
        let b = graph.instance(NODE, vec![FieldValue::Reference(Some(a)), FieldValue::Scalar(0)]);

        let mut buffer = StagingBuffer::new(1024, 4, 4096);
        let slot_a = buffer.allocate(&graph, &registry, a, RegionKind::Open).unwrap();
        let slot_b = buffer.allocate(&graph, &registry, b, RegionKind::Open).unwrap();
        buffer.allocate_roots(&registry, &[b]).unwrap();
        buffer.link_buffered_references(&graph, &registry).unwrap();

        let field_b = slot_b.offset() + 16;
        assert_eq!(read_slot(buffer.bytes(), field_b, 4), slot_a.identity());
        assert_eq!(read_slot(buffer.bytes(), slot_a.offset() + 16, 4), 0);

        let root = buffer.root_array().unwrap();
        assert_eq!(
            read_slot(buffer.bytes(), root.slot.offset() + 16, 4),
            slot_b.identity()
        );
        assert_eq!(BufferSlot::from_identity(slot_b.identity()), Some(slot_b));
        assert_eq!(BufferSlot::from_identity(0), None);
    }

    #[test]
    fn test_unarchived_referent() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let a = graph.instance(NODE, vec![FieldValue::Reference(None), FieldValue::Scalar(0)]);
        let b = graph.instance(NODE, vec![FieldValue::Reference(Some(a)), FieldValue::Scalar(0)]);

        let mut buffer = StagingBuffer::new(1024, 4, 4096);
        buffer.allocate(&graph, &registry, b, RegionKind::Open).unwrap();
        let err = buffer.link_buffered_references(&graph, &registry).unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::UnarchivedReferent { referrer, referent } if referrer == b && referent == a
        ));
    }

    #[test]
    fn test_capacity_and_size_limits() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let big = graph.scalar_array(SHORTS, vec![0; 100]);
        let small = graph.instance(NODE, vec![FieldValue::Reference(None), FieldValue::Scalar(0)]);

        let mut buffer = StagingBuffer::new(1024, 4, 128);
        assert!(matches!(
            buffer.allocate(&graph, &registry, big, RegionKind::Open),
            Err(ArchiveError::ObjectTooLarge { size: 216, .. })
        ));

        let mut buffer = StagingBuffer::new(40, 4, 4096);
        buffer.allocate(&graph, &registry, small, RegionKind::Open).unwrap();
        let mut graph2 = graph.clone();
        let another = graph2.instance(NODE, vec![FieldValue::Reference(None), FieldValue::Scalar(0)]);
        assert!(matches!(
            buffer.allocate(&graph2, &registry, another, RegionKind::Open),
            Err(ArchiveError::StagingBufferExhausted { requested: 64, capacity: 40 })
        ));
    }

    #[test]
    fn test_duplicate_selection() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let a = graph.scalar_array(SHORTS, vec![]);
        let mut buffer = StagingBuffer::new(1024, 4, 4096);
        buffer.allocate(&graph, &registry, a, RegionKind::Open).unwrap();
        assert!(buffer.allocate(&graph, &registry, a, RegionKind::Closed).is_err());
    }
}
