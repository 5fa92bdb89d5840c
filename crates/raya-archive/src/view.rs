//! Reading loaded objects
//!
//! [`ObjectView`] decodes one object in heap memory. [`GraphSnapshot`] turns
//! everything reachable from a root into an address-free form: nodes are
//! numbered in breadth-first order and references become node numbers, so two
//! snapshots are equal exactly when the graphs are isomorphic.

use crate::codec::ReferenceCodec;
use crate::graph::{FieldValue, ObjectGraph, ObjectId, Payload};
use crate::heap::HeapMemory;
use crate::object::{Address, ObjectHeader, HEADER_SIZE, WORD_SIZE};
use crate::types::{FieldKind, TypeIndex, TypeInfo, TypeKind, TypeRegistry, ROOT_ARRAY_TYPE};
use crate::{ArchiveError, ArchiveResult};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::hash::Hash;

/// Value of one field or element as seen in heap memory
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ViewValue {
    /// Scalar field or array element
    Scalar(u64),
    /// Native pointer
    Native(u64),
    /// Decoded reference; `None` is null
    Reference(Option<Address>),
}

/// One object in heap memory
pub struct ObjectView<'a, M: HeapMemory + ?Sized, C: ReferenceCodec> {
    heap: &'a M,
    codec: &'a C,
    info: &'a TypeInfo,
    addr: Address,
    header: ObjectHeader,
}

impl<'a, M: HeapMemory + ?Sized, C: ReferenceCodec> ObjectView<'a, M, C> {
    /// Decode the object at `addr`
    pub fn new(
        heap: &'a M,
        types: &'a TypeRegistry,
        codec: &'a C,
        addr: Address,
    ) -> ArchiveResult<Self> {
        let header = heap
            .bytes(addr, HEADER_SIZE)
            .and_then(ObjectHeader::read)
            .ok_or_else(|| unreadable(addr))?;
        let info = types.require(header.type_index)?;
        if !info.accepts_length(header.length) {
            return Err(ArchiveError::Load(format!(
                "{} at {} has length {}",
                info.name, addr, header.length
            )));
        }
        Ok(Self {
            heap,
            codec,
            info,
            addr,
            header,
        })
    }

    /// Object address
    pub fn address(&self) -> Address {
        self.addr
    }

    /// Object header
    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    /// Object type
    pub fn type_info(&self) -> &'a TypeInfo {
        self.info
    }

    /// Field count or element count
    pub fn length(&self) -> usize {
        self.header.length as usize
    }

    /// Field `i` of an instance or element `i` of an array
    pub fn field(&self, i: usize) -> ArchiveResult<ViewValue> {
        if i >= self.length() {
            return Err(ArchiveError::Load(format!(
                "{} at {} has no field {}",
                self.info.name, self.addr, i
            )));
        }
        let ref_size = self.codec.ref_size();
        match &self.info.kind {
            TypeKind::Instance { fields } => {
                let layout = self
                    .info
                    .instance_layout(ref_size)
                    .ok_or_else(|| unreadable(self.addr))?;
                let at = self.addr.add(layout.offsets()[i]);
                match fields[i] {
                    FieldKind::Scalar => Ok(ViewValue::Scalar(self.word(at)?)),
                    FieldKind::Native => Ok(ViewValue::Native(self.word(at)?)),
                    FieldKind::Reference => self.reference_at(at),
                }
            }
            TypeKind::ScalarArray { element_size } => {
                let width = *element_size as usize;
                let at = self.addr.add(HEADER_SIZE + i * width);
                let bytes = self.heap.bytes(at, width).ok_or_else(|| unreadable(at))?;
                let mut buf = [0u8; WORD_SIZE];
                buf[..width].copy_from_slice(bytes);
                Ok(ViewValue::Scalar(u64::from_le_bytes(buf)))
            }
            TypeKind::ReferenceArray => {
                self.reference_at(self.addr.add(HEADER_SIZE + i * ref_size))
            }
        }
    }

    /// Reference field or element `i`
    pub fn reference(&self, i: usize) -> ArchiveResult<Option<Address>> {
        match self.field(i)? {
            ViewValue::Reference(target) => Ok(target),
            _ => Err(ArchiveError::Load(format!(
                "field {} of {} is not a reference",
                i, self.info.name
            ))),
        }
    }

    /// Scalar or native field or element `i`
    pub fn scalar(&self, i: usize) -> ArchiveResult<u64> {
        match self.field(i)? {
            ViewValue::Scalar(v) | ViewValue::Native(v) => Ok(v),
            ViewValue::Reference(_) => Err(ArchiveError::Load(format!(
                "field {} of {} is a reference",
                i, self.info.name
            ))),
        }
    }

    fn word(&self, at: Address) -> ArchiveResult<u64> {
        self.heap.read_word(at).ok_or_else(|| unreadable(at))
    }

    fn reference_at(&self, at: Address) -> ArchiveResult<ViewValue> {
        let raw = self
            .heap
            .read_slot(at, self.codec.ref_size())
            .ok_or_else(|| unreadable(at))?;
        Ok(ViewValue::Reference((raw != 0).then(|| self.codec.decode(raw))))
    }
}

fn unreadable(addr: Address) -> ArchiveError {
    ArchiveError::Load(format!("unreadable object memory at {}", addr))
}

/// Address-free value in a [`GraphSnapshot`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SnapshotValue {
    /// Scalar field or element
    Scalar(u64),
    /// Native pointer
    Native(u64),
    /// Reference to node `n`; `None` is null
    Reference(Option<usize>),
}

/// One node of a [`GraphSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNode {
    /// Object type
    pub type_index: TypeIndex,
    /// Header mark word
    pub mark: u64,
    /// Fields or elements in order
    pub values: Vec<SnapshotValue>,
}

/// Canonical form of the graph reachable from a root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSnapshot {
    /// Nodes in breadth-first order; node 0 is the root
    pub nodes: Vec<SnapshotNode>,
}

/// Breadth-first numbering of graph nodes
struct Numbering<K> {
    ids: FxHashMap<K, usize>,
    queue: VecDeque<K>,
}

impl<K: Copy + Eq + Hash> Numbering<K> {
    fn new(root: K) -> Self {
        let mut numbering = Self {
            ids: FxHashMap::default(),
            queue: VecDeque::new(),
        };
        numbering.number(root);
        numbering
    }

    fn number(&mut self, key: K) -> usize {
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = self.ids.len();
        self.ids.insert(key, id);
        self.queue.push_back(key);
        id
    }
}

impl GraphSnapshot {
    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Snapshot of a source graph seen through a root array holding `roots`
    ///
    /// `native` maps each source native pointer to the value expected after
    /// loading, so relocated natives can be compared.
    pub fn from_source<F>(
        graph: &ObjectGraph,
        registry: &TypeRegistry,
        roots: &[ObjectId],
        mut native: F,
    ) -> ArchiveResult<Self>
    where
        F: FnMut(u64) -> u64,
    {
        let mut numbering: Numbering<Option<ObjectId>> = Numbering::new(None);
        let mut nodes = Vec::new();

        while let Some(key) = numbering.queue.pop_front() {
            let node = match key {
                None => SnapshotNode {
                    type_index: ROOT_ARRAY_TYPE,
                    mark: 0,
                    values: roots
                        .iter()
                        .map(|&r| SnapshotValue::Reference(Some(numbering.number(Some(r)))))
                        .collect(),
                },
                Some(id) => {
                    let object = graph
                        .get(id)
                        .ok_or_else(|| ArchiveError::InvalidGraph(format!("no object {}", id)))?;
                    registry.require(object.type_index)?;
                    let values = match &object.payload {
                        Payload::Fields(fields) => fields
                            .iter()
                            .map(|value| match *value {
                                FieldValue::Scalar(v) => SnapshotValue::Scalar(v),
                                FieldValue::Native(v) => SnapshotValue::Native(native(v)),
                                FieldValue::Reference(target) => SnapshotValue::Reference(
                                    target.map(|t| numbering.number(Some(t))),
                                ),
                            })
                            .collect(),
                        Payload::Scalars(elements) => elements
                            .iter()
                            .map(|&v| SnapshotValue::Scalar(v))
                            .collect(),
                        Payload::References(elements) => elements
                            .iter()
                            .map(|target| {
                                SnapshotValue::Reference(target.map(|t| numbering.number(Some(t))))
                            })
                            .collect(),
                    };
                    SnapshotNode {
                        type_index: object.type_index,
                        mark: object.mark,
                        values,
                    }
                }
            };
            nodes.push(node);
        }
        Ok(Self { nodes })
    }

    /// Snapshot of the objects in heap memory reachable from `root`
    pub fn from_heap<M, C>(
        heap: &M,
        types: &TypeRegistry,
        codec: &C,
        root: Address,
    ) -> ArchiveResult<Self>
    where
        M: HeapMemory + ?Sized,
        C: ReferenceCodec,
    {
        let mut numbering = Numbering::new(root);
        let mut nodes = Vec::new();

        while let Some(addr) = numbering.queue.pop_front() {
            let view = ObjectView::new(heap, types, codec, addr)?;
            let mut values = Vec::with_capacity(view.length());
            for i in 0..view.length() {
                values.push(match view.field(i)? {
                    ViewValue::Scalar(v) => SnapshotValue::Scalar(v),
                    ViewValue::Native(v) => SnapshotValue::Native(v),
                    ViewValue::Reference(target) => {
                        SnapshotValue::Reference(target.map(|t| numbering.number(t)))
                    }
                });
            }
            nodes.push(SnapshotNode {
                type_index: view.header().type_index,
                mark: view.header().mark,
                values,
            });
        }
        Ok(Self { nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WideCodec;
    use crate::heap::{AllocationShape, ArenaHeap, DestinationAllocator};
    use crate::types::ObjectKind;

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .instance(
                "Pair",
                vec![FieldKind::Reference, FieldKind::Scalar, FieldKind::Reference],
            )
            .scalar_array("Bytes", 1)
            .build()
            .unwrap()
    }

    fn place(heap: &mut ArenaHeap, header: ObjectHeader, size: usize) -> Address {
        let shape = AllocationShape {
            kind: ObjectKind::Instance,
            type_index: header.type_index,
            length: header.length,
            size,
        };
        let addr = heap.allocate(&shape).unwrap();
        header.write(heap.bytes_mut(addr, size).unwrap());
        addr
    }

    #[test]
    fn test_object_view_fields() {
        let types = registry();
        let pair = types.lookup("Pair").unwrap();
        let mut heap = ArenaHeap::new();
        let a = place(&mut heap, ObjectHeader::new(5, pair, 3), 40);
        heap.write_word(a.add(16), a.as_u64()).unwrap();
        heap.write_word(a.add(24), 77).unwrap();

        let view = ObjectView::new(&heap, &types, &WideCodec, a).unwrap();
        assert_eq!(view.length(), 3);
        assert_eq!(view.header().mark, 5);
        assert_eq!(view.reference(0).unwrap(), Some(a));
        assert_eq!(view.scalar(1).unwrap(), 77);
        assert_eq!(view.reference(2).unwrap(), None);
        assert!(view.scalar(0).is_err());
        assert!(view.field(3).is_err());
    }

    #[test]
    fn test_scalar_array_elements() {
        let types = registry();
        let bytes = types.lookup("Bytes").unwrap();
        let mut heap = ArenaHeap::new();
        let a = place(&mut heap, ObjectHeader::new(0, bytes, 3), 24);
        heap.bytes_mut(a.add(16), 3)
            .unwrap()
            .copy_from_slice(&[1, 2, 0xff]);

        let view = ObjectView::new(&heap, &types, &WideCodec, a).unwrap();
        assert_eq!(view.scalar(2).unwrap(), 0xff);
    }

    #[test]
    fn test_snapshot_of_source_cycle() {
        let types = registry();
        let pair = types.lookup("Pair").unwrap();
        let mut graph = ObjectGraph::new();
        let a = graph.instance(
            pair,
            vec![
                FieldValue::Reference(None),
                FieldValue::Scalar(1),
                FieldValue::Reference(None),
            ],
        );
        let b = graph.instance(
            pair,
            vec![
                FieldValue::Reference(Some(a)),
                FieldValue::Scalar(2),
                FieldValue::Reference(None),
            ],
        );
        graph.set_field(a, 0, FieldValue::Reference(Some(b))).unwrap();

        let snapshot = GraphSnapshot::from_source(&graph, &types, &[a, b], |v| v).unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(
            snapshot.nodes[0].values,
            vec![
                SnapshotValue::Reference(Some(1)),
                SnapshotValue::Reference(Some(2))
            ]
        );
        assert_eq!(snapshot.nodes[1].values[0], SnapshotValue::Reference(Some(2)));
        assert_eq!(snapshot.nodes[2].values[0], SnapshotValue::Reference(Some(1)));
    }

    #[test]
    fn test_snapshot_distinguishes_sharing() {
        let types = registry();
        let pair = types.lookup("Pair").unwrap();
        let leaf = |graph: &mut ObjectGraph| {
            graph.instance(
                pair,
                vec![
                    FieldValue::Reference(None),
                    FieldValue::Scalar(0),
                    FieldValue::Reference(None),
                ],
            )
        };

        let mut shared = ObjectGraph::new();
        let x = leaf(&mut shared);
        let mut distinct = ObjectGraph::new();
        let y = leaf(&mut distinct);
        let z = leaf(&mut distinct);

        let one = GraphSnapshot::from_source(&shared, &types, &[x, x], |v| v).unwrap();
        let two = GraphSnapshot::from_source(&distinct, &types, &[y, z], |v| v).unwrap();
        assert_ne!(one, two);
    }
}
