//! Shared fixtures for the archive integration tests

#![allow(dead_code)]

use raya_archive::dump::DEFAULT_NATIVE_RANGE;
use raya_archive::graph::{ArchiveSelection, FieldValue, ObjectGraph, ObjectId};
use raya_archive::load::LoadOutcome;
use raya_archive::types::{FieldKind, TypeIndex, TypeRegistry};
use raya_archive::view::GraphSnapshot;
use raya_archive::{ArenaHeap, DumpOptions, DumpSession, HeapArchive};

pub const NATIVE_BASE: u64 = DEFAULT_NATIVE_RANGE.start;

pub struct Fixture {
    pub types: TypeRegistry,
    pub node: TypeIndex,
    pub holder: TypeIndex,
    pub bytes: TypeIndex,
    pub refs: TypeIndex,
}

impl Fixture {
    pub fn new() -> Self {
        let types = TypeRegistry::builder()
            .instance("Node", vec![FieldKind::Reference, FieldKind::Scalar])
            .instance(
                "Holder",
                vec![FieldKind::Native, FieldKind::Reference, FieldKind::Native],
            )
            .scalar_array("Bytes", 1)
            .reference_array("Refs")
            .build()
            .unwrap();
        Self {
            node: types.lookup("Node").unwrap(),
            holder: types.lookup("Holder").unwrap(),
            bytes: types.lookup("Bytes").unwrap(),
            refs: types.lookup("Refs").unwrap(),
            types,
        }
    }

    pub fn node(&self, graph: &mut ObjectGraph, next: Option<ObjectId>, value: u64) -> ObjectId {
        graph.instance(
            self.node,
            vec![FieldValue::Reference(next), FieldValue::Scalar(value)],
        )
    }

    pub fn dump(
        &self,
        graph: &ObjectGraph,
        selection: &ArchiveSelection,
        options: DumpOptions,
    ) -> HeapArchive {
        DumpSession::run(&self.types, graph, selection, options).unwrap()
    }
}

/// A mixed graph spread over both regions
///
/// open:   list a -> b -> c (c.next = a), holder -> bytes
/// closed: refs [c, null, bytes], bytes
pub fn mixed_graph(fx: &Fixture) -> (ObjectGraph, ArchiveSelection) {
    let mut graph = ObjectGraph::new();
    let c = fx.node(&mut graph, None, 3);
    let b = fx.node(&mut graph, Some(c), 2);
    let a = fx.node(&mut graph, Some(b), 1);
    graph.set_field(c, 0, FieldValue::Reference(Some(a))).unwrap();

    let bytes = graph.scalar_array(fx.bytes, vec![1, 2, 3, 0xff]);
    let holder = graph.instance(
        fx.holder,
        vec![
            FieldValue::Native(NATIVE_BASE + 0x40),
            FieldValue::Reference(Some(bytes)),
            FieldValue::Native(0x1234),
        ],
    );
    let refs = graph.reference_array(fx.refs, vec![Some(c), None, Some(bytes)]);

    let selection = ArchiveSelection::new()
        .open(a)
        .open(b)
        .open(c)
        .open(holder)
        .closed(refs)
        .closed(bytes)
        .root(a)
        .root(holder)
        .root(refs);
    (graph, selection)
}

/// Expected snapshot of a selection after loading with native delta `delta`
pub fn expected_snapshot(
    fx: &Fixture,
    graph: &ObjectGraph,
    selection: &ArchiveSelection,
    delta: i64,
) -> GraphSnapshot {
    GraphSnapshot::from_source(graph, &fx.types, &selection.roots, |v| {
        if DEFAULT_NATIVE_RANGE.contains(&v) {
            v.wrapping_add(delta as u64)
        } else {
            v
        }
    })
    .unwrap()
}

/// Snapshot of whatever a load produced
pub fn loaded_snapshot(outcome: &LoadOutcome, heap: &ArenaHeap) -> GraphSnapshot {
    match outcome {
        LoadOutcome::Mapped(mapped) => {
            let codec = mapped.encoding.codec().unwrap();
            GraphSnapshot::from_heap(&mapped.heap, &mapped.types, &codec, mapped.root).unwrap()
        }
        LoadOutcome::Loaded(loaded) => {
            let codec = loaded.encoding.codec().unwrap();
            GraphSnapshot::from_heap(heap, &loaded.types, &codec, loaded.root).unwrap()
        }
        LoadOutcome::Disabled(reason) => panic!("archive disabled: {}", reason),
    }
}
