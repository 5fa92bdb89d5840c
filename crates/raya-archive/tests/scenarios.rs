//! End-to-end dump and load scenarios

mod common;

use common::{Fixture, NATIVE_BASE};
use raya_archive::graph::{ArchiveSelection, FieldValue, ObjectGraph};
use raya_archive::load::LoadOutcome;
use raya_archive::view::ObjectView;
use raya_archive::{
    ArchiveError, ArchiveSource, ArenaHeap, DumpOptions, DumpSession, ErrorClass, LoadMode,
    LoadOptions,
};

fn load(
    fx: &Fixture,
    graph: &ObjectGraph,
    selection: &ArchiveSelection,
    options: &LoadOptions,
    heap: &mut ArenaHeap,
) -> LoadOutcome {
    let archive = fx.dump(graph, selection, DumpOptions::default());
    let source = ArchiveSource::Memory(archive.to_bytes().unwrap());
    raya_archive::load_archive(&source, heap, options).unwrap()
}

#[test]
fn test_loaded_root_array_links() {
    let fx = Fixture::new();
    let mut graph = ObjectGraph::new();
    let b = fx.node(&mut graph, None, 20);
    let a = fx.node(&mut graph, Some(b), 10);
    let selection = ArchiveSelection::new().open(a).open(b).root(a).root(b);

    let mut heap = ArenaHeap::new();
    let options = LoadOptions::default().with_mode(LoadMode::Loaded);
    let outcome = load(&fx, &graph, &selection, &options, &mut heap);
    let LoadOutcome::Loaded(loaded) = outcome else {
        panic!("expected a Loaded-mode outcome");
    };
    let codec = loaded.encoding.codec().unwrap();

    let root = ObjectView::new(&heap, &loaded.types, &codec, loaded.root).unwrap();
    assert_eq!(root.length(), 2);
    let a_addr = root.reference(0).unwrap().unwrap();
    let b_addr = root.reference(1).unwrap().unwrap();

    let a_view = ObjectView::new(&heap, &loaded.types, &codec, a_addr).unwrap();
    let b_view = ObjectView::new(&heap, &loaded.types, &codec, b_addr).unwrap();
    assert_eq!(a_view.reference(0).unwrap(), Some(b_addr));
    assert_eq!(a_view.scalar(1).unwrap(), 10);
    assert_eq!(b_view.reference(0).unwrap(), None);
    assert_eq!(b_view.scalar(1).unwrap(), 20);
}

#[test]
fn test_mapped_quick_path_leaves_references_unchanged() {
    let fx = Fixture::new();
    let (graph, selection) = common::mixed_graph(&fx);
    let archive = fx.dump(&graph, &selection, DumpOptions::default());
    let before = archive.image().to_vec();
    let source = ArchiveSource::Memory(archive.to_bytes().unwrap());

    let mut heap = ArenaHeap::new();
    let options = LoadOptions::default().with_mode(LoadMode::Mapped);
    let outcome = raya_archive::load_archive(&source, &mut heap, &options).unwrap();
    let LoadOutcome::Mapped(mapped) = outcome else {
        panic!("expected a Mapped-mode outcome");
    };

    assert!(mapped.quick_path);
    assert_eq!(mapped.heap.base(), archive.requested_base());
    assert!(mapped.stats.references > 0);
    assert_eq!(mapped.heap.as_bytes(), &before[..]);
}

#[test]
fn test_oversized_object_is_a_capacity_error() {
    let fx = Fixture::new();
    let mut graph = ObjectGraph::new();
    // 16 byte header + 64 bytes of elements, with G = 64
    let big = graph.scalar_array(fx.bytes, vec![7; 64]);
    let selection = ArchiveSelection::new().open(big).root(big);
    let options = DumpOptions::default().with_region_alignment(64);

    let err = DumpSession::run(&fx.types, &graph, &selection, options).unwrap_err();
    assert!(matches!(
        err,
        ArchiveError::ObjectTooLarge {
            size: 80,
            alignment: 64,
            ..
        }
    ));
    assert_eq!(err.class(), ErrorClass::Capacity);
}

#[test]
fn test_native_pointers_follow_image_delta() {
    let fx = Fixture::new();
    let mut graph = ObjectGraph::new();
    let holder = graph.instance(
        fx.holder,
        vec![
            FieldValue::Native(NATIVE_BASE + 0x100),
            FieldValue::Reference(None),
            FieldValue::Native(0x10),
        ],
    );
    let selection = ArchiveSelection::new().closed(holder).root(holder);

    for mode in [LoadMode::Mapped, LoadMode::Loaded] {
        let mut heap = ArenaHeap::new();
        let options = LoadOptions::default()
            .with_mode(mode)
            .with_native_base(NATIVE_BASE + 256);
        let outcome = load(&fx, &graph, &selection, &options, &mut heap);
        assert_eq!(outcome.mode(), Some(mode));

        let snapshot = common::loaded_snapshot(&outcome, &heap);
        let holder_node = &snapshot.nodes[1];
        assert_eq!(
            holder_node.values[0],
            raya_archive::view::SnapshotValue::Native(NATIVE_BASE + 0x100 + 256)
        );
        // Outside the native image: left alone.
        assert_eq!(
            holder_node.values[2],
            raya_archive::view::SnapshotValue::Native(0x10)
        );
    }
}

#[test]
fn test_loaded_forward_references_resolve() {
    let fx = Fixture::new();
    let mut graph = ObjectGraph::new();
    let a = fx.node(&mut graph, None, 1);
    let b = fx.node(&mut graph, Some(a), 2);
    graph.set_field(a, 0, FieldValue::Reference(Some(b))).unwrap();
    // `a` is copied first, before `b` has a destination.
    let selection = ArchiveSelection::new().open(a).open(b).root(a);

    let mut heap = ArenaHeap::new();
    let options = LoadOptions::default()
        .with_mode(LoadMode::Loaded)
        .with_verify_after_load(true);
    let outcome = load(&fx, &graph, &selection, &options, &mut heap);
    let LoadOutcome::Loaded(loaded) = outcome else {
        panic!("expected a Loaded-mode outcome");
    };
    let codec = loaded.encoding.codec().unwrap();

    let root = ObjectView::new(&heap, &loaded.types, &codec, loaded.root).unwrap();
    let a_addr = root.reference(0).unwrap().unwrap();
    let a_view = ObjectView::new(&heap, &loaded.types, &codec, a_addr).unwrap();
    let b_addr = a_view.reference(0).unwrap().unwrap();
    let b_view = ObjectView::new(&heap, &loaded.types, &codec, b_addr).unwrap();

    assert_eq!(b_view.reference(0).unwrap(), Some(a_addr));
    assert_eq!(a_view.scalar(1).unwrap(), 1);
    assert_eq!(b_view.scalar(1).unwrap(), 2);
    assert_eq!(loaded.stats.references, 3);
}
