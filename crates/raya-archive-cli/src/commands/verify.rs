//! `raya-archive verify`: check checksum, reference maps and a trial load

use anyhow::{bail, Context};
use raya_archive::load::{load_loaded, verify_loaded_heap};
use raya_archive::{ArenaHeap, HeapArchive};
use std::path::Path;

pub fn execute(file: &Path) -> anyhow::Result<()> {
    let archive = HeapArchive::open(file, true)
        .with_context(|| format!("Failed to open {}", file.display()))?;
    println!("Checksum:       ok");

    if let Err(e) = archive.verify_maps() {
        bail!("Reference maps do not match the image: {}", e);
    }
    println!("Reference maps: ok");

    let runtime = archive.encoding();
    let mut heap = ArenaHeap::new();
    let loaded = load_loaded(archive, &mut heap, runtime, 0)?;
    let report = verify_loaded_heap(&heap, &loaded.types, loaded.encoding, &loaded.regions())?;
    println!(
        "Object graph:   ok ({} objects, {} references, {} null)",
        report.objects, report.references, report.null_references
    );
    Ok(())
}
