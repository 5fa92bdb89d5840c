//! `raya-archive load`: trial-load an archive into an arena heap

use raya_archive::load::LoadOutcome;
use raya_archive::{load_archive, ArchiveSource, ArenaHeap, LoadMode, LoadOptions};
use std::path::Path;
use std::time::Instant;

pub fn execute(file: &Path, mode: Option<LoadMode>) -> anyhow::Result<()> {
    let mut options = LoadOptions::from_env()?;
    if let Some(mode) = mode {
        options = options.with_mode(mode);
    }

    let source = ArchiveSource::File(file.to_path_buf());
    let mut heap = ArenaHeap::new();
    let start = Instant::now();
    let outcome = load_archive(&source, &mut heap, &options)?;
    let elapsed = start.elapsed();

    match &outcome {
        LoadOutcome::Mapped(mapped) => {
            println!("Mode:       mapped (quick path: {})", mapped.quick_path);
            println!("Root:       {}", mapped.root);
            for (bottom, top) in &mapped.regions {
                println!("Region:     {}..{}", bottom, top);
            }
            println!(
                "Patched:    {} references ({} null), {} native pointers",
                mapped.stats.references, mapped.stats.null_references, mapped.stats.native_pointers
            );
        }
        LoadOutcome::Loaded(loaded) => {
            println!("Mode:       loaded");
            println!("Root:       {}", loaded.root);
            println!("Objects:    {}", loaded.objects);
            for block in &loaded.blocks {
                println!(
                    "Block:      {}..{} ({}, stream @{:#x})",
                    block.dest_bottom, block.dest_top, block.region, block.stream_offset
                );
            }
            println!(
                "Relocated:  {} references ({} null), {} native pointers",
                loaded.stats.references, loaded.stats.null_references, loaded.stats.native_pointers
            );
        }
        LoadOutcome::Disabled(reason) => {
            println!("Archive disabled: {}", reason);
        }
    }
    println!("Time:       {:.3} ms", elapsed.as_secs_f64() * 1000.0);
    Ok(())
}
