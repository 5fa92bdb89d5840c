//! `raya-archive dump`: write a heap archive from a JSON graph

use crate::input::GraphInput;
use anyhow::Context;
use raya_archive::{DumpOptions, DumpSession, ReferenceEncoding};
use std::path::Path;

pub fn execute(
    graph: &Path,
    out: &Path,
    wide: bool,
    alignment: Option<usize>,
) -> anyhow::Result<()> {
    let input = GraphInput::from_file(graph)?;
    let registry = input.registry()?;
    let selection = input.selection();

    let mut options = DumpOptions::default();
    if wide {
        options = options.with_encoding(ReferenceEncoding::Wide);
    }
    if let Some(bytes) = alignment {
        options = options.with_region_alignment(bytes);
    }

    let archive = DumpSession::run(&registry, &input.graph, &selection, options)
        .with_context(|| format!("Failed to dump {}", graph.display()))?;
    archive
        .write_to_file(out)
        .with_context(|| format!("Failed to write {}", out.display()))?;

    let header = archive.header();
    println!(
        "Wrote {}: {} objects, {} byte image ({} references)",
        out.display(),
        header.object_count,
        header.image_len,
        archive.encoding()
    );
    Ok(())
}
