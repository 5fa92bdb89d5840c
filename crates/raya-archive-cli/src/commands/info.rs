//! `raya-archive info`: print the archive header

use anyhow::Context;
use raya_archive::archive::ArchiveChecksum;
use raya_archive::{HeapArchive, RegionKind};
use std::path::Path;

pub fn execute(file: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let archive = HeapArchive::from_bytes(&bytes, false)
        .with_context(|| format!("Not a heap archive: {}", file.display()))?;
    let h = archive.header();

    println!("Archive:      {}", file.display());
    println!("Version:      {}", h.version);
    println!("Encoding:     {}", archive.encoding());
    println!("Alignment:    {:#x}", h.region_alignment);
    println!("Requested:    {}", archive.requested_base());
    println!("Objects:      {}", h.object_count);
    println!("Image:        {} bytes", h.image_len);
    for region in [RegionKind::Open, RegionKind::Closed] {
        let range = h.region(region);
        let maps = archive.maps(region);
        println!(
            "  {:<7} @{:#x}..{:#x}  {} references, {} native pointers",
            region.to_string(),
            range.start,
            range.end,
            maps.oopmap.count_ones(),
            maps.ptrmap.count_ones()
        );
    }
    println!("Root:         @{:#x}", h.root_offset);
    println!(
        "Native image: {:#x}..{:#x}",
        h.native_base,
        h.native_base + h.native_size
    );

    let at = h.checksum_offset as usize;
    let stored = bytes
        .get(at..)
        .map(|mut tail| ArchiveChecksum::decode(&mut tail))
        .transpose()?
        .context("Checksum missing")?;
    let valid = stored.verify(&bytes[..at]);
    println!(
        "Checksum:     {} ({})",
        hex::encode(stored.as_bytes()),
        if valid { "ok" } else { "MISMATCH" }
    );
    Ok(())
}
