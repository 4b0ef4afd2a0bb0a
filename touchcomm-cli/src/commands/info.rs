//! `info` - inspect a firmware image container.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use touchcomm::FirmwareImage;

pub(crate) fn run(path: &Path) -> Result<()> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read image {}", path.display()))?;
    let image = FirmwareImage::parse(&bytes)
        .with_context(|| format!("failed to parse image {}", path.display()))?;

    println!("{} ({} bytes)", path.display(), bytes.len());
    println!();
    println!("{:<18} {:>10} {:>10}  {}", "AREA", "ADDRESS", "SIZE", "CHECKSUM");
    for area in image.areas() {
        println!(
            "{:<18} {:>#10x} {:>10}  {:#010x}",
            area.id,
            area.flash_addr,
            area.data.len(),
            area.checksum
        );
    }

    for failure in image.checksum_failures() {
        println!(
            "{:<18} EXCLUDED: stored {:#010x}, computed {:#010x}",
            failure.id, failure.expected, failure.actual
        );
    }

    if !image.ignored_areas().is_empty() {
        println!();
        println!("unrecognized areas: {}", image.ignored_areas().join(", "));
    }

    Ok(())
}
