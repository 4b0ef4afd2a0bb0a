//! `update` - flash a firmware image onto the device.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use touchcomm::{FirmwareUpdater, FlashTiming};

use crate::commands::open_connection;

pub(crate) fn run(
    port: Option<&str>,
    baud: u32,
    image: &Path,
    force: bool,
    erase_delay: u32,
    write_delay: u32,
) -> Result<()> {
    let bytes = fs::read(image)
        .with_context(|| format!("failed to read image {}", image.display()))?;

    let conn = open_connection(port, baud)?;

    let timing = FlashTiming {
        erase_delay_per_page_ms: erase_delay,
        write_delay_per_block_ms: write_delay,
        attn_driven: false,
    };

    let bar = ProgressBar::no_length();
    bar.set_style(
        ProgressStyle::with_template("{msg:<12} [{bar:40}] {bytes}/{total_bytes}")
            .expect("progress template is valid")
            .progress_chars("=> "),
    );

    let outcome = FirmwareUpdater::new(&conn)
        .with_timing(timing)
        .with_force(force)
        .run(&bytes, &mut |area, current, total| {
            bar.set_message(area.to_string());
            bar.set_length(total as u64);
            bar.set_position(current as u64);
        })?;
    bar.finish_and_clear();

    match outcome.written.as_slice() {
        [] => info!("device firmware already current, nothing written"),
        written => info!(
            "wrote {:?} in {} attempt(s)",
            written, outcome.attempts
        ),
    }

    Ok(())
}
