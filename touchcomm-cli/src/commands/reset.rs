//! `reset` - soft-reset the connected device.

use anyhow::Result;
use log::info;

use crate::commands::open_connection;

pub(crate) fn run(port: Option<&str>, baud: u32) -> Result<()> {
    let conn = open_connection(port, baud)?;
    conn.soft_reset()?;

    if let Some(id) = conn.identification() {
        info!("device back in mode {:?}", id.mode);
    }

    Ok(())
}
