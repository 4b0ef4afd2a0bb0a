//! Command implementations.
//!
//! Each subcommand lives in its own module for clean separation.

pub(crate) mod identify;
pub(crate) mod info;
pub(crate) mod reset;
pub(crate) mod update;

use anyhow::{bail, Context, Result};
use touchcomm::{Connection, SerialTransport};

/// Open the serial bridge and connect to the device behind it.
pub(crate) fn open_connection(port: Option<&str>, baud: u32) -> Result<Connection> {
    let Some(port) = port else {
        bail!("no serial port given; use --port or set TOUCHCOMM_PORT");
    };

    let transport = SerialTransport::open(port, baud)
        .with_context(|| format!("failed to open serial bridge on {port}"))?;

    Connection::open(Box::new(transport)).context("failed to connect to the device")
}
