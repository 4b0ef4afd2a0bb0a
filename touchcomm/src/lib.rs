//! # touchcomm
//!
//! Host-side implementation of the TouchComm protocol: the framed, chunked,
//! request/response wire protocol touch controllers speak over a
//! byte-oriented serial bus, plus the firmware reflash engine built on top
//! of it.
//!
//! The crate provides:
//!
//! - a [`transport::Transport`] abstraction over the raw bus (SPI/I2C on
//!   target hardware, a serial bridge on a development host);
//! - the framed message codec with continued-read reassembly and chunked
//!   writes;
//! - a [`device::Connection`] correlating each command with its response
//!   while an attention-driven reader thread dispatches device reports;
//! - firmware image container parsing with per-area CRC-32 gating;
//! - the [`reflash`] engine that compares image and device identity and
//!   rewrites the controller's flash areas.
//!
//! ## Example
//!
//! ```rust,no_run
//! use touchcomm::{Connection, FlashTiming, SerialTransport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = SerialTransport::open("/dev/ttyUSB0", 921_600)?;
//!     let conn = Connection::open(Box::new(transport))?;
//!
//!     println!("device: {:?}", conn.identification());
//!
//!     let image = std::fs::read("firmware.img")?;
//!     let outcome =
//!         touchcomm::reflash::run_firmware_update(&conn, &image, FlashTiming::default(), false)?;
//!     println!("update: {outcome:?}");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod device;
pub mod error;
pub mod image;
pub mod protocol;
pub mod reflash;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use transport::SerialTransport;
pub use {
    device::info::{ApplicationInfo, AppStatus, BootInfo, FirmwareMode, IdentificationInfo},
    device::{CommandState, Connection},
    error::{Error, Result},
    image::{AreaKind, FirmwareImage, FlashArea},
    protocol::message::{Command, MessageHeader},
    protocol::ResponseDelay,
    reflash::{FirmwareUpdater, FlashTiming, UpdateDecision, UpdateOutcome},
    transport::Transport,
};
