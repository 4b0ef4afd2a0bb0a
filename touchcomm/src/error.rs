//! Error types for touchcomm.

use std::io;
use thiserror::Error;

/// Result type for touchcomm operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for touchcomm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (bus transfer, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Protocol violation: bad frame marker, lost chunk synchronization,
    /// malformed frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device answered a command with a non-OK status code.
    #[error("Device rejected command {command:#04x} with status {code:#04x}")]
    Device {
        /// Command byte that was sent.
        command: u8,
        /// Status code returned by the device.
        code: u8,
    },

    /// Invalid firmware image container.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Flash area checksum mismatch.
    #[error("Checksum mismatch in {area}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Flash area name.
        area: String,
        /// Checksum stored in the area descriptor.
        expected: u32,
        /// Checksum recomputed over the area content.
        actual: u32,
    },

    /// Unsupported protocol version or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Firmware update exhausted its retries.
    #[error("Firmware update failed on {area} after {attempts} attempts")]
    UpdateFailed {
        /// Flash area that could not be updated.
        area: String,
        /// Number of full-sequence attempts made.
        attempts: u32,
    },
}
