//! Bus transport abstraction.
//!
//! TouchComm runs over a byte-oriented serial bus (SPI or I2C on the target
//! hardware, or a serial bridge from a development host). The `Transport`
//! trait reduces the bus to raw byte shuttling so the protocol layer stays
//! I/O-agnostic:
//!
//! ```text
//! +--------------------+     +--------------------+
//! |   Protocol Layer   |     |   Protocol Layer   |
//! |  (codec, reflash)  |     |  (codec, reflash)  |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+----------+     +---------+----------+
//! |  Transport Trait   |     |  Transport Trait   |
//! +---------+----------+     +---------+----------+
//!           |                          |
//!           v                          v
//! +---------+----------+     +---------+----------+
//! |   SerialTransport  |     |  platform-specific |
//! |    (serialport)    |     |   SPI/I2C shuttle  |
//! +--------------------+     +--------------------+
//!     Host bridge                 Embedded rig
//! ```
//!
//! A transport knows nothing about framing. It moves exactly the bytes it is
//! asked to move, in one bus transaction per call, and reports whether the
//! device's attention line is asserted.

#[cfg(feature = "native")]
pub mod serial;

use std::time::Duration;

use crate::error::{Error, Result};

/// Raw byte shuttle to the touch controller.
///
/// Implementations must perform each call as a single synchronous bus
/// transaction: the protocol layer relies on chunk boundaries mapping
/// one-to-one onto bus transactions.
pub trait Transport: Send {
    /// Write `data` to the device in one bus transaction.
    fn write_raw(&mut self, data: &[u8]) -> Result<()>;

    /// Read exactly `buf.len()` bytes from the device in one bus transaction.
    fn read_raw(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Wait until the device asserts its attention line, up to `timeout`.
    ///
    /// Returns `true` if attention was observed within the timeout, `false`
    /// otherwise. Transports without an attention line should return `false`
    /// after the timeout elapses.
    fn wait_attention(&mut self, timeout: Duration) -> Result<bool>;

    /// Pulse the device's hardware reset line.
    ///
    /// Most bus bridges do not wire the reset pin; the default implementation
    /// reports the capability as absent so callers can fall back to the soft
    /// reset command.
    fn hard_reset(&mut self) -> Result<()> {
        Err(Error::Unsupported(
            "transport has no reset line".to_string(),
        ))
    }

    /// Human-readable name of the underlying bus endpoint.
    fn name(&self) -> &str;
}

// Re-export the bundled implementation
#[cfg(feature = "native")]
pub use serial::SerialTransport;
