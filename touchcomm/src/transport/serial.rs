//! Serial-bridge transport using the `serialport` crate.
//!
//! Development rigs expose the controller's SPI/I2C bus through a USB serial
//! bridge that shuttles raw bytes both ways. The bridge forwards the
//! controller's attention line as "data pending" on the host side and wires
//! the reset pin to RTS, which is enough to drive the full protocol from a
//! desktop.

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;
use serialport::ClearBuffer;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Poll interval while waiting for the attention indication.
const ATTN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long the reset line is held asserted.
const RESET_PULSE: Duration = Duration::from_millis(10);

/// Serial-bridge transport for host platforms.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Default timeout for bus transactions.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

    /// Open the bridge on `port_name` at `baud_rate`.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self> {
        Self::open_with_timeout(port_name, baud_rate, Self::DEFAULT_TIMEOUT)
    }

    /// Open the bridge with a custom per-transaction timeout.
    pub fn open_with_timeout(
        port_name: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .open()?;

        Ok(Self {
            port,
            name: port_name.to_string(),
        })
    }

    /// List available serial ports.
    pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>> {
        serialport::available_ports().map_err(Error::Serial)
    }

    /// Discard any bytes buffered on either side of the bridge.
    pub fn clear_buffers(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        trace!("bus write: {} bytes", data.len());
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        self.port.read_exact(buf)?;
        trace!("bus read: {} bytes", buf.len());
        Ok(())
    }

    fn wait_attention(&mut self, timeout: Duration) -> Result<bool> {
        let start = Instant::now();
        loop {
            if self.port.bytes_to_read()? > 0 {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            thread::sleep(ATTN_POLL_INTERVAL);
        }
    }

    fn hard_reset(&mut self) -> Result<()> {
        trace!("pulsing reset via RTS");
        self.port.write_request_to_send(true)?;
        thread::sleep(RESET_PULSE);
        self.port.write_request_to_send(false)?;
        // drop anything the controller emitted while held in reset
        self.port.clear(ClearBuffer::All)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_ports() {
        // This test just verifies that list_ports doesn't panic
        let _ = SerialTransport::list_ports();
    }
}
