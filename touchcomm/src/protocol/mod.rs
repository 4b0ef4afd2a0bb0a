//! TouchComm wire protocol implementations.
//!
//! The framing rules come in generations. A connection probes the device
//! once at setup time, picks the matching [`WireProtocol`] implementation
//! and holds it as a boxed value for its lifetime; nothing renegotiates
//! mid-connection because the underlying bus cannot do so atomically.

pub mod message;
pub(crate) mod v1;

use crate::device::Connection;
use crate::error::{Error, Result};
use crate::protocol::message::Command;

pub(crate) use v1::ProtocolV1;

/// How long a command gives the device before its response is collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseDelay {
    /// Poll for the response at the default interval.
    #[default]
    Default,
    /// Give the device this many milliseconds per polling round; used for
    /// commands with a known execution time such as flash erases.
    Millis(u32),
    /// Rely on the attention-driven reader to deliver the response.
    AttnDriven,
}

/// One generation of the wire protocol.
pub(crate) trait WireProtocol: Send + Sync {
    /// Send a command and block until its response arrives; returns the
    /// response payload. The copy happens under the command lock so a
    /// following command cannot clobber it.
    fn write_message(
        &self,
        conn: &Connection,
        command: Command,
        payload: &[u8],
        delay: ResponseDelay,
    ) -> Result<Vec<u8>>;

    /// Send a response-free command; returns as soon as the write finishes.
    fn write_immediate_message(
        &self,
        conn: &Connection,
        command: Command,
        payload: &[u8],
    ) -> Result<()>;

    /// Read one inbound frame, reassemble its payload and dispatch it;
    /// returns the status or report code of the frame.
    fn read_message(&self, conn: &Connection) -> Result<u8>;
}

/// Second-generation protocol.
///
/// No supported silicon speaks v2 yet; probing always reports it absent so
/// detection falls through to [`ProtocolV1`].
pub(crate) struct ProtocolV2;

impl ProtocolV2 {
    /// Probe for a v2 device.
    pub(crate) fn detect(_conn: &Connection) -> Result<()> {
        Err(Error::Unsupported("no v2 device detected".to_string()))
    }
}

impl WireProtocol for ProtocolV2 {
    fn write_message(
        &self,
        _conn: &Connection,
        _command: Command,
        _payload: &[u8],
        _delay: ResponseDelay,
    ) -> Result<Vec<u8>> {
        Err(Error::Unsupported("protocol v2 not implemented".to_string()))
    }

    fn write_immediate_message(
        &self,
        _conn: &Connection,
        _command: Command,
        _payload: &[u8],
    ) -> Result<()> {
        Err(Error::Unsupported("protocol v2 not implemented".to_string()))
    }

    fn read_message(&self, _conn: &Connection) -> Result<u8> {
        Err(Error::Unsupported("protocol v2 not implemented".to_string()))
    }
}
