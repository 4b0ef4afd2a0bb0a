//! TouchComm message framing: header layout and wire codes.
//!
//! Every frame the device emits starts with a fixed 4-byte header:
//!
//! ```text
//! +--------+--------+-----------+-----------+----------------+
//! | Marker |  Code  | Length lo | Length hi |    Payload     |
//! +--------+--------+-----------+-----------+----------------+
//! |  0xA5  | status |      u16 little-endian|  length bytes  |
//! |        | report |                       |                |
//! +--------+--------+-----------+-----------+----------------+
//! ```
//!
//! The code byte is a transport status when below [`report::IDENTIFY`] and an
//! asynchronous report identifier at or above it. Payloads larger than one
//! bus transaction arrive as continued-read chunks, each re-prefixed with
//! `[0xA5, 0x03]`; outbound payloads larger than one transaction are split
//! into continued-write chunks prefixed with [`Command::ContinueWrite`].

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Fixed sentinel byte opening every frame.
pub const MESSAGE_MARKER: u8 = 0xA5;

/// Filler byte used for the trailing pad of a continued read.
pub const MESSAGE_PADDING: u8 = 0x5A;

/// Size of the frame header in bytes.
pub const MESSAGE_HEADER_SIZE: usize = 4;

/// Transport status codes (header code byte below the report range).
pub mod status {
    /// Nothing to report; the device had no frame pending.
    pub const IDLE: u8 = 0x00;
    /// Command accepted and executed.
    pub const OK: u8 = 0x01;
    /// Command received but still executing.
    pub const BUSY: u8 = 0x02;
    /// Chunk of a payload continuation.
    pub const CONTINUED_READ: u8 = 0x03;
    /// Host wrote more than the device could buffer.
    pub const RECEIVE_BUFFER_OVERFLOW: u8 = 0x0C;
    /// A previous command is still being processed.
    pub const PREVIOUS_COMMAND_PENDING: u8 = 0x0D;
    /// Command not implemented by this firmware.
    pub const NOT_IMPLEMENTED: u8 = 0x0E;
    /// Generic device-side failure.
    pub const ERROR: u8 = 0x0F;
    /// Sentinel for "no status received".
    pub const INVALID: u8 = 0xFF;
}

/// Report codes (header code byte at or above [`report::IDENTIFY`]).
pub mod report {
    /// Identification packet, emitted unsolicited after any reset.
    pub const IDENTIFY: u8 = 0x10;
    /// Touch event report.
    pub const TOUCH: u8 = 0x11;
    /// Delta capacitance image.
    pub const DELTA: u8 = 0x12;
    /// Raw capacitance image.
    pub const RAW: u8 = 0x13;
}

/// Returns true when `code` identifies an asynchronous device report.
pub fn is_report_code(code: u8) -> bool {
    code >= report::IDENTIFY
}

/// TouchComm command bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Placeholder for "no command in flight".
    None = 0x00,
    /// Continuation chunk of a chunked write.
    ContinueWrite = 0x01,
    /// Request an identification packet.
    Identify = 0x02,
    /// Soft reset; completion arrives as an unsolicited identify report.
    Reset = 0x04,
    /// Enable generation of a report type.
    EnableReport = 0x05,
    /// Disable generation of a report type.
    DisableReport = 0x06,
    /// Request the bootloader information packet.
    GetBootInfo = 0x10,
    /// Erase flash pages.
    EraseFlash = 0x11,
    /// Write a run of flash blocks.
    WriteFlash = 0x12,
    /// Read back flash content.
    ReadFlash = 0x13,
    /// Leave the bootloader and start the application firmware.
    RunApplicationFirmware = 0x14,
    /// Reboot into the ROM bootloader.
    RebootToRomBootloader = 0x16,
    /// Leave the application firmware and start the bootloader.
    RunBootloaderFirmware = 0x1F,
    /// Request the application information packet.
    GetApplicationInfo = 0x20,
    /// Read a static configuration value.
    GetStaticConfig = 0x21,
    /// Write a static configuration value.
    SetStaticConfig = 0x22,
    /// Read a dynamic configuration value.
    GetDynamicConfig = 0x23,
    /// Write a dynamic configuration value.
    SetDynamicConfig = 0x24,
    /// Read the touch report descriptor.
    GetTouchReportConfig = 0x25,
    /// Write the touch report descriptor.
    SetTouchReportConfig = 0x26,
    /// Force a baseline rezero.
    Rezero = 0x27,
    /// Commit staged configuration to flash.
    CommitConfig = 0x28,
    /// Run a production test item.
    ProductionTest = 0x2A,
    /// Enter deep sleep.
    EnterDeepSleep = 0x2C,
    /// Leave deep sleep.
    ExitDeepSleep = 0x2D,
    /// Switch into production test mode.
    EnterProductionTestMode = 0x31,
    /// ROM-bootloader variant of the bootloader switch.
    RombootRunBootloaderFirmware = 0x32,
    /// Write a dynamic configuration value without a response frame.
    SetImmediateDynamicConfig = 0x33,
}

impl Command {
    /// Raw command byte.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Map a raw command byte back to the enum, if known.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x00 => Self::None,
            0x01 => Self::ContinueWrite,
            0x02 => Self::Identify,
            0x04 => Self::Reset,
            0x05 => Self::EnableReport,
            0x06 => Self::DisableReport,
            0x10 => Self::GetBootInfo,
            0x11 => Self::EraseFlash,
            0x12 => Self::WriteFlash,
            0x13 => Self::ReadFlash,
            0x14 => Self::RunApplicationFirmware,
            0x16 => Self::RebootToRomBootloader,
            0x1F => Self::RunBootloaderFirmware,
            0x20 => Self::GetApplicationInfo,
            0x21 => Self::GetStaticConfig,
            0x22 => Self::SetStaticConfig,
            0x23 => Self::GetDynamicConfig,
            0x24 => Self::SetDynamicConfig,
            0x25 => Self::GetTouchReportConfig,
            0x26 => Self::SetTouchReportConfig,
            0x27 => Self::Rezero,
            0x28 => Self::CommitConfig,
            0x2A => Self::ProductionTest,
            0x2C => Self::EnterDeepSleep,
            0x2D => Self::ExitDeepSleep,
            0x31 => Self::EnterProductionTestMode,
            0x32 => Self::RombootRunBootloaderFirmware,
            0x33 => Self::SetImmediateDynamicConfig,
            _ => return None,
        })
    }

    /// Commands whose only acknowledgment is the identify report that
    /// follows the resulting firmware switch or reset.
    pub fn is_reset_class(self) -> bool {
        matches!(
            self,
            Self::Reset
                | Self::RebootToRomBootloader
                | Self::RunBootloaderFirmware
                | Self::RunApplicationFirmware
                | Self::EnterProductionTestMode
                | Self::RombootRunBootloaderFirmware
        )
    }

    /// Commands the firmware guarantees to be response-free. Only these may
    /// be sent through the immediate (write-only) path.
    pub fn is_response_free(self) -> bool {
        matches!(self, Self::SetImmediateDynamicConfig)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.code())
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Status or report code.
    pub code: u8,
    /// Declared payload length in bytes.
    pub length: u16,
}

impl MessageHeader {
    /// Parse a header from the first [`MESSAGE_HEADER_SIZE`] bytes of `buf`,
    /// validating the marker.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "short header: {} bytes",
                buf.len()
            )));
        }
        if buf[0] != MESSAGE_MARKER {
            return Err(Error::Protocol(format!(
                "incorrect header marker {:#04x}",
                buf[0]
            )));
        }
        Ok(Self {
            code: buf[1],
            length: LittleEndian::read_u16(&buf[2..4]),
        })
    }

    /// Encode a header with the given code and payload length.
    pub fn encode(code: u8, length: u16) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut out = [MESSAGE_MARKER, code, 0, 0];
        LittleEndian::write_u16(&mut out[2..4], length);
        out
    }

    /// Returns true when this frame carries an asynchronous device report.
    pub fn is_report(&self) -> bool {
        is_report_code(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        for code in [status::IDLE, status::OK, report::IDENTIFY, report::TOUCH, 0xFE] {
            for length in [0u16, 1, 2, 255, 256, 0x1234, u16::MAX] {
                let encoded = MessageHeader::encode(code, length);
                let parsed = MessageHeader::parse(&encoded).unwrap();
                assert_eq!(parsed.code, code);
                assert_eq!(parsed.length, length);
            }
        }
    }

    #[test]
    fn test_header_marker_validated() {
        let mut encoded = MessageHeader::encode(status::OK, 4);
        encoded[0] = 0x5B;
        assert!(matches!(
            MessageHeader::parse(&encoded),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_header_short_buffer() {
        assert!(MessageHeader::parse(&[MESSAGE_MARKER, 0x01]).is_err());
    }

    #[test]
    fn test_length_is_little_endian() {
        let encoded = MessageHeader::encode(status::OK, 0x0201);
        assert_eq!(encoded, [MESSAGE_MARKER, status::OK, 0x01, 0x02]);
    }

    #[test]
    fn test_report_threshold() {
        assert!(!is_report_code(status::ERROR));
        assert!(is_report_code(report::IDENTIFY));
        assert!(is_report_code(0xC0));
    }

    #[test]
    fn test_immediate_allow_list() {
        assert!(Command::SetImmediateDynamicConfig.is_response_free());
        assert!(!Command::SetDynamicConfig.is_response_free());
        assert!(!Command::Reset.is_response_free());
    }

    #[test]
    fn test_reset_class_commands() {
        assert!(Command::Reset.is_reset_class());
        assert!(Command::RunBootloaderFirmware.is_reset_class());
        assert!(Command::RunApplicationFirmware.is_reset_class());
        assert!(!Command::GetBootInfo.is_reset_class());
    }
}
