//! Device identity packets.
//!
//! Three information packets describe the running firmware:
//!
//! - the identification packet, carried by every identify report and by the
//!   response to the identify command;
//! - the application information packet, available while the application
//!   firmware runs;
//! - the boot information packet, available while the bootloader runs.
//!
//! All packets are little-endian with fixed field offsets; they are decoded
//! field by field rather than overlaid on structs, so truncated or extended
//! firmware variants stay safe to parse.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{Error, Result};

/// Size of the fixed part-number string field.
pub const PART_NUMBER_SIZE: usize = 16;

/// Size of the customer configuration id field.
pub const CONFIG_ID_SIZE: usize = 16;

/// Firmware the device reports itself to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareMode {
    /// Application (touch-reporting) firmware.
    Application,
    /// Host-download mode.
    HostDownload,
    /// ROM bootloader.
    RomBootloader,
    /// Flash bootloader.
    Bootloader,
    /// TDDI flash bootloader.
    TddiBootloader,
    /// TDDI host-download mode.
    TddiHostDownload,
    /// Anything this library does not know about.
    Unknown(u8),
}

impl From<u8> for FirmwareMode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Application,
            0x02 => Self::HostDownload,
            0x04 => Self::RomBootloader,
            0x0B => Self::Bootloader,
            0x0C => Self::TddiBootloader,
            0x0D => Self::TddiHostDownload,
            v => Self::Unknown(v),
        }
    }
}

impl FirmwareMode {
    /// Raw mode byte.
    pub fn code(self) -> u8 {
        match self {
            Self::Application => 0x01,
            Self::HostDownload => 0x02,
            Self::RomBootloader => 0x04,
            Self::Bootloader => 0x0B,
            Self::TddiBootloader => 0x0C,
            Self::TddiHostDownload => 0x0D,
            Self::Unknown(v) => v,
        }
    }

    /// True for any of the bootloader variants.
    pub fn is_bootloader(self) -> bool {
        matches!(
            self,
            Self::RomBootloader | Self::Bootloader | Self::TddiBootloader
        )
    }

    /// True when the application firmware is running.
    pub fn is_application(self) -> bool {
        matches!(self, Self::Application)
    }
}

/// Status word of the application firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    /// Application running normally.
    Ok,
    /// Application still booting.
    Booting,
    /// Configuration update in progress.
    Updating,
    /// Application refused its configuration area.
    BadAppConfig,
    /// Unrecognized status word.
    Unknown(u16),
}

impl From<u16> for AppStatus {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => Self::Ok,
            0x0001 => Self::Booting,
            0x0002 => Self::Updating,
            0xFFFF => Self::BadAppConfig,
            v => Self::Unknown(v),
        }
    }
}

/// Identification packet: who the device is and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentificationInfo {
    /// Packet version.
    pub version: u8,
    /// Firmware currently running.
    pub mode: FirmwareMode,
    /// Part number string, NUL-trimmed.
    pub part_number: String,
    /// Firmware build id.
    pub build_id: u32,
    /// Largest write the bus interface accepts, 0 meaning unbounded.
    pub max_write_size: u16,
}

impl IdentificationInfo {
    /// Minimum packet length: version, mode, part number, build id and
    /// maximum write size.
    pub const MIN_LEN: usize = 2 + PART_NUMBER_SIZE + 4 + 2;

    /// Decode an identification packet.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_LEN {
            return Err(Error::Protocol(format!(
                "identification packet too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let version = cursor.read_u8()?;
        let mode = FirmwareMode::from(cursor.read_u8()?);

        let mut part_number = [0u8; PART_NUMBER_SIZE];
        std::io::Read::read_exact(&mut cursor, &mut part_number)?;
        let part_number = trim_fixed_string(&part_number);

        let build_id = cursor.read_u32::<LittleEndian>()?;
        let max_write_size = cursor.read_u16::<LittleEndian>()?;

        Ok(Self {
            version,
            mode,
            part_number,
            build_id,
            max_write_size,
        })
    }
}

/// Application information packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    /// Packet version.
    pub version: u16,
    /// Application status word.
    pub status: AppStatus,
    /// Size of the static configuration, in bytes.
    pub static_config_size: u16,
    /// Size of the dynamic configuration, in bytes.
    pub dynamic_config_size: u16,
    /// First write block of the application configuration area.
    pub app_config_start_write_block: u16,
    /// Size of the application configuration area, in bytes.
    pub app_config_size: u16,
    /// Largest accepted touch report descriptor.
    pub max_touch_report_config_size: u16,
    /// Largest touch report payload the firmware generates.
    pub max_touch_report_payload_size: u16,
    /// Customer configuration id. The four leading bytes carry the
    /// IC variant, project, panel and firmware version markers.
    pub customer_config_id: [u8; CONFIG_ID_SIZE],
    /// Sensor maximum X coordinate.
    pub max_x: u16,
    /// Sensor maximum Y coordinate.
    pub max_y: u16,
    /// Maximum number of tracked objects.
    pub max_objects: u16,
    /// Number of physical buttons.
    pub num_of_buttons: u16,
    /// Sensing image rows.
    pub num_of_image_rows: u16,
    /// Sensing image columns.
    pub num_of_image_cols: u16,
}

impl ApplicationInfo {
    /// Minimum packet length through the image geometry fields.
    pub const MIN_LEN: usize = 16 + CONFIG_ID_SIZE + 12;

    /// Decode an application information packet.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_LEN {
            return Err(Error::Protocol(format!(
                "application info packet too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let version = cursor.read_u16::<LittleEndian>()?;
        let status = AppStatus::from(cursor.read_u16::<LittleEndian>()?);
        let static_config_size = cursor.read_u16::<LittleEndian>()?;
        let dynamic_config_size = cursor.read_u16::<LittleEndian>()?;
        let app_config_start_write_block = cursor.read_u16::<LittleEndian>()?;
        let app_config_size = cursor.read_u16::<LittleEndian>()?;
        let max_touch_report_config_size = cursor.read_u16::<LittleEndian>()?;
        let max_touch_report_payload_size = cursor.read_u16::<LittleEndian>()?;

        let mut customer_config_id = [0u8; CONFIG_ID_SIZE];
        std::io::Read::read_exact(&mut cursor, &mut customer_config_id)?;

        let max_x = cursor.read_u16::<LittleEndian>()?;
        let max_y = cursor.read_u16::<LittleEndian>()?;
        let max_objects = cursor.read_u16::<LittleEndian>()?;
        let num_of_buttons = cursor.read_u16::<LittleEndian>()?;
        let num_of_image_rows = cursor.read_u16::<LittleEndian>()?;
        let num_of_image_cols = cursor.read_u16::<LittleEndian>()?;

        Ok(Self {
            version,
            status,
            static_config_size,
            dynamic_config_size,
            app_config_start_write_block,
            app_config_size,
            max_touch_report_config_size,
            max_touch_report_payload_size,
            customer_config_id,
            max_x,
            max_y,
            max_objects,
            num_of_buttons,
            num_of_image_rows,
            num_of_image_cols,
        })
    }
}

/// Boot information packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfo {
    /// Packet version.
    pub version: u8,
    /// Bootloader status byte.
    pub status: u8,
    /// ASIC identifier.
    pub asic_id: u16,
    /// Flash write block size, in 16-bit words.
    pub write_block_size_words: u8,
    /// Flash erase page size, in 16-bit words.
    pub erase_page_size_words: u16,
    /// Largest flash-write payload the bootloader accepts, in bytes.
    pub max_write_payload_size: u16,
    /// Reason code of the last reset.
    pub last_reset_reason: u8,
    /// Program counter captured at the last reset.
    pub pc_at_time_of_last_reset: u16,
    /// First block of the boot configuration area.
    pub boot_config_start_block: u16,
    /// Size of the boot configuration area, in blocks.
    pub boot_config_size_blocks: u16,
    /// First block of the display configuration area.
    pub display_config_start_block: u32,
    /// Size of the display configuration area, in blocks.
    pub display_config_size_blocks: u16,
}

impl BootInfo {
    /// Minimum packet length through the display configuration fields.
    pub const MIN_LEN: usize = 22;

    /// Decode a boot information packet.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_LEN {
            return Err(Error::Protocol(format!(
                "boot info packet too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let version = cursor.read_u8()?;
        let status = cursor.read_u8()?;
        let asic_id = cursor.read_u16::<LittleEndian>()?;
        let write_block_size_words = cursor.read_u8()?;
        let erase_page_size_words = cursor.read_u16::<LittleEndian>()?;
        let max_write_payload_size = cursor.read_u16::<LittleEndian>()?;
        let last_reset_reason = cursor.read_u8()?;
        let pc_at_time_of_last_reset = cursor.read_u16::<LittleEndian>()?;
        let boot_config_start_block = cursor.read_u16::<LittleEndian>()?;
        let boot_config_size_blocks = cursor.read_u16::<LittleEndian>()?;
        let display_config_start_block = cursor.read_u32::<LittleEndian>()?;
        let display_config_size_blocks = cursor.read_u16::<LittleEndian>()?;

        Ok(Self {
            version,
            status,
            asic_id,
            write_block_size_words,
            erase_page_size_words,
            max_write_payload_size,
            last_reset_reason,
            pc_at_time_of_last_reset,
            boot_config_start_block,
            boot_config_size_blocks,
            display_config_start_block,
            display_config_size_blocks,
        })
    }

    /// Flash write block size in bytes (the packet counts 16-bit words).
    pub fn write_block_size_bytes(&self) -> u32 {
        u32::from(self.write_block_size_words) * 2
    }

    /// Flash erase page size in bytes (the packet counts 16-bit words).
    pub fn erase_page_size_bytes(&self) -> u32 {
        u32::from(self.erase_page_size_words) * 2
    }
}

/// NUL-trim a fixed-size string field.
fn trim_fixed_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id_packet() -> Vec<u8> {
        let mut data = vec![0x01, 0x01];
        data.extend_from_slice(b"TD4375\0\0\0\0\0\0\0\0\0\0");
        data.extend_from_slice(&0x00C0FFEEu32.to_le_bytes());
        data.extend_from_slice(&256u16.to_le_bytes());
        data
    }

    #[test]
    fn test_parse_identification() {
        let info = IdentificationInfo::parse(&sample_id_packet()).unwrap();
        assert_eq!(info.version, 1);
        assert_eq!(info.mode, FirmwareMode::Application);
        assert_eq!(info.part_number, "TD4375");
        assert_eq!(info.build_id, 0x00C0FFEE);
        assert_eq!(info.max_write_size, 256);
    }

    #[test]
    fn test_parse_identification_short() {
        assert!(IdentificationInfo::parse(&[0x01, 0x01, 0x41]).is_err());
    }

    #[test]
    fn test_firmware_mode_classification() {
        assert!(FirmwareMode::from(0x01).is_application());
        assert!(FirmwareMode::from(0x0B).is_bootloader());
        assert!(FirmwareMode::from(0x04).is_bootloader());
        assert!(!FirmwareMode::from(0x02).is_bootloader());
        assert_eq!(FirmwareMode::from(0x7E), FirmwareMode::Unknown(0x7E));
    }

    #[test]
    fn test_app_status_words() {
        assert_eq!(AppStatus::from(0x0000), AppStatus::Ok);
        assert_eq!(AppStatus::from(0x0001), AppStatus::Booting);
        assert_eq!(AppStatus::from(0xFFFF), AppStatus::BadAppConfig);
        assert_eq!(AppStatus::from(0x1234), AppStatus::Unknown(0x1234));
    }

    #[test]
    fn test_parse_application_info() {
        let mut data = Vec::new();
        for field in [2u16, 0, 100, 40, 0x80, 256, 128, 256] {
            data.extend_from_slice(&field.to_le_bytes());
        }
        let mut config_id = [0u8; CONFIG_ID_SIZE];
        config_id[..4].copy_from_slice(&[0x41, 0x12, 0x07, 0x05]);
        data.extend_from_slice(&config_id);
        for field in [1080u16, 2340, 10, 0, 18, 32] {
            data.extend_from_slice(&field.to_le_bytes());
        }

        let info = ApplicationInfo::parse(&data).unwrap();
        assert_eq!(info.status, AppStatus::Ok);
        assert_eq!(info.customer_config_id[..4], [0x41, 0x12, 0x07, 0x05]);
        assert_eq!(info.max_x, 1080);
        assert_eq!(info.max_y, 2340);
        assert_eq!(info.num_of_image_rows, 18);
        assert_eq!(info.num_of_image_cols, 32);
    }

    #[test]
    fn test_parse_boot_info_sizes() {
        let data: Vec<u8> = vec![
            0x01, 0x00, // version, status
            0x21, 0x43, // asic id
            0x08, // write block size: 8 words
            0x00, 0x04, // erase page size: 0x0400 words
            0x00, 0x02, // max write payload: 512 bytes
            0x05, // last reset reason
            0x00, 0x00, // pc at reset
            0x10, 0x00, // boot config start block
            0x04, 0x00, // boot config size
            0x00, 0x10, 0x00, 0x00, // display config start block
            0x20, 0x00, // display config size
        ];
        let info = BootInfo::parse(&data).unwrap();
        assert_eq!(info.write_block_size_bytes(), 16);
        assert_eq!(info.erase_page_size_bytes(), 2048);
        assert_eq!(info.max_write_payload_size, 512);
        assert_eq!(info.display_config_start_block, 0x1000);
    }
}
