//! Firmware image container.
//!
//! A firmware image bundles the content of one or more flash areas:
//!
//! ```text
//! +--------------------------+
//! |  Header (8B)             |  magic, area count
//! +--------------------------+
//! |  Offset[0] .. Offset[n]  |  u32 le, one per area
//! +--------------------------+
//! |  AreaDescriptor (36B)    |  magic, id string, flags,
//! |  Area content            |  address, length, checksum
//! +--------------------------+
//! |  AreaDescriptor (36B)    |
//! |  Area content            |
//! +--------------------------+
//! ```
//!
//! Every descriptor names its area with a fixed 16-byte string and guards
//! the content with a CRC-32. A failed checksum excludes that area from
//! flashing but is not a parse error; a wrong header or descriptor magic is.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, warn};

use crate::error::{Error, Result};

/// Magic opening the image container.
pub const IMAGE_MAGIC: u32 = 0x4818472B;

/// Magic opening every area descriptor.
pub const AREA_MAGIC: u32 = 0x7C05E516;

/// Size of the container header.
pub const IMAGE_HEADER_SIZE: usize = 8;

/// Size of an area descriptor.
pub const AREA_DESCRIPTOR_SIZE: usize = 36;

/// Fixed width of the area id string field.
pub const AREA_ID_SIZE: usize = 16;

/// Sanity cap on the descriptor count.
pub const MAX_AREAS: usize = 64;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of a flash area's content (all-ones seed, all-ones final xor).
pub fn area_checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// The named flash areas a firmware image can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaKind {
    /// Bootloader code.
    BootCode,
    /// Bootloader configuration.
    BootConfig,
    /// Application firmware code.
    AppCode,
    /// Application configuration.
    AppConfig,
    /// Production test firmware.
    ProdTest,
    /// Display configuration.
    DisplayConfig,
    /// ROM-bootloader application code.
    RombootAppCode,
    /// Open/short test tuning data.
    OpenShortTuning,
}

impl AreaKind {
    /// Match a NUL-trimmed descriptor id string.
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "BOOT CODE" => Some(Self::BootCode),
            "BOOT CONFIG" => Some(Self::BootConfig),
            "APP CODE" => Some(Self::AppCode),
            "APP CONFIG" => Some(Self::AppConfig),
            "PROD TEST" => Some(Self::ProdTest),
            "ROMBOOT APP CODE" => Some(Self::RombootAppCode),
            s if s.starts_with("DISPLAY") => Some(Self::DisplayConfig),
            s if s.starts_with("OPEN SHORT") => Some(Self::OpenShortTuning),
            _ => None,
        }
    }

    /// Canonical area name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BootCode => "BOOT CODE",
            Self::BootConfig => "BOOT CONFIG",
            Self::AppCode => "APP CODE",
            Self::AppConfig => "APP CONFIG",
            Self::ProdTest => "PROD TEST",
            Self::DisplayConfig => "DISPLAY",
            Self::RombootAppCode => "ROMBOOT APP CODE",
            Self::OpenShortTuning => "OPEN SHORT",
        }
    }
}

impl std::fmt::Display for AreaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One flash area whose checksum verified.
#[derive(Debug, Clone)]
pub struct FlashArea<'a> {
    /// Which area this is.
    pub kind: AreaKind,
    /// Id string as stored in the descriptor.
    pub id: String,
    /// Descriptor flag word.
    pub flags: u32,
    /// Flash byte address the content belongs at.
    pub flash_addr: u32,
    /// Stored (and verified) CRC-32 of the content.
    pub checksum: u32,
    /// Area content, borrowed from the image bytes.
    pub data: &'a [u8],
}

/// An area excluded because its stored checksum did not match.
#[derive(Debug, Clone)]
pub struct ChecksumFailure {
    /// Id string of the failed area.
    pub id: String,
    /// Checksum stored in the descriptor.
    pub expected: u32,
    /// Checksum recomputed over the content.
    pub actual: u32,
}

/// Parsed firmware image.
pub struct FirmwareImage<'a> {
    areas: Vec<FlashArea<'a>>,
    failures: Vec<ChecksumFailure>,
    ignored: Vec<String>,
}

impl<'a> FirmwareImage<'a> {
    /// Parse an image container.
    ///
    /// Checksum mismatches exclude the affected area and are reported via
    /// [`FirmwareImage::checksum_failures`]; structural problems (bad
    /// magics, truncation) abort the parse.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < IMAGE_HEADER_SIZE {
            return Err(Error::InvalidImage(format!(
                "file too small for header: {} bytes",
                data.len()
            )));
        }

        let magic = LittleEndian::read_u32(&data[0..4]);
        if magic != IMAGE_MAGIC {
            return Err(Error::InvalidImage(format!(
                "bad container magic {magic:#010x}, expected {IMAGE_MAGIC:#010x}"
            )));
        }

        let area_count = LittleEndian::read_u32(&data[4..8]) as usize;
        if area_count == 0 || area_count > MAX_AREAS {
            return Err(Error::InvalidImage(format!(
                "implausible area count {area_count}"
            )));
        }

        let offsets_end = IMAGE_HEADER_SIZE + area_count * 4;
        if data.len() < offsets_end {
            return Err(Error::InvalidImage(
                "file too small for offset table".to_string(),
            ));
        }

        let mut image = Self {
            areas: Vec::with_capacity(area_count),
            failures: Vec::new(),
            ignored: Vec::new(),
        };

        for index in 0..area_count {
            let entry = IMAGE_HEADER_SIZE + index * 4;
            let offset = LittleEndian::read_u32(&data[entry..entry + 4]) as usize;
            image.parse_area(data, index, offset)?;
        }

        debug!(
            "image: {} area(s), {} checksum failure(s), {} ignored",
            image.areas.len(),
            image.failures.len(),
            image.ignored.len()
        );

        Ok(image)
    }

    fn parse_area(&mut self, data: &'a [u8], index: usize, offset: usize) -> Result<()> {
        let end = offset.checked_add(AREA_DESCRIPTOR_SIZE);
        let Some(end) = end.filter(|end| *end <= data.len()) else {
            return Err(Error::InvalidImage(format!(
                "descriptor {index} out of bounds at offset {offset}"
            )));
        };
        let descriptor = &data[offset..end];

        let magic = LittleEndian::read_u32(&descriptor[0..4]);
        if magic != AREA_MAGIC {
            return Err(Error::InvalidImage(format!(
                "bad descriptor magic {magic:#010x} in descriptor {index}"
            )));
        }

        let id = trim_id(&descriptor[4..4 + AREA_ID_SIZE]);
        let flags = LittleEndian::read_u32(&descriptor[20..24]);
        let flash_addr_words = LittleEndian::read_u32(&descriptor[24..28]);
        let length = LittleEndian::read_u32(&descriptor[28..32]) as usize;
        let checksum = LittleEndian::read_u32(&descriptor[32..36]);

        let content_end = end.checked_add(length);
        let Some(content_end) = content_end.filter(|end| *end <= data.len()) else {
            return Err(Error::InvalidImage(format!(
                "content of area \"{id}\" out of bounds ({length} bytes at {end})"
            )));
        };
        let content = &data[end..content_end];

        let Some(kind) = AreaKind::from_id(&id) else {
            debug!("ignoring unknown flash area \"{id}\"");
            self.ignored.push(id);
            return Ok(());
        };

        let actual = area_checksum(content);
        if actual != checksum {
            warn!(
                "checksum mismatch in \"{id}\": stored {checksum:#010x}, computed {actual:#010x}"
            );
            self.failures.push(ChecksumFailure {
                id,
                expected: checksum,
                actual,
            });
            return Ok(());
        }

        let Some(flash_addr) = flash_addr_words.checked_mul(2) else {
            return Err(Error::InvalidImage(format!(
                "flash address overflow in area \"{id}\""
            )));
        };

        if self.area(kind).is_some() {
            warn!("duplicate flash area \"{id}\", keeping the first");
            return Ok(());
        }

        debug!(
            "area \"{id}\": {} bytes at {flash_addr:#010x}",
            content.len()
        );
        self.areas.push(FlashArea {
            kind,
            id,
            flags,
            flash_addr,
            checksum,
            data: content,
        });
        Ok(())
    }

    /// Look up a verified area.
    pub fn area(&self, kind: AreaKind) -> Option<&FlashArea<'a>> {
        self.areas.iter().find(|area| area.kind == kind)
    }

    /// All verified areas, in container order.
    pub fn areas(&self) -> &[FlashArea<'a>] {
        &self.areas
    }

    /// Areas excluded by checksum mismatch.
    pub fn checksum_failures(&self) -> &[ChecksumFailure] {
        &self.failures
    }

    /// Id strings of descriptors this library does not recognize.
    pub fn ignored_areas(&self) -> &[String] {
        &self.ignored
    }
}

impl std::fmt::Debug for FirmwareImage<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("areas", &self.areas.iter().map(|a| &a.id).collect::<Vec<_>>())
            .field("failures", &self.failures)
            .field("ignored", &self.ignored)
            .finish()
    }
}

/// Size of the header embedded in the application configuration content.
pub const APP_CONFIG_HEADER_SIZE: usize = 36;

/// Header at the start of the application configuration area content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppConfigHeader {
    /// Build id of the firmware the configuration belongs to.
    pub build_id: u32,
    /// Customer configuration id. The four leading bytes carry the
    /// IC variant, project, panel and firmware version markers.
    pub customer_config_id: [u8; 16],
}

impl AppConfigHeader {
    /// Decode the header from application configuration content.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < APP_CONFIG_HEADER_SIZE {
            return Err(Error::InvalidImage(format!(
                "app config content too short for its header: {} bytes",
                data.len()
            )));
        }
        let build_id = LittleEndian::read_u32(&data[16..20]);
        let mut customer_config_id = [0u8; 16];
        customer_config_id.copy_from_slice(&data[20..36]);
        Ok(Self {
            build_id,
            customer_config_id,
        })
    }
}

/// NUL-trim a fixed-size id field.
fn trim_id(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&c| c == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::image_builder::ImageBuilder;

    #[test]
    fn test_crc_check_value() {
        // standard CRC-32/ISO-HDLC check value
        assert_eq!(area_checksum(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn test_parse_two_areas() {
        let bytes = ImageBuilder::new()
            .area("APP CODE", 0x1000, &[0xAA; 64])
            .area("APP CONFIG", 0x8000, &[0x55; 32])
            .build();

        let image = FirmwareImage::parse(&bytes).unwrap();
        assert_eq!(image.areas().len(), 2);

        let code = image.area(AreaKind::AppCode).unwrap();
        assert_eq!(code.data, &[0xAA; 64]);
        // descriptor addresses count 16-bit words
        assert_eq!(code.flash_addr, 0x2000);

        let config = image.area(AreaKind::AppConfig).unwrap();
        assert_eq!(config.flash_addr, 0x10000);
        assert!(image.checksum_failures().is_empty());
    }

    #[test]
    fn test_bad_container_magic_is_fatal() {
        let mut bytes = ImageBuilder::new().area("APP CODE", 0, &[1, 2, 3]).build();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            FirmwareImage::parse(&bytes),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_bad_descriptor_magic_is_fatal() {
        let mut bytes = ImageBuilder::new().area("APP CODE", 0, &[1, 2, 3]).build();
        // first descriptor lives right after the header and offset table
        let descriptor_offset = IMAGE_HEADER_SIZE + 4;
        bytes[descriptor_offset] ^= 0xFF;
        assert!(matches!(
            FirmwareImage::parse(&bytes),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_checksum_mismatch_excludes_area_only() {
        let bytes = ImageBuilder::new()
            .area("APP CODE", 0x1000, &[0xAA; 16])
            .area_with_checksum("APP CONFIG", 0x8000, &[0x55; 16], 0xDEADBEEF)
            .build();

        let image = FirmwareImage::parse(&bytes).unwrap();
        assert!(image.area(AreaKind::AppCode).is_some());
        assert!(image.area(AreaKind::AppConfig).is_none());

        let failures = image.checksum_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "APP CONFIG");
        assert_eq!(failures[0].expected, 0xDEADBEEF);
    }

    #[test]
    fn test_unknown_area_ignored() {
        let bytes = ImageBuilder::new()
            .area("APP CODE", 0, &[1])
            .area("CUSTOM OEM BLOB", 0, &[2])
            .build();

        let image = FirmwareImage::parse(&bytes).unwrap();
        assert_eq!(image.areas().len(), 1);
        assert_eq!(image.ignored_areas(), &["CUSTOM OEM BLOB".to_string()]);
    }

    #[test]
    fn test_truncated_content_is_fatal() {
        let mut bytes = ImageBuilder::new().area("APP CODE", 0, &[7; 32]).build();
        bytes.truncate(bytes.len() - 8);
        assert!(matches!(
            FirmwareImage::parse(&bytes),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_display_prefix_matching() {
        assert_eq!(
            AreaKind::from_id("DISPLAY CONFIG"),
            Some(AreaKind::DisplayConfig)
        );
        assert_eq!(AreaKind::from_id("DISPLAY"), Some(AreaKind::DisplayConfig));
        assert_eq!(AreaKind::from_id("BOOT CONFIG"), Some(AreaKind::BootConfig));
        assert_eq!(AreaKind::from_id("SOMETHING ELSE"), None);
    }

    #[test]
    fn test_app_config_header_decode() {
        let mut content = vec![0u8; 64];
        content[16..20].copy_from_slice(&0x00113355u32.to_le_bytes());
        content[20..24].copy_from_slice(&[0x41, 0x12, 0x07, 0x09]);

        let header = AppConfigHeader::parse(&content).unwrap();
        assert_eq!(header.build_id, 0x00113355);
        assert_eq!(header.customer_config_id[..4], [0x41, 0x12, 0x07, 0x09]);
    }

    #[test]
    fn test_app_config_header_too_short() {
        assert!(AppConfigHeader::parse(&[0u8; 20]).is_err());
    }
}
