//! Firmware reflash engine.
//!
//! Rewrites the controller's flash through the bootloader command set:
//! identify the device, switch it into the bootloader if needed, fetch the
//! boot information packet, decide which areas of the image are worth
//! flashing, then erase and write each of them with bus-imposed chunk and
//! timing limits. The whole sequence is retried from the top, including a
//! device reset, when any step fails; a failed attempt's partial flash
//! content is simply overwritten by the next attempt's erase.

use log::{debug, error, info, warn};

use crate::device::info::{AppStatus, BootInfo};
use crate::device::Connection;
use crate::error::{Error, Result};
use crate::image::{AppConfigHeader, AreaKind, FirmwareImage, FlashArea};
use crate::protocol::message::Command;
use crate::protocol::ResponseDelay;

/// Full update sequence attempts before giving up.
const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// Default settle time granted per erased flash page.
const DEFAULT_ERASE_DELAY_PER_PAGE_MS: u32 = 20;

/// Default settle time granted per written flash block.
const DEFAULT_WRITE_DELAY_PER_BLOCK_MS: u32 = 20;

/// Erase and write settle timing.
#[derive(Debug, Clone)]
pub struct FlashTiming {
    /// Milliseconds granted per erased page.
    pub erase_delay_per_page_ms: u32,
    /// Milliseconds granted per written block.
    pub write_delay_per_block_ms: u32,
    /// Let the attention-driven reader deliver flash responses instead of
    /// waiting out computed delays.
    pub attn_driven: bool,
}

impl Default for FlashTiming {
    fn default() -> Self {
        Self {
            erase_delay_per_page_ms: DEFAULT_ERASE_DELAY_PER_PAGE_MS,
            write_delay_per_block_ms: DEFAULT_WRITE_DELAY_PER_BLOCK_MS,
            attn_driven: false,
        }
    }
}

/// What the identity comparison decided to rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDecision {
    /// Device firmware is current (or the image targets other hardware).
    None,
    /// Firmware binary is unchanged; only the configuration is rewritten.
    ConfigOnly,
    /// Both the firmware binary and its configuration are rewritten.
    FirmwareAndConfig,
}

/// Result of a completed update run.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// The decision the identity comparison reached.
    pub decision: UpdateDecision,
    /// Areas actually written, in flash order.
    pub written: Vec<AreaKind>,
    /// Attempts the sequence needed.
    pub attempts: u32,
}

/// Progress callback: area name, bytes written, bytes total.
pub type Progress<'p> = &'p mut dyn FnMut(&str, usize, usize);

/// Compare the device identity against the image identity.
///
/// The four leading customer-config-id bytes carry, in order, the IC
/// variant, the project, the panel and the firmware version. Wrong IC or
/// panel means the image targets other hardware; a different project always
/// reflashes; otherwise the version bytes decide. A newer version with an
/// identical firmware build id means the binary itself is unchanged and
/// only the configuration needs rewriting.
pub fn compare_identity(
    device_config_id: [u8; 4],
    device_build_id: u32,
    image_config_id: [u8; 4],
    image_build_id: u32,
) -> UpdateDecision {
    if device_config_id[0] != image_config_id[0] || device_config_id[2] != image_config_id[2] {
        warn!(
            "image targets other hardware (device {device_config_id:02x?}, image {image_config_id:02x?})"
        );
        return UpdateDecision::None;
    }

    if device_config_id[1] != image_config_id[1] {
        info!("project changed, full update");
        return UpdateDecision::FirmwareAndConfig;
    }

    if image_config_id[3] > device_config_id[3] {
        if image_build_id == device_build_id {
            info!(
                "configuration version {} -> {}, firmware binary unchanged",
                device_config_id[3], image_config_id[3]
            );
            UpdateDecision::ConfigOnly
        } else {
            info!(
                "firmware version {} -> {}",
                device_config_id[3], image_config_id[3]
            );
            UpdateDecision::FirmwareAndConfig
        }
    } else {
        debug!(
            "device version {} not older than image version {}",
            device_config_id[3], image_config_id[3]
        );
        UpdateDecision::None
    }
}

/// Drives the reflash sequence on one connection.
pub struct FirmwareUpdater<'c> {
    conn: &'c Connection,
    timing: FlashTiming,
    force: bool,
}

impl<'c> FirmwareUpdater<'c> {
    /// Create an updater with default timing.
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            timing: FlashTiming::default(),
            force: false,
        }
    }

    /// Override the erase/write settle timing.
    #[must_use]
    pub fn with_timing(mut self, timing: FlashTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Reflash regardless of what the identity comparison says.
    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Run the update sequence, retrying from the top on failure.
    pub fn run(&self, image_bytes: &[u8], progress: Progress) -> Result<UpdateOutcome> {
        let image = FirmwareImage::parse(image_bytes)?;
        let mut stage = String::from("identify");

        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            if attempt > 1 {
                warn!("retrying firmware update (attempt {attempt}/{MAX_UPDATE_ATTEMPTS})");
                if let Err(err) = self.conn.reset_device() {
                    warn!("device reset between attempts failed: {err}");
                }
            }

            match self.try_update(&image, &mut *progress, &mut stage) {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    return Ok(outcome);
                }
                // image defects cannot improve with retries
                Err(err @ (Error::InvalidImage(_) | Error::ChecksumMismatch { .. })) => {
                    return Err(err);
                }
                Err(err) => {
                    warn!("firmware update attempt {attempt} failed at {stage}: {err}");
                }
            }
        }

        error!(
            "firmware update exhausted its retries; the device may be left \
             in bootloader mode and needs attention"
        );
        Err(Error::UpdateFailed {
            area: stage,
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    fn try_update(
        &self,
        image: &FirmwareImage<'_>,
        progress: Progress,
        stage: &mut String,
    ) -> Result<UpdateOutcome> {
        "identify".clone_into(stage);
        let id_info = self.conn.identify()?;

        let mut force = self.force;
        if id_info.mode.is_bootloader() {
            info!("device is already in bootloader mode, forcing update");
            force = true;
        }

        let mut device_config_id = None;
        if id_info.mode.is_application() {
            let app_info = self.conn.get_app_info()?;
            if app_info.status == AppStatus::BadAppConfig {
                warn!("application reports a bad configuration, forcing update");
                force = true;
            }
            let mut leading = [0u8; 4];
            leading.copy_from_slice(&app_info.customer_config_id[..4]);
            device_config_id = Some(leading);
        }

        let decision = if force {
            UpdateDecision::FirmwareAndConfig
        } else {
            let config_area = self.required_area(image, AreaKind::AppConfig)?;
            let header = AppConfigHeader::parse(config_area.data)?;
            let mut image_config_id = [0u8; 4];
            image_config_id.copy_from_slice(&header.customer_config_id[..4]);

            match device_config_id {
                Some(device_id) => {
                    compare_identity(device_id, id_info.build_id, image_config_id, header.build_id)
                }
                // neither application nor bootloader answered; rewrite
                None => UpdateDecision::FirmwareAndConfig,
            }
        };

        if decision == UpdateDecision::None {
            info!("device firmware is up to date");
            return Ok(UpdateOutcome {
                decision,
                written: Vec::new(),
                attempts: 0,
            });
        }

        if self
            .conn
            .firmware_mode()
            .is_some_and(|mode| mode.is_application())
        {
            "enter bootloader".clone_into(stage);
            self.conn.run_bootloader_firmware()?;
            if !self
                .conn
                .firmware_mode()
                .is_some_and(|mode| mode.is_bootloader())
            {
                return Err(Error::Protocol(
                    "device did not enter bootloader mode".to_string(),
                ));
            }
        }

        "boot info".clone_into(stage);
        let boot_info = self.conn.get_boot_info()?;

        let mut written = Vec::new();
        for kind in self.target_areas(decision) {
            let area = match image.area(kind) {
                Some(area) => area,
                // the display area is optional equipment
                None if kind == AreaKind::DisplayConfig => continue,
                // reports whether the area was absent or checksum-gated
                None => self.required_area(image, kind)?,
            };

            if area.data.is_empty() {
                debug!("area {kind} is empty, skipping");
                continue;
            }

            kind.as_str().clone_into(stage);
            self.update_area(area, &boot_info, &mut *progress)?;
            written.push(kind);
        }

        "run application firmware".clone_into(stage);
        self.conn.run_application_firmware()?;
        if !self
            .conn
            .firmware_mode()
            .is_some_and(|mode| mode.is_application())
        {
            warn!("device did not come back in application mode");
        }

        "reset".clone_into(stage);
        self.conn.soft_reset()?;

        info!("firmware update complete: wrote {written:?}");
        Ok(UpdateOutcome {
            decision,
            written,
            attempts: 0,
        })
    }

    /// Areas a decision requires, in flash order.
    fn target_areas(&self, decision: UpdateDecision) -> Vec<AreaKind> {
        match decision {
            UpdateDecision::None => Vec::new(),
            UpdateDecision::ConfigOnly => vec![AreaKind::AppConfig],
            UpdateDecision::FirmwareAndConfig => vec![
                AreaKind::AppCode,
                AreaKind::AppConfig,
                AreaKind::DisplayConfig,
            ],
        }
    }

    /// Fetch an area the decision cannot proceed without, distinguishing
    /// "never in the image" from "excluded by checksum".
    fn required_area<'i, 'a>(
        &self,
        image: &'i FirmwareImage<'a>,
        kind: AreaKind,
    ) -> Result<&'i FlashArea<'a>> {
        if let Some(area) = image.area(kind) {
            return Ok(area);
        }
        if let Some(failure) = image
            .checksum_failures()
            .iter()
            .find(|failure| AreaKind::from_id(&failure.id) == Some(kind))
        {
            return Err(Error::ChecksumMismatch {
                area: failure.id.clone(),
                expected: failure.expected,
                actual: failure.actual,
            });
        }
        Err(Error::InvalidImage(format!("image carries no {kind} area")))
    }

    fn update_area(
        &self,
        area: &FlashArea<'_>,
        boot_info: &BootInfo,
        progress: Progress,
    ) -> Result<()> {
        self.erase_area(area, boot_info)?;
        self.write_area(area, boot_info, progress)
    }

    #[allow(clippy::cast_possible_truncation)] // page numbers are range-checked
    fn erase_area(&self, area: &FlashArea<'_>, boot_info: &BootInfo) -> Result<()> {
        let page_size = boot_info.erase_page_size_bytes();
        if page_size == 0 {
            return Err(Error::Protocol(
                "device reports a zero erase page size".to_string(),
            ));
        }

        let page_start = area.flash_addr / page_size;
        let page_count = (area.data.len() as u32).div_ceil(page_size);
        if page_start > 0xFFFF || page_count > 0xFFFF {
            return Err(Error::InvalidImage(format!(
                "area {} lies beyond addressable flash",
                area.kind
            )));
        }

        info!(
            "erasing {}: {page_count} page(s) from page {page_start}",
            area.kind
        );

        // the short erase form addresses one byte per field
        let payload: Vec<u8> = if page_start > 0xFF || page_count > 0xFF {
            let mut wide = Vec::with_capacity(4);
            wide.extend_from_slice(&(page_start as u16).to_le_bytes());
            wide.extend_from_slice(&(page_count as u16).to_le_bytes());
            wide
        } else {
            vec![page_start as u8, page_count as u8]
        };

        let delay = if self.timing.attn_driven {
            ResponseDelay::AttnDriven
        } else {
            ResponseDelay::Millis(
                self.timing
                    .erase_delay_per_page_ms
                    .saturating_mul(page_count),
            )
        };

        self.conn.send_command(Command::EraseFlash, &payload, delay)?;
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)] // block numbers are range-checked
    fn write_area(
        &self,
        area: &FlashArea<'_>,
        boot_info: &BootInfo,
        progress: Progress,
    ) -> Result<()> {
        let block_size = boot_info.write_block_size_bytes();
        if block_size == 0 {
            return Err(Error::Protocol(
                "device reports a zero write block size".to_string(),
            ));
        }
        if area.flash_addr % block_size != 0 {
            return Err(Error::InvalidImage(format!(
                "area {} is not write-block aligned",
                area.kind
            )));
        }

        // chunk size is the bootloader's payload limit rounded down to a
        // whole number of blocks
        let max_payload = u32::from(boot_info.max_write_payload_size);
        let chunk_bytes = if max_payload < block_size {
            block_size
        } else {
            max_payload - max_payload % block_size
        };
        let chunk_bytes = chunk_bytes as usize;

        let start_block = area.flash_addr / block_size;
        let total = area.data.len();
        info!(
            "writing {}: {total} bytes in chunks of {chunk_bytes}",
            area.kind
        );

        let mut offset = 0usize;
        while offset < total {
            let chunk = &area.data[offset..(offset + chunk_bytes).min(total)];
            let block = start_block + (offset as u32) / block_size;
            if block > 0xFFFF {
                return Err(Error::InvalidImage(format!(
                    "area {} write lies beyond addressable flash",
                    area.kind
                )));
            }

            let mut payload = Vec::with_capacity(2 + chunk.len());
            payload.extend_from_slice(&(block as u16).to_le_bytes());
            payload.extend_from_slice(chunk);

            let blocks_in_chunk = (chunk.len() as u32).div_ceil(block_size);
            let delay = if self.timing.attn_driven {
                ResponseDelay::AttnDriven
            } else {
                ResponseDelay::Millis(
                    self.timing
                        .write_delay_per_block_ms
                        .saturating_mul(blocks_in_chunk),
                )
            };

            self.conn.send_command(Command::WriteFlash, &payload, delay)?;
            offset += chunk.len();
            progress(area.kind.as_str(), offset, total);
        }

        Ok(())
    }
}

/// Run a firmware update without progress reporting.
pub fn run_firmware_update(
    conn: &Connection,
    image_bytes: &[u8],
    timing: FlashTiming,
    force: bool,
) -> Result<UpdateOutcome> {
    FirmwareUpdater::new(conn)
        .with_timing(timing)
        .with_force(force)
        .run(image_bytes, &mut |_, _, _| {})
}
