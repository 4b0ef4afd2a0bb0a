//! Device connection: command correlation and identity tracking.
//!
//! A [`Connection`] owns the bus transport, the protocol codec selected at
//! setup time and the buffers shared between the command path and the
//! attention-driven read path. Exactly one command can be in flight per
//! device; the outer command lock serializes callers for the whole
//! write-and-wait span while a narrower bus lock covers only raw transfers,
//! letting the attention thread interleave between a command's write phase
//! and its response read.

pub mod buffer;
pub mod info;

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use crate::device::buffer::MsgBuffer;
use crate::device::info::{ApplicationInfo, AppStatus, BootInfo, FirmwareMode, IdentificationInfo};
use crate::error::{Error, Result};
use crate::protocol::message::{status, Command};
use crate::protocol::{ProtocolV1, ProtocolV2, ResponseDelay, WireProtocol};
use crate::transport::Transport;

/// Driver-side ceiling for the negotiated write chunk size.
const WRITE_CHUNK_CEILING: usize = 512;

/// Default read chunk size until the bus integration overrides it.
const DEFAULT_READ_CHUNK: usize = 512;

/// Default hard budget for a command response.
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 3000;

/// Settle time the device needs after a reset or firmware switch.
const RESET_DELAY_MS: u32 = 100;

/// Lock a mutex, riding over poisoning: the protected state stays usable
/// because every mutation is completed before guards drop.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of the single in-flight command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// No command in flight.
    Idle,
    /// A command was written and its response is pending.
    Busy,
    /// The command failed; the slot must be forced back to idle.
    Error,
}

/// Completion signal pairing the command state with a wakeup.
pub(crate) struct Completion {
    inner: Mutex<CompletionInner>,
    cond: Condvar,
}

struct CompletionInner {
    state: CommandState,
    signaled: bool,
}

impl Completion {
    fn new() -> Self {
        Self {
            inner: Mutex::new(CompletionInner {
                state: CommandState::Idle,
                signaled: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> CommandState {
        lock(&self.inner).state
    }

    /// Enter the busy state with a cleared signal.
    pub(crate) fn begin(&self) {
        let mut inner = lock(&self.inner);
        inner.state = CommandState::Busy;
        inner.signaled = false;
    }

    /// Clear the signal without touching the state.
    pub(crate) fn reset(&self) {
        lock(&self.inner).signaled = false;
    }

    /// Transition to `state` and wake the waiter.
    pub(crate) fn finish(&self, state: CommandState) {
        let mut inner = lock(&self.inner);
        inner.state = state;
        inner.signaled = true;
        drop(inner);
        self.cond.notify_all();
    }

    /// Unconditionally return the slot to idle.
    pub(crate) fn force_idle(&self) {
        lock(&self.inner).state = CommandState::Idle;
    }

    /// Block until the signal fires or `timeout` elapses. Returns whether
    /// the signal was observed.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let guard = lock(&self.inner);
        let (inner, _timed_out) = self
            .cond
            .wait_timeout_while(guard, timeout, |inner| !inner.signaled)
            .unwrap_or_else(PoisonError::into_inner);
        inner.signaled
    }
}

/// Per-frame bookkeeping shared between read and command paths.
#[derive(Debug)]
pub(crate) struct FrameState {
    /// Code byte of the most recent inbound frame.
    pub(crate) status_report_code: u8,
    /// Payload length of the most recent inbound frame.
    pub(crate) payload_length: usize,
    /// Status code handed to the waiting command.
    pub(crate) response_code: u8,
    /// Code of the most recent buffered report.
    pub(crate) report_code: u8,
}

impl Default for FrameState {
    fn default() -> Self {
        Self {
            status_report_code: status::INVALID,
            payload_length: 0,
            response_code: status::INVALID,
            report_code: status::INVALID,
        }
    }
}

/// Buffers, frame state and the completion signal of one connection.
pub(crate) struct MessageState {
    /// Freshly reassembled inbound frame (header + payload).
    pub(crate) in_buf: Mutex<MsgBuffer>,
    /// Outbound frame being chunked.
    pub(crate) out_buf: Mutex<MsgBuffer>,
    /// Scratch space for one continued-read chunk.
    pub(crate) temp_buf: Mutex<MsgBuffer>,
    /// Finalized response payload for the command caller.
    pub(crate) resp_buf: Mutex<MsgBuffer>,
    /// Finalized report payload for the report consumer.
    pub(crate) report_buf: Mutex<MsgBuffer>,
    /// Most recent frame metadata.
    pub(crate) frame: Mutex<FrameState>,
    /// Command completion signal.
    pub(crate) completion: Completion,
    command: AtomicU8,
}

impl MessageState {
    fn new() -> Self {
        Self {
            in_buf: Mutex::new(MsgBuffer::new()),
            out_buf: Mutex::new(MsgBuffer::new()),
            temp_buf: Mutex::new(MsgBuffer::new()),
            resp_buf: Mutex::new(MsgBuffer::new()),
            report_buf: Mutex::new(MsgBuffer::new()),
            frame: Mutex::new(FrameState::default()),
            completion: Completion::new(),
            command: AtomicU8::new(Command::None.code()),
        }
    }

    pub(crate) fn set_frame(&self, code: u8, payload_length: usize) {
        let mut frame = lock(&self.frame);
        frame.status_report_code = code;
        frame.payload_length = payload_length;
    }

    pub(crate) fn frame_code_and_len(&self) -> (u8, usize) {
        let frame = lock(&self.frame);
        (frame.status_report_code, frame.payload_length)
    }

    pub(crate) fn set_response_code(&self, code: u8) {
        lock(&self.frame).response_code = code;
    }

    pub(crate) fn response_code(&self) -> u8 {
        lock(&self.frame).response_code
    }

    pub(crate) fn set_report_code(&self, code: u8) {
        lock(&self.frame).report_code = code;
    }

    pub(crate) fn set_current_command(&self, command: Command) {
        self.command.store(command.code(), Ordering::Relaxed);
    }

    pub(crate) fn current_command(&self) -> Option<Command> {
        Command::from_code(self.command.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct IdentityCache {
    id_info: Option<IdentificationInfo>,
    app_info: Option<ApplicationInfo>,
    boot_info: Option<BootInfo>,
}

/// Connection to one touch controller.
pub struct Connection {
    transport: Mutex<Box<dyn Transport>>,
    protocol: Box<dyn WireProtocol>,
    cmd_lock: Mutex<()>,
    pub(crate) msg: MessageState,
    identity: Mutex<IdentityCache>,
    max_write_chunk: AtomicUsize,
    max_read_chunk: AtomicUsize,
    response_timeout_ms: AtomicU64,
}

impl Connection {
    /// Wrap a transport without probing the device. The first-generation
    /// protocol is assumed; use [`Connection::open`] to run detection.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            protocol: Box::new(ProtocolV1),
            cmd_lock: Mutex::new(()),
            msg: MessageState::new(),
            identity: Mutex::new(IdentityCache::default()),
            max_write_chunk: AtomicUsize::new(0),
            max_read_chunk: AtomicUsize::new(DEFAULT_READ_CHUNK),
            response_timeout_ms: AtomicU64::new(DEFAULT_RESPONSE_TIMEOUT_MS),
        }
    }

    /// Wrap a transport, detect the protocol generation and identify the
    /// device.
    pub fn open(transport: Box<dyn Transport>) -> Result<Self> {
        let mut conn = Self::new(transport);
        conn.detect_protocol()?;
        Ok(conn)
    }

    /// Probe the device and select the wire protocol for this connection's
    /// lifetime.
    fn detect_protocol(&mut self) -> Result<()> {
        match ProtocolV2::detect(self) {
            Ok(()) => {
                info!("protocol v2 device detected");
                self.protocol = Box::new(ProtocolV2);
                Ok(())
            }
            Err(err) => {
                debug!("protocol v2 probe: {err}");
                self.protocol = Box::new(ProtocolV1);
                self.detect_v1()
            }
        }
    }

    fn detect_v1(&self) -> Result<()> {
        // a freshly powered device pushes its identify report unsolicited
        let _ = self.read_and_dispatch();

        if self.identification().is_none() {
            if let Err(err) = self.identify() {
                debug!("identify command failed ({err}); falling back to reset");
                self.soft_reset()?;
            }
        }

        if self.identification().is_some() {
            Ok(())
        } else {
            Err(Error::Protocol("device did not identify".to_string()))
        }
    }

    // ---- locking helpers used by the codec ----

    pub(crate) fn lock_transport(&self) -> MutexGuard<'_, Box<dyn Transport>> {
        lock(&self.transport)
    }

    pub(crate) fn lock_buffer<'a>(&self, buf: &'a Mutex<MsgBuffer>) -> MutexGuard<'a, MsgBuffer> {
        lock(buf)
    }

    pub(crate) fn lock_command(&self) -> MutexGuard<'_, ()> {
        lock(&self.cmd_lock)
    }

    // ---- negotiated bus limits ----

    /// Largest write transaction, 0 meaning unbounded.
    pub fn max_write_chunk(&self) -> usize {
        self.max_write_chunk.load(Ordering::Relaxed)
    }

    /// Largest read transaction, 0 meaning unbounded.
    pub fn max_read_chunk(&self) -> usize {
        self.max_read_chunk.load(Ordering::Relaxed)
    }

    /// Override the read chunk limit imposed by the bus integration.
    pub fn set_max_read_chunk(&self, limit: usize) {
        self.max_read_chunk.store(limit, Ordering::Relaxed);
    }

    /// Hard budget a command waits for its response.
    #[allow(clippy::cast_possible_truncation)] // practical budgets are far below u64 millis
    pub fn set_response_timeout(&self, timeout: Duration) {
        self.response_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn response_timeout_ms(&self) -> u64 {
        self.response_timeout_ms.load(Ordering::Relaxed)
    }

    /// Record a fresh identification packet and renegotiate the write chunk
    /// size it advertises.
    pub(crate) fn apply_identification(&self, parsed: &IdentificationInfo) {
        let advertised = usize::from(parsed.max_write_size);
        let clamped = advertised.min(WRITE_CHUNK_CEILING);
        let max_write = if clamped == 0 { advertised } else { clamped };
        self.max_write_chunk.store(max_write, Ordering::Relaxed);

        info!(
            "device {}: build {}, mode {:?}, max write {}",
            parsed.part_number, parsed.build_id, parsed.mode, max_write
        );

        lock(&self.identity).id_info = Some(parsed.clone());
    }

    // ---- cached identity ----

    /// Most recent identification packet, if any arrived yet.
    pub fn identification(&self) -> Option<IdentificationInfo> {
        lock(&self.identity).id_info.clone()
    }

    /// Most recent application information packet.
    pub fn application_info(&self) -> Option<ApplicationInfo> {
        lock(&self.identity).app_info.clone()
    }

    /// Most recent boot information packet.
    pub fn boot_info(&self) -> Option<BootInfo> {
        lock(&self.identity).boot_info.clone()
    }

    /// Firmware the device most recently reported itself to be running.
    pub fn firmware_mode(&self) -> Option<FirmwareMode> {
        lock(&self.identity).id_info.as_ref().map(|info| info.mode)
    }

    fn ensure_application_mode(&self) -> Result<()> {
        match self.firmware_mode() {
            Some(mode) if mode.is_application() => Ok(()),
            mode => Err(Error::Unsupported(format!(
                "device is not running application firmware (mode {mode:?})"
            ))),
        }
    }

    // ---- command surface ----

    /// Send a command and return its response payload.
    ///
    /// Blocks until the response arrives, either through the attention-driven
    /// reader or through this call's own polling fallback. A non-OK response
    /// surfaces as [`Error::Device`].
    pub fn send_command(
        &self,
        command: Command,
        payload: &[u8],
        delay: ResponseDelay,
    ) -> Result<Vec<u8>> {
        self.protocol.write_message(self, command, payload, delay)
    }

    /// Send a response-free command; returns once the chunked write is on
    /// the bus. Rejected for commands outside the response-free allow-list.
    pub fn send_immediate_command(&self, command: Command, payload: &[u8]) -> Result<()> {
        self.protocol.write_immediate_message(self, command, payload)
    }

    /// Read and classify one inbound frame. This is the entry point for the
    /// attention/interrupt thread; command callers invoke it internally as
    /// their polling fallback.
    pub fn read_and_dispatch(&self) -> Result<u8> {
        self.protocol.read_message(self)
    }

    /// Wait for the attention signal and, when it fires, read one frame.
    ///
    /// The wait is sliced so a concurrent command writer can take the bus
    /// between polls.
    pub fn service_attention(&self, timeout: Duration) -> Result<Option<u8>> {
        const SLICE: Duration = Duration::from_millis(10);
        let deadline = Instant::now() + timeout;

        loop {
            let asserted = {
                let mut transport = self.lock_transport();
                transport.wait_attention(SLICE.min(timeout))?
            };
            if asserted {
                return self.read_and_dispatch().map(Some);
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Hand over the most recent buffered device report, if any.
    pub fn take_report(&self) -> Option<(u8, Vec<u8>)> {
        let mut report_buf = lock(&self.msg.report_buf);
        if report_buf.data_len() == 0 {
            return None;
        }
        let code = lock(&self.msg.frame).report_code;
        let data = report_buf.data().to_vec();
        report_buf.clear_data();
        Some((code, data))
    }

    // ---- device operations ----

    /// Request an identification packet and refresh the cached identity.
    pub fn identify(&self) -> Result<IdentificationInfo> {
        let resp = self.send_command(Command::Identify, &[], ResponseDelay::Default)?;
        let parsed = IdentificationInfo::parse(&resp)?;
        self.apply_identification(&parsed);
        Ok(parsed)
    }

    /// Request the application information packet. Requires application
    /// firmware mode.
    pub fn get_app_info(&self) -> Result<ApplicationInfo> {
        self.ensure_application_mode()?;

        let resp = self.send_command(Command::GetApplicationInfo, &[], ResponseDelay::Default)?;
        let parsed = ApplicationInfo::parse(&resp)?;

        match parsed.status {
            AppStatus::Ok => {}
            AppStatus::BadAppConfig => {
                warn!("application firmware rejected its configuration");
            }
            other => warn!("unexpected application status {other:?}"),
        }
        debug!(
            "app info: version {}, max {}x{}, image {}x{}",
            parsed.version,
            parsed.max_x,
            parsed.max_y,
            parsed.num_of_image_rows,
            parsed.num_of_image_cols
        );

        lock(&self.identity).app_info = Some(parsed.clone());
        Ok(parsed)
    }

    /// Request the boot information packet.
    pub fn get_boot_info(&self) -> Result<BootInfo> {
        let resp = self.send_command(Command::GetBootInfo, &[], ResponseDelay::Default)?;
        let parsed = BootInfo::parse(&resp)?;
        lock(&self.identity).boot_info = Some(parsed.clone());
        Ok(parsed)
    }

    /// Force the application firmware to rezero its baseline estimate.
    pub fn rezero(&self) -> Result<()> {
        self.ensure_application_mode()?;
        self.send_command(Command::Rezero, &[], ResponseDelay::Default)?;
        Ok(())
    }

    /// Enable or disable generation of a report type.
    pub fn enable_report(&self, report_code: u8, enable: bool) -> Result<()> {
        self.ensure_application_mode()?;
        let command = if enable {
            Command::EnableReport
        } else {
            Command::DisableReport
        };
        self.send_command(command, &[report_code], ResponseDelay::Default)?;
        Ok(())
    }

    /// Read a dynamic configuration value.
    pub fn get_dynamic_config(&self, field_id: u8) -> Result<u16> {
        self.ensure_application_mode()?;
        let resp = self.send_command(
            Command::GetDynamicConfig,
            &[field_id],
            ResponseDelay::Default,
        )?;
        if resp.len() < 2 {
            return Err(Error::Protocol(format!(
                "dynamic config response too short: {} bytes",
                resp.len()
            )));
        }
        Ok(LittleEndian::read_u16(&resp[..2]))
    }

    /// Write a dynamic configuration value.
    pub fn set_dynamic_config(&self, field_id: u8, value: u16) -> Result<()> {
        self.ensure_application_mode()?;
        let payload = [field_id, (value & 0xFF) as u8, (value >> 8) as u8];
        self.send_command(Command::SetDynamicConfig, &payload, ResponseDelay::Default)?;
        Ok(())
    }

    /// Write a dynamic configuration value through the response-free path.
    pub fn set_immediate_dynamic_config(&self, field_id: u8, value: u16) -> Result<()> {
        self.ensure_application_mode()?;
        let payload = [field_id, (value & 0xFF) as u8, (value >> 8) as u8];
        self.send_immediate_command(Command::SetImmediateDynamicConfig, &payload)
    }

    /// Soft-reset the device. Completion arrives as the unsolicited identify
    /// report the reset produces.
    pub fn soft_reset(&self) -> Result<()> {
        self.send_command(Command::Reset, &[], ResponseDelay::Millis(RESET_DELAY_MS))?;
        Ok(())
    }

    /// Switch from the bootloader to the application firmware.
    pub fn run_application_firmware(&self) -> Result<()> {
        self.send_command(
            Command::RunApplicationFirmware,
            &[],
            ResponseDelay::Millis(RESET_DELAY_MS),
        )?;
        Ok(())
    }

    /// Switch from the application firmware to the bootloader.
    pub fn run_bootloader_firmware(&self) -> Result<()> {
        self.send_command(
            Command::RunBootloaderFirmware,
            &[],
            ResponseDelay::Millis(RESET_DELAY_MS),
        )?;
        Ok(())
    }

    /// Reset the device, preferring the transport's reset line and falling
    /// back to the soft reset command.
    pub fn reset_device(&self) -> Result<()> {
        let hard = {
            let mut transport = self.lock_transport();
            transport.hard_reset()
        };
        match hard {
            Ok(()) => {
                thread::sleep(Duration::from_millis(u64::from(RESET_DELAY_MS)));
                // collect the identify report the reset produced
                let _ = self.read_and_dispatch();
                Ok(())
            }
            Err(Error::Unsupported(_)) => self.soft_reset(),
            Err(err) => Err(err),
        }
    }
}
