//! Scripted transport for exercising the codec without hardware.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::message::{status, MessageHeader, MESSAGE_MARKER, MESSAGE_PADDING};
use crate::transport::Transport;

#[derive(Default)]
struct MockState {
    reads: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    hard_resets: usize,
}

/// Shared handle for scripting reads and inspecting writes.
#[derive(Clone)]
pub(crate) struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Queue raw bytes to be returned by subsequent reads.
    pub(crate) fn queue_raw(&self, bytes: &[u8]) {
        self.state.lock().unwrap().reads.extend(bytes.iter().copied());
    }

    /// Queue a complete single-chunk frame: header, payload chunk and pad.
    ///
    /// Valid as long as the payload plus pad fits one read chunk of the
    /// connection consuming it.
    pub(crate) fn queue_frame(&self, code: u8, payload: &[u8]) {
        self.queue_raw(&MessageHeader::encode(code, payload.len() as u16));
        if !payload.is_empty() {
            let mut chunk = vec![MESSAGE_MARKER, status::CONTINUED_READ];
            chunk.extend_from_slice(payload);
            chunk.push(MESSAGE_PADDING);
            self.queue_raw(&chunk);
        }
    }

    /// All write transactions recorded so far.
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Drop the recorded write transactions.
    pub(crate) fn clear_writes(&self) {
        self.state.lock().unwrap().writes.clear();
    }

    /// Number of queued read bytes not yet consumed.
    pub(crate) fn remaining_reads(&self) -> usize {
        self.state.lock().unwrap().reads.len()
    }

    /// Number of hard resets requested through the transport.
    pub(crate) fn hard_resets(&self) -> usize {
        self.state.lock().unwrap().hard_resets
    }
}

/// Build a wire identification packet.
pub(crate) fn id_packet(mode: u8, build_id: u32, max_write_size: u16) -> Vec<u8> {
    let mut data = vec![0x01, mode];
    let mut part = [0u8; 16];
    part[..6].copy_from_slice(b"TD4375");
    data.extend_from_slice(&part);
    data.extend_from_slice(&build_id.to_le_bytes());
    data.extend_from_slice(&max_write_size.to_le_bytes());
    data
}

/// Build a wire application information packet.
pub(crate) fn app_info_packet(app_status: u16, config_id: [u8; 4]) -> Vec<u8> {
    let mut data = Vec::new();
    for field in [2u16, app_status, 100, 40, 0x80, 256, 128, 256] {
        data.extend_from_slice(&field.to_le_bytes());
    }
    let mut full_id = [0u8; 16];
    full_id[..4].copy_from_slice(&config_id);
    data.extend_from_slice(&full_id);
    for field in [1080u16, 2340, 10, 0, 18, 32] {
        data.extend_from_slice(&field.to_le_bytes());
    }
    data
}

/// Build a wire boot information packet.
pub(crate) fn boot_info_packet(
    write_block_words: u8,
    erase_page_words: u16,
    max_write_payload: u16,
) -> Vec<u8> {
    let mut data = vec![0x01, 0x00, 0x21, 0x43, write_block_words];
    data.extend_from_slice(&erase_page_words.to_le_bytes());
    data.extend_from_slice(&max_write_payload.to_le_bytes());
    data.push(0x00); // last reset reason
    data.extend_from_slice(&[0x00, 0x00]); // pc at reset
    data.extend_from_slice(&0x0010u16.to_le_bytes()); // boot config start
    data.extend_from_slice(&0x0004u16.to_le_bytes()); // boot config size
    data.extend_from_slice(&0x00001000u32.to_le_bytes()); // display config start
    data.extend_from_slice(&0x0020u16.to_le_bytes()); // display config size
    data
}

/// Synthetic firmware image containers for parser and reflash tests.
pub(crate) mod image_builder {
    use crate::image::{area_checksum, AREA_ID_SIZE, AREA_MAGIC, IMAGE_MAGIC};

    struct AreaSpec {
        id: String,
        flash_addr_words: u32,
        content: Vec<u8>,
        checksum: u32,
    }

    /// Builds a container byte-for-byte like a release image.
    #[derive(Default)]
    pub(crate) struct ImageBuilder {
        areas: Vec<AreaSpec>,
    }

    impl ImageBuilder {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Add an area with a correct checksum.
        pub(crate) fn area(self, id: &str, flash_addr_words: u32, content: &[u8]) -> Self {
            let checksum = area_checksum(content);
            self.area_with_checksum(id, flash_addr_words, content, checksum)
        }

        /// Add an area with an explicit (possibly wrong) checksum.
        pub(crate) fn area_with_checksum(
            mut self,
            id: &str,
            flash_addr_words: u32,
            content: &[u8],
            checksum: u32,
        ) -> Self {
            self.areas.push(AreaSpec {
                id: id.to_string(),
                flash_addr_words,
                content: content.to_vec(),
                checksum,
            });
            self
        }

        pub(crate) fn build(self) -> Vec<u8> {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
            bytes.extend_from_slice(&(self.areas.len() as u32).to_le_bytes());

            // reserve the offset table, fill it as descriptors are emitted
            let table_start = bytes.len();
            bytes.resize(table_start + self.areas.len() * 4, 0);

            for (index, area) in self.areas.iter().enumerate() {
                let offset = bytes.len() as u32;
                let entry = table_start + index * 4;
                bytes[entry..entry + 4].copy_from_slice(&offset.to_le_bytes());

                bytes.extend_from_slice(&AREA_MAGIC.to_le_bytes());
                let mut id = [0u8; AREA_ID_SIZE];
                let len = area.id.len().min(AREA_ID_SIZE);
                id[..len].copy_from_slice(&area.id.as_bytes()[..len]);
                bytes.extend_from_slice(&id);
                bytes.extend_from_slice(&0u32.to_le_bytes()); // flags
                bytes.extend_from_slice(&area.flash_addr_words.to_le_bytes());
                bytes.extend_from_slice(&(area.content.len() as u32).to_le_bytes());
                bytes.extend_from_slice(&area.checksum.to_le_bytes());
                bytes.extend_from_slice(&area.content);
            }

            bytes
        }
    }
}

/// Transport whose reads come from a script and whose writes are recorded.
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub(crate) fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MockHandle { state },
        )
    }
}

impl Transport for MockTransport {
    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.state.lock().unwrap().writes.push(data.to_vec());
        Ok(())
    }

    fn read_raw(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.reads.len() < buf.len() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "no scripted data",
            )));
        }
        for slot in buf.iter_mut() {
            *slot = state.reads.pop_front().unwrap();
        }
        Ok(())
    }

    fn wait_attention(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(!self.state.lock().unwrap().reads.is_empty())
    }

    fn hard_reset(&mut self) -> Result<()> {
        self.state.lock().unwrap().hard_resets += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}
