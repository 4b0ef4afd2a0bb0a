//! First-generation TouchComm codec.
//!
//! Outbound commands are split into bus-sized chunks. The first chunk
//! carries the command byte and the 16-bit payload length; every further
//! chunk is re-prefixed with the continue-write command byte:
//!
//! ```text
//! chunk 0:  [command] [len lo] [len hi] [payload ...]
//! chunk 1+: [0x01]    [payload continuation ...]
//! ```
//!
//! Inbound frames start with the 4-byte header; payloads are pulled back in
//! chunks of the negotiated read size, each chunk re-asserting the marker
//! and continued-read status:
//!
//! ```text
//! header:   [0xA5] [code] [len lo] [len hi]
//! chunk:    [0xA5] [0x03] [payload ...]
//! last:     [0xA5] [0x03] [payload ...] [0x5A]
//! ```
//!
//! The trailing pad byte is part of every continued read; when it would be
//! the sole content of the final chunk no bus read is issued for it.

use std::thread;
use std::time::Duration;

use log::{debug, error, warn};

use crate::device::{CommandState, Connection};
use crate::error::{Error, Result};
use crate::protocol::message::{
    self, report, status, Command, MessageHeader, MESSAGE_HEADER_SIZE, MESSAGE_MARKER,
    MESSAGE_PADDING,
};
use crate::protocol::{ResponseDelay, WireProtocol};
use crate::transport::Transport;

/// Default polling interval while waiting for a command response.
pub(crate) const RESPONSE_POLLING_DELAY_MS: u64 = 10;

/// Polling interval when the response is attention-driven.
const ATTN_DRIVEN_POLLING_MS: u64 = 1000;

/// Bus settle delay between the chunks of a chunked write.
const WRITE_CHUNK_DELAY: Duration = Duration::from_millis(1);

/// Delay before the one retry of a transaction's first header read.
const HEADER_RETRY_DELAY: Duration = Duration::from_millis(5);

/// First-generation protocol implementation.
pub(crate) struct ProtocolV1;

impl ProtocolV1 {
    /// Write a command as one or more chunks through the raw transport.
    #[allow(clippy::cast_possible_truncation)] // payload length is checked against u16
    fn write_chunked(&self, conn: &Connection, command: Command, payload: &[u8]) -> Result<()> {
        if payload.len() > usize::from(u16::MAX) {
            return Err(Error::Protocol(format!(
                "payload of {} bytes exceeds the 16-bit length field",
                payload.len()
            )));
        }

        let mut transport = conn.lock_transport();
        let mut out = conn.lock_buffer(&conn.msg.out_buf);

        // the two length bytes travel as part of the payload
        let mut remaining = payload.len() + 2;

        let max_write = conn.max_write_chunk();
        let chunk_space = if max_write == 0 {
            remaining
        } else {
            // one byte per chunk is reserved for the command / continuation;
            // the first chunk additionally needs room for both length bytes
            let space = max_write.saturating_sub(1);
            if space < 2 {
                return Err(Error::Protocol(format!(
                    "write chunk limit {max_write} below the minimum viable chunk"
                )));
            }
            space
        };

        let chunks = remaining.div_ceil(chunk_space).max(1);
        debug!(
            "command {command}: payload {} bytes in {} chunk(s)",
            payload.len(),
            chunks
        );

        for idx in 0..chunks {
            let xfer = remaining.min(chunk_space);
            out.reserve_len(xfer + 1);
            let buf = out.bytes_mut();

            if idx == 0 {
                buf[0] = command.code();
                buf[1] = (payload.len() & 0xFF) as u8;
                buf[2] = ((payload.len() >> 8) & 0xFF) as u8;
                if xfer > 2 {
                    buf[3..=xfer].copy_from_slice(&payload[..xfer - 2]);
                }
            } else {
                buf[0] = Command::ContinueWrite.code();
                let start = idx * chunk_space - 2;
                buf[1..=xfer].copy_from_slice(&payload[start..start + xfer]);
            }

            transport.write_raw(&out.bytes()[..=xfer])?;
            remaining -= xfer;

            // let the bus settle before the next chunk
            if remaining > 0 {
                thread::sleep(WRITE_CHUNK_DELAY);
            }
        }

        Ok(())
    }

    /// Pull the declared payload back in continued-read chunks, leaving the
    /// reassembled frame (header + payload + pad) in the `in` buffer.
    fn continued_read(
        &self,
        conn: &Connection,
        transport: &mut dyn Transport,
        length: usize,
    ) -> Result<()> {
        // the full transfer covers the payload plus a single trailing pad
        let total_length = MESSAGE_HEADER_SIZE + length + 1;
        let mut remaining = total_length - MESSAGE_HEADER_SIZE;

        let mut in_buf = conn.lock_buffer(&conn.msg.in_buf);
        in_buf.reserve_len(total_length + 1);

        let max_read = conn.max_read_chunk();
        let chunk_space = if max_read == 0 {
            remaining
        } else {
            // two bytes per chunk are re-asserted marker and status; a chunk
            // space of one would alias the lone-pad shortcut below
            let space = max_read.saturating_sub(2);
            if space < 2 {
                return Err(Error::Protocol(format!(
                    "read chunk limit {max_read} below the minimum viable chunk"
                )));
            }
            space
        };

        let chunks = remaining.div_ceil(chunk_space).max(1);
        let mut offset = MESSAGE_HEADER_SIZE;
        let mut temp = conn.lock_buffer(&conn.msg.temp_buf);

        for _ in 0..chunks {
            let xfer = remaining.min(chunk_space);

            // a lone trailing byte is the pad; synthesize it without a read
            if xfer == 1 {
                in_buf.bytes_mut()[offset] = MESSAGE_PADDING;
                offset += 1;
                remaining -= 1;
                continue;
            }

            temp.reserve_len(xfer + 2);
            transport.read_raw(&mut temp.bytes_mut()[..xfer + 2])?;

            let marker = temp.bytes()[0];
            let code = temp.bytes()[1];
            if marker != MESSAGE_MARKER {
                error!("incorrect chunk marker {marker:#04x}");
                return Err(Error::Protocol(format!(
                    "incorrect chunk marker {marker:#04x}"
                )));
            }
            if code != status::CONTINUED_READ {
                error!("incorrect chunk status {code:#04x}");
                return Err(Error::Protocol(format!(
                    "incorrect chunk status {code:#04x}"
                )));
            }

            in_buf.bytes_mut()[offset..offset + xfer].copy_from_slice(&temp.bytes()[2..2 + xfer]);
            offset += xfer;
            remaining -= xfer;
        }

        in_buf.set_data_len(total_length);
        Ok(())
    }

    /// Read one frame with the transport lock already held.
    #[allow(clippy::cast_possible_truncation)] // the length field arrived as u16
    fn read_message_locked(&self, conn: &Connection, transport: &mut dyn Transport) -> Result<u8> {
        let header = {
            let mut in_buf = conn.lock_buffer(&conn.msg.in_buf);
            in_buf.reserve_len(MESSAGE_HEADER_SIZE);

            // the first read after some commands can glitch; retry it once
            let mut retry = true;
            loop {
                if let Err(err) = transport.read_raw(&mut in_buf.bytes_mut()[..MESSAGE_HEADER_SIZE])
                {
                    conn.msg.set_frame(status::INVALID, 0);
                    if retry {
                        warn!("header read failed ({err}), retrying");
                        thread::sleep(HEADER_RETRY_DELAY);
                        retry = false;
                        continue;
                    }
                    return Err(err);
                }

                match MessageHeader::parse(&in_buf.bytes()[..MESSAGE_HEADER_SIZE]) {
                    Ok(header) => break header,
                    Err(err) => {
                        conn.msg.set_frame(status::INVALID, 0);
                        if retry {
                            warn!("{err}, retrying header read");
                            thread::sleep(HEADER_RETRY_DELAY);
                            retry = false;
                            continue;
                        }
                        return Err(err);
                    }
                }
            }
        };

        let code = header.code;
        let mut payload_len = usize::from(header.length);

        if code != status::IDLE {
            debug!("frame: code {code:#04x}, length {payload_len}");
        }

        if code <= status::ERROR || code == status::INVALID {
            match code {
                status::OK => {}
                status::CONTINUED_READ => {
                    // a continuation chunk at top level means host and
                    // device lost frame synchronization
                    error!("out-of-sync continued read");
                    conn.msg.set_frame(code, 0);
                    return Ok(code);
                }
                status::IDLE => {
                    conn.msg.set_frame(code, 0);
                    return Ok(code);
                }
                _ => {
                    error!("incorrect status code {code:#04x}");
                    payload_len = 0;
                }
            }
        }

        conn.msg.set_frame(code, payload_len);

        if payload_len > 0 {
            self.continued_read(conn, transport, payload_len)?;

            // refill the header for dispatching
            let mut in_buf = conn.lock_buffer(&conn.msg.in_buf);
            let refreshed = MessageHeader::encode(code, payload_len as u16);
            in_buf.bytes_mut()[..MESSAGE_HEADER_SIZE].copy_from_slice(&refreshed);
        }

        if message::is_report_code(code) {
            self.dispatch_report(conn);
        } else {
            self.dispatch_response(conn);
        }

        Ok(code)
    }

    /// Classify a reassembled frame as an asynchronous device report.
    ///
    /// Identify reports refresh the cached identity and may stand in for
    /// the response of a reset-class command; everything else is buffered
    /// for the report consumer.
    fn dispatch_report(&self, conn: &Connection) {
        let (code, payload_len) = conn.msg.frame_code_and_len();
        conn.msg.set_report_code(code);

        if payload_len == 0 {
            conn.lock_buffer(&conn.msg.report_buf).clear_data();
            return;
        }

        if code == report::IDENTIFY {
            let parsed = {
                let in_buf = conn.lock_buffer(&conn.msg.in_buf);
                let payload =
                    &in_buf.bytes()[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + payload_len];
                crate::device::info::IdentificationInfo::parse(payload)
            };

            let info = match parsed {
                Ok(info) => info,
                Err(err) => {
                    error!("failed to parse identify report: {err}");
                    return;
                }
            };
            conn.apply_identification(&info);

            // the identify may have been caused by the in-flight command
            if conn.msg.completion.state() == CommandState::Busy {
                let in_flight = conn.msg.current_command();
                if in_flight.is_some_and(Command::is_reset_class) {
                    if in_flight == Some(Command::Reset) {
                        debug!("reset confirmed by identify report");
                    }
                    conn.msg.set_response_code(status::OK);
                    conn.lock_buffer(&conn.msg.resp_buf).clear_data();
                    conn.msg.completion.finish(CommandState::Idle);
                } else {
                    error!("device has been reset unexpectedly");
                    conn.msg.completion.finish(CommandState::Error);
                }
                return;
            }
        }

        let mut report_buf = conn.lock_buffer(&conn.msg.report_buf);
        let in_buf = conn.lock_buffer(&conn.msg.in_buf);
        report_buf.assign(&in_buf.bytes()[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + payload_len]);
    }

    /// Classify a reassembled frame as a command response: hand the payload
    /// to the waiting command, or drop it when nothing waits.
    fn dispatch_response(&self, conn: &Connection) {
        let (code, payload_len) = conn.msg.frame_code_and_len();

        if conn.msg.completion.state() != CommandState::Busy {
            // spurious or late response; recording its code would clobber
            // what the previous command is about to collect
            return;
        }
        conn.msg.set_response_code(code);

        if payload_len == 0 {
            conn.lock_buffer(&conn.msg.resp_buf).clear_data();
            conn.msg.completion.finish(CommandState::Idle);
            return;
        }

        {
            let mut resp_buf = conn.lock_buffer(&conn.msg.resp_buf);
            let in_buf = conn.lock_buffer(&conn.msg.in_buf);
            resp_buf
                .assign(&in_buf.bytes()[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + payload_len]);
        }
        conn.msg.completion.finish(CommandState::Idle);
    }
}

impl WireProtocol for ProtocolV1 {
    fn write_message(
        &self,
        conn: &Connection,
        command: Command,
        payload: &[u8],
        delay: ResponseDelay,
    ) -> Result<Vec<u8>> {
        let _cmd_guard = conn.lock_command();

        conn.msg.completion.begin();
        conn.msg.set_current_command(command);

        if let Err(err) = self.write_chunked(conn, command, payload) {
            error!("failed to send command {command}: {err}");
            conn.msg.set_current_command(Command::None);
            conn.msg.completion.force_idle();
            return Err(err);
        }

        // Two-phase wait: sleep on the completion signal, then actively read
        // the bus in case the attention interrupt was missed.
        let polling_ms = match delay {
            ResponseDelay::AttnDriven => ATTN_DRIVEN_POLLING_MS,
            ResponseDelay::Millis(0) | ResponseDelay::Default => RESPONSE_POLLING_DELAY_MS,
            ResponseDelay::Millis(ms) => u64::from(ms),
        };
        let budget_ms = conn.response_timeout_ms();

        let mut waited_ms = 0u64;
        let wait_result = loop {
            let _ = conn
                .msg
                .completion
                .wait_for(Duration::from_millis(polling_ms));

            if conn.msg.completion.state() == CommandState::Idle {
                break Ok(());
            }

            waited_ms += polling_ms + RESPONSE_POLLING_DELAY_MS;
            if waited_ms >= budget_ms {
                break Err(Error::Timeout(format!(
                    "no response to command {command} within {budget_ms} ms"
                )));
            }

            if self.read_message(conn).is_err() {
                conn.msg.completion.reset();
            }
        };

        let result = wait_result.and_then(|()| {
            let response_code = conn.msg.response_code();
            if response_code == status::OK {
                Ok(conn.lock_buffer(&conn.msg.resp_buf).data().to_vec())
            } else {
                warn!("command {command} answered with status {response_code:#04x}");
                Err(Error::Device {
                    command: command.code(),
                    code: response_code,
                })
            }
        });

        if matches!(result, Err(Error::Timeout(_))) {
            error!("timed out waiting for response of command {command}");
        }

        conn.msg.set_current_command(Command::None);
        conn.msg.completion.force_idle();

        result
    }

    fn write_immediate_message(
        &self,
        conn: &Connection,
        command: Command,
        payload: &[u8],
    ) -> Result<()> {
        if !command.is_response_free() {
            return Err(Error::Unsupported(format!(
                "command {command} is not response-free"
            )));
        }

        let _cmd_guard = conn.lock_command();

        conn.msg.completion.begin();
        conn.msg.set_current_command(command);

        let result = self.write_chunked(conn, command, payload);
        if let Err(err) = &result {
            error!("failed to send immediate command {command}: {err}");
        }

        conn.msg.set_current_command(Command::None);
        conn.msg.completion.force_idle();

        result
    }

    fn read_message(&self, conn: &Connection) -> Result<u8> {
        let result = {
            let mut transport = conn.lock_transport();
            self.read_message_locked(conn, &mut **transport)
        };

        // a failed read must not leave a waiting command hanging
        if result.is_err() && conn.msg.completion.state() == CommandState::Busy {
            conn.msg.completion.finish(CommandState::Error);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Connection;
    use crate::testutil::MockTransport;

    fn connection_with_mock() -> (Connection, crate::testutil::MockHandle) {
        let (mock, handle) = MockTransport::new();
        let conn = Connection::new(Box::new(mock));
        conn.set_response_timeout(Duration::from_millis(200));
        (conn, handle)
    }

    fn id_info_with_max_write(max_write: u16) -> crate::device::info::IdentificationInfo {
        crate::device::info::IdentificationInfo {
            version: 1,
            mode: crate::device::info::FirmwareMode::Application,
            part_number: "TD4375".to_string(),
            build_id: 0x1000,
            max_write_size: max_write,
        }
    }

    #[test]
    fn test_chunking_round_trip() {
        // concatenating the chunk bodies (markers stripped) must equal the
        // original payload for assorted payload lengths and chunk sizes
        for max_write in [0usize, 3, 7, 16, 64] {
            for payload_len in [0usize, 1, 2, 5, 13, 100] {
                let (conn, handle) = connection_with_mock();
                conn.apply_identification(&id_info_with_max_write(max_write as u16));

                let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
                ProtocolV1
                    .write_chunked(&conn, Command::ProductionTest, &payload)
                    .unwrap();

                let writes = handle.writes();
                assert!(!writes.is_empty());

                let first = &writes[0];
                assert_eq!(first[0], Command::ProductionTest.code());
                assert_eq!(first[1], (payload_len & 0xFF) as u8);
                assert_eq!(first[2], (payload_len >> 8) as u8);

                let mut reassembled = first[3..].to_vec();
                for chunk in &writes[1..] {
                    assert_eq!(chunk[0], Command::ContinueWrite.code());
                    reassembled.extend_from_slice(&chunk[1..]);
                }
                assert_eq!(
                    reassembled, payload,
                    "max_write={max_write} payload_len={payload_len}"
                );

                if max_write > 0 {
                    for chunk in &writes {
                        assert!(chunk.len() <= max_write);
                    }
                }
            }
        }
    }

    #[test]
    fn test_chunk_limit_below_minimum_rejected() {
        let (conn, handle) = connection_with_mock();
        conn.apply_identification(&id_info_with_max_write(2));

        assert!(matches!(
            ProtocolV1.write_chunked(&conn, Command::ProductionTest, &[1, 2, 3]),
            Err(Error::Protocol(_))
        ));
        assert!(handle.writes().is_empty());
    }

    #[test]
    fn test_continued_read_reassembly() {
        let (conn, handle) = connection_with_mock();
        conn.set_max_read_chunk(8); // chunk space 6

        let payload: Vec<u8> = (0u8..10).collect();
        // remaining = 10 + 1 = 11 -> chunks of 6 and 5
        handle.queue_raw(&MessageHeader::encode(report::TOUCH, 10));
        let mut chunk1 = vec![MESSAGE_MARKER, status::CONTINUED_READ];
        chunk1.extend_from_slice(&payload[..6]);
        handle.queue_raw(&chunk1);
        let mut chunk2 = vec![MESSAGE_MARKER, status::CONTINUED_READ];
        chunk2.extend_from_slice(&payload[6..]);
        chunk2.push(MESSAGE_PADDING);
        handle.queue_raw(&chunk2);

        let code = conn.read_and_dispatch().unwrap();
        assert_eq!(code, report::TOUCH);
        let (report_code, data) = conn.take_report().unwrap();
        assert_eq!(report_code, report::TOUCH);
        assert_eq!(data, payload);
        assert_eq!(handle.remaining_reads(), 0);
    }

    #[test]
    fn test_continued_read_synthesized_padding() {
        // remaining = 6 + 1 = 7 with chunk space 6: the final 1-byte chunk
        // is the pad and must not hit the bus
        let (conn, handle) = connection_with_mock();
        conn.set_max_read_chunk(8);

        let payload: Vec<u8> = (0u8..6).collect();
        handle.queue_raw(&MessageHeader::encode(report::TOUCH, 6));
        let mut chunk = vec![MESSAGE_MARKER, status::CONTINUED_READ];
        chunk.extend_from_slice(&payload);
        handle.queue_raw(&chunk);

        conn.read_and_dispatch().unwrap();
        let (_, data) = conn.take_report().unwrap();
        assert_eq!(data, payload);
        assert_eq!(handle.remaining_reads(), 0, "pad byte must be synthesized");
    }

    #[test]
    fn test_continued_read_pad_in_final_chunk() {
        // remaining = 11 + 1 = 12, an exact multiple of chunk space 6: the
        // pad rides in the last real chunk, no synthetic chunk
        let (conn, handle) = connection_with_mock();
        conn.set_max_read_chunk(8);

        let payload: Vec<u8> = (0u8..11).collect();
        handle.queue_raw(&MessageHeader::encode(report::TOUCH, 11));
        let mut chunk1 = vec![MESSAGE_MARKER, status::CONTINUED_READ];
        chunk1.extend_from_slice(&payload[..6]);
        handle.queue_raw(&chunk1);
        let mut chunk2 = vec![MESSAGE_MARKER, status::CONTINUED_READ];
        chunk2.extend_from_slice(&payload[6..]);
        chunk2.push(MESSAGE_PADDING);
        handle.queue_raw(&chunk2);

        conn.read_and_dispatch().unwrap();
        let (_, data) = conn.take_report().unwrap();
        assert_eq!(data, payload);
        assert_eq!(handle.remaining_reads(), 0);
    }

    #[test]
    fn test_continued_read_marker_mismatch_aborts() {
        let (conn, handle) = connection_with_mock();
        conn.set_max_read_chunk(8);

        handle.queue_raw(&MessageHeader::encode(report::TOUCH, 10));
        let mut chunk = vec![0x00, status::CONTINUED_READ]; // bad marker
        chunk.extend_from_slice(&[0u8; 6]);
        handle.queue_raw(&chunk);

        assert!(matches!(
            conn.read_and_dispatch(),
            Err(Error::Protocol(_))
        ));
        assert!(conn.take_report().is_none());
    }

    #[test]
    fn test_out_of_sync_continued_read_at_top_level() {
        let (conn, handle) = connection_with_mock();
        handle.queue_raw(&MessageHeader::encode(status::CONTINUED_READ, 50));

        let code = conn.read_and_dispatch().unwrap();
        assert_eq!(code, status::CONTINUED_READ);
        // the declared length is ignored; nothing further was read
        assert_eq!(handle.remaining_reads(), 0);
        assert!(conn.take_report().is_none());
    }

    #[test]
    fn test_header_read_retried_once() {
        let (conn, handle) = connection_with_mock();
        handle.queue_raw(&[0x00, 0x00, 0x00, 0x00]); // glitched first header
        handle.queue_frame(report::TOUCH, &[1, 2, 3]);

        let code = conn.read_and_dispatch().unwrap();
        assert_eq!(code, report::TOUCH);
        let (_, data) = conn.take_report().unwrap();
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[test]
    fn test_spurious_response_dropped() {
        let (conn, handle) = connection_with_mock();
        handle.queue_frame(status::OK, &[0xAA, 0xBB]);

        // no command is in flight; the frame must be discarded
        let code = conn.read_and_dispatch().unwrap();
        assert_eq!(code, status::OK);
        assert!(conn.take_report().is_none());
    }

    #[test]
    fn test_immediate_command_allow_list() {
        let (conn, handle) = connection_with_mock();

        assert!(matches!(
            conn.send_immediate_command(Command::Rezero, &[]),
            Err(Error::Unsupported(_))
        ));
        assert!(handle.writes().is_empty());

        conn.send_immediate_command(Command::SetImmediateDynamicConfig, &[0x05, 0x01, 0x00])
            .unwrap();
        let writes = handle.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(
            writes[0],
            vec![
                Command::SetImmediateDynamicConfig.code(),
                0x03,
                0x00,
                0x05,
                0x01,
                0x00
            ]
        );
    }
}
