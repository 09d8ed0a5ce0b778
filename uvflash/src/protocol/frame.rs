//! Frame layer shared by the K5 and TK11 protocols.
//!
//! ## Frame Format
//!
//! ```text
//! +--------+--------+------------------------------------+--------+
//! | Start  | Length |   XOR(payload ++ crc16_le)         |  End   |
//! +--------+--------+------------------------------------+--------+
//! | AB CD  | u16 LE |   length + 2 bytes                 | DC BA  |
//! +--------+--------+------------------------------------+--------+
//! ```
//!
//! `Length` counts the raw payload only. The CRC is CRC-16/XMODEM over the
//! raw payload, taken before obfuscation.
//!
//! ## Resynchronisation
//!
//! [`FrameScanner`] drops garbage one byte at a time until it sees a start
//! marker. A candidate whose end marker is in place is consumed whole; a
//! candidate that fails verification costs exactly one byte, and scanning
//! resumes right after its first start byte.

use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use log::trace;

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::crc::crc16_xmodem;
use crate::protocol::obfuscation::{FRAME_KEY, xor_in_place};

/// Frame start marker.
pub const FRAME_START: [u8; 2] = [0xAB, 0xCD];

/// Frame end marker.
pub const FRAME_END: [u8; 2] = [0xDC, 0xBA];

/// Bytes a frame adds around its payload: start, length, CRC and end.
pub const FRAME_OVERHEAD: usize = 8;

/// Largest payload the scanner will wait for.
///
/// A TK11 read response is 12 + 256 bytes and a K5 flash page 16 + 256,
/// so anything past this is a false start marker.
pub const MAX_PAYLOAD: usize = 0x200;

/// Size of each write to the port.
pub const WRITE_CHUNK: usize = 64;

/// Pause between written chunks so slow radio UARTs keep up.
pub const CHUNK_DELAY: Duration = Duration::from_millis(2);

const READ_BUF_SIZE: usize = 256;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// De-obfuscated payload.
    pub payload: Vec<u8>,
    /// De-obfuscated CRC as received.
    pub crc: u16,
}

impl Frame {
    /// Whether the received CRC matches the payload.
    pub fn crc_valid(&self) -> bool {
        crc16_xmodem(&self.payload) == self.crc
    }
}

/// Build the wire bytes for `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(payload.len())
        .ok()
        .filter(|&len| usize::from(len) <= MAX_PAYLOAD)
        .ok_or_else(|| {
            Error::Protocol(format!("payload of {} bytes does not fit a frame", payload.len()))
        })?;

    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&FRAME_START);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&crc16_xmodem(payload).to_le_bytes());
    xor_in_place(&mut buf[4..], &FRAME_KEY);
    buf.extend_from_slice(&FRAME_END);
    Ok(buf)
}

/// Incremental frame extractor over an append-only receive buffer.
#[derive(Debug, Default)]
pub struct FrameScanner {
    buf: BytesMut,
}

impl FrameScanner {
    /// Create an empty scanner.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_BUF_SIZE * 2),
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next frame with intact markers.
    pub fn next_frame(&mut self) -> Option<Frame> {
        self.next_frame_where(|_| true)
    }

    /// Next frame with intact markers that also satisfies `valid`.
    ///
    /// Candidates failing either check are skipped one byte at a time.
    pub fn next_frame_where<F>(&mut self, valid: F) -> Option<Frame>
    where
        F: Fn(&Frame) -> bool,
    {
        loop {
            self.skip_to_start();
            if self.buf.len() < 4 {
                return None;
            }

            let len = usize::from(u16::from_le_bytes([self.buf[2], self.buf[3]]));
            if len > MAX_PAYLOAD {
                trace!("Implausible frame length {len}, resyncing");
                self.buf.advance(1);
                continue;
            }

            let total = len + FRAME_OVERHEAD;
            if self.buf.len() < total {
                return None;
            }

            if self.buf[total - 2..total] != FRAME_END {
                trace!("Missing end marker for {len}-byte candidate, resyncing");
                self.buf.advance(1);
                continue;
            }

            let mut body = self.buf[4..total - 2].to_vec();
            xor_in_place(&mut body, &FRAME_KEY);
            let crc = u16::from_le_bytes([body[len], body[len + 1]]);
            body.truncate(len);
            let frame = Frame { payload: body, crc };

            if !valid(&frame) {
                trace!("Rejected {len}-byte candidate, resyncing");
                self.buf.advance(1);
                continue;
            }

            self.buf.advance(total);
            return Some(frame);
        }
    }

    fn skip_to_start(&mut self) {
        while !self.buf.is_empty() {
            if self.buf[0] == FRAME_START[0] && (self.buf.len() == 1 || self.buf[1] == FRAME_START[1])
            {
                return;
            }
            self.buf.advance(1);
        }
    }
}

/// Write a framed payload in [`WRITE_CHUNK`]-sized pieces.
pub fn send_frame<P: Port + ?Sized>(port: &mut P, payload: &[u8]) -> Result<()> {
    let frame = encode_frame(payload)?;
    trace!("TX {} bytes: {:02X?}", frame.len(), frame);

    for (i, chunk) in frame.chunks(WRITE_CHUNK).enumerate() {
        if i > 0 {
            thread::sleep(CHUNK_DELAY);
        }
        port.write_all(chunk)?;
    }
    port.flush()?;
    Ok(())
}

/// Pull whatever the port has into `scanner`.
///
/// Returns `Ok(false)` when the port's own read timeout elapsed without data.
pub fn fill<P: Port + ?Sized>(port: &mut P, scanner: &mut FrameScanner) -> Result<bool> {
    let mut buf = [0u8; READ_BUF_SIZE];
    match port.read(&mut buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            trace!("RX {n} bytes: {:02X?}", &buf[..n]);
            scanner.push(&buf[..n]);
            Ok(true)
        },
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ) =>
        {
            Ok(false)
        },
        Err(e) => Err(Error::Io(e)),
    }
}

/// Deadline for a single framed exchange.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Start counting `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.timeout
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }

    /// Timeout error naming what was awaited.
    pub fn error(&self, what: &str) -> Error {
        Error::Timeout(format!(
            "no {what} within {} ms",
            self.timeout.as_millis()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::LoopbackPort;

    #[test]
    fn test_encode_layout() {
        let frame = encode_frame(&[0x14, 0x05, 0x04, 0x00]).unwrap();
        assert_eq!(frame.len(), 4 + FRAME_OVERHEAD);
        assert_eq!(&frame[..2], &FRAME_START);
        assert_eq!(&frame[2..4], &[0x04, 0x00]);
        assert_eq!(&frame[frame.len() - 2..], &FRAME_END);
        // First payload byte is XORed with the first key byte
        assert_eq!(frame[4], 0x14 ^ FRAME_KEY[0]);
    }

    #[test]
    fn test_roundtrip_all_lengths() {
        for len in 0..=255usize {
            #[allow(clippy::cast_possible_truncation)]
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            let mut scanner = FrameScanner::new();
            scanner.push(&encode_frame(&payload).unwrap());
            let frame = scanner.next_frame().unwrap();
            assert_eq!(frame.payload, payload);
            assert!(frame.crc_valid());
            assert_eq!(scanner.buffered(), 0);
        }
    }

    #[test]
    fn test_leading_garbage_is_skipped() {
        let mut scanner = FrameScanner::new();
        scanner.push(&[0x00, 0xAB, 0x11, 0xCD, 0xFF]);
        scanner.push(&encode_frame(&[1, 2, 3]).unwrap());
        assert_eq!(scanner.next_frame().unwrap().payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let wire = encode_frame(&[9; 20]).unwrap();
        let mut scanner = FrameScanner::new();
        scanner.push(&wire[..10]);
        assert!(scanner.next_frame().is_none());
        scanner.push(&wire[10..]);
        assert_eq!(scanner.next_frame().unwrap().payload, vec![9; 20]);
    }

    #[test]
    fn test_bad_end_marker_resyncs() {
        let mut broken = encode_frame(&[1, 2]).unwrap();
        let last = broken.len() - 1;
        broken[last] = 0x00;
        let mut scanner = FrameScanner::new();
        scanner.push(&broken);
        scanner.push(&encode_frame(&[3, 4]).unwrap());
        assert_eq!(scanner.next_frame().unwrap().payload, vec![3, 4]);
    }

    #[test]
    fn test_rejected_candidate_costs_one_byte() {
        let mut corrupt = encode_frame(&[0x10, 0x20, 0x30]).unwrap();
        corrupt[5] ^= 0x01;
        let mut scanner = FrameScanner::new();
        scanner.push(&corrupt);
        scanner.push(&encode_frame(&[0x40]).unwrap());

        let frame = scanner.next_frame_where(Frame::crc_valid).unwrap();
        assert_eq!(frame.payload, vec![0x40]);
    }

    #[test]
    fn test_implausible_length_is_skipped() {
        let mut scanner = FrameScanner::new();
        scanner.push(&[0xAB, 0xCD, 0xFF, 0xFF]);
        scanner.push(&encode_frame(&[7]).unwrap());
        assert_eq!(scanner.next_frame().unwrap().payload, vec![7]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(encode_frame(&vec![0u8; MAX_PAYLOAD + 1]).is_err());
    }

    #[test]
    fn test_send_frame_chunks_writes() {
        let mut port = LoopbackPort::new();
        let log = port.log();
        let payload = vec![0x55u8; 200];
        send_frame(&mut port, &payload).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.written.len(), 200 + FRAME_OVERHEAD);
        assert_eq!(log.write_calls, (200 + FRAME_OVERHEAD).div_ceil(WRITE_CHUNK));
    }

    #[test]
    fn test_fill_reports_idle_line() {
        let mut port = LoopbackPort::new();
        let mut scanner = FrameScanner::new();
        assert!(!fill(&mut port, &mut scanner).unwrap());
        port.feed(&[1, 2, 3]);
        assert!(fill(&mut port, &mut scanner).unwrap());
        assert_eq!(scanner.buffered(), 3);
    }
}
