//! TK11 internal-flash programming protocol.
//!
//! Same frame layer as K5, but every payload starts with a little-endian
//! [`MessageType`] and the CRC is enforced on receive.
//!
//! ```text
//! connect  : type:u16 | magic:u32
//! read     : type:u16 | addr:u32 | len:u16 | magic:u32
//! write    : type:u16 | addr:u32 | len:u16 | magic:u32 | data[len]
//! reboot   : type:u16
//!
//! connect response: type:u16 | ...6 bytes... | version (ASCII, optional)
//! read response   : type:u16 | ...10 bytes... | data[len]
//! ```
//!
//! Caller addresses are relative; [`ADDRESS_BASE`] is added before they go
//! on the wire.

use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::port::{Port, Transport, lock};
use crate::protocol::frame::{Deadline, Frame, FrameScanner, fill, send_frame};
use crate::protocol::k5::version_from_bytes;
use crate::protocol::retry::RetryPolicy;

/// Default deadline for one TK11 exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Offset added to every on-wire address.
pub const ADDRESS_BASE: u32 = 0x08_0000;

/// Constant carried by connect, read and write requests.
pub const CONNECT_MAGIC: u32 = 5;

/// Largest block one read or write may carry.
pub const MAX_CHUNK: usize = 256;

/// Length of the read/write request header, and offset of read data.
pub const HEADER_LEN: usize = 12;

const VERSION_OFFSET: usize = 8;

/// TK11 message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    /// Open a programming session.
    ConnectRequest = 0x01F4,
    /// Session accepted.
    ConnectResponse = 0x01F5,
    /// Read a block of flash.
    MemoryReadRequest = 0x01FB,
    /// Block read back.
    MemoryReadResponse = 0x01FC,
    /// Write a block of flash.
    MemoryWriteRequest = 0x01FD,
    /// Block written.
    MemoryWriteResponse = 0x01FE,
    /// Restart the radio.
    RebootRequest = 0x05DD,
}

impl From<MessageType> for u16 {
    fn from(ty: MessageType) -> Self {
        ty as u16
    }
}

impl TryFrom<u16> for MessageType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x01F4 => Ok(Self::ConnectRequest),
            0x01F5 => Ok(Self::ConnectResponse),
            0x01FB => Ok(Self::MemoryReadRequest),
            0x01FC => Ok(Self::MemoryReadResponse),
            0x01FD => Ok(Self::MemoryWriteRequest),
            0x01FE => Ok(Self::MemoryWriteResponse),
            0x05DD => Ok(Self::RebootRequest),
            other => Err(Error::Protocol(format!("unknown TK11 message {other:#06x}"))),
        }
    }
}

/// Message type of a decoded payload.
pub fn message_code(payload: &[u8]) -> Option<u16> {
    payload
        .get(..2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Frame and send one TK11 payload.
pub fn send_packet<P: Port + ?Sized>(port: &mut P, payload: &[u8]) -> Result<()> {
    send_frame(port, payload)
}

/// Wait for the next valid frame and require it to be `expected`.
///
/// Candidates whose CRC fails or that are too short to carry a message
/// type are skipped. The first valid frame of another type is an error.
pub fn read_packet<P: Port + ?Sized>(
    port: &mut P,
    expected: MessageType,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let deadline = Deadline::after(timeout);
    let mut scanner = FrameScanner::new();
    let decodes = |f: &Frame| f.payload.len() >= 2 && f.crc_valid();

    loop {
        if let Some(frame) = scanner.next_frame_where(decodes) {
            let actual = message_code(&frame.payload).unwrap_or_default();
            trace!("TK11 message {actual:#06x}, {} bytes", frame.payload.len());
            if actual != u16::from(expected) {
                return Err(Error::UnexpectedMessage {
                    expected: expected.into(),
                    actual,
                });
            }
            return Ok(frame.payload);
        }

        if deadline.expired() {
            return Err(deadline.error(&format!("TK11 {expected:?}")));
        }
        fill(port, &mut scanner)?;
    }
}

/// Build the connect request.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn connect_request() -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::with_capacity(6);
    buf.write_u16::<LittleEndian>(MessageType::ConnectRequest.into())
        .unwrap();
    buf.write_u32::<LittleEndian>(CONNECT_MAGIC).unwrap();
    buf
}

#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
#[allow(clippy::cast_possible_truncation)]
fn memory_header(ty: MessageType, address: u32, len: usize) -> Vec<u8> {
    let mut buf: Vec<u8> = Vec::with_capacity(HEADER_LEN + len);
    buf.write_u16::<LittleEndian>(ty.into()).unwrap();
    buf.write_u32::<LittleEndian>(address).unwrap();
    buf.write_u16::<LittleEndian>(len as u16).unwrap();
    buf.write_u32::<LittleEndian>(CONNECT_MAGIC).unwrap();
    buf
}

/// Build a read request; `address` is relative to [`ADDRESS_BASE`].
pub fn read_request(address: u32, len: usize) -> Vec<u8> {
    memory_header(
        MessageType::MemoryReadRequest,
        address.wrapping_add(ADDRESS_BASE),
        len,
    )
}

/// Build a write request; `address` is relative to [`ADDRESS_BASE`].
pub fn write_request(address: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = memory_header(
        MessageType::MemoryWriteRequest,
        address.wrapping_add(ADDRESS_BASE),
        data.len(),
    );
    buf.extend_from_slice(data);
    buf
}

/// Build the reboot request.
pub fn reboot_request() -> Vec<u8> {
    u16::from(MessageType::RebootRequest).to_le_bytes().to_vec()
}

/// Version string carried by a connect response, if any.
pub fn parse_version(payload: &[u8]) -> Option<String> {
    payload
        .get(VERSION_OFFSET..)
        .map(version_from_bytes)
        .filter(|v| !v.is_empty())
}

/// Extract `len` bytes of data from a read response.
pub fn parse_read_reply(payload: &[u8], len: usize) -> Result<Vec<u8>> {
    let end = HEADER_LEN + len;
    if payload.len() < end {
        return Err(Error::ShortResponse {
            needed: end,
            actual: payload.len(),
        });
    }
    Ok(payload[HEADER_LEN..end].to_vec())
}

fn check_range(address: usize, len: usize) -> Result<u32> {
    if len == 0 || len > MAX_CHUNK {
        return Err(Error::Protocol(format!(
            "TK11 block size {len} outside 1..={MAX_CHUNK}"
        )));
    }
    u32::try_from(address)
        .ok()
        .filter(|a| a.checked_add(ADDRESS_BASE).is_some())
        .ok_or_else(|| Error::Protocol(format!("TK11 address {address:#x} out of range")))
}

/// TK11 operations over a shared transport.
///
/// Reads and writes run under a [`RetryPolicy`]; each attempt takes the
/// transport lock for one exchange only.
#[derive(Debug, Clone)]
pub struct Tk11Codec {
    timeout: Duration,
    retry: RetryPolicy,
}

impl Default for Tk11Codec {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl Tk11Codec {
    /// Codec with `timeout` per exchange and the standard TK11 retry policy.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            retry: RetryPolicy::tk11(),
        }
    }

    /// Replace the retry policy for reads and writes.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Per-exchange deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a session; returns the version string if the radio sent one.
    pub fn init(&self, transport: &Transport) -> Result<Option<String>> {
        let mut port = lock(transport)?;
        send_packet(&mut *port, &connect_request())?;
        let reply = read_packet(&mut *port, MessageType::ConnectResponse, self.timeout)?;
        let version = parse_version(&reply);
        debug!("TK11 connected, version {version:?}");
        Ok(version)
    }

    /// Read `len` (at most [`MAX_CHUNK`]) bytes at relative `address`.
    pub fn read(&self, transport: &Transport, address: usize, len: usize) -> Result<Vec<u8>> {
        let addr = check_range(address, len)?;
        let request = read_request(addr, len);
        self.retry.run("TK11 read", |attempt| {
            let mut port = lock(transport)?;
            if attempt > 1 {
                port.clear_buffers()?;
            }
            send_packet(&mut *port, &request)?;
            let reply = read_packet(&mut *port, MessageType::MemoryReadResponse, self.timeout)?;
            parse_read_reply(&reply, len)
        })
    }

    /// Write `data` (at most [`MAX_CHUNK`] bytes) at relative `address`.
    pub fn write(&self, transport: &Transport, address: usize, data: &[u8]) -> Result<()> {
        let addr = check_range(address, data.len())?;
        let request = write_request(addr, data);
        self.retry.run("TK11 write", |attempt| {
            let mut port = lock(transport)?;
            if attempt > 1 {
                port.clear_buffers()?;
            }
            send_packet(&mut *port, &request)?;
            read_packet(&mut *port, MessageType::MemoryWriteResponse, self.timeout)?;
            Ok(())
        })
    }

    /// Ask the radio to reboot. Nothing is awaited.
    pub fn reboot(&self, transport: &Transport) -> Result<()> {
        let mut port = lock(transport)?;
        send_packet(&mut *port, &reboot_request())
    }
}

/// Open a TK11 session with the default deadline.
pub fn tk11_init(transport: &Transport) -> Result<Option<String>> {
    Tk11Codec::default().init(transport)
}

/// Read one block with the default deadline and retry policy.
pub fn tk11_read(transport: &Transport, address: usize, len: usize) -> Result<Vec<u8>> {
    Tk11Codec::default().read(transport, address, len)
}

/// Write one block with the default deadline and retry policy.
pub fn tk11_write(transport: &Transport, address: usize, data: &[u8]) -> Result<()> {
    Tk11Codec::default().write(transport, address, data)
}

/// Reboot the radio.
pub fn tk11_reboot(transport: &Transport) -> Result<()> {
    Tk11Codec::default().reboot(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::LoopbackPort;
    use crate::protocol::frame::encode_frame;

    fn response(ty: MessageType, body: &[u8]) -> Vec<u8> {
        let mut payload = u16::from(ty).to_le_bytes().to_vec();
        payload.extend_from_slice(body);
        encode_frame(&payload).unwrap()
    }

    #[test]
    fn test_message_type_roundtrip() {
        for ty in [
            MessageType::ConnectRequest,
            MessageType::MemoryReadResponse,
            MessageType::RebootRequest,
        ] {
            assert_eq!(MessageType::try_from(u16::from(ty)).unwrap(), ty);
        }
        assert!(MessageType::try_from(0x1234).is_err());
    }

    #[test]
    fn test_request_layouts() {
        assert_eq!(connect_request(), vec![0xF4, 0x01, 0x05, 0x00, 0x00, 0x00]);

        let read = read_request(0x1000, 0x100);
        assert_eq!(read.len(), HEADER_LEN);
        assert_eq!(&read[..2], &[0xFB, 0x01]);
        assert_eq!(&read[2..6], &0x08_1000u32.to_le_bytes());
        assert_eq!(&read[6..8], &[0x00, 0x01]);
        assert_eq!(&read[8..12], &CONNECT_MAGIC.to_le_bytes());

        let write = write_request(0, &[1, 2, 3]);
        assert_eq!(&write[..2], &[0xFD, 0x01]);
        assert_eq!(&write[2..6], &ADDRESS_BASE.to_le_bytes());
        assert_eq!(&write[6..8], &[3, 0]);
        assert_eq!(&write[HEADER_LEN..], &[1, 2, 3]);

        assert_eq!(reboot_request(), vec![0xDD, 0x05]);
    }

    #[test]
    fn test_parse_version_optional() {
        let mut payload = vec![0xF5, 0x01, 0, 0, 0, 0, 0, 0];
        assert_eq!(parse_version(&payload), None);
        payload.extend_from_slice(b"TK11-1.4\0\0");
        assert_eq!(parse_version(&payload).as_deref(), Some("TK11-1.4"));
    }

    #[test]
    fn test_read_packet_rejects_other_type() {
        let mut port = LoopbackPort::new();
        port.feed(&response(MessageType::ConnectResponse, &[0; 6]));
        let err = read_packet(&mut port, MessageType::MemoryReadResponse, DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedMessage {
                expected: 0x01FC,
                actual: 0x01F5
            }
        ));
    }

    #[test]
    fn test_read_packet_skips_corrupt_candidate() {
        let mut corrupt = response(MessageType::ConnectResponse, &[0; 6]);
        corrupt[6] ^= 0x80;
        let mut port = LoopbackPort::new();
        port.feed(&corrupt);
        port.feed(&response(MessageType::MemoryWriteResponse, &[0; 10]));

        let payload =
            read_packet(&mut port, MessageType::MemoryWriteResponse, DEFAULT_TIMEOUT).unwrap();
        assert_eq!(message_code(&payload), Some(0x01FE));
    }

    #[test]
    fn test_short_read_reply() {
        let mut payload = vec![0xFC, 0x01];
        payload.extend_from_slice(&[0; 10]);
        payload.extend_from_slice(&[0xAA; 8]);
        assert_eq!(parse_read_reply(&payload, 8).unwrap(), vec![0xAA; 8]);
        assert!(matches!(
            parse_read_reply(&payload, 16),
            Err(Error::ShortResponse {
                needed: 28,
                actual: 20
            })
        ));
    }

    #[test]
    fn test_range_checks() {
        assert!(check_range(0, 0).is_err());
        assert!(check_range(0, MAX_CHUNK + 1).is_err());
        assert_eq!(check_range(0xF000, MAX_CHUNK).unwrap(), 0xF000);
    }
}
