//! K5/K1 EEPROM programming protocol.
//!
//! Requests and responses share the framing in [`crate::protocol::frame`].
//! The first payload byte is an [`Opcode`]; the second is always `0x05`.
//!
//! ## Requests
//!
//! ```text
//! init   : 14 05 04 00 | ts:u32
//! read   : 1B 05 08 00 | addr:u16 | size:u8 | 00 | ts:u32
//! write  : 1D 05 len:u16 | addr:u16 | size:u8 | 01 | ts:u32 | data[size]
//! reboot : DD 05
//! ```
//!
//! ## Responses
//!
//! ```text
//! version: 15 05 .. .. | version[16] (NUL padded) | ...
//! read   : 1C 05 .. .. | addr:u16 | size:u8 | 00 | data[size]
//! write  : 1E 05 .. .. | addr:u16
//! ```
//!
//! The radio fills response CRCs inconsistently, so frames are accepted on
//! their markers and opcode alone. Frames carrying any other opcode are
//! dropped and the scan continues until the deadline.

use std::time::Duration;

use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, trace};

use crate::error::{Error, Result};
use crate::port::{Port, Transport, lock};
use crate::protocol::frame::{Deadline, FrameScanner, fill, send_frame};

/// Default deadline for one EEPROM exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest block one read request may ask for.
pub const READ_BLOCK_SIZE: usize = 64;

/// Largest block one write request may carry (size field is one byte).
pub const MAX_WRITE_SIZE: usize = 0xFF;

/// Size of the EEPROM address space.
pub const ADDRESS_SPACE: usize = 0x1_0000;

/// Session timestamp echoed by the radio; any constant works.
pub const SESSION_TIMESTAMP: u32 = 0x646F_9C46;

/// Length of the version field in the init response.
pub const VERSION_LEN: usize = 16;

/// Offset of the data in a read response.
const READ_DATA_OFFSET: usize = 8;

/// Offset of the echoed size in a read response.
const READ_SIZE_OFFSET: usize = 6;

/// Offset of the version string in the init response.
const VERSION_OFFSET: usize = 4;

/// K5 opcodes, request and response alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Session hello.
    Hello = 0x14,
    /// Firmware version reply to [`Opcode::Hello`].
    Version = 0x15,
    /// Periodic bootloader announcement.
    BootloaderBeacon = 0x18,
    /// Firmware page write.
    FlashWrite = 0x19,
    /// Firmware page acknowledgement.
    FlashWriteAck = 0x1A,
    /// EEPROM read request.
    ReadEeprom = 0x1B,
    /// EEPROM read reply.
    ReadEepromReply = 0x1C,
    /// EEPROM write request.
    WriteEeprom = 0x1D,
    /// EEPROM write acknowledgement.
    WriteEepromAck = 0x1E,
    /// Firmware version announcement sent to the bootloader.
    FlashVersion = 0x30,
    /// Reboot request, never answered.
    Reboot = 0xDD,
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        op as u8
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x14 => Ok(Self::Hello),
            0x15 => Ok(Self::Version),
            0x18 => Ok(Self::BootloaderBeacon),
            0x19 => Ok(Self::FlashWrite),
            0x1A => Ok(Self::FlashWriteAck),
            0x1B => Ok(Self::ReadEeprom),
            0x1C => Ok(Self::ReadEepromReply),
            0x1D => Ok(Self::WriteEeprom),
            0x1E => Ok(Self::WriteEepromAck),
            0x30 => Ok(Self::FlashVersion),
            0xDD => Ok(Self::Reboot),
            other => Err(Error::Protocol(format!("unknown K5 opcode {other:#04x}"))),
        }
    }
}

/// Frame and send one K5 payload.
pub fn send_packet<P: Port + ?Sized>(port: &mut P, payload: &[u8]) -> Result<()> {
    send_frame(port, payload)
}

/// Wait for a frame whose opcode is `expected` and return its payload.
///
/// Frames with other opcodes are discarded. Fails with [`Error::Timeout`]
/// once `timeout` passes without a match.
pub fn read_packet<P: Port + ?Sized>(
    port: &mut P,
    expected: Opcode,
    timeout: Duration,
) -> Result<Vec<u8>> {
    read_packet_into(
        port,
        &mut FrameScanner::new(),
        expected,
        &Deadline::after(timeout),
        &|| false,
    )
}

/// [`read_packet`] over a caller-owned `scanner`, stopping with
/// [`Error::Cancelled`] once `cancelled` returns true.
///
/// Frames behind the returned one stay buffered in `scanner`.
pub fn read_packet_into<P: Port + ?Sized>(
    port: &mut P,
    scanner: &mut FrameScanner,
    expected: Opcode,
    deadline: &Deadline,
    cancelled: &dyn Fn() -> bool,
) -> Result<Vec<u8>> {
    loop {
        if cancelled() {
            return Err(Error::Cancelled);
        }
        while let Some(frame) = scanner.next_frame() {
            match frame.payload.first() {
                Some(&op) if op == u8::from(expected) => return Ok(frame.payload),
                Some(&op) => trace!("Discarding K5 frame {op:#04x} while waiting for {expected:?}"),
                None => trace!("Discarding empty K5 frame"),
            }
        }

        if deadline.expired() {
            return Err(deadline.error(&format!("K5 {expected:?} frame")));
        }
        fill(port, scanner)?;
    }
}

/// Build the hello request.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn hello_request() -> Vec<u8> {
    let mut buf = vec![u8::from(Opcode::Hello), 0x05, 0x04, 0x00];
    buf.write_u32::<LittleEndian>(SESSION_TIMESTAMP).unwrap();
    buf
}

/// Build a read request for `size` bytes at `address`.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn read_request(address: u16, size: u8) -> Vec<u8> {
    let mut buf = vec![u8::from(Opcode::ReadEeprom), 0x05, 0x08, 0x00];
    buf.write_u16::<LittleEndian>(address).unwrap();
    buf.push(size);
    buf.push(0x00);
    buf.write_u32::<LittleEndian>(SESSION_TIMESTAMP).unwrap();
    buf
}

/// Build a write request carrying `data` for `address`.
///
/// `data` must be at most [`MAX_WRITE_SIZE`] bytes long.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
#[allow(clippy::cast_possible_truncation)]
pub fn write_request(address: u16, data: &[u8]) -> Vec<u8> {
    let size = data.len().min(MAX_WRITE_SIZE);
    let mut buf: Vec<u8> = Vec::with_capacity(12 + size);
    buf.push(Opcode::WriteEeprom.into());
    buf.push(0x05);
    buf.write_u16::<LittleEndian>((size + 8) as u16).unwrap();
    buf.write_u16::<LittleEndian>(address).unwrap();
    buf.push(size as u8);
    buf.push(0x01);
    buf.write_u32::<LittleEndian>(SESSION_TIMESTAMP).unwrap();
    buf.extend_from_slice(&data[..size]);
    buf
}

/// Build the reboot request.
pub fn reboot_request() -> Vec<u8> {
    vec![u8::from(Opcode::Reboot), 0x05]
}

/// Extract the NUL-terminated version string from an init response.
pub fn parse_version(payload: &[u8]) -> Result<String> {
    let end = VERSION_OFFSET + VERSION_LEN;
    if payload.len() < end {
        return Err(Error::ShortResponse {
            needed: end,
            actual: payload.len(),
        });
    }
    Ok(version_from_bytes(&payload[VERSION_OFFSET..end]))
}

/// Decode a NUL-padded ASCII field.
pub fn version_from_bytes(raw: &[u8]) -> String {
    let text = raw.split(|&b| b == 0).next().unwrap_or_default();
    String::from_utf8_lossy(text).trim().to_string()
}

/// Validate a read response and extract its data.
pub fn parse_read_reply(payload: &[u8], size: usize) -> Result<Vec<u8>> {
    if payload.len() <= READ_SIZE_OFFSET {
        return Err(Error::ShortResponse {
            needed: READ_DATA_OFFSET + size,
            actual: payload.len(),
        });
    }
    let echoed = usize::from(payload[READ_SIZE_OFFSET]);
    if echoed != size {
        return Err(Error::SizeMismatch {
            expected: size,
            actual: echoed,
        });
    }
    let end = READ_DATA_OFFSET + size;
    if payload.len() < end {
        return Err(Error::ShortResponse {
            needed: end,
            actual: payload.len(),
        });
    }
    Ok(payload[READ_DATA_OFFSET..end].to_vec())
}

fn check_range(address: usize, size: usize, max: usize) -> Result<(u16, u8)> {
    if size == 0 || size > max {
        return Err(Error::Protocol(format!(
            "K5 block size {size} outside 1..={max}"
        )));
    }
    if address.checked_add(size).is_none_or(|end| end > ADDRESS_SPACE) {
        return Err(Error::Protocol(format!(
            "K5 range {address:#06x}+{size:#x} exceeds the EEPROM"
        )));
    }
    match (u16::try_from(address), u8::try_from(size)) {
        (Ok(a), Ok(s)) => Ok((a, s)),
        _ => Err(Error::Protocol(format!(
            "K5 range {address:#06x}+{size:#x} not encodable"
        ))),
    }
}

/// K5 EEPROM operations over a shared transport.
///
/// Each operation holds the transport lock for exactly one exchange.
#[derive(Debug, Clone, Copy)]
pub struct K5Codec {
    timeout: Duration,
}

impl Default for K5Codec {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl K5Codec {
    /// Codec waiting up to `timeout` for each reply.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Per-exchange deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Say hello and return the radio's firmware version.
    pub fn init(&self, transport: &Transport) -> Result<String> {
        let mut port = lock(transport)?;
        send_packet(&mut *port, &hello_request())?;
        let reply = read_packet(&mut *port, Opcode::Version, self.timeout)?;
        let version = parse_version(&reply)?;
        debug!("K5 firmware version: {version}");
        Ok(version)
    }

    /// Read `size` (at most [`READ_BLOCK_SIZE`]) bytes at `address`.
    pub fn read(&self, transport: &Transport, address: usize, size: usize) -> Result<Vec<u8>> {
        let (addr, len) = check_range(address, size, READ_BLOCK_SIZE)?;
        let mut port = lock(transport)?;
        send_packet(&mut *port, &read_request(addr, len))?;
        let reply = read_packet(&mut *port, Opcode::ReadEepromReply, self.timeout)?;
        parse_read_reply(&reply, size)
    }

    /// Write `data` (at most [`MAX_WRITE_SIZE`] bytes) at `address`.
    pub fn write(&self, transport: &Transport, address: usize, data: &[u8]) -> Result<()> {
        let (addr, _) = check_range(address, data.len(), MAX_WRITE_SIZE)?;
        let mut port = lock(transport)?;
        send_packet(&mut *port, &write_request(addr, data))?;
        read_packet(&mut *port, Opcode::WriteEepromAck, self.timeout)?;
        Ok(())
    }

    /// Ask the radio to reboot. Nothing is awaited.
    pub fn reboot(&self, transport: &Transport) -> Result<()> {
        let mut port = lock(transport)?;
        send_packet(&mut *port, &reboot_request())
    }
}

/// Say hello with the default deadline; returns the firmware version.
pub fn eeprom_init(transport: &Transport) -> Result<String> {
    K5Codec::default().init(transport)
}

/// Read one EEPROM block with the default deadline.
pub fn eeprom_read(transport: &Transport, address: usize, size: usize) -> Result<Vec<u8>> {
    K5Codec::default().read(transport, address, size)
}

/// Write one EEPROM block with the default deadline.
pub fn eeprom_write(transport: &Transport, address: usize, data: &[u8]) -> Result<()> {
    K5Codec::default().write(transport, address, data)
}

/// Reboot the radio.
pub fn eeprom_reboot(transport: &Transport) -> Result<()> {
    K5Codec::default().reboot(transport)
}
