//! Firmware flashing through the K5 bootloader.
//!
//! The radio enters its bootloader when powered on with PTT held. It then
//! broadcasts a beacon frame roughly every half second until a host takes
//! over:
//!
//! ```text
//! radio                          host
//!   | -- 0x18 beacon ----------->  |   wait (up to BOOTLOADER_TIMEOUT)
//!   | <---------- 0x30 version --  |   16-byte version block
//!   | -- 0x18 beacon ----------->  |
//!   | <---------- 0x19 page 0 ---  |
//!   | -- 0x1A ack (page 0, ok) ->  |
//!   |            ...               |
//!   | <---------- 0x19 page N-1 -  |
//!   | -- 0x1A ack (page N-1) --->  |
//! ```
//!
//! Page request: `19 05 0C 01 | ts:u32 | page:u16 | pages:u16 | len:u16 | 00 00 | data[256]`.
//! Page ack:     `1A 05 08 00 | ts:u32 | page:u16 | err:u16`.

use std::fmt;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::image::Firmware;
use crate::image::firmware::VERSION_LEN;
use crate::port::{Port, Transport, lock};
use crate::protocol::frame::{Deadline, FrameScanner};
use crate::protocol::k5::{Opcode, read_packet_into, send_packet, version_from_bytes};
use crate::radio::CancelToken;

/// How long to wait for the radio to show up in bootloader mode.
pub const BOOTLOADER_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for each page acknowledgement.
pub const PAGE_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Bytes per flash page.
pub const PAGE_SIZE: usize = 256;

/// Largest firmware body the bootloader accepts.
pub const MAX_BODY_LEN: usize = 0xF000;

/// Timestamp field of page writes.
pub const FLASH_TIMESTAMP: u32 = 0x8A8D_9F1D;

/// Offset of the bootloader version in a beacon.
const BEACON_VERSION_OFFSET: usize = 20;

/// Build the version announcement.
pub fn version_request(block: &[u8; VERSION_LEN]) -> Vec<u8> {
    let mut buf = vec![u8::from(Opcode::FlashVersion), 0x05, 0x10, 0x00];
    buf.extend_from_slice(block);
    buf
}

/// Build the request writing `chunk` as page `page` of `page_count`.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
#[allow(clippy::cast_possible_truncation)]
pub fn page_request(page: u16, page_count: u16, chunk: &[u8]) -> Vec<u8> {
    let len = chunk.len().min(PAGE_SIZE);
    let mut buf = vec![u8::from(Opcode::FlashWrite), 0x05, 0x0C, 0x01];
    buf.write_u32::<LittleEndian>(FLASH_TIMESTAMP).unwrap();
    buf.write_u16::<LittleEndian>(page).unwrap();
    buf.write_u16::<LittleEndian>(page_count).unwrap();
    buf.write_u16::<LittleEndian>(len as u16).unwrap();
    buf.write_u16::<LittleEndian>(0).unwrap();
    buf.extend_from_slice(&chunk[..len]);
    buf.resize(16 + PAGE_SIZE, 0);
    buf
}

/// Bootloader version carried by a beacon.
pub fn parse_beacon(payload: &[u8]) -> String {
    payload
        .get(BEACON_VERSION_OFFSET..)
        .map(version_from_bytes)
        .unwrap_or_default()
}

/// Page number and error code of an acknowledgement.
pub fn parse_page_ack(payload: &[u8]) -> Result<(u16, u16)> {
    if payload.len() < 12 {
        return Err(Error::ShortResponse {
            needed: 12,
            actual: payload.len(),
        });
    }
    Ok((
        LittleEndian::read_u16(&payload[8..10]),
        LittleEndian::read_u16(&payload[10..12]),
    ))
}

/// Writes a firmware body through the K5 bootloader.
pub struct K5Flasher {
    transport: Transport,
    bootloader_timeout: Duration,
    ack_timeout: Duration,
    cancel: CancelToken,
}

impl K5Flasher {
    /// Flasher on `transport` with default timeouts.
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            bootloader_timeout: BOOTLOADER_TIMEOUT,
            ack_timeout: PAGE_ACK_TIMEOUT,
            cancel: CancelToken::new(),
        }
    }

    /// Set how long to wait for the bootloader beacon.
    #[must_use]
    pub fn with_bootloader_timeout(mut self, timeout: Duration) -> Self {
        self.bootloader_timeout = timeout;
        self
    }

    /// Set how long to wait for each page acknowledgement.
    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Use `cancel` to stop waiting for the bootloader or between pages.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wait for a bootloader beacon and return the bootloader version.
    pub fn wait_for_bootloader(&self) -> Result<String> {
        let mut port = lock(&self.transport)?;
        let beacon = self.await_beacon(&mut *port)?;
        let version = parse_beacon(&beacon);
        info!("Bootloader detected, version {version:?}");
        Ok(version)
    }

    /// Announce the firmware version block and wait for the next beacon.
    pub fn announce_version(&self, block: &[u8; VERSION_LEN]) -> Result<()> {
        let mut port = lock(&self.transport)?;
        debug!("Announcing firmware version {:?}", version_from_bytes(block));
        send_packet(&mut *port, &version_request(block))?;
        self.await_beacon(&mut *port)?;
        Ok(())
    }

    /// Write one page and wait for its acknowledgement.
    pub fn write_page(&self, page: u16, page_count: u16, chunk: &[u8]) -> Result<()> {
        let mut port = lock(&self.transport)?;
        send_packet(&mut *port, &page_request(page, page_count, chunk))?;
        await_ack(&mut *port, page, self.ack_timeout, &|| self.cancel.is_cancelled())
    }

    fn await_beacon<P: Port + ?Sized>(&self, port: &mut P) -> Result<Vec<u8>> {
        read_packet_into(
            port,
            &mut FrameScanner::new(),
            Opcode::BootloaderBeacon,
            &Deadline::after(self.bootloader_timeout),
            &|| self.cancel.is_cancelled(),
        )
    }

    /// Flash `firmware`, reporting progress as a fraction of pages written.
    pub fn flash(&self, firmware: &Firmware, progress: &mut dyn FnMut(f64)) -> Result<()> {
        let body = firmware.body();
        if body.is_empty() || body.len() > MAX_BODY_LEN {
            return Err(Error::InvalidFirmware(format!(
                "body of {} bytes does not fit the {MAX_BODY_LEN:#x}-byte flash",
                body.len()
            )));
        }
        let pages = body.len().div_ceil(PAGE_SIZE);
        let page_count = u16::try_from(pages)
            .map_err(|_| Error::InvalidFirmware(format!("{pages} pages is too many")))?;

        self.wait_for_bootloader()?;
        self.announce_version(firmware.version_block())?;

        info!(
            "Flashing {} bytes ({page_count} pages), version {}",
            body.len(),
            firmware.version()
        );
        for (page, chunk) in (0..page_count).zip(body.chunks(PAGE_SIZE)) {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.write_page(page, page_count, chunk)?;
            progress(f64::from(page + 1) / f64::from(page_count));
        }
        info!("Flashing complete!");
        Ok(())
    }
}

impl fmt::Debug for K5Flasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("K5Flasher")
            .field("bootloader_timeout", &self.bootloader_timeout)
            .field("ack_timeout", &self.ack_timeout)
            .finish_non_exhaustive()
    }
}

fn await_ack<P: Port + ?Sized>(
    port: &mut P,
    page: u16,
    timeout: Duration,
    cancelled: &dyn Fn() -> bool,
) -> Result<()> {
    let deadline = Deadline::after(timeout);
    // Stale acks and the awaited one can share a read
    let mut scanner = FrameScanner::new();
    loop {
        let reply = read_packet_into(port, &mut scanner, Opcode::FlashWriteAck, &deadline, cancelled)?;
        let (acked, err) = parse_page_ack(&reply)?;
        if acked != page {
            trace!("Ignoring ack for page {acked} while waiting for {page}");
            continue;
        }
        if err != 0 {
            return Err(Error::Protocol(format!(
                "bootloader rejected page {page} with error {err:#06x}"
            )));
        }
        return Ok(());
    }
}
