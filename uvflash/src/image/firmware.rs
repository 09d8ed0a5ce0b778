//! K5-family firmware images.
//!
//! Images reach users in three shapes and are told apart by content alone:
//!
//! - **Raw**: a plain Cortex-M image whose first word is an initial stack
//!   pointer in SRAM (`0x2000_0000..=0x2001_0000`).
//! - **Packed with CRC**: XOR-obfuscated with [`FIRMWARE_KEY`], followed by
//!   the CRC-16/CCITT of everything before it, little-endian.
//! - **Packed**: obfuscated, no trailing CRC.
//!
//! ## Packed Layout (after de-obfuscation)
//!
//! ```text
//! 0x0000 +---------------------+
//!        |  code               |
//! 0x2000 +---------------------+
//!        |  version (16 bytes) |  <- not flashed
//! 0x2010 +---------------------+
//!        |  code (continued)   |
//!        +---------------------+
//!        |  CRC16 (optional)   |  <- on the obfuscated bytes
//!        +---------------------+
//! ```
//!
//! Unpacking a packed image removes the version window, so the flashable
//! body is 16 bytes shorter than the de-obfuscated image. Raw images are
//! flashed unchanged; their version is still read from `0x2000`.

use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::error::{Error, Result};
use crate::protocol::crc::{crc16_ccitt, crc16_ccitt_le};
use crate::protocol::k5::version_from_bytes;
use crate::protocol::obfuscation::{FIRMWARE_KEY, xor_in_place};

/// Offset of the version block in a de-obfuscated image.
pub const VERSION_OFFSET: usize = 0x2000;

/// Length of the version block.
pub const VERSION_LEN: usize = 16;

/// Smallest image that still contains the version block.
pub const MIN_IMAGE_LEN: usize = VERSION_OFFSET + VERSION_LEN;

/// Initial stack pointer values that mark an image as raw.
pub const STACK_POINTER_RANGE: RangeInclusive<u32> = 0x2000_0000..=0x2001_0000;

/// Shape of a firmware file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum FirmwareForm {
    /// Plain image, never obfuscated.
    Raw,
    /// Obfuscated image whose trailing CRC checks out.
    PackedWithCrc,
    /// Obfuscated image without a valid trailing CRC.
    Packed,
}

impl std::fmt::Display for FirmwareForm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::PackedWithCrc => write!(f, "packed (CRC verified)"),
            Self::Packed => write!(f, "packed (no CRC)"),
        }
    }
}

/// Whether `buf` starts with a plausible SRAM stack pointer.
pub fn is_raw_firmware(buf: &[u8]) -> bool {
    buf.len() >= 4 && STACK_POINTER_RANGE.contains(&LittleEndian::read_u32(buf))
}

/// Whether the last two bytes of `buf` are the CRC of the rest.
pub fn has_crc_validation(buf: &[u8]) -> bool {
    stored_and_computed_crc(buf).is_some_and(|(stored, computed)| stored == computed)
}

fn stored_and_computed_crc(buf: &[u8]) -> Option<(u16, u16)> {
    let split = buf.len().checked_sub(2).filter(|&n| n > 0)?;
    let stored = LittleEndian::read_u16(&buf[split..]);
    Some((stored, crc16_ccitt(&buf[..split])))
}

/// Classify `buf` into exactly one [`FirmwareForm`].
///
/// The raw check wins: an image that looks raw is never de-obfuscated.
pub fn classify(buf: &[u8]) -> FirmwareForm {
    if is_raw_firmware(buf) {
        FirmwareForm::Raw
    } else if has_crc_validation(buf) {
        FirmwareForm::PackedWithCrc
    } else {
        FirmwareForm::Packed
    }
}

/// How strictly to treat images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackOptions {
    /// Reject packed images that carry no valid CRC.
    pub require_crc: bool,
}

/// An unpacked firmware image ready for flashing.
#[derive(Clone, PartialEq, Eq)]
pub struct Firmware {
    form: FirmwareForm,
    version_block: [u8; VERSION_LEN],
    body: Vec<u8>,
}

impl Firmware {
    /// Unpack `buf`, accepting packed images without a CRC.
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        Self::unpack_with(buf, UnpackOptions::default())
    }

    /// Unpack `buf` under `options`.
    pub fn unpack_with(buf: &[u8], options: UnpackOptions) -> Result<Self> {
        let form = classify(buf);
        let image = match form {
            FirmwareForm::Raw => buf.to_vec(),
            FirmwareForm::PackedWithCrc => {
                let mut image = buf[..buf.len() - 2].to_vec();
                xor_in_place(&mut image, &FIRMWARE_KEY);
                image
            },
            FirmwareForm::Packed => {
                if options.require_crc {
                    return Err(match stored_and_computed_crc(buf) {
                        Some((stored, computed)) => Error::CrcMismatch {
                            expected: stored,
                            actual: computed,
                        },
                        None => Error::InvalidFirmware("image too short to carry a CRC".into()),
                    });
                }
                let mut image = buf.to_vec();
                xor_in_place(&mut image, &FIRMWARE_KEY);
                image
            },
        };

        // Short images keep whatever part of the window they reach; the rest
        // of the block stays zero and reads as a shorter version.
        let window = VERSION_OFFSET.min(image.len())..MIN_IMAGE_LEN.min(image.len());
        let mut version_block = [0u8; VERSION_LEN];
        version_block[..window.len()].copy_from_slice(&image[window.clone()]);

        let body = if form == FirmwareForm::Raw {
            image
        } else {
            let mut body = image;
            body.drain(window);
            body
        };

        debug!(
            "Firmware: {form}, version {:?}, body {} bytes",
            version_from_bytes(&version_block),
            body.len()
        );

        Ok(Self {
            form,
            version_block,
            body,
        })
    }

    /// Read and unpack a firmware file.
    pub fn from_file<P: AsRef<Path>>(path: P, options: UnpackOptions) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware from: {}", path.display());
        let data = fs::read(path)?;
        Self::unpack_with(&data, options)
    }

    /// Detected file shape.
    pub fn form(&self) -> FirmwareForm {
        self.form
    }

    /// The 16-byte version block as stored in the image.
    pub fn version_block(&self) -> &[u8; VERSION_LEN] {
        &self.version_block
    }

    /// Version block decoded as text.
    pub fn version(&self) -> String {
        version_from_bytes(&self.version_block)
    }

    /// Bytes to flash.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Consume the image, keeping the bytes to flash.
    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

impl std::fmt::Debug for Firmware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Firmware")
            .field("form", &self.form)
            .field("version", &self.version())
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Version string of the image in `buf`.
pub fn unpack_firmware_version(buf: &[u8]) -> Result<String> {
    Firmware::unpack(buf).map(|fw| fw.version())
}

/// Flashable body of the image in `buf`.
pub fn unpack_firmware(buf: &[u8]) -> Result<Vec<u8>> {
    Firmware::unpack(buf).map(Firmware::into_body)
}

/// Encode a version string into a NUL-padded block.
pub fn version_block(version: &str) -> Result<[u8; VERSION_LEN]> {
    let bytes = version.as_bytes();
    if bytes.len() > VERSION_LEN {
        return Err(Error::InvalidFirmware(format!(
            "version {version:?} is longer than {VERSION_LEN} bytes"
        )));
    }
    let mut block = [0u8; VERSION_LEN];
    block[..bytes.len()].copy_from_slice(bytes);
    Ok(block)
}

/// Build a packed image with CRC from a flashable `body`.
///
/// Inserts the version block at [`VERSION_OFFSET`], obfuscates the result
/// and appends its CRC.
pub fn pack_firmware(body: &[u8], version: &str) -> Result<Vec<u8>> {
    if body.len() < VERSION_OFFSET {
        return Err(Error::InvalidFirmware(format!(
            "body of {} bytes ends before the version block at {VERSION_OFFSET:#x}",
            body.len()
        )));
    }
    let block = version_block(version)?;

    let mut image = Vec::with_capacity(body.len() + VERSION_LEN + 2);
    image.extend_from_slice(&body[..VERSION_OFFSET]);
    image.extend_from_slice(&block);
    image.extend_from_slice(&body[VERSION_OFFSET..]);
    xor_in_place(&mut image, &FIRMWARE_KEY);

    let crc = crc16_ccitt_le(&image);
    image.extend_from_slice(&crc);
    Ok(image)
}
