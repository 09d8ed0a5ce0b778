//! CRC-16 checksums used on the wire and in firmware images.
//!
//! Frames and firmware files use the same CRC-16/XMODEM (polynomial 0x1021,
//! zero initial value, no reflection, no final XOR). Frames carry it in the
//! obfuscated trailer; firmware files store it little-endian in their last
//! two bytes.

use crc::{CRC_16_XMODEM, Crc};

const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC-16/XMODEM over `data`.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    XMODEM.checksum(data)
}

/// Checksum of a firmware image body, the CCITT flavour used by the
/// vendor's firmware tools. Identical to [`crc16_xmodem`].
pub fn crc16_ccitt(data: &[u8]) -> u16 {
    crc16_xmodem(data)
}

/// [`crc16_ccitt`] as the two trailing bytes of a firmware file.
pub fn crc16_ccitt_le(data: &[u8]) -> [u8; 2] {
    crc16_ccitt(data).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// MSB-first shift register, one bit at a time.
    fn bitwise(data: &[u8]) -> u16 {
        let mut crc = 0u16;
        for &byte in data {
            crc ^= u16::from(byte) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ 0x1021
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    #[test]
    fn test_xmodem_known_vectors() {
        assert_eq!(crc16_xmodem(&[]), 0x0000);
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
        assert_eq!(crc16_xmodem(&[0x00]), 0x0000);
        assert_eq!(crc16_xmodem(b"A"), 0x58E5);
    }

    #[test]
    fn test_ccitt_known_vectors() {
        assert_eq!(crc16_ccitt(&[]), 0x0000);
        assert_eq!(crc16_ccitt(b"123456789"), 0x31C3);
        assert_eq!(crc16_ccitt_le(b"123456789"), [0xC3, 0x31]);
    }

    #[test]
    fn test_matches_shift_register() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        assert_eq!(crc16_ccitt(&data), bitwise(&data));
        assert_eq!(crc16_ccitt(&[0xFF; 3]), bitwise(&[0xFF; 3]));
    }
}
