//! Error types for uvflash.

use std::io;
use thiserror::Error;

/// Result type for uvflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for uvflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No transport is open.
    #[error("Not connected to a radio")]
    NotConnected,

    /// No matching frame arrived before the deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A structurally valid frame carried a message code we did not ask for.
    #[error("Unexpected message: expected {expected:#06x}, got {actual:#06x}")]
    UnexpectedMessage {
        /// Expected message code.
        expected: u16,
        /// Received message code.
        actual: u16,
    },

    /// The radio echoed a different block size than requested.
    #[error("Size mismatch: requested {expected} bytes, radio reported {actual}")]
    SizeMismatch {
        /// Requested size.
        expected: usize,
        /// Size reported by the radio.
        actual: usize,
    },

    /// A decoded response is shorter than the data it must carry.
    #[error("Short response: need {needed} bytes, got {actual}")]
    ShortResponse {
        /// Bytes needed.
        needed: usize,
        /// Bytes available.
        actual: usize,
    },

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// Expected CRC value.
        expected: u16,
        /// Actual CRC value.
        actual: u16,
    },

    /// Firmware image cannot be unpacked.
    #[error("Invalid firmware: {0}")]
    InvalidFirmware(String),

    /// Operation stopped by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Device not found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported radio or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same exchange can reasonably succeed.
    ///
    /// Integrity failures (CRC, size, short response) are never retryable:
    /// repeating the I/O cannot fix them.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) | Self::UnexpectedMessage { .. } => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }

    /// Whether this error means the link itself is gone.
    pub fn is_transport_failure(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            Self::NotConnected => true,
            _ => false,
        }
    }
}
