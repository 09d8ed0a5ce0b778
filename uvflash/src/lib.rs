//! # uvflash
//!
//! A library for programming Quansheng UV-K5, UV-K1 and TK11 radios over
//! their serial programming cable.
//!
//! This crate provides:
//!
//! - K5/K1 EEPROM protocol (init, block read/write, reboot)
//! - TK11 internal-flash protocol with automatic retry
//! - Firmware image unpacking and packing (raw and XOR-packed, CRC checked)
//! - K5 bootloader flashing
//! - Connection ownership with exclusive claims and state notifications
//! - Range-level backup, restore, calibration and clean operations
//!
//! ## Features
//!
//! - `native` (default): serial ports through the `serialport` crate
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use uvflash::{CancelToken, ConnectionManager, RadioFamily, SerialConfig, bulk};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ConnectionManager::new();
//!     manager.connect(&SerialConfig::new("/dev/ttyUSB0", 38400))?;
//!
//!     let claim = manager.try_claim("backup").ok_or("connection busy")?;
//!     let radio = claim.radio(RadioFamily::K5)?;
//!     radio.init()?;
//!
//!     let image = bulk::backup(&radio, &CancelToken::new(), &mut |fraction| {
//!         println!("{:.0}%", fraction * 100.0);
//!     })?;
//!     std::fs::write("backup.bin", image)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod connection;
pub mod device;
pub mod error;
pub mod flash;
pub mod image;
pub mod port;
pub mod protocol;
pub mod radio;
mod subscribers;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    connection::{ClaimGuard, ConnectionManager, ConnectionState},
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports, select_best},
    error::{Error, Result},
    flash::K5Flasher,
    image::{Firmware, FirmwareForm, UnpackOptions, pack_firmware},
    port::{LoopbackPort, Port, SerialConfig, Transport},
    protocol::{K5Codec, MessageType, Opcode, RetryPolicy, Tk11Codec},
    radio::{CancelToken, ProtocolKind, Radio, RadioFamily, RadioSelector, bulk},
    subscribers::Subscription,
};

#[cfg(test)]
mod tests {
    use super::*;

    // One test only: the checker is process-wide.
    #[test]
    fn test_interrupt_checker_drives_cancel_tokens() {
        let token = CancelToken::new();

        test_set_interrupted(true);
        assert!(is_interrupted_requested());
        assert!(token.is_cancelled());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
        assert!(!token.is_cancelled());
    }
}
