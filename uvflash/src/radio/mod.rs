//! Radio families and the protocol façade.
//!
//! A [`RadioFamily`] fixes the wire protocol, memory size, calibration
//! window and block size. A [`Radio`] binds one family to one transport and
//! exposes a single init/read/write/reboot surface; [`bulk`] drives it
//! across whole address ranges.

pub mod bulk;
pub mod session;

use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::port::DEFAULT_BAUD;
use crate::protocol::{k5, tk11};
use crate::subscribers::{Subscribers, Subscription};

pub use bulk::CancelToken;
pub use session::Radio;

/// Wire protocol spoken by a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// EEPROM protocol with single-byte opcodes.
    K5,
    /// Internal-flash protocol with typed messages.
    Tk11,
}

/// Supported radio families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RadioFamily {
    /// Quansheng UV-K5 and its derivatives.
    #[default]
    K5,
    /// Quansheng UV-K1 / UV-K5 V3 (larger EEPROM, same protocol).
    K1,
    /// Quansheng TK11.
    Tk11,
}

/// Memory map of a family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Total addressable bytes, starting at 0.
    pub size: usize,
    /// Factory calibration window, never touched by bulk erase.
    pub calibration: Range<usize>,
    /// Stride of bulk reads and writes.
    pub block_size: usize,
}

impl MemoryLayout {
    /// Ranges covering everything but the calibration window.
    pub fn non_calibration(&self) -> Vec<Range<usize>> {
        [
            0..self.calibration.start,
            self.calibration.end..self.size,
        ]
        .into_iter()
        .filter(|r| !r.is_empty())
        .collect()
    }
}

impl RadioFamily {
    /// All families.
    pub const ALL: [Self; 3] = [Self::K5, Self::K1, Self::Tk11];

    /// Protocol used on the wire.
    pub fn protocol(self) -> ProtocolKind {
        match self {
            Self::K5 | Self::K1 => ProtocolKind::K5,
            Self::Tk11 => ProtocolKind::Tk11,
        }
    }

    /// Memory map.
    pub fn layout(self) -> MemoryLayout {
        match self {
            Self::K5 => MemoryLayout {
                size: 0x2000,
                calibration: 0x1E00..0x2000,
                block_size: k5::READ_BLOCK_SIZE,
            },
            Self::K1 => MemoryLayout {
                size: 0x1_0000,
                calibration: 0x1E00..0x2000,
                block_size: k5::READ_BLOCK_SIZE,
            },
            Self::Tk11 => MemoryLayout {
                size: 0x1_0000,
                calibration: 0xF000..0x1_0000,
                block_size: tk11::MAX_CHUNK,
            },
        }
    }

    /// Baud rate of the programming cable.
    pub fn default_baud(self) -> u32 {
        DEFAULT_BAUD
    }

    /// Deadline for one request/response exchange.
    pub fn timeout(self) -> Duration {
        match self.protocol() {
            ProtocolKind::K5 => k5::DEFAULT_TIMEOUT,
            ProtocolKind::Tk11 => tk11::DEFAULT_TIMEOUT,
        }
    }

    /// Whether firmware can be flashed through the bootloader.
    pub fn supports_flashing(self) -> bool {
        self.protocol() == ProtocolKind::K5
    }

    /// Parse a family from a user-supplied name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "k5" | "uv-k5" | "uvk5" => Some(Self::K5),
            "k1" | "uv-k1" | "uvk1" | "k5v3" => Some(Self::K1),
            "tk11" | "tk-11" => Some(Self::Tk11),
            _ => None,
        }
    }
}

impl fmt::Display for RadioFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::K5 => write!(f, "UV-K5"),
            Self::K1 => write!(f, "UV-K1"),
            Self::Tk11 => write!(f, "TK11"),
        }
    }
}

impl FromStr for RadioFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| {
            Error::Config(format!("unknown radio family {s:?} (expected k5, k1 or tk11)"))
        })
    }
}

struct SelectorInner {
    current: Mutex<RadioFamily>,
    listeners: Arc<Subscribers<RadioFamily>>,
}

/// The family currently selected by the user, with change notification.
///
/// Cloning shares the selection.
#[derive(Clone)]
pub struct RadioSelector {
    inner: Arc<SelectorInner>,
}

impl RadioSelector {
    /// Selector starting at `family`.
    pub fn new(family: RadioFamily) -> Self {
        Self {
            inner: Arc::new(SelectorInner {
                current: Mutex::new(family),
                listeners: Subscribers::new(),
            }),
        }
    }

    /// Currently selected family.
    pub fn current(&self) -> RadioFamily {
        *self.inner.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Select `family`, notifying listeners if it changed.
    pub fn select(&self, family: RadioFamily) {
        self.inner.listeners.publish(|| {
            let mut current = self.inner.current.lock().unwrap_or_else(PoisonError::into_inner);
            if *current == family {
                return ((), None);
            }
            *current = family;
            debug!("Radio family set to {family}");
            ((), Some(family))
        });
    }

    /// Listen for changes; `callback` runs at once with the current family.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RadioFamily) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(|| self.current(), callback)
    }
}

impl Default for RadioSelector {
    fn default() -> Self {
        Self::new(RadioFamily::default())
    }
}

impl fmt::Debug for RadioSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadioSelector")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}
