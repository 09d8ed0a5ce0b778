//! One radio on one transport.

use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::port::Transport;
use crate::protocol::{K5Codec, Tk11Codec};
use crate::radio::bulk::{self, CancelToken};
use crate::radio::{MemoryLayout, ProtocolKind, RadioFamily};

type FailureHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Protocol façade bound to a family and a transport.
///
/// Every call dispatches to the K5 or TK11 codec for the bound family and
/// holds the transport lock for one exchange at a time.
#[derive(Clone)]
pub struct Radio {
    transport: Transport,
    family: RadioFamily,
    k5: K5Codec,
    tk11: Tk11Codec,
    on_failure: Option<FailureHook>,
}

impl Radio {
    /// Bind `family` to `transport` with default codec settings.
    pub fn new(transport: Transport, family: RadioFamily) -> Self {
        Self {
            transport,
            family,
            k5: K5Codec::default(),
            tk11: Tk11Codec::default(),
            on_failure: None,
        }
    }

    /// Replace the K5 codec (deadline).
    #[must_use]
    pub fn with_k5_codec(mut self, codec: K5Codec) -> Self {
        self.k5 = codec;
        self
    }

    /// Replace the TK11 codec (deadline and retry policy).
    #[must_use]
    pub fn with_tk11_codec(mut self, codec: Tk11Codec) -> Self {
        self.tk11 = codec;
        self
    }

    /// Run `hook` whenever an operation fails because the link is gone.
    #[must_use]
    pub fn with_failure_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    /// Bound family.
    pub fn family(&self) -> RadioFamily {
        self.family
    }

    /// Memory map of the bound family.
    pub fn layout(&self) -> MemoryLayout {
        self.family.layout()
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Open a session and return the firmware version, if reported.
    pub fn init(&self) -> Result<Option<String>> {
        let result = match self.family.protocol() {
            ProtocolKind::K5 => self.k5.init(&self.transport).map(Some),
            ProtocolKind::Tk11 => self.tk11.init(&self.transport),
        };
        let version = self.observe(result)?;
        info!(
            "{} firmware: {}",
            self.family,
            version.as_deref().unwrap_or("unknown")
        );
        Ok(version)
    }

    /// Read one block of at most [`MemoryLayout::block_size`] bytes.
    pub fn read(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        self.check_range(address, size)?;
        debug!("Read {size} bytes at {address:#06x}");
        let result = match self.family.protocol() {
            ProtocolKind::K5 => self.k5.read(&self.transport, address, size),
            ProtocolKind::Tk11 => self.tk11.read(&self.transport, address, size),
        };
        self.observe(result)
    }

    /// Write one block of at most [`MemoryLayout::block_size`] bytes.
    pub fn write(&self, address: usize, data: &[u8]) -> Result<()> {
        self.check_range(address, data.len())?;
        debug!("Write {} bytes at {address:#06x}", data.len());
        let result = match self.family.protocol() {
            ProtocolKind::K5 => self.k5.write(&self.transport, address, data),
            ProtocolKind::Tk11 => self.tk11.write(&self.transport, address, data),
        };
        self.observe(result)
    }

    /// Reboot the radio into normal operation.
    pub fn reboot(&self) -> Result<()> {
        info!("Rebooting {}", self.family);
        let result = match self.family.protocol() {
            ProtocolKind::K5 => self.k5.reboot(&self.transport),
            ProtocolKind::Tk11 => self.tk11.reboot(&self.transport),
        };
        self.observe(result)
    }

    /// Read `[0, total)` in block strides.
    pub fn read_full(&self, total: usize, progress: &mut dyn FnMut(f64)) -> Result<Vec<u8>> {
        bulk::read_full(self, total, &CancelToken::new(), progress)
    }

    /// Write `data` from address 0 in block strides.
    pub fn write_full(&self, data: &[u8], progress: &mut dyn FnMut(f64)) -> Result<()> {
        bulk::write_full(self, data, &CancelToken::new(), progress)
    }

    fn check_range(&self, address: usize, size: usize) -> Result<()> {
        let layout = self.layout();
        if size == 0 || size > layout.block_size {
            return Err(Error::Protocol(format!(
                "{} block size {size} outside 1..={}",
                self.family, layout.block_size
            )));
        }
        if address.checked_add(size).is_none_or(|end| end > layout.size) {
            return Err(Error::Protocol(format!(
                "{address:#06x}+{size:#x} is outside the {} memory ({:#x} bytes)",
                self.family, layout.size
            )));
        }
        Ok(())
    }

    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transport_failure() {
                warn!("Link to {} lost: {e}", self.family);
                if let Some(hook) = &self.on_failure {
                    hook(e);
                }
            }
        }
        result
    }
}

impl fmt::Debug for Radio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Radio")
            .field("family", &self.family)
            .field("k5", &self.k5)
            .field("tk11", &self.tk11)
            .finish_non_exhaustive()
    }
}
