//! Port abstraction for serial communication with a radio.
//!
//! The codecs never talk to a serial driver directly. They work on anything
//! implementing [`Port`]: [`NativePort`] wraps the `serialport` crate, and
//! [`LoopbackPort`] is a scripted in-memory double for tests and simulations.
//!
//! Ports are shared as a [`Transport`]. Whoever holds its lock owns the wire
//! for one request/response exchange:
//!
//! ```rust,no_run
//! use std::io::Write;
//! use uvflash::port::{self, LoopbackPort};
//!
//! let transport = port::into_transport(LoopbackPort::new());
//! {
//!     let mut wire = port::lock(&transport)?;
//!     wire.write_all(&[0xAB, 0xCD])?;
//! }
//! # Ok::<(), uvflash::Error>(())
//! ```

pub mod loopback;
#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default baud rate of the radios' programming UART.
pub const DEFAULT_BAUD: u32 = 38400;

/// Read timeout of a single `read` call.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// How to open a serial port. Framing is always 8N1 without flow control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Per-call read timeout. Protocol deadlines are layered on top.
    pub timeout: Duration,
}

impl SerialConfig {
    /// Configuration for `port_name` at `baud_rate` with a short read timeout.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Set the per-call read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Byte-stream port to one radio.
///
/// `read` must return within a short timeout, either with data or with an
/// [`std::io::ErrorKind::TimedOut`] error, so callers can enforce their own
/// deadlines.
pub trait Port: Read + Write + Send {
    /// Drop whatever is buffered in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Port name/path.
    fn name(&self) -> &str;

    /// Whether the port can still carry traffic.
    fn is_open(&self) -> bool;

    /// Close the port. Later I/O fails with `NotConnected`.
    fn close(&mut self) -> Result<()>;
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Shared handle to the one open port.
///
/// Holding the mutex guard is holding the stream: protocol code locks it
/// around a single request/response exchange and drops it right after.
pub type Transport = Arc<Mutex<Box<dyn Port>>>;

/// Wrap a port into a shareable [`Transport`].
pub fn into_transport<P: Port + 'static>(port: P) -> Transport {
    Arc::new(Mutex::new(Box::new(port)))
}

/// Lock the transport for one exchange.
///
/// A poisoned lock is recovered. A closed port is reported as
/// [`Error::NotConnected`].
pub fn lock(transport: &Transport) -> Result<MutexGuard<'_, Box<dyn Port>>> {
    let guard = transport.lock().unwrap_or_else(PoisonError::into_inner);
    if guard.is_open() {
        Ok(guard)
    } else {
        Err(Error::NotConnected)
    }
}

pub use loopback::LoopbackPort;
#[cfg(feature = "native")]
pub use native::NativePort;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyUSB0", DEFAULT_BAUD);
        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.timeout, DEFAULT_READ_TIMEOUT);

        let slow = config.with_timeout(Duration::from_secs(5));
        assert_eq!(slow.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_lock_reports_closed_port() {
        let transport = into_transport(LoopbackPort::new());
        assert!(lock(&transport).is_ok());

        lock(&transport).unwrap().close().unwrap();
        assert!(matches!(lock(&transport), Err(Error::NotConnected)));
    }
}
