//! In-memory port driven by a scripted responder.
//!
//! Every `write` appends to a pending buffer and hands it to the responder,
//! which may consume bytes from it and return bytes for the host to read.
//! Reads drain the queued responses; an empty queue behaves like an idle
//! serial line and returns [`std::io::ErrorKind::TimedOut`] after a short
//! pause.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;

/// Callback that sees every byte the host has written but not yet consumed.
pub type Responder = Box<dyn FnMut(&mut Vec<u8>) -> Vec<u8> + Send>;

/// Longest an idle read blocks before reporting a timeout.
const IDLE_READ_PAUSE: Duration = Duration::from_millis(2);

/// Observable side of a [`LoopbackPort`], shareable with a test.
#[derive(Debug, Default)]
pub struct LoopbackLog {
    /// Every byte the host wrote, in order.
    pub written: Vec<u8>,
    /// Number of `write` calls (one per transmitted chunk).
    pub write_calls: usize,
}

/// Scripted in-memory port.
pub struct LoopbackPort {
    name: String,
    open: bool,
    rx: VecDeque<u8>,
    pending: Vec<u8>,
    responder: Option<Responder>,
    log: Arc<Mutex<LoopbackLog>>,
}

impl LoopbackPort {
    /// Create a silent loopback port.
    pub fn new() -> Self {
        Self {
            name: "loopback".to_string(),
            open: true,
            rx: VecDeque::new(),
            pending: Vec::new(),
            responder: None,
            log: Arc::default(),
        }
    }

    /// Create a loopback port answering writes through `responder`.
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&mut Vec<u8>) -> Vec<u8> + Send + 'static,
    {
        let mut port = Self::new();
        port.responder = Some(Box::new(responder));
        port
    }

    /// Queue bytes for the host to read.
    pub fn feed(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }

    /// Handle to the write log, valid after the port is moved elsewhere.
    pub fn log(&self) -> Arc<Mutex<LoopbackLog>> {
        Arc::clone(&self.log)
    }
}

impl Default for LoopbackPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for LoopbackPort {
    fn clear_buffers(&mut self) -> Result<()> {
        self.rx.clear();
        self.pending.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

impl Read for LoopbackPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        if self.rx.is_empty() {
            thread::sleep(IDLE_READ_PAUSE);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for LoopbackPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            log.written.extend_from_slice(buf);
            log.write_calls += 1;
        }
        self.pending.extend_from_slice(buf);
        if let Some(responder) = self.responder.as_mut() {
            let reply = responder(&mut self.pending);
            self.rx.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
