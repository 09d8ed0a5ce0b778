//! Simulated radios for integration tests.
//!
//! Each simulation is a [`LoopbackPort`] whose responder decodes request
//! frames and answers them against an in-memory image.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use uvflash::port::loopback::LoopbackLog;
use uvflash::protocol::tk11::ADDRESS_BASE;
use uvflash::protocol::{FrameScanner, encode_frame};
use uvflash::{K5Codec, LoopbackPort, Radio, RadioFamily, RetryPolicy, Tk11Codec, Transport};

pub const K5_VERSION: &str = "2.01.26";
pub const TK11_VERSION: &str = "TK11-1.03";
pub const BOOTLOADER_VERSION: &str = "5.00.01";

/// A simulated radio and the handles a test inspects afterwards.
pub struct Sim {
    pub transport: Transport,
    pub memory: Arc<Mutex<Vec<u8>>>,
    pub log: Arc<Mutex<LoopbackLog>>,
}

impl Sim {
    fn new(port: LoopbackPort, memory: Arc<Mutex<Vec<u8>>>) -> Self {
        let log = port.log();
        Self {
            transport: uvflash::port::into_transport(port),
            memory,
            log,
        }
    }

    /// Every frame the host sent, decoded.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        decode_all(&self.log.lock().unwrap().written)
    }

    pub fn memory(&self) -> Vec<u8> {
        self.memory.lock().unwrap().clone()
    }
}

/// Decode every complete frame in `bytes`.
pub fn decode_all(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut scanner = FrameScanner::new();
    scanner.push(bytes);
    std::iter::from_fn(|| scanner.next_frame())
        .map(|f| f.payload)
        .collect()
}

fn frame(payload: &[u8]) -> Vec<u8> {
    encode_frame(payload).unwrap()
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Feed `pending` through `scanner` and answer each complete request.
fn respond_frames(
    scanner: &mut FrameScanner,
    pending: &mut Vec<u8>,
    mut answer: impl FnMut(&[u8]) -> Vec<Vec<u8>>,
) -> Vec<u8> {
    scanner.push(pending.as_slice());
    pending.clear();
    let mut out = Vec::new();
    while let Some(request) = scanner.next_frame() {
        for reply in answer(&request.payload) {
            out.extend(frame(&reply));
        }
    }
    out
}

/// K5 EEPROM of `size` bytes filled with `fill`.
///
/// With `noisy` set, every read reply is preceded by an unrelated frame.
pub fn k5_sim(size: usize, fill: u8, noisy: bool) -> Sim {
    let (port, memory) = k5_port(size, fill, noisy);
    Sim::new(port, memory)
}

/// The port behind [`k5_sim`], for handing to a connection manager.
pub fn k5_port(size: usize, fill: u8, noisy: bool) -> (LoopbackPort, Arc<Mutex<Vec<u8>>>) {
    let memory = Arc::new(Mutex::new(vec![fill; size]));
    let eeprom = Arc::clone(&memory);
    let mut scanner = FrameScanner::new();

    let port = LoopbackPort::with_responder(move |pending| {
        respond_frames(&mut scanner, pending, |req| {
            let mut eeprom = eeprom.lock().unwrap();
            match req[0] {
                0x14 => {
                    let mut reply = vec![0x15, 0x05, 0x24, 0x00];
                    let mut version = [0u8; 16];
                    version[..K5_VERSION.len()].copy_from_slice(K5_VERSION.as_bytes());
                    reply.extend_from_slice(&version);
                    reply.extend_from_slice(&[0u8; 20]);
                    vec![reply]
                },
                0x1B => {
                    let addr = usize::from(u16_at(req, 4));
                    let size = req[6];
                    let mut reply = vec![0x1C, 0x05, size + 4, 0x00, req[4], req[5], size, 0x00];
                    reply.extend_from_slice(&eeprom[addr..addr + usize::from(size)]);
                    let mut replies = Vec::new();
                    if noisy {
                        replies.push(vec![0x18, 0x05, 0x20, 0x00]);
                    }
                    replies.push(reply);
                    replies
                },
                0x1D => {
                    let addr = usize::from(u16_at(req, 4));
                    let size = usize::from(req[6]);
                    eeprom[addr..addr + size].copy_from_slice(&req[12..12 + size]);
                    vec![vec![0x1E, 0x05, 0x02, 0x00, req[4], req[5]]]
                },
                _ => Vec::new(),
            }
        })
    });
    (port, memory)
}

/// K5 port that never answers.
pub fn silent_sim() -> Sim {
    Sim::new(LoopbackPort::new(), Arc::new(Mutex::new(Vec::new())))
}

/// TK11 flash of `size` bytes filled with `fill`.
///
/// The first `dropped_writes` write requests go unanswered.
pub fn tk11_sim(size: usize, fill: u8, dropped_writes: usize) -> Sim {
    let memory = Arc::new(Mutex::new(vec![fill; size]));
    let flash = Arc::clone(&memory);
    let mut scanner = FrameScanner::new();
    let mut to_drop = dropped_writes;

    let port = LoopbackPort::with_responder(move |pending| {
        respond_frames(&mut scanner, pending, |req| {
            let mut flash = flash.lock().unwrap();
            match u16_at(req, 0) {
                0x01F4 => {
                    let mut reply = vec![0xF5, 0x01, 0, 0, 0, 0, 0, 0];
                    reply.extend_from_slice(TK11_VERSION.as_bytes());
                    reply.push(0);
                    vec![reply]
                },
                0x01FB => {
                    let addr = (u32_at(req, 2) - ADDRESS_BASE) as usize;
                    let len = usize::from(u16_at(req, 6));
                    let mut reply = vec![0xFC, 0x01];
                    reply.extend_from_slice(&req[2..12]);
                    reply.extend_from_slice(&flash[addr..addr + len]);
                    vec![reply]
                },
                0x01FD => {
                    if to_drop > 0 {
                        to_drop -= 1;
                        return Vec::new();
                    }
                    let addr = (u32_at(req, 2) - ADDRESS_BASE) as usize;
                    let len = usize::from(u16_at(req, 6));
                    flash[addr..addr + len].copy_from_slice(&req[12..12 + len]);
                    let mut reply = vec![0xFE, 0x01];
                    reply.extend_from_slice(&req[2..12]);
                    vec![reply]
                },
                _ => Vec::new(),
            }
        })
    });
    Sim::new(port, memory)
}

/// K5 bootloader that acknowledges every page and keeps what it receives.
///
/// Page `reject_page`, if any, is acknowledged with an error code.
pub fn bootloader_sim(reject_page: Option<u16>) -> Sim {
    let flash = Arc::new(Mutex::new(Vec::new()));
    let written = Arc::clone(&flash);
    let mut scanner = FrameScanner::new();

    let mut port = LoopbackPort::with_responder(move |pending| {
        respond_frames(&mut scanner, pending, |req| match req[0] {
            0x30 => vec![beacon()],
            0x19 => {
                let page = u16_at(req, 8);
                let len = usize::from(u16_at(req, 12));
                let err: u16 = if Some(page) == reject_page { 1 } else { 0 };
                if err == 0 {
                    written
                        .lock()
                        .unwrap()
                        .extend_from_slice(&req[16..16 + len]);
                }
                let mut ack = vec![0x1A, 0x05, 0x08, 0x00];
                ack.extend_from_slice(&req[4..8]);
                ack.extend_from_slice(&page.to_le_bytes());
                ack.extend_from_slice(&err.to_le_bytes());
                vec![ack]
            },
            _ => Vec::new(),
        })
    });
    port.feed(&frame(&beacon()));
    Sim::new(port, flash)
}

fn beacon() -> Vec<u8> {
    let mut payload = vec![0x18, 0x05, 0x20, 0x00];
    payload.extend_from_slice(&[0x5A; 16]);
    payload.extend_from_slice(BOOTLOADER_VERSION.as_bytes());
    payload.resize(36, 0);
    payload
}

/// Route library logs through the test harness; `RUST_LOG=trace` shows frames.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A radio over `sim` with deadlines short enough for tests.
pub fn radio(sim: &Sim, family: RadioFamily) -> Radio {
    init_logging();
    Radio::new(Arc::clone(&sim.transport), family)
        .with_k5_codec(K5Codec::new(Duration::from_millis(200)))
        .with_tk11_codec(
            Tk11Codec::new(Duration::from_millis(100))
                .with_retry(RetryPolicy::new(3, Duration::from_millis(10))),
        )
}
