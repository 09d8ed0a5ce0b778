//! Range-level operations built from single-block reads and writes.
//!
//! Everything here is range splitting and progress reporting. Each stride
//! first checks for cancellation, then issues one block operation through
//! [`Radio`]. The first block error aborts the whole operation.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::radio::Radio;

/// Fill byte written by [`clean`].
pub const ERASED_BYTE: u8 = 0xFF;

/// Shared flag for stopping a bulk operation between strides.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested here or through the process-wide
    /// interrupt checker.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) || crate::is_interrupted_requested()
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Progress over several ranges, reported as one fraction.
struct Tracker<'a> {
    done: usize,
    total: usize,
    progress: &'a mut dyn FnMut(f64),
}

impl<'a> Tracker<'a> {
    fn new(total: usize, progress: &'a mut dyn FnMut(f64)) -> Self {
        Self {
            done: 0,
            total,
            progress,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn advance(&mut self, n: usize) {
        self.done += n;
        let fraction = if self.total == 0 {
            1.0
        } else {
            self.done as f64 / self.total as f64
        };
        (self.progress)(fraction);
    }
}

fn strides(range: Range<usize>, block: usize) -> impl Iterator<Item = Range<usize>> {
    range
        .clone()
        .step_by(block.max(1))
        .map(move |start| start..(start + block).min(range.end))
}

fn read_into(
    radio: &Radio,
    range: Range<usize>,
    out: &mut Vec<u8>,
    cancel: &CancelToken,
    tracker: &mut Tracker<'_>,
) -> Result<()> {
    for block in strides(range, radio.layout().block_size) {
        cancel.check()?;
        let data = radio.read(block.start, block.len())?;
        out.extend_from_slice(&data);
        tracker.advance(block.len());
    }
    Ok(())
}

fn write_from(
    radio: &Radio,
    start: usize,
    data: &[u8],
    cancel: &CancelToken,
    tracker: &mut Tracker<'_>,
) -> Result<()> {
    let block = radio.layout().block_size;
    for (i, chunk) in data.chunks(block).enumerate() {
        cancel.check()?;
        radio.write(start + i * block, chunk)?;
        tracker.advance(chunk.len());
    }
    Ok(())
}

/// Read `range` in block strides.
pub fn read_range(
    radio: &Radio,
    range: Range<usize>,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(f64),
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(range.len());
    let mut tracker = Tracker::new(range.len(), progress);
    if range.is_empty() {
        tracker.advance(0);
    }
    read_into(radio, range, &mut out, cancel, &mut tracker)?;
    Ok(out)
}

/// Write `data` starting at `start` in block strides.
pub fn write_range(
    radio: &Radio,
    start: usize,
    data: &[u8],
    cancel: &CancelToken,
    progress: &mut dyn FnMut(f64),
) -> Result<()> {
    let mut tracker = Tracker::new(data.len(), progress);
    if data.is_empty() {
        tracker.advance(0);
    }
    write_from(radio, start, data, cancel, &mut tracker)
}

/// Read `[0, total)`.
pub fn read_full(
    radio: &Radio,
    total: usize,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(f64),
) -> Result<Vec<u8>> {
    read_range(radio, 0..total, cancel, progress)
}

/// Write `data` from address 0.
pub fn write_full(
    radio: &Radio,
    data: &[u8],
    cancel: &CancelToken,
    progress: &mut dyn FnMut(f64),
) -> Result<()> {
    write_range(radio, 0, data, cancel, progress)
}

/// Read the whole memory, calibration included.
pub fn backup(
    radio: &Radio,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(f64),
) -> Result<Vec<u8>> {
    let size = radio.layout().size;
    info!("Backing up {size:#x} bytes from {}", radio.family());
    read_full(radio, size, cancel, progress)
}

/// Write a full-memory `image` back.
///
/// The calibration window is skipped unless `include_calibration` is set.
pub fn restore(
    radio: &Radio,
    image: &[u8],
    include_calibration: bool,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(f64),
) -> Result<()> {
    let layout = radio.layout();
    if image.len() != layout.size {
        return Err(Error::SizeMismatch {
            expected: layout.size,
            actual: image.len(),
        });
    }

    let ranges = if include_calibration {
        vec![0..layout.size]
    } else {
        layout.non_calibration()
    };
    info!(
        "Restoring {} ({} calibration)",
        radio.family(),
        if include_calibration { "with" } else { "without" }
    );

    let total: usize = ranges.iter().map(ExactSizeIterator::len).sum();
    let mut tracker = Tracker::new(total, progress);
    for range in ranges {
        debug!("Restoring {:#06x}..{:#06x}", range.start, range.end);
        write_from(radio, range.start, &image[range], cancel, &mut tracker)?;
    }
    Ok(())
}

/// Read the calibration window.
pub fn backup_calibration(
    radio: &Radio,
    cancel: &CancelToken,
    progress: &mut dyn FnMut(f64),
) -> Result<Vec<u8>> {
    let calibration = radio.layout().calibration;
    info!(
        "Backing up calibration {:#06x}..{:#06x}",
        calibration.start, calibration.end
    );
    read_range(radio, calibration, cancel, progress)
}

/// Write `data` over the calibration window; it must fill it exactly.
pub fn restore_calibration(
    radio: &Radio,
    data: &[u8],
    cancel: &CancelToken,
    progress: &mut dyn FnMut(f64),
) -> Result<()> {
    let calibration = radio.layout().calibration;
    if data.len() != calibration.len() {
        return Err(Error::SizeMismatch {
            expected: calibration.len(),
            actual: data.len(),
        });
    }
    info!("Restoring calibration at {:#06x}", calibration.start);
    write_range(radio, calibration.start, data, cancel, progress)
}

/// Fill all memory outside the calibration window with [`ERASED_BYTE`].
pub fn clean(radio: &Radio, cancel: &CancelToken, progress: &mut dyn FnMut(f64)) -> Result<()> {
    let layout = radio.layout();
    let ranges = layout.non_calibration();
    let total: usize = ranges.iter().map(ExactSizeIterator::len).sum();
    let fill = vec![ERASED_BYTE; layout.block_size];
    info!("Cleaning {total:#x} bytes of {}", radio.family());

    let mut tracker = Tracker::new(total, progress);
    for range in ranges {
        for block in strides(range, layout.block_size) {
            cancel.check()?;
            radio.write(block.start, &fill[..block.len()])?;
            tracker.advance(block.len());
        }
    }
    Ok(())
}
