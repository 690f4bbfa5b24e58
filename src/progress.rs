//! Progress fractions and byte-count reporting

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transfer progress of one direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
    /// The expected total is not known
    Unknown,
    /// Fraction complete, in `0.0..=1.0`
    Fraction(f64),
}

impl Progress {
    /// Compute progress from a byte count and an optional expected total.
    pub fn from_bytes(transferred: u64, expected: Option<u64>) -> Self {
        match expected {
            Some(0) => Progress::Fraction(1.0),
            Some(total) => Progress::Fraction((transferred as f64 / total as f64).clamp(0.0, 1.0)),
            None => Progress::Unknown,
        }
    }

    /// The fraction, or `None` when unknown
    pub fn fraction(&self) -> Option<f64> {
        match self {
            Progress::Unknown => None,
            Progress::Fraction(value) => Some(*value),
        }
    }

    /// Whether the expected total is unknown
    pub fn is_unknown(&self) -> bool {
        matches!(self, Progress::Unknown)
    }
}

impl Default for Progress {
    fn default() -> Self {
        Progress::Fraction(0.0)
    }
}

// f64 bit patterns of values in 0..=1 never collide with this one
const UNKNOWN_BITS: u64 = u64::MAX;

/// Lock-free progress slot that never moves backwards.
#[derive(Debug)]
pub(crate) struct AtomicProgress {
    bits: AtomicU64,
}

impl AtomicProgress {
    pub(crate) fn new() -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub(crate) fn load(&self) -> Progress {
        decode(self.bits.load(Ordering::Acquire))
    }

    /// Store `progress` unless it is a smaller fraction than the current one.
    pub(crate) fn advance(&self, progress: Progress) {
        let new_bits = encode(progress);
        let _ = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match (decode(current), progress) {
                    (Progress::Fraction(old), Progress::Fraction(new)) if new <= old => None,
                    _ if current == new_bits => None,
                    _ => Some(new_bits),
                }
            });
    }
}

fn encode(progress: Progress) -> u64 {
    match progress {
        Progress::Unknown => UNKNOWN_BITS,
        Progress::Fraction(value) => value.to_bits(),
    }
}

fn decode(bits: u64) -> Progress {
    if bits == UNKNOWN_BITS {
        Progress::Unknown
    } else {
        Progress::Fraction(f64::from_bits(bits))
    }
}

/// Which counter a progress notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Response bytes were received
    Download,
    /// Request body bytes were sent
    Upload,
}

/// Listener invoked on the network worker whenever counters change
pub type ProgressListener = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Byte counters a task exposes for queue aggregation.
pub trait ProgressSource: Send + Sync {
    /// Response bytes received so far
    fn bytes_downloaded(&self) -> u64;

    /// Request body bytes sent so far
    fn bytes_uploaded(&self) -> u64;

    /// Expected response length, if known
    fn expected_download_bytes(&self) -> Option<u64>;

    /// Expected request body length, if known
    fn expected_upload_bytes(&self) -> Option<u64>;

    /// Register a listener for counter changes.
    fn add_progress_listener(&self, listener: ProgressListener);
}
