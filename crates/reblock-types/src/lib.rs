#![forbid(unsafe_code)]
//! Core value types for ReBlock.
//!
//! Defines the block-index abstraction the relocation engine is generic
//! over, the byte-scale extent record exchanged with the I/O layer, extent
//! origin tags, and the alignment/formatting helpers shared by the
//! workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::ops::{Add, AddAssign, Sub, SubAssign};

// ── Block index ─────────────────────────────────────────────────────────────

/// Unsigned integer wide enough to index every block of the device.
///
/// The engine monomorphises over this trait so that small devices get
/// `u32`-keyed maps (half the memory) while large ones fall back to `u64`.
/// `from_u64` is the overflow-checked narrowing used whenever a byte-scale
/// value crosses into block units.
pub trait BlockIdx:
    Copy
    + Ord
    + Eq
    + Hash
    + Default
    + fmt::Debug
    + fmt::Display
    + Add<Output = Self>
    + Sub<Output = Self>
    + AddAssign
    + SubAssign
{
    const ZERO: Self;

    /// Narrow a `u64`, returning `None` when the value does not fit.
    fn from_u64(value: u64) -> Option<Self>;

    /// Widen to `u64` (always lossless).
    fn to_u64(self) -> u64;
}

impl BlockIdx for u32 {
    const ZERO: Self = 0;

    fn from_u64(value: u64) -> Option<Self> {
        Self::try_from(value).ok()
    }

    fn to_u64(self) -> u64 {
        u64::from(self)
    }
}

impl BlockIdx for u64 {
    const ZERO: Self = 0;

    fn from_u64(value: u64) -> Option<Self> {
        Some(value)
    }

    fn to_u64(self) -> u64 {
        self
    }
}

// ── Extent tags ─────────────────────────────────────────────────────────────

/// Origin of a block range in the relocation plan.
///
/// `Default` is the sentinel carried by free space and holes; the planner
/// tags work extents by origin so the executor knows what it is copying.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum ExtentTag {
    #[default]
    Default,
    LoopFile,
    Device,
}

impl fmt::Display for ExtentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "-",
            Self::LoopFile => "loop-file",
            Self::Device => "device",
        };
        write!(f, "{name}")
    }
}

// ── Byte-scale extents ──────────────────────────────────────────────────────

/// One extent in byte units, as persisted in extent files and exchanged at
/// the `RelocIo` boundary. `user_data` is opaque to the engine and preserved
/// through save/load round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteExtent {
    pub physical: u64,
    pub logical: u64,
    pub length: u64,
    pub user_data: u64,
}

impl ByteExtent {
    #[must_use]
    pub fn new(physical: u64, logical: u64, length: u64) -> Self {
        Self {
            physical,
            logical,
            length,
            user_data: 0,
        }
    }
}

/// Sort byte extents by physical start.
pub fn sort_by_physical(extents: &mut [ByteExtent]) {
    extents.sort_unstable_by_key(|e| e.physical);
}

/// Sort byte extents by logical start.
pub fn sort_by_logical(extents: &mut [ByteExtent]) {
    extents.sort_unstable_by_key(|e| e.logical);
}

/// Sort byte extents by decreasing length, ties by increasing physical.
pub fn sort_by_reverse_length(extents: &mut [ByteExtent]) {
    extents.sort_unstable_by(|a, b| b.length.cmp(&a.length).then(a.physical.cmp(&b.physical)));
}

// ── Alignment helpers ───────────────────────────────────────────────────────

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

// ── Human-readable sizes ────────────────────────────────────────────────────

/// Format a byte count as a short human-readable string (binary units).
#[must_use]
pub fn pretty_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "KiB", "MiB", "GiB", "TiB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} bytes")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}
