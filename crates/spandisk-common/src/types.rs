//! Core type definitions for spandisk
//!
//! Logical and component devices are addressed in 512-byte blocks.
//! All sizes and offsets that cross a crate boundary are carried in
//! blocks; byte quantities are converted at the edges with the helpers
//! below.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one device block in bytes (standard 512-byte sectors)
pub const BLOCK_SIZE: u64 = 512;

/// Memory page size assumed by the scatter-gather transfer mode
pub const PAGE_SIZE: u64 = 4096;

/// Blocks per memory page
pub const PAGE_BLOCKS: u64 = PAGE_SIZE / BLOCK_SIZE;

/// Largest single transfer the remap pool is sized for
pub const MAX_TRANSFER_BYTES: usize = 64 * 1024;

/// Default remap pool capacity: enough for 16 maximum-size transfers
pub const DEFAULT_REMAP_POOL_BYTES: usize = 16 * MAX_TRANSFER_BYTES;

/// Convert a block count to bytes
#[must_use]
pub const fn blocks_to_bytes(blocks: u64) -> u64 {
    blocks * BLOCK_SIZE
}

/// Convert a byte count to whole blocks, rounding up
#[must_use]
pub const fn bytes_to_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(BLOCK_SIZE)
}

/// Unit number identifying one logical device
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(u32);

impl UnitId {
    /// Create a unit id
    #[must_use]
    pub const fn new(unit: u32) -> Self {
        Self(unit)
    }

    /// Get the raw unit number
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// Device name for this unit, e.g. `span0`
    #[must_use]
    pub fn name(self) -> String {
        format!("span{}", self.0)
    }
}

impl fmt::Debug for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnitId({})", self.0)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "span{}", self.0)
    }
}

impl From<u32> for UnitId {
    fn from(unit: u32) -> Self {
        Self(unit)
    }
}

/// Behavior flags for a logical device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFlags {
    /// Duplicate writes across two equal component halves
    #[serde(default)]
    pub mirrored: bool,
    /// Truncate every component to the size of the smallest
    #[serde(default)]
    pub uniform: bool,
}

/// How sub-request data is carried to the components
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferMode {
    /// Each translated run references the request buffer directly,
    /// one sub-request per run, dispatched as produced
    Direct,
    /// At most one sub-request per component, staging fragments in a
    /// contiguous remap buffer, dispatched together after decomposition
    #[default]
    ScatterGather,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::ScatterGather => write!(f, "scatter-gather"),
        }
    }
}
