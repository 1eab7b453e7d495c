//! Device-level error types
//!
//! Configuration failures are reported synchronously and leave the
//! device unconfigured; component I/O failures surface asynchronously
//! through the request completion.

use spandisk_common::Error;
use thiserror::Error as ThisError;

/// Result type for device operations
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Logical device error
#[derive(Debug, ThisError)]
pub enum DeviceError {
    /// Operation on a unit that has no configured device
    #[error("device not configured")]
    NotConfigured,

    /// Configuration request for a unit that already has a device
    #[error("device already configured")]
    AlreadyConfigured,

    /// The device or a component is held elsewhere
    #[error("busy: {0}")]
    Busy(String),

    /// A component could not be opened or validated
    #[error("component {path}: {source}")]
    ComponentOpen {
        path: String,
        #[source]
        source: Error,
    },

    /// Configuration listed no components
    #[error("no components given")]
    NoComponents,

    /// A component has no capacity left after interleave truncation
    #[error("component has no usable capacity: {0}")]
    ZeroSizeComponent(String),

    /// The interleave is below the largest component sector size
    #[error("interleave {interleave} is smaller than the largest component sector ({min_blocks} blocks)")]
    InterleaveTooSmall { interleave: u64, min_blocks: u64 },

    /// Mirroring configured without striping
    #[error("mirroring requires a nonzero interleave")]
    MirrorRequiresInterleave,

    /// Mirroring configured with an odd component count
    #[error("mirroring requires an even number of components, got {0}")]
    MirrorOddComponents(usize),

    /// Request extends past the end of the logical device
    #[error("block {block} + {bytes} bytes exceeds device size of {size} blocks")]
    OutOfBounds { block: u64, bytes: u64, size: u64 },

    /// Request length is not block-granular
    #[error("length {0} is not a multiple of the block size")]
    UnalignedLength(u64),

    /// Scatter-gather request larger than the whole remap pool
    #[error("request of {bytes} bytes exceeds remap pool capacity of {capacity}")]
    RequestTooLarge { bytes: usize, capacity: usize },

    /// First I/O error reported by a component sub-request
    #[error("I/O error on component {index}: {source}")]
    Component {
        index: usize,
        #[source]
        source: Error,
    },

    /// On-disk label failed validation
    #[error("label corrupt or missing")]
    LabelInvalid,

    /// The request was dropped before its completion fired
    #[error("request abandoned before completion")]
    Abandoned,

    /// Storage-layer failure outside any component sub-request
    #[error(transparent)]
    Storage(#[from] Error),
}
