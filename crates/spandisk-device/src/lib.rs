//! Spandisk device engine
//!
//! Composes N backing block devices ("components") into one logical
//! block device with concatenation, striping, and optional write
//! mirroring.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 DeviceRegistry                   │
//! │   unit → LogicalDevice, per-unit config lock     │
//! └───────────────────────┬──────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────┐
//! │                 LogicalDevice                    │
//! │  - InterleaveTable   (address space layout)      │
//! │  - locate_run        (address translation)       │
//! │  - decomposer        (runs → sub-requests)       │
//! │  - RequestState      (completion aggregation)    │
//! │  - RemapPool         (scatter-gather staging)    │
//! └───────────────────────┬──────────────────────────┘
//!                         │ async sub-request tasks
//!          ┌──────────────┼──────────────┐
//!     ┌────▼────┐    ┌────▼────┐    ┌────▼────┐
//!     │ comp 0  │    │ comp 1  │    │ comp N  │
//!     └─────────┘    └─────────┘    └─────────┘
//! ```
//!
//! A request is bounds-checked, carved into component-sized runs, and
//! fanned out. Sub-requests complete in any order; an atomic
//! outstanding-byte counter fires the caller's completion exactly once
//! when the last one lands. Mirrored writes dispatch a duplicate to the
//! mirror half after each primary; duplicates never count against the
//! parent and their failures are only logged.

pub mod complete;
pub mod device;
pub mod error;
pub mod interleave;
pub mod label;
pub mod registry;
pub mod remap;
pub mod request;
pub mod stats;
pub mod translate;

pub use complete::IoCompletion;
pub use device::{Component, DeviceHandle, LogicalDevice};
pub use error::{DeviceError, DeviceResult};
pub use interleave::{InterleaveEntry, InterleaveTable};
pub use label::{DiskLabel, LABEL_BLOCK};
pub use registry::DeviceRegistry;
pub use remap::{RemapBuffer, RemapPool};
pub use request::IoDirection;
pub use stats::{DeviceStats, StatsSnapshot};
pub use translate::{RunTarget, locate_run};
