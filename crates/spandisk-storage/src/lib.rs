//! Spandisk storage - backing component access
//!
//! This crate provides everything needed to talk to one backing block
//! device:
//!
//! - [`AlignedBuffer`] - page-aligned buffers for direct I/O
//! - [`RawDevice`] - exclusively opened block device or regular file
//! - [`ComponentDevice`] - the async seam the device engine dispatches
//!   sub-requests through, with file-backed and in-memory
//!   implementations

pub mod aligned;
pub mod component;
pub mod raw;

pub use aligned::{ALIGNMENT, AlignedBuffer};
pub use component::{ComponentDevice, FileComponent, MemComponent};
pub use raw::{RawDevice, RawOpenOptions};
