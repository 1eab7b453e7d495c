//! Sub-requests: the per-component pieces of one logical I/O
//!
//! Decomposition carves a request into runs (see `translate`); each run
//! becomes (or extends) a sub-request. Direct-mode sub-requests carry
//! one contiguous view of the request buffer. Scatter-gather
//! sub-requests accumulate (parent-offset, length) fragments against a
//! contiguous remap buffer, write data being copied in as fragments are
//! appended.

use crate::complete::RequestState;
use crate::remap::RemapBuffer;
use bytes::{Bytes, BytesMut};
use spandisk_common::{BLOCK_SIZE, Result};
use spandisk_storage::ComponentDevice;
use std::sync::Arc;

/// Transfer direction of a request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// One staged piece of the parent request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Fragment {
    /// Byte offset in the parent request buffer
    pub parent_offset: usize,
    /// Fragment length in bytes
    pub len: usize,
}

/// Data carried by a sub-request
#[derive(Debug)]
pub(crate) enum SubPayload {
    /// Zero-copy slice of the parent write buffer
    DirectWrite(Bytes),
    /// Owned chunk split off the parent read buffer
    DirectRead(BytesMut),
    /// Fragments staged in a leased remap buffer
    Scatter {
        remap: RemapBuffer,
        len: usize,
        frags: Vec<Fragment>,
    },
}

/// One I/O directed at a single component
#[derive(Debug)]
pub(crate) struct SubRequest {
    /// Target component index
    pub component: usize,
    /// Component-relative start block
    pub block: u64,
    /// Mirror duplicates never count against the parent
    pub mirror: bool,
    /// Parent offset of a direct run (reassembly key for reads)
    pub parent_offset: usize,
    pub payload: SubPayload,
}

impl SubRequest {
    /// Bytes this sub-request moves
    pub fn byte_count(&self) -> usize {
        match &self.payload {
            SubPayload::DirectWrite(data) => data.len(),
            SubPayload::DirectRead(chunk) => chunk.len(),
            SubPayload::Scatter { len, .. } => *len,
        }
    }

    /// Append a run to a scatter-gather sub-request, copying write data
    /// into the remap buffer at its staged position
    pub fn append_fragment(&mut self, parent_offset: usize, len: usize, write_data: Option<&Bytes>) {
        let SubPayload::Scatter {
            remap,
            len: staged,
            frags,
        } = &mut self.payload
        else {
            unreachable!("fragment appended to a direct sub-request");
        };

        if let Some(data) = write_data {
            remap[*staged..*staged + len].copy_from_slice(&data[parent_offset..parent_offset + len]);
        }
        frags.push(Fragment { parent_offset, len });
        *staged += len;
    }

    /// The component block just past the staged data; the next appended
    /// run must land here
    pub fn next_block(&self) -> u64 {
        self.block + self.byte_count() as u64 / BLOCK_SIZE
    }
}

/// Execute one sub-request against its component and hand the outcome
/// to the completion aggregator
pub(crate) async fn run_sub(
    device: Arc<dyn ComponentDevice>,
    mut sub: SubRequest,
    state: Arc<RequestState>,
) {
    let result = perform(&*device, &mut sub, state.direction()).await;
    state.complete_sub(sub, result);
}

async fn perform(
    device: &dyn ComponentDevice,
    sub: &mut SubRequest,
    direction: IoDirection,
) -> Result<()> {
    match &mut sub.payload {
        SubPayload::DirectWrite(data) => device.write_at(sub.block, data).await,
        SubPayload::DirectRead(chunk) => device.read_at(sub.block, chunk).await,
        SubPayload::Scatter { remap, len, .. } => match direction {
            IoDirection::Write => device.write_at(sub.block, &remap[..*len]).await,
            IoDirection::Read => device.read_at(sub.block, &mut remap[..*len]).await,
        },
    }
}
