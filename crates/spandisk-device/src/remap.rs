//! Bounded remap-buffer pool
//!
//! Scatter-gather sub-requests stage their fragments in one contiguous
//! buffer per component. Those buffers come out of a pool with a fixed
//! byte budget: when the budget is exhausted, the submitting path waits
//! until completions release prior buffers. This is backpressure, not a
//! queue: nothing about request ordering is promised.
//!
//! A request that touches several components leases all of its buffers
//! in one atomic reservation ([`RemapPool::allocate_batch`]), so two
//! requests can never deadlock each other holding half an allocation.

use crate::error::{DeviceError, DeviceResult};
use spandisk_common::DEFAULT_REMAP_POOL_BYTES;
use spandisk_storage::AlignedBuffer;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Byte-budgeted allocator for remap buffers
#[derive(Debug)]
pub struct RemapPool {
    capacity: usize,
    budget: Arc<Semaphore>,
}

impl RemapPool {
    /// Create a pool with the given byte budget
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            budget: Arc::new(Semaphore::new(capacity)),
        })
    }

    /// Create a pool with the default budget
    #[must_use]
    pub fn with_default_capacity() -> Arc<Self> {
        Self::new(DEFAULT_REMAP_POOL_BYTES)
    }

    /// Total byte budget
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently unreserved
    #[must_use]
    pub fn available(&self) -> usize {
        self.budget.available_permits()
    }

    /// Allocate one zeroed remap buffer of `len` bytes, waiting for
    /// budget if the pool is exhausted
    pub async fn allocate(&self, len: usize) -> DeviceResult<RemapBuffer> {
        let permit = self.reserve(len).await?;
        Ok(RemapBuffer {
            buf: AlignedBuffer::new(len),
            _lease: Lease::Exclusive(permit),
        })
    }

    /// Allocate `count` buffers of `len` bytes each under one atomic
    /// reservation
    ///
    /// The budget returns when the last buffer of the batch drops.
    pub async fn allocate_batch(&self, len: usize, count: usize) -> DeviceResult<Vec<RemapBuffer>> {
        let permit = Arc::new(self.reserve(len * count).await?);
        Ok((0..count)
            .map(|_| RemapBuffer {
                buf: AlignedBuffer::new(len),
                _lease: Lease::Shared(Arc::clone(&permit)),
            })
            .collect())
    }

    /// Reserve bytes, waiting for capacity; a reservation larger than
    /// the whole pool can never succeed and is rejected outright
    async fn reserve(&self, bytes: usize) -> DeviceResult<OwnedSemaphorePermit> {
        if bytes > self.capacity {
            return Err(DeviceError::RequestTooLarge {
                bytes,
                capacity: self.capacity,
            });
        }
        let permit = Arc::clone(&self.budget)
            .acquire_many_owned(bytes as u32)
            .await
            .map_err(|_| spandisk_common::Error::internal("remap pool closed"))?;
        Ok(permit)
    }
}

/// Budget held by one buffer: its own permit, or a share of a batch
#[derive(Debug)]
enum Lease {
    Exclusive(OwnedSemaphorePermit),
    Shared(Arc<OwnedSemaphorePermit>),
}

/// One leased remap buffer; dropping it (or the last buffer of its
/// batch) returns the budget and wakes any waiting allocations
#[derive(Debug)]
pub struct RemapBuffer {
    buf: AlignedBuffer,
    _lease: Lease,
}

impl RemapBuffer {
    /// Buffer length in bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Deref for RemapBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_slice()
    }
}

impl DerefMut for RemapBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buf.as_mut_slice()
    }
}
