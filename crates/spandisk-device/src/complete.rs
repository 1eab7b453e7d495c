//! Completion aggregation
//!
//! Every sub-request reports here exactly once. Non-mirror completions
//! decrement the parent's outstanding byte count; the task that drains
//! the counter to zero, and only that task, fires the parent
//! completion. Mirror duplicates are accounted for nothing: their
//! errors are logged and swallowed (best-effort redundancy).
//!
//! A sub-request byte count exceeding the outstanding count means the
//! decomposer produced overlapping runs; that is a programming error
//! and panics rather than corrupting the accounting.

use crate::error::{DeviceError, DeviceResult};
use crate::request::{IoDirection, SubPayload, SubRequest};
use crate::stats::DeviceStats;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spandisk_common::{Result, UnitId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{error, warn};

/// Shared state of one in-flight request
#[derive(Debug)]
pub(crate) struct RequestState {
    unit: UnitId,
    direction: IoDirection,
    total: u64,
    /// Outstanding bytes; reaching zero fires the completion
    resid: AtomicU64,
    /// First error reported by any non-mirror sub-request
    first_error: Mutex<Option<DeviceError>>,
    /// Direct-mode read chunks, keyed by parent offset
    chunks: Mutex<Vec<(usize, BytesMut)>>,
    /// Scatter-gather read staging: the whole parent buffer
    scatter_buf: Mutex<Option<BytesMut>>,
    /// Completion channel, taken exactly once by the draining task
    tx: Mutex<Option<oneshot::Sender<DeviceResult<Bytes>>>>,
    stats: Arc<DeviceStats>,
}

impl RequestState {
    /// Create the state for a request of `total` bytes along with the
    /// caller's completion handle
    pub fn new(
        unit: UnitId,
        direction: IoDirection,
        total: u64,
        stats: Arc<DeviceStats>,
    ) -> (Arc<Self>, IoCompletion) {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(Self {
            unit,
            direction,
            total,
            resid: AtomicU64::new(total),
            first_error: Mutex::new(None),
            chunks: Mutex::new(Vec::new()),
            scatter_buf: Mutex::new(None),
            tx: Mutex::new(Some(tx)),
            stats,
        });
        (state, IoCompletion { rx })
    }

    pub const fn direction(&self) -> IoDirection {
        self.direction
    }

    /// Install the parent buffer scatter-gather reads assemble into
    pub fn set_scatter_buf(&self, buf: BytesMut) {
        *self.scatter_buf.lock() = Some(buf);
    }

    /// Account one finished sub-request
    pub fn complete_sub(&self, sub: SubRequest, result: Result<()>) {
        let mirror = sub.mirror;
        let component = sub.component;
        let count = sub.byte_count() as u64;
        let parent_offset = sub.parent_offset;

        match result {
            Ok(()) => {
                if !mirror {
                    self.stash_read_data(sub.payload, parent_offset);
                }
            }
            Err(e) => {
                if mirror {
                    // Best-effort redundancy: the primary write stands.
                    warn!(
                        unit = %self.unit,
                        component,
                        error = %e,
                        "mirror write failed"
                    );
                    self.stats.note_mirror_error();
                } else {
                    error!(
                        unit = %self.unit,
                        component,
                        error = %e,
                        "I/O error on component"
                    );
                    match self.direction {
                        IoDirection::Read => self.stats.note_read_error(),
                        IoDirection::Write => self.stats.note_write_error(),
                    }
                    let mut first = self.first_error.lock();
                    if first.is_none() {
                        *first = Some(DeviceError::Component {
                            index: component,
                            source: e,
                        });
                    }
                }
            }
        }

        // The payload (and any remap buffer lease) is gone by now;
        // pool waiters may already be running again.

        if mirror {
            return;
        }

        let prev = self.resid.fetch_sub(count, Ordering::AcqRel);
        assert!(
            prev >= count,
            "sub-request of {count} bytes exceeds {prev} outstanding"
        );
        if prev == count {
            self.finish();
        }
    }

    /// Move a successful sub-request's read data into the parent
    fn stash_read_data(&self, payload: SubPayload, parent_offset: usize) {
        match payload {
            SubPayload::DirectRead(chunk) => {
                self.chunks.lock().push((parent_offset, chunk));
            }
            SubPayload::Scatter { remap, frags, .. } => {
                if self.direction == IoDirection::Read {
                    let mut guard = self.scatter_buf.lock();
                    let buf = guard.as_mut().expect("scatter read buffer missing");
                    let mut staged = 0;
                    for frag in &frags {
                        buf[frag.parent_offset..frag.parent_offset + frag.len]
                            .copy_from_slice(&remap[staged..staged + frag.len]);
                        staged += frag.len;
                    }
                }
            }
            SubPayload::DirectWrite(_) => {}
        }
    }

    /// Fire the parent completion; called by the unique draining task
    fn finish(&self) {
        let first = self.first_error.lock().take();
        let result = match first {
            Some(e) => Err(e),
            None => {
                match self.direction {
                    IoDirection::Write => {
                        self.stats.add_bytes_written(self.total);
                        Ok(Bytes::new())
                    }
                    IoDirection::Read => {
                        self.stats.add_bytes_read(self.total);
                        Ok(self.assemble_read())
                    }
                }
            }
        };
        if let Some(tx) = self.tx.lock().take() {
            // A dropped receiver means nobody is waiting; fine.
            let _ = tx.send(result);
        }
    }

    /// Stitch direct-mode chunks back together in parent order, or take
    /// the scatter-gather staging buffer whole
    fn assemble_read(&self) -> Bytes {
        if let Some(buf) = self.scatter_buf.lock().take() {
            return buf.freeze();
        }
        let mut chunks = std::mem::take(&mut *self.chunks.lock());
        chunks.sort_unstable_by_key(|(offset, _)| *offset);
        let mut iter = chunks.into_iter();
        let Some((_, mut out)) = iter.next() else {
            return Bytes::new();
        };
        for (_, chunk) in iter {
            // Chunks split from one allocation; unsplit is O(1) here.
            out.unsplit(chunk);
        }
        out.freeze()
    }
}

/// Awaitable handle to a submitted request's outcome
///
/// Reads resolve with the requested data, writes with an empty buffer.
#[derive(Debug)]
pub struct IoCompletion {
    rx: oneshot::Receiver<DeviceResult<Bytes>>,
}

impl IoCompletion {
    /// A completion that has already resolved (zero-length requests)
    pub(crate) fn immediate(result: DeviceResult<Bytes>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Wait for the request to finish
    pub async fn wait(self) -> DeviceResult<Bytes> {
        self.rx.await.map_err(|_| DeviceError::Abandoned)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Fragment;
    use crate::remap::RemapPool;

    fn write_sub(component: usize, data: &[u8], mirror: bool) -> SubRequest {
        SubRequest {
            component,
            block: 0,
            mirror,
            parent_offset: 0,
            payload: SubPayload::DirectWrite(Bytes::copy_from_slice(data)),
        }
    }

    #[tokio::test]
    async fn test_write_drains_to_completion() {
        let stats = Arc::new(DeviceStats::default());
        let (state, completion) =
            RequestState::new(UnitId::new(0), IoDirection::Write, 1024, stats.clone());

        state.complete_sub(write_sub(0, &[0u8; 512], false), Ok(()));
        state.complete_sub(write_sub(1, &[0u8; 512], false), Ok(()));

        completion.wait().await.unwrap();
        assert_eq!(stats.snapshot().bytes_written, 1024);
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let stats = Arc::new(DeviceStats::default());
        let (state, completion) =
            RequestState::new(UnitId::new(0), IoDirection::Write, 1024, stats);

        state.complete_sub(
            write_sub(1, &[0u8; 512], false),
            Err(spandisk_common::Error::storage("first")),
        );
        state.complete_sub(
            write_sub(0, &[0u8; 512], false),
            Err(spandisk_common::Error::storage("second")),
        );

        let err = completion.wait().await.unwrap_err();
        match err {
            DeviceError::Component { index, source } => {
                assert_eq!(index, 1);
                assert!(source.to_string().contains("first"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_mirror_error_does_not_fail_request() {
        let stats = Arc::new(DeviceStats::default());
        let (state, completion) =
            RequestState::new(UnitId::new(0), IoDirection::Write, 512, stats.clone());

        // The mirror duplicate fails but counts for nothing.
        state.complete_sub(
            write_sub(2, &[0u8; 512], true),
            Err(spandisk_common::Error::storage("mirror dead")),
        );
        state.complete_sub(write_sub(0, &[0u8; 512], false), Ok(()));

        completion.wait().await.unwrap();
        assert_eq!(stats.snapshot().mirror_errors, 1);
    }

    #[tokio::test]
    async fn test_direct_read_reassembly_out_of_order() {
        let stats = Arc::new(DeviceStats::default());
        let (state, completion) =
            RequestState::new(UnitId::new(0), IoDirection::Read, 1536, stats);

        let mut parent = BytesMut::zeroed(1536);
        let mut first = parent.split_to(512);
        let mut second = parent.split_to(512);
        let mut third = parent;
        first.fill(0xaa);
        second.fill(0xbb);
        third.fill(0xcc);

        // Completions arrive in scrambled order.
        for (offset, chunk) in [(1024usize, third), (0, first), (512, second)] {
            state.complete_sub(
                SubRequest {
                    component: 0,
                    block: 0,
                    mirror: false,
                    parent_offset: offset,
                    payload: SubPayload::DirectRead(chunk),
                },
                Ok(()),
            );
        }

        let data = completion.wait().await.unwrap();
        assert_eq!(data.len(), 1536);
        assert!(data[..512].iter().all(|&b| b == 0xaa));
        assert!(data[512..1024].iter().all(|&b| b == 0xbb));
        assert!(data[1024..].iter().all(|&b| b == 0xcc));
    }

    #[tokio::test]
    async fn test_scatter_read_copy_back() {
        let stats = Arc::new(DeviceStats::default());
        let (state, completion) =
            RequestState::new(UnitId::new(0), IoDirection::Read, 1024, stats);
        state.set_scatter_buf(BytesMut::zeroed(1024));

        let pool = RemapPool::new(4096);
        let mut remap = pool.allocate(1024).await.unwrap();
        remap[..512].fill(0x11);
        remap[512..1024].fill(0x22);

        // Two fragments landing at swapped parent offsets.
        state.complete_sub(
            SubRequest {
                component: 0,
                block: 0,
                mirror: false,
                parent_offset: 0,
                payload: SubPayload::Scatter {
                    remap,
                    len: 1024,
                    frags: vec![
                        Fragment {
                            parent_offset: 512,
                            len: 512,
                        },
                        Fragment {
                            parent_offset: 0,
                            len: 512,
                        },
                    ],
                },
            },
            Ok(()),
        );

        let data = completion.wait().await.unwrap();
        assert!(data[..512].iter().all(|&b| b == 0x22));
        assert!(data[512..].iter().all(|&b| b == 0x11));
    }

    #[tokio::test]
    #[should_panic(expected = "exceeds")]
    async fn test_overrun_panics() {
        let stats = Arc::new(DeviceStats::default());
        let (state, _completion) =
            RequestState::new(UnitId::new(0), IoDirection::Write, 256, stats);
        state.complete_sub(write_sub(0, &[0u8; 512], false), Ok(()));
    }
}
