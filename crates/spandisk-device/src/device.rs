//! The logical device
//!
//! A [`LogicalDevice`] is the assembled form of one unit: validated
//! components, the interleave table, the transfer mode, and the submit
//! entry point that decomposes requests and fans them out.
//!
//! ```text
//!        read / write / submit
//!                 │
//!         ┌───────▼────────┐     bounds check, zero-length
//!         │ LogicalDevice  │     short-circuit
//!         └───────┬────────┘
//!                 │ locate_run() per run
//!         ┌───────▼────────┐
//!         │   decomposer   │  direct: sub per run, spawned as produced
//!         └───────┬────────┘  scatter: sub per component, spawned last
//!       ┌─────────┼─────────┐
//!  ┌────▼───┐ ┌───▼────┐ ┌──▼─────┐
//!  │ comp 0 │ │ comp 1 │ │ comp N │   async sub-request tasks
//!  └────┬───┘ └───┬────┘ └──┬─────┘
//!       └─────────┼─────────┘
//!         ┌───────▼────────┐
//!         │  RequestState  │  atomic byte accounting, exactly-once
//!         └────────────────┘  completion
//! ```

use crate::complete::{IoCompletion, RequestState};
use crate::error::{DeviceError, DeviceResult};
use crate::interleave::InterleaveTable;
use crate::label::{DiskLabel, LABEL_BLOCK};
use crate::remap::RemapPool;
use crate::request::{IoDirection, SubPayload, SubRequest, run_sub};
use crate::stats::{DeviceStats, StatsSnapshot};
use crate::translate::locate_run;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spandisk_common::{BLOCK_SIZE, DeviceFlags, PAGE_BLOCKS, TransferMode, UnitId};
use spandisk_storage::ComponentDevice;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

/// One validated backing component of a logical device
#[derive(Debug)]
pub struct Component {
    device: Arc<dyn ComponentDevice>,
    path: String,
    raw_blocks: u64,
    effective_blocks: u64,
}

impl Component {
    /// Path or name of the backing device
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Capacity as reported by the backing device, in blocks
    #[must_use]
    pub const fn raw_blocks(&self) -> u64 {
        self.raw_blocks
    }

    /// Capacity actually used, after uniform-size and interleave
    /// truncation, in blocks
    #[must_use]
    pub const fn effective_blocks(&self) -> u64 {
        self.effective_blocks
    }

    pub(crate) fn device(&self) -> Arc<dyn ComponentDevice> {
        Arc::clone(&self.device)
    }
}

/// The parent request's data during decomposition
enum ParentData {
    Write(Bytes),
    Read(BytesMut),
}

/// An assembled logical device
#[derive(Debug)]
pub struct LogicalDevice {
    unit: UnitId,
    interleave: u64,
    flags: DeviceFlags,
    mode: TransferMode,
    components: Vec<Component>,
    /// Effective component sizes in table order, for translation
    sizes: Vec<u64>,
    table: InterleaveTable,
    size_blocks: u64,
    pool: Arc<RemapPool>,
    stats: Arc<DeviceStats>,
    opens: AtomicU32,
    label: Mutex<DiskLabel>,
}

impl LogicalDevice {
    /// Validate components and assemble a logical device
    ///
    /// Mirrors require striping, an even component count, and force
    /// uniform sizing; any validation failure leaves nothing behind
    /// (components close when their handles drop).
    pub fn assemble(
        unit: UnitId,
        devices: Vec<Arc<dyn ComponentDevice>>,
        interleave: u64,
        flags: DeviceFlags,
        preferred_mode: TransferMode,
        pool: Arc<RemapPool>,
    ) -> DeviceResult<Self> {
        if devices.is_empty() {
            return Err(DeviceError::NoComponents);
        }
        let mut flags = flags;

        // Record each component, truncating to an interleave boundary.
        let mut components = Vec::with_capacity(devices.len());
        let mut max_sector = 0u32;
        let mut min_size = u64::MAX;
        let mut total = 0u64;
        for device in devices {
            let path = device.path().to_string();
            let raw_blocks = device.size_blocks();
            let mut effective_blocks = raw_blocks;
            if interleave > 1 {
                effective_blocks -= effective_blocks % interleave;
            }
            if effective_blocks == 0 {
                return Err(DeviceError::ZeroSizeComponent(path));
            }
            max_sector = max_sector.max(device.sector_size());
            min_size = min_size.min(effective_blocks);
            total += effective_blocks;
            components.push(Component {
                device,
                path,
                raw_blocks,
                effective_blocks,
            });
        }

        // Don't allow the interleave to be smaller than the biggest
        // component sector.
        let min_blocks = u64::from(max_sector) / BLOCK_SIZE;
        if interleave > 0 && interleave < min_blocks {
            return Err(DeviceError::InterleaveTooSmall {
                interleave,
                min_blocks,
            });
        }

        // Mirroring requires uniform interleave and an even number of
        // components.
        if flags.mirrored {
            flags.uniform = true;
            if interleave == 0 {
                return Err(DeviceError::MirrorRequiresInterleave);
            }
            if components.len() % 2 != 0 {
                return Err(DeviceError::MirrorOddComponents(components.len()));
            }
        }

        let size_blocks = if flags.uniform {
            for component in &mut components {
                component.effective_blocks = min_size;
            }
            if flags.mirrored {
                (components.len() as u64 / 2) * min_size
            } else {
                components.len() as u64 * min_size
            }
        } else {
            total
        };

        // Scatter-gather cannot carry interleaves that aren't a page
        // multiple, nor mirrors; fall back to the direct mode.
        let mode = if flags.mirrored || interleave % PAGE_BLOCKS != 0 {
            if preferred_mode == TransferMode::ScatterGather {
                debug!(%unit, "forcing direct transfer mode");
            }
            TransferMode::Direct
        } else {
            preferred_mode
        };

        let sizes: Vec<u64> = components.iter().map(Component::effective_blocks).collect();
        let table = InterleaveTable::build(&sizes, interleave);
        let label = DiskLabel::synthesize(&unit.name(), size_blocks, interleave, flags);

        info!(
            %unit,
            components = components.len(),
            interleave,
            size_blocks,
            mode = %mode,
            mirrored = flags.mirrored,
            "device assembled"
        );

        Ok(Self {
            unit,
            interleave,
            flags,
            mode,
            components,
            sizes,
            table,
            size_blocks,
            pool,
            stats: Arc::new(DeviceStats::default()),
            opens: AtomicU32::new(0),
            label: Mutex::new(label),
        })
    }

    /// Unit number
    #[must_use]
    pub const fn unit(&self) -> UnitId {
        self.unit
    }

    /// Logical size in blocks
    #[must_use]
    pub const fn size_blocks(&self) -> u64 {
        self.size_blocks
    }

    /// Logical size in bytes
    #[must_use]
    pub const fn size_bytes(&self) -> u64 {
        self.size_blocks * BLOCK_SIZE
    }

    /// Interleave unit in blocks (0 = concatenation)
    #[must_use]
    pub const fn interleave(&self) -> u64 {
        self.interleave
    }

    /// Behavior flags after validation (mirrors force uniform)
    #[must_use]
    pub const fn flags(&self) -> DeviceFlags {
        self.flags
    }

    /// Transfer mode after forcing rules
    #[must_use]
    pub const fn transfer_mode(&self) -> TransferMode {
        self.mode
    }

    /// The validated components in table order
    #[must_use]
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// The interleave table
    #[must_use]
    pub const fn table(&self) -> &InterleaveTable {
        &self.table
    }

    /// I/O counters
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Take an open handle; teardown refuses while any are live
    #[must_use]
    pub fn open(self: &Arc<Self>) -> DeviceHandle {
        self.opens.fetch_add(1, Ordering::SeqCst);
        DeviceHandle {
            device: Arc::clone(self),
        }
    }

    /// Number of live open handles
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Read `bytes` bytes starting at a logical block
    pub async fn read(&self, block: u64, bytes: u64) -> DeviceResult<Bytes> {
        self.submit_read(block, bytes).await?.wait().await
    }

    /// Write `data` starting at a logical block
    pub async fn write(&self, block: u64, data: Bytes) -> DeviceResult<()> {
        self.submit_write(block, data).await?.wait().await.map(|_| ())
    }

    /// Submit a read, returning an awaitable completion
    pub async fn submit_read(&self, block: u64, bytes: u64) -> DeviceResult<IoCompletion> {
        self.start(IoDirection::Read, block, bytes, None).await
    }

    /// Submit a write, returning an awaitable completion
    pub async fn submit_write(&self, block: u64, data: Bytes) -> DeviceResult<IoCompletion> {
        let bytes = data.len() as u64;
        self.start(IoDirection::Write, block, bytes, Some(data)).await
    }

    async fn start(
        &self,
        direction: IoDirection,
        block: u64,
        bytes: u64,
        data: Option<Bytes>,
    ) -> DeviceResult<IoCompletion> {
        // A nil transfer completes immediately, no sub-requests.
        if bytes == 0 {
            return Ok(IoCompletion::immediate(Ok(Bytes::new())));
        }
        if bytes % BLOCK_SIZE != 0 {
            return Err(DeviceError::UnalignedLength(bytes));
        }
        let blocks = bytes / BLOCK_SIZE;
        if block + blocks > self.size_blocks {
            return Err(DeviceError::OutOfBounds {
                block,
                bytes,
                size: self.size_blocks,
            });
        }

        match direction {
            IoDirection::Read => self.stats.note_read(),
            IoDirection::Write => self.stats.note_write(),
        }

        let (state, completion) =
            RequestState::new(self.unit, direction, bytes, Arc::clone(&self.stats));

        let parent = match (direction, data) {
            (IoDirection::Write, Some(data)) => ParentData::Write(data),
            (IoDirection::Read, _) => ParentData::Read(BytesMut::zeroed(bytes as usize)),
            (IoDirection::Write, None) => {
                return Err(spandisk_common::Error::internal("write without data").into());
            }
        };

        match self.mode {
            TransferMode::Direct => self.dispatch_direct(&state, block, bytes, parent),
            TransferMode::ScatterGather => {
                self.dispatch_scatter(&state, block, bytes, parent).await?;
            }
        }

        Ok(completion)
    }

    /// Direct mode: one sub-request per translated run, dispatched as
    /// each run is produced; mirrored writes clone each run onto the
    /// mirror half right after the primary.
    fn dispatch_direct(
        &self,
        state: &Arc<RequestState>,
        block: u64,
        bytes: u64,
        mut parent: ParentData,
    ) {
        let mut bn = block;
        let mut offset = 0usize;
        let mut remaining = bytes;
        while remaining > 0 {
            let run = locate_run(&self.table, &self.sizes, self.flags.mirrored, bn, remaining);
            let len = run.bytes as usize;

            let payload = match &mut parent {
                ParentData::Write(data) => {
                    SubPayload::DirectWrite(data.slice(offset..offset + len))
                }
                ParentData::Read(buf) => SubPayload::DirectRead(buf.split_to(len)),
            };
            self.spawn_sub(SubRequest {
                component: run.component,
                block: run.block,
                mirror: false,
                parent_offset: offset,
                payload,
            }, state);

            // Mirrors take an additional write, dispatched after the
            // primary.
            if let (ParentData::Write(data), Some(mirror)) = (&parent, run.mirror) {
                self.spawn_sub(SubRequest {
                    component: mirror,
                    block: run.block,
                    mirror: true,
                    parent_offset: offset,
                    payload: SubPayload::DirectWrite(data.slice(offset..offset + len)),
                }, state);
            }

            bn += run.bytes / BLOCK_SIZE;
            offset += len;
            remaining -= run.bytes;
        }
    }

    /// Scatter-gather mode: at most one sub-request per component,
    /// fragments staged in a remap buffer, everything dispatched
    /// together once the whole request is decomposed.
    async fn dispatch_scatter(
        &self,
        state: &Arc<RequestState>,
        block: u64,
        bytes: u64,
        parent: ParentData,
    ) -> DeviceResult<()> {
        // Pre-scan which components take part so the remap buffers can
        // be leased in one atomic reservation; piecemeal allocation
        // could leave concurrent requests each holding half a batch.
        let participants = {
            let mut participants = 0usize;
            let mut seen = vec![false; self.components.len()];
            let mut bn = block;
            let mut remaining = bytes;
            while remaining > 0 {
                let run =
                    locate_run(&self.table, &self.sizes, self.flags.mirrored, bn, remaining);
                if !seen[run.component] {
                    seen[run.component] = true;
                    participants += 1;
                }
                bn += run.bytes / BLOCK_SIZE;
                remaining -= run.bytes;
            }
            participants
        };

        // Each participating component gets a buffer sized to the whole
        // request; the lease may wait for pool budget.
        let mut buffers = self
            .pool
            .allocate_batch(bytes as usize, participants)
            .await?;

        let write_data = match parent {
            ParentData::Write(data) => Some(data),
            ParentData::Read(buf) => {
                state.set_scatter_buf(buf);
                None
            }
        };

        let mut slots: Vec<Option<SubRequest>> = Vec::new();
        slots.resize_with(self.components.len(), || None);

        let mut bn = block;
        let mut offset = 0usize;
        let mut remaining = bytes;
        while remaining > 0 {
            let run = locate_run(&self.table, &self.sizes, self.flags.mirrored, bn, remaining);
            let len = run.bytes as usize;

            match &mut slots[run.component] {
                slot @ None => {
                    let remap = buffers.pop().expect("remap batch undersized");
                    let mut sub = SubRequest {
                        component: run.component,
                        block: run.block,
                        mirror: false,
                        parent_offset: 0,
                        payload: SubPayload::Scatter {
                            remap,
                            len: 0,
                            frags: Vec::new(),
                        },
                    };
                    sub.append_fragment(offset, len, write_data.as_ref());
                    *slot = Some(sub);
                }
                Some(sub) => {
                    debug_assert_eq!(
                        sub.next_block(),
                        run.block,
                        "non-contiguous scatter-gather run"
                    );
                    sub.append_fragment(offset, len, write_data.as_ref());
                }
            }

            bn += run.bytes / BLOCK_SIZE;
            offset += len;
            remaining -= run.bytes;
        }

        // Fire off the requests.
        for sub in slots.into_iter().flatten() {
            self.spawn_sub(sub, state);
        }
        Ok(())
    }

    fn spawn_sub(&self, sub: SubRequest, state: &Arc<RequestState>) {
        let device = self.components[sub.component].device();
        tokio::spawn(run_sub(device, sub, Arc::clone(state)));
    }

    /// The in-memory label
    #[must_use]
    pub fn label(&self) -> DiskLabel {
        self.label.lock().clone()
    }

    /// Replace the in-memory label after validating it
    pub fn set_label(&self, label: DiskLabel) -> DeviceResult<()> {
        label.validate()?;
        *self.label.lock() = label;
        Ok(())
    }

    /// Persist the in-memory label through the data path
    pub async fn write_label(&self) -> DeviceResult<()> {
        let encoded = self.label().encode()?;
        self.write(LABEL_BLOCK, encoded).await
    }

    /// Read and validate the on-disk label
    pub async fn read_label(&self) -> DeviceResult<DiskLabel> {
        let data = self.read(LABEL_BLOCK, BLOCK_SIZE).await?;
        DiskLabel::decode(&data)
    }

    /// Adopt the on-disk label if one is present and intact; devices
    /// commonly carry none, which is not an error
    pub async fn load_label(&self) -> bool {
        match self.read_label().await {
            Ok(label) => {
                *self.label.lock() = label;
                true
            }
            Err(e) => {
                debug!(unit = %self.unit, error = %e, "no usable on-disk label");
                false
            }
        }
    }
}

/// Guard for one open reference to a logical device
#[derive(Debug)]
pub struct DeviceHandle {
    device: Arc<LogicalDevice>,
}

impl Deref for DeviceHandle {
    type Target = LogicalDevice;

    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.device.opens.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spandisk_storage::MemComponent;

    fn mem_components(sizes: &[u64]) -> (Vec<Arc<MemComponent>>, Vec<Arc<dyn ComponentDevice>>) {
        let typed: Vec<Arc<MemComponent>> = sizes
            .iter()
            .enumerate()
            .map(|(ix, &blocks)| Arc::new(MemComponent::new(format!("mem{ix}"), blocks)))
            .collect();
        let erased = typed
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn ComponentDevice>)
            .collect();
        (typed, erased)
    }

    fn assemble(
        sizes: &[u64],
        interleave: u64,
        flags: DeviceFlags,
        mode: TransferMode,
    ) -> (Vec<Arc<MemComponent>>, Arc<LogicalDevice>) {
        let (typed, erased) = mem_components(sizes);
        let device = LogicalDevice::assemble(
            UnitId::new(0),
            erased,
            interleave,
            flags,
            mode,
            RemapPool::new(1 << 20),
        )
        .unwrap();
        (typed, Arc::new(device))
    }

    fn pattern(len: usize, seed: u8) -> Bytes {
        Bytes::from(
            (0..len)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect::<Vec<u8>>(),
        )
    }

    #[test]
    fn test_validation_no_components() {
        let err = LogicalDevice::assemble(
            UnitId::new(0),
            Vec::new(),
            0,
            DeviceFlags::default(),
            TransferMode::default(),
            RemapPool::new(1 << 20),
        )
        .unwrap_err();
        assert!(matches!(err, DeviceError::NoComponents));
    }

    #[test]
    fn test_validation_zero_size_after_truncation() {
        let (_, erased) = mem_components(&[64, 6]);
        // 6 blocks truncate to 0 at interleave 8.
        let err = LogicalDevice::assemble(
            UnitId::new(0),
            erased,
            8,
            DeviceFlags::default(),
            TransferMode::default(),
            RemapPool::new(1 << 20),
        )
        .unwrap_err();
        assert!(matches!(err, DeviceError::ZeroSizeComponent(_)));
    }

    #[test]
    fn test_validation_interleave_vs_sector() {
        let big_sector: Arc<dyn ComponentDevice> =
            Arc::new(MemComponent::with_sector_size("mem0", 64, 4096));
        let err = LogicalDevice::assemble(
            UnitId::new(0),
            vec![big_sector],
            4,
            DeviceFlags::default(),
            TransferMode::default(),
            RemapPool::new(1 << 20),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InterleaveTooSmall { min_blocks: 8, .. }
        ));
    }

    #[test]
    fn test_validation_mirror_parity() {
        let (_, erased) = mem_components(&[64, 64, 64]);
        let flags = DeviceFlags {
            mirrored: true,
            uniform: false,
        };
        let err = LogicalDevice::assemble(
            UnitId::new(0),
            erased,
            8,
            flags,
            TransferMode::default(),
            RemapPool::new(1 << 20),
        )
        .unwrap_err();
        assert!(matches!(err, DeviceError::MirrorOddComponents(3)));
    }

    #[test]
    fn test_validation_mirror_needs_interleave() {
        let (_, erased) = mem_components(&[64, 64]);
        let flags = DeviceFlags {
            mirrored: true,
            uniform: false,
        };
        let err = LogicalDevice::assemble(
            UnitId::new(0),
            erased,
            0,
            flags,
            TransferMode::default(),
            RemapPool::new(1 << 20),
        )
        .unwrap_err();
        assert!(matches!(err, DeviceError::MirrorRequiresInterleave));
    }

    #[test]
    fn test_uniform_and_mirror_sizing() {
        let (_, device) = assemble(
            &[64, 80, 64, 96],
            8,
            DeviceFlags {
                mirrored: true,
                uniform: false,
            },
            TransferMode::default(),
        );
        // Mirror forces uniform: everything truncates to 64, and the
        // aggregate halves.
        assert!(device.flags().uniform);
        assert_eq!(device.size_blocks(), 2 * 64);
        assert!(device
            .components()
            .iter()
            .all(|c| c.effective_blocks() == 64));
    }

    #[test]
    fn test_mode_forcing() {
        // Page-multiple interleave keeps scatter-gather.
        let (_, device) = assemble(&[64, 64], 8, DeviceFlags::default(), TransferMode::default());
        assert_eq!(device.transfer_mode(), TransferMode::ScatterGather);

        // Non-page-multiple interleave forces direct.
        let (_, device) = assemble(&[60, 60], 10, DeviceFlags::default(), TransferMode::default());
        assert_eq!(device.transfer_mode(), TransferMode::Direct);

        // Mirrors force direct.
        let (_, device) = assemble(
            &[64, 64],
            8,
            DeviceFlags {
                mirrored: true,
                uniform: false,
            },
            TransferMode::default(),
        );
        assert_eq!(device.transfer_mode(), TransferMode::Direct);
    }

    #[tokio::test]
    async fn test_zero_length_request() {
        let (_, device) = assemble(&[64, 64], 8, DeviceFlags::default(), TransferMode::default());
        let data = device.read(0, 0).await.unwrap();
        assert!(data.is_empty());
        device.write(0, Bytes::new()).await.unwrap();
        // Nothing was counted: the request never reached decomposition.
        assert_eq!(device.stats().reads, 0);
        assert_eq!(device.stats().writes, 0);
    }

    #[tokio::test]
    async fn test_bounds_and_alignment_checks() {
        let (_, device) = assemble(&[64, 64], 8, DeviceFlags::default(), TransferMode::default());

        let err = device.read(120, 16 * BLOCK_SIZE).await.unwrap_err();
        assert!(matches!(err, DeviceError::OutOfBounds { .. }));

        let err = device.read(0, 100).await.unwrap_err();
        assert!(matches!(err, DeviceError::UnalignedLength(100)));
    }

    #[tokio::test]
    async fn test_concat_roundtrip_both_modes() {
        for mode in [TransferMode::Direct, TransferMode::ScatterGather] {
            let (_, device) = assemble(&[16, 8, 24], 0, DeviceFlags::default(), mode);
            assert_eq!(device.size_blocks(), 48);
            assert_eq!(device.transfer_mode(), mode);

            // Spans all three component boundaries.
            let data = pattern(48 * BLOCK_SIZE as usize, 7);
            device.write(0, data.clone()).await.unwrap();
            let back = device.read(0, 48 * BLOCK_SIZE).await.unwrap();
            assert_eq!(back, data);
        }
    }

    #[tokio::test]
    async fn test_striped_roundtrip_both_modes() {
        for mode in [TransferMode::Direct, TransferMode::ScatterGather] {
            let (_, device) = assemble(&[64, 64, 64, 64], 8, DeviceFlags::default(), mode);
            assert_eq!(device.size_blocks(), 256);

            let data = pattern(256 * BLOCK_SIZE as usize, 3);
            device.write(0, data.clone()).await.unwrap();
            let back = device.read(0, 256 * BLOCK_SIZE).await.unwrap();
            assert_eq!(back, data);

            // Unaligned sub-range.
            let back = device.read(13, 5 * BLOCK_SIZE).await.unwrap();
            assert_eq!(
                back,
                data.slice(13 * BLOCK_SIZE as usize..18 * BLOCK_SIZE as usize)
            );
        }
    }

    #[tokio::test]
    async fn test_striping_places_blocks_round_robin() {
        let (comps, device) =
            assemble(&[64, 64], 8, DeviceFlags::default(), TransferMode::Direct);

        // Two full stripes: stripe 0 → component 0, stripe 1 →
        // component 1.
        let mut data = BytesMut::zeroed(16 * BLOCK_SIZE as usize);
        data[..8 * BLOCK_SIZE as usize].fill(0x0a);
        data[8 * BLOCK_SIZE as usize..].fill(0x0b);
        device.write(0, data.freeze()).await.unwrap();

        let c0 = comps[0].contents();
        let c1 = comps[1].contents();
        assert!(c0[..8 * BLOCK_SIZE as usize].iter().all(|&b| b == 0x0a));
        assert!(c1[..8 * BLOCK_SIZE as usize].iter().all(|&b| b == 0x0b));
    }

    #[tokio::test]
    async fn test_mixed_sizes_roundtrip() {
        let (_, device) = assemble(&[100, 60], 10, DeviceFlags::default(), TransferMode::default());
        assert_eq!(device.size_blocks(), 160);
        // Forced direct: interleave 10 is not a page multiple.
        assert_eq!(device.transfer_mode(), TransferMode::Direct);

        let data = pattern(160 * BLOCK_SIZE as usize, 11);
        device.write(0, data.clone()).await.unwrap();
        let back = device.read(0, 160 * BLOCK_SIZE).await.unwrap();
        assert_eq!(back, data);

        // The tail past the shared region lives on the larger
        // component alone.
        let back = device.read(150, 10 * BLOCK_SIZE).await.unwrap();
        assert_eq!(back, data.slice(150 * BLOCK_SIZE as usize..));
    }

    #[tokio::test]
    async fn test_mirror_write_duplicates() {
        let (comps, device) = assemble(
            &[64, 64, 64, 64],
            8,
            DeviceFlags {
                mirrored: true,
                uniform: false,
            },
            TransferMode::default(),
        );
        assert_eq!(device.size_blocks(), 128);

        // One stripe at block 0: primary on component 0, duplicate on
        // component 2.
        let data = pattern(8 * BLOCK_SIZE as usize, 42);
        device.write(0, data.clone()).await.unwrap();

        let c0 = comps[0].contents();
        let c2 = comps[2].contents();
        assert_eq!(&c0[..data.len()], &data[..]);
        assert_eq!(&c2[..data.len()], &data[..]);
        // The other pair saw nothing.
        assert!(comps[1].contents().iter().all(|&b| b == 0));
        assert!(comps[3].contents().iter().all(|&b| b == 0));

        let back = device.read(0, 8 * BLOCK_SIZE).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_mirror_full_device_roundtrip() {
        let (comps, device) = assemble(
            &[32, 32, 32, 32],
            8,
            DeviceFlags {
                mirrored: true,
                uniform: false,
            },
            TransferMode::default(),
        );

        let data = pattern(device.size_bytes() as usize, 99);
        device.write(0, data.clone()).await.unwrap();
        let back = device.read(0, device.size_bytes()).await.unwrap();
        assert_eq!(back, data);

        // Each mirror half is an exact copy of its primary.
        assert_eq!(comps[0].contents(), comps[2].contents());
        assert_eq!(comps[1].contents(), comps[3].contents());
    }

    #[tokio::test]
    async fn test_component_error_propagates_first() {
        let (comps, device) =
            assemble(&[64, 64], 8, DeviceFlags::default(), TransferMode::Direct);
        comps[1].fail_writes(true);

        let err = device
            .write(0, pattern(16 * BLOCK_SIZE as usize, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Component { index: 1, .. }));
        assert_eq!(device.stats().write_errors, 1);
    }

    #[tokio::test]
    async fn test_mirror_error_is_best_effort() {
        let (comps, device) = assemble(
            &[64, 64, 64, 64],
            8,
            DeviceFlags {
                mirrored: true,
                uniform: false,
            },
            TransferMode::default(),
        );
        // Component 2 mirrors component 0; its failure must not fail
        // the write.
        comps[2].fail_writes(true);

        let data = pattern(8 * BLOCK_SIZE as usize, 5);
        device.write(0, data.clone()).await.unwrap();
        assert_eq!(device.stats().mirror_errors, 1);

        let back = device.read(0, 8 * BLOCK_SIZE).await.unwrap();
        assert_eq!(back, data);
    }

    #[tokio::test]
    async fn test_concurrent_requests_complete_exactly_once() {
        let (_, device) = assemble(
            &[256, 256, 256, 256],
            8,
            DeviceFlags::default(),
            TransferMode::default(),
        );

        // K concurrent writers on disjoint ranges, then K readers.
        let mut handles = Vec::new();
        for k in 0..16u64 {
            let device = Arc::clone(&device);
            handles.push(tokio::spawn(async move {
                let data = pattern(64 * BLOCK_SIZE as usize, k as u8);
                device.write(k * 64, data.clone()).await.unwrap();
                let back = device.read(k * 64, 64 * BLOCK_SIZE).await.unwrap();
                assert_eq!(back, data);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = device.stats();
        assert_eq!(stats.writes, 16);
        assert_eq!(stats.reads, 16);
        assert_eq!(stats.bytes_written, 16 * 64 * BLOCK_SIZE);
        assert_eq!(stats.bytes_read, 16 * 64 * BLOCK_SIZE);
    }

    #[tokio::test]
    async fn test_random_subrange_roundtrips() {
        use rand::Rng;

        // Arbitrary fragmentation patterns over a striped device, in
        // both modes: every sub-range written must read back intact.
        let mut rng = rand::thread_rng();
        for mode in [TransferMode::Direct, TransferMode::ScatterGather] {
            let (_, device) = assemble(&[48, 80, 64], 8, DeviceFlags::default(), mode);
            let size = device.size_blocks();

            let base = pattern(device.size_bytes() as usize, 17);
            device.write(0, base.clone()).await.unwrap();

            for _ in 0..32 {
                let block = rng.gen_range(0..size);
                let blocks = rng.gen_range(1..=size - block);
                let data = pattern(blocks as usize * BLOCK_SIZE as usize, rng.r#gen());

                device.write(block, data.clone()).await.unwrap();
                let back = device.read(block, blocks * BLOCK_SIZE).await.unwrap();
                assert_eq!(back, data, "mismatch at block {block} +{blocks}");
            }
        }
    }

    #[tokio::test]
    async fn test_open_handles_counted() {
        let (_, device) = assemble(&[64], 0, DeviceFlags::default(), TransferMode::default());
        assert_eq!(device.open_count(), 0);
        let h1 = device.open();
        let h2 = device.open();
        assert_eq!(device.open_count(), 2);
        drop(h1);
        assert_eq!(device.open_count(), 1);
        drop(h2);
        assert_eq!(device.open_count(), 0);
    }

    #[tokio::test]
    async fn test_label_roundtrip_through_data_path() {
        let (_, device) = assemble(&[64, 64], 8, DeviceFlags::default(), TransferMode::default());

        // No label on a fresh device.
        assert!(!device.load_label().await);

        device.write_label().await.unwrap();
        let label = device.read_label().await.unwrap();
        assert_eq!(label, device.label());
        assert_eq!(label.size_blocks, device.size_blocks());
        assert!(device.load_label().await);
    }

    #[tokio::test]
    async fn test_scatter_pool_too_small() {
        let (_, erased) = mem_components(&[64, 64]);
        let device = LogicalDevice::assemble(
            UnitId::new(0),
            erased,
            8,
            DeviceFlags::default(),
            TransferMode::ScatterGather,
            RemapPool::new(1024),
        )
        .unwrap();

        let err = device
            .write(0, pattern(16 * BLOCK_SIZE as usize, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::RequestTooLarge { .. }));
    }
}
