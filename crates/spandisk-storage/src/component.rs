//! The component device seam
//!
//! The device engine never touches files directly; every sub-request is
//! dispatched through [`ComponentDevice`]. Two implementations are
//! provided: [`FileComponent`] over an exclusively opened [`RawDevice`],
//! and [`MemComponent`], a RAM-backed device used by tests and the
//! verify smoke check.

use crate::aligned::AlignedBuffer;
use crate::raw::{RawDevice, RawOpenOptions};
use async_trait::async_trait;
use parking_lot::Mutex;
use spandisk_common::{BLOCK_SIZE, Error, Result};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One backing block device, addressed in 512-byte blocks
///
/// Transfers are all-or-nothing: a short read or write surfaces as an
/// error, never as a partial count.
#[async_trait]
pub trait ComponentDevice: Send + Sync + fmt::Debug {
    /// Path or name identifying the device
    fn path(&self) -> &str;

    /// Raw capacity in blocks
    fn size_blocks(&self) -> u64;

    /// Native sector size in bytes
    fn sector_size(&self) -> u32;

    /// Read exactly `buf.len()` bytes starting at a block offset
    async fn read_at(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data` starting at a block offset
    async fn write_at(&self, block: u64, data: &[u8]) -> Result<()>;
}

/// File or block-device backed component
///
/// Synchronous raw I/O is pushed onto the blocking thread pool; data is
/// staged through an [`AlignedBuffer`] so direct-I/O opens keep their
/// alignment guarantee.
#[derive(Debug)]
pub struct FileComponent {
    raw: Arc<RawDevice>,
}

impl FileComponent {
    /// Open a component exclusively
    pub fn open(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let raw = RawDevice::open(
            path,
            RawOpenOptions {
                read_only: false,
                direct,
            },
        )?;
        Ok(Self { raw: Arc::new(raw) })
    }

    /// Wrap an already opened raw device
    #[must_use]
    pub fn from_raw(raw: RawDevice) -> Self {
        Self { raw: Arc::new(raw) }
    }
}

#[async_trait]
impl ComponentDevice for FileComponent {
    fn path(&self) -> &str {
        self.raw.path()
    }

    fn size_blocks(&self) -> u64 {
        self.raw.size_blocks()
    }

    fn sector_size(&self) -> u32 {
        self.raw.sector_size()
    }

    async fn read_at(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        let raw = Arc::clone(&self.raw);
        let len = buf.len();
        let offset = block * BLOCK_SIZE;
        let staged = tokio::task::spawn_blocking(move || {
            let mut staged = AlignedBuffer::new(len);
            raw.read_at(offset, staged.as_mut_slice())?;
            Ok::<_, Error>(staged)
        })
        .await
        .map_err(|e| Error::internal(format!("blocking read task failed: {e}")))??;
        buf.copy_from_slice(staged.as_slice());
        Ok(())
    }

    async fn write_at(&self, block: u64, data: &[u8]) -> Result<()> {
        let raw = Arc::clone(&self.raw);
        let offset = block * BLOCK_SIZE;
        let mut staged = AlignedBuffer::new(data.len());
        staged.copy_from(data);
        tokio::task::spawn_blocking(move || raw.write_at(offset, staged.as_slice()))
            .await
            .map_err(|e| Error::internal(format!("blocking write task failed: {e}")))?
    }
}

/// RAM-backed component device
///
/// Bounds violations return errors rather than growing the store, so a
/// sub-request straying outside its component surfaces in tests.
pub struct MemComponent {
    name: String,
    data: Mutex<Vec<u8>>,
    sector_size: u32,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemComponent {
    /// Create a zero-filled in-memory component of `blocks` blocks
    #[must_use]
    pub fn new(name: impl Into<String>, blocks: u64) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(vec![0u8; (blocks * BLOCK_SIZE) as usize]),
            sector_size: BLOCK_SIZE as u32,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Create with a non-default native sector size
    #[must_use]
    pub fn with_sector_size(name: impl Into<String>, blocks: u64, sector_size: u32) -> Self {
        let mut component = Self::new(name, blocks);
        component.sector_size = sector_size;
        component
    }

    /// Make every subsequent read fail
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot the raw contents
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    fn check_range(&self, block: u64, len: usize) -> Result<u64> {
        let offset = block * BLOCK_SIZE;
        let size = self.data.lock().len() as u64;
        if offset + len as u64 > size {
            return Err(Error::OutOfRange {
                offset,
                length: len,
                size,
            });
        }
        Ok(offset)
    }
}

impl fmt::Debug for MemComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemComponent")
            .field("name", &self.name)
            .field("blocks", &(self.data.lock().len() as u64 / BLOCK_SIZE))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ComponentDevice for MemComponent {
    fn path(&self) -> &str {
        &self.name
    }

    fn size_blocks(&self) -> u64 {
        self.data.lock().len() as u64 / BLOCK_SIZE
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    async fn read_at(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("injected read error on {}", self.name)));
        }
        let offset = self.check_range(block, buf.len())? as usize;
        let data = self.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    async fn write_at(&self, block: u64, data: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("injected write error on {}", self.name)));
        }
        let offset = self.check_range(block, data.len())? as usize;
        let mut store = self.data.lock();
        store[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_mem_component_roundtrip() {
        let comp = MemComponent::new("mem0", 16);
        assert_eq!(comp.size_blocks(), 16);

        let pattern = vec![0x5au8; 1024];
        comp.write_at(2, &pattern).await.unwrap();

        let mut back = vec![0u8; 1024];
        comp.read_at(2, &mut back).await.unwrap();
        assert_eq!(back, pattern);
    }

    #[tokio::test]
    async fn test_mem_component_bounds() {
        let comp = MemComponent::new("mem0", 4);
        let mut buf = vec![0u8; 1024];
        let err = comp.read_at(3, &mut buf).await.unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn test_mem_component_injected_errors() {
        let comp = MemComponent::new("mem0", 4);
        comp.fail_writes(true);
        let err = comp.write_at(0, &[0u8; 512]).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        comp.fail_writes(false);
        comp.write_at(0, &[1u8; 512]).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_component_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("comp0");
        crate::raw::RawDevice::create(&path, 32 * 1024, RawOpenOptions::default()).unwrap();

        let comp = FileComponent::open(&path, false).unwrap();
        assert_eq!(comp.size_blocks(), 64);
        assert_eq!(comp.sector_size(), 512);

        let pattern: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        comp.write_at(8, &pattern).await.unwrap();

        let mut back = vec![0u8; 2048];
        comp.read_at(8, &mut back).await.unwrap();
        assert_eq!(back, pattern);
    }

    #[tokio::test]
    async fn test_file_component_busy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("comp0");
        crate::raw::RawDevice::create(&path, 8192, RawOpenOptions::default()).unwrap();

        let _held = FileComponent::open(&path, false).unwrap();
        let second = FileComponent::open(&path, false);
        assert!(matches!(second, Err(Error::Busy(_))));
    }
}
