//! Raw device access with exclusive open
//!
//! A [`RawDevice`] wraps one backing block device or regular file:
//! - opened exclusively: a second open of the same path fails with a
//!   busy error (advisory `flock` plus `O_EXCL` for block devices)
//! - optional direct I/O bypassing the page cache (Linux `O_DIRECT`)
//! - size and native sector size discovery via ioctl for block devices

use crate::aligned::ALIGNMENT;
use nix::fcntl::{Flock, FlockArg};
use spandisk_common::{BLOCK_SIZE, Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Options for opening a raw device
#[derive(Clone, Copy, Debug, Default)]
pub struct RawOpenOptions {
    /// Open without write access
    pub read_only: bool,
    /// Bypass the page cache; offsets and lengths must then be aligned
    /// to [`ALIGNMENT`]
    pub direct: bool,
}

/// An exclusively opened backing device
#[derive(Debug)]
pub struct RawDevice {
    file: Flock<File>,
    path: String,
    size: u64,
    sector_size: u32,
    read_only: bool,
    direct: bool,
}

impl RawDevice {
    /// Open a block device or regular file for raw I/O
    ///
    /// Fails with [`Error::Busy`] if the path is already held by another
    /// `RawDevice` (or anything else holding an exclusive `flock`), and
    /// with [`Error::WrongType`] for anything that is neither a block
    /// device nor a regular file.
    pub fn open(path: impl AsRef<Path>, opts: RawOpenOptions) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let metadata = std::fs::metadata(&path)
            .map_err(|e| Error::Storage(format!("failed to stat {path_str}: {e}")))?;
        let file_type = metadata.file_type();
        let is_block = is_block_device(&file_type);
        if !is_block && !file_type.is_file() {
            return Err(Error::WrongType(path_str));
        }

        let mut options = OpenOptions::new();
        options.read(true);
        if !opts.read_only {
            options.write(true);
        }

        #[cfg(target_os = "linux")]
        {
            let mut flags = 0;
            if opts.direct {
                flags |= libc::O_DIRECT;
            }
            if is_block {
                // On a block device O_EXCL (without O_CREAT) rejects
                // opens while the device is mounted or claimed.
                flags |= libc::O_EXCL;
            }
            options.custom_flags(flags);
        }

        let file = options.open(&path).map_err(|e| {
            if e.raw_os_error() == Some(libc::EBUSY) {
                Error::Busy(path_str.clone())
            } else {
                Error::Storage(format!("failed to open {path_str}: {e}"))
            }
        })?;

        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => {
                return Err(Error::Busy(path_str));
            }
            Err((_, errno)) => {
                return Err(Error::Storage(format!(
                    "failed to lock {path_str}: {errno}"
                )));
            }
        };

        let (size, sector_size) = if is_block {
            (
                block_device_size(&file, &path_str)?,
                block_device_sector_size(&file),
            )
        } else {
            (metadata.len(), BLOCK_SIZE as u32)
        };

        debug!(
            path = %path_str,
            size,
            sector_size,
            block_device = is_block,
            direct = opts.direct,
            "opened raw device"
        );

        Ok(Self {
            file,
            path: path_str,
            size,
            sector_size,
            read_only: opts.read_only,
            direct: opts.direct,
        })
    }

    /// Create a regular file of the given size and open it
    ///
    /// Intended for tests and file-backed components.
    pub fn create(path: impl AsRef<Path>, size: u64, opts: RawOpenOptions) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {path_str}: {e}")))?;
        file.set_len(size)
            .map_err(|e| Error::Storage(format!("failed to size {path_str}: {e}")))?;
        drop(file);
        Self::open(path, opts)
    }

    /// Device path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Total size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Total size in whole blocks
    #[must_use]
    pub const fn size_blocks(&self) -> u64 {
        self.size / BLOCK_SIZE
    }

    /// Native sector size in bytes
    #[must_use]
    pub const fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Read exactly `buf.len()` bytes at a byte offset
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_access(offset, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::Storage(format!("read failed on {}: {e}", self.path)))
    }

    /// Write all of `data` at a byte offset
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly(self.path.clone()));
        }
        self.check_access(offset, data.len())?;
        self.file
            .write_all_at(data, offset)
            .map_err(|e| Error::Storage(format!("write failed on {}: {e}", self.path)))
    }

    /// Flush data to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("sync failed on {}: {e}", self.path)))
    }

    fn check_access(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.size {
            return Err(Error::OutOfRange {
                offset,
                length: len,
                size: self.size,
            });
        }
        if self.direct
            && (offset % ALIGNMENT as u64 != 0 || len % ALIGNMENT != 0)
        {
            return Err(Error::Unaligned {
                offset,
                length: len,
                alignment: ALIGNMENT,
            });
        }
        Ok(())
    }
}

fn is_block_device(file_type: &std::fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_block_device()
}

/// Get a block device's size with the BLKGETSIZE64 ioctl
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn block_device_size(file: &File, path: &str) -> Result<u64> {
    use std::os::unix::io::AsRawFd;

    const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a u64 through the provided pointer.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &raw mut size) };
    if ret == -1 {
        return Err(Error::Storage(format!(
            "failed to get size of {path}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(size)
}

#[cfg(not(target_os = "linux"))]
fn block_device_size(file: &File, path: &str) -> Result<u64> {
    use std::io::{Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::End(0))
        .map_err(|e| Error::Storage(format!("failed to get size of {path}: {e}")))
}

/// Get a block device's logical sector size, falling back to 512
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn block_device_sector_size(file: &File) -> u32 {
    use std::os::unix::io::AsRawFd;

    const BLKSSZGET: libc::c_ulong = 0x1268;

    let mut sector_size: libc::c_int = 0;
    // SAFETY: BLKSSZGET writes an int through the provided pointer.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET, &raw mut sector_size) };
    if ret == -1 || sector_size <= 0 {
        return BLOCK_SIZE as u32;
    }
    sector_size as u32
}

#[cfg(not(target_os = "linux"))]
fn block_device_sector_size(_file: &File) -> u32 {
    BLOCK_SIZE as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_rw() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("comp0");

        let dev = RawDevice::create(&path, 64 * 1024, RawOpenOptions::default()).unwrap();
        assert_eq!(dev.size(), 64 * 1024);
        assert_eq!(dev.size_blocks(), 128);
        assert_eq!(dev.sector_size(), 512);

        let pattern = vec![0xabu8; 1024];
        dev.write_at(512, &pattern).unwrap();

        let mut back = vec![0u8; 1024];
        dev.read_at(512, &mut back).unwrap();
        assert_eq!(back, pattern);
    }

    #[test]
    fn test_exclusive_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("comp0");

        let first = RawDevice::create(&path, 8192, RawOpenOptions::default()).unwrap();
        let second = RawDevice::open(&path, RawOpenOptions::default());
        assert!(matches!(second, Err(Error::Busy(_))));

        // Released on drop; a reopen then succeeds.
        drop(first);
        RawDevice::open(&path, RawOpenOptions::default()).unwrap();
    }

    #[test]
    fn test_out_of_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("comp0");

        let dev = RawDevice::create(&path, 4096, RawOpenOptions::default()).unwrap();
        let mut buf = vec![0u8; 1024];
        let err = dev.read_at(4096 - 512, &mut buf).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("comp0");
        RawDevice::create(&path, 4096, RawOpenOptions::default()).unwrap();

        let dev = RawDevice::open(
            &path,
            RawOpenOptions {
                read_only: true,
                direct: false,
            },
        )
        .unwrap();
        let err = dev.write_at(0, &[0u8; 512]).unwrap_err();
        assert!(matches!(err, Error::ReadOnly(_)));
    }

    #[test]
    fn test_wrong_type() {
        let dir = tempdir().unwrap();
        let err = RawDevice::open(dir.path(), RawOpenOptions::default());
        assert!(matches!(err, Err(Error::WrongType(_)) | Err(Error::Storage(_))));
    }
}
