//! Aligned direct I/O on the management volume
//!
//! The metadata LV is accessed with O_DIRECT, which requires offset,
//! length and buffer address all aligned to the device's minimum I/O
//! block size. [`MetaFile`] hides that: callers ask for arbitrary
//! sector-granular ranges and the whole covering aligned range is read
//! or read-modified-rewritten underneath.

use lvhd_common::{Result, SECTOR_SIZE, StorageError};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Buffer whose address is aligned for direct I/O
#[derive(Debug)]
pub struct AlignedBuf {
    data: Vec<u8>,
    alignment: usize,
}

#[allow(unsafe_code)]
impl AlignedBuf {
    /// Zeroed buffer of `size` bytes, rounded up to `alignment`
    #[must_use]
    pub fn new(size: usize, alignment: usize) -> Self {
        use std::alloc::{Layout, alloc_zeroed};

        let aligned_size = size.div_ceil(alignment) * alignment;
        let layout = Layout::from_size_align(aligned_size.max(alignment), alignment)
            .expect("invalid layout for aligned buffer");

        let data = unsafe {
            let ptr = alloc_zeroed(layout);
            assert!(!ptr.is_null(), "failed to allocate aligned buffer");
            Vec::from_raw_parts(ptr, aligned_size, aligned_size)
        };

        Self { data, alignment }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[allow(unsafe_code)]
impl Drop for AlignedBuf {
    fn drop(&mut self) {
        use std::alloc::{Layout, dealloc};

        if !self.data.is_empty() {
            let layout = Layout::from_size_align(self.data.capacity(), self.alignment)
                .expect("invalid layout for deallocation");
            unsafe {
                let ptr = self.data.as_mut_ptr();
                std::mem::forget(std::mem::take(&mut self.data));
                dealloc(ptr, layout);
            }
        }
    }
}

/// The management volume, opened for aligned-range access
pub struct MetaFile {
    file: File,
    path: String,
    block_size: u64,
    direct: bool,
}

impl MetaFile {
    /// Open the device or file. With `direct`, O_DIRECT is requested and the
    /// block size is queried from the device; without it (regular files,
    /// tests) the 512-byte sector size is used.
    pub fn open(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(!direct);
        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options.open(&path).map_err(|e| {
            StorageError::metadata(format!("failed to open {path_str}: {e}"))
        })?;

        let block_size = if direct {
            Self::device_block_size(&file).unwrap_or(SECTOR_SIZE)
        } else {
            SECTOR_SIZE
        };

        Ok(Self {
            file,
            path: path_str,
            block_size,
            direct,
        })
    }

    /// Minimum I/O size of the underlying block device
    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn device_block_size(file: &File) -> Option<u64> {
        use std::os::unix::io::AsRawFd;

        // BLKSSZGET
        const BLKSSZGET: libc::c_ulong = 0x1268;

        let mut size: libc::c_int = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET, &mut size) };
        if ret == -1 || size <= 0 {
            return None;
        }
        Some(size as u64)
    }

    #[cfg(not(target_os = "linux"))]
    fn device_block_size(_file: &File) -> Option<u64> {
        None
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read `[offset, offset+len)`. The covering aligned range is read and
    /// the requested slice returned; short reads past EOF come back zeroed.
    pub fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let (lower, upper) = aligned_range(self.block_size, offset, len);
        let mut buf = AlignedBuf::new((upper - lower) as usize, self.block_size as usize);

        let mut read_total = 0;
        let slice = buf.as_mut_slice();
        while read_total < slice.len() {
            let n = self
                .file
                .read_at(&mut slice[read_total..], lower + read_total as u64)
                .map_err(|e| {
                    StorageError::metadata(format!("read failed on {}: {e}", self.path))
                })?;
            if n == 0 {
                break;
            }
            read_total += n;
        }

        let start = (offset - lower) as usize;
        Ok(buf.as_slice()[start..start + len as usize].to_vec())
    }

    /// Rewrite `[offset, offset+len)` with `data`. The covering aligned
    /// range is read, modified and written back whole, never as a
    /// sub-block partial write.
    pub fn write_range(&self, offset: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        let (lower, upper) = aligned_range(self.block_size, offset, len);
        let existing = self.read_range(lower, upper - lower)?;

        let mut buf = AlignedBuf::new((upper - lower) as usize, self.block_size as usize);
        buf.as_mut_slice().copy_from_slice(&existing);
        let start = (offset - lower) as usize;
        buf.as_mut_slice()[start..start + data.len()].copy_from_slice(data);

        self.file.write_all_at(buf.as_slice(), lower).map_err(|e| {
            StorageError::metadata(format!("write failed on {}: {e}", self.path))
        })?;
        if !self.direct {
            self.file.sync_data().map_err(|e| {
                StorageError::metadata(format!("sync failed on {}: {e}", self.path))
            })?;
        }
        Ok(())
    }
}

/// The smallest `[lower, upper)` range that is block-aligned and covers
/// `[offset, offset+len)`
#[must_use]
pub fn aligned_range(block_size: u64, offset: u64, len: u64) -> (u64, u64) {
    let lower = (offset / block_size) * block_size;
    let upper = (offset + len).div_ceil(block_size) * block_size;
    (lower, upper)
}
