#![forbid(unsafe_code)]
//! Byte-addressed device I/O for snapshim.
//!
//! Provides the `ByteDevice` seam the log reader, merge committer and read
//! service sit on, a file-backed implementation using positional reads and
//! writes, and an in-memory device shared by the test suites of the other
//! crates.

use parking_lot::Mutex;
use snapshim_error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
///
/// Implementations do not pre-check ranges in userspace; short reads and
/// writes surface as I/O errors from the positional calls themselves, which
/// is the only behaviour that holds for both regular files and device nodes.
pub trait ByteDevice: Send + Sync {
    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using Linux `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// touch the shared seek position after open.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    path: String,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only if the path rejects
    /// writes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .or_else(|_| OpenOptions::new().read(true).open(path.as_ref()))?;
        Self::from_file(file, path.as_ref())
    }

    /// Open strictly read-only. Used for the backing device, which must
    /// never be written.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, path.as_ref())
    }

    fn from_file(mut file: File, path: &Path) -> Result<Self> {
        // seek(End) reports the true size for device nodes as well, where
        // metadata().len() is zero.
        let len = file.seek(SeekFrom::End(0))?;
        trace!(
            target: "snapshim::block",
            path = %path.display(),
            len,
            "device_open"
        );
        Ok(Self {
            file: Arc::new(file),
            len,
            path: path.display().to_string(),
        })
    }

    /// Device length at open time, in bytes. Advisory only.
    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    /// Path this device was opened from.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl ByteDevice for FileByteDevice {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Growable in-memory byte device.
///
/// Clones share the same backing store, mirroring how clones of
/// `FileByteDevice` share one file description. Reads past the end fail the
/// way a short positional read does.
#[derive(Debug, Clone, Default)]
pub struct MemByteDevice {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.data.lock().len() as u64
    }

    /// Copy of the full contents, for assertions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let offset = usize::try_from(offset)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        let end = offset
            .checked_add(buf.len())
            .filter(|end| *end <= data.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let offset = usize::try_from(offset)
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::WriteZero))?;
        let end = offset
            .checked_add(buf.len())
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::WriteZero))?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
