#![forbid(unsafe_code)]
//! Fixed geometry, chunk arithmetic and wire codecs for snapshim.
//!
//! Everything the kernel protocol fixes lives here: the 512-byte sector /
//! 4 KiB block geometry, the disk-exception record layout, the dm-user
//! control header and the legacy dm-snapshot on-disk header. All integers on
//! the wire are little-endian and are encoded/decoded explicitly; nothing is
//! overlaid on raw buffers.

use snapshim_error::{Result, SnapError};
use std::fmt;

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 512;
/// log2 of the sector size.
pub const SECTOR_SHIFT: u32 = 9;
/// Block size in bytes. One block is the unit of every data operation.
pub const BLOCK_SIZE: usize = 4096;
/// log2 of the block size.
pub const BLOCK_SHIFT: u32 = 12;
/// Chunk size in sectors. One chunk is one block.
pub const CHUNK_SIZE_SECTORS: u64 = (BLOCK_SIZE / SECTOR_SIZE) as u64;

/// Size of one disk-exception record on the wire.
pub const DISK_EXCEPTION_SIZE: usize = 16;
/// Number of exception records in one 4 KiB exception area.
pub const EXCEPTIONS_PER_AREA: usize =
    (CHUNK_SIZE_SECTORS as usize * SECTOR_SIZE) / DISK_EXCEPTION_SIZE;
/// Chunk-ID spacing between successive metadata chunks: one metadata chunk
/// followed by `EXCEPTIONS_PER_AREA` data chunks.
pub const AREA_STRIDE: u64 = EXCEPTIONS_PER_AREA as u64 + 1;
/// Chunk 0 holds the legacy on-disk header; metadata chunks start right after.
pub const NUM_SNAPSHOT_HDR_CHUNKS: u64 = 1;

/// Maximum payload bytes staged per response cycle. Larger kernel reads are
/// fragmented into cycles of this size against the same header.
pub const PAYLOAD_SIZE: usize = 1 << 16;

/// Legacy dm-snapshot header magic ("SnAp").
pub const SNAP_MAGIC: u32 = 0x7041_6e53;
/// Legacy dm-snapshot header `valid` flag.
pub const SNAPSHOT_VALID: u32 = 1;
/// Legacy dm-snapshot on-disk format version.
pub const SNAPSHOT_DISK_VERSION: u32 = 1;

/// dm-user request: map a read.
pub const DM_USER_REQ_MAP_READ: u64 = 0;
/// dm-user request: map a write.
pub const DM_USER_REQ_MAP_WRITE: u64 = 1;
/// dm-user response: success.
pub const DM_USER_RESP_SUCCESS: u64 = 0;
/// dm-user response: error.
pub const DM_USER_RESP_ERROR: u64 = 1;

/// Size of the dm-user control header on the wire.
pub const DM_USER_HEADER_SIZE: usize = 40;

/// Kernel-addressable 4 KiB unit of the snapshot device.
///
/// Within each [`AREA_STRIDE`] window the first chunk is a metadata chunk
/// (one exception area); the remaining 256 are data chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Chunk(pub u64);

impl Chunk {
    /// Convert a 512-byte sector number to its chunk ID (truncating).
    #[must_use]
    pub fn from_sector(sector: u64) -> Self {
        Self(sector / CHUNK_SIZE_SECTORS)
    }

    /// First sector of this chunk.
    #[must_use]
    pub fn to_sector(self) -> u64 {
        self.0 * CHUNK_SIZE_SECTORS
    }

    /// Whether this chunk ID addresses an exception area.
    #[must_use]
    pub fn is_metadata(self) -> bool {
        self.0 % AREA_STRIDE == NUM_SNAPSHOT_HDR_CHUNKS
    }

    /// Index of the exception area this metadata chunk maps to.
    #[must_use]
    pub fn area_index(self) -> u64 {
        self.0 / AREA_STRIDE
    }

    /// The next chunk ID usable for a data operation, skipping metadata
    /// chunks.
    #[must_use]
    pub fn next_allocatable(self) -> Self {
        let next = Self(self.0 + 1);
        if next.is_metadata() {
            Self(next.0 + 1)
        } else {
            next
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One disk-exception record: `old_chunk` is the base-device block the
/// exception covers, `new_chunk` the chunk ID the daemon assigned. An
/// all-zero record terminates kernel scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskException {
    pub old_chunk: u64,
    pub new_chunk: u64,
}

impl DiskException {
    /// Whether both fields are zero (absent/terminator record).
    #[must_use]
    pub fn is_zero(self) -> bool {
        self.old_chunk == 0 && self.new_chunk == 0
    }

    /// Decode a record from `buf` at `offset`.
    pub fn decode(buf: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            old_chunk: read_le_u64(buf, offset)?,
            new_chunk: read_le_u64(buf, offset + 8)?,
        })
    }

    /// Encode this record into `buf` at `offset`.
    pub fn encode(self, buf: &mut [u8], offset: usize) -> Result<()> {
        let dst = ensure_slice_mut(buf, offset, DISK_EXCEPTION_SIZE)?;
        dst[0..8].copy_from_slice(&self.old_chunk.to_le_bytes());
        dst[8..16].copy_from_slice(&self.new_chunk.to_le_bytes());
        Ok(())
    }
}

/// The fixed dm-user control header exchanged before every payload.
///
/// `kind` is the request type on the way in and is overwritten with the
/// response code on the way out; `sector` is in 512-byte units and `len` in
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmUserHeader {
    pub seq: u64,
    pub kind: u64,
    pub flags: u64,
    pub sector: u64,
    pub len: u64,
}

impl DmUserHeader {
    /// Decode a header from the first [`DM_USER_HEADER_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            seq: read_le_u64(buf, 0)?,
            kind: read_le_u64(buf, 8)?,
            flags: read_le_u64(buf, 16)?,
            sector: read_le_u64(buf, 24)?,
            len: read_le_u64(buf, 32)?,
        })
    }

    /// Encode this header into the first [`DM_USER_HEADER_SIZE`] bytes of
    /// `buf`.
    pub fn encode(self, buf: &mut [u8]) -> Result<()> {
        let dst = ensure_slice_mut(buf, 0, DM_USER_HEADER_SIZE)?;
        dst[0..8].copy_from_slice(&self.seq.to_le_bytes());
        dst[8..16].copy_from_slice(&self.kind.to_le_bytes());
        dst[16..24].copy_from_slice(&self.flags.to_le_bytes());
        dst[24..32].copy_from_slice(&self.sector.to_le_bytes());
        dst[32..40].copy_from_slice(&self.len.to_le_bytes());
        Ok(())
    }
}

/// The legacy dm-snapshot on-disk header served for sector-0 reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelCowHeader {
    pub magic: u32,
    pub valid: u32,
    pub version: u32,
    /// Chunk size in sectors.
    pub chunk_size: u32,
}

impl KernelCowHeader {
    /// The header image the kernel expects for a valid snapshot.
    #[must_use]
    pub fn current() -> Self {
        Self {
            magic: SNAP_MAGIC,
            valid: SNAPSHOT_VALID,
            version: SNAPSHOT_DISK_VERSION,
            chunk_size: CHUNK_SIZE_SECTORS as u32,
        }
    }

    /// Encode into the start of a block; the caller supplies a zeroed 4 KiB
    /// buffer so the remainder of the block reads as zero.
    pub fn encode(self, buf: &mut [u8]) -> Result<()> {
        let dst = ensure_slice_mut(buf, 0, 16)?;
        dst[0..4].copy_from_slice(&self.magic.to_le_bytes());
        dst[4..8].copy_from_slice(&self.valid.to_le_bytes());
        dst[8..12].copy_from_slice(&self.version.to_le_bytes());
        dst[12..16].copy_from_slice(&self.chunk_size.to_le_bytes());
        Ok(())
    }

    /// Decode from the start of a block.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(Self {
            magic: read_le_u32(buf, 0)?,
            valid: read_le_u32(buf, 4)?,
            version: read_le_u32(buf, 8)?,
            chunk_size: read_le_u32(buf, 12)?,
        })
    }
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| SnapError::Format("slice range overflow".to_owned()))?;
    if end > data.len() {
        return Err(SnapError::Format(format!(
            "insufficient data: need {len} bytes at offset {offset}, have {}",
            data.len()
        )));
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| SnapError::Format("slice range overflow".to_owned()))?;
    if end > data.len() {
        return Err(SnapError::Format(format!(
            "insufficient space: need {len} bytes at offset {offset}, have {}",
            data.len()
        )));
    }
    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}
