//! One-shot construction of the kernel-facing snapshot metadata.
//!
//! The internal log is traversed in reverse and each data operation is
//! assigned a monotonically increasing kernel chunk ID. The kernel merges
//! from the end of the last metadata area backwards, so reverse placement
//! puts the log's earliest operation at the kernel's first-merged position.
//! Chunk IDs skip every metadata chunk, and additionally skip one extra ID
//! whenever the current or the previous operation is a Copy: the kernel
//! merges contiguous chunk IDs atomically, which would break
//! copy-before-overwrite ordering on a crash mid-merge of dependent copies.

use snapshim_block::ByteDevice;
use snapshim_cow::{CowLogReader, CowOpKind};
use snapshim_error::{Result, SnapError};
use snapshim_types::{
    Chunk, DiskException, CHUNK_SIZE_SECTORS, DISK_EXCEPTION_SIZE, EXCEPTIONS_PER_AREA,
    NUM_SNAPSHOT_HDR_CHUNKS,
};
use std::collections::HashMap;
use tracing::{debug, info};

/// Size of one exception area in bytes.
pub const AREA_SIZE: usize = EXCEPTIONS_PER_AREA * DISK_EXCEPTION_SIZE;

/// One cached 4 KiB metadata page of 256 disk-exception records.
///
/// Zero-initialised; unused trailing records stay zero, which is what stops
/// the kernel's scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionArea {
    bytes: Box<[u8]>,
}

impl Default for ExceptionArea {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl ExceptionArea {
    #[must_use]
    pub fn new_zeroed() -> Self {
        Self {
            bytes: vec![0_u8; AREA_SIZE].into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Decode the record at `idx`.
    #[must_use]
    pub fn record(&self, idx: usize) -> DiskException {
        assert!(idx < EXCEPTIONS_PER_AREA, "record index out of area");
        DiskException::decode(&self.bytes, idx * DISK_EXCEPTION_SIZE)
            .expect("area buffer holds a full record")
    }

    /// Encode `record` at `idx`.
    pub fn set_record(&mut self, idx: usize, record: DiskException) {
        assert!(idx < EXCEPTIONS_PER_AREA, "record index out of area");
        record
            .encode(&mut self.bytes, idx * DISK_EXCEPTION_SIZE)
            .expect("area buffer holds a full record");
    }

    /// Zero the record at `idx`, marking its operation merged.
    pub fn zero_record(&mut self, idx: usize) {
        self.set_record(idx, DiskException::default());
    }
}

/// The metadata produced by the one-shot build: the exception area cache,
/// the data-chunk to operation lookup, and the synthetic device size.
///
/// `chunk_map` values are indices into the reader's unmerged operation
/// window; the reader owns the operations for the daemon's lifetime.
#[derive(Debug)]
pub struct SnapshotMetadata {
    pub areas: Vec<ExceptionArea>,
    pub chunk_map: HashMap<Chunk, usize>,
    pub num_sectors: u64,
}

impl SnapshotMetadata {
    /// Whether `chunk` was assigned to a data operation.
    #[must_use]
    pub fn is_data_chunk(&self, chunk: Chunk) -> bool {
        self.chunk_map.contains_key(&chunk)
    }
}

/// Assign chunk IDs to the log's operations and build the exception areas.
///
/// Fails on a block-size mismatch or on any operation kind the translation
/// does not know; no partial cache is surfaced.
pub fn build_metadata<D: ByteDevice>(reader: &CowLogReader<D>) -> Result<SnapshotMetadata> {
    let block_size = reader.header().block_size;
    if block_size as usize != snapshim_types::BLOCK_SIZE {
        return Err(SnapError::Format(format!(
            "log block size is {block_size}, expected {}",
            snapshim_types::BLOCK_SIZE
        )));
    }

    let mut areas = Vec::new();
    let mut chunk_map = HashMap::new();
    let mut area = ExceptionArea::new_zeroed();
    let mut slot = 0_usize;

    // Chunk 0 is the kernel header and chunk 1 the first metadata page;
    // data chunks start at 2.
    let mut next_free = Chunk(NUM_SNAPSHOT_HDR_CHUNKS + 1);
    let mut prev_copy = false;

    let ops = reader.ops();
    for (op_idx, op) in ops.iter().enumerate().rev() {
        match op.kind {
            CowOpKind::Footer | CowOpKind::Label => continue,
            CowOpKind::Replace | CowOpKind::Copy | CowOpKind::Zero => {}
            CowOpKind::Unknown(kind) => return Err(SnapError::UnknownOp { kind }),
        }

        let is_copy = op.kind == CowOpKind::Copy;
        if is_copy || prev_copy {
            next_free = next_free.next_allocatable();
        }
        prev_copy = is_copy;

        area.set_record(
            slot,
            DiskException {
                old_chunk: op.new_block,
                new_chunk: next_free.0,
            },
        );
        chunk_map.insert(next_free, op_idx);
        debug!(
            target: "snapshim::daemon",
            old_chunk = op.new_block,
            new_chunk = next_free.0,
            "exception_assigned"
        );

        slot += 1;
        if slot == EXCEPTIONS_PER_AREA {
            areas.push(std::mem::take(&mut area));
            slot = 0;
        }

        next_free = next_free.next_allocatable();
    }

    // Push the trailing area: partially filled, or all-zero when the last
    // operation landed exactly on an area boundary or the log has no data
    // operations at all. Either way the kernel's scan finds a zero
    // terminator.
    areas.push(area);

    let num_sectors = next_free.0 * CHUNK_SIZE_SECTORS;
    info!(
        target: "snapshim::daemon",
        areas = areas.len(),
        data_chunks = chunk_map.len(),
        num_sectors,
        "metadata_built"
    );

    Ok(SnapshotMetadata {
        areas,
        chunk_map,
        num_sectors,
    })
}
