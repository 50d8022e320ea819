#![forbid(unsafe_code)]
//! The internal copy-on-write log.
//!
//! This is the log an update engine writes while applying an update and the
//! translation daemon consumes to synthesise the legacy kernel snapshot
//! format. The crate provides three pieces:
//!
//! 1. [`CowLogReader`] — parses a log, exposes the header and the *unmerged*
//!    operation window (forward and reverse, in physical write order), and
//!    materialises Replace payloads.
//! 2. [`MergeCommitter`] — durably commits merge progress back into the log
//!    header. The post-commit sync is the crash-recovery point.
//! 3. [`CowLogBuilder`] — writes a complete log; used by tooling and tests.
//!
//! On-disk layout (all little-endian): a 64-byte header, a table of fixed
//! 32-byte operation records terminated by a Footer record, then a packed
//! region of Replace payloads.

use snapshim_block::ByteDevice;
use snapshim_error::{Result, SnapError};
use snapshim_types::{read_le_u16, read_le_u32, read_le_u64};
use tracing::debug;

const COW_MAGIC: u32 = 0x4C57_4F43; // "COWL" in little-endian payload.
const COW_VERSION: u16 = 1;

/// Size of the fixed log header.
pub const COW_HEADER_SIZE: usize = 64;
/// Size of one operation record.
pub const COW_OP_SIZE: usize = 32;

/// Byte offset of `num_merge_ops` within the header; the only field
/// rewritten after the log is sealed.
const NUM_MERGE_OPS_OFFSET: u64 = 24;

const KIND_REPLACE: u16 = 1;
const KIND_COPY: u16 = 2;
const KIND_ZERO: u16 = 3;
const KIND_LABEL: u16 = 4;
const KIND_FOOTER: u16 = 5;

/// Payload codec for Replace operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CowCodec {
    #[default]
    None,
    Lz4,
}

impl CowCodec {
    fn from_raw(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            other => Err(SnapError::Format(format!(
                "unknown payload codec: {other}"
            ))),
        }
    }

    fn to_raw(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
        }
    }
}

/// Kind of a log operation.
///
/// Values the current format does not define are preserved as `Unknown` so
/// the consumer decides whether they are fatal; the reader itself stays
/// forward-compatible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowOpKind {
    Replace,
    Copy,
    Zero,
    Label,
    Footer,
    Unknown(u16),
}

impl CowOpKind {
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            KIND_REPLACE => Self::Replace,
            KIND_COPY => Self::Copy,
            KIND_ZERO => Self::Zero,
            KIND_LABEL => Self::Label,
            KIND_FOOTER => Self::Footer,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u16 {
        match self {
            Self::Replace => KIND_REPLACE,
            Self::Copy => KIND_COPY,
            Self::Zero => KIND_ZERO,
            Self::Label => KIND_LABEL,
            Self::Footer => KIND_FOOTER,
            Self::Unknown(raw) => raw,
        }
    }

    /// Whether this is a data operation (Replace, Copy or Zero).
    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(self, Self::Replace | Self::Copy | Self::Zero)
    }
}

/// One log operation record.
///
/// `new_block` is the destination block in the base device. For Replace,
/// `source` is the absolute byte offset of the stored payload, `data_len`
/// its stored length and `checksum` the crc32c of the stored bytes. For
/// Copy, `source` is the source block in the backing device. For Label,
/// `source` carries the label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowOperation {
    pub kind: CowOpKind,
    pub codec: CowCodec,
    pub data_len: u32,
    pub new_block: u64,
    pub source: u64,
    pub checksum: u32,
}

impl CowOperation {
    fn decode(buf: &[u8], offset: usize) -> Result<Self> {
        Ok(Self {
            kind: CowOpKind::from_raw(read_le_u16(buf, offset)?),
            codec: CowCodec::from_raw(read_le_u16(buf, offset + 2)?)?,
            data_len: read_le_u32(buf, offset + 4)?,
            new_block: read_le_u64(buf, offset + 8)?,
            source: read_le_u64(buf, offset + 16)?,
            checksum: read_le_u32(buf, offset + 24)?,
        })
    }

    fn encode(self, buf: &mut [u8], offset: usize) {
        buf[offset..offset + 2].copy_from_slice(&self.kind.to_raw().to_le_bytes());
        buf[offset + 2..offset + 4].copy_from_slice(&self.codec.to_raw().to_le_bytes());
        buf[offset + 4..offset + 8].copy_from_slice(&self.data_len.to_le_bytes());
        buf[offset + 8..offset + 16].copy_from_slice(&self.new_block.to_le_bytes());
        buf[offset + 16..offset + 24].copy_from_slice(&self.source.to_le_bytes());
        buf[offset + 24..offset + 28].copy_from_slice(&self.checksum.to_le_bytes());
        buf[offset + 28..offset + 32].copy_from_slice(&0_u32.to_le_bytes());
    }
}

/// Parsed log header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowHeader {
    pub block_size: u32,
    /// Total operation records in the table, Footer included.
    pub num_ops: u64,
    /// Cumulative data operations already merged back into the base device.
    pub num_merge_ops: u64,
}

/// Log reader: header access, unmerged-window iteration and Replace payload
/// materialisation.
#[derive(Debug)]
pub struct CowLogReader<D> {
    device: D,
    header: CowHeader,
    ops: Vec<CowOperation>,
    /// Index of the first unmerged record; `num_merge_ops` data operations
    /// (and any interleaved Label records before them) lie below it.
    start: usize,
}

impl<D: ByteDevice> CowLogReader<D> {
    /// Parse a log from `device`.
    ///
    /// Restart behaviour is fixed here: the first `num_merge_ops` data
    /// operations in physical order are already merged and are excluded
    /// from the exposed window, so a rebuilt chunk schedule assigns the
    /// surviving operations the same IDs they had before the restart.
    pub fn parse(device: D) -> Result<Self> {
        let mut raw = [0_u8; COW_HEADER_SIZE];
        device.read_exact_at(0, &mut raw)?;

        let magic = read_le_u32(&raw, 0)?;
        if magic != COW_MAGIC {
            return Err(SnapError::Format(format!(
                "bad log magic: expected {COW_MAGIC:#010x}, got {magic:#010x}"
            )));
        }
        let version = read_le_u16(&raw, 4)?;
        if version != COW_VERSION {
            return Err(SnapError::Format(format!(
                "unsupported log version: {version}"
            )));
        }
        let op_size = read_le_u16(&raw, 6)?;
        if usize::from(op_size) != COW_OP_SIZE {
            return Err(SnapError::Format(format!(
                "unsupported op record size: {op_size}"
            )));
        }

        let header = CowHeader {
            block_size: read_le_u32(&raw, 8)?,
            num_ops: read_le_u64(&raw, 16)?,
            num_merge_ops: read_le_u64(&raw, NUM_MERGE_OPS_OFFSET as usize)?,
        };
        let ops_offset = read_le_u64(&raw, 32)?;

        let num_ops = usize::try_from(header.num_ops)
            .map_err(|_| SnapError::Format("op count does not fit usize".to_owned()))?;
        let table_len = num_ops
            .checked_mul(COW_OP_SIZE)
            .ok_or_else(|| SnapError::Format("op table length overflow".to_owned()))?;
        let mut table = vec![0_u8; table_len];
        device.read_exact_at(ops_offset, &mut table)?;

        let mut ops = Vec::with_capacity(num_ops);
        for idx in 0..num_ops {
            ops.push(CowOperation::decode(&table, idx * COW_OP_SIZE)?);
        }

        let start = merged_window_start(&ops, header.num_merge_ops)?;

        debug!(
            target: "snapshim::cow",
            num_ops = header.num_ops,
            num_merge_ops = header.num_merge_ops,
            block_size = header.block_size,
            "log_parsed"
        );

        Ok(Self {
            device,
            header,
            ops,
            start,
        })
    }

    #[must_use]
    pub fn header(&self) -> &CowHeader {
        &self.header
    }

    /// The unmerged operation window, in physical write order.
    #[must_use]
    pub fn ops(&self) -> &[CowOperation] {
        &self.ops[self.start..]
    }

    /// Forward iterator over the unmerged window.
    pub fn iter_forward(&self) -> impl Iterator<Item = &CowOperation> {
        self.ops().iter()
    }

    /// Reverse iterator over the unmerged window (physical write order
    /// reversed).
    pub fn iter_reverse(&self) -> impl Iterator<Item = &CowOperation> {
        self.ops().iter().rev()
    }

    /// Materialise a Replace payload into `buf`, verifying the checksum and
    /// decompressing as needed. `buf` must be exactly one block; a payload
    /// that materialises to any other length is rejected.
    pub fn read_data(&self, op: &CowOperation, buf: &mut [u8]) -> Result<()> {
        if op.kind != CowOpKind::Replace {
            return Err(SnapError::Format(format!(
                "read_data on non-replace operation (kind {})",
                op.kind.to_raw()
            )));
        }
        if buf.len() != self.header.block_size as usize {
            return Err(SnapError::Format(format!(
                "read_data buffer is {} bytes, block size is {}",
                buf.len(),
                self.header.block_size
            )));
        }

        let stored_len = usize::try_from(op.data_len)
            .map_err(|_| SnapError::Format("payload length does not fit usize".to_owned()))?;
        let mut stored = vec![0_u8; stored_len];
        self.device.read_exact_at(op.source, &mut stored)?;

        let computed = crc32c::crc32c(&stored);
        if computed != op.checksum {
            return Err(SnapError::Corruption {
                chunk: op.new_block,
                detail: format!(
                    "payload crc mismatch: expected {:#010x}, got {computed:#010x}",
                    op.checksum
                ),
            });
        }

        match op.codec {
            CowCodec::None => {
                if stored.len() != buf.len() {
                    return Err(SnapError::Corruption {
                        chunk: op.new_block,
                        detail: format!(
                            "payload is {} bytes, expected {}",
                            stored.len(),
                            buf.len()
                        ),
                    });
                }
                buf.copy_from_slice(&stored);
            }
            CowCodec::Lz4 => {
                let written = lz4_flex::block::decompress_into(&stored, buf).map_err(|err| {
                    SnapError::Corruption {
                        chunk: op.new_block,
                        detail: format!("lz4 decompress failed: {err}"),
                    }
                })?;
                if written != buf.len() {
                    return Err(SnapError::Corruption {
                        chunk: op.new_block,
                        detail: format!("payload decompressed to {written} bytes, expected {}", buf.len()),
                    });
                }
            }
        }

        Ok(())
    }

    /// Record merge progress in the in-memory header. Durability is the
    /// committer's job.
    pub fn update_merge_progress(&mut self, count: u64) {
        self.header.num_merge_ops += count;
    }
}

fn merged_window_start(ops: &[CowOperation], num_merge_ops: u64) -> Result<usize> {
    let mut start = 0_usize;
    let mut remaining = num_merge_ops;
    while remaining > 0 {
        match ops.get(start) {
            Some(op) => {
                if op.kind.is_data() {
                    remaining -= 1;
                }
                start += 1;
            }
            None => {
                return Err(SnapError::Format(format!(
                    "num_merge_ops ({num_merge_ops}) exceeds data operations in the log"
                )));
            }
        }
    }
    Ok(start)
}

/// Durable merge-progress committer, bound to the same log device as the
/// reader and seeded from its parsed header.
#[derive(Debug)]
pub struct MergeCommitter<D> {
    device: D,
    num_merge_ops: u64,
}

impl<D: ByteDevice> MergeCommitter<D> {
    pub fn new(device: D, header: &CowHeader) -> Self {
        Self {
            device,
            num_merge_ops: header.num_merge_ops,
        }
    }

    /// Add `count` to the cumulative merge total and sync it to the log.
    /// Returns the new total. Once this returns, a restart will re-skip the
    /// committed operations.
    pub fn commit(&mut self, count: u64) -> Result<u64> {
        let total = self.num_merge_ops + count;
        self.device
            .write_all_at(NUM_MERGE_OPS_OFFSET, &total.to_le_bytes())?;
        self.device.sync()?;
        self.num_merge_ops = total;
        debug!(
            target: "snapshim::cow",
            merged = count,
            total,
            "merge_committed"
        );
        Ok(total)
    }

    #[must_use]
    pub fn num_merge_ops(&self) -> u64 {
        self.num_merge_ops
    }
}

struct PendingOp {
    kind: CowOpKind,
    codec: CowCodec,
    data_len: u32,
    new_block: u64,
    /// For Replace: offset of the payload relative to the data region.
    source: u64,
    checksum: u32,
}

/// Builds a complete log in memory and writes it out in one pass.
pub struct CowLogBuilder {
    block_size: u32,
    ops: Vec<PendingOp>,
    data: Vec<u8>,
}

impl CowLogBuilder {
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            ops: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Append a Replace operation. `payload` must be exactly one block.
    pub fn add_replace(&mut self, new_block: u64, payload: &[u8], codec: CowCodec) -> Result<()> {
        if payload.len() != self.block_size as usize {
            return Err(SnapError::Format(format!(
                "replace payload is {} bytes, block size is {}",
                payload.len(),
                self.block_size
            )));
        }

        let stored = match codec {
            CowCodec::None => payload.to_vec(),
            CowCodec::Lz4 => lz4_flex::block::compress(payload),
        };
        let data_len = u32::try_from(stored.len())
            .map_err(|_| SnapError::Format("stored payload does not fit u32".to_owned()))?;
        let rel_offset = self.data.len() as u64;
        let checksum = crc32c::crc32c(&stored);
        self.data.extend_from_slice(&stored);

        self.ops.push(PendingOp {
            kind: CowOpKind::Replace,
            codec,
            data_len,
            new_block,
            source: rel_offset,
            checksum,
        });
        Ok(())
    }

    /// Append a Copy operation reading `source_block` from the backing
    /// device.
    pub fn add_copy(&mut self, new_block: u64, source_block: u64) {
        self.ops.push(PendingOp {
            kind: CowOpKind::Copy,
            codec: CowCodec::None,
            data_len: 0,
            new_block,
            source: source_block,
            checksum: 0,
        });
    }

    /// Append a Zero operation.
    pub fn add_zero(&mut self, new_block: u64) {
        self.ops.push(PendingOp {
            kind: CowOpKind::Zero,
            codec: CowCodec::None,
            data_len: 0,
            new_block,
            source: 0,
            checksum: 0,
        });
    }

    /// Append a Label marker.
    pub fn add_label(&mut self, label: u64) {
        self.ops.push(PendingOp {
            kind: CowOpKind::Label,
            codec: CowCodec::None,
            data_len: 0,
            new_block: 0,
            source: label,
            checksum: 0,
        });
    }

    /// Seal the log with a Footer record and write header, op table and
    /// payload region to `device`.
    pub fn finish<D: ByteDevice>(mut self, device: &D) -> Result<()> {
        self.ops.push(PendingOp {
            kind: CowOpKind::Footer,
            codec: CowCodec::None,
            data_len: 0,
            new_block: 0,
            source: 0,
            checksum: 0,
        });

        let num_ops = self.ops.len() as u64;
        let data_offset = COW_HEADER_SIZE as u64 + num_ops * COW_OP_SIZE as u64;

        let mut header = [0_u8; COW_HEADER_SIZE];
        header[0..4].copy_from_slice(&COW_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&COW_VERSION.to_le_bytes());
        header[6..8].copy_from_slice(&(COW_OP_SIZE as u16).to_le_bytes());
        header[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        header[16..24].copy_from_slice(&num_ops.to_le_bytes());
        // num_merge_ops starts at zero.
        header[32..40].copy_from_slice(&(COW_HEADER_SIZE as u64).to_le_bytes());

        let mut table = vec![0_u8; self.ops.len() * COW_OP_SIZE];
        for (idx, op) in self.ops.iter().enumerate() {
            let source = if op.kind == CowOpKind::Replace {
                data_offset + op.source
            } else {
                op.source
            };
            CowOperation {
                kind: op.kind,
                codec: op.codec,
                data_len: op.data_len,
                new_block: op.new_block,
                source,
                checksum: op.checksum,
            }
            .encode(&mut table, idx * COW_OP_SIZE);
        }

        device.write_all_at(0, &header)?;
        device.write_all_at(COW_HEADER_SIZE as u64, &table)?;
        if !self.data.is_empty() {
            device.write_all_at(data_offset, &self.data)?;
        }
        device.sync()?;
        Ok(())
    }
}
