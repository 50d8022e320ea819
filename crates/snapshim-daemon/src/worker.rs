//! Per-device request worker.
//!
//! Strictly serial: read one control header, dispatch, write one response.
//! Request-level failures are reported to the kernel with an Error response
//! code and the loop continues; only transport failures (the control device
//! itself) end the worker. Conditions that can only mean the kernel and the
//! daemon disagree on the metadata format abort the process.

use crate::bufsink::PayloadBuffer;
use crate::metadata::{build_metadata, SnapshotMetadata, AREA_SIZE};
use snapshim_block::ByteDevice;
use snapshim_cow::{CowLogReader, CowOpKind, MergeCommitter};
use snapshim_error::{Result, SnapError};
use snapshim_types::{
    Chunk, DiskException, DmUserHeader, KernelCowHeader, BLOCK_SHIFT, BLOCK_SIZE,
    DISK_EXCEPTION_SIZE, DM_USER_REQ_MAP_READ, DM_USER_REQ_MAP_WRITE, DM_USER_RESP_ERROR,
    DM_USER_RESP_SUCCESS, EXCEPTIONS_PER_AREA, PAYLOAD_SIZE,
};
use std::io::{Read, Write};
use tracing::{debug, error, info};

/// Byte stream to and from the dm-user control device.
///
/// Production uses the opened `/dev/dm-user/<name>` file; tests script a
/// duplex buffer.
pub trait ControlChannel {
    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()>;
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;
}

impl<T: Read + Write> ControlChannel for T {
    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        Read::read_exact(self, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        Write::write_all(self, buf)
    }
}

/// The translation worker for one snapshot device.
pub struct SnapshotWorker<D, C> {
    reader: CowLogReader<D>,
    committer: MergeCommitter<D>,
    backing: D,
    control: C,
    bufsink: PayloadBuffer,
    metadata: SnapshotMetadata,
    /// Forward operation cursor, co-advancing with committed merges.
    /// Indexes the reader's unmerged window.
    cursor: usize,
}

impl<D: ByteDevice, C: ControlChannel> SnapshotWorker<D, C> {
    /// Build the metadata once and wire the worker up. Any parse or
    /// unknown-operation failure aborts startup; no requests are served on
    /// a partial cache.
    pub fn start(
        reader: CowLogReader<D>,
        committer: MergeCommitter<D>,
        backing: D,
        control: C,
    ) -> Result<Self> {
        let metadata = build_metadata(&reader)?;
        info!(
            target: "snapshim::daemon",
            num_merge_ops = reader.header().num_merge_ops,
            num_sectors = metadata.num_sectors,
            "worker_ready"
        );
        Ok(Self {
            reader,
            committer,
            backing,
            control,
            bufsink: PayloadBuffer::new(),
            metadata,
            cursor: 0,
        })
    }

    /// Sector count of the synthetic snapshot device.
    #[must_use]
    pub fn num_sectors(&self) -> u64 {
        self.metadata.num_sectors
    }

    /// Data operations the forward cursor has consumed.
    #[must_use]
    pub fn cursor_done(&self) -> bool {
        self.reader.ops()[self.cursor..]
            .iter()
            .all(|op| !op.kind.is_data())
    }

    /// Serve requests until the control device reaches end of stream.
    pub fn serve(&mut self) -> Result<()> {
        while self.serve_one()? {}
        Ok(())
    }

    /// Serve a single request cycle. Returns `false` on a clean end of
    /// stream before a header was read.
    pub fn serve_one(&mut self) -> Result<bool> {
        self.bufsink.clear();

        if let Err(err) = self.control.read_exact(self.bufsink.header_mut()) {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(false);
            }
            return Err(err.into());
        }
        let header = DmUserHeader::decode(self.bufsink.header())?;

        debug!(
            target: "snapshim::daemon",
            seq = header.seq,
            kind = header.kind,
            flags = header.flags,
            sector = header.sector,
            len = header.len,
            "request"
        );

        match header.kind {
            DM_USER_REQ_MAP_READ => self.map_read(header)?,
            DM_USER_REQ_MAP_WRITE => self.map_write(header)?,
            other => {
                error!(
                    target: "snapshim::daemon",
                    seq = header.seq,
                    kind = other,
                    "unsupported request kind"
                );
                let mut response = header;
                response.kind = DM_USER_RESP_ERROR;
                self.write_response(response, 0)?;
            }
        }

        Ok(true)
    }

    /// Map a kernel read, fragmenting into payload-sized response cycles
    /// against the same header.
    fn map_read(&mut self, header: DmUserHeader) -> Result<()> {
        let mut remaining = header.len as usize;
        let mut staged_total = 0_usize;

        loop {
            let read_size = remaining.min(PAYLOAD_SIZE);
            let mut response = header;
            response.kind = DM_USER_RESP_SUCCESS;

            let result = if header.sector == 0 {
                // The kernel representation of the COW header; a single
                // 4 KiB read issued once per device lifetime.
                assert_eq!(read_size, BLOCK_SIZE, "sector-0 read must be one block");
                self.construct_kernel_header()
            } else {
                let chunk = Chunk::from_sector(header.sector);
                if self.metadata.is_data_chunk(chunk) {
                    let chunks_done = (staged_total >> BLOCK_SHIFT) as u64;
                    self.read_data(Chunk(chunk.0 + chunks_done), read_size)
                } else {
                    self.read_disk_exceptions(chunk, read_size)
                }
            };

            if let Err(err) = result {
                error!(
                    target: "snapshim::daemon",
                    seq = header.seq,
                    sector = header.sector,
                    error = %err,
                    "read failed"
                );
                response.kind = DM_USER_RESP_ERROR;
            }

            // The error is carried in the response code; the payload bytes
            // are still written so the exchange stays framed.
            self.write_response(response, read_size)?;

            remaining -= read_size;
            staged_total += read_size;
            if remaining == 0 {
                break;
            }
        }

        Ok(())
    }

    /// Map a kernel write: a flush barrier at sector 0, otherwise a merged
    /// exception area written back by dm-snapshot.
    fn map_write(&mut self, header: DmUserHeader) -> Result<()> {
        if header.sector == 0 {
            // Zero-length flush bio routed through dm-user. There is no
            // writeback buffer here, so acknowledge and move on.
            assert_eq!(header.len, 0, "flush barrier carries a payload");
            let mut response = header;
            response.kind = DM_USER_RESP_SUCCESS;
            return self.write_response(response, 0);
        }

        let read_size = (header.len as usize).min(PAYLOAD_SIZE);
        assert_eq!(read_size, BLOCK_SIZE, "merge write must be one area");
        let chunk = Chunk::from_sector(header.sector);
        assert!(
            !self.metadata.is_data_chunk(chunk),
            "merge write targets a data chunk"
        );

        let mut response = header;
        response.kind = DM_USER_RESP_SUCCESS;

        let staged = self
            .bufsink
            .payload_mut(read_size)
            .expect("payload region exhausted");
        if let Err(err) = self.control.read_exact(staged) {
            error!(
                target: "snapshim::daemon",
                seq = header.seq,
                sector = header.sector,
                error = %err,
                "merge payload read failed"
            );
            response.kind = DM_USER_RESP_ERROR;
        } else {
            let merged = self
                .bufsink
                .payload(read_size)
                .expect("payload region exhausted")
                .to_vec();
            if let Err(err) = self.process_merge(chunk, &merged) {
                error!(
                    target: "snapshim::daemon",
                    seq = header.seq,
                    sector = header.sector,
                    error = %err,
                    "merge failed"
                );
                response.kind = DM_USER_RESP_ERROR;
            }
        }

        self.write_response(response, 0)
    }

    /// Stage the legacy dm-snapshot on-disk header into one zeroed block.
    fn construct_kernel_header(&mut self) -> Result<()> {
        let buf = self
            .bufsink
            .payload_mut(BLOCK_SIZE)
            .expect("payload region exhausted");
        buf.fill(0);
        KernelCowHeader::current().encode(buf)?;
        Ok(())
    }

    /// Serve a metadata read: the cached exception area, or zeros past the
    /// end of the cache. dm-snap prefetches 12 areas ahead by default and
    /// halts its scan on zero content.
    fn read_disk_exceptions(&mut self, chunk: Chunk, read_size: usize) -> Result<()> {
        if read_size > AREA_SIZE {
            return Err(SnapError::RequestTooLarge {
                requested: read_size,
            });
        }

        let buf = self
            .bufsink
            .payload_mut(AREA_SIZE)
            .expect("payload region exhausted");
        let area_idx = chunk.area_index() as usize;
        if let Some(area) = self.metadata.areas.get(area_idx) {
            buf.copy_from_slice(area.bytes());
        } else {
            buf.fill(0);
        }
        Ok(())
    }

    /// Serve a data read: replay one operation per 4 KiB chunk into the
    /// payload buffer.
    fn read_data(&mut self, start: Chunk, size: usize) -> Result<()> {
        assert_eq!(size & (BLOCK_SIZE - 1), 0, "unaligned data read");

        let mut remaining = size;
        let mut chunk = start;
        let mut result = Ok(());

        while remaining > 0 {
            let op_idx = *self
                .metadata
                .chunk_map
                .get(&chunk)
                .expect("data read outside the chunk map");
            let op = self.reader.ops()[op_idx];

            let buf = self
                .bufsink
                .payload_mut(BLOCK_SIZE)
                .expect("payload region exhausted");
            match op.kind {
                CowOpKind::Replace => {
                    result = self.reader.read_data(&op, buf);
                }
                CowOpKind::Zero => {
                    buf.fill(0);
                }
                CowOpKind::Copy => {
                    result = self
                        .backing
                        .read_exact_at(op.source << BLOCK_SHIFT, buf);
                }
                other => {
                    result = Err(SnapError::UnknownOp {
                        kind: other.to_raw(),
                    });
                }
            }
            if result.is_err() {
                break;
            }

            self.bufsink.advance(BLOCK_SIZE);
            remaining -= BLOCK_SIZE;
            chunk = Chunk(chunk.0 + 1);

            // Copy chunks are never assigned a contiguous successor, so a
            // copy always ends the request.
            if op.kind == CowOpKind::Copy {
                assert_eq!(remaining, 0, "copy chunk followed within one request");
            }
            // The kernel never spans a data/metadata boundary in one
            // request.
            if chunk.is_metadata() {
                assert_eq!(remaining, 0, "read spans a metadata boundary");
                break;
            }
        }

        self.bufsink.reset_offset();
        result
    }

    /// Fold a merged exception area written back by the kernel into the
    /// cache, the forward cursor and the durable log header.
    fn process_merge(&mut self, chunk: Chunk, merged: &[u8]) -> Result<()> {
        let area_idx = chunk.area_index() as usize;
        assert!(
            area_idx < self.metadata.areas.len(),
            "merge write beyond the exception cache"
        );
        debug!(
            target: "snapshim::daemon",
            chunk = chunk.0,
            area = area_idx,
            "merge_writeback"
        );

        let merged_in_cycle = {
            let area = &mut self.metadata.areas[area_idx];

            // Find where merging stopped: leading records the kernel left
            // intact must match the cache exactly.
            let mut unmerged = 0_usize;
            while unmerged < EXCEPTIONS_PER_AREA {
                let kernel = DiskException::decode(merged, unmerged * DISK_EXCEPTION_SIZE)?;
                if kernel.old_chunk == 0 {
                    if kernel.new_chunk != 0 {
                        return Err(SnapError::MergeState {
                            area: area_idx as u64,
                            detail: format!(
                                "record {unmerged} has a live new_chunk with a zeroed old_chunk"
                            ),
                        });
                    }
                    break;
                }
                if kernel != area.record(unmerged) {
                    return Err(SnapError::MergeState {
                        area: area_idx as u64,
                        detail: format!("unmerged record {unmerged} diverges from the cache"),
                    });
                }
                unmerged += 1;
            }
            assert!(
                unmerged < EXCEPTIONS_PER_AREA,
                "merge write with nothing merged"
            );

            // Count the operations merged in this cycle, zeroing their
            // cached records so later cycles do not recount them.
            let mut count = 0_usize;
            let mut idx = unmerged;
            while idx < EXCEPTIONS_PER_AREA {
                let kernel = DiskException::decode(merged, idx * DISK_EXCEPTION_SIZE)?;
                if !kernel.is_zero() {
                    return Err(SnapError::MergeState {
                        area: area_idx as u64,
                        detail: format!("record {idx} still live past the merge boundary"),
                    });
                }

                let cached = area.record(idx);
                if cached.new_chunk != 0 {
                    area.zero_record(idx);
                    count += 1;
                    idx += 1;
                } else if cached.old_chunk == 0 {
                    // Merged in a prior cycle, or the zero tail of a
                    // partially filled area.
                    break;
                } else {
                    return Err(SnapError::MergeState {
                        area: area_idx as u64,
                        detail: format!("record {idx} has a live old_chunk with no new_chunk"),
                    });
                }
            }
            count
        };
        assert!(merged_in_cycle > 0, "merge cycle merged zero operations");

        self.advance_cursor(merged_in_cycle)?;

        // Durable commit before the success response: crash recovery must
        // never count a merge the log did not record.
        self.reader.update_merge_progress(merged_in_cycle as u64);
        self.committer.commit(merged_in_cycle as u64)?;

        debug!(
            target: "snapshim::daemon",
            area = area_idx,
            merged = merged_in_cycle,
            total = self.committer.num_merge_ops(),
            "merge_cycle_complete"
        );
        Ok(())
    }

    /// Advance the forward operation cursor past `count` data operations,
    /// skipping Label and Footer records transparently.
    fn advance_cursor(&mut self, count: usize) -> Result<()> {
        let ops = self.reader.ops();
        let mut outstanding = count;
        while outstanding > 0 {
            assert!(
                self.cursor < ops.len(),
                "forward cursor exhausted with merges outstanding"
            );
            let op = &ops[self.cursor];
            match op.kind {
                CowOpKind::Label | CowOpKind::Footer => {}
                CowOpKind::Replace | CowOpKind::Copy | CowOpKind::Zero => {
                    outstanding -= 1;
                }
                CowOpKind::Unknown(kind) => {
                    return Err(SnapError::UnknownOp { kind });
                }
            }
            self.cursor += 1;
        }
        Ok(())
    }

    /// Encode the response header and write header plus `payload_len`
    /// staged bytes back to the control device. A failure here is fatal to
    /// the worker.
    fn write_response(&mut self, header: DmUserHeader, payload_len: usize) -> Result<()> {
        header.encode(self.bufsink.header_mut())?;
        self.control.write_all(self.bufsink.frame(payload_len))?;
        Ok(())
    }
}
