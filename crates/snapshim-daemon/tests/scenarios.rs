//! End-to-end request scenarios driven over a scripted control channel.

mod common;

use common::{
    parse_frame, read_request, record_at, write_request, zero_log, Harness, ScriptedControl,
};
use snapshim_block::{ByteDevice, MemByteDevice};
use snapshim_cow::{CowCodec, CowLogBuilder, CowLogReader, MergeCommitter};
use snapshim_daemon::SnapshotWorker;
use snapshim_types::{
    DiskException, DmUserHeader, BLOCK_SIZE, DM_USER_HEADER_SIZE, DM_USER_RESP_ERROR,
    DM_USER_RESP_SUCCESS, SNAPSHOT_DISK_VERSION, SNAPSHOT_VALID, SNAP_MAGIC,
};

#[test]
fn single_zero_op_read() {
    let log = zero_log(&[100]);
    let mut harness = Harness::new(log, MemByteDevice::new());

    // Chunks: 0 = header, 1 = metadata, 2 = the Zero op.
    assert_eq!(harness.worker.num_sectors(), 24);

    let frame = harness.roundtrip(read_request(1, 16, BLOCK_SIZE as u64));
    let (header, payload) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);
    assert_eq!(header.seq, 1);
    assert!(payload.iter().all(|b| *b == 0));
}

#[test]
fn metadata_area_read() {
    let log = zero_log(&[100]);
    let mut harness = Harness::new(log, MemByteDevice::new());

    let frame = harness.roundtrip(read_request(2, 8, BLOCK_SIZE as u64));
    let (header, payload) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);
    assert_eq!(
        record_at(&payload, 0),
        DiskException {
            old_chunk: 100,
            new_chunk: 2,
        }
    );
    assert!(payload[16..].iter().all(|b| *b == 0));
}

#[test]
fn kernel_header_read() {
    let log = zero_log(&[100]);
    let mut harness = Harness::new(log, MemByteDevice::new());

    let frame = harness.roundtrip(read_request(3, 0, BLOCK_SIZE as u64));
    let (header, payload) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);

    let magic = u32::from_le_bytes(payload[0..4].try_into().expect("magic"));
    let valid = u32::from_le_bytes(payload[4..8].try_into().expect("valid"));
    let version = u32::from_le_bytes(payload[8..12].try_into().expect("version"));
    let chunk_size = u32::from_le_bytes(payload[12..16].try_into().expect("chunk size"));
    assert_eq!(magic, SNAP_MAGIC);
    assert_eq!(valid, SNAPSHOT_VALID);
    assert_eq!(version, SNAPSHOT_DISK_VERSION);
    assert_eq!(chunk_size, 8);
    assert!(payload[16..].iter().all(|b| *b == 0));
}

#[test]
fn copy_ops_read_from_backing_device() {
    let log = MemByteDevice::new();
    let mut builder = CowLogBuilder::new(BLOCK_SIZE as u32);
    builder.add_copy(10, 3);
    builder.add_copy(11, 5);
    builder.finish(&log).expect("finish");

    let backing = MemByteDevice::new();
    backing
        .write_all_at(3 * BLOCK_SIZE as u64, &[0x33_u8; BLOCK_SIZE])
        .expect("fill block 3");
    backing
        .write_all_at(5 * BLOCK_SIZE as u64, &[0x55_u8; BLOCK_SIZE])
        .expect("fill block 5");

    let mut harness = Harness::new(log, backing);

    // Reverse build: Copy(11) lands at chunk 3, Copy(10) at chunk 5; every
    // copy-adjacent assignment leaves a one-chunk gap.
    let frame = harness.roundtrip(read_request(1, 8, BLOCK_SIZE as u64));
    let (_, payload) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(
        record_at(&payload, 0),
        DiskException {
            old_chunk: 11,
            new_chunk: 3,
        }
    );
    assert_eq!(
        record_at(&payload, 1),
        DiskException {
            old_chunk: 10,
            new_chunk: 5,
        }
    );

    let frame = harness.roundtrip(read_request(2, 24, BLOCK_SIZE as u64));
    let (header, payload) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);
    assert!(payload.iter().all(|b| *b == 0x55));

    let frame = harness.roundtrip(read_request(3, 40, BLOCK_SIZE as u64));
    let (header, payload) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);
    assert!(payload.iter().all(|b| *b == 0x33));
}

#[test]
fn replace_op_materialises_payload() {
    let log = MemByteDevice::new();
    let mut builder = CowLogBuilder::new(BLOCK_SIZE as u32);
    builder
        .add_replace(7, &[0xC7_u8; BLOCK_SIZE], CowCodec::Lz4)
        .expect("replace");
    builder.finish(&log).expect("finish");

    let mut harness = Harness::new(log, MemByteDevice::new());

    let frame = harness.roundtrip(read_request(1, 16, BLOCK_SIZE as u64));
    let (header, payload) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);
    assert!(payload.iter().all(|b| *b == 0xC7));
}

#[test]
fn metadata_prefetch_beyond_cache_reads_zero() {
    let log = zero_log(&[100]);
    let mut harness = Harness::new(log, MemByteDevice::new());

    // Chunk 258 = area index 1, one past the single real area.
    let frame = harness.roundtrip(read_request(1, 258 * 8, BLOCK_SIZE as u64));
    let (header, payload) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);
    assert!(payload.iter().all(|b| *b == 0));
}

#[test]
fn large_read_fragments_into_payload_cycles() {
    let log = MemByteDevice::new();
    let mut builder = CowLogBuilder::new(BLOCK_SIZE as u32);
    for i in 1..=32_u64 {
        builder
            .add_replace(1000 + i, &[i as u8; BLOCK_SIZE], CowCodec::None)
            .expect("replace");
    }
    builder.finish(&log).expect("finish");

    let mut harness = Harness::new(log, MemByteDevice::new());

    // 32 blocks starting at chunk 2 span two 64 KiB response cycles.
    let len = 32 * BLOCK_SIZE;
    let frames = harness.roundtrip(read_request(1, 16, len as u64));
    assert_eq!(frames.len(), 2 * (DM_USER_HEADER_SIZE + 16 * BLOCK_SIZE));

    let cycle_len = DM_USER_HEADER_SIZE + 16 * BLOCK_SIZE;
    for cycle in 0..2 {
        let frame = &frames[cycle * cycle_len..(cycle + 1) * cycle_len];
        let (header, payload) = parse_frame(frame, 16 * BLOCK_SIZE);
        assert_eq!(header.kind, DM_USER_RESP_SUCCESS);
        for block in 0..16 {
            // Reverse placement: chunk 2 + j holds the (32 - j)th op.
            let j = cycle * 16 + block;
            let expected = (32 - j) as u8;
            assert!(
                payload[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE]
                    .iter()
                    .all(|b| *b == expected),
                "block {j} mismatch"
            );
        }
    }
}

#[test]
fn merge_cycle_advances_and_commits() {
    // Forward order o1, o2, o3; reverse build places o3 first.
    let log = zero_log(&[100, 200, 300]);
    let mut harness = Harness::new(log.clone(), MemByteDevice::new());

    // Area 0 before merging: {300,2} {200,3} {100,4}.
    let frame = harness.roundtrip(read_request(1, 8, BLOCK_SIZE as u64));
    let (_, area) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(record_at(&area, 0).old_chunk, 300);
    assert_eq!(record_at(&area, 2).old_chunk, 100);

    // The kernel merges from the end: o1 and o2 done, o3 still pending.
    let mut merged = area.clone();
    merged[16..48].fill(0);
    let frame = harness.roundtrip(write_request(2, 8, &merged));
    let (header, _) = parse_frame(&frame, 0);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);
    assert!(!harness.worker.cursor_done());

    // The commit is durable: a fresh parse of the log sees two merges.
    let reparsed = CowLogReader::parse(log.clone()).expect("reparse");
    assert_eq!(reparsed.header().num_merge_ops, 2);

    // The cached area now has the merged records zeroed.
    let frame = harness.roundtrip(read_request(3, 8, BLOCK_SIZE as u64));
    let (_, area) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(record_at(&area, 0).old_chunk, 300);
    assert!(record_at(&area, 1).is_zero());
    assert!(record_at(&area, 2).is_zero());

    // Final cycle: everything merged.
    let frame = harness.roundtrip(write_request(4, 8, &vec![0_u8; BLOCK_SIZE]));
    let (header, _) = parse_frame(&frame, 0);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);
    assert!(harness.worker.cursor_done());

    let reparsed = CowLogReader::parse(log).expect("reparse");
    assert_eq!(reparsed.header().num_merge_ops, 3);
}

#[test]
fn flush_barrier_succeeds_without_payload() {
    let log = zero_log(&[100]);
    let mut harness = Harness::new(log.clone(), MemByteDevice::new());

    let frame = harness.roundtrip(write_request(1, 0, &[]));
    let (header, _) = parse_frame(&frame, 0);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);

    // No state change: the log still records zero merges.
    let reparsed = CowLogReader::parse(log).expect("reparse");
    assert_eq!(reparsed.header().num_merge_ops, 0);
}

#[test]
fn diverging_merge_area_reports_error_and_daemon_survives() {
    let log = zero_log(&[100, 200, 300]);
    let mut harness = Harness::new(log.clone(), MemByteDevice::new());

    // An unmerged record whose new_chunk does not match the cache.
    let mut merged = vec![0_u8; BLOCK_SIZE];
    DiskException {
        old_chunk: 300,
        new_chunk: 99,
    }
    .encode(&mut merged, 0)
    .expect("encode");

    let frame = harness.roundtrip(write_request(1, 8, &merged));
    let (header, _) = parse_frame(&frame, 0);
    assert_eq!(header.kind, DM_USER_RESP_ERROR);

    // Nothing was committed and the worker still serves reads.
    let reparsed = CowLogReader::parse(log).expect("reparse");
    assert_eq!(reparsed.header().num_merge_ops, 0);

    let frame = harness.roundtrip(read_request(2, 16, BLOCK_SIZE as u64));
    let (header, payload) = parse_frame(&frame, BLOCK_SIZE);
    assert_eq!(header.kind, DM_USER_RESP_SUCCESS);
    assert!(payload.iter().all(|b| *b == 0));
}

#[test]
fn truncated_merge_payload_reports_error() {
    let log = zero_log(&[100]);
    let mut harness = Harness::new(log, MemByteDevice::new());

    // Header promises a 4 KiB payload but the stream ends after half.
    let mut request = write_request(1, 8, &[0_u8; BLOCK_SIZE]);
    request.truncate(DM_USER_HEADER_SIZE + BLOCK_SIZE / 2);

    let frame = harness.roundtrip(request);
    let (header, _) = parse_frame(&frame, 0);
    assert_eq!(header.kind, DM_USER_RESP_ERROR);
}

#[test]
fn reads_are_idempotent() {
    let log = zero_log(&[100, 200, 300]);
    let mut harness = Harness::new(log, MemByteDevice::new());

    let first = harness.roundtrip(read_request(1, 8, BLOCK_SIZE as u64));
    let second = harness.roundtrip(read_request(1, 8, BLOCK_SIZE as u64));
    assert_eq!(first, second);

    let first = harness.roundtrip(read_request(2, 16, BLOCK_SIZE as u64));
    let second = harness.roundtrip(read_request(2, 16, BLOCK_SIZE as u64));
    assert_eq!(first, second);
}

#[test]
fn unknown_request_kind_reports_error() {
    let log = zero_log(&[100]);
    let mut harness = Harness::new(log, MemByteDevice::new());

    let mut buf = vec![0_u8; DM_USER_HEADER_SIZE];
    DmUserHeader {
        seq: 1,
        kind: 7,
        flags: 0,
        sector: 0,
        len: 0,
    }
    .encode(&mut buf)
    .expect("encode");

    let frame = harness.roundtrip(buf);
    let (header, _) = parse_frame(&frame, 0);
    assert_eq!(header.kind, DM_USER_RESP_ERROR);
}

#[test]
fn serve_stops_cleanly_at_end_of_stream() {
    let log = zero_log(&[100]);
    let control = ScriptedControl::default();
    control.push(read_request(1, 16, BLOCK_SIZE as u64));

    let reader = CowLogReader::parse(log.clone()).expect("parse");
    let committer = MergeCommitter::new(log, reader.header());
    let mut worker =
        SnapshotWorker::start(reader, committer, MemByteDevice::new(), control.clone())
            .expect("start");

    worker.serve().expect("serve");
    assert_eq!(
        control.output_len(),
        DM_USER_HEADER_SIZE + BLOCK_SIZE,
        "one response frame before the clean stop"
    );
}
