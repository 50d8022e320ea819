//! Shared harness for the integration suites: a scripted duplex control
//! channel and request/response framing helpers.
#![allow(dead_code)]

use parking_lot::Mutex;
use snapshim_block::MemByteDevice;
use snapshim_cow::{CowLogBuilder, CowLogReader, MergeCommitter};
use snapshim_daemon::SnapshotWorker;
use snapshim_types::{
    DiskException, DmUserHeader, BLOCK_SIZE, DM_USER_HEADER_SIZE, DM_USER_REQ_MAP_READ,
    DM_USER_REQ_MAP_WRITE,
};
use std::io::{Read, Write};
use std::sync::Arc;

/// Duplex control-channel double: requests are appended to the input side,
/// responses accumulate on the output side. Clones share state so tests can
/// inspect output while the worker owns a handle.
#[derive(Clone, Default)]
pub struct ScriptedControl {
    inner: Arc<Mutex<Script>>,
}

#[derive(Default)]
struct Script {
    input: Vec<u8>,
    pos: usize,
    output: Vec<u8>,
}

impl ScriptedControl {
    pub fn push(&self, bytes: Vec<u8>) {
        self.inner.lock().input.extend_from_slice(&bytes);
    }

    pub fn output_len(&self) -> usize {
        self.inner.lock().output.len()
    }

    pub fn output_from(&self, start: usize) -> Vec<u8> {
        self.inner.lock().output[start..].to_vec()
    }
}

impl Read for ScriptedControl {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut script = self.inner.lock();
        let available = script.input.len() - script.pos;
        let n = available.min(buf.len());
        let start = script.pos;
        buf[..n].copy_from_slice(&script.input[start..start + n]);
        script.pos += n;
        Ok(n)
    }
}

impl Write for ScriptedControl {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.lock().output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct Harness {
    pub worker: SnapshotWorker<MemByteDevice, ScriptedControl>,
    pub control: ScriptedControl,
    consumed: usize,
}

impl Harness {
    pub fn new(log: MemByteDevice, backing: MemByteDevice) -> Self {
        let reader = CowLogReader::parse(log.clone()).expect("parse log");
        let committer = MergeCommitter::new(log, reader.header());
        let control = ScriptedControl::default();
        let worker = SnapshotWorker::start(reader, committer, backing, control.clone())
            .expect("start worker");
        Self {
            worker,
            control,
            consumed: 0,
        }
    }

    /// Feed one request and return the raw response bytes it produced.
    pub fn roundtrip(&mut self, request: Vec<u8>) -> Vec<u8> {
        self.control.push(request);
        assert!(self.worker.serve_one().expect("serve_one"));
        let frame = self.control.output_from(self.consumed);
        self.consumed = self.control.output_len();
        frame
    }
}

pub fn read_request(seq: u64, sector: u64, len: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; DM_USER_HEADER_SIZE];
    DmUserHeader {
        seq,
        kind: DM_USER_REQ_MAP_READ,
        flags: 0,
        sector,
        len,
    }
    .encode(&mut buf)
    .expect("encode");
    buf
}

pub fn write_request(seq: u64, sector: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0_u8; DM_USER_HEADER_SIZE];
    DmUserHeader {
        seq,
        kind: DM_USER_REQ_MAP_WRITE,
        flags: 0,
        sector,
        len: payload.len() as u64,
    }
    .encode(&mut buf)
    .expect("encode");
    buf.extend_from_slice(payload);
    buf
}

pub fn parse_frame(frame: &[u8], payload_len: usize) -> (DmUserHeader, Vec<u8>) {
    assert_eq!(frame.len(), DM_USER_HEADER_SIZE + payload_len);
    let header = DmUserHeader::decode(frame).expect("decode response header");
    (header, frame[DM_USER_HEADER_SIZE..].to_vec())
}

pub fn zero_log(new_blocks: &[u64]) -> MemByteDevice {
    let dev = MemByteDevice::new();
    let mut builder = CowLogBuilder::new(BLOCK_SIZE as u32);
    for block in new_blocks {
        builder.add_zero(*block);
    }
    builder.finish(&dev).expect("finish");
    dev
}

pub fn record_at(payload: &[u8], idx: usize) -> DiskException {
    DiskException::decode(payload, idx * 16).expect("record")
}
