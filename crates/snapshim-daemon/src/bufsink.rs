//! Staging buffer shared with the control device.
//!
//! One contiguous region of header plus payload. The header slot is
//! rewritten in place every cycle; payload bytes are staged at a moving
//! offset so successive per-block operations land in consecutive bytes of a
//! single response.

use snapshim_types::{DM_USER_HEADER_SIZE, PAYLOAD_SIZE};

#[derive(Debug)]
pub struct PayloadBuffer {
    buf: Vec<u8>,
    offset: usize,
}

impl Default for PayloadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0_u8; DM_USER_HEADER_SIZE + PAYLOAD_SIZE],
            offset: 0,
        }
    }

    /// Zero the whole region and rewind the payload offset. Called at the
    /// start of every request.
    pub fn clear(&mut self) {
        self.buf.fill(0);
        self.offset = 0;
    }

    /// The header slot.
    #[must_use]
    pub fn header(&self) -> &[u8] {
        &self.buf[..DM_USER_HEADER_SIZE]
    }

    /// Mutable header slot; the request header is read into it and the
    /// response header encoded over it.
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..DM_USER_HEADER_SIZE]
    }

    /// `len` staging bytes at the current payload offset, or `None` if the
    /// payload region is exhausted.
    pub fn payload_mut(&mut self, len: usize) -> Option<&mut [u8]> {
        let start = DM_USER_HEADER_SIZE + self.offset;
        let end = start.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        Some(&mut self.buf[start..end])
    }

    /// `len` staged bytes at the current payload offset.
    #[must_use]
    pub fn payload(&self, len: usize) -> Option<&[u8]> {
        let start = DM_USER_HEADER_SIZE + self.offset;
        let end = start.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        Some(&self.buf[start..end])
    }

    /// Advance the payload offset past `len` staged bytes.
    pub fn advance(&mut self, len: usize) {
        debug_assert!(self.offset + len <= PAYLOAD_SIZE);
        self.offset += len;
    }

    /// Rewind the payload offset to the start of the payload region.
    pub fn reset_offset(&mut self) {
        self.offset = 0;
    }

    /// Bytes staged since the last rewind.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The response frame: header plus the first `payload_len` payload
    /// bytes.
    #[must_use]
    pub fn frame(&self, payload_len: usize) -> &[u8] {
        assert!(payload_len <= PAYLOAD_SIZE, "response exceeds payload region");
        &self.buf[..DM_USER_HEADER_SIZE + payload_len]
    }
}
