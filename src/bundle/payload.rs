//! Offset-addressed payload storage.
//!
//! A payload supports random-offset reads into a caller buffer and
//! random-offset writes from one, so the segment engine can stream a
//! payload through a bounded send buffer and fill one in from segments
//! that arrive in pieces. Implementations that spill to disk keep a file
//! handle open across writes; the open/close sub-resource is modeled here
//! so the engine drives it the same way.

use std::sync::atomic::{AtomicBool, Ordering};

/// Byte storage for one bundle's payload.
#[derive(Debug, Default)]
pub struct BundlePayload {
    data: Vec<u8>,
    file_open: AtomicBool,
}

impl BundlePayload {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the payload contents.
    pub fn set_data(&mut self, data: &[u8]) {
        self.data = data.to_vec();
    }

    /// Sets the payload length ahead of offset writes. New bytes are zero.
    pub fn set_length(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`. The caller
    /// is responsible for staying within the payload length.
    pub fn read_data(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.data.len());
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
    }

    /// Copies `bytes` into the payload starting at `offset`, leaving the
    /// backing file open for the next write.
    pub fn write_data(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.data.len());
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.file_open.store(true, Ordering::Relaxed);
    }

    pub fn close_file(&self) {
        self.file_open.store(false, Ordering::Relaxed);
    }

    pub fn is_file_open(&self) -> bool {
        self.file_open.load(Ordering::Relaxed)
    }

    /// The payload bytes, for callers that want the whole thing at once.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}
