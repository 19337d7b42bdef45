//! Simulated user memory.
//!
//! User buffers are shared byte regions instead of raw pointers: MDs and
//! list entries hold a `MemRegion`, and the NIC writes payloads through it.
//! Offsets into a region are what the original reported as event `start`
//! addresses.

use std::sync::{Arc, Mutex};

/// A user memory buffer visible to the NIC. Cloning shares the backing
/// storage, so the application and the simulated NIC observe each other's
/// writes the way DMA would.
#[derive(Debug, Clone)]
pub struct MemRegion {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemRegion {
    pub fn new(len: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0; len])),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: Arc::new(Mutex::new(bytes.to_vec())),
        }
    }

    pub fn len(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `len` bytes starting at `offset`, clamped to the region.
    pub fn read(&self, offset: u64, len: u64) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let end = (start + len as usize).min(data.len());
        data[start..end].to_vec()
    }

    /// Write `bytes` at `offset`, clamped to the region. Returns the number
    /// of bytes actually written.
    pub fn write(&self, offset: u64, bytes: &[u8]) -> usize {
        let mut data = self.data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let n = bytes.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&bytes[..n]);
        n
    }

    /// Snapshot of the whole region, for assertions in tests.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

/// Copy `len` bytes from one region to another, honouring the configured
/// memcpy cap (-1 for uncapped). Timing is charged by the caller; this only
/// moves the bytes.
pub fn capped_copy(
    dst: &MemRegion,
    dst_offset: u64,
    src: &MemRegion,
    src_offset: u64,
    len: u64,
    max_memcpy: i64,
) {
    let to_copy = if max_memcpy < 0 {
        len
    } else {
        len.min(max_memcpy as u64)
    };
    if to_copy == 0 {
        return;
    }
    let bytes = src.read(src_offset, to_copy);
    dst.write(dst_offset, &bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_and_writes_are_clamped() {
        let region = MemRegion::new(4);
        assert_eq!(region.write(2, &[7, 8, 9]), 2);
        assert_eq!(region.snapshot(), vec![0, 0, 7, 8]);
        assert_eq!(region.read(3, 10), vec![8]);
        assert_eq!(region.read(10, 1), Vec::<u8>::new());
    }

    #[test]
    fn clones_share_storage() {
        let a = MemRegion::from_bytes(b"abcd");
        let b = a.clone();
        b.write(0, b"Z");
        assert_eq!(a.read(0, 4), b"Zbcd");
    }

    #[test]
    fn capped_copy_respects_the_cap() {
        let src = MemRegion::from_bytes(&[1, 2, 3, 4]);
        let dst = MemRegion::new(4);
        capped_copy(&dst, 0, &src, 0, 4, 2);
        assert_eq!(dst.snapshot(), vec![1, 2, 0, 0]);
        capped_copy(&dst, 0, &src, 0, 4, -1);
        assert_eq!(dst.snapshot(), vec![1, 2, 3, 4]);
    }
}
