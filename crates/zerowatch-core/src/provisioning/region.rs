//! Byte-addressable non-volatile region abstraction

use alloc::vec;
use alloc::vec::Vec;

use thiserror_no_std::Error;

/// A byte-addressable persistent region with explicit commit.
///
/// Reads and writes report how many bytes were actually transferred; a short
/// count is not an error at this level; the provisioning store decides what a
/// short count means.
pub trait NvRegion {
    type Error: core::fmt::Debug;

    /// Number of addressable bytes
    fn capacity(&self) -> usize;

    /// Read up to `buf.len()` bytes starting at `offset`.
    fn read_bytes(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Stage up to `data.len()` bytes starting at `offset`.
    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<usize, Self::Error>;

    /// Persist staged writes.
    fn commit(&mut self) -> Result<(), Self::Error>;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RamRegionError {
    #[error("commit rejected")]
    CommitRejected,
}

/// Heap-backed region used by tests and the simulator.
///
/// Writes land in a staging buffer and only become visible to reads after
/// [`commit`](NvRegion::commit), like an EEPROM emulated on top of flash.
pub struct RamRegion {
    staged: Vec<u8>,
    committed: Vec<u8>,
    read_limit: Option<usize>,
    write_limit: Option<usize>,
    reject_commit: bool,
    commits: usize,
}

impl RamRegion {
    /// Create an erased (all zero) region
    pub fn new(capacity: usize) -> Self {
        Self {
            staged: vec![0; capacity],
            committed: vec![0; capacity],
            read_limit: None,
            write_limit: None,
            reject_commit: false,
            commits: 0,
        }
    }

    /// Make every read stop at `limit`, as a failing part would
    pub fn truncate_reads_at(&mut self, limit: usize) {
        self.read_limit = Some(limit);
    }

    /// Make every write stop at `limit`
    pub fn truncate_writes_at(&mut self, limit: usize) {
        self.write_limit = Some(limit);
    }

    pub fn reject_commits(&mut self, reject: bool) {
        self.reject_commit = reject;
    }

    /// Committed contents
    pub fn contents(&self) -> &[u8] {
        &self.committed
    }

    /// Overwrite committed contents directly, bypassing staging
    pub fn poke(&mut self, offset: usize, data: &[u8]) {
        self.committed[offset..offset + data.len()].copy_from_slice(data);
        self.staged[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn commit_count(&self) -> usize {
        self.commits
    }

    fn span(&self, offset: usize, len: usize, limit: Option<usize>) -> usize {
        let end = limit.unwrap_or(self.committed.len()).min(self.committed.len());
        end.saturating_sub(offset).min(len)
    }
}

impl NvRegion for RamRegion {
    type Error = RamRegionError;

    fn capacity(&self) -> usize {
        self.committed.len()
    }

    fn read_bytes(&mut self, offset: usize, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = self.span(offset, buf.len(), self.read_limit);
        if n == 0 {
            return Ok(0);
        }
        buf[..n].copy_from_slice(&self.committed[offset..offset + n]);
        Ok(n)
    }

    fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<usize, Self::Error> {
        let n = self.span(offset, data.len(), self.write_limit);
        if n == 0 {
            return Ok(0);
        }
        self.staged[offset..offset + n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn commit(&mut self) -> Result<(), Self::Error> {
        if self.reject_commit {
            return Err(RamRegionError::CommitRejected);
        }
        self.committed.copy_from_slice(&self.staged);
        self.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_visible_after_commit() {
        let mut region = RamRegion::new(16);
        assert_eq!(region.write_bytes(4, b"abc").unwrap(), 3);

        let mut buf = [0u8; 3];
        region.read_bytes(4, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0], "staged data must not be readable");

        region.commit().unwrap();
        region.read_bytes(4, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_short_counts_at_end_of_region() {
        let mut region = RamRegion::new(8);
        let mut buf = [0u8; 6];
        assert_eq!(region.read_bytes(4, &mut buf).unwrap(), 4);
        assert_eq!(region.read_bytes(20, &mut buf).unwrap(), 0);
        assert_eq!(region.write_bytes(6, b"xyz").unwrap(), 2);
    }

    #[test]
    fn test_truncated_reads() {
        let mut region = RamRegion::new(64);
        region.truncate_reads_at(10);
        let mut buf = [0u8; 8];
        assert_eq!(region.read_bytes(6, &mut buf).unwrap(), 4);
    }
}
