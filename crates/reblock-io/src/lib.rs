#![forbid(unsafe_code)]
//! I/O collaborators for the relocation engine.
//!
//! The engine drives everything through the [`RelocIo`] trait: block copies
//! between device and scratch storage, flushing, storage creation, and the
//! four size knobs. Two implementations live here: [`SimIo`], an in-memory
//! recorder used by tests and dry runs, and [`FileIo`], the file-backed
//! implementation that moves real bytes.

mod extent_file;
mod posix;

pub use extent_file::{load_extents, load_extents_from_path, save_extents, save_extents_to_path};
pub use posix::FileIo;

use reblock_error::{ReblockError, Result};
use reblock_types::ByteExtent;

// ── Copy directions and size keys ───────────────────────────────────────────

/// Direction of one block copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDir {
    Dev2Storage,
    Storage2Dev,
    Dev2Dev,
}

/// Storage size configuration keys. All values in bytes; 0 means "auto".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageSizeKey {
    MemBuffer = 0,
    SecondaryStorage = 1,
    PrimaryStorageExact = 2,
    SecondaryStorageExact = 3,
}

// ── The collaborator contract ───────────────────────────────────────────────

/// I/O contract consumed by the relocation engine.
///
/// `copy` and `flush` are the only operations that may block on disk I/O.
/// Copy offsets are in effective-block units; storage-relative offsets
/// address the concatenation of primary storage (regions of the device
/// itself) followed by secondary storage.
pub trait RelocIo {
    fn effective_block_size_log2(&self) -> u32;
    fn dev_length(&self) -> u64;
    fn dev_path(&self) -> &str;
    fn is_open(&self) -> bool;
    fn simulate_run(&self) -> bool;

    /// Primary-storage extent list (byte units), filled by the engine.
    fn primary_storage(&mut self) -> &mut Vec<ByteExtent>;

    fn storage_size(&self, key: StorageSizeKey) -> u64;
    fn set_storage_size(&mut self, key: StorageSizeKey, bytes: u64);

    /// Create secondary storage and the memory buffer.
    fn create_storage(&mut self, secondary_bytes: u64, mem_buffer_bytes: u64) -> Result<()>;

    /// Copy `length` blocks. In-order durable application is guaranteed by
    /// the next `flush`.
    fn copy(&mut self, dir: CopyDir, from_phys: u64, to_phys: u64, length: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

// ── Simulated I/O ───────────────────────────────────────────────────────────

/// One recorded copy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRecord {
    pub dir: CopyDir,
    pub from: u64,
    pub to: u64,
    pub length: u64,
}

/// In-memory I/O: records every `copy` and `flush` without moving data,
/// while still validating offsets against device and storage bounds.
#[derive(Debug)]
pub struct SimIo {
    dev_length: u64,
    block_log2: u32,
    open: bool,
    primary_storage: Vec<ByteExtent>,
    sizes: [u64; 4],
    created: Option<(u64, u64)>,
    pub copies: Vec<CopyRecord>,
    pub flushes: usize,
}

impl SimIo {
    #[must_use]
    pub fn new(dev_length: u64, block_log2: u32) -> Self {
        Self {
            dev_length,
            block_log2,
            open: true,
            primary_storage: Vec::new(),
            sizes: [0; 4],
            created: None,
            copies: Vec::new(),
            flushes: 0,
        }
    }

    /// A `SimIo` that reports itself closed, for exercising the
    /// not-connected path.
    #[must_use]
    pub fn closed(dev_length: u64, block_log2: u32) -> Self {
        let mut io = Self::new(dev_length, block_log2);
        io.open = false;
        io
    }

    /// Arguments of the `create_storage` call, if it happened.
    #[must_use]
    pub fn created_storage(&self) -> Option<(u64, u64)> {
        self.created
    }

    fn dev_blocks(&self) -> u64 {
        self.dev_length >> self.block_log2
    }

    fn storage_blocks(&self) -> u64 {
        (self.sizes[StorageSizeKey::PrimaryStorageExact as usize]
            + self.sizes[StorageSizeKey::SecondaryStorageExact as usize])
            >> self.block_log2
    }

    fn check_range(&self, what: &str, limit: u64, start: u64, length: u64) -> Result<()> {
        if start.checked_add(length).map_or(true, |end| end > limit) {
            return Err(ReblockError::Internal(format!(
                "{what} range [{start}, {start}+{length}) exceeds {limit} blocks"
            )));
        }
        Ok(())
    }
}

impl RelocIo for SimIo {
    fn effective_block_size_log2(&self) -> u32 {
        self.block_log2
    }

    fn dev_length(&self) -> u64 {
        self.dev_length
    }

    fn dev_path(&self) -> &str {
        "<simulated>"
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn simulate_run(&self) -> bool {
        true
    }

    fn primary_storage(&mut self) -> &mut Vec<ByteExtent> {
        &mut self.primary_storage
    }

    fn storage_size(&self, key: StorageSizeKey) -> u64 {
        self.sizes[key as usize]
    }

    fn set_storage_size(&mut self, key: StorageSizeKey, bytes: u64) {
        self.sizes[key as usize] = bytes;
    }

    fn create_storage(&mut self, secondary_bytes: u64, mem_buffer_bytes: u64) -> Result<()> {
        self.created = Some((secondary_bytes, mem_buffer_bytes));
        Ok(())
    }

    fn copy(&mut self, dir: CopyDir, from_phys: u64, to_phys: u64, length: u64) -> Result<()> {
        match dir {
            CopyDir::Dev2Dev => {
                self.check_range("copy source", self.dev_blocks(), from_phys, length)?;
                self.check_range("copy target", self.dev_blocks(), to_phys, length)?;
            }
            CopyDir::Dev2Storage => {
                self.check_range("copy source", self.dev_blocks(), from_phys, length)?;
                self.check_range("copy target", self.storage_blocks(), to_phys, length)?;
            }
            CopyDir::Storage2Dev => {
                self.check_range("copy source", self.storage_blocks(), from_phys, length)?;
                self.check_range("copy target", self.dev_blocks(), to_phys, length)?;
            }
        }
        self.copies.push(CopyRecord {
            dir,
            from: from_phys,
            to: to_phys,
            length,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_io_records_copies_and_flushes() {
        let mut io = SimIo::new(64 << 12, 12);
        io.set_storage_size(StorageSizeKey::SecondaryStorageExact, 8 << 12);
        io.copy(CopyDir::Dev2Storage, 0, 0, 4).unwrap();
        io.copy(CopyDir::Storage2Dev, 0, 32, 4).unwrap();
        io.flush().unwrap();
        assert_eq!(io.copies.len(), 2);
        assert_eq!(io.flushes, 1);
        assert_eq!(io.copies[0].dir, CopyDir::Dev2Storage);
    }

    #[test]
    fn sim_io_rejects_out_of_bounds() {
        let mut io = SimIo::new(64 << 12, 12);
        // No storage configured: any storage-target copy is out of bounds.
        assert!(io.copy(CopyDir::Dev2Storage, 0, 0, 1).is_err());
        assert!(io.copy(CopyDir::Dev2Dev, 60, 0, 8).is_err());
        assert!(io.copy(CopyDir::Dev2Dev, 0, 60, 8).is_err());
        assert!(io.copy(CopyDir::Dev2Dev, 0, 32, 8).is_ok());
    }

    #[test]
    fn closed_sim_io_reports_not_open() {
        let io = SimIo::closed(64 << 12, 12);
        assert!(!io.is_open());
    }
}
