#![forbid(unsafe_code)]
//! The ReBlock relocation engine.
//!
//! Transforms a block device in-place: given the extents of a loop file
//! (the image of a target filesystem hosted on the source filesystem) and
//! the free-space extents of the source filesystem, the engine computes a
//! permutation of the device's physical blocks and executes it using the
//! device itself plus a bounded scratch area.
//!
//! Phases, each fallible and run in order by [`run`]:
//!
//! 1. **init** — width and open checks ([`Relocation::new`]).
//! 2. **analyze** — derive the relocation plan from the two extent lists.
//! 3. **create_storage** — size and create primary/secondary storage.
//! 4. **relocate** — drain the plan through the bounded storage.
//!
//! The engine is generic over the block-index width; [`run`] picks `u32`
//! when the device's block count fits (halving map memory) and `u64`
//! otherwise.

mod plan;
mod relocate;
mod storage;

pub use storage::MemInfo;

use reblock_error::{ReblockError, Result};
use reblock_io::RelocIo;
use reblock_map::ExtentMap;
use reblock_types::{BlockIdx, ByteExtent};
use tracing::{debug, error, trace};

/// One relocation job over one device.
///
/// Owns the six extent maps the planner populates and the executor drains.
/// The I/O collaborator is borrowed for the lifetime of the job; the device
/// must be exclusively owned (and unmounted) for the `relocate` phase.
pub struct Relocation<'io, T: BlockIdx> {
    io: &'io mut dyn RelocIo,
    mem: MemInfo,
    dev_map: ExtentMap<T>,
    storage_map: ExtentMap<T>,
    dev_free: ExtentMap<T>,
    dev_transpose: ExtentMap<T>,
    storage_free: ExtentMap<T>,
    storage_transpose: ExtentMap<T>,
    work_total: T,
}

impl<'io, T: BlockIdx> std::fmt::Debug for Relocation<'io, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relocation")
            .field("mem", &self.mem)
            .field("dev_map", &self.dev_map)
            .field("storage_map", &self.storage_map)
            .field("dev_free", &self.dev_free)
            .field("dev_transpose", &self.dev_transpose)
            .field("storage_free", &self.storage_free)
            .field("storage_transpose", &self.storage_transpose)
            .field("work_total", &self.work_total)
            .finish()
    }
}

impl<'io, T: BlockIdx> Relocation<'io, T> {
    /// Check that the device's block count is representable by `T` and that
    /// the I/O layer is open, then bind to it.
    pub fn new(io: &'io mut dyn RelocIo, mem: MemInfo) -> Result<Self> {
        let block_count = io.dev_length() >> io.effective_block_size_log2();
        if T::from_u64(block_count).is_none() {
            return Err(ReblockError::Overflow(format!(
                "device holds {block_count} blocks, too many for the configured block index"
            )));
        }
        if !io.is_open() {
            return Err(ReblockError::NotConnected);
        }
        Ok(Self {
            io,
            mem,
            dev_map: ExtentMap::new(),
            storage_map: ExtentMap::new(),
            dev_free: ExtentMap::new(),
            dev_transpose: ExtentMap::new(),
            storage_free: ExtentMap::new(),
            storage_transpose: ExtentMap::new(),
            work_total: T::ZERO,
        })
    }

    /// Clear every map and counter.
    fn cleanup(&mut self) {
        self.dev_map.clear();
        self.storage_map.clear();
        self.dev_free.clear();
        self.dev_transpose.clear();
        self.storage_free.clear();
        self.storage_transpose.clear();
        self.work_total = T::ZERO;
    }

    /// Run all phases of a job to completion.
    pub fn run_job(
        loop_file_extents: Vec<ByteExtent>,
        free_space_extents: Vec<ByteExtent>,
        io: &'io mut dyn RelocIo,
        mem: MemInfo,
    ) -> Result<()> {
        let mut job = Self::new(io, mem)?;
        job.analyze(loop_file_extents, free_space_extents)?;
        job.create_storage()?;
        job.relocate()
    }
}

/// Run a relocation, monomorphising on the narrowest block index that can
/// address the whole device.
pub fn run(
    loop_file_extents: Vec<ByteExtent>,
    free_space_extents: Vec<ByteExtent>,
    io: &mut dyn RelocIo,
    mem: MemInfo,
) -> Result<()> {
    let block_count = io.dev_length() >> io.effective_block_size_log2();
    let result = if u32::try_from(block_count).is_ok() {
        Relocation::<u32>::run_job(loop_file_extents, free_space_extents, io, mem)
    } else {
        Relocation::<u64>::run_job(loop_file_extents, free_space_extents, io, mem)
    };
    if let Err(err) = &result {
        error!(target: "reblock::engine", error = %err, "failed with unreported error");
    }
    result
}

/// Overflow-checked narrowing from `u64` block arithmetic into `T`.
fn narrow<T: BlockIdx>(value: u64) -> Result<T> {
    T::from_u64(value)
        .ok_or_else(|| ReblockError::Overflow(format!("block count {value} exceeds index width")))
}

/// Log an extent map: the count at debug level, each row at trace level.
fn show<T: BlockIdx>(label1: &str, label2: &str, eff_block_size: u64, map: &ExtentMap<T>) {
    if map.is_empty() {
        debug!(target: "reblock::engine", "no extents in {label1}{label2}");
        return;
    }
    debug!(
        target: "reblock::engine",
        extents = map.len(),
        block_size = eff_block_size,
        "{label1}{label2}"
    );
    for (i, extent) in map.iter().enumerate() {
        trace!(
            target: "reblock::engine",
            index = i,
            physical = %extent.physical,
            logical = %extent.logical,
            length = %extent.length,
            tag = %extent.tag,
            "extent"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reblock_io::SimIo;

    #[test]
    fn init_rejects_block_count_overflow() {
        // 2^34 blocks of 4 KiB do not fit a u32 index.
        let mut io = SimIo::new(1_u64 << 46, 12);
        let err = Relocation::<u32>::new(&mut io, MemInfo::default()).unwrap_err();
        assert!(matches!(err, ReblockError::Overflow(_)));
        // No state was touched: the recorder saw nothing.
        assert!(io.copies.is_empty());
        assert_eq!(io.flushes, 0);

        // The same device is fine with a u64 index.
        assert!(Relocation::<u64>::new(&mut io, MemInfo::default()).is_ok());
    }

    #[test]
    fn init_rejects_closed_io() {
        let mut io = SimIo::closed(64 << 12, 12);
        let err = Relocation::<u64>::new(&mut io, MemInfo::default()).unwrap_err();
        assert!(matches!(err, ReblockError::NotConnected));
    }

    #[test]
    fn dispatch_runs_empty_job() {
        let mut io = SimIo::new(16 << 12, 12);
        run(Vec::new(), Vec::new(), &mut io, MemInfo::default()).unwrap();
        assert!(io.copies.is_empty());
    }
}
