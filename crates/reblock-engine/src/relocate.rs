//! Execution phase: permute the device blocks.
//!
//! The main loop alternates between draining device blocks into scratch
//! storage and writing blocks (from the device or from storage) to their
//! final destinations, until both the plan and the storage are empty. Each
//! round either frees storage capacity or finalises blocks, so the
//! work-set shrinks monotonically. Copies within a phase are emitted in
//! increasing destination order for sequential write patterns; a flush
//! delimits every phase.

use crate::{narrow, show, Relocation};
use reblock_error::{ReblockError, Result};
use reblock_io::{CopyDir, StorageSizeKey};
use reblock_map::{Extent, ExtentMap, IntersectMode};
use reblock_types::{pretty_size, BlockIdx, ExtentTag};
use tracing::{info, trace};

/// Which side a `move_to_target` pass drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveSource {
    Dev,
    Storage,
}

impl<T: BlockIdx> Relocation<'_, T> {
    /// Execution phase. Must run after `create_storage`; the device must be
    /// unmounted unless this is a simulated run.
    pub fn relocate(&mut self) -> Result<()> {
        let sim = if self.io.simulate_run() { "SIMULATED " } else { "" };
        info!(
            target: "reblock::relocate",
            device = self.io.dev_path(),
            "{sim}relocation starting. this may take a LONG time ..."
        );

        let shift = self.io.effective_block_size_log2();
        let storage_bytes = self.io.storage_size(StorageSizeKey::PrimaryStorageExact)
            + self.io.storage_size(StorageSizeKey::SecondaryStorageExact);
        let storage_count = narrow::<T>(storage_bytes >> shift)?;

        // Storage starts free.
        self.storage_map.clear();
        self.storage_map.set_total_count(storage_count);
        self.storage_transpose.clear();
        self.storage_free.clear();
        self.storage_free
            .insert(T::ZERO, T::ZERO, storage_count, ExtentTag::Default)?;

        self.work_total = self.dev_map.used_count();

        // The device starts (almost) full.
        let dev_free_count = self.dev_free.length_sum();
        self.dev_map
            .set_total_count(self.work_total + dev_free_count);
        self.dev_transpose.clear();
        self.dev_transpose.transpose_of(&self.dev_map)?;

        while !(self.dev_map.is_empty() && self.storage_map.is_empty()) {
            if !self.dev_map.is_empty() && !self.storage_free.is_empty() {
                self.show_progress();
                self.fill_storage()?;
            }
            if !self.dev_map.is_empty() {
                self.show_progress();
                self.move_to_target(MoveSource::Dev)?;
            }
            if !self.storage_map.is_empty() {
                self.show_progress();
                self.move_to_target(MoveSource::Storage)?;
            }
        }
        info!(target: "reblock::relocate", "{sim}relocation completed.");
        Ok(())
    }

    /// Report progress between phases.
    #[allow(clippy::cast_precision_loss)]
    fn show_progress(&self) {
        let shift = self.io.effective_block_size_log2();
        let dev_used = self.dev_map.used_count().to_u64();
        let storage_used = self.storage_map.used_count().to_u64();
        let left = (dev_used + storage_used) << shift;

        if self.work_total != T::ZERO {
            // Blocks parked in storage are seven-eighths done: they still
            // need one more copy to reach their destination.
            let done = 1.0
                - (dev_used as f64 + 0.875 * storage_used as f64)
                    / self.work_total.to_u64() as f64;
            info!(
                target: "reblock::relocate",
                "progress: {:4.1}% done, {} still to relocate",
                done * 100.0,
                pretty_size(left)
            );
        } else {
            info!(
                target: "reblock::relocate",
                "progress: {} left to relocate",
                pretty_size(left)
            );
        }

        let block_size = 1_u64 << shift;
        show("device", "", block_size, &self.dev_map);
        show("device", " free space", block_size, &self.dev_free);
        show("storage", "", block_size, &self.storage_map);
        show("storage", " free space", block_size, &self.storage_free);
    }

    /// Move as many device extents as possible into free storage.
    fn fill_storage(&mut self) -> Result<()> {
        let sim = if self.io.simulate_run() { "SIMULATED " } else { "" };
        let shift = self.io.effective_block_size_log2();
        let to_free_count = self.storage_map.free_count();
        let will_move = self.dev_map.used_count().min(to_free_count);
        info!(
            target: "reblock::relocate",
            "{sim}filling storage by moving {} from the device ...",
            pretty_size(will_move.to_u64() << shift)
        );

        let mut moved = T::ZERO;
        for from_physical in self.dev_map.physical_keys() {
            if moved >= to_free_count {
                break;
            }
            self.move_extent(from_physical, &mut moved)?;
        }
        self.io.flush()?;
        info!(target: "reblock::relocate", "{sim}storage filled");
        Ok(())
    }

    /// Move one device extent into free storage, fragment by fragment,
    /// until the extent is exhausted or storage runs out.
    fn move_extent(&mut self, from_physical: T, moved: &mut T) -> Result<()> {
        let mut from = self.dev_map.get(from_physical).ok_or_else(|| {
            ReblockError::Internal(format!("no device extent keyed at {from_physical}"))
        })?;
        while from.length > T::ZERO {
            let Some(to_free) = self.storage_free.first() else {
                break;
            };
            let length = from.length.min(to_free.length);
            self.move_fragment(&from, &to_free, length)?;
            *moved += length;
            from.physical += length;
            from.logical += length;
            from.length -= length;
        }
        Ok(())
    }

    /// Copy `length` blocks of `from` into the free storage range, then
    /// update all six maps so that the plan stays consistent with what is
    /// on disk.
    fn move_fragment(
        &mut self,
        from: &Extent<T>,
        to_free: &Extent<T>,
        length: T,
    ) -> Result<()> {
        self.io.copy(
            CopyDir::Dev2Storage,
            from.physical.to_u64(),
            to_free.physical.to_u64(),
            length.to_u64(),
        )?;

        // Target side: storage gains the blocks.
        self.storage_map
            .stat_insert(to_free.physical, from.logical, length, from.tag)?;
        self.storage_transpose
            .insert(from.logical, to_free.physical, length, from.tag)?;
        self.storage_free.remove_front(to_free.physical, length)?;

        // Source side: the device range becomes free.
        self.dev_map.stat_remove_front(from.physical, length)?;
        self.dev_transpose
            .remove(from.logical, from.physical, length)?;
        self.dev_free
            .insert(from.physical, from.physical, length, ExtentTag::Default)?;
        Ok(())
    }

    /// Move every extent whose final destination is currently free device
    /// space straight to that destination.
    fn move_to_target(&mut self, source: MoveSource) -> Result<()> {
        let sim = if self.io.simulate_run() { "SIMULATED " } else { "" };
        let shift = self.io.effective_block_size_log2();
        let block_size = 1_u64 << shift;
        let (label_from, dir) = match source {
            MoveSource::Dev => ("device", CopyDir::Dev2Dev),
            MoveSource::Storage => ("storage", CopyDir::Storage2Dev),
        };

        let mut movable = ExtentMap::new();
        {
            let from_transpose = match source {
                MoveSource::Dev => &self.dev_transpose,
                MoveSource::Storage => &self.storage_transpose,
            };
            movable.intersect_all_all(from_transpose, &self.dev_free, IntersectMode::Physical1)?;

            if movable.is_empty() {
                info!(
                    target: "reblock::relocate",
                    "{sim}moved 0 bytes from {label_from} to target (not so useful)"
                );
                show(label_from, " transposed", block_size, from_transpose);
                show("device", " free space", block_size, &self.dev_free);
                return Ok(());
            }
        }

        info!(
            target: "reblock::relocate",
            "{sim}moving {} from {label_from} to target ...",
            pretty_size(movable.length_sum().to_u64() << shift)
        );

        // Sequential disk access: movable iterates by destination physical,
        // so consecutive copies write forward through the device.
        for extent in movable.iter().collect::<Vec<_>>() {
            let to_physical = extent.physical;
            let from_physical = extent.logical;
            let length = extent.length;

            self.io
                .copy(dir, from_physical.to_u64(), to_physical.to_u64(), length.to_u64())?;
            trace!(
                target: "reblock::relocate",
                from = %from_physical,
                to = %to_physical,
                length = %length,
                tag = %extent.tag,
                "moved to target"
            );

            match source {
                MoveSource::Dev => {
                    self.dev_transpose
                        .remove(to_physical, from_physical, length)?;
                    self.dev_map.stat_remove(from_physical, to_physical, length)?;
                    self.dev_free
                        .insert(from_physical, from_physical, length, ExtentTag::Default)?;
                }
                MoveSource::Storage => {
                    self.storage_transpose
                        .remove(to_physical, from_physical, length)?;
                    self.storage_map
                        .stat_remove(from_physical, to_physical, length)?;
                    self.storage_free
                        .insert(from_physical, from_physical, length, ExtentTag::Default)?;
                }
            }
            // The destination block is now permanently occupied: forget it.
            self.dev_free.remove(to_physical, to_physical, length)?;
            let total = self.dev_map.total_count();
            self.dev_map.set_total_count(total - length);
        }

        self.io.flush()?;
        info!(
            target: "reblock::relocate",
            "{sim}finished moving from {label_from} to target"
        );
        Ok(())
    }
}
