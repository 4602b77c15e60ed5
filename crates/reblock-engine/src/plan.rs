//! Analysis phase: derive the relocation plan from the loop-file and
//! free-space extent lists.
//!
//! The plan is a permutation expressed as extent maps: `dev_map` ends up
//! holding every block range that must move (physical = current location,
//! logical = final destination, tagged by origin), `dev_free` the usable
//! device free space, and `storage_map` the candidate primary-storage
//! regions.

use crate::{narrow, show, Relocation};
use reblock_error::{ReblockError, Result};
use reblock_map::{ExtentMap, HolePool, IntersectMode};
use reblock_types::{
    sort_by_logical, sort_by_physical, BlockIdx, ByteExtent, ExtentTag, pretty_size,
};
use tracing::{error, info};

impl<T: BlockIdx> Relocation<'_, T> {
    /// Analysis phase. Consumes both extent lists destructively.
    ///
    /// On success: `dev_map` holds exactly the blocks to relocate, tagged by
    /// origin, with `total_count == used_count == work_count`; `dev_free`
    /// holds usable device free space (invariant holes excluded);
    /// `storage_map` enumerates the candidate primary-storage regions with
    /// `total_count` equal to their summed length.
    pub fn analyze(
        &mut self,
        mut loop_file_extents: Vec<ByteExtent>,
        mut free_space_extents: Vec<ByteExtent>,
    ) -> Result<()> {
        self.cleanup();

        let shift = self.io.effective_block_size_log2();
        let block_size = 1_u64 << shift;
        let dev_length = self.io.dev_length();

        // 1) LOOP-HOLES: the logical positions the target filesystem does
        // not use, free to receive relocated device blocks.
        sort_by_logical(&mut loop_file_extents);
        let mut loop_holes: ExtentMap<T> = ExtentMap::new();
        loop_holes.complement0_logical_shift(&loop_file_extents, shift, dev_length)?;

        // 2) LOOP-FILE extents sorted by physical.
        sort_by_physical(&mut loop_file_extents);
        let mut loop_map: ExtentMap<T> = ExtentMap::new();
        for extent in &loop_file_extents {
            loop_map.insert(
                narrow(extent.physical >> shift)?,
                narrow(extent.logical >> shift)?,
                narrow(extent.length >> shift)?,
                ExtentTag::Default,
            )?;
        }
        show("loop-file", "", block_size, &loop_map);

        // 3) FREE-SPACE with logical forced to physical: the logical of free
        // space is meaningless here, and zeroing the delta lets adjacent
        // extents coalesce.
        for extent in &free_space_extents {
            let physical = narrow(extent.physical >> shift)?;
            self.dev_free
                .insert(physical, physical, narrow(extent.length >> shift)?, ExtentTag::Default)?;
        }
        show("free-space", "", block_size, &self.dev_free);

        // Sanity: loop-file and free-space must not share device blocks.
        let mut overlap = ExtentMap::new();
        overlap.intersect_all_all(&loop_map, &self.dev_free, IntersectMode::Physical1)?;
        if !overlap.is_empty() {
            error!(
                target: "reblock::plan",
                "inconsistent loop-file and free-space: they share common blocks on the device"
            );
            show("loop-file", " intersection with free-space", block_size, &overlap);
            return Err(ReblockError::Internal(
                "loop-file and free-space extents overlap on physical blocks".to_owned(),
            ));
        }

        // 4) DEVICE in-use extents: the physical complement of
        // loop-file ∪ free-space.
        loop_file_extents.append(&mut free_space_extents);
        sort_by_physical(&mut loop_file_extents);
        self.dev_map
            .complement0_physical_shift(&loop_file_extents, shift, dev_length)?;
        show("device", "", block_size, &self.dev_map);

        show("loop-holes", " (initial)", block_size, &loop_holes);

        // 5) DEVICE blocks already sitting inside a loop-hole are invariant:
        // their physical position doubles as their final destination.
        let mut renumbered = ExtentMap::new();
        renumbered.intersect_all_all(&self.dev_map, &loop_holes, IntersectMode::Both)?;
        show("device", " (invariant)", block_size, &renumbered);
        self.dev_map.remove_all(&renumbered)?;
        // Those holes are no longer free: they are taken by the invariant
        // device extents.
        loop_holes.remove_all(&renumbered)?;
        renumbered.clear();
        show("loop-holes", " after device (invariant)", block_size, &loop_holes);

        // 6) Best-fit renumbering: assign the remaining holes as final
        // destinations for the remaining device extents.
        {
            let mut pool = HolePool::new(&mut loop_holes);
            pool.allocate_all(&mut self.dev_map, &mut renumbered)?;
        }
        show("device", " (renumbered)", block_size, &renumbered);
        show("loop-holes", " (final)", block_size, &loop_holes);

        if !self.dev_map.is_empty() {
            error!(
                target: "reblock::plan",
                "internal error: device extents do not fit the holes, giving up"
            );
            show("device", " (not fitting)", block_size, &self.dev_map);
            return Err(ReblockError::NoSpace(
                "device blocks left without a destination hole".to_owned(),
            ));
        }
        self.dev_map.swap(&mut renumbered);

        // 7) LOOP-FILE invariant split: extents already at their final
        // destination need no copy; the rest are work, tagged by origin.
        let mut work_count = T::ZERO;
        let mut invariant = ExtentMap::new();
        let loop_extents: Vec<_> = loop_map.iter().collect();
        loop_map.clear();
        for extent in loop_extents {
            if extent.physical == extent.logical {
                invariant.insert_disjoint(
                    extent.physical,
                    extent.logical,
                    extent.length,
                    extent.tag,
                );
            } else {
                work_count += extent.length;
                loop_map.insert_disjoint(
                    extent.physical,
                    extent.logical,
                    extent.length,
                    ExtentTag::LoopFile,
                );
            }
        }
        show("loop-file", " (invariant)", block_size, &invariant);
        drop(invariant);

        // 8) Merge the renumbered device extents into the plan, remembering
        // who's who through the tags.
        let device_extents: Vec<_> = self.dev_map.iter().collect();
        for extent in device_extents {
            work_count += extent.length;
            loop_map.insert(extent.physical, extent.logical, extent.length, ExtentTag::Device)?;
        }
        self.dev_map.clear();
        self.dev_map.swap(&mut loop_map);
        self.dev_map.set_total_count(work_count);
        self.dev_map.set_used_count(work_count);
        show("device + loop-file", " (merged)", block_size, &self.dev_map);

        info!(
            target: "reblock::plan",
            "analysis completed: {} must be relocated",
            pretty_size(work_count.to_u64() << shift)
        );

        // 9) Primary-storage selection: free device space that is also a
        // loop-hole is invariant (never used to hold migrating data); the
        // page-aligned, large-enough pieces of it become the candidate
        // primary storage.
        let mut candidates = ExtentMap::new();
        candidates.intersect_all_all(&self.dev_free, &loop_holes, IntersectMode::Both)?;
        show("free-space", " (invariant)", block_size, &candidates);

        // page_size_blocks is zero when the page is smaller than a block.
        let page_blocks = self.mem.page_size >> shift;
        let hole_threshold = (work_count.to_u64() >> 10).max(page_blocks << 8);

        let mut storage_total = T::ZERO;
        for extent in candidates.iter().collect::<Vec<_>>() {
            // Invariant free space is excluded from dev_free whether or not
            // it is large enough for storage, to keep the usable-free
            // estimate accurate.
            self.dev_free
                .remove(extent.physical, extent.logical, extent.length)?;

            if extent.length.to_u64() < hole_threshold {
                continue;
            }
            let (physical, length) = if page_blocks <= 1 {
                (extent.physical, extent.length)
            } else {
                // Trim both ends to a page boundary.
                let mask = page_blocks - 1;
                let start = extent.physical.to_u64();
                let end = start + extent.length.to_u64();
                let aligned_start = (start + mask) & !mask;
                let aligned_end = end & !mask;
                if aligned_end <= aligned_start
                    || aligned_end - aligned_start < hole_threshold
                {
                    continue;
                }
                (narrow(aligned_start)?, narrow(aligned_end - aligned_start)?)
            };
            self.storage_map
                .insert_disjoint(physical, physical, length, ExtentTag::Default);
            storage_total += length;
        }
        show(
            "primary-storage",
            " (= free-space, invariant, contiguous, aligned)",
            block_size,
            &self.storage_map,
        );
        self.storage_map.set_total_count(storage_total);

        info!(
            target: "reblock::plan",
            fragments = self.storage_map.len(),
            "primary-storage: located {} usable on the device \
             (free, invariant, contiguous and aligned)",
            pretty_size(storage_total.to_u64() << shift)
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemInfo;
    use reblock_io::SimIo;

    const B: u32 = 12;

    fn blocks(extents: &[(u64, u64, u64)]) -> Vec<ByteExtent> {
        extents
            .iter()
            .map(|&(p, l, len)| ByteExtent::new(p << B, l << B, len << B))
            .collect()
    }

    fn mem() -> MemInfo {
        MemInfo {
            free_ram: Some(1 << 30),
            page_size: 4096,
        }
    }

    fn analyzed(
        dev_blocks: u64,
        loop_extents: &[(u64, u64, u64)],
        free_extents: &[(u64, u64, u64)],
    ) -> (SimIo, ExtentMap<u64>, ExtentMap<u64>, ExtentMap<u64>) {
        let mut io = SimIo::new(dev_blocks << B, B);
        let mut job = Relocation::<u64>::new(&mut io, mem()).unwrap();
        job.analyze(blocks(loop_extents), blocks(free_extents))
            .unwrap();
        let Relocation {
            dev_map,
            dev_free,
            storage_map,
            ..
        } = job;
        (io, dev_map, dev_free, storage_map)
    }

    fn plan_of(map: &ExtentMap<u64>) -> Vec<(u64, u64, u64, ExtentTag)> {
        map.iter()
            .map(|e| (e.physical, e.logical, e.length, e.tag))
            .collect()
    }

    // Identity: the loop file occupies the front half in place; nothing
    // moves.
    #[test]
    fn identity_layout_needs_no_work() {
        let (_io, dev_map, dev_free, storage_map) =
            analyzed(16, &[(0, 0, 8)], &[(8, 8, 8)]);
        assert!(dev_map.is_empty());
        assert_eq!(dev_map.used_count(), 0);
        // Free space coincides with the loop-holes: all invariant, all
        // withdrawn from dev_free; the threshold rejects it for storage.
        assert!(dev_free.is_empty());
        assert!(storage_map.is_empty());
    }

    // Swap: loop file at the back must land at the front.
    #[test]
    fn swap_layout_produces_loop_file_work() {
        let (_io, dev_map, dev_free, storage_map) =
            analyzed(4, &[(2, 0, 2)], &[(0, 2, 2)]);
        assert_eq!(
            plan_of(&dev_map),
            vec![(2, 0, 2, ExtentTag::LoopFile)]
        );
        assert_eq!(dev_map.used_count(), 2);
        // Free space [0, 2) is not a loop-hole (holes are [2, 4)), so it
        // stays in dev_free with logical forced to physical.
        assert_eq!(plan_of(&dev_free), vec![(0, 0, 2, ExtentTag::Default)]);
        assert!(storage_map.is_empty());
    }

    // Best-fit: both used device ranges already coincide with loop-holes.
    #[test]
    fn in_place_device_blocks_are_invariant() {
        let (_io, dev_map, _dev_free, storage_map) =
            analyzed(16, &[(0, 0, 4)], &[(12, 12, 4)]);
        assert!(dev_map.is_empty());
        assert_eq!(dev_map.used_count(), 0);
        assert!(storage_map.is_empty());
    }

    // Device blocks overlapping the loop file's logical image must be
    // renumbered into holes and tagged as device work.
    #[test]
    fn displaced_device_blocks_are_renumbered() {
        // Device 8: loop file at [4, 8) maps logical [0, 4); blocks [0, 4)
        // are used by the source filesystem; no free space.
        let (_io, dev_map, dev_free, _storage) = analyzed(8, &[(4, 0, 4)], &[]);
        // Holes are [4, 8); device blocks [0, 4) get renumbered there.
        assert_eq!(
            plan_of(&dev_map),
            vec![
                (0, 4, 4, ExtentTag::Device),
                (4, 0, 4, ExtentTag::LoopFile)
            ]
        );
        assert_eq!(dev_map.used_count(), 8);
        assert!(dev_free.is_empty());
    }

    #[test]
    fn empty_inputs_produce_empty_plan() {
        let (_io, dev_map, dev_free, storage_map) = analyzed(16, &[], &[]);
        // The whole device is in-use and the whole device is a hole: all
        // invariant.
        assert!(dev_map.is_empty());
        assert!(dev_free.is_empty());
        assert!(storage_map.is_empty());
    }

    #[test]
    fn loop_file_covering_whole_device_is_invariant() {
        let (_io, dev_map, dev_free, storage_map) = analyzed(16, &[(0, 0, 16)], &[]);
        assert!(dev_map.is_empty());
        assert_eq!(dev_map.used_count(), 0);
        assert!(dev_free.is_empty());
        assert!(storage_map.is_empty());
    }

    #[test]
    fn fragmented_free_space_is_too_small_for_storage() {
        // Loop file fills logical [0, 32); four 2-block free fragments lie
        // inside the holes but under the 256-page threshold.
        let (_io, dev_map, dev_free, storage_map) = analyzed(
            64,
            &[(0, 0, 32)],
            &[(32, 32, 2), (40, 40, 2), (48, 48, 2), (56, 56, 2)],
        );
        assert!(dev_map.is_empty());
        assert!(storage_map.is_empty());
        assert_eq!(storage_map.total_count(), 0);
        // The undersized fragments were still withdrawn from dev_free.
        assert!(dev_free.is_empty());
    }

    #[test]
    fn large_invariant_free_space_becomes_storage() {
        // Page == block, so the threshold is max(work/1024, 256 blocks).
        // A 512-block invariant free range qualifies.
        let (_io, dev_map, dev_free, storage_map) =
            analyzed(1024, &[(0, 0, 256)], &[(256, 256, 512)]);
        assert!(dev_map.is_empty());
        assert_eq!(plan_of(&storage_map), vec![(256, 256, 512, ExtentTag::Default)]);
        assert_eq!(storage_map.total_count(), 512);
        // Withdrawn from dev_free even though it qualified.
        assert!(dev_free.is_empty());
    }

    #[test]
    fn overlapping_inputs_are_rejected() {
        let mut io = SimIo::new(16 << B, B);
        let mut job = Relocation::<u64>::new(&mut io, mem()).unwrap();
        // Loop file and free space both claim block 5.
        let err = job
            .analyze(blocks(&[(5, 0, 1)]), blocks(&[(5, 5, 1)]))
            .unwrap_err();
        assert!(matches!(err, ReblockError::Internal(_)));
    }

    #[test]
    fn trailing_partial_block_is_excluded() {
        let mut io = SimIo::new((16 << B) + 100, B);
        let mut job = Relocation::<u64>::new(&mut io, mem()).unwrap();
        job.analyze(blocks(&[(0, 0, 8)]), blocks(&[(8, 8, 8)]))
            .unwrap();
        // Same as the 16-block identity case: the 100-byte tail never
        // appears in any map.
        assert!(job.dev_map.is_empty());
        assert!(job.dev_free.is_empty());
    }

    #[test]
    fn work_count_matches_plan_length_sum() {
        let (_io, dev_map, _dev_free, _storage) = analyzed(8, &[(4, 0, 4)], &[]);
        assert_eq!(dev_map.length_sum(), dev_map.used_count());
        assert_eq!(dev_map.total_count(), dev_map.used_count());
    }
}
