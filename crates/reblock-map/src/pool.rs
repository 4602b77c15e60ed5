//! Best-fit hole allocator over a borrowed [`ExtentMap`].
//!
//! Presents the holes of a map ordered by length so the planner can assign
//! final destinations to relocated blocks with a best-fit strategy: each
//! request withdraws from the smallest hole that fits, keeping large holes
//! intact for large requests.

use crate::ExtentMap;
use reblock_error::Result;
use reblock_types::BlockIdx;
use std::collections::BTreeSet;
use tracing::trace;

/// Length-ordered view of an [`ExtentMap`] of holes.
///
/// Borrows the map for the duration of an allocation batch; every withdrawal
/// updates both the underlying map and the length index.
#[derive(Debug)]
pub struct HolePool<'m, T: BlockIdx> {
    map: &'m mut ExtentMap<T>,
    // (length, physical), ascending: the best-fit hole for a request of
    // length n is the first element of the range (n, 0)..
    by_len: BTreeSet<(T, T)>,
}

impl<'m, T: BlockIdx> HolePool<'m, T> {
    pub fn new(map: &'m mut ExtentMap<T>) -> Self {
        let by_len = map.iter().map(|e| (e.length, e.physical)).collect();
        Self { map, by_len }
    }

    /// Total remaining pool capacity in blocks.
    #[must_use]
    pub fn capacity(&self) -> T {
        self.map.length_sum()
    }

    /// Withdraw a destination range for every extent of `requests`, recording
    /// the renumbered extents into `fulfilled`: each fulfilled extent keeps
    /// the request's physical (its current location) and receives the
    /// withdrawn hole position as its logical (its final destination).
    ///
    /// A request larger than every remaining hole is fragmented across holes,
    /// largest first, so allocation succeeds whenever the total capacity
    /// covers the total requested length. When the pool runs dry the leftover
    /// requests remain in `requests` for the caller to diagnose.
    pub fn allocate_all(
        &mut self,
        requests: &mut ExtentMap<T>,
        fulfilled: &mut ExtentMap<T>,
    ) -> Result<()> {
        while let Some(request) = requests.first() {
            let best_fit = self
                .by_len
                .range((request.length, T::ZERO)..)
                .next()
                .copied();
            let (hole_len, hole_phys, taken) = match best_fit {
                Some((hole_len, hole_phys)) => (hole_len, hole_phys, request.length),
                None => {
                    // No single hole fits: consume the largest one whole and
                    // retry the shrunken request.
                    let Some(&(hole_len, hole_phys)) = self.by_len.iter().next_back() else {
                        break;
                    };
                    (hole_len, hole_phys, hole_len)
                }
            };

            trace!(
                target: "reblock::pool",
                physical = %request.physical,
                destination = %hole_phys,
                length = %taken,
                "assign"
            );

            fulfilled.insert(request.physical, hole_phys, taken, request.tag)?;
            self.by_len.remove(&(hole_len, hole_phys));
            self.map.remove_front(hole_phys, taken)?;
            if hole_len > taken {
                self.by_len.insert((hole_len - taken, hole_phys + taken));
            }
            requests.remove_front(request.physical, taken)?;
        }
        Ok(())
    }
}
