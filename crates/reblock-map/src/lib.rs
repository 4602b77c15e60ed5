#![forbid(unsafe_code)]
//! Ordered extent maps for the relocation engine.
//!
//! An [`ExtentMap`] is a sorted, strictly non-overlapping collection of
//! `(physical, logical, length, tag)` extents keyed by physical block,
//! with interval algebra over non-overlapping integer ranges: complement,
//! intersection, subtraction, transpose. The planner derives the
//! relocation plan with these primitives; the executor mutates the maps
//! block-range by block-range as copies complete.
//!
//! Invariants (hold after every public operation):
//!
//! - entries are sorted by `physical` and never overlap;
//! - no two adjacent entries are coalesce-eligible (physicals touching,
//!   logicals touching by the same delta, equal tag);
//! - empty extents never appear;
//! - `used_count <= total_count`.

mod pool;

pub use pool::HolePool;

use reblock_error::{ReblockError, Result};
use reblock_types::{BlockIdx, ByteExtent, ExtentTag};
use std::collections::BTreeMap;

// ── Extents ─────────────────────────────────────────────────────────────────

/// One block-scale extent: `length` blocks currently at `physical`, bound
/// for `logical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent<T> {
    pub physical: T,
    pub logical: T,
    pub length: T,
    pub tag: ExtentTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Body<T> {
    logical: T,
    length: T,
    tag: ExtentTag,
}

/// Intersection mode for [`ExtentMap::intersect_all_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntersectMode {
    /// Extents intersect when their physical ranges overlap.
    Physical1,
    /// Additionally require equal `logical - physical` delta, selecting
    /// ranges whose mapping would leave blocks in place.
    Both,
}

// ── ExtentMap ───────────────────────────────────────────────────────────────

/// Sorted non-overlapping extent map keyed by physical block, with the two
/// auxiliary counters (`total_count`, `used_count`) maintained by the owner.
#[derive(Debug, Clone, Default)]
pub struct ExtentMap<T: BlockIdx> {
    entries: BTreeMap<T, Body<T>>,
    total_count: T,
    used_count: T,
}

impl<T: BlockIdx> ExtentMap<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            total_count: T::ZERO,
            used_count: T::ZERO,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn total_count(&self) -> T {
        self.total_count
    }

    pub fn set_total_count(&mut self, count: T) {
        self.total_count = count;
    }

    #[must_use]
    pub fn used_count(&self) -> T {
        self.used_count
    }

    pub fn set_used_count(&mut self, count: T) {
        self.used_count = count;
    }

    /// Blocks still unaccounted for: `total_count - used_count`.
    #[must_use]
    pub fn free_count(&self) -> T {
        self.total_count - self.used_count
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_count = T::ZERO;
        self.used_count = T::ZERO;
    }

    pub fn swap(&mut self, other: &mut Self) {
        std::mem::swap(self, other);
    }

    /// Iterate extents in increasing physical order.
    pub fn iter(&self) -> impl Iterator<Item = Extent<T>> + '_ {
        self.entries.iter().map(|(&physical, body)| Extent {
            physical,
            logical: body.logical,
            length: body.length,
            tag: body.tag,
        })
    }

    /// First extent by physical, if any.
    #[must_use]
    pub fn first(&self) -> Option<Extent<T>> {
        self.entries
            .iter()
            .next()
            .map(|(&physical, body)| Extent {
                physical,
                logical: body.logical,
                length: body.length,
                tag: body.tag,
            })
    }

    /// Exact-key lookup by physical start.
    #[must_use]
    pub fn get(&self, physical: T) -> Option<Extent<T>> {
        self.entries.get(&physical).map(|body| Extent {
            physical,
            logical: body.logical,
            length: body.length,
            tag: body.tag,
        })
    }

    /// Sum of all extent lengths.
    #[must_use]
    pub fn length_sum(&self) -> T {
        let mut sum = T::ZERO;
        for body in self.entries.values() {
            sum += body.length;
        }
        sum
    }

    /// Snapshot of the physical keys, for iteration under mutation.
    #[must_use]
    pub fn physical_keys(&self) -> Vec<T> {
        self.entries.keys().copied().collect()
    }

    // ── Insertion ───────────────────────────────────────────────────────────

    /// Insert an extent, coalescing with its neighbours where the physicals
    /// touch, the logicals touch by the same delta and the tags agree.
    ///
    /// Fails with `Internal` if the extent would overlap an existing one.
    pub fn insert(&mut self, physical: T, logical: T, length: T, tag: ExtentTag) -> Result<()> {
        if length == T::ZERO {
            return Ok(());
        }
        if let Some((&left_p, left)) = self.entries.range(..=physical).next_back() {
            if left_p + left.length > physical {
                return Err(ReblockError::Internal(format!(
                    "extent ({physical}, {logical}, {length}) overlaps ({left_p}, {}, {})",
                    left.logical, left.length
                )));
            }
        }
        if let Some((&right_p, right)) = self.entries.range(physical..).next() {
            if physical + length > right_p {
                return Err(ReblockError::Internal(format!(
                    "extent ({physical}, {logical}, {length}) overlaps ({right_p}, {}, {})",
                    right.logical, right.length
                )));
            }
        }
        self.insert_coalescing(physical, logical, length, tag);
        Ok(())
    }

    /// Insert an extent the caller has already proven disjoint from every
    /// existing entry. Still coalesces with neighbours.
    pub fn insert_disjoint(&mut self, physical: T, logical: T, length: T, tag: ExtentTag) {
        if length == T::ZERO {
            return;
        }
        debug_assert!(
            self.entries
                .range(..=physical)
                .next_back()
                .map_or(true, |(&p, b)| p + b.length <= physical),
            "insert_disjoint: overlap on the left at {physical}"
        );
        debug_assert!(
            self.entries
                .range(physical..)
                .next()
                .map_or(true, |(&p, _)| physical + length <= p),
            "insert_disjoint: overlap on the right at {physical}"
        );
        self.insert_coalescing(physical, logical, length, tag);
    }

    fn insert_coalescing(&mut self, physical: T, logical: T, length: T, tag: ExtentTag) {
        let mut physical = physical;
        let mut logical = logical;
        let mut length = length;

        if let Some((&left_p, left)) = self.entries.range(..physical).next_back() {
            if left_p + left.length == physical
                && left.logical + left.length == logical
                && left.tag == tag
            {
                physical = left_p;
                logical = left.logical;
                length += left.length;
                self.entries.remove(&left_p);
            }
        }
        if let Some((&right_p, right)) = self.entries.range(physical..).next() {
            if physical + length == right_p
                && logical + length == right.logical
                && right.tag == tag
            {
                length += right.length;
                self.entries.remove(&right_p);
            }
        }
        self.entries.insert(
            physical,
            Body {
                logical,
                length,
                tag,
            },
        );
    }

    // ── Removal ─────────────────────────────────────────────────────────────

    /// Remove the range `(physical, logical, length)` from the entry that
    /// contains it, splitting the entry into up to two remainders.
    ///
    /// The logical mapping must be consistent with the containing entry;
    /// fails with `Internal` otherwise.
    pub fn remove(&mut self, physical: T, logical: T, length: T) -> Result<()> {
        if length == T::ZERO {
            return Ok(());
        }
        let containing = self
            .entries
            .range(..=physical)
            .next_back()
            .map(|(&p, &body)| (p, body))
            .filter(|&(p, body)| physical + length <= p + body.length);
        let Some((entry_p, entry)) = containing else {
            return Err(ReblockError::Internal(format!(
                "no extent contains range ({physical}, {logical}, {length})"
            )));
        };
        let offset = physical - entry_p;
        if entry.logical + offset != logical {
            return Err(ReblockError::Internal(format!(
                "logical mismatch removing ({physical}, {logical}, {length}) from \
                 ({entry_p}, {}, {})",
                entry.logical, entry.length
            )));
        }

        self.entries.remove(&entry_p);
        if offset > T::ZERO {
            self.entries.insert(
                entry_p,
                Body {
                    logical: entry.logical,
                    length: offset,
                    tag: entry.tag,
                },
            );
        }
        let consumed = offset + length;
        if consumed < entry.length {
            self.entries.insert(
                entry_p + consumed,
                Body {
                    logical: entry.logical + consumed,
                    length: entry.length - consumed,
                    tag: entry.tag,
                },
            );
        }
        Ok(())
    }

    /// Remove a whole extent previously obtained from this map.
    pub fn remove_extent(&mut self, extent: &Extent<T>) -> Result<()> {
        self.remove(extent.physical, extent.logical, extent.length)
    }

    /// Shrink the front of the entry keyed at `physical` by `length` blocks,
    /// advancing its physical and logical; erases the entry when the whole
    /// length is consumed.
    pub fn remove_front(&mut self, physical: T, length: T) -> Result<()> {
        if length == T::ZERO {
            return Ok(());
        }
        let entry = self.entries.remove(&physical).ok_or_else(|| {
            ReblockError::Internal(format!("no extent keyed at {physical} to shrink"))
        })?;
        if length > entry.length {
            self.entries.insert(physical, entry);
            return Err(ReblockError::Internal(format!(
                "cannot shrink extent at {physical} (length {}) by {length}",
                entry.length
            )));
        }
        if length < entry.length {
            self.entries.insert(
                physical + length,
                Body {
                    logical: entry.logical + length,
                    length: entry.length - length,
                    tag: entry.tag,
                },
            );
        }
        Ok(())
    }

    /// Subtract `other` from self over physical coordinates. Every extent of
    /// `other` must be a sub-range of a single entry of self with a
    /// consistent logical mapping.
    pub fn remove_all(&mut self, other: &Self) -> Result<()> {
        for extent in other.iter() {
            self.remove(extent.physical, extent.logical, extent.length)?;
        }
        Ok(())
    }

    /// Set-theoretic union assuming disjointness.
    pub fn append_all(&mut self, other: &Self) -> Result<()> {
        for extent in other.iter() {
            self.insert(extent.physical, extent.logical, extent.length, extent.tag)?;
        }
        Ok(())
    }

    // ── Stat-tracking mutators ──────────────────────────────────────────────

    /// Insert and grow `used_count` by `length`.
    pub fn stat_insert(&mut self, physical: T, logical: T, length: T, tag: ExtentTag) -> Result<()> {
        self.insert(physical, logical, length, tag)?;
        self.used_count += length;
        Ok(())
    }

    /// Remove a (possibly partial) range and shrink `used_count`.
    pub fn stat_remove(&mut self, physical: T, logical: T, length: T) -> Result<()> {
        self.remove(physical, logical, length)?;
        self.used_count -= length;
        Ok(())
    }

    /// Shrink the front of the entry at `physical` and shrink `used_count`.
    pub fn stat_remove_front(&mut self, physical: T, length: T) -> Result<()> {
        self.remove_front(physical, length)?;
        self.used_count -= length;
        Ok(())
    }

    // ── Complements ─────────────────────────────────────────────────────────

    /// Fill self with the block-unit logical complement of `src` inside
    /// `[0, device_bytes >> shift)`. Every produced extent has
    /// `physical == logical`. Self must be empty; `src` must be sorted by
    /// logical and non-overlapping.
    pub fn complement0_logical_shift(
        &mut self,
        src: &[ByteExtent],
        shift: u32,
        device_bytes: u64,
    ) -> Result<()> {
        self.complement0_shift(src, shift, device_bytes, |e| e.logical)
    }

    /// Physical-coordinate analogue of [`Self::complement0_logical_shift`];
    /// `src` must be sorted by physical.
    pub fn complement0_physical_shift(
        &mut self,
        src: &[ByteExtent],
        shift: u32,
        device_bytes: u64,
    ) -> Result<()> {
        self.complement0_shift(src, shift, device_bytes, |e| e.physical)
    }

    fn complement0_shift(
        &mut self,
        src: &[ByteExtent],
        shift: u32,
        device_bytes: u64,
        coord: impl Fn(&ByteExtent) -> u64,
    ) -> Result<()> {
        if !self.is_empty() {
            return Err(ReblockError::Internal(
                "complement target map is not empty".to_owned(),
            ));
        }
        // The trailing partial block, if any, is excluded.
        let device_blocks = device_bytes >> shift;
        let mut prev_end = 0_u64;

        for extent in src {
            if extent.length == 0 {
                continue;
            }
            let start = coord(extent) >> shift;
            let length = extent.length >> shift;
            if start < prev_end {
                return Err(ReblockError::Internal(format!(
                    "complement input unsorted or overlapping at block {start}"
                )));
            }
            let end = start
                .checked_add(length)
                .filter(|&end| end <= device_blocks)
                .ok_or_else(|| {
                    ReblockError::Internal(format!(
                        "extent at block {start} (length {length}) exceeds device ({device_blocks} blocks)"
                    ))
                })?;
            if start > prev_end {
                let (p, l) = (narrow::<T>(prev_end)?, narrow::<T>(prev_end)?);
                self.insert_disjoint(p, l, narrow::<T>(start - prev_end)?, ExtentTag::Default);
            }
            prev_end = end;
        }
        if prev_end < device_blocks {
            let p = narrow::<T>(prev_end)?;
            self.insert_disjoint(p, p, narrow::<T>(device_blocks - prev_end)?, ExtentTag::Default);
        }
        Ok(())
    }

    // ── Intersection ────────────────────────────────────────────────────────

    /// Fill self with the intersection of `a` and `b`. Result extents take
    /// the logical mapping and tag of the first map. Self must be empty.
    pub fn intersect_all_all(&mut self, a: &Self, b: &Self, mode: IntersectMode) -> Result<()> {
        if !self.is_empty() {
            return Err(ReblockError::Internal(
                "intersection target map is not empty".to_owned(),
            ));
        }
        let mut a_iter = a.entries.iter().peekable();
        let mut b_iter = b.entries.iter().peekable();

        while let (Some(a_peek), Some(b_peek)) = (a_iter.peek(), b_iter.peek()) {
            let (a_p, a_body) = (*a_peek.0, *a_peek.1);
            let (b_p, b_body) = (*b_peek.0, *b_peek.1);
            let a_end = a_p + a_body.length;
            let b_end = b_p + b_body.length;
            let start = a_p.max(b_p);
            let end = a_end.min(b_end);

            if start < end {
                // In Both mode the two mappings must agree on logical-physical
                // delta, i.e. a.logical - a.physical == b.logical - b.physical.
                let same_delta = a_body.logical + b_p == b_body.logical + a_p;
                if mode == IntersectMode::Physical1 || same_delta {
                    self.insert_disjoint(
                        start,
                        a_body.logical + (start - a_p),
                        end - start,
                        a_body.tag,
                    );
                }
            }
            if a_end <= b_end {
                a_iter.next();
            } else {
                b_iter.next();
            }
        }
        Ok(())
    }

    // ── Transpose ───────────────────────────────────────────────────────────

    /// Build the transpose of `other`: the identical extent set keyed by
    /// logical coordinate. Self must be empty.
    pub fn transpose_of(&mut self, other: &Self) -> Result<()> {
        if !self.is_empty() {
            return Err(ReblockError::Internal(
                "transpose target map is not empty".to_owned(),
            ));
        }
        for extent in other.iter() {
            self.insert(extent.logical, extent.physical, extent.length, extent.tag)?;
        }
        Ok(())
    }
}

fn narrow<T: BlockIdx>(value: u64) -> Result<T> {
    T::from_u64(value)
        .ok_or_else(|| ReblockError::Overflow(format!("block count {value} exceeds index width")))
}
