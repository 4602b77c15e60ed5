//! Storage sizing: pick primary/secondary/buffer sizes and hand the chosen
//! primary-storage extents to the I/O layer.
//!
//! Primary storage lives on the device itself (invariant free space found
//! by the planner); secondary storage is a file created by the I/O layer
//! when primary is insufficient. The exact condition ladder matters: an
//! explicit secondary size acts as a floor even when the total is
//! auto-sized.

use crate::{narrow, show, Relocation};
use reblock_error::{ReblockError, Result};
use reblock_io::StorageSizeKey;
use reblock_types::{
    align_up, pretty_size, sort_by_physical, sort_by_reverse_length, BlockIdx, ByteExtent,
    ExtentTag,
};
use tracing::{info, warn};

/// Memory characteristics of the host, supplied by the caller.
///
/// Detection stays outside the core: the CLI fills `free_ram` from the
/// system and leaves `page_size` at the common default when it cannot be
/// determined.
#[derive(Debug, Clone, Copy)]
pub struct MemInfo {
    /// Free RAM in bytes; `None` when unknown.
    pub free_ram: Option<u64>,
    /// System page size in bytes (power of two).
    pub page_size: u64,
}

impl Default for MemInfo {
    fn default() -> Self {
        Self {
            free_ram: None,
            page_size: 4096,
        }
    }
}

const MIB: u64 = 1 << 20;
const ADDR_MAX: u64 = usize::MAX as u64;

/// Fallback free-RAM assumption when detection fails.
fn free_ram_fallback() -> u64 {
    if cfg!(target_pointer_width = "32") {
        48 * MIB
    } else {
        768 * MIB
    }
}

fn misaligned(which: &str, requested: u64, constraint: &str, alignment: u64) -> ReblockError {
    ReblockError::Overflow(format!(
        "cannot use job {which} length = {requested} bytes, it is incompatible with \
         {constraint} = {alignment} bytes; the job was probably configured for a \
         different platform"
    ))
}

impl<T: BlockIdx> Relocation<'_, T> {
    /// Size primary/secondary storage and the memory buffer, then create
    /// the secondary storage through the I/O layer. Must run between
    /// `analyze` and `relocate`.
    pub fn create_storage(&mut self) -> Result<()> {
        let shift = self.io.effective_block_size_log2();
        let block_mask = (1_u64 << shift) - 1;
        let page_mask = self.mem.page_size - 1;

        let free_ram_or_0 = self.mem.free_ram.unwrap_or(0);
        let free_ram_or_min = if free_ram_or_0 != 0 {
            free_ram_or_0
        } else {
            free_ram_fallback()
        };

        let avail_primary_len = self.storage_map.total_count().to_u64() << shift;
        let mut avail_primary_size = avail_primary_len.min(ADDR_MAX);
        let mut auto_total_size = 0_u64;

        let req_mem_buffer = self.io.storage_size(StorageSizeKey::MemBuffer);
        let mut req_secondary = self.io.storage_size(StorageSizeKey::SecondaryStorage);
        let req_primary_exact = self.io.storage_size(StorageSizeKey::PrimaryStorageExact);
        let req_secondary_exact = self.io.storage_size(StorageSizeKey::SecondaryStorageExact);

        if req_primary_exact != 0
            && req_secondary_exact != 0
            && req_secondary_exact > ADDR_MAX - req_primary_exact
        {
            return Err(ReblockError::Overflow(format!(
                "requested primary-storage + secondary-storage exact sizes ({} + {}) \
                 overflow addressable memory",
                pretty_size(req_primary_exact),
                pretty_size(req_secondary_exact)
            )));
        }
        let req_total_exact = req_primary_exact + req_secondary_exact;

        if free_ram_or_0 == 0 {
            warn!(target: "reblock::storage", "cannot detect free RAM amount");
        }

        if req_total_exact != 0 || req_secondary != 0 {
            // Honour the requested storage size, but warn if it may exhaust
            // free RAM.
            let (req_len, req_label) = if req_total_exact != 0 {
                (req_total_exact, "storage")
            } else {
                (req_secondary, "secondary-storage")
            };
            if free_ram_or_0 == 0 {
                warn!(
                    target: "reblock::storage",
                    "no idea if the {} requested for mmapped {req_label} will fit into free RAM",
                    pretty_size(req_len)
                );
                warn!(
                    target: "reblock::storage",
                    "continuing, but troubles (memory exhaustion) are possible"
                );
            } else if req_len >= free_ram_or_0 / 2 {
                warn!(
                    target: "reblock::storage",
                    "using {} as requested for {req_label}, but only {} RAM is free",
                    pretty_size(req_len),
                    pretty_size(free_ram_or_0)
                );
                warn!(
                    target: "reblock::storage",
                    "honoring the request, but expect troubles (memory exhaustion)"
                );
            }
        }
        if req_total_exact == 0 {
            // Auto-size the total: the smaller of 2/3 free RAM and 1/8 of
            // the bytes to relocate, rounded up to 1 MiB.
            if req_secondary == 0 && free_ram_or_0 == 0 {
                warn!(
                    target: "reblock::storage",
                    "assuming at least {} RAM is free; expect troubles (memory exhaustion) if not",
                    pretty_size(free_ram_or_min)
                );
            }
            let work_bytes = self.dev_map.used_count().to_u64() << shift;
            let work_bytes_eighth = work_bytes.div_ceil(8);
            let total_len = (free_ram_or_min / 3 * 2).min(work_bytes_eighth);
            let total_len = align_up(total_len, MIB).ok_or_else(|| {
                ReblockError::Overflow("auto storage size overflows when rounded".to_owned())
            })?;
            auto_total_size = total_len.min(ADDR_MAX);
        }

        let mut mem_buffer_size = if req_mem_buffer != 0 {
            if free_ram_or_0 == 0 {
                warn!(
                    target: "reblock::storage",
                    "no idea if the {} requested for the memory buffer will fit into free RAM",
                    pretty_size(req_mem_buffer)
                );
            } else if req_mem_buffer >= free_ram_or_0 / 2 {
                warn!(
                    target: "reblock::storage",
                    "using {} as requested for the memory buffer, but only {} RAM is free",
                    pretty_size(req_mem_buffer),
                    pretty_size(free_ram_or_0)
                );
            }
            req_mem_buffer
        } else {
            let work_bytes = self.dev_map.used_count().to_u64() << shift;
            ADDR_MAX.min((free_ram_or_min / 4).min(work_bytes))
        };

        // Round everything down to the page size, then to the effective
        // block size; explicit exact sizes must already be aligned to both.
        mem_buffer_size &= !page_mask;
        auto_total_size &= !page_mask;
        avail_primary_size &= !page_mask;
        req_secondary &= !page_mask;
        if req_primary_exact & page_mask != 0 {
            return Err(misaligned(
                "primary-storage exact",
                req_primary_exact,
                "system PAGE_SIZE",
                page_mask + 1,
            ));
        }
        if req_secondary_exact & page_mask != 0 {
            return Err(misaligned(
                "secondary-storage exact",
                req_secondary_exact,
                "system PAGE_SIZE",
                page_mask + 1,
            ));
        }

        mem_buffer_size &= !block_mask;
        auto_total_size &= !block_mask;
        avail_primary_size &= !block_mask;
        req_secondary &= !block_mask;
        if req_primary_exact & block_mask != 0 {
            return Err(misaligned(
                "primary-storage exact",
                req_primary_exact,
                "device effective block size",
                block_mask + 1,
            ));
        }
        if req_secondary_exact & block_mask != 0 {
            return Err(misaligned(
                "secondary-storage exact",
                req_secondary_exact,
                "device effective block size",
                block_mask + 1,
            ));
        }

        // Clamp the non-mandatory parameters to a quarter of the address
        // space, keeping both alignments.
        let mem_max = ((ADDR_MAX >> 2) + 1) & !page_mask & !block_mask;
        mem_buffer_size = mem_buffer_size.min(mem_max);
        auto_total_size = auto_total_size.min(mem_max);
        avail_primary_size = avail_primary_size.min(mem_max);
        req_secondary = req_secondary.min(mem_max);

        if req_total_exact == 0 && req_secondary == 0 && auto_total_size == 0 {
            auto_total_size = (page_mask | block_mask) + 1;
            warn!(
                target: "reblock::storage",
                "storage size to use would be 0 bytes, increasing to {}",
                pretty_size(auto_total_size)
            );
        }
        if mem_buffer_size == 0 {
            mem_buffer_size = (page_mask | block_mask) + 1;
            warn!(
                target: "reblock::storage",
                "memory buffer size to use would be 0 bytes, increasing to {}",
                pretty_size(mem_buffer_size)
            );
        }

        let primary_size = if req_primary_exact > avail_primary_size {
            return Err(ReblockError::NoSpace(format!(
                "available primary-storage is only {} bytes ({}), too small for the \
                 requested {} bytes ({})",
                avail_primary_size,
                pretty_size(avail_primary_size),
                req_primary_exact,
                pretty_size(req_primary_exact)
            )));
        } else if req_primary_exact != 0 {
            req_primary_exact
        } else {
            avail_primary_size.min(auto_total_size)
        };

        let secondary_size = if req_secondary_exact != 0 {
            req_secondary_exact
        } else if req_secondary != 0 {
            req_secondary
        } else {
            auto_total_size.saturating_sub(primary_size)
        };

        self.io
            .set_storage_size(StorageSizeKey::MemBuffer, mem_buffer_size);
        self.io
            .set_storage_size(StorageSizeKey::PrimaryStorageExact, primary_size);
        self.io
            .set_storage_size(StorageSizeKey::SecondaryStorageExact, secondary_size);

        self.fill_io_primary_storage(primary_size)?;

        self.io.create_storage(secondary_size, mem_buffer_size)
    }

    /// Hand the primary-storage extents actually used to the I/O layer.
    ///
    /// When only a fraction of the available primary storage is wanted, the
    /// smallest extents are dropped first (one final extent may be shrunk
    /// instead, keeping its front), and `storage_map` is rebuilt to match.
    fn fill_io_primary_storage(&mut self, primary_bytes: u64) -> Result<()> {
        let shift = self.io.effective_block_size_log2();
        let block_size = 1_u64 << shift;
        debug_assert!(primary_bytes & (block_size - 1) == 0);

        let mut list: Vec<ByteExtent> = self
            .storage_map
            .iter()
            .map(|extent| ByteExtent {
                physical: extent.physical.to_u64() << shift,
                logical: extent.logical.to_u64() << shift,
                length: extent.length.to_u64() << shift,
                user_data: 0,
            })
            .collect();

        let available = self.storage_map.total_count().to_u64() << shift;
        if available > primary_bytes {
            let mut extra = available - primary_bytes;
            sort_by_reverse_length(&mut list);
            while extra != 0 {
                let Some(last) = list.last_mut() else { break };
                if last.length <= extra {
                    extra -= last.length;
                    list.pop();
                } else {
                    last.length -= extra;
                    extra = 0;
                }
            }
            sort_by_physical(&mut list);

            self.storage_map.clear();
            for extent in &list {
                self.storage_map.insert_disjoint(
                    narrow(extent.physical >> shift)?,
                    narrow(extent.logical >> shift)?,
                    narrow(extent.length >> shift)?,
                    ExtentTag::Default,
                );
            }
        }
        self.storage_map
            .set_total_count(narrow(primary_bytes >> shift)?);

        info!(
            target: "reblock::storage",
            fragments = list.len(),
            "primary-storage: actually using {} from the device",
            pretty_size(primary_bytes)
        );
        show("primary-storage", " (actually used)", block_size, &self.storage_map);

        *self.io.primary_storage() = list;
        Ok(())
    }
}
