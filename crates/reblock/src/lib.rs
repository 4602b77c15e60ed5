#![forbid(unsafe_code)]
//! ReBlock public API facade.
//!
//! Re-exports the relocation engine, its I/O collaborators and the shared
//! value types through one crate. This is the crate downstream consumers
//! (CLI, tooling) depend on.

pub use reblock_engine::{run, MemInfo, Relocation};
pub use reblock_error::{ReblockError, Result};
pub use reblock_io::{
    load_extents, load_extents_from_path, save_extents, save_extents_to_path, CopyDir,
    CopyRecord, FileIo, RelocIo, SimIo, StorageSizeKey,
};
pub use reblock_map::{Extent, ExtentMap, HolePool, IntersectMode};
pub use reblock_types::{BlockIdx, ByteExtent, ExtentTag};
