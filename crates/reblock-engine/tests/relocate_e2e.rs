//! End-to-end relocation over a real device image.
//!
//! Builds a device file with recognisable per-block content, drives the
//! whole engine through `FileIo` (extent lists round-tripped through the
//! extent-file format on the way in), and verifies the final byte-level
//! permutation: every target-filesystem logical block at its physical
//! position, every displaced device block at its renumbered hole.

use reblock_engine::MemInfo;
use reblock_io::{load_extents_from_path, save_extents_to_path, FileIo, RelocIo};
use reblock_types::ByteExtent;
use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

const B: u32 = 9; // 512-byte blocks
const DEV_BLOCKS: u64 = 32;

fn fill(block: u64) -> u8 {
    u8::try_from(block % 251).unwrap()
}

fn make_device(dir: &Path) -> PathBuf {
    let path = dir.join("device.img");
    let mut file = File::create(&path).unwrap();
    for i in 0..DEV_BLOCKS {
        file.write_all(&vec![fill(i); 1 << B]).unwrap();
    }
    file.sync_all().unwrap();
    path
}

fn block_at(path: &Path, index: u64) -> Vec<u8> {
    let file = File::open(path).unwrap();
    let mut buf = vec![0_u8; 1 << B];
    file.read_exact_at(&mut buf, index << B).unwrap();
    buf
}

fn mem() -> MemInfo {
    MemInfo {
        free_ram: Some(1 << 30),
        page_size: 4096,
    }
}

/// Layout under test, in 512-byte blocks:
///
/// - loop file at physical [20, 28) holds target-filesystem logical [0, 8);
/// - free space at [0, 4) and [28, 32);
/// - source-filesystem data at [4, 20), of which [8, 20) is already inside
///   a loop-hole (invariant) and [4, 8) must be renumbered.
fn extent_lists(dir: &Path) -> (Vec<ByteExtent>, Vec<ByteExtent>) {
    let loop_path = dir.join("loop.extents");
    let free_path = dir.join("free.extents");
    save_extents_to_path(&loop_path, &[ByteExtent::new(20 << B, 0, 8 << B)]).unwrap();
    save_extents_to_path(
        &free_path,
        &[
            ByteExtent::new(0, 0, 4 << B),
            ByteExtent::new(28 << B, 28 << B, 4 << B),
        ],
    )
    .unwrap();

    let mut loop_extents = Vec::new();
    let mut free_extents = Vec::new();
    let mut bitmask = 0;
    load_extents_from_path(&loop_path, &mut loop_extents, &mut bitmask).unwrap();
    load_extents_from_path(&free_path, &mut free_extents, &mut bitmask).unwrap();
    // Every recorded value is 512-aligned.
    assert_eq!(bitmask & ((1 << B) - 1), 0);
    (loop_extents, free_extents)
}

#[test]
fn relocation_permutes_the_device_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let dev_path = make_device(dir.path());
    let (loop_extents, free_extents) = extent_lists(dir.path());

    let mut io = FileIo::open(&dev_path, B, &dir.path().join("secondary.bin"), false).unwrap();
    reblock_engine::run(loop_extents, free_extents, &mut io, mem()).unwrap();
    drop(io);

    // The loop file's logical blocks [0, 8) landed at physical [0, 8).
    for i in 0..8 {
        assert_eq!(block_at(&dev_path, i), vec![fill(20 + i); 1 << B], "block {i}");
    }
    // The invariant source-filesystem range [8, 20) was never touched.
    for i in 8..20 {
        assert_eq!(block_at(&dev_path, i), vec![fill(i); 1 << B], "block {i}");
    }
    // The displaced range [4, 8) was renumbered into the hole at [20, 24).
    for i in 20..24 {
        assert_eq!(block_at(&dev_path, i), vec![fill(i - 16); 1 << B], "block {i}");
    }
    // The tail free space stayed as it was.
    for i in 24..32 {
        assert_eq!(block_at(&dev_path, i), vec![fill(i); 1 << B], "block {i}");
    }
}

#[test]
fn simulated_relocation_leaves_the_device_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let dev_path = make_device(dir.path());
    let (loop_extents, free_extents) = extent_lists(dir.path());

    let secondary = dir.path().join("secondary.bin");
    let mut io = FileIo::open(&dev_path, B, &secondary, true).unwrap();
    reblock_engine::run(loop_extents, free_extents, &mut io, mem()).unwrap();
    drop(io);

    for i in 0..DEV_BLOCKS {
        assert_eq!(block_at(&dev_path, i), vec![fill(i); 1 << B], "block {i}");
    }
    assert!(!secondary.exists());
}

#[test]
fn exact_storage_sizes_survive_a_real_run() {
    // Force a one-page secondary storage so the executor has to alternate
    // between filling storage and draining it; the permutation must still
    // come out right.
    let dir = tempfile::tempdir().unwrap();
    let dev_path = make_device(dir.path());
    let (loop_extents, free_extents) = extent_lists(dir.path());

    let mut io = FileIo::open(&dev_path, B, &dir.path().join("secondary.bin"), false).unwrap();
    io.set_storage_size(reblock_io::StorageSizeKey::SecondaryStorageExact, 4096);
    reblock_engine::run(loop_extents, free_extents, &mut io, mem()).unwrap();
    drop(io);

    for i in 0..8 {
        assert_eq!(block_at(&dev_path, i), vec![fill(20 + i); 1 << B], "block {i}");
    }
    for i in 20..24 {
        assert_eq!(block_at(&dev_path, i), vec![fill(i - 16); 1 << B], "block {i}");
    }
}
