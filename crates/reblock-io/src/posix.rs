//! File-backed I/O.
//!
//! The device is a regular file or pre-sized image opened read-write.
//! Storage-relative offsets address the concatenation of the primary
//! storage extents (regions of the device itself, in physical order)
//! followed by the secondary storage file; copies move through the bounded
//! memory buffer with positioned reads and writes.

use crate::{CopyDir, RelocIo, StorageSizeKey};
use reblock_error::{ReblockError, Result};
use reblock_types::ByteExtent;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
enum Place {
    Dev(u64),
    Secondary(u64),
}

#[derive(Debug, Clone, Copy)]
struct Span {
    place: Place,
    len: u64,
}

/// File-backed implementation of [`RelocIo`].
#[derive(Debug)]
pub struct FileIo {
    dev: File,
    dev_path: String,
    dev_length: u64,
    block_log2: u32,
    simulate: bool,
    primary_storage: Vec<ByteExtent>,
    sizes: [u64; 4],
    secondary_path: PathBuf,
    secondary: Option<File>,
    secondary_bytes: u64,
    buffer: Vec<u8>,
}

impl FileIo {
    /// Open a device image. `secondary_path` is where secondary storage is
    /// created if [`RelocIo::create_storage`] asks for any. In simulate mode
    /// the device is opened read-only and no data moves.
    pub fn open(
        dev_path: &Path,
        block_log2: u32,
        secondary_path: &Path,
        simulate: bool,
    ) -> Result<Self> {
        if block_log2 >= 48 {
            return Err(ReblockError::Overflow(format!(
                "effective block size log2 {block_log2} is not plausible"
            )));
        }
        let dev = OpenOptions::new()
            .read(true)
            .write(!simulate)
            .open(dev_path)?;
        let dev_length = dev.metadata()?.len();
        debug!(
            target: "reblock::io",
            path = %dev_path.display(),
            bytes = dev_length,
            block_log2,
            simulate,
            "device open"
        );
        Ok(Self {
            dev,
            dev_path: dev_path.display().to_string(),
            dev_length,
            block_log2,
            simulate,
            primary_storage: Vec::new(),
            sizes: [0; 4],
            secondary_path: secondary_path.to_path_buf(),
            secondary: None,
            secondary_bytes: 0,
            buffer: Vec::new(),
        })
    }

    fn block_size(&self) -> u64 {
        1_u64 << self.block_log2
    }

    /// One span on the device, bounds-checked.
    fn dev_span(&self, offset: u64, len: u64) -> Result<Span> {
        if offset.checked_add(len).map_or(true, |end| end > self.dev_length) {
            return Err(ReblockError::Internal(format!(
                "device range [{offset}, {offset}+{len}) exceeds {} bytes",
                self.dev_length
            )));
        }
        Ok(Span {
            place: Place::Dev(offset),
            len,
        })
    }

    /// Resolve a storage-relative byte range into device and secondary-file
    /// spans through the primary-extent concatenation.
    fn storage_spans(&self, mut offset: u64, mut len: u64) -> Result<Vec<Span>> {
        let mut spans = Vec::new();
        let mut pos = 0_u64;
        for extent in &self.primary_storage {
            let extent_end = pos + extent.length;
            if len > 0 && offset < extent_end {
                let within = offset - pos;
                let take = (extent.length - within).min(len);
                spans.push(Span {
                    place: Place::Dev(extent.physical + within),
                    len: take,
                });
                offset += take;
                len -= take;
            }
            pos = extent_end;
        }
        if len > 0 {
            let secondary_off = offset - pos;
            if secondary_off
                .checked_add(len)
                .map_or(true, |end| end > self.secondary_bytes)
            {
                return Err(ReblockError::Internal(format!(
                    "storage range spills {len} bytes past secondary storage \
                     ({} bytes)",
                    self.secondary_bytes
                )));
            }
            spans.push(Span {
                place: Place::Secondary(secondary_off),
                len,
            });
        }
        Ok(spans)
    }

    fn read_place(&self, place: Place, offset: u64, buf: &mut [u8]) -> Result<()> {
        match place {
            Place::Dev(base) => self.dev.read_exact_at(buf, base + offset)?,
            Place::Secondary(base) => self
                .secondary
                .as_ref()
                .ok_or_else(|| {
                    ReblockError::Internal("secondary storage not created".to_owned())
                })?
                .read_exact_at(buf, base + offset)?,
        }
        Ok(())
    }

    fn write_place(&self, place: Place, offset: u64, buf: &[u8]) -> Result<()> {
        match place {
            Place::Dev(base) => self.dev.write_all_at(buf, base + offset)?,
            Place::Secondary(base) => self
                .secondary
                .as_ref()
                .ok_or_else(|| {
                    ReblockError::Internal("secondary storage not created".to_owned())
                })?
                .write_all_at(buf, base + offset)?,
        }
        Ok(())
    }

    fn copy_spans(&self, src: &[Span], dst: &[Span], total: u64, buffer: &mut [u8]) -> Result<()> {
        let mut src_idx = 0;
        let mut dst_idx = 0;
        let mut src_off = 0_u64;
        let mut dst_off = 0_u64;
        let mut remaining = total;

        while remaining > 0 {
            let src_span = src[src_idx];
            let dst_span = dst[dst_idx];
            let chunk = (src_span.len - src_off)
                .min(dst_span.len - dst_off)
                .min(buffer.len() as u64)
                .min(remaining);
            let chunk_usize = usize::try_from(chunk).map_err(|_| {
                ReblockError::Overflow(format!("copy chunk {chunk} exceeds address space"))
            })?;
            let chunk_buf = &mut buffer[..chunk_usize];

            self.read_place(src_span.place, src_off, chunk_buf)?;
            self.write_place(dst_span.place, dst_off, chunk_buf)?;

            src_off += chunk;
            if src_off == src_span.len {
                src_idx += 1;
                src_off = 0;
            }
            dst_off += chunk;
            if dst_off == dst_span.len {
                dst_idx += 1;
                dst_off = 0;
            }
            remaining -= chunk;
        }
        Ok(())
    }
}

impl RelocIo for FileIo {
    fn effective_block_size_log2(&self) -> u32 {
        self.block_log2
    }

    fn dev_length(&self) -> u64 {
        self.dev_length
    }

    fn dev_path(&self) -> &str {
        &self.dev_path
    }

    fn is_open(&self) -> bool {
        true
    }

    fn simulate_run(&self) -> bool {
        self.simulate
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
        self.secondary_bytes = secondary_bytes;
        if self.simulate {
            debug!(
                target: "reblock::io",
                secondary_bytes,
                mem_buffer_bytes,
                "SIMULATED storage creation"
            );
            return Ok(());
        }

        let buffer_len = usize::try_from(mem_buffer_bytes).map_err(|_| {
            ReblockError::Overflow(format!(
                "memory buffer of {mem_buffer_bytes} bytes exceeds address space"
            ))
        })?;
        self.buffer = vec![0_u8; buffer_len.max(1)];

        if secondary_bytes > 0 {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.secondary_path)?;
            file.set_len(secondary_bytes)?;
            debug!(
                target: "reblock::io",
                path = %self.secondary_path.display(),
                bytes = secondary_bytes,
                "secondary storage created"
            );
            self.secondary = Some(file);
        }
        Ok(())
    }

    fn copy(&mut self, dir: CopyDir, from_phys: u64, to_phys: u64, length: u64) -> Result<()> {
        let bytes = length << self.block_log2;
        let from_bytes = from_phys << self.block_log2;
        let to_bytes = to_phys << self.block_log2;

        let (src, dst) = match dir {
            CopyDir::Dev2Dev => (
                vec![self.dev_span(from_bytes, bytes)?],
                vec![self.dev_span(to_bytes, bytes)?],
            ),
            CopyDir::Dev2Storage => (
                vec![self.dev_span(from_bytes, bytes)?],
                self.storage_spans(to_bytes, bytes)?,
            ),
            CopyDir::Storage2Dev => (
                self.storage_spans(from_bytes, bytes)?,
                vec![self.dev_span(to_bytes, bytes)?],
            ),
        };

        trace!(
            target: "reblock::io",
            ?dir,
            from = from_phys,
            to = to_phys,
            blocks = length,
            "copy"
        );
        if self.simulate {
            return Ok(());
        }

        let mut buffer = std::mem::take(&mut self.buffer);
        if buffer.is_empty() {
            buffer = vec![
                0_u8;
                usize::try_from(self.block_size()).map_err(|_| ReblockError::Overflow(
                    "block size exceeds address space".to_owned()
                ))?
            ];
        }
        let result = self.copy_spans(&src, &dst, bytes, &mut buffer);
        self.buffer = buffer;
        result
    }

    fn flush(&mut self) -> Result<()> {
        if self.simulate {
            return Ok(());
        }
        self.dev.sync_data()?;
        if let Some(secondary) = &self.secondary {
            secondary.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const B: u32 = 9; // 512-byte blocks

    fn make_device(blocks: u64) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.img");
        let mut file = File::create(&path).unwrap();
        // Every block filled with its own index, so misdirected copies show.
        for i in 0..blocks {
            let fill = u8::try_from(i % 251).unwrap();
            file.write_all(&vec![fill; 1 << B]).unwrap();
        }
        file.sync_all().unwrap();
        (dir, path)
    }

    fn block_at(path: &Path, index: u64) -> Vec<u8> {
        let file = File::open(path).unwrap();
        let mut buf = vec![0_u8; 1 << B];
        file.read_exact_at(&mut buf, index << B).unwrap();
        buf
    }

    fn open_io(dir: &tempfile::TempDir, path: &Path) -> FileIo {
        FileIo::open(path, B, &dir.path().join("secondary.bin"), false).unwrap()
    }

    #[test]
    fn dev2dev_copy_moves_blocks() {
        let (dir, path) = make_device(16);
        let mut io = open_io(&dir, &path);
        io.create_storage(0, 4096).unwrap();

        io.copy(CopyDir::Dev2Dev, 2, 10, 2).unwrap();
        io.flush().unwrap();

        assert_eq!(block_at(&path, 10), vec![2_u8; 1 << B]);
        assert_eq!(block_at(&path, 11), vec![3_u8; 1 << B]);
        // Source untouched.
        assert_eq!(block_at(&path, 2), vec![2_u8; 1 << B]);
    }

    #[test]
    fn storage_spans_fragmented_primary_then_secondary() {
        let (dir, path) = make_device(32);
        let mut io = open_io(&dir, &path);
        // Two primary fragments of 2 blocks each at device blocks 20 and 28,
        // then 4 blocks of secondary.
        io.primary_storage().push(ByteExtent::new(20 << B, 20 << B, 2 << B));
        io.primary_storage().push(ByteExtent::new(28 << B, 28 << B, 2 << B));
        io.create_storage(4 << B, 1 << B).unwrap();

        // 6 blocks from device block 0 into storage offset 0: fills both
        // primary fragments and spills 2 blocks into the secondary file.
        io.copy(CopyDir::Dev2Storage, 0, 0, 6).unwrap();
        io.flush().unwrap();

        assert_eq!(block_at(&path, 20), vec![0_u8; 1 << B]);
        assert_eq!(block_at(&path, 21), vec![1_u8; 1 << B]);
        assert_eq!(block_at(&path, 28), vec![2_u8; 1 << B]);
        assert_eq!(block_at(&path, 29), vec![3_u8; 1 << B]);
        let secondary = dir.path().join("secondary.bin");
        assert_eq!(block_at(&secondary, 0), vec![4_u8; 1 << B]);
        assert_eq!(block_at(&secondary, 1), vec![5_u8; 1 << B]);

        // And back out again to a different device position.
        io.copy(CopyDir::Storage2Dev, 4, 8, 2).unwrap();
        io.flush().unwrap();
        assert_eq!(block_at(&path, 8), vec![4_u8; 1 << B]);
        assert_eq!(block_at(&path, 9), vec![5_u8; 1 << B]);
    }

    #[test]
    fn copy_chunks_through_small_buffer() {
        let (dir, path) = make_device(16);
        let mut io = open_io(&dir, &path);
        // Buffer smaller than one block forces multiple chunks per span.
        io.create_storage(0, 100).unwrap();

        io.copy(CopyDir::Dev2Dev, 0, 12, 4).unwrap();
        for i in 0..4_u64 {
            assert_eq!(block_at(&path, 12 + i), vec![u8::try_from(i).unwrap(); 1 << B]);
        }
    }

    #[test]
    fn out_of_bounds_copy_is_rejected() {
        let (dir, path) = make_device(8);
        let mut io = open_io(&dir, &path);
        io.create_storage(0, 4096).unwrap();

        assert!(io.copy(CopyDir::Dev2Dev, 6, 0, 4).is_err());
        assert!(io.copy(CopyDir::Dev2Storage, 0, 0, 1).is_err());
    }

    #[test]
    fn simulate_moves_nothing() {
        let (dir, path) = make_device(8);
        let secondary = dir.path().join("secondary.bin");
        let mut io = FileIo::open(&path, B, &secondary, true).unwrap();
        io.create_storage(4 << B, 4096).unwrap();

        io.copy(CopyDir::Dev2Dev, 0, 4, 2).unwrap();
        io.flush().unwrap();

        assert_eq!(block_at(&path, 4), vec![4_u8; 1 << B]);
        assert!(!secondary.exists());
    }
}
