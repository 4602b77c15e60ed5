#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reblock_engine::MemInfo;
use reblock_error::ReblockError;
use reblock_io::{load_extents_from_path, FileIo, RelocIo, StorageSizeKey};
use reblock_types::pretty_size;
use serde::Serialize;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "reblock",
    about = "ReBlock — relocate a block device in-place onto a new filesystem layout",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Relocate the device according to loop-file and free-space extents.
    Run {
        /// Device or image file to transform in place.
        #[arg(long)]
        device: PathBuf,
        /// Extent file describing the loop file (the target filesystem image).
        #[arg(long)]
        loop_extents: PathBuf,
        /// Extent file describing the source filesystem's free space.
        #[arg(long)]
        free_extents: PathBuf,
        /// Effective block size in bytes (default: derived from the extent files).
        #[arg(long, value_parser = parse_size)]
        block_size: Option<u64>,
        /// Where to create secondary storage (default: next to the device image).
        #[arg(long)]
        secondary_storage: Option<PathBuf>,
        /// Emit the full copy sequence without moving any data.
        #[arg(long)]
        simulate: bool,
        /// Memory buffer size (0 = auto; accepts K/M/G/T suffixes).
        #[arg(long, value_parser = parse_size)]
        mem_buffer_size: Option<u64>,
        /// Secondary storage size (0 = auto).
        #[arg(long, value_parser = parse_size)]
        secondary_storage_size: Option<u64>,
        /// Exact primary storage size.
        #[arg(long, value_parser = parse_size)]
        primary_storage_exact_size: Option<u64>,
        /// Exact secondary storage size.
        #[arg(long, value_parser = parse_size)]
        secondary_storage_exact_size: Option<u64>,
    },
    /// Summarise an extent file.
    Inspect {
        /// Extent file to read.
        file: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        // Engine errors carry an errno mapping; use it as the exit status.
        let code = error
            .downcast_ref::<ReblockError>()
            .map_or(1, ReblockError::to_errno);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            device,
            loop_extents,
            free_extents,
            block_size,
            secondary_storage,
            simulate,
            mem_buffer_size,
            secondary_storage_size,
            primary_storage_exact_size,
            secondary_storage_exact_size,
        } => run_cmd(RunArgs {
            device,
            loop_extents,
            free_extents,
            block_size,
            secondary_storage,
            simulate,
            mem_buffer_size,
            secondary_storage_size,
            primary_storage_exact_size,
            secondary_storage_exact_size,
        }),
        Command::Inspect { file, json } => inspect(&file, json),
    }
}

struct RunArgs {
    device: PathBuf,
    loop_extents: PathBuf,
    free_extents: PathBuf,
    block_size: Option<u64>,
    secondary_storage: Option<PathBuf>,
    simulate: bool,
    mem_buffer_size: Option<u64>,
    secondary_storage_size: Option<u64>,
    primary_storage_exact_size: Option<u64>,
    secondary_storage_exact_size: Option<u64>,
}

fn run_cmd(args: RunArgs) -> Result<()> {
    let mut bitmask = 0_u64;
    let mut loop_list = Vec::new();
    load_extents_from_path(&args.loop_extents, &mut loop_list, &mut bitmask)
        .with_context(|| format!("failed to load {}", args.loop_extents.display()))?;
    let mut free_list = Vec::new();
    load_extents_from_path(&args.free_extents, &mut free_list, &mut bitmask)
        .with_context(|| format!("failed to load {}", args.free_extents.display()))?;

    let dev_length = std::fs::metadata(&args.device)
        .with_context(|| format!("cannot stat {}", args.device.display()))?
        .len();
    let block_log2 = effective_block_size_log2(bitmask | dev_length, args.block_size)?;

    let secondary_path = args
        .secondary_storage
        .unwrap_or_else(|| args.device.with_extension("reblock-storage"));
    let mut io = FileIo::open(&args.device, block_log2, &secondary_path, args.simulate)?;

    for (key, value) in [
        (StorageSizeKey::MemBuffer, args.mem_buffer_size),
        (StorageSizeKey::SecondaryStorage, args.secondary_storage_size),
        (
            StorageSizeKey::PrimaryStorageExact,
            args.primary_storage_exact_size,
        ),
        (
            StorageSizeKey::SecondaryStorageExact,
            args.secondary_storage_exact_size,
        ),
    ] {
        if let Some(bytes) = value {
            io.set_storage_size(key, bytes);
        }
    }

    if !args.simulate {
        warn!(
            "relocating {} in place: make sure it is unmounted and backed up, \
             there is no undo",
            args.device.display()
        );
    }

    let mem = MemInfo {
        free_ram: detect_free_ram(),
        page_size: 4096,
    };
    reblock_engine::run(loop_list, free_list, &mut io, mem)?;
    Ok(())
}

// ── Inspect command ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    extents: usize,
    total_bytes: u64,
    block_size_bitmask: u64,
    derived_block_size: u64,
}

fn inspect(file: &PathBuf, json: bool) -> Result<()> {
    let mut list = Vec::new();
    let mut bitmask = 0_u64;
    load_extents_from_path(file, &mut list, &mut bitmask)
        .with_context(|| format!("failed to load {}", file.display()))?;

    let output = InspectOutput {
        extents: list.len(),
        total_bytes: list.iter().map(|e| e.length).sum(),
        block_size_bitmask: bitmask,
        derived_block_size: if bitmask == 0 {
            0
        } else {
            1_u64 << bitmask.trailing_zeros()
        },
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("extents: {}", output.extents);
        println!(
            "total: {} bytes ({})",
            output.total_bytes,
            pretty_size(output.total_bytes)
        );
        println!("block_size_bitmask: {:#x}", output.block_size_bitmask);
        println!("derived_block_size: {}", output.derived_block_size);
    }
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Derive the effective block size: the largest power of two dividing every
/// value recorded in the extent files (and the device length), unless
/// overridden. Empty inputs default to 4 KiB.
fn effective_block_size_log2(bitmask: u64, override_size: Option<u64>) -> Result<u32> {
    const DEFAULT_BLOCK_SIZE: u64 = 4096;

    let size = match override_size {
        Some(size) => {
            if size == 0 || !size.is_power_of_two() {
                bail!("block size {size} is not a power of two");
            }
            if bitmask & (size - 1) != 0 {
                bail!(
                    "the extent files carry offsets not aligned to {size} bytes \
                     (bitmask {bitmask:#x})"
                );
            }
            size
        }
        None if bitmask == 0 => DEFAULT_BLOCK_SIZE,
        None => 1_u64 << bitmask.trailing_zeros(),
    };
    Ok(size.trailing_zeros())
}

fn detect_free_ram() -> Option<u64> {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let available = system.available_memory();
    (available != 0).then_some(available)
}

/// Parse a byte size with an optional K/M/G/T suffix (binary units).
fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some(suffix) if suffix.is_ascii_alphabetic() => {
            let multiplier: u64 = match suffix.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                other => return Err(format!("unknown size suffix '{other}'")),
            };
            (&trimmed[..trimmed.len() - 1], multiplier)
        }
        _ => (trimmed, 1),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size: {input:?}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size {input:?} overflows"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_plain_and_suffixed() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64K"), Ok(64 << 10));
        assert_eq!(parse_size("8M"), Ok(8 << 20));
        assert_eq!(parse_size("2G"), Ok(2 << 30));
        assert_eq!(parse_size("1T"), Ok(1 << 40));
        assert_eq!(parse_size(" 16m "), Ok(16 << 20));
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999999999999T").is_err());
    }

    #[test]
    fn block_size_derivation() {
        // All values divisible by 4096, one only by 2048.
        let bitmask = 8192 | 4096 | 2048;
        assert_eq!(effective_block_size_log2(bitmask, None).unwrap(), 11);
        // Empty inputs fall back to 4 KiB.
        assert_eq!(effective_block_size_log2(0, None).unwrap(), 12);
    }

    #[test]
    fn block_size_override_is_validated() {
        assert_eq!(effective_block_size_log2(8192, Some(4096)).unwrap(), 12);
        assert!(effective_block_size_log2(8192, Some(3000)).is_err());
        // Override coarser than the recorded offsets is rejected.
        assert!(effective_block_size_log2(2048, Some(4096)).is_err());
    }
}
