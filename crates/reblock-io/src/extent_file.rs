//! Textual persistence of extent lists.
//!
//! The format is deliberately trivial: a fixed banner, a count line, a
//! column header, then one tab-separated `(physical, logical, length,
//! user_data)` row of unsigned decimals per extent. While loading, every
//! field is OR-ed into a bitmask so the caller can deduce the largest
//! power of two dividing all recorded values.

use reblock_error::{ReblockError, Result};
use reblock_types::ByteExtent;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

const BANNER: &str = "\
################################################################################
######################  DO NOT EDIT THIS FILE ! ################################
################################################################################
## This file was automatically generated by reblock,                  ##########
## and any change you may do will be overwritten upon next execution. ##########
################################################################################
";
const BANNER_LINES: usize = 6;
const COLUMNS: &str = "physical\tlogical\tlength\tuser_data";

/// Write an extent list to `out`.
pub fn save_extents<W: Write>(out: &mut W, extents: &[ByteExtent]) -> io::Result<()> {
    write!(out, "{BANNER}")?;
    writeln!(out, "count {}", extents.len())?;
    writeln!(out, "{COLUMNS}")?;
    for extent in extents {
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            extent.physical, extent.logical, extent.length, extent.user_data
        )?;
    }
    Ok(())
}

/// Load an extent list previously written by [`save_extents`], appending to
/// `out` and OR-ing every field into `block_size_bitmask`.
///
/// Malformed input fails with `Proto`.
pub fn load_extents<R: BufRead>(
    input: &mut R,
    out: &mut Vec<ByteExtent>,
    block_size_bitmask: &mut u64,
) -> Result<()> {
    let mut lines = input.lines();
    let mut next_line = |what: &str| -> Result<String> {
        match lines.next() {
            Some(Ok(line)) => Ok(line),
            Some(Err(err)) => Err(ReblockError::Io(err)),
            None => Err(ReblockError::Proto(format!("unexpected end of file, expected {what}"))),
        }
    };

    for _ in 0..BANNER_LINES {
        next_line("banner line")?;
    }

    let count_line = next_line("count line")?;
    let count: usize = count_line
        .strip_prefix("count ")
        .and_then(|n| n.trim().parse().ok())
        .ok_or_else(|| ReblockError::Proto(format!("bad count line: {count_line:?}")))?;

    next_line("column header")?;

    out.reserve(count);
    let mut bitmask = *block_size_bitmask;
    for i in 0..count {
        let line = next_line("extent row")?;
        let mut fields = line.split_whitespace().map(str::parse::<u64>);
        let mut field = |name: &str| -> Result<u64> {
            fields
                .next()
                .and_then(std::result::Result::ok)
                .ok_or_else(|| ReblockError::Proto(format!("extent row {i}: bad {name}: {line:?}")))
        };
        let physical = field("physical")?;
        let logical = field("logical")?;
        let length = field("length")?;
        let user_data = field("user_data")?;

        bitmask |= physical | logical | length;
        out.push(ByteExtent {
            physical,
            logical,
            length,
            user_data,
        });
    }
    *block_size_bitmask = bitmask;
    Ok(())
}

/// Save an extent list to a file path.
pub fn save_extents_to_path(path: &Path, extents: &[ByteExtent]) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    save_extents(&mut writer, extents)?;
    writer.flush()?;
    Ok(())
}

/// Load an extent list from a file path.
pub fn load_extents_from_path(
    path: &Path,
    out: &mut Vec<ByteExtent>,
    block_size_bitmask: &mut u64,
) -> Result<()> {
    let file = File::open(path)?;
    load_extents(&mut BufReader::new(file), out, block_size_bitmask)
}
