use std::fmt;

use crate::probe::{FetchWidth, SafeFetch};
use crate::utils::{align_down, align_up};

pub(crate) const PTR_WIDTH: usize = 2 + 2 * size_of::<usize>();

/// Hex-dump `[start, end)` in `unit`-sized cells
///
/// Line prefixes count from `logical_start` rather than `start`, so a copy
/// of some memory can be dumped under the addresses it came from. Cells the
/// probe cannot read print as `??` per byte. `bytes_per_line` is rounded up
/// to a multiple of 8. A range running up to the top of the address space
/// stops at the last whole cell.
pub fn print_hex_dump(
    out: &mut dyn fmt::Write,
    probe: &(impl SafeFetch + ?Sized),
    start: usize,
    end: usize,
    unit: FetchWidth,
    bytes_per_line: usize,
    logical_start: usize,
) -> fmt::Result {
    let unit_bytes = unit.bytes();
    let start = align_down(start, unit_bytes);
    let mut logical = align_down(logical_start, unit_bytes);
    let bytes_per_line = align_up(bytes_per_line.max(1), 8);
    let cols_per_line = bytes_per_line / unit_bytes;
    let digits = 2 * unit_bytes;

    let mut cols = 0;
    let mut p = start;
    write!(out, "{logical:#0PTR_WIDTH$x}:   ")?;
    while p < end {
        match probe.try_read(p, unit) {
            Some(value) => write!(out, "{:0digits$x}", value & unit.mask())?,
            None => write!(out, "{}", "??".repeat(unit_bytes))?,
        }
        logical = logical.wrapping_add(unit_bytes);
        cols += 1;
        let Some(next) = p.checked_add(unit_bytes).filter(|&next| next < end) else {
            write!(out, " ")?;
            break;
        };
        p = next;
        if cols >= cols_per_line {
            cols = 0;
            writeln!(out)?;
            write!(out, "{logical:#0PTR_WIDTH$x}:   ")?;
        } else {
            write!(out, " ")?;
        }
    }
    writeln!(out)
}
