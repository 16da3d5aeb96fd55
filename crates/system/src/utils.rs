//! Alignment and size-formatting helpers shared by the platform layer

/// Round `value` down to a multiple of `alignment` (a power of two)
#[inline]
#[must_use]
pub const fn align_down(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

/// Round `value` up to a multiple of `alignment` (a power of two)
///
/// Wraps to zero on overflow; callers that can see sizes near `usize::MAX`
/// use [`checked_align_up`].
#[inline]
#[must_use]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    value.wrapping_add(alignment - 1) & !(alignment - 1)
}

/// [`align_up`] returning `None` on overflow
#[inline]
#[must_use]
pub const fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    match value.checked_add(alignment - 1) {
        Some(v) => Some(v & !(alignment - 1)),
        None => None,
    }
}

/// Check alignment against a power of two
#[inline]
#[must_use]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Check if a number is power of two
#[inline]
#[must_use]
pub const fn is_power_of_two(n: usize) -> bool {
    n != 0 && n.is_power_of_two()
}

const K: usize = 1024;
const M: usize = K * K;
const G: usize = M * K;

/// Largest unit that divides `bytes` exactly: `"B"`, `"K"`, `"M"` or `"G"`
#[must_use]
pub const fn exact_unit_for_byte_size(bytes: usize) -> &'static str {
    if bytes >= G && bytes % G == 0 {
        "G"
    } else if bytes >= M && bytes % M == 0 {
        "M"
    } else if bytes >= K && bytes % K == 0 {
        "K"
    } else {
        "B"
    }
}

/// `bytes` expressed in [`exact_unit_for_byte_size`]
#[must_use]
pub const fn byte_size_in_exact_unit(bytes: usize) -> usize {
    if bytes >= G && bytes % G == 0 {
        bytes / G
    } else if bytes >= M && bytes % M == 0 {
        bytes / M
    } else if bytes >= K && bytes % K == 0 {
        bytes / K
    } else {
        bytes
    }
}

/// `"{n}{unit}"` in the exact unit, e.g. `"2M"`
#[must_use]
pub fn exact_size(bytes: usize) -> String {
    format!(
        "{}{}",
        byte_size_in_exact_unit(bytes),
        exact_unit_for_byte_size(bytes)
    )
}

/// Format bytes as human-readable string
///
/// # Examples
///
/// ```
/// use stratum_system::utils::format_bytes;
///
/// assert_eq!(format_bytes(1024), "1.00 KB");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(1048576), "1.00 MB");
/// ```
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
