//! Page size registry
//!
//! [`PageSizes`] is a set of power-of-two sizes stored as a bit mask, so
//! "next smaller" and "next larger" are single mask operations.
//! [`PageSizeSelector`] picks the page size for a region from that set.

use std::fmt;

use stratum_system::Platform;
use stratum_system::utils::{byte_size_in_exact_unit, exact_unit_for_byte_size, is_aligned};

use crate::config::MemoryConfig;

const K: usize = 1024;
const M: usize = K * K;
const G: usize = M * K;

/// Set of page sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PageSizes(usize);

impl PageSizes {
    /// Empty set
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Add `page_size`, which must be a power of two
    pub fn add(&mut self, page_size: usize) {
        assert!(
            page_size.is_power_of_two(),
            "page_size must be a power of 2: {page_size:#x}"
        );
        self.0 |= page_size;
    }

    /// Check membership
    #[must_use]
    pub const fn contains(&self, page_size: usize) -> bool {
        self.0 & page_size != 0
    }

    /// Largest member below `page_size`, or 0
    #[must_use]
    pub const fn next_smaller(&self, page_size: usize) -> usize {
        let below = self.0 & (page_size.wrapping_sub(1));
        if below == 0 {
            0
        } else {
            1 << (usize::BITS - 1 - below.leading_zeros())
        }
    }

    /// Smallest member above `page_size`, or 0
    #[must_use]
    pub const fn next_larger(&self, page_size: usize) -> usize {
        // `page_size | (page_size - 1)` covers it and everything smaller
        // without shifting past the top bit.
        let above = self.0 & !(page_size | page_size.wrapping_sub(1));
        if above == 0 {
            0
        } else {
            1 << above.trailing_zeros()
        }
    }

    /// Largest member, or 0 when empty
    #[must_use]
    pub const fn largest(&self) -> usize {
        const TOP: usize = 1 << (usize::BITS - 1);
        if self.contains(TOP) {
            TOP
        } else {
            self.next_smaller(TOP)
        }
    }

    /// Smallest member, or 0 when empty
    #[must_use]
    pub const fn smallest(&self) -> usize {
        if self.contains(1) { 1 } else { self.next_larger(1) }
    }

    /// Check if no size is registered
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Members from smallest to largest
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(self.smallest()).filter(|&s| s != 0), |&s| {
            Some(self.next_larger(s)).filter(|&n| n != 0)
        })
    }
}

impl FromIterator<usize> for PageSizes {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut sizes = Self::new();
        for size in iter {
            sizes.add(size);
        }
        sizes
    }
}

impl fmt::Display for PageSizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("empty");
        }
        for (i, size) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if size < M {
                write!(f, "{}k", size / K)?;
            } else if size < G {
                write!(f, "{}M", size / M)?;
            } else {
                write!(f, "{}G", size / G)?;
            }
        }
        Ok(())
    }
}

/// Chooses backing page sizes for regions
///
/// Immutable once built; share it freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSizeSelector {
    sizes: PageSizes,
    vm_page_size: usize,
    use_large_pages: bool,
}

impl PageSizeSelector {
    /// Selector over an explicit set
    pub fn new(sizes: PageSizes, vm_page_size: usize, use_large_pages: bool) -> Self {
        Self {
            sizes,
            vm_page_size,
            use_large_pages,
        }
    }

    /// Selector over the host's sizes, capped by `large_page_size` when configured
    pub fn from_platform(platform: &dyn Platform, config: &MemoryConfig) -> Self {
        let vm_page_size = platform.vm_page_size();
        let cap = config.large_page_size.unwrap_or(usize::MAX);
        let mut sizes: PageSizes = platform
            .supported_page_sizes()
            .into_iter()
            .filter(|&s| s.is_power_of_two() && s <= cap)
            .collect();
        sizes.add(vm_page_size);

        tracing::info!(
            target: "os::pagesize",
            "Usable page sizes: {sizes}, large pages {}",
            if config.use_large_pages { "enabled" } else { "disabled" }
        );
        Self::new(sizes, vm_page_size, config.use_large_pages)
    }

    /// Registered sizes
    pub fn sizes(&self) -> PageSizes {
        self.sizes
    }

    /// Base page size
    pub fn vm_page_size(&self) -> usize {
        self.vm_page_size
    }

    /// Check if large pages are consulted
    pub fn use_large_pages(&self) -> bool {
        self.use_large_pages
    }

    /// Largest registered size that fits `min_pages` times into `region_size`
    ///
    /// With `must_be_aligned` the size must also divide `region_size`.
    /// Falls back to the base page size when nothing larger qualifies or
    /// large pages are off.
    pub fn page_size_for_region(&self, region_size: usize, min_pages: usize, must_be_aligned: bool) -> usize {
        assert!(min_pages > 0, "min_pages must be positive");
        if self.use_large_pages {
            let max_page_size = region_size / min_pages;
            let mut page_size = self.sizes.largest();
            while page_size != 0 {
                if page_size <= max_page_size && (!must_be_aligned || is_aligned(region_size, page_size)) {
                    return page_size;
                }
                page_size = self.sizes.next_smaller(page_size);
            }
        }
        self.vm_page_size
    }

    /// [`page_size_for_region`](Self::page_size_for_region) requiring alignment
    pub fn page_size_for_region_aligned(&self, region_size: usize, min_pages: usize) -> usize {
        self.page_size_for_region(region_size, min_pages, true)
    }

    /// [`page_size_for_region`](Self::page_size_for_region) without alignment
    pub fn page_size_for_region_unaligned(&self, region_size: usize, min_pages: usize) -> usize {
        self.page_size_for_region(region_size, min_pages, false)
    }
}

struct Exact(usize);

impl fmt::Display for Exact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", byte_size_in_exact_unit(self.0), exact_unit_for_byte_size(self.0))
    }
}

/// Log the page size chosen for a region
pub fn trace_page_sizes(
    label: &str,
    region_min_size: usize,
    region_max_size: usize,
    page_size: usize,
    base: usize,
    size: usize,
) {
    tracing::info!(
        target: "os::pagesize",
        "{label}:  min={} max={} base={base:#x} page_size={} size={}",
        Exact(region_min_size),
        Exact(region_max_size),
        Exact(page_size),
        Exact(size),
    );
}

/// Log the page size chosen for a requested size
pub fn trace_page_sizes_for_requested_size(
    label: &str,
    requested_size: usize,
    page_size: usize,
    alignment: usize,
    base: usize,
    size: usize,
) {
    tracing::info!(
        target: "os::pagesize",
        "{label}: req_size={} base={base:#x} page_size={} alignment={} size={}",
        Exact(requested_size),
        Exact(page_size),
        Exact(alignment),
        Exact(size),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    fn sample() -> PageSizes {
        [4 * K, 16 * K, 2 * M].into_iter().collect()
    }

    #[test]
    fn neighbours() {
        let sizes = sample();
        assert_eq!(sizes.next_larger(4 * K), 16 * K);
        assert_eq!(sizes.next_smaller(2 * M), 16 * K);
        assert_eq!(sizes.largest(), 2 * M);
        assert_eq!(sizes.smallest(), 4 * K);
        assert_eq!(sizes.next_larger(2 * M), 0);
        assert_eq!(sizes.next_smaller(4 * K), 0);
        assert!(sizes.contains(16 * K));
        assert!(!sizes.contains(8 * K));
    }

    #[test]
    fn top_bit_has_no_larger() {
        let top = 1usize << (usize::BITS - 1);
        let mut sizes = PageSizes::new();
        sizes.add(top);
        sizes.add(4 * K);
        assert_eq!(sizes.largest(), top);
        assert_eq!(sizes.next_larger(top), 0);
        assert_eq!(sizes.next_smaller(top), 4 * K);
    }

    #[test]
    fn empty_set() {
        let sizes = PageSizes::new();
        assert_eq!(sizes.largest(), 0);
        assert_eq!(sizes.smallest(), 0);
        assert_eq!(sizes.iter().count(), 0);
        assert_eq!(sizes.to_string(), "empty");
    }

    #[test]
    fn display_lists_ascending() {
        let sizes: PageSizes = [G, 4 * K, 2 * M].into_iter().collect();
        assert_eq!(sizes.to_string(), "4k, 2M, 1G");
    }

    #[test]
    #[should_panic(expected = "power of 2")]
    fn add_rejects_non_power_of_two() {
        PageSizes::new().add(3 * K);
    }

    #[rstest]
    // 2M does not fit four times into 2M; 16K does and divides it.
    #[case(2 * M, 4, true, 16 * K)]
    #[case(8 * M, 4, true, 2 * M)]
    #[case(2 * M + 4 * K, 1, true, 4 * K)]
    #[case(2 * M + 4 * K, 1, false, 2 * M)]
    #[case(4 * K, 2, true, 4 * K)]
    fn region_selection(
        #[case] region: usize,
        #[case] min_pages: usize,
        #[case] aligned: bool,
        #[case] expected: usize,
    ) {
        let selector = PageSizeSelector::new(sample(), 4 * K, true);
        assert_eq!(selector.page_size_for_region(region, min_pages, aligned), expected);
    }

    #[test]
    fn small_pages_without_large_pages() {
        let selector = PageSizeSelector::new(sample(), 4 * K, false);
        assert_eq!(selector.page_size_for_region_aligned(64 * M, 1), 4 * K);
        assert_eq!(selector.page_size_for_region_unaligned(64 * M, 1), 4 * K);
    }

    #[test]
    fn trace_lines_format_exact_units() {
        let _ = stratum_log::init_test();
        trace_page_sizes("Heap", 64 * M, 256 * M, 2 * M, 0x7f00_0000_0000, 64 * M);
        trace_page_sizes_for_requested_size("Code Cache", 48 * M, 4 * K, 64 * K, 0x7f10_0000_0000, 48 * M);
        assert_eq!(Exact(3 * M).to_string(), "3M");
        assert_eq!(Exact(5 * K + 1).to_string(), "5121B");
    }

    proptest! {
        #[test]
        fn neighbours_bracket_members(mask in 1usize..(1 << 40), shift in 0u32..40) {
            let sizes = PageSizes(mask);
            let p = 1usize << shift;
            let smaller = sizes.next_smaller(p);
            let larger = sizes.next_larger(p);
            prop_assert!(smaller == 0 || (smaller < p && sizes.contains(smaller)));
            prop_assert!(larger == 0 || (larger > p && sizes.contains(larger)));
            let listed: Vec<usize> = sizes.iter().collect();
            prop_assert!(listed.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(listed.len(), mask.count_ones() as usize);
        }

        #[test]
        fn selected_size_fits(region in 1usize..(1 << 32), min_pages in 1usize..64) {
            let selector = PageSizeSelector::new(sample(), 4 * K, true);
            let chosen = selector.page_size_for_region_aligned(region, min_pages);
            prop_assert!(chosen == 4 * K || (chosen <= region / min_pages && region % chosen == 0));
        }
    }
}
