//! Virtual memory accounting
//!
//! Reserved regions are keyed by base address. Each region keeps its
//! committed sub-ranges merged and sorted, so a commit that touches or
//! overlaps an earlier one folds into it.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use parking_lot::Mutex;
use stratum_system::diagnostics::LocationFinder;
use stratum_system::utils::format_bytes;

use crate::callsite::CallSite;
use crate::flags::MemFlags;

/// One reservation and its committed sub-ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedRegion {
    base: usize,
    size: usize,
    flags: MemFlags,
    site: CallSite,
    committed: BTreeMap<usize, usize>,
}

impl ReservedRegion {
    fn new(base: usize, size: usize, flags: MemFlags, site: CallSite) -> Self {
        Self {
            base,
            size,
            flags,
            site,
            committed: BTreeMap::new(),
        }
    }

    /// Start address
    pub fn base(&self) -> usize {
        self.base
    }

    /// Reserved bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the last byte
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    /// Category
    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// Where the reservation was made
    pub fn site(&self) -> CallSite {
        self.site
    }

    /// Committed `(start, end)` ranges in address order
    pub fn committed(&self) -> Vec<(usize, usize)> {
        self.committed.iter().map(|(&s, &e)| (s, e)).collect()
    }

    /// Committed bytes
    pub fn committed_size(&self) -> usize {
        self.committed.iter().map(|(s, e)| e - s).sum()
    }

    /// Check if `addr` lies inside the reservation
    pub fn contains(&self, addr: usize) -> bool {
        (self.base..self.end()).contains(&addr)
    }

    /// Check if `addr` lies inside a committed range
    pub fn is_committed(&self, addr: usize) -> bool {
        self.committed
            .range(..=addr)
            .next_back()
            .is_some_and(|(_, &end)| addr < end)
    }

    fn add_committed(&mut self, start: usize, end: usize) {
        let (mut start, mut end) = (start.max(self.base), end.min(self.end()));
        if start >= end {
            return;
        }
        let touching: Vec<usize> = self
            .committed
            .range(..=end)
            .rev()
            .take_while(|&(_, &e)| e >= start)
            .map(|(&s, _)| s)
            .collect();
        for s in touching {
            if let Some(e) = self.committed.remove(&s) {
                start = start.min(s);
                end = end.max(e);
            }
        }
        self.committed.insert(start, end);
    }

    fn remove_committed(&mut self, start: usize, end: usize) {
        let overlapping: Vec<(usize, usize)> = self
            .committed
            .range(..end)
            .rev()
            .take_while(|&(_, &e)| e > start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            self.committed.remove(&s);
            if s < start {
                self.committed.insert(s, start);
            }
            if end < e {
                self.committed.insert(end, e);
            }
        }
    }

    /// The part of this region inside `[start, end)`, if any
    fn slice(&self, start: usize, end: usize) -> Option<Self> {
        let (start, end) = (start.max(self.base), end.min(self.end()));
        if start >= end {
            return None;
        }
        let mut part = Self::new(start, end - start, self.flags, self.site);
        part.committed = self
            .committed
            .iter()
            .filter_map(|(&s, &e)| {
                let (s, e) = (s.max(start), e.min(end));
                (s < e).then_some((s, e))
            })
            .collect();
        Some(part)
    }
}

/// Reserved and committed bytes of one category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct VirtualMemoryUsage {
    /// Reserved bytes
    pub reserved: usize,
    /// Committed bytes
    pub committed: usize,
}

impl VirtualMemoryUsage {
    fn add(&mut self, region: &ReservedRegion) {
        self.reserved += region.size;
        self.committed += region.committed_size();
    }
}

/// Tracks reservations and commits made through the virtual memory manager
#[derive(Debug, Default)]
pub struct VirtualMemoryTracker {
    regions: Mutex<BTreeMap<usize, ReservedRegion>>,
}

impl VirtualMemoryTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fresh reservation
    ///
    /// A reservation overlapping a tracked one replaces it; the host only
    /// hands out such ranges after the old one was released behind our back.
    pub fn record_reserve(&self, base: usize, size: usize, flags: MemFlags, site: CallSite) {
        if size == 0 {
            return;
        }
        let mut regions = self.regions.lock();
        let end = base + size;
        let stale: Vec<usize> = regions
            .range(..end)
            .rev()
            .take_while(|(_, r)| r.end() > base)
            .map(|(&b, _)| b)
            .collect();
        for b in stale {
            if let Some(old) = regions.remove(&b) {
                if old.base == base && old.size == size {
                    tracing::trace!(target: "os::vm", "Re-reserved [{base:#x}, {end:#x})");
                } else {
                    tracing::debug!(
                        target: "os::vm",
                        "Reservation [{base:#x}, {end:#x}) replaces tracked region [{:#x}, {:#x})",
                        old.base,
                        old.end()
                    );
                }
            }
        }
        regions.insert(base, ReservedRegion::new(base, size, flags, site));
    }

    /// Record a reservation that is committed in full
    pub fn record_reserve_and_commit(&self, base: usize, size: usize, flags: MemFlags, site: CallSite) {
        self.record_reserve(base, size, flags, site);
        self.record_commit(base, size);
    }

    /// Change the category of the region holding `addr`
    pub fn record_flags(&self, addr: usize, flags: MemFlags) {
        if let Some(region) = Self::containing_mut(&mut self.regions.lock(), addr) {
            region.flags = flags;
        }
    }

    /// Record a commit; `false` when no reservation holds `addr`
    pub fn record_commit(&self, addr: usize, size: usize) -> bool {
        let mut regions = self.regions.lock();
        match Self::containing_mut(&mut regions, addr) {
            Some(region) => {
                region.add_committed(addr, addr.saturating_add(size));
                true
            }
            None => {
                tracing::debug!(target: "os::vm", "Commit at {addr:#x} outside any tracked reservation");
                false
            }
        }
    }

    /// Record an uncommit; `false` when no reservation holds `addr`
    pub fn record_uncommit(&self, addr: usize, size: usize) -> bool {
        let mut regions = self.regions.lock();
        match Self::containing_mut(&mut regions, addr) {
            Some(region) => {
                region.remove_committed(addr, addr.saturating_add(size));
                true
            }
            None => false,
        }
    }

    /// Record a release of `[addr, addr + size)`
    ///
    /// Handles whole regions, prefixes, suffixes and interior holes, which
    /// split a region in two. Returns `false` when nothing tracked overlaps.
    pub fn record_release(&self, addr: usize, size: usize) -> bool {
        let end = addr.saturating_add(size);
        let mut regions = self.regions.lock();
        let hit: Vec<usize> = regions
            .range(..end)
            .rev()
            .take_while(|(_, r)| r.end() > addr)
            .map(|(&b, _)| b)
            .collect();
        if hit.is_empty() {
            tracing::debug!(target: "os::vm", "Release of [{addr:#x}, {end:#x}) matches no tracked reservation");
            return false;
        }
        for b in hit {
            let Some(region) = regions.remove(&b) else { continue };
            for part in [region.slice(region.base, addr), region.slice(end, region.end())]
                .into_iter()
                .flatten()
            {
                regions.insert(part.base, part);
            }
        }
        true
    }

    /// Snapshot of the region holding `addr`
    pub fn region_containing(&self, addr: usize) -> Option<ReservedRegion> {
        let regions = self.regions.lock();
        regions
            .range(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
            .cloned()
    }

    /// Snapshot of every region in address order
    pub fn regions(&self) -> Vec<ReservedRegion> {
        self.regions.lock().values().cloned().collect()
    }

    /// Usage of one category
    pub fn category(&self, flags: MemFlags) -> VirtualMemoryUsage {
        let mut usage = VirtualMemoryUsage::default();
        for region in self.regions.lock().values().filter(|r| r.flags == flags) {
            usage.add(region);
        }
        usage
    }

    /// Usage across all categories
    pub fn total(&self) -> VirtualMemoryUsage {
        let mut usage = VirtualMemoryUsage::default();
        for region in self.regions.lock().values() {
            usage.add(region);
        }
        usage
    }

    /// Per-category usage, skipping categories with nothing reserved
    pub fn summary(&self) -> Vec<(MemFlags, VirtualMemoryUsage)> {
        let mut usage = [VirtualMemoryUsage::default(); MemFlags::COUNT];
        for region in self.regions.lock().values() {
            usage[region.flags.index()].add(region);
        }
        MemFlags::ALL
            .iter()
            .map(|&f| (f, usage[f.index()]))
            .filter(|(_, u)| u.reserved > 0)
            .collect()
    }

    /// Human-readable summary
    pub fn summary_report(&self) -> String {
        let mut out = String::new();
        let _ = self.write_summary(&mut out);
        out
    }

    fn write_summary(&self, out: &mut String) -> fmt::Result {
        let total = self.total();
        writeln!(
            out,
            "Virtual memory: reserved={}, committed={}",
            format_bytes(total.reserved as u64),
            format_bytes(total.committed as u64)
        )?;
        for (flags, usage) in self.summary() {
            writeln!(
                out,
                "-{:>26} (reserved={}, committed={})",
                flags.name(),
                format_bytes(usage.reserved as u64),
                format_bytes(usage.committed as u64)
            )?;
        }
        Ok(())
    }

    /// Describe `addr` if it falls in a tracked reservation
    pub fn describe(&self, addr: usize) -> Option<String> {
        let region = self.region_containing(addr)?;
        Some(format!(
            "{addr:#x} is at offset {:#x} in a {} region [{:#x}, {:#x}) ({}) reserved at {}",
            addr - region.base,
            if region.is_committed(addr) { "committed" } else { "reserved" },
            region.base,
            region.end(),
            region.flags,
            region.site
        ))
    }

    fn containing_mut(regions: &mut BTreeMap<usize, ReservedRegion>, addr: usize) -> Option<&mut ReservedRegion> {
        regions
            .range_mut(..=addr)
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }
}

impl LocationFinder for VirtualMemoryTracker {
    fn describe(&self, addr: usize) -> Option<String> {
        VirtualMemoryTracker::describe(self, addr)
    }
}
