//! Per-category counters and the call-site table

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::callsite::{CallSite, CallStack};
use crate::flags::MemFlags;

/// Atomic count, byte total and high-water marks
#[derive(Debug, Default)]
pub struct MemoryCounter {
    count: AtomicUsize,
    bytes: AtomicUsize,
    peak_count: AtomicUsize,
    peak_bytes: AtomicUsize,
}

impl MemoryCounter {
    /// Account one allocation of `bytes`
    pub fn allocate(&self, bytes: usize) {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.peak_count.fetch_max(count, Ordering::Relaxed);
        self.peak_bytes.fetch_max(total, Ordering::Relaxed);
    }

    /// Deaccount one allocation of `bytes`
    pub fn deallocate(&self, bytes: usize) {
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Live allocations
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Live bytes
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            count: self.count(),
            bytes: self.bytes(),
            peak_count: self.peak_count.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Values of a [`MemoryCounter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    /// Live allocations
    pub count: usize,
    /// Live bytes
    pub bytes: usize,
    /// Most live allocations seen
    pub peak_count: usize,
    /// Most live bytes seen
    pub peak_bytes: usize,
}

/// Counters for every category plus the total
#[derive(Debug)]
pub struct MallocSummary {
    categories: [MemoryCounter; MemFlags::COUNT],
    total: MemoryCounter,
}

impl Default for MallocSummary {
    fn default() -> Self {
        Self {
            categories: std::array::from_fn(|_| MemoryCounter::default()),
            total: MemoryCounter::default(),
        }
    }
}

impl MallocSummary {
    pub(crate) fn record(&self, flags: MemFlags, bytes: usize) {
        self.categories[flags.index()].allocate(bytes);
        self.total.allocate(bytes);
    }

    pub(crate) fn deaccount(&self, flags: MemFlags, bytes: usize) {
        self.categories[flags.index()].deallocate(bytes);
        self.total.deallocate(bytes);
    }

    /// Counters for `flags`
    pub fn category(&self, flags: MemFlags) -> CounterSnapshot {
        self.categories[flags.index()].snapshot()
    }

    /// Counters over every category
    pub fn total(&self) -> CounterSnapshot {
        self.total.snapshot()
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.total.bytes()
    }

    pub(crate) fn category_bytes(&self, flags: MemFlags) -> usize {
        self.categories[flags.index()].bytes()
    }
}

/// Aggregate for one call site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteStats {
    /// Requesting location
    pub site: CallSite,
    /// Return addresses, when captured
    pub stack: CallStack,
    /// Category charged
    pub flags: MemFlags,
    /// Live counters
    pub counter: CounterSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SiteKey {
    site: CallSite,
    stack: CallStack,
    flags: MemFlags,
}

#[derive(Debug, Default)]
struct SiteTableInner {
    index: HashMap<SiteKey, u32>,
    entries: Vec<(SiteKey, MemoryCounter)>,
}

/// Detail-level aggregation keyed by call site
///
/// Markers are 1-based indices; 0 means "no site".
#[derive(Debug, Default)]
pub(crate) struct SiteTable {
    inner: Mutex<SiteTableInner>,
}

impl SiteTable {
    pub(crate) fn record(&self, site: CallSite, stack: CallStack, flags: MemFlags, bytes: usize) -> u32 {
        let key = SiteKey { site, stack, flags };
        let mut inner = self.inner.lock();
        let marker = match inner.index.get(&key) {
            Some(&marker) => marker,
            None => {
                inner.entries.push((key, MemoryCounter::default()));
                let marker = inner.entries.len() as u32;
                inner.index.insert(key, marker);
                marker
            }
        };
        inner.entries[marker as usize - 1].1.allocate(bytes);
        marker
    }

    pub(crate) fn deaccount(&self, marker: u32, bytes: usize) {
        if marker == 0 {
            return;
        }
        let inner = self.inner.lock();
        if let Some((_, counter)) = inner.entries.get(marker as usize - 1) {
            counter.deallocate(bytes);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<SiteStats> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(key, counter)| SiteStats {
                site: key.site,
                stack: key.stack,
                flags: key.flags,
                counter: counter.snapshot(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn counter_tracks_peaks() {
        let counter = MemoryCounter::default();
        counter.allocate(100);
        counter.allocate(50);
        counter.deallocate(100);
        assert_eq!(
            counter.snapshot(),
            CounterSnapshot {
                count: 1,
                bytes: 50,
                peak_count: 2,
                peak_bytes: 150,
            }
        );
    }

    #[test]
    fn summary_splits_by_category() {
        let summary = MallocSummary::default();
        summary.record(MemFlags::Compiler, 64);
        summary.record(MemFlags::Gc, 32);
        summary.deaccount(MemFlags::Gc, 32);
        assert_eq!(summary.category(MemFlags::Compiler).bytes, 64);
        assert_eq!(summary.category(MemFlags::Gc).bytes, 0);
        assert_eq!(summary.category(MemFlags::Gc).peak_bytes, 32);
        assert_eq!(summary.total().count, 1);
    }

    #[test]
    fn site_table_reuses_markers() {
        let table = SiteTable::default();
        let site = CallSite::caller();
        let a = table.record(site, CallStack::empty(), MemFlags::Test, 8);
        let b = table.record(site, CallStack::empty(), MemFlags::Test, 8);
        let c = table.record(site, CallStack::empty(), MemFlags::Other, 8);
        assert_eq!(a, 1);
        assert_eq!(a, b);
        assert_eq!(c, 2);

        table.deaccount(a, 8);
        table.deaccount(0, 8);
        let stats = table.snapshot();
        assert_eq!(stats[0].counter.count, 1);
        assert_eq!(stats[0].counter.peak_bytes, 16);
        assert_eq!(stats[1].flags, MemFlags::Other);
    }
}
