//! Malloc ledger
//!
//! Accounting and integrity checking for native heap blocks. Every tracked
//! block carries a 16-byte header and a 2-byte footer; a side table keyed by
//! user pointer is consulted *before* any header is read, so double frees
//! and foreign pointers are caught without touching freed memory.
//!
//! With tracking off every operation is a pass-through and
//! [`MallocLedger::overhead_per_malloc`] is zero.

mod corruption;
mod header;
mod summary;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::ptr::NonNull;
use std::sync::Arc;

use dashmap::DashMap;
use stratum_system::diagnostics::LocationFinder;
use stratum_system::utils::format_bytes;

pub use corruption::{AbortOnCorruption, Corruption, CorruptionHandler, CorruptionKind};
#[cfg(any(test, feature = "test-util"))]
pub use corruption::RecordingCorruptionHandler;
pub use header::{DEAD_CANARY, DEAD_FOOTER, FOOTER_SIZE, HEADER_SIZE, LIVE_CANARY, LIVE_FOOTER};
pub use summary::{CounterSnapshot, MallocSummary, MemoryCounter, SiteStats};

use crate::callsite::{CallSite, CallStack};
use crate::config::{MemoryConfig, TrackingLevel};
use crate::error::{MemoryError, MemoryResult};
use crate::flags::MemFlags;
use header::MallocHeader;
use summary::SiteTable;

/// Frames between the public heap entry point and stack capture
const CAPTURE_SKIP: usize = 2;

/// Side-table record of a live block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveBlock {
    /// User-visible size
    pub size: usize,
    /// Category charged
    pub flags: MemFlags,
    /// Requesting location
    pub site: CallSite,
    /// Return addresses (detail level only)
    pub stack: CallStack,
    marker: u32,
}

/// What a realloc needs to undo or finish the removal of the old block
#[derive(Debug, Clone, Copy)]
pub struct FreeInfo {
    inner: usize,
    block: Option<LiveBlock>,
}

impl FreeInfo {
    /// Old user pointer
    pub fn addr(&self) -> usize {
        self.inner
    }

    /// Old user size (0 when tracking is off)
    pub fn size(&self) -> usize {
        self.block.map_or(0, |b| b.size)
    }
}

/// Live blocks grouped by where they were allocated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakRecord {
    /// Requesting location
    pub site: CallSite,
    /// Return addresses (detail level only)
    pub stack: CallStack,
    /// Category charged
    pub flags: MemFlags,
    /// Live blocks from this site
    pub blocks: usize,
    /// Live bytes from this site
    pub bytes: usize,
}

/// Accounting service shared by the heap facade
pub struct MallocLedger {
    config: MemoryConfig,
    live: DashMap<usize, LiveBlock>,
    summary: MallocSummary,
    sites: SiteTable,
    handler: Arc<dyn CorruptionHandler>,
}

impl std::fmt::Debug for MallocLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MallocLedger")
            .field("level", &self.level())
            .field("live", &self.live.len())
            .finish_non_exhaustive()
    }
}

impl MallocLedger {
    /// Ledger that aborts on corruption
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_handler(config, Arc::new(AbortOnCorruption))
    }

    /// Ledger reporting corruption to `handler`
    pub fn with_handler(config: MemoryConfig, handler: Arc<dyn CorruptionHandler>) -> Self {
        tracing::debug!(
            target: "os::malloc",
            level = %config.tracking,
            limit = %config.malloc_limit,
            "malloc ledger initialized"
        );
        Self {
            config,
            live: DashMap::new(),
            summary: MallocSummary::default(),
            sites: SiteTable::default(),
            handler,
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Tracking level
    pub fn level(&self) -> TrackingLevel {
        self.config.tracking
    }

    /// Check if headers and accounting are active
    pub fn enabled(&self) -> bool {
        self.config.tracking.enabled()
    }

    /// Extra bytes each malloc needs around the user block
    pub fn overhead_per_malloc(&self) -> usize {
        if self.enabled() {
            HEADER_SIZE + FOOTER_SIZE
        } else {
            0
        }
    }

    /// Check whether charging `size` more bytes to `flags` crosses a limit
    ///
    /// Limits are only enforced while tracking is on, since they are
    /// measured against the ledger's counters.
    pub fn check_exceeds_limit(&self, size: usize, flags: MemFlags) -> bool {
        match self.limit_check(size, flags) {
            Ok(()) => false,
            Err(e) => {
                tracing::info!(target: "os::malloc", size, %flags, "MallocLimit: {e}");
                true
            }
        }
    }

    /// [`check_exceeds_limit`](Self::check_exceeds_limit) with the crossed limit as an error
    pub fn limit_check(&self, size: usize, flags: MemFlags) -> MemoryResult<()> {
        if !self.enabled() {
            return Ok(());
        }
        let limit = &self.config.malloc_limit;
        if let Some(total) = limit.total() {
            let used = self.summary.total_bytes();
            if used.saturating_add(size) > total {
                return Err(MemoryError::LimitExceeded {
                    category: "total",
                    requested: size,
                    used,
                    limit: total,
                });
            }
        }
        if let Some(category_limit) = limit.category(flags) {
            let used = self.summary.category_bytes(flags);
            if used.saturating_add(size) > category_limit {
                return Err(MemoryError::LimitExceeded {
                    category: flags.short_name(),
                    requested: size,
                    used,
                    limit: category_limit,
                });
            }
        }
        Ok(())
    }

    /// Account a fresh host block and return the user pointer
    ///
    /// # Safety
    /// `outer` must be valid for `size + overhead_per_malloc()` bytes and
    /// not tracked already.
    pub unsafe fn record_malloc(
        &self,
        outer: NonNull<u8>,
        size: usize,
        flags: MemFlags,
        site: CallSite,
    ) -> NonNull<u8> {
        if !self.enabled() {
            return outer;
        }

        let (stack, marker) = if self.level() == TrackingLevel::Detail {
            let stack = CallStack::capture(CAPTURE_SKIP);
            (stack, self.sites.record(site, stack, flags, size))
        } else {
            (CallStack::empty(), 0)
        };
        self.summary.record(flags, size);

        // SAFETY: caller guarantees the outer block covers header, data and footer.
        let inner = unsafe { MallocHeader::new(size, marker, flags as u8).install(outer.as_ptr()) };
        self.live.insert(
            inner as usize,
            LiveBlock {
                size,
                flags,
                site,
                stack,
                marker,
            },
        );
        tracing::trace!(target: "os::malloc", addr = inner as usize, size, %flags, "malloc");

        // SAFETY: inner is outer plus the header size, inside a non-null block.
        unsafe { NonNull::new_unchecked(inner) }
    }

    /// Validate and remove the record for `inner`, returning the host block to free
    ///
    /// On failure the corruption has already been reported and the block
    /// must not be touched again.
    ///
    /// # Safety
    /// If `inner` is in the live table its block must still be allocated.
    pub unsafe fn record_free(&self, inner: NonNull<u8>) -> Result<NonNull<u8>, Corruption> {
        if !self.enabled() {
            return Ok(inner);
        }
        let addr = inner.as_ptr() as usize;
        let Some((_, block)) = self.live.remove(&addr) else {
            return Err(self.corrupt("free", addr, CorruptionKind::NotLive));
        };
        self.account_free(&block);

        // SAFETY: the block was live, so its header and footer are readable.
        unsafe {
            if let Err(kind) = check_block(inner.as_ptr(), &block) {
                return Err(self.corrupt("free", addr, kind));
            }
            MallocHeader::set_marks(inner.as_ptr(), block.size, false);
        }
        tracing::trace!(target: "os::malloc", addr, size = block.size, "free");

        let outer = MallocHeader::outer(inner.as_ptr());
        // SAFETY: outer precedes a non-null inner pointer in the same block.
        Ok(unsafe { NonNull::new_unchecked(outer) })
    }

    /// Check the old block of a realloc and mark it dead
    ///
    /// The block leaves the live table but stays accounted until
    /// [`deaccount`](Self::deaccount); [`revive`](Self::revive) undoes this
    /// when the host realloc fails.
    ///
    /// # Safety
    /// As for [`record_free`](Self::record_free).
    pub unsafe fn mark_dead_for_realloc(
        &self,
        inner: NonNull<u8>,
        flags: MemFlags,
    ) -> Result<FreeInfo, Corruption> {
        let addr = inner.as_ptr() as usize;
        if !self.enabled() {
            return Ok(FreeInfo { inner: addr, block: None });
        }
        let Some((_, block)) = self.live.remove(&addr) else {
            return Err(self.corrupt("realloc", addr, CorruptionKind::NotLive));
        };

        // SAFETY: the block was live, so its header and footer are readable.
        let checked = unsafe { check_block(inner.as_ptr(), &block) };
        let failure = match checked {
            Err(kind) => Some(kind),
            Ok(()) if block.flags != flags => Some(CorruptionKind::FlagsMismatch {
                requested: flags,
                recorded: block.flags,
            }),
            Ok(()) => None,
        };
        if let Some(kind) = failure {
            self.account_free(&block);
            return Err(self.corrupt("realloc", addr, kind));
        }

        // SAFETY: as above.
        unsafe { MallocHeader::set_marks(inner.as_ptr(), block.size, false) };
        Ok(FreeInfo {
            inner: addr,
            block: Some(block),
        })
    }

    /// Undo [`mark_dead_for_realloc`](Self::mark_dead_for_realloc) after a failed host realloc
    ///
    /// # Safety
    /// The old block must still be allocated.
    pub unsafe fn revive(&self, info: &FreeInfo) {
        let Some(block) = info.block else { return };
        // SAFETY: caller guarantees the host realloc left the block in place.
        unsafe { MallocHeader::set_marks(info.inner as *mut u8, block.size, true) };
        self.live.insert(info.inner, block);
    }

    /// Drop the accounting of a block that was reallocated away
    pub fn deaccount(&self, info: &FreeInfo) {
        if let Some(block) = info.block {
            self.account_free(&block);
        }
    }

    /// Route a detected corruption to the handler
    pub fn report_corruption(&self, corruption: Corruption) -> Corruption {
        tracing::error!(
            target: "os::malloc",
            operation = corruption.operation,
            block = corruption.block,
            "native memory corruption: {corruption}"
        );
        self.handler.report(&corruption);
        corruption
    }

    fn corrupt(&self, operation: &'static str, block: usize, kind: CorruptionKind) -> Corruption {
        self.report_corruption(Corruption {
            operation,
            block,
            kind,
        })
    }

    /// Host block behind the user pointer `inner`
    pub(crate) fn outer_pointer(&self, inner: NonNull<u8>) -> NonNull<u8> {
        if !self.enabled() {
            return inner;
        }
        // SAFETY: tracked user pointers sit HEADER_SIZE past a non-null host block.
        unsafe { NonNull::new_unchecked(MallocHeader::outer(inner.as_ptr())) }
    }

    fn account_free(&self, block: &LiveBlock) {
        self.summary.deaccount(block.flags, block.size);
        self.sites.deaccount(block.marker, block.size);
    }

    /// Live counters
    pub fn summary(&self) -> &MallocSummary {
        &self.summary
    }

    /// Record for the live block starting at `inner`
    pub fn lookup(&self, inner: usize) -> Option<LiveBlock> {
        self.live.get(&inner).map(|entry| *entry)
    }

    /// Every live block, by address
    pub fn live_blocks(&self) -> Vec<(usize, LiveBlock)> {
        let mut blocks: Vec<_> = self.live.iter().map(|e| (*e.key(), *e.value())).collect();
        blocks.sort_unstable_by_key(|(addr, _)| *addr);
        blocks
    }

    /// Live blocks grouped by allocation site, largest first
    pub fn leak_report(&self) -> Vec<LeakRecord> {
        let mut groups: HashMap<(CallSite, CallStack, MemFlags), (usize, usize)> = HashMap::new();
        for entry in &self.live {
            let block = entry.value();
            let slot = groups.entry((block.site, block.stack, block.flags)).or_default();
            slot.0 += 1;
            slot.1 += block.size;
        }
        let mut records: Vec<_> = groups
            .into_iter()
            .map(|((site, stack, flags), (blocks, bytes))| LeakRecord {
                site,
                stack,
                flags,
                blocks,
                bytes,
            })
            .collect();
        records.sort_by(|a, b| {
            b.bytes
                .cmp(&a.bytes)
                .then_with(|| a.site.to_string().cmp(&b.site.to_string()))
        });
        records
    }

    /// Per-category text summary; detail level adds per-site lines
    pub fn summary_report(&self) -> String {
        let mut out = String::new();
        let _ = self.write_summary(&mut out);
        out
    }

    fn write_summary(&self, out: &mut String) -> std::fmt::Result {
        writeln!(out, "Native Memory Tracking ({}):", self.level())?;
        if !self.enabled() {
            return writeln!(out, "  not enabled");
        }
        writeln!(out)?;
        let total = self.summary.total();
        writeln!(
            out,
            "Total: malloc={} #{}, peak={} #{}",
            format_bytes(total.bytes as u64),
            total.count,
            format_bytes(total.peak_bytes as u64),
            total.peak_count
        )?;
        writeln!(out)?;
        for flags in MemFlags::ALL {
            let c = self.summary.category(*flags);
            if c.peak_count == 0 {
                continue;
            }
            writeln!(
                out,
                "-{:>26} (malloc={} #{}, peak={} #{})",
                flags.name(),
                format_bytes(c.bytes as u64),
                c.count,
                format_bytes(c.peak_bytes as u64),
                c.peak_count
            )?;
        }

        if self.level() == TrackingLevel::Detail {
            writeln!(out, "\nDetails:\n")?;
            let mut sites = self.sites.snapshot();
            sites.retain(|s| s.counter.count > 0);
            sites.sort_by(|a, b| b.counter.bytes.cmp(&a.counter.bytes));
            for s in sites {
                writeln!(out, "[{}]", s.site)?;
                s.stack.print_on(out, 4)?;
                writeln!(
                    out,
                    "{:28}(malloc={} type={} #{})\n",
                    "",
                    format_bytes(s.counter.bytes as u64),
                    s.flags.name(),
                    s.counter.count
                )?;
            }
        }
        Ok(())
    }

    /// Describe `addr` if it falls in a live block or its header
    pub fn describe(&self, addr: usize) -> Option<String> {
        self.live.iter().find_map(|entry| {
            let (inner, block) = (*entry.key(), entry.value());
            if (inner..inner + block.size).contains(&addr) {
                Some(format!(
                    "{addr:#x} is {} bytes inside a live malloc'd block of {} bytes ({}) allocated at {}",
                    addr - inner,
                    block.size,
                    block.flags,
                    block.site
                ))
            } else if (inner - HEADER_SIZE..inner).contains(&addr) {
                Some(format!(
                    "{addr:#x} is in the malloc header of block {inner:#x} ({} bytes, {})",
                    block.size, block.flags
                ))
            } else {
                None
            }
        })
    }
}

impl LocationFinder for MallocLedger {
    fn describe(&self, addr: usize) -> Option<String> {
        MallocLedger::describe(self, addr)
    }
}

/// Compare the in-band header and footer with the side-table record
///
/// # Safety
/// The block must still be allocated with the recorded size.
unsafe fn check_block(inner: *mut u8, block: &LiveBlock) -> Result<(), CorruptionKind> {
    // SAFETY: caller guarantees the block is allocated.
    let header = unsafe { MallocHeader::read(inner) };
    if header.canary != LIVE_CANARY {
        return Err(CorruptionKind::HeaderCanary {
            expected: LIVE_CANARY,
            found: header.canary,
        });
    }
    if header.size != block.size as u64 {
        return Err(CorruptionKind::HeaderMismatch {
            field: "size",
            expected: block.size as u64,
            found: header.size,
        });
    }
    if header.flags != block.flags as u8 {
        return Err(CorruptionKind::HeaderMismatch {
            field: "category",
            expected: block.flags as u64,
            found: u64::from(header.flags),
        });
    }
    if header.site_marker != block.marker {
        return Err(CorruptionKind::HeaderMismatch {
            field: "site marker",
            expected: u64::from(block.marker),
            found: u64::from(header.site_marker),
        });
    }
    // SAFETY: size matched, so the footer position is inside the block.
    let footer = unsafe { MallocHeader::read_footer(inner, block.size) };
    if footer != LIVE_FOOTER {
        return Err(CorruptionKind::FooterCanary {
            expected: LIVE_FOOTER,
            found: footer,
        });
    }
    Ok(())
}
