//! Virtual memory manager
//!
//! Thin layer over [`Platform`] that validates ranges, logs failures and
//! feeds the [`VirtualMemoryTracker`]. Failures come back as
//! [`MemoryError`]; deciding whether to retry smaller or give up is the
//! caller's business, with [`VirtualMemory::commit_or_exit`] as the one
//! exception.
//!
//! Region accounting is independent of the malloc ledger: regions are
//! counted in pages reserved and committed, not in blocks.
//!
//! ```no_run
//! use stratum_memory::{MemFlags, MemoryConfig, VirtualMemory};
//!
//! let vm = VirtualMemory::host(&MemoryConfig::default());
//! let page = vm.page_size();
//! let base = vm.reserve(16 * page, false, MemFlags::Gc)?;
//! // SAFETY: the range was just reserved and nothing else uses it.
//! unsafe {
//!     vm.commit(base, 4 * page, false)?;
//!     vm.pretouch(base, base + 4 * page, page);
//!     vm.release(base, 16 * page)?;
//! }
//! # Ok::<(), stratum_memory::MemoryError>(())
//! ```

mod tracker;

pub use tracker::{ReservedRegion, VirtualMemoryTracker, VirtualMemoryUsage};

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use stratum_system::utils::align_down;
use stratum_system::{Errno, Platform, platform};

use crate::callsite::CallSite;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult, exit_out_of_memory};
use crate::flags::MemFlags;
use crate::page_sizes::{PageSizeSelector, trace_page_sizes_for_requested_size};

/// Reserves, commits and maps address space
pub struct VirtualMemory {
    platform: Arc<dyn Platform>,
    tracker: Arc<VirtualMemoryTracker>,
    selector: PageSizeSelector,
    tracking: bool,
}

impl VirtualMemory {
    /// Manager over `platform` with a fresh tracker
    pub fn new(platform: Arc<dyn Platform>, config: &MemoryConfig) -> Self {
        Self::with_tracker(platform, Arc::new(VirtualMemoryTracker::new()), config)
    }

    /// Manager for the host platform
    pub fn host(config: &MemoryConfig) -> Self {
        Self::new(platform::host(), config)
    }

    /// Manager sharing an existing tracker
    pub fn with_tracker(platform: Arc<dyn Platform>, tracker: Arc<VirtualMemoryTracker>, config: &MemoryConfig) -> Self {
        let selector = PageSizeSelector::from_platform(platform.as_ref(), config);
        Self {
            platform,
            tracker,
            selector,
            tracking: config.tracking.enabled(),
        }
    }

    /// Underlying platform
    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Region accounting
    pub fn tracker(&self) -> &Arc<VirtualMemoryTracker> {
        &self.tracker
    }

    /// Page size selection for this host
    pub fn selector(&self) -> &PageSizeSelector {
        &self.selector
    }

    /// Base page size
    pub fn page_size(&self) -> usize {
        self.selector.vm_page_size()
    }

    /// Granularity reservations are rounded to
    pub fn allocation_granularity(&self) -> usize {
        self.platform.vm_allocation_granularity()
    }

    /// Check if regions are tracked
    pub fn tracking(&self) -> bool {
        self.tracking
    }

    /// Reserve `bytes` of address space
    #[track_caller]
    pub fn reserve(&self, bytes: usize, executable: bool, flags: MemFlags) -> MemoryResult<usize> {
        if bytes == 0 {
            return Err(MemoryError::InvalidRange { addr: 0, bytes });
        }
        let site = CallSite::caller();
        match self.platform.reserve(bytes, executable) {
            Ok(addr) => {
                if self.tracking {
                    self.tracker.record_reserve(addr, bytes, flags, site);
                }
                tracing::trace!(target: "os::vm", "Reserved [{addr:#x}, +{bytes}) for {flags}");
                Ok(addr)
            }
            Err(e) => {
                tracing::debug!(target: "os::vm", "Reserving {bytes} bytes failed, errno {}", Errno::from(&e));
                Err(MemoryError::reserve(bytes, &e))
            }
        }
    }

    /// Reserve exactly at `addr`, never clobbering an existing mapping
    ///
    /// The region is tracked as [`MemFlags::None`]; retag it with
    /// [`set_flags`](Self::set_flags).
    #[track_caller]
    pub fn attempt_reserve_at(&self, addr: usize, bytes: usize, executable: bool) -> MemoryResult<usize> {
        check_range(addr, bytes)?;
        let site = CallSite::caller();
        match self.platform.attempt_reserve_at(addr, bytes, executable) {
            Ok(result) => {
                if self.tracking {
                    self.tracker.record_reserve(result, bytes, MemFlags::None, site);
                }
                Ok(result)
            }
            Err(e) => {
                tracing::debug!(
                    target: "os::vm",
                    "Attempt to reserve memory at {addr:#x} for {bytes} bytes failed, errno {}",
                    Errno::from(&e)
                );
                Err(MemoryError::reserve(bytes, &e))
            }
        }
    }

    /// Change the tracked category of the region holding `addr`
    pub fn set_flags(&self, addr: usize, flags: MemFlags) {
        if self.tracking {
            self.tracker.record_flags(addr, flags);
        }
    }

    /// Back `[addr, addr + bytes)` with memory
    ///
    /// # Safety
    /// The range must lie inside a reservation owned by the caller.
    #[track_caller]
    pub unsafe fn commit(&self, addr: usize, bytes: usize, executable: bool) -> MemoryResult<()> {
        check_range(addr, bytes)?;
        // SAFETY: caller owns the reservation.
        let result = unsafe { self.platform.commit(addr, bytes, executable) };
        self.finish_commit(addr, bytes, executable, result)
    }

    /// [`commit`](Self::commit) with a large-page alignment hint
    ///
    /// # Safety
    /// Same as [`commit`](Self::commit).
    #[track_caller]
    pub unsafe fn commit_aligned(
        &self,
        addr: usize,
        bytes: usize,
        alignment_hint: usize,
        executable: bool,
    ) -> MemoryResult<()> {
        check_range(addr, bytes)?;
        // SAFETY: caller owns the reservation.
        let result = unsafe { self.platform.commit_aligned(addr, bytes, alignment_hint, executable) };
        self.finish_commit(addr, bytes, executable, result)
    }

    /// [`commit`](Self::commit), exiting the process on failure
    ///
    /// # Safety
    /// Same as [`commit`](Self::commit).
    #[track_caller]
    pub unsafe fn commit_or_exit(&self, addr: usize, bytes: usize, executable: bool, context: &str) {
        // SAFETY: forwarded caller contract.
        if unsafe { self.commit(addr, bytes, executable) }.is_err() {
            exit_out_of_memory(bytes, context);
        }
    }

    fn finish_commit(
        &self,
        addr: usize,
        bytes: usize,
        executable: bool,
        result: std::io::Result<()>,
    ) -> MemoryResult<()> {
        match result {
            Ok(()) => {
                if self.tracking {
                    self.tracker.record_commit(addr, bytes);
                }
                Ok(())
            }
            Err(e) => {
                let errno = Errno::from(&e);
                tracing::warn!(
                    target: "os::vm",
                    "os::commit_memory({addr:#x}, {bytes}, {}) failed; error='{}' (errno={})",
                    i32::from(executable),
                    errno.description(),
                    errno.0
                );
                Err(MemoryError::commit(addr, bytes, &e))
            }
        }
    }

    /// Drop the backing of a committed range
    ///
    /// # Safety
    /// The range must be committed and no longer referenced.
    pub unsafe fn uncommit(&self, addr: usize, bytes: usize, executable: bool) -> MemoryResult<()> {
        check_range(addr, bytes)?;
        // SAFETY: caller guarantees the range is unreferenced.
        match unsafe { self.platform.uncommit(addr, bytes, executable) } {
            Ok(()) => {
                if self.tracking {
                    self.tracker.record_uncommit(addr, bytes);
                }
                Ok(())
            }
            Err(e) => {
                tracing::info!(target: "os::vm", "os::uncommit_memory failed ({addr:#x}, {bytes})");
                Err(MemoryError::uncommit(addr, bytes, &e))
            }
        }
    }

    /// Return a reservation to the host
    ///
    /// # Safety
    /// The range must be reserved by the caller and no longer referenced.
    pub unsafe fn release(&self, addr: usize, bytes: usize) -> MemoryResult<()> {
        check_range(addr, bytes)?;
        // SAFETY: caller guarantees the range is unreferenced.
        match unsafe { self.platform.release(addr, bytes) } {
            Ok(()) => {
                if self.tracking {
                    self.tracker.record_release(addr, bytes);
                }
                Ok(())
            }
            Err(e) => {
                tracing::info!(target: "os::vm", "os::release_memory failed ({addr:#x}, {bytes})");
                Err(MemoryError::release(addr, bytes, &e))
            }
        }
    }

    /// Reserve and commit a region backed by `page_size` pages
    #[track_caller]
    pub fn reserve_special(
        &self,
        bytes: usize,
        alignment: usize,
        page_size: usize,
        addr: Option<usize>,
        executable: bool,
    ) -> MemoryResult<usize> {
        if bytes == 0 {
            return Err(MemoryError::InvalidRange {
                addr: addr.unwrap_or(0),
                bytes,
            });
        }
        let site = CallSite::caller();
        match self.platform.reserve_special(bytes, alignment, page_size, addr, executable) {
            Ok(result) => {
                if self.tracking {
                    self.tracker.record_reserve_and_commit(result, bytes, MemFlags::None, site);
                }
                trace_page_sizes_for_requested_size("Reserve special", bytes, page_size, alignment, result, bytes);
                Ok(result)
            }
            Err(e) => {
                tracing::debug!(
                    target: "os::vm",
                    "Reserving {bytes} bytes of {page_size} byte pages failed, errno {}",
                    Errno::from(&e)
                );
                Err(MemoryError::reserve(bytes, &e))
            }
        }
    }

    /// Release a region from [`reserve_special`](Self::reserve_special)
    ///
    /// # Safety
    /// The region must be unreferenced.
    pub unsafe fn release_special(&self, addr: usize, bytes: usize) -> MemoryResult<()> {
        check_range(addr, bytes)?;
        // SAFETY: caller guarantees the region is unreferenced.
        match unsafe { self.platform.release_special(addr, bytes) } {
            Ok(()) => {
                if self.tracking {
                    self.tracker.record_release(addr, bytes);
                }
                Ok(())
            }
            Err(e) => {
                tracing::info!(target: "os::vm", "os::release_memory_special failed ({addr:#x}, {bytes})");
                Err(MemoryError::release(addr, bytes, &e))
            }
        }
    }

    /// Map `bytes` of shared memory backed by `fd`
    #[track_caller]
    pub fn map_to_file(&self, bytes: usize, fd: RawFd, flags: MemFlags) -> MemoryResult<usize> {
        if bytes == 0 {
            return Err(MemoryError::InvalidRange { addr: 0, bytes });
        }
        let site = CallSite::caller();
        // SAFETY: no fixed address, so nothing existing is replaced.
        let result = unsafe { self.platform.map_memory_to_file(None, bytes, fd) };
        self.finish_map(bytes, flags, site, result)
    }

    /// [`map_to_file`](Self::map_to_file) at a fixed address
    ///
    /// # Safety
    /// Any existing mapping at `addr` is replaced.
    #[track_caller]
    pub unsafe fn attempt_map_to_file_at(
        &self,
        addr: usize,
        bytes: usize,
        fd: RawFd,
        flags: MemFlags,
    ) -> MemoryResult<usize> {
        check_range(addr, bytes)?;
        let site = CallSite::caller();
        // SAFETY: forwarded caller contract.
        let result = unsafe { self.platform.map_memory_to_file(Some(addr), bytes, fd) };
        self.finish_map(bytes, flags, site, result)
    }

    /// Map `bytes` of `fd` at `offset`
    ///
    /// # Safety
    /// When `addr` is given, any existing mapping there is replaced.
    #[allow(clippy::too_many_arguments)]
    #[track_caller]
    pub unsafe fn map(
        &self,
        fd: RawFd,
        offset: u64,
        addr: Option<usize>,
        bytes: usize,
        read_only: bool,
        allow_exec: bool,
        flags: MemFlags,
    ) -> MemoryResult<usize> {
        if bytes == 0 {
            return Err(MemoryError::InvalidRange {
                addr: addr.unwrap_or(0),
                bytes,
            });
        }
        let site = CallSite::caller();
        // SAFETY: forwarded caller contract.
        let result = unsafe { self.platform.map_file(fd, offset, addr, bytes, read_only, allow_exec) };
        self.finish_map(bytes, flags, site, result)
    }

    fn finish_map(
        &self,
        bytes: usize,
        flags: MemFlags,
        site: CallSite,
        result: std::io::Result<usize>,
    ) -> MemoryResult<usize> {
        match result {
            Ok(addr) => {
                if self.tracking {
                    self.tracker.record_reserve_and_commit(addr, bytes, flags, site);
                }
                Ok(addr)
            }
            Err(e) => {
                tracing::debug!(target: "os::vm", "Mapping {bytes} bytes failed, errno {}", Errno::from(&e));
                Err(MemoryError::map(bytes, &e))
            }
        }
    }

    /// Replace a file mapping in place
    ///
    /// The region keeps its tracked identity.
    ///
    /// # Safety
    /// `[addr, addr + bytes)` must be an unreferenced mapping owned by the caller.
    pub unsafe fn remap(
        &self,
        fd: RawFd,
        offset: u64,
        addr: usize,
        bytes: usize,
        read_only: bool,
        allow_exec: bool,
    ) -> MemoryResult<usize> {
        check_range(addr, bytes)?;
        // SAFETY: forwarded caller contract.
        unsafe { self.platform.remap_file(fd, offset, addr, bytes, read_only, allow_exec) }
            .map_err(|e| MemoryError::map(bytes, &e))
    }

    /// Remove a file mapping
    ///
    /// # Safety
    /// The mapping must be unreferenced.
    pub unsafe fn unmap(&self, addr: usize, bytes: usize) -> MemoryResult<()> {
        check_range(addr, bytes)?;
        // SAFETY: caller guarantees the mapping is unreferenced.
        match unsafe { self.platform.unmap(addr, bytes) } {
            Ok(()) => {
                if self.tracking {
                    self.tracker.record_release(addr, bytes);
                }
                Ok(())
            }
            Err(e) => {
                tracing::info!(target: "os::vm", "os::unmap_memory failed ({addr:#x}, {bytes})");
                Err(MemoryError::unmap(addr, bytes, &e))
            }
        }
    }

    /// Discard contents, keeping the range committed
    ///
    /// # Safety
    /// The range contents must be disposable.
    pub unsafe fn free_memory(&self, addr: usize, bytes: usize, alignment_hint: usize) -> MemoryResult<()> {
        check_range(addr, bytes)?;
        // SAFETY: forwarded caller contract.
        unsafe { self.platform.free_memory(addr, bytes, alignment_hint) };
        Ok(())
    }

    /// Advise the host about the preferred backing page size
    ///
    /// # Safety
    /// The range must be committed.
    pub unsafe fn realign(&self, addr: usize, bytes: usize, alignment_hint: usize) -> MemoryResult<()> {
        check_range(addr, bytes)?;
        // SAFETY: forwarded caller contract.
        unsafe { self.platform.realign(addr, bytes, alignment_hint) };
        Ok(())
    }

    /// Turn a committed range into guard pages
    ///
    /// # Safety
    /// The range must be committed, owned by the caller and unreferenced.
    pub unsafe fn create_stack_guard_pages(&self, addr: usize, bytes: usize) -> MemoryResult<()> {
        check_range(addr, bytes)?;
        // SAFETY: forwarded caller contract.
        unsafe { self.platform.create_stack_guard_pages(addr, bytes) }.map_err(|e| MemoryError::commit(addr, bytes, &e))
    }

    /// Make sure every page of `[start, end)` is backed
    ///
    /// Each page is touched with an atomic add of zero, so concurrent users
    /// of the memory never observe a change. The page holding `start` is
    /// touched at its first word, which may lie below `start`.
    ///
    /// # Safety
    /// Every page overlapping `[start, end)` must be committed and writable.
    pub unsafe fn pretouch(&self, start: usize, end: usize, page_size: usize) {
        assert!(start <= end, "invalid range: {start:#x} -> {end:#x}");
        assert!(page_size.is_power_of_two(), "page size misaligned: {page_size}");
        assert!(
            page_size >= size_of::<i32>(),
            "page size too small: {page_size}"
        );
        if start == end {
            return;
        }
        let first = align_down(start, page_size);
        let last = align_down(end - 1, page_size);
        let touch_size = self.platform.pretouch_page_size(first, last, page_size);
        if touch_size == 0 {
            return;
        }
        let last = align_down(end - 1, touch_size);
        let mut cur = first;
        loop {
            // SAFETY: `cur` is page aligned inside a committed writable range.
            unsafe { AtomicI32::from_ptr(cur as *mut i32) }.fetch_add(0, Ordering::Relaxed);
            if cur >= last {
                break;
            }
            cur += touch_size;
        }
    }
}

impl fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMemory")
            .field("platform", &self.platform)
            .field("selector", &self.selector)
            .field("tracking", &self.tracking)
            .finish_non_exhaustive()
    }
}

fn check_range(addr: usize, bytes: usize) -> MemoryResult<()> {
    if addr == 0 || bytes == 0 {
        return Err(MemoryError::InvalidRange { addr, bytes });
    }
    if addr.checked_add(bytes).is_none() {
        return Err(MemoryError::SizeOverflow {
            operation: "virtual memory range",
        });
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::TrackingLevel;
    use pretty_assertions::assert_eq;

    fn tracked() -> VirtualMemory {
        VirtualMemory::host(&MemoryConfig {
            tracking: TrackingLevel::Summary,
            ..MemoryConfig::default()
        })
    }

    #[test]
    fn empty_ranges_are_rejected() {
        let vm = tracked();
        assert_eq!(
            vm.reserve(0, false, MemFlags::Gc),
            Err(MemoryError::InvalidRange { addr: 0, bytes: 0 })
        );
        // SAFETY: rejected before reaching the host.
        unsafe {
            assert_eq!(
                vm.commit(0, 4096, false),
                Err(MemoryError::InvalidRange { addr: 0, bytes: 4096 })
            );
            assert_eq!(
                vm.release(0x1000, 0),
                Err(MemoryError::InvalidRange { addr: 0x1000, bytes: 0 })
            );
            assert_eq!(
                vm.uncommit(usize::MAX - 8, 4096, false),
                Err(MemoryError::SizeOverflow {
                    operation: "virtual memory range"
                })
            );
        }
    }

    #[test]
    fn reserve_commit_release_is_tracked() {
        let vm = tracked();
        let page = vm.page_size();
        let base = vm.reserve(8 * page, false, MemFlags::Gc).unwrap();
        assert_eq!(vm.tracker().category(MemFlags::Gc).reserved, 8 * page);

        // SAFETY: the range belongs to this test.
        unsafe {
            vm.commit(base, 2 * page, false).unwrap();
            assert_eq!(vm.tracker().category(MemFlags::Gc).committed, 2 * page);

            vm.uncommit(base, page, false).unwrap();
            assert_eq!(vm.tracker().category(MemFlags::Gc).committed, page);

            vm.release(base, 8 * page).unwrap();
        }
        assert_eq!(vm.tracker().total(), VirtualMemoryUsage::default());
    }

    #[test]
    fn untracked_manager_records_nothing() {
        let vm = VirtualMemory::host(&MemoryConfig::default());
        let page = vm.page_size();
        let base = vm.reserve(2 * page, false, MemFlags::Gc).unwrap();
        assert!(vm.tracker().regions().is_empty());
        // SAFETY: the range belongs to this test.
        unsafe { vm.release(base, 2 * page).unwrap() };
    }

    #[test]
    fn pretouch_keeps_contents() {
        let vm = tracked();
        let page = vm.page_size();
        let base = vm.reserve(4 * page, false, MemFlags::Test).unwrap();
        // SAFETY: the range belongs to this test and is committed before use.
        unsafe {
            vm.commit(base, 4 * page, false).unwrap();
            let bytes = std::slice::from_raw_parts_mut(base as *mut u8, 4 * page);
            bytes.fill(0x5A);

            // Unaligned bounds, ending inside the last page.
            vm.pretouch(base + 3, base + 3 * page + 17, page);
            assert!(bytes.iter().all(|&b| b == 0x5A));

            vm.pretouch(base, base, page);
            vm.release(base, 4 * page).unwrap();
        }
    }

    #[test]
    fn set_flags_retags_region() {
        let vm = tracked();
        let page = vm.page_size();
        let base = vm.reserve(page, false, MemFlags::None).unwrap();
        vm.set_flags(base, MemFlags::Code);
        assert_eq!(vm.tracker().category(MemFlags::Code).reserved, page);
        // SAFETY: the range belongs to this test.
        unsafe { vm.release(base, page).unwrap() };
    }
}
