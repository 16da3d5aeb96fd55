//! Virtual memory manager over a recording platform

use std::ffi::c_void;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use stratum_memory::virtual_memory::VirtualMemoryUsage;
use stratum_memory::{MemFlags, MemoryConfig, MemoryError, TrackingLevel, VirtualMemory};
use stratum_system::platform::{Frame, NativeThreadId, Platform};
use stratum_system::probe::{FetchWidth, SafeFetch};
use stratum_system::Errno;

const PAGE: usize = 4096;
const M: usize = 1024 * 1024;

/// Hands out fake addresses and remembers every call; touches no memory
#[derive(Debug)]
struct RecordingPlatform {
    next: AtomicUsize,
    fail: AtomicBool,
    touch_size: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl RecordingPlatform {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicUsize::new(0x4000_0000),
            fail: AtomicBool::new(false),
            touch_size: AtomicUsize::new(PAGE),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call(&self, name: impl Into<String>) -> io::Result<()> {
        self.calls.lock().push(name.into());
        if self.fail.load(Ordering::Relaxed) {
            Err(io::Error::from_raw_os_error(libc::ENOMEM))
        } else {
            Ok(())
        }
    }

    fn hand_out(&self, bytes: usize) -> usize {
        self.next.fetch_add(bytes.next_multiple_of(PAGE) + PAGE, Ordering::Relaxed)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl SafeFetch for RecordingPlatform {
    fn try_read(&self, _addr: usize, _width: FetchWidth) -> Option<u64> {
        None
    }
}

impl Platform for RecordingPlatform {
    fn vm_page_size(&self) -> usize {
        PAGE
    }

    fn supported_page_sizes(&self) -> Vec<usize> {
        vec![PAGE, 2 * M, 1024 * M]
    }

    fn default_large_page_size(&self) -> Option<usize> {
        Some(2 * M)
    }

    fn reserve(&self, bytes: usize, _executable: bool) -> io::Result<usize> {
        self.call(format!("reserve {bytes}"))?;
        Ok(self.hand_out(bytes))
    }

    fn attempt_reserve_at(&self, addr: usize, bytes: usize, _executable: bool) -> io::Result<usize> {
        self.call(format!("reserve_at {addr:#x} {bytes}"))?;
        Ok(addr)
    }

    unsafe fn commit(&self, addr: usize, bytes: usize, _executable: bool) -> io::Result<()> {
        self.call(format!("commit {addr:#x} {bytes}"))
    }

    unsafe fn uncommit(&self, addr: usize, bytes: usize, _executable: bool) -> io::Result<()> {
        self.call(format!("uncommit {addr:#x} {bytes}"))
    }

    unsafe fn release(&self, addr: usize, bytes: usize) -> io::Result<()> {
        self.call(format!("release {addr:#x} {bytes}"))
    }

    fn reserve_special(
        &self,
        bytes: usize,
        _alignment: usize,
        page_size: usize,
        addr: Option<usize>,
        _executable: bool,
    ) -> io::Result<usize> {
        self.call(format!("reserve_special {bytes} {page_size}"))?;
        Ok(addr.unwrap_or_else(|| self.hand_out(bytes)))
    }

    unsafe fn release_special(&self, addr: usize, bytes: usize) -> io::Result<()> {
        self.call(format!("release_special {addr:#x} {bytes}"))
    }

    unsafe fn map_memory_to_file(&self, addr: Option<usize>, bytes: usize, fd: RawFd) -> io::Result<usize> {
        self.call(format!("map_to_file {bytes} fd={fd}"))?;
        Ok(addr.unwrap_or_else(|| self.hand_out(bytes)))
    }

    unsafe fn map_file(
        &self,
        fd: RawFd,
        offset: u64,
        addr: Option<usize>,
        bytes: usize,
        read_only: bool,
        _allow_exec: bool,
    ) -> io::Result<usize> {
        self.call(format!("map_file fd={fd} +{offset} {bytes} ro={read_only}"))?;
        Ok(addr.unwrap_or_else(|| self.hand_out(bytes)))
    }

    unsafe fn unmap(&self, addr: usize, bytes: usize) -> io::Result<()> {
        self.call(format!("unmap {addr:#x} {bytes}"))
    }

    unsafe fn free_memory(&self, addr: usize, bytes: usize, _alignment_hint: usize) {
        let _ = self.call(format!("free_memory {addr:#x} {bytes}"));
    }

    unsafe fn realign(&self, addr: usize, bytes: usize, alignment_hint: usize) {
        let _ = self.call(format!("realign {addr:#x} {bytes} {alignment_hint}"));
    }

    unsafe fn create_stack_guard_pages(&self, addr: usize, bytes: usize) -> io::Result<()> {
        self.call(format!("guard {addr:#x} {bytes}"))
    }

    fn pretouch_page_size(&self, _start: usize, _end: usize, _page_size: usize) -> usize {
        self.touch_size.load(Ordering::Relaxed)
    }

    fn set_native_priority(&self, _thread: NativeThreadId, _priority: i32) -> io::Result<()> {
        Ok(())
    }

    fn get_native_priority(&self, _thread: NativeThreadId) -> io::Result<i32> {
        Ok(0)
    }

    fn current_thread_id(&self) -> NativeThreadId {
        1
    }

    unsafe fn fetch_frame_from_context(&self, _context: *const c_void) -> Option<Frame> {
        None
    }
}

fn manager(level: TrackingLevel) -> (VirtualMemory, Arc<RecordingPlatform>) {
    let _ = stratum_log::init_test();
    let platform = RecordingPlatform::new();
    let config = MemoryConfig {
        tracking: level,
        use_large_pages: true,
        large_page_size: Some(2 * M),
        ..MemoryConfig::default()
    };
    (VirtualMemory::new(platform.clone(), &config), platform)
}

#[test]
fn heap_lifecycle_is_accounted() {
    let (vm, _) = manager(TrackingLevel::Summary);
    let base = vm.reserve(64 * PAGE, false, MemFlags::JavaHeap).unwrap();

    // SAFETY: the recording platform touches no memory.
    unsafe {
        vm.commit(base, 16 * PAGE, false).unwrap();
        vm.commit_aligned(base + 16 * PAGE, 16 * PAGE, 2 * M, false).unwrap();
        vm.uncommit(base + 8 * PAGE, 8 * PAGE, false).unwrap();
    }
    assert_eq!(
        vm.tracker().category(MemFlags::JavaHeap),
        VirtualMemoryUsage {
            reserved: 64 * PAGE,
            committed: 24 * PAGE
        }
    );

    // Shrink the reservation from the top, then drop the rest.
    // SAFETY: as above.
    unsafe {
        vm.release(base + 32 * PAGE, 32 * PAGE).unwrap();
        assert_eq!(vm.tracker().category(MemFlags::JavaHeap).reserved, 32 * PAGE);
        vm.release(base, 32 * PAGE).unwrap();
    }
    assert!(vm.tracker().regions().is_empty());
}

#[test]
fn failures_are_not_recorded() {
    let (vm, platform) = manager(TrackingLevel::Summary);
    let base = vm.reserve(8 * PAGE, false, MemFlags::Code).unwrap();
    platform.fail.store(true, Ordering::Relaxed);

    let err = vm.reserve(8 * PAGE, false, MemFlags::Code).unwrap_err();
    assert_eq!(err.errno(), Some(Errno(libc::ENOMEM)));
    assert_eq!(err.code(), "MEM:VM:RESERVE");

    // SAFETY: the recording platform touches no memory.
    unsafe {
        assert!(matches!(vm.commit(base, PAGE, false), Err(MemoryError::Commit { .. })));
        assert!(matches!(vm.release(base, 8 * PAGE), Err(MemoryError::Release { .. })));
    }
    assert!(matches!(
        vm.attempt_reserve_at(0x9000_0000, PAGE, false),
        Err(MemoryError::Reserve { .. })
    ));

    let regions = vm.tracker().regions();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].committed_size(), 0);
}

#[test]
fn invalid_ranges_never_reach_the_platform() {
    let (vm, platform) = manager(TrackingLevel::Summary);
    // SAFETY: rejected before any platform call.
    unsafe {
        assert_eq!(
            vm.commit(0x1000, 0, false),
            Err(MemoryError::InvalidRange { addr: 0x1000, bytes: 0 })
        );
        assert!(vm.unmap(0, PAGE).is_err());
        assert!(vm.free_memory(0, PAGE, PAGE).is_err());
        assert!(vm.create_stack_guard_pages(0x1000, 0).is_err());
    }
    assert!(vm.map_to_file(0, 3, MemFlags::JavaHeap).is_err());
    assert!(platform.calls().is_empty());
}

#[test]
fn special_and_mapped_regions_count_as_committed() {
    let (vm, platform) = manager(TrackingLevel::Summary);
    let special = vm.reserve_special(4 * M, 2 * M, 2 * M, None, false).unwrap();
    vm.set_flags(special, MemFlags::JavaHeap);
    let mapped = vm.map_to_file(8 * PAGE, 7, MemFlags::JavaHeap).unwrap();
    // SAFETY: the recording platform touches no memory.
    let image = unsafe { vm.map(9, 4096, None, 2 * PAGE, true, false, MemFlags::Class) }.unwrap();

    assert_eq!(
        vm.tracker().category(MemFlags::JavaHeap),
        VirtualMemoryUsage {
            reserved: 4 * M + 8 * PAGE,
            committed: 4 * M + 8 * PAGE
        }
    );
    assert_eq!(vm.tracker().category(MemFlags::Class).committed, 2 * PAGE);

    // SAFETY: as above.
    unsafe {
        vm.remap(9, 0, image, 2 * PAGE, true, false).unwrap();
        assert_eq!(vm.tracker().category(MemFlags::Class).committed, 2 * PAGE);

        vm.unmap(image, 2 * PAGE).unwrap();
        vm.unmap(mapped, 8 * PAGE).unwrap();
        vm.release_special(special, 4 * M).unwrap();
    }
    assert_eq!(vm.tracker().total(), VirtualMemoryUsage::default());

    let calls = platform.calls();
    assert_eq!(calls[0], "reserve_special 4194304 2097152");
    assert!(calls.iter().any(|c| c == "map_file fd=9 +4096 8192 ro=true"), "{calls:?}");
}

#[test]
fn attempt_reserve_at_tracks_untagged_region() {
    let (vm, _) = manager(TrackingLevel::Summary);
    let addr = vm.attempt_reserve_at(0x7000_0000, 4 * PAGE, false).unwrap();
    assert_eq!(addr, 0x7000_0000);
    assert_eq!(vm.tracker().category(MemFlags::None).reserved, 4 * PAGE);
    let described = vm.tracker().describe(addr + 5).unwrap();
    assert!(described.contains("reserved region [0x70000000, 0x70004000) (Unknown)"), "{described}");
}

#[test]
fn tracking_off_skips_tracker() {
    let (vm, platform) = manager(TrackingLevel::Off);
    let base = vm.reserve(4 * PAGE, false, MemFlags::Gc).unwrap();
    // SAFETY: the recording platform touches no memory.
    unsafe { vm.commit(base, 4 * PAGE, false).unwrap() };
    assert!(vm.tracker().regions().is_empty());
    assert_eq!(platform.calls().len(), 2);
}

#[test]
fn pretouch_skipped_when_host_backs_range() {
    let (vm, platform) = manager(TrackingLevel::Off);
    platform.touch_size.store(0, Ordering::Relaxed);
    // SAFETY: with a touch size of 0 no address is dereferenced.
    unsafe { vm.pretouch(0x1000, 0x9000, PAGE) };
}

#[test]
fn page_sizes_follow_configured_cap() {
    let (vm, _) = manager(TrackingLevel::Off);
    let selector = vm.selector();
    assert_eq!(selector.sizes().to_string(), "4k, 2M");
    assert_eq!(selector.page_size_for_region_aligned(64 * M, 8), 2 * M);
    assert_eq!(selector.page_size_for_region_aligned(3 * M, 1), PAGE);
    assert_eq!(selector.page_size_for_region_unaligned(3 * M, 1), 2 * M);
}
