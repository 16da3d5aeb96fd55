//! Host capability interface
//!
//! Every OS-facing primitive the runtime needs is a method on [`Platform`].
//! The memory manager, the priority mapping and the crash formatters are
//! written against the trait only; [`PosixPlatform`] is the one
//! implementation compiled for Unix hosts, and tests substitute recording
//! fakes.
//!
//! Methods mirror the host calls they wrap and report failure as
//! [`io::Error`] with the raw errno preserved. Accounting, logging and
//! argument validation belong to the callers.

use std::ffi::c_void;
use std::fmt;
use std::io;
use std::os::fd::RawFd;

use crate::diagnostics::Errno;
use crate::probe::SafeFetch;

#[cfg(unix)]
mod posix;

#[cfg(unix)]
pub use posix::PosixPlatform;

/// Host thread identifier (`gettid` on Linux)
pub type NativeThreadId = i64;

/// Registers recovered from a trap context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    /// Program counter
    pub pc: usize,
    /// Stack pointer
    pub sp: usize,
    /// Frame pointer
    pub fp: usize,
}

/// Host operations the runtime layer is built on
///
/// Calls taking an address into existing mappings are `unsafe`: they can
/// replace or drop memory other code still references.
pub trait Platform: SafeFetch + Send + Sync + fmt::Debug {
    /// Base page size
    fn vm_page_size(&self) -> usize;

    /// Granularity of reservations
    fn vm_allocation_granularity(&self) -> usize {
        self.vm_page_size()
    }

    /// Every page size the host can back memory with, including the base size
    fn supported_page_sizes(&self) -> Vec<usize>;

    /// Preferred large page size, if large pages exist at all
    fn default_large_page_size(&self) -> Option<usize>;

    /// Reserve `bytes` of address space without backing
    fn reserve(&self, bytes: usize, executable: bool) -> io::Result<usize>;

    /// Reserve exactly at `addr`, failing instead of clobbering
    fn attempt_reserve_at(&self, addr: usize, bytes: usize, executable: bool) -> io::Result<usize>;

    /// Back a reserved range with memory
    ///
    /// # Safety
    /// `[addr, addr + bytes)` must lie inside a reservation owned by the caller.
    unsafe fn commit(&self, addr: usize, bytes: usize, executable: bool) -> io::Result<()>;

    /// [`commit`](Self::commit) plus a large-page alignment hint
    ///
    /// # Safety
    /// Same as [`commit`](Self::commit).
    unsafe fn commit_aligned(
        &self,
        addr: usize,
        bytes: usize,
        alignment_hint: usize,
        executable: bool,
    ) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.commit(addr, bytes, executable)?;
            self.realign(addr, bytes, alignment_hint);
        }
        Ok(())
    }

    /// Drop the backing of a committed range, keeping the reservation
    ///
    /// # Safety
    /// The range must be committed and no longer referenced.
    unsafe fn uncommit(&self, addr: usize, bytes: usize, executable: bool) -> io::Result<()>;

    /// Return a reservation to the host
    ///
    /// # Safety
    /// The range must be reserved by the caller and no longer referenced.
    unsafe fn release(&self, addr: usize, bytes: usize) -> io::Result<()>;

    /// Reserve and commit a region backed by `page_size` pages
    fn reserve_special(
        &self,
        bytes: usize,
        alignment: usize,
        page_size: usize,
        addr: Option<usize>,
        executable: bool,
    ) -> io::Result<usize>;

    /// Release a region obtained from [`reserve_special`](Self::reserve_special)
    ///
    /// # Safety
    /// The region must be unreferenced.
    unsafe fn release_special(&self, addr: usize, bytes: usize) -> io::Result<()>;

    /// Map `bytes` of shared memory backed by the file `fd`, growing the file
    ///
    /// # Safety
    /// When `addr` is given, any existing mapping there is replaced.
    unsafe fn map_memory_to_file(&self, addr: Option<usize>, bytes: usize, fd: RawFd) -> io::Result<usize>;

    /// Map `bytes` of `fd` at `offset` as a private mapping
    ///
    /// # Safety
    /// When `addr` is given, any existing mapping there is replaced.
    unsafe fn map_file(
        &self,
        fd: RawFd,
        offset: u64,
        addr: Option<usize>,
        bytes: usize,
        read_only: bool,
        allow_exec: bool,
    ) -> io::Result<usize>;

    /// Replace a file mapping in place
    ///
    /// # Safety
    /// `[addr, addr + bytes)` must be an unreferenced mapping owned by the caller.
    unsafe fn remap_file(
        &self,
        fd: RawFd,
        offset: u64,
        addr: usize,
        bytes: usize,
        read_only: bool,
        allow_exec: bool,
    ) -> io::Result<usize> {
        // SAFETY: forwarded caller contract.
        unsafe {
            self.unmap(addr, bytes)?;
            self.map_file(fd, offset, Some(addr), bytes, read_only, allow_exec)
        }
    }

    /// Remove a file mapping
    ///
    /// # Safety
    /// The mapping must be unreferenced.
    unsafe fn unmap(&self, addr: usize, bytes: usize) -> io::Result<()>;

    /// Discard contents while keeping the range committed
    ///
    /// # Safety
    /// The range contents must be disposable.
    unsafe fn free_memory(&self, addr: usize, bytes: usize, alignment_hint: usize);

    /// Advise the host about the preferred backing page size
    ///
    /// # Safety
    /// The range must be committed.
    unsafe fn realign(&self, addr: usize, bytes: usize, alignment_hint: usize);

    /// Turn a committed range into inaccessible guard pages
    ///
    /// # Safety
    /// The range must be committed, owned by the caller and unreferenced.
    unsafe fn create_stack_guard_pages(&self, addr: usize, bytes: usize) -> io::Result<()>;

    /// Page size to touch `[start, end)` with, or 0 when the host already
    /// backed the range itself
    fn pretouch_page_size(&self, _start: usize, _end: usize, page_size: usize) -> usize {
        page_size
    }

    /// Set a native scheduling priority
    fn set_native_priority(&self, thread: NativeThreadId, priority: i32) -> io::Result<()>;

    /// Query a native scheduling priority
    fn get_native_priority(&self, thread: NativeThreadId) -> io::Result<i32>;

    /// The calling thread's id
    fn current_thread_id(&self) -> NativeThreadId;

    /// Processors available to this process
    fn active_processor_count(&self) -> usize {
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }

    /// Registers saved in a signal context
    ///
    /// # Safety
    /// `context` must be null or point at a live `ucontext_t`.
    unsafe fn fetch_frame_from_context(&self, context: *const c_void) -> Option<Frame>;

    /// The calling thread's last host error
    fn last_error(&self) -> Errno {
        Errno::last()
    }
}

/// The platform for the host this crate was compiled for
#[cfg(unix)]
pub fn host() -> std::sync::Arc<dyn Platform> {
    static HOST: std::sync::OnceLock<std::sync::Arc<PosixPlatform>> = std::sync::OnceLock::new();
    HOST.get_or_init(|| std::sync::Arc::new(PosixPlatform::new())).clone()
}

/// Print the host's view of `[start, start + bytes)`, one line per mapping
pub fn print_memory_mappings(out: &mut dyn fmt::Write, start: usize, bytes: usize) -> fmt::Result {
    use region::Protection;

    let regions = match region::query_range(start as *const u8, bytes) {
        Ok(iter) => iter,
        Err(e) => return writeln!(out, "cannot query mappings: {e}"),
    };
    for region in regions {
        let Ok(region) = region else { continue };
        let range = region.as_range();
        let prot = region.protection();
        writeln!(
            out,
            "{:#x}-{:#x} {}{}{}{}",
            range.start,
            range.end,
            if prot.contains(Protection::READ) { 'r' } else { '-' },
            if prot.contains(Protection::WRITE) { 'w' } else { '-' },
            if prot.contains(Protection::EXECUTE) { 'x' } else { '-' },
            if region.is_shared() { 's' } else { 'p' },
        )?;
    }
    Ok(())
}
