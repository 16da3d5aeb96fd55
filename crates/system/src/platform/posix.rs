//! `mmap`-based implementation of [`Platform`]

use std::ffi::c_void;
use std::io;
use std::os::fd::RawFd;

use libc::c_int;

use super::{Frame, NativeThreadId, Platform};
use crate::probe::{FetchWidth, HostProbe, SafeFetch};
use crate::utils::{align_up, is_aligned};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_NORESERVE: c_int = libc::MAP_NORESERVE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_NORESERVE: c_int = 0;

const ANON: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

#[cfg_attr(target_os = "linux", allow(dead_code))]
fn unsupported() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOTSUP)
}

fn invalid() -> io::Error {
    io::Error::from_raw_os_error(libc::EINVAL)
}

const fn rw_prot(executable: bool) -> c_int {
    let prot = libc::PROT_READ | libc::PROT_WRITE;
    if executable { prot | libc::PROT_EXEC } else { prot }
}

/// # Safety
/// With `MAP_FIXED` in `flags` the target range is replaced unconditionally.
unsafe fn mmap(
    addr: usize,
    bytes: usize,
    prot: c_int,
    flags: c_int,
    fd: RawFd,
    offset: u64,
) -> io::Result<usize> {
    let offset = libc::off_t::try_from(offset).map_err(|_| invalid())?;
    // SAFETY: forwarded caller contract; the kernel validates the rest.
    let p = unsafe { libc::mmap(addr as *mut c_void, bytes, prot, flags, fd, offset) };
    if p == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(p as usize)
    }
}

/// # Safety
/// The range must be an unreferenced mapping.
unsafe fn munmap(addr: usize, bytes: usize) -> io::Result<()> {
    // SAFETY: forwarded caller contract.
    if unsafe { libc::munmap(addr as *mut c_void, bytes) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// POSIX host platform
#[derive(Debug)]
pub struct PosixPlatform {
    page_size: usize,
    page_sizes: Vec<usize>,
    large_page_size: Option<usize>,
}

impl Default for PosixPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl PosixPlatform {
    /// Probe the host's page sizes
    #[must_use]
    pub fn new() -> Self {
        let page_size = region::page::size();
        let mut page_sizes = vec![page_size];
        page_sizes.extend(huge_page_sizes());
        page_sizes.sort_unstable();
        page_sizes.dedup();
        let large_page_size = default_huge_page_size().filter(|s| page_sizes.contains(s));

        tracing::debug!(
            target: "os::pagesize",
            page_size,
            ?page_sizes,
            ?large_page_size,
            "host page sizes"
        );

        Self {
            page_size,
            page_sizes,
            large_page_size,
        }
    }

    /// Reserve `bytes` at an `alignment` boundary by over-reserving and
    /// trimming both ends
    fn reserve_aligned(&self, bytes: usize, alignment: usize) -> io::Result<usize> {
        let extra = bytes.checked_add(alignment).ok_or_else(invalid)?;
        let raw = self.reserve(extra, false)?;
        let aligned = align_up(raw, alignment);
        // SAFETY: both trimmed pieces lie inside the fresh reservation above
        // and nothing references them.
        unsafe {
            if aligned > raw {
                munmap(raw, aligned - raw)?;
            }
            let tail = raw + extra - (aligned + bytes);
            if tail > 0 {
                munmap(aligned + bytes, tail)?;
            }
        }
        Ok(aligned)
    }
}

#[cfg(target_os = "linux")]
fn huge_page_sizes() -> Vec<usize> {
    // Directory names look like "hugepages-2048kB".
    let Ok(entries) = std::fs::read_dir("/sys/kernel/mm/hugepages") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let kb = name
                .to_str()?
                .strip_prefix("hugepages-")?
                .strip_suffix("kB")?
                .parse::<usize>()
                .ok()?;
            let size = kb.checked_mul(1024)?;
            size.is_power_of_two().then_some(size)
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn huge_page_sizes() -> Vec<usize> {
    Vec::new()
}

#[cfg(target_os = "linux")]
fn default_huge_page_size() -> Option<usize> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("Hugepagesize:"))?;
    let kb = line
        .trim_start_matches("Hugepagesize:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<usize>()
        .ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn default_huge_page_size() -> Option<usize> {
    None
}

impl SafeFetch for PosixPlatform {
    fn try_read(&self, addr: usize, width: FetchWidth) -> Option<u64> {
        HostProbe::global().try_read(addr, width)
    }
}

impl Platform for PosixPlatform {
    fn vm_page_size(&self) -> usize {
        self.page_size
    }

    fn supported_page_sizes(&self) -> Vec<usize> {
        self.page_sizes.clone()
    }

    fn default_large_page_size(&self) -> Option<usize> {
        self.large_page_size
    }

    fn reserve(&self, bytes: usize, _executable: bool) -> io::Result<usize> {
        // SAFETY: no MAP_FIXED, so the kernel picks an unused range.
        unsafe { mmap(0, bytes, libc::PROT_NONE, ANON | MAP_NORESERVE, -1, 0) }
    }

    fn attempt_reserve_at(&self, addr: usize, bytes: usize, _executable: bool) -> io::Result<usize> {
        #[cfg(target_os = "linux")]
        let flags = ANON | MAP_NORESERVE | libc::MAP_FIXED_NOREPLACE;
        #[cfg(not(target_os = "linux"))]
        let flags = ANON | MAP_NORESERVE;

        // SAFETY: without MAP_FIXED an occupied range is never replaced.
        let got = unsafe { mmap(addr, bytes, libc::PROT_NONE, flags, -1, 0)? };
        if got == addr {
            return Ok(got);
        }
        // Kernels that ignore the hint place the mapping elsewhere.
        // SAFETY: `got` is the mapping we just created.
        unsafe { munmap(got, bytes)? };
        Err(io::Error::from_raw_os_error(libc::EEXIST))
    }

    unsafe fn commit(&self, addr: usize, bytes: usize, executable: bool) -> io::Result<()> {
        // SAFETY: the caller owns the reservation being replaced.
        unsafe {
            mmap(addr, bytes, rw_prot(executable), ANON | libc::MAP_FIXED, -1, 0)?;
        }
        Ok(())
    }

    unsafe fn uncommit(&self, addr: usize, bytes: usize, _executable: bool) -> io::Result<()> {
        let flags = ANON | libc::MAP_FIXED | MAP_NORESERVE;
        // SAFETY: the caller owns the committed range being replaced.
        unsafe {
            mmap(addr, bytes, libc::PROT_NONE, flags, -1, 0)?;
        }
        Ok(())
    }

    unsafe fn release(&self, addr: usize, bytes: usize) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { munmap(addr, bytes) }
    }

    #[cfg(target_os = "linux")]
    fn reserve_special(
        &self,
        bytes: usize,
        alignment: usize,
        page_size: usize,
        addr: Option<usize>,
        executable: bool,
    ) -> io::Result<usize> {
        if !page_size.is_power_of_two()
            || page_size <= self.page_size
            || !is_aligned(bytes, page_size)
        {
            return Err(invalid());
        }
        let alignment = alignment.max(page_size);
        let base = match addr {
            Some(addr) if !is_aligned(addr, alignment) => return Err(invalid()),
            Some(addr) => self.attempt_reserve_at(addr, bytes, executable)?,
            None => self.reserve_aligned(bytes, alignment)?,
        };

        let huge_bits = (page_size.trailing_zeros() as c_int) << libc::MAP_HUGE_SHIFT;
        let flags = ANON | libc::MAP_FIXED | libc::MAP_HUGETLB | huge_bits;
        // SAFETY: `base` is the reservation created above.
        match unsafe { mmap(base, bytes, rw_prot(executable), flags, -1, 0) } {
            Ok(p) => Ok(p),
            Err(e) => {
                // SAFETY: undo our own reservation.
                let _ = unsafe { munmap(base, bytes) };
                Err(e)
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn reserve_special(
        &self,
        _bytes: usize,
        _alignment: usize,
        _page_size: usize,
        _addr: Option<usize>,
        _executable: bool,
    ) -> io::Result<usize> {
        Err(unsupported())
    }

    unsafe fn release_special(&self, addr: usize, bytes: usize) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { munmap(addr, bytes) }
    }

    unsafe fn map_memory_to_file(&self, addr: Option<usize>, bytes: usize, fd: RawFd) -> io::Result<usize> {
        let len = libc::off_t::try_from(bytes).map_err(|_| invalid())?;
        #[cfg(target_os = "linux")]
        {
            // SAFETY: plain syscall on a caller-provided descriptor.
            let rc = unsafe { libc::posix_fallocate(fd, 0, len) };
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            // SAFETY: plain syscall on a caller-provided descriptor.
            if unsafe { libc::ftruncate(fd, len) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let flags = libc::MAP_SHARED | if addr.is_some() { libc::MAP_FIXED } else { 0 };
        // SAFETY: forwarded caller contract for a fixed address.
        unsafe { mmap(addr.unwrap_or(0), bytes, rw_prot(false), flags, fd, 0) }
    }

    unsafe fn map_file(
        &self,
        fd: RawFd,
        offset: u64,
        addr: Option<usize>,
        bytes: usize,
        read_only: bool,
        allow_exec: bool,
    ) -> io::Result<usize> {
        let mut prot = if read_only {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        if allow_exec {
            prot |= libc::PROT_EXEC;
        }
        let flags = libc::MAP_PRIVATE | if addr.is_some() { libc::MAP_FIXED } else { 0 };
        // SAFETY: forwarded caller contract for a fixed address.
        unsafe { mmap(addr.unwrap_or(0), bytes, prot, flags, fd, offset) }
    }

    unsafe fn unmap(&self, addr: usize, bytes: usize) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        unsafe { munmap(addr, bytes) }
    }

    unsafe fn free_memory(&self, addr: usize, bytes: usize, _alignment_hint: usize) {
        // SAFETY: the caller declared the contents disposable.
        if unsafe { libc::madvise(addr as *mut c_void, bytes, libc::MADV_DONTNEED) } != 0 {
            tracing::debug!(
                target: "os::vm",
                addr = format_args!("{addr:#x}"),
                size = bytes,
                error = %io::Error::last_os_error(),
                "madvise(MADV_DONTNEED) failed"
            );
        }
    }

    #[cfg(target_os = "linux")]
    unsafe fn realign(&self, addr: usize, bytes: usize, alignment_hint: usize) {
        if alignment_hint > self.page_size {
            // SAFETY: advisory only; the range is committed per caller contract.
            unsafe { libc::madvise(addr as *mut c_void, bytes, libc::MADV_HUGEPAGE) };
        }
    }

    #[cfg(not(target_os = "linux"))]
    unsafe fn realign(&self, _addr: usize, _bytes: usize, _alignment_hint: usize) {}

    unsafe fn create_stack_guard_pages(&self, addr: usize, bytes: usize) -> io::Result<()> {
        // SAFETY: forwarded caller contract.
        if unsafe { libc::mprotect(addr as *mut c_void, bytes, libc::PROT_NONE) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "linux")]
    fn set_native_priority(&self, thread: NativeThreadId, priority: i32) -> io::Result<()> {
        let who = libc::id_t::try_from(thread).map_err(|_| invalid())?;
        // SAFETY: plain syscall.
        if unsafe { libc::setpriority(libc::PRIO_PROCESS, who, priority) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn set_native_priority(&self, _thread: NativeThreadId, _priority: i32) -> io::Result<()> {
        Err(unsupported())
    }

    #[cfg(target_os = "linux")]
    fn get_native_priority(&self, thread: NativeThreadId) -> io::Result<i32> {
        let who = libc::id_t::try_from(thread).map_err(|_| invalid())?;
        // -1 is a legal niceness; only errno tells a failure apart.
        // SAFETY: errno is thread-local; getpriority is a plain syscall.
        unsafe {
            *libc::__errno_location() = 0;
            let prio = libc::getpriority(libc::PRIO_PROCESS, who);
            if prio == -1 && *libc::__errno_location() != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(prio)
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn get_native_priority(&self, _thread: NativeThreadId) -> io::Result<i32> {
        Err(unsupported())
    }

    #[cfg(target_os = "linux")]
    fn current_thread_id(&self) -> NativeThreadId {
        // SAFETY: gettid has no preconditions.
        i64::from(unsafe { libc::gettid() })
    }

    #[cfg(not(target_os = "linux"))]
    fn current_thread_id(&self) -> NativeThreadId {
        // SAFETY: pthread_self has no preconditions.
        unsafe { libc::pthread_self() as usize as NativeThreadId }
    }

    unsafe fn fetch_frame_from_context(&self, context: *const c_void) -> Option<Frame> {
        if context.is_null() {
            return None;
        }
        // SAFETY: non-null and pointing at a ucontext_t per caller contract.
        unsafe { frame_from_ucontext(&*context.cast::<libc::ucontext_t>()) }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn frame_from_ucontext(uc: &libc::ucontext_t) -> Option<Frame> {
    let gregs = &uc.uc_mcontext.gregs;
    Some(Frame {
        pc: gregs[libc::REG_RIP as usize] as usize,
        sp: gregs[libc::REG_RSP as usize] as usize,
        fp: gregs[libc::REG_RBP as usize] as usize,
    })
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
fn frame_from_ucontext(uc: &libc::ucontext_t) -> Option<Frame> {
    let mc = &uc.uc_mcontext;
    Some(Frame {
        pc: mc.pc as usize,
        sp: mc.sp as usize,
        fp: mc.regs[29] as usize,
    })
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
fn frame_from_ucontext(_uc: &libc::ucontext_t) -> Option<Frame> {
    None
}
