//! Fault-tolerant memory probing
//!
//! Diagnostic code has to look at pointers it knows nothing about: values
//! pulled off a corrupted stack, register contents from a crash context, a
//! user-supplied address. [`SafeFetch::try_read`] is the single place where
//! an access fault is turned into a value instead of a crash. Everything
//! else in this module (and every formatter in [`crate::diagnostics`]) is
//! built on top of it.
//!
//! The host implementation never dereferences the address itself. The
//! kernel copies the bytes on our behalf and reports `EFAULT` for anything
//! unmapped or unreadable, so no signal handler or guard trampoline is
//! involved.

use std::io;
use std::sync::OnceLock;
#[cfg(target_os = "linux")]
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::utils::align_down;

/// Width of a probed read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchWidth {
    /// 1 byte
    U8 = 1,
    /// 2 bytes
    U16 = 2,
    /// 4 bytes
    U32 = 4,
    /// 8 bytes
    U64 = 8,
}

impl FetchWidth {
    /// Width of a machine word
    pub const WORD: Self = if size_of::<usize>() == 8 {
        Self::U64
    } else {
        Self::U32
    };

    /// Size in bytes
    #[must_use]
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Width for a byte count, if it is one of 1, 2, 4, 8
    #[must_use]
    pub const fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(Self::U8),
            2 => Some(Self::U16),
            4 => Some(Self::U32),
            8 => Some(Self::U64),
            _ => None,
        }
    }

    /// Mask selecting the low `bytes() * 8` bits
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            Self::U64 => u64::MAX,
            other => (1u64 << (other.bytes() * 8)) - 1,
        }
    }
}

/// Fault-tolerant read primitive
///
/// Implementations must return `None` (and never fault) for any address
/// that is unmapped or not readable. A successful read yields the value in
/// native byte order, zero-extended to `u64`.
pub trait SafeFetch: Send + Sync {
    /// Read `width` bytes at `addr`
    fn try_read(&self, addr: usize, width: FetchWidth) -> Option<u64>;

    /// Read a 32-bit value, returning `errval` on fault
    fn safe_fetch32(&self, addr: usize, errval: i32) -> i32 {
        self.try_read(addr, FetchWidth::U32)
            .map_or(errval, |v| v as u32 as i32)
    }

    /// Read a machine word, returning `errval` on fault
    fn safe_fetch_n(&self, addr: usize, errval: isize) -> isize {
        self.try_read(addr, FetchWidth::WORD)
            .map_or(errval, |v| v as usize as isize)
    }
}

impl<T: SafeFetch + ?Sized> SafeFetch for &T {
    fn try_read(&self, addr: usize, width: FetchWidth) -> Option<u64> {
        (**self).try_read(addr, width)
    }
}

impl<T: SafeFetch + ?Sized> SafeFetch for std::sync::Arc<T> {
    fn try_read(&self, addr: usize, width: FetchWidth) -> Option<u64> {
        (**self).try_read(addr, width)
    }
}

const CAFEBABE: i32 = 0xcafe_babe_u32 as i32;
const DEADBEEF: i32 = 0xdead_beef_u32 as i32;

/// Check whether a 4-byte read at `addr` (aligned down to 4) succeeds
///
/// Two different sentinels are used so a successful read that happens to
/// return the first sentinel is not mistaken for a fault.
pub fn is_readable_pointer(probe: &(impl SafeFetch + ?Sized), addr: usize) -> bool {
    let aligned = align_down(addr, 4);
    probe.safe_fetch32(aligned, CAFEBABE) != CAFEBABE
        || probe.safe_fetch32(aligned, DEADBEEF) != DEADBEEF
}

/// Sample `[from, to)` at `page_size` stride
///
/// Not a byte-exact check: one probe per page is enough to classify the
/// range for diagnostics. An empty or inverted range is not readable.
pub fn is_readable_range(
    probe: &(impl SafeFetch + ?Sized),
    from: usize,
    to: usize,
    page_size: usize,
) -> bool {
    if from >= to {
        return false;
    }
    let mut p = align_down(from, page_size);
    while p < to {
        if !is_readable_pointer(probe, p) {
            return false;
        }
        match p.checked_add(page_size) {
            Some(next) => p = next,
            None => break,
        }
    }
    true
}

const READ_SAFELY_ERRVAL: isize = 0x1717;

/// Read a machine word, telling a fault apart from a stored sentinel
pub fn read_safely_from(probe: &(impl SafeFetch + ?Sized), addr: usize) -> Option<isize> {
    let value = probe.safe_fetch_n(addr, READ_SAFELY_ERRVAL);
    if value != READ_SAFELY_ERRVAL {
        return Some(value);
    }
    let value = probe.safe_fetch_n(addr, !READ_SAFELY_ERRVAL);
    (value != !READ_SAFELY_ERRVAL).then_some(value)
}

/// A frame pointer candidate is bad when misaligned or unreadable
pub fn is_pointer_bad(probe: &(impl SafeFetch + ?Sized), addr: usize) -> bool {
    addr % size_of::<usize>() != 0 || !is_readable_pointer(probe, addr)
}

// ============================================================================
// Host implementation
// ============================================================================

/// Kernel-assisted probe for the current process
///
/// On Linux reads go through `process_vm_readv(2)` against our own pid. If
/// that syscall is unavailable (seccomp, old kernels) the probe falls back
/// to writing the bytes into a private pipe with `write(2)` and reading
/// them back, which every Unix supports and which also fails with `EFAULT`
/// instead of faulting.
#[derive(Debug)]
pub struct HostProbe {
    pipe: Mutex<Option<Pipe>>,
    #[cfg(target_os = "linux")]
    vm_readv_broken: AtomicBool,
}

#[derive(Debug)]
struct Pipe {
    read: libc::c_int,
    write: libc::c_int,
}

impl Pipe {
    fn open() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` is a valid two-element buffer for pipe(2) to fill.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            // SAFETY: `fd` was just returned by pipe(2) and is owned here.
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        Ok(Self {
            read: fds[0],
            write: fds[1],
        })
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned by this value and closed once.
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProbe {
    /// Create a probe; the fallback pipe is opened lazily
    #[must_use]
    pub fn new() -> Self {
        Self {
            pipe: Mutex::new(None),
            #[cfg(target_os = "linux")]
            vm_readv_broken: AtomicBool::new(false),
        }
    }

    /// Process-wide probe instance
    pub fn global() -> &'static HostProbe {
        static PROBE: OnceLock<HostProbe> = OnceLock::new();
        PROBE.get_or_init(HostProbe::new)
    }

    #[cfg(target_os = "linux")]
    fn read_vm(&self, addr: usize, buf: &mut [u8]) -> Option<Option<()>> {
        if self.vm_readv_broken.load(Ordering::Relaxed) {
            return None;
        }
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: the local iovec describes `buf`, which we own mutably; the
        // remote address is only dereferenced by the kernel, which reports
        // EFAULT for unreadable memory instead of raising a signal.
        let n = unsafe { libc::process_vm_readv(libc::getpid(), &raw const local, 1, &raw const remote, 1, 0) };
        match classify_vm_read(n, buf.len(), || io::Error::last_os_error().raw_os_error()) {
            VmRead::Complete => Some(Some(())),
            VmRead::Unreadable => Some(None),
            VmRead::Unavailable => {
                self.vm_readv_broken.store(true, Ordering::Relaxed);
                tracing::debug!(target: "os::probe", "process_vm_readv unavailable, using pipe probe");
                None
            }
        }
    }

    fn read_pipe(&self, addr: usize, buf: &mut [u8]) -> Option<()> {
        let mut guard = self.pipe.lock();
        if guard.is_none() {
            match Pipe::open() {
                Ok(pipe) => *guard = Some(pipe),
                Err(e) => {
                    tracing::warn!(target: "os::probe", error = %e, "cannot open probe pipe");
                    return None;
                }
            }
        }
        let pipe = guard.as_ref()?;
        // SAFETY: write(2) only reads `buf.len()` bytes from `addr` inside the
        // kernel; an unreadable source yields EFAULT rather than a fault.
        let written = unsafe { libc::write(pipe.write, addr as *const libc::c_void, buf.len()) };
        if written != buf.len() as isize {
            if written > 0 {
                // Partial write: drain so the pipe stays in sync.
                let mut sink = [0u8; 8];
                // SAFETY: `sink` is a writable buffer of at least `written` bytes.
                unsafe { libc::read(pipe.read, sink.as_mut_ptr().cast(), written as usize) };
            }
            return None;
        }
        // SAFETY: `buf` is a writable buffer of exactly the length written above.
        let read = unsafe { libc::read(pipe.read, buf.as_mut_ptr().cast(), buf.len()) };
        (read == buf.len() as isize).then_some(())
    }
}

impl SafeFetch for HostProbe {
    fn try_read(&self, addr: usize, width: FetchWidth) -> Option<u64> {
        if addr == 0 {
            return None;
        }
        let mut buf = [0u8; 8];
        let bytes = &mut buf[..width.bytes()];

        #[cfg(target_os = "linux")]
        let done = self.read_vm(addr, bytes);
        #[cfg(not(target_os = "linux"))]
        let done: Option<Option<()>> = None;

        match done {
            Some(result) => result?,
            None => self.read_pipe(addr, bytes)?,
        }
        Some(decode(&buf, width))
    }
}

#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VmRead {
    Complete,
    Unreadable,
    Unavailable,
}

/// Outcome of a `process_vm_readv` call that returned `n` for `wanted` bytes
///
/// `errno` is only consulted for a failed call; a short read leaves it stale.
#[cfg(target_os = "linux")]
fn classify_vm_read(n: isize, wanted: usize, errno: impl FnOnce() -> Option<i32>) -> VmRead {
    if n >= 0 {
        return if n as usize == wanted { VmRead::Complete } else { VmRead::Unreadable };
    }
    match errno() {
        Some(libc::EPERM | libc::ENOSYS) => VmRead::Unavailable,
        _ => VmRead::Unreadable,
    }
}

fn decode(buf: &[u8; 8], width: FetchWidth) -> u64 {
    match width {
        FetchWidth::U8 => u64::from(buf[0]),
        FetchWidth::U16 => u64::from(u16::from_ne_bytes([buf[0], buf[1]])),
        FetchWidth::U32 => u64::from(u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]])),
        FetchWidth::U64 => u64::from_ne_bytes(*buf),
    }
}

// ============================================================================
// Test double
// ============================================================================

/// Scripted probe backed by a sparse byte map
#[cfg(any(test, feature = "test-util"))]
pub mod testing {
    use std::collections::BTreeMap;

    use parking_lot::RwLock;

    use super::{FetchWidth, SafeFetch};

    /// Probe over a fake address space; unmapped bytes fault
    #[derive(Debug, Default)]
    pub struct ScriptedProbe {
        bytes: RwLock<BTreeMap<usize, u8>>,
    }

    impl ScriptedProbe {
        /// Empty address space
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Map `data` at `addr`
        pub fn map(&self, addr: usize, data: &[u8]) {
            let mut bytes = self.bytes.write();
            for (i, b) in data.iter().enumerate() {
                bytes.insert(addr + i, *b);
            }
        }

        /// Map a native-endian word at `addr`
        pub fn map_word(&self, addr: usize, value: usize) {
            self.map(addr, &value.to_ne_bytes());
        }

        /// Remove `[addr, addr + len)` from the address space
        pub fn unmap(&self, addr: usize, len: usize) {
            let mut bytes = self.bytes.write();
            for a in addr..addr + len {
                bytes.remove(&a);
            }
        }
    }

    impl SafeFetch for ScriptedProbe {
        fn try_read(&self, addr: usize, width: FetchWidth) -> Option<u64> {
            let bytes = self.bytes.read();
            let mut buf = [0u8; 8];
            for (i, slot) in buf.iter_mut().take(width.bytes()).enumerate() {
                *slot = *bytes.get(&addr.checked_add(i)?)?;
            }
            Some(super::decode(&buf, width))
        }
    }
}
