//! Native heap facade
//!
//! `malloc`/`realloc`/`free` with C semantics (`None` is null) on top of a
//! [`SystemAllocator`], charged to a [`MallocLedger`].
//!
//! Until [`NativeHeap::initialize`] supplies the ledger the heap runs in
//! pre-init mode: blocks come straight from the host allocator and are
//! remembered so that later `realloc`/`free` calls route them back there.
//!
//! ```
//! use std::sync::Arc;
//! use stratum_memory::{MallocLedger, MemFlags, MemoryConfig, NativeHeap};
//!
//! let ledger = Arc::new(MallocLedger::new(MemoryConfig::production()));
//! let heap = NativeHeap::libc();
//! heap.initialize(ledger.clone()).unwrap();
//!
//! let p = heap.malloc(64, MemFlags::Internal).unwrap();
//! assert_eq!(ledger.summary().category(MemFlags::Internal).bytes, 64);
//! // SAFETY: p came from this heap.
//! unsafe { heap.free(Some(p)) };
//! ```

mod preinit;
mod system;

use std::ffi::CStr;
use std::ptr::{self, NonNull};
use std::sync::{Arc, OnceLock};

#[cfg(any(test, feature = "test-util"))]
pub use system::FailingAllocator;
pub use system::{LibcAllocator, SystemAllocator};

use crate::callsite::CallSite;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult, exit_out_of_memory};
use crate::flags::MemFlags;
use crate::ledger::{Corruption, CorruptionKind, MallocLedger};
use preinit::PreInitTable;

/// Heap facade over a host allocator
pub struct NativeHeap<A: SystemAllocator = LibcAllocator> {
    allocator: A,
    ledger: OnceLock<Arc<MallocLedger>>,
    preinit: PreInitTable,
}

impl<A: SystemAllocator> std::fmt::Debug for NativeHeap<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHeap")
            .field("ledger", &self.ledger.get())
            .field("preinit_blocks", &self.preinit.len())
            .finish_non_exhaustive()
    }
}

impl NativeHeap<LibcAllocator> {
    /// Pre-init heap over `malloc(3)`
    pub fn libc() -> Self {
        Self::new(LibcAllocator)
    }
}

impl<A: SystemAllocator> NativeHeap<A> {
    /// Pre-init heap over `allocator`
    pub fn new(allocator: A) -> Self {
        Self {
            allocator,
            ledger: OnceLock::new(),
            preinit: PreInitTable::default(),
        }
    }

    /// Initialized heap over `allocator`
    pub fn with_ledger(allocator: A, ledger: Arc<MallocLedger>) -> Self {
        let heap = Self::new(allocator);
        let _ = heap.ledger.set(ledger);
        heap
    }

    /// Leave pre-init mode
    pub fn initialize(&self, ledger: Arc<MallocLedger>) -> MemoryResult<()> {
        self.ledger
            .set(ledger)
            .map_err(|_| MemoryError::invalid_config("native heap already initialized"))?;
        tracing::debug!(
            target: "os::malloc",
            preinit_blocks = self.preinit.len(),
            "native heap initialized"
        );
        Ok(())
    }

    /// Check if the ledger is installed
    pub fn is_initialized(&self) -> bool {
        self.ledger.get().is_some()
    }

    /// The installed ledger
    pub fn ledger(&self) -> Option<&Arc<MallocLedger>> {
        self.ledger.get()
    }

    /// The host allocator
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Pre-init blocks still outstanding
    pub fn preinit_blocks(&self) -> usize {
        self.preinit.len()
    }

    /// Allocate `size` bytes charged to `flags`
    ///
    /// A zero size is served as one byte, so the result is always unique
    /// and freeable. `None` on exhaustion, size overflow or a crossed
    /// malloc limit.
    #[track_caller]
    pub fn malloc(&self, size: usize, flags: MemFlags) -> Option<NonNull<u8>> {
        let Some(ledger) = self.ledger.get() else {
            return self.preinit_malloc(size);
        };

        let size = size.max(1);
        if ledger.check_exceeds_limit(size, flags) {
            return None;
        }
        let outer_size = size.checked_add(ledger.overhead_per_malloc())?;
        let outer = self.allocator.malloc(outer_size)?;

        // SAFETY: outer is a fresh block of outer_size bytes.
        let inner = unsafe { ledger.record_malloc(outer, size, flags, CallSite::caller()) };

        let config = ledger.config();
        if config.deterministic_fill {
            // SAFETY: inner is valid for size bytes.
            unsafe { ptr::write_bytes(inner.as_ptr(), 0, size) };
        } else if config.pad_fill {
            // SAFETY: as above.
            unsafe { ptr::write_bytes(inner.as_ptr(), MemoryConfig::PAD_BYTE, size) };
        }
        catch_ptr(config, inner, "malloc");
        Some(inner)
    }

    /// Resize a block, keeping its category
    ///
    /// `None` for `ptr` degrades to [`malloc`](Self::malloc). On failure the
    /// old block stays valid and `None` is returned.
    ///
    /// # Safety
    /// `ptr` must be null or a block from this heap that has not been freed
    /// (with tracking on, violations are detected and reported instead).
    #[track_caller]
    pub unsafe fn realloc(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        flags: MemFlags,
    ) -> Option<NonNull<u8>> {
        let Some(ledger) = self.ledger.get() else {
            // SAFETY: forwarded caller contract.
            return unsafe { self.preinit_realloc(ptr, size) };
        };
        let Some(old) = ptr else {
            return self.malloc(size, flags);
        };
        if self.preinit.contains(old.as_ptr() as usize) {
            // SAFETY: pre-init blocks are raw host blocks.
            return unsafe { self.preinit_realloc(ptr, size) };
        }

        let size = size.max(1);
        let config = ledger.config();

        if !ledger.enabled() {
            // SAFETY: untracked blocks are raw host blocks.
            let new = unsafe { self.allocator.realloc(old, size) }?;
            catch_ptr(config, new, "realloc");
            return Some(new);
        }

        let new_outer_size = size.checked_add(ledger.overhead_per_malloc())?;

        // Check and mark the old block dead before the host realloc, which
        // may invalidate its header.
        // SAFETY: forwarded caller contract; the ledger checks membership first.
        let info = unsafe { ledger.mark_dead_for_realloc(old, flags) }.ok()?;
        let old_size = info.size();

        if size > old_size && ledger.check_exceeds_limit(size - old_size, flags) {
            // SAFETY: nothing has touched the old block.
            unsafe { ledger.revive(&info) };
            return None;
        }

        let preserved = old_size.min(size);
        let before = if config.verify_realloc_copy {
            // SAFETY: the old block holds old_size readable bytes.
            Some(unsafe { checksum(old.as_ptr(), preserved) })
        } else {
            None
        };

        let outer = ledger.outer_pointer(old);
        // SAFETY: outer is the host block behind a live tracked pointer.
        let Some(new_outer) = (unsafe { self.allocator.realloc(outer, new_outer_size) }) else {
            // The host realloc failed and the old block still exists.
            // SAFETY: as above.
            unsafe { ledger.revive(&info) };
            return None;
        };
        ledger.deaccount(&info);

        // SAFETY: new_outer is valid for new_outer_size bytes.
        let new_inner = unsafe { ledger.record_malloc(new_outer, size, flags, CallSite::caller()) };

        if let Some(expected) = before {
            // SAFETY: new_inner holds at least `preserved` copied bytes.
            let found = unsafe { checksum(new_inner.as_ptr(), preserved) };
            if found != expected {
                ledger.report_corruption(Corruption {
                    operation: "realloc",
                    block: info.addr(),
                    kind: CorruptionKind::ReallocCopy { preserved },
                });
            }
        }

        if size > old_size && config.pad_fill && !config.deterministic_fill {
            // SAFETY: the grown tail lies inside the new block.
            unsafe {
                ptr::write_bytes(
                    new_inner.as_ptr().add(old_size),
                    MemoryConfig::PAD_BYTE,
                    size - old_size,
                );
            }
        }
        catch_ptr(config, new_inner, "realloc");
        Some(new_inner)
    }

    /// Release a block; `None` is a no-op
    ///
    /// # Safety
    /// As for [`realloc`](Self::realloc).
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else { return };

        if self.preinit.remove(ptr.as_ptr() as usize) {
            // SAFETY: pre-init blocks are raw host blocks.
            unsafe { self.allocator.free(ptr) };
            return;
        }
        let Some(ledger) = self.ledger.get() else {
            // SAFETY: before initialization every block is a raw host block.
            unsafe { self.allocator.free(ptr) };
            return;
        };

        catch_ptr(ledger.config(), ptr, "free");
        // SAFETY: forwarded caller contract; the ledger checks membership first.
        if let Ok(outer) = unsafe { ledger.record_free(ptr) } {
            // SAFETY: outer is the host block the ledger just released.
            unsafe { self.allocator.free(outer) };
        }
    }

    /// NUL-terminated copy of `s`
    #[track_caller]
    pub fn strdup(&self, s: &CStr, flags: MemFlags) -> Option<NonNull<u8>> {
        let bytes = s.to_bytes_with_nul();
        let dup = self.malloc(bytes.len(), flags)?;
        // SAFETY: dup holds bytes.len() fresh bytes.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dup.as_ptr(), bytes.len()) };
        Some(dup)
    }

    /// [`strdup`](Self::strdup) that exits the process when memory is exhausted
    #[track_caller]
    pub fn strdup_check_oom(&self, s: &CStr, flags: MemFlags) -> NonNull<u8> {
        match self.strdup(s, flags) {
            Some(p) => p,
            None => exit_out_of_memory(s.to_bytes_with_nul().len(), "strdup_check_oom"),
        }
    }

    fn preinit_malloc(&self, size: usize) -> Option<NonNull<u8>> {
        let p = self.allocator.malloc(size.max(1))?;
        self.preinit.insert(p.as_ptr() as usize);
        tracing::trace!(target: "os::malloc", addr = p.as_ptr() as usize, size, "pre-init malloc");
        Some(p)
    }

    /// # Safety
    /// `ptr` must be null or a raw block from this heap's allocator.
    unsafe fn preinit_realloc(&self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        let Some(old) = ptr else {
            return self.preinit_malloc(size);
        };
        // SAFETY: forwarded caller contract.
        let new = unsafe { self.allocator.realloc(old, size.max(1)) }?;
        self.preinit.remove(old.as_ptr() as usize);
        self.preinit.insert(new.as_ptr() as usize);
        Some(new)
    }
}

fn catch_ptr(config: &MemoryConfig, ptr: NonNull<u8>, operation: &'static str) {
    if config.catch_ptr == Some(ptr.as_ptr() as usize) {
        tracing::warn!(target: "os::malloc", operation, "ptr caught: {:#x}", ptr.as_ptr() as usize);
    }
}

/// FNV-1a over `len` bytes at `p`
///
/// # Safety
/// `p` must be readable for `len` bytes.
unsafe fn checksum(p: *const u8, len: usize) -> u64 {
    // SAFETY: caller guarantees the range is readable.
    let bytes = unsafe { std::slice::from_raw_parts(p, len) };
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}
