//! Host allocator seam

use std::ptr::NonNull;

/// The C-level allocator underneath the heap facade
///
/// Blocks must be aligned at least as `malloc(3)` aligns them.
pub trait SystemAllocator: Send + Sync {
    /// Allocate `size` bytes; `None` on exhaustion
    fn malloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Resize a block; on `None` the old block is untouched
    ///
    /// # Safety
    /// `ptr` must come from this allocator and not be freed.
    unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>>;

    /// Release a block
    ///
    /// # Safety
    /// `ptr` must come from this allocator and not be freed.
    unsafe fn free(&self, ptr: NonNull<u8>);
}

/// `malloc(3)` / `realloc(3)` / `free(3)`
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcAllocator;

impl SystemAllocator for LibcAllocator {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: malloc has no preconditions.
        NonNull::new(unsafe { libc::malloc(size) }.cast::<u8>())
    }

    unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees ptr is a live libc block.
        NonNull::new(unsafe { libc::realloc(ptr.as_ptr().cast(), size) }.cast::<u8>())
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        // SAFETY: caller guarantees ptr is a live libc block.
        unsafe { libc::free(ptr.as_ptr().cast()) }
    }
}

impl<A: SystemAllocator + ?Sized> SystemAllocator for std::sync::Arc<A> {
    fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        (**self).malloc(size)
    }

    unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).realloc(ptr, size) }
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).free(ptr) }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use failing::FailingAllocator;

#[cfg(any(test, feature = "test-util"))]
mod failing {
    use std::ptr::NonNull;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::{LibcAllocator, SystemAllocator};

    /// Allocator that can be told to run out of memory
    #[derive(Debug, Default)]
    pub struct FailingAllocator<A = LibcAllocator> {
        inner: A,
        fail_malloc: AtomicBool,
        fail_realloc: AtomicBool,
        mallocs: AtomicUsize,
        reallocs: AtomicUsize,
        frees: AtomicUsize,
    }

    impl FailingAllocator {
        /// Wrapper over libc that succeeds until told otherwise
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl<A: SystemAllocator> FailingAllocator<A> {
        /// Wrap `inner`
        pub fn wrap(inner: A) -> Self {
            Self {
                inner,
                fail_malloc: AtomicBool::new(false),
                fail_realloc: AtomicBool::new(false),
                mallocs: AtomicUsize::new(0),
                reallocs: AtomicUsize::new(0),
                frees: AtomicUsize::new(0),
            }
        }

        /// Make every `malloc` fail (or succeed again)
        pub fn fail_malloc(&self, fail: bool) {
            self.fail_malloc.store(fail, Ordering::SeqCst);
        }

        /// Make every `realloc` fail (or succeed again)
        pub fn fail_realloc(&self, fail: bool) {
            self.fail_realloc.store(fail, Ordering::SeqCst);
        }

        /// Host calls so far: `(malloc, realloc, free)`
        pub fn calls(&self) -> (usize, usize, usize) {
            (
                self.mallocs.load(Ordering::SeqCst),
                self.reallocs.load(Ordering::SeqCst),
                self.frees.load(Ordering::SeqCst),
            )
        }
    }

    impl<A: SystemAllocator> SystemAllocator for FailingAllocator<A> {
        fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
            self.mallocs.fetch_add(1, Ordering::SeqCst);
            if self.fail_malloc.load(Ordering::SeqCst) {
                return None;
            }
            self.inner.malloc(size)
        }

        unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
            self.reallocs.fetch_add(1, Ordering::SeqCst);
            if self.fail_realloc.load(Ordering::SeqCst) {
                return None;
            }
            // SAFETY: forwarded caller contract.
            unsafe { self.inner.realloc(ptr, size) }
        }

        unsafe fn free(&self, ptr: NonNull<u8>) {
            self.frees.fetch_add(1, Ordering::SeqCst);
            // SAFETY: forwarded caller contract.
            unsafe { self.inner.free(ptr) }
        }
    }
}
