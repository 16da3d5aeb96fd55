//! Blocks handed out before the ledger existed
//!
//! They carry no header, so they must go back to the host allocator
//! directly even after the heap has been initialized.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub(crate) struct PreInitTable {
    blocks: Mutex<HashSet<usize>>,
    len: AtomicUsize,
}

impl PreInitTable {
    pub(crate) fn insert(&self, addr: usize) {
        let mut blocks = self.blocks.lock();
        if blocks.insert(addr) {
            self.len.store(blocks.len(), Ordering::Release);
        }
    }

    /// Remove `addr`; `true` if it was a pre-init block
    pub(crate) fn remove(&self, addr: usize) -> bool {
        // Fast path once every early block is gone.
        if self.len.load(Ordering::Acquire) == 0 {
            return false;
        }
        let mut blocks = self.blocks.lock();
        let removed = blocks.remove(&addr);
        self.len.store(blocks.len(), Ordering::Release);
        removed
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.len.load(Ordering::Acquire) != 0 && self.blocks.lock().contains(&addr)
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }
}
