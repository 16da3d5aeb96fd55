//! Corruption reports and the handler seam

use thiserror::Error;

use crate::flags::MemFlags;

/// A failed integrity check on free or realloc
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} of block {block:#x}: {kind}")]
pub struct Corruption {
    /// `"free"` or `"realloc"`
    pub operation: &'static str,
    /// User pointer handed to the operation
    pub block: usize,
    /// What was wrong
    pub kind: CorruptionKind,
}

/// The specific check that failed
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorruptionKind {
    /// Not in the live-block table
    #[error("not a live malloc'd block (double free or foreign pointer)")]
    NotLive,

    /// Header canary overwritten
    #[error("header canary damaged (expected {expected:#06x}, found {found:#06x})")]
    HeaderCanary {
        /// Live mark
        expected: u16,
        /// Value in memory
        found: u16,
    },

    /// Footer canary overwritten (block overrun)
    #[error("footer canary damaged (expected {expected:#06x}, found {found:#06x}), block overrun")]
    FooterCanary {
        /// Live mark
        expected: u16,
        /// Value in memory
        found: u16,
    },

    /// Header field disagrees with the side table
    #[error("header {field} is {found}, recorded {expected}")]
    HeaderMismatch {
        /// Field name
        field: &'static str,
        /// Recorded value
        expected: u64,
        /// Value in memory
        found: u64,
    },

    /// realloc asked for a different category than the block has
    #[error("weird category mismatch (new: \"{requested}\" != old: \"{recorded}\")")]
    FlagsMismatch {
        /// Category passed to realloc
        requested: MemFlags,
        /// Category of the block
        recorded: MemFlags,
    },

    /// Host realloc did not preserve the old contents
    #[error("realloc did not preserve the first {preserved} bytes")]
    ReallocCopy {
        /// Bytes that should have been carried over
        preserved: usize,
    },
}

/// Receives every detected corruption
///
/// When `report` returns, the block involved is treated as poisoned: the
/// heap does not touch or release it again.
pub trait CorruptionHandler: Send + Sync {
    /// Handle one corruption
    fn report(&self, corruption: &Corruption);
}

/// Default handler: print the diagnostic and abort the process
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortOnCorruption;

impl CorruptionHandler for AbortOnCorruption {
    fn report(&self, corruption: &Corruption) {
        eprintln!("#\n# Native memory corruption detected\n#  {corruption}\n#");
        std::process::abort();
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use recording::RecordingCorruptionHandler;

#[cfg(any(test, feature = "test-util"))]
mod recording {
    use parking_lot::Mutex;

    use super::{Corruption, CorruptionHandler};

    /// Handler that keeps every report instead of aborting
    #[derive(Debug, Default)]
    pub struct RecordingCorruptionHandler {
        reports: Mutex<Vec<Corruption>>,
    }

    impl RecordingCorruptionHandler {
        /// Empty recorder
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Reports so far
        pub fn reports(&self) -> Vec<Corruption> {
            self.reports.lock().clone()
        }

        /// Number of reports so far
        pub fn count(&self) -> usize {
            self.reports.lock().len()
        }
    }

    impl CorruptionHandler for RecordingCorruptionHandler {
        fn report(&self, corruption: &Corruption) {
            self.reports.lock().push(corruption.clone());
        }
    }
}
