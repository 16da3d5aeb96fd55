//! Thread lifecycle primitives: priorities and stack sizing

mod priority;
mod stack;

pub use priority::{PriorityMap, ThreadPriority, get_priority, set_priority};
pub use stack::{StackConfig, StackSizes, set_minimum_stack_sizes};

use crate::platform::NativeThreadId;

/// What a thread is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ThreadKind {
    /// Runs managed code
    Java,
    /// JIT compiler thread
    Compiler,
    /// VM, watcher and other internal service threads
    VmInternal,
    /// Concurrent collector thread
    ConcurrentGc,
}

impl ThreadKind {
    /// Lowercase name for messages
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Java => "java",
            Self::Compiler => "compiler",
            Self::VmInternal => "vm internal",
            Self::ConcurrentGc => "concurrent gc",
        }
    }
}

/// A host thread together with its role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef {
    /// Host id
    pub id: NativeThreadId,
    /// Role
    pub kind: ThreadKind,
}

impl ThreadRef {
    /// The calling thread, as seen by `platform`
    pub fn current(platform: &dyn crate::platform::Platform, kind: ThreadKind) -> Self {
        Self {
            id: platform.current_thread_id(),
            kind,
        }
    }
}
