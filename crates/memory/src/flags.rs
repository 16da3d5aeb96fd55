//! Allocation categories
//!
//! Every tracked block and region carries one [`MemFlags`] so summaries and
//! malloc limits can be broken down by subsystem.

use std::fmt;

macro_rules! mem_flags {
    ($( $variant:ident => ($short:literal, $human:literal) ),* $(,)?) => {
        /// Subsystem an allocation is charged to
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[repr(u8)]
        pub enum MemFlags {
            $(
                #[doc = $human]
                $variant,
            )*
        }

        impl MemFlags {
            /// Every category, in index order
            pub const ALL: &'static [MemFlags] = &[$(MemFlags::$variant),*];

            /// Number of categories
            pub const COUNT: usize = Self::ALL.len();

            /// Display name used in reports
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(MemFlags::$variant => $human,)*
                }
            }

            /// Short lowercase name used in configuration strings
            #[must_use]
            pub const fn short_name(self) -> &'static str {
                match self {
                    $(MemFlags::$variant => $short,)*
                }
            }
        }
    };
}

mem_flags! {
    JavaHeap => ("javaheap", "Java Heap"),
    Class => ("class", "Class"),
    Thread => ("thread", "Thread"),
    ThreadStack => ("threadstack", "Thread Stack"),
    Code => ("code", "Code"),
    Gc => ("gc", "GC"),
    Compiler => ("compiler", "Compiler"),
    Internal => ("internal", "Internal"),
    Other => ("other", "Other"),
    Symbol => ("symbol", "Symbol"),
    Nmt => ("nmt", "Native Memory Tracking"),
    Chunk => ("chunk", "Arena Chunk"),
    Test => ("test", "Test"),
    Tracing => ("tracing", "Tracing"),
    Logging => ("logging", "Logging"),
    Arguments => ("arguments", "Arguments"),
    Module => ("module", "Module"),
    Safepoint => ("safepoint", "Safepoint"),
    Synchronizer => ("synchronizer", "Synchronization"),
    Serviceability => ("serviceability", "Serviceability"),
    Metaspace => ("metaspace", "Metaspace"),
    StringDedup => ("stringdedup", "String Deduplication"),
    ObjectMonitor => ("objectmonitor", "Object Monitors"),
    None => ("none", "Unknown"),
}

impl MemFlags {
    /// Position in [`MemFlags::ALL`]
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Category at `index`
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Parse a configuration name
    ///
    /// Case-insensitive; accepts the short name with or without an `mt`
    /// prefix, so `"compiler"`, `"Compiler"` and `"mtCompiler"` all match.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        let find = |s: &str| Self::ALL.iter().copied().find(|f| f.short_name() == s);
        find(&lower).or_else(|| lower.strip_prefix("mt").and_then(find))
    }
}

impl Default for MemFlags {
    fn default() -> Self {
        Self::None
    }
}

impl fmt::Display for MemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
