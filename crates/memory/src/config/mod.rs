//! Configuration types
//!
//! - `MemoryConfig`: tracking level, malloc ceilings, fill modes, large pages
//! - `limit`: the `MallocLimit` string form (`"1g"`, `"compiler:500m,internal:1g"`)
//! - `presets`: development, production and environment-driven setups

mod limit;
mod presets;

use std::fmt;
use std::str::FromStr;

pub use limit::MallocLimit;

use crate::error::MemoryError;

/// Memory subsystem configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MemoryConfig {
    /// How much bookkeeping the malloc ledger and the region tracker do
    pub tracking: TrackingLevel,

    /// Global and per-category malloc ceilings
    pub malloc_limit: MallocLimit,

    /// Zero-fill every new block (reproducible heap dumps)
    pub deterministic_fill: bool,

    /// Fill new blocks and grown realloc tails with a pad byte
    pub pad_fill: bool,

    /// Checksum the preserved prefix across a moving realloc
    pub verify_realloc_copy: bool,

    /// Consult large page sizes when choosing a page size for a region
    pub use_large_pages: bool,

    /// Largest page size to use, if capped
    pub large_page_size: Option<usize>,

    /// Warn when a block at this address is handed out or freed
    pub catch_ptr: Option<usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            tracking: TrackingLevel::Off,
            malloc_limit: MallocLimit::none(),
            deterministic_fill: false,
            pad_fill: cfg!(debug_assertions),
            verify_realloc_copy: cfg!(debug_assertions),
            use_large_pages: false,
            large_page_size: None,
            catch_ptr: None,
        }
    }
}

impl MemoryConfig {
    /// Fill pattern for fresh memory in debug configurations
    pub const PAD_BYTE: u8 = 0xF1;
}

/// Amount of native memory bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TrackingLevel {
    /// No headers, no accounting
    #[default]
    Off,
    /// Per-category counters
    Summary,
    /// Per-category counters plus per-call-site aggregation
    Detail,
}

impl TrackingLevel {
    /// Check if headers and accounting are active
    #[must_use]
    pub const fn enabled(self) -> bool {
        !matches!(self, Self::Off)
    }

    /// Name used in configuration strings
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Summary => "summary",
            Self::Detail => "detail",
        }
    }
}

impl fmt::Display for TrackingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingLevel {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "" => Ok(Self::Off),
            "summary" => Ok(Self::Summary),
            "detail" => Ok(Self::Detail),
            other => Err(MemoryError::invalid_config(format!(
                "unknown tracking level \"{other}\" (expected off, summary or detail)"
            ))),
        }
    }
}
