//! Configuration presets for common scenarios

use super::{MallocLimit, MemoryConfig, TrackingLevel};
use crate::error::MemoryResult;

impl MemoryConfig {
    /// Create configuration from environment variables
    ///
    /// - `STRATUM_NMT`: `off`, `summary` or `detail`
    /// - `STRATUM_MALLOC_LIMIT`: see [`MallocLimit`]
    /// - `STRATUM_LARGE_PAGES`: `true`/`false`, or a page size such as `2m`
    ///   which both enables large pages and caps the size used
    pub fn from_env() -> MemoryResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> MemoryResult<Self> {
        let mut config = Self::default();

        if let Some(level) = lookup("STRATUM_NMT") {
            config.tracking = level.parse()?;
        }

        if let Some(limit) = lookup("STRATUM_MALLOC_LIMIT") {
            config.malloc_limit = limit.parse::<MallocLimit>()?;
        }

        if let Some(large) = lookup("STRATUM_LARGE_PAGES") {
            match large.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => config.use_large_pages = true,
                "0" | "false" | "no" | "off" | "" => config.use_large_pages = false,
                size => {
                    config.use_large_pages = true;
                    config.large_page_size = Some(super::limit::parse_size(size)?);
                }
            }
        }

        Ok(config)
    }

    /// Development configuration (detail tracking, pad fill, copy checks)
    #[must_use]
    pub fn development() -> Self {
        Self {
            tracking: TrackingLevel::Detail,
            pad_fill: true,
            verify_realloc_copy: true,
            ..Self::default()
        }
    }

    /// Production configuration (summary counters only)
    #[must_use]
    pub fn production() -> Self {
        Self {
            tracking: TrackingLevel::Summary,
            pad_fill: false,
            verify_realloc_copy: false,
            ..Self::default()
        }
    }

    /// Deterministic configuration for reproducible heap dumps
    #[must_use]
    pub fn deterministic() -> Self {
        Self {
            deterministic_fill: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::MemFlags;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_is_default() {
        assert_eq!(MemoryConfig::from_lookup(lookup(&[])).unwrap(), MemoryConfig::default());
    }

    #[test]
    fn environment_overrides() {
        let config = MemoryConfig::from_lookup(lookup(&[
            ("STRATUM_NMT", "detail"),
            ("STRATUM_MALLOC_LIMIT", "compiler:500m"),
            ("STRATUM_LARGE_PAGES", "2m"),
        ]))
        .unwrap();
        assert_eq!(config.tracking, TrackingLevel::Detail);
        assert_eq!(config.malloc_limit.category(MemFlags::Compiler), Some(500 << 20));
        assert!(config.use_large_pages);
        assert_eq!(config.large_page_size, Some(2 << 20));
    }

    #[test]
    fn large_pages_flag_without_size() {
        let config = MemoryConfig::from_lookup(lookup(&[("STRATUM_LARGE_PAGES", "true")])).unwrap();
        assert!(config.use_large_pages);
        assert_eq!(config.large_page_size, None);
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(MemoryConfig::from_lookup(lookup(&[("STRATUM_NMT", "loud")])).is_err());
        assert!(MemoryConfig::from_lookup(lookup(&[("STRATUM_MALLOC_LIMIT", "1q")])).is_err());
    }

    #[test]
    fn presets() {
        assert_eq!(MemoryConfig::development().tracking, TrackingLevel::Detail);
        assert!(!MemoryConfig::production().pad_fill);
        assert!(MemoryConfig::deterministic().deterministic_fill);
    }
}
