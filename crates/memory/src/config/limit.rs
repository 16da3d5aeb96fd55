use std::fmt;
use std::str::FromStr;

use stratum_system::utils::{byte_size_in_exact_unit, exact_unit_for_byte_size};

use crate::error::MemoryError;
use crate::flags::MemFlags;

/// Malloc ceilings
///
/// Parsed from a comma-separated list where a bare size limits the total
/// (`"1g"`) and `category:size` limits one category
/// (`"compiler:500m,internal:1g"`). Sizes take an optional `k`, `m` or `g`
/// suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "String", into = "String"))]
pub struct MallocLimit {
    total: Option<usize>,
    per_category: [Option<usize>; MemFlags::COUNT],
}

impl MallocLimit {
    /// No ceilings
    #[must_use]
    pub const fn none() -> Self {
        Self {
            total: None,
            per_category: [None; MemFlags::COUNT],
        }
    }

    /// Limit total malloc'd bytes
    #[must_use]
    pub const fn with_total(mut self, bytes: usize) -> Self {
        self.total = Some(bytes);
        self
    }

    /// Limit bytes charged to `flags`
    #[must_use]
    pub const fn with_category(mut self, flags: MemFlags, bytes: usize) -> Self {
        self.per_category[flags.index()] = Some(bytes);
        self
    }

    /// Global ceiling
    #[must_use]
    pub const fn total(&self) -> Option<usize> {
        self.total
    }

    /// Ceiling for `flags`
    #[must_use]
    pub const fn category(&self, flags: MemFlags) -> Option<usize> {
        self.per_category[flags.index()]
    }

    /// Check if no ceiling is configured at all
    #[must_use]
    pub fn is_none(&self) -> bool {
        self.total.is_none() && self.per_category.iter().all(Option::is_none)
    }
}

impl Default for MallocLimit {
    fn default() -> Self {
        Self::none()
    }
}

/// Parse `"500m"`-style sizes
pub(crate) fn parse_size(text: &str) -> Result<usize, MemoryError> {
    let text = text.trim();
    let (digits, shift) = match text.as_bytes().last() {
        Some(b'k' | b'K') => (&text[..text.len() - 1], 10),
        Some(b'm' | b'M') => (&text[..text.len() - 1], 20),
        Some(b'g' | b'G') => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    let value: usize = digits
        .parse()
        .map_err(|_| MemoryError::invalid_config(format!("invalid size \"{text}\"")))?;
    value
        .checked_mul(1usize << shift)
        .ok_or_else(|| MemoryError::invalid_config(format!("size \"{text}\" overflows")))
}

fn format_size(bytes: usize) -> String {
    let unit = match exact_unit_for_byte_size(bytes) {
        "B" => "",
        "K" => "k",
        "M" => "m",
        _ => "g",
    };
    format!("{}{unit}", byte_size_in_exact_unit(bytes))
}

impl FromStr for MallocLimit {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut limit = Self::none();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once(':') {
                None => {
                    if limit.total.is_some() {
                        return Err(MemoryError::invalid_config("duplicate total malloc limit"));
                    }
                    limit.total = Some(parse_size(entry)?);
                }
                Some((name, size)) => {
                    let flags = MemFlags::from_name(name).ok_or_else(|| {
                        MemoryError::invalid_config(format!("unknown memory category \"{name}\""))
                    })?;
                    let slot = &mut limit.per_category[flags.index()];
                    if slot.is_some() {
                        return Err(MemoryError::invalid_config(format!(
                            "duplicate malloc limit for {}",
                            flags.short_name()
                        )));
                    }
                    *slot = Some(parse_size(size)?);
                }
            }
        }
        Ok(limit)
    }
}

impl fmt::Display for MallocLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(total) = self.total {
            parts.push(format_size(total));
        }
        for flags in MemFlags::ALL {
            if let Some(bytes) = self.category(*flags) {
                parts.push(format!("{}:{}", flags.short_name(), format_size(bytes)));
            }
        }
        f.write_str(&parts.join(","))
    }
}

impl TryFrom<String> for MallocLimit {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MallocLimit> for String {
    fn from(limit: MallocLimit) -> Self {
        limit.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("4096", 4096)]
    #[case("64k", 64 << 10)]
    #[case("500M", 500 << 20)]
    #[case("1g", 1 << 30)]
    fn sizes_parse(#[case] input: &str, #[case] expected: usize) {
        assert_eq!(parse_size(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("g")]
    #[case("12x")]
    #[case("-1k")]
    fn bad_sizes_are_rejected(#[case] input: &str) {
        assert!(parse_size(input).is_err());
    }

    #[test]
    fn global_form() {
        let limit: MallocLimit = "1g".parse().unwrap();
        assert_eq!(limit.total(), Some(1 << 30));
        assert_eq!(limit.category(MemFlags::Compiler), None);
    }

    #[test]
    fn category_form() {
        let limit: MallocLimit = "compiler:500m, internal:1g".parse().unwrap();
        assert_eq!(limit.total(), None);
        assert_eq!(limit.category(MemFlags::Compiler), Some(500 << 20));
        assert_eq!(limit.category(MemFlags::Internal), Some(1 << 30));
        assert_eq!(limit.to_string(), "compiler:500m,internal:1g");
    }

    #[rstest]
    #[case("1g,2g")]
    #[case("compiler:1m,mtCompiler:2m")]
    #[case("heapish:1m")]
    fn invalid_lists_are_rejected(#[case] input: &str) {
        assert!(input.parse::<MallocLimit>().is_err());
    }

    #[test]
    fn empty_string_means_unlimited() {
        assert!("".parse::<MallocLimit>().unwrap().is_none());
    }

    proptest! {
        #[test]
        fn display_parses_back(total in proptest::option::of(1usize..1 << 40), gc in proptest::option::of(1usize..1 << 40)) {
            let mut limit = MallocLimit::none();
            if let Some(t) = total {
                limit = limit.with_total(t);
            }
            if let Some(g) = gc {
                limit = limit.with_category(MemFlags::Gc, g);
            }
            prop_assert_eq!(limit.to_string().parse::<MallocLimit>().unwrap(), limit);
        }
    }
}
