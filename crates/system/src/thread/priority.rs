//! Abstract thread priorities and their native mapping

use std::fmt;

use super::{ThreadKind, ThreadRef};
use crate::error::{SystemError, SystemResult};
use crate::platform::Platform;

/// Abstract priority level
///
/// Ordinary threads use [`MIN`](Self::MIN)..=[`MAX`](Self::MAX).
/// [`CRITICAL`](Self::CRITICAL) is reserved for concurrent collector
/// threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadPriority(i32);

impl ThreadPriority {
    /// Lowest ordinary priority
    pub const MIN: Self = Self(1);
    /// Default priority
    pub const NORM: Self = Self(5);
    /// One below the maximum, used by service threads
    pub const NEAR_MAX: Self = Self(9);
    /// Highest ordinary priority
    pub const MAX: Self = Self(10);
    /// Above every ordinary priority
    pub const CRITICAL: Self = Self(11);

    /// Priority for a raw level in `MIN..=CRITICAL`
    #[must_use]
    pub const fn new(level: i32) -> Option<Self> {
        if level >= Self::MIN.0 && level <= Self::CRITICAL.0 {
            Some(Self(level))
        } else {
            None
        }
    }

    /// Raw level
    #[must_use]
    pub const fn level(self) -> i32 {
        self.0
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const TABLE_LEN: usize = ThreadPriority::CRITICAL.0 as usize + 1;

/// Mapping between abstract and native priorities
///
/// Index `p` holds the native value for abstract level `p`; index 0 is
/// unused. Native scales may run either way (niceness runs backwards), so
/// the direction is taken from the two ends and the entries between them
/// must follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityMap {
    table: [i32; TABLE_LEN],
    ascending: bool,
}

impl Default for PriorityMap {
    fn default() -> Self {
        Self::niceness()
    }
}

impl PriorityMap {
    /// Validate and wrap a native table
    pub fn new(table: [i32; TABLE_LEN]) -> SystemResult<Self> {
        let min = ThreadPriority::MIN.index();
        let max = ThreadPriority::MAX.index();
        let ascending = table[max] > table[min];

        for p in min..max {
            let (here, next) = (table[p], table[p + 1]);
            let ordered = if ascending { here <= next } else { here >= next };
            if !ordered {
                return Err(SystemError::PriorityTable {
                    reason: format!(
                        "entry {} ({here}) and entry {} ({next}) break the {} order",
                        p,
                        p + 1,
                        if ascending { "ascending" } else { "descending" }
                    ),
                });
            }
        }
        Ok(Self { table, ascending })
    }

    /// Linux niceness table: higher priority means lower nice value
    #[must_use]
    pub fn niceness() -> Self {
        Self {
            table: [19, 4, 3, 2, 1, 0, -1, -2, -3, -4, -5, -5],
            ascending: false,
        }
    }

    /// Whether larger native values mean higher priority
    #[must_use]
    pub const fn is_ascending(&self) -> bool {
        self.ascending
    }

    /// Native value for `priority`
    #[must_use]
    pub const fn to_native(&self, priority: ThreadPriority) -> i32 {
        self.table[priority.index()]
    }

    /// Nearest abstract level for a native value
    ///
    /// Scans down from [`ThreadPriority::MAX`] and stops at the first level
    /// whose native value does not exceed `native` (in the table's
    /// direction), bottoming out at [`ThreadPriority::MIN`].
    #[must_use]
    pub fn from_native(&self, native: i32) -> ThreadPriority {
        let min = ThreadPriority::MIN.0;
        let mut p = ThreadPriority::MAX.0;
        if self.ascending {
            while p > min && self.table[p as usize] > native {
                p -= 1;
            }
        } else {
            while p > min && self.table[p as usize] < native {
                p -= 1;
            }
        }
        ThreadPriority(p)
    }
}

/// Apply `priority` to `thread`
///
/// Only concurrent collector threads may use
/// [`ThreadPriority::CRITICAL`].
pub fn set_priority(
    platform: &dyn Platform,
    map: &PriorityMap,
    thread: ThreadRef,
    priority: ThreadPriority,
) -> SystemResult<()> {
    let allowed = (ThreadPriority::MIN..=ThreadPriority::MAX).contains(&priority)
        || (priority == ThreadPriority::CRITICAL && thread.kind == ThreadKind::ConcurrentGc);
    if !allowed {
        return Err(SystemError::InvalidPriority {
            priority: priority.level(),
            kind: thread.kind.name(),
        });
    }

    let native = map.to_native(priority);
    platform
        .set_native_priority(thread.id, native)
        .map_err(|e| {
            tracing::warn!(
                target: "os::thread",
                thread = thread.id,
                %priority,
                native,
                error = %e,
                "failed to set thread priority"
            );
            SystemError::platform("setpriority", &e)
        })
}

/// Read back the abstract priority of `thread`
pub fn get_priority(
    platform: &dyn Platform,
    map: &PriorityMap,
    thread: ThreadRef,
) -> SystemResult<ThreadPriority> {
    let native = platform.get_native_priority(thread.id).map_err(|e| {
        tracing::warn!(
            target: "os::thread",
            thread = thread.id,
            error = %e,
            "failed to get thread priority"
        );
        SystemError::platform("getpriority", &e)
    })?;
    Ok(map.from_native(native))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ascending_map() -> PriorityMap {
        PriorityMap::new([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]).unwrap()
    }

    #[test]
    fn niceness_table_is_valid_and_descending() {
        let checked = PriorityMap::new(PriorityMap::niceness().table).unwrap();
        assert!(!checked.is_ascending());
        assert_eq!(checked, PriorityMap::niceness());
    }

    #[rstest]
    #[case(4, ThreadPriority::MIN)]
    #[case(0, ThreadPriority::NORM)]
    #[case(-5, ThreadPriority::MAX)]
    #[case(-20, ThreadPriority::MAX)]
    #[case(19, ThreadPriority::MIN)]
    fn niceness_from_native(#[case] native: i32, #[case] expected: ThreadPriority) {
        assert_eq!(PriorityMap::niceness().from_native(native), expected);
    }

    #[rstest]
    #[case(10, ThreadPriority::MAX)]
    #[case(5, ThreadPriority::NORM)]
    #[case(0, ThreadPriority::MIN)]
    #[case(100, ThreadPriority::MAX)]
    fn ascending_from_native(#[case] native: i32, #[case] expected: ThreadPriority) {
        assert_eq!(ascending_map().from_native(native), expected);
    }

    #[test]
    fn round_trip_every_ordinary_level() {
        let map = ascending_map();
        for level in 1..=10 {
            let p = ThreadPriority::new(level).unwrap();
            assert_eq!(map.from_native(map.to_native(p)), p);
        }
    }

    #[test]
    fn non_monotonic_table_is_rejected() {
        let err = PriorityMap::new([0, 1, 2, 3, 9, 5, 6, 7, 8, 9, 10, 10]).unwrap_err();
        assert_eq!(err.code(), "SYS:THREAD:PRIORITY_TABLE");
    }

    #[test]
    fn levels_outside_range_do_not_exist() {
        assert_eq!(ThreadPriority::new(0), None);
        assert_eq!(ThreadPriority::new(12), None);
        assert_eq!(ThreadPriority::new(11), Some(ThreadPriority::CRITICAL));
    }
}
