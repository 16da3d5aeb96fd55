use std::fmt;

use super::hex::PTR_WIDTH;
use crate::probe::{FetchWidth, SafeFetch, is_readable_pointer, read_safely_from};
use crate::utils::{align_up, is_aligned};

/// Something that can say what an address points into
///
/// The heap ledger and the virtual-memory tracker both implement this, so
/// crash reporting can classify a value without knowing about either.
pub trait LocationFinder: Send + Sync {
    /// Describe `addr` if it belongs to memory this finder knows about
    fn describe(&self, addr: usize) -> Option<String>;
}

/// Classify `addr` for a crash report
///
/// Finders are asked in order and the first answer wins. An address nobody
/// claims is shown as readable memory (with the containing word and the
/// bytes up to the next word boundary) or as an unknown value.
pub fn print_location(
    out: &mut dyn fmt::Write,
    addr: usize,
    probe: &(impl SafeFetch + ?Sized),
    finders: &[&dyn LocationFinder],
) -> fmt::Result {
    if addr == 0 {
        return writeln!(out, "0x0 is null");
    }

    if let Some(description) = finders.iter().find_map(|f| f.describe(addr)) {
        return writeln!(out, "{description}");
    }

    if is_readable_pointer(probe, addr) {
        write!(out, "{addr:#0PTR_WIDTH$x} points into unknown readable memory:")?;
        let word = size_of::<usize>();
        if is_aligned(addr, word)
            && let Some(value) = read_safely_from(probe, addr)
        {
            write!(out, " {:#0PTR_WIDTH$x} |", value as usize)?;
        }
        let end = align_up(addr + 1, word);
        for p in addr..end {
            match probe.try_read(p, FetchWidth::U8) {
                Some(b) => write!(out, " {b:02x}")?,
                None => write!(out, " ??")?,
            }
        }
        return writeln!(out);
    }

    writeln!(out, "{addr:#0PTR_WIDTH$x} is an unknown value")
}

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;
    use crate::probe::testing::ScriptedProbe;
    use pretty_assertions::assert_eq;

    struct Fixed(usize, &'static str);

    impl LocationFinder for Fixed {
        fn describe(&self, addr: usize) -> Option<String> {
            (addr == self.0).then(|| self.1.to_string())
        }
    }

    fn locate(addr: usize, probe: &ScriptedProbe, finders: &[&dyn LocationFinder]) -> String {
        let mut s = String::new();
        print_location(&mut s, addr, probe, finders).unwrap();
        s
    }

    #[test]
    fn null_is_reported_first() {
        let probe = ScriptedProbe::new();
        let finder = Fixed(0, "never");
        assert_eq!(locate(0, &probe, &[&finder]), "0x0 is null\n");
    }

    #[test]
    fn first_matching_finder_wins() {
        let probe = ScriptedProbe::new();
        let a = Fixed(0x10, "first");
        let b = Fixed(0x10, "second");
        assert_eq!(locate(0x10, &probe, &[&a, &b]), "first\n");
    }

    #[test]
    fn aligned_readable_memory_shows_word_and_bytes() {
        let probe = ScriptedProbe::new();
        probe.map(0x1000, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let word = usize::from_ne_bytes([1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(
            locate(0x1000, &probe, &[]),
            format!(
                "0x0000000000001000 points into unknown readable memory: {word:#018x} | 01 02 03 04 05 06 07 08\n"
            )
        );
    }

    #[test]
    fn unaligned_readable_memory_shows_bytes_to_word_end() {
        let probe = ScriptedProbe::new();
        probe.map(0x1000, &[1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(
            locate(0x1005, &probe, &[]),
            "0x0000000000001005 points into unknown readable memory: 06 07 08\n"
        );
    }

    #[test]
    fn unreadable_value() {
        let probe = ScriptedProbe::new();
        assert_eq!(
            locate(0xdead_0000, &probe, &[]),
            "0x00000000dead0000 is an unknown value\n"
        );
    }
}
