use std::ffi::c_void;
use std::fmt;

use super::hex::{PTR_WIDTH, print_hex_dump};
use crate::platform::{Frame, Platform};
use crate::probe::{FetchWidth, SafeFetch};

/// Bytes of stack shown by [`print_tos`]
pub const TOS_BYTES: usize = 512;

const INSTRUCTION_WINDOW: usize = 256;

/// Dump the top of the stack at `sp` in machine words
pub fn print_tos(out: &mut dyn fmt::Write, probe: &(impl SafeFetch + ?Sized), sp: usize) -> fmt::Result {
    writeln!(out)?;
    writeln!(out, "Top of Stack: (sp={sp:#0PTR_WIDTH$x})")?;
    print_hex_dump(out, probe, sp, sp.saturating_add(TOS_BYTES), FetchWidth::WORD, 16, sp)
}

/// Dump the bytes around `pc`
pub fn print_instructions(
    out: &mut dyn fmt::Write,
    probe: &(impl SafeFetch + ?Sized),
    pc: usize,
) -> fmt::Result {
    writeln!(out, "Instructions: (pc={pc:#0PTR_WIDTH$x})")?;
    let start = pc.saturating_sub(INSTRUCTION_WINDOW);
    print_hex_dump(out, probe, start, pc.saturating_add(INSTRUCTION_WINDOW), FetchWidth::U8, 16, start)
}

/// Stack top followed by the code around the program counter
///
/// The code is printed last because `pc` is the more likely of the two to
/// be garbage.
pub fn print_tos_pc(out: &mut dyn fmt::Write, probe: &(impl SafeFetch + ?Sized), frame: Frame) -> fmt::Result {
    print_tos(out, probe, frame.sp)?;
    writeln!(out)?;
    print_instructions(out, probe, frame.pc)?;
    writeln!(out)
}

/// [`print_tos_pc`] for the frame saved in a signal context
///
/// Prints nothing for a null context or one the platform cannot decode.
///
/// # Safety
/// `context` must be null or point at a live `ucontext_t`.
pub unsafe fn print_context(
    out: &mut dyn fmt::Write,
    platform: &dyn Platform,
    context: *const c_void,
) -> fmt::Result {
    // SAFETY: forwarded caller contract.
    match unsafe { platform.fetch_frame_from_context(context) } {
        Some(frame) => print_tos_pc(out, platform, frame),
        None => Ok(()),
    }
}

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;
    use crate::probe::testing::ScriptedProbe;

    #[test]
    fn tos_header_and_word_rows() {
        let probe = ScriptedProbe::new();
        probe.map_word(0x7000, 0x1122);
        let mut out = String::new();
        print_tos(&mut out, &probe, 0x7000).unwrap();

        let mut lines = out.lines();
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), Some("Top of Stack: (sp=0x0000000000007000)"));
        let first = lines.next().unwrap();
        assert!(first.starts_with("0x0000000000007000:   0000000000001122 ????????????????"));
        // 512 bytes at 16 per line
        assert_eq!(out.lines().count(), 2 + 32);
    }

    #[test]
    fn instructions_window_is_centered_on_pc() {
        let probe = ScriptedProbe::new();
        let mut out = String::new();
        print_instructions(&mut out, &probe, 0x10_0000).unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("Instructions: (pc=0x0000000000100000)"));
        assert!(lines.next().unwrap().starts_with("0x00000000000fff00:   ?? ??"));
    }

    #[test]
    fn garbage_registers_at_address_space_top() {
        let probe = ScriptedProbe::new();
        let mut out = String::new();
        let frame = Frame {
            pc: usize::MAX - 3,
            sp: usize::MAX - 63,
            fp: 0,
        };
        print_tos_pc(&mut out, &probe, frame).unwrap();

        assert!(out.contains("Top of Stack: (sp=0xffffffffffffffc0)"), "{out}");
        assert!(out.contains("0xfffffffffffffff0:   ???????????????? ???????????????? "), "{out}");
        assert!(out.contains("Instructions: (pc=0xfffffffffffffffc)"), "{out}");
    }

    #[test]
    fn pc_near_zero_does_not_underflow() {
        let probe = ScriptedProbe::new();
        let mut out = String::new();
        print_tos_pc(&mut out, &probe, Frame { pc: 0x10, sp: 0x20, fp: 0 }).unwrap();
        assert!(out.contains("Instructions: (pc=0x0000000000000010)"));
        assert!(out.contains("0x0000000000000000:   ??"));
    }
}
