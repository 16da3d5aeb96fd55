//! Formatters run against real process memory

use stratum_system::diagnostics::{print_hex_dump, print_location};
use stratum_system::probe::{FetchWidth, HostProbe};

#[test]
fn hex_dump_of_a_live_buffer() {
    let buf: Box<[u8; 8]> = Box::new([0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3]);
    let start = buf.as_ptr() as usize;
    let mut out = String::new();
    print_hex_dump(&mut out, HostProbe::global(), start, start + 8, FetchWidth::U8, 8, 0).unwrap();
    assert!(out.ends_with(":   de ad be ef 00 01 02 03 \n"), "{out}");
}

#[test]
fn unknown_locations() {
    let value = Box::new(0usize);
    let addr = std::ptr::from_ref::<usize>(&value) as usize;

    let mut out = String::new();
    print_location(&mut out, addr, HostProbe::global(), &[]).unwrap();
    assert!(out.contains("points into unknown readable memory"), "{out}");

    out.clear();
    print_location(&mut out, 0x8, HostProbe::global(), &[]).unwrap();
    assert!(out.ends_with("is an unknown value\n"), "{out}");

    out.clear();
    print_location(&mut out, 0, HostProbe::global(), &[]).unwrap();
    assert_eq!(out, "0x0 is null\n");
}
