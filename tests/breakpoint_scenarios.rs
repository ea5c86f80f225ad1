//! End-to-end breakpoint registry scenarios.

use esp_debug::{BreakpointFlags, BreakpointRegistry};
use esp_types::GuestAddr;

#[test]
fn s1_breakpoint_merge() {
    let reg = BreakpointRegistry::new();
    let addr = GuestAddr::new(0x1000);
    let flag_a = BreakpointFlags::from_bits_truncate(0b0001);
    let flag_b = BreakpointFlags::from_bits_truncate(0b0010);
    let both = BreakpointFlags::from_bits_truncate(0b0011);

    assert!(reg.add_breakpoint(addr, flag_a).unwrap());
    assert!(reg.add_breakpoint(addr, flag_b).unwrap());
    assert!(!reg.add_breakpoint(addr, both).unwrap());

    assert!(reg.remove_breakpoint(addr, flag_a));
    assert!(!reg.remove_breakpoint(addr, BreakpointFlags::from_bits_truncate(0b0100)));

    assert!(reg.pop_breakpoint(addr));
    assert!(reg.has_breakpoints());
}

#[test]
fn s2_system_one_shot() {
    let reg = BreakpointRegistry::new();
    let addr = GuestAddr::new(0x2000);
    reg.add_breakpoint(addr, BreakpointFlags::SYSTEM_BPFLAG).unwrap();
    assert!(reg.pop_breakpoint(addr));
    assert!(!reg.has_breakpoints());
}

#[test]
fn s3_rejected_inputs() {
    let reg = BreakpointRegistry::new();
    let terminator = GuestAddr::new(esp_types::BREAKPOINT_LIST_TERMINATOR);
    assert!(reg.add_breakpoint(terminator, BreakpointFlags::USER_BPFLAG).is_err());
    assert!(reg
        .add_breakpoint(GuestAddr::new(0x3000), BreakpointFlags::empty())
        .is_err());
}

#[test]
fn p3_add_then_remove_same_flags_restores_prior_state() {
    let reg = BreakpointRegistry::new();
    let addr = GuestAddr::new(0x9000);
    let flags = BreakpointFlags::USER_BPFLAG | BreakpointFlags::SYSTEM_BPFLAG;

    assert!(!reg.has_breakpoints());
    reg.add_breakpoint(addr, flags).unwrap();
    assert!(reg.has_breakpoints());
    reg.remove_breakpoint(addr, flags);
    assert!(!reg.has_breakpoints(), "entry with zero remaining flags must be absent");
}
