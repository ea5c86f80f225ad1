//! End-to-end interrupt-bus scenarios.

use esp_debug::BreakpointRegistry;
use esp_interrupts::{InterruptBus, Interrupts};
use esp_types::GuestAddr;
use std::sync::Arc;
use std::thread;

#[test]
fn p4_interleaved_posts_coalesce_into_one_delivery() {
    let bus = InterruptBus::new();
    bus.raise(Interrupts::DECREMENTER);
    bus.raise(Interrupts::EXTERNAL);

    let breakpoints = BreakpointRegistry::new();
    let served = bus.check_interrupts(&breakpoints, GuestAddr::new(0), &[]);
    assert_eq!(served, Interrupts::DECREMENTER | Interrupts::EXTERNAL);
    assert!(bus.pending_deliverable().is_empty());
}

#[test]
fn s5_interrupt_coalescing_from_two_threads() {
    let bus = Arc::new(InterruptBus::new());
    let breakpoints = Arc::new(BreakpointRegistry::new());

    let b1 = Arc::clone(&bus);
    let b2 = Arc::clone(&bus);
    let t1 = thread::spawn(move || b1.raise(Interrupts::DECREMENTER));
    let t2 = thread::spawn(move || b2.raise(Interrupts::EXTERNAL));
    t1.join().unwrap();
    t2.join().unwrap();

    let served = bus.check_interrupts(&breakpoints, GuestAddr::new(0), &[]);
    assert_eq!(served, Interrupts::DECREMENTER | Interrupts::EXTERNAL);

    // Nothing left pending: a second call sees an empty set.
    assert!(bus.check_interrupts(&breakpoints, GuestAddr::new(0), &[]).is_empty());
}

#[test]
fn breakpoint_hit_on_one_core_fans_dbgbreak_out_to_siblings() {
    let core0 = Arc::new(InterruptBus::new());
    let core1 = Arc::new(InterruptBus::new());
    let core2 = Arc::new(InterruptBus::new());
    let breakpoints = BreakpointRegistry::new();
    breakpoints
        .add_breakpoint(GuestAddr::new(0x8000), esp_debug::BreakpointFlags::USER_BPFLAG)
        .unwrap();

    let siblings = [Arc::clone(&core1), Arc::clone(&core2)];
    let served = core0.check_interrupts(&breakpoints, GuestAddr::new(0x8000), &siblings);

    assert_eq!(served, Interrupts::DBGBREAK);
    assert!(core1.pending_deliverable().contains(Interrupts::DBGBREAK));
    assert!(core2.pending_deliverable().contains(Interrupts::DBGBREAK));

    // One-shot: a second pass over the same pc on core0 raises nothing new.
    assert!(!core0
        .check_interrupts(&breakpoints, GuestAddr::new(0x8000), &[])
        .contains(Interrupts::DBGBREAK));
}
