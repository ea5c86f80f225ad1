//! Per-core interrupt bus.
//!
//! Each core owns one [`InterruptBus`]: an atomic pending-interrupt word,
//! an atomic enable mask, and a condition variable the core's execution
//! loop parks on between instruction-boundary checks. [`Interrupts::DBGBREAK`]
//! and [`Interrupts::SRESET`] are always delivered regardless of the mask —
//! see [`NONMASKABLE_INTERRUPTS`].
//!
//! [`InterruptBus::check_interrupts`] also probes the shared breakpoint
//! registry: a hit there consumes the entry's one-shot flag, raises
//! `DBGBREAK` locally, and fans `DBGBREAK` out to every sibling bus passed
//! in — a breakpoint hit on one core must stop all three, mirroring
//! `cpu_interrupts.cpp`'s `check_interrupts` loop.

use bitflags::bitflags;
use esp_debug::BreakpointRegistry;
use esp_types::GuestAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupts: u32 {
        /// Decrementer register reached zero.
        const DECREMENTER = 1 << 0;
        /// External interrupt line asserted (e.g. GPU command-processor IRQ).
        const EXTERNAL    = 1 << 1;
        /// `esp-timers` alarm deadline elapsed.
        const ALARM       = 1 << 2;
        /// A breakpoint was hit at the current program counter.
        const DBGBREAK    = 1 << 3;
        /// Soft reset requested.
        const SRESET      = 1 << 4;
    }
}

/// Interrupts that are delivered even while masked.
pub const NONMASKABLE_INTERRUPTS: Interrupts = Interrupts::SRESET.union(Interrupts::DBGBREAK);

pub struct InterruptBus {
    pending: AtomicU32,
    mask: AtomicU32,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl Default for InterruptBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptBus {
    pub fn new() -> Self {
        InterruptBus {
            pending: AtomicU32::new(0),
            mask: AtomicU32::new(Interrupts::all().bits()),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    /// Sets which maskable interrupts are currently enabled. Nonmaskable
    /// interrupts ignore this setting entirely.
    pub fn set_mask(&self, mask: Interrupts) {
        self.mask.store(mask.bits(), Ordering::Release);
    }

    pub fn mask(&self) -> Interrupts {
        Interrupts::from_bits_truncate(self.mask.load(Ordering::Acquire))
    }

    /// Raises `kind` and wakes any thread parked in
    /// [`Self::wait_for_interrupt`].
    pub fn raise(&self, kind: Interrupts) {
        self.pending.fetch_or(kind.bits(), Ordering::AcqRel);
        let _guard = self.wake_lock.lock().unwrap();
        self.wake.notify_all();
    }

    fn deliverable_mask(&self) -> u32 {
        self.mask.load(Ordering::Acquire) | NONMASKABLE_INTERRUPTS.bits()
    }

    /// Interrupts currently pending and deliverable (i.e. either unmasked
    /// or nonmaskable), without clearing them.
    pub fn pending_deliverable(&self) -> Interrupts {
        let pending = self.pending.load(Ordering::Acquire);
        Interrupts::from_bits_truncate(pending & self.deliverable_mask())
    }

    /// Probes `breakpoints` at `pc`. A hit consumes the entry's one-shot
    /// flag, raises `DBGBREAK` on this bus, and raises `DBGBREAK` on every
    /// bus in `siblings` too — a breakpoint stops every core, not just the
    /// one that hit it. Then atomically samples and clears every
    /// currently-deliverable interrupt, returning the set that was
    /// serviced.
    pub fn check_interrupts(
        &self,
        breakpoints: &BreakpointRegistry,
        pc: GuestAddr,
        siblings: &[Arc<InterruptBus>],
    ) -> Interrupts {
        if breakpoints.pop_breakpoint(pc) {
            self.raise(Interrupts::DBGBREAK);
            for sibling in siblings {
                sibling.raise(Interrupts::DBGBREAK);
            }
        }
        let deliverable = self.deliverable_mask();
        let served = self.pending.fetch_and(!deliverable, Ordering::AcqRel) & deliverable;
        Interrupts::from_bits_truncate(served)
    }

    /// Parks the calling thread until a deliverable interrupt is pending or
    /// `timeout` elapses. Does not clear anything; call
    /// [`Self::check_interrupts`] afterward to service what woke it.
    pub fn wait_for_interrupt(&self, timeout: Duration) {
        if !self.pending_deliverable().is_empty() {
            return;
        }
        let guard = self.wake_lock.lock().unwrap();
        if !self.pending_deliverable().is_empty() {
            return;
        }
        let _ = self.wake.wait_timeout(guard, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_interrupt_is_not_deliverable() {
        let bus = InterruptBus::new();
        bus.set_mask(Interrupts::empty());
        bus.raise(Interrupts::EXTERNAL);
        assert!(bus.pending_deliverable().is_empty());
    }

    #[test]
    fn nonmaskable_interrupt_ignores_mask() {
        let bus = InterruptBus::new();
        bus.set_mask(Interrupts::empty());
        bus.raise(Interrupts::SRESET);
        assert_eq!(bus.pending_deliverable(), Interrupts::SRESET);
    }

    #[test]
    fn check_interrupts_clears_served_bits() {
        let bus = InterruptBus::new();
        let breakpoints = BreakpointRegistry::new();
        bus.raise(Interrupts::DECREMENTER);
        let served = bus.check_interrupts(&breakpoints, GuestAddr::new(0), &[]);
        assert_eq!(served, Interrupts::DECREMENTER);
        assert!(bus.pending_deliverable().is_empty());
    }

    #[test]
    fn breakpoint_hit_raises_dbgbreak() {
        let bus = InterruptBus::new();
        let breakpoints = BreakpointRegistry::new();
        bus.set_mask(Interrupts::empty());
        breakpoints
            .add_breakpoint(GuestAddr::new(0x1000), esp_debug::BreakpointFlags::USER_BPFLAG)
            .unwrap();
        let served = bus.check_interrupts(&breakpoints, GuestAddr::new(0x1000), &[]);
        assert_eq!(served, Interrupts::DBGBREAK);
    }

    #[test]
    fn system_breakpoint_fires_once_then_stays_clear() {
        let bus = InterruptBus::new();
        let breakpoints = BreakpointRegistry::new();
        breakpoints
            .add_breakpoint(GuestAddr::new(0x2000), esp_debug::BreakpointFlags::SYSTEM_BPFLAG)
            .unwrap();

        let first = bus.check_interrupts(&breakpoints, GuestAddr::new(0x2000), &[]);
        assert_eq!(first, Interrupts::DBGBREAK);

        let second = bus.check_interrupts(&breakpoints, GuestAddr::new(0x2000), &[]);
        assert!(!second.contains(Interrupts::DBGBREAK));
    }

    #[test]
    fn breakpoint_hit_fans_dbgbreak_out_to_siblings() {
        let bus = Arc::new(InterruptBus::new());
        let sibling_a = Arc::new(InterruptBus::new());
        let sibling_b = Arc::new(InterruptBus::new());
        let breakpoints = BreakpointRegistry::new();
        breakpoints
            .add_breakpoint(GuestAddr::new(0x3000), esp_debug::BreakpointFlags::USER_BPFLAG)
            .unwrap();

        let siblings = [Arc::clone(&sibling_a), Arc::clone(&sibling_b)];
        let served = bus.check_interrupts(&breakpoints, GuestAddr::new(0x3000), &siblings);

        assert_eq!(served, Interrupts::DBGBREAK);
        assert!(sibling_a.pending_deliverable().contains(Interrupts::DBGBREAK));
        assert!(sibling_b.pending_deliverable().contains(Interrupts::DBGBREAK));
    }

    #[test]
    fn wait_for_interrupt_returns_once_raised() {
        use std::thread;
        use std::time::Duration;

        let bus = Arc::new(InterruptBus::new());
        let bus2 = Arc::clone(&bus);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            bus2.raise(Interrupts::EXTERNAL);
        });
        bus.wait_for_interrupt(Duration::from_secs(2));
        assert!(!bus.pending_deliverable().is_empty());
        handle.join().unwrap();
    }
}
