//! Lock-free breakpoint registry shared by the interpreter, JIT and
//! interrupt bus.
//!
//! The registry is read on every instruction boundary (interpreter) or
//! block-entry check (JIT), so reads must never block or allocate. Writes
//! (setting/clearing a breakpoint from a debugger session) are rare and may
//! allocate freely. This is the textbook fit for an epoch-reclaimed
//! atomic-pointer-to-immutable-array: readers load a pointer and walk a
//! `Vec` that can never mutate underneath them; writers build a new `Vec`
//! and swap the pointer in with a CAS loop, deferring destruction of the
//! old one until no reader can still be holding it.
//!
//! Each entry is an `(address, flags)` pair; flags are a bitset rather than
//! a boolean, so a single address can carry multiple independently-owned
//! breakpoint reasons at once (e.g. a user breakpoint and the one-shot
//! debugger-step flag). [`BREAKPOINT_LIST_TERMINATOR`] is reserved and can
//! never be added.

use bitflags::bitflags;
use crossbeam_epoch::{self as epoch, Atomic, Owned};
use esp_types::{GuestAddr, BREAKPOINT_LIST_TERMINATOR};
use std::sync::atomic::Ordering;
use thiserror::Error;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BreakpointFlags: u32 {
        /// Cleared automatically the first time the entry is matched by
        /// [`BreakpointRegistry::pop_breakpoint`].
        const SYSTEM_BPFLAG = 1 << 0;
        const USER_BPFLAG   = 1 << 1;
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum BreakpointError {
    #[error("address 0x{0:08x} is the reserved breakpoint-list terminator")]
    ReservedAddress(u32),
    #[error("flag set may not be empty")]
    EmptyFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub addr: GuestAddr,
    pub flags: BreakpointFlags,
}

/// Lock-free set of `(address, flags)` breakpoint entries.
pub struct BreakpointRegistry {
    list: Atomic<Vec<Breakpoint>>,
}

impl Default for BreakpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointRegistry {
    pub fn new() -> Self {
        BreakpointRegistry {
            list: Atomic::new(Vec::new()),
        }
    }

    fn check_addable(addr: GuestAddr, flags: BreakpointFlags) -> Result<(), BreakpointError> {
        if addr.0 == BREAKPOINT_LIST_TERMINATOR {
            return Err(BreakpointError::ReservedAddress(addr.0));
        }
        if flags.is_empty() {
            return Err(BreakpointError::EmptyFlags);
        }
        Ok(())
    }

    /// ORs `flags` into the entry at `addr`, creating it if absent. Returns
    /// whether the entry's flags actually changed.
    pub fn add_breakpoint(
        &self,
        addr: GuestAddr,
        flags: BreakpointFlags,
    ) -> Result<bool, BreakpointError> {
        Self::check_addable(addr, flags)?;
        let guard = &epoch::pin();
        loop {
            let current = self.list.load(Ordering::Acquire, guard);
            let current_ref = unsafe { current.as_ref() };
            let mut next: Vec<Breakpoint> = current_ref.cloned().unwrap_or_default();
            let changed = match next.iter_mut().find(|b| b.addr == addr) {
                Some(existing) => {
                    let merged = existing.flags | flags;
                    let changed = merged != existing.flags;
                    existing.flags = merged;
                    changed
                }
                None => {
                    next.push(Breakpoint { addr, flags });
                    true
                }
            };
            if !changed {
                return Ok(false);
            }
            let new = Owned::new(next);
            match self.list.compare_exchange(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    if !current.is_null() {
                        unsafe { guard.defer_destroy(current) };
                    }
                    return Ok(true);
                }
                Err(_) => continue,
            }
        }
    }

    /// Subtracts `flags` from the entry at `addr`, deleting the entry if no
    /// flags remain. Returns whether `addr` had an entry at all (i.e. any
    /// flag could have matched), regardless of whether `flags` intersected
    /// it.
    pub fn remove_breakpoint(&self, addr: GuestAddr, flags: BreakpointFlags) -> bool {
        let guard = &epoch::pin();
        loop {
            let current = self.list.load(Ordering::Acquire, guard);
            let current_ref = unsafe { current.as_ref() };
            let Some(current_ref) = current_ref else {
                return false;
            };
            let Some(existing) = current_ref.iter().find(|b| b.addr == addr) else {
                return false;
            };
            let matched = !(existing.flags & flags).is_empty();
            let remaining = existing.flags & !flags;
            let mut next: Vec<Breakpoint> = current_ref
                .iter()
                .filter(|b| b.addr != addr)
                .copied()
                .collect();
            if !remaining.is_empty() {
                next.push(Breakpoint {
                    addr,
                    flags: remaining,
                });
            }
            let new = Owned::new(next);
            match self.list.compare_exchange(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    return matched;
                }
                Err(_) => continue,
            }
        }
    }

    /// Clears `mask` from every entry in the table, deleting entries left
    /// with no flags. Returns whether anything changed.
    pub fn clear_breakpoints(&self, mask: BreakpointFlags) -> bool {
        let guard = &epoch::pin();
        loop {
            let current = self.list.load(Ordering::Acquire, guard);
            let Some(current_ref) = (unsafe { current.as_ref() }) else {
                return false;
            };
            if current_ref.is_empty() {
                return false;
            }
            let next: Vec<Breakpoint> = current_ref
                .iter()
                .filter_map(|b| {
                    let remaining = b.flags & !mask;
                    (!remaining.is_empty()).then_some(Breakpoint {
                        addr: b.addr,
                        flags: remaining,
                    })
                })
                .collect();
            let changed = next.len() != current_ref.len()
                || next
                    .iter()
                    .zip(current_ref.iter())
                    .any(|(a, b)| a.flags != b.flags);
            if !changed {
                return false;
            }
            let new = Owned::new(next);
            match self.list.compare_exchange(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(_) => {
                    unsafe { guard.defer_destroy(current) };
                    return true;
                }
                Err(_) => continue,
            }
        }
    }

    /// Probes `addr`; if the entry carries `SYSTEM_BPFLAG`, clears that bit
    /// (one-shot). Returns whether any flag was present at `addr`.
    pub fn pop_breakpoint(&self, addr: GuestAddr) -> bool {
        let guard = &epoch::pin();
        let current = self.list.load(Ordering::Acquire, guard);
        let hit = unsafe { current.as_ref() }
            .map(|list| list.iter().any(|b| b.addr == addr))
            .unwrap_or(false);
        if !hit {
            return false;
        }
        self.remove_breakpoint(addr, BreakpointFlags::SYSTEM_BPFLAG);
        true
    }

    /// Whether `addr` currently carries any breakpoint flags, without
    /// mutating anything (unlike [`Self::pop_breakpoint`]).
    pub fn hit(&self, addr: GuestAddr) -> bool {
        let guard = &epoch::pin();
        let current = self.list.load(Ordering::Acquire, guard);
        unsafe { current.as_ref() }
            .map(|list| list.iter().any(|b| b.addr == addr))
            .unwrap_or(false)
    }

    pub fn has_breakpoints(&self) -> bool {
        let guard = &epoch::pin();
        let current = self.list.load(Ordering::Acquire, guard);
        unsafe { current.as_ref() }.map_or(false, |v| !v.is_empty())
    }
}

impl Drop for BreakpointRegistry {
    fn drop(&mut self) {
        let guard = &epoch::pin();
        let current = self
            .list
            .swap(Owned::new(Vec::new()), Ordering::AcqRel, guard);
        if !current.is_null() {
            unsafe { guard.defer_destroy(current) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoint_merge_scenario() {
        let reg = BreakpointRegistry::new();
        let a = BreakpointFlags::from_bits_truncate(0b0001);
        let b = BreakpointFlags::from_bits_truncate(0b0010);
        let both = BreakpointFlags::from_bits_truncate(0b0011);

        assert!(reg.add_breakpoint(GuestAddr::new(0x1000), a).unwrap());
        assert!(reg.add_breakpoint(GuestAddr::new(0x1000), b).unwrap());
        assert!(!reg.add_breakpoint(GuestAddr::new(0x1000), both).unwrap());

        assert!(reg.remove_breakpoint(GuestAddr::new(0x1000), a));
        assert!(!reg.remove_breakpoint(GuestAddr::new(0x1000), BreakpointFlags::from_bits_truncate(0b0100)));

        assert!(reg.pop_breakpoint(GuestAddr::new(0x1000)));
        assert!(reg.has_breakpoints());
    }

    #[test]
    fn system_one_shot_scenario() {
        let reg = BreakpointRegistry::new();
        reg.add_breakpoint(GuestAddr::new(0x2000), BreakpointFlags::SYSTEM_BPFLAG)
            .unwrap();
        assert!(reg.pop_breakpoint(GuestAddr::new(0x2000)));
        assert!(!reg.has_breakpoints());
    }

    #[test]
    fn rejected_inputs_scenario() {
        let reg = BreakpointRegistry::new();
        assert_eq!(
            reg.add_breakpoint(
                GuestAddr::new(BREAKPOINT_LIST_TERMINATOR),
                BreakpointFlags::USER_BPFLAG
            ),
            Err(BreakpointError::ReservedAddress(BREAKPOINT_LIST_TERMINATOR))
        );
        assert_eq!(
            reg.add_breakpoint(GuestAddr::new(0x3000), BreakpointFlags::empty()),
            Err(BreakpointError::EmptyFlags)
        );
    }

    #[test]
    fn add_then_remove_same_flags_restores_prior_state() {
        let reg = BreakpointRegistry::new();
        let flags = BreakpointFlags::USER_BPFLAG;
        assert!(!reg.has_breakpoints());
        reg.add_breakpoint(GuestAddr::new(0x4000), flags).unwrap();
        reg.remove_breakpoint(GuestAddr::new(0x4000), flags);
        assert!(!reg.has_breakpoints());
    }

    #[test]
    fn clear_breakpoints_applies_mask_to_every_entry() {
        let reg = BreakpointRegistry::new();
        reg.add_breakpoint(GuestAddr::new(0x5000), BreakpointFlags::all())
            .unwrap();
        reg.add_breakpoint(GuestAddr::new(0x6000), BreakpointFlags::SYSTEM_BPFLAG)
            .unwrap();
        assert!(reg.clear_breakpoints(BreakpointFlags::SYSTEM_BPFLAG));
        assert!(reg.hit(GuestAddr::new(0x5000)));
        assert!(!reg.hit(GuestAddr::new(0x6000)));
    }

    #[test]
    fn concurrent_add_from_multiple_threads_preserves_all_entries() {
        use std::sync::Arc;
        let reg = Arc::new(BreakpointRegistry::new());
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let reg = Arc::clone(&reg);
            handles.push(std::thread::spawn(move || {
                reg.add_breakpoint(GuestAddr::new(0x7000 + i), BreakpointFlags::USER_BPFLAG)
                    .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..8u32 {
            assert!(reg.hit(GuestAddr::new(0x7000 + i)));
        }
    }
}
