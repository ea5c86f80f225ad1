//! Kernel-call trampoline table.
//!
//! Guest code invokes host functionality (syscalls, HLE routines) by
//! calling through a reserved guest address that the interpreter recognizes
//! and redirects into this table by a stable integer id, rather than by
//! guest address — ids are stable across JIT recompilation and across
//! save-state boundaries, guest addresses are not.
//!
//! The table is append-only: `register` hands back the index a call was
//! inserted at, which the caller then encodes into the guest trampoline
//! stub it patches into memory.

use esp_types::GuestAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum KernelCallError {
    #[error("kernel call id {0} is not registered")]
    UnknownId(u32),
}

/// A host function invoked on behalf of guest code, given the calling
/// core's thread state (left opaque here; `esp-cpu` downcasts it) and the
/// `userdata` pointer it was registered with.
pub type KernelCallFn = Box<dyn Fn(&mut dyn std::any::Any, *mut std::ffi::c_void) + Send + Sync>;

struct Entry {
    func: KernelCallFn,
    userdata: *mut std::ffi::c_void,
}

// `userdata` is an opaque handle the embedder promises is safe to share
// across the core threads that may invoke this kernel call.
unsafe impl Send for Entry {}
unsafe impl Sync for Entry {}

/// Append-only table of registered kernel calls, indexed by stable id.
#[derive(Default)]
pub struct KernelCallTable {
    entries: Vec<Entry>,
}

impl KernelCallTable {
    pub fn new() -> Self {
        KernelCallTable { entries: Vec::new() }
    }

    /// Registers a new kernel call and returns its stable id.
    pub fn register(&mut self, func: KernelCallFn, userdata: *mut std::ffi::c_void) -> u32 {
        self.entries.push(Entry { func, userdata });
        (self.entries.len() - 1) as u32
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invokes the kernel call registered at `id`.
    pub fn invoke(
        &self,
        id: u32,
        thread_state: &mut dyn std::any::Any,
    ) -> Result<(), KernelCallError> {
        let entry = self
            .entries
            .get(id as usize)
            .ok_or(KernelCallError::UnknownId(id))?;
        (entry.func)(thread_state, entry.userdata);
        Ok(())
    }
}

/// Guest address a kernel-call trampoline branches to; the interpreter
/// decodes the kernel-call id out of the instruction immediately following
/// this address rather than out of the address itself.
pub const TRAMPOLINE_ENTRY: GuestAddr = GuestAddr::new(0xFBADCA11);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn register_returns_sequential_ids() {
        let mut table = KernelCallTable::new();
        let id0 = table.register(Box::new(|_, _| {}), std::ptr::null_mut());
        let id1 = table.register(Box::new(|_, _| {}), std::ptr::null_mut());
        assert_eq!(id0, 0);
        assert_eq!(id1, 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn invoke_calls_registered_function() {
        let called = Arc::new(AtomicU32::new(0));
        let called_clone = Arc::clone(&called);
        let mut table = KernelCallTable::new();
        let id = table.register(
            Box::new(move |_state, _ud| {
                called_clone.fetch_add(1, Ordering::SeqCst);
            }),
            std::ptr::null_mut(),
        );
        let mut state = 0u32;
        table.invoke(id, &mut state).unwrap();
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invoke_unknown_id_is_an_error() {
        let table = KernelCallTable::new();
        let mut state = 0u32;
        assert_eq!(
            table.invoke(5, &mut state),
            Err(KernelCallError::UnknownId(5))
        );
    }
}
