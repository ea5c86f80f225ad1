//! Per-core, per-instruction execution counters.
//!
//! Used by the JIT's interpreter-fallback trampoline and by `esp-engine`'s
//! diagnostics surface to report which opcodes are hot on which core,
//! without taking a lock on the hot path — every counter is a plain atomic,
//! indexed by [`InstructionId::index`].

use esp_decoder::InstructionId;
use esp_types::NUM_CORES;
use std::sync::atomic::{AtomicU64, Ordering};

/// One counter per [`InstructionId`] for a single core.
pub struct CoreCounters {
    counts: Vec<AtomicU64>,
}

impl Default for CoreCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreCounters {
    pub fn new() -> Self {
        CoreCounters {
            counts: (0..InstructionId::COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    pub fn record(&self, id: InstructionId) {
        self.counts[id.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, id: InstructionId) -> u64 {
        self.counts[id.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    pub fn reset(&self) {
        for c in &self.counts {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Counters for every core the engine runs.
pub struct PerfCounters {
    per_core: Vec<CoreCounters>,
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfCounters {
    pub fn new() -> Self {
        PerfCounters {
            per_core: (0..NUM_CORES).map(|_| CoreCounters::new()).collect(),
        }
    }

    pub fn core(&self, index: usize) -> &CoreCounters {
        &self.per_core[index]
    }

    /// Top `n` instructions by execution count across all cores combined,
    /// highest first.
    pub fn hottest(&self, n: usize) -> Vec<(InstructionId, u64)> {
        let mut totals: Vec<(InstructionId, u64)> = InstructionId::ALL
            .iter()
            .map(|&id| {
                let total: u64 = self.per_core.iter().map(|c| c.get(id)).sum();
                (id, total)
            })
            .filter(|(_, total)| *total > 0)
            .collect();
        totals.sort_by(|a, b| b.1.cmp(&a.1));
        totals.truncate(n);
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_reads_back() {
        let counters = CoreCounters::new();
        counters.record(InstructionId::Add);
        counters.record(InstructionId::Add);
        counters.record(InstructionId::Or);
        assert_eq!(counters.get(InstructionId::Add), 2);
        assert_eq!(counters.get(InstructionId::Or), 1);
        assert_eq!(counters.get(InstructionId::Subf), 0);
    }

    #[test]
    fn total_sums_all_instructions() {
        let counters = CoreCounters::new();
        counters.record(InstructionId::Add);
        counters.record(InstructionId::Or);
        counters.record(InstructionId::Or);
        assert_eq!(counters.total(), 3);
    }

    #[test]
    fn hottest_is_sorted_descending() {
        let perf = PerfCounters::new();
        perf.core(0).record(InstructionId::Add);
        perf.core(1).record(InstructionId::Add);
        perf.core(0).record(InstructionId::Or);
        let top = perf.hottest(2);
        assert_eq!(top[0], (InstructionId::Add, 2));
        assert_eq!(top[1], (InstructionId::Or, 1));
    }

    #[test]
    fn reset_clears_counters() {
        let counters = CoreCounters::new();
        counters.record(InstructionId::Add);
        counters.reset();
        assert_eq!(counters.total(), 0);
    }
}
