//! Top-level engine: owns the three-core array, the shared guest memory,
//! the breakpoint registry, the kernel-call trampoline table and the JIT
//! cache, and drives the per-core threads plus the timer thread.
//!
//! Mirrors `original_source/src/cpu/cpu.cpp`'s `start`/`halt`/
//! `coreEntryPoint`/`timerEntryPoint` shape: three threads named
//! `"Core #0"`.."Core #2"` plus a `"Timer Thread"`, torn down by raising a
//! nonmaskable `SRESET` on every core and joining.

use esp_cpu::Core;
use esp_debug::BreakpointRegistry;
use esp_decoder::InstructionId;
use esp_interrupts::{InterruptBus, Interrupts};
use esp_jit::JitCache;
use esp_kernelcall::{KernelCallError, KernelCallFn, KernelCallTable};
use esp_mem::GuestMemory;
use esp_perf::PerfCounters;
use esp_time::HostClock;
use esp_timers::TimerCore;
use esp_types::{GuestAddr, CALLBACK_ADDR, NUM_CORES};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

/// Instructions run per acquisition of a core's lock before re-checking
/// interrupts, when the JIT can't service the current block.
const INTERPRETER_BURST: u64 = 4096;

/// How long a core parks once paused on `DBGBREAK` before re-polling for a
/// resume or a shutdown request.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("memory size must be non-zero")]
    InvalidMemorySize,
    #[error("core id {0} is out of range (engine runs {NUM_CORES} cores)")]
    InvalidCoreId(usize),
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("engine is not running")]
    NotRunning,
    #[error(transparent)]
    KernelCall(#[from] KernelCallError),
    #[error(transparent)]
    Breakpoint(#[from] esp_debug::BreakpointError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitMode {
    Disabled,
    Enabled,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mem_size: usize,
    pub jit_mode: JitMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            mem_size: 0x2000_0000,
            jit_mode: JitMode::Disabled,
        }
    }
}

/// Cheaply-cloned [`GuestMemory`] handle shared by every core and by the
/// shader-binary reader; each clone is a fresh handle onto the same
/// `Mutex`-guarded backing store.
#[derive(Clone)]
pub struct SharedMemory(Arc<Mutex<esp_mem::VecGuestMemory>>);

impl SharedMemory {
    pub fn new(size: usize) -> Self {
        SharedMemory(Arc::new(Mutex::new(esp_mem::VecGuestMemory::new(size))))
    }
}

impl GuestMemory for SharedMemory {
    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn read_bytes(&self, addr: GuestAddr, dst: &mut [u8]) {
        self.0.lock().unwrap().read_bytes(addr, dst);
    }

    fn write_bytes(&mut self, addr: GuestAddr, src: &[u8]) {
        self.0.lock().unwrap().write_bytes(addr, src);
    }
}

struct CoreWorker {
    index: usize,
    core: Arc<Mutex<Core<SharedMemory>>>,
    interrupts: Arc<InterruptBus>,
    siblings: Vec<Arc<InterruptBus>>,
    breakpoints: Arc<BreakpointRegistry>,
    kernel_calls: Arc<Mutex<KernelCallTable>>,
    perf: Arc<PerfCounters>,
    jit_cache: Arc<Mutex<JitCache>>,
    jit_mode: JitMode,
    wasm_engine: wasmtime::Engine,
    shutting_down: Arc<AtomicBool>,
}

impl CoreWorker {
    fn run(self) {
        loop {
            if self.shutting_down.load(Ordering::Acquire) {
                return;
            }
            let pc = self.core.lock().unwrap().state.pc;
            let served = self.interrupts.check_interrupts(&self.breakpoints, pc, &self.siblings);
            if served.contains(Interrupts::SRESET) {
                return;
            }
            if served.contains(Interrupts::DBGBREAK) {
                self.interrupts.wait_for_interrupt(PAUSE_POLL_INTERVAL);
                continue;
            }

            let mut guard = self.core.lock().unwrap();
            let counters = self.perf.core(self.index);

            if self.jit_mode == JitMode::Enabled {
                let mem = guard.mem.clone();
                let block = self.jit_cache.lock().unwrap().get_or_compile(&mem, guard.state.pc);
                if let Some(block) = block {
                    if let Err(err) = esp_jit::run_block(&self.wasm_engine, &mut guard, &block, None) {
                        tracing::error!(core = self.index, %err, "jit block trapped, core halting");
                        return;
                    }
                    continue;
                }
            }

            match guard.run_until(CALLBACK_ADDR, INTERPRETER_BURST, Some(counters)) {
                Ok(esp_cpu::StepOutcome::KernelCall(id)) => {
                    let table = self.kernel_calls.lock().unwrap();
                    if let Err(err) = table.invoke(id, &mut guard.state) {
                        tracing::error!(core = self.index, %err, "unregistered kernel call");
                    }
                    guard.state.pending_kernel_call = None;
                }
                Ok(esp_cpu::StepOutcome::HitAddress(_)) | Ok(esp_cpu::StepOutcome::Continue) => {}
                Err(err) => {
                    tracing::error!(core = self.index, %err, "interpreter trapped, core halting");
                    return;
                }
            }
        }
    }
}

/// Owns the three-core Espresso array, its shared memory and JIT cache,
/// and the `esp-timers` thread feeding per-core alarm interrupts.
pub struct Engine {
    mem: SharedMemory,
    cores: Vec<Arc<Mutex<Core<SharedMemory>>>>,
    interrupts: Vec<Arc<InterruptBus>>,
    breakpoints: Arc<BreakpointRegistry>,
    kernel_calls: Arc<Mutex<KernelCallTable>>,
    jit_cache: Arc<Mutex<JitCache>>,
    jit_mode: JitMode,
    perf: Arc<PerfCounters>,
    wasm_engine: wasmtime::Engine,
    timers: Option<TimerCore>,
    timer_handle: Option<JoinHandle<()>>,
    core_handles: Vec<JoinHandle<()>>,
    shutting_down: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        if config.mem_size == 0 {
            return Err(EngineError::InvalidMemorySize);
        }
        let mem = SharedMemory::new(config.mem_size);
        let cores = (0..NUM_CORES)
            .map(|_| Arc::new(Mutex::new(Core::new(mem.clone()))))
            .collect();
        let interrupts = (0..NUM_CORES).map(|_| Arc::new(InterruptBus::new())).collect();

        Ok(Engine {
            mem,
            cores,
            interrupts,
            breakpoints: Arc::new(BreakpointRegistry::new()),
            kernel_calls: Arc::new(Mutex::new(KernelCallTable::new())),
            jit_cache: Arc::new(Mutex::new(JitCache::new())),
            jit_mode: config.jit_mode,
            perf: Arc::new(PerfCounters::new()),
            wasm_engine: wasmtime::Engine::default(),
            timers: None,
            timer_handle: None,
            core_handles: Vec::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn set_jit_mode(&mut self, mode: JitMode) {
        self.jit_mode = mode;
    }

    /// Returns a cheaply-cloned handle onto the shared guest memory. Owned
    /// rather than borrowed so callers can invoke `GuestMemory`'s `&mut
    /// self` accessors (the handle's interior `Mutex` is what actually
    /// guards the backing store).
    pub fn mem(&self) -> SharedMemory {
        self.mem.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.core_handles.is_empty()
    }

    /// Spawns `"Core #0"`..`"Core #2"` plus `"Timer Thread"`.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        self.shutting_down.store(false, Ordering::Release);

        const CORE_NAMES: [&str; NUM_CORES] = ["Core #0", "Core #1", "Core #2"];
        for i in 0..NUM_CORES {
            let siblings = self
                .interrupts
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, bus)| Arc::clone(bus))
                .collect();
            let worker = CoreWorker {
                index: i,
                core: Arc::clone(&self.cores[i]),
                interrupts: Arc::clone(&self.interrupts[i]),
                siblings,
                breakpoints: Arc::clone(&self.breakpoints),
                kernel_calls: Arc::clone(&self.kernel_calls),
                perf: Arc::clone(&self.perf),
                jit_cache: Arc::clone(&self.jit_cache),
                jit_mode: self.jit_mode,
                wasm_engine: self.wasm_engine.clone(),
                shutting_down: Arc::clone(&self.shutting_down),
            };
            let handle = std::thread::Builder::new()
                .name(CORE_NAMES[i].to_string())
                .spawn(move || worker.run())
                .expect("failed to spawn core thread");
            self.core_handles.push(handle);
        }

        let interrupts_for_timer = self.interrupts.clone();
        let (timers, timer_handle) = TimerCore::spawn(HostClock, move |core_id| {
            interrupts_for_timer[core_id].raise(Interrupts::ALARM);
        });
        self.timers = Some(timers);
        self.timer_handle = Some(timer_handle);
        Ok(())
    }

    /// Raises nonmaskable `SRESET` on every core and joins every thread.
    pub fn halt(&mut self) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        self.shutting_down.store(true, Ordering::Release);
        for bus in &self.interrupts {
            bus.raise(Interrupts::SRESET);
        }
        for handle in self.core_handles.drain(..) {
            handle.join().expect("core thread panicked");
        }
        if let Some(timers) = self.timers.take() {
            timers.shutdown();
        }
        if let Some(handle) = self.timer_handle.take() {
            handle.join().expect("timer thread panicked");
        }
        Ok(())
    }

    fn core(&self, core_id: usize) -> Result<&Arc<Mutex<Core<SharedMemory>>>, EngineError> {
        self.cores.get(core_id).ok_or(EngineError::InvalidCoreId(core_id))
    }

    pub fn pc(&self, core_id: usize) -> Result<GuestAddr, EngineError> {
        Ok(self.core(core_id)?.lock().unwrap().state.pc)
    }

    pub fn set_pc(&self, core_id: usize, addr: GuestAddr) -> Result<(), EngineError> {
        self.core(core_id)?.lock().unwrap().state.pc = addr;
        Ok(())
    }

    pub fn gpr(&self, core_id: usize, reg: usize) -> Result<u32, EngineError> {
        Ok(self.core(core_id)?.lock().unwrap().state.gpr[reg])
    }

    pub fn set_gpr(&self, core_id: usize, reg: usize, value: u32) -> Result<(), EngineError> {
        self.core(core_id)?.lock().unwrap().state.gpr[reg] = value;
        Ok(())
    }

    pub fn set_breakpoint(&self, addr: GuestAddr, one_shot: bool) -> Result<bool, EngineError> {
        let flags = if one_shot {
            esp_debug::BreakpointFlags::SYSTEM_BPFLAG
        } else {
            esp_debug::BreakpointFlags::USER_BPFLAG
        };
        Ok(self.breakpoints.add_breakpoint(addr, flags)?)
    }

    pub fn clear_breakpoint(&self, addr: GuestAddr) -> bool {
        self.breakpoints
            .remove_breakpoint(addr, esp_debug::BreakpointFlags::all())
    }

    /// Registers a host function invoked by guest `sc` trampolines, returning
    /// the stable id the guest stub should encode.
    pub fn register_kernel_call(&self, func: KernelCallFn, userdata: *mut std::ffi::c_void) -> u32 {
        self.kernel_calls.lock().unwrap().register(func, userdata)
    }

    pub fn hottest_instructions(&self, n: usize) -> Vec<(InstructionId, u64)> {
        self.perf.hottest(n)
    }

    /// Single-steps `core_id` by one instruction, bypassing the JIT and the
    /// spawned-thread machinery entirely; used by debugger front-ends and by
    /// tests that don't want to spin up the full engine.
    pub fn single_step(&self, core_id: usize) -> Result<(), esp_cpu::ExecError> {
        let core = self.core(core_id).expect("valid core id");
        let mut guard = core.lock().unwrap();
        guard.step_one(Some(self.perf.core(core_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addi_word(rt: u32, ra: u32, simm: u16) -> u32 {
        (14 << 26) | (rt << 21) | (ra << 16) | simm as u32
    }

    #[test]
    fn zero_sized_memory_is_rejected() {
        let err = Engine::new(EngineConfig { mem_size: 0, ..Default::default() }).unwrap_err();
        assert!(matches!(err, EngineError::InvalidMemorySize));
    }

    #[test]
    fn single_step_advances_pc_and_updates_gpr() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        engine.mem().write_u32(GuestAddr::new(0), addi_word(3, 0, 7));
        engine.single_step(0).unwrap();
        assert_eq!(engine.gpr(0, 3).unwrap(), 7);
        assert_eq!(engine.pc(0).unwrap(), GuestAddr::new(4));
    }

    #[test]
    fn invalid_core_id_is_reported() {
        let engine = Engine::new(EngineConfig::default()).unwrap();
        assert!(matches!(engine.pc(7), Err(EngineError::InvalidCoreId(7))));
    }

    #[test]
    fn halt_before_start_is_an_error() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        assert!(matches!(engine.halt(), Err(EngineError::NotRunning)));
    }

    #[test]
    fn start_then_halt_joins_all_threads() {
        let mut engine = Engine::new(EngineConfig::default()).unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));
        engine.halt().unwrap();
        assert!(!engine.is_running());
    }

    #[test]
    fn registered_kernel_call_is_invoked_on_sc() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let engine = Engine::new(EngineConfig::default()).unwrap();
        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_clone = Arc::clone(&invoked);
        let id = engine.register_kernel_call(
            Box::new(move |_state, _ud| {
                invoked_clone.store(true, Ordering::SeqCst);
            }),
            std::ptr::null_mut(),
        );

        // `sc` encodes the call id via r0; word is primary opcode 17 (sc).
        let sc_word = 17u32 << 26 | 2;
        engine.mem().write_u32(GuestAddr::new(0), sc_word);
        engine.set_gpr(0, 0, id).unwrap();

        let core = engine.core(0).unwrap();
        let mut guard = core.lock().unwrap();
        guard.step_one(None).unwrap();
        let pending = guard.state.pending_kernel_call.take();
        drop(guard);

        assert_eq!(pending, Some(id));
        engine
            .kernel_calls
            .lock()
            .unwrap()
            .invoke(pending.unwrap(), &mut core.lock().unwrap().state)
            .unwrap();
        assert!(invoked.load(Ordering::SeqCst));
    }
}
