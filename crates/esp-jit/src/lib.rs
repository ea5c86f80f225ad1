//! Tier-1 JIT: translate a guest basic block into a tiny WebAssembly module
//! and run it with `wasmtime` instead of dispatching through the
//! interpreter one decode-and-match per instruction.
//!
//! The compiled module does not reimplement PowerPC semantics in WASM — it
//! emits one `call` per instruction into a single imported host function
//! that steps the interpreter forward. What's gained by compiling at all is
//! that block discovery, decoding and instruction-count bookkeeping happen
//! once at compile time instead of on every execution, and `wasmtime`'s
//! Cranelift backend turns the flat call sequence into straight-line native
//! code instead of the host paying a `match` dispatch per instruction.
//!
//! A block that fails to compile (decode error, runs past
//! [`JIT_MAX_INSTRUCTIONS`] without hitting a control-flow instruction) is
//! cached as [`CacheEntry::Failed`] so the engine stops retrying it and
//! falls back to the interpreter for that entry point permanently.

use esp_cpu::{Core, ExecError};
use esp_decoder::{decode, Instruction, InstructionId};
use esp_mem::GuestMemory;
use esp_perf::CoreCounters;
use esp_types::GuestAddr;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use wasm_encoder::{
    CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection, ImportSection,
    Instruction as WasmInst, Module as WasmModule, TypeSection, ValType,
};
use wasmtime::{Caller, Engine, Instance, Linker, Module, Store, TypedFunc};

/// Tier-1 blocks longer than this are rejected rather than compiled; such
/// blocks almost always indicate a decode desync and are better served by
/// the interpreter anyway.
pub const JIT_MAX_INSTRUCTIONS: usize = 512;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("block at {0} exceeds JIT_MAX_INSTRUCTIONS without a control-flow instruction")]
    TooLong(GuestAddr),
    #[error("decode error while discovering block at {0}: {1}")]
    Decode(GuestAddr, esp_decoder::DecodeError),
    #[error("wasm module build failed: {0}")]
    Wasm(String),
    #[error("cached entry at {0} previously failed to compile")]
    PermanentlyFailed(GuestAddr),
    #[error("interpreter trapped while running a compiled block: {0}")]
    Exec(#[from] ExecError),
}

fn is_block_terminator(id: InstructionId) -> bool {
    matches!(
        id,
        InstructionId::B
            | InstructionId::Bc
            | InstructionId::Bclr
            | InstructionId::Bcctr
            | InstructionId::Sc
            | InstructionId::Rfi
    )
}

/// A successfully compiled basic block: its guest instructions (kept so the
/// engine can still read/disassemble it) and the `wasmtime` module that
/// replays them.
pub struct JitBlock {
    pub entry: GuestAddr,
    pub instructions: Vec<Instruction>,
    module: Module,
}

impl JitBlock {
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

enum CacheEntry {
    Compiled(Arc<JitBlock>),
    Failed,
}

/// Discovers a basic block starting at `entry`: decodes forward until a
/// control-flow instruction (inclusive) or [`JIT_MAX_INSTRUCTIONS`] is hit.
fn discover_block(
    mem: &impl GuestMemory,
    entry: GuestAddr,
) -> Result<Vec<Instruction>, JitError> {
    let mut instructions = Vec::new();
    let mut pc = entry;
    for _ in 0..JIT_MAX_INSTRUCTIONS {
        let word = mem.read_u32(pc);
        let inst = decode(word).map_err(|e| JitError::Decode(pc, e))?;
        let terminator = is_block_terminator(inst.id);
        instructions.push(inst);
        if terminator {
            return Ok(instructions);
        }
        pc = pc.offset(4);
    }
    Err(JitError::TooLong(entry))
}

/// Builds a WASM module with a single exported `run` function that calls
/// the imported `env.exec_one` function once per guest instruction in the
/// block, in order.
fn build_module_bytes(instruction_count: usize) -> Vec<u8> {
    let mut module = WasmModule::new();

    let mut types = TypeSection::new();
    types.ty().function(Vec::<ValType>::new(), Vec::<ValType>::new());
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import("env", "exec_one", EntityType::Function(0));
    module.section(&imports);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("run", ExportKind::Func, 1);
    module.section(&exports);

    let mut code = CodeSection::new();
    let mut body = Function::new(Vec::<(u32, ValType)>::new());
    for _ in 0..instruction_count {
        body.instruction(&WasmInst::Call(0));
    }
    body.instruction(&WasmInst::End);
    code.function(&body);
    module.section(&code);

    module.finish()
}

/// Caches compiled blocks keyed by entry address.
pub struct JitCache {
    engine: Engine,
    blocks: HashMap<GuestAddr, CacheEntry>,
}

impl Default for JitCache {
    fn default() -> Self {
        Self::new()
    }
}

impl JitCache {
    pub fn new() -> Self {
        JitCache {
            engine: Engine::default(),
            blocks: HashMap::new(),
        }
    }

    /// Returns the compiled block at `entry`, compiling and caching it if
    /// this is the first lookup. Returns `None` if the block previously
    /// failed to compile or fails now; the caller should fall back to the
    /// interpreter in either case.
    pub fn get_or_compile(
        &mut self,
        mem: &impl GuestMemory,
        entry: GuestAddr,
    ) -> Option<Arc<JitBlock>> {
        if let Some(cached) = self.blocks.get(&entry) {
            return match cached {
                CacheEntry::Compiled(block) => Some(Arc::clone(block)),
                CacheEntry::Failed => None,
            };
        }
        match self.compile(mem, entry) {
            Ok(block) => {
                let block = Arc::new(block);
                self.blocks
                    .insert(entry, CacheEntry::Compiled(Arc::clone(&block)));
                Some(block)
            }
            Err(err) => {
                tracing::debug!(%entry, %err, "jit compile failed, caching as permanently failed");
                self.blocks.insert(entry, CacheEntry::Failed);
                None
            }
        }
    }

    fn compile(&self, mem: &impl GuestMemory, entry: GuestAddr) -> Result<JitBlock, JitError> {
        let instructions = discover_block(mem, entry)?;
        let bytes = build_module_bytes(instructions.len());
        let module = Module::new(&self.engine, &bytes).map_err(|e| JitError::Wasm(e.to_string()))?;
        Ok(JitBlock {
            entry,
            instructions,
            module,
        })
    }

    /// Invalidates a cached block, e.g. after the engine observes the guest
    /// wrote over its code region. A later `get_or_compile` call for the
    /// same entry recompiles from scratch.
    pub fn invalidate(&mut self, entry: GuestAddr) {
        self.blocks.remove(&entry);
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Holds a raw pointer to the running core across the FFI boundary into the
/// host import; the engine guarantees the core outlives the call.
struct CorePtr<M>(*mut Core<M>);

unsafe impl<M> Send for CorePtr<M> {}

/// Runs `block` against `core`, stepping the interpreter once per call the
/// compiled module makes into `env.exec_one`.
pub fn run_block<M: GuestMemory + 'static>(
    engine: &Engine,
    core: &mut Core<M>,
    block: &JitBlock,
    counters: Option<Arc<CoreCounters>>,
) -> Result<(), JitError> {
    struct StoreData<M> {
        core: CorePtr<M>,
        counters: Option<Arc<CoreCounters>>,
        error: Option<ExecError>,
    }

    let mut store = Store::new(
        engine,
        StoreData {
            core: CorePtr(core as *mut Core<M>),
            counters,
            error: None,
        },
    );

    let mut linker: Linker<StoreData<M>> = Linker::new(engine);
    linker
        .func_wrap("env", "exec_one", move |mut caller: Caller<'_, StoreData<M>>| {
            let data = caller.data_mut();
            if data.error.is_some() {
                return;
            }
            // SAFETY: `core` outlives this call; `run_block` holds `&mut
            // Core<M>` for its whole body and the store never escapes it.
            let core = unsafe { &mut *data.core.0 };
            let counters = data.counters.clone();
            if let Err(err) = core.step_one(counters.as_deref()) {
                data.error = Some(err);
            }
        })
        .expect("exec_one import signature is fixed at compile time");

    let instance: Instance = linker
        .instantiate(&mut store, &block.module)
        .map_err(|e| JitError::Wasm(e.to_string()))?;
    let run: TypedFunc<(), ()> = instance
        .get_typed_func(&mut store, "run")
        .map_err(|e| JitError::Wasm(e.to_string()))?;
    run.call(&mut store, ())
        .map_err(|e| JitError::Wasm(e.to_string()))?;

    if let Some(err) = store.into_data().error {
        return Err(JitError::Exec(err));
    }
    Ok(())
}
