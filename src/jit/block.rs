//! Translated basic blocks and their execution state machine.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::guest::{Guest, GuestHandle};
use crate::ir::{optimize, ExecutionUnit};
use crate::jit::cache::CacheConfig;
use crate::jit::fault;
use crate::jit::routine::Routine;

/// Why block discovery stopped extending a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The instruction cap was reached.
    SizeLimit,
    /// An invalid opcode follows the block (exclusive stop).
    InvalidOpcode,
    /// An unconditional branch ends the block (inclusive stop).
    Branch,
    /// A barrier instruction (bank swap, FPU mode change) ends the block so
    /// later blocks observe the new state (inclusive stop).
    Barrier,
    /// Decoding ran into the start of an already-cached unit.
    StartOfBlock,
}

/// Dispatch ceiling for block execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Always interpret.
    Interpreter,
    /// Use the bytecode routine when compiled.
    Bytecode,
    /// Use native code when available, bytecode otherwise.
    Native,
}

/// Guest-side view of one block: how to translate it to IR and how to
/// interpret it directly. Implemented by each front-end.
pub trait BlockSource: Send + Sync {
    /// Translate the block's guest instructions to IR, specialized for the
    /// given guard-flag values.
    fn assemble(&self, compiled_flags: u32) -> ExecutionUnit;

    /// Interpret the block directly against the guest, returning the exit
    /// code / consumed cycles.
    fn interpret(&self, guest: &mut dyn Guest) -> u64;

    /// Current values of the guest state bits this front-end guards on.
    fn cpu_flags(&self, guest: &mut dyn Guest) -> u32;
}

/// Back-end bundle used when a block (re)compiles.
pub trait BlockCompiler: Send + Sync {
    /// Compile an optimized unit into routines. Back-end failures are
    /// reported by leaving the corresponding routine `None`; the block
    /// keeps running on what remains.
    fn compile(&self, unit: &ExecutionUnit, disable_fastmem: bool) -> CompiledRoutines;
}

/// Routines produced by one compilation.
#[derive(Default)]
pub struct CompiledRoutines {
    /// Portable bytecode routine.
    pub bytecode: Option<Arc<dyn Routine>>,
    /// Native routine for the host ISA.
    pub native: Option<Arc<dyn Routine>>,
}

/// Per-block statistics. Written from the execution thread; read
/// best-effort anywhere else.
#[derive(Debug, Default)]
pub struct BlockStats {
    /// Total calls to `execute`.
    pub count_executed: AtomicU64,
    /// Calls served by the interpreter.
    pub count_interpreted: AtomicU64,
    /// Calls served by a compiled routine.
    pub count_compiled: AtomicU64,
    /// Guard-flag mismatches observed.
    pub guard_failed: AtomicU64,
    /// Most recent guest flag values.
    pub last_flags: AtomicU32,
    /// How long `last_flags` has been stable, in calls.
    pub last_flags_count: AtomicU64,
    /// Deferred `prepare(false)` attempts for the native routine.
    pub count_not_remapped: AtomicU32,
}

struct Compiled {
    unit: Option<ExecutionUnit>,
    bytecode: Option<Arc<dyn Routine>>,
    native: Option<Arc<dyn Routine>>,
    compiled_flags: u32,
    compiled: bool,
}

/// A translated unit of guest code inside the JIT cache.
///
/// Blocks are created unfilled on a cache miss, queued for compilation once
/// warm, executed through the state machine in [`execute`](Self::execute),
/// invalidated by cache sweeps, and dropped when the cache evicts them and
/// no execution holds a reference.
pub struct BasicBlock {
    start_address: u32,
    physical_address: u32,
    size: u32,
    instruction_count: u32,
    stop_reason: StopReason,
    guard_flags: u32,
    flags: AtomicU32,
    target_flags: AtomicU32,
    compiled: Mutex<Compiled>,
    stats: BlockStats,
    source: Box<dyn BlockSource>,
}

impl BasicBlock {
    /// Block needs recompilation before its routines may run again.
    pub const DIRTY: u32 = 1 << 0;
    /// Compile memory accesses through the slow path; set by the fastmem
    /// fault handler.
    pub const DISABLE_FASTMEM: u32 = 1 << 1;
    /// Block is sitting in the cache's compile queue.
    pub const QUEUED: u32 = 1 << 2;

    /// Create an unfilled block covering `size` guest bytes at
    /// `start_address`.
    pub fn new(
        start_address: u32,
        physical_address: u32,
        size: u32,
        instruction_count: u32,
        guard_flags: u32,
        jit_flags: u32,
        stop_reason: StopReason,
        source: Box<dyn BlockSource>,
    ) -> Self {
        Self {
            start_address,
            physical_address,
            size,
            instruction_count,
            stop_reason,
            guard_flags,
            flags: AtomicU32::new(jit_flags),
            target_flags: AtomicU32::new(0),
            compiled: Mutex::new(Compiled {
                unit: None,
                bytecode: None,
                native: None,
                compiled_flags: 0,
                compiled: false,
            }),
            stats: BlockStats::default(),
            source,
        }
    }

    /// Guest virtual address of the first instruction.
    pub const fn start_address(&self) -> u32 {
        self.start_address
    }

    /// Guest physical address of the first instruction.
    pub const fn physical_address(&self) -> u32 {
        self.physical_address
    }

    /// Guest bytes covered by the block.
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Number of translated guest instructions.
    pub const fn instruction_count(&self) -> u32 {
        self.instruction_count
    }

    /// Why discovery stopped the block.
    pub const fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    /// The guest state bits this block's compilation depends on.
    pub const fn guard_flags(&self) -> u32 {
        self.guard_flags
    }

    /// Execution statistics.
    pub const fn stats(&self) -> &BlockStats {
        &self.stats
    }

    /// Set a flag bit. Async-signal-safe; the fault handler uses this.
    pub fn add_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::Release);
    }

    /// Whether a flag bit is set.
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    /// Mark the block as needing recompilation.
    pub fn mark_dirty(&self) {
        self.add_flag(Self::DIRTY);
    }

    fn mark_clean(&self) {
        self.flags
            .fetch_and(!(Self::DIRTY | Self::QUEUED), Ordering::Release);
    }

    /// Whether a compilation has completed for this block.
    pub fn is_compiled(&self) -> bool {
        self.compiled.lock().unwrap().compiled
    }

    /// The flag values the current compilation was specialized for.
    pub fn compiled_flags(&self) -> u32 {
        self.compiled.lock().unwrap().compiled_flags
    }

    /// Disassembly of the most recently translated unit, for debugging.
    pub fn disassemble_unit(&self) -> Option<String> {
        let compiled = self.compiled.lock().unwrap();
        compiled.unit.as_ref().map(ExecutionUnit::disassemble)
    }

    /// (Re)compile the block: translate for the captured target flags,
    /// optimize, and hand the unit to the back-ends.
    pub fn compile(&self, compiler: &dyn BlockCompiler) {
        let target_flags = self.target_flags.load(Ordering::Acquire);
        let unit = self.source.assemble(target_flags);
        #[cfg(feature = "debug")]
        unit.verify();

        let optimized = optimize::optimize(&unit);
        let disable_fastmem = self.has_flag(Self::DISABLE_FASTMEM);
        let routines = compiler.compile(&optimized, disable_fastmem);

        tracing::debug!(
            address = self.start_address,
            flags = target_flags,
            fastmem = !disable_fastmem,
            bytecode = routines.bytecode.is_some(),
            native = routines.native.is_some(),
            "block compiled"
        );

        let mut compiled = self.compiled.lock().unwrap();
        compiled.unit = Some(unit);
        compiled.bytecode = routines.bytecode;
        compiled.native = routines.native;
        compiled.compiled_flags = target_flags;
        compiled.compiled = true;
        drop(compiled);

        self.mark_clean();
    }

    /// Run the block once against `guest`, choosing interpreter, bytecode
    /// or native per the block's state and `mode`. `queue_compile` receives
    /// the block when it should be (re)compiled; the cache wires this to
    /// its compile queue.
    pub fn execute(
        self: &Arc<Self>,
        guest: &mut GuestHandle,
        memory_base: *mut u8,
        register_base: *mut u8,
        mode: ExecutionMode,
        config: &CacheConfig,
        queue_compile: &dyn Fn(&Arc<BasicBlock>),
    ) -> u64 {
        let stats = &self.stats;
        stats.count_executed.fetch_add(1, Ordering::Relaxed);

        // Track how stable the guard-relevant guest state is.
        let cpu_flags = self.source.cpu_flags(guest.guest());
        let last = stats.last_flags.swap(cpu_flags, Ordering::Relaxed);
        if (cpu_flags & self.guard_flags) == (last & self.guard_flags) {
            stats.last_flags_count.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.last_flags_count.store(1, Ordering::Relaxed);
        }

        if !self.is_compiled() {
            if stats.count_interpreted.load(Ordering::Relaxed) > config.compile_threshold {
                self.target_flags.store(cpu_flags, Ordering::Release);
                self.queue_once(queue_compile);
            }
            return self.execute_interpreter(guest);
        }

        if self.has_flag(Self::DIRTY) {
            self.target_flags.store(cpu_flags, Ordering::Release);
            self.queue_once(queue_compile);
            return self.execute_interpreter(guest);
        }

        let (bytecode, native, compiled_flags) = {
            let compiled = self.compiled.lock().unwrap();
            (
                compiled.bytecode.clone(),
                compiled.native.clone(),
                compiled.compiled_flags,
            )
        };

        if (compiled_flags & self.guard_flags) != (cpu_flags & self.guard_flags) {
            stats.guard_failed.fetch_add(1, Ordering::Relaxed);

            // Only recompile once the new flag values look durable.
            if stats.last_flags_count.load(Ordering::Relaxed) > config.guard_durable_threshold {
                tracing::debug!(
                    address = self.start_address,
                    compiled = compiled_flags,
                    current = cpu_flags,
                    "guard flags changed, queueing recompile"
                );
                self.mark_dirty();
                self.target_flags.store(cpu_flags, Ordering::Release);
                self.queue_once(queue_compile);
            }
            return self.execute_interpreter(guest);
        }

        let mut use_native = native.is_some() && mode == ExecutionMode::Native;
        if use_native {
            let native = native.as_ref().unwrap();
            if !native.ready() {
                if stats.count_not_remapped.load(Ordering::Relaxed) > config.prepare_threshold {
                    use_native = native.prepare(true).unwrap_or(false);
                } else {
                    use_native = native.prepare(false).unwrap_or(false);
                    if !use_native {
                        stats.count_not_remapped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        if use_native {
            let native = native.unwrap();
            let _guard = fault::BlockGuard::enter(self, guest);
            let result = native.execute(guest, memory_base, register_base);
            stats.count_compiled.fetch_add(1, Ordering::Relaxed);
            return result;
        }

        if let (Some(bytecode), true) = (bytecode, mode != ExecutionMode::Interpreter) {
            let result = bytecode.execute(guest, memory_base, register_base);
            stats.count_compiled.fetch_add(1, Ordering::Relaxed);
            return result;
        }

        self.execute_interpreter(guest)
    }

    fn queue_once(self: &Arc<Self>, queue_compile: &dyn Fn(&Arc<BasicBlock>)) {
        if self.flags.fetch_or(Self::QUEUED, Ordering::AcqRel) & Self::QUEUED == 0 {
            queue_compile(self);
        }
    }

    fn execute_interpreter(&self, guest: &mut GuestHandle) -> u64 {
        let result = self.source.interpret(guest.guest());
        self.stats.count_interpreted.fetch_add(1, Ordering::Relaxed);
        result
    }
}

impl std::fmt::Debug for BasicBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicBlock")
            .field("start_address", &format_args!("{:#010x}", self.start_address))
            .field("size", &self.size)
            .field("stop_reason", &self.stop_reason)
            .field("guard_flags", &self.guard_flags)
            .finish()
    }
}
