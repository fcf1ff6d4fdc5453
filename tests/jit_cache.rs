//! Block runtime state machine: warm-up, compilation, guard misses and
//! recompilation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use drift_jit::bytecode;
use drift_jit::ir::{Assembler, ExecutionUnit, Operand};
use drift_jit::prelude::*;

mod common;
use common::DummyGuest;

/// Translates to "write 1000+flags to guest register 0"; interpreting
/// writes 999 instead, so tests can see which path ran.
struct MarkerSource;

impl BlockSource for MarkerSource {
    fn assemble(&self, compiled_flags: u32) -> ExecutionUnit {
        let mut asm = Assembler::new();
        asm.writegr(
            Operand::constant(0u16),
            Operand::constant(1000u32 + compiled_flags),
        );
        asm.exit(Operand::constant(true), Operand::constant(0u64));
        asm.export_unit()
    }

    fn interpret(&self, guest: &mut dyn Guest) -> u64 {
        guest.guest_register_write(0, 4, Value::from_u32(999));
        0
    }

    // Guest register 1 doubles as the guarded state bit.
    fn cpu_flags(&self, guest: &mut dyn Guest) -> u32 {
        guest.guest_register_read(1, 4).u32()
    }
}

struct BytecodeCompiler;

impl BlockCompiler for BytecodeCompiler {
    fn compile(&self, unit: &ExecutionUnit, _disable_fastmem: bool) -> CompiledRoutines {
        CompiledRoutines {
            bytecode: bytecode::Compiler::new().compile(unit.copy()).ok(),
            native: None,
        }
    }
}

fn test_config() -> CacheConfig {
    CacheConfig {
        compile_threshold: 2,
        guard_durable_threshold: 3,
        ..CacheConfig::default()
    }
}

fn run(
    block: &Arc<BasicBlock>,
    cache: &Cache,
    guest: &mut DummyGuest,
) -> u64 {
    let mut handle = GuestHandle::new(guest);
    block.execute(
        &mut handle,
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        ExecutionMode::Bytecode,
        cache.config(),
        &|queued| cache.queue_compile_unit(queued),
    )
}

fn new_block() -> Arc<BasicBlock> {
    Arc::new(BasicBlock::new(
        0x8c00_0000,
        0x0c00_0000,
        32,
        16,
        0b1,
        0,
        StopReason::Branch,
        Box::new(MarkerSource),
    ))
}

#[test]
fn blocks_warm_up_through_the_interpreter_then_compile() {
    let cache = Cache::new(test_config(), Arc::new(BytecodeCompiler));
    let block = new_block();
    cache.insert(Arc::clone(&block));
    let mut guest = DummyGuest::new();

    // Cold calls interpret.
    for _ in 0..4 {
        run(&block, &cache, &mut guest);
        cache.drain_compile_queue();
    }
    assert!(block.is_compiled());

    run(&block, &cache, &mut guest);
    assert_eq!(guest.registers[0], 1000, "compiled path did not run");
    assert!(block.stats().count_compiled.load(Ordering::Relaxed) >= 1);
    assert!(block.stats().count_interpreted.load(Ordering::Relaxed) >= 3);
}

#[test]
fn guard_misses_fall_back_and_eventually_respecialize() {
    let cache = Cache::new(test_config(), Arc::new(BytecodeCompiler));
    let block = new_block();
    cache.insert(Arc::clone(&block));
    let mut guest = DummyGuest::new();

    for _ in 0..4 {
        run(&block, &cache, &mut guest);
        cache.drain_compile_queue();
    }
    run(&block, &cache, &mut guest);
    assert_eq!(guest.registers[0], 1000);
    assert_eq!(block.compiled_flags(), 0);

    // Flip the guarded state: every call must now avoid the stale
    // compilation and interpret instead.
    guest.registers[1] = 1;
    let compiled_before = block.stats().count_compiled.load(Ordering::Relaxed);
    for _ in 0..4 {
        run(&block, &cache, &mut guest);
        assert_eq!(guest.registers[0], 999, "stale compilation dispatched");
        cache.drain_compile_queue();
    }
    assert!(block.stats().guard_failed.load(Ordering::Relaxed) >= 1);

    // Once the new flags proved durable the block respecialized for them.
    run(&block, &cache, &mut guest);
    assert_eq!(block.compiled_flags(), 1);
    assert_eq!(guest.registers[0], 1001);
    assert!(block.stats().count_compiled.load(Ordering::Relaxed) > compiled_before);
}

#[test]
fn interpreter_mode_never_dispatches_routines() {
    let cache = Cache::new(test_config(), Arc::new(BytecodeCompiler));
    let block = new_block();
    cache.insert(Arc::clone(&block));
    let mut guest = DummyGuest::new();

    for _ in 0..10 {
        let mut handle = GuestHandle::new(&mut guest);
        block.execute(
            &mut handle,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            ExecutionMode::Interpreter,
            cache.config(),
            &|queued| cache.queue_compile_unit(queued),
        );
        cache.drain_compile_queue();
    }

    assert_eq!(block.stats().count_compiled.load(Ordering::Relaxed), 0);
    assert_eq!(guest.registers[0], 999);
}

#[test]
fn invalidate_all_marks_blocks_dirty_and_recompiles() {
    let cache = Cache::new(test_config(), Arc::new(BytecodeCompiler));
    let block = new_block();
    cache.insert(Arc::clone(&block));
    let mut guest = DummyGuest::new();

    for _ in 0..4 {
        run(&block, &cache, &mut guest);
        cache.drain_compile_queue();
    }
    assert!(block.is_compiled());

    cache.invalidate_all();
    assert!(cache.is_empty());

    // The held reference keeps working; the dirty flag routes the next
    // call through the interpreter and queues a recompile.
    run(&block, &cache, &mut guest);
    assert_eq!(guest.registers[0], 999);
}
