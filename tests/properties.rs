//! Property tests: folded constants must agree with the executing
//! back-end, and allocation must keep overlapping values apart.

use quickcheck::TestResult;
use quickcheck_macros::quickcheck;

use drift_jit::bytecode;
use drift_jit::ir::optimize::{ConstantPropagation, Pass};
use drift_jit::ir::{Assembler, Opcode, Operand};
use drift_jit::jit::allocator::{LinearAllocator, RegisterSet};
use drift_jit::jit::rtl::{HwRegister, RegClass, RegisterAssignment, RtlOp, RtlProgram};
use drift_jit::value::Value;

mod common;
use common::{run_bytecode, DummyGuest};

fn build_binary(selector: u8, a: u32, b: u32) -> (Assembler, bool) {
    let mut asm = Assembler::new();
    let a = Operand::constant(a);
    let b = Operand::constant(b);
    let needs_divisor = matches!(selector % 12, 6 | 7);
    let result = match selector % 12 {
        0 => asm.add(a, b),
        1 => asm.sub(a, b),
        2 => asm.and(a, b),
        3 => asm.or(a, b),
        4 => asm.xor(a, b),
        5 => asm.umul(a, b),
        6 => asm.udiv(a, b),
        7 => asm.div(a, b),
        8 => asm.shiftl(a, b),
        9 => asm.shiftr(a, b),
        10 => asm.rotl(a, b),
        _ => asm.rotr(a, b),
    };
    asm.writegr(Operand::constant(0u16), result);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    (asm, needs_divisor)
}

/// Constant propagation must compute exactly what the bytecode back-end
/// computes for the unfolded program.
#[quickcheck]
fn fold_matches_bytecode(selector: u8, a: u32, b: u32) -> TestResult {
    let (mut asm, needs_divisor) = build_binary(selector, a, b);
    if needs_divisor && b == 0 {
        return TestResult::discard();
    }
    if selector % 12 == 7 && a == u32::MAX / 2 + 1 && b == u32::MAX {
        // i32::MIN / -1 has no representable quotient.
        return TestResult::discard();
    }
    let unit = asm.export_unit();

    // Reference: run the unoptimized program.
    let routine = bytecode::Compiler::new().compile(unit.copy()).unwrap();
    let mut guest = DummyGuest::new();
    run_bytecode(routine.as_ref(), &mut guest);
    let reference = guest.registers[0];

    // Candidate: fold, then inspect the surviving write.
    let folded = ConstantPropagation::new().run(&unit);
    let write = folded
        .instructions()
        .iter()
        .find(|i| i.opcode() == Opcode::WriteGuest)
        .unwrap();
    if !write.source(1).is_constant() {
        return TestResult::failed();
    }
    TestResult::from_bool(write.source(1).zero_extended() == reference)
}

/// Any two values whose live intervals overlap end up in different
/// hardware registers (or spill slots).
#[quickcheck]
fn overlapping_values_never_share_registers(count: u8) -> TestResult {
    let count = count % 24;
    if count == 0 {
        return TestResult::discard();
    }

    // Every value is defined up front and used at the end, so all live
    // ranges overlap pairwise.
    let mut program = RtlProgram::new();
    let block = program.allocate_block("prop");
    let values: Vec<_> = (0..count)
        .map(|_| program.ssa_allocate(RegClass::GENERAL))
        .collect();
    for (i, value) in values.iter().enumerate() {
        program.block_mut(block).append_with_data(
            RtlOp::Constant32,
            Value::from_u32(i as u32),
            &[RegisterAssignment::any(*value)],
            &[],
        );
    }
    for (i, value) in values.iter().enumerate() {
        program.block_mut(block).append_with_data(
            RtlOp::WriteRegister32,
            Value::from_u16(i as u16),
            &[],
            &[RegisterAssignment::any(*value)],
        );
    }

    let mut allocator = LinearAllocator::new();
    allocator.define_register_type(RegisterSet::from_count(RegClass::GENERAL, 13));
    let program = allocator.execute(program).unwrap();

    let mut seen_registers = std::collections::HashSet::new();
    let mut seen_slots = std::collections::HashSet::new();
    for instruction in program.block(0) {
        if instruction.op != RtlOp::Constant32 {
            continue;
        }
        match instruction.result(0).hw {
            HwRegister::Register(index) => {
                if !seen_registers.insert(index) {
                    return TestResult::failed();
                }
            }
            HwRegister::Spill(slot) => {
                if !seen_slots.insert(slot) {
                    return TestResult::failed();
                }
            }
            HwRegister::Unassigned => return TestResult::failed(),
        }
    }
    TestResult::passed()
}
