//! Optimization pass behavior over whole units.

use drift_jit::ir::optimize::{ConstantPropagation, DeadCodeElimination, Pass};
use drift_jit::ir::{Assembler, Opcode, Operand, Type};

/// Constant chains collapse into the consuming side effect: after
/// propagation the unit holds exactly the `WriteGuest` of the folded value
/// and the `Exit`.
#[test]
fn constant_chain_folds_to_single_write() {
    let mut asm = Assembler::new();
    let zero = Operand::constant(0u32);
    let one = Operand::constant(1u32);
    let sum = asm.add(zero, one);
    let inverted = asm.not(sum);
    let rotated = asm.rotr(inverted, one);
    asm.writegr(Operand::constant(0u16), rotated);
    asm.exit(Operand::constant(true), Operand::constant(0u64));

    let unit = ConstantPropagation::new().run(&asm.export_unit());

    let opcodes: Vec<Opcode> = unit.instructions().iter().map(|i| i.opcode()).collect();
    assert_eq!(opcodes, vec![Opcode::WriteGuest, Opcode::Exit]);

    let write = unit.instructions().iter().next().unwrap();
    assert!(write.source(1).is_constant());
    // rotr(!(0 + 1), 1) over u32.
    assert_eq!(write.source(1).zero_extended(), 0x7fff_ffff);
}

/// Folding happens through non-constant contexts when identities apply.
#[test]
fn and_with_zero_is_constant_even_with_unknown_input() {
    let mut asm = Assembler::new();
    let variable = asm.readgr(Type::Integer32, Operand::constant(1u16));
    let masked = asm.and(variable, Operand::constant(0u32));
    asm.writegr(Operand::constant(0u16), masked);

    let unit = ConstantPropagation::new().run(&asm.export_unit());
    let write = unit
        .instructions()
        .iter()
        .find(|i| i.opcode() == Opcode::WriteGuest)
        .unwrap();
    assert!(write.source(1).is_constant());
    assert_eq!(write.source(1).zero_extended(), 0);
}

/// A result that never reaches a side effect disappears along with its
/// whole chain.
#[test]
fn dangling_chains_are_dead() {
    let mut asm = Assembler::new();
    let loaded = asm.load(Type::Integer32, Operand::constant(0u32));
    asm.not(loaded);

    let unit = DeadCodeElimination::new().run(&asm.export_unit());
    assert!(unit.instructions().is_empty());
}

/// The same chain survives untouched once a store consumes it.
#[test]
fn consumed_chains_survive() {
    let mut asm = Assembler::new();
    let address = Operand::constant(0u32);
    let loaded = asm.load(Type::Integer32, address);
    let inverted = asm.not(loaded);
    asm.store(address, inverted);

    let unit = DeadCodeElimination::new().run(&asm.export_unit());
    let opcodes: Vec<Opcode> = unit.instructions().iter().map(|i| i.opcode()).collect();
    assert_eq!(opcodes, vec![Opcode::Load, Opcode::Not, Opcode::Store]);
}

fn side_effects(unit: &drift_jit::ir::ExecutionUnit) -> Vec<(Opcode, Vec<u64>)> {
    unit.instructions()
        .iter()
        .filter(|i| {
            matches!(
                i.opcode(),
                Opcode::WriteGuest | Opcode::Store | Opcode::Call | Opcode::Exit
            )
        })
        .map(|i| {
            let constants = i
                .sources()
                .iter()
                .filter(|s| s.is_constant() && s.is_numeric())
                .map(|s| s.zero_extended())
                .collect();
            (i.opcode(), constants)
        })
        .collect()
}

/// Neither pass may reorder or drop side-effecting instructions.
#[test]
fn passes_preserve_side_effect_order() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let b = asm.add(a, Operand::constant(1u32));
    asm.writegr(Operand::constant(1u16), b);
    asm.store(Operand::constant(0x40u32), a);
    let dead = asm.umul(b, b);
    let _ = asm.not(dead);
    asm.writegr(Operand::constant(2u16), b);
    asm.exit(Operand::constant(true), Operand::constant(3u64));

    let source = asm.export_unit();
    let reference = side_effects(&source);

    let propagated = ConstantPropagation::new().run(&source);
    let eliminated = DeadCodeElimination::new().run(&propagated);

    assert_eq!(side_effects(&propagated), reference);
    assert_eq!(side_effects(&eliminated), reference);
    // And the dead multiply chain really is gone.
    assert!(eliminated
        .instructions()
        .iter()
        .all(|i| i.opcode() != Opcode::MultiplyUnsigned));
}
