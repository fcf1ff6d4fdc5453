//! IR construction invariants: single definitions, def-before-use, typing.

use drift_jit::ir::{self, Assembler, Operand, Type};

/// Every register with a definition is defined exactly once, and every use
/// follows its definition.
#[test]
fn units_are_ssa() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let b = asm.readgr(Type::Integer32, Operand::constant(1u16));
    let sum = asm.add(a, b);
    let twice = asm.add(sum, sum);
    asm.writegr(Operand::constant(2u16), twice);
    asm.exit(Operand::constant(true), Operand::constant(0u64));

    let unit = asm.export_unit();
    unit.verify();

    let mut definitions = std::collections::HashMap::new();
    for (position, instruction) in unit.instructions().iter().enumerate() {
        for source in instruction.sources() {
            if source.is_register() {
                let defined_at = definitions
                    .get(&source.register_index())
                    .expect("use before definition");
                assert!(*defined_at < position);
            }
        }
        if instruction.result_count() == 1 {
            let id = instruction.result(0).register_index();
            assert!(definitions.insert(id, position).is_none());
        }
    }
}

#[test]
fn arithmetic_preserves_operand_type_and_compares_produce_bool() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer16, Operand::constant(0u16));
    let b = asm.readgr(Type::Integer16, Operand::constant(1u16));

    assert_eq!(asm.add(a, b).ty(), Type::Integer16);
    assert_eq!(asm.umul(a, b).ty(), Type::Integer16);
    assert_eq!(asm.cmp_lt(a, b).ty(), Type::Bool);
    assert_eq!(asm.extend32(a).ty(), Type::Integer32);
    let wide = asm.extend64(a);
    assert_eq!(wide.ty(), Type::Integer64);
    assert_eq!(asm.casti2f(Type::Float64, wide).ty(), Type::Float64);
}

#[test]
fn copies_are_deep_and_preserve_register_counters() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
    asm.writegr(Operand::constant(1u16), a);
    let unit = asm.export_unit();

    let copy = unit.copy();
    assert_eq!(copy.register_count(), unit.register_count());
    assert_eq!(copy.instructions().len(), unit.instructions().len());
    assert_eq!(copy.disassemble(), unit.disassemble());
}

#[test]
fn disassembly_is_stable() {
    let mut asm = Assembler::new();
    let value = asm.readgr(Type::Integer32, Operand::constant(3u16));
    let shifted = asm.shiftl(value, Operand::constant(4u8));
    asm.writegr(Operand::constant(3u16), shifted);

    let text = asm.export_unit().disassemble();
    assert!(text.contains("readgr.i32"));
    assert!(text.contains("shiftl.i32"));
    assert!(text.contains("writegr.i32"));
}

#[test]
fn instruction_byte_accounting_matches_operand_counts() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
    asm.writegr(Operand::constant(0u16), a);
    let unit = asm.export_unit();

    let sizes: Vec<usize> = unit.instructions().iter().map(|i| i.bytes()).collect();
    // readgr: 1 result + 1 source; writegr: 2 sources.
    assert_eq!(sizes, vec![8 + 32, 8 + 32]);
    assert_eq!(unit.instructions().bytes(), 80);
    assert!(ir::SOURCE_LIMIT <= ir::OPERAND_LIMIT);
}
