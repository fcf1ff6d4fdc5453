//! Native AArch64 round trips; host-gated like the x86-64 suite.

#![cfg(all(target_arch = "aarch64", unix))]

use std::sync::Arc;

use drift_jit::arm64::Compiler;
use drift_jit::ir::{Assembler, Operand, Type};
use drift_jit::prelude::*;

mod common;
use common::DummyGuest;

fn compile(mut asm: Assembler) -> Arc<dyn Routine> {
    let mut compiler = Compiler::new();
    // Guest registers live at [register_base + index * 8].
    compiler.set_register_address_cb(|index| index * 8);
    compiler.set_use_fastmem(false);
    let routine = compiler.compile(asm.export_unit()).unwrap();
    routine.prepare(true).unwrap();
    routine
}

fn run(routine: &dyn Routine, guest: &mut DummyGuest) -> u64 {
    let register_base = guest.registers.as_mut_ptr() as *mut u8;
    let mut handle = GuestHandle::new(guest);
    routine.execute(&mut handle, std::ptr::null_mut(), register_base)
}

#[test]
fn unsigned_multiply_round_trip() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let b = asm.readgr(Type::Integer32, Operand::constant(1u16));
    let product = asm.umul(a, b);
    asm.writegr(Operand::constant(2u16), product);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    guest.registers[0] = 5;
    guest.registers[1] = 7;
    assert_eq!(run(routine.as_ref(), &mut guest), 0);
    assert_eq!(guest.registers[2], 35);
}

#[test]
fn signed_multiply_round_trip() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let b = asm.readgr(Type::Integer32, Operand::constant(1u16));
    let product = asm.mul(a, b);
    asm.writegr(Operand::constant(2u16), product);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    guest.registers[0] = (-5i32) as u32 as u64;
    guest.registers[1] = 7;
    run(routine.as_ref(), &mut guest);
    assert_eq!(guest.registers[2] as u32 as i32, -35);
}

extern "C" fn host_five(_guest: *mut GuestHandle) -> Value {
    Value::from_u64(5)
}

extern "C" fn host_double(_guest: *mut GuestHandle, a: Value) -> Value {
    Value::from_u64(a.u64() * 2)
}

extern "C" fn host_combine(_guest: *mut GuestHandle, a: Value, b: Value) -> Value {
    Value::from_u64(a.u64() * 2 + b.u64())
}

#[test]
fn host_call_chain() {
    let mut asm = Assembler::new();
    let r0 = asm.call0(Type::Integer64, host_five);
    let r1 = asm.call1(Type::Integer64, host_double, r0);
    let r2 = asm.call2(Type::Integer64, host_combine, r0, r1);
    asm.writegr(Operand::constant(0u16), r2);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    run(routine.as_ref(), &mut guest);
    assert_eq!(guest.registers[0], 20);
}

/// Bytecode and native agree on a mixed program.
#[test]
fn native_matches_bytecode() {
    let build = || {
        let mut asm = Assembler::new();
        let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
        let b = asm.readgr(Type::Integer32, Operand::constant(1u16));
        let sum = asm.add(a, b);
        let rotated = asm.rotr(sum, Operand::constant(3u32));
        let narrow = asm.readgr(Type::Integer8, Operand::constant(2u16));
        let widened = asm.extend32(narrow);
        let wide = asm.extend64(widened);
        asm.writegr(Operand::constant(3u16), rotated);
        asm.writegr(Operand::constant(4u16), wide);
        let low = asm.cmp_ult(a, b);
        asm.exit(low, Operand::constant(5u64));
        asm.exit(Operand::constant(true), Operand::constant(6u64));
        asm.export_unit()
    };

    let native = compile_unit(build());
    let bytecode = drift_jit::bytecode::Compiler::new().compile(build()).unwrap();

    for seed in [[2u64, 3, 0x90], [50, 1, 0x7f], [9, 9, 0]] {
        let mut native_guest = DummyGuest::new();
        native_guest.registers[..3].copy_from_slice(&seed);
        let native_code = run(native.as_ref(), &mut native_guest);

        let mut bytecode_guest = DummyGuest::new();
        bytecode_guest.registers[..3].copy_from_slice(&seed);
        let bytecode_code = common::run_bytecode(bytecode.as_ref(), &mut bytecode_guest);

        assert_eq!(native_code, bytecode_code);
        assert_eq!(native_guest.registers, bytecode_guest.registers);
    }
}

fn compile_unit(unit: drift_jit::ir::ExecutionUnit) -> Arc<dyn Routine> {
    let mut compiler = Compiler::new();
    compiler.set_register_address_cb(|index| index * 8);
    compiler.set_use_fastmem(false);
    let routine = compiler.compile(unit).unwrap();
    routine.prepare(true).unwrap();
    routine
}
