//! Native x86-64 round trips. These run real generated code and are
//! therefore host-gated.

#![cfg(all(target_arch = "x86_64", unix))]

use std::sync::Arc;

use drift_jit::amd64::{Address, Compiler, GeneralRegister, RegMemAny};
use drift_jit::ir::{Assembler, Operand, Type};
use drift_jit::prelude::*;

mod common;
use common::DummyGuest;

/// Guest registers live at `[register_base + index * 8]`.
fn register_address(index: u32) -> RegMemAny {
    RegMemAny::Mem(Address::base_disp(
        GeneralRegister::RBX,
        index as i32 * 8,
    ))
}

fn compile(mut asm: Assembler) -> Arc<dyn Routine> {
    let mut compiler = Compiler::new();
    compiler.set_register_address_cb(register_address);
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
    let code = run(routine.as_ref(), &mut guest);

    assert_eq!(code, 0);
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

extern "C" fn host_read_register(guest: *mut GuestHandle, index: Value) -> Value {
    let guest = unsafe { &mut *guest };
    guest.guest().guest_register_read(index.u32(), 8)
}

/// Host calls observe guest state written earlier in the same block, which
/// pins the ordering of emitted side effects.
#[test]
fn host_calls_observe_prior_writes() {
    let mut asm = Assembler::new();
    asm.writegr(Operand::constant(5u16), Operand::constant(0xabcdu32));
    let read_back = asm.call1(
        Type::Integer64,
        host_read_register,
        Operand::constant(5u64),
    );
    asm.writegr(Operand::constant(6u16), read_back);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    run(routine.as_ref(), &mut guest);
    assert_eq!(guest.registers[6], 0xabcd);
}

#[test]
fn compare_select_and_shift_mix() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let b = asm.readgr(Type::Integer32, Operand::constant(1u16));
    let less = asm.cmp_lt(a, b);
    let larger = asm.select(less, a, b);
    let shifted = asm.shiftl(larger, Operand::constant(1u32));
    asm.writegr(Operand::constant(2u16), shifted);
    let negative = asm.cmp_lt(a, Operand::constant(0i32 as u32));
    asm.exit(negative, Operand::constant(2u64));
    asm.exit(Operand::constant(true), Operand::constant(1u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    guest.registers[0] = 3;
    guest.registers[1] = 9;
    assert_eq!(run(routine.as_ref(), &mut guest), 1);
    assert_eq!(guest.registers[2], 18);

    let mut guest = DummyGuest::new();
    guest.registers[0] = (-1i32) as u32 as u64;
    guest.registers[1] = 9;
    assert_eq!(run(routine.as_ref(), &mut guest), 2);
}

#[test]
fn spill_pressure_round_trip() {
    let mut asm = Assembler::new();
    let values: Vec<Operand> = (0..16u16)
        .map(|i| {
            let v = asm.readgr(Type::Integer32, Operand::constant(i));
            asm.add(v, Operand::constant(1u32))
        })
        .collect();
    for (i, value) in values.iter().enumerate().rev() {
        asm.writegr(Operand::constant(i as u16), *value);
    }
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    for i in 0..16 {
        guest.registers[i] = i as u64 * 3;
    }
    run(routine.as_ref(), &mut guest);
    for i in 0..16 {
        assert_eq!(guest.registers[i], i as u64 * 3 + 1, "register {i}");
    }
}

#[test]
fn rotates_and_extends() {
    let mut asm = Assembler::new();
    let raw = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let rotated = asm.rotr(raw, Operand::constant(1u32));
    asm.writegr(Operand::constant(1u16), rotated);

    let narrow = asm.readgr(Type::Integer8, Operand::constant(2u16));
    let wide = asm.extend32(narrow);
    asm.writegr(Operand::constant(3u16), wide);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    guest.registers[0] = 0xffff_fffe;
    guest.registers[2] = 0x80;
    run(routine.as_ref(), &mut guest);

    assert_eq!(guest.registers[1], 0x7fff_ffff);
    assert_eq!(guest.registers[3] as u32, 0xffff_ff80);
}

/// Bytecode and native agree on a mixed program (routine equivalence).
#[test]
fn native_matches_bytecode() {
    let build = || {
        let mut asm = Assembler::new();
        let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
        let b = asm.readgr(Type::Integer32, Operand::constant(1u16));
        let sum = asm.add(a, b);
        let difference = asm.sub(a, b);
        let quotient = asm.udiv(sum, Operand::constant(3u32));
        let masked = asm.and(difference, Operand::constant(0xff00ffu32));
        asm.writegr(Operand::constant(2u16), quotient);
        asm.writegr(Operand::constant(3u16), masked);
        let odd = asm.test(sum, Operand::constant(1u32));
        asm.exit(odd, Operand::constant(5u64));
        asm.exit(Operand::constant(true), Operand::constant(6u64));
        asm.export_unit()
    };

    let native = {
        let mut compiler = Compiler::new();
        compiler.set_register_address_cb(register_address);
        let routine = compiler.compile(build()).unwrap();
        routine.prepare(true).unwrap();
        routine
    };
    let bytecode = drift_jit::bytecode::Compiler::new().compile(build()).unwrap();

    for seed in [[9u64, 4], [100, 1], [55, 55], [0, 0xffff]] {
        let mut native_guest = DummyGuest::new();
        native_guest.registers[..2].copy_from_slice(&seed);
        let native_code = run(native.as_ref(), &mut native_guest);

        let mut bytecode_guest = DummyGuest::new();
        bytecode_guest.registers[..2].copy_from_slice(&seed);
        let bytecode_code = common::run_bytecode(bytecode.as_ref(), &mut bytecode_guest);

        assert_eq!(native_code, bytecode_code, "exit codes diverged for {seed:?}");
        assert_eq!(
            native_guest.registers, bytecode_guest.registers,
            "register files diverged for {seed:?}"
        );
    }
}
