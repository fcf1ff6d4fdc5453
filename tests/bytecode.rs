//! End-to-end bytecode back-end runs against the dummy guest.

use drift_jit::bytecode::Compiler;
use drift_jit::ir::{Assembler, Operand, Type};
use drift_jit::prelude::*;

mod common;
use common::{run_bytecode, DummyGuest};

fn compile(mut asm: Assembler) -> std::sync::Arc<dyn Routine> {
    Compiler::new().compile(asm.export_unit()).unwrap()
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
    let code = run_bytecode(routine.as_ref(), &mut guest);

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
    run_bytecode(routine.as_ref(), &mut guest);

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

/// Chained host calls thread their results through guest-visible state.
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
    run_bytecode(routine.as_ref(), &mut guest);

    assert_eq!(guest.registers[0], 20);
}

extern "C" fn host_touch(guest: *mut GuestHandle) {
    let guest = unsafe { &mut *guest };
    guest.guest().guest_register_write(9, 8, Value::from_u64(0x77));
}

#[test]
fn void_host_call_reaches_the_guest() {
    let mut asm = Assembler::new();
    asm.call_void(host_touch);
    asm.exit(Operand::constant(true), Operand::constant(1u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    let code = run_bytecode(routine.as_ref(), &mut guest);
    assert_eq!(code, 1);
    assert_eq!(guest.registers[9], 0x77);
}

/// Memory traffic goes through the guest callbacks.
#[test]
fn load_store_round_trip() {
    let mut asm = Assembler::new();
    let address = Operand::constant(0x108u32);
    asm.store(address, Operand::constant(0x11223344u32));
    let loaded = asm.load(Type::Integer16, address);
    let widened = asm.extend32(loaded);
    asm.writegr(Operand::constant(0u16), widened);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    run_bytecode(routine.as_ref(), &mut guest);

    // Low 16 bits 0x3344, sign-extended.
    assert_eq!(guest.registers[0] as u32, 0x3344);
    assert_eq!(&guest.memory[0x108..0x10c], &[0x44, 0x33, 0x22, 0x11]);
}

/// Register pressure beyond the 13 allocatable bytecode registers spills
/// and still produces the right values.
#[test]
fn spill_pressure_round_trip() {
    let mut asm = Assembler::new();
    let values: Vec<Operand> = (0..20u16)
        .map(|i| {
            let v = asm.readgr(Type::Integer32, Operand::constant(i));
            asm.add(v, Operand::constant(1u32))
        })
        .collect();
    // Consume in reverse so every value stays live across all the others.
    for (i, value) in values.iter().enumerate().rev() {
        asm.writegr(Operand::constant(i as u16), *value);
    }
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    for i in 0..20 {
        guest.registers[i] = i as u64 * 10;
    }
    run_bytecode(routine.as_ref(), &mut guest);

    for i in 0..20 {
        assert_eq!(guest.registers[i], i as u64 * 10 + 1, "register {i}");
    }
}

#[test]
fn bit_set_clear_follows_the_control() {
    let mut asm = Assembler::new();
    let value = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let set = asm.bsc(value, Operand::constant(true), Operand::constant(2u64));
    let cleared = asm.bsc(set, Operand::constant(false), Operand::constant(7u64));
    asm.writegr(Operand::constant(1u16), cleared);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    guest.registers[0] = 0xf0;
    run_bytecode(routine.as_ref(), &mut guest);

    assert_eq!(guest.registers[1], (0xf0 | 0x04) & !0x80);
}

#[test]
fn arithmetic_shift_sign_extends() {
    let mut asm = Assembler::new();
    let shifted = asm.ashiftr(Operand::constant(-32i32), Operand::constant(2u8));
    asm.writegr(Operand::constant(0u16), shifted);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);
    let mut guest = DummyGuest::new();
    run_bytecode(routine.as_ref(), &mut guest);
    assert_eq!(guest.registers[0] as u32 as i32, -8);
}

#[test]
fn select_picks_by_condition() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let b = asm.readgr(Type::Integer32, Operand::constant(1u16));
    let cond = asm.cmp_ult(a, b);
    let chosen = asm.select(cond, a, b);
    asm.writegr(Operand::constant(2u16), chosen);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    guest.registers[0] = 3;
    guest.registers[1] = 9;
    run_bytecode(routine.as_ref(), &mut guest);
    // a < b, so the true side (b) is selected.
    assert_eq!(guest.registers[2], 9);

    let mut guest = DummyGuest::new();
    guest.registers[0] = 9;
    guest.registers[1] = 3;
    run_bytecode(routine.as_ref(), &mut guest);
    assert_eq!(guest.registers[2], 9);
}

/// The conditional exit only fires when its decision is true, and the code
/// after it still runs otherwise.
#[test]
fn conditional_exit() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let is_zero = asm.cmp_eq(a, Operand::constant(0u32));
    asm.exit(is_zero, Operand::constant(7u64));
    asm.writegr(Operand::constant(1u16), a);
    asm.exit(Operand::constant(true), Operand::constant(8u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    assert_eq!(run_bytecode(routine.as_ref(), &mut guest), 7);
    assert_eq!(guest.registers[1], 0);

    let mut guest = DummyGuest::new();
    guest.registers[0] = 42;
    assert_eq!(run_bytecode(routine.as_ref(), &mut guest), 8);
    assert_eq!(guest.registers[1], 42);
}

/// Float arithmetic travels as bit patterns through the untyped registers.
#[test]
fn float_round_trip() {
    let mut asm = Assembler::new();
    let raw = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let a = asm.bitcast(Type::Float32, raw);
    let sum = asm.add(a, Operand::constant(0.5f32));
    let product = asm.mul(sum, Operand::constant(2.0f32));
    let bits = asm.bitcast(Type::Integer32, product);
    asm.writegr(Operand::constant(1u16), bits);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    guest.registers[0] = 1.25f32.to_bits() as u64;
    run_bytecode(routine.as_ref(), &mut guest);

    assert_eq!(f32::from_bits(guest.registers[1] as u32), 3.5);
}

/// Modulus lowers through divide/multiply/subtract and keeps truncating
/// semantics.
#[test]
fn modulus_truncates_toward_zero() {
    let mut asm = Assembler::new();
    let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
    let b = asm.readgr(Type::Integer32, Operand::constant(1u16));
    let remainder = asm.modulus(a, b);
    asm.writegr(Operand::constant(2u16), remainder);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    let routine = compile(asm);

    let mut guest = DummyGuest::new();
    guest.registers[0] = (-7i32) as u32 as u64;
    guest.registers[1] = 3;
    run_bytecode(routine.as_ref(), &mut guest);
    assert_eq!(guest.registers[2] as u32 as i32, -1);
}
