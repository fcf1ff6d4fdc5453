//! The bytecode interpreter.

use crate::bytecode::opcode::Decoder;
use crate::error::PrepareError;
use crate::guest::{GuestHandle, HostFn0, HostFn1, HostFn2, HostFnVoid0};
use crate::jit;
use crate::jit::routine::hex_dump;
use crate::jit::rtl::RtlOp;
use crate::value::Value;

/// An executable bytecode routine: the encoded byte stream plus the spill
/// area size its execution needs.
///
/// Execution is a straight-line dispatch over the opcode byte. The sixteen
/// logical registers are untyped `u64` slots; width-specific opcodes mask
/// their results and floats travel as raw bit patterns. The routine runs
/// entirely through the [`Guest`](crate::guest::Guest) callbacks, so the
/// `memory_base`/`register_base` arguments are unused.
pub struct Routine {
    code: Box<[u8]>,
    spill_slots: u32,
}

impl Routine {
    /// Wrap an encoded byte stream.
    pub fn new(code: Vec<u8>, spill_slots: u32) -> Self {
        Self {
            code: code.into_boxed_slice(),
            spill_slots,
        }
    }

    /// The encoded bytes.
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

fn f32_of(bits: u64) -> f32 {
    f32::from_bits(bits as u32)
}

fn f32_bits(value: f32) -> u64 {
    value.to_bits() as u64
}

fn f64_of(bits: u64) -> f64 {
    f64::from_bits(bits)
}

impl jit::Routine for Routine {
    fn prepare(&self, _commit: bool) -> Result<bool, PrepareError> {
        // Bytecode needs no mapping changes.
        Ok(true)
    }

    fn ready(&self) -> bool {
        true
    }

    fn execute(
        &self,
        guest: &mut GuestHandle,
        _memory_base: *mut u8,
        _register_base: *mut u8,
    ) -> u64 {
        let guest_ptr = guest as *mut GuestHandle;
        let mut regs = [0u64; crate::bytecode::opcode::REGISTER_COUNT];
        let mut spill = vec![0u64; self.spill_slots as usize];
        let mut decoder = Decoder::new(&self.code);

        while !decoder.at_end() {
            let op = decoder.opcode().expect("corrupt bytecode stream");

            match op {
                RtlOp::Constant8 => {
                    let a = decoder.register() as usize;
                    regs[a] = decoder.u8() as u64;
                }
                RtlOp::Constant16 => {
                    let a = decoder.register() as usize;
                    regs[a] = decoder.u16() as u64;
                }
                RtlOp::Constant32 => {
                    let a = decoder.register() as usize;
                    regs[a] = decoder.u32() as u64;
                }
                RtlOp::Constant64 => {
                    let a = decoder.register() as usize;
                    regs[a] = decoder.u64();
                }
                RtlOp::ExtendConstant8 => {
                    let a = decoder.register() as usize;
                    regs[a] = decoder.u8() as i8 as i64 as u64;
                }
                RtlOp::ExtendConstant16 => {
                    let a = decoder.register() as usize;
                    regs[a] = decoder.u16() as i16 as i64 as u64;
                }
                RtlOp::ExtendConstant32 => {
                    let a = decoder.register() as usize;
                    regs[a] = decoder.u32() as i32 as i64 as u64;
                }

                RtlOp::ReadRegister8 | RtlOp::ReadRegister16 | RtlOp::ReadRegister32
                | RtlOp::ReadRegister64 => {
                    let a = decoder.register() as usize;
                    let index = decoder.u16() as u32;
                    let bytes = match op {
                        RtlOp::ReadRegister8 => 1,
                        RtlOp::ReadRegister16 => 2,
                        RtlOp::ReadRegister32 => 4,
                        _ => 8,
                    };
                    let value = guest.guest().guest_register_read(index, bytes);
                    regs[a] = match bytes {
                        1 => value.u8() as u64,
                        2 => value.u16() as u64,
                        4 => value.u32() as u64,
                        _ => value.u64(),
                    };
                }

                RtlOp::WriteRegister8 | RtlOp::WriteRegister16 | RtlOp::WriteRegister32
                | RtlOp::WriteRegister64 => {
                    let a = decoder.register() as usize;
                    let index = decoder.u16() as u32;
                    let (bytes, value) = match op {
                        RtlOp::WriteRegister8 => (1, Value::from_u8(regs[a] as u8)),
                        RtlOp::WriteRegister16 => (2, Value::from_u16(regs[a] as u16)),
                        RtlOp::WriteRegister32 => (4, Value::from_u32(regs[a] as u32)),
                        _ => (8, Value::from_u64(regs[a])),
                    };
                    guest.guest().guest_register_write(index, bytes, value);
                }

                RtlOp::Load8 | RtlOp::Load16 | RtlOp::Load32 | RtlOp::Load64 => {
                    let (a, b) = decoder.register_pair();
                    let (a, b) = (a as usize, b as usize);
                    let bytes = match op {
                        RtlOp::Load8 => 1,
                        RtlOp::Load16 => 2,
                        RtlOp::Load32 => 4,
                        _ => 8,
                    };
                    let value = guest.guest().guest_load(regs[b] as u32, bytes);
                    regs[a] = match bytes {
                        1 => value.u8() as u64,
                        2 => value.u16() as u64,
                        4 => value.u32() as u64,
                        _ => value.u64(),
                    };
                }

                RtlOp::Store8 | RtlOp::Store16 | RtlOp::Store32 | RtlOp::Store64 => {
                    let (a, b) = decoder.register_pair();
                    let (a, b) = (a as usize, b as usize);
                    let (bytes, value) = match op {
                        RtlOp::Store8 => (1, Value::from_u8(regs[b] as u8)),
                        RtlOp::Store16 => (2, Value::from_u16(regs[b] as u16)),
                        RtlOp::Store32 => (4, Value::from_u32(regs[b] as u32)),
                        _ => (8, Value::from_u64(regs[b])),
                    };
                    guest.guest().guest_store(regs[a] as u32, bytes, value);
                }

                RtlOp::RotateRight8 | RtlOp::RotateRight16 | RtlOp::RotateRight32
                | RtlOp::RotateRight64 | RtlOp::RotateLeft8 | RtlOp::RotateLeft16
                | RtlOp::RotateLeft32 | RtlOp::RotateLeft64 | RtlOp::ShiftRight8
                | RtlOp::ShiftRight16 | RtlOp::ShiftRight32 | RtlOp::ShiftRight64
                | RtlOp::ShiftLeft8 | RtlOp::ShiftLeft16 | RtlOp::ShiftLeft32
                | RtlOp::ShiftLeft64 | RtlOp::ArithmeticShiftRight8
                | RtlOp::ArithmeticShiftRight16 | RtlOp::ArithmeticShiftRight32
                | RtlOp::ArithmeticShiftRight64 => {
                    let (a, b) = decoder.register_pair();
                    let c = decoder.register();
                    decoder.pad();
                    let (a, b, c) = (a as usize, b as usize, c as usize);
                    let count = regs[c] as u32;
                    regs[a] = match op {
                        RtlOp::RotateRight8 => (regs[b] as u8).rotate_right(count) as u64,
                        RtlOp::RotateRight16 => (regs[b] as u16).rotate_right(count) as u64,
                        RtlOp::RotateRight32 => (regs[b] as u32).rotate_right(count) as u64,
                        RtlOp::RotateRight64 => regs[b].rotate_right(count),
                        RtlOp::RotateLeft8 => (regs[b] as u8).rotate_left(count) as u64,
                        RtlOp::RotateLeft16 => (regs[b] as u16).rotate_left(count) as u64,
                        RtlOp::RotateLeft32 => (regs[b] as u32).rotate_left(count) as u64,
                        RtlOp::RotateLeft64 => regs[b].rotate_left(count),
                        RtlOp::ShiftRight8 => (regs[b] as u8).wrapping_shr(count) as u64,
                        RtlOp::ShiftRight16 => (regs[b] as u16).wrapping_shr(count) as u64,
                        RtlOp::ShiftRight32 => (regs[b] as u32).wrapping_shr(count) as u64,
                        RtlOp::ShiftRight64 => regs[b].wrapping_shr(count),
                        RtlOp::ShiftLeft8 => (regs[b] as u8).wrapping_shl(count) as u64,
                        RtlOp::ShiftLeft16 => (regs[b] as u16).wrapping_shl(count) as u64,
                        RtlOp::ShiftLeft32 => (regs[b] as u32).wrapping_shl(count) as u64,
                        RtlOp::ShiftLeft64 => regs[b].wrapping_shl(count),
                        RtlOp::ArithmeticShiftRight8 => {
                            (regs[b] as i8).wrapping_shr(count) as u8 as u64
                        }
                        RtlOp::ArithmeticShiftRight16 => {
                            (regs[b] as i16).wrapping_shr(count) as u16 as u64
                        }
                        RtlOp::ArithmeticShiftRight32 => {
                            (regs[b] as i32).wrapping_shr(count) as u32 as u64
                        }
                        _ => (regs[b] as i64).wrapping_shr(count) as u64,
                    };
                }

                RtlOp::And8 | RtlOp::And16 | RtlOp::And32 | RtlOp::And64 | RtlOp::AndBool
                | RtlOp::Or8 | RtlOp::Or16 | RtlOp::Or32 | RtlOp::Or64 | RtlOp::OrBool
                | RtlOp::Xor8 | RtlOp::Xor16 | RtlOp::Xor32 | RtlOp::Xor64 | RtlOp::XorBool => {
                    let (a, b) = decoder.register_pair();
                    let c = decoder.register();
                    decoder.pad();
                    let (a, b, c) = (a as usize, b as usize, c as usize);
                    regs[a] = match op {
                        RtlOp::And8 => (regs[b] & regs[c]) as u8 as u64,
                        RtlOp::And16 => (regs[b] & regs[c]) as u16 as u64,
                        RtlOp::And32 => (regs[b] & regs[c]) as u32 as u64,
                        RtlOp::And64 => regs[b] & regs[c],
                        RtlOp::AndBool => regs[b] & regs[c] & 1,
                        RtlOp::Or8 => (regs[b] | regs[c]) as u8 as u64,
                        RtlOp::Or16 => (regs[b] | regs[c]) as u16 as u64,
                        RtlOp::Or32 => (regs[b] | regs[c]) as u32 as u64,
                        RtlOp::Or64 => regs[b] | regs[c],
                        RtlOp::OrBool => (regs[b] | regs[c]) & 1,
                        RtlOp::Xor8 => (regs[b] ^ regs[c]) as u8 as u64,
                        RtlOp::Xor16 => (regs[b] ^ regs[c]) as u16 as u64,
                        RtlOp::Xor32 => (regs[b] ^ regs[c]) as u32 as u64,
                        RtlOp::Xor64 => regs[b] ^ regs[c],
                        _ => (regs[b] ^ regs[c]) & 1,
                    };
                }

                RtlOp::Not8 | RtlOp::Not16 | RtlOp::Not32 | RtlOp::Not64 | RtlOp::NotBool => {
                    let (a, b) = decoder.register_pair();
                    let (a, b) = (a as usize, b as usize);
                    regs[a] = match op {
                        RtlOp::Not8 => !(regs[b] as u8) as u64,
                        RtlOp::Not16 => !(regs[b] as u16) as u64,
                        RtlOp::Not32 => !(regs[b] as u32) as u64,
                        RtlOp::Not64 => !regs[b],
                        _ => !regs[b] & 1,
                    };
                }

                RtlOp::BitSetClear8 | RtlOp::BitSetClear16 | RtlOp::BitSetClear32
                | RtlOp::BitSetClear64 => {
                    let (a, b) = decoder.register_pair();
                    let c = decoder.register();
                    let position = decoder.u8() as u32;
                    let (a, b, c) = (a as usize, b as usize, c as usize);
                    let bit = regs[c] & 1;
                    let merged = regs[b] & !(1u64 << position) | (bit << position);
                    regs[a] = match op {
                        RtlOp::BitSetClear8 => merged as u8 as u64,
                        RtlOp::BitSetClear16 => merged as u16 as u64,
                        RtlOp::BitSetClear32 => merged as u32 as u64,
                        _ => merged,
                    };
                }

                RtlOp::AddInteger | RtlOp::AddFloat32 | RtlOp::AddFloat64 | RtlOp::SubInteger8
                | RtlOp::SubInteger16 | RtlOp::SubInteger32 | RtlOp::SubInteger64
                | RtlOp::SubFloat32 | RtlOp::SubFloat64 | RtlOp::MultiplyI8
                | RtlOp::MultiplyI16 | RtlOp::MultiplyI32 | RtlOp::MultiplyI64
                | RtlOp::MultiplyU8 | RtlOp::MultiplyU16 | RtlOp::MultiplyU32
                | RtlOp::MultiplyU64 | RtlOp::MultiplyF32 | RtlOp::MultiplyF64
                | RtlOp::DivideI8 | RtlOp::DivideI16 | RtlOp::DivideI32 | RtlOp::DivideI64
                | RtlOp::DivideU8 | RtlOp::DivideU16 | RtlOp::DivideU32 | RtlOp::DivideU64
                | RtlOp::DivideF32 | RtlOp::DivideF64 => {
                    let (a, b) = decoder.register_pair();
                    let c = decoder.register();
                    decoder.pad();
                    let (a, b, c) = (a as usize, b as usize, c as usize);
                    regs[a] = match op {
                        RtlOp::AddInteger => regs[b].wrapping_add(regs[c]),
                        RtlOp::AddFloat32 => f32_bits(f32_of(regs[b]) + f32_of(regs[c])),
                        RtlOp::AddFloat64 => (f64_of(regs[b]) + f64_of(regs[c])).to_bits(),
                        RtlOp::SubInteger8 => (regs[b] as u8).wrapping_sub(regs[c] as u8) as u64,
                        RtlOp::SubInteger16 => {
                            (regs[b] as u16).wrapping_sub(regs[c] as u16) as u64
                        }
                        RtlOp::SubInteger32 => {
                            (regs[b] as u32).wrapping_sub(regs[c] as u32) as u64
                        }
                        RtlOp::SubInteger64 => regs[b].wrapping_sub(regs[c]),
                        RtlOp::SubFloat32 => f32_bits(f32_of(regs[b]) - f32_of(regs[c])),
                        RtlOp::SubFloat64 => (f64_of(regs[b]) - f64_of(regs[c])).to_bits(),
                        RtlOp::MultiplyI8 => {
                            (regs[b] as i8).wrapping_mul(regs[c] as i8) as u8 as u64
                        }
                        RtlOp::MultiplyI16 => {
                            (regs[b] as i16).wrapping_mul(regs[c] as i16) as u16 as u64
                        }
                        RtlOp::MultiplyI32 => {
                            (regs[b] as i32).wrapping_mul(regs[c] as i32) as u32 as u64
                        }
                        RtlOp::MultiplyI64 => {
                            (regs[b] as i64).wrapping_mul(regs[c] as i64) as u64
                        }
                        RtlOp::MultiplyU8 => {
                            (regs[b] as u8).wrapping_mul(regs[c] as u8) as u64
                        }
                        RtlOp::MultiplyU16 => {
                            (regs[b] as u16).wrapping_mul(regs[c] as u16) as u64
                        }
                        RtlOp::MultiplyU32 => {
                            (regs[b] as u32).wrapping_mul(regs[c] as u32) as u64
                        }
                        RtlOp::MultiplyU64 => regs[b].wrapping_mul(regs[c]),
                        RtlOp::MultiplyF32 => f32_bits(f32_of(regs[b]) * f32_of(regs[c])),
                        RtlOp::MultiplyF64 => (f64_of(regs[b]) * f64_of(regs[c])).to_bits(),
                        RtlOp::DivideI8 => {
                            (regs[b] as i8).wrapping_div(regs[c] as i8) as u8 as u64
                        }
                        RtlOp::DivideI16 => {
                            (regs[b] as i16).wrapping_div(regs[c] as i16) as u16 as u64
                        }
                        RtlOp::DivideI32 => {
                            (regs[b] as i32).wrapping_div(regs[c] as i32) as u32 as u64
                        }
                        RtlOp::DivideI64 => {
                            (regs[b] as i64).wrapping_div(regs[c] as i64) as u64
                        }
                        RtlOp::DivideU8 => ((regs[b] as u8) / (regs[c] as u8)) as u64,
                        RtlOp::DivideU16 => ((regs[b] as u16) / (regs[c] as u16)) as u64,
                        RtlOp::DivideU32 => ((regs[b] as u32) / (regs[c] as u32)) as u64,
                        RtlOp::DivideU64 => regs[b] / regs[c],
                        RtlOp::DivideF32 => f32_bits(f32_of(regs[b]) / f32_of(regs[c])),
                        _ => (f64_of(regs[b]) / f64_of(regs[c])).to_bits(),
                    };
                }

                RtlOp::SquareRootF32 | RtlOp::SquareRootF64 | RtlOp::Extend8to16
                | RtlOp::Extend8to32 | RtlOp::Extend8to64 | RtlOp::Extend16to32
                | RtlOp::Extend16to64 | RtlOp::Extend32to64 | RtlOp::Float32to64
                | RtlOp::Float64to32 | RtlOp::Cast8 | RtlOp::Cast16 | RtlOp::Cast32
                | RtlOp::Cast64 | RtlOp::CastF32toI32 | RtlOp::CastF64toI32
                | RtlOp::CastF32toI64 | RtlOp::CastF64toI64 | RtlOp::CastI32toF32
                | RtlOp::CastI32toF64 | RtlOp::CastI64toF32 | RtlOp::CastI64toF64 => {
                    let (a, b) = decoder.register_pair();
                    let (a, b) = (a as usize, b as usize);
                    regs[a] = match op {
                        RtlOp::SquareRootF32 => f32_bits(f32_of(regs[b]).sqrt()),
                        RtlOp::SquareRootF64 => f64_of(regs[b]).sqrt().to_bits(),
                        RtlOp::Extend8to16 => (regs[b] as i8) as i16 as u16 as u64,
                        RtlOp::Extend8to32 => (regs[b] as i8) as i32 as u32 as u64,
                        RtlOp::Extend8to64 => (regs[b] as i8) as i64 as u64,
                        RtlOp::Extend16to32 => (regs[b] as i16) as i32 as u32 as u64,
                        RtlOp::Extend16to64 => (regs[b] as i16) as i64 as u64,
                        RtlOp::Extend32to64 => (regs[b] as i32) as i64 as u64,
                        RtlOp::Float32to64 => (f32_of(regs[b]) as f64).to_bits(),
                        RtlOp::Float64to32 => f32_bits(f64_of(regs[b]) as f32),
                        RtlOp::Cast8 => regs[b] as u8 as u64,
                        RtlOp::Cast16 => regs[b] as u16 as u64,
                        RtlOp::Cast32 => regs[b] as u32 as u64,
                        RtlOp::Cast64 => regs[b],
                        RtlOp::CastF32toI32 => (f32_of(regs[b]) as i32) as u32 as u64,
                        RtlOp::CastF64toI32 => (f64_of(regs[b]) as i32) as u32 as u64,
                        RtlOp::CastF32toI64 => (f32_of(regs[b]) as i64) as u64,
                        RtlOp::CastF64toI64 => (f64_of(regs[b]) as i64) as u64,
                        RtlOp::CastI32toF32 => f32_bits(regs[b] as i32 as f32),
                        RtlOp::CastI32toF64 => (regs[b] as i32 as f64).to_bits(),
                        RtlOp::CastI64toF32 => f32_bits(regs[b] as i64 as f32),
                        _ => (regs[b] as i64 as f64).to_bits(),
                    };
                }

                RtlOp::Test8 | RtlOp::Test16 | RtlOp::Test32 | RtlOp::Test64
                | RtlOp::CompareEq8 | RtlOp::CompareEq16 | RtlOp::CompareEq32
                | RtlOp::CompareEq64 | RtlOp::CompareEqF32 | RtlOp::CompareEqF64
                | RtlOp::CompareEqBool | RtlOp::CompareLtI8 | RtlOp::CompareLtI16
                | RtlOp::CompareLtI32 | RtlOp::CompareLtI64 | RtlOp::CompareLtU8
                | RtlOp::CompareLtU16 | RtlOp::CompareLtU32 | RtlOp::CompareLtU64
                | RtlOp::CompareLtF32 | RtlOp::CompareLtF64 | RtlOp::CompareLteI8
                | RtlOp::CompareLteI16 | RtlOp::CompareLteI32 | RtlOp::CompareLteI64
                | RtlOp::CompareLteU8 | RtlOp::CompareLteU16 | RtlOp::CompareLteU32
                | RtlOp::CompareLteU64 | RtlOp::CompareLteF32 | RtlOp::CompareLteF64 => {
                    let (a, b) = decoder.register_pair();
                    let c = decoder.register();
                    decoder.pad();
                    let (a, b, c) = (a as usize, b as usize, c as usize);
                    regs[a] = match op {
                        RtlOp::Test8 => ((regs[b] & regs[c]) as u8 != 0) as u64,
                        RtlOp::Test16 => ((regs[b] & regs[c]) as u16 != 0) as u64,
                        RtlOp::Test32 => ((regs[b] & regs[c]) as u32 != 0) as u64,
                        RtlOp::Test64 => ((regs[b] & regs[c]) != 0) as u64,
                        RtlOp::CompareEq8 => (regs[b] as u8 == regs[c] as u8) as u64,
                        RtlOp::CompareEq16 => (regs[b] as u16 == regs[c] as u16) as u64,
                        RtlOp::CompareEq32 => (regs[b] as u32 == regs[c] as u32) as u64,
                        RtlOp::CompareEq64 => (regs[b] == regs[c]) as u64,
                        RtlOp::CompareEqF32 => (f32_of(regs[b]) == f32_of(regs[c])) as u64,
                        RtlOp::CompareEqF64 => (f64_of(regs[b]) == f64_of(regs[c])) as u64,
                        RtlOp::CompareEqBool => ((regs[b] & 1) == (regs[c] & 1)) as u64,
                        RtlOp::CompareLtI8 => ((regs[b] as i8) < (regs[c] as i8)) as u64,
                        RtlOp::CompareLtI16 => ((regs[b] as i16) < (regs[c] as i16)) as u64,
                        RtlOp::CompareLtI32 => ((regs[b] as i32) < (regs[c] as i32)) as u64,
                        RtlOp::CompareLtI64 => ((regs[b] as i64) < (regs[c] as i64)) as u64,
                        RtlOp::CompareLtU8 => ((regs[b] as u8) < (regs[c] as u8)) as u64,
                        RtlOp::CompareLtU16 => ((regs[b] as u16) < (regs[c] as u16)) as u64,
                        RtlOp::CompareLtU32 => ((regs[b] as u32) < (regs[c] as u32)) as u64,
                        RtlOp::CompareLtU64 => (regs[b] < regs[c]) as u64,
                        RtlOp::CompareLtF32 => (f32_of(regs[b]) < f32_of(regs[c])) as u64,
                        RtlOp::CompareLtF64 => (f64_of(regs[b]) < f64_of(regs[c])) as u64,
                        RtlOp::CompareLteI8 => ((regs[b] as i8) <= (regs[c] as i8)) as u64,
                        RtlOp::CompareLteI16 => ((regs[b] as i16) <= (regs[c] as i16)) as u64,
                        RtlOp::CompareLteI32 => ((regs[b] as i32) <= (regs[c] as i32)) as u64,
                        RtlOp::CompareLteI64 => ((regs[b] as i64) <= (regs[c] as i64)) as u64,
                        RtlOp::CompareLteU8 => ((regs[b] as u8) <= (regs[c] as u8)) as u64,
                        RtlOp::CompareLteU16 => ((regs[b] as u16) <= (regs[c] as u16)) as u64,
                        RtlOp::CompareLteU32 => ((regs[b] as u32) <= (regs[c] as u32)) as u64,
                        RtlOp::CompareLteU64 => (regs[b] <= regs[c]) as u64,
                        RtlOp::CompareLteF32 => (f32_of(regs[b]) <= f32_of(regs[c])) as u64,
                        _ => (f64_of(regs[b]) <= f64_of(regs[c])) as u64,
                    };
                }

                RtlOp::Select => {
                    let (a, b) = decoder.register_pair();
                    let (c, d) = decoder.register_pair();
                    decoder.pad();
                    let (a, b, c, d) = (a as usize, b as usize, c as usize, d as usize);
                    regs[a] = if regs[b] & 1 != 0 { regs[d] } else { regs[c] };
                }

                RtlOp::Exit => {
                    return decoder.u24() as u64;
                }

                RtlOp::ExitIf => {
                    let a = decoder.register() as usize;
                    let code = decoder.u16() as u64;
                    if regs[a] & 1 != 0 {
                        return code;
                    }
                }

                RtlOp::HostVoidCall0 => {
                    let a = decoder.register() as usize;
                    let function: HostFnVoid0 =
                        unsafe { std::mem::transmute(regs[a] as usize) };
                    function(guest_ptr);
                }

                RtlOp::HostCall0 => {
                    let (a, b) = decoder.register_pair();
                    let (a, b) = (a as usize, b as usize);
                    let function: HostFn0 = unsafe { std::mem::transmute(regs[b] as usize) };
                    regs[a] = function(guest_ptr).bits();
                }

                RtlOp::HostCall1 => {
                    let (a, b) = decoder.register_pair();
                    let c = decoder.register();
                    decoder.pad();
                    let (a, b, c) = (a as usize, b as usize, c as usize);
                    let function: HostFn1 = unsafe { std::mem::transmute(regs[b] as usize) };
                    regs[a] = function(guest_ptr, Value::from_bits(regs[c])).bits();
                }

                RtlOp::HostCall2 => {
                    let (a, b) = decoder.register_pair();
                    let (c, d) = decoder.register_pair();
                    decoder.pad();
                    let (a, b, c, d) = (a as usize, b as usize, c as usize, d as usize);
                    let function: HostFn2 = unsafe { std::mem::transmute(regs[b] as usize) };
                    regs[a] = function(
                        guest_ptr,
                        Value::from_bits(regs[c]),
                        Value::from_bits(regs[d]),
                    )
                    .bits();
                }

                RtlOp::LoadSpill => {
                    let a = decoder.register() as usize;
                    let slot = decoder.u16() as usize;
                    regs[a] = spill[slot];
                }

                RtlOp::StoreSpill => {
                    let a = decoder.register() as usize;
                    let slot = decoder.u16() as usize;
                    spill[slot] = regs[a];
                }

                op => panic!("bytecode stream contains unencodable opcode {op:?}"),
            }
        }

        0
    }

    fn size(&self) -> usize {
        self.code.len()
    }

    fn disassemble(&self) -> String {
        hex_dump(&self.code)
    }
}
