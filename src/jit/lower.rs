//! Shared IR to RTL lowering used by every back-end.
//!
//! The scan is a mostly 1:1 translation: each IR instruction allocates one
//! RTL SSA value per IR result, appends one or more RTL instructions and
//! updates the IR-to-RTL mapping. Inline IR constants materialize through
//! `Constant*` opcodes. Typed IR opcodes split into width/signedness
//! specific RTL opcodes. Host-call argument and result operands are pinned
//! to the back-end's calling convention registers; the register allocator
//! later satisfies the pins with inserted `Move`s.

use crate::error::CompileError;
use crate::ir::{self, ExecutionUnit, Opcode, Operand, Type};
use crate::jit::rtl::{RegClass, RegisterAssignment, RtlOp, RtlProgram, RtlRegister};
use crate::value::Value;

/// Host-call register pins for one back-end, in the back-end's hardware
/// register numbering. Pinned registers must not be part of the allocatable
/// pool handed to the allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallingConvention {
    /// Pin for the first user argument.
    pub arg1: Option<u8>,
    /// Pin for the second user argument.
    pub arg2: Option<u8>,
    /// Pin for the call result.
    pub ret: Option<u8>,
}

impl CallingConvention {
    /// No pins; used by the bytecode back-end.
    pub const UNCONSTRAINED: CallingConvention = CallingConvention {
        arg1: None,
        arg2: None,
        ret: None,
    };
}

/// Output of [`lower`].
pub struct Lowered {
    /// The lowered program, one block per execution unit.
    pub rtl: RtlProgram,
    /// Whether the unit contains guest memory loads or stores. Back-ends
    /// that pin a memory-base register may release it otherwise.
    pub uses_memory: bool,
}

/// Lower an execution unit to RTL.
///
/// `classify` maps an IR value type to the register class its values
/// allocate from (the bytecode back-end uses a single class, the native
/// back-ends put floats in the vector class).
pub fn lower(
    unit: &ExecutionUnit,
    convention: &CallingConvention,
    classify: fn(Type) -> RegClass,
) -> Result<Lowered, CompileError> {
    let mut state = Lowering {
        rtl: RtlProgram::new(),
        ir_to_rtl: vec![RtlRegister::invalid(); unit.register_count() as usize],
        classify,
        uses_memory: false,
        block: 0,
    };
    state.block = state.rtl.allocate_block("entry");

    for instruction in unit.instructions() {
        state.lower_instruction(instruction, convention)?;
    }

    Ok(Lowered {
        rtl: state.rtl,
        uses_memory: state.uses_memory,
    })
}

struct Lowering {
    rtl: RtlProgram,
    ir_to_rtl: Vec<RtlRegister>,
    classify: fn(Type) -> RegClass,
    uses_memory: bool,
    block: usize,
}

/// Select among four width variants by integer type.
fn by_width(
    opcode: Opcode,
    ty: Type,
    w8: RtlOp,
    w16: RtlOp,
    w32: RtlOp,
    w64: RtlOp,
) -> Result<RtlOp, CompileError> {
    match ty {
        Type::Integer8 => Ok(w8),
        Type::Integer16 => Ok(w16),
        Type::Integer32 => Ok(w32),
        Type::Integer64 => Ok(w64),
        ty => Err(CompileError::UnsupportedType { opcode, ty }),
    }
}

impl Lowering {
    /// Return the RTL SSA value for an IR operand, materializing inline
    /// constants through `Constant*` opcodes.
    fn get_rtl_ssa(&mut self, operand: Operand) -> RtlRegister {
        if operand.is_register() {
            let mapped = self.ir_to_rtl[operand.register_index().0 as usize];
            assert!(mapped.valid(), "IR source used before definition");
            return mapped;
        }

        let (op, bits, class) = match operand.ty() {
            Type::Integer8 => (
                RtlOp::Constant8,
                operand.value().u8() as u64,
                (self.classify)(operand.ty()),
            ),
            Type::Integer16 => (
                RtlOp::Constant16,
                operand.value().u16() as u64,
                (self.classify)(operand.ty()),
            ),
            Type::Integer32 | Type::Float32 => (
                RtlOp::Constant32,
                operand.value().u32() as u64,
                (self.classify)(operand.ty()),
            ),
            Type::Integer64 | Type::Float64 => (
                RtlOp::Constant64,
                operand.value().u64(),
                (self.classify)(operand.ty()),
            ),
            Type::HostAddress => (RtlOp::Constant64, operand.value().host_ptr(), RegClass::GENERAL),
            Type::Bool => (
                RtlOp::Constant8,
                operand.value().bool() as u64,
                RegClass::GENERAL,
            ),
            Type::BranchLabel => panic!("label operands cannot be materialized"),
        };

        let ssa = self.rtl.ssa_allocate(class);
        self.rtl.block_mut(self.block).append_with_data(
            op,
            Value::from_u64(bits),
            &[RegisterAssignment::any(ssa)],
            &[],
        );
        ssa
    }

    /// Allocate a new RTL SSA value for an IR result operand and record the
    /// mapping for later sources.
    fn make_rtl_ssa(&mut self, operand: Operand) -> RtlRegister {
        assert!(operand.is_register());
        let index = operand.register_index().0 as usize;
        assert!(!self.ir_to_rtl[index].valid(), "IR register defined twice");

        let ssa = self.rtl.ssa_allocate((self.classify)(operand.ty()));
        self.ir_to_rtl[index] = ssa;
        ssa
    }

    fn append(&mut self, op: RtlOp, results: &[RegisterAssignment], sources: &[RegisterAssignment]) {
        self.rtl.block_mut(self.block).append(op, results, sources);
    }

    fn append_with_data(
        &mut self,
        op: RtlOp,
        data: Value,
        results: &[RegisterAssignment],
        sources: &[RegisterAssignment],
    ) {
        self.rtl
            .block_mut(self.block)
            .append_with_data(op, data, results, sources);
    }

    fn lower_instruction(
        &mut self,
        current: &ir::Instruction,
        convention: &CallingConvention,
    ) -> Result<(), CompileError> {
        use RegisterAssignment as R;

        match current.opcode() {
            Opcode::None => {}

            Opcode::ReadGuest => {
                let result = self.make_rtl_ssa(current.result(0));
                let index = current.source(0).zero_extended() as u16;
                let op = match current.result(0).ty() {
                    Type::Integer8 => RtlOp::ReadRegister8,
                    Type::Integer16 => RtlOp::ReadRegister16,
                    Type::Integer32 | Type::Float32 => RtlOp::ReadRegister32,
                    Type::Integer64 | Type::Float64 => RtlOp::ReadRegister64,
                    ty => {
                        return Err(CompileError::UnsupportedType {
                            opcode: current.opcode(),
                            ty,
                        })
                    }
                };
                self.append_with_data(op, Value::from_u16(index), &[R::any(result)], &[]);
            }

            Opcode::WriteGuest => {
                let index = current.source(0).zero_extended() as u16;
                let value = self.get_rtl_ssa(current.source(1));
                let op = match current.source(1).ty() {
                    Type::Integer8 => RtlOp::WriteRegister8,
                    Type::Integer16 => RtlOp::WriteRegister16,
                    Type::Integer32 | Type::Float32 => RtlOp::WriteRegister32,
                    Type::Integer64 | Type::Float64 => RtlOp::WriteRegister64,
                    ty => {
                        return Err(CompileError::UnsupportedType {
                            opcode: current.opcode(),
                            ty,
                        })
                    }
                };
                self.append_with_data(op, Value::from_u16(index), &[], &[R::any(value)]);
            }

            Opcode::Load => {
                self.uses_memory = true;
                let result = self.make_rtl_ssa(current.result(0));
                let address = self.get_rtl_ssa(current.source(0));
                let op = match current.result(0).ty() {
                    Type::Integer8 => RtlOp::Load8,
                    Type::Integer16 => RtlOp::Load16,
                    Type::Integer32 | Type::Float32 => RtlOp::Load32,
                    Type::Integer64 | Type::Float64 => RtlOp::Load64,
                    ty => {
                        return Err(CompileError::UnsupportedType {
                            opcode: current.opcode(),
                            ty,
                        })
                    }
                };
                self.append(op, &[R::any(result)], &[R::any(address)]);
            }

            Opcode::Store => {
                self.uses_memory = true;
                let address = self.get_rtl_ssa(current.source(0));
                let value = self.get_rtl_ssa(current.source(1));
                let op = match current.source(1).ty() {
                    Type::Integer8 => RtlOp::Store8,
                    Type::Integer16 => RtlOp::Store16,
                    Type::Integer32 | Type::Float32 => RtlOp::Store32,
                    Type::Integer64 | Type::Float64 => RtlOp::Store64,
                    ty => {
                        return Err(CompileError::UnsupportedType {
                            opcode: current.opcode(),
                            ty,
                        })
                    }
                };
                self.append(op, &[], &[R::any(address), R::any(value)]);
            }

            Opcode::LogicalShiftRight
            | Opcode::LogicalShiftLeft
            | Opcode::ArithmeticShiftRight
            | Opcode::RotateRight
            | Opcode::RotateLeft => {
                let result = self.make_rtl_ssa(current.result(0));
                let value = self.get_rtl_ssa(current.source(0));
                let bits = self.get_rtl_ssa(current.source(1));
                let ty = current.result(0).ty();
                let op = match current.opcode() {
                    Opcode::LogicalShiftRight => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::ShiftRight8,
                        RtlOp::ShiftRight16,
                        RtlOp::ShiftRight32,
                        RtlOp::ShiftRight64,
                    )?,
                    Opcode::LogicalShiftLeft => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::ShiftLeft8,
                        RtlOp::ShiftLeft16,
                        RtlOp::ShiftLeft32,
                        RtlOp::ShiftLeft64,
                    )?,
                    Opcode::ArithmeticShiftRight => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::ArithmeticShiftRight8,
                        RtlOp::ArithmeticShiftRight16,
                        RtlOp::ArithmeticShiftRight32,
                        RtlOp::ArithmeticShiftRight64,
                    )?,
                    Opcode::RotateRight => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::RotateRight8,
                        RtlOp::RotateRight16,
                        RtlOp::RotateRight32,
                        RtlOp::RotateRight64,
                    )?,
                    Opcode::RotateLeft => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::RotateLeft8,
                        RtlOp::RotateLeft16,
                        RtlOp::RotateLeft32,
                        RtlOp::RotateLeft64,
                    )?,
                    _ => unreachable!(),
                };
                self.append(op, &[R::any(result)], &[R::any(value), R::any(bits)]);
            }

            Opcode::And | Opcode::Or | Opcode::ExclusiveOr => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let ty = current.result(0).ty();
                let op = match (current.opcode(), ty) {
                    (Opcode::And, Type::Bool) => RtlOp::AndBool,
                    (Opcode::Or, Type::Bool) => RtlOp::OrBool,
                    (Opcode::ExclusiveOr, Type::Bool) => RtlOp::XorBool,
                    (Opcode::And, ty) => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::And8,
                        RtlOp::And16,
                        RtlOp::And32,
                        RtlOp::And64,
                    )?,
                    (Opcode::Or, ty) => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::Or8,
                        RtlOp::Or16,
                        RtlOp::Or32,
                        RtlOp::Or64,
                    )?,
                    (Opcode::ExclusiveOr, ty) => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::Xor8,
                        RtlOp::Xor16,
                        RtlOp::Xor32,
                        RtlOp::Xor64,
                    )?,
                    _ => unreachable!(),
                };
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::Not => {
                let result = self.make_rtl_ssa(current.result(0));
                let source = self.get_rtl_ssa(current.source(0));
                let ty = current.result(0).ty();
                let op = if ty == Type::Bool {
                    RtlOp::NotBool
                } else {
                    by_width(
                        current.opcode(),
                        ty,
                        RtlOp::Not8,
                        RtlOp::Not16,
                        RtlOp::Not32,
                        RtlOp::Not64,
                    )?
                };
                self.append(op, &[R::any(result)], &[R::any(source)]);
            }

            Opcode::BitSetClear => {
                // The bit position is baked into the instruction's data
                // slot; dynamic positions have no RTL encoding.
                if !current.source(2).is_constant() {
                    return Err(CompileError::UnsupportedOpcode(current.opcode()));
                }
                let result = self.make_rtl_ssa(current.result(0));
                let value = self.get_rtl_ssa(current.source(0));
                let control = self.get_rtl_ssa(current.source(1));
                let position = current.source(2).zero_extended() as u8;
                let op = by_width(
                    current.opcode(),
                    current.result(0).ty(),
                    RtlOp::BitSetClear8,
                    RtlOp::BitSetClear16,
                    RtlOp::BitSetClear32,
                    RtlOp::BitSetClear64,
                )?;
                self.append_with_data(
                    op,
                    Value::from_u8(position),
                    &[R::any(result)],
                    &[R::any(value), R::any(control)],
                );
            }

            Opcode::Add => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let op = match current.result(0).ty() {
                    Type::Float32 => RtlOp::AddFloat32,
                    Type::Float64 => RtlOp::AddFloat64,
                    // Narrow additions share the 64-bit opcode; consumers
                    // only observe the low bits of the operand width.
                    ty if ir::is_integer_type(ty) => RtlOp::AddInteger,
                    ty => {
                        return Err(CompileError::UnsupportedType {
                            opcode: current.opcode(),
                            ty,
                        })
                    }
                };
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::Subtract => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let op = match current.result(0).ty() {
                    Type::Float32 => RtlOp::SubFloat32,
                    Type::Float64 => RtlOp::SubFloat64,
                    ty => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::SubInteger8,
                        RtlOp::SubInteger16,
                        RtlOp::SubInteger32,
                        RtlOp::SubInteger64,
                    )?,
                };
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::Multiply => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let op = match current.result(0).ty() {
                    Type::Float32 => RtlOp::MultiplyF32,
                    Type::Float64 => RtlOp::MultiplyF64,
                    ty => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::MultiplyI8,
                        RtlOp::MultiplyI16,
                        RtlOp::MultiplyI32,
                        RtlOp::MultiplyI64,
                    )?,
                };
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::MultiplyUnsigned => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let op = by_width(
                    current.opcode(),
                    current.result(0).ty(),
                    RtlOp::MultiplyU8,
                    RtlOp::MultiplyU16,
                    RtlOp::MultiplyU32,
                    RtlOp::MultiplyU64,
                )?;
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::Divide => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let op = match current.result(0).ty() {
                    Type::Float32 => RtlOp::DivideF32,
                    Type::Float64 => RtlOp::DivideF64,
                    ty => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::DivideI8,
                        RtlOp::DivideI16,
                        RtlOp::DivideI32,
                        RtlOp::DivideI64,
                    )?,
                };
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::DivideUnsigned => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let op = by_width(
                    current.opcode(),
                    current.result(0).ty(),
                    RtlOp::DivideU8,
                    RtlOp::DivideU16,
                    RtlOp::DivideU32,
                    RtlOp::DivideU64,
                )?;
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::Modulus => {
                // No remainder opcode in RTL; expand to a - (a / b) * b.
                let ty = current.result(0).ty();
                let divide = by_width(
                    current.opcode(),
                    ty,
                    RtlOp::DivideI8,
                    RtlOp::DivideI16,
                    RtlOp::DivideI32,
                    RtlOp::DivideI64,
                )?;
                let multiply = by_width(
                    current.opcode(),
                    ty,
                    RtlOp::MultiplyI8,
                    RtlOp::MultiplyI16,
                    RtlOp::MultiplyI32,
                    RtlOp::MultiplyI64,
                )?;
                let subtract = by_width(
                    current.opcode(),
                    ty,
                    RtlOp::SubInteger8,
                    RtlOp::SubInteger16,
                    RtlOp::SubInteger32,
                    RtlOp::SubInteger64,
                )?;

                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let class = (self.classify)(ty);
                let quotient = self.rtl.ssa_allocate(class);
                let product = self.rtl.ssa_allocate(class);
                let result = self.make_rtl_ssa(current.result(0));

                self.append(divide, &[R::any(quotient)], &[R::any(a), R::any(b)]);
                self.append(multiply, &[R::any(product)], &[R::any(quotient), R::any(b)]);
                self.append(subtract, &[R::any(result)], &[R::any(a), R::any(product)]);
            }

            Opcode::SquareRoot => {
                let result = self.make_rtl_ssa(current.result(0));
                let source = self.get_rtl_ssa(current.source(0));
                let op = match current.result(0).ty() {
                    Type::Float32 => RtlOp::SquareRootF32,
                    Type::Float64 => RtlOp::SquareRootF64,
                    ty => {
                        return Err(CompileError::UnsupportedType {
                            opcode: current.opcode(),
                            ty,
                        })
                    }
                };
                self.append(op, &[R::any(result)], &[R::any(source)]);
            }

            Opcode::Extend16 | Opcode::Extend32 | Opcode::Extend64 => {
                let result = self.make_rtl_ssa(current.result(0));
                let source = self.get_rtl_ssa(current.source(0));
                let op = match (current.opcode(), current.source(0).ty()) {
                    (Opcode::Extend16, Type::Integer8) => RtlOp::Extend8to16,
                    (Opcode::Extend32, Type::Integer8) => RtlOp::Extend8to32,
                    (Opcode::Extend32, Type::Integer16) => RtlOp::Extend16to32,
                    (Opcode::Extend64, Type::Integer8) => RtlOp::Extend8to64,
                    (Opcode::Extend64, Type::Integer16) => RtlOp::Extend16to64,
                    (Opcode::Extend64, Type::Integer32) => RtlOp::Extend32to64,
                    (opcode, ty) => return Err(CompileError::UnsupportedType { opcode, ty }),
                };
                self.append(op, &[R::any(result)], &[R::any(source)]);
            }

            Opcode::BitCast => {
                let result = self.make_rtl_ssa(current.result(0));
                let source = self.get_rtl_ssa(current.source(0));
                let op = match ir::type_bytes(current.ty()) {
                    1 => RtlOp::Cast8,
                    2 => RtlOp::Cast16,
                    4 => RtlOp::Cast32,
                    _ => RtlOp::Cast64,
                };
                self.append(op, &[R::any(result)], &[R::any(source)]);
            }

            Opcode::CastFloatInt => {
                let result = self.make_rtl_ssa(current.result(0));
                let source = self.get_rtl_ssa(current.source(0));
                let op = match (current.source(0).ty(), current.ty()) {
                    (Type::Float32, Type::Integer32) => RtlOp::CastF32toI32,
                    (Type::Float64, Type::Integer32) => RtlOp::CastF64toI32,
                    (Type::Float32, Type::Integer64) => RtlOp::CastF32toI64,
                    (Type::Float64, Type::Integer64) => RtlOp::CastF64toI64,
                    (_, ty) => {
                        return Err(CompileError::UnsupportedType {
                            opcode: current.opcode(),
                            ty,
                        })
                    }
                };
                self.append(op, &[R::any(result)], &[R::any(source)]);
            }

            Opcode::CastIntFloat => {
                let result = self.make_rtl_ssa(current.result(0));
                let source = self.get_rtl_ssa(current.source(0));
                let op = match (current.source(0).ty(), current.ty()) {
                    (Type::Integer32, Type::Float32) => RtlOp::CastI32toF32,
                    (Type::Integer32, Type::Float64) => RtlOp::CastI32toF64,
                    (Type::Integer64, Type::Float32) => RtlOp::CastI64toF32,
                    (Type::Integer64, Type::Float64) => RtlOp::CastI64toF64,
                    (ty, _) => {
                        return Err(CompileError::UnsupportedType {
                            opcode: current.opcode(),
                            ty,
                        })
                    }
                };
                self.append(op, &[R::any(result)], &[R::any(source)]);
            }

            Opcode::ResizeFloat => {
                let result = self.make_rtl_ssa(current.result(0));
                let source = self.get_rtl_ssa(current.source(0));
                let op = match (current.source(0).ty(), current.ty()) {
                    (Type::Float32, Type::Float64) => RtlOp::Float32to64,
                    (Type::Float64, Type::Float32) => RtlOp::Float64to32,
                    (ty, _) => {
                        return Err(CompileError::UnsupportedType {
                            opcode: current.opcode(),
                            ty,
                        })
                    }
                };
                self.append(op, &[R::any(result)], &[R::any(source)]);
            }

            Opcode::Test => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let op = by_width(
                    current.opcode(),
                    current.source(0).ty(),
                    RtlOp::Test8,
                    RtlOp::Test16,
                    RtlOp::Test32,
                    RtlOp::Test64,
                )?;
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::CompareEq => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let op = match current.source(0).ty() {
                    Type::Float32 => RtlOp::CompareEqF32,
                    Type::Float64 => RtlOp::CompareEqF64,
                    Type::Bool => RtlOp::CompareEqBool,
                    ty => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::CompareEq8,
                        RtlOp::CompareEq16,
                        RtlOp::CompareEq32,
                        RtlOp::CompareEq64,
                    )?,
                };
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::CompareLt | Opcode::CompareLte => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let lt = current.opcode() == Opcode::CompareLt;
                let op = match current.source(0).ty() {
                    Type::Float32 => {
                        if lt {
                            RtlOp::CompareLtF32
                        } else {
                            RtlOp::CompareLteF32
                        }
                    }
                    Type::Float64 => {
                        if lt {
                            RtlOp::CompareLtF64
                        } else {
                            RtlOp::CompareLteF64
                        }
                    }
                    ty if lt => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::CompareLtI8,
                        RtlOp::CompareLtI16,
                        RtlOp::CompareLtI32,
                        RtlOp::CompareLtI64,
                    )?,
                    ty => by_width(
                        current.opcode(),
                        ty,
                        RtlOp::CompareLteI8,
                        RtlOp::CompareLteI16,
                        RtlOp::CompareLteI32,
                        RtlOp::CompareLteI64,
                    )?,
                };
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::CompareUlt | Opcode::CompareUlte => {
                let result = self.make_rtl_ssa(current.result(0));
                let a = self.get_rtl_ssa(current.source(0));
                let b = self.get_rtl_ssa(current.source(1));
                let op = if current.opcode() == Opcode::CompareUlt {
                    by_width(
                        current.opcode(),
                        current.source(0).ty(),
                        RtlOp::CompareLtU8,
                        RtlOp::CompareLtU16,
                        RtlOp::CompareLtU32,
                        RtlOp::CompareLtU64,
                    )?
                } else {
                    by_width(
                        current.opcode(),
                        current.source(0).ty(),
                        RtlOp::CompareLteU8,
                        RtlOp::CompareLteU16,
                        RtlOp::CompareLteU32,
                        RtlOp::CompareLteU64,
                    )?
                };
                self.append(op, &[R::any(result)], &[R::any(a), R::any(b)]);
            }

            Opcode::Select => {
                let result = self.make_rtl_ssa(current.result(0));
                let decision = self.get_rtl_ssa(current.source(0));
                let if_false = self.get_rtl_ssa(current.source(1));
                let if_true = self.get_rtl_ssa(current.source(2));
                self.append(
                    RtlOp::Select,
                    &[R::any(result)],
                    &[R::any(decision), R::any(if_false), R::any(if_true)],
                );
            }

            Opcode::Exit => {
                assert!(current.source(1).is_constant());
                assert_eq!(current.source(1).ty(), Type::Integer64);
                let code = current.source(1).value();

                if current.source(0).is_constant() {
                    if current.source(0).value().bool() {
                        self.append_with_data(RtlOp::Exit, code, &[], &[]);
                    }
                    // A never-taken exit lowers to nothing.
                } else {
                    let decision = self.get_rtl_ssa(current.source(0));
                    self.append_with_data(RtlOp::ExitIf, code, &[], &[R::any(decision)]);
                }
            }

            Opcode::Call => {
                let function = self.get_rtl_ssa(current.source(0));
                let pin = |ssa, constraint: Option<u8>| match constraint {
                    Some(register) => R::pin(ssa, register),
                    None => R::any(ssa),
                };

                if current.result_count() == 0 {
                    self.append(RtlOp::HostVoidCall0, &[], &[R::any(function)]);
                } else {
                    let result = self.make_rtl_ssa(current.result(0));
                    let result = pin(result, convention.ret);
                    match current.source_count() {
                        1 => self.append(RtlOp::HostCall0, &[result], &[R::any(function)]),
                        2 => {
                            let arg1 = self.get_rtl_ssa(current.source(1));
                            self.append(
                                RtlOp::HostCall1,
                                &[result],
                                &[R::any(function), pin(arg1, convention.arg1)],
                            );
                        }
                        3 => {
                            let arg1 = self.get_rtl_ssa(current.source(1));
                            let arg2 = self.get_rtl_ssa(current.source(2));
                            self.append(
                                RtlOp::HostCall2,
                                &[result],
                                &[
                                    R::any(function),
                                    pin(arg1, convention.arg1),
                                    pin(arg2, convention.arg2),
                                ],
                            );
                        }
                        _ => return Err(CompileError::UnsupportedOpcode(current.opcode())),
                    }
                }
            }

            // The translator is single-exit today; label branches have no
            // RTL representation yet.
            Opcode::Branch | Opcode::IfBranch => {
                return Err(CompileError::UnsupportedOpcode(current.opcode()))
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Assembler;

    fn single_class(_: Type) -> RegClass {
        RegClass::GENERAL
    }

    #[test]
    fn constants_materialize_with_matching_width() {
        let mut asm = Assembler::new();
        let sum = asm.add(Operand::constant(1u16), Operand::constant(2u16));
        asm.writegr(Operand::constant(0u16), sum);

        let lowered = lower(
            &asm.export_unit(),
            &CallingConvention::UNCONSTRAINED,
            single_class,
        )
        .unwrap();
        let ops: Vec<RtlOp> = lowered.rtl.block(0).iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                RtlOp::Constant16,
                RtlOp::Constant16,
                RtlOp::AddInteger,
                RtlOp::WriteRegister16,
            ]
        );
        assert!(!lowered.uses_memory);
    }

    #[test]
    fn unsigned_divide_lowers_to_divide_opcodes() {
        let mut asm = Assembler::new();
        let a = asm.readgr(Type::Integer32, Operand::constant(0u16));
        let b = asm.readgr(Type::Integer32, Operand::constant(1u16));
        let q = asm.udiv(a, b);
        asm.writegr(Operand::constant(2u16), q);

        let lowered = lower(
            &asm.export_unit(),
            &CallingConvention::UNCONSTRAINED,
            single_class,
        )
        .unwrap();
        assert!(lowered.rtl.block(0).iter().any(|i| i.op == RtlOp::DivideU32));
        assert!(!lowered.rtl.block(0).iter().any(|i| i.op == RtlOp::MultiplyU32));
    }

    #[test]
    fn never_taken_exit_is_dropped() {
        let mut asm = Assembler::new();
        asm.exit(Operand::constant(false), Operand::constant(0u64));
        asm.exit(Operand::constant(true), Operand::constant(7u64));

        let lowered = lower(
            &asm.export_unit(),
            &CallingConvention::UNCONSTRAINED,
            single_class,
        )
        .unwrap();
        let ops: Vec<RtlOp> = lowered.rtl.block(0).iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![RtlOp::Exit]);
        assert_eq!(lowered.rtl.block(0).iter().next().unwrap().data().u64(), 7);
    }

    #[test]
    fn host_call_arguments_take_convention_pins() {
        extern "C" fn callee(
            _: *mut crate::guest::GuestHandle,
            a: crate::value::Value,
        ) -> crate::value::Value {
            a
        }

        let mut asm = Assembler::new();
        let result = asm.call1(Type::Integer64, callee, Operand::constant(5u64));
        asm.writegr(Operand::constant(0u16), result);

        let convention = CallingConvention {
            arg1: Some(6),
            arg2: Some(2),
            ret: Some(0),
        };
        let lowered = lower(&asm.export_unit(), &convention, single_class).unwrap();
        let call = lowered
            .rtl
            .block(0)
            .iter()
            .find(|i| i.op == RtlOp::HostCall1)
            .unwrap();
        assert_eq!(call.source(1).pinned, Some(6));
        assert_eq!(call.result(0).pinned, Some(0));
    }
}
