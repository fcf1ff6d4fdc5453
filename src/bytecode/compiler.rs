//! IR to bytecode compilation.

use std::sync::Arc;

use crate::bytecode::opcode::{Encoder, ALLOCATABLE_REGISTERS, SCRATCH_BASE};
use crate::bytecode::routine::Routine;
use crate::error::CompileError;
use crate::ir::ExecutionUnit;
use crate::jit;
use crate::jit::allocator::{LinearAllocator, RegisterSet};
use crate::jit::lower::{lower, CallingConvention};
use crate::jit::rtl::{RegClass, RtlOp, RtlProgram};

/// Compiles execution units into interpretable bytecode routines.
///
/// The pipeline is the standard one: shared RTL lowering, linear-scan
/// allocation over the 13 allocatable bytecode registers, then byte-stream
/// encoding. Bytecode instructions cannot address spill storage directly;
/// spilled operands are staged through the scratch registers 13/14/15 with
/// `LoadSpill`/`StoreSpill`.
#[derive(Debug, Default)]
pub struct Compiler;

impl Compiler {
    /// New compiler.
    pub fn new() -> Self {
        Self
    }

    /// Compile a unit into a bytecode routine.
    pub fn compile(
        &mut self,
        source: ExecutionUnit,
    ) -> Result<Arc<dyn jit::Routine>, CompileError> {
        let lowered = lower(&source, &CallingConvention::UNCONSTRAINED, |_| {
            RegClass::GENERAL
        })?;

        let mut allocator = LinearAllocator::new();
        allocator.define_register_type(RegisterSet::from_count(
            RegClass::GENERAL,
            ALLOCATABLE_REGISTERS,
        ));
        let rtl = allocator.execute(lowered.rtl)?;

        let code = assemble(&rtl)?;
        tracing::trace!(
            instructions = source.instructions().len(),
            bytes = code.len(),
            spill = rtl.spill_size(),
            "bytecode routine assembled"
        );

        Ok(Arc::new(Routine::new(code, rtl.spill_slots())))
    }
}

fn assemble(rtl: &RtlProgram) -> Result<Vec<u8>, CompileError> {
    use RtlOp::*;

    let mut encoder = Encoder::new();

    for instruction in rtl.block(0) {
        if instruction.op.is_generic() {
            match instruction.op {
                RtlOp::None => continue,
                // The unconstrained convention never produces moves.
                RtlOp::Move => unreachable!("bytecode RTL carries no register constraints"),
                op => return Err(CompileError::UnsupportedRtlOpcode(op as u16)),
            }
        }

        // Stage spilled sources through the scratch registers.
        let mut sources = [0u8; 3];
        for i in 0..instruction.source_count() {
            let hw = instruction.source(i).hw;
            if hw.is_spill() {
                let scratch = SCRATCH_BASE + i as u8;
                encoder.r1c2(LoadSpill, hw.spill_index(), scratch);
                sources[i] = scratch;
            } else {
                sources[i] = hw.index();
            }
        }

        // A spilled result lands in scratch first and is stored after.
        let mut result = 0u8;
        let mut result_spill = Option::None;
        if instruction.result_count() == 1 {
            let hw = instruction.result(0).hw;
            if hw.is_spill() {
                result = SCRATCH_BASE;
                result_spill = Some(hw.spill_index());
            } else {
                result = hw.index();
            }
        }

        let op = instruction.op;
        match op {
            Exit => encoder.r0c3(op, instruction.data().u32()),

            Constant8 | ExtendConstant8 => {
                encoder.r1c0(op, result);
                encoder.immediate(&[instruction.data().u8()]);
            }
            Constant16 | ExtendConstant16 => {
                encoder.r1c0(op, result);
                encoder.immediate(&instruction.data().u16().to_le_bytes());
            }
            Constant32 | ExtendConstant32 => {
                encoder.r1c0(op, result);
                encoder.immediate(&instruction.data().u32().to_le_bytes());
            }
            Constant64 => {
                encoder.r1c0(op, result);
                encoder.immediate(&instruction.data().u64().to_le_bytes());
            }

            ReadRegister8 | ReadRegister16 | ReadRegister32 | ReadRegister64 => {
                encoder.r1c2(op, instruction.data().u16(), result);
            }

            ExitIf => encoder.r1c2(op, instruction.data().u16(), sources[0]),

            WriteRegister8 | WriteRegister16 | WriteRegister32 | WriteRegister64 => {
                encoder.r1c2(op, instruction.data().u16(), sources[0]);
            }

            Load8 | Load16 | Load32 | Load64 => encoder.r2c0(op, result, sources[0]),

            Store8 | Store16 | Store32 | Store64 => encoder.r2c0(op, sources[0], sources[1]),

            Not8 | Not16 | Not32 | Not64 | NotBool | SquareRootF32 | SquareRootF64
            | Extend8to16 | Extend8to32 | Extend8to64 | Extend16to32 | Extend16to64
            | Extend32to64 | Float32to64 | Float64to32 | Cast8 | Cast16 | Cast32 | Cast64
            | CastF32toI32 | CastF64toI32 | CastF32toI64 | CastF64toI64 | CastI32toF32
            | CastI32toF64 | CastI64toF32 | CastI64toF64 => {
                encoder.r2c0(op, result, sources[0]);
            }

            RotateRight8 | RotateRight16 | RotateRight32 | RotateRight64 | RotateLeft8
            | RotateLeft16 | RotateLeft32 | RotateLeft64 | ShiftRight8 | ShiftRight16
            | ShiftRight32 | ShiftRight64 | ShiftLeft8 | ShiftLeft16 | ShiftLeft32
            | ShiftLeft64 | ArithmeticShiftRight8 | ArithmeticShiftRight16
            | ArithmeticShiftRight32 | ArithmeticShiftRight64 | And8 | And16 | And32 | And64
            | AndBool | Or8 | Or16 | Or32 | Or64 | OrBool | Xor8 | Xor16 | Xor32 | Xor64
            | XorBool | AddInteger | AddFloat32 | AddFloat64 | SubInteger8 | SubInteger16
            | SubInteger32 | SubInteger64 | SubFloat32 | SubFloat64 | MultiplyI8 | MultiplyI16
            | MultiplyI32 | MultiplyI64 | MultiplyU8 | MultiplyU16 | MultiplyU32 | MultiplyU64
            | MultiplyF32 | MultiplyF64 | DivideI8 | DivideI16 | DivideI32 | DivideI64
            | DivideU8 | DivideU16 | DivideU32 | DivideU64 | DivideF32 | DivideF64 | Test8
            | Test16 | Test32 | Test64 | CompareEq8 | CompareEq16 | CompareEq32 | CompareEq64
            | CompareEqF32 | CompareEqF64 | CompareEqBool | CompareLtI8 | CompareLtI16
            | CompareLtI32 | CompareLtI64 | CompareLtU8 | CompareLtU16 | CompareLtU32
            | CompareLtU64 | CompareLtF32 | CompareLtF64 | CompareLteI8 | CompareLteI16
            | CompareLteI32 | CompareLteI64 | CompareLteU8 | CompareLteU16 | CompareLteU32
            | CompareLteU64 | CompareLteF32 | CompareLteF64 => {
                encoder.r3c0(op, result, sources[0], sources[1]);
            }

            BitSetClear8 | BitSetClear16 | BitSetClear32 | BitSetClear64 => {
                encoder.r3c1(op, instruction.data().u8(), result, sources[0], sources[1]);
            }

            Select => encoder.r4c0(op, result, sources[0], sources[1], sources[2]),

            HostVoidCall0 => encoder.r1c0(op, sources[0]),
            HostCall0 => encoder.r2c0(op, result, sources[0]),
            HostCall1 => encoder.r3c0(op, result, sources[0], sources[1]),
            HostCall2 => encoder.r4c0(op, result, sources[0], sources[1], sources[2]),

            // Spill staging is generated here, never by the lowering.
            LoadSpill | StoreSpill => unreachable!("spill opcodes appear only during encoding"),

            op => return Err(CompileError::UnsupportedRtlOpcode(op as u16)),
        }

        if let Some(slot) = result_spill {
            encoder.r1c2(StoreSpill, slot, result);
        }
    }

    Ok(encoder.finish())
}
