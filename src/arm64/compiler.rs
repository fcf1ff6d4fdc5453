//! RTL to AArch64 code generation.
//!
//! Register conventions for every compiled block (AAPCS callee-saved, so
//! host calls cannot clobber them):
//!
//! * `x19` — `GuestHandle` pointer, forwarded in `x0` for host calls.
//! * `x20` — guest register block base.
//! * `x21` — guest memory base (fastmem loads index off it).
//! * `x22` — spill region base; slot `k` lives at `[x22 + 8k]`.
//! * `x9`-`x13` — scratch, clobbered freely between RTL instructions.
//! * `v16`-`v18` — FP scratch for spill staging.
//!
//! Allocatable pools: `x23`-`x28` and `v8`-`v15` (callee-saved low halves).
//! Host-call arguments pin to `x1`/`x2` and results to `x0`.

use std::sync::Arc;

use crate::arm64::assembler::{Assembler, Cond, Label, Reg, VReg};
use crate::arm64::routine::Routine;
use crate::error::CompileError;
use crate::guest::{load_trampoline_for, store_trampoline_for};
use crate::ir::{ExecutionUnit, Type};
use crate::jit;
use crate::jit::allocator::{LinearAllocator, RegisterSet};
use crate::jit::lower::{lower, CallingConvention};
use crate::jit::routine::ExecBuffer;
use crate::jit::rtl::{HwRegister, RegClass, RegisterAssignment, RtlInstruction, RtlOp, RtlProgram};

/// Guest pointer register.
pub const GPR_GUEST: Reg = Reg(19);
/// Guest register block base.
pub const GPR_GUEST_REGISTERS: Reg = Reg(20);
/// Guest memory base.
pub const GPR_GUEST_MEMORY: Reg = Reg(21);
/// Spill region base.
pub const GPR_SPILL: Reg = Reg(22);

const SCRATCH0: Reg = Reg(9);
const SCRATCH1: Reg = Reg(10);
const SCRATCH2: Reg = Reg(11);
const SCRATCH3: Reg = Reg(12);
const SCRATCH_DST: Reg = Reg(13);

const VSCRATCH0: VReg = VReg(16);
const VSCRATCH1: VReg = VReg(17);
const VSCRATCH_DST: VReg = VReg(18);

const CONVENTION: CallingConvention = CallingConvention {
    arg1: Some(1),
    arg2: Some(2),
    ret: Some(0),
};

const GPR_POOL: [u8; 6] = [23, 24, 25, 26, 27, 28];
const VEC_POOL: [u8; 8] = [8, 9, 10, 11, 12, 13, 14, 15];

/// Maps a guest register index to its byte offset inside the guest
/// register block.
pub type RegisterAddressCb = dyn Fn(u32) -> u32 + Send + Sync;

fn classify(ty: Type) -> RegClass {
    match ty {
        Type::Float32 | Type::Float64 => RegClass::VECTOR,
        _ => RegClass::GENERAL,
    }
}

/// IR to AArch64 compiler.
pub struct Compiler {
    register_address_cb: Option<Box<RegisterAddressCb>>,
    use_fastmem: bool,
}

impl Default for Compiler {
    fn default() -> Self {
        Self {
            register_address_cb: None,
            use_fastmem: true,
        }
    }
}

impl Compiler {
    /// New compiler with fastmem loads enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the guest register addressing callback.
    pub fn set_register_address_cb(
        &mut self,
        callback: impl Fn(u32) -> u32 + Send + Sync + 'static,
    ) {
        self.register_address_cb = Some(Box::new(callback));
    }

    /// Select between direct-mapped loads and host-call loads.
    pub fn set_use_fastmem(&mut self, use_fastmem: bool) {
        self.use_fastmem = use_fastmem;
    }

    /// Compile a unit into a native routine.
    pub fn compile(&self, source: ExecutionUnit) -> Result<Arc<dyn jit::Routine>, CompileError> {
        let lowered = lower(&source, &CONVENTION, classify)?;

        let mut allocator = LinearAllocator::new();
        allocator.define_register_type(RegisterSet::new(RegClass::GENERAL, &GPR_POOL));
        allocator.define_register_type(RegisterSet::new(RegClass::VECTOR, &VEC_POOL));
        let rtl = allocator.execute(lowered.rtl)?;

        let mut emitter = Emitter {
            asm: Assembler::new(),
            register_address_cb: self.register_address_cb.as_deref(),
            use_fastmem: self.use_fastmem,
            epilogue: None,
            frame: (rtl.spill_size() + 15) & !15,
        };
        let code = emitter.assemble(&rtl)?;

        tracing::trace!(
            instructions = source.instructions().len(),
            bytes = code.len(),
            spill = rtl.spill_size(),
            "arm64 routine assembled"
        );

        let buffer = ExecBuffer::new(&code).map_err(CompileError::Buffer)?;
        Ok(Arc::new(Routine::new(buffer)))
    }
}

struct GprDst {
    reg: Reg,
    spill: Option<u16>,
}

struct VecDst {
    reg: VReg,
    spill: Option<u16>,
}

struct Emitter<'a> {
    asm: Assembler,
    register_address_cb: Option<&'a RegisterAddressCb>,
    use_fastmem: bool,
    epilogue: Option<Label>,
    frame: u32,
}

impl<'a> Emitter<'a> {
    fn assemble(&mut self, rtl: &RtlProgram) -> Result<Vec<u8>, CompileError> {
        let epilogue = self.asm.allocate_label();
        self.epilogue = Some(epilogue);

        // Prologue: save the callee-saved state we occupy, carve the spill
        // frame, pin the bases. AAPCS hands us (guest, memory_base,
        // register_base) in x0/x1/x2.
        self.asm.stp_pre(Reg(29), Reg(30));
        self.asm.stp_pre(Reg(19), Reg(20));
        self.asm.stp_pre(Reg(21), Reg(22));
        self.asm.stp_pre(Reg(23), Reg(24));
        self.asm.stp_pre(Reg(25), Reg(26));
        self.asm.stp_pre(Reg(27), Reg(28));
        self.asm.stp_fp_pre(VReg(8), VReg(9));
        self.asm.stp_fp_pre(VReg(10), VReg(11));
        self.asm.stp_fp_pre(VReg(12), VReg(13));
        self.asm.stp_fp_pre(VReg(14), VReg(15));
        if self.frame > 0 {
            self.asm.sub_sp(self.frame);
        }
        self.asm.mov_sp(GPR_SPILL, Reg(31));
        self.asm.mov_xx(GPR_GUEST, Reg(0));
        self.asm.mov_xx(GPR_GUEST_MEMORY, Reg(1));
        self.asm.mov_xx(GPR_GUEST_REGISTERS, Reg(2));

        for instruction in rtl.block(0) {
            self.emit(instruction)?;
        }

        // Fall-through return code 0.
        self.asm.load_imm64(Reg(0), 0);
        self.asm.bind(epilogue);
        if self.frame > 0 {
            self.asm.add_sp(self.frame);
        }
        self.asm.ldp_fp_post(VReg(14), VReg(15));
        self.asm.ldp_fp_post(VReg(12), VReg(13));
        self.asm.ldp_fp_post(VReg(10), VReg(11));
        self.asm.ldp_fp_post(VReg(8), VReg(9));
        self.asm.ldp_post(Reg(27), Reg(28));
        self.asm.ldp_post(Reg(25), Reg(26));
        self.asm.ldp_post(Reg(23), Reg(24));
        self.asm.ldp_post(Reg(21), Reg(22));
        self.asm.ldp_post(Reg(19), Reg(20));
        self.asm.ldp_post(Reg(29), Reg(30));
        self.asm.ret();

        Ok(std::mem::take(&mut self.asm).finalize())
    }

    fn src_gpr(&mut self, operand: &RegisterAssignment, scratch: Reg) -> Reg {
        match operand.hw {
            HwRegister::Register(index) => Reg(index),
            HwRegister::Spill(slot) => {
                self.asm.ldr_imm(8, scratch, GPR_SPILL, slot as u32 * 8);
                scratch
            }
            HwRegister::Unassigned => unreachable!("operand left unallocated"),
        }
    }

    fn src_vec(&mut self, operand: &RegisterAssignment, scratch: VReg) -> VReg {
        match operand.hw {
            HwRegister::Register(index) => VReg(index),
            HwRegister::Spill(slot) => {
                self.asm.ldr_fp_imm(8, scratch, GPR_SPILL, slot as u32 * 8);
                scratch
            }
            HwRegister::Unassigned => unreachable!("operand left unallocated"),
        }
    }

    fn dst_gpr(&self, operand: &RegisterAssignment) -> GprDst {
        match operand.hw {
            HwRegister::Register(index) => GprDst {
                reg: Reg(index),
                spill: None,
            },
            HwRegister::Spill(slot) => GprDst {
                reg: SCRATCH_DST,
                spill: Some(slot),
            },
            HwRegister::Unassigned => unreachable!("operand left unallocated"),
        }
    }

    fn finish_gpr(&mut self, dst: &GprDst) {
        if let Some(slot) = dst.spill {
            self.asm.str_imm(8, dst.reg, GPR_SPILL, slot as u32 * 8);
        }
    }

    fn dst_vec(&self, operand: &RegisterAssignment) -> VecDst {
        match operand.hw {
            HwRegister::Register(index) => VecDst {
                reg: VReg(index),
                spill: None,
            },
            HwRegister::Spill(slot) => VecDst {
                reg: VSCRATCH_DST,
                spill: Some(slot),
            },
            HwRegister::Unassigned => unreachable!("operand left unallocated"),
        }
    }

    fn finish_vec(&mut self, dst: &VecDst) {
        if let Some(slot) = dst.spill {
            self.asm.str_fp_imm(8, dst.reg, GPR_SPILL, slot as u32 * 8);
        }
    }

    fn register_offset(&self, index: u16) -> u32 {
        let callback = self
            .register_address_cb
            .expect("register address callback not registered");
        callback(index as u32)
    }

    /// Call a fixed helper: guest in x0, address in x1, optional value in
    /// x2, result in x0.
    fn emit_helper_call(&mut self, helper: u64) {
        self.asm.mov_xx(Reg(0), GPR_GUEST);
        self.asm.load_imm64(SCRATCH_DST, helper);
        self.asm.blr(SCRATCH_DST);
    }

    fn width_ones(bits: u32) -> u32 {
        match bits {
            8 => 3,
            16 => 4,
            32 => 5,
            _ => 6,
        }
    }

    fn emit(&mut self, instruction: &RtlInstruction) -> Result<(), CompileError> {
        use RtlOp::*;

        let op = instruction.op;
        match op {
            None => {}

            Move => self.emit_move(instruction),

            Constant8 | Constant16 | Constant32 | Constant64 | ExtendConstant8
            | ExtendConstant16 | ExtendConstant32 => {
                let bits = match op {
                    Constant8 => instruction.data().u8() as u64,
                    Constant16 => instruction.data().u16() as u64,
                    Constant32 => instruction.data().u32() as u64,
                    Constant64 => instruction.data().u64(),
                    ExtendConstant8 => instruction.data().u8() as i8 as i64 as u64,
                    ExtendConstant16 => instruction.data().u16() as i16 as i64 as u64,
                    _ => instruction.data().u32() as i32 as i64 as u64,
                };
                if instruction.result(0).ssa.class() == RegClass::VECTOR {
                    self.asm.load_imm64(SCRATCH0, bits);
                    let dst = self.dst_vec(instruction.result(0));
                    self.asm.fmov_vx(true, dst.reg, SCRATCH0);
                    self.finish_vec(&dst);
                } else {
                    let dst = self.dst_gpr(instruction.result(0));
                    self.asm.load_imm64(dst.reg, bits);
                    self.finish_gpr(&dst);
                }
            }

            ReadRegister8 | ReadRegister16 | ReadRegister32 | ReadRegister64 => {
                let bytes = match op {
                    ReadRegister8 => 1usize,
                    ReadRegister16 => 2,
                    ReadRegister32 => 4,
                    _ => 8,
                };
                let offset = self.register_offset(instruction.data().u16());
                if instruction.result(0).ssa.class() == RegClass::VECTOR {
                    let dst = self.dst_vec(instruction.result(0));
                    self.asm.ldr_fp_imm(bytes, dst.reg, GPR_GUEST_REGISTERS, offset);
                    self.finish_vec(&dst);
                } else {
                    let dst = self.dst_gpr(instruction.result(0));
                    self.asm.ldr_imm(bytes, dst.reg, GPR_GUEST_REGISTERS, offset);
                    self.finish_gpr(&dst);
                }
            }

            WriteRegister8 | WriteRegister16 | WriteRegister32 | WriteRegister64 => {
                let bytes = match op {
                    WriteRegister8 => 1usize,
                    WriteRegister16 => 2,
                    WriteRegister32 => 4,
                    _ => 8,
                };
                let offset = self.register_offset(instruction.data().u16());
                if instruction.source(0).ssa.class() == RegClass::VECTOR {
                    let value = self.src_vec(instruction.source(0), VSCRATCH0);
                    self.asm.str_fp_imm(bytes, value, GPR_GUEST_REGISTERS, offset);
                } else {
                    let value = self.src_gpr(instruction.source(0), SCRATCH0);
                    self.asm.str_imm(bytes, value, GPR_GUEST_REGISTERS, offset);
                }
            }

            Load8 | Load16 | Load32 | Load64 => {
                let bytes = match op {
                    Load8 => 1usize,
                    Load16 => 2,
                    Load32 => 4,
                    _ => 8,
                };
                let address = self.src_gpr(instruction.source(0), SCRATCH0);
                let vector = instruction.result(0).ssa.class() == RegClass::VECTOR;

                if self.use_fastmem {
                    if vector {
                        // Fault recovery patches general registers only.
                        self.asm
                            .ldr_reg_uxtw(bytes, SCRATCH1, GPR_GUEST_MEMORY, address);
                        let dst = self.dst_vec(instruction.result(0));
                        self.asm.fmov_vx(bytes == 8, dst.reg, SCRATCH1);
                        self.finish_vec(&dst);
                    } else {
                        let dst = self.dst_gpr(instruction.result(0));
                        self.asm
                            .ldr_reg_uxtw(bytes, dst.reg, GPR_GUEST_MEMORY, address);
                        self.finish_gpr(&dst);
                    }
                } else {
                    self.asm.mov_xx(Reg(1), address);
                    self.emit_helper_call(load_trampoline_for(bytes) as usize as u64);
                    if vector {
                        let dst = self.dst_vec(instruction.result(0));
                        self.asm.fmov_vx(bytes == 8, dst.reg, Reg(0));
                        self.finish_vec(&dst);
                    } else {
                        let dst = self.dst_gpr(instruction.result(0));
                        self.asm.mov_xx(dst.reg, Reg(0));
                        self.finish_gpr(&dst);
                    }
                }
            }

            Store8 | Store16 | Store32 | Store64 => {
                let bytes = match op {
                    Store8 => 1usize,
                    Store16 => 2,
                    Store32 => 4,
                    _ => 8,
                };
                let address = self.src_gpr(instruction.source(0), SCRATCH0);
                self.asm.mov_xx(Reg(1), address);
                if instruction.source(1).ssa.class() == RegClass::VECTOR {
                    let value = self.src_vec(instruction.source(1), VSCRATCH0);
                    self.asm.fmov_xv(true, Reg(2), value);
                } else {
                    let value = self.src_gpr(instruction.source(1), SCRATCH1);
                    self.asm.mov_xx(Reg(2), value);
                }
                self.emit_helper_call(store_trampoline_for(bytes) as usize as u64);
            }

            ShiftRight8 | ShiftRight16 | ShiftLeft8 | ShiftLeft16 | ArithmeticShiftRight8
            | ArithmeticShiftRight16 => {
                let bits = if matches!(op, ShiftRight8 | ShiftLeft8 | ArithmeticShiftRight8) {
                    8
                } else {
                    16
                };
                let value = self.src_gpr(instruction.source(0), SCRATCH0);
                let count = self.src_gpr(instruction.source(1), SCRATCH1);
                self.asm.and_mask(SCRATCH1, count, Self::width_ones(bits));
                let dst = self.dst_gpr(instruction.result(0));
                match op {
                    ShiftRight8 | ShiftRight16 => {
                        if bits == 8 {
                            self.asm.uxtb(SCRATCH2, value);
                        } else {
                            self.asm.uxth(SCRATCH2, value);
                        }
                        self.asm.lsrv_x(dst.reg, SCRATCH2, SCRATCH1);
                    }
                    ShiftLeft8 | ShiftLeft16 => {
                        self.asm.lslv_x(dst.reg, value, SCRATCH1);
                    }
                    _ => {
                        if bits == 8 {
                            self.asm.sxtb(SCRATCH2, value);
                        } else {
                            self.asm.sxth(SCRATCH2, value);
                        }
                        self.asm.asrv_x(dst.reg, SCRATCH2, SCRATCH1);
                    }
                }
                self.finish_gpr(&dst);
            }

            ShiftRight32 | ShiftRight64 | ShiftLeft32 | ShiftLeft64 | ArithmeticShiftRight32
            | ArithmeticShiftRight64 => {
                let value = self.src_gpr(instruction.source(0), SCRATCH0);
                let count = self.src_gpr(instruction.source(1), SCRATCH1);
                let dst = self.dst_gpr(instruction.result(0));
                // The variable shifts take the count modulo the register
                // size, which is exactly the operand-width masking the IR
                // semantics want.
                match op {
                    ShiftRight32 => self.asm.lsrv_w(dst.reg, value, count),
                    ShiftRight64 => self.asm.lsrv_x(dst.reg, value, count),
                    ShiftLeft32 => self.asm.lslv_w(dst.reg, value, count),
                    ShiftLeft64 => self.asm.lslv_x(dst.reg, value, count),
                    ArithmeticShiftRight32 => self.asm.asrv_w(dst.reg, value, count),
                    _ => self.asm.asrv_x(dst.reg, value, count),
                }
                self.finish_gpr(&dst);
            }

            RotateRight32 | RotateRight64 | RotateLeft32 | RotateLeft64 => {
                let value = self.src_gpr(instruction.source(0), SCRATCH0);
                let count = self.src_gpr(instruction.source(1), SCRATCH1);
                let dst = self.dst_gpr(instruction.result(0));
                let rotate_left = matches!(op, RotateLeft32 | RotateLeft64);
                let count = if rotate_left {
                    // rotl n == rotr (width - n); the hardware masks the
                    // negated count for us.
                    self.asm.neg(SCRATCH1, count);
                    SCRATCH1
                } else {
                    count
                };
                if matches!(op, RotateRight32 | RotateLeft32) {
                    self.asm.rorv_w(dst.reg, value, count);
                } else {
                    self.asm.rorv_x(dst.reg, value, count);
                }
                self.finish_gpr(&dst);
            }

            RotateRight8 | RotateRight16 | RotateLeft8 | RotateLeft16 => {
                let bits = if matches!(op, RotateRight8 | RotateLeft8) {
                    8u32
                } else {
                    16
                };
                let value = self.src_gpr(instruction.source(0), SCRATCH0);
                let count = self.src_gpr(instruction.source(1), SCRATCH1);

                // No narrow rotates in the ISA: mask the value and compose
                // the two shifts by hand.
                if bits == 8 {
                    self.asm.uxtb(SCRATCH2, value);
                } else {
                    self.asm.uxth(SCRATCH2, value);
                }
                self.asm.and_mask(SCRATCH1, count, Self::width_ones(bits));
                self.asm.load_imm64(SCRATCH3, bits as u64);
                self.asm.sub_xx(SCRATCH3, SCRATCH3, SCRATCH1);

                let dst = self.dst_gpr(instruction.result(0));
                if matches!(op, RotateRight8 | RotateRight16) {
                    self.asm.lsrv_x(SCRATCH1, SCRATCH2, SCRATCH1);
                    self.asm.lslv_x(SCRATCH3, SCRATCH2, SCRATCH3);
                } else {
                    self.asm.lslv_x(SCRATCH1, SCRATCH2, SCRATCH1);
                    self.asm.lsrv_x(SCRATCH3, SCRATCH2, SCRATCH3);
                }
                self.asm.orr_xx(dst.reg, SCRATCH1, SCRATCH3);
                self.finish_gpr(&dst);
            }

            And8 | And16 | And32 | And64 | AndBool | Or8 | Or16 | Or32 | Or64 | OrBool | Xor8
            | Xor16 | Xor32 | Xor64 | XorBool => {
                let a = self.src_gpr(instruction.source(0), SCRATCH0);
                let b = self.src_gpr(instruction.source(1), SCRATCH1);
                let dst = self.dst_gpr(instruction.result(0));
                match op {
                    And8 | And16 | And32 | And64 | AndBool => self.asm.and_xx(dst.reg, a, b),
                    Or8 | Or16 | Or32 | Or64 | OrBool => self.asm.orr_xx(dst.reg, a, b),
                    _ => self.asm.eor_xx(dst.reg, a, b),
                }
                self.finish_gpr(&dst);
            }

            Not8 | Not16 | Not32 | Not64 => {
                let source = self.src_gpr(instruction.source(0), SCRATCH0);
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.mvn(dst.reg, source);
                self.finish_gpr(&dst);
            }

            NotBool => {
                let source = self.src_gpr(instruction.source(0), SCRATCH0);
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.eor_low_bit(dst.reg, source);
                self.finish_gpr(&dst);
            }

            BitSetClear8 | BitSetClear16 | BitSetClear32 | BitSetClear64 => {
                let position = instruction.data().u8() as u32;
                let value = self.src_gpr(instruction.source(0), SCRATCH0);
                let control = self.src_gpr(instruction.source(1), SCRATCH1);
                let dst = self.dst_gpr(instruction.result(0));

                self.asm.load_imm64(SCRATCH3, !(1u64 << position));
                self.asm.and_xx(dst.reg, value, SCRATCH3);
                self.asm.and_mask(SCRATCH1, control, 1);
                if position > 0 {
                    self.asm.lsl_imm(SCRATCH1, SCRATCH1, position);
                }
                self.asm.orr_xx(dst.reg, dst.reg, SCRATCH1);
                self.finish_gpr(&dst);
            }

            AddInteger | SubInteger8 | SubInteger16 | SubInteger32 | SubInteger64 => {
                let a = self.src_gpr(instruction.source(0), SCRATCH0);
                let b = self.src_gpr(instruction.source(1), SCRATCH1);
                let dst = self.dst_gpr(instruction.result(0));
                if op == AddInteger {
                    self.asm.add_xx(dst.reg, a, b);
                } else {
                    // A 64-bit subtract has the right low bits for every
                    // narrower width.
                    self.asm.sub_xx(dst.reg, a, b);
                }
                self.finish_gpr(&dst);
            }

            MultiplyI8 | MultiplyI16 | MultiplyI32 | MultiplyI64 | MultiplyU8 | MultiplyU16
            | MultiplyU32 | MultiplyU64 => {
                let a = self.src_gpr(instruction.source(0), SCRATCH0);
                let b = self.src_gpr(instruction.source(1), SCRATCH1);
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.mul_xx(dst.reg, a, b);
                self.finish_gpr(&dst);
            }

            DivideI8 | DivideI16 | DivideI32 | DivideI64 | DivideU8 | DivideU16 | DivideU32
            | DivideU64 => {
                let signed = matches!(op, DivideI8 | DivideI16 | DivideI32 | DivideI64);
                let bits = match op {
                    DivideI8 | DivideU8 => 8u32,
                    DivideI16 | DivideU16 => 16,
                    DivideI32 | DivideU32 => 32,
                    _ => 64,
                };
                let a = self.src_gpr(instruction.source(0), SCRATCH0);
                let b = self.src_gpr(instruction.source(1), SCRATCH1);

                // Widen both operands so the 64-bit divide sees the right
                // signedness at every width.
                let (a, b) = match (signed, bits) {
                    (_, 64) => (a, b),
                    (true, 8) => {
                        self.asm.sxtb(SCRATCH2, a);
                        self.asm.sxtb(SCRATCH3, b);
                        (SCRATCH2, SCRATCH3)
                    }
                    (true, 16) => {
                        self.asm.sxth(SCRATCH2, a);
                        self.asm.sxth(SCRATCH3, b);
                        (SCRATCH2, SCRATCH3)
                    }
                    (true, _) => {
                        self.asm.sxtw(SCRATCH2, a);
                        self.asm.sxtw(SCRATCH3, b);
                        (SCRATCH2, SCRATCH3)
                    }
                    (false, 8) => {
                        self.asm.uxtb(SCRATCH2, a);
                        self.asm.uxtb(SCRATCH3, b);
                        (SCRATCH2, SCRATCH3)
                    }
                    (false, 16) => {
                        self.asm.uxth(SCRATCH2, a);
                        self.asm.uxth(SCRATCH3, b);
                        (SCRATCH2, SCRATCH3)
                    }
                    (false, _) => {
                        self.asm.mov_ww(SCRATCH2, a);
                        self.asm.mov_ww(SCRATCH3, b);
                        (SCRATCH2, SCRATCH3)
                    }
                };

                let dst = self.dst_gpr(instruction.result(0));
                if signed {
                    self.asm.sdiv_xx(dst.reg, a, b);
                } else {
                    self.asm.udiv_xx(dst.reg, a, b);
                }
                self.finish_gpr(&dst);
            }

            AddFloat32 | AddFloat64 | SubFloat32 | SubFloat64 | MultiplyF32 | MultiplyF64
            | DivideF32 | DivideF64 => {
                let double = matches!(op, AddFloat64 | SubFloat64 | MultiplyF64 | DivideF64);
                let a = self.src_vec(instruction.source(0), VSCRATCH0);
                let b = self.src_vec(instruction.source(1), VSCRATCH1);
                let dst = self.dst_vec(instruction.result(0));
                match op {
                    AddFloat32 | AddFloat64 => self.asm.fadd(double, dst.reg, a, b),
                    SubFloat32 | SubFloat64 => self.asm.fsub(double, dst.reg, a, b),
                    MultiplyF32 | MultiplyF64 => self.asm.fmul(double, dst.reg, a, b),
                    _ => self.asm.fdiv(double, dst.reg, a, b),
                }
                self.finish_vec(&dst);
            }

            SquareRootF32 | SquareRootF64 => {
                let double = op == SquareRootF64;
                let source = self.src_vec(instruction.source(0), VSCRATCH0);
                let dst = self.dst_vec(instruction.result(0));
                self.asm.fsqrt(double, dst.reg, source);
                self.finish_vec(&dst);
            }

            Extend8to16 | Extend8to32 | Extend8to64 | Extend16to32 | Extend16to64
            | Extend32to64 => {
                let source = self.src_gpr(instruction.source(0), SCRATCH0);
                let dst = self.dst_gpr(instruction.result(0));
                match op {
                    Extend8to16 | Extend8to32 | Extend8to64 => self.asm.sxtb(dst.reg, source),
                    Extend16to32 | Extend16to64 => self.asm.sxth(dst.reg, source),
                    _ => self.asm.sxtw(dst.reg, source),
                }
                self.finish_gpr(&dst);
            }

            Float32to64 | Float64to32 => {
                let source = self.src_vec(instruction.source(0), VSCRATCH0);
                let dst = self.dst_vec(instruction.result(0));
                self.asm.fcvt(op == Float32to64, dst.reg, source);
                self.finish_vec(&dst);
            }

            Cast8 | Cast16 | Cast32 | Cast64 => {
                let bytes = match op {
                    Cast8 => 1usize,
                    Cast16 => 2,
                    Cast32 => 4,
                    _ => 8,
                };
                let src_vector = instruction.source(0).ssa.class() == RegClass::VECTOR;
                let dst_vector = instruction.result(0).ssa.class() == RegClass::VECTOR;
                match (src_vector, dst_vector) {
                    (false, false) => {
                        let source = self.src_gpr(instruction.source(0), SCRATCH0);
                        let dst = self.dst_gpr(instruction.result(0));
                        match bytes {
                            1 => self.asm.uxtb(dst.reg, source),
                            2 => self.asm.uxth(dst.reg, source),
                            4 => self.asm.mov_ww(dst.reg, source),
                            _ => self.asm.mov_xx(dst.reg, source),
                        }
                        self.finish_gpr(&dst);
                    }
                    (false, true) => {
                        let source = self.src_gpr(instruction.source(0), SCRATCH0);
                        let dst = self.dst_vec(instruction.result(0));
                        self.asm.fmov_vx(bytes == 8, dst.reg, source);
                        self.finish_vec(&dst);
                    }
                    (true, false) => {
                        let source = self.src_vec(instruction.source(0), VSCRATCH0);
                        let dst = self.dst_gpr(instruction.result(0));
                        self.asm.fmov_xv(bytes == 8, dst.reg, source);
                        self.finish_gpr(&dst);
                    }
                    (true, true) => {
                        let source = self.src_vec(instruction.source(0), VSCRATCH0);
                        let dst = self.dst_vec(instruction.result(0));
                        self.asm.fmov_vv(bytes == 8, dst.reg, source);
                        self.finish_vec(&dst);
                    }
                }
            }

            CastF32toI32 | CastF64toI32 | CastF32toI64 | CastF64toI64 => {
                let double = matches!(op, CastF64toI32 | CastF64toI64);
                let int64 = matches!(op, CastF32toI64 | CastF64toI64);
                let source = self.src_vec(instruction.source(0), VSCRATCH0);
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.fcvtzs(double, int64, dst.reg, source);
                self.finish_gpr(&dst);
            }

            CastI32toF32 | CastI32toF64 | CastI64toF32 | CastI64toF64 => {
                let double = matches!(op, CastI32toF64 | CastI64toF64);
                let int64 = matches!(op, CastI64toF32 | CastI64toF64);
                let source = self.src_gpr(instruction.source(0), SCRATCH0);
                let dst = self.dst_vec(instruction.result(0));
                self.asm.scvtf(double, int64, dst.reg, source);
                self.finish_vec(&dst);
            }

            Test8 | Test16 | Test32 | Test64 => {
                let bits = match op {
                    Test8 => 8u32,
                    Test16 => 16,
                    Test32 => 32,
                    _ => 64,
                };
                let a = self.src_gpr(instruction.source(0), SCRATCH0);
                let b = self.src_gpr(instruction.source(1), SCRATCH1);
                if bits == 64 {
                    self.asm.tst_xx(a, b);
                } else {
                    self.asm.and_xx(SCRATCH2, a, b);
                    self.asm.tst_mask(SCRATCH2, bits);
                }
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.cset(dst.reg, Cond::Ne);
                self.finish_gpr(&dst);
            }

            CompareEq8 | CompareEq16 | CompareEq32 | CompareEq64 | CompareEqBool
            | CompareLtI8 | CompareLtI16 | CompareLtI32 | CompareLtI64 | CompareLtU8
            | CompareLtU16 | CompareLtU32 | CompareLtU64 | CompareLteI8 | CompareLteI16
            | CompareLteI32 | CompareLteI64 | CompareLteU8 | CompareLteU16 | CompareLteU32
            | CompareLteU64 => {
                let (bits, signed, cond) = match op {
                    CompareEq8 | CompareEqBool => (8u32, false, Cond::Eq),
                    CompareEq16 => (16, false, Cond::Eq),
                    CompareEq32 => (32, false, Cond::Eq),
                    CompareEq64 => (64, false, Cond::Eq),
                    CompareLtI8 => (8, true, Cond::Lt),
                    CompareLtI16 => (16, true, Cond::Lt),
                    CompareLtI32 => (32, true, Cond::Lt),
                    CompareLtI64 => (64, true, Cond::Lt),
                    CompareLtU8 => (8, false, Cond::Lo),
                    CompareLtU16 => (16, false, Cond::Lo),
                    CompareLtU32 => (32, false, Cond::Lo),
                    CompareLtU64 => (64, false, Cond::Lo),
                    CompareLteI8 => (8, true, Cond::Le),
                    CompareLteI16 => (16, true, Cond::Le),
                    CompareLteI32 => (32, true, Cond::Le),
                    CompareLteI64 => (64, true, Cond::Le),
                    CompareLteU8 => (8, false, Cond::Ls),
                    CompareLteU16 => (16, false, Cond::Ls),
                    CompareLteU32 => (32, false, Cond::Ls),
                    _ => (64, false, Cond::Ls),
                };
                let a = self.src_gpr(instruction.source(0), SCRATCH0);
                let b = self.src_gpr(instruction.source(1), SCRATCH1);
                match bits {
                    8 | 16 => {
                        // Widen to make the flags reflect the narrow
                        // operands only.
                        if signed {
                            if bits == 8 {
                                self.asm.sxtb(SCRATCH2, a);
                                self.asm.sxtb(SCRATCH3, b);
                            } else {
                                self.asm.sxth(SCRATCH2, a);
                                self.asm.sxth(SCRATCH3, b);
                            }
                        } else if bits == 8 {
                            self.asm.uxtb(SCRATCH2, a);
                            self.asm.uxtb(SCRATCH3, b);
                        } else {
                            self.asm.uxth(SCRATCH2, a);
                            self.asm.uxth(SCRATCH3, b);
                        }
                        self.asm.cmp_xx(SCRATCH2, SCRATCH3);
                    }
                    32 => self.asm.cmp_ww(a, b),
                    _ => self.asm.cmp_xx(a, b),
                }
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.cset(dst.reg, cond);
                self.finish_gpr(&dst);
            }

            CompareEqF32 | CompareEqF64 | CompareLtF32 | CompareLtF64 | CompareLteF32
            | CompareLteF64 => {
                let double = matches!(op, CompareEqF64 | CompareLtF64 | CompareLteF64);
                // After fcmp, MI is ordered less-than and LS is ordered
                // less-or-equal; unordered compares read as false.
                let cond = match op {
                    CompareEqF32 | CompareEqF64 => Cond::Eq,
                    CompareLtF32 | CompareLtF64 => Cond::Mi,
                    _ => Cond::Ls,
                };
                let a = self.src_vec(instruction.source(0), VSCRATCH0);
                let b = self.src_vec(instruction.source(1), VSCRATCH1);
                self.asm.fcmp(double, a, b);
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.cset(dst.reg, cond);
                self.finish_gpr(&dst);
            }

            Select => {
                let decision = self.src_gpr(instruction.source(0), SCRATCH0);
                if instruction.result(0).ssa.class() == RegClass::VECTOR {
                    let if_false = self.src_vec(instruction.source(1), VSCRATCH0);
                    let if_true = self.src_vec(instruction.source(2), VSCRATCH1);
                    let dst = self.dst_vec(instruction.result(0));
                    let skip = self.asm.allocate_label();
                    self.asm.fmov_vv(true, dst.reg, if_false);
                    self.asm.tst_mask(decision, 1);
                    self.asm.b_cond(Cond::Eq, skip);
                    self.asm.fmov_vv(true, dst.reg, if_true);
                    self.asm.bind(skip);
                    self.finish_vec(&dst);
                } else {
                    let if_false = self.src_gpr(instruction.source(1), SCRATCH1);
                    let if_true = self.src_gpr(instruction.source(2), SCRATCH2);
                    let dst = self.dst_gpr(instruction.result(0));
                    self.asm.tst_mask(decision, 1);
                    self.asm.csel(dst.reg, if_true, if_false, Cond::Ne);
                    self.finish_gpr(&dst);
                }
            }

            Exit => {
                self.asm.load_imm64(Reg(0), instruction.data().u64());
                self.asm.b(self.epilogue.unwrap());
            }

            ExitIf => {
                let decision = self.src_gpr(instruction.source(0), SCRATCH0);
                let skip = self.asm.allocate_label();
                self.asm.tst_mask(decision, 1);
                self.asm.b_cond(Cond::Eq, skip);
                self.asm.load_imm64(Reg(0), instruction.data().u64());
                self.asm.b(self.epilogue.unwrap());
                self.asm.bind(skip);
            }

            HostVoidCall0 | HostCall0 | HostCall1 | HostCall2 => {
                // Arguments were staged into x1/x2 by allocator moves; the
                // result is pinned to x0 the same way. The pools are
                // callee-saved, so nothing needs preserving here.
                let function = self.src_gpr(instruction.source(0), SCRATCH0);
                self.asm.mov_xx(Reg(0), GPR_GUEST);
                self.asm.blr(function);
            }

            LoadSpill | StoreSpill => {
                return Err(CompileError::UnsupportedRtlOpcode(op as u16));
            }
        }

        Ok(())
    }

    fn emit_move(&mut self, instruction: &RtlInstruction) {
        let to = instruction.result(0);
        let from = instruction.source(0);
        let to_vector = to.ssa.class() == RegClass::VECTOR;
        let from_vector = from.ssa.class() == RegClass::VECTOR;

        match (from.hw, to.hw) {
            (HwRegister::Register(src), HwRegister::Register(dst)) => {
                match (from_vector, to_vector) {
                    (false, false) => self.asm.mov_xx(Reg(dst), Reg(src)),
                    (true, true) => self.asm.fmov_vv(true, VReg(dst), VReg(src)),
                    (true, false) => self.asm.fmov_xv(true, Reg(dst), VReg(src)),
                    (false, true) => self.asm.fmov_vx(true, VReg(dst), Reg(src)),
                }
            }
            (HwRegister::Spill(slot), HwRegister::Register(dst)) => {
                if to_vector {
                    self.asm
                        .ldr_fp_imm(8, VReg(dst), GPR_SPILL, slot as u32 * 8);
                } else {
                    self.asm.ldr_imm(8, Reg(dst), GPR_SPILL, slot as u32 * 8);
                }
            }
            (HwRegister::Register(src), HwRegister::Spill(slot)) => {
                if from_vector {
                    self.asm
                        .str_fp_imm(8, VReg(src), GPR_SPILL, slot as u32 * 8);
                } else {
                    self.asm.str_imm(8, Reg(src), GPR_SPILL, slot as u32 * 8);
                }
            }
            (HwRegister::Spill(src), HwRegister::Spill(dst)) => {
                self.asm.ldr_imm(8, SCRATCH0, GPR_SPILL, src as u32 * 8);
                self.asm.str_imm(8, SCRATCH0, GPR_SPILL, dst as u32 * 8);
            }
            _ => unreachable!("move with unallocated operand"),
        }
    }
}
