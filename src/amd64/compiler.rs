//! RTL to x86-64 code generation.
//!
//! Register conventions for every compiled block:
//!
//! * `RDI` — `GuestHandle` pointer (also the first SysV argument, so host
//!   calls forward it unchanged).
//! * `RBX` — guest register block base.
//! * `R12` — guest memory base; released to the allocator when the block
//!   performs no memory accesses.
//! * `RBP` — spill region base; slot `k` lives at `[RBP + 8k]`.
//! * `RAX`, `RCX`, `RSI`, `RDX`, `R8` — scratch and calling-convention
//!   pins; never allocated.
//! * `XMM8`..`XMM10` — SSE scratch for spill staging.
//!
//! Everything else (`R9`-`R11`, `R13`-`R15`, `XMM0`-`XMM7`) is
//! allocator-visible. Host calls push the live caller-saved part of that
//! pool around the `call`, so allocated values survive the callee.

use std::sync::Arc;

use crate::amd64::assembler::{
    Address, AluOp, Assembler, Cond, GeneralRegister, Label, RegMemAny, ShiftOp, VectorRegister,
};
use crate::amd64::routine::Routine;
use crate::error::CompileError;
use crate::guest::{load_trampoline_for, store_trampoline_for};
use crate::ir::{ExecutionUnit, Type};
use crate::jit;
use crate::jit::allocator::{LinearAllocator, RegisterSet};
use crate::jit::lower::{lower, CallingConvention};
use crate::jit::routine::ExecBuffer;
use crate::jit::rtl::{HwRegister, RegClass, RegisterAssignment, RtlInstruction, RtlOp, RtlProgram};

use GeneralRegister::*;
use VectorRegister::{XMM10, XMM8, XMM9};

/// Guest pointer register.
pub const GPR_GUEST: GeneralRegister = RDI;
/// Guest register block base.
pub const GPR_GUEST_REGISTERS: GeneralRegister = RBX;
/// Guest memory base.
pub const GPR_GUEST_MEMORY: GeneralRegister = R12;
/// Spill materialization scratch.
pub const GPR_SCRATCH: GeneralRegister = R8;

const CONVENTION: CallingConvention = CallingConvention {
    arg1: Some(RSI as u8),
    arg2: Some(RDX as u8),
    ret: Some(RAX as u8),
};

/// Allocatable general purpose registers (memory-base register excluded).
const GPR_POOL: [u8; 6] = [R9 as u8, R10 as u8, R11 as u8, R13 as u8, R14 as u8, R15 as u8];

/// Caller-saved members of the pool, preserved around host calls.
const GPR_POOL_VOLATILE: [GeneralRegister; 3] = [R9, R10, R11];

/// Allocatable SSE registers.
const VEC_POOL: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

/// Maps guest register indexes to addressing primitives.
pub type RegisterAddressCb = dyn Fn(u32) -> RegMemAny + Send + Sync;

/// Emits a specialized guest memory load of `bytes` bytes from the guest
/// address in the given register into the destination register.
pub type LoadEmitter = dyn Fn(&mut Assembler, usize, GeneralRegister, GeneralRegister) + Send + Sync;

/// The standard fastmem load emitter: a single width-appropriate `mov` from
/// `[memory_base + address]`, trusting the 4-GiB reservation to fault on
/// unmapped guest pages. The emitted forms are exactly the ones the fault
/// handler can decode.
pub fn fastmem_load_emitter(
    asm: &mut Assembler,
    bytes: usize,
    address: GeneralRegister,
    out: GeneralRegister,
) {
    let address = Address::base_index(GPR_GUEST_MEMORY, address, 1);
    asm.mov_rm(bytes as u8, out, &address);
}

fn classify(ty: Type) -> RegClass {
    match ty {
        Type::Float32 | Type::Float64 => RegClass::VECTOR,
        _ => RegClass::GENERAL,
    }
}

/// IR to x86-64 compiler.
///
/// `set_register_address_cb` must be called before compiling any unit that
/// touches guest registers. Installing a memory load emitter selects
/// fastmem loads; without one, loads fall back to host calls.
#[derive(Default)]
pub struct Compiler {
    register_address_cb: Option<Box<RegisterAddressCb>>,
    load_emitter: Option<Box<LoadEmitter>>,
}

impl Compiler {
    /// New compiler with no callbacks installed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the guest register addressing callback.
    pub fn set_register_address_cb(
        &mut self,
        callback: impl Fn(u32) -> RegMemAny + Send + Sync + 'static,
    ) {
        self.register_address_cb = Some(Box::new(callback));
    }

    /// Install or clear the specialized memory load emitter.
    pub fn set_memory_load_emitter(&mut self, emitter: Option<Box<LoadEmitter>>) {
        self.load_emitter = emitter;
    }

    /// Compile a unit into a native routine. The routine still needs
    /// [`prepare`](crate::jit::Routine::prepare) before it can run.
    pub fn compile(&self, source: ExecutionUnit) -> Result<Arc<dyn jit::Routine>, CompileError> {
        let lowered = lower(&source, &CONVENTION, classify)?;

        let mut pool: Vec<u8> = GPR_POOL.to_vec();
        if !lowered.uses_memory {
            // No memory traffic; the memory base register joins the pool.
            pool.push(GPR_GUEST_MEMORY as u8);
        }

        let mut allocator = LinearAllocator::new();
        allocator.define_register_type(RegisterSet::new(RegClass::GENERAL, &pool));
        allocator.define_register_type(RegisterSet::new(RegClass::VECTOR, &VEC_POOL));
        let rtl = allocator.execute(lowered.rtl)?;

        let mut emitter = Emitter {
            asm: Assembler::new(),
            register_address_cb: self.register_address_cb.as_deref(),
            load_emitter: self.load_emitter.as_deref(),
            epilogue: None,
            frame: frame_bytes(rtl.spill_size()),
        };
        let code = emitter.assemble(&rtl)?;

        tracing::trace!(
            instructions = source.instructions().len(),
            bytes = code.len(),
            spill = rtl.spill_size(),
            "amd64 routine assembled"
        );

        let buffer = ExecBuffer::new(&code).map_err(CompileError::Buffer)?;
        Ok(Arc::new(Routine::new(buffer)))
    }
}

/// Frame size keeping `rsp % 16 == 0` between instructions: entry leaves
/// `rsp % 16 == 8`, the six prologue pushes preserve that, so the frame
/// must be `8 (mod 16)`.
fn frame_bytes(spill_bytes: u32) -> i32 {
    let mut frame = spill_bytes as i32;
    if frame % 16 != 8 {
        frame += 8 - (frame + 8) % 16 + 8;
    }
    debug_assert_eq!(frame % 16, 8);
    frame
}

fn spill_slot(slot: u16) -> Address {
    Address::base_disp(RBP, slot as i32 * 8)
}

/// Destination staging: either the allocated register or a scratch that is
/// stored to the spill slot afterwards.
struct GprDst {
    reg: GeneralRegister,
    spill: Option<u16>,
}

struct VecDst {
    reg: VectorRegister,
    spill: Option<u16>,
}

struct Emitter<'a> {
    asm: Assembler,
    register_address_cb: Option<&'a RegisterAddressCb>,
    load_emitter: Option<&'a LoadEmitter>,
    epilogue: Option<Label>,
    frame: i32,
}

impl<'a> Emitter<'a> {
    fn assemble(&mut self, rtl: &RtlProgram) -> Result<Vec<u8>, CompileError> {
        let epilogue = self.asm.allocate_label();
        self.epilogue = Some(epilogue);

        // Prologue: save callee-saved registers, carve the spill frame and
        // pin the bases. SysV hands us (guest, memory_base, register_base)
        // in RDI/RSI/RDX.
        self.asm.push_r(RBX);
        self.asm.push_r(RBP);
        self.asm.push_r(R12);
        self.asm.push_r(R13);
        self.asm.push_r(R14);
        self.asm.push_r(R15);
        self.asm.sub_rsp(self.frame);
        self.asm.mov_rr(8, RBP, RSP);
        self.asm.mov_rr(8, GPR_GUEST_REGISTERS, RDX);
        self.asm.mov_rr(8, GPR_GUEST_MEMORY, RSI);

        for instruction in rtl.block(0) {
            self.emit(instruction)?;
        }

        // Fall-through return code 0.
        self.asm.mov_ri32(RAX, 0);
        self.asm.bind(epilogue);
        self.asm.add_rsp(self.frame);
        self.asm.pop_r(R15);
        self.asm.pop_r(R14);
        self.asm.pop_r(R13);
        self.asm.pop_r(R12);
        self.asm.pop_r(RBP);
        self.asm.pop_r(RBX);
        self.asm.ret();

        Ok(std::mem::take(&mut self.asm).finalize())
    }

    /* Operand staging. */

    fn src_gpr(&mut self, operand: &RegisterAssignment, scratch: GeneralRegister) -> GeneralRegister {
        match operand.hw {
            HwRegister::Register(index) => GeneralRegister::from_index(index),
            HwRegister::Spill(slot) => {
                self.asm.mov_rm(8, scratch, &spill_slot(slot));
                scratch
            }
            HwRegister::Unassigned => unreachable!("operand left unallocated"),
        }
    }

    fn src_xmm(&mut self, operand: &RegisterAssignment, scratch: VectorRegister) -> VectorRegister {
        match operand.hw {
            HwRegister::Register(index) => VectorRegister::from_index(index),
            HwRegister::Spill(slot) => {
                self.asm.movs_xm(true, scratch, &spill_slot(slot));
                scratch
            }
            HwRegister::Unassigned => unreachable!("operand left unallocated"),
        }
    }

    fn dst_gpr(&self, operand: &RegisterAssignment) -> GprDst {
        match operand.hw {
            HwRegister::Register(index) => GprDst {
                reg: GeneralRegister::from_index(index),
                spill: None,
            },
            HwRegister::Spill(slot) => GprDst {
                reg: RAX,
                spill: Some(slot),
            },
            HwRegister::Unassigned => unreachable!("operand left unallocated"),
        }
    }

    fn finish_gpr(&mut self, dst: &GprDst) {
        if let Some(slot) = dst.spill {
            self.asm.mov_mr(8, &spill_slot(slot), dst.reg);
        }
    }

    fn dst_xmm(&self, operand: &RegisterAssignment) -> VecDst {
        match operand.hw {
            HwRegister::Register(index) => VecDst {
                reg: VectorRegister::from_index(index),
                spill: None,
            },
            HwRegister::Spill(slot) => VecDst {
                reg: XMM10,
                spill: Some(slot),
            },
            HwRegister::Unassigned => unreachable!("operand left unallocated"),
        }
    }

    fn finish_xmm(&mut self, dst: &VecDst) {
        if let Some(slot) = dst.spill {
            self.asm.movs_mx(true, &spill_slot(slot), dst.reg);
        }
    }

    /// Push the state a host call may clobber, `call function`, pop it.
    /// Arguments (RDI/RSI/RDX) are staged before this runs and the result
    /// is read from RAX after it.
    fn emit_call(&mut self, function: GeneralRegister) {
        for reg in GPR_POOL_VOLATILE {
            self.asm.push_r(reg);
        }
        self.asm.push_r(GPR_GUEST);
        self.asm.sub_rsp(VEC_POOL.len() as i32 * 8);
        for (i, index) in VEC_POOL.iter().enumerate() {
            self.asm.movs_mx(
                true,
                &Address::base_disp(RSP, i as i32 * 8),
                VectorRegister::from_index(*index),
            );
        }

        self.asm.call_r(function);

        for (i, index) in VEC_POOL.iter().enumerate() {
            self.asm.movs_xm(
                true,
                VectorRegister::from_index(*index),
                &Address::base_disp(RSP, i as i32 * 8),
            );
        }
        self.asm.add_rsp(VEC_POOL.len() as i32 * 8);
        self.asm.pop_r(GPR_GUEST);
        for reg in GPR_POOL_VOLATILE.iter().rev() {
            self.asm.pop_r(*reg);
        }
    }

    /// Call a fixed helper with the guest address argument in RSI and an
    /// optional value argument in RDX; the result lands in RAX.
    fn emit_helper_call(&mut self, helper: u64) {
        self.asm.mov_ri64(RAX, helper);
        self.emit_call(RAX);
    }

    fn register_address(&self, index: u16) -> RegMemAny {
        let callback = self
            .register_address_cb
            .expect("register address callback not registered");
        callback(index as u32)
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
                    self.asm.mov_ri64(RCX, bits);
                    let dst = self.dst_xmm(instruction.result(0));
                    self.asm.mov_xr(8, dst.reg, RCX);
                    self.finish_xmm(&dst);
                } else {
                    let dst = self.dst_gpr(instruction.result(0));
                    if bits <= u32::MAX as u64 {
                        self.asm.mov_ri32(dst.reg, bits as u32);
                    } else {
                        self.asm.mov_ri64(dst.reg, bits);
                    }
                    self.finish_gpr(&dst);
                }
            }

            ReadRegister8 | ReadRegister16 | ReadRegister32 | ReadRegister64 => {
                let bytes = match op {
                    ReadRegister8 => 1u8,
                    ReadRegister16 => 2,
                    ReadRegister32 => 4,
                    _ => 8,
                };
                let target = self.register_address(instruction.data().u16());
                if instruction.result(0).ssa.class() == RegClass::VECTOR {
                    let dst = self.dst_xmm(instruction.result(0));
                    match target {
                        RegMemAny::Mem(address) => {
                            self.asm.movs_xm(bytes == 8, dst.reg, &address)
                        }
                        RegMemAny::Reg(register) => self.asm.mov_xr(bytes, dst.reg, register),
                    }
                    self.finish_xmm(&dst);
                } else {
                    let dst = self.dst_gpr(instruction.result(0));
                    match target {
                        RegMemAny::Mem(address) => self.asm.mov_rm(bytes, dst.reg, &address),
                        RegMemAny::Reg(register) => self.asm.mov_rr(bytes, dst.reg, register),
                    }
                    self.finish_gpr(&dst);
                }
            }

            WriteRegister8 | WriteRegister16 | WriteRegister32 | WriteRegister64 => {
                let bytes = match op {
                    WriteRegister8 => 1u8,
                    WriteRegister16 => 2,
                    WriteRegister32 => 4,
                    _ => 8,
                };
                let target = self.register_address(instruction.data().u16());
                if instruction.source(0).ssa.class() == RegClass::VECTOR {
                    let value = self.src_xmm(instruction.source(0), XMM8);
                    match target {
                        RegMemAny::Mem(address) => {
                            self.asm.movs_mx(bytes == 8, &address, value)
                        }
                        RegMemAny::Reg(register) => self.asm.mov_rx(bytes, register, value),
                    }
                } else {
                    let value = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                    match target {
                        RegMemAny::Mem(address) => self.asm.mov_mr(bytes, &address, value),
                        RegMemAny::Reg(register) => self.asm.mov_rr(bytes, register, value),
                    }
                }
            }

            Load8 | Load16 | Load32 | Load64 => {
                let bytes = match op {
                    Load8 => 1usize,
                    Load16 => 2,
                    Load32 => 4,
                    _ => 8,
                };
                let address = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let vector = instruction.result(0).ssa.class() == RegClass::VECTOR;

                if let Some(emitter) = self.load_emitter {
                    if vector {
                        // Loads always target a general register so the
                        // fault handler has one place to patch; the value
                        // hops to its vector home afterwards.
                        emitter(&mut self.asm, bytes, address, RAX);
                        let dst = self.dst_xmm(instruction.result(0));
                        self.asm.mov_xr(if bytes == 8 { 8 } else { 4 }, dst.reg, RAX);
                        self.finish_xmm(&dst);
                    } else {
                        let dst = self.dst_gpr(instruction.result(0));
                        emitter(&mut self.asm, bytes, address, dst.reg);
                        self.finish_gpr(&dst);
                    }
                } else {
                    // Slow path: upcall through the load bridge.
                    self.asm.mov_rr(8, RSI, address);
                    self.emit_helper_call(load_trampoline_for(bytes) as usize as u64);
                    if vector {
                        let dst = self.dst_xmm(instruction.result(0));
                        self.asm.mov_xr(if bytes == 8 { 8 } else { 4 }, dst.reg, RAX);
                        self.finish_xmm(&dst);
                    } else {
                        let dst = self.dst_gpr(instruction.result(0));
                        self.asm.mov_rr(8, dst.reg, RAX);
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
                // Stores always go through the guest interface.
                let address = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                self.asm.mov_rr(8, RSI, address);
                if instruction.source(1).ssa.class() == RegClass::VECTOR {
                    let value = self.src_xmm(instruction.source(1), XMM8);
                    self.asm.mov_rx(8, RDX, value);
                } else {
                    let value = self.src_gpr(instruction.source(1), RCX);
                    self.asm.mov_rr(8, RDX, value);
                }
                self.emit_helper_call(store_trampoline_for(bytes) as usize as u64);
            }

            RotateRight8 | RotateRight16 | RotateRight32 | RotateRight64 | RotateLeft8
            | RotateLeft16 | RotateLeft32 | RotateLeft64 | ShiftRight8 | ShiftRight16
            | ShiftRight32 | ShiftRight64 | ShiftLeft8 | ShiftLeft16 | ShiftLeft32
            | ShiftLeft64 | ArithmeticShiftRight8 | ArithmeticShiftRight16
            | ArithmeticShiftRight32 | ArithmeticShiftRight64 => {
                let (shift_op, width, mask) = match op {
                    RotateRight8 => (ShiftOp::Ror, 1u8, false),
                    RotateRight16 => (ShiftOp::Ror, 2, false),
                    RotateRight32 => (ShiftOp::Ror, 4, false),
                    RotateRight64 => (ShiftOp::Ror, 8, false),
                    RotateLeft8 => (ShiftOp::Rol, 1, false),
                    RotateLeft16 => (ShiftOp::Rol, 2, false),
                    RotateLeft32 => (ShiftOp::Rol, 4, false),
                    RotateLeft64 => (ShiftOp::Rol, 8, false),
                    ShiftRight8 => (ShiftOp::Shr, 1, true),
                    ShiftRight16 => (ShiftOp::Shr, 2, true),
                    ShiftRight32 => (ShiftOp::Shr, 4, true),
                    ShiftRight64 => (ShiftOp::Shr, 8, true),
                    ShiftLeft8 => (ShiftOp::Shl, 1, true),
                    ShiftLeft16 => (ShiftOp::Shl, 2, true),
                    ShiftLeft32 => (ShiftOp::Shl, 4, true),
                    ShiftLeft64 => (ShiftOp::Shl, 8, true),
                    ArithmeticShiftRight8 => (ShiftOp::Sar, 1, true),
                    ArithmeticShiftRight16 => (ShiftOp::Sar, 2, true),
                    ArithmeticShiftRight32 => (ShiftOp::Sar, 4, true),
                    _ => (ShiftOp::Sar, 8, true),
                };

                let value = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let count = self.src_gpr(instruction.source(1), RCX);
                if count != RCX {
                    self.asm.mov_rr(8, RCX, count);
                }
                if mask {
                    // Narrow shifts must saturate at the operand width, not
                    // the machine's 5/6-bit hardware mask.
                    self.asm.alu_ri(AluOp::And, 4, RCX, (width as i32 * 8) - 1);
                }
                let dst = self.dst_gpr(instruction.result(0));
                if dst.reg != value {
                    self.asm.mov_rr(8, dst.reg, value);
                }
                self.asm.shift_cl(shift_op, width, dst.reg);
                self.finish_gpr(&dst);
            }

            And8 | And16 | And32 | And64 | AndBool | Or8 | Or16 | Or32 | Or64 | OrBool | Xor8
            | Xor16 | Xor32 | Xor64 | XorBool => {
                let alu = match op {
                    And8 | And16 | And32 | And64 | AndBool => AluOp::And,
                    Or8 | Or16 | Or32 | Or64 | OrBool => AluOp::Or,
                    _ => AluOp::Xor,
                };
                let a = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let b = self.src_gpr(instruction.source(1), RCX);
                let dst = self.dst_gpr(instruction.result(0));
                if dst.reg != a {
                    self.asm.mov_rr(8, dst.reg, a);
                }
                self.asm.alu_rr(alu, 8, dst.reg, b);
                self.finish_gpr(&dst);
            }

            Not8 | Not16 | Not32 | Not64 => {
                let width = match op {
                    Not8 => 1u8,
                    Not16 => 2,
                    Not32 => 4,
                    _ => 8,
                };
                let source = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let dst = self.dst_gpr(instruction.result(0));
                if dst.reg != source {
                    self.asm.mov_rr(8, dst.reg, source);
                }
                self.asm.not_r(width, dst.reg);
                self.finish_gpr(&dst);
            }

            NotBool => {
                let source = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let dst = self.dst_gpr(instruction.result(0));
                if dst.reg != source {
                    self.asm.mov_rr(8, dst.reg, source);
                }
                self.asm.alu_ri(AluOp::Xor, 4, dst.reg, 1);
                self.finish_gpr(&dst);
            }

            BitSetClear8 | BitSetClear16 | BitSetClear32 | BitSetClear64 => {
                let position = instruction.data().u8() as u32;
                let value = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let dst = self.dst_gpr(instruction.result(0));
                if dst.reg != value {
                    self.asm.mov_rr(8, dst.reg, value);
                }
                let mask = !(1u64 << position);
                if position < 31 {
                    self.asm.alu_ri(AluOp::And, 8, dst.reg, mask as i64 as i32);
                } else {
                    self.asm.mov_ri64(RCX, mask);
                    self.asm.alu_rr(AluOp::And, 8, dst.reg, RCX);
                }
                let control = self.src_gpr(instruction.source(1), RCX);
                if control != RCX {
                    self.asm.mov_rr(8, RCX, control);
                }
                self.asm.alu_ri(AluOp::And, 4, RCX, 1);
                if position > 0 {
                    self.asm.shift_imm(ShiftOp::Shl, 8, RCX, position as u8);
                }
                self.asm.alu_rr(AluOp::Or, 8, dst.reg, RCX);
                self.finish_gpr(&dst);
            }

            AddInteger | SubInteger8 | SubInteger16 | SubInteger32 | SubInteger64 => {
                let (alu, width) = match op {
                    AddInteger => (AluOp::Add, 8u8),
                    SubInteger8 => (AluOp::Sub, 1),
                    SubInteger16 => (AluOp::Sub, 2),
                    SubInteger32 => (AluOp::Sub, 4),
                    _ => (AluOp::Sub, 8),
                };
                let a = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let b = self.src_gpr(instruction.source(1), RCX);
                let dst = self.dst_gpr(instruction.result(0));
                if dst.reg != a {
                    self.asm.mov_rr(8, dst.reg, a);
                }
                self.asm.alu_rr(alu, width, dst.reg, b);
                self.finish_gpr(&dst);
            }

            MultiplyI8 | MultiplyI16 | MultiplyI32 | MultiplyI64 | MultiplyU8 | MultiplyU16
            | MultiplyU32 | MultiplyU64 => {
                // The low bits of a product are signedness-agnostic, so a
                // 64-bit imul covers every width.
                let a = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let b = self.src_gpr(instruction.source(1), RCX);
                let dst = self.dst_gpr(instruction.result(0));
                if dst.reg != a {
                    self.asm.mov_rr(8, dst.reg, a);
                }
                self.asm.imul_rr(8, dst.reg, b);
                self.finish_gpr(&dst);
            }

            DivideI8 | DivideI16 | DivideI32 | DivideI64 | DivideU8 | DivideU16 | DivideU32
            | DivideU64 => {
                let (signed, width) = match op {
                    DivideI8 => (true, 1u8),
                    DivideI16 => (true, 2),
                    DivideI32 => (true, 4),
                    DivideI64 => (true, 8),
                    DivideU8 => (false, 1),
                    DivideU16 => (false, 2),
                    DivideU32 => (false, 4),
                    _ => (false, 8),
                };
                let dividend = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let divisor = self.src_gpr(instruction.source(1), RCX);
                if divisor != RCX {
                    self.asm.mov_rr(8, RCX, divisor);
                }

                // Widen both operands so narrow divides run as 32/64-bit
                // hardware divides with the right signedness.
                let div_size = if width == 8 { 8 } else { 4 };
                match (signed, width) {
                    (true, 1) | (true, 2) => {
                        self.asm.movsx(RAX, dividend, width, 4);
                        self.asm.movsx(RCX, RCX, width, 4);
                    }
                    (false, 1) | (false, 2) => {
                        self.asm.movzx(RAX, dividend, width);
                        self.asm.movzx(RCX, RCX, width);
                    }
                    (_, 4) => self.asm.mov_rr(4, RAX, dividend),
                    _ => self.asm.mov_rr(8, RAX, dividend),
                }

                if signed {
                    self.asm.sign_extend_rdx(div_size);
                    self.asm.idiv_r(div_size, RCX);
                } else {
                    self.asm.alu_rr(AluOp::Xor, 4, RDX, RDX);
                    self.asm.div_r(div_size, RCX);
                }

                let dst = self.dst_gpr(instruction.result(0));
                if dst.reg != RAX {
                    self.asm.mov_rr(8, dst.reg, RAX);
                }
                self.finish_gpr(&dst);
            }

            AddFloat32 | AddFloat64 | SubFloat32 | SubFloat64 | MultiplyF32 | MultiplyF64
            | DivideF32 | DivideF64 => {
                let double = matches!(op, AddFloat64 | SubFloat64 | MultiplyF64 | DivideF64);
                let a = self.src_xmm(instruction.source(0), XMM8);
                let b = self.src_xmm(instruction.source(1), XMM9);
                let dst = self.dst_xmm(instruction.result(0));
                if dst.reg != a {
                    self.asm.movs_xx(double, dst.reg, a);
                }
                match op {
                    AddFloat32 | AddFloat64 => self.asm.adds(double, dst.reg, b),
                    SubFloat32 | SubFloat64 => self.asm.subs(double, dst.reg, b),
                    MultiplyF32 | MultiplyF64 => self.asm.muls(double, dst.reg, b),
                    _ => self.asm.divs(double, dst.reg, b),
                }
                self.finish_xmm(&dst);
            }

            SquareRootF32 | SquareRootF64 => {
                let double = op == SquareRootF64;
                let source = self.src_xmm(instruction.source(0), XMM8);
                let dst = self.dst_xmm(instruction.result(0));
                self.asm.sqrts(double, dst.reg, source);
                self.finish_xmm(&dst);
            }

            Extend8to16 | Extend8to32 | Extend8to64 | Extend16to32 | Extend16to64
            | Extend32to64 => {
                let (from, to) = match op {
                    Extend8to16 => (1u8, 2u8),
                    Extend8to32 => (1, 4),
                    Extend8to64 => (1, 8),
                    Extend16to32 => (2, 4),
                    Extend16to64 => (2, 8),
                    _ => (4, 8),
                };
                let source = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.movsx(dst.reg, source, from, to.max(4));
                self.finish_gpr(&dst);
            }

            Float32to64 | Float64to32 => {
                let source = self.src_xmm(instruction.source(0), XMM8);
                let dst = self.dst_xmm(instruction.result(0));
                self.asm.cvt_float(op == Float32to64, dst.reg, source);
                self.finish_xmm(&dst);
            }

            Cast8 | Cast16 | Cast32 | Cast64 => {
                let width = match op {
                    Cast8 => 1u8,
                    Cast16 => 2,
                    Cast32 => 4,
                    _ => 8,
                };
                let src_vector = instruction.source(0).ssa.class() == RegClass::VECTOR;
                let dst_vector = instruction.result(0).ssa.class() == RegClass::VECTOR;
                match (src_vector, dst_vector) {
                    (false, false) => {
                        let source = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                        let dst = self.dst_gpr(instruction.result(0));
                        match width {
                            1 | 2 => self.asm.movzx(dst.reg, source, width),
                            4 => self.asm.mov_rr(4, dst.reg, source),
                            _ => self.asm.mov_rr(8, dst.reg, source),
                        }
                        self.finish_gpr(&dst);
                    }
                    (false, true) => {
                        let source = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                        let dst = self.dst_xmm(instruction.result(0));
                        self.asm.mov_xr(width.max(4), dst.reg, source);
                        self.finish_xmm(&dst);
                    }
                    (true, false) => {
                        let source = self.src_xmm(instruction.source(0), XMM8);
                        let dst = self.dst_gpr(instruction.result(0));
                        self.asm.mov_rx(width.max(4), dst.reg, source);
                        self.finish_gpr(&dst);
                    }
                    (true, true) => {
                        let source = self.src_xmm(instruction.source(0), XMM8);
                        let dst = self.dst_xmm(instruction.result(0));
                        self.asm.movs_xx(width == 8, dst.reg, source);
                        self.finish_xmm(&dst);
                    }
                }
            }

            CastF32toI32 | CastF64toI32 | CastF32toI64 | CastF64toI64 => {
                let double = matches!(op, CastF64toI32 | CastF64toI64);
                let int_size = if matches!(op, CastF32toI64 | CastF64toI64) {
                    8
                } else {
                    4
                };
                let source = self.src_xmm(instruction.source(0), XMM8);
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.cvt_float_int(double, int_size, dst.reg, source);
                self.finish_gpr(&dst);
            }

            CastI32toF32 | CastI32toF64 | CastI64toF32 | CastI64toF64 => {
                let double = matches!(op, CastI32toF64 | CastI64toF64);
                let int_size = if matches!(op, CastI64toF32 | CastI64toF64) {
                    8
                } else {
                    4
                };
                let source = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let dst = self.dst_xmm(instruction.result(0));
                self.asm.cvt_int_float(double, int_size, dst.reg, source);
                self.finish_xmm(&dst);
            }

            Test8 | Test16 | Test32 | Test64 => {
                let width = match op {
                    Test8 => 1u8,
                    Test16 => 2,
                    Test32 => 4,
                    _ => 8,
                };
                let a = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let b = self.src_gpr(instruction.source(1), RCX);
                self.asm.test_rr(width, a, b);
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.setcc(Cond::Ne, dst.reg);
                self.asm.movzx(dst.reg, dst.reg, 1);
                self.finish_gpr(&dst);
            }

            CompareEq8 | CompareEq16 | CompareEq32 | CompareEq64 | CompareEqBool
            | CompareLtI8 | CompareLtI16 | CompareLtI32 | CompareLtI64 | CompareLtU8
            | CompareLtU16 | CompareLtU32 | CompareLtU64 | CompareLteI8 | CompareLteI16
            | CompareLteI32 | CompareLteI64 | CompareLteU8 | CompareLteU16 | CompareLteU32
            | CompareLteU64 => {
                let (width, cond) = match op {
                    CompareEq8 | CompareEqBool => (1u8, Cond::E),
                    CompareEq16 => (2, Cond::E),
                    CompareEq32 => (4, Cond::E),
                    CompareEq64 => (8, Cond::E),
                    CompareLtI8 => (1, Cond::L),
                    CompareLtI16 => (2, Cond::L),
                    CompareLtI32 => (4, Cond::L),
                    CompareLtI64 => (8, Cond::L),
                    CompareLtU8 => (1, Cond::B),
                    CompareLtU16 => (2, Cond::B),
                    CompareLtU32 => (4, Cond::B),
                    CompareLtU64 => (8, Cond::B),
                    CompareLteI8 => (1, Cond::Le),
                    CompareLteI16 => (2, Cond::Le),
                    CompareLteI32 => (4, Cond::Le),
                    CompareLteI64 => (8, Cond::Le),
                    CompareLteU8 => (1, Cond::Be),
                    CompareLteU16 => (2, Cond::Be),
                    CompareLteU32 => (4, Cond::Be),
                    _ => (8, Cond::Be),
                };
                let a = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let b = self.src_gpr(instruction.source(1), RCX);
                self.asm.alu_rr(AluOp::Cmp, width, a, b);
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.setcc(cond, dst.reg);
                self.asm.movzx(dst.reg, dst.reg, 1);
                self.finish_gpr(&dst);
            }

            CompareEqF32 | CompareEqF64 => {
                let double = op == CompareEqF64;
                let a = self.src_xmm(instruction.source(0), XMM8);
                let b = self.src_xmm(instruction.source(1), XMM9);
                self.asm.ucomis(double, a, b);
                let dst = self.dst_gpr(instruction.result(0));
                // ZF is also set on unordered compares; the parity check
                // filters NaNs out.
                self.asm.setcc(Cond::Np, RCX);
                self.asm.setcc(Cond::E, dst.reg);
                self.asm.alu_rr(AluOp::And, 1, dst.reg, RCX);
                self.asm.movzx(dst.reg, dst.reg, 1);
                self.finish_gpr(&dst);
            }

            CompareLtF32 | CompareLtF64 | CompareLteF32 | CompareLteF64 => {
                let double = matches!(op, CompareLtF64 | CompareLteF64);
                let cond = if matches!(op, CompareLtF32 | CompareLtF64) {
                    Cond::A
                } else {
                    Cond::Ae
                };
                let a = self.src_xmm(instruction.source(0), XMM8);
                let b = self.src_xmm(instruction.source(1), XMM9);
                // Swapped compare with an above-condition makes unordered
                // results read as false.
                self.asm.ucomis(double, b, a);
                let dst = self.dst_gpr(instruction.result(0));
                self.asm.setcc(cond, dst.reg);
                self.asm.movzx(dst.reg, dst.reg, 1);
                self.finish_gpr(&dst);
            }

            Select => {
                let decision = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                if instruction.result(0).ssa.class() == RegClass::VECTOR {
                    let if_false = self.src_xmm(instruction.source(1), XMM8);
                    let if_true = self.src_xmm(instruction.source(2), XMM9);
                    let dst = self.dst_xmm(instruction.result(0));
                    let skip = self.asm.allocate_label();
                    self.asm.movs_xx(true, dst.reg, if_false);
                    self.asm.test_rr(1, decision, decision);
                    self.asm.jcc(Cond::E, skip);
                    self.asm.movs_xx(true, dst.reg, if_true);
                    self.asm.bind(skip);
                    self.finish_xmm(&dst);
                } else {
                    let if_false = self.src_gpr(instruction.source(1), RCX);
                    let if_true = self.src_gpr(instruction.source(2), RSI);
                    let dst = self.dst_gpr(instruction.result(0));
                    if dst.reg != if_false {
                        self.asm.mov_rr(8, dst.reg, if_false);
                    }
                    self.asm.test_rr(1, decision, decision);
                    self.asm.cmovcc(Cond::Ne, 8, dst.reg, if_true);
                    self.finish_gpr(&dst);
                }
            }

            Exit => {
                let code = instruction.data().u64();
                if code <= u32::MAX as u64 {
                    self.asm.mov_ri32(RAX, code as u32);
                } else {
                    self.asm.mov_ri64(RAX, code);
                }
                self.asm.jmp(self.epilogue.unwrap());
            }

            ExitIf => {
                let decision = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                let skip = self.asm.allocate_label();
                self.asm.test_rr(1, decision, decision);
                self.asm.jcc(Cond::E, skip);
                let code = instruction.data().u64();
                if code <= u32::MAX as u64 {
                    self.asm.mov_ri32(RAX, code as u32);
                } else {
                    self.asm.mov_ri64(RAX, code);
                }
                self.asm.jmp(self.epilogue.unwrap());
                self.asm.bind(skip);
            }

            HostVoidCall0 | HostCall0 | HostCall1 | HostCall2 => {
                // Arguments were staged into RSI/RDX by allocator moves;
                // the result is pinned to RAX the same way.
                let function = self.src_gpr(instruction.source(0), GPR_SCRATCH);
                self.emit_call(function);
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

        // Spill slots hold raw bits; cross-class traffic through memory is
        // a plain 64-bit move on either side.
        match (from.hw, to.hw) {
            (HwRegister::Register(src), HwRegister::Register(dst)) => {
                match (from_vector, to_vector) {
                    (false, false) => self.asm.mov_rr(
                        8,
                        GeneralRegister::from_index(dst),
                        GeneralRegister::from_index(src),
                    ),
                    (true, true) => self.asm.movs_xx(
                        true,
                        VectorRegister::from_index(dst),
                        VectorRegister::from_index(src),
                    ),
                    (true, false) => self.asm.mov_rx(
                        8,
                        GeneralRegister::from_index(dst),
                        VectorRegister::from_index(src),
                    ),
                    (false, true) => self.asm.mov_xr(
                        8,
                        VectorRegister::from_index(dst),
                        GeneralRegister::from_index(src),
                    ),
                }
            }
            (HwRegister::Spill(slot), HwRegister::Register(dst)) => {
                if to_vector {
                    self.asm
                        .movs_xm(true, VectorRegister::from_index(dst), &spill_slot(slot));
                } else {
                    self.asm
                        .mov_rm(8, GeneralRegister::from_index(dst), &spill_slot(slot));
                }
            }
            (HwRegister::Register(src), HwRegister::Spill(slot)) => {
                if from_vector {
                    self.asm
                        .movs_mx(true, &spill_slot(slot), VectorRegister::from_index(src));
                } else {
                    self.asm
                        .mov_mr(8, &spill_slot(slot), GeneralRegister::from_index(src));
                }
            }
            (HwRegister::Spill(src), HwRegister::Spill(dst)) => {
                self.asm.mov_rm(8, GPR_SCRATCH, &spill_slot(src));
                self.asm.mov_mr(8, &spill_slot(dst), GPR_SCRATCH);
            }
            _ => unreachable!("move with unallocated operand"),
        }
    }
}
