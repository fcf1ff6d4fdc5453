//! x86-64 instruction encoder.
//!
//! Covers the subset of the ISA the RTL emitter needs: `mov` in all widths
//! and addressing forms, the classic ALU group, shifts and rotates by `CL`
//! or immediate, multiply/divide, `movzx`/`movsx`, `setcc`/`cmovcc`, stack
//! and call plumbing, rel32 branches with deferred label fix-up, and the
//! scalar SSE operations.

/// General purpose registers in hardware numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum GeneralRegister {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl GeneralRegister {
    /// Recover a register from its hardware number.
    pub fn from_index(index: u8) -> Self {
        assert!(index < 16);
        // Discriminants are the hardware numbers.
        unsafe { std::mem::transmute(index) }
    }

    const fn number(self) -> u8 {
        self as u8
    }
}

/// SSE registers in hardware numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum VectorRegister {
    XMM0 = 0,
    XMM1 = 1,
    XMM2 = 2,
    XMM3 = 3,
    XMM4 = 4,
    XMM5 = 5,
    XMM6 = 6,
    XMM7 = 7,
    XMM8 = 8,
    XMM9 = 9,
    XMM10 = 10,
    XMM11 = 11,
    XMM12 = 12,
    XMM13 = 13,
    XMM14 = 14,
    XMM15 = 15,
}

impl VectorRegister {
    /// Recover a register from its hardware number.
    pub fn from_index(index: u8) -> Self {
        assert!(index < 16);
        unsafe { std::mem::transmute(index) }
    }

    const fn number(self) -> u8 {
        self as u8
    }
}

/// A `[base + index*scale + disp]` memory operand.
#[derive(Debug, Clone, Copy)]
pub struct Address {
    /// Base register.
    pub base: GeneralRegister,
    /// Optional index register; must not be `RSP`.
    pub index: Option<GeneralRegister>,
    /// Scale factor 1, 2, 4 or 8.
    pub scale: u8,
    /// Signed displacement.
    pub disp: i32,
}

impl Address {
    /// `[base + disp]`.
    pub const fn base_disp(base: GeneralRegister, disp: i32) -> Self {
        Self {
            base,
            index: None,
            scale: 1,
            disp,
        }
    }

    /// `[base + index*scale]`.
    pub const fn base_index(base: GeneralRegister, index: GeneralRegister, scale: u8) -> Self {
        Self {
            base,
            index: Some(index),
            scale,
            disp: 0,
        }
    }
}

/// Either a register or a memory operand; the shape returned by guest
/// register addressing callbacks.
#[derive(Debug, Clone, Copy)]
pub enum RegMemAny {
    /// A general purpose register.
    Reg(GeneralRegister),
    /// A memory operand.
    Mem(Address),
}

/// Condition codes for `setcc`/`cmovcc`/`jcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// Equal / zero.
    E = 0x4,
    /// Not equal / not zero.
    Ne = 0x5,
    /// Below (unsigned <).
    B = 0x2,
    /// Above or equal (unsigned >=).
    Ae = 0x3,
    /// Below or equal (unsigned <=).
    Be = 0x6,
    /// Above (unsigned >).
    A = 0x7,
    /// Less (signed <).
    L = 0xc,
    /// Greater or equal (signed >=).
    Ge = 0xd,
    /// Less or equal (signed <=).
    Le = 0xe,
    /// Greater (signed >).
    G = 0xf,
    /// Parity set (unordered float compare).
    P = 0xa,
    /// Parity clear (ordered float compare).
    Np = 0xb,
}

/// ALU operations sharing the `op r, r/m` encoding family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    /// Addition.
    Add,
    /// Bitwise or.
    Or,
    /// Bitwise and.
    And,
    /// Subtraction.
    Sub,
    /// Bitwise exclusive or.
    Xor,
    /// Compare (subtract, flags only).
    Cmp,
}

impl AluOp {
    /// Opcode for the `reg <- reg op r/m` direction, 8-bit form; the wider
    /// form is one higher.
    const fn opcode8(self) -> u8 {
        match self {
            AluOp::Add => 0x02,
            AluOp::Or => 0x0a,
            AluOp::And => 0x22,
            AluOp::Sub => 0x2a,
            AluOp::Xor => 0x32,
            AluOp::Cmp => 0x3a,
        }
    }

    /// `/digit` for the immediate form `0x80/0x81`.
    const fn digit(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }
}

/// Shift and rotate operations of the `0xC0/0xD2` group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    /// Rotate left.
    Rol,
    /// Rotate right.
    Ror,
    /// Shift left.
    Shl,
    /// Logical shift right.
    Shr,
    /// Arithmetic shift right.
    Sar,
}

impl ShiftOp {
    const fn digit(self) -> u8 {
        match self {
            ShiftOp::Rol => 0,
            ShiftOp::Ror => 1,
            ShiftOp::Shl => 4,
            ShiftOp::Shr => 5,
            ShiftOp::Sar => 7,
        }
    }
}

/// Branch target handle. Offsets of `u32::MAX` mean "not yet bound"; every
/// label must be bound before [`Assembler::finalize`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

const UNBOUND: u32 = u32::MAX;

struct Fixup {
    label: u32,
    /// Position of the rel32 field.
    position: usize,
}

/// The instruction stream under construction.
#[derive(Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<u32>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    /// New empty assembler.
    pub fn new() -> Self {
        Self {
            code: Vec::with_capacity(512),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Current length of the emitted stream.
    pub fn position(&self) -> usize {
        self.code.len()
    }

    /// Allocate an unbound label.
    pub fn allocate_label(&mut self) -> Label {
        self.labels.push(UNBOUND);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind a label to the current position.
    pub fn bind(&mut self, label: Label) {
        assert_eq!(self.labels[label.0 as usize], UNBOUND, "label bound twice");
        self.labels[label.0 as usize] = self.code.len() as u32;
    }

    /// Resolve every rel32 reference and return the code. Panics on unbound
    /// labels; that is an emitter bug.
    pub fn finalize(mut self) -> Vec<u8> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label as usize];
            assert_ne!(target, UNBOUND, "branch to unbound label");
            let rel = target as i64 - (fixup.position as i64 + 4);
            let rel = i32::try_from(rel).expect("branch displacement overflow");
            self.code[fixup.position..fixup.position + 4].copy_from_slice(&rel.to_le_bytes());
        }
        self.code
    }

    fn byte(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Legacy prefixes, then REX when required. `reg`/`index`/`rm` are raw
    /// register numbers feeding the R/X/B extension bits.
    fn prefixes(&mut self, size: u8, prefix: Option<u8>, reg: u8, index: u8, rm: u8) {
        if size == 2 {
            self.byte(0x66);
        }
        if let Some(prefix) = prefix {
            self.byte(prefix);
        }

        let w = size == 8;
        let r = reg >= 8;
        let x = index >= 8;
        let b = rm >= 8;
        // Byte-register access to SPL/BPL/SIL/DIL needs an empty REX.
        let force = size == 1 && (4..8).contains(&reg) || size == 1 && (4..8).contains(&rm);
        if w || r || x || b || force {
            self.byte(0x40 | (w as u8) << 3 | (r as u8) << 2 | (x as u8) << 1 | b as u8);
        }
    }

    fn modrm(&mut self, modbits: u8, reg: u8, rm: u8) {
        self.byte(modbits << 6 | (reg & 7) << 3 | (rm & 7));
    }

    /// ModRM (+SIB, +disp) for a memory operand.
    fn modrm_mem(&mut self, reg: u8, addr: &Address) {
        let base = addr.base.number();
        let need_sib = addr.index.is_some() || base & 7 == 4;

        // RBP/R13 bases have no disp-less encoding.
        let (modbits, disp_size) = if addr.disp == 0 && base & 7 != 5 {
            (0u8, 0usize)
        } else if i8::try_from(addr.disp).is_ok() {
            (1, 1)
        } else {
            (2, 4)
        };

        if need_sib {
            self.modrm(modbits, reg, 4);
            let scale_bits = match addr.scale {
                1 => 0u8,
                2 => 1,
                4 => 2,
                8 => 3,
                scale => panic!("invalid scale {scale}"),
            };
            let index = match addr.index {
                Some(index) => {
                    assert_ne!(index, GeneralRegister::RSP, "RSP cannot index");
                    index.number() & 7
                }
                None => 4,
            };
            self.byte(scale_bits << 6 | index << 3 | (base & 7));
        } else {
            self.modrm(modbits, reg, base);
        }

        match disp_size {
            0 => {}
            1 => self.byte(addr.disp as i8 as u8),
            _ => self.code.extend_from_slice(&addr.disp.to_le_bytes()),
        }
    }

    fn index_number(addr: &Address) -> u8 {
        addr.index.map(GeneralRegister::number).unwrap_or(0)
    }

    /* Moves. */

    /// `mov dst, src` between general registers.
    pub fn mov_rr(&mut self, size: u8, dst: GeneralRegister, src: GeneralRegister) {
        self.prefixes(size, None, dst.number(), 0, src.number());
        self.byte(if size == 1 { 0x8a } else { 0x8b });
        self.modrm(3, dst.number(), src.number());
    }

    /// `mov dst, [addr]`.
    pub fn mov_rm(&mut self, size: u8, dst: GeneralRegister, addr: &Address) {
        self.prefixes(
            size,
            None,
            dst.number(),
            Self::index_number(addr),
            addr.base.number(),
        );
        self.byte(if size == 1 { 0x8a } else { 0x8b });
        self.modrm_mem(dst.number(), addr);
    }

    /// `mov [addr], src`.
    pub fn mov_mr(&mut self, size: u8, addr: &Address, src: GeneralRegister) {
        self.prefixes(
            size,
            None,
            src.number(),
            Self::index_number(addr),
            addr.base.number(),
        );
        self.byte(if size == 1 { 0x88 } else { 0x89 });
        self.modrm_mem(src.number(), addr);
    }

    /// `mov dst, imm64` (full-width immediate).
    pub fn mov_ri64(&mut self, dst: GeneralRegister, imm: u64) {
        self.prefixes(8, None, 0, 0, dst.number());
        self.byte(0xb8 + (dst.number() & 7));
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `mov dst, imm32`, zero-extending into the full register.
    pub fn mov_ri32(&mut self, dst: GeneralRegister, imm: u32) {
        self.prefixes(4, None, 0, 0, dst.number());
        self.byte(0xb8 + (dst.number() & 7));
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /* ALU group. */

    /// `op dst, src`.
    pub fn alu_rr(&mut self, op: AluOp, size: u8, dst: GeneralRegister, src: GeneralRegister) {
        self.prefixes(size, None, dst.number(), 0, src.number());
        self.byte(if size == 1 {
            op.opcode8()
        } else {
            op.opcode8() + 1
        });
        self.modrm(3, dst.number(), src.number());
    }

    /// `op dst, [addr]`.
    pub fn alu_rm(&mut self, op: AluOp, size: u8, dst: GeneralRegister, addr: &Address) {
        self.prefixes(
            size,
            None,
            dst.number(),
            Self::index_number(addr),
            addr.base.number(),
        );
        self.byte(if size == 1 {
            op.opcode8()
        } else {
            op.opcode8() + 1
        });
        self.modrm_mem(dst.number(), addr);
    }

    /// `op dst, imm32` (sign-extended for 64-bit operand size). Only the
    /// 32/64-bit operand sizes are supported; narrower operations widen
    /// instead, since their consumers read the low bits anyway.
    pub fn alu_ri(&mut self, op: AluOp, size: u8, dst: GeneralRegister, imm: i32) {
        assert!(size >= 4, "immediate ALU forms are 32/64-bit only");
        self.prefixes(size, None, 0, 0, dst.number());
        if i8::try_from(imm).is_ok() {
            self.byte(0x83);
            self.modrm(3, op.digit(), dst.number());
            self.byte(imm as i8 as u8);
        } else {
            self.byte(0x81);
            self.modrm(3, op.digit(), dst.number());
            self.code.extend_from_slice(&imm.to_le_bytes());
        }
    }

    /// `test a, b` (AND, flags only).
    pub fn test_rr(&mut self, size: u8, a: GeneralRegister, b: GeneralRegister) {
        self.prefixes(size, None, b.number(), 0, a.number());
        self.byte(if size == 1 { 0x84 } else { 0x85 });
        self.modrm(3, b.number(), a.number());
    }

    /// `not r`.
    pub fn not_r(&mut self, size: u8, r: GeneralRegister) {
        self.prefixes(size, None, 0, 0, r.number());
        self.byte(if size == 1 { 0xf6 } else { 0xf7 });
        self.modrm(3, 2, r.number());
    }

    /* Shifts and rotates. */

    /// `op r, cl`.
    pub fn shift_cl(&mut self, op: ShiftOp, size: u8, r: GeneralRegister) {
        self.prefixes(size, None, 0, 0, r.number());
        self.byte(if size == 1 { 0xd2 } else { 0xd3 });
        self.modrm(3, op.digit(), r.number());
    }

    /// `op r, imm8`.
    pub fn shift_imm(&mut self, op: ShiftOp, size: u8, r: GeneralRegister, imm: u8) {
        self.prefixes(size, None, 0, 0, r.number());
        self.byte(if size == 1 { 0xc0 } else { 0xc1 });
        self.modrm(3, op.digit(), r.number());
        self.byte(imm);
    }

    /* Multiply / divide. */

    /// `imul dst, src` (two-operand signed multiply, 16 bits and wider).
    pub fn imul_rr(&mut self, size: u8, dst: GeneralRegister, src: GeneralRegister) {
        assert!(size >= 2);
        self.prefixes(size, None, dst.number(), 0, src.number());
        self.byte(0x0f);
        self.byte(0xaf);
        self.modrm(3, dst.number(), src.number());
    }

    /// `div r` (unsigned RDX:RAX divide).
    pub fn div_r(&mut self, size: u8, r: GeneralRegister) {
        self.prefixes(size, None, 0, 0, r.number());
        self.byte(if size == 1 { 0xf6 } else { 0xf7 });
        self.modrm(3, 6, r.number());
    }

    /// `idiv r` (signed RDX:RAX divide).
    pub fn idiv_r(&mut self, size: u8, r: GeneralRegister) {
        self.prefixes(size, None, 0, 0, r.number());
        self.byte(if size == 1 { 0xf6 } else { 0xf7 });
        self.modrm(3, 7, r.number());
    }

    /// Sign-extend RAX into RDX:RAX for the operand size (`cdq`/`cqo`).
    pub fn sign_extend_rdx(&mut self, size: u8) {
        self.prefixes(size, None, 0, 0, 0);
        self.byte(0x99);
    }

    /* Width conversions. */

    /// `movzx dst, src` from an 8- or 16-bit source into a 32-bit
    /// destination (implicitly zeroing the upper half).
    pub fn movzx(&mut self, dst: GeneralRegister, src: GeneralRegister, from_size: u8) {
        // The source width drives the REX decision for byte registers.
        let force = from_size == 1 && (4..8).contains(&src.number());
        let r = dst.number() >= 8;
        let b = src.number() >= 8;
        if r || b || force {
            self.byte(0x40 | (r as u8) << 2 | b as u8);
        }
        self.byte(0x0f);
        self.byte(if from_size == 1 { 0xb6 } else { 0xb7 });
        self.modrm(3, dst.number(), src.number());
    }

    /// `movsx`/`movsxd dst, src`.
    pub fn movsx(&mut self, dst: GeneralRegister, src: GeneralRegister, from_size: u8, to_size: u8) {
        self.prefixes(to_size, None, dst.number(), 0, src.number());
        match from_size {
            1 => {
                self.byte(0x0f);
                self.byte(0xbe);
            }
            2 => {
                self.byte(0x0f);
                self.byte(0xbf);
            }
            4 => {
                assert_eq!(to_size, 8);
                self.byte(0x63);
            }
            _ => panic!("invalid movsx source width"),
        }
        self.modrm(3, dst.number(), src.number());
    }

    /* Flags. */

    /// `setcc dst8`.
    pub fn setcc(&mut self, cond: Cond, dst: GeneralRegister) {
        self.prefixes(1, None, 0, 0, dst.number());
        self.byte(0x0f);
        self.byte(0x90 + cond as u8);
        self.modrm(3, 0, dst.number());
    }

    /// `cmovcc dst, src`.
    pub fn cmovcc(&mut self, cond: Cond, size: u8, dst: GeneralRegister, src: GeneralRegister) {
        assert!(size >= 4);
        self.prefixes(size, None, dst.number(), 0, src.number());
        self.byte(0x0f);
        self.byte(0x40 + cond as u8);
        self.modrm(3, dst.number(), src.number());
    }

    /* Stack, calls, branches. */

    /// `push r`.
    pub fn push_r(&mut self, r: GeneralRegister) {
        if r.number() >= 8 {
            self.byte(0x41);
        }
        self.byte(0x50 + (r.number() & 7));
    }

    /// `pop r`.
    pub fn pop_r(&mut self, r: GeneralRegister) {
        if r.number() >= 8 {
            self.byte(0x41);
        }
        self.byte(0x58 + (r.number() & 7));
    }

    /// `call r`.
    pub fn call_r(&mut self, r: GeneralRegister) {
        if r.number() >= 8 {
            self.byte(0x41);
        }
        self.byte(0xff);
        self.modrm(3, 2, r.number());
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.byte(0xc3);
    }

    /// `sub rsp, imm`.
    pub fn sub_rsp(&mut self, imm: i32) {
        self.alu_ri(AluOp::Sub, 8, GeneralRegister::RSP, imm);
    }

    /// `add rsp, imm`.
    pub fn add_rsp(&mut self, imm: i32) {
        self.alu_ri(AluOp::Add, 8, GeneralRegister::RSP, imm);
    }

    /// `jmp label` (rel32, fixed up at finalize).
    pub fn jmp(&mut self, label: Label) {
        self.byte(0xe9);
        self.fixups.push(Fixup {
            label: label.0,
            position: self.code.len(),
        });
        self.code.extend_from_slice(&[0; 4]);
    }

    /// `jcc label` (rel32, fixed up at finalize).
    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.byte(0x0f);
        self.byte(0x80 + cond as u8);
        self.fixups.push(Fixup {
            label: label.0,
            position: self.code.len(),
        });
        self.code.extend_from_slice(&[0; 4]);
    }

    /* Scalar SSE. */

    fn sse_rr(&mut self, prefix: Option<u8>, opcode: u8, w: bool, reg: u8, rm: u8) {
        if let Some(prefix) = prefix {
            self.byte(prefix);
        }
        let r = reg >= 8;
        let b = rm >= 8;
        if w || r || b {
            self.byte(0x40 | (w as u8) << 3 | (r as u8) << 2 | b as u8);
        }
        self.byte(0x0f);
        self.byte(opcode);
        self.modrm(3, reg, rm);
    }

    fn sse_scalar(&mut self, opcode: u8, double: bool, dst: VectorRegister, src: VectorRegister) {
        self.sse_rr(
            Some(if double { 0xf2 } else { 0xf3 }),
            opcode,
            false,
            dst.number(),
            src.number(),
        );
    }

    /// `addss`/`addsd`.
    pub fn adds(&mut self, double: bool, dst: VectorRegister, src: VectorRegister) {
        self.sse_scalar(0x58, double, dst, src);
    }

    /// `subss`/`subsd`.
    pub fn subs(&mut self, double: bool, dst: VectorRegister, src: VectorRegister) {
        self.sse_scalar(0x5c, double, dst, src);
    }

    /// `mulss`/`mulsd`.
    pub fn muls(&mut self, double: bool, dst: VectorRegister, src: VectorRegister) {
        self.sse_scalar(0x59, double, dst, src);
    }

    /// `divss`/`divsd`.
    pub fn divs(&mut self, double: bool, dst: VectorRegister, src: VectorRegister) {
        self.sse_scalar(0x5e, double, dst, src);
    }

    /// `sqrtss`/`sqrtsd`.
    pub fn sqrts(&mut self, double: bool, dst: VectorRegister, src: VectorRegister) {
        self.sse_scalar(0x51, double, dst, src);
    }

    /// `movss`/`movsd` register to register.
    pub fn movs_xx(&mut self, double: bool, dst: VectorRegister, src: VectorRegister) {
        self.sse_scalar(0x10, double, dst, src);
    }

    /// `movss`/`movsd` load.
    pub fn movs_xm(&mut self, double: bool, dst: VectorRegister, addr: &Address) {
        self.byte(if double { 0xf2 } else { 0xf3 });
        let r = dst.number() >= 8;
        let x = Self::index_number(addr) >= 8;
        let b = addr.base.number() >= 8;
        if r || x || b {
            self.byte(0x40 | (r as u8) << 2 | (x as u8) << 1 | b as u8);
        }
        self.byte(0x0f);
        self.byte(0x10);
        self.modrm_mem(dst.number(), addr);
    }

    /// `movss`/`movsd` store.
    pub fn movs_mx(&mut self, double: bool, addr: &Address, src: VectorRegister) {
        self.byte(if double { 0xf2 } else { 0xf3 });
        let r = src.number() >= 8;
        let x = Self::index_number(addr) >= 8;
        let b = addr.base.number() >= 8;
        if r || x || b {
            self.byte(0x40 | (r as u8) << 2 | (x as u8) << 1 | b as u8);
        }
        self.byte(0x0f);
        self.byte(0x11);
        self.modrm_mem(src.number(), addr);
    }

    /// `movd`/`movq xmm, r`.
    pub fn mov_xr(&mut self, size: u8, dst: VectorRegister, src: GeneralRegister) {
        self.byte(0x66);
        self.sse_rr(None, 0x6e, size == 8, dst.number(), src.number());
    }

    /// `movd`/`movq r, xmm`.
    pub fn mov_rx(&mut self, size: u8, dst: GeneralRegister, src: VectorRegister) {
        self.byte(0x66);
        self.sse_rr(None, 0x7e, size == 8, src.number(), dst.number());
    }

    /// `ucomiss`/`ucomisd a, b`.
    pub fn ucomis(&mut self, double: bool, a: VectorRegister, b: VectorRegister) {
        if double {
            self.byte(0x66);
        }
        self.sse_rr(None, 0x2e, false, a.number(), b.number());
    }

    /// `cvtss2sd`/`cvtsd2ss`.
    pub fn cvt_float(&mut self, to_double: bool, dst: VectorRegister, src: VectorRegister) {
        // The prefix names the source width.
        self.sse_scalar(0x5a, !to_double, dst, src);
    }

    /// `cvttss2si`/`cvttsd2si dst, src` (truncating).
    pub fn cvt_float_int(
        &mut self,
        double: bool,
        int_size: u8,
        dst: GeneralRegister,
        src: VectorRegister,
    ) {
        self.byte(if double { 0xf2 } else { 0xf3 });
        let w = int_size == 8;
        let r = dst.number() >= 8;
        let b = src.number() >= 8;
        if w || r || b {
            self.byte(0x40 | (w as u8) << 3 | (r as u8) << 2 | b as u8);
        }
        self.byte(0x0f);
        self.byte(0x2c);
        self.modrm(3, dst.number(), src.number());
    }

    /// `cvtsi2ss`/`cvtsi2sd dst, src`.
    pub fn cvt_int_float(
        &mut self,
        double: bool,
        int_size: u8,
        dst: VectorRegister,
        src: GeneralRegister,
    ) {
        self.byte(if double { 0xf2 } else { 0xf3 });
        let w = int_size == 8;
        let r = dst.number() >= 8;
        let b = src.number() >= 8;
        if w || r || b {
            self.byte(0x40 | (w as u8) << 3 | (r as u8) << 2 | b as u8);
        }
        self.byte(0x0f);
        self.byte(0x2a);
        self.modrm(3, dst.number(), src.number());
    }

    /// The emitted bytes so far (labels unresolved).
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use GeneralRegister::*;

    fn emit(build: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut asm = Assembler::new();
        build(&mut asm);
        asm.finalize()
    }

    #[test]
    fn mov_register_forms() {
        assert_eq!(emit(|a| a.mov_rr(8, RAX, RBX)), vec![0x48, 0x8b, 0xc3]);
        assert_eq!(emit(|a| a.mov_rr(4, RCX, RDX)), vec![0x8b, 0xca]);
        assert_eq!(emit(|a| a.mov_rr(1, R9, RAX)), vec![0x44, 0x8a, 0xc8]);
    }

    #[test]
    fn fastmem_load_form() {
        // mov eax, [r12 + r9*1] - the exact pattern the fault handler
        // decodes: REX(X,B), 8B, modrm with SIB, SIB byte.
        let bytes = emit(|a| a.mov_rm(4, RAX, &Address::base_index(R12, R9, 1)));
        assert_eq!(bytes, vec![0x43, 0x8b, 0x04, 0x0c]);

        let bytes = emit(|a| a.mov_rm(2, RBX, &Address::base_index(R12, R9, 1)));
        assert_eq!(bytes, vec![0x66, 0x43, 0x8b, 0x1c, 0x0c]);
    }

    #[test]
    fn base_disp_addressing() {
        // mov rax, [rbx + 0x10]
        assert_eq!(
            emit(|a| a.mov_rm(8, RAX, &Address::base_disp(RBX, 0x10))),
            vec![0x48, 0x8b, 0x43, 0x10]
        );
        // RBP base requires a displacement byte even when zero.
        assert_eq!(
            emit(|a| a.mov_rm(8, RAX, &Address::base_disp(RBP, 0))),
            vec![0x48, 0x8b, 0x45, 0x00]
        );
        // R12 base always takes a SIB byte.
        assert_eq!(
            emit(|a| a.mov_rm(4, RAX, &Address::base_disp(R12, 0))),
            vec![0x41, 0x8b, 0x04, 0x24]
        );
    }

    #[test]
    fn labels_resolve_forward() {
        let mut asm = Assembler::new();
        let target = asm.allocate_label();
        asm.jmp(target);
        asm.mov_ri32(RAX, 1);
        asm.bind(target);
        asm.ret();
        let code = asm.finalize();
        // jmp rel32 over the 5-byte mov.
        assert_eq!(&code[..5], &[0xe9, 0x05, 0x00, 0x00, 0x00]);
        assert_eq!(code[code.len() - 1], 0xc3);
    }

    #[test]
    #[should_panic]
    fn unbound_label_panics() {
        let mut asm = Assembler::new();
        let label = asm.allocate_label();
        asm.jmp(label);
        asm.finalize();
    }

    #[test]
    fn stack_and_call() {
        assert_eq!(emit(|a| a.push_r(R9)), vec![0x41, 0x51]);
        assert_eq!(emit(|a| a.pop_r(RBX)), vec![0x5b]);
        assert_eq!(emit(|a| a.call_r(R10)), vec![0x41, 0xff, 0xd2]);
        assert_eq!(emit(|a| a.sub_rsp(8)), vec![0x48, 0x83, 0xec, 0x08]);
    }

    #[test]
    fn setcc_uses_rex_for_new_byte_registers() {
        assert_eq!(emit(|a| a.setcc(Cond::E, R9)), vec![0x41, 0x0f, 0x94, 0xc1]);
        assert_eq!(emit(|a| a.setcc(Cond::B, RAX)), vec![0x0f, 0x92, 0xc0]);
    }

    #[test]
    fn divide_plumbing() {
        // mov rax, r9; cqo; idiv r10
        let code = emit(|a| {
            a.mov_rr(8, RAX, R9);
            a.sign_extend_rdx(8);
            a.idiv_r(8, R10);
        });
        assert_eq!(
            code,
            vec![0x49, 0x8b, 0xc1, 0x48, 0x99, 0x49, 0xf7, 0xfa]
        );
    }
}
