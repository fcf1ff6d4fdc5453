//! AArch64 instruction encoder.
//!
//! Fixed 32-bit words; the subset the RTL emitter needs: moves and wide
//! immediates, loads/stores in register-offset and scaled-immediate forms,
//! the arithmetic/logical register group, variable shifts, multiply/divide,
//! bitfield extends, compares and conditional selects, scalar floating
//! point, and branches with deferred label fix-up.

/// A general purpose register number (0-30) or `zr`/`sp` as 31.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

/// The zero register (in contexts where 31 reads as `xzr`/`wzr`).
pub const ZR: Reg = Reg(31);
/// The stack pointer (in contexts where 31 reads as `sp`).
pub const SP: Reg = Reg(31);

/// A SIMD/FP register number (`v0`-`v31`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VReg(pub u8);

/// A64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// Equal.
    Eq = 0,
    /// Not equal.
    Ne = 1,
    /// Unsigned higher or same.
    Hs = 2,
    /// Unsigned lower.
    Lo = 3,
    /// Negative; also float less-than after `fcmp`.
    Mi = 4,
    /// Unsigned lower or same; also float less-or-equal after `fcmp`.
    Ls = 9,
    /// Unsigned higher.
    Hi = 8,
    /// Signed greater or equal.
    Ge = 10,
    /// Signed less than.
    Lt = 11,
    /// Signed greater than.
    Gt = 12,
    /// Signed less or equal.
    Le = 13,
}

/// Branch target handle, bound before finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(u32);

const UNBOUND: u32 = u32::MAX;

enum FixupKind {
    Branch26,
    Cond19,
}

struct Fixup {
    label: u32,
    position: usize,
    kind: FixupKind,
}

/// The instruction stream under construction.
#[derive(Default)]
pub struct Assembler {
    words: Vec<u32>,
    labels: Vec<u32>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    /// New empty assembler.
    pub fn new() -> Self {
        Self {
            words: Vec::with_capacity(128),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Emit one raw instruction word.
    pub fn word(&mut self, word: u32) {
        self.words.push(word);
    }

    /// Allocate an unbound label.
    pub fn allocate_label(&mut self) -> Label {
        self.labels.push(UNBOUND);
        Label(self.labels.len() as u32 - 1)
    }

    /// Bind a label to the current position.
    pub fn bind(&mut self, label: Label) {
        assert_eq!(self.labels[label.0 as usize], UNBOUND, "label bound twice");
        self.labels[label.0 as usize] = self.words.len() as u32;
    }

    /// Resolve branches and return the code bytes.
    pub fn finalize(self) -> Vec<u8> {
        let mut words = self.words;
        for fixup in &self.fixups {
            let target = self.labels[fixup.label as usize];
            assert_ne!(target, UNBOUND, "branch to unbound label");
            let offset = target as i64 - fixup.position as i64;
            match fixup.kind {
                FixupKind::Branch26 => {
                    assert!((-(1 << 25)..1 << 25).contains(&offset));
                    words[fixup.position] |= (offset as u32) & 0x03ff_ffff;
                }
                FixupKind::Cond19 => {
                    assert!((-(1 << 18)..1 << 18).contains(&offset));
                    words[fixup.position] |= ((offset as u32) & 0x7_ffff) << 5;
                }
            }
        }

        let mut bytes = Vec::with_capacity(words.len() * 4);
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /* Moves and immediates. */

    /// `mov xd, xm` (64-bit register move).
    pub fn mov_xx(&mut self, rd: Reg, rm: Reg) {
        self.word(0xaa00_03e0 | (rm.0 as u32) << 16 | rd.0 as u32);
    }

    /// `mov wd, wm` (32-bit move, zeroing the upper half).
    pub fn mov_ww(&mut self, rd: Reg, rm: Reg) {
        self.word(0x2a00_03e0 | (rm.0 as u32) << 16 | rd.0 as u32);
    }

    /// `mov sp`-capable move: `add xd, xn, #0`.
    pub fn mov_sp(&mut self, rd: Reg, rn: Reg) {
        self.word(0x9100_0000 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// Materialize a 64-bit immediate with `movz`/`movk`.
    pub fn load_imm64(&mut self, rd: Reg, imm: u64) {
        let mut emitted = false;
        for half in 0..4u32 {
            let chunk = (imm >> (half * 16)) as u16;
            if chunk == 0 {
                continue;
            }
            let op = if emitted { 0xf280_0000u32 } else { 0xd280_0000 };
            self.word(op | half << 21 | (chunk as u32) << 5 | rd.0 as u32);
            emitted = true;
        }
        if !emitted {
            // movz rd, #0
            self.word(0xd280_0000 | rd.0 as u32);
        }
    }

    /* Loads and stores. */

    /// Register-offset load `ldr{b,h,w,x} rt, [rn, wm, uxtw]`; the exact
    /// forms the fastmem fault handler decodes. `bytes` selects the width.
    pub fn ldr_reg_uxtw(&mut self, bytes: usize, rt: Reg, rn: Reg, rm: Reg) {
        let size = match bytes {
            1 => 0u32,
            2 => 1,
            4 => 2,
            8 => 3,
            _ => unreachable!(),
        };
        self.word(
            size << 30
                | 0b111000011 << 21
                | (rm.0 as u32) << 16
                | 0b010 << 13
                | 0b10 << 10
                | (rn.0 as u32) << 5
                | rt.0 as u32,
        );
    }

    /// Scaled unsigned-offset load `ldr{b,h,w,x} rt, [rn, #offset]`.
    /// `offset` is in bytes and must be width-aligned.
    pub fn ldr_imm(&mut self, bytes: usize, rt: Reg, rn: Reg, offset: u32) {
        let size = size_bits(bytes);
        assert_eq!(offset % bytes as u32, 0);
        let imm = offset / bytes as u32;
        assert!(imm < 4096);
        self.word(
            size << 30 | 0b111001_01 << 22 | imm << 10 | (rn.0 as u32) << 5 | rt.0 as u32,
        );
    }

    /// Scaled unsigned-offset store `str{b,h,w,x} rt, [rn, #offset]`.
    pub fn str_imm(&mut self, bytes: usize, rt: Reg, rn: Reg, offset: u32) {
        let size = size_bits(bytes);
        assert_eq!(offset % bytes as u32, 0);
        let imm = offset / bytes as u32;
        assert!(imm < 4096);
        self.word(
            size << 30 | 0b111001_00 << 22 | imm << 10 | (rn.0 as u32) << 5 | rt.0 as u32,
        );
    }

    /// Scalar FP load `ldr {s,d}t, [rn, #offset]`.
    pub fn ldr_fp_imm(&mut self, bytes: usize, vt: VReg, rn: Reg, offset: u32) {
        let size = size_bits(bytes);
        assert_eq!(offset % bytes as u32, 0);
        let imm = offset / bytes as u32;
        self.word(
            size << 30 | 0b111101_01 << 22 | imm << 10 | (rn.0 as u32) << 5 | vt.0 as u32,
        );
    }

    /// Scalar FP store `str {s,d}t, [rn, #offset]`.
    pub fn str_fp_imm(&mut self, bytes: usize, vt: VReg, rn: Reg, offset: u32) {
        let size = size_bits(bytes);
        assert_eq!(offset % bytes as u32, 0);
        let imm = offset / bytes as u32;
        self.word(
            size << 30 | 0b111101_00 << 22 | imm << 10 | (rn.0 as u32) << 5 | vt.0 as u32,
        );
    }

    /// `stp xt1, xt2, [sp, #-16]!`.
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg) {
        self.word(
            0xa980_0000
                | (0x7e << 15)
                | (rt2.0 as u32) << 10
                | (SP.0 as u32) << 5
                | rt1.0 as u32,
        );
    }

    /// `ldp xt1, xt2, [sp], #16`.
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg) {
        self.word(
            0xa8c0_0000 | (2 << 15) | (rt2.0 as u32) << 10 | (SP.0 as u32) << 5 | rt1.0 as u32,
        );
    }

    /// `stp dt1, dt2, [sp, #-16]!`.
    pub fn stp_fp_pre(&mut self, vt1: VReg, vt2: VReg) {
        self.word(
            0x6d80_0000
                | (0x7e << 15)
                | (vt2.0 as u32) << 10
                | (SP.0 as u32) << 5
                | vt1.0 as u32,
        );
    }

    /// `ldp dt1, dt2, [sp], #16`.
    pub fn ldp_fp_post(&mut self, vt1: VReg, vt2: VReg) {
        self.word(
            0x6cc0_0000 | (2 << 15) | (vt2.0 as u32) << 10 | (SP.0 as u32) << 5 | vt1.0 as u32,
        );
    }

    /// `sub sp, sp, #imm`.
    pub fn sub_sp(&mut self, imm: u32) {
        assert!(imm < 4096);
        self.word(0xd100_0000 | imm << 10 | (SP.0 as u32) << 5 | SP.0 as u32);
    }

    /// `add sp, sp, #imm`.
    pub fn add_sp(&mut self, imm: u32) {
        assert!(imm < 4096);
        self.word(0x9100_0000 | imm << 10 | (SP.0 as u32) << 5 | SP.0 as u32);
    }

    /* Arithmetic and logic, shifted-register forms. */

    /// `add xd, xn, xm`.
    pub fn add_xx(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x8b00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `sub xd, xn, xm`.
    pub fn sub_xx(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0xcb00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `neg xd, xm`.
    pub fn neg(&mut self, rd: Reg, rm: Reg) {
        self.sub_xx(rd, ZR, rm);
    }

    /// `and xd, xn, xm`.
    pub fn and_xx(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x8a00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `orr xd, xn, xm`.
    pub fn orr_xx(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0xaa00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `eor xd, xn, xm`.
    pub fn eor_xx(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0xca00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `mvn xd, xm`.
    pub fn mvn(&mut self, rd: Reg, rm: Reg) {
        // ORN with the zero register.
        self.word(0xaa20_03e0 | (rm.0 as u32) << 16 | rd.0 as u32);
    }

    /// `and xd, xn, #mask` where the mask is `ones` consecutive low bits.
    pub fn and_mask(&mut self, rd: Reg, rn: Reg, ones: u32) {
        assert!((1..=63).contains(&ones));
        self.word(0x9240_0000 | (ones - 1) << 10 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `eor xd, xn, #1`.
    pub fn eor_low_bit(&mut self, rd: Reg, rn: Reg) {
        self.word(0xd240_0000 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `tst xn, #mask` with `ones` consecutive low bits.
    pub fn tst_mask(&mut self, rn: Reg, ones: u32) {
        assert!((1..=63).contains(&ones));
        self.word(0xf240_0000 | (ones - 1) << 10 | (rn.0 as u32) << 5 | ZR.0 as u32);
    }

    /// `tst xn, xm` (64-bit).
    pub fn tst_xx(&mut self, rn: Reg, rm: Reg) {
        self.word(0xea00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | ZR.0 as u32);
    }

    /// `cmp xn, xm` (64-bit).
    pub fn cmp_xx(&mut self, rn: Reg, rm: Reg) {
        self.word(0xeb00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | ZR.0 as u32);
    }

    /// `cmp wn, wm` (32-bit).
    pub fn cmp_ww(&mut self, rn: Reg, rm: Reg) {
        self.word(0x6b00_0000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | ZR.0 as u32);
    }

    /* Variable shifts (count taken modulo the register size). */

    /// `lslv xd, xn, xm`.
    pub fn lslv_x(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x9ac0_2000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `lsrv xd, xn, xm`.
    pub fn lsrv_x(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x9ac0_2400 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `asrv xd, xn, xm`.
    pub fn asrv_x(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x9ac0_2800 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `rorv xd, xn, xm`.
    pub fn rorv_x(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x9ac0_2c00 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `lsrv wd, wn, wm`.
    pub fn lsrv_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x1ac0_2400 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `lslv wd, wn, wm`.
    pub fn lslv_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x1ac0_2000 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `asrv wd, wn, wm`.
    pub fn asrv_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x1ac0_2800 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `rorv wd, wn, wm`.
    pub fn rorv_w(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x1ac0_2c00 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `lsl xd, xn, #shift`.
    pub fn lsl_imm(&mut self, rd: Reg, rn: Reg, shift: u32) {
        assert!(shift < 64);
        // UBFM xd, xn, #(-shift mod 64), #(63-shift)
        let immr = (64 - shift) & 63;
        let imms = 63 - shift;
        self.word(
            0xd340_0000 | immr << 16 | imms << 10 | (rn.0 as u32) << 5 | rd.0 as u32,
        );
    }

    /* Multiply and divide. */

    /// `mul xd, xn, xm`.
    pub fn mul_xx(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x9b00_7c00 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `sdiv xd, xn, xm`.
    pub fn sdiv_xx(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x9ac0_0c00 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `udiv xd, xn, xm`.
    pub fn udiv_xx(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.word(0x9ac0_0800 | (rm.0 as u32) << 16 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /* Extends. */

    /// `sxtb xd, wn`.
    pub fn sxtb(&mut self, rd: Reg, rn: Reg) {
        self.word(0x9340_1c00 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `sxth xd, wn`.
    pub fn sxth(&mut self, rd: Reg, rn: Reg) {
        self.word(0x9340_3c00 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `sxtw xd, wn`.
    pub fn sxtw(&mut self, rd: Reg, rn: Reg) {
        self.word(0x9340_7c00 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `uxtb wd, wn`.
    pub fn uxtb(&mut self, rd: Reg, rn: Reg) {
        self.word(0x5300_1c00 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `uxth wd, wn`.
    pub fn uxth(&mut self, rd: Reg, rn: Reg) {
        self.word(0x5300_3c00 | (rn.0 as u32) << 5 | rd.0 as u32);
    }

    /* Conditionals. */

    /// `cset xd, cond`.
    pub fn cset(&mut self, rd: Reg, cond: Cond) {
        // CSINC xd, xzr, xzr, !cond.
        let inverted = cond as u32 ^ 1;
        self.word(0x9a9f_07e0 | inverted << 12 | rd.0 as u32);
    }

    /// `csel xd, xn, xm, cond` (`xn` when the condition holds).
    pub fn csel(&mut self, rd: Reg, rn: Reg, rm: Reg, cond: Cond) {
        self.word(
            0x9a80_0000
                | (rm.0 as u32) << 16
                | (cond as u32) << 12
                | (rn.0 as u32) << 5
                | rd.0 as u32,
        );
    }

    /* Branches and calls. */

    /// `b label`.
    pub fn b(&mut self, label: Label) {
        self.fixups.push(Fixup {
            label: label.0,
            position: self.words.len(),
            kind: FixupKind::Branch26,
        });
        self.word(0x1400_0000);
    }

    /// `b.cond label`.
    pub fn b_cond(&mut self, cond: Cond, label: Label) {
        self.fixups.push(Fixup {
            label: label.0,
            position: self.words.len(),
            kind: FixupKind::Cond19,
        });
        self.word(0x5400_0000 | cond as u32);
    }

    /// `blr xn`.
    pub fn blr(&mut self, rn: Reg) {
        self.word(0xd63f_0000 | (rn.0 as u32) << 5);
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.word(0xd65f_03c0);
    }

    /* Scalar floating point. */

    fn fp_binary(&mut self, opcode: u32, double: bool, vd: VReg, vn: VReg, vm: VReg) {
        let base = if double { 0x1e60_0000 } else { 0x1e20_0000 };
        self.word(
            base | (vm.0 as u32) << 16 | opcode << 10 | (vn.0 as u32) << 5 | vd.0 as u32,
        );
    }

    /// `fadd`.
    pub fn fadd(&mut self, double: bool, vd: VReg, vn: VReg, vm: VReg) {
        self.fp_binary(0b001010, double, vd, vn, vm);
    }

    /// `fsub`.
    pub fn fsub(&mut self, double: bool, vd: VReg, vn: VReg, vm: VReg) {
        self.fp_binary(0b001110, double, vd, vn, vm);
    }

    /// `fmul`.
    pub fn fmul(&mut self, double: bool, vd: VReg, vn: VReg, vm: VReg) {
        self.fp_binary(0b000010, double, vd, vn, vm);
    }

    /// `fdiv`.
    pub fn fdiv(&mut self, double: bool, vd: VReg, vn: VReg, vm: VReg) {
        self.fp_binary(0b000110, double, vd, vn, vm);
    }

    /// `fsqrt`.
    pub fn fsqrt(&mut self, double: bool, vd: VReg, vn: VReg) {
        let base = if double { 0x1e61_c000 } else { 0x1e21_c000 };
        self.word(base | (vn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `fmov` register to register.
    pub fn fmov_vv(&mut self, double: bool, vd: VReg, vn: VReg) {
        let base = if double { 0x1e60_4000 } else { 0x1e20_4000 };
        self.word(base | (vn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `fmov {s,d}d, {w,x}n` (bit pattern into an FP register).
    pub fn fmov_vx(&mut self, double: bool, vd: VReg, rn: Reg) {
        let base = if double { 0x9e67_0000 } else { 0x1e27_0000 };
        self.word(base | (rn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `fmov {w,x}d, {s,d}n` (bit pattern out of an FP register).
    pub fn fmov_xv(&mut self, double: bool, rd: Reg, vn: VReg) {
        let base = if double { 0x9e66_0000 } else { 0x1e26_0000 };
        self.word(base | (vn.0 as u32) << 5 | rd.0 as u32);
    }

    /// `fcmp`.
    pub fn fcmp(&mut self, double: bool, vn: VReg, vm: VReg) {
        let base = if double { 0x1e60_2000 } else { 0x1e20_2000 };
        self.word(base | (vm.0 as u32) << 16 | (vn.0 as u32) << 5);
    }

    /// `fcvt` between single and double.
    pub fn fcvt(&mut self, to_double: bool, vd: VReg, vn: VReg) {
        let base = if to_double { 0x1e22_c000 } else { 0x1e62_4000 };
        self.word(base | (vn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `scvtf {s,d}d, {w,x}n` (signed integer to float).
    pub fn scvtf(&mut self, double: bool, int64: bool, vd: VReg, rn: Reg) {
        let mut base = if double { 0x1e62_0000 } else { 0x1e22_0000 };
        if int64 {
            base |= 0x8000_0000;
        }
        self.word(base | (rn.0 as u32) << 5 | vd.0 as u32);
    }

    /// `fcvtzs {w,x}d, {s,d}n` (float to signed integer, toward zero).
    pub fn fcvtzs(&mut self, double: bool, int64: bool, rd: Reg, vn: VReg) {
        let mut base = if double { 0x1e78_0000 } else { 0x1e38_0000 };
        if int64 {
            base |= 0x8000_0000;
        }
        self.word(base | (vn.0 as u32) << 5 | rd.0 as u32);
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether the stream is still empty.
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

fn size_bits(bytes: usize) -> u32 {
    match bytes {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fastmem_forms_match_the_fault_handler_masks() {
        const LOAD_MASK: u32 = 0b11111111_11100000_11111100_00000000;
        const LOAD8_BITS: u32 = 0b00111000_01100000_01001000_00000000;
        const LOAD16_BITS: u32 = 0b01111000_01100000_01001000_00000000;
        const LOAD32_BITS: u32 = 0b10111000_01100000_01001000_00000000;
        const LOAD64_BITS: u32 = 0b11111000_01100000_01001000_00000000;

        let mut asm = Assembler::new();
        asm.ldr_reg_uxtw(1, Reg(3), Reg(21), Reg(9));
        asm.ldr_reg_uxtw(2, Reg(3), Reg(21), Reg(9));
        asm.ldr_reg_uxtw(4, Reg(3), Reg(21), Reg(9));
        asm.ldr_reg_uxtw(8, Reg(3), Reg(21), Reg(9));
        let code = asm.finalize();

        let words: Vec<u32> = code
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words[0] & LOAD_MASK, LOAD8_BITS);
        assert_eq!(words[1] & LOAD_MASK, LOAD16_BITS);
        assert_eq!(words[2] & LOAD_MASK, LOAD32_BITS);
        assert_eq!(words[3] & LOAD_MASK, LOAD64_BITS);
        // Destination register in the low five bits.
        assert_eq!(words[0] & 0x1f, 3);
    }

    #[test]
    fn known_encodings() {
        let mut asm = Assembler::new();
        asm.mov_xx(Reg(0), Reg(19)); // mov x0, x19
        asm.ret();
        let code = asm.finalize();
        assert_eq!(&code[..4], &0xaa13_03e0u32.to_le_bytes());
        assert_eq!(&code[4..], &0xd65f_03c0u32.to_le_bytes());
    }

    #[test]
    fn branch_fixups() {
        let mut asm = Assembler::new();
        let target = asm.allocate_label();
        asm.b_cond(Cond::Eq, target);
        asm.mov_xx(Reg(0), Reg(1));
        asm.bind(target);
        asm.ret();
        let code = asm.finalize();
        let first = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
        // b.eq +2 instructions.
        assert_eq!(first, 0x5400_0000 | 2 << 5);
    }

    #[test]
    fn load_imm64_uses_minimal_moves() {
        let mut asm = Assembler::new();
        asm.load_imm64(Reg(5), 0x42);
        assert_eq!(asm.len(), 1);

        let mut asm = Assembler::new();
        asm.load_imm64(Reg(5), 0xdead_beef_0000_1234);
        assert_eq!(asm.len(), 3);
    }
}
