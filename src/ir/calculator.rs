//! Constant evaluation of IR opcodes.

use crate::ir::operand::Operand;
use crate::ir::types::{is_float_type, is_integer_type, is_numeric_type, Type};

/// Evaluates constant-operand IR operations, mirroring the [`Assembler`]
/// surface but returning constant operands instead of emitting instructions.
/// Used by the optimizer's constant propagation pass.
///
/// Semantics: integer arithmetic wraps modulo the operand width; shift
/// amounts are masked modulo the width; arithmetic right shift
/// sign-extends; rotates operate on the width; float operations follow
/// IEEE-754 with NaN compares yielding false. Callers must not pass a zero
/// divisor; the optimizer only folds divisions it has proven safe.
///
/// [`Assembler`]: crate::ir::Assembler
#[derive(Debug, Default, Clone, Copy)]
pub struct Calculator;

macro_rules! unsigned_binary {
    ($a:ident, $b:ident, |$x:ident, $y:ident| $body:expr) => {{
        assert!($a.is_constant() && $b.is_constant());
        assert_eq!($a.ty(), $b.ty());
        match $a.ty() {
            Type::Integer8 => {
                let ($x, $y) = ($a.value().u8(), $b.value().u8());
                Operand::constant($body)
            }
            Type::Integer16 => {
                let ($x, $y) = ($a.value().u16(), $b.value().u16());
                Operand::constant($body)
            }
            Type::Integer32 => {
                let ($x, $y) = ($a.value().u32(), $b.value().u32());
                Operand::constant($body)
            }
            Type::Integer64 => {
                let ($x, $y) = ($a.value().u64(), $b.value().u64());
                Operand::constant($body)
            }
            ty => panic!("non-integer type {ty:?} in integer fold"),
        }
    }};
}

macro_rules! signed_binary {
    ($a:ident, $b:ident, |$x:ident, $y:ident| $body:expr) => {{
        assert!($a.is_constant() && $b.is_constant());
        assert_eq!($a.ty(), $b.ty());
        match $a.ty() {
            Type::Integer8 => {
                let ($x, $y) = ($a.value().i8(), $b.value().i8());
                Operand::constant($body)
            }
            Type::Integer16 => {
                let ($x, $y) = ($a.value().i16(), $b.value().i16());
                Operand::constant($body)
            }
            Type::Integer32 => {
                let ($x, $y) = ($a.value().i32(), $b.value().i32());
                Operand::constant($body)
            }
            Type::Integer64 => {
                let ($x, $y) = ($a.value().i64(), $b.value().i64());
                Operand::constant($body)
            }
            ty => panic!("non-integer type {ty:?} in integer fold"),
        }
    }};
}

macro_rules! shift_binary {
    ($value:ident, $count:ident, |$x:ident, $n:ident| $body:expr) => {{
        assert!($value.is_constant() && $count.is_constant());
        assert!(is_integer_type($count.ty()));
        let $n = $count.zero_extended() as u32;
        match $value.ty() {
            Type::Integer8 => {
                let $x = $value.value().u8();
                Operand::constant($body)
            }
            Type::Integer16 => {
                let $x = $value.value().u16();
                Operand::constant($body)
            }
            Type::Integer32 => {
                let $x = $value.value().u32();
                Operand::constant($body)
            }
            Type::Integer64 => {
                let $x = $value.value().u64();
                Operand::constant($body)
            }
            ty => panic!("non-integer type {ty:?} in shift fold"),
        }
    }};
}

impl Calculator {
    /// New calculator.
    pub fn new() -> Self {
        Self
    }

    /// Rotate right within the width.
    pub fn rotr(&self, value: Operand, count: Operand) -> Operand {
        shift_binary!(value, count, |x, n| x.rotate_right(n))
    }

    /// Rotate left within the width.
    pub fn rotl(&self, value: Operand, count: Operand) -> Operand {
        shift_binary!(value, count, |x, n| x.rotate_left(n))
    }

    /// Logical shift right; the count is masked modulo the width.
    pub fn shiftr(&self, value: Operand, count: Operand) -> Operand {
        shift_binary!(value, count, |x, n| x.wrapping_shr(n))
    }

    /// Logical shift left; the count is masked modulo the width.
    pub fn shiftl(&self, value: Operand, count: Operand) -> Operand {
        shift_binary!(value, count, |x, n| x.wrapping_shl(n))
    }

    /// Arithmetic shift right; sign-extending, count masked modulo width.
    pub fn ashiftr(&self, value: Operand, count: Operand) -> Operand {
        assert!(value.is_constant() && count.is_constant());
        assert!(is_integer_type(count.ty()));
        let n = count.zero_extended() as u32;
        match value.ty() {
            Type::Integer8 => Operand::constant(value.value().i8().wrapping_shr(n) as u8),
            Type::Integer16 => Operand::constant(value.value().i16().wrapping_shr(n) as u16),
            Type::Integer32 => Operand::constant(value.value().i32().wrapping_shr(n) as u32),
            Type::Integer64 => Operand::constant(value.value().i64().wrapping_shr(n) as u64),
            ty => panic!("non-integer type {ty:?} in shift fold"),
        }
    }

    /// Bitwise and.
    pub fn and(&self, a: Operand, b: Operand) -> Operand {
        if a.ty() == Type::Bool {
            return Operand::constant(a.value().bool() && b.value().bool());
        }
        unsigned_binary!(a, b, |x, y| x & y)
    }

    /// Bitwise or.
    pub fn or(&self, a: Operand, b: Operand) -> Operand {
        if a.ty() == Type::Bool {
            return Operand::constant(a.value().bool() || b.value().bool());
        }
        unsigned_binary!(a, b, |x, y| x | y)
    }

    /// Bitwise exclusive or.
    pub fn xor(&self, a: Operand, b: Operand) -> Operand {
        if a.ty() == Type::Bool {
            return Operand::constant(a.value().bool() != b.value().bool());
        }
        unsigned_binary!(a, b, |x, y| x ^ y)
    }

    /// Bitwise (or logical, for `Bool`) not.
    pub fn not(&self, source: Operand) -> Operand {
        assert!(source.is_constant());
        match source.ty() {
            Type::Integer8 => Operand::constant(!source.value().u8()),
            Type::Integer16 => Operand::constant(!source.value().u16()),
            Type::Integer32 => Operand::constant(!source.value().u32()),
            Type::Integer64 => Operand::constant(!source.value().u64()),
            Type::Bool => Operand::constant(!source.value().bool()),
            ty => panic!("invalid type {ty:?} for not"),
        }
    }

    /// Bit set or clear at `position` based on `control`.
    pub fn bsc(&self, value: Operand, control: Operand, position: Operand) -> Operand {
        assert!(control.is_constant() && control.ty() == Type::Bool);
        let bit = control.value().bool() as u64;
        let position = position.zero_extended() as u32;
        match value.ty() {
            Type::Integer8 => {
                let v = value.value().u8();
                Operand::constant(v & !(1u8 << position) | ((bit as u8) << position))
            }
            Type::Integer16 => {
                let v = value.value().u16();
                Operand::constant(v & !(1u16 << position) | ((bit as u16) << position))
            }
            Type::Integer32 => {
                let v = value.value().u32();
                Operand::constant(v & !(1u32 << position) | ((bit as u32) << position))
            }
            Type::Integer64 => {
                let v = value.value().u64();
                Operand::constant(v & !(1u64 << position) | (bit << position))
            }
            ty => panic!("invalid type {ty:?} for bsc"),
        }
    }

    /// Wrapping addition; IEEE addition for floats.
    pub fn add(&self, a: Operand, b: Operand) -> Operand {
        match a.ty() {
            Type::Float32 => Operand::constant(a.value().f32() + b.value().f32()),
            Type::Float64 => Operand::constant(a.value().f64() + b.value().f64()),
            _ => unsigned_binary!(a, b, |x, y| x.wrapping_add(y)),
        }
    }

    /// Wrapping subtraction; IEEE subtraction for floats.
    pub fn sub(&self, a: Operand, b: Operand) -> Operand {
        match a.ty() {
            Type::Float32 => Operand::constant(a.value().f32() - b.value().f32()),
            Type::Float64 => Operand::constant(a.value().f64() - b.value().f64()),
            _ => unsigned_binary!(a, b, |x, y| x.wrapping_sub(y)),
        }
    }

    /// Signed wrapping multiplication; IEEE multiplication for floats.
    pub fn mul(&self, a: Operand, b: Operand) -> Operand {
        match a.ty() {
            Type::Float32 => Operand::constant(a.value().f32() * b.value().f32()),
            Type::Float64 => Operand::constant(a.value().f64() * b.value().f64()),
            _ => signed_binary!(a, b, |x, y| x.wrapping_mul(y)),
        }
    }

    /// Unsigned wrapping multiplication.
    pub fn umul(&self, a: Operand, b: Operand) -> Operand {
        unsigned_binary!(a, b, |x, y| x.wrapping_mul(y))
    }

    /// Signed division; IEEE division for floats. The divisor must be
    /// non-zero for integer types.
    pub fn div(&self, a: Operand, b: Operand) -> Operand {
        match a.ty() {
            Type::Float32 => Operand::constant(a.value().f32() / b.value().f32()),
            Type::Float64 => Operand::constant(a.value().f64() / b.value().f64()),
            _ => signed_binary!(a, b, |x, y| x.wrapping_div(y)),
        }
    }

    /// Unsigned division. The divisor must be non-zero.
    pub fn udiv(&self, a: Operand, b: Operand) -> Operand {
        unsigned_binary!(a, b, |x, y| x.wrapping_div(y))
    }

    /// Signed truncating remainder. The divisor must be non-zero.
    pub fn modulus(&self, a: Operand, b: Operand) -> Operand {
        signed_binary!(a, b, |x, y| x.wrapping_rem(y))
    }

    /// Square root; negative inputs produce NaN.
    pub fn sqrt(&self, source: Operand) -> Operand {
        assert!(source.is_constant());
        match source.ty() {
            Type::Float32 => Operand::constant(source.value().f32().sqrt()),
            Type::Float64 => Operand::constant(source.value().f64().sqrt()),
            ty => panic!("invalid type {ty:?} for sqrt"),
        }
    }

    /// Sign-extend an `Integer8` to `Integer16`.
    pub fn extend16(&self, source: Operand) -> Operand {
        assert!(source.is_constant());
        assert_eq!(source.ty(), Type::Integer8);
        Operand::constant(source.value().i8() as i16)
    }

    /// Sign-extend to `Integer32`.
    pub fn extend32(&self, source: Operand) -> Operand {
        assert!(source.is_constant());
        match source.ty() {
            Type::Integer8 => Operand::constant(source.value().i8() as i32),
            Type::Integer16 => Operand::constant(source.value().i16() as i32),
            ty => panic!("invalid source type {ty:?} for extend32"),
        }
    }

    /// Sign-extend to `Integer64`.
    pub fn extend64(&self, source: Operand) -> Operand {
        assert!(source.is_constant());
        match source.ty() {
            Type::Integer8 => Operand::constant(source.value().i8() as i64),
            Type::Integer16 => Operand::constant(source.value().i16() as i64),
            Type::Integer32 => Operand::constant(source.value().i32() as i64),
            ty => panic!("invalid source type {ty:?} for extend64"),
        }
    }

    /// Copy the bit pattern into another type of the same width.
    pub fn bitcast(&self, out_type: Type, source: Operand) -> Operand {
        assert!(source.is_constant());
        assert!(is_numeric_type(out_type));
        assert_eq!(
            crate::ir::types::type_bytes(out_type),
            crate::ir::types::type_bytes(source.ty()),
            "bitcast widths must match"
        );
        Operand::from_parts(out_type, source.value())
    }

    /// Truncating float to integer conversion.
    pub fn castf2i(&self, out_type: Type, source: Operand) -> Operand {
        assert!(source.is_constant());
        assert!(is_integer_type(out_type));
        let wide = match source.ty() {
            Type::Float32 => source.value().f32() as i64,
            Type::Float64 => source.value().f64() as i64,
            ty => panic!("invalid source type {ty:?} for castf2i"),
        };
        match out_type {
            Type::Integer32 => Operand::constant(wide as i32),
            Type::Integer64 => Operand::constant(wide),
            ty => panic!("invalid output type {ty:?} for castf2i"),
        }
    }

    /// Integer to float conversion.
    pub fn casti2f(&self, out_type: Type, source: Operand) -> Operand {
        assert!(source.is_constant());
        assert!(is_float_type(out_type));
        let wide = match source.ty() {
            Type::Integer32 => source.value().i32() as i64,
            Type::Integer64 => source.value().i64(),
            ty => panic!("invalid source type {ty:?} for casti2f"),
        };
        match out_type {
            Type::Float32 => Operand::constant(wide as f32),
            Type::Float64 => Operand::constant(wide as f64),
            _ => unreachable!(),
        }
    }

    /// Float width change.
    pub fn resizef(&self, out_type: Type, source: Operand) -> Operand {
        assert!(source.is_constant());
        match (source.ty(), out_type) {
            (Type::Float32, Type::Float64) => Operand::constant(source.value().f32() as f64),
            (Type::Float64, Type::Float32) => Operand::constant(source.value().f64() as f32),
            (from, to) => panic!("invalid resize {from:?} -> {to:?}"),
        }
    }

    /// `(a & b) != 0`.
    pub fn test(&self, a: Operand, b: Operand) -> Operand {
        let masked = unsigned_binary!(a, b, |x, y| x & y);
        Operand::constant(!masked.is_zero())
    }

    /// Equality compare; NaN compares false.
    pub fn cmp_eq(&self, a: Operand, b: Operand) -> Operand {
        match a.ty() {
            Type::Float32 => Operand::constant(a.value().f32() == b.value().f32()),
            Type::Float64 => Operand::constant(a.value().f64() == b.value().f64()),
            Type::Bool => Operand::constant(a.value().bool() == b.value().bool()),
            _ => Operand::constant(a.zero_extended() == b.zero_extended()),
        }
    }

    /// Signed less-than; NaN compares false.
    pub fn cmp_lt(&self, a: Operand, b: Operand) -> Operand {
        match a.ty() {
            Type::Float32 => Operand::constant(a.value().f32() < b.value().f32()),
            Type::Float64 => Operand::constant(a.value().f64() < b.value().f64()),
            _ => Operand::constant(a.sign_extended() < b.sign_extended()),
        }
    }

    /// Signed less-or-equal; NaN compares false.
    pub fn cmp_lte(&self, a: Operand, b: Operand) -> Operand {
        match a.ty() {
            Type::Float32 => Operand::constant(a.value().f32() <= b.value().f32()),
            Type::Float64 => Operand::constant(a.value().f64() <= b.value().f64()),
            _ => Operand::constant(a.sign_extended() <= b.sign_extended()),
        }
    }

    /// Signed greater-than via swapped less-than.
    pub fn cmp_gt(&self, a: Operand, b: Operand) -> Operand {
        self.cmp_lt(b, a)
    }

    /// Signed greater-or-equal via swapped less-or-equal.
    pub fn cmp_gte(&self, a: Operand, b: Operand) -> Operand {
        self.cmp_lte(b, a)
    }

    /// Unsigned less-than.
    pub fn cmp_ult(&self, a: Operand, b: Operand) -> Operand {
        Operand::constant(a.zero_extended() < b.zero_extended())
    }

    /// Unsigned less-or-equal.
    pub fn cmp_ulte(&self, a: Operand, b: Operand) -> Operand {
        Operand::constant(a.zero_extended() <= b.zero_extended())
    }

    /// Unsigned greater-than via swapped unsigned less-than.
    pub fn cmp_ugt(&self, a: Operand, b: Operand) -> Operand {
        self.cmp_ult(b, a)
    }

    /// Unsigned greater-or-equal via swapped unsigned less-or-equal.
    pub fn cmp_ugte(&self, a: Operand, b: Operand) -> Operand {
        self.cmp_ulte(b, a)
    }

    /// `decision ? if_true : if_false`.
    pub fn select(&self, decision: Operand, if_false: Operand, if_true: Operand) -> Operand {
        assert!(decision.is_constant() && decision.ty() == Type::Bool);
        assert_eq!(if_false.ty(), if_true.ty());
        if decision.value().bool() {
            if_true
        } else {
            if_false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic_wraps() {
        let calc = Calculator::new();
        let max = Operand::constant(u8::MAX);
        let one = Operand::constant(1u8);
        let sum = calc.add(max, one);
        assert_eq!(sum.ty(), Type::Integer8);
        assert_eq!(sum.value().u8(), 0);
    }

    #[test]
    fn shifts_mask_the_count() {
        let calc = Calculator::new();
        let v = Operand::constant(0x80u8);
        let count = Operand::constant(9u8);
        // 9 % 8 == 1
        assert_eq!(calc.shiftr(v, count).value().u8(), 0x40);
    }

    #[test]
    fn arithmetic_shift_sign_extends() {
        let calc = Calculator::new();
        let v = Operand::constant(-32i32);
        let count = Operand::constant(2u8);
        assert_eq!(calc.ashiftr(v, count).value().i32(), -8);
    }

    #[test]
    fn rotate_operates_on_the_width() {
        let calc = Calculator::new();
        let v = Operand::constant(0xfffffffeu32);
        let count = Operand::constant(1u32);
        assert_eq!(calc.rotr(v, count).value().u32(), 0x7fffffff);
    }

    #[test]
    fn nan_compares_false() {
        let calc = Calculator::new();
        let nan = Operand::constant(f32::NAN);
        assert!(!calc.cmp_eq(nan, nan).value().bool());
        assert!(!calc.cmp_lt(nan, nan).value().bool());
    }

    #[test]
    fn sqrt_of_negative_is_nan() {
        let calc = Calculator::new();
        let v = Operand::constant(-1.0f64);
        assert!(calc.sqrt(v).value().f64().is_nan());
    }

    #[test]
    fn extends_sign_extend() {
        let calc = Calculator::new();
        let v = Operand::constant(0xffu8);
        assert_eq!(calc.extend16(v).value().u16(), 0xffff);
        assert_eq!(calc.extend32(v).value().u32(), 0xffffffff);
        assert_eq!(calc.extend64(v).value().u64(), u64::MAX);
    }

    #[test]
    fn signed_unsigned_multiply_differ_only_in_type() {
        let calc = Calculator::new();
        let a = Operand::constant(-5i32);
        let b = Operand::constant(7i32);
        assert_eq!(calc.mul(a, b).value().i32(), -35);

        let a = Operand::constant(5u32);
        let b = Operand::constant(7u32);
        assert_eq!(calc.umul(a, b).value().u32(), 35);
    }
}
