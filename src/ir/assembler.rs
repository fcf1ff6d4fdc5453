//! Builder surface for emitting IR.

use crate::guest::{HostFn0, HostFn1, HostFn2, HostFnVoid0};
use crate::ir::instruction::Instruction;
use crate::ir::opcode::Opcode;
use crate::ir::operand::Operand;
use crate::ir::types::{is_float_type, is_integer_type, is_numeric_type, Type};
use crate::ir::unit::ExecutionUnit;

/// State for creating an IR program. Guest front-ends call the opcode
/// methods to append instructions to the in-progress [`ExecutionUnit`].
///
/// Every method validates its operand types; violations are programmer
/// errors in the front-end and panic. There is no runtime error surface.
#[derive(Default)]
pub struct Assembler {
    unit: ExecutionUnit,
}

impl Assembler {
    /// New assembler with an empty unit.
    pub fn new() -> Self {
        Self::default()
    }

    /// New assembler whose unit reserves SSA registers below
    /// `register_offset`.
    pub fn with_register_offset(register_offset: u32) -> Self {
        Self {
            unit: ExecutionUnit::with_register_offset(register_offset),
        }
    }

    /// Allocate a new SSA register of the given type.
    pub fn allocate_register(&mut self, ty: Type) -> Operand {
        self.unit.allocate_register(ty)
    }

    /// Return the generated unit and reset internal state for assembly of a
    /// new one. Called by guest-specific `assemble()` implementations.
    pub fn export_unit(&mut self) -> ExecutionUnit {
        std::mem::take(&mut self.unit)
    }

    /// Number of instructions emitted so far.
    pub fn instruction_count(&self) -> u32 {
        self.unit.instructions().len() as u32
    }

    /// Typed read of a guest register. `index` must be a constant
    /// `Integer16`.
    pub fn readgr(&mut self, ty: Type, index: Operand) -> Operand {
        assert!(is_numeric_type(ty));
        assert!(index.is_valid() && index.is_constant());
        assert_eq!(index.ty(), Type::Integer16);

        let result = self.unit.allocate_register(ty);
        self.push(Opcode::ReadGuest, ty, &[result], &[index]);
        result
    }

    /// Typed write of a guest register. `index` must be a constant
    /// `Integer16`; `value` must be numeric.
    pub fn writegr(&mut self, index: Operand, value: Operand) {
        assert!(value.is_valid());
        assert!(is_numeric_type(value.ty()));
        assert!(index.is_valid() && index.is_constant());
        assert_eq!(index.ty(), Type::Integer16);

        self.push(Opcode::WriteGuest, value.ty(), &[], &[index, value]);
    }

    /// Typed load from guest memory. Addresses are `Integer32`.
    pub fn load(&mut self, ty: Type, address: Operand) -> Operand {
        assert!(is_numeric_type(ty));
        assert!(address.is_valid());
        assert_eq!(address.ty(), Type::Integer32);

        let result = self.unit.allocate_register(ty);
        self.push(Opcode::Load, ty, &[result], &[address]);
        result
    }

    /// Typed store to guest memory. The value's type provides the width.
    pub fn store(&mut self, address: Operand, value: Operand) {
        assert!(address.is_valid() && value.is_valid());
        assert!(is_numeric_type(value.ty()));
        assert_eq!(address.ty(), Type::Integer32);

        self.push(Opcode::Store, value.ty(), &[], &[address, value]);
    }

    fn shift_like(&mut self, opcode: Opcode, value: Operand, count: Operand) -> Operand {
        assert!(value.is_valid() && count.is_valid());
        assert!(is_integer_type(value.ty()));
        assert!(is_integer_type(count.ty()));

        let result = self.unit.allocate_register(value.ty());
        self.push(opcode, value.ty(), &[result], &[value, count]);
        result
    }

    /// Rotate right within the value's width.
    pub fn rotr(&mut self, value: Operand, count: Operand) -> Operand {
        self.shift_like(Opcode::RotateRight, value, count)
    }

    /// Rotate left within the value's width.
    pub fn rotl(&mut self, value: Operand, count: Operand) -> Operand {
        self.shift_like(Opcode::RotateLeft, value, count)
    }

    /// Logical shift right.
    pub fn shiftr(&mut self, value: Operand, count: Operand) -> Operand {
        self.shift_like(Opcode::LogicalShiftRight, value, count)
    }

    /// Logical shift left.
    pub fn shiftl(&mut self, value: Operand, count: Operand) -> Operand {
        self.shift_like(Opcode::LogicalShiftLeft, value, count)
    }

    /// Arithmetic shift right.
    pub fn ashiftr(&mut self, value: Operand, count: Operand) -> Operand {
        self.shift_like(Opcode::ArithmeticShiftRight, value, count)
    }

    fn bitwise(&mut self, opcode: Opcode, a: Operand, b: Operand) -> Operand {
        assert!(a.is_valid() && b.is_valid());
        assert!(is_integer_type(a.ty()) || a.ty() == Type::Bool);
        assert_eq!(a.ty(), b.ty());

        let result = self.unit.allocate_register(a.ty());
        self.push(opcode, a.ty(), &[result], &[a, b]);
        result
    }

    /// Bitwise and (logical for `Bool`).
    pub fn and(&mut self, a: Operand, b: Operand) -> Operand {
        self.bitwise(Opcode::And, a, b)
    }

    /// Bitwise or (logical for `Bool`).
    pub fn or(&mut self, a: Operand, b: Operand) -> Operand {
        self.bitwise(Opcode::Or, a, b)
    }

    /// Bitwise exclusive or (logical for `Bool`).
    pub fn xor(&mut self, a: Operand, b: Operand) -> Operand {
        self.bitwise(Opcode::ExclusiveOr, a, b)
    }

    /// Bitwise not (logical for `Bool`).
    pub fn not(&mut self, source: Operand) -> Operand {
        assert!(source.is_valid());
        assert!(is_integer_type(source.ty()) || source.ty() == Type::Bool);

        let result = self.unit.allocate_register(source.ty());
        self.push(Opcode::Not, source.ty(), &[result], &[source]);
        result
    }

    /// Bit set or clear at `position` based on `control`.
    pub fn bsc(&mut self, value: Operand, control: Operand, position: Operand) -> Operand {
        assert!(control.is_valid() && position.is_valid() && value.is_valid());
        assert!(is_integer_type(value.ty()));
        assert!(is_integer_type(position.ty()));
        assert_eq!(control.ty(), Type::Bool);

        let result = self.unit.allocate_register(value.ty());
        self.push(
            Opcode::BitSetClear,
            value.ty(),
            &[result],
            &[value, control, position],
        );
        result
    }

    fn arithmetic(&mut self, opcode: Opcode, a: Operand, b: Operand) -> Operand {
        assert!(a.is_valid() && b.is_valid());
        assert!(is_numeric_type(a.ty()));
        assert_eq!(a.ty(), b.ty());

        let result = self.unit.allocate_register(a.ty());
        self.push(opcode, a.ty(), &[result], &[a, b]);
        result
    }

    fn integer_arithmetic(&mut self, opcode: Opcode, a: Operand, b: Operand) -> Operand {
        assert!(a.is_valid() && b.is_valid());
        assert!(is_integer_type(a.ty()));
        assert_eq!(a.ty(), b.ty());

        let result = self.unit.allocate_register(a.ty());
        self.push(opcode, a.ty(), &[result], &[a, b]);
        result
    }

    /// Addition.
    pub fn add(&mut self, a: Operand, b: Operand) -> Operand {
        self.arithmetic(Opcode::Add, a, b)
    }

    /// Subtraction.
    pub fn sub(&mut self, a: Operand, b: Operand) -> Operand {
        self.arithmetic(Opcode::Subtract, a, b)
    }

    /// Signed (or float) multiplication.
    pub fn mul(&mut self, a: Operand, b: Operand) -> Operand {
        self.arithmetic(Opcode::Multiply, a, b)
    }

    /// Unsigned integer multiplication.
    pub fn umul(&mut self, a: Operand, b: Operand) -> Operand {
        self.integer_arithmetic(Opcode::MultiplyUnsigned, a, b)
    }

    /// Signed (or float) division.
    pub fn div(&mut self, a: Operand, b: Operand) -> Operand {
        self.arithmetic(Opcode::Divide, a, b)
    }

    /// Unsigned integer division.
    pub fn udiv(&mut self, a: Operand, b: Operand) -> Operand {
        self.integer_arithmetic(Opcode::DivideUnsigned, a, b)
    }

    /// Signed truncating remainder. Integer types only.
    pub fn modulus(&mut self, a: Operand, b: Operand) -> Operand {
        self.integer_arithmetic(Opcode::Modulus, a, b)
    }

    /// Square root. Float types only.
    pub fn sqrt(&mut self, source: Operand) -> Operand {
        assert!(source.is_valid());
        assert!(is_float_type(source.ty()));

        let result = self.unit.allocate_register(source.ty());
        self.push(Opcode::SquareRoot, source.ty(), &[result], &[source]);
        result
    }

    /// Sign-extend an `Integer8` to `Integer16`.
    pub fn extend16(&mut self, source: Operand) -> Operand {
        assert!(source.is_valid());
        assert_eq!(source.ty(), Type::Integer8);

        let result = self.unit.allocate_register(Type::Integer16);
        self.push(Opcode::Extend16, source.ty(), &[result], &[source]);
        result
    }

    /// Sign-extend an `Integer8` or `Integer16` to `Integer32`.
    pub fn extend32(&mut self, source: Operand) -> Operand {
        assert!(source.is_valid());
        assert!(matches!(source.ty(), Type::Integer8 | Type::Integer16));

        let result = self.unit.allocate_register(Type::Integer32);
        self.push(Opcode::Extend32, source.ty(), &[result], &[source]);
        result
    }

    /// Sign-extend a narrower integer to `Integer64`.
    pub fn extend64(&mut self, source: Operand) -> Operand {
        assert!(source.is_valid());
        assert!(matches!(
            source.ty(),
            Type::Integer8 | Type::Integer16 | Type::Integer32
        ));

        let result = self.unit.allocate_register(Type::Integer64);
        self.push(Opcode::Extend64, source.ty(), &[result], &[source]);
        result
    }

    /// Reinterpret the bit pattern of `source` as `out_type`. Identity
    /// bitcasts short-circuit without emitting anything.
    pub fn bitcast(&mut self, out_type: Type, source: Operand) -> Operand {
        assert!(is_numeric_type(out_type));
        assert!(source.is_valid());
        assert!(is_numeric_type(source.ty()));

        if source.ty() == out_type {
            return source;
        }

        let result = self.unit.allocate_register(out_type);
        self.push(Opcode::BitCast, out_type, &[result], &[source]);
        result
    }

    /// Truncating float to integer conversion.
    pub fn castf2i(&mut self, out_type: Type, source: Operand) -> Operand {
        assert!(is_integer_type(out_type));
        assert!(source.is_valid());
        assert!(is_float_type(source.ty()));

        let result = self.unit.allocate_register(out_type);
        self.push(Opcode::CastFloatInt, out_type, &[result], &[source]);
        result
    }

    /// Integer to float conversion.
    pub fn casti2f(&mut self, out_type: Type, source: Operand) -> Operand {
        assert!(is_float_type(out_type));
        assert!(source.is_valid());
        assert!(is_integer_type(source.ty()));

        let result = self.unit.allocate_register(out_type);
        self.push(Opcode::CastIntFloat, out_type, &[result], &[source]);
        result
    }

    /// Float width change. The widths must differ.
    pub fn resizef(&mut self, out_type: Type, source: Operand) -> Operand {
        assert!(is_float_type(out_type));
        assert!(source.is_valid());
        assert!(is_float_type(source.ty()));
        assert_ne!(source.ty(), out_type);

        let result = self.unit.allocate_register(out_type);
        self.push(Opcode::ResizeFloat, out_type, &[result], &[source]);
        result
    }

    /// `(a & b) != 0`, producing a `Bool`.
    pub fn test(&mut self, a: Operand, b: Operand) -> Operand {
        assert!(a.is_valid() && b.is_valid());
        assert!(is_integer_type(a.ty()));
        assert_eq!(a.ty(), b.ty());

        let result = self.unit.allocate_register(Type::Bool);
        self.push(Opcode::Test, a.ty(), &[result], &[a, b]);
        result
    }

    /// Equality compare; also defined for `Bool`.
    pub fn cmp_eq(&mut self, a: Operand, b: Operand) -> Operand {
        assert!(a.is_valid() && b.is_valid());
        assert_eq!(a.ty(), b.ty());
        assert!(is_numeric_type(a.ty()) || a.ty() == Type::Bool);

        let result = self.unit.allocate_register(Type::Bool);
        self.push(Opcode::CompareEq, a.ty(), &[result], &[a, b]);
        result
    }

    fn compare(&mut self, opcode: Opcode, a: Operand, b: Operand) -> Operand {
        assert!(a.is_valid() && b.is_valid());
        assert!(is_numeric_type(a.ty()));
        assert_eq!(a.ty(), b.ty());

        let result = self.unit.allocate_register(Type::Bool);
        self.push(opcode, a.ty(), &[result], &[a, b]);
        result
    }

    fn compare_unsigned(&mut self, opcode: Opcode, a: Operand, b: Operand) -> Operand {
        assert!(a.is_valid() && b.is_valid());
        assert!(is_integer_type(a.ty()));
        assert_eq!(a.ty(), b.ty());

        let result = self.unit.allocate_register(Type::Bool);
        self.push(opcode, a.ty(), &[result], &[a, b]);
        result
    }

    /// Signed less-than.
    pub fn cmp_lt(&mut self, a: Operand, b: Operand) -> Operand {
        self.compare(Opcode::CompareLt, a, b)
    }

    /// Signed less-or-equal.
    pub fn cmp_lte(&mut self, a: Operand, b: Operand) -> Operand {
        self.compare(Opcode::CompareLte, a, b)
    }

    /// Signed greater-than. Lowered at assembly time to a swapped less-than;
    /// the IR contains no greater-than opcodes.
    pub fn cmp_gt(&mut self, a: Operand, b: Operand) -> Operand {
        self.compare(Opcode::CompareLt, b, a)
    }

    /// Signed greater-or-equal, lowered to a swapped less-or-equal.
    pub fn cmp_gte(&mut self, a: Operand, b: Operand) -> Operand {
        self.compare(Opcode::CompareLte, b, a)
    }

    /// Unsigned less-than.
    pub fn cmp_ult(&mut self, a: Operand, b: Operand) -> Operand {
        self.compare_unsigned(Opcode::CompareUlt, a, b)
    }

    /// Unsigned less-or-equal.
    pub fn cmp_ulte(&mut self, a: Operand, b: Operand) -> Operand {
        self.compare_unsigned(Opcode::CompareUlte, a, b)
    }

    /// Unsigned greater-than, lowered to a swapped unsigned less-than.
    pub fn cmp_ugt(&mut self, a: Operand, b: Operand) -> Operand {
        self.compare_unsigned(Opcode::CompareUlt, b, a)
    }

    /// Unsigned greater-or-equal, lowered to a swapped unsigned
    /// less-or-equal.
    pub fn cmp_ugte(&mut self, a: Operand, b: Operand) -> Operand {
        self.compare_unsigned(Opcode::CompareUlte, b, a)
    }

    /// Unconditional branch to a label.
    pub fn br(&mut self, target: Operand) {
        assert!(target.is_valid());
        assert_eq!(target.ty(), Type::BranchLabel);

        self.push(Opcode::Branch, Type::Integer64, &[], &[target]);
    }

    /// Conditional branch to a label.
    pub fn ifbr(&mut self, decision: Operand, target: Operand) {
        assert!(decision.is_valid() && target.is_valid());
        assert_eq!(decision.ty(), Type::Bool);
        assert_eq!(target.ty(), Type::BranchLabel);

        self.push(Opcode::IfBranch, Type::Integer64, &[], &[decision, target]);
    }

    /// `decision ? if_true : if_false`.
    pub fn select(&mut self, decision: Operand, if_false: Operand, if_true: Operand) -> Operand {
        assert!(decision.is_valid() && if_false.is_valid() && if_true.is_valid());
        assert_eq!(decision.ty(), Type::Bool);
        assert!(is_numeric_type(if_false.ty()));
        assert_eq!(if_false.ty(), if_true.ty());

        let result = self.unit.allocate_register(if_false.ty());
        self.push(
            Opcode::Select,
            if_false.ty(),
            &[result],
            &[decision, if_false, if_true],
        );
        result
    }

    /// When `decision` is true, return `result` (an `Integer64`) to the
    /// host.
    pub fn exit(&mut self, decision: Operand, result: Operand) {
        assert!(decision.is_valid());
        assert_eq!(decision.ty(), Type::Bool);
        assert_eq!(result.ty(), Type::Integer64);

        self.push(Opcode::Exit, Type::Integer64, &[], &[decision, result]);
    }

    /// Call a host function with no user arguments and no result.
    pub fn call_void(&mut self, host_function: HostFnVoid0) {
        let function = Operand::host_address(host_function as usize as u64);
        self.push(Opcode::Call, Type::Integer64, &[], &[function]);
    }

    /// Call a host function with no user arguments, returning a value of
    /// `return_type`.
    pub fn call0(&mut self, return_type: Type, host_function: HostFn0) -> Operand {
        assert!(is_numeric_type(return_type) || return_type == Type::Bool);

        let function = Operand::host_address(host_function as usize as u64);
        let result = self.unit.allocate_register(return_type);
        self.push(Opcode::Call, return_type, &[result], &[function]);
        result
    }

    /// Call a host function with one user argument.
    pub fn call1(&mut self, return_type: Type, host_function: HostFn1, arg1: Operand) -> Operand {
        assert!(is_numeric_type(return_type) || return_type == Type::Bool);
        assert!(arg1.is_valid());
        assert!(is_numeric_type(arg1.ty()) || arg1.ty() == Type::Bool);

        let function = Operand::host_address(host_function as usize as u64);
        let result = self.unit.allocate_register(return_type);
        self.push(Opcode::Call, return_type, &[result], &[function, arg1]);
        result
    }

    /// Call a host function with two user arguments.
    pub fn call2(
        &mut self,
        return_type: Type,
        host_function: HostFn2,
        arg1: Operand,
        arg2: Operand,
    ) -> Operand {
        assert!(is_numeric_type(return_type) || return_type == Type::Bool);
        assert!(arg1.is_valid() && arg2.is_valid());
        assert!(is_numeric_type(arg1.ty()) || arg1.ty() == Type::Bool);
        assert!(is_numeric_type(arg2.ty()) || arg2.ty() == Type::Bool);

        let function = Operand::host_address(host_function as usize as u64);
        let result = self.unit.allocate_register(return_type);
        self.push(
            Opcode::Call,
            return_type,
            &[result],
            &[function, arg1, arg2],
        );
        result
    }

    fn push(&mut self, opcode: Opcode, ty: Type, results: &[Operand], sources: &[Operand]) {
        self.unit
            .add_instruction(Instruction::new(opcode, ty, results, sources));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greater_than_lowers_to_swapped_less_than() {
        let mut asm = Assembler::new();
        let a = Operand::constant(1u32);
        let b = Operand::constant(2u32);
        asm.cmp_gt(a, b);

        let unit = asm.export_unit();
        let instruction = unit.instructions().iter().next().unwrap();
        assert_eq!(instruction.opcode(), Opcode::CompareLt);
        assert_eq!(instruction.source(0), b);
        assert_eq!(instruction.source(1), a);
        assert_eq!(instruction.result(0).ty(), Type::Bool);
    }

    #[test]
    fn identity_bitcast_is_elided() {
        let mut asm = Assembler::new();
        let a = Operand::constant(1u32);
        let same = asm.bitcast(Type::Integer32, a);
        assert_eq!(same, a);
        assert_eq!(asm.instruction_count(), 0);
    }

    #[test]
    fn compares_produce_bool_and_results_count() {
        let mut asm = Assembler::new();
        let a = Operand::constant(5u32);
        let result = asm.cmp_eq(a, a);
        assert_eq!(result.ty(), Type::Bool);
        assert_eq!(asm.instruction_count(), 1);
    }

    #[test]
    #[should_panic]
    fn mismatched_types_panic() {
        let mut asm = Assembler::new();
        asm.add(Operand::constant(1u32), Operand::constant(1u64));
    }
}
