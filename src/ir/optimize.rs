//! IR optimization passes: constant propagation and dead-code elimination.

use crate::ir::calculator::Calculator;
use crate::ir::instruction::Instruction;
use crate::ir::opcode::Opcode;
use crate::ir::operand::Operand;
use crate::ir::types::is_float_type;
use crate::ir::unit::ExecutionUnit;

/// A rewriting pass over an [`ExecutionUnit`].
pub trait Pass {
    /// Produce a rewritten unit. Side-effecting instructions
    /// (`Call`/`WriteGuest`/`Store`/`Exit`) keep their relative order.
    fn run(&mut self, source: &ExecutionUnit) -> ExecutionUnit;
}

/// Run the standard pass pipeline used before back-end compilation.
pub fn optimize(source: &ExecutionUnit) -> ExecutionUnit {
    let propagated = ConstantPropagation::new().run(source);
    DeadCodeElimination::new().run(&propagated)
}

/// Folds constant expressions and applies cheap algebraic identities,
/// substituting known-constant registers into later sources.
#[derive(Debug, Default)]
pub struct ConstantPropagation;

impl ConstantPropagation {
    /// New pass instance.
    pub fn new() -> Self {
        Self
    }
}

impl Pass for ConstantPropagation {
    fn run(&mut self, source: &ExecutionUnit) -> ExecutionUnit {
        let register_count = source.register_count() as usize;

        // outputs[reg], when valid, replaces $reg on subsequent sources.
        let mut outputs: Vec<Operand> = vec![Operand::default(); register_count];
        let calculator = Calculator::new();

        /* Pass 1 - identify and fold constant expressions. */
        for current in source.instructions() {
            if current.result_count() != 1 {
                continue;
            }

            let mut sources = [Operand::default(); crate::ir::SOURCE_LIMIT];
            let mut all_constant = true;
            for (i, source_operand) in current.sources().iter().enumerate() {
                sources[i] = substitute(&outputs, source_operand);
                all_constant = all_constant && sources[i].is_constant();
            }
            let sources = &sources[..current.source_count()];

            let result_index = current.result(0).register_index().0 as usize;
            let folded = fold(&calculator, current, sources, all_constant);
            if let Some(folded) = folded {
                outputs[result_index] = folded;
            }
        }

        /* Pass 2 - produce the simplified execution unit. */
        let mut result = ExecutionUnit::with_register_offset(source.register_count());
        for current in source.instructions() {
            if current.result_count() == 1 {
                let result_index = current.result(0).register_index().0 as usize;
                if outputs[result_index].is_valid() {
                    // Result was turned into a constant expression.
                    continue;
                }
            }

            let mut sources = [Operand::default(); crate::ir::SOURCE_LIMIT];
            for (i, source_operand) in current.sources().iter().enumerate() {
                sources[i] = substitute(&outputs, source_operand);
            }

            let mut results = [Operand::default(); 1];
            if current.result_count() == 1 {
                results[0] = current.result(0);
            }
            result.add_instruction(Instruction::new(
                current.opcode(),
                current.ty(),
                &results[..current.result_count()],
                &sources[..current.source_count()],
            ));
        }

        result
    }
}

fn substitute(outputs: &[Operand], operand: &Operand) -> Operand {
    if operand.is_constant() {
        return *operand;
    }
    let index = operand.register_index().0 as usize;
    if outputs[index].is_valid() {
        outputs[index]
    } else {
        *operand
    }
}

/// Returns the constant replacing the instruction's result, if any.
fn fold(
    calculator: &Calculator,
    current: &Instruction,
    sources: &[Operand],
    all_constant: bool,
) -> Option<Operand> {
    let zero_of = |ty| Operand::from_parts(ty, crate::value::Value::ZERO);
    let const_zero = |operand: &Operand| operand.is_constant() && operand.zero_extended() == 0;
    let const_one = |operand: &Operand| operand.is_constant() && operand.zero_extended() == 1;

    match current.opcode() {
        Opcode::RotateRight if all_constant => Some(calculator.rotr(sources[0], sources[1])),
        Opcode::RotateLeft if all_constant => Some(calculator.rotl(sources[0], sources[1])),
        Opcode::LogicalShiftRight if all_constant => Some(calculator.shiftr(sources[0], sources[1])),
        Opcode::LogicalShiftLeft if all_constant => Some(calculator.shiftl(sources[0], sources[1])),
        Opcode::ArithmeticShiftRight if all_constant => {
            Some(calculator.ashiftr(sources[0], sources[1]))
        }

        Opcode::And => {
            if all_constant {
                return Some(calculator.and(sources[0], sources[1]));
            }
            if sources[0].ty() == crate::ir::Type::Bool {
                return None;
            }
            if const_zero(&sources[0]) || const_zero(&sources[1]) {
                return Some(zero_of(sources[0].ty()));
            }
            None
        }

        Opcode::Or => {
            if all_constant {
                return Some(calculator.or(sources[0], sources[1]));
            }
            if sources[0] == sources[1] {
                return Some(sources[0]);
            }
            if sources[0].ty() == crate::ir::Type::Bool {
                return None;
            }
            if const_zero(&sources[0]) {
                return Some(sources[1]);
            }
            if const_zero(&sources[1]) {
                return Some(sources[0]);
            }
            None
        }

        Opcode::ExclusiveOr => {
            if all_constant {
                return Some(calculator.xor(sources[0], sources[1]));
            }
            if sources[0] == sources[1] {
                return Some(zero_of(sources[0].ty()));
            }
            if sources[0].ty() == crate::ir::Type::Bool {
                return None;
            }
            if const_zero(&sources[0]) {
                return Some(sources[1]);
            }
            if const_zero(&sources[1]) {
                return Some(sources[0]);
            }
            None
        }

        Opcode::Not if all_constant => Some(calculator.not(sources[0])),

        Opcode::Add => {
            if all_constant {
                return Some(calculator.add(sources[0], sources[1]));
            }
            // Adding zero is not an identity for floats (-0.0, NaN payloads).
            if is_float_type(sources[0].ty()) {
                return None;
            }
            if const_zero(&sources[0]) {
                return Some(sources[1]);
            }
            if const_zero(&sources[1]) {
                return Some(sources[0]);
            }
            None
        }

        Opcode::Subtract => {
            if all_constant {
                return Some(calculator.sub(sources[0], sources[1]));
            }
            if is_float_type(sources[0].ty()) {
                return None;
            }
            if const_zero(&sources[1]) {
                return Some(sources[0]);
            }
            None
        }

        Opcode::Multiply => {
            if all_constant {
                return Some(calculator.mul(sources[0], sources[1]));
            }
            if is_float_type(sources[0].ty()) {
                return None;
            }
            if const_zero(&sources[0]) || const_zero(&sources[1]) {
                return Some(zero_of(sources[0].ty()));
            }
            None
        }

        Opcode::MultiplyUnsigned => {
            if all_constant {
                return Some(calculator.umul(sources[0], sources[1]));
            }
            if const_zero(&sources[0]) || const_zero(&sources[1]) {
                return Some(zero_of(sources[0].ty()));
            }
            None
        }

        Opcode::Divide => {
            if all_constant {
                // Fold only when the division cannot trap.
                if !is_float_type(sources[0].ty())
                    && (const_zero(&sources[1]) || divide_overflows(&sources[0], &sources[1]))
                {
                    return None;
                }
                return Some(calculator.div(sources[0], sources[1]));
            }
            if is_float_type(sources[0].ty()) {
                return None;
            }
            if const_one(&sources[1]) {
                return Some(sources[0]);
            }
            None
        }

        Opcode::DivideUnsigned => {
            if all_constant {
                if const_zero(&sources[1]) {
                    return None;
                }
                return Some(calculator.udiv(sources[0], sources[1]));
            }
            if const_one(&sources[1]) {
                return Some(sources[0]);
            }
            None
        }

        Opcode::Modulus if all_constant => {
            if const_zero(&sources[1]) {
                return None;
            }
            Some(calculator.modulus(sources[0], sources[1]))
        }

        Opcode::SquareRoot if all_constant => Some(calculator.sqrt(sources[0])),
        Opcode::Extend16 if all_constant => Some(calculator.extend16(sources[0])),
        Opcode::Extend32 if all_constant => Some(calculator.extend32(sources[0])),
        Opcode::Extend64 if all_constant => Some(calculator.extend64(sources[0])),

        _ => None,
    }
}

fn divide_overflows(dividend: &Operand, divisor: &Operand) -> bool {
    divisor.sign_extended() == -1
        && dividend.sign_extended()
            == match crate::ir::type_bytes(dividend.ty()) {
                1 => i8::MIN as i64,
                2 => i16::MIN as i64,
                4 => i32::MIN as i64,
                _ => i64::MIN,
            }
}

/// Removes instructions whose results never reach a side effect.
///
/// The side-effect set is `Call`, `WriteGuest`, `Store`, `Exit`. Because
/// instructions are in SSA topological order, one reverse scan suffices to
/// mark every register that feeds a side effect.
#[derive(Debug, Default)]
pub struct DeadCodeElimination;

impl DeadCodeElimination {
    /// New pass instance.
    pub fn new() -> Self {
        Self
    }

    fn instruction_has_side_effects(opcode: Opcode) -> bool {
        matches!(
            opcode,
            Opcode::Call | Opcode::WriteGuest | Opcode::Store | Opcode::Exit
        )
    }
}

impl Pass for DeadCodeElimination {
    fn run(&mut self, source: &ExecutionUnit) -> ExecutionUnit {
        let instructions: Vec<&Instruction> = source.instructions().iter().collect();
        let mut used = vec![false; source.register_count() as usize];

        for instruction in instructions.iter().rev() {
            let keep = Self::instruction_has_side_effects(instruction.opcode())
                || (instruction.result_count() > 0
                    && used[instruction.result(0).register_index().0 as usize]);
            if !keep {
                continue;
            }
            for operand in instruction.sources() {
                if operand.is_register() {
                    used[operand.register_index().0 as usize] = true;
                }
            }
        }

        let mut result = ExecutionUnit::with_register_offset(source.register_count());
        for instruction in instructions {
            let emit = Self::instruction_has_side_effects(instruction.opcode())
                || (instruction.result_count() > 0
                    && used[instruction.result(0).register_index().0 as usize]);
            if emit {
                result.add_instruction(*instruction);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Assembler;

    #[test]
    fn and_with_zero_folds_without_constant_inputs() {
        let mut asm = Assembler::new();
        let zero = Operand::constant(0u32);
        let variable = asm.readgr(crate::ir::Type::Integer32, Operand::constant(1u16));
        let masked = asm.and(variable, zero);
        asm.writegr(Operand::constant(0u16), masked);

        let unit = ConstantPropagation::new().run(&asm.export_unit());

        // The write must now source the constant zero directly.
        let write = unit
            .instructions()
            .iter()
            .find(|i| i.opcode() == Opcode::WriteGuest)
            .unwrap();
        assert!(write.source(1).is_constant());
        assert_eq!(write.source(1).zero_extended(), 0);
    }

    #[test]
    fn xor_of_equal_registers_folds_to_zero() {
        let mut asm = Assembler::new();
        let variable = asm.readgr(crate::ir::Type::Integer32, Operand::constant(1u16));
        let zeroed = asm.xor(variable, variable);
        asm.writegr(Operand::constant(0u16), zeroed);

        let unit = ConstantPropagation::new().run(&asm.export_unit());
        let write = unit
            .instructions()
            .iter()
            .find(|i| i.opcode() == Opcode::WriteGuest)
            .unwrap();
        assert!(write.source(1).is_constant());
        assert_eq!(write.source(1).zero_extended(), 0);
    }

    #[test]
    fn division_by_constant_zero_is_not_folded() {
        let mut asm = Assembler::new();
        let a = Operand::constant(7u32);
        let b = Operand::constant(0u32);
        let quotient = asm.udiv(a, b);
        asm.writegr(Operand::constant(0u16), quotient);

        let unit = ConstantPropagation::new().run(&asm.export_unit());
        assert!(unit
            .instructions()
            .iter()
            .any(|i| i.opcode() == Opcode::DivideUnsigned));
    }

    #[test]
    fn dead_load_chain_is_removed() {
        let mut asm = Assembler::new();
        let address = Operand::constant(0u32);
        let loaded = asm.load(crate::ir::Type::Integer32, address);
        asm.not(loaded);

        let unit = DeadCodeElimination::new().run(&asm.export_unit());
        assert!(unit.instructions().is_empty());
    }

    #[test]
    fn stores_pin_their_whole_chain() {
        let mut asm = Assembler::new();
        let address = Operand::constant(0u32);
        let loaded = asm.load(crate::ir::Type::Integer32, address);
        let inverted = asm.not(loaded);
        asm.store(address, inverted);

        let unit = DeadCodeElimination::new().run(&asm.export_unit());
        assert_eq!(unit.instructions().len(), 3);
    }
}
