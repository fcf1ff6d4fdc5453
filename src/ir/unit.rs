//! Container for an assembled IR program.

use std::fmt::Write;

use crate::ir::instruction::{Instruction, Instructions};
use crate::ir::opcode::Opcode;
use crate::ir::operand::{Operand, RegisterId};
use crate::ir::types::Type;

/// An assembled IR program: one extended basic block of instructions plus
/// the SSA register counter used to hand out fresh indices.
///
/// Units move; `copy()` exists instead of `Clone` so whole-unit duplication
/// stays an explicit, visible cost.
#[derive(Default)]
pub struct ExecutionUnit {
    instructions: Instructions,
    register_count: u32,
}

impl ExecutionUnit {
    /// New empty unit.
    pub fn new() -> Self {
        Self::with_register_offset(0)
    }

    /// New empty unit whose first allocated register id is `register_offset`.
    /// Lets a consumer reserve low indices for extra-architectural registers.
    pub fn with_register_offset(register_offset: u32) -> Self {
        Self {
            instructions: Instructions::new(),
            register_count: register_offset,
        }
    }

    /// Total number of SSA registers allocated so far. Some may be unused.
    pub const fn register_count(&self) -> u32 {
        self.register_count
    }

    /// Allocate a new SSA register of the given type.
    pub fn allocate_register(&mut self, ty: Type) -> Operand {
        let id = RegisterId(self.register_count);
        self.register_count += 1;
        Operand::register(ty, id)
    }

    /// Append a new instruction at the end of the unit.
    pub fn append(&mut self, opcode: Opcode, ty: Type, results: &[Operand], sources: &[Operand]) {
        self.instructions.append(opcode, ty, results, sources);
    }

    /// Append an existing instruction at the end of the unit.
    pub fn add_instruction(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Read-only access to the instruction sequence.
    pub fn instructions(&self) -> &Instructions {
        &self.instructions
    }

    /// Full copy of the unit.
    pub fn copy(&self) -> Self {
        Self {
            instructions: self.instructions.clone(),
            register_count: self.register_count,
        }
    }

    /// Validate SSA well-formedness: single definitions, def before use.
    /// Debug aid; panics on violation.
    pub fn verify(&self) {
        let mut defined = vec![false; self.register_count as usize];
        for instruction in &self.instructions {
            for source in instruction.sources() {
                if source.is_register() {
                    let RegisterId(index) = source.register_index();
                    assert!(defined[index as usize], "use of ${index} before definition");
                }
            }
            if instruction.result_count() == 1 {
                let RegisterId(index) = instruction.result(0).register_index();
                assert!(!defined[index as usize], "redefinition of ${index}");
                defined[index as usize] = true;
            }
        }
    }

    /// Human readable form of the unit for debugging.
    pub fn disassemble(&self) -> String {
        if self.instructions.is_empty() {
            return "<none>\n".into();
        }

        let mut result = String::with_capacity(self.instructions.len() * 24);
        for (offset, instruction) in self.instructions.iter().enumerate() {
            let _ = write!(result, "[{offset:04}] ");
            result.push_str(&self.disassemble_instruction(instruction));
        }
        result
    }

    /// Print the disassembly to stdout.
    pub fn debug_print(&self) {
        print!("{}", self.disassemble());
    }

    /// One line in the form `${out} = {mnemonic}.{type} {src1}, {src2}, ...`.
    fn disassemble_instruction(&self, instruction: &Instruction) -> String {
        let mut line = String::new();
        if instruction.result_count() > 0 {
            let _ = write!(line, "{} := ", instruction.result(0).register_index());
        }

        let _ = write!(line, "{}", instruction.opcode().name());
        if instruction.source_count() > 0 {
            let _ = write!(line, ".{}", instruction.ty().name());
        }
        for (i, source) in instruction.sources().iter().enumerate() {
            let separator = if i == 0 { " " } else { ", " };
            let _ = write!(line, "{separator}{}", string_operand(source));
        }
        line.push('\n');
        line
    }
}

fn string_operand(operand: &Operand) -> String {
    assert!(operand.is_valid());

    if !operand.is_constant() {
        return format!("{}", operand.register_index());
    }

    let value = operand.value();
    match operand.ty() {
        Type::Integer8 => format!("#{{{:02x}}}", value.u8()),
        Type::Integer16 => format!("#{{{:04x}}}", value.u16()),
        Type::Integer32 => format!("#{{{:08x}}}", value.u32()),
        Type::Integer64 => format!("#{{{:#018x}}}", value.u64()),
        Type::Float32 => format!("#{{{}}}", value.f32()),
        Type::Float64 => format!("#{{{}}}", value.f64()),
        Type::Bool => (if value.bool() { "true" } else { "false" }).into(),
        Type::BranchLabel => format!("label.{}", value.label()),
        Type::HostAddress => format!("@{:#x}", value.host_ptr()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offset_reserves_low_indices() {
        let mut unit = ExecutionUnit::with_register_offset(8);
        let register = unit.allocate_register(Type::Integer32);
        assert_eq!(register.register_index(), RegisterId(8));
        assert_eq!(unit.register_count(), 9);
    }

    #[test]
    fn disassembles_each_instruction() {
        let mut unit = ExecutionUnit::new();
        let value = unit.allocate_register(Type::Integer32);
        unit.append(
            Opcode::Add,
            Type::Integer32,
            &[value],
            &[Operand::constant(1u32), Operand::constant(2u32)],
        );
        unit.verify();

        let text = unit.disassemble();
        assert!(text.contains("add.i32"));
        assert!(text.contains("$0 :="));
    }
}
