//! Typed SSA intermediate representation produced by guest front-ends and
//! consumed by the back-end compilers.
//!
//! A front-end decodes guest instructions into IR through the [`Assembler`],
//! yielding an [`ExecutionUnit`]: a linear sequence of typed instructions in
//! SSA def-before-use order. Optimization passes rewrite units; back-ends
//! lower them to RTL and emit code.

mod assembler;
mod calculator;
mod instruction;
mod operand;
mod types;
mod unit;

pub mod opcode;
pub mod optimize;

pub use assembler::Assembler;
pub use calculator::Calculator;
pub use instruction::{Instruction, Instructions, OPERAND_LIMIT, SOURCE_LIMIT};
pub use opcode::Opcode;
pub use operand::{IntoOperand, Operand, RegisterId};
pub use types::{is_float_type, is_integer_type, is_numeric_type, type_bytes, Type};
pub use unit::ExecutionUnit;
