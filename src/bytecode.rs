//! Portable bytecode back-end: a byte-stream encoding of allocated RTL and
//! the interpreter that runs it.

mod compiler;
pub mod opcode;
mod routine;

pub use compiler::Compiler;
pub use routine::Routine;
