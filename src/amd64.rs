//! Native x86-64 back-end.

mod assembler;
mod compiler;
mod routine;

pub use assembler::{
    Address, Assembler, Cond, GeneralRegister, Label, RegMemAny, VectorRegister,
};
pub use compiler::{fastmem_load_emitter, Compiler, LoadEmitter, RegisterAddressCb};
pub use routine::Routine;
