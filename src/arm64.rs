//! Native AArch64 back-end.

mod assembler;
mod compiler;
mod routine;

pub use assembler::{Assembler, Cond, Label, Reg, VReg};
pub use compiler::{Compiler, RegisterAddressCb};
pub use routine::Routine;
