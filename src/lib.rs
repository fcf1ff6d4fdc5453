//! Retargetable SSA-based dynamic binary translation core.
//!
//! Guest CPU front-ends decode native instructions into a typed IR through
//! [`ir::Assembler`], producing an [`ir::ExecutionUnit`]. A back-end
//! compiler ([`bytecode`], [`amd64`] or [`arm64`]) optionally runs the
//! [`ir::optimize`] passes, lowers the unit to RTL, assigns registers with
//! the linear-scan allocator and emits an executable [`jit::Routine`]. The
//! [`jit::Cache`] wraps routines in [`jit::BasicBlock`]s that pick
//! interpreter, bytecode or native code at call time based on guard flags
//! and warm-up heuristics, with signal-based fastmem fault recovery for
//! native memory loads.

pub mod amd64;
pub mod arm64;
pub mod bytecode;
pub mod error;
pub mod guest;
pub mod ir;
pub mod jit;
pub mod value;

pub mod prelude {
    //! Re-exports of the common surface.

    pub use crate::error::{CompileError, PrepareError};
    pub use crate::guest::{Guest, GuestHandle, HostFn0, HostFn1, HostFn2, HostFnVoid0};
    pub use crate::ir::{Assembler, ExecutionUnit, Opcode, Operand, RegisterId, Type};
    pub use crate::jit::{
        BasicBlock, BlockCompiler, BlockSource, Cache, CacheConfig, CompiledRoutines,
        ExecutionMode, Routine, StopReason,
    };
    pub use crate::value::Value;
}
