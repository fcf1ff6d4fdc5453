//! Target-independent JIT machinery: the RTL form, the shared IR lowering,
//! the linear-scan register allocator, the routine contract, the block cache
//! and the fastmem fault recovery.

pub mod allocator;
pub mod block;
pub mod cache;
pub mod fault;
pub mod graph;
pub mod lower;
pub mod routine;
pub mod rtl;

pub use allocator::{LinearAllocator, RegisterSet};
pub use block::{BasicBlock, BlockCompiler, BlockSource, BlockStats, CompiledRoutines, ExecutionMode, StopReason};
pub use cache::{Cache, CacheConfig};
pub use routine::Routine;
pub use rtl::{HwRegister, RegClass, RegisterAssignment, RtlInstruction, RtlOp, RtlProgram, RtlRegister};
