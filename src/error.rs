//! Compiler and runtime error types.

use std::io;

use thiserror::Error;

use crate::ir;

/// Errors surfaced at the `compile()` boundary of a back-end.
///
/// A failed native compilation is not fatal for a block: the caller marks the
/// native routine as unavailable and keeps dispatching to the bytecode
/// routine or the interpreter.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The IR contains an opcode the lowering has no translation for.
    #[error("no back-end lowering for IR opcode {0:?}")]
    UnsupportedOpcode(ir::Opcode),

    /// The IR combines an opcode with a type the lowering cannot express.
    #[error("unsupported operand type {ty:?} for IR opcode {opcode:?}")]
    UnsupportedType {
        /// Opcode being lowered.
        opcode: ir::Opcode,
        /// Offending operand type.
        ty: ir::Type,
    },

    /// An RTL opcode reached an emitter that cannot encode it.
    #[error("back-end cannot encode RTL opcode {0:#06x}")]
    UnsupportedRtlOpcode(u16),

    /// The register allocator ran out of registers and spill capacity.
    #[error("register allocation wedged for register class {class}")]
    AllocatorWedged {
        /// Register class whose pool was exhausted.
        class: u8,
    },

    /// The executable buffer for a native routine could not be mapped.
    #[error("failed to allocate routine memory: {0}")]
    Buffer(#[from] io::Error),
}

/// Errors from flipping a routine's buffer to executable.
#[derive(Debug, Error)]
pub enum PrepareError {
    /// The kernel refused to remap the code buffer.
    #[error("failed to remap routine memory: {0}")]
    Protect(#[from] io::Error),
}
