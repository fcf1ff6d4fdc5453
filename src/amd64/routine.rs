//! Executable container for emitted x86-64 code.

use crate::error::PrepareError;
use crate::guest::GuestHandle;
use crate::jit;
use crate::jit::routine::{hex_dump, ExecBuffer};

type Entry = extern "C" fn(*mut GuestHandle, *mut u8, *mut u8) -> u64;

/// A compiled native routine backed by a two-phase executable buffer.
pub struct Routine {
    buffer: ExecBuffer,
}

impl Routine {
    pub(crate) fn new(buffer: ExecBuffer) -> Self {
        Self { buffer }
    }
}

impl jit::Routine for Routine {
    fn prepare(&self, commit: bool) -> Result<bool, PrepareError> {
        if self.buffer.is_executable() {
            return Ok(true);
        }
        if !commit {
            // Defer the mprotect; the caller keeps interpreting and batches
            // the remap cost.
            return Ok(false);
        }
        self.buffer.make_executable()?;
        Ok(true)
    }

    fn ready(&self) -> bool {
        self.buffer.is_executable()
    }

    fn execute(
        &self,
        guest: &mut GuestHandle,
        memory_base: *mut u8,
        register_base: *mut u8,
    ) -> u64 {
        assert!(self.buffer.is_executable(), "routine was not prepared");
        assert!(
            cfg!(target_arch = "x86_64"),
            "x86-64 routine executed on a foreign host"
        );

        let entry: Entry = unsafe { std::mem::transmute(self.buffer.entry()) };
        entry(guest, memory_base, register_base)
    }

    fn size(&self) -> usize {
        self.buffer.code_len()
    }

    fn disassemble(&self) -> String {
        hex_dump(self.buffer.code())
    }
}
