//! The executable artifact produced by a back-end compiler.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::PrepareError;
use crate::guest::GuestHandle;

/// A compiled routine: bytecode or native code plus whatever state the
/// back-end needs to run it.
///
/// `execute` runs the routine against a guest. `memory_base` is the host
/// address of the guest's linear memory reservation (used by fastmem
/// loads); `register_base` is the host address of the guest register block.
/// The returned `u64` is the taken exit code (some guests report cycle
/// counts through it).
pub trait Routine: Send + Sync {
    /// Make the routine executable.
    ///
    /// With `commit == false` the call may return `Ok(false)` to signal
    /// "not yet mapped, keep interpreting"; implementations use this to
    /// amortize `mprotect` cost over freshly compiled blocks. With
    /// `commit == true` the call either succeeds or errors.
    fn prepare(&self, commit: bool) -> Result<bool, PrepareError>;

    /// Whether the routine can be executed right now.
    fn ready(&self) -> bool;

    /// Run the routine.
    fn execute(&self, guest: &mut GuestHandle, memory_base: *mut u8, register_base: *mut u8)
        -> u64;

    /// Routine size in bytes.
    fn size(&self) -> usize;

    /// Human readable representation for debugging and tracing.
    fn disassemble(&self) -> String;
}

/// Page-aligned buffer that starts writable and flips to read-execute.
///
/// Backed by an anonymous `mmap` so the W^X transition is a plain
/// `mprotect`; the native back-ends copy their emitted bytes in and never
/// write again.
pub struct ExecBuffer {
    base: *mut u8,
    len: usize,
    code_len: usize,
    executable: AtomicBool,
}

// The buffer is written once before publication and only transitions
// RW -> RX afterwards.
unsafe impl Send for ExecBuffer {}
unsafe impl Sync for ExecBuffer {}

impl ExecBuffer {
    /// Allocate a buffer holding a copy of `code`.
    pub fn new(code: &[u8]) -> io::Result<Self> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = (code.len().max(1) + page - 1) / page * page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let base = base as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), base, code.len());
        }

        Ok(Self {
            base,
            len,
            code_len: code.len(),
            executable: AtomicBool::new(false),
        })
    }

    /// Flip the mapping to read-execute. Idempotent.
    pub fn make_executable(&self) -> Result<(), PrepareError> {
        if self.executable.load(Ordering::Acquire) {
            return Ok(());
        }

        let result = unsafe {
            libc::mprotect(
                self.base as *mut libc::c_void,
                self.len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(PrepareError::Protect(io::Error::last_os_error()));
        }

        // AArch64 has incoherent instruction caches; flush before the
        // first fetch from the buffer.
        #[cfg(target_arch = "aarch64")]
        unsafe {
            extern "C" {
                fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
            }
            __clear_cache(
                self.base as *mut libc::c_char,
                self.base.add(self.len) as *mut libc::c_char,
            );
        }

        self.executable.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether the buffer is currently executable.
    pub fn is_executable(&self) -> bool {
        self.executable.load(Ordering::Acquire)
    }

    /// Entry point of the code.
    pub fn entry(&self) -> *const u8 {
        self.base
    }

    /// The emitted code bytes.
    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.base, self.code_len) }
    }

    /// Emitted code size in bytes.
    pub fn code_len(&self) -> usize {
        self.code_len
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Format a code buffer as a hex dump, 16 bytes per row.
pub(crate) fn hex_dump(code: &[u8]) -> String {
    use std::fmt::Write;

    let mut text = String::with_capacity(code.len() * 4);
    for (row, chunk) in code.chunks(16).enumerate() {
        let _ = write!(text, "{:06x}:", row * 16);
        for byte in chunk {
            let _ = write!(text, " {byte:02x}");
        }
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_round_trips_code_and_remaps() {
        let code = [0xc3u8; 7];
        let buffer = ExecBuffer::new(&code).unwrap();
        assert_eq!(buffer.code(), &code);
        assert!(!buffer.is_executable());
        buffer.make_executable().unwrap();
        assert!(buffer.is_executable());
        assert_eq!(buffer.code(), &code);
    }
}
