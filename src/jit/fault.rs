//! Fastmem fault recovery.
//!
//! Native routines load guest memory with a single host instruction against
//! a 4-GiB reservation; unmapped guest pages surface as SIGSEGV/SIGBUS. The
//! process-wide handler installed here recognizes the fixed load forms the
//! back-ends emit, performs the access through the guest's slow path,
//! patches the saved context and resumes past the faulting instruction,
//! downgrading the block to slow-path loads for its next compilation.
//!
//! The handler runs under async-signal constraints: it touches only the
//! saved context, the thread-local current block/guest pointers and one
//! atomic flag. It must not take locks or allocate; the guest's
//! `guest_load` is required to be re-entrant for the same reason.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use crate::guest::GuestHandle;
use crate::jit::block::BasicBlock;

static RESERVATION_BASE: AtomicUsize = AtomicUsize::new(0);
static RESERVATION_LEN: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT_BLOCK: Cell<*const BasicBlock> = const { Cell::new(std::ptr::null()) };
    static CURRENT_GUEST: Cell<*mut GuestHandle> = const { Cell::new(std::ptr::null_mut()) };
}

/// Publish the guest memory reservation. Faults outside `[base, base+len)`
/// are not ours and re-raise with the default handler.
pub fn set_guest_reservation(base: *const u8, len: usize) {
    RESERVATION_BASE.store(base as usize, Ordering::Release);
    RESERVATION_LEN.store(len, Ordering::Release);
}

/// RAII scope marking the block and guest currently executing native code
/// on this thread. Established at block entry, cleared at exit.
pub struct BlockGuard {
    previous_block: *const BasicBlock,
    previous_guest: *mut GuestHandle,
}

impl BlockGuard {
    /// Enter a native execution scope.
    pub fn enter(block: &Arc<BasicBlock>, guest: &mut GuestHandle) -> Self {
        let previous_block = CURRENT_BLOCK.with(|cell| cell.replace(Arc::as_ptr(block)));
        let previous_guest = CURRENT_GUEST.with(|cell| cell.replace(guest as *mut GuestHandle));
        Self {
            previous_block,
            previous_guest,
        }
    }
}

impl Drop for BlockGuard {
    fn drop(&mut self) {
        CURRENT_BLOCK.with(|cell| cell.set(self.previous_block));
        CURRENT_GUEST.with(|cell| cell.set(self.previous_guest));
    }
}

/// Install the process-wide SIGSEGV/SIGBUS handler. Idempotent.
pub fn install() -> io::Result<()> {
    static INSTALL: Once = Once::new();
    let mut result = Ok(());
    INSTALL.call_once(|| result = install_handlers());
    result
}

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
fn install_handlers() -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_flags = libc::SA_SIGINFO;
        action.sa_sigaction = handle_fault as usize;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
fn install_handlers() -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "fastmem fault recovery is not implemented for this host",
    ))
}

/// Re-raise the fault with the default disposition. Returning from the
/// handler retries the faulting instruction, which then terminates the
/// process with the original signal.
#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn restore_default(signo: libc::c_int) {
    libc::signal(signo, libc::SIG_DFL);
}

#[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe extern "C" fn handle_fault(
    signo: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let fault_address = (*info).si_addr() as usize;

    let base = RESERVATION_BASE.load(Ordering::Acquire);
    let len = RESERVATION_LEN.load(Ordering::Acquire);
    if base == 0 || fault_address < base || fault_address >= base + len {
        // Not a guest access; this is a real crash.
        restore_default(signo);
        return;
    }

    let block = CURRENT_BLOCK.with(|cell| cell.get());
    let guest = CURRENT_GUEST.with(|cell| cell.get());
    if block.is_null() || guest.is_null() {
        restore_default(signo);
        return;
    }

    let guest_address = (fault_address - base) as u32;
    if !recover_load(context, guest, guest_address) {
        restore_default(signo);
        return;
    }

    // Use the slow path, not fastmem, from the next compilation on.
    (*block).add_flag(BasicBlock::DISABLE_FASTMEM);
}

/// Decode the faulting load, perform it through the guest and fix up the
/// saved context. Returns false for instruction forms we do not emit.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn recover_load(
    context: *mut libc::c_void,
    guest: *mut GuestHandle,
    guest_address: u32,
) -> bool {
    let uc = &mut *(context as *mut libc::ucontext_t);
    let gregs = &mut uc.uc_mcontext.gregs;
    let pc = gregs[libc::REG_RIP as usize] as usize as *const u8;

    // The emitter produces plain `mov` loads with a base-plus-index
    // address: [66] [REX] 8A/8B modrm sib.
    let mut decode = pc;
    let mut pc_bytes = 0usize;

    let mut has_size_prefix = false;
    if *decode == 0x66 {
        has_size_prefix = true;
        decode = decode.add(1);
        pc_bytes += 1;
    }

    let mut rex = 0u8;
    if (*decode & 0xf0) == 0x40 {
        rex = *decode & 0x0f;
        decode = decode.add(1);
        pc_bytes += 1;
    }

    let bytes;
    let modrm;
    if *decode == 0x8a && !has_size_prefix {
        bytes = 1;
        modrm = *decode.add(1);
        pc_bytes += 2;
    } else if *decode == 0x8b {
        bytes = if has_size_prefix {
            2
        } else if rex & 0x08 == 0 {
            4
        } else {
            8
        };
        modrm = *decode.add(1);
        pc_bytes += 2;
    } else {
        return false;
    }

    // Destination register: 3 bits from ModRM plus REX.R.
    let destination = ((modrm >> 3) & 0x7) | ((rex << 1) & 0x8);

    // The SIB byte of the base-plus-index form.
    pc_bytes += 1;

    let register = match destination {
        0 => libc::REG_RAX,
        1 => libc::REG_RCX,
        2 => libc::REG_RDX,
        3 => libc::REG_RBX,
        4 => libc::REG_RSP,
        5 => libc::REG_RBP,
        6 => libc::REG_RSI,
        7 => libc::REG_RDI,
        8 => libc::REG_R8,
        9 => libc::REG_R9,
        10 => libc::REG_R10,
        11 => libc::REG_R11,
        12 => libc::REG_R12,
        13 => libc::REG_R13,
        14 => libc::REG_R14,
        15 => libc::REG_R15,
        _ => return false,
    } as usize;

    let value = (*guest).guest().guest_load(guest_address, bytes);
    let output = &mut gregs[register];
    match bytes {
        // Narrow movs leave the destination's upper bits untouched.
        1 => *output = (*output & !0xff) | (value.u8() as i64),
        2 => *output = (*output & !0xffff) | (value.u16() as i64),
        // 32-bit movs zero the upper half.
        4 => *output = value.u32() as i64,
        _ => *output = value.u64() as i64,
    }

    gregs[libc::REG_RIP as usize] += pc_bytes as i64;
    true
}

/// AArch64 variant: the emitter produces register-offset loads
/// `LDR{B,H,W,X} Wt, [Xmem_base, Wguest_address, UXTW]`, which share one
/// mask with the access size in the top bits.
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn recover_load(
    context: *mut libc::c_void,
    guest: *mut GuestHandle,
    guest_address: u32,
) -> bool {
    let uc = &mut *(context as *mut libc::ucontext_t);
    let pc = uc.uc_mcontext.pc as usize as *const u32;
    let instruction = *pc;

    const LOAD_MASK: u32 = 0b11111111_11100000_11111100_00000000;
    const LOAD8_BITS: u32 = 0b00111000_01100000_01001000_00000000;
    const LOAD16_BITS: u32 = 0b01111000_01100000_01001000_00000000;
    const LOAD32_BITS: u32 = 0b10111000_01100000_01001000_00000000;
    const LOAD64_BITS: u32 = 0b11111000_01100000_01001000_00000000;

    let bytes = match instruction & LOAD_MASK {
        LOAD8_BITS => 1,
        LOAD16_BITS => 2,
        LOAD32_BITS => 4,
        LOAD64_BITS => 8,
        _ => return false,
    };

    let destination = (instruction & 0x1f) as usize;
    if destination >= 31 {
        return false;
    }

    let value = (*guest).guest().guest_load(guest_address, bytes);
    // Register-offset LDRs zero-extend into the full destination.
    uc.uc_mcontext.regs[destination] = match bytes {
        1 => value.u8() as u64,
        2 => value.u16() as u64,
        4 => value.u32() as u64,
        _ => value.u64(),
    };

    uc.uc_mcontext.pc += 4;
    true
}
