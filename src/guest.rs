//! Interface between translated code and the emulated CPU implementation.

use crate::value::Value;

/// Callbacks every guest front-end implements so the interpreter and the
/// emitted routines can reach its register file and memory.
///
/// Register indexes are limited to the range of `u16`. Loads and stores are
/// always 1/2/4/8 bytes.
///
/// The slow-path `guest_load` may be invoked from the fastmem fault handler
/// on the faulting thread, so implementations must keep it re-entrant with
/// respect to the guest: no locks that the executing block might already
/// hold, no allocation that can dead-lock the signal context.
pub trait Guest {
    /// Read `bytes` bytes of guest register `index`.
    fn guest_register_read(&mut self, index: u32, bytes: usize) -> Value;

    /// Write `bytes` bytes of guest register `index`.
    fn guest_register_write(&mut self, index: u32, bytes: usize, value: Value);

    /// Read `bytes` bytes of guest memory at `address`.
    fn guest_load(&mut self, address: u32, bytes: usize) -> Value;

    /// Write `bytes` bytes of guest memory at `address`.
    fn guest_store(&mut self, address: u32, bytes: usize, value: Value);
}

/// Thin handle to a `dyn Guest`, passed by pointer through generated code.
///
/// Trait object references are fat, so emitted routines and `extern "C"` host
/// functions cannot carry them directly; they receive a `*mut GuestHandle`
/// instead and the handle resolves back to the guest on the Rust side.
///
/// The handle borrows the guest for as long as it is used; callers keep it on
/// the stack for the duration of a block execution.
#[repr(C)]
pub struct GuestHandle {
    guest: *mut dyn Guest,
}

impl GuestHandle {
    /// Wrap a guest for the duration of one or more routine executions.
    pub fn new(guest: &mut dyn Guest) -> Self {
        let guest: *mut dyn Guest = unsafe { std::mem::transmute(guest) };
        Self { guest }
    }

    /// Resolve the handle back to the guest.
    ///
    /// # Safety contract
    /// The guest the handle was created from must still be alive; this is
    /// guaranteed by construction when the handle lives on the caller's
    /// stack below the borrow it wraps.
    pub fn guest(&mut self) -> &mut dyn Guest {
        unsafe { &mut *self.guest }
    }
}

/// Host function taking no user arguments and returning nothing.
pub type HostFnVoid0 = extern "C" fn(*mut GuestHandle);

/// Host function taking no user arguments.
pub type HostFn0 = extern "C" fn(*mut GuestHandle) -> Value;

/// Host function taking one user argument.
pub type HostFn1 = extern "C" fn(*mut GuestHandle, Value) -> Value;

/// Host function taking two user arguments.
pub type HostFn2 = extern "C" fn(*mut GuestHandle, Value, Value) -> Value;

/// Interpreter upcall convention used by front-ends for opcodes without a
/// translation: `f(guest, opcode_id_and_raw, pc)`. The low bit of the
/// returned value reports "branch taken"; callers use it to decide whether
/// the block should exit.
pub type InterpreterUpcall = HostFn2;

macro_rules! load_trampoline {
    ($name:ident, $bytes:expr) => {
        pub(crate) extern "C" fn $name(guest: *mut GuestHandle, address: Value) -> Value {
            let guest = unsafe { &mut *guest };
            guest.guest().guest_load(address.u32(), $bytes)
        }
    };
}

macro_rules! store_trampoline {
    ($name:ident, $bytes:expr) => {
        pub(crate) extern "C" fn $name(
            guest: *mut GuestHandle,
            address: Value,
            value: Value,
        ) -> Value {
            let guest = unsafe { &mut *guest };
            guest.guest().guest_store(address.u32(), $bytes, value);
            Value::ZERO
        }
    };
}

// Slow-path bridges used by the native back-ends when fastmem is unavailable.
load_trampoline!(guest_load1, 1);
load_trampoline!(guest_load2, 2);
load_trampoline!(guest_load4, 4);
load_trampoline!(guest_load8, 8);
store_trampoline!(guest_store1, 1);
store_trampoline!(guest_store2, 2);
store_trampoline!(guest_store4, 4);
store_trampoline!(guest_store8, 8);

pub(crate) fn load_trampoline_for(bytes: usize) -> HostFn1 {
    match bytes {
        1 => guest_load1,
        2 => guest_load2,
        4 => guest_load4,
        8 => guest_load8,
        _ => unreachable!("unsupported load width"),
    }
}

pub(crate) fn store_trampoline_for(bytes: usize) -> HostFn2 {
    match bytes {
        1 => guest_store1,
        2 => guest_store2,
        4 => guest_store4,
        8 => guest_store8,
        _ => unreachable!("unsupported store width"),
    }
}
