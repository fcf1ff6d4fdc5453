//! Shared test scaffolding: a minimal guest with a flat register bank and
//! a small memory.

// Not every test binary exercises every helper.
#![allow(dead_code)]

use drift_jit::prelude::*;

/// Guest with 32 generic registers and 4 KiB of linear memory.
pub struct DummyGuest {
    pub registers: [u64; 32],
    pub memory: Vec<u8>,
}

impl Default for DummyGuest {
    fn default() -> Self {
        Self {
            registers: [0; 32],
            memory: vec![0; 0x1000],
        }
    }
}

impl DummyGuest {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Guest for DummyGuest {
    fn guest_register_read(&mut self, index: u32, bytes: usize) -> Value {
        let raw = self.registers[index as usize];
        match bytes {
            1 => Value::from_u8(raw as u8),
            2 => Value::from_u16(raw as u16),
            4 => Value::from_u32(raw as u32),
            8 => Value::from_u64(raw),
            _ => panic!("invalid register read width"),
        }
    }

    fn guest_register_write(&mut self, index: u32, bytes: usize, value: Value) {
        let slot = &mut self.registers[index as usize];
        match bytes {
            1 => *slot = (*slot & !0xff) | value.u8() as u64,
            2 => *slot = (*slot & !0xffff) | value.u16() as u64,
            4 => *slot = value.u32() as u64,
            8 => *slot = value.u64(),
            _ => panic!("invalid register write width"),
        }
    }

    fn guest_load(&mut self, address: u32, bytes: usize) -> Value {
        let at = address as usize;
        let mut raw = [0u8; 8];
        raw[..bytes].copy_from_slice(&self.memory[at..at + bytes]);
        Value::from_u64(u64::from_le_bytes(raw))
    }

    fn guest_store(&mut self, address: u32, bytes: usize, value: Value) {
        let at = address as usize;
        self.memory[at..at + bytes].copy_from_slice(&value.u64().to_le_bytes()[..bytes]);
    }
}

/// Convenience driver: run a routine against a dummy guest with no real
/// memory or register-base mapping (bytecode routines reach both through
/// the guest callbacks).
pub fn run_bytecode(routine: &dyn Routine, guest: &mut DummyGuest) -> u64 {
    let mut handle = GuestHandle::new(guest);
    routine.execute(&mut handle, std::ptr::null_mut(), std::ptr::null_mut())
}
