//! Fastmem fault recovery: a load from an uncommitted guest page must be
//! satisfied by the slow path, downgrade the block, and never fault again
//! after the slow-path recompile.

#![cfg(all(target_arch = "x86_64", target_os = "linux"))]

use std::sync::{Arc, Mutex};

use drift_jit::amd64::{fastmem_load_emitter, Address, Compiler, GeneralRegister, RegMemAny};
use drift_jit::ir::{Assembler, ExecutionUnit, Operand, Type};
use drift_jit::jit::fault;
use drift_jit::prelude::*;

/// Guest whose slow path recognizes the probed address.
struct FaultGuest {
    registers: [u64; 8],
    slow_loads: u32,
}

impl Guest for FaultGuest {
    fn guest_register_read(&mut self, index: u32, _bytes: usize) -> Value {
        Value::from_u64(self.registers[index as usize])
    }

    fn guest_register_write(&mut self, index: u32, _bytes: usize, value: Value) {
        self.registers[index as usize] = value.u64();
    }

    fn guest_load(&mut self, address: u32, _bytes: usize) -> Value {
        self.slow_loads += 1;
        if address == 0x1000 {
            Value::from_u8(0x42)
        } else {
            Value::ZERO
        }
    }

    fn guest_store(&mut self, _address: u32, _bytes: usize, _value: Value) {}
}

struct NullSource;

impl BlockSource for NullSource {
    fn assemble(&self, _compiled_flags: u32) -> ExecutionUnit {
        ExecutionUnit::new()
    }

    fn interpret(&self, _guest: &mut dyn Guest) -> u64 {
        0
    }

    fn cpu_flags(&self, _guest: &mut dyn Guest) -> u32 {
        0
    }
}

fn build_unit() -> ExecutionUnit {
    let mut asm = Assembler::new();
    let value = asm.load(Type::Integer8, Operand::constant(0x1000u32));
    asm.writegr(Operand::constant(0u16), value);
    asm.exit(Operand::constant(true), Operand::constant(0u64));
    asm.export_unit()
}

// The reservation bounds are process-wide state; the fault tests cannot
// overlap.
static FAULT_LOCK: Mutex<()> = Mutex::new(());

fn compile(fastmem: bool) -> Arc<dyn Routine> {
    let mut compiler = Compiler::new();
    compiler.set_register_address_cb(|index| {
        RegMemAny::Mem(Address::base_disp(GeneralRegister::RBX, index as i32 * 8))
    });
    if fastmem {
        compiler.set_memory_load_emitter(Some(Box::new(fastmem_load_emitter)));
    } else {
        compiler.set_memory_load_emitter(None);
    }
    let routine = compiler.compile(build_unit()).unwrap();
    routine.prepare(true).unwrap();
    routine
}

#[test]
fn fault_recovery_downgrades_the_block() {
    let _lock = FAULT_LOCK.lock().unwrap();

    // A 4 GiB reservation with only the first page committed: the guest
    // address 0x1000 has no backing and must fault.
    let reservation = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            1 << 32,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    assert_ne!(reservation, libc::MAP_FAILED, "cannot reserve guest space");
    let base = reservation as *mut u8;
    unsafe {
        libc::mprotect(
            reservation,
            0x1000,
            libc::PROT_READ | libc::PROT_WRITE,
        );
    }

    fault::install().unwrap();
    fault::set_guest_reservation(base, 1 << 32);

    let block = Arc::new(BasicBlock::new(
        0,
        0,
        4,
        2,
        0,
        0,
        StopReason::Branch,
        Box::new(NullSource),
    ));

    let mut guest = FaultGuest {
        registers: [0; 8],
        slow_loads: 0,
    };

    // First run: fastmem load faults, the handler reroutes it through the
    // guest and flags the block.
    let routine = compile(true);
    {
        let register_base = guest.registers.as_mut_ptr() as *mut u8;
        let mut handle = GuestHandle::new(&mut guest);
        let _guard = fault::BlockGuard::enter(&block, &mut handle);
        routine.execute(&mut handle, base, register_base);
    }
    assert_eq!(guest.registers[0], 0x42);
    assert_eq!(guest.slow_loads, 1);
    assert!(block.has_flag(BasicBlock::DISABLE_FASTMEM));

    // Recompiled without fastmem: the access goes straight to the slow
    // path and cannot fault again.
    let routine = compile(!block.has_flag(BasicBlock::DISABLE_FASTMEM));
    guest.registers[0] = 0;
    {
        let register_base = guest.registers.as_mut_ptr() as *mut u8;
        let mut handle = GuestHandle::new(&mut guest);
        routine.execute(&mut handle, base, register_base);
    }
    assert_eq!(guest.registers[0], 0x42);
    assert_eq!(guest.slow_loads, 2);

    unsafe {
        libc::munmap(reservation, 1 << 32);
    }
}

/// Committed pages never reach the handler or the slow path.
#[test]
fn committed_pages_use_the_direct_map() {
    let _lock = FAULT_LOCK.lock().unwrap();

    let reservation = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            1 << 32,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    assert_ne!(reservation, libc::MAP_FAILED, "cannot reserve guest space");
    let base = reservation as *mut u8;
    unsafe {
        libc::mprotect(
            base.add(0x1000) as *mut libc::c_void,
            0x1000,
            libc::PROT_READ | libc::PROT_WRITE,
        );
        *base.add(0x1000) = 0x99;
    }

    fault::install().unwrap();
    fault::set_guest_reservation(base, 1 << 32);

    let block = Arc::new(BasicBlock::new(
        0,
        0,
        4,
        2,
        0,
        0,
        StopReason::Branch,
        Box::new(NullSource),
    ));
    let mut guest = FaultGuest {
        registers: [0; 8],
        slow_loads: 0,
    };

    let routine = compile(true);
    {
        let register_base = guest.registers.as_mut_ptr() as *mut u8;
        let mut handle = GuestHandle::new(&mut guest);
        let _guard = fault::BlockGuard::enter(&block, &mut handle);
        routine.execute(&mut handle, base, register_base);
    }

    assert_eq!(guest.registers[0], 0x99);
    assert_eq!(guest.slow_loads, 0);
    assert!(!block.has_flag(BasicBlock::DISABLE_FASTMEM));

    unsafe {
        libc::munmap(reservation, 1 << 32);
    }
}
