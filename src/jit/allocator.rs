//! Linear-scan register allocation over RTL.

use itertools::Itertools;

use crate::error::CompileError;
use crate::jit::rtl::{
    HwRegister, RegClass, RegisterAssignment, RtlInstruction, RtlOp, RtlProgram,
};

/// The allocatable hardware registers of one register class, in the
/// back-end's own numbering. Registers with fixed meanings (pins, scratch)
/// must not appear here.
#[derive(Debug, Clone)]
pub struct RegisterSet {
    class: RegClass,
    registers: Vec<u8>,
}

impl RegisterSet {
    /// Pool from an explicit register list.
    pub fn new(class: RegClass, registers: &[u8]) -> Self {
        Self {
            class,
            registers: registers.to_vec(),
        }
    }

    /// Pool of registers `0..count`; used by back-ends with a flat
    /// numbering such as the bytecode VM.
    pub fn from_count(class: RegClass, count: u8) -> Self {
        Self {
            class,
            registers: (0..count).collect(),
        }
    }

    /// The register class this pool serves.
    pub const fn class(&self) -> RegClass {
        self.class
    }
}

#[derive(Debug, Clone, Copy)]
struct Interval {
    start: u32,
    end: u32,
    defined: bool,
}

/// Linear-scan register allocator.
///
/// Live intervals are computed in one forward pass (the definition starts an
/// interval, each use extends it; single-block SSA makes intervals
/// contiguous). Intervals are then walked in start order with an active set
/// sorted by end: expired intervals free their registers, and when the pool
/// is empty the interval with the farthest end is spilled to an 8-byte
/// slot. Pinned operands are satisfied by rewriting the block with `Move`
/// instructions between the pin register and the value's home.
#[derive(Debug, Default)]
pub struct LinearAllocator {
    sets: Vec<RegisterSet>,
}

impl LinearAllocator {
    /// New allocator with no register pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the allocatable pool for one register class.
    pub fn define_register_type(&mut self, set: RegisterSet) {
        assert!(
            self.sets.iter().all(|s| s.class != set.class),
            "register class defined twice"
        );
        self.sets.push(set);
    }

    /// Assign every RTL operand a hardware register or spill slot and
    /// return the rewritten program.
    pub fn execute(&self, mut program: RtlProgram) -> Result<RtlProgram, CompileError> {
        let mut spill_slots = 0u32;
        for handle in 0..program.block_count() {
            self.run_block(&mut program, handle, &mut spill_slots)?;
        }
        program.set_spill_slots(spill_slots);
        Ok(program)
    }

    fn run_block(
        &self,
        program: &mut RtlProgram,
        handle: usize,
        spill_slots: &mut u32,
    ) -> Result<(), CompileError> {
        // Liveness: one contiguous interval per SSA value and class.
        let mut intervals: Vec<Vec<Interval>> = self
            .sets
            .iter()
            .map(|set| {
                vec![
                    Interval {
                        start: 0,
                        end: 0,
                        defined: false
                    };
                    program.ssa_count(set.class()) as usize
                ]
            })
            .collect();

        let class_slot = |class: RegClass| -> Result<usize, CompileError> {
            self.sets
                .iter()
                .position(|s| s.class == class)
                .ok_or(CompileError::AllocatorWedged { class: class.0 })
        };

        for (position, instruction) in program.block(handle).iter().enumerate() {
            let position = position as u32;
            for i in 0..instruction.result_count() {
                let ssa = instruction.result(i).ssa;
                let interval = &mut intervals[class_slot(ssa.class())?][ssa.index() as usize];
                interval.start = position;
                interval.end = position;
                interval.defined = true;
            }
            for i in 0..instruction.source_count() {
                let ssa = instruction.source(i).ssa;
                let interval = &mut intervals[class_slot(ssa.class())?][ssa.index() as usize];
                assert!(interval.defined, "RTL source used before definition");
                interval.end = position;
            }
        }

        // Per-class scan over intervals ordered by start.
        let mut assignments: Vec<Vec<HwRegister>> = intervals
            .iter()
            .map(|per_class| vec![HwRegister::Unassigned; per_class.len()])
            .collect();

        for (slot, set) in self.sets.iter().enumerate() {
            let ordered: Vec<(usize, Interval)> = intervals[slot]
                .iter()
                .copied()
                .enumerate()
                .filter(|(_, interval)| interval.defined)
                .sorted_by_key(|(_, interval)| interval.start)
                .collect();

            let mut free: Vec<u8> = set.registers.iter().rev().copied().collect();
            // Active intervals as (end, ssa index, register).
            let mut active: Vec<(u32, usize, u8)> = Vec::new();

            for (ssa_index, interval) in ordered {
                active.retain(|(end, _, register)| {
                    if *end < interval.start {
                        free.push(*register);
                        false
                    } else {
                        true
                    }
                });

                if let Some(register) = free.pop() {
                    assignments[slot][ssa_index] = HwRegister::Register(register);
                    active.push((interval.end, ssa_index, register));
                    active.sort_by_key(|(end, ..)| *end);
                    continue;
                }

                // Pool exhausted: spill whichever of the active intervals
                // or the new one ends farthest away.
                let farthest = active.last().copied();
                match farthest {
                    Some((end, victim, register)) if end > interval.end => {
                        assignments[slot][victim] = HwRegister::Spill(*spill_slots as u16);
                        *spill_slots += 1;
                        assignments[slot][ssa_index] = HwRegister::Register(register);
                        active.pop();
                        active.push((interval.end, ssa_index, register));
                        active.sort_by_key(|(end, ..)| *end);
                    }
                    _ => {
                        assignments[slot][ssa_index] = HwRegister::Spill(*spill_slots as u16);
                        *spill_slots += 1;
                    }
                }
            }
        }

        // Rewrite the block: write assignments into operands and resolve
        // pins with Move instructions around the pinned instruction.
        let assign = |operand: &RegisterAssignment| -> Result<HwRegister, CompileError> {
            let slot = self
                .sets
                .iter()
                .position(|s| s.class == operand.ssa.class())
                .ok_or(CompileError::AllocatorWedged {
                    class: operand.ssa.class().0,
                })?;
            Ok(assignments[slot][operand.ssa.index() as usize])
        };

        let source = std::mem::take(program.block_mut(handle).instructions_mut());
        let mut rewritten = Vec::with_capacity(source.len());
        for mut instruction in source {
            // Pinned sources: copy the home location into the pin register
            // just before the instruction.
            for i in 0..instruction.source_count() {
                let operand = *instruction.source(i);
                let home = assign(&operand)?;
                if let Some(pin) = operand.pinned {
                    let mut copy = RegisterAssignment::any(operand.ssa);
                    copy.hw = home;
                    let mut dest = RegisterAssignment::any(operand.ssa);
                    dest.hw = HwRegister::Register(pin);
                    rewritten.push(RtlInstruction::new(RtlOp::Move, &[dest], &[copy]));
                    instruction.source_mut(i).hw = HwRegister::Register(pin);
                } else {
                    instruction.source_mut(i).hw = home;
                }
            }

            let mut post_move: Option<RtlInstruction> = None;
            for i in 0..instruction.result_count() {
                let operand = *instruction.result(i);
                let home = assign(&operand)?;
                if let Some(pin) = operand.pinned {
                    // The instruction produces into the pin; its home
                    // receives the value right after.
                    instruction.result_mut(i).hw = HwRegister::Register(pin);
                    let mut from = RegisterAssignment::any(operand.ssa);
                    from.hw = HwRegister::Register(pin);
                    let mut to = RegisterAssignment::any(operand.ssa);
                    to.hw = home;
                    post_move = Some(RtlInstruction::new(RtlOp::Move, &[to], &[from]));
                } else {
                    instruction.result_mut(i).hw = home;
                }
            }

            rewritten.push(instruction);
            if let Some(mv) = post_move {
                rewritten.push(mv);
            }
        }
        *program.block_mut(handle).instructions_mut() = rewritten;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::rtl::RtlRegister;
    use crate::value::Value;

    fn any(ssa: RtlRegister) -> RegisterAssignment {
        RegisterAssignment::any(ssa)
    }

    /// Build a program of `count` constants all written to guest registers
    /// at the end, so every value is live until the tail.
    fn overlapping_program(count: u32) -> RtlProgram {
        let mut program = RtlProgram::new();
        let block = program.allocate_block("test");
        let values: Vec<RtlRegister> = (0..count)
            .map(|_| program.ssa_allocate(RegClass::GENERAL))
            .collect();
        for value in &values {
            program.block_mut(block).append_with_data(
                RtlOp::Constant32,
                Value::from_u32(7),
                &[any(*value)],
                &[],
            );
        }
        for (i, value) in values.iter().enumerate() {
            program.block_mut(block).append_with_data(
                RtlOp::WriteRegister32,
                Value::from_u16(i as u16),
                &[],
                &[any(*value)],
            );
        }
        program
    }

    #[test]
    fn non_overlapping_values_share_registers() {
        let mut program = RtlProgram::new();
        let block = program.allocate_block("test");
        for i in 0..4 {
            let value = program.ssa_allocate(RegClass::GENERAL);
            program.block_mut(block).append_with_data(
                RtlOp::Constant32,
                Value::from_u32(i),
                &[any(value)],
                &[],
            );
            program.block_mut(block).append_with_data(
                RtlOp::WriteRegister32,
                Value::from_u16(i as u16),
                &[],
                &[any(value)],
            );
        }

        let mut allocator = LinearAllocator::new();
        allocator.define_register_type(RegisterSet::from_count(RegClass::GENERAL, 2));
        let program = allocator.execute(program).unwrap();

        assert_eq!(program.spill_size(), 0);
        for instruction in program.block(0) {
            for i in 0..instruction.result_count() {
                assert!(!instruction.result(i).hw.is_spill());
            }
        }
    }

    #[test]
    fn overlapping_values_get_distinct_registers() {
        let mut allocator = LinearAllocator::new();
        allocator.define_register_type(RegisterSet::from_count(RegClass::GENERAL, 8));
        let program = allocator.execute(overlapping_program(8)).unwrap();

        let mut seen = std::collections::HashSet::new();
        for instruction in program.block(0) {
            if instruction.op == RtlOp::Constant32 {
                let hw = instruction.result(0).hw;
                assert!(!hw.is_spill());
                assert!(seen.insert(hw.index()), "register assigned twice");
            }
        }
    }

    #[test]
    fn exhausted_pool_spills() {
        let mut allocator = LinearAllocator::new();
        allocator.define_register_type(RegisterSet::from_count(RegClass::GENERAL, 4));
        let program = allocator.execute(overlapping_program(6)).unwrap();

        assert_eq!(program.spill_slots(), 2);
        assert_eq!(program.spill_size(), 16);

        // A spilled definition's uses read the same slot.
        let mut def_slots = std::collections::HashMap::new();
        let mut use_slots = std::collections::HashMap::new();
        for instruction in program.block(0) {
            if instruction.op == RtlOp::Constant32 {
                if let HwRegister::Spill(slot) = instruction.result(0).hw {
                    def_slots.insert(instruction.result(0).ssa.index(), slot);
                }
            }
            if instruction.op == RtlOp::WriteRegister32 {
                if let HwRegister::Spill(slot) = instruction.source(0).hw {
                    use_slots.insert(instruction.source(0).ssa.index(), slot);
                }
            }
        }
        assert_eq!(def_slots, use_slots);
    }

    #[test]
    fn pinned_results_move_to_their_home() {
        let mut program = RtlProgram::new();
        let block = program.allocate_block("test");
        let function = program.ssa_allocate(RegClass::GENERAL);
        let result = program.ssa_allocate(RegClass::GENERAL);
        program.block_mut(block).append_with_data(
            RtlOp::Constant64,
            Value::from_u64(0x1000),
            &[any(function)],
            &[],
        );
        program.block_mut(block).append(
            RtlOp::HostCall0,
            &[RegisterAssignment::pin(result, 15)],
            &[any(function)],
        );
        program.block_mut(block).append_with_data(
            RtlOp::WriteRegister64,
            Value::from_u16(0),
            &[],
            &[any(result)],
        );

        let mut allocator = LinearAllocator::new();
        allocator.define_register_type(RegisterSet::from_count(RegClass::GENERAL, 4));
        let program = allocator.execute(program).unwrap();

        let instructions: Vec<_> = program.block(0).iter().collect();
        assert_eq!(instructions[1].op, RtlOp::HostCall0);
        assert_eq!(instructions[1].result(0).hw, HwRegister::Register(15));
        assert_eq!(instructions[2].op, RtlOp::Move);
        assert_eq!(instructions[2].source(0).hw, HwRegister::Register(15));
        // The home register then feeds the write.
        assert_eq!(instructions[3].source(0).hw, instructions[2].result(0).hw);
    }
}
