//! Architecture adapter and instruction-semantics contracts.

use a64rc_ir::lift::{lift_into_block, LiftedInsn};
use a64rc_ir::{BlockId, Func, FuncId, Module, ValueId, ValueKind};
use a64rc_isa::{decode, Inst, Reg, RegClass, ADDRESS_MASK, INST_BYTES};

/// Architecture-specific services the CFG builder consumes: decoding,
/// delay-slot rules, and lifted-function scaffolding.
pub trait ArchAdapter {
    /// Maximum bytes a single instruction can span.
    fn max_inst_bytes(&self) -> usize;

    /// Mask applied to byte addresses, for address-space wrap detection.
    fn address_mask(&self) -> u64;

    /// Decode the instruction at `addr`. Failure is expressed through the
    /// record's category, not an error.
    fn decode(&self, addr: u64, bytes: &[u8]) -> Inst;

    /// Decode an instruction sitting in a delay slot.
    fn decode_delayed(&self, addr: u64, bytes: &[u8]) -> Inst;

    /// Whether a delay slot may follow `inst`.
    fn may_have_delay_slot(&self, inst: &Inst) -> bool;

    /// Whether `delayed` executes on the given path of `inst`.
    fn next_instruction_is_delayed(&self, inst: &Inst, delayed: &Inst, on_taken: bool) -> bool;

    /// Declare an empty lifted function with the given linkage name.
    fn declare_lifted_function(&self, module: &mut Module, name: &str) -> FuncId;

    /// Append the initial register-setup block and arguments to a declared
    /// function.
    fn initialize_empty(&self, module: &mut Module, func: FuncId);
}

/// Instruction-semantics catalogue interface. Given a decoded instruction
/// and a target block, emits the IR realizing its effect on the state
/// structure and reports the register traffic.
pub trait InstSemantics {
    /// Lift `inst` into `block`. `state_ptr` is the state-structure argument
    /// of the enclosing function.
    fn lift_into_block(
        &self,
        func: &mut Func,
        block: BlockId,
        state_ptr: ValueId,
        inst: &Inst,
    ) -> LiftedInsn;

    /// Emit a load of `reg` at the end of `block`.
    fn load_reg_value(&self, func: &mut Func, block: BlockId, reg: Reg) -> ValueId;

    /// Emit a load of `reg` immediately before `anchor` in `block`.
    fn load_reg_value_before(
        &self,
        func: &mut Func,
        block: BlockId,
        reg: Reg,
        anchor: ValueId,
    ) -> ValueId;

    /// Emit the state-structure address of `reg`'s slot.
    fn load_reg_address(&self, func: &mut Func, block: BlockId, reg: Reg) -> (ValueId, RegClass);
}

/// The AArch64 adapter. Fixed four-byte instructions, no delay slots.
#[derive(Clone, Copy, Debug, Default)]
pub struct Aarch64;

impl ArchAdapter for Aarch64 {
    fn max_inst_bytes(&self) -> usize {
        INST_BYTES
    }

    fn address_mask(&self) -> u64 {
        ADDRESS_MASK
    }

    fn decode(&self, addr: u64, bytes: &[u8]) -> Inst {
        decode(addr, bytes)
    }

    fn decode_delayed(&self, addr: u64, bytes: &[u8]) -> Inst {
        decode(addr, bytes)
    }

    fn may_have_delay_slot(&self, inst: &Inst) -> bool {
        inst.may_have_delay_slot
    }

    fn next_instruction_is_delayed(&self, _inst: &Inst, _delayed: &Inst, _on_taken: bool) -> bool {
        false
    }

    fn declare_lifted_function(&self, module: &mut Module, name: &str) -> FuncId {
        module.declare_function(name)
    }

    fn initialize_empty(&self, module: &mut Module, func: FuncId) {
        let f = module.func_mut(func);
        debug_assert!(f.is_declaration());
        f.new_block();
    }
}

impl InstSemantics for Aarch64 {
    fn lift_into_block(
        &self,
        func: &mut Func,
        block: BlockId,
        _state_ptr: ValueId,
        inst: &Inst,
    ) -> LiftedInsn {
        lift_into_block(func, block, inst)
    }

    fn load_reg_value(&self, func: &mut Func, block: BlockId, reg: Reg) -> ValueId {
        func.push_inst(block, ValueKind::LoadReg(reg), reg.class)
    }

    fn load_reg_value_before(
        &self,
        func: &mut Func,
        block: BlockId,
        reg: Reg,
        anchor: ValueId,
    ) -> ValueId {
        let pos = func
            .block(block)
            .insts
            .iter()
            .position(|&i| i == anchor)
            .unwrap_or(func.block(block).insts.len());
        func.insert_inst(block, pos, ValueKind::LoadReg(reg), reg.class)
    }

    fn load_reg_address(&self, func: &mut Func, block: BlockId, reg: Reg) -> (ValueId, RegClass) {
        let v = func.push_inst(block, ValueKind::RegAddr(reg), RegClass::X);
        (v, reg.class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aarch64_has_no_delay_slots() {
        let arch = Aarch64;
        let inst = arch.decode(0x1000, &0x14000001u32.to_le_bytes());
        assert!(!arch.may_have_delay_slot(&inst));
    }

    #[test]
    fn test_initialize_empty_appends_entry() {
        let arch = Aarch64;
        let mut module = Module::new();
        let f = arch.declare_lifted_function(&mut module, "sub_1000");
        assert!(module.func(f).is_declaration());
        arch.initialize_empty(&mut module, f);
        assert!(!module.func(f).is_declaration());
        assert!(module.func(f).entry().is_some());
    }
}
