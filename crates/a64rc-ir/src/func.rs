//! Lifted functions: arenas of blocks and values.

use a64rc_isa::RegClass;

use crate::inst::{for_each_operand_mut, Value, ValueId, ValueKind};
use crate::terminator::Terminator;

/// Handle to a basic block inside its function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A basic block: ordered instructions plus at most one terminator.
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub insts: Vec<ValueId>,
    pub term: Option<Terminator>,
    dead: bool,
}

impl Block {
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty() && self.term.is_none()
    }
}

/// Number of arguments every lifted function carries: state pointer, entry
/// PC, runtime pointer.
pub const NUM_FUNC_ARGS: u8 = 3;
/// Argument index of the state pointer.
pub const STATE_ARG: u8 = 0;
/// Argument index of the entry program counter.
pub const PC_ARG: u8 = 1;
/// Argument index of the runtime pointer.
pub const RUNTIME_ARG: u8 = 2;

/// A lifted function. Starts life as a declaration; gains blocks once the
/// architecture adapter initializes it.
#[derive(Clone, Debug)]
pub struct Func {
    pub name: String,
    blocks: Vec<Block>,
    values: Vec<Value>,
    entry: Option<BlockId>,
}

impl Func {
    /// Create a declaration with the three standard arguments pre-allocated.
    pub fn declare(name: impl Into<String>) -> Self {
        let values = (0..NUM_FUNC_ARGS)
            .map(|n| Value {
                kind: ValueKind::Arg(n),
                class: RegClass::X,
            })
            .collect();
        Self {
            name: name.into(),
            blocks: Vec::new(),
            values,
            entry: None,
        }
    }

    /// Whether this function has no body yet.
    pub fn is_declaration(&self) -> bool {
        self.entry.is_none()
    }

    /// The `n`-th function argument value.
    pub fn arg(&self, n: u8) -> ValueId {
        debug_assert!(n < NUM_FUNC_ARGS);
        ValueId(u32::from(n))
    }

    /// The entry block, set by the first [`Func::new_block`] call.
    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    /// Append a new empty block. The first block becomes the entry.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::default());
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.index()]
    }

    /// Iterate live blocks.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.dead)
            .map(|(i, b)| (BlockId(i as u32), b))
    }

    /// Number of live blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| !b.dead).count()
    }

    /// Mark a block dead after its contents were spliced elsewhere.
    pub fn remove_block(&mut self, id: BlockId) {
        let b = &mut self.blocks[id.index()];
        b.insts.clear();
        b.term = None;
        b.dead = true;
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.index()]
    }

    /// Width class of a value.
    pub fn class_of(&self, id: ValueId) -> RegClass {
        self.values[id.index()].class
    }

    fn alloc_value(&mut self, kind: ValueKind, class: RegClass) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Value { kind, class });
        id
    }

    /// Allocate a constant (class `X`). Constants live outside blocks.
    pub fn const_u64(&mut self, v: u64) -> ValueId {
        self.alloc_value(ValueKind::ConstU64(v), RegClass::X)
    }

    /// Allocate a constant with an explicit width class.
    pub fn const_class(&mut self, v: u64, class: RegClass) -> ValueId {
        self.alloc_value(ValueKind::ConstU64(v), class)
    }

    /// Append an instruction to `block`.
    pub fn push_inst(&mut self, block: BlockId, kind: ValueKind, class: RegClass) -> ValueId {
        let id = self.alloc_value(kind, class);
        self.blocks[block.index()].insts.push(id);
        id
    }

    /// Insert an instruction at `pos` within `block`.
    pub fn insert_inst(
        &mut self,
        block: BlockId,
        pos: usize,
        kind: ValueKind,
        class: RegClass,
    ) -> ValueId {
        let id = self.alloc_value(kind, class);
        self.blocks[block.index()].insts.insert(pos, id);
        id
    }

    /// Remove an instruction from its block (the arena slot is retired).
    pub fn remove_inst(&mut self, block: BlockId, inst: ValueId) {
        self.blocks[block.index()].insts.retain(|&i| i != inst);
    }

    pub fn term(&self, block: BlockId) -> Option<&Terminator> {
        self.blocks[block.index()].term.as_ref()
    }

    pub fn term_mut(&mut self, block: BlockId) -> Option<&mut Terminator> {
        self.blocks[block.index()].term.as_mut()
    }

    /// Install a terminator, replacing any existing one.
    pub fn set_term(&mut self, block: BlockId, term: Terminator) {
        self.blocks[block.index()].term = Some(term);
    }

    /// Detach and return the terminator.
    pub fn take_term(&mut self, block: BlockId) -> Option<Terminator> {
        self.blocks[block.index()].term.take()
    }

    /// Successor blocks of `block` (empty when unterminated or returning).
    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.blocks[block.index()]
            .term
            .as_ref()
            .map(Terminator::successors)
            .unwrap_or_default()
    }

    /// Rewrite every use of `old` as `new`, across all instructions and
    /// terminators.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) {
        for b in &mut self.blocks {
            if b.dead {
                continue;
            }
            for &inst in &b.insts {
                for_each_operand_mut(&mut self.values[inst.index()].kind, |op| {
                    if *op == old {
                        *op = new;
                    }
                });
            }
            if let Some(term) = &mut b.term {
                term.for_each_operand_mut(|op| {
                    if *op == old {
                        *op = new;
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a64rc_isa::{Reg, RegId};

    #[test]
    fn test_declare_then_define() {
        let mut f = Func::declare("sub_1000");
        assert!(f.is_declaration());
        let entry = f.new_block();
        assert!(!f.is_declaration());
        assert_eq!(f.entry(), Some(entry));
    }

    #[test]
    fn test_replace_all_uses() {
        let mut f = Func::declare("sub_0");
        let b = f.new_block();
        let load = f.push_inst(
            b,
            ValueKind::LoadReg(Reg::new(RegId::Gpr(0), RegClass::X)),
            RegClass::X,
        );
        let store = f.push_inst(
            b,
            ValueKind::StoreReg {
                reg: Reg::new(RegId::Gpr(1), RegClass::X),
                value: load,
            },
            RegClass::X,
        );
        let konst = f.const_u64(7);
        f.replace_all_uses(load, konst);
        match &f.value(store).kind {
            ValueKind::StoreReg { value, .. } => assert_eq!(*value, konst),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_successors() {
        let mut f = Func::declare("sub_0");
        let a = f.new_block();
        let b = f.new_block();
        let c = f.new_block();
        let cond = f.const_u64(1);
        f.set_term(a, Terminator::CondBr { cond, taken: b, not_taken: c });
        assert_eq!(f.successors(a), vec![b, c]);
        assert!(f.successors(b).is_empty());
    }
}
