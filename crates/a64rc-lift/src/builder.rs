//! Worklist-driven trace lifter.
//!
//! Drains a trace work-list; for each trace drains an instruction work-list,
//! decoding and lifting instruction semantics into basic blocks and wiring
//! the blocks together by control-flow category. Traces containing register
//! indirect jumps get a per-function dispatcher block and a block-address
//! table consulted by the runtime to resolve destinations.

use std::collections::{BTreeMap, BTreeSet};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use a64rc_ir::lift::LiftStatus;
use a64rc_ir::{
    BlockId, Callee, FuncId, GlobalArray, GlobalElem, Intrinsic, Module, Terminator, ValueId,
    ValueKind, RUNTIME_ARG, STATE_ARG,
};
use a64rc_isa::{Category, Inst, Reg, RegClass, INST_BYTES};

use crate::arch::{ArchAdapter, InstSemantics};
use crate::error::{LiftError, Result};
use crate::flatten;
use crate::reg_info::BBRegInfo;
use crate::regflow;
use crate::trace::{BlockAddrTable, TraceManager};

/// Per-invocation lifter state, reset at the top of every
/// [`TraceLifter::lift`]; the block maps reset again per trace.
#[derive(Default)]
struct LiftState {
    trace_work_list: BTreeSet<u64>,
    inst_work_list: BTreeSet<u64>,
    /// Address -> block, for every block requested so far this trace.
    blocks: FxHashMap<u64, BlockId>,
    /// Decoded blocks by VMA; excludes synthetic glue blocks. Ordered so the
    /// dispatcher arrays come out in address order.
    lifted_block_map: BTreeMap<u64, BlockId>,
    /// Exact predecessor sets, maintained at every branch emission.
    bb_parents: FxHashMap<BlockId, FxHashSet<BlockId>>,
    /// Per-block register traffic.
    reg_info: FxHashMap<BlockId, BBRegInfo>,
    /// Blocks ending in an indirect jump, with the run-time destination value.
    br_blocks: Vec<(BlockId, ValueId)>,
    indirect_br_block: Option<BlockId>,
    lift_all_insn: bool,
    inst_bytes: Vec<u8>,
}

/// The trace lifter core. Couples a trace manager, an architecture adapter
/// (with its semantics catalogue), and the module being populated.
pub struct TraceLifter<'a, M, A> {
    manager: &'a mut M,
    arch: &'a A,
    module: &'a mut Module,
    state: LiftState,
    root_addr: u64,
    root_name: String,
}

impl<'a, M, A> TraceLifter<'a, M, A>
where
    M: TraceManager,
    A: ArchAdapter + InstSemantics,
{
    pub fn new(manager: &'a mut M, arch: &'a A, module: &'a mut Module) -> Self {
        Self {
            manager,
            arch,
            module,
            state: LiftState::default(),
            root_addr: 0,
            root_name: String::new(),
        }
    }

    /// Lift all traces reachable from `addr`. `fn_name` names the root
    /// trace; callees are named by the manager. `callback` runs after each
    /// trace is committed.
    pub fn lift(
        &mut self,
        addr: u64,
        fn_name: &str,
        callback: &mut dyn FnMut(u64, FuncId),
    ) -> Result<()> {
        self.state = LiftState::default();
        self.root_addr = addr;
        self.root_name = fn_name.to_string();

        self.state.trace_work_list.insert(addr);
        while let Some(trace_addr) = pop_first(&mut self.state.trace_work_list) {
            // Already lifted.
            if self.manager.get_lifted_definition(trace_addr).is_some() {
                continue;
            }

            debug!(addr = %format_args!("{trace_addr:#x}"), "lifting trace");

            let func = self
                .get_trace_decl(trace_addr)
                .ok_or(LiftError::NotFunctionEntry(trace_addr))?;

            self.state.blocks.clear();
            self.state.lifted_block_map.clear();
            self.state.bb_parents.clear();
            self.state.reg_info.clear();
            self.state.br_blocks.clear();
            self.state.indirect_br_block = None;
            self.state.lift_all_insn = false;

            // Fill in the function; the register-setup block branches to the
            // block holding the first instruction of the trace.
            self.arch.initialize_empty(self.module, func);
            let entry = self
                .module
                .func(func)
                .entry()
                .expect("initialize_empty must create the entry block");
            let first = self.get_or_create_block(func, trace_addr);
            self.direct_branch(func, entry, first);

            debug_assert!(self.state.inst_work_list.is_empty());
            self.state.inst_work_list.insert(trace_addr);

            loop {
                while let Some(inst_addr) = pop_first(&mut self.state.inst_work_list) {
                    self.lift_instruction(func, trace_addr, inst_addr);
                }

                // A trace with a register-indirect jump can be entered at any
                // of its instructions at run time; force-lift the full range.
                if !self.state.lift_all_insn && self.state.indirect_br_block.is_some() {
                    let end = self.manager.function_end_vma(trace_addr);
                    let mut vma = trace_addr;
                    while vma < end {
                        if !self.state.lifted_block_map.contains_key(&vma) {
                            self.state.inst_work_list.insert(vma);
                        }
                        vma += INST_BYTES as u64;
                    }
                    self.state.lift_all_insn = true;
                    continue;
                }
                break;
            }

            self.emit_indirect_dispatch(func, trace_addr);

            // No block leaves the builder without a terminator.
            let unterminated: Vec<BlockId> = self
                .module
                .func(func)
                .blocks()
                .filter(|(_, b)| b.term.is_none())
                .map(|(id, _)| id)
                .collect();
            for block in unterminated {
                self.tail_call_intrinsic(func, block, Intrinsic::MissingBlock, trace_addr);
            }

            // Indirect dispatch prohibits single-predecessor collapse across
            // the table's candidates.
            if self.state.indirect_br_block.is_none() {
                flatten::run(
                    self.module.func_mut(func),
                    &mut self.state.bb_parents,
                    &mut self.state.reg_info,
                )?;
            }
            regflow::run(
                self.module.func_mut(func),
                &mut self.state.bb_parents,
                &mut self.state.reg_info,
            )?;

            debug!(
                addr = %format_args!("{trace_addr:#x}"),
                blocks = self.module.func(func).num_blocks(),
                "trace lifted"
            );

            callback(trace_addr, func);
            self.manager.set_lifted_definition(trace_addr, func);
        }

        Ok(())
    }

    /// Lift the instruction at `inst_addr` into its block and emit the
    /// terminator its category requires.
    fn lift_instruction(&mut self, func: FuncId, trace_addr: u64, inst_addr: u64) {
        let block = self.get_or_create_block(func, inst_addr);

        // Already lifted this block.
        if !self.module.func(func).block(block).is_empty() {
            return;
        }

        // An existing trace head mid-trace becomes a terminating tail call
        // without decoding the instruction.
        if inst_addr != trace_addr {
            if let Some(other) = self.get_trace_decl(inst_addr) {
                let pc = self.module.func_mut(func).const_u64(inst_addr);
                self.add_terminating_tail_call(func, block, Callee::Lifted(other), pc, None);
                return;
            }
        }

        // No executable bytes here.
        if !self.read_instruction_bytes(inst_addr) {
            self.tail_call_intrinsic(func, block, Intrinsic::MissingBlock, trace_addr);
            return;
        }

        let inst = self.arch.decode(inst_addr, &self.state.inst_bytes);
        trace!(
            addr = %format_args!("{inst_addr:#x}"),
            category = ?inst.category,
            "decoded"
        );

        let f = self.module.func_mut(func);
        let state_ptr = f.arg(STATE_ARG);
        let lifted = self.arch.lift_into_block(f, block, state_ptr, &inst);
        self.state
            .reg_info
            .entry(block)
            .or_default()
            .absorb_insn(&lifted);

        if lifted.status != LiftStatus::Lifted {
            self.tail_call_intrinsic(func, block, Intrinsic::Error, trace_addr);
            return;
        }

        // Decode the delay-slot instruction once, if the architecture says
        // one may follow.
        let try_delay = self.arch.may_have_delay_slot(&inst);
        let mut delayed_inst = None;
        if try_delay {
            if !self.read_instruction_bytes(inst.delayed_pc) {
                self.tail_call_intrinsic(func, block, Intrinsic::Error, trace_addr);
                return;
            }
            let delayed = self.arch.decode_delayed(inst.delayed_pc, &self.state.inst_bytes);
            if delayed.category == Category::Invalid {
                warn!(
                    addr = %format_args!("{:#x}", inst.delayed_pc),
                    "couldn't decode delayed instruction"
                );
                self.tail_call_intrinsic(func, block, Intrinsic::Error, trace_addr);
                return;
            }
            delayed_inst = Some(delayed);
        }
        let delayed_inst = delayed_inst.as_ref();

        // Connect together the basic blocks.
        match inst.category {
            Category::Invalid | Category::Error => {
                self.tail_call_intrinsic(func, block, Intrinsic::Error, trace_addr);
            }

            Category::Normal | Category::NoOp => {
                let next = self.get_or_create_next_block(func, &inst);
                self.direct_branch(func, block, next);
            }

            // Direct jumps could either be local or could be tail calls; the
            // tail-call case is recognized at the target block when it turns
            // out to be a trace head.
            Category::DirectJump => {
                self.try_add_delay_slot(func, true, block, &inst, delayed_inst, trace_addr);
                let taken = self.get_or_create_branch_taken_block(func, &inst);
                self.direct_branch(func, block, taken);
            }

            Category::IndirectJump => {
                self.try_add_delay_slot(func, true, block, &inst, delayed_inst, trace_addr);
                let ibr = self.get_or_create_indirect_br_block(func);
                let dest = self.find_indirect_br_address(func, block);
                self.state.br_blocks.push((block, dest));
                self.direct_branch(func, block, ibr);
            }

            Category::AsyncHyperCall => {
                let pc = self.module.func_mut(func).const_u64(inst_addr);
                self.add_call(func, block, Callee::Intrinsic(Intrinsic::AsyncHyperCall), pc);
                let next = self.get_or_create_next_block(func, &inst);
                self.direct_branch(func, block, next);
            }

            Category::ConditionalAsyncHyperCall => {
                let do_hyper_call = self.module.func_mut(func).new_block();
                let next = self.get_or_create_next_block(func, &inst);
                let cond = self.load_branch_taken(func, block);
                self.conditional_branch(func, block, cond, do_hyper_call, next);
                let pc = self.module.func_mut(func).const_u64(inst_addr);
                self.add_call(
                    func,
                    do_hyper_call,
                    Callee::Intrinsic(Intrinsic::AsyncHyperCall),
                    pc,
                );
                self.direct_branch(func, do_hyper_call, next);
            }

            Category::DirectFunctionCall => {
                self.try_add_delay_slot(func, true, block, &inst, delayed_inst, trace_addr);
                self.emit_direct_call(func, block, &inst);
                let not_taken = self.get_or_create_branch_not_taken_block(func, &inst);
                self.direct_branch(func, block, not_taken);
            }

            Category::ConditionalDirectFunctionCall => {
                // A call conditional on nothing degrades to the plain form.
                if inst.branch_not_taken_pc == inst.branch_taken_pc {
                    self.try_add_delay_slot(func, true, block, &inst, delayed_inst, trace_addr);
                    self.emit_direct_call(func, block, &inst);
                    let not_taken = self.get_or_create_branch_not_taken_block(func, &inst);
                    self.direct_branch(func, block, not_taken);
                } else {
                    let taken_block = self.module.func_mut(func).new_block();
                    let orig_not_taken = self.get_or_create_branch_not_taken_block(func, &inst);
                    let not_taken = self.delay_pad_not_taken(
                        func,
                        &inst,
                        delayed_inst,
                        try_delay,
                        taken_block,
                        orig_not_taken,
                        trace_addr,
                    );
                    let cond = self.load_branch_taken(func, block);
                    self.conditional_branch(func, block, cond, taken_block, not_taken);
                    self.emit_direct_call(func, taken_block, &inst);
                    self.direct_branch(func, taken_block, orig_not_taken);
                }
            }

            Category::IndirectFunctionCall => {
                self.try_add_delay_slot(func, true, block, &inst, delayed_inst, trace_addr);
                let fall_through = self.module.func_mut(func).new_block();
                let not_taken = self.get_or_create_branch_not_taken_block(func, &inst);
                self.direct_branch(func, fall_through, not_taken);

                // The jump target is the PC value the call semantics stored.
                let dest = self.find_indirect_br_address(func, block);
                self.add_call(func, block, Callee::Intrinsic(Intrinsic::FunctionCall), dest);
                self.direct_branch(func, block, fall_through);
            }

            // Absent on AArch64 but still dispatched; mirrors the
            // conditional direct call with an indirect call site.
            Category::ConditionalIndirectFunctionCall => {
                let taken_block = self.module.func_mut(func).new_block();
                let orig_not_taken = self.get_or_create_branch_not_taken_block(func, &inst);
                let not_taken = self.delay_pad_not_taken(
                    func,
                    &inst,
                    delayed_inst,
                    try_delay,
                    taken_block,
                    orig_not_taken,
                    trace_addr,
                );
                let cond = self.load_branch_taken(func, block);
                self.conditional_branch(func, block, cond, taken_block, not_taken);
                let dest = self.find_indirect_br_address(func, taken_block);
                self.add_call(
                    func,
                    taken_block,
                    Callee::Intrinsic(Intrinsic::FunctionCall),
                    dest,
                );
                self.direct_branch(func, taken_block, orig_not_taken);
            }

            Category::FunctionReturn => {
                self.try_add_delay_slot(func, true, block, &inst, delayed_inst, trace_addr);
                self.tail_call_intrinsic(func, block, Intrinsic::FunctionReturn, trace_addr);
            }

            Category::ConditionalFunctionReturn => {
                let taken_block = self.module.func_mut(func).new_block();
                let orig_not_taken = self.get_or_create_branch_not_taken_block(func, &inst);
                let not_taken = self.delay_pad_not_taken(
                    func,
                    &inst,
                    delayed_inst,
                    try_delay,
                    taken_block,
                    orig_not_taken,
                    trace_addr,
                );
                let cond = self.load_branch_taken(func, block);
                self.conditional_branch(func, block, cond, taken_block, not_taken);
                self.tail_call_intrinsic(func, taken_block, Intrinsic::FunctionReturn, trace_addr);
            }

            Category::ConditionalBranch => {
                let mut taken = self.get_or_create_branch_taken_block(func, &inst);
                let mut not_taken = self.get_or_create_branch_not_taken_block(func, &inst);

                // Delay slots execute in new blocks injected between the
                // branch and its original targets.
                if try_delay {
                    let new_taken = self.module.func_mut(func).new_block();
                    let new_not_taken = self.module.func_mut(func).new_block();
                    self.try_add_delay_slot(func, true, new_taken, &inst, delayed_inst, trace_addr);
                    self.try_add_delay_slot(
                        func,
                        false,
                        new_not_taken,
                        &inst,
                        delayed_inst,
                        trace_addr,
                    );
                    self.direct_branch(func, new_taken, taken);
                    self.direct_branch(func, new_not_taken, not_taken);
                    taken = new_taken;
                    not_taken = new_not_taken;
                }

                let cond = self.load_branch_taken(func, block);
                self.conditional_branch(func, block, cond, taken, not_taken);
            }

            // Absent on AArch64 but still dispatched.
            Category::ConditionalIndirectJump => {
                let taken_block = self.module.func_mut(func).new_block();
                let orig_not_taken = self.get_or_create_branch_not_taken_block(func, &inst);
                let not_taken = self.delay_pad_not_taken(
                    func,
                    &inst,
                    delayed_inst,
                    try_delay,
                    taken_block,
                    orig_not_taken,
                    trace_addr,
                );
                let cond = self.load_branch_taken(func, block);
                self.conditional_branch(func, block, cond, taken_block, not_taken);
                self.tail_call_intrinsic(func, taken_block, Intrinsic::Jump, trace_addr);
            }
        }
    }

    /// Seed the callee trace and emit the call, unless the call is a
    /// call-to-next-PC used only to read the instruction pointer.
    fn emit_direct_call(&mut self, func: FuncId, block: BlockId, inst: &Inst) {
        if inst.branch_not_taken_pc == inst.branch_taken_pc {
            return;
        }
        self.state.trace_work_list.insert(inst.branch_taken_pc);
        let name = self.trace_name(inst.branch_taken_pc);
        let target = match self.get_trace_decl(inst.branch_taken_pc) {
            Some(f) => f,
            // The manager does not know this callee yet; declare it by name
            // and let the work-list pop decide its fate.
            None => self.arch.declare_lifted_function(self.module, &name),
        };
        let pc = self.module.func_mut(func).const_u64(inst.branch_taken_pc);
        self.add_call(func, block, Callee::Lifted(target), pc);
    }

    /// Delay-slot padding for the not-taken side of a conditional form:
    /// returns the block the conditional branch should target.
    #[allow(clippy::too_many_arguments)]
    fn delay_pad_not_taken(
        &mut self,
        func: FuncId,
        inst: &Inst,
        delayed: Option<&Inst>,
        try_delay: bool,
        taken_block: BlockId,
        orig_not_taken: BlockId,
        trace_addr: u64,
    ) -> BlockId {
        if !try_delay {
            return orig_not_taken;
        }
        let not_taken = self.module.func_mut(func).new_block();
        self.try_add_delay_slot(func, true, taken_block, inst, delayed, trace_addr);
        self.try_add_delay_slot(func, false, not_taken, inst, delayed, trace_addr);
        self.direct_branch(func, not_taken, orig_not_taken);
        not_taken
    }

    /// Lift the delayed instruction into `into_block` if it executes on this
    /// path.
    fn try_add_delay_slot(
        &mut self,
        func: FuncId,
        on_branch_taken_path: bool,
        into_block: BlockId,
        inst: &Inst,
        delayed: Option<&Inst>,
        trace_addr: u64,
    ) {
        let Some(delayed) = delayed else { return };
        if !self
            .arch
            .next_instruction_is_delayed(inst, delayed, on_branch_taken_path)
        {
            return;
        }
        let f = self.module.func_mut(func);
        let state_ptr = f.arg(STATE_ARG);
        let lifted = self.arch.lift_into_block(f, into_block, state_ptr, delayed);
        self.state
            .reg_info
            .entry(into_block)
            .or_default()
            .absorb_insn(&lifted);
        if lifted.status != LiftStatus::Lifted {
            self.tail_call_intrinsic(func, into_block, Intrinsic::Error, trace_addr);
        }
    }

    /// Materialize the dispatcher for a trace containing indirect jumps:
    /// block-address tables as module constants, a join over the run-time
    /// destinations, the table-lookup helper call, and the indirect branch
    /// listing every decoded block plus the leave-function fallback.
    fn emit_indirect_dispatch(&mut self, func: FuncId, trace_addr: u64) {
        if self.state.br_blocks.is_empty() {
            return;
        }
        let Some(ibr) = self.state.indirect_br_block else {
            return;
        };

        let br_to_func_block = self.module.func_mut(func).new_block();

        let mut bb_addrs = Vec::with_capacity(self.state.lifted_block_map.len() + 1);
        let mut bb_addr_vmas = Vec::with_capacity(self.state.lifted_block_map.len() + 1);
        for (&vma, &bb) in &self.state.lifted_block_map {
            bb_addrs.push(GlobalElem::BlockAddr { func, block: bb });
            bb_addr_vmas.push(GlobalElem::U64(vma));
        }
        // The end element diverts unknown destinations out of the function.
        bb_addrs.push(GlobalElem::BlockAddr { func, block: br_to_func_block });
        bb_addr_vmas.push(GlobalElem::U64(u64::MAX));

        let size = bb_addrs.len() as u64;
        let fn_name = self.module.func(func).name.clone();
        let g_addrs = self
            .module
            .add_global(GlobalArray::new(format!("{fn_name}.bb_addrs"), bb_addrs));
        let g_vmas = self
            .module
            .add_global(GlobalArray::new(format!("{fn_name}.bb_addr_vmas"), bb_addr_vmas));
        self.manager.register_block_addr_table(BlockAddrTable {
            fn_vma: trace_addr,
            bb_addrs: g_addrs,
            bb_addr_vmas: g_vmas,
            size,
        });

        let f = self.module.func_mut(func);
        let incomings = self.state.br_blocks.clone();
        let phi = f.push_inst(ibr, ValueKind::Phi { incomings }, RegClass::X);
        let trace_const = f.const_u64(trace_addr);
        let runtime = f.arg(RUNTIME_ARG);
        let target = f.push_inst(
            ibr,
            ValueKind::Call {
                callee: Callee::Intrinsic(Intrinsic::GetIndirectBrBlockAddress),
                args: vec![runtime, trace_const, phi],
            },
            RegClass::X,
        );

        let mut dests: Vec<BlockId> = self.state.lifted_block_map.values().copied().collect();
        dests.push(br_to_func_block);
        f.set_term(ibr, Terminator::IndirectBr { addr: target, dests: dests.clone() });
        for dest in dests {
            self.state.bb_parents.entry(dest).or_default().insert(ibr);
        }

        // The fallback hands the unresolved destination back to the runtime.
        let minus_one = self.module.func_mut(func).const_u64(u64::MAX);
        self.add_terminating_tail_call(
            func,
            br_to_func_block,
            Callee::Intrinsic(Intrinsic::Jump),
            minus_one,
            Some(phi),
        );
    }

    /// Reads the bytes of the instruction at `addr`, stopping at the first
    /// unreadable byte or on address-space wrap.
    fn read_instruction_bytes(&mut self, addr: u64) -> bool {
        self.state.inst_bytes.clear();
        for i in 0..self.arch.max_inst_bytes() {
            let byte_addr = addr.wrapping_add(i as u64) & self.arch.address_mask();
            if byte_addr < addr {
                break; // address overflow
            }
            match self.manager.try_read_exec_byte(byte_addr) {
                Some(byte) => self.state.inst_bytes.push(byte),
                None => {
                    warn!(
                        addr = %format_args!("{byte_addr:#x}"),
                        "couldn't read executable byte"
                    );
                    break;
                }
            }
        }
        !self.state.inst_bytes.is_empty()
    }

    fn trace_name(&self, addr: u64) -> String {
        if addr == self.root_addr && !self.root_name.is_empty() {
            self.root_name.clone()
        } else {
            self.manager.lifted_name(addr)
        }
    }

    /// A trace head the manager knows about: an existing declaration, a
    /// function already present in the module under the trace's name, or a
    /// fresh declaration.
    fn get_trace_decl(&mut self, addr: u64) -> Option<FuncId> {
        if !self.manager.is_function_entry(addr) {
            return None;
        }
        if let Some(f) = self.manager.get_lifted_declaration(addr) {
            return Some(f);
        }
        let name = self.trace_name(addr);
        if let Some(f) = self.module.get_function(&name) {
            return Some(f);
        }
        Some(self.arch.declare_lifted_function(self.module, &name))
    }

    fn get_or_create_block(&mut self, func: FuncId, pc: u64) -> BlockId {
        let block = match self.state.blocks.get(&pc) {
            Some(&b) => b,
            None => {
                let b = self.module.func_mut(func).new_block();
                self.state.blocks.insert(pc, b);
                b
            }
        };
        self.state.lifted_block_map.entry(pc).or_insert(block);
        block
    }

    fn get_or_create_next_block(&mut self, func: FuncId, inst: &Inst) -> BlockId {
        self.state.inst_work_list.insert(inst.next_pc);
        self.get_or_create_block(func, inst.next_pc)
    }

    fn get_or_create_branch_taken_block(&mut self, func: FuncId, inst: &Inst) -> BlockId {
        self.state.inst_work_list.insert(inst.branch_taken_pc);
        self.get_or_create_block(func, inst.branch_taken_pc)
    }

    fn get_or_create_branch_not_taken_block(&mut self, func: FuncId, inst: &Inst) -> BlockId {
        debug_assert!(inst.branch_not_taken_pc != 0);
        self.state.inst_work_list.insert(inst.branch_not_taken_pc);
        self.get_or_create_block(func, inst.branch_not_taken_pc)
    }

    /// The single dispatcher block of the current function.
    fn get_or_create_indirect_br_block(&mut self, func: FuncId) -> BlockId {
        if let Some(b) = self.state.indirect_br_block {
            return b;
        }
        let b = self.module.func_mut(func).new_block();
        self.state.indirect_br_block = Some(b);
        b
    }

    /// The branch-taken condition the conditional instruction's semantics
    /// stored.
    fn load_branch_taken(&mut self, func: FuncId, block: BlockId) -> ValueId {
        self.arch
            .load_reg_value(self.module.func_mut(func), block, Reg::branch_taken())
    }

    /// The run-time destination of an indirect control transfer: the PC
    /// value its semantics stored.
    fn find_indirect_br_address(&mut self, func: FuncId, block: BlockId) -> ValueId {
        self.arch
            .load_reg_value(self.module.func_mut(func), block, Reg::pc())
    }

    /// Emit `src -> dest` and record the parent edge.
    fn direct_branch(&mut self, func: FuncId, src: BlockId, dest: BlockId) {
        self.module.func_mut(func).set_term(src, Terminator::Br { dest });
        self.state.bb_parents.entry(dest).or_default().insert(src);
    }

    /// Emit a two-way branch and record both parent edges.
    fn conditional_branch(
        &mut self,
        func: FuncId,
        src: BlockId,
        cond: ValueId,
        taken: BlockId,
        not_taken: BlockId,
    ) {
        self.module
            .func_mut(func)
            .set_term(src, Terminator::CondBr { cond, taken, not_taken });
        self.state.bb_parents.entry(taken).or_default().insert(src);
        self.state.bb_parents.entry(not_taken).or_default().insert(src);
    }

    /// Non-terminating call with the standard `(state, pc, runtime)` shape.
    fn add_call(&mut self, func: FuncId, block: BlockId, callee: Callee, pc: ValueId) {
        let f = self.module.func_mut(func);
        let args = vec![f.arg(STATE_ARG), pc, f.arg(RUNTIME_ARG)];
        f.push_inst(block, ValueKind::Call { callee, args }, RegClass::X);
    }

    fn add_terminating_tail_call(
        &mut self,
        func: FuncId,
        block: BlockId,
        callee: Callee,
        pc: ValueId,
        extra: Option<ValueId>,
    ) {
        let f = self.module.func_mut(func);
        let mut args = vec![f.arg(STATE_ARG), pc, f.arg(RUNTIME_ARG)];
        args.extend(extra);
        f.set_term(block, Terminator::TailCall { callee, args });
    }

    fn tail_call_intrinsic(
        &mut self,
        func: FuncId,
        block: BlockId,
        intrinsic: Intrinsic,
        pc: u64,
    ) {
        let pc = self.module.func_mut(func).const_u64(pc);
        self.add_terminating_tail_call(func, block, Callee::Intrinsic(intrinsic), pc, None);
    }
}

/// Pop the least element of an ordered work-list.
fn pop_first(set: &mut BTreeSet<u64>) -> Option<u64> {
    let first = *set.iter().next()?;
    set.remove(&first);
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_first_is_least() {
        let mut set = BTreeSet::new();
        set.insert(30);
        set.insert(10);
        set.insert(20);
        assert_eq!(pop_first(&mut set), Some(10));
        assert_eq!(pop_first(&mut set), Some(20));
        assert_eq!(pop_first(&mut set), Some(30));
        assert_eq!(pop_first(&mut set), None);
    }
}
