//! Register-flow analysis.
//!
//! Replaces the load-through-state pattern the semantics emit with SSA
//! values threaded through the CFG via join nodes. Blocks are grouped into
//! region bags; loops collapse each cycle into one bag, leaving a DAG. A
//! forward pass accumulates the registers written on paths into each bag and
//! a backward pass the registers read below it; their intersection is the
//! set of registers every entry to the bag must carry as a join value.
//!
//! Join insertion then walks the blocks, replacing state loads with the
//! carried values and planting loads (or synthetic relay blocks on single
//! edges) where a predecessor does not supply a register.

use std::collections::{BTreeMap, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{trace, trace_span};

use a64rc_ir::{BlockId, CastKind, Func, Terminator, ValueId, ValueKind};
use a64rc_isa::{Reg, RegClass, RegId};

use crate::error::AnalysisError;
use crate::reg_info::BBRegInfo;

type BagId = usize;

/// A set of blocks treated as one node of the quotient graph.
#[derive(Clone, Debug, Default)]
struct RegionBag {
    in_bbs: FxHashSet<BlockId>,
    parents: FxHashSet<BagId>,
    children: FxHashSet<BagId>,
    /// Registers written anywhere in the bag or on paths into it.
    read_write_reg_map: BTreeMap<RegId, RegClass>,
    /// Registers whose first use in the bag subtree is a read.
    inherited_read_reg_map: BTreeMap<RegId, RegClass>,
    /// Registers every entry to the bag must carry as a join value.
    phi_reg_map: BTreeMap<RegId, RegClass>,
}

pub(crate) fn run(
    func: &mut Func,
    bb_parents: &mut FxHashMap<BlockId, FxHashSet<BlockId>>,
    reg_info: &mut FxHashMap<BlockId, BBRegInfo>,
) -> Result<(), AnalysisError> {
    let Some(entry) = func.entry() else {
        return Ok(());
    };
    let mut flow = RegFlow {
        func,
        bb_parents,
        reg_info,
        bags: Vec::new(),
        bag_of: FxHashMap::default(),
        planned_loads: FxHashMap::default(),
        relay_on_edge: FxHashMap::default(),
        relays: FxHashSet::default(),
        pending_blocks: Vec::new(),
    };

    {
        let _span = trace_span!("region_bags").entered();
        flow.build_bags(entry);
        flow.eliminate_loops(entry)?;
    }
    {
        let _span = trace_span!("propagate").entered();
        flow.propagate_write_sets();
        flow.propagate_read_sets();
        flow.compute_phi_sets();
    }
    {
        let _span = trace_span!("join_insertion").entered();
        flow.insert_phis_and_rewrite(entry)?;
    }
    flow.verify()
}

struct RegFlow<'a> {
    func: &'a mut Func,
    bb_parents: &'a mut FxHashMap<BlockId, FxHashSet<BlockId>>,
    reg_info: &'a mut FxHashMap<BlockId, BBRegInfo>,
    /// Bag arena; merged bags become `None`.
    bags: Vec<Option<RegionBag>>,
    bag_of: FxHashMap<BlockId, BagId>,
    /// Loads planted at block ends during incoming-value resolution.
    planned_loads: FxHashMap<BlockId, FxHashMap<RegId, (RegClass, ValueId)>>,
    relay_on_edge: FxHashMap<(BlockId, BlockId), BlockId>,
    relays: FxHashSet<BlockId>,
    /// Relay blocks awaiting a rewrite pass.
    pending_blocks: Vec<BlockId>,
}

impl RegFlow<'_> {
    /// One bag per reachable block, edges mirroring the CFG.
    fn build_bags(&mut self, entry: BlockId) {
        let mut queue = VecDeque::from([entry]);
        let mut order = Vec::new();
        let mut seen = FxHashSet::default();
        seen.insert(entry);
        while let Some(b) = queue.pop_front() {
            order.push(b);
            for s in self.func.successors(b) {
                if seen.insert(s) {
                    queue.push_back(s);
                }
            }
        }

        for &b in &order {
            let id = self.bags.len();
            let mut bag = RegionBag::default();
            bag.in_bbs.insert(b);
            if let Some(info) = self.reg_info.get(&b) {
                for (&r, &c) in &info.read_write_reg_map {
                    bag.read_write_reg_map.insert(r, c);
                }
                for (&r, &c) in &info.read_before_write_map {
                    bag.inherited_read_reg_map.insert(r, c);
                }
            }
            self.bags.push(Some(bag));
            self.bag_of.insert(b, id);
        }
        for &b in &order {
            let g = self.bag_of[&b];
            for s in self.func.successors(b) {
                let h = self.bag_of[&s];
                self.bags[g].as_mut().unwrap().children.insert(h);
                self.bags[h].as_mut().unwrap().parents.insert(g);
            }
        }
    }

    /// Collapse every cycle of the bag graph into a single bag. A DFS
    /// carries the current path; re-reaching a bag on the path merges the
    /// whole cycle into its first occurrence, then the walk restarts.
    fn eliminate_loops(&mut self, entry: BlockId) -> Result<(), AnalysisError> {
        let initial_bags = self.bags.len();
        let initial_edges: usize = self
            .bags
            .iter()
            .flatten()
            .map(|b| b.children.len())
            .sum();
        // Every restart retires a bag or a self-edge, so this bound is never
        // reached on well-formed input.
        let mut fuel = initial_bags + initial_edges + 1;

        'restart: loop {
            if fuel == 0 {
                return Err(AnalysisError::LoopEliminationDiverged);
            }
            fuel -= 1;

            let entry_bag = self.bag_of[&entry];
            let mut visited = FxHashSet::default();
            let mut on_path = FxHashSet::default();
            let mut path = vec![entry_bag];
            let mut stack = vec![(entry_bag, self.sorted_children(entry_bag), 0usize)];
            visited.insert(entry_bag);
            on_path.insert(entry_bag);

            while let Some(top) = stack.len().checked_sub(1) {
                let next = {
                    let (_, children, idx) = &mut stack[top];
                    if *idx < children.len() {
                        let c = children[*idx];
                        *idx += 1;
                        Some(c)
                    } else {
                        None
                    }
                };
                match next {
                    Some(child) if on_path.contains(&child) => {
                        // Back edge: everything on the path after the child's
                        // first occurrence belongs to the cycle.
                        let pos = path
                            .iter()
                            .position(|&g| g == child)
                            .expect("on-path bag missing from path");
                        let group: Vec<BagId> = path[pos + 1..].to_vec();
                        self.merge_bags(child, &group);
                        continue 'restart;
                    }
                    Some(child) => {
                        if visited.insert(child) {
                            on_path.insert(child);
                            path.push(child);
                            stack.push((child, self.sorted_children(child), 0));
                        }
                    }
                    None => {
                        let (bag, _, _) = stack.pop().expect("stack underflow");
                        on_path.remove(&bag);
                        path.pop();
                    }
                }
            }
            return Ok(());
        }
    }

    fn sorted_children(&self, bag: BagId) -> Vec<BagId> {
        let mut children: Vec<BagId> = self.bags[bag]
            .as_ref()
            .map(|b| b.children.iter().copied().collect())
            .unwrap_or_default();
        children.sort_unstable();
        children
    }

    /// Merge `group` into `target`, rewriting edges onto the quotient and
    /// dropping self-edges.
    fn merge_bags(&mut self, target: BagId, group: &[BagId]) {
        let group_set: FxHashSet<BagId> = group.iter().copied().collect();
        let mut moved_bbs = Vec::new();
        let mut moved_rw = Vec::new();
        let mut moved_inherited = Vec::new();
        let mut moved_parents = Vec::new();
        let mut moved_children = Vec::new();
        for &g in group {
            let bag = self.bags[g].take().expect("merging a retired bag");
            moved_bbs.extend(bag.in_bbs);
            moved_rw.extend(bag.read_write_reg_map);
            moved_inherited.extend(bag.inherited_read_reg_map);
            moved_parents.extend(bag.parents);
            moved_children.extend(bag.children);
        }

        {
            let t = self.bags[target].as_mut().expect("merge target retired");
            t.in_bbs.extend(moved_bbs.iter().copied());
            for (r, c) in moved_rw {
                t.read_write_reg_map.entry(r).or_insert(c);
            }
            for (r, c) in moved_inherited {
                t.inherited_read_reg_map.entry(r).or_insert(c);
            }
            t.parents.extend(moved_parents);
            t.children.extend(moved_children);
            remap_edges(&mut t.parents, &group_set, target);
            remap_edges(&mut t.children, &group_set, target);
            t.parents.remove(&target);
            t.children.remove(&target);
        }

        for i in 0..self.bags.len() {
            if i == target {
                continue;
            }
            if let Some(bag) = self.bags[i].as_mut() {
                remap_edges(&mut bag.parents, &group_set, target);
                remap_edges(&mut bag.children, &group_set, target);
            }
        }

        for b in moved_bbs {
            self.bag_of.insert(b, target);
        }
    }

    /// Forward pass: each bag's write set absorbs every predecessor's.
    fn propagate_write_sets(&mut self) {
        let mut pending: FxHashMap<BagId, usize> = FxHashMap::default();
        let mut queue = VecDeque::new();
        for (id, bag) in self.bags.iter().enumerate() {
            if let Some(bag) = bag {
                pending.insert(id, bag.parents.len());
                if bag.parents.is_empty() {
                    queue.push_back(id);
                }
            }
        }
        while let Some(g) = queue.pop_front() {
            let rw = self.bags[g].as_ref().unwrap().read_write_reg_map.clone();
            for c in self.sorted_children(g) {
                let child = self.bags[c].as_mut().unwrap();
                for (&r, &cl) in &rw {
                    child.read_write_reg_map.entry(r).or_insert(cl);
                }
                let left = pending.get_mut(&c).expect("child without counter");
                *left -= 1;
                if *left == 0 {
                    queue.push_back(c);
                }
            }
        }
    }

    /// Reverse pass: each bag's inherited-read set absorbs every
    /// successor's.
    fn propagate_read_sets(&mut self) {
        let mut pending: FxHashMap<BagId, usize> = FxHashMap::default();
        let mut queue = VecDeque::new();
        for (id, bag) in self.bags.iter().enumerate() {
            if let Some(bag) = bag {
                pending.insert(id, bag.children.len());
                if bag.children.is_empty() {
                    queue.push_back(id);
                }
            }
        }
        while let Some(g) = queue.pop_front() {
            let inherited = self.bags[g]
                .as_ref()
                .unwrap()
                .inherited_read_reg_map
                .clone();
            let mut parents: Vec<BagId> = self.bags[g]
                .as_ref()
                .unwrap()
                .parents
                .iter()
                .copied()
                .collect();
            parents.sort_unstable();
            for p in parents {
                let parent = self.bags[p].as_mut().unwrap();
                for (&r, &cl) in &inherited {
                    parent.inherited_read_reg_map.entry(r).or_insert(cl);
                }
                let left = pending.get_mut(&p).expect("parent without counter");
                *left -= 1;
                if *left == 0 {
                    queue.push_back(p);
                }
            }
        }
    }

    /// The join set of each bag: registers both written on some path into or
    /// inside the bag and read below it. The consumer side determines the
    /// join node's width class.
    fn compute_phi_sets(&mut self) {
        for bag in self.bags.iter_mut().flatten() {
            bag.phi_reg_map = bag
                .inherited_read_reg_map
                .iter()
                .filter(|(r, _)| bag.read_write_reg_map.contains_key(*r))
                .map(|(&r, &c)| (r, c))
                .collect();
        }
    }

    /// BFS over blocks: insert the bag's join nodes at each head, then
    /// rewrite the block's state loads against the carried values.
    fn insert_phis_and_rewrite(&mut self, entry: BlockId) -> Result<(), AnalysisError> {
        let mut queue = VecDeque::from([entry]);
        let mut visited = FxHashSet::default();
        visited.insert(entry);
        while let Some(b) = queue.pop_front() {
            if !self.relays.contains(&b) {
                let bag = self.bag_of[&b];
                let phi_regs: Vec<RegId> = self.bags[bag]
                    .as_ref()
                    .unwrap()
                    .phi_reg_map
                    .keys()
                    .copied()
                    .collect();
                for r in phi_regs {
                    self.get_or_create_phi(b, r)?;
                }
            }
            self.rewrite_block(b);
            for s in self.func.successors(b) {
                if visited.insert(s) {
                    queue.push_back(s);
                }
            }
            for rb in std::mem::take(&mut self.pending_blocks) {
                if visited.insert(rb) {
                    queue.push_back(rb);
                }
            }
        }
        Ok(())
    }

    /// The join node for `r` at the head of `b`, creating it (and resolving
    /// one incoming value per predecessor) if missing.
    fn get_or_create_phi(&mut self, b: BlockId, r: RegId) -> Result<ValueId, AnalysisError> {
        if let Some(&phi) = self
            .reg_info
            .get(&b)
            .and_then(|i| i.reg_phi_inst_map.get(&r))
        {
            return Ok(phi);
        }
        let bag = self.bag_of[&b];
        let class = *self.bags[bag]
            .as_ref()
            .and_then(|bg| bg.phi_reg_map.get(&r))
            .expect("join requested for a register the bag does not carry");

        // Register the node before resolving incomings so cyclic resolution
        // terminates on it.
        let phi = self
            .func
            .insert_inst(b, 0, ValueKind::Phi { incomings: Vec::new() }, class);
        self.reg_info
            .entry(b)
            .or_default()
            .reg_phi_inst_map
            .insert(r, phi);

        let mut preds: Vec<BlockId> = self
            .bb_parents
            .get(&b)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        preds.sort_unstable();

        let mut resolved = Vec::with_capacity(preds.len());
        for p in preds {
            resolved.push(self.resolve_incoming(p, b, r, class)?);
        }
        match &mut self.func.value_mut(phi).kind {
            ValueKind::Phi { incomings } => *incomings = resolved,
            _ => unreachable!("join node changed kind"),
        }
        trace!(block = b.0, reg = %r, "join node inserted");
        Ok(phi)
    }

    /// The value register `r` has at the end of predecessor `p` of `b`,
    /// together with the block the edge now comes from (a relay when one had
    /// to be inserted).
    fn resolve_incoming(
        &mut self,
        p: BlockId,
        b: BlockId,
        r: RegId,
        class: RegClass,
    ) -> Result<(BlockId, ValueId), AnalysisError> {
        // The predecessor defines the register itself.
        if let Some(&(pclass, v)) = self
            .reg_info
            .get(&p)
            .and_then(|i| i.reg_latest_inst_map.get(&r))
        {
            return Ok((p, self.cast_at_end(p, v, pclass, class)));
        }
        // A load is already slated for the predecessor (relay or otherwise).
        if let Some(&(lclass, v)) = self.planned_loads.get(&p).and_then(|m| m.get(&r)) {
            return Ok((p, self.cast_at_end(p, v, lclass, class)));
        }
        // The predecessor's bag carries the register: chain to its join.
        if !self.relays.contains(&p) {
            let pbag = self.bag_of[&p];
            let carried = self.bags[pbag]
                .as_ref()
                .and_then(|bg| bg.phi_reg_map.get(&r))
                .copied();
            if let Some(pclass) = carried {
                let v = self.get_or_create_phi(p, r)?;
                return Ok((p, self.cast_at_end(p, v, pclass, class)));
            }
        }
        // The predecessor does not carry the register. When every successor
        // wants it, the load can live in the predecessor itself; otherwise
        // it goes into a relay block on this edge alone.
        let succs = self.func.successors(p);
        let all_carry = !succs.is_empty() && succs.iter().all(|&s| self.carries(s, r));
        if all_carry {
            let v = self.plant_load(p, r, class);
            Ok((p, v))
        } else {
            let relay = self.relay_for_edge(p, b);
            let v = self.plant_load(relay, r, class);
            Ok((relay, v))
        }
    }

    /// Whether entering `s` supplies `r` without a load in the predecessor.
    fn carries(&self, s: BlockId, r: RegId) -> bool {
        if self.relays.contains(&s) {
            return self
                .planned_loads
                .get(&s)
                .is_some_and(|m| m.contains_key(&r));
        }
        self.bag_of
            .get(&s)
            .and_then(|&bag| self.bags[bag].as_ref())
            .is_some_and(|bg| bg.phi_reg_map.contains_key(&r))
    }

    /// Plant a state load of `r` at the end of `block` and remember it.
    fn plant_load(&mut self, block: BlockId, r: RegId, class: RegClass) -> ValueId {
        let v = self
            .func
            .push_inst(block, ValueKind::LoadReg(Reg::new(r, class)), class);
        self.planned_loads
            .entry(block)
            .or_default()
            .insert(r, (class, v));
        v
    }

    /// The relay block on edge `p -> b`, creating and splicing it in if
    /// missing. The relay inherits the successor's bag for join purposes.
    fn relay_for_edge(&mut self, p: BlockId, b: BlockId) -> BlockId {
        if let Some(&rb) = self.relay_on_edge.get(&(p, b)) {
            return rb;
        }
        let rb = self.func.new_block();
        self.func.set_term(rb, Terminator::Br { dest: b });
        if let Some(term) = self.func.term_mut(p) {
            term.retarget(b, rb);
        }
        if let Some(parents) = self.bb_parents.get_mut(&b) {
            parents.remove(&p);
        }
        self.bb_parents.entry(b).or_default().insert(rb);
        self.bb_parents.entry(rb).or_default().insert(p);

        // Joins already placed in the successor still name the old edge.
        let insts = self.func.block(b).insts.clone();
        for inst in insts {
            if let ValueKind::Phi { incomings } = &mut self.func.value_mut(inst).kind {
                for (src, _) in incomings.iter_mut() {
                    if *src == p {
                        *src = rb;
                    }
                }
            }
        }

        let bag = self.bag_of[&b];
        self.bag_of.insert(rb, bag);
        self.bags[bag].as_mut().unwrap().in_bbs.insert(rb);
        self.relays.insert(rb);
        self.relay_on_edge.insert((p, b), rb);
        self.reg_info.entry(rb).or_default();
        self.pending_blocks.push(rb);
        trace!(from = p.0, to = b.0, relay = rb.0, "relay block inserted");
        rb
    }

    /// Walk the block, replacing each state load with the ascending carried
    /// value (join node, store, or semantic-call output), casting on width
    /// mismatch. The end-state values become the block's latest map so later
    /// incoming resolution reuses surviving loads.
    fn rewrite_block(&mut self, b: BlockId) {
        let mut cur: FxHashMap<RegId, (RegClass, ValueId)> = FxHashMap::default();
        if let Some(info) = self.reg_info.get(&b) {
            for (&r, &phi) in &info.reg_phi_inst_map {
                cur.insert(r, (self.func.class_of(phi), phi));
            }
        }

        let insts = self.func.block(b).insts.clone();
        for inst in insts {
            let kind = self.func.value(inst).kind.clone();
            match kind {
                ValueKind::LoadReg(reg) => {
                    if let Some(&(c, v)) = cur.get(&reg.id) {
                        let v = if c == reg.class {
                            v
                        } else {
                            let pos = self
                                .func
                                .block(b)
                                .insts
                                .iter()
                                .position(|&i| i == inst)
                                .expect("rewritten load left its block");
                            self.func.insert_inst(
                                b,
                                pos,
                                ValueKind::Cast { kind: cast_kind(c, reg.class), value: v },
                                reg.class,
                            )
                        };
                        self.func.replace_all_uses(inst, v);
                        self.func.remove_inst(b, inst);
                        if let Some(planned) = self.planned_loads.get_mut(&b) {
                            if let Some(entry) = planned.get_mut(&reg.id) {
                                if entry.1 == inst {
                                    *entry = (reg.class, v);
                                }
                            }
                        }
                    } else {
                        cur.insert(reg.id, (reg.class, inst));
                    }
                }
                ValueKind::StoreReg { reg, value } => {
                    cur.insert(reg.id, (reg.class, value));
                }
                ValueKind::SemaCall { .. } => {
                    let written = self
                        .reg_info
                        .get(&b)
                        .and_then(|i| i.sema_call_written_reg_map.get(&inst))
                        .cloned();
                    if let Some(written) = written {
                        for (reg, v) in written {
                            cur.insert(reg.id, (reg.class, v));
                        }
                    }
                }
                _ => {}
            }
        }

        let info = self.reg_info.entry(b).or_default();
        for (r, entry) in cur {
            info.reg_latest_inst_map.insert(r, entry);
        }
    }

    /// Every join node must have exactly one incoming per predecessor.
    fn verify(&self) -> Result<(), AnalysisError> {
        for (b, block) in self.func.blocks() {
            let preds = self.bb_parents.get(&b).map_or(0, |s| s.len());
            for &inst in &block.insts {
                if let ValueKind::Phi { incomings } = &self.func.value(inst).kind {
                    if incomings.len() != preds {
                        return Err(AnalysisError::PhiArityMismatch(b.0, incomings.len(), preds));
                    }
                }
            }
        }
        Ok(())
    }

    /// Append a width cast at the end of `block` when classes disagree.
    fn cast_at_end(
        &mut self,
        block: BlockId,
        v: ValueId,
        from: RegClass,
        to: RegClass,
    ) -> ValueId {
        if from == to {
            return v;
        }
        self.func
            .push_inst(block, ValueKind::Cast { kind: cast_kind(from, to), value: v }, to)
    }
}

fn remap_edges(set: &mut FxHashSet<BagId>, group: &FxHashSet<BagId>, target: BagId) {
    if set.iter().any(|g| group.contains(g)) {
        let old = std::mem::take(set);
        set.extend(old.into_iter().map(|g| if group.contains(&g) { target } else { g }));
    }
}

/// Narrowing truncates, widening zero-extends (32-bit register writes zero
/// the upper half), same-width reinterprets.
fn cast_kind(from: RegClass, to: RegClass) -> CastKind {
    if from.bits() == to.bits() {
        CastKind::Bitcast
    } else if to.bits() > from.bits() {
        CastKind::Zext
    } else {
        CastKind::Trunc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a64rc_ir::{Callee, Intrinsic};

    fn x(n: u8) -> Reg {
        Reg::gpr(n, true)
    }

    fn ret(func: &mut Func, block: BlockId) {
        let pc = func.const_u64(0);
        func.set_term(
            block,
            Terminator::TailCall {
                callee: Callee::Intrinsic(Intrinsic::FunctionReturn),
                args: vec![pc],
            },
        );
    }

    fn store(func: &mut Func, block: BlockId, reg: Reg, v: u64) -> ValueId {
        let val = func.const_u64(v);
        func.push_inst(block, ValueKind::StoreReg { reg, value: val }, reg.class);
        val
    }

    fn load(func: &mut Func, block: BlockId, reg: Reg) -> ValueId {
        func.push_inst(block, ValueKind::LoadReg(reg), reg.class)
    }

    fn parents_of(pairs: &[(BlockId, &[BlockId])]) -> FxHashMap<BlockId, FxHashSet<BlockId>> {
        let mut map: FxHashMap<BlockId, FxHashSet<BlockId>> = FxHashMap::default();
        for (b, ps) in pairs {
            map.entry(*b).or_default().extend(ps.iter().copied());
        }
        map
    }

    fn info_for(func: &Func, block: BlockId) -> BBRegInfo {
        // Reconstruct traffic from the block contents, the way the builder
        // accumulates it while lifting.
        let mut info = BBRegInfo::default();
        for &inst in &func.block(block).insts {
            match &func.value(inst).kind {
                ValueKind::LoadReg(reg) => {
                    if !info.read_write_reg_map.contains_key(&reg.id) {
                        info.read_before_write_map.entry(reg.id).or_insert(reg.class);
                    }
                }
                ValueKind::StoreReg { reg, value } => {
                    info.read_write_reg_map.insert(reg.id, reg.class);
                    info.reg_latest_inst_map.insert(reg.id, (reg.class, *value));
                }
                _ => {}
            }
        }
        info
    }

    fn count_phis(func: &Func, block: BlockId) -> usize {
        func.block(block)
            .insts
            .iter()
            .filter(|&&i| matches!(func.value(i).kind, ValueKind::Phi { .. }))
            .count()
    }

    fn count_loads_of(func: &Func, block: BlockId, r: RegId) -> usize {
        func.block(block)
            .insts
            .iter()
            .filter(|&&i| func.value(i).is_load_of(r))
            .count()
    }

    #[test]
    fn test_diamond_join_gets_phi() {
        // entry -> cond -> {wr, skip} -> join; wr writes X0, join reads X0.
        let mut func = Func::declare("sub_0");
        let entry = func.new_block();
        let cond_b = func.new_block();
        let wr = func.new_block();
        let skip = func.new_block();
        let join = func.new_block();

        func.set_term(entry, Terminator::Br { dest: cond_b });
        let stored = store(&mut func, wr, x(0), 7);
        let c = store(&mut func, cond_b, Reg::branch_taken(), 1);
        func.set_term(cond_b, Terminator::CondBr { cond: c, taken: wr, not_taken: skip });
        func.set_term(wr, Terminator::Br { dest: join });
        func.set_term(skip, Terminator::Br { dest: join });
        load(&mut func, join, x(0));
        ret(&mut func, join);

        let mut parents = parents_of(&[
            (cond_b, &[entry]),
            (wr, &[cond_b]),
            (skip, &[cond_b]),
            (join, &[wr, skip]),
        ]);
        let mut reg_info = FxHashMap::default();
        for b in [entry, cond_b, wr, skip, join] {
            reg_info.insert(b, info_for(&func, b));
        }

        run(&mut func, &mut parents, &mut reg_info).unwrap();

        // One join node for X0 with two incomings; the load is gone.
        assert_eq!(count_phis(&func, join), 1);
        assert_eq!(count_loads_of(&func, join, RegId::Gpr(0)), 0);
        let phi = func.block(join).insts[0];
        match &func.value(phi).kind {
            ValueKind::Phi { incomings } => {
                assert_eq!(incomings.len(), 2);
                let from_wr = incomings.iter().find(|(src, _)| *src == wr).unwrap();
                assert_eq!(from_wr.1, stored);
            }
            other => panic!("expected phi, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_carries_register() {
        // entry -> body; body writes X1 and conditionally branches to itself.
        let mut func = Func::declare("sub_0");
        let entry = func.new_block();
        let body = func.new_block();
        let exit = func.new_block();

        func.set_term(entry, Terminator::Br { dest: body });
        load(&mut func, body, x(1));
        let stored = store(&mut func, body, x(1), 9);
        let c = store(&mut func, body, Reg::branch_taken(), 1);
        func.set_term(body, Terminator::CondBr { cond: c, taken: body, not_taken: exit });
        ret(&mut func, exit);

        let mut parents = parents_of(&[(body, &[entry, body]), (exit, &[body])]);
        let mut reg_info = FxHashMap::default();
        for b in [entry, body, exit] {
            reg_info.insert(b, info_for(&func, b));
        }

        run(&mut func, &mut parents, &mut reg_info).unwrap();

        // The loop body acquires a join for X1: self-edge incoming is its
        // own store, entry incoming is an ingress load planted in entry.
        let phis: Vec<ValueId> = func
            .block(body)
            .insts
            .iter()
            .copied()
            .filter(|&i| matches!(func.value(i).kind, ValueKind::Phi { .. }))
            .collect();
        assert_eq!(phis.len(), 1);
        match &func.value(phis[0]).kind {
            ValueKind::Phi { incomings } => {
                assert_eq!(incomings.len(), 2);
                let from_self = incomings.iter().find(|(src, _)| *src == body).unwrap();
                assert_eq!(from_self.1, stored);
                let from_entry = incomings.iter().find(|(src, _)| *src == entry).unwrap();
                assert!(func.value(from_entry.1).is_load_of(RegId::Gpr(1)));
            }
            other => panic!("expected phi, got {other:?}"),
        }
        // The body's own load of X1 was replaced by the join.
        assert_eq!(count_loads_of(&func, body, RegId::Gpr(1)), 0);
    }

    #[test]
    fn test_relay_block_on_partial_edge() {
        // entry branches to a writer and a bystander; both reach the reader,
        // but the bystander path must not pay for a load it doesn't need, so
        // the load goes into a relay on the bystander -> reader edge.
        let mut func = Func::declare("sub_0");
        let entry = func.new_block();
        let writer = func.new_block();
        let bystander = func.new_block();
        let reader = func.new_block();
        let other = func.new_block();

        let c = store(&mut func, entry, Reg::branch_taken(), 1);
        func.set_term(entry, Terminator::CondBr { cond: c, taken: writer, not_taken: bystander });
        store(&mut func, writer, x(5), 3);
        func.set_term(writer, Terminator::Br { dest: reader });
        let c2 = store(&mut func, bystander, Reg::branch_taken(), 0);
        func.set_term(bystander, Terminator::CondBr { cond: c2, taken: reader, not_taken: other });
        load(&mut func, reader, x(5));
        ret(&mut func, reader);
        ret(&mut func, other);

        let mut parents = parents_of(&[
            (writer, &[entry]),
            (bystander, &[entry]),
            (reader, &[writer, bystander]),
            (other, &[bystander]),
        ]);
        let mut reg_info = FxHashMap::default();
        for b in [entry, writer, bystander, reader, other] {
            reg_info.insert(b, info_for(&func, b));
        }

        let before = func.num_blocks();
        run(&mut func, &mut parents, &mut reg_info).unwrap();

        // The bystander edge to the reader now goes through a relay block
        // carrying the X5 load; the bystander's other path pays nothing.
        let relay = match func.term(bystander) {
            Some(Terminator::CondBr { taken, .. }) => *taken,
            other => panic!("expected cond branch, got {other:?}"),
        };
        assert_ne!(relay, reader);
        assert!(func.num_blocks() > before);
        assert_eq!(count_loads_of(&func, relay, RegId::Gpr(5)), 1);
        assert!(matches!(
            func.term(relay),
            Some(Terminator::Br { dest }) if *dest == reader
        ));
        assert_eq!(count_loads_of(&func, bystander, RegId::Gpr(5)), 0);
        assert_eq!(count_loads_of(&func, other, RegId::Gpr(5)), 0);
        // The reader's load was folded into its join node.
        assert_eq!(count_loads_of(&func, reader, RegId::Gpr(5)), 0);
        assert_eq!(count_phis(&func, reader), 1);
    }

    #[test]
    fn test_width_mismatch_inserts_cast() {
        // The writer stores W2; the reader wants X2.
        let mut func = Func::declare("sub_0");
        let entry = func.new_block();
        let a = func.new_block();
        let b = func.new_block();
        func.set_term(entry, Terminator::Br { dest: a });
        store(&mut func, a, Reg::gpr(2, false), 5);
        let c = store(&mut func, a, Reg::branch_taken(), 1);
        func.set_term(a, Terminator::CondBr { cond: c, taken: a, not_taken: b });
        load(&mut func, b, x(2));
        ret(&mut func, b);

        let mut parents = parents_of(&[(a, &[entry, a]), (b, &[a])]);
        let mut reg_info = FxHashMap::default();
        for blk in [entry, a, b] {
            reg_info.insert(blk, info_for(&func, blk));
        }

        run(&mut func, &mut parents, &mut reg_info).unwrap();

        // Somewhere a W -> X zero-extension was materialized.
        let mut saw_zext = false;
        for (_, block) in func.blocks() {
            for &i in &block.insts {
                if let ValueKind::Cast { kind: CastKind::Zext, .. } = func.value(i).kind {
                    saw_zext = true;
                }
            }
        }
        assert!(saw_zext);
    }

    #[test]
    fn test_propagation_is_idempotent() {
        let mut func = Func::declare("sub_0");
        let entry = func.new_block();
        let a = func.new_block();
        let b = func.new_block();
        func.set_term(entry, Terminator::Br { dest: a });
        store(&mut func, a, x(3), 1);
        func.set_term(a, Terminator::Br { dest: b });
        load(&mut func, b, x(3));
        ret(&mut func, b);

        let mut parents = parents_of(&[(a, &[entry]), (b, &[a])]);
        let mut reg_info = FxHashMap::default();
        for blk in [entry, a, b] {
            reg_info.insert(blk, info_for(&func, blk));
        }

        let mut flow = RegFlow {
            func: &mut func,
            bb_parents: &mut parents,
            reg_info: &mut reg_info,
            bags: Vec::new(),
            bag_of: FxHashMap::default(),
            planned_loads: FxHashMap::default(),
            relay_on_edge: FxHashMap::default(),
            relays: FxHashSet::default(),
            pending_blocks: Vec::new(),
        };
        flow.build_bags(entry);
        flow.eliminate_loops(entry).unwrap();
        flow.propagate_write_sets();
        flow.propagate_read_sets();

        let snapshot: Vec<Option<(BTreeMap<RegId, RegClass>, BTreeMap<RegId, RegClass>)>> = flow
            .bags
            .iter()
            .map(|b| {
                b.as_ref()
                    .map(|b| (b.read_write_reg_map.clone(), b.inherited_read_reg_map.clone()))
            })
            .collect();

        // A saturated graph must not change on a second pass.
        flow.propagate_write_sets();
        flow.propagate_read_sets();
        for (bag, snap) in flow.bags.iter().zip(snapshot) {
            match (bag, snap) {
                (Some(bag), Some((rw, inh))) => {
                    assert_eq!(bag.read_write_reg_map, rw);
                    assert_eq!(bag.inherited_read_reg_map, inh);
                }
                (None, None) => {}
                _ => panic!("bag liveness changed"),
            }
        }
    }

    #[test]
    fn test_loop_elimination_bounded() {
        // Two nested cycles collapse into one bag containing all loop blocks.
        let mut func = Func::declare("sub_0");
        let entry = func.new_block();
        let a = func.new_block();
        let b = func.new_block();
        let c = func.new_block();
        let exit = func.new_block();

        func.set_term(entry, Terminator::Br { dest: a });
        let c1 = store(&mut func, a, Reg::branch_taken(), 1);
        func.set_term(a, Terminator::Br { dest: b });
        func.set_term(b, Terminator::CondBr { cond: c1, taken: a, not_taken: c });
        func.set_term(c, Terminator::CondBr { cond: c1, taken: b, not_taken: exit });
        ret(&mut func, exit);

        let mut parents = parents_of(&[
            (a, &[entry, b]),
            (b, &[a, c]),
            (c, &[b]),
            (exit, &[c]),
        ]);
        let mut reg_info = FxHashMap::default();
        for blk in [entry, a, b, c, exit] {
            reg_info.insert(blk, info_for(&func, blk));
        }

        let mut flow = RegFlow {
            func: &mut func,
            bb_parents: &mut parents,
            reg_info: &mut reg_info,
            bags: Vec::new(),
            bag_of: FxHashMap::default(),
            planned_loads: FxHashMap::default(),
            relay_on_edge: FxHashMap::default(),
            relays: FxHashSet::default(),
            pending_blocks: Vec::new(),
        };
        flow.build_bags(entry);
        flow.eliminate_loops(entry).unwrap();

        let loop_bag = flow.bag_of[&a];
        assert_eq!(flow.bag_of[&b], loop_bag);
        assert_eq!(flow.bag_of[&c], loop_bag);
        assert_ne!(flow.bag_of[&entry], loop_bag);
        assert_ne!(flow.bag_of[&exit], loop_bag);
        // No self-edges survive.
        let bag = flow.bags[loop_bag].as_ref().unwrap();
        assert!(!bag.children.contains(&loop_bag));
        assert!(!bag.parents.contains(&loop_bag));
    }
}
