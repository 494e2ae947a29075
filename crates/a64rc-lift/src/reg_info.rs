//! Per-block register traffic records.

use rustc_hash::FxHashMap;

use a64rc_ir::lift::LiftedInsn;
use a64rc_ir::ValueId;
use a64rc_isa::{Reg, RegClass, RegId};

/// Register traffic of one basic block, accumulated while lifting into it
/// and consumed by the register-flow analyzer.
#[derive(Clone, Debug, Default)]
pub struct BBRegInfo {
    /// Registers written in the block (last width class seen wins).
    pub read_write_reg_map: FxHashMap<RegId, RegClass>,
    /// Registers whose first access in the block is a read.
    pub read_before_write_map: FxHashMap<RegId, RegClass>,
    /// Most recent value defining each register inside the block.
    pub reg_latest_inst_map: FxHashMap<RegId, (RegClass, ValueId)>,
    /// Join node already placed at the block head, per register.
    pub reg_phi_inst_map: FxHashMap<RegId, ValueId>,
    /// Per semantic call, the ordered registers it defines and the values
    /// carrying them (fields for multi-output calls).
    pub sema_call_written_reg_map: FxHashMap<ValueId, Vec<(Reg, ValueId)>>,
}

impl BBRegInfo {
    /// Fold one lifted instruction's traffic into the block record.
    pub fn absorb_insn(&mut self, lifted: &LiftedInsn) {
        for (reg, _) in &lifted.loads {
            if !self.read_write_reg_map.contains_key(&reg.id) {
                self.read_before_write_map.entry(reg.id).or_insert(reg.class);
            }
        }
        for (reg, val) in &lifted.writes {
            self.read_write_reg_map.insert(reg.id, reg.class);
            self.reg_latest_inst_map.insert(reg.id, (reg.class, *val));
        }
        for (call, written) in &lifted.sema_calls {
            self.sema_call_written_reg_map.insert(*call, written.clone());
        }
    }

    /// Merge the record of a successor block spliced into this one. The
    /// successor's entries win for latest values; its reads only become
    /// inherited reads where this block did not already write the register.
    pub fn merge_from(&mut self, other: &Self) {
        for (reg, class) in &other.read_before_write_map {
            if !self.read_write_reg_map.contains_key(reg) {
                self.read_before_write_map.entry(*reg).or_insert(*class);
            }
        }
        for (reg, class) in &other.read_write_reg_map {
            self.read_write_reg_map.insert(*reg, *class);
        }
        for (reg, entry) in &other.reg_latest_inst_map {
            self.reg_latest_inst_map.insert(*reg, *entry);
        }
        for (call, written) in &other.sema_call_written_reg_map {
            self.sema_call_written_reg_map.insert(*call, written.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a64rc_ir::lift::LiftStatus;

    fn reg(n: u8) -> Reg {
        Reg::gpr(n, true)
    }

    fn insn(loads: Vec<(Reg, ValueId)>, writes: Vec<(Reg, ValueId)>) -> LiftedInsn {
        LiftedInsn {
            status: LiftStatus::Lifted,
            loads,
            writes,
            sema_calls: Vec::new(),
        }
    }

    #[test]
    fn test_read_then_write_is_inherited() {
        let mut info = BBRegInfo::default();
        info.absorb_insn(&insn(
            vec![(reg(0), ValueId(3))],
            vec![(reg(0), ValueId(4))],
        ));
        assert!(info.read_before_write_map.contains_key(&RegId::Gpr(0)));
        assert!(info.read_write_reg_map.contains_key(&RegId::Gpr(0)));
    }

    #[test]
    fn test_write_then_read_is_not_inherited() {
        let mut info = BBRegInfo::default();
        info.absorb_insn(&insn(vec![], vec![(reg(1), ValueId(3))]));
        info.absorb_insn(&insn(vec![(reg(1), ValueId(4))], vec![]));
        assert!(!info.read_before_write_map.contains_key(&RegId::Gpr(1)));
    }

    #[test]
    fn test_merge_keeps_later_write() {
        let mut a = BBRegInfo::default();
        a.absorb_insn(&insn(vec![], vec![(reg(2), ValueId(5))]));
        let mut b = BBRegInfo::default();
        b.absorb_insn(&insn(vec![], vec![(reg(2), ValueId(9))]));
        a.merge_from(&b);
        assert_eq!(a.reg_latest_inst_map[&RegId::Gpr(2)].1, ValueId(9));
    }

    #[test]
    fn test_merge_masks_inherited_read_behind_write() {
        // successor reads X3 but this block already wrote it
        let mut a = BBRegInfo::default();
        a.absorb_insn(&insn(vec![], vec![(reg(3), ValueId(5))]));
        let mut b = BBRegInfo::default();
        b.absorb_insn(&insn(vec![(reg(3), ValueId(6))], vec![]));
        a.merge_from(&b);
        assert!(!a.read_before_write_map.contains_key(&RegId::Gpr(3)));
    }
}
