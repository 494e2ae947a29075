//! Instruction semantics (decode → IR).
//!
//! Each handler emits the state-structure loads for its operands, a semantic
//! call realizing the operation, and the result stores. What was read and
//! written is reported back through [`LiftedInsn`] so the lifter can track
//! per-block register flow.
//!
//! Register 31 resolves per context: the zero register folds reads to a
//! constant and discards writes; addressing contexts use SP.

use a64rc_isa::{Inst, LogicOp, Op, Reg, RegClass, Shift};

use crate::{BlockId, Func, ValueId, ValueKind};

/// Outcome of lifting one instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiftStatus {
    Lifted,
    Error,
}

/// Register traffic of one lifted instruction.
#[derive(Clone, Debug)]
pub struct LiftedInsn {
    pub status: LiftStatus,
    /// Registers loaded from the state structure, with the load values, in
    /// emission order.
    pub loads: Vec<(Reg, ValueId)>,
    /// Registers written, with the producing values, in emission order.
    pub writes: Vec<(Reg, ValueId)>,
    /// Semantic calls emitted, each with its ordered written-register list
    /// and the per-register output values (fields for multi-output calls).
    pub sema_calls: Vec<(ValueId, Vec<(Reg, ValueId)>)>,
}

impl LiftedInsn {
    fn lifted() -> Self {
        Self {
            status: LiftStatus::Lifted,
            loads: Vec::new(),
            writes: Vec::new(),
            sema_calls: Vec::new(),
        }
    }

    fn error() -> Self {
        Self { status: LiftStatus::Error, ..Self::lifted() }
    }
}

/// Lift `inst` into `block`, appending its semantic effect on the state
/// structure.
pub fn lift_into_block(func: &mut Func, block: BlockId, inst: &Inst) -> LiftedInsn {
    let mut e = Emit { func, block, out: LiftedInsn::lifted() };

    match inst.op {
        Op::Unknown(_) | Op::Brk { .. } => return LiftedInsn::error(),
        Op::Nop | Op::Svc { .. } | Op::B { .. } => {}

        Op::MovZ { sf, rd, imm16, hw } => {
            let val = u64::from(imm16) << (u32::from(hw) * 16);
            let v = e.konst(val, int_class(sf));
            e.write_gpr(rd, sf, v);
        }
        Op::MovN { sf, rd, imm16, hw } => {
            let mut val = !(u64::from(imm16) << (u32::from(hw) * 16));
            if !sf {
                val &= 0xFFFF_FFFF;
            }
            let v = e.konst(val, int_class(sf));
            e.write_gpr(rd, sf, v);
        }
        Op::MovK { sf, rd, imm16, hw } => {
            let old = e.read_gpr(rd, sf);
            let imm = e.konst(u64::from(imm16), int_class(sf));
            let pos = e.konst(u64::from(hw) * 16, int_class(sf));
            e.sema(width_sym("movk", sf), vec![old, imm, pos], &[Reg::gpr(rd, sf)]);
        }
        Op::Adr { rd, imm } => {
            let v = e.konst(inst.addr.wrapping_add(imm as u64), RegClass::X);
            e.write_gpr(rd, true, v);
        }
        Op::Adrp { rd, imm } => {
            let base = inst.addr & !0xFFF;
            let v = e.konst(base.wrapping_add(imm as u64), RegClass::X);
            e.write_gpr(rd, true, v);
        }

        Op::AddImm { sf, set_flags, rd, rn, imm12, shift12 }
        | Op::SubImm { sf, set_flags, rd, rn, imm12, shift12 } => {
            let sub = matches!(inst.op, Op::SubImm { .. });
            let lhs = e.read_gpr_or_sp(rn, sf);
            let imm = u64::from(imm12) << if shift12 { 12 } else { 0 };
            let rhs = e.konst(imm, int_class(sf));
            let base = match (sub, set_flags) {
                (false, false) => "add",
                (false, true) => "adds",
                (true, false) => "sub",
                (true, true) => "subs",
            };
            let outs = if set_flags {
                // Flag-setting forms treat rd == 31 as a discard (CMP/CMN).
                let mut outs = Vec::new();
                if rd != 31 {
                    outs.push(Reg::gpr(rd, sf));
                }
                outs.push(Reg::nzcv());
                outs
            } else {
                // Plain immediate forms write SP when rd == 31.
                vec![if rd == 31 { Reg::sp() } else { Reg::gpr(rd, sf) }]
            };
            e.sema(width_sym(base, sf), vec![lhs, rhs], &outs);
        }

        Op::AddReg { sf, set_flags, rd, rn, rm, shift, amount }
        | Op::SubReg { sf, set_flags, rd, rn, rm, shift, amount } => {
            let sub = matches!(inst.op, Op::SubReg { .. });
            let base = match (sub, set_flags) {
                (false, false) => "add",
                (false, true) => "adds",
                (true, false) => "sub",
                (true, true) => "subs",
            };
            let outs = reg_form_outs(rd, sf, set_flags);
            let (sym, args) = e.shifted_operands(base, sf, rn, rm, shift, amount);
            e.sema(sym, args, &outs);
        }

        Op::LogReg { sf, op, invert, rd, rn, rm, shift, amount } => {
            let base = match (op, invert) {
                (LogicOp::And, false) => "and",
                (LogicOp::And, true) => "bic",
                (LogicOp::Orr, false) => "orr",
                (LogicOp::Orr, true) => "orn",
                (LogicOp::Eor, false) => "eor",
                (LogicOp::Eor, true) => "eon",
                (LogicOp::Ands, false) => "ands",
                (LogicOp::Ands, true) => "bics",
            };
            let set_flags = matches!(op, LogicOp::Ands);
            let outs = reg_form_outs(rd, sf, set_flags);
            let (sym, args) = e.shifted_operands(base, sf, rn, rm, shift, amount);
            e.sema(sym, args, &outs);
        }

        Op::Ldr { sf, rt, rn, imm12 } => {
            let base = e.read_gpr_or_sp(rn, true);
            let off = e.konst(u64::from(imm12) << if sf { 3 } else { 2 }, RegClass::X);
            let outs = if rt == 31 { Vec::new() } else { vec![Reg::gpr(rt, sf)] };
            e.sema(width_sym("ldr", sf), vec![base, off], &outs);
        }
        Op::Str { sf, rt, rn, imm12 } => {
            let base = e.read_gpr_or_sp(rn, true);
            let off = e.konst(u64::from(imm12) << if sf { 3 } else { 2 }, RegClass::X);
            let val = e.read_gpr(rt, sf);
            e.sema(width_sym("str", sf), vec![base, off, val], &[]);
        }

        Op::Bl { .. } => {
            let ret = e.konst(inst.next_pc, RegClass::X);
            e.write_reg(Reg::gpr(30, true), ret);
        }

        Op::BCond { cond, .. } => {
            let flags = e.read_reg(Reg::nzcv());
            e.sema(format!("cond_{}", cond.mnemonic()), vec![flags], &[Reg::branch_taken()]);
        }
        Op::Cbz { sf, rt, .. } => {
            let v = e.read_gpr(rt, sf);
            e.sema(width_sym("cbz", sf), vec![v], &[Reg::branch_taken()]);
        }
        Op::Cbnz { sf, rt, .. } => {
            let v = e.read_gpr(rt, sf);
            e.sema(width_sym("cbnz", sf), vec![v], &[Reg::branch_taken()]);
        }
        Op::Tbz { rt, bit, .. } | Op::Tbnz { rt, bit, .. } => {
            let v = e.read_gpr(rt, true);
            let b = e.konst(u64::from(bit), RegClass::X);
            let sym = if matches!(inst.op, Op::Tbz { .. }) { "tbz" } else { "tbnz" };
            e.sema(sym.to_string(), vec![v, b], &[Reg::branch_taken()]);
        }

        Op::Br { rn } | Op::Ret { rn } => {
            let target = e.read_gpr(rn, true);
            e.write_reg(Reg::pc(), target);
        }
        Op::Blr { rn } => {
            let target = e.read_gpr(rn, true);
            let ret = e.konst(inst.next_pc, RegClass::X);
            e.write_reg(Reg::gpr(30, true), ret);
            e.write_reg(Reg::pc(), target);
        }
    }

    e.out
}

const fn int_class(sf: bool) -> RegClass {
    if sf {
        RegClass::X
    } else {
        RegClass::W
    }
}

fn width_sym(base: &str, sf: bool) -> String {
    format!("{base}_{}", if sf { "i64" } else { "i32" })
}

/// Output registers of a register-form data op (register 31 is the zero
/// register there, so its write is discarded).
fn reg_form_outs(rd: u8, sf: bool, set_flags: bool) -> Vec<Reg> {
    let mut outs = Vec::new();
    if rd != 31 {
        outs.push(Reg::gpr(rd, sf));
    }
    if set_flags {
        outs.push(Reg::nzcv());
    }
    outs
}

struct Emit<'f> {
    func: &'f mut Func,
    block: BlockId,
    out: LiftedInsn,
}

impl Emit<'_> {
    fn konst(&mut self, v: u64, class: RegClass) -> ValueId {
        self.func.const_class(v, class)
    }

    /// Load a guest register, recording the read.
    fn read_reg(&mut self, reg: Reg) -> ValueId {
        let v = self.func.push_inst(self.block, ValueKind::LoadReg(reg), reg.class);
        self.out.loads.push((reg, v));
        v
    }

    /// Operand-context GPR read: 31 folds to zero.
    fn read_gpr(&mut self, n: u8, sf: bool) -> ValueId {
        if n == 31 {
            self.konst(0, int_class(sf))
        } else {
            self.read_reg(Reg::gpr(n, sf))
        }
    }

    /// Addressing-context GPR read: 31 is SP.
    fn read_gpr_or_sp(&mut self, n: u8, sf: bool) -> ValueId {
        if n == 31 {
            self.read_reg(Reg::sp())
        } else {
            self.read_reg(Reg::gpr(n, sf))
        }
    }

    /// Store into a guest register, recording the write.
    fn write_reg(&mut self, reg: Reg, value: ValueId) {
        self.func
            .push_inst(self.block, ValueKind::StoreReg { reg, value }, reg.class);
        self.out.writes.push((reg, value));
    }

    /// Operand-context GPR write: 31 is the zero register, discard.
    fn write_gpr(&mut self, n: u8, sf: bool, value: ValueId) {
        if n != 31 {
            self.write_reg(Reg::gpr(n, sf), value);
        }
    }

    /// Read the rn/rm pair of a shifted-register form and derive the call
    /// symbol, folding a non-zero shift amount into an extra argument.
    fn shifted_operands(
        &mut self,
        base: &str,
        sf: bool,
        rn: u8,
        rm: u8,
        shift: Shift,
        amount: u8,
    ) -> (String, Vec<ValueId>) {
        let lhs = self.read_gpr(rn, sf);
        let rhs = self.read_gpr(rm, sf);
        if amount == 0 {
            return (width_sym(base, sf), vec![lhs, rhs]);
        }
        let suffix = match shift {
            Shift::Lsl => "lsl",
            Shift::Lsr => "lsr",
            Shift::Asr => "asr",
            Shift::Ror => "ror",
        };
        let amt = self.konst(u64::from(amount), int_class(sf));
        (
            width_sym(&format!("{base}_{suffix}"), sf),
            vec![lhs, rhs, amt],
        )
    }

    /// Emit a semantic call and store its outputs. Multi-output calls go
    /// through per-output field extraction.
    fn sema(&mut self, sym: String, args: Vec<ValueId>, outs: &[Reg]) -> ValueId {
        let class = if outs.len() == 1 { outs[0].class } else { RegClass::X };
        let call = self
            .func
            .push_inst(self.block, ValueKind::SemaCall { sym, args }, class);

        let mut written = Vec::with_capacity(outs.len());
        match outs {
            [] => {}
            [reg] => {
                self.write_reg(*reg, call);
                written.push((*reg, call));
            }
            _ => {
                for (i, reg) in outs.iter().enumerate() {
                    let field = self.func.push_inst(
                        self.block,
                        ValueKind::Field { call, index: i as u32 },
                        reg.class,
                    );
                    self.write_reg(*reg, field);
                    written.push((*reg, field));
                }
            }
        }
        self.out.sema_calls.push((call, written));
        call
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a64rc_isa::decode;

    fn lift_word(addr: u64, w: u32) -> (Func, BlockId, LiftedInsn) {
        let mut f = Func::declare("sub_0");
        let b = f.new_block();
        let inst = decode(addr, &w.to_le_bytes());
        let lifted = lift_into_block(&mut f, b, &inst);
        (f, b, lifted)
    }

    #[test]
    fn test_lift_movz() {
        // movz x5, #42
        let (f, b, lifted) = lift_word(0, 0xD2800545);
        assert_eq!(lifted.status, LiftStatus::Lifted);
        assert_eq!(lifted.writes.len(), 1);
        let (reg, val) = lifted.writes[0];
        assert_eq!(reg, Reg::gpr(5, true));
        assert!(matches!(f.value(val).kind, ValueKind::ConstU64(42)));
        // one store instruction in the block
        assert_eq!(f.block(b).insts.len(), 1);
    }

    #[test]
    fn test_lift_subs_multi_output() {
        // subs x2, x3, #1 - writes both x2 and NZCV through fields
        let (f, _b, lifted) = lift_word(0, 0xF1000462);
        assert_eq!(lifted.sema_calls.len(), 1);
        let (_, written) = &lifted.sema_calls[0];
        assert_eq!(written.len(), 2);
        assert_eq!(written[0].0, Reg::gpr(2, true));
        assert_eq!(written[1].0, Reg::nzcv());
        for (_, v) in written {
            assert!(matches!(f.value(*v).kind, ValueKind::Field { .. }));
        }
        assert_eq!(lifted.loads.len(), 1); // x3
    }

    #[test]
    fn test_lift_cmp_discards_rd() {
        // subs xzr, x1, #0 (cmp x1, #0)
        let (_f, _b, lifted) = lift_word(0, 0xF100003F);
        let (_, written) = &lifted.sema_calls[0];
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].0, Reg::nzcv());
    }

    #[test]
    fn test_lift_bcond_writes_branch_taken() {
        // b.ne +8
        let (_f, _b, lifted) = lift_word(0, 0x54000041);
        assert_eq!(lifted.loads[0].0, Reg::nzcv());
        assert_eq!(lifted.writes.len(), 1);
        assert_eq!(lifted.writes[0].0, Reg::branch_taken());
    }

    #[test]
    fn test_lift_ret_writes_pc() {
        // ret (x30)
        let (_f, _b, lifted) = lift_word(0, 0xD65F03C0);
        assert_eq!(lifted.loads[0].0, Reg::gpr(30, true));
        assert_eq!(lifted.writes[0].0, Reg::pc());
    }

    #[test]
    fn test_lift_bl_writes_link() {
        // bl +0x100 at 0x4000
        let (f, _b, lifted) = lift_word(0x4000, 0x94000040);
        assert_eq!(lifted.writes.len(), 1);
        let (reg, val) = lifted.writes[0];
        assert_eq!(reg, Reg::gpr(30, true));
        assert!(matches!(f.value(val).kind, ValueKind::ConstU64(0x4004)));
    }

    #[test]
    fn test_lift_unknown_is_error() {
        let (_f, _b, lifted) = lift_word(0, 0);
        assert_eq!(lifted.status, LiftStatus::Error);
    }

    #[test]
    fn test_lift_str_reads_base_and_value() {
        // str w4, [sp]
        let (_f, _b, lifted) = lift_word(0, 0xB90003E4);
        assert_eq!(lifted.loads.len(), 2);
        assert_eq!(lifted.loads[0].0, Reg::sp());
        assert_eq!(lifted.loads[1].0, Reg::gpr(4, false));
        assert!(lifted.writes.is_empty());
    }
}
