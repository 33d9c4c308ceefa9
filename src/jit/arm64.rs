//! AArch64 backend (AAPCS64).
//!
//! Frame, from the frame pointer down: saved `fp`/`lr` above it, then
//! x19..x28 and d8..d15, then the slot area addressed from SP as
//! `[sp + 8 * index]`. X14..X17 are scratch.

use super::aarch64::{AArch64Assembler, Cond, DReg, Reg};
use super::backend::{
    Backend, CTX_STACK_LIMIT, Cmp, CompileError, FCmp, FloatOp, FrameLayout, IntOp, LOCALS_BASE,
    Slot, Src, Width,
};
use super::codebuf::CodeBuffer;
use super::fixup::BranchSite;
use super::regalloc::RegisterAllocator;
use crate::vm::bridge::native_bridge;

/// Doubles in the literal pool; they come first.
const MAX_DBLS: usize = 64;
/// Integers that need more than two move instructions.
const MAX_INTS: usize = 128;

/// Largest frame the scaled 12-bit slot offsets can reach.
pub const MAX_FRAME_SLOTS: u32 = 4095;

const SAVED_PAIRS: [(Reg, Reg); 5] = [
    (Reg::X19, Reg::X20),
    (Reg::X21, Reg::X22),
    (Reg::X23, Reg::X24),
    (Reg::X25, Reg::X26),
    (Reg::X27, Reg::X28),
];
const SAVED_BYTES: u32 = 16 * 9;

/// Value scratch.
const VAL: Reg = Reg::X16;
/// Address scratch.
const ADDR: Reg = Reg::X17;
const TMP0: Reg = Reg::X15;
const TMP1: Reg = Reg::X14;

fn slot_offset(index: u32) -> u32 {
    8 * index
}

fn cond(cmp: Cmp) -> Cond {
    match cmp {
        Cmp::Eq => Cond::Eq,
        Cmp::Ne => Cond::Ne,
        Cmp::Lt => Cond::Lt,
        Cmp::Gt => Cond::Gt,
        Cmp::Le => Cond::Le,
        Cmp::Ge => Cond::Ge,
    }
}

/// Flags after `FCMP` leave every relation but `Ne` false when unordered;
/// the inverse conditions are then true.
fn fcond(cmp: FCmp) -> Cond {
    match cmp {
        FCmp::Eq => Cond::Eq,
        FCmp::Ne => Cond::Ne,
        FCmp::Lt => Cond::Mi,
        FCmp::Le => Cond::Ls,
        FCmp::Gt => Cond::Gt,
        FCmp::Ge => Cond::Ge,
    }
}

fn frame_bytes(layout: &FrameLayout) -> u32 {
    let slots = 8 * layout.slots();
    SAVED_BYTES + (slots + 15) / 16 * 16
}

pub struct Arm64 {
    buf: CodeBuffer,
    /// Doubles at `[0, MAX_DBLS)`, integers after them.
    consts: Box<[u64]>,
    doubles: usize,
    ints: usize,
}

impl Default for Arm64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Arm64 {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::with_capacity(1024),
            consts: vec![0u64; MAX_DBLS + MAX_INTS].into_boxed_slice(),
            doubles: 0,
            ints: 0,
        }
    }

    fn asm(&mut self) -> AArch64Assembler<'_> {
        AArch64Assembler::new(&mut self.buf)
    }

    /// `sp -= bytes` or `sp += bytes` in 12-bit steps.
    fn adjust_sp(&mut self, bytes: u32, grow: bool) {
        let mut left = bytes;
        let mut asm = self.asm();
        while left > 0 {
            let step = left.min(4080);
            if grow {
                asm.sub_imm(Reg::Sp, Reg::Sp, step as u16);
            } else {
                asm.add_imm(Reg::Sp, Reg::Sp, step as u16);
            }
            left -= step;
        }
    }

    /// Pool index for `bits`, or `None` once its half of the pool is full.
    fn pooled(&mut self, bits: u64, doubles: bool) -> Option<usize> {
        let (base, used, cap) = if doubles {
            (0, self.doubles, MAX_DBLS)
        } else {
            (MAX_DBLS, self.ints, MAX_INTS)
        };
        let live = &self.consts[base..base + used];
        if let Some(i) = live.iter().position(|&c| c == bits) {
            return Some(base + i);
        }
        if used == cap {
            return None;
        }
        self.consts[base + used] = bits;
        if doubles {
            self.doubles += 1;
        } else {
            self.ints += 1;
        }
        Some(base + used)
    }

    fn load_pool_base(&mut self) {
        self.asm()
            .ldr(ADDR, Reg::Sp, slot_offset(Slot::Consts.index()));
    }

    fn src_reg(&mut self, src: Src<Reg>) -> Reg {
        match src {
            Src::Reg(r) => r,
            Src::Imm(0) => Reg::XZR,
            Src::Imm(v) => {
                self.load_imm(VAL, v);
                VAL
            }
            Src::Slot(s) => {
                self.asm().ldr(VAL, Reg::Sp, slot_offset(s));
                VAL
            }
        }
    }

    /// Base register and scaled offset for `[base + disp]`; out-of-range
    /// displacements go through the address scratch.
    fn address(&mut self, base: Reg, disp: i32, size: u32) -> (Reg, u32) {
        if disp >= 0 && disp as u32 % size == 0 && (disp as u32) / size < 4096 {
            return (base, disp as u32);
        }
        let mut asm = self.asm();
        asm.mov_imm64(ADDR, disp as i64);
        asm.add(ADDR, base, ADDR);
        (ADDR, 0)
    }

    /// Leaves `&stack_pos` in ADDR, the position in TMP0 and the operand
    /// stack base in TMP1.
    fn stack_position(&mut self) {
        let mut asm = self.asm();
        asm.ldr(ADDR, Reg::Sp, slot_offset(Slot::StackPos.index()));
        asm.ldr(TMP0, ADDR, 0);
        asm.ldr(TMP1, Reg::Sp, slot_offset(Slot::OpStack.index()));
    }
}

impl Backend for Arm64 {
    type Gpr = Reg;
    type Fpr = DReg;

    fn int_allocator(&self) -> RegisterAllocator<Reg> {
        RegisterAllocator::new(
            &[Reg::X19, Reg::X20, Reg::X21, Reg::X22, Reg::X23, Reg::X24],
            &[Reg::X25, Reg::X26, Reg::X27, Reg::X28],
            Reg::X0,
        )
    }

    fn float_allocator(&self) -> RegisterAllocator<DReg> {
        RegisterAllocator::new(
            &[DReg(8), DReg(9), DReg(10), DReg(11), DReg(12), DReg(13)],
            &[DReg(14), DReg(15)],
            DReg(0),
        )
    }

    fn buffer(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    fn offset(&self) -> usize {
        self.buf.offset()
    }

    fn prologue(&mut self, layout: &FrameLayout) {
        {
            let mut asm = self.asm();
            asm.stp_pre(Reg::Fp, Reg::Lr, -16);
            asm.mov_sp(Reg::Fp, Reg::Sp);
        }
        self.adjust_sp(frame_bytes(layout), true);

        let mut asm = self.asm();
        let mut at = -16i16;
        for (a, b) in SAVED_PAIRS {
            asm.stp(a, b, Reg::Fp, at);
            at -= 16;
        }
        for d in (8..16).step_by(2) {
            asm.stp_d(DReg(d), DReg(d + 1), Reg::Fp, at);
            at -= 16;
        }

        // eight register arguments, the rest above the saved fp/lr
        for (i, arg) in Slot::ENTRY_ORDER.iter().enumerate() {
            let at = slot_offset(arg.index());
            if i < 8 {
                asm.str(REGS[i], Reg::Sp, at);
            } else {
                asm.ldr(VAL, Reg::Fp, 16 + 8 * (i as u32 - 8));
                asm.str(VAL, Reg::Sp, at);
            }
        }

        if layout.locals > 0 {
            asm.add_imm(VAL, Reg::Sp, slot_offset(LOCALS_BASE) as u16);
        } else {
            asm.mov(VAL, Reg::XZR);
        }
        asm.ldr(ADDR, Reg::Sp, slot_offset(Slot::JitMem.index()));
        asm.str(VAL, ADDR, 0);
        asm.mov_imm64(VAL, layout.locals as i64);
        asm.ldr(ADDR, Reg::Sp, slot_offset(Slot::JitWords.index()));
        asm.str(VAL, ADDR, 0);

        for k in 0..layout.locals {
            asm.str(Reg::XZR, Reg::Sp, slot_offset(layout.local(k)));
        }
    }

    fn status_stub(&mut self, status: i64) -> BranchSite {
        let mut asm = self.asm();
        asm.mov_imm64(Reg::X0, status);
        BranchSite::imm26(asm.b(0))
    }

    fn teardown(&mut self, _layout: &FrameLayout) {
        let mut asm = self.asm();
        let mut at = -16i16;
        for (a, b) in SAVED_PAIRS {
            asm.ldp(a, b, Reg::Fp, at);
            at -= 16;
        }
        for d in (8..16).step_by(2) {
            asm.ldp_d(DReg(d), DReg(d + 1), Reg::Fp, at);
            at -= 16;
        }
        asm.mov_sp(Reg::Sp, Reg::Fp);
        asm.ldp_post(Reg::Fp, Reg::Lr, 16);
        asm.ret();
    }

    fn jump(&mut self) -> BranchSite {
        BranchSite::imm26(self.asm().b(0))
    }

    fn load_imm(&mut self, dst: Reg, imm: i64) {
        if AArch64Assembler::imm64_len(imm) > 2 {
            if let Some(index) = self.pooled(imm as u64, false) {
                self.load_pool_base();
                self.asm().ldr(dst, ADDR, 8 * index as u32);
                return;
            }
        }
        self.asm().mov_imm64(dst, imm);
    }

    fn load_float_imm(&mut self, dst: DReg, value: f64) -> Result<(), CompileError> {
        let bits = value.to_bits();
        if bits == 0 {
            self.asm().fmov_from_gpr(dst, Reg::XZR);
            return Ok(());
        }
        match self.pooled(bits, true) {
            Some(index) => {
                self.load_pool_base();
                self.asm().ldr_d(dst, ADDR, 8 * index as u32);
            }
            None => {
                let mut asm = self.asm();
                asm.mov_imm64(VAL, bits as i64);
                asm.fmov_from_gpr(dst, VAL);
            }
        }
        Ok(())
    }

    fn mov(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.asm().mov(dst, src);
        }
    }

    fn fmov(&mut self, dst: DReg, src: DReg) {
        if dst != src {
            self.asm().fmov(dst, src);
        }
    }

    fn int_op(&mut self, op: IntOp, dst: Reg, src: Src<Reg>) {
        match (op, src) {
            (IntOp::Add, Src::Imm(v)) if (0..4096).contains(&v) => {
                self.asm().add_imm(dst, dst, v as u16)
            }
            (IntOp::Add, Src::Imm(v)) if (-4095..0).contains(&v) => {
                self.asm().sub_imm(dst, dst, (-v) as u16)
            }
            (IntOp::Sub, Src::Imm(v)) if (0..4096).contains(&v) => {
                self.asm().sub_imm(dst, dst, v as u16)
            }
            (IntOp::Sub, Src::Imm(v)) if (-4095..0).contains(&v) => {
                self.asm().add_imm(dst, dst, (-v) as u16)
            }
            (IntOp::Shl, Src::Imm(v)) => self.asm().lsl_imm(dst, dst, (v & 63) as u8),
            (IntOp::Shr, Src::Imm(v)) => self.asm().asr_imm(dst, dst, (v & 63) as u8),
            _ => {
                let r = self.src_reg(src);
                let mut asm = self.asm();
                match op {
                    IntOp::Add => asm.add(dst, dst, r),
                    IntOp::Sub => asm.sub(dst, dst, r),
                    IntOp::Mul => asm.mul(dst, dst, r),
                    IntOp::And => asm.and(dst, dst, r),
                    IntOp::Or => asm.orr(dst, dst, r),
                    IntOp::Xor => asm.eor(dst, dst, r),
                    // the register forms take the count modulo 64
                    IntOp::Shl => asm.lslv(dst, dst, r),
                    IntOp::Shr => asm.asrv(dst, dst, r),
                }
            }
        }
    }

    fn not(&mut self, dst: Reg) {
        self.asm().mvn(dst, dst);
    }

    fn div(&mut self, dst: Reg, src: Src<Reg>, rem: bool) -> BranchSite {
        let divisor = match src {
            // keep XZR out of CBZ so the fault is still reached
            Src::Imm(0) => {
                self.asm().mov(VAL, Reg::XZR);
                VAL
            }
            _ => self.src_reg(src),
        };
        let mut asm = self.asm();
        let zero = asm.cbz(divisor, 0);
        // SDIV wraps MIN / -1 and returns zero for nothing else
        if rem {
            asm.sdiv(ADDR, dst, divisor);
            asm.msub(dst, ADDR, divisor, dst);
        } else {
            asm.sdiv(dst, dst, divisor);
        }
        BranchSite::imm19(zero)
    }

    fn cmp(&mut self, left: Reg, right: Src<Reg>) {
        match right {
            Src::Imm(v) if (0..4096).contains(&v) => self.asm().cmp_imm(left, v as u16),
            Src::Imm(v) if (-4095..0).contains(&v) => self.asm().cmn_imm(left, (-v) as u16),
            _ => {
                let r = self.src_reg(right);
                self.asm().cmp(left, r);
            }
        }
    }

    fn set_cond(&mut self, dst: Reg, cmp: Cmp) {
        self.asm().cset(dst, cond(cmp));
    }

    fn branch(&mut self, cmp: Cmp) -> BranchSite {
        BranchSite::imm19(self.asm().b_cond(cond(cmp), 0))
    }

    fn fcmp_set(&mut self, dst: Reg, left: DReg, right: DReg, cmp: FCmp) {
        let mut asm = self.asm();
        asm.fcmp(left, right);
        asm.cset(dst, fcond(cmp));
    }

    fn fcmp_branch(&mut self, left: DReg, right: DReg, cmp: FCmp, when: bool) -> Vec<BranchSite> {
        let mut asm = self.asm();
        asm.fcmp(left, right);
        let c = if when { fcond(cmp) } else { fcond(cmp).invert() };
        vec![BranchSite::imm19(asm.b_cond(c, 0))]
    }

    fn float_op(&mut self, op: FloatOp, dst: DReg, src: DReg) {
        let mut asm = self.asm();
        match op {
            FloatOp::Add => asm.fadd(dst, dst, src),
            FloatOp::Sub => asm.fsub(dst, dst, src),
            FloatOp::Mul => asm.fmul(dst, dst, src),
            FloatOp::Div => asm.fdiv(dst, dst, src),
        }
    }

    fn fdiv_zero_check(&mut self, src: DReg) -> BranchSite {
        let mut asm = self.asm();
        asm.fcmp_zero(src);
        BranchSite::imm19(asm.b_cond(Cond::Eq, 0))
    }

    fn i2f(&mut self, dst: DReg, src: Reg) {
        self.asm().scvtf(dst, src);
    }

    /// `fcvtzs` saturates; NaN and out of range inputs are folded onto
    /// `i64::MIN` so every target agrees. `i64::MAX` only comes out of
    /// saturation since no double converts to it exactly.
    fn f2i(&mut self, dst: Reg, src: DReg) {
        let mut asm = self.asm();
        asm.fcvtzs(dst, src);
        asm.movz(TMP0, 0x8000, 3);
        // V is set iff dst == i64::MAX
        asm.cmn_imm(dst, 1);
        asm.csel(dst, TMP0, dst, Cond::Vs);
        asm.fcmp(src, src);
        asm.csel(dst, TMP0, dst, Cond::Vs);
    }

    fn int_to_float_bits(&mut self, dst: DReg, src: Reg) {
        self.asm().fmov_from_gpr(dst, src);
    }

    fn float_bits_to_int(&mut self, dst: Reg, src: DReg) {
        self.asm().fmov_to_gpr(dst, src);
    }

    fn load(&mut self, dst: Reg, base: Reg, disp: i32, width: Width) {
        let size = match width {
            Width::Byte => 1,
            Width::Char => 4,
            Width::Word => 8,
        };
        let (base, off) = self.address(base, disp, size);
        let mut asm = self.asm();
        match width {
            Width::Byte => asm.ldrb(dst, base, off),
            Width::Char => asm.ldr_w(dst, base, off),
            Width::Word => asm.ldr(dst, base, off),
        }
    }

    fn store(&mut self, base: Reg, disp: i32, width: Width, src: Src<Reg>) {
        let value = self.src_reg(src);
        let size = match width {
            Width::Byte => 1,
            Width::Char => 4,
            Width::Word => 8,
        };
        let (base, off) = self.address(base, disp, size);
        let mut asm = self.asm();
        match width {
            Width::Byte => asm.strb(value, base, off),
            Width::Char => asm.str_w(value, base, off),
            Width::Word => asm.str(value, base, off),
        }
    }

    fn fload(&mut self, dst: DReg, base: Reg, disp: i32) {
        let (base, off) = self.address(base, disp, 8);
        self.asm().ldr_d(dst, base, off);
    }

    fn fstore(&mut self, base: Reg, disp: i32, src: DReg) {
        let (base, off) = self.address(base, disp, 8);
        self.asm().str_d(src, base, off);
    }

    fn load_slot(&mut self, dst: Reg, index: u32) {
        self.asm().ldr(dst, Reg::Sp, slot_offset(index));
    }

    fn store_slot(&mut self, index: u32, src: Src<Reg>) {
        let value = self.src_reg(src);
        self.asm().str(value, Reg::Sp, slot_offset(index));
    }

    fn fload_slot(&mut self, dst: DReg, index: u32) {
        self.asm().ldr_d(dst, Reg::Sp, slot_offset(index));
    }

    fn fstore_slot(&mut self, index: u32, src: DReg) {
        self.asm().str_d(src, Reg::Sp, slot_offset(index));
    }

    fn nil_check(&mut self, reg: Reg) -> BranchSite {
        BranchSite::imm19(self.asm().cbz(reg, 0))
    }

    fn bounds_check(&mut self, index: Reg, array: Reg) -> (BranchSite, BranchSite) {
        let mut asm = self.asm();
        asm.cmp_imm(index, 0);
        let under = asm.b_cond(Cond::Lt, 0);
        asm.ldr(ADDR, array, 0);
        asm.cmp(index, ADDR);
        let over = asm.b_cond(Cond::Ge, 0);
        (BranchSite::imm19(under), BranchSite::imm19(over))
    }

    fn mul_extent(&mut self, index: Reg, array: Reg, dim: usize) {
        let mut asm = self.asm();
        asm.ldr(ADDR, array, 8 * (2 + dim as u32));
        asm.mul(index, index, ADDR);
    }

    fn index_address(&mut self, index: Reg, array: Reg, shift: u8, payload_disp: i32) {
        let mut asm = self.asm();
        if shift > 0 {
            asm.add_lsl(index, array, index, shift);
        } else {
            asm.add(index, array, index);
        }
        if (0..4096).contains(&payload_disp) {
            asm.add_imm(index, index, payload_disp as u16);
        } else {
            asm.mov_imm64(ADDR, payload_disp as i64);
            asm.add(index, index, ADDR);
        }
    }

    fn op_stack_push(&mut self, src: Src<Reg>) {
        let value = self.src_reg(src);
        self.stack_position();
        let mut asm = self.asm();
        asm.str_idx(value, TMP1, TMP0);
        asm.add_imm(TMP0, TMP0, 1);
        asm.str(TMP0, ADDR, 0);
    }

    fn op_stack_push_float(&mut self, src: DReg) {
        self.stack_position();
        let mut asm = self.asm();
        asm.str_d_idx(src, TMP1, TMP0);
        asm.add_imm(TMP0, TMP0, 1);
        asm.str(TMP0, ADDR, 0);
    }

    fn op_stack_pop(&mut self, dst: Reg) {
        self.stack_position();
        let mut asm = self.asm();
        asm.sub_imm(TMP0, TMP0, 1);
        asm.str(TMP0, ADDR, 0);
        asm.ldr_idx(dst, TMP1, TMP0);
    }

    fn op_stack_pop_float(&mut self, dst: DReg) {
        self.stack_position();
        let mut asm = self.asm();
        asm.sub_imm(TMP0, TMP0, 1);
        asm.str(TMP0, ADDR, 0);
        asm.ldr_d_idx(dst, TMP1, TMP0);
    }

    fn op_stack_drop(&mut self) {
        let mut asm = self.asm();
        asm.ldr(ADDR, Reg::Sp, slot_offset(Slot::StackPos.index()));
        asm.ldr(TMP0, ADDR, 0);
        asm.sub_imm(TMP0, TMP0, 1);
        asm.str(TMP0, ADDR, 0);
    }

    fn op_stack_reserve(&mut self, words: u32) -> (usize, BranchSite) {
        let mut asm = self.asm();
        asm.ldr(ADDR, Reg::Sp, slot_offset(Slot::StackPos.index()));
        asm.ldr(TMP0, ADDR, 0);
        let at = asm.offset();
        asm.movz(TMP1, words as u16, 0);
        asm.movk(TMP1, (words >> 16) as u16, 1);
        asm.add(TMP0, TMP0, TMP1);
        asm.ldr(ADDR, Reg::Sp, slot_offset(Slot::Ctx.index()));
        asm.ldr(ADDR, ADDR, CTX_STACK_LIMIT as u32);
        asm.cmp(TMP0, ADDR);
        (at, BranchSite::imm19(asm.b_cond(Cond::Gt, 0)))
    }

    fn patch_reserve(&mut self, at: usize, words: u32) {
        for (i, half) in [words & 0xFFFF, words >> 16].into_iter().enumerate() {
            let at = at + 4 * i;
            if let Some(inst) = self.buf.read_u32(at) {
                self.buf.patch_u32(at, (inst & !(0xFFFF << 5)) | (half << 5));
            }
        }
    }

    fn call_bridge(&mut self, tag: i64, instr: i64, ip: i64) -> BranchSite {
        // call_pos and ip go on the stack, 16 bytes keep SP aligned
        self.adjust_sp(16, true);
        let mut asm = self.asm();
        let slot = |s: Slot| 16 + slot_offset(s.index());
        asm.mov_imm64(Reg::X0, tag);
        asm.mov_imm64(Reg::X1, instr);
        asm.ldr(Reg::X2, Reg::Sp, slot(Slot::ClsId));
        asm.ldr(Reg::X3, Reg::Sp, slot(Slot::MthdId));
        asm.ldr(Reg::X4, Reg::Sp, slot(Slot::Instance));
        asm.ldr(Reg::X5, Reg::Sp, slot(Slot::OpStack));
        asm.ldr(Reg::X6, Reg::Sp, slot(Slot::StackPos));
        asm.ldr(Reg::X7, Reg::Sp, slot(Slot::Ctx));
        asm.ldr(VAL, Reg::Sp, slot(Slot::CallPos));
        asm.str(VAL, Reg::Sp, 0);
        asm.mov_imm64(VAL, ip);
        asm.str(VAL, Reg::Sp, 8);
        asm.mov_imm64(VAL, native_bridge as usize as i64);
        asm.blr(VAL);
        self.adjust_sp(16, false);

        let mut asm = self.asm();
        asm.ldr(ADDR, Reg::Sp, slot_offset(Slot::Ctx.index()));
        asm.ldr(ADDR, ADDR, 0);
        BranchSite::imm19(asm.cbnz(ADDR, 0))
    }

    fn finish(self) -> (CodeBuffer, Box<[u64]>) {
        (self.buf, self.consts)
    }
}

const REGS: [Reg; 8] = [
    Reg::X0,
    Reg::X1,
    Reg::X2,
    Reg::X3,
    Reg::X4,
    Reg::X5,
    Reg::X6,
    Reg::X7,
];

#[cfg(test)]
mod tests {
    use super::*;

    fn words(backend: &Arm64) -> Vec<u32> {
        backend
            .buf
            .code()
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }

    #[test]
    fn test_prologue_opens_frame() {
        let mut backend = Arm64::new();
        backend.prologue(&FrameLayout::new(2));
        let code = words(&backend);
        // stp fp, lr, [sp, #-16]!; mov fp, sp
        assert_eq!(code[0], 0xA9BF7BFD);
        assert_eq!(code[1], 0x910003FD);
        assert_eq!(frame_bytes(&FrameLayout::new(2)) % 16, 0);
    }

    #[test]
    fn test_stack_reserve_patches_both_halves() {
        let mut backend = Arm64::new();
        let (at, _) = backend.op_stack_reserve(1);
        backend.patch_reserve(at, 0x1_0005);
        let code = words(&backend);
        let first = at / 4;
        // movz x14, #5; movk x14, #1, lsl #16
        assert_eq!(code[first], 0xD28000AE);
        assert_eq!(code[first + 1], 0xF2A0002E);
    }

    #[test]
    fn test_f2i_folds_saturation_onto_min() {
        let mut backend = Arm64::new();
        backend.f2i(Reg::X19, DReg(8));
        let code = words(&backend);
        assert_eq!(code.len(), 6);
        // movz x15, #0x8000, lsl #48
        assert_eq!(code[1], 0xD2F0000F);
    }

    #[test]
    fn test_wide_immediates_use_the_pool() {
        let mut backend = Arm64::new();
        backend.load_imm(Reg::X19, 7);
        backend.load_imm(Reg::X19, 0x1234_5678_9ABC_DEF0);
        backend.load_imm(Reg::X20, 0x1234_5678_9ABC_DEF0);
        assert_eq!(backend.ints, 1);
        let (_, consts) = backend.finish();
        assert_eq!(consts[MAX_DBLS], 0x1234_5678_9ABC_DEF0);
    }

    #[test]
    fn test_pool_overflow_falls_back_to_moves() {
        let mut backend = Arm64::new();
        for i in 0..=MAX_DBLS {
            backend.load_float_imm(DReg(8), i as f64 + 0.5).unwrap();
        }
        assert_eq!(backend.doubles, MAX_DBLS);
    }

    #[test]
    fn test_float_branch_inverse_is_taken_on_nan() {
        // after FCMP with a NaN operand NZCV is 0011
        let (n, z, c, v) = (false, false, true, true);
        let holds = |cond: Cond| match cond {
            Cond::Eq => z,
            Cond::Ne => !z,
            Cond::Mi => n,
            Cond::Pl => !n,
            Cond::Hi => c && !z,
            Cond::Ls => !c || z,
            Cond::Ge => n == v,
            Cond::Lt => n != v,
            Cond::Gt => !z && n == v,
            Cond::Le => z || n != v,
            _ => unreachable!(),
        };
        for cmp in [FCmp::Eq, FCmp::Ne, FCmp::Lt, FCmp::Le, FCmp::Gt, FCmp::Ge] {
            assert_eq!(holds(fcond(cmp)), cmp.eval(f64::NAN, 1.0));
            assert_eq!(holds(fcond(cmp).invert()), !cmp.eval(f64::NAN, 1.0));
        }
    }

    #[test]
    fn test_div_checks_zero_first() {
        let mut backend = Arm64::new();
        let site = backend.div(Reg::X19, Src::Reg(Reg::X20), true);
        assert_eq!(site.at, 0);
        // cbz x20
        assert_eq!(words(&backend)[0], 0xB4000014);
    }
}
