//! x86-64 backend for the System V and Windows calling conventions.
//!
//! Frame: `push rbp; mov rbp, rsp`, seven callee-saved pushes, then the slot
//! area. Slot `i` lives at `[rbp - 56 - 8 * (i + 1)]`. RAX, RDX, R11 and
//! XMM0 are scratch and never allocated.

use super::backend::{
    Backend, CTX_STACK_LIMIT, Cmp, CompileError, FCmp, FloatOp, FrameLayout, IntOp, LOCALS_BASE,
    Slot, Src, Width,
};
use super::codebuf::CodeBuffer;
use super::fixup::BranchSite;
use super::regalloc::RegisterAllocator;
use super::x86_64::{Alu, Cond, Mem, Reg, X86_64Assembler, Xmm};
use crate::vm::bridge::native_bridge;

/// Literal pool capacity in doubles.
const MAX_DBLS: usize = 256;

const SAVED: [Reg; 7] = [
    Reg::Rbx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];
const SAVED_BYTES: i32 = 8 * SAVED.len() as i32;

const SCRATCH: Reg = Reg::R11;
const FSCRATCH: Xmm = Xmm(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abi {
    SysV,
    Win64,
}

impl Abi {
    fn int_pools(self) -> (&'static [Reg], &'static [Reg]) {
        match self {
            Abi::SysV => (
                &[Reg::Rbx, Reg::Rcx, Reg::Rsi, Reg::Rdi],
                &[Reg::R8, Reg::R9, Reg::R10, Reg::R12, Reg::R13, Reg::R14, Reg::R15],
            ),
            Abi::Win64 => (
                &[Reg::Rbx, Reg::Rcx, Reg::R8, Reg::R9, Reg::R10],
                &[Reg::Rsi, Reg::Rdi],
            ),
        }
    }

    /// Integer argument registers.
    fn arg_regs(self) -> &'static [Reg] {
        match self {
            Abi::SysV => &[Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9],
            Abi::Win64 => &[Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9],
        }
    }

    /// Offset from RBP of the first stack-passed argument at entry.
    fn stack_args_at(self) -> i32 {
        match self {
            Abi::SysV => 16,
            // return address, saved rbp, 32-byte shadow space
            Abi::Win64 => 48,
        }
    }

    /// Bytes reserved below RSP for an outgoing bridge call, and where
    /// the first stack argument goes.
    fn call_area(self) -> (i32, i32) {
        match self {
            Abi::SysV => (32, 0),
            Abi::Win64 => (80, 32),
        }
    }
}

fn slot(index: u32) -> Mem {
    Mem::base(Reg::Rbp, -SAVED_BYTES - 8 * (index as i32 + 1))
}

fn cond(cmp: Cmp) -> Cond {
    match cmp {
        Cmp::Eq => Cond::E,
        Cmp::Ne => Cond::Ne,
        Cmp::Lt => Cond::L,
        Cmp::Gt => Cond::G,
        Cmp::Le => Cond::Le,
        Cmp::Ge => Cond::Ge,
    }
}

fn fits_i32(v: i64) -> bool {
    i32::try_from(v).is_ok()
}

pub struct Amd64 {
    buf: CodeBuffer,
    abi: Abi,
    consts: Box<[u64]>,
    used: usize,
}

impl Amd64 {
    pub fn new(abi: Abi) -> Self {
        Self {
            buf: CodeBuffer::with_capacity(1024),
            abi,
            consts: vec![0u64; MAX_DBLS].into_boxed_slice(),
            used: 0,
        }
    }

    fn asm(&mut self) -> X86_64Assembler<'_> {
        X86_64Assembler::new(&mut self.buf)
    }

    /// Points a local rel32 branch at the current offset.
    fn land(&mut self, site: usize) {
        let disp = self.buf.offset() as i64 - (site as i64 + 4);
        self.buf.patch_u32(site, disp as i32 as u32);
    }

    /// Resolves `src` to a register, using R11 for immediates and slots.
    fn src_reg(&mut self, src: Src<Reg>) -> Reg {
        match src {
            Src::Reg(r) => r,
            Src::Imm(v) => {
                self.asm().mov_ri(SCRATCH, v);
                SCRATCH
            }
            Src::Slot(s) => {
                self.asm().mov_rm(SCRATCH, slot(s));
                SCRATCH
            }
        }
    }

    fn alu(&mut self, op: Alu, dst: Reg, src: Src<Reg>) {
        match src {
            Src::Reg(r) => self.asm().alu_rr(op, dst, r),
            Src::Imm(v) if fits_i32(v) => self.asm().alu_ri(op, dst, v as i32),
            Src::Slot(s) => self.asm().alu_rm(op, dst, slot(s)),
            Src::Imm(_) => {
                let r = self.src_reg(src);
                self.asm().alu_rr(op, dst, r);
            }
        }
    }

    fn shift(&mut self, op: IntOp, dst: Reg, src: Src<Reg>) {
        if let Src::Imm(v) = src {
            let count = (v & 63) as u8;
            match op {
                IntOp::Shl => self.asm().shl_ri(dst, count),
                _ => self.asm().sar_ri(dst, count),
            }
            return;
        }
        // the count has to be in CL; RCX may be allocated
        let mut asm = self.asm();
        asm.mov_rr(Reg::Rax, dst);
        asm.mov_rr(SCRATCH, Reg::Rcx);
        match src {
            Src::Reg(Reg::Rcx) => {}
            Src::Reg(r) => asm.mov_rr(Reg::Rcx, r),
            Src::Slot(s) => asm.mov_rm(Reg::Rcx, slot(s)),
            Src::Imm(_) => {}
        }
        match op {
            IntOp::Shl => asm.shl_cl(Reg::Rax),
            _ => asm.sar_cl(Reg::Rax),
        }
        asm.mov_rr(Reg::Rcx, SCRATCH);
        asm.mov_rr(dst, Reg::Rax);
    }

    /// Loads the address of the next free operand stack word into R11;
    /// RAX keeps the position pointer.
    fn stack_top_address(&mut self, grow: bool) {
        let mut asm = self.asm();
        asm.mov_rm(Reg::Rax, slot(Slot::StackPos.index()));
        if !grow {
            asm.alu_mi(Alu::Sub, Mem::base(Reg::Rax, 0), 1);
        }
        asm.mov_rm(Reg::Rdx, Mem::base(Reg::Rax, 0));
        asm.mov_rm(SCRATCH, slot(Slot::OpStack.index()));
        asm.lea(SCRATCH, Mem::indexed(SCRATCH, Reg::Rdx, 8, 0));
        if grow {
            asm.alu_mi(Alu::Add, Mem::base(Reg::Rax, 0), 1);
        }
    }

    fn const_index(&mut self, bits: u64) -> Result<usize, CompileError> {
        if let Some(i) = self.consts[..self.used].iter().position(|&c| c == bits) {
            return Ok(i);
        }
        if self.used == MAX_DBLS {
            return Err(CompileError::ConstPoolFull);
        }
        self.consts[self.used] = bits;
        self.used += 1;
        Ok(self.used - 1)
    }
}

impl Backend for Amd64 {
    type Gpr = Reg;
    type Fpr = Xmm;

    fn int_allocator(&self) -> RegisterAllocator<Reg> {
        let (primary, aux) = self.abi.int_pools();
        RegisterAllocator::new(primary, aux, Reg::Rax)
    }

    fn float_allocator(&self) -> RegisterAllocator<Xmm> {
        RegisterAllocator::new(&[Xmm(1), Xmm(2), Xmm(3), Xmm(4)], &[Xmm(5)], FSCRATCH)
    }

    fn buffer(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    fn offset(&self) -> usize {
        self.buf.offset()
    }

    fn prologue(&mut self, layout: &FrameLayout) {
        let abi = self.abi;
        let mut asm = self.asm();
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        for reg in SAVED {
            asm.push(reg);
        }
        // the return address and eight pushes leave RSP 8 bytes off
        let slots = layout.slots() as i32;
        let bytes = 8 * (slots + (slots + 1) % 2);
        asm.alu_ri(Alu::Sub, Reg::Rsp, bytes);

        let regs = abi.arg_regs();
        for (i, arg) in Slot::ENTRY_ORDER.iter().enumerate() {
            match regs.get(i) {
                Some(&reg) => asm.mov_mr(slot(arg.index()), reg),
                None => {
                    let at = abi.stack_args_at() + 8 * (i - regs.len()) as i32;
                    asm.mov_rm(Reg::Rax, Mem::base(Reg::Rbp, at));
                    asm.mov_mr(slot(arg.index()), Reg::Rax);
                }
            }
        }

        // publish the locals region, lowest address first
        if layout.locals > 0 {
            asm.lea(Reg::Rax, slot(LOCALS_BASE + layout.locals - 1));
        } else {
            asm.mov_ri(Reg::Rax, 0);
        }
        asm.mov_rm(Reg::Rdx, slot(Slot::JitMem.index()));
        asm.mov_mr(Mem::base(Reg::Rdx, 0), Reg::Rax);
        asm.mov_rm(Reg::Rdx, slot(Slot::JitWords.index()));
        asm.mov_mi(Mem::base(Reg::Rdx, 0), layout.locals as i32);

        asm.mov_ri(Reg::Rax, 0);
        for k in 0..layout.locals {
            asm.mov_mr(slot(layout.local(k)), Reg::Rax);
        }
    }

    fn status_stub(&mut self, status: i64) -> BranchSite {
        let mut asm = self.asm();
        asm.mov_ri(Reg::Rax, status);
        BranchSite::rel32(asm.jmp_rel32(0))
    }

    fn teardown(&mut self, _layout: &FrameLayout) {
        let mut asm = self.asm();
        asm.lea(Reg::Rsp, Mem::base(Reg::Rbp, -SAVED_BYTES));
        for reg in SAVED.iter().rev() {
            asm.pop(*reg);
        }
        asm.pop(Reg::Rbp);
        asm.ret();
    }

    fn jump(&mut self) -> BranchSite {
        BranchSite::rel32(self.asm().jmp_rel32(0))
    }

    fn load_imm(&mut self, dst: Reg, imm: i64) {
        self.asm().mov_ri(dst, imm);
    }

    fn load_float_imm(&mut self, dst: Xmm, value: f64) -> Result<(), CompileError> {
        let bits = value.to_bits();
        if bits == 0 {
            self.asm().xorpd(dst, dst);
            return Ok(());
        }
        let index = self.const_index(bits)?;
        let addr = self.consts.as_ptr() as i64 + 8 * index as i64;
        let mut asm = self.asm();
        asm.mov_ri(SCRATCH, addr);
        asm.movsd_rm(dst, Mem::base(SCRATCH, 0));
        Ok(())
    }

    fn mov(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.asm().mov_rr(dst, src);
        }
    }

    fn fmov(&mut self, dst: Xmm, src: Xmm) {
        if dst != src {
            self.asm().movsd_rr(dst, src);
        }
    }

    fn int_op(&mut self, op: IntOp, dst: Reg, src: Src<Reg>) {
        match op {
            IntOp::Add => self.alu(Alu::Add, dst, src),
            IntOp::Sub => self.alu(Alu::Sub, dst, src),
            IntOp::And => self.alu(Alu::And, dst, src),
            IntOp::Or => self.alu(Alu::Or, dst, src),
            IntOp::Xor => self.alu(Alu::Xor, dst, src),
            IntOp::Mul => match src {
                Src::Reg(r) => self.asm().imul_rr(dst, r),
                Src::Imm(v) if fits_i32(v) => self.asm().imul_rri(dst, dst, v as i32),
                Src::Slot(s) => self.asm().imul_rm(dst, slot(s)),
                Src::Imm(_) => {
                    let r = self.src_reg(src);
                    self.asm().imul_rr(dst, r);
                }
            },
            IntOp::Shl | IntOp::Shr => self.shift(op, dst, src),
        }
    }

    fn not(&mut self, dst: Reg) {
        self.asm().not(dst);
    }

    fn div(&mut self, dst: Reg, src: Src<Reg>, rem: bool) -> BranchSite {
        let divisor = self.src_reg(src);
        let mut asm = self.asm();
        asm.test_rr(divisor, divisor);
        let zero = asm.jcc_rel32(Cond::E, 0);
        asm.alu_ri(Alu::Cmp, divisor, -1);
        let normal = asm.jcc_rel32(Cond::Ne, 0);
        // x / -1 wraps, x % -1 is zero; idiv would trap on MIN
        if rem {
            asm.mov_ri(dst, 0);
        } else {
            asm.neg(dst);
        }
        let done = asm.jmp_rel32(0);
        self.land(normal);
        let mut asm = self.asm();
        asm.mov_rr(Reg::Rax, dst);
        asm.cqo();
        asm.idiv(divisor);
        asm.mov_rr(dst, if rem { Reg::Rdx } else { Reg::Rax });
        self.land(done);
        BranchSite::rel32(zero)
    }

    fn cmp(&mut self, left: Reg, right: Src<Reg>) {
        self.alu(Alu::Cmp, left, right);
    }

    fn set_cond(&mut self, dst: Reg, cmp: Cmp) {
        let mut asm = self.asm();
        asm.setcc(cond(cmp), Reg::Rax);
        asm.movzx_r64_r8(dst, Reg::Rax);
    }

    fn branch(&mut self, cmp: Cmp) -> BranchSite {
        BranchSite::rel32(self.asm().jcc_rel32(cond(cmp), 0))
    }

    fn fcmp_set(&mut self, dst: Reg, left: Xmm, right: Xmm, cmp: FCmp) {
        let mut asm = self.asm();
        match cmp {
            FCmp::Gt | FCmp::Ge => asm.ucomisd(left, right),
            FCmp::Lt | FCmp::Le => asm.ucomisd(right, left),
            FCmp::Eq | FCmp::Ne => asm.ucomisd(left, right),
        }
        match cmp {
            FCmp::Gt | FCmp::Lt => asm.setcc(Cond::A, Reg::Rax),
            FCmp::Ge | FCmp::Le => asm.setcc(Cond::Ae, Reg::Rax),
            FCmp::Eq => {
                asm.setcc(Cond::E, Reg::Rax);
                asm.setcc(Cond::Np, Reg::Rdx);
                asm.and_r8(Reg::Rax, Reg::Rdx);
            }
            FCmp::Ne => {
                asm.setcc(Cond::Ne, Reg::Rax);
                asm.setcc(Cond::P, Reg::Rdx);
                asm.or_r8(Reg::Rax, Reg::Rdx);
            }
        }
        asm.movzx_r64_r8(dst, Reg::Rax);
    }

    fn fcmp_branch(&mut self, left: Xmm, right: Xmm, cmp: FCmp, when: bool) -> Vec<BranchSite> {
        let mut asm = self.asm();
        match cmp {
            FCmp::Lt | FCmp::Le => asm.ucomisd(right, left),
            _ => asm.ucomisd(left, right),
        }
        // unordered sets ZF, PF and CF
        let ordered_taken = |cmp: FCmp| match cmp {
            FCmp::Gt | FCmp::Lt => Cond::A,
            _ => Cond::Ae,
        };
        match (cmp, when) {
            (FCmp::Gt | FCmp::Lt | FCmp::Ge | FCmp::Le, true) => {
                vec![BranchSite::rel32(asm.jcc_rel32(ordered_taken(cmp), 0))]
            }
            (FCmp::Gt | FCmp::Lt | FCmp::Ge | FCmp::Le, false) => {
                let inverse = ordered_taken(cmp).invert();
                vec![BranchSite::rel32(asm.jcc_rel32(inverse, 0))]
            }
            // equal and ordered
            (FCmp::Eq, true) | (FCmp::Ne, false) => {
                let skip = asm.jcc_rel32(Cond::P, 0);
                let taken = asm.jcc_rel32(Cond::E, 0);
                self.land(skip);
                vec![BranchSite::rel32(taken)]
            }
            // different or unordered
            (FCmp::Ne, true) | (FCmp::Eq, false) => {
                let unordered = asm.jcc_rel32(Cond::P, 0);
                let differ = asm.jcc_rel32(Cond::Ne, 0);
                vec![BranchSite::rel32(unordered), BranchSite::rel32(differ)]
            }
        }
    }

    fn float_op(&mut self, op: FloatOp, dst: Xmm, src: Xmm) {
        let mut asm = self.asm();
        match op {
            FloatOp::Add => asm.addsd(dst, src),
            FloatOp::Sub => asm.subsd(dst, src),
            FloatOp::Mul => asm.mulsd(dst, src),
            FloatOp::Div => asm.divsd(dst, src),
        }
    }

    fn fdiv_zero_check(&mut self, src: Xmm) -> BranchSite {
        let mut asm = self.asm();
        asm.xorpd(FSCRATCH, FSCRATCH);
        asm.ucomisd(src, FSCRATCH);
        let skip = asm.jcc_rel32(Cond::P, 0);
        let zero = asm.jcc_rel32(Cond::E, 0);
        self.land(skip);
        BranchSite::rel32(zero)
    }

    fn i2f(&mut self, dst: Xmm, src: Reg) {
        self.asm().cvtsi2sd(dst, src);
    }

    fn f2i(&mut self, dst: Reg, src: Xmm) {
        self.asm().cvttsd2si(dst, src);
    }

    fn int_to_float_bits(&mut self, dst: Xmm, src: Reg) {
        self.asm().movq_xmm_r64(dst, src);
    }

    fn float_bits_to_int(&mut self, dst: Reg, src: Xmm) {
        self.asm().movq_r64_xmm(dst, src);
    }

    fn load(&mut self, dst: Reg, base: Reg, disp: i32, width: Width) {
        let mem = Mem::base(base, disp);
        let mut asm = self.asm();
        match width {
            Width::Byte => asm.movzx_rm_byte(dst, mem),
            Width::Char => asm.mov_rm32(dst, mem),
            Width::Word => asm.mov_rm(dst, mem),
        }
    }

    fn store(&mut self, base: Reg, disp: i32, width: Width, src: Src<Reg>) {
        let mem = Mem::base(base, disp);
        if let (Width::Word, Src::Imm(v)) = (width, src) {
            if fits_i32(v) {
                self.asm().mov_mi(mem, v as i32);
                return;
            }
        }
        let value = self.src_reg(src);
        let mut asm = self.asm();
        match width {
            Width::Byte => asm.mov_mr_byte(mem, value),
            Width::Char => asm.mov_mr32(mem, value),
            Width::Word => asm.mov_mr(mem, value),
        }
    }

    fn fload(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.asm().movsd_rm(dst, Mem::base(base, disp));
    }

    fn fstore(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.asm().movsd_mr(Mem::base(base, disp), src);
    }

    fn load_slot(&mut self, dst: Reg, index: u32) {
        self.asm().mov_rm(dst, slot(index));
    }

    fn store_slot(&mut self, index: u32, src: Src<Reg>) {
        match src {
            Src::Imm(v) if fits_i32(v) => self.asm().mov_mi(slot(index), v as i32),
            _ => {
                let value = self.src_reg(src);
                self.asm().mov_mr(slot(index), value);
            }
        }
    }

    fn fload_slot(&mut self, dst: Xmm, index: u32) {
        self.asm().movsd_rm(dst, slot(index));
    }

    fn fstore_slot(&mut self, index: u32, src: Xmm) {
        self.asm().movsd_mr(slot(index), src);
    }

    fn nil_check(&mut self, reg: Reg) -> BranchSite {
        let mut asm = self.asm();
        asm.test_rr(reg, reg);
        BranchSite::rel32(asm.jcc_rel32(Cond::E, 0))
    }

    fn bounds_check(&mut self, index: Reg, array: Reg) -> (BranchSite, BranchSite) {
        let mut asm = self.asm();
        asm.test_rr(index, index);
        let under = asm.jcc_rel32(Cond::S, 0);
        asm.alu_rm(Alu::Cmp, index, Mem::base(array, 0));
        let over = asm.jcc_rel32(Cond::Ge, 0);
        (BranchSite::rel32(under), BranchSite::rel32(over))
    }

    fn mul_extent(&mut self, index: Reg, array: Reg, dim: usize) {
        self.asm()
            .imul_rm(index, Mem::base(array, 8 * (2 + dim as i32)));
    }

    fn index_address(&mut self, index: Reg, array: Reg, shift: u8, payload_disp: i32) {
        self.asm()
            .lea(index, Mem::indexed(array, index, 1 << shift, payload_disp));
    }

    fn op_stack_push(&mut self, src: Src<Reg>) {
        self.stack_top_address(true);
        let top = Mem::base(SCRATCH, 0);
        match src {
            Src::Reg(r) => self.asm().mov_mr(top, r),
            Src::Imm(v) if fits_i32(v) => self.asm().mov_mi(top, v as i32),
            Src::Imm(v) => {
                let mut asm = self.asm();
                asm.mov_ri(Reg::Rdx, v);
                asm.mov_mr(top, Reg::Rdx);
            }
            Src::Slot(s) => {
                let mut asm = self.asm();
                asm.mov_rm(Reg::Rdx, slot(s));
                asm.mov_mr(top, Reg::Rdx);
            }
        }
    }

    fn op_stack_push_float(&mut self, src: Xmm) {
        self.stack_top_address(true);
        self.asm().movsd_mr(Mem::base(SCRATCH, 0), src);
    }

    fn op_stack_pop(&mut self, dst: Reg) {
        self.stack_top_address(false);
        self.asm().mov_rm(dst, Mem::base(SCRATCH, 0));
    }

    fn op_stack_pop_float(&mut self, dst: Xmm) {
        self.stack_top_address(false);
        self.asm().movsd_rm(dst, Mem::base(SCRATCH, 0));
    }

    fn op_stack_drop(&mut self) {
        let mut asm = self.asm();
        asm.mov_rm(Reg::Rax, slot(Slot::StackPos.index()));
        asm.alu_mi(Alu::Sub, Mem::base(Reg::Rax, 0), 1);
    }

    fn op_stack_reserve(&mut self, words: u32) -> (usize, BranchSite) {
        let mut asm = self.asm();
        asm.mov_rm(Reg::Rax, slot(Slot::StackPos.index()));
        asm.mov_rm(Reg::Rax, Mem::base(Reg::Rax, 0));
        let at = asm.mov_r32_imm32(Reg::Rdx, words);
        asm.alu_rr(Alu::Add, Reg::Rax, Reg::Rdx);
        asm.mov_rm(SCRATCH, slot(Slot::Ctx.index()));
        asm.alu_rm(Alu::Cmp, Reg::Rax, Mem::base(SCRATCH, CTX_STACK_LIMIT));
        (at, BranchSite::rel32(asm.jcc_rel32(Cond::G, 0)))
    }

    fn patch_reserve(&mut self, at: usize, words: u32) {
        self.buf.patch_u32(at, words);
    }

    fn call_bridge(&mut self, tag: i64, instr: i64, ip: i64) -> BranchSite {
        let abi = self.abi;
        let (area, first) = abi.call_area();
        let mut asm = self.asm();
        asm.alu_ri(Alu::Sub, Reg::Rsp, area);

        // native_bridge(tag, instr, cls, mthd, inst, op_stack, stack_pos, ctx, call_pos, ip)
        let from_slots: &[Slot] = match abi {
            Abi::SysV => &[Slot::StackPos, Slot::Ctx, Slot::CallPos],
            Abi::Win64 => &[
                Slot::Instance,
                Slot::OpStack,
                Slot::StackPos,
                Slot::Ctx,
                Slot::CallPos,
            ],
        };
        let mut at = first;
        for s in from_slots {
            asm.mov_rm(Reg::Rax, slot(s.index()));
            asm.mov_mr(Mem::base(Reg::Rsp, at), Reg::Rax);
            at += 8;
        }
        asm.mov_mi(Mem::base(Reg::Rsp, at), ip as i32);

        let regs = abi.arg_regs();
        asm.mov_ri(regs[0], tag);
        asm.mov_ri(regs[1], instr);
        asm.mov_rm(regs[2], slot(Slot::ClsId.index()));
        asm.mov_rm(regs[3], slot(Slot::MthdId.index()));
        if abi == Abi::SysV {
            asm.mov_rm(regs[4], slot(Slot::Instance.index()));
            asm.mov_rm(regs[5], slot(Slot::OpStack.index()));
        }
        asm.mov_ri64(Reg::Rax, native_bridge as usize as i64);
        asm.call_r(Reg::Rax);
        asm.alu_ri(Alu::Add, Reg::Rsp, area);

        asm.mov_rm(Reg::Rax, slot(Slot::Ctx.index()));
        asm.alu_mi(Alu::Cmp, Mem::base(Reg::Rax, 0), 0);
        BranchSite::rel32(asm.jcc_rel32(Cond::Ne, 0))
    }

    fn finish(self) -> (CodeBuffer, Box<[u64]>) {
        (self.buf, self.consts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(abi: Abi, f: impl FnOnce(&mut Amd64)) -> Vec<u8> {
        let mut backend = Amd64::new(abi);
        f(&mut backend);
        backend.finish().0.into_code()
    }

    #[test]
    fn test_prologue_keeps_stack_aligned() {
        for locals in 0..4 {
            let code = emit(Abi::SysV, |b| b.prologue(&FrameLayout::new(locals)));
            // push rbp; mov rbp, rsp
            assert_eq!(&code[..4], &[0x55, 0x48, 0x89, 0xE5]);
            let slots = FrameLayout::new(locals).slots() as i32;
            let bytes = 8 * (slots + (slots + 1) % 2);
            // return address + 8 pushes + frame is a multiple of 16
            assert_eq!((8 + 64 + bytes) % 16, 0);
        }
    }

    #[test]
    fn test_slot_addressing() {
        assert_eq!(slot(0).disp, -64);
        assert_eq!(slot(LOCALS_BASE).disp, -56 - 8 * 22);
    }

    #[test]
    fn test_float_constants_are_pooled() {
        let mut backend = Amd64::new(Abi::SysV);
        backend.load_float_imm(Xmm(1), 2.5).unwrap();
        backend.load_float_imm(Xmm(2), 2.5).unwrap();
        backend.load_float_imm(Xmm(3), 0.0).unwrap();
        assert_eq!(backend.used, 1);
        let (_, consts) = backend.finish();
        assert_eq!(consts[0], 2.5f64.to_bits());
    }

    #[test]
    fn test_const_pool_full() {
        let mut backend = Amd64::new(Abi::Win64);
        for i in 0..MAX_DBLS {
            backend.load_float_imm(Xmm(1), i as f64 + 1.0).unwrap();
        }
        assert!(matches!(
            backend.load_float_imm(Xmm(1), -1.0),
            Err(CompileError::ConstPoolFull)
        ));
    }

    #[test]
    fn test_div_patches_local_branches() {
        let mut backend = Amd64::new(Abi::SysV);
        let site = backend.div(Reg::Rbx, Src::Reg(Reg::Rcx), false);
        let code = backend.buf.code();
        // test rcx, rcx; je <fault>
        assert_eq!(&code[..5], &[0x48, 0x85, 0xC9, 0x0F, 0x84]);
        assert_eq!(site.at, 5);
    }

    #[test]
    fn test_stack_reserve_is_patchable() {
        let mut backend = Amd64::new(Abi::SysV);
        let (at, site) = backend.op_stack_reserve(1);
        backend.patch_reserve(at, 12);
        let code = backend.buf.code();
        assert_eq!(code[at - 1], 0xBA);
        assert_eq!(&code[at..at + 4], &[12, 0, 0, 0]);
        // cmp rax, [r11+16]; jg
        assert_eq!(&code[site.at - 6..site.at], &[0x49, 0x3B, 0x43, 0x10, 0x0F, 0x8F]);
    }

    #[test]
    fn test_win64_pools_skip_argument_scratch() {
        let backend = Amd64::new(Abi::Win64);
        let mut ints = backend.int_allocator();
        let first = ints.acquire();
        assert_eq!(first.reg(), Reg::Rbx);
        ints.release(first);
    }
}
