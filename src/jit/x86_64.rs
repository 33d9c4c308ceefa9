//! x86-64 instruction encoding for JIT compilation.
//!
//! Pure encoders: each method appends the bytes of one instruction to a
//! [`CodeBuffer`]. Memory operands are `[base + index*scale + disp]`.

use super::codebuf::CodeBuffer;

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Get the register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn num(self) -> u8 {
        self as u8
    }

    /// Check if this register requires a REX extension bit.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// SSE register `xmm0`..`xmm15`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

/// x86-64 condition codes (for Jcc, SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    /// Invert the condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// Two-operand integer ALU operations sharing the classic encoding group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alu {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl Alu {
    /// `/digit` extension used by the immediate forms.
    fn ext(self) -> u8 {
        match self {
            Alu::Add => 0,
            Alu::Or => 1,
            Alu::And => 4,
            Alu::Sub => 5,
            Alu::Xor => 6,
            Alu::Cmp => 7,
        }
    }

    /// `op r/m64, r64` opcode; `op r64, r/m64` is this plus two.
    fn opcode(self) -> u8 {
        self.ext() * 8 + 1
    }
}

/// Memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Reg,
    pub index: Option<(Reg, u8)>,
    pub disp: i32,
}

impl Mem {
    pub fn base(base: Reg, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp,
        }
    }

    pub fn indexed(base: Reg, index: Reg, scale: u8, disp: i32) -> Self {
        Self {
            base,
            index: Some((index, scale)),
            disp,
        }
    }
}

/// Encode ModR/M byte.
fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    // ==================== Prefix and operand helpers ====================

    /// REX prefix for a `reg` field and an r/m operand; emitted only when some
    /// bit is set or `force` asks for it (byte registers spl..dil).
    fn rex(&mut self, w: bool, reg: u8, index: u8, base: u8, force: bool) {
        let rex = 0x40
            | ((w as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | (((index >> 3) & 1) << 1)
            | ((base >> 3) & 1);
        if rex != 0x40 || force {
            self.buf.emit_u8(rex);
        }
    }

    fn rex_mem(&mut self, w: bool, reg: u8, mem: Mem, force: bool) {
        let index = mem.index.map(|(r, _)| r.num()).unwrap_or(0);
        self.rex(w, reg, index, mem.base.num(), force);
    }

    /// ModR/M, optional SIB and displacement for `mem`.
    fn emit_mem(&mut self, reg: u8, mem: Mem) {
        let base = mem.base.code();
        let mode = if mem.disp == 0 && base != 5 {
            0b00
        } else if (-128..=127).contains(&mem.disp) {
            0b01
        } else {
            0b10
        };

        if mem.index.is_some() || base == 4 {
            let (index, ss) = match mem.index {
                Some((r, scale)) => (
                    r.code(),
                    match scale {
                        1 => 0,
                        2 => 1,
                        4 => 2,
                        _ => 3,
                    },
                ),
                None => (0b100, 0),
            };
            self.buf.emit_u8(modrm(mode, reg, 0b100));
            self.buf.emit_u8((ss << 6) | (index << 3) | base);
        } else {
            self.buf.emit_u8(modrm(mode, reg, base));
        }

        match mode {
            0b01 => self.buf.emit_u8(mem.disp as u8),
            0b10 => self.buf.emit_u32(mem.disp as u32),
            _ => {}
        }
    }

    fn op_rr(&mut self, w: bool, opcode: &[u8], reg: u8, rm: u8) {
        self.rex(w, reg, 0, rm, false);
        self.buf.emit_bytes(opcode);
        self.buf.emit_u8(modrm(0b11, reg, rm));
    }

    fn op_rm(&mut self, w: bool, opcode: &[u8], reg: u8, mem: Mem) {
        self.rex_mem(w, reg, mem, false);
        self.buf.emit_bytes(opcode);
        self.emit_mem(reg, mem);
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.op_rr(true, &[0x89], src.num(), dst.num());
    }

    /// MOV r64, imm (shortest encoding)
    pub fn mov_ri(&mut self, dst: Reg, imm: i64) {
        if imm == 0 {
            // XOR r32, r32 clears the full register
            self.op_rr(false, &[0x31], dst.num(), dst.num());
        } else if (0..=u32::MAX as i64).contains(&imm) {
            // MOV r32, imm32 zero-extends
            self.rex(false, 0, 0, dst.num(), false);
            self.buf.emit_u8(0xB8 + dst.code());
            self.buf.emit_u32(imm as u32);
        } else if i32::try_from(imm).is_ok() {
            // MOV r/m64, imm32 (sign-extended)
            self.rex(true, 0, 0, dst.num(), false);
            self.buf.emit_u8(0xC7);
            self.buf.emit_u8(modrm(0b11, 0, dst.code()));
            self.buf.emit_u32(imm as u32);
        } else {
            self.mov_ri64(dst, imm);
        }
    }

    /// MOV r64, imm64 (always ten bytes)
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex(true, 0, 0, dst.num(), false);
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r32, imm32 in its fixed five-byte form (six with REX). Returns
    /// the offset of the immediate so it can be patched later.
    pub fn mov_r32_imm32(&mut self, dst: Reg, imm: u32) -> usize {
        self.rex(false, 0, 0, dst.num(), false);
        self.buf.emit_u8(0xB8 + dst.code());
        let at = self.buf.offset();
        self.buf.emit_u32(imm);
        at
    }

    /// MOV r64, [mem]
    pub fn mov_rm(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(true, &[0x8B], dst.num(), mem);
    }

    /// MOV [mem], r64
    pub fn mov_mr(&mut self, mem: Mem, src: Reg) {
        self.op_rm(true, &[0x89], src.num(), mem);
    }

    /// MOV QWORD [mem], imm32 (sign-extended)
    pub fn mov_mi(&mut self, mem: Mem, imm: i32) {
        self.op_rm(true, &[0xC7], 0, mem);
        self.buf.emit_u32(imm as u32);
    }

    /// MOVZX r64, BYTE [mem]
    pub fn movzx_rm_byte(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(true, &[0x0F, 0xB6], dst.num(), mem);
    }

    /// MOV r32, DWORD [mem] (zero-extends to 64 bits)
    pub fn mov_rm32(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(false, &[0x8B], dst.num(), mem);
    }

    /// MOV BYTE [mem], r8
    pub fn mov_mr_byte(&mut self, mem: Mem, src: Reg) {
        // sil/dil/spl/bpl need an empty REX prefix
        self.rex_mem(false, src.num(), mem, (4..8).contains(&src.num()));
        self.buf.emit_u8(0x88);
        self.emit_mem(src.num(), mem);
    }

    /// MOV DWORD [mem], r32
    pub fn mov_mr32(&mut self, mem: Mem, src: Reg) {
        self.op_rm(false, &[0x89], src.num(), mem);
    }

    /// LEA r64, [mem]
    pub fn lea(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(true, &[0x8D], dst.num(), mem);
    }

    /// MOVZX r64, r8
    pub fn movzx_r64_r8(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.num(), 0, src.num(), false);
        self.buf.emit_bytes(&[0x0F, 0xB6]);
        self.buf.emit_u8(modrm(0b11, dst.code(), src.code()));
    }

    // ==================== Arithmetic Operations ====================

    /// op r64, r64
    pub fn alu_rr(&mut self, op: Alu, dst: Reg, src: Reg) {
        self.op_rr(true, &[op.opcode()], src.num(), dst.num());
    }

    /// op r64, imm32 (sign-extended)
    pub fn alu_ri(&mut self, op: Alu, dst: Reg, imm: i32) {
        self.rex(true, 0, 0, dst.num(), false);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(modrm(0b11, op.ext(), dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(modrm(0b11, op.ext(), dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// op r64, [mem]
    pub fn alu_rm(&mut self, op: Alu, dst: Reg, mem: Mem) {
        self.op_rm(true, &[op.opcode() + 2], dst.num(), mem);
    }

    /// op QWORD [mem], imm32 (sign-extended)
    pub fn alu_mi(&mut self, op: Alu, mem: Mem, imm: i32) {
        if (-128..=127).contains(&imm) {
            self.op_rm(true, &[0x83], op.ext(), mem);
            self.buf.emit_u8(imm as u8);
        } else {
            self.op_rm(true, &[0x81], op.ext(), mem);
            self.buf.emit_u32(imm as u32);
        }
    }

    /// IMUL r64, r64
    pub fn imul_rr(&mut self, dst: Reg, src: Reg) {
        self.op_rr(true, &[0x0F, 0xAF], dst.num(), src.num());
    }

    /// IMUL r64, [mem]
    pub fn imul_rm(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(true, &[0x0F, 0xAF], dst.num(), mem);
    }

    /// IMUL r64, r64, imm32
    pub fn imul_rri(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.rex(true, dst.num(), 0, src.num(), false);
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x6B);
            self.buf.emit_u8(modrm(0b11, dst.code(), src.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x69);
            self.buf.emit_u8(modrm(0b11, dst.code(), src.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// IDIV r64 (RDX:RAX / r64, quotient in RAX, remainder in RDX)
    pub fn idiv(&mut self, src: Reg) {
        self.op_rr(true, &[0xF7], 7, src.num());
    }

    /// CQO (sign-extend RAX into RDX:RAX)
    pub fn cqo(&mut self) {
        self.buf.emit_bytes(&[0x48, 0x99]);
    }

    /// NEG r64
    pub fn neg(&mut self, dst: Reg) {
        self.op_rr(true, &[0xF7], 3, dst.num());
    }

    /// NOT r64
    pub fn not(&mut self, dst: Reg) {
        self.op_rr(true, &[0xF7], 2, dst.num());
    }

    /// SHL r64, imm8
    pub fn shl_ri(&mut self, dst: Reg, imm: u8) {
        self.op_rr(true, &[0xC1], 4, dst.num());
        self.buf.emit_u8(imm);
    }

    /// SAR r64, imm8
    pub fn sar_ri(&mut self, dst: Reg, imm: u8) {
        self.op_rr(true, &[0xC1], 7, dst.num());
        self.buf.emit_u8(imm);
    }

    /// SHL r64, CL
    pub fn shl_cl(&mut self, dst: Reg) {
        self.op_rr(true, &[0xD3], 4, dst.num());
    }

    /// SAR r64, CL
    pub fn sar_cl(&mut self, dst: Reg) {
        self.op_rr(true, &[0xD3], 7, dst.num());
    }

    /// TEST r64, r64
    pub fn test_rr(&mut self, a: Reg, b: Reg) {
        self.op_rr(true, &[0x85], b.num(), a.num());
    }

    /// SETcc r8
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        self.rex(false, 0, 0, dst.num(), (4..8).contains(&dst.num()));
        self.buf.emit_bytes(&[0x0F, 0x90 + cond as u8]);
        self.buf.emit_u8(modrm(0b11, 0, dst.code()));
    }

    /// AND r8, r8
    pub fn and_r8(&mut self, dst: Reg, src: Reg) {
        self.op_rr(false, &[0x20], src.num(), dst.num());
    }

    /// OR r8, r8
    pub fn or_r8(&mut self, dst: Reg, src: Reg) {
        self.op_rr(false, &[0x08], src.num(), dst.num());
    }

    // ==================== Stack ====================

    /// PUSH r64
    pub fn push(&mut self, reg: Reg) {
        self.rex(false, 0, 0, reg.num(), false);
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r64
    pub fn pop(&mut self, reg: Reg) {
        self.rex(false, 0, 0, reg.num(), false);
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Control Flow ====================

    /// JMP rel32. Returns the offset of the displacement field.
    pub fn jmp_rel32(&mut self, offset: i32) -> usize {
        self.buf.emit_u8(0xE9);
        let site = self.buf.offset();
        self.buf.emit_u32(offset as u32);
        site
    }

    /// Jcc rel32. Returns the offset of the displacement field.
    pub fn jcc_rel32(&mut self, cond: Cond, offset: i32) -> usize {
        self.buf.emit_bytes(&[0x0F, 0x80 + cond as u8]);
        let site = self.buf.offset();
        self.buf.emit_u32(offset as u32);
        site
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        self.op_rr(false, &[0xFF], 2, reg.num());
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    // ==================== SSE2 ====================

    fn sse_rr(&mut self, prefix: u8, opcode: u8, w: bool, reg: u8, rm: u8) {
        self.buf.emit_u8(prefix);
        self.rex(w, reg, 0, rm, false);
        self.buf.emit_bytes(&[0x0F, opcode]);
        self.buf.emit_u8(modrm(0b11, reg, rm));
    }

    fn sse_rm(&mut self, prefix: u8, opcode: u8, reg: u8, mem: Mem) {
        self.buf.emit_u8(prefix);
        self.rex_mem(false, reg, mem, false);
        self.buf.emit_bytes(&[0x0F, opcode]);
        self.emit_mem(reg, mem);
    }

    /// MOVSD xmm, xmm
    pub fn movsd_rr(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x10, false, dst.0, src.0);
    }

    /// MOVSD xmm, [mem]
    pub fn movsd_rm(&mut self, dst: Xmm, mem: Mem) {
        self.sse_rm(0xF2, 0x10, dst.0, mem);
    }

    /// MOVSD [mem], xmm
    pub fn movsd_mr(&mut self, mem: Mem, src: Xmm) {
        self.sse_rm(0xF2, 0x11, src.0, mem);
    }

    /// MOVQ xmm, r64
    pub fn movq_xmm_r64(&mut self, dst: Xmm, src: Reg) {
        self.sse_rr(0x66, 0x6E, true, dst.0, src.num());
    }

    /// MOVQ r64, xmm
    pub fn movq_r64_xmm(&mut self, dst: Reg, src: Xmm) {
        self.sse_rr(0x66, 0x7E, true, src.0, dst.num());
    }

    /// ADDSD xmm, xmm
    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x58, false, dst.0, src.0);
    }

    /// MULSD xmm, xmm
    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x59, false, dst.0, src.0);
    }

    /// SUBSD xmm, xmm
    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x5C, false, dst.0, src.0);
    }

    /// DIVSD xmm, xmm
    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xF2, 0x5E, false, dst.0, src.0);
    }

    /// UCOMISD xmm, xmm
    pub fn ucomisd(&mut self, a: Xmm, b: Xmm) {
        self.sse_rr(0x66, 0x2E, false, a.0, b.0);
    }

    /// XORPD xmm, xmm
    pub fn xorpd(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0x66, 0x57, false, dst.0, src.0);
    }

    /// CVTSI2SD xmm, r64
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg) {
        self.sse_rr(0xF2, 0x2A, true, dst.0, src.num());
    }

    /// CVTTSD2SI r64, xmm
    pub fn cvttsd2si(&mut self, dst: Reg, src: Xmm) {
        self.sse_rr(0xF2, 0x2C, true, dst.num(), src.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(f: impl FnOnce(&mut X86_64Assembler)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut X86_64Assembler::new(&mut buf));
        buf.into_code()
    }

    #[test]
    fn test_mov_forms() {
        assert_eq!(encode(|a| a.mov_rr(Reg::Rax, Reg::Rbx)), [0x48, 0x89, 0xD8]);
        assert_eq!(encode(|a| a.mov_rr(Reg::R8, Reg::Rax)), [0x49, 0x89, 0xC0]);
        assert_eq!(encode(|a| a.mov_ri(Reg::Rax, 7)), [0xB8, 7, 0, 0, 0]);
        assert_eq!(encode(|a| a.mov_ri(Reg::R11, 0)), [0x45, 0x31, 0xDB]);
        assert_eq!(
            encode(|a| a.mov_ri(Reg::Rcx, -1)),
            [0x48, 0xC7, 0xC1, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(encode(|a| a.mov_ri(Reg::Rax, i64::MIN)).len(), 10);
    }

    #[test]
    fn test_patchable_imm32() {
        let mut buf = CodeBuffer::new();
        let at = X86_64Assembler::new(&mut buf).mov_r32_imm32(Reg::Rdx, 0);
        assert_eq!(at, 1);
        buf.patch_u32(at, 7);
        assert_eq!(buf.code(), &[0xBA, 7, 0, 0, 0]);
        // the zero immediate keeps its full width
        assert_eq!(encode(|a| { a.mov_r32_imm32(Reg::R11, 0); }), [0x41, 0xBB, 0, 0, 0, 0]);
    }

    #[test]
    fn test_memory_operands() {
        // mov rax, [rbp-8]
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Mem::base(Reg::Rbp, -8))), [0x48, 0x8B, 0x45, 0xF8]);
        // mov [rsp], rcx needs a SIB byte
        assert_eq!(encode(|a| a.mov_mr(Mem::base(Reg::Rsp, 0), Reg::Rcx)), [0x48, 0x89, 0x0C, 0x24]);
        // mov [r11+rdx*8], rbx
        assert_eq!(
            encode(|a| a.mov_mr(Mem::indexed(Reg::R11, Reg::Rdx, 8, 0), Reg::Rbx)),
            [0x49, 0x89, 0x1C, 0xD3]
        );
        // mov rax, [r13] needs an explicit zero displacement
        assert_eq!(encode(|a| a.mov_rm(Reg::Rax, Mem::base(Reg::R13, 0))), [0x49, 0x8B, 0x45, 0x00]);
        // lea rax, [rbp-512]
        assert_eq!(
            encode(|a| a.lea(Reg::Rax, Mem::base(Reg::Rbp, -512))),
            [0x48, 0x8D, 0x85, 0x00, 0xFE, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_alu() {
        assert_eq!(encode(|a| a.alu_rr(Alu::Add, Reg::Rax, Reg::Rcx)), [0x48, 0x01, 0xC8]);
        assert_eq!(encode(|a| a.alu_rr(Alu::Cmp, Reg::Rbx, Reg::Rsi)), [0x48, 0x39, 0xF3]);
        assert_eq!(encode(|a| a.alu_ri(Alu::Sub, Reg::Rsp, 32)), [0x48, 0x83, 0xEC, 0x20]);
        assert_eq!(
            encode(|a| a.alu_mi(Alu::Add, Mem::base(Reg::Rax, 0), 1)),
            [0x48, 0x83, 0x00, 0x01]
        );
        assert_eq!(encode(|a| a.alu_rm(Alu::Add, Reg::Rax, Mem::base(Reg::Rbp, -16))), [0x48, 0x03, 0x45, 0xF0]);
        assert_eq!(encode(|a| a.imul_rr(Reg::Rax, Reg::Rcx)), [0x48, 0x0F, 0xAF, 0xC1]);
    }

    #[test]
    fn test_jumps_report_sites() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        let site = asm.jcc_rel32(Cond::E, 0);
        assert_eq!(site, 2);
        let site = asm.jmp_rel32(0);
        assert_eq!(site, 7);
        assert_eq!(&buf.code()[..2], &[0x0F, 0x84]);
    }

    #[test]
    fn test_sse() {
        // addsd xmm1, xmm2
        assert_eq!(encode(|a| a.addsd(Xmm(1), Xmm(2))), [0xF2, 0x0F, 0x58, 0xCA]);
        // movq xmm0, rax
        assert_eq!(encode(|a| a.movq_xmm_r64(Xmm(0), Reg::Rax)), [0x66, 0x48, 0x0F, 0x6E, 0xC0]);
        // movsd xmm1, [rbp-8]
        assert_eq!(encode(|a| a.movsd_rm(Xmm(1), Mem::base(Reg::Rbp, -8))), [0xF2, 0x0F, 0x10, 0x4D, 0xF8]);
        // cvttsd2si rax, xmm1
        assert_eq!(encode(|a| a.cvttsd2si(Reg::Rax, Xmm(1))), [0xF2, 0x48, 0x0F, 0x2C, 0xC1]);
    }

    #[test]
    fn test_cond_invert() {
        assert_eq!(Cond::L.invert(), Cond::Ge);
        assert_eq!(Cond::A.invert(), Cond::Be);
        assert_eq!(Cond::P.invert(), Cond::Np);
    }
}
