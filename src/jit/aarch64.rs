//! AArch64 instruction encoding for JIT compilation.
//!
//! Every instruction is one little-endian 32-bit word. Branch emitters
//! return the offset of the word so the fixup pass can patch it.

use super::codebuf::CodeBuffer;

/// AArch64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7,
    X8 = 8,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X13 = 13,
    X14 = 14,
    X15 = 15,
    X16 = 16,
    X17 = 17,
    X18 = 18,
    X19 = 19,
    X20 = 20,
    X21 = 21,
    X22 = 22,
    X23 = 23,
    X24 = 24,
    X25 = 25,
    X26 = 26,
    X27 = 27,
    X28 = 28,
    Fp = 29,
    Lr = 30,
    /// Stack pointer as a base register, zero register elsewhere
    Sp = 31,
}

impl Reg {
    /// Alias for SP when used as zero register
    pub const XZR: Reg = Reg::Sp;

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Double-precision register `d0`..`d31`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DReg(pub u8);

impl DReg {
    fn code(self) -> u32 {
        (self.0 & 0x1F) as u32
    }
}

/// AArch64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0b0000,
    Ne = 0b0001,
    Cs = 0b0010,
    Cc = 0b0011,
    Mi = 0b0100,
    Pl = 0b0101,
    Vs = 0b0110,
    Vc = 0b0111,
    Hi = 0b1000,
    Ls = 0b1001,
    Ge = 0b1010,
    Lt = 0b1011,
    Gt = 0b1100,
    Le = 0b1101,
    Al = 0b1110,
}

impl Cond {
    pub fn invert(self) -> Self {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => Cond::Al,
        }
    }
}

/// AArch64 assembler.
pub struct AArch64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> AArch64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    /// Emit a raw 32-bit instruction.
    pub fn emit_raw(&mut self, inst: u32) {
        self.buf.emit_u32(inst);
    }

    fn rrr(&mut self, base: u32, rd: u32, rn: u32, rm: u32) {
        self.emit_raw(base | (rm << 16) | (rn << 5) | rd);
    }

    // ==================== Data Processing ====================

    /// ADD Xd, Xn, Xm
    pub fn add(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x8B000000, rd.code(), rn.code(), rm.code());
    }

    /// ADD Xd, Xn, Xm, LSL #shift
    pub fn add_lsl(&mut self, rd: Reg, rn: Reg, rm: Reg, shift: u8) {
        self.rrr(
            0x8B000000 | (((shift & 0x3F) as u32) << 10),
            rd.code(),
            rn.code(),
            rm.code(),
        );
    }

    /// ADD Xd, Xn, #imm12
    pub fn add_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        self.emit_raw(0x91000000 | (((imm12 as u32) & 0xFFF) << 10) | (rn.code() << 5) | rd.code());
    }

    /// SUB Xd, Xn, Xm
    pub fn sub(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0xCB000000, rd.code(), rn.code(), rm.code());
    }

    /// SUB Xd, Xn, #imm12
    pub fn sub_imm(&mut self, rd: Reg, rn: Reg, imm12: u16) {
        self.emit_raw(0xD1000000 | (((imm12 as u32) & 0xFFF) << 10) | (rn.code() << 5) | rd.code());
    }

    /// MUL Xd, Xn, Xm
    pub fn mul(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x9B007C00, rd.code(), rn.code(), rm.code());
    }

    /// MSUB Xd, Xn, Xm, Xa (Xa - Xn*Xm)
    pub fn msub(&mut self, rd: Reg, rn: Reg, rm: Reg, ra: Reg) {
        self.rrr(0x9B008000 | (ra.code() << 10), rd.code(), rn.code(), rm.code());
    }

    /// SDIV Xd, Xn, Xm
    pub fn sdiv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x9AC00C00, rd.code(), rn.code(), rm.code());
    }

    /// AND Xd, Xn, Xm
    pub fn and(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x8A000000, rd.code(), rn.code(), rm.code());
    }

    /// ORR Xd, Xn, Xm
    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0xAA000000, rd.code(), rn.code(), rm.code());
    }

    /// EOR Xd, Xn, Xm
    pub fn eor(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0xCA000000, rd.code(), rn.code(), rm.code());
    }

    /// MVN Xd, Xm
    pub fn mvn(&mut self, rd: Reg, rm: Reg) {
        self.rrr(0xAA200000, rd.code(), Reg::XZR.code(), rm.code());
    }

    /// LSLV Xd, Xn, Xm
    pub fn lslv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x9AC02000, rd.code(), rn.code(), rm.code());
    }

    /// ASRV Xd, Xn, Xm
    pub fn asrv(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x9AC02800, rd.code(), rn.code(), rm.code());
    }

    /// LSL Xd, Xn, #shift (UBFM alias)
    pub fn lsl_imm(&mut self, rd: Reg, rn: Reg, shift: u8) {
        let shift = (shift & 0x3F) as u32;
        let immr = (64 - shift) & 0x3F;
        let imms = 63 - shift;
        self.emit_raw(0xD3400000 | (immr << 16) | (imms << 10) | (rn.code() << 5) | rd.code());
    }

    /// ASR Xd, Xn, #shift (SBFM alias)
    pub fn asr_imm(&mut self, rd: Reg, rn: Reg, shift: u8) {
        let immr = (shift & 0x3F) as u32;
        self.emit_raw(0x9340FC00 | (immr << 16) | (rn.code() << 5) | rd.code());
    }

    /// MOV Xd, Xm (ORR with XZR)
    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        self.orr(rd, Reg::XZR, rm);
    }

    /// MOV Xd, SP / MOV SP, Xn (ADD #0 form)
    pub fn mov_sp(&mut self, rd: Reg, rn: Reg) {
        self.add_imm(rd, rn, 0);
    }

    /// MOVZ Xd, #imm16, LSL #(16*hw)
    pub fn movz(&mut self, rd: Reg, imm16: u16, hw: u8) {
        self.emit_raw(0xD2800000 | (((hw & 3) as u32) << 21) | ((imm16 as u32) << 5) | rd.code());
    }

    /// MOVK Xd, #imm16, LSL #(16*hw)
    pub fn movk(&mut self, rd: Reg, imm16: u16, hw: u8) {
        self.emit_raw(0xF2800000 | (((hw & 3) as u32) << 21) | ((imm16 as u32) << 5) | rd.code());
    }

    /// MOVN Xd, #imm16, LSL #(16*hw)
    pub fn movn(&mut self, rd: Reg, imm16: u16, hw: u8) {
        self.emit_raw(0x92800000 | (((hw & 3) as u32) << 21) | ((imm16 as u32) << 5) | rd.code());
    }

    /// Loads an arbitrary 64-bit constant with MOVZ/MOVN plus MOVKs.
    pub fn mov_imm64(&mut self, rd: Reg, imm: i64) {
        let bits = imm as u64;
        let half = |hw: u8| ((bits >> (16 * hw as u64)) & 0xFFFF) as u16;
        let ones = (0..4).filter(|&hw| half(hw) == 0xFFFF).count();
        let zeros = (0..4).filter(|&hw| half(hw) == 0).count();

        if ones > zeros {
            // start from all ones
            let first = (0..4).find(|&hw| half(hw) != 0xFFFF).unwrap_or(0);
            self.movn(rd, !half(first), first);
            for hw in (first + 1)..4 {
                if half(hw) != 0xFFFF {
                    self.movk(rd, half(hw), hw);
                }
            }
        } else {
            let first = (0..4).find(|&hw| half(hw) != 0).unwrap_or(0);
            self.movz(rd, half(first), first);
            for hw in (first + 1)..4 {
                if half(hw) != 0 {
                    self.movk(rd, half(hw), hw);
                }
            }
        }
    }

    /// Instructions `mov_imm64` needs for `imm`.
    pub fn imm64_len(imm: i64) -> usize {
        let bits = imm as u64;
        let halves = (0..4).map(|hw| (bits >> (16 * hw)) & 0xFFFF);
        let ones = halves.clone().filter(|&h| h == 0xFFFF).count();
        let zeros = halves.filter(|&h| h == 0).count();
        (4 - ones.max(zeros)).max(1)
    }

    // ==================== Comparison ====================

    /// CMP Xn, Xm
    pub fn cmp(&mut self, rn: Reg, rm: Reg) {
        self.rrr(0xEB000000, Reg::XZR.code(), rn.code(), rm.code());
    }

    /// CMP Xn, #imm12
    pub fn cmp_imm(&mut self, rn: Reg, imm12: u16) {
        self.emit_raw(0xF1000000 | (((imm12 as u32) & 0xFFF) << 10) | (rn.code() << 5) | Reg::XZR.code());
    }

    /// CMN Xn, #imm12
    pub fn cmn_imm(&mut self, rn: Reg, imm12: u16) {
        self.emit_raw(0xB1000000 | (((imm12 as u32) & 0xFFF) << 10) | (rn.code() << 5) | Reg::XZR.code());
    }

    /// CSET Xd, cond
    pub fn cset(&mut self, rd: Reg, cond: Cond) {
        self.emit_raw(0x9A9F07E0 | ((cond.invert() as u32) << 12) | rd.code());
    }

    /// CSEL Xd, Xn, Xm, cond
    pub fn csel(&mut self, rd: Reg, rn: Reg, rm: Reg, cond: Cond) {
        self.emit_raw(0x9A800000 | (rm.code() << 16) | ((cond as u32) << 12) | (rn.code() << 5) | rd.code());
    }

    // ==================== Loads and Stores ====================

    /// LDR Xt, [Xn, #offset] (offset in bytes, multiple of 8)
    pub fn ldr(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0xF9400000 | (((offset / 8) & 0xFFF) << 10) | (rn.code() << 5) | rt.code());
    }

    /// STR Xt, [Xn, #offset]
    pub fn str(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0xF9000000 | (((offset / 8) & 0xFFF) << 10) | (rn.code() << 5) | rt.code());
    }

    /// LDRB Wt, [Xn, #offset]
    pub fn ldrb(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0x39400000 | ((offset & 0xFFF) << 10) | (rn.code() << 5) | rt.code());
    }

    /// STRB Wt, [Xn, #offset]
    pub fn strb(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0x39000000 | ((offset & 0xFFF) << 10) | (rn.code() << 5) | rt.code());
    }

    /// LDR Wt, [Xn, #offset] (zero-extends)
    pub fn ldr_w(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0xB9400000 | (((offset / 4) & 0xFFF) << 10) | (rn.code() << 5) | rt.code());
    }

    /// STR Wt, [Xn, #offset]
    pub fn str_w(&mut self, rt: Reg, rn: Reg, offset: u32) {
        self.emit_raw(0xB9000000 | (((offset / 4) & 0xFFF) << 10) | (rn.code() << 5) | rt.code());
    }

    /// LDUR Xt, [Xn, #imm9]
    pub fn ldur(&mut self, rt: Reg, rn: Reg, imm9: i16) {
        self.emit_raw(0xF8400000 | (((imm9 as u32) & 0x1FF) << 12) | (rn.code() << 5) | rt.code());
    }

    /// STUR Xt, [Xn, #imm9]
    pub fn stur(&mut self, rt: Reg, rn: Reg, imm9: i16) {
        self.emit_raw(0xF8000000 | (((imm9 as u32) & 0x1FF) << 12) | (rn.code() << 5) | rt.code());
    }

    /// LDR Xt, [Xn, Xm, LSL #3]
    pub fn ldr_idx(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.rrr(0xF8607800, rt.code(), rn.code(), rm.code());
    }

    /// STR Xt, [Xn, Xm, LSL #3]
    pub fn str_idx(&mut self, rt: Reg, rn: Reg, rm: Reg) {
        self.rrr(0xF8207800, rt.code(), rn.code(), rm.code());
    }

    /// LDR Dt, [Xn, #offset]
    pub fn ldr_d(&mut self, rt: DReg, rn: Reg, offset: u32) {
        self.emit_raw(0xFD400000 | (((offset / 8) & 0xFFF) << 10) | (rn.code() << 5) | rt.code());
    }

    /// STR Dt, [Xn, #offset]
    pub fn str_d(&mut self, rt: DReg, rn: Reg, offset: u32) {
        self.emit_raw(0xFD000000 | (((offset / 8) & 0xFFF) << 10) | (rn.code() << 5) | rt.code());
    }

    /// LDR Dt, [Xn, Xm, LSL #3]
    pub fn ldr_d_idx(&mut self, rt: DReg, rn: Reg, rm: Reg) {
        self.rrr(0xFC607800, rt.code(), rn.code(), rm.code());
    }

    /// STR Dt, [Xn, Xm, LSL #3]
    pub fn str_d_idx(&mut self, rt: DReg, rn: Reg, rm: Reg) {
        self.rrr(0xFC207800, rt.code(), rn.code(), rm.code());
    }

    /// STP Xt1, Xt2, [Xn, #offset]
    pub fn stp(&mut self, rt1: Reg, rt2: Reg, rn: Reg, offset: i16) {
        let scaled = ((offset / 8) as u32) & 0x7F;
        self.emit_raw(0xA9000000 | (scaled << 15) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// LDP Xt1, Xt2, [Xn, #offset]
    pub fn ldp(&mut self, rt1: Reg, rt2: Reg, rn: Reg, offset: i16) {
        let scaled = ((offset / 8) as u32) & 0x7F;
        self.emit_raw(0xA9400000 | (scaled << 15) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// STP Dt1, Dt2, [Xn, #offset]
    pub fn stp_d(&mut self, rt1: DReg, rt2: DReg, rn: Reg, offset: i16) {
        let scaled = ((offset / 8) as u32) & 0x7F;
        self.emit_raw(0x6D000000 | (scaled << 15) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// LDP Dt1, Dt2, [Xn, #offset]
    pub fn ldp_d(&mut self, rt1: DReg, rt2: DReg, rn: Reg, offset: i16) {
        let scaled = ((offset / 8) as u32) & 0x7F;
        self.emit_raw(0x6D400000 | (scaled << 15) | (rt2.code() << 10) | (rn.code() << 5) | rt1.code());
    }

    /// STP X1, X2, [SP, #imm]! (store pair with pre-index)
    pub fn stp_pre(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        self.emit_raw(0xA9800000 | (scaled << 15) | (rt2.code() << 10) | (Reg::Sp.code() << 5) | rt1.code());
    }

    /// LDP X1, X2, [SP], #imm (load pair with post-index)
    pub fn ldp_post(&mut self, rt1: Reg, rt2: Reg, imm: i16) {
        let scaled = ((imm / 8) as u32) & 0x7F;
        self.emit_raw(0xA8C00000 | (scaled << 15) | (rt2.code() << 10) | (Reg::Sp.code() << 5) | rt1.code());
    }

    // ==================== Floating Point ====================

    /// FADD Dd, Dn, Dm
    pub fn fadd(&mut self, rd: DReg, rn: DReg, rm: DReg) {
        self.rrr(0x1E602800, rd.code(), rn.code(), rm.code());
    }

    /// FSUB Dd, Dn, Dm
    pub fn fsub(&mut self, rd: DReg, rn: DReg, rm: DReg) {
        self.rrr(0x1E603800, rd.code(), rn.code(), rm.code());
    }

    /// FMUL Dd, Dn, Dm
    pub fn fmul(&mut self, rd: DReg, rn: DReg, rm: DReg) {
        self.rrr(0x1E600800, rd.code(), rn.code(), rm.code());
    }

    /// FDIV Dd, Dn, Dm
    pub fn fdiv(&mut self, rd: DReg, rn: DReg, rm: DReg) {
        self.rrr(0x1E601800, rd.code(), rn.code(), rm.code());
    }

    /// FCMP Dn, Dm
    pub fn fcmp(&mut self, rn: DReg, rm: DReg) {
        self.rrr(0x1E602000, 0, rn.code(), rm.code());
    }

    /// FCMP Dn, #0.0
    pub fn fcmp_zero(&mut self, rn: DReg) {
        self.emit_raw(0x1E602008 | (rn.code() << 5));
    }

    /// FMOV Dd, Dn
    pub fn fmov(&mut self, rd: DReg, rn: DReg) {
        self.emit_raw(0x1E604000 | (rn.code() << 5) | rd.code());
    }

    /// FMOV Dd, Xn
    pub fn fmov_from_gpr(&mut self, rd: DReg, rn: Reg) {
        self.emit_raw(0x9E670000 | (rn.code() << 5) | rd.code());
    }

    /// FMOV Xd, Dn
    pub fn fmov_to_gpr(&mut self, rd: Reg, rn: DReg) {
        self.emit_raw(0x9E660000 | (rn.code() << 5) | rd.code());
    }

    /// SCVTF Dd, Xn
    pub fn scvtf(&mut self, rd: DReg, rn: Reg) {
        self.emit_raw(0x9E620000 | (rn.code() << 5) | rd.code());
    }

    /// FCVTZS Xd, Dn
    pub fn fcvtzs(&mut self, rd: Reg, rn: DReg) {
        self.emit_raw(0x9E780000 | (rn.code() << 5) | rd.code());
    }

    // ==================== Branches ====================

    /// B label. Returns the offset of the instruction.
    pub fn b(&mut self, offset: i32) -> usize {
        let site = self.offset();
        self.emit_raw(0x14000000 | (((offset / 4) as u32) & 0x03FFFFFF));
        site
    }

    /// B.cond label. Returns the offset of the instruction.
    pub fn b_cond(&mut self, cond: Cond, offset: i32) -> usize {
        let site = self.offset();
        self.emit_raw(0x54000000 | ((((offset / 4) as u32) & 0x7FFFF) << 5) | (cond as u32));
        site
    }

    /// CBZ Xn, label. Returns the offset of the instruction.
    pub fn cbz(&mut self, rn: Reg, offset: i32) -> usize {
        let site = self.offset();
        self.emit_raw(0xB4000000 | ((((offset / 4) as u32) & 0x7FFFF) << 5) | rn.code());
        site
    }

    /// CBNZ Xn, label. Returns the offset of the instruction.
    pub fn cbnz(&mut self, rn: Reg, offset: i32) -> usize {
        let site = self.offset();
        self.emit_raw(0xB5000000 | ((((offset / 4) as u32) & 0x7FFFF) << 5) | rn.code());
        site
    }

    /// BLR Xn
    pub fn blr(&mut self, rn: Reg) {
        self.emit_raw(0xD63F0000 | (rn.code() << 5));
    }

    /// RET (return to link register)
    pub fn ret(&mut self) {
        self.emit_raw(0xD65F03C0);
    }

    /// NOP
    pub fn nop(&mut self) {
        self.emit_raw(0xD503201F);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(f: impl FnOnce(&mut AArch64Assembler)) -> Vec<u32> {
        let mut buf = CodeBuffer::new();
        f(&mut AArch64Assembler::new(&mut buf));
        buf.code()
            .chunks(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_add() {
        assert_eq!(words(|a| a.add(Reg::X0, Reg::X1, Reg::X2)), [0x8B020020]);
    }

    #[test]
    fn test_csel() {
        assert_eq!(words(|a| a.csel(Reg::X0, Reg::X1, Reg::X2, Cond::Eq)), [0x9A820020]);
        // csel x3, x15, x3, vs
        assert_eq!(words(|a| a.csel(Reg::X3, Reg::X15, Reg::X3, Cond::Vs)), [0x9A8361E3]);
    }

    #[test]
    fn test_ret() {
        assert_eq!(words(|a| a.ret()), [0xD65F03C0]);
    }

    #[test]
    fn test_mov_imm64_sequences() {
        assert_eq!(words(|a| a.mov_imm64(Reg::X0, 42)), [0xD2800540]);
        // -1 is a single MOVN
        assert_eq!(words(|a| a.mov_imm64(Reg::X1, -1)), [0x92800001]);
        assert_eq!(words(|a| a.mov_imm64(Reg::X2, 0x1_0000_0001)).len(), 2);
        assert_eq!(AArch64Assembler::imm64_len(0x1234_5678_9ABC_DEF0), 4);
        assert_eq!(AArch64Assembler::imm64_len(0), 1);
        assert_eq!(AArch64Assembler::imm64_len(-2), 1);
    }

    #[test]
    fn test_loads_and_stores() {
        // ldr x0, [x29, #16]
        assert_eq!(words(|a| a.ldr(Reg::X0, Reg::Fp, 16)), [0xF9400BA0]);
        // str x1, [sp, #8]
        assert_eq!(words(|a| a.str(Reg::X1, Reg::Sp, 8)), [0xF90007E1]);
        // stp x29, x30, [sp, #-16]!
        assert_eq!(words(|a| a.stp_pre(Reg::Fp, Reg::Lr, -16)), [0xA9BF7BFD]);
        // ldr x0, [x1, x2, lsl #3]
        assert_eq!(words(|a| a.ldr_idx(Reg::X0, Reg::X1, Reg::X2)), [0xF8627820]);
    }

    #[test]
    fn test_float_ops() {
        // fadd d0, d1, d2
        assert_eq!(words(|a| a.fadd(DReg(0), DReg(1), DReg(2))), [0x1E622820]);
        // fcmp d8, d9
        assert_eq!(words(|a| a.fcmp(DReg(8), DReg(9))), [0x1E692100]);
        // scvtf d0, x1
        assert_eq!(words(|a| a.scvtf(DReg(0), Reg::X1)), [0x9E620020]);
    }

    #[test]
    fn test_cset_and_branches() {
        // cset x0, lt == csinc x0, xzr, xzr, ge
        assert_eq!(words(|a| a.cset(Reg::X0, Cond::Lt)), [0x9A9FA7E0]);
        let mut buf = CodeBuffer::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        asm.nop();
        assert_eq!(asm.b_cond(Cond::Eq, 8), 4);
        assert_eq!(buf.read_u32(4), Some(0x54000040));
    }
}
