//! Branch fixups.
//!
//! Code is emitted in one pass, so most branches are written before their
//! target is known. Each one records a [`BranchSite`] against a
//! [`JumpTarget`]; once every target is bound the table patches the sites.

use std::collections::HashMap;

use thiserror::Error;

use super::codebuf::CodeBuffer;

/// Faults compiled code reports through its return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    Nil,
    Under,
    Over,
    DivZero,
    /// The operand stack would grow past its capacity.
    StackOverflow,
}

impl FaultKind {
    pub const ALL: [FaultKind; 5] = [
        FaultKind::Nil,
        FaultKind::Under,
        FaultKind::Over,
        FaultKind::DivZero,
        FaultKind::StackOverflow,
    ];

    /// Status returned by the fault stub.
    pub fn status(self) -> i64 {
        match self {
            FaultKind::Nil => -1,
            FaultKind::Under => -2,
            FaultKind::Over => -3,
            FaultKind::DivZero => -4,
            FaultKind::StackOverflow => -5,
        }
    }
}

/// Where a branch goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpTarget {
    /// A bytecode instruction, always a label.
    Instruction(usize),
    Fault(FaultKind),
    /// The normal exit stub.
    Exit,
    /// Shared epilogue after the stubs.
    Teardown,
}

/// How the displacement is encoded at a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    /// x86-64 rel32 field; relative to the end of the field.
    Rel32,
    /// AArch64 `B`: imm26 words, relative to the instruction.
    A64Imm26,
    /// AArch64 `B.cond`, `CBZ`, `CBNZ`: imm19 words at bit 5.
    A64Imm19,
}

/// A displacement waiting to be patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchSite {
    pub at: usize,
    pub kind: SiteKind,
}

impl BranchSite {
    pub fn rel32(at: usize) -> Self {
        Self {
            at,
            kind: SiteKind::Rel32,
        }
    }

    pub fn imm26(at: usize) -> Self {
        Self {
            at,
            kind: SiteKind::A64Imm26,
        }
    }

    pub fn imm19(at: usize) -> Self {
        Self {
            at,
            kind: SiteKind::A64Imm19,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixupError {
    #[error("branch target {0:?} was never bound")]
    Unbound(JumpTarget),
    #[error("branch at {at:#x} cannot reach {target:#x}")]
    OutOfRange { at: usize, target: usize },
    #[error("branch site {0:#x} lies outside the code")]
    BadSite(usize),
}

#[derive(Debug, Default)]
pub struct FixupTable {
    sites: Vec<(BranchSite, JumpTarget)>,
    bound: HashMap<JumpTarget, usize>,
}

impl FixupTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, site: BranchSite, target: JumpTarget) {
        self.sites.push((site, target));
    }

    /// Records the code offset of `target`. The first binding wins.
    pub fn bind(&mut self, target: JumpTarget, offset: usize) {
        self.bound.entry(target).or_insert(offset);
    }

    pub fn offset_of(&self, target: JumpTarget) -> Option<usize> {
        self.bound.get(&target).copied()
    }

    pub fn pending(&self) -> usize {
        self.sites.len()
    }

    /// Patches every recorded site.
    pub fn resolve(&self, buf: &mut CodeBuffer) -> Result<(), FixupError> {
        for &(site, target) in &self.sites {
            let dest = self.offset_of(target).ok_or(FixupError::Unbound(target))?;
            patch(buf, site, dest)?;
        }
        Ok(())
    }
}

fn patch(buf: &mut CodeBuffer, site: BranchSite, dest: usize) -> Result<(), FixupError> {
    let out_of_range = FixupError::OutOfRange {
        at: site.at,
        target: dest,
    };
    let word = match site.kind {
        SiteKind::Rel32 => {
            let disp = dest as i64 - (site.at as i64 + 4);
            i32::try_from(disp).map_err(|_| out_of_range)? as u32
        }
        SiteKind::A64Imm26 | SiteKind::A64Imm19 => {
            let words = (dest as i64 - site.at as i64) / 4;
            let bits = if site.kind == SiteKind::A64Imm26 { 26 } else { 19 };
            let limit = 1i64 << (bits - 1);
            if !(-limit..limit).contains(&words) {
                return Err(out_of_range);
            }
            let field = (words as u32) & ((1u32 << bits) - 1);
            let inst = buf.read_u32(site.at).ok_or(FixupError::BadSite(site.at))?;
            if bits == 26 {
                (inst & !0x03FF_FFFF) | field
            } else {
                (inst & !(0x7FFFF << 5)) | (field << 5)
            }
        }
    };
    if buf.patch_u32(site.at, word) {
        Ok(())
    } else {
        Err(FixupError::BadSite(site.at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::aarch64::{AArch64Assembler, Cond as A64Cond};
    use crate::jit::x86_64::X86_64Assembler;

    #[test]
    fn test_forward_and_backward_rel32() {
        let mut buf = CodeBuffer::new();
        let mut table = FixupTable::new();
        let loop_head = buf.offset();
        table.bind(JumpTarget::Instruction(0), loop_head);
        let mut asm = X86_64Assembler::new(&mut buf);
        let back = asm.jmp_rel32(0);
        let fwd = asm.jmp_rel32(0);
        let exit = asm.offset();
        table.add(BranchSite::rel32(back), JumpTarget::Instruction(0));
        table.add(BranchSite::rel32(fwd), JumpTarget::Exit);
        table.bind(JumpTarget::Exit, exit);
        table.resolve(&mut buf).unwrap();

        // each branch lands exactly on its bound offset
        let disp = |at: usize| buf.read_u32(at).unwrap() as i32 as i64;
        assert_eq!(back as i64 + 4 + disp(back), loop_head as i64);
        assert_eq!(fwd as i64 + 4 + disp(fwd), exit as i64);
    }

    #[test]
    fn test_aarch64_sites_keep_opcode_bits() {
        let mut buf = CodeBuffer::new();
        let mut table = FixupTable::new();
        let mut asm = AArch64Assembler::new(&mut buf);
        let cond = asm.b_cond(A64Cond::Ne, 0);
        asm.nop();
        let back = asm.b(0);
        table.add(BranchSite::imm19(cond), JumpTarget::Fault(FaultKind::Nil));
        table.add(BranchSite::imm26(back), JumpTarget::Instruction(3));
        table.bind(JumpTarget::Fault(FaultKind::Nil), 12);
        table.bind(JumpTarget::Instruction(3), 0);
        table.resolve(&mut buf).unwrap();

        assert_eq!(buf.read_u32(cond), Some(0x54000000 | (3 << 5) | 1));
        // -2 words
        assert_eq!(buf.read_u32(back), Some(0x14000000 | 0x03FF_FFFE));
    }

    #[test]
    fn test_unbound_target_fails() {
        let mut buf = CodeBuffer::new();
        buf.emit_u32(0);
        let mut table = FixupTable::new();
        table.add(BranchSite::rel32(0), JumpTarget::Instruction(9));
        assert_eq!(
            table.resolve(&mut buf),
            Err(FixupError::Unbound(JumpTarget::Instruction(9)))
        );
    }

    #[test]
    fn test_fault_statuses() {
        let statuses: Vec<_> = FaultKind::ALL.iter().map(|k| k.status()).collect();
        assert_eq!(statuses, vec![-1, -2, -3, -4, -5]);
    }
}
