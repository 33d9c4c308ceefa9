//! Target-neutral vocabulary between the code generator and the machine
//! backends.

use thiserror::Error;

use super::codebuf::CodeBuffer;
use super::fixup::{BranchSite, FixupError};
use super::regalloc::RegisterAllocator;

// =============================================================================
// Frame Layout
// =============================================================================
//
// Every compiled method gets a native frame of 8-byte slots:
//
//   0..11   entry arguments (see `Slot`)
//   11..17  integer spill slots
//   17..21  float spill slots
//   21..    locals, zeroed by the prologue

/// Fixed frame slots holding the entry arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Slot {
    ClsId = 0,
    MthdId = 1,
    ClsMem = 2,
    Instance = 3,
    OpStack = 4,
    StackPos = 5,
    Ctx = 6,
    CallPos = 7,
    JitMem = 8,
    JitWords = 9,
    Consts = 10,
}

impl Slot {
    pub const ENTRY_ORDER: [Slot; 11] = [
        Slot::ClsId,
        Slot::MthdId,
        Slot::ClsMem,
        Slot::Instance,
        Slot::OpStack,
        Slot::StackPos,
        Slot::Ctx,
        Slot::CallPos,
        Slot::JitMem,
        Slot::JitWords,
        Slot::Consts,
    ];

    pub fn index(self) -> u32 {
        self as u32
    }
}

pub const INT_SPILL_BASE: u32 = 11;
pub const INT_SPILL_SLOTS: u32 = 6;
pub const FLOAT_SPILL_BASE: u32 = INT_SPILL_BASE + INT_SPILL_SLOTS;
pub const FLOAT_SPILL_SLOTS: u32 = 4;
pub const LOCALS_BASE: u32 = FLOAT_SPILL_BASE + FLOAT_SPILL_SLOTS;

/// Byte offset of `ExecContext::stack_limit`.
pub const CTX_STACK_LIMIT: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub locals: u32,
}

impl FrameLayout {
    pub fn new(locals: u32) -> Self {
        Self { locals }
    }

    pub fn slots(&self) -> u32 {
        LOCALS_BASE + self.locals
    }

    pub fn local(&self, index: u32) -> u32 {
        LOCALS_BASE + index
    }
}

// =============================================================================
// Operands and Operations
// =============================================================================

/// Second operand of an integer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Src<G> {
    Reg(G),
    Imm(i64),
    /// A frame slot by index.
    Slot(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl IntOp {
    pub fn fold(self, left: i64, right: i64) -> i64 {
        match self {
            IntOp::Add => left.wrapping_add(right),
            IntOp::Sub => left.wrapping_sub(right),
            IntOp::Mul => left.wrapping_mul(right),
            IntOp::And => left & right,
            IntOp::Or => left | right,
            IntOp::Xor => left ^ right,
            IntOp::Shl => left.wrapping_shl(right as u32),
            IntOp::Shr => left.wrapping_shr(right as u32),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl FloatOp {
    pub fn fold(self, left: f64, right: f64) -> f64 {
        match self {
            FloatOp::Add => left + right,
            FloatOp::Sub => left - right,
            FloatOp::Mul => left * right,
            FloatOp::Div => left / right,
        }
    }
}

/// Signed integer comparison, `left OP right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl Cmp {
    pub fn invert(self) -> Self {
        match self {
            Cmp::Eq => Cmp::Ne,
            Cmp::Ne => Cmp::Eq,
            Cmp::Lt => Cmp::Ge,
            Cmp::Ge => Cmp::Lt,
            Cmp::Gt => Cmp::Le,
            Cmp::Le => Cmp::Gt,
        }
    }

    /// The comparison with its operands exchanged.
    pub fn swap(self) -> Self {
        match self {
            Cmp::Lt => Cmp::Gt,
            Cmp::Gt => Cmp::Lt,
            Cmp::Le => Cmp::Ge,
            Cmp::Ge => Cmp::Le,
            other => other,
        }
    }

    pub fn eval(self, left: i64, right: i64) -> bool {
        match self {
            Cmp::Eq => left == right,
            Cmp::Ne => left != right,
            Cmp::Lt => left < right,
            Cmp::Gt => left > right,
            Cmp::Le => left <= right,
            Cmp::Ge => left >= right,
        }
    }
}

/// Float comparison with IEEE semantics: every relation except `Ne` is
/// false when an operand is NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCmp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl FCmp {
    pub fn eval(self, left: f64, right: f64) -> bool {
        match self {
            FCmp::Eq => left == right,
            FCmp::Ne => left != right,
            FCmp::Lt => left < right,
            FCmp::Gt => left > right,
            FCmp::Le => left <= right,
            FCmp::Ge => left >= right,
        }
    }
}

/// Memory access width for array elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    /// 32-bit code point
    Char,
    Word,
}

// =============================================================================
// Errors
// =============================================================================

/// Reasons a method is left to the interpreter.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unsupported instruction {op} at {ip}")]
    Unsupported { op: String, ip: usize },
    #[error("operand stack not empty at {ip} ({reason})")]
    StackShape { ip: usize, reason: &'static str },
    #[error("jump at {ip} targets {target}, which is not a label")]
    BadJumpTarget { ip: usize, target: i64 },
    #[error("unknown callee {class}:{method} at {ip}")]
    UnknownCallee { class: i64, method: i64, ip: usize },
    #[error("out of registers")]
    RegistersExhausted,
    #[error("too many live values across a runtime call at {ip}")]
    SpillOverflow { ip: usize },
    #[error("constant pool full")]
    ConstPoolFull,
    #[error("no backend for target {0}")]
    NoBackend(String),
    #[error(transparent)]
    Fixup(#[from] FixupError),
}

// =============================================================================
// Backend
// =============================================================================

/// Status returned by the normal exit stub.
pub const EXIT_STATUS: i64 = 0;

/// Machine-specific instruction selection.
///
/// Scratch registers are private to the backend: every method may clobber
/// them, and none of them is ever handed out by the allocators.
pub trait Backend {
    type Gpr: Copy + Eq + std::fmt::Debug;
    type Fpr: Copy + Eq + std::fmt::Debug;

    fn int_allocator(&self) -> RegisterAllocator<Self::Gpr>;
    fn float_allocator(&self) -> RegisterAllocator<Self::Fpr>;

    fn buffer(&mut self) -> &mut CodeBuffer;

    fn offset(&self) -> usize;

    /// Saves callee-saved state, stores the entry arguments into their
    /// slots, publishes the locals region and zeroes the locals.
    fn prologue(&mut self, layout: &FrameLayout);

    /// Loads `status` as the return value and jumps to the teardown.
    fn status_stub(&mut self, status: i64) -> BranchSite;

    /// Restores callee-saved state and returns.
    fn teardown(&mut self, layout: &FrameLayout);

    fn jump(&mut self) -> BranchSite;

    fn load_imm(&mut self, dst: Self::Gpr, imm: i64);
    fn load_float_imm(&mut self, dst: Self::Fpr, value: f64) -> Result<(), CompileError>;
    fn mov(&mut self, dst: Self::Gpr, src: Self::Gpr);
    fn fmov(&mut self, dst: Self::Fpr, src: Self::Fpr);

    fn int_op(&mut self, op: IntOp, dst: Self::Gpr, src: Src<Self::Gpr>);
    fn not(&mut self, dst: Self::Gpr);
    /// `dst = dst / src` or `dst % src`, wrapping on `MIN / -1`. The
    /// returned site is taken when `src` is zero.
    fn div(&mut self, dst: Self::Gpr, src: Src<Self::Gpr>, rem: bool) -> BranchSite;

    fn cmp(&mut self, left: Self::Gpr, right: Src<Self::Gpr>);
    /// Materializes the flags of the last `cmp` as 0 or 1.
    fn set_cond(&mut self, dst: Self::Gpr, cond: Cmp);
    fn branch(&mut self, cond: Cmp) -> BranchSite;

    fn fcmp_set(&mut self, dst: Self::Gpr, left: Self::Fpr, right: Self::Fpr, cond: FCmp);
    /// Branches when `(left cond right) == when`.
    fn fcmp_branch(
        &mut self,
        left: Self::Fpr,
        right: Self::Fpr,
        cond: FCmp,
        when: bool,
    ) -> Vec<BranchSite>;

    fn float_op(&mut self, op: FloatOp, dst: Self::Fpr, src: Self::Fpr);
    /// Taken when `src` compares equal to zero; never taken for NaN.
    fn fdiv_zero_check(&mut self, src: Self::Fpr) -> BranchSite;
    fn i2f(&mut self, dst: Self::Fpr, src: Self::Gpr);
    fn f2i(&mut self, dst: Self::Gpr, src: Self::Fpr);
    fn int_to_float_bits(&mut self, dst: Self::Fpr, src: Self::Gpr);
    fn float_bits_to_int(&mut self, dst: Self::Gpr, src: Self::Fpr);

    fn load(&mut self, dst: Self::Gpr, base: Self::Gpr, disp: i32, width: Width);
    fn store(&mut self, base: Self::Gpr, disp: i32, width: Width, src: Src<Self::Gpr>);
    fn fload(&mut self, dst: Self::Fpr, base: Self::Gpr, disp: i32);
    fn fstore(&mut self, base: Self::Gpr, disp: i32, src: Self::Fpr);

    fn load_slot(&mut self, dst: Self::Gpr, slot: u32);
    fn store_slot(&mut self, slot: u32, src: Src<Self::Gpr>);
    fn fload_slot(&mut self, dst: Self::Fpr, slot: u32);
    fn fstore_slot(&mut self, slot: u32, src: Self::Fpr);

    /// Taken when `reg` is nil.
    fn nil_check(&mut self, reg: Self::Gpr) -> BranchSite;
    /// Sites taken for `index < 0` and `index >= array[0]`.
    fn bounds_check(&mut self, index: Self::Gpr, array: Self::Gpr) -> (BranchSite, BranchSite);
    /// `index *= extent i of array`
    fn mul_extent(&mut self, index: Self::Gpr, array: Self::Gpr, dim: usize);
    /// `index = array + payload_disp + (index << shift)`
    fn index_address(&mut self, index: Self::Gpr, array: Self::Gpr, shift: u8, payload_disp: i32);

    fn op_stack_push(&mut self, src: Src<Self::Gpr>);
    fn op_stack_push_float(&mut self, src: Self::Fpr);
    fn op_stack_pop(&mut self, dst: Self::Gpr);
    fn op_stack_pop_float(&mut self, dst: Self::Fpr);
    fn op_stack_drop(&mut self);
    /// Checks that `words` more operand stack words fit under the context's
    /// limit. Returns the patch point for [`Backend::patch_reserve`] and the
    /// site taken when they do not.
    fn op_stack_reserve(&mut self, words: u32) -> (usize, BranchSite);
    /// Rewrites the word count of an earlier reservation.
    fn patch_reserve(&mut self, at: usize, words: u32);

    /// Calls the runtime bridge for the instruction at `instr`, then
    /// returns the site taken when the context's halt word is set.
    fn call_bridge(&mut self, tag: i64, instr: i64, ip: i64) -> BranchSite;

    /// Hands back the code and the literal pool it references.
    fn finish(self) -> (CodeBuffer, Box<[u64]>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let layout = FrameLayout::new(3);
        assert_eq!(layout.local(0), 21);
        assert_eq!(layout.slots(), 24);
        assert_eq!(FLOAT_SPILL_BASE, 17);
        assert_eq!(Slot::Consts.index(), 10);
    }

    #[test]
    fn test_cmp_swap_and_invert() {
        for cmp in [Cmp::Eq, Cmp::Ne, Cmp::Lt, Cmp::Gt, Cmp::Le, Cmp::Ge] {
            for (a, b) in [(1, 2), (2, 1), (3, 3)] {
                assert_eq!(cmp.eval(a, b), cmp.swap().eval(b, a));
                assert_eq!(cmp.eval(a, b), !cmp.invert().eval(a, b));
            }
        }
    }

    #[test]
    fn test_fcmp_nan_is_unordered() {
        assert!(FCmp::Ne.eval(f64::NAN, f64::NAN));
        assert!(!FCmp::Ge.eval(f64::NAN, 1.0));
        assert!(!FCmp::Eq.eval(0.0, f64::NAN));
    }
}
