//! Bytecode instruction model shared by the interpreter and the JIT.
//!
//! Instructions are immutable once a program is built. Binary operations pop
//! the right operand (top of stack) first, then the left one.

use std::fmt;

/// Where a variable instruction reads or writes its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryContext {
    /// Static class memory, handle popped from the operand stack.
    Class,
    /// Instance memory, handle popped from the operand stack.
    Instance,
    /// The current frame's locals.
    Local,
}

/// Bytecode operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ========================================
    // Loads
    // ========================================
    LoadIntLit,
    LoadCharLit,
    LoadFloatLit,
    LoadIntVar,
    LoadLoclIntVar,
    LoadClsInstIntVar,
    LoadFloatVar,
    LoadFuncVar,
    LoadClsMem,
    LoadInstMem,

    // ========================================
    // Stores and copies
    // ========================================
    StorIntVar,
    StorLoclIntVar,
    StorClsInstIntVar,
    StorFloatVar,
    StorFuncVar,
    CopyIntVar,
    CopyLoclIntVar,
    CopyClsInstIntVar,
    CopyFloatVar,

    // ========================================
    // Arrays
    // ========================================
    LoadByteAryElm,
    LoadCharAryElm,
    LoadIntAryElm,
    LoadFloatAryElm,
    StorByteAryElm,
    StorCharAryElm,
    StorIntAryElm,
    StorFloatAryElm,
    LoadArySize,

    // ========================================
    // Comparisons
    // ========================================
    EqlInt,
    NeqlInt,
    LesInt,
    GtrInt,
    LesEqlInt,
    GtrEqlInt,
    EqlFloat,
    NeqlFloat,
    LesFloat,
    GtrFloat,
    LesEqlFloat,
    GtrEqlFloat,

    // ========================================
    // Integer arithmetic
    // ========================================
    AndInt,
    OrInt,
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    ModInt,
    BitAndInt,
    BitOrInt,
    BitXorInt,
    BitNotInt,
    ShlInt,
    ShrInt,

    // ========================================
    // Float arithmetic
    // ========================================
    AddFloat,
    SubFloat,
    MulFloat,
    DivFloat,
    FlorFloat,
    CeilFloat,
    SinFloat,
    CosFloat,
    TanFloat,
    AsinFloat,
    AcosFloat,
    AtanFloat,
    Atan2Float,
    ModFloat,
    LogFloat,
    PowFloat,
    SqrtFloat,
    RandFloat,

    // ========================================
    // Conversions
    // ========================================
    I2F,
    F2I,
    S2I,
    S2F,
    I2S,
    F2S,

    // ========================================
    // Control
    // ========================================
    MthdCall,
    DynMthdCall,
    Jmp,
    Lbl,
    Rtrn,

    // ========================================
    // Allocation and bulk memory
    // ========================================
    NewByteAry,
    NewCharAry,
    NewIntAry,
    NewFloatAry,
    NewObjInst,
    NewFuncInst,
    CpyByteAry,
    CpyCharAry,
    CpyIntAry,
    CpyFloatAry,
    ZeroByteAry,
    ZeroCharAry,
    ZeroIntAry,
    ZeroFloatAry,

    // ========================================
    // Casts and traps
    // ========================================
    ObjInstCast,
    ObjTypeOf,
    Trap,
    TrapRtrn,

    // ========================================
    // Stack
    // ========================================
    SwapInt,
    PopInt,
    PopFloat,

    // ========================================
    // Threads
    // ========================================
    AsyncMthdCall,
    ThreadJoin,
    ThreadSleep,
    ThreadMutex,
    CriticalStart,
    CriticalEnd,
}

/// Value kind produced by an operation that goes through the runtime bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Produces {
    Nothing,
    Int,
    Float,
}

impl Opcode {
    /// Every opcode, in declaration order. Used for the bridge tag table.
    pub const ALL: &'static [Opcode] = &[
        Opcode::LoadIntLit,
        Opcode::LoadCharLit,
        Opcode::LoadFloatLit,
        Opcode::LoadIntVar,
        Opcode::LoadLoclIntVar,
        Opcode::LoadClsInstIntVar,
        Opcode::LoadFloatVar,
        Opcode::LoadFuncVar,
        Opcode::LoadClsMem,
        Opcode::LoadInstMem,
        Opcode::StorIntVar,
        Opcode::StorLoclIntVar,
        Opcode::StorClsInstIntVar,
        Opcode::StorFloatVar,
        Opcode::StorFuncVar,
        Opcode::CopyIntVar,
        Opcode::CopyLoclIntVar,
        Opcode::CopyClsInstIntVar,
        Opcode::CopyFloatVar,
        Opcode::LoadByteAryElm,
        Opcode::LoadCharAryElm,
        Opcode::LoadIntAryElm,
        Opcode::LoadFloatAryElm,
        Opcode::StorByteAryElm,
        Opcode::StorCharAryElm,
        Opcode::StorIntAryElm,
        Opcode::StorFloatAryElm,
        Opcode::LoadArySize,
        Opcode::EqlInt,
        Opcode::NeqlInt,
        Opcode::LesInt,
        Opcode::GtrInt,
        Opcode::LesEqlInt,
        Opcode::GtrEqlInt,
        Opcode::EqlFloat,
        Opcode::NeqlFloat,
        Opcode::LesFloat,
        Opcode::GtrFloat,
        Opcode::LesEqlFloat,
        Opcode::GtrEqlFloat,
        Opcode::AndInt,
        Opcode::OrInt,
        Opcode::AddInt,
        Opcode::SubInt,
        Opcode::MulInt,
        Opcode::DivInt,
        Opcode::ModInt,
        Opcode::BitAndInt,
        Opcode::BitOrInt,
        Opcode::BitXorInt,
        Opcode::BitNotInt,
        Opcode::ShlInt,
        Opcode::ShrInt,
        Opcode::AddFloat,
        Opcode::SubFloat,
        Opcode::MulFloat,
        Opcode::DivFloat,
        Opcode::FlorFloat,
        Opcode::CeilFloat,
        Opcode::SinFloat,
        Opcode::CosFloat,
        Opcode::TanFloat,
        Opcode::AsinFloat,
        Opcode::AcosFloat,
        Opcode::AtanFloat,
        Opcode::Atan2Float,
        Opcode::ModFloat,
        Opcode::LogFloat,
        Opcode::PowFloat,
        Opcode::SqrtFloat,
        Opcode::RandFloat,
        Opcode::I2F,
        Opcode::F2I,
        Opcode::S2I,
        Opcode::S2F,
        Opcode::I2S,
        Opcode::F2S,
        Opcode::MthdCall,
        Opcode::DynMthdCall,
        Opcode::Jmp,
        Opcode::Lbl,
        Opcode::Rtrn,
        Opcode::NewByteAry,
        Opcode::NewCharAry,
        Opcode::NewIntAry,
        Opcode::NewFloatAry,
        Opcode::NewObjInst,
        Opcode::NewFuncInst,
        Opcode::CpyByteAry,
        Opcode::CpyCharAry,
        Opcode::CpyIntAry,
        Opcode::CpyFloatAry,
        Opcode::ZeroByteAry,
        Opcode::ZeroCharAry,
        Opcode::ZeroIntAry,
        Opcode::ZeroFloatAry,
        Opcode::ObjInstCast,
        Opcode::ObjTypeOf,
        Opcode::Trap,
        Opcode::TrapRtrn,
        Opcode::SwapInt,
        Opcode::PopInt,
        Opcode::PopFloat,
        Opcode::AsyncMthdCall,
        Opcode::ThreadJoin,
        Opcode::ThreadSleep,
        Opcode::ThreadMutex,
        Opcode::CriticalStart,
        Opcode::CriticalEnd,
    ];

    /// Numeric tag passed across the native bridge.
    pub fn tag(self) -> i64 {
        self as i64
    }

    /// Inverse of [`Opcode::tag`].
    pub fn from_tag(tag: i64) -> Option<Opcode> {
        usize::try_from(tag).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    /// Is this an integer comparison?
    pub fn is_int_compare(self) -> bool {
        matches!(
            self,
            Opcode::EqlInt
                | Opcode::NeqlInt
                | Opcode::LesInt
                | Opcode::GtrInt
                | Opcode::LesEqlInt
                | Opcode::GtrEqlInt
        )
    }

    /// Is this a float comparison?
    pub fn is_float_compare(self) -> bool {
        matches!(
            self,
            Opcode::EqlFloat
                | Opcode::NeqlFloat
                | Opcode::LesFloat
                | Opcode::GtrFloat
                | Opcode::LesEqlFloat
                | Opcode::GtrEqlFloat
        )
    }

    /// Operations that are executed by the runtime bridge from both engines.
    /// Returns the fixed number of operand stack words they consume and what
    /// they push. Calls are handled separately since their arity comes from
    /// the callee.
    pub fn bridge_shape(self, operand: i64) -> Option<(usize, Produces)> {
        use Opcode::*;
        let shape = match self {
            LoadArySize => (1, Produces::Int),
            RandFloat => (0, Produces::Float),
            FlorFloat | CeilFloat | SinFloat | CosFloat | TanFloat | AsinFloat | AcosFloat
            | AtanFloat | LogFloat | SqrtFloat => (1, Produces::Float),
            Atan2Float | ModFloat | PowFloat => (2, Produces::Float),
            NewByteAry | NewCharAry | NewIntAry | NewFloatAry => {
                (usize::try_from(operand).unwrap_or(0), Produces::Int)
            }
            NewObjInst | NewFuncInst => (0, Produces::Int),
            CpyByteAry | CpyCharAry | CpyIntAry | CpyFloatAry => (5, Produces::Int),
            ZeroByteAry | ZeroCharAry | ZeroIntAry | ZeroFloatAry => (1, Produces::Nothing),
            ObjInstCast | ObjTypeOf => (1, Produces::Int),
            I2S => (3, Produces::Nothing),
            F2S => (2, Produces::Nothing),
            S2I => (2, Produces::Int),
            S2F => (1, Produces::Float),
            ThreadJoin | ThreadMutex | CriticalStart | CriticalEnd | ThreadSleep => {
                (1, Produces::Nothing)
            }
            AsyncMthdCall => (2, Produces::Nothing),
            Trap => (usize::try_from(operand).unwrap_or(0), Produces::Nothing),
            TrapRtrn => (usize::try_from(operand).unwrap_or(0), Produces::Int),
            _ => return None,
        };
        Some(shape)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Trap codes understood by `TRAP` / `TRAP_RTRN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum TrapCode {
    StdOutInt = 0,
    StdOutFloat = 1,
    StdOutChar = 2,
    StdOutString = 3,
    StdOutNewline = 4,
    SysTimeMillis = 5,
}

impl TrapCode {
    pub fn from_i64(code: i64) -> Option<Self> {
        Some(match code {
            0 => TrapCode::StdOutInt,
            1 => TrapCode::StdOutFloat,
            2 => TrapCode::StdOutChar,
            3 => TrapCode::StdOutString,
            4 => TrapCode::StdOutNewline,
            5 => TrapCode::SysTimeMillis,
            _ => return None,
        })
    }
}

/// One bytecode operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub operand: i64,
    pub operand2: i64,
    pub operand3: i64,
    pub float_operand: f64,
}

impl Instruction {
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            operand: 0,
            operand2: 0,
            operand3: 0,
            float_operand: 0.0,
        }
    }

    pub fn with(op: Opcode, operand: i64) -> Self {
        Self {
            operand,
            ..Self::new(op)
        }
    }

    pub fn with2(op: Opcode, operand: i64, operand2: i64) -> Self {
        Self {
            operand,
            operand2,
            ..Self::new(op)
        }
    }

    pub fn with3(op: Opcode, operand: i64, operand2: i64, operand3: i64) -> Self {
        Self {
            operand,
            operand2,
            operand3,
            ..Self::new(op)
        }
    }

    pub fn float(value: f64) -> Self {
        Self {
            float_operand: value,
            ..Self::new(Opcode::LoadFloatLit)
        }
    }

    /// The memory context of a variable instruction.
    pub fn context(&self) -> MemoryContext {
        match self.op {
            Opcode::LoadLoclIntVar | Opcode::StorLoclIntVar | Opcode::CopyLoclIntVar => {
                MemoryContext::Local
            }
            Opcode::LoadClsInstIntVar | Opcode::StorClsInstIntVar | Opcode::CopyClsInstIntVar => {
                MemoryContext::Instance
            }
            _ => match self.operand2 {
                CONTEXT_CLASS => MemoryContext::Class,
                CONTEXT_INSTANCE => MemoryContext::Instance,
                _ => MemoryContext::Local,
            },
        }
    }
}

/// Encodings of [`MemoryContext`] in `operand2`.
pub const CONTEXT_CLASS: i64 = -3500;
pub const CONTEXT_INSTANCE: i64 = -3499;
pub const CONTEXT_LOCAL: i64 = -3498;

impl MemoryContext {
    pub fn encode(self) -> i64 {
        match self {
            MemoryContext::Class => CONTEXT_CLASS,
            MemoryContext::Instance => CONTEXT_INSTANCE,
            MemoryContext::Local => CONTEXT_LOCAL,
        }
    }
}

/// `F2I` truncates toward zero. NaN and values outside the `i64` range give
/// `i64::MIN`, the integer indefinite value of x86 `cvttsd2si`.
pub fn f2i(value: f64) -> i64 {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if value.is_nan() || !(-LIMIT..LIMIT).contains(&value) {
        i64::MIN
    } else {
        value as i64
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Opcode::LoadFloatLit => write!(f, "{} {}", self.op, self.float_operand),
            _ => write!(
                f,
                "{} {} {} {}",
                self.op, self.operand, self.operand2, self.operand3
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip_covers_every_opcode() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(op.tag(), i as i64, "{op} out of order");
            assert_eq!(Opcode::from_tag(op.tag()), Some(*op));
        }
        assert_eq!(Opcode::from_tag(-1), None);
        assert_eq!(Opcode::from_tag(Opcode::ALL.len() as i64), None);
    }

    #[test]
    fn test_f2i_out_of_range() {
        assert_eq!(f2i(-7.9), -7);
        assert_eq!(f2i(1e300), i64::MIN);
        assert_eq!(f2i(-1e300), i64::MIN);
        assert_eq!(f2i(f64::NAN), i64::MIN);
        assert_eq!(f2i(f64::INFINITY), i64::MIN);
        assert_eq!(f2i(9_223_372_036_854_775_808.0), i64::MIN);
        // -2^63 itself is representable
        assert_eq!(f2i(-9_223_372_036_854_775_808.0), i64::MIN);
        assert_eq!(f2i(9_223_372_036_854_774_784.0), 9_223_372_036_854_774_784);
    }

    #[test]
    fn test_context_decoding() {
        let load = Instruction::with2(Opcode::LoadIntVar, 3, MemoryContext::Instance.encode());
        assert_eq!(load.context(), MemoryContext::Instance);
        let local = Instruction::with(Opcode::LoadLoclIntVar, 0);
        assert_eq!(local.context(), MemoryContext::Local);
        let cls = Instruction::with2(Opcode::StorFloatVar, 1, CONTEXT_CLASS);
        assert_eq!(cls.context(), MemoryContext::Class);
    }

    #[test]
    fn test_bridge_shape() {
        assert_eq!(
            Opcode::NewIntAry.bridge_shape(2),
            Some((2, Produces::Int))
        );
        assert_eq!(Opcode::CpyIntAry.bridge_shape(0), Some((5, Produces::Int)));
        assert_eq!(Opcode::AddInt.bridge_shape(0), None);
        assert_eq!(Opcode::MthdCall.bridge_shape(0), None);
    }
}
