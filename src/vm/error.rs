//! Runtime error taxonomy.

use thiserror::Error;

/// Call trace, innermost frame first.
pub type Trace = Vec<String>;

/// Fatal conditions raised while executing bytecode.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VmError {
    #[error("attempting to dereference a 'Nil' memory instance")]
    NilDereference { trace: Trace },

    #[error("index out of bounds: {index} < 0")]
    IndexUnderBounds { index: i64, trace: Trace },

    #[error("index out of bounds: {index} >= {bound}")]
    IndexOverBounds { index: i64, bound: i64, trace: Trace },

    #[error("attempting to divide by zero")]
    DivideByZero { trace: Trace },

    #[error("invalid object cast: '{from}' to '{to}'")]
    InvalidCast { from: String, to: String, trace: Trace },

    #[error("invalid array size {size}")]
    InvalidArraySize { size: i64, trace: Trace },

    #[error("operand stack overflow")]
    StackOverflow { trace: Trace },

    #[error("operand stack underflow")]
    StackUnderflow { trace: Trace },

    #[error("call stack exceeded {limit} frames")]
    CallDepthExceeded { limit: usize, trace: Trace },

    #[error("invalid method reference {class}:{method}")]
    InvalidMethod { class: i64, method: i64, trace: Trace },

    #[error("invalid class reference {class}")]
    InvalidClass { class: i64, trace: Trace },

    #[error("invalid jump target {target}")]
    InvalidJump { target: i64, trace: Trace },

    #[error("unknown trap code {code}")]
    UnknownTrap { code: i64, trace: Trace },

    #[error("unsupported instruction {op}")]
    Unsupported { op: String, trace: Trace },

    #[error("thread error: {message}")]
    Thread { message: String, trace: Trace },

    #[error("host resources exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("execution halted")]
    Halted,
}

impl VmError {
    pub fn nil() -> Self {
        VmError::NilDereference { trace: Vec::new() }
    }

    pub fn under(index: i64) -> Self {
        VmError::IndexUnderBounds {
            index,
            trace: Vec::new(),
        }
    }

    pub fn over(index: i64, bound: i64) -> Self {
        VmError::IndexOverBounds {
            index,
            bound,
            trace: Vec::new(),
        }
    }

    pub fn div_zero() -> Self {
        VmError::DivideByZero { trace: Vec::new() }
    }

    pub fn overflow() -> Self {
        VmError::StackOverflow { trace: Vec::new() }
    }

    pub fn underflow() -> Self {
        VmError::StackUnderflow { trace: Vec::new() }
    }

    pub fn thread(message: impl Into<String>) -> Self {
        VmError::Thread {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Maps a native status code to the fault it reports.
    pub fn from_status(status: i64) -> Option<Self> {
        match status {
            -1 => Some(VmError::nil()),
            -2 => Some(VmError::under(0)),
            -3 => Some(VmError::over(0, 0)),
            -4 => Some(VmError::div_zero()),
            -5 => Some(VmError::overflow()),
            _ => None,
        }
    }

    /// The native status code for faults compiled code can raise.
    pub fn status(&self) -> Option<i64> {
        match self {
            VmError::NilDereference { .. } => Some(-1),
            VmError::IndexUnderBounds { .. } => Some(-2),
            VmError::IndexOverBounds { .. } => Some(-3),
            VmError::DivideByZero { .. } => Some(-4),
            VmError::StackOverflow { .. } => Some(-5),
            _ => None,
        }
    }

    pub fn trace(&self) -> &[String] {
        match self {
            VmError::NilDereference { trace }
            | VmError::IndexUnderBounds { trace, .. }
            | VmError::IndexOverBounds { trace, .. }
            | VmError::DivideByZero { trace }
            | VmError::InvalidCast { trace, .. }
            | VmError::InvalidArraySize { trace, .. }
            | VmError::StackOverflow { trace }
            | VmError::StackUnderflow { trace }
            | VmError::CallDepthExceeded { trace, .. }
            | VmError::InvalidMethod { trace, .. }
            | VmError::InvalidClass { trace, .. }
            | VmError::InvalidJump { trace, .. }
            | VmError::UnknownTrap { trace, .. }
            | VmError::Unsupported { trace, .. }
            | VmError::Thread { trace, .. } => trace,
            VmError::ResourceExhausted { .. } | VmError::Halted => &[],
        }
    }

    fn trace_mut(&mut self) -> Option<&mut Trace> {
        match self {
            VmError::NilDereference { trace }
            | VmError::IndexUnderBounds { trace, .. }
            | VmError::IndexOverBounds { trace, .. }
            | VmError::DivideByZero { trace }
            | VmError::InvalidCast { trace, .. }
            | VmError::InvalidArraySize { trace, .. }
            | VmError::StackOverflow { trace }
            | VmError::StackUnderflow { trace }
            | VmError::CallDepthExceeded { trace, .. }
            | VmError::InvalidMethod { trace, .. }
            | VmError::InvalidClass { trace, .. }
            | VmError::InvalidJump { trace, .. }
            | VmError::UnknownTrap { trace, .. }
            | VmError::Unsupported { trace, .. }
            | VmError::Thread { trace, .. } => Some(trace),
            VmError::ResourceExhausted { .. } | VmError::Halted => None,
        }
    }

    /// Attaches the unwound call trace if none was recorded yet.
    pub fn with_trace(mut self, frames: Trace) -> Self {
        if let Some(slot) = self.trace_mut() {
            if slot.is_empty() {
                *slot = frames;
            }
        }
        self
    }

    /// Same fault class, ignoring operands and trace.
    pub fn same_kind(&self, other: &VmError) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
