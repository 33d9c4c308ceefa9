pub mod asm;
pub mod bridge;
pub mod bytecode;
pub mod error;
pub mod heap;
mod interpreter;
pub mod program;
pub mod runtime;
pub mod stack;
pub mod threads;

pub use bytecode::{Instruction, MemoryContext, Opcode, TrapCode};
pub use error::{Trace, VmError};
pub use heap::{ElemKind, Handle, Heap};
pub use program::{Class, CompileOutcome, CompiledBody, Method, Program, ReturnKind};
pub use runtime::{ExecContext, Runtime};
pub use stack::OperandStack;
