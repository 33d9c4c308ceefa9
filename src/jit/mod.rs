//! Per-method JIT compiler.
//!
//! Bytecode is translated in a single pass over a symbolic operand stack
//! ([`codegen`]) into machine code produced by one of the [`backend`]
//! implementations, then installed into append-only executable slabs
//! ([`memory`]).
//!
//! This module is only compiled when the `jit` feature is enabled.

pub mod aarch64;
pub mod amd64;
pub mod arm64;
pub mod backend;
mod codebuf;
pub mod codegen;
pub mod compiler;
pub mod fixup;
mod memory;
pub mod regalloc;
pub mod x86_64;

pub use backend::CompileError;
pub use codebuf::CodeBuffer;
pub use compiler::{Listing, compile_method, dump, generate, hex_listing};
pub use memory::{MemoryError, PageManager};
