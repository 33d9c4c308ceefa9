//! stackjit - a stack bytecode VM with a per-method JIT.
//!
//! Programs are built in memory (see [`vm::asm`] and [`samples`]) and run by
//! an interpreter that hands methods to the JIT once they qualify. Compiled
//! and interpreted frames share one operand stack and reach the runtime
//! through the same bridge, so they can call each other freely.

pub mod config;
#[cfg(feature = "jit")]
pub mod jit;
pub mod samples;
pub mod vm;

pub use config::{JitMode, OnFault, RuntimeConfig, Target};
pub use vm::{ExecContext, Program, Runtime, VmError};
