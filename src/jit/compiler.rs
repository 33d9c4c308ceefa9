//! Per-method compilation: backend selection, installation and listings.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::amd64::{Abi, Amd64};
use super::arm64::{Arm64, MAX_FRAME_SLOTS};
use super::backend::{CompileError, FrameLayout};
use super::codebuf::CodeBuffer;
use super::codegen::CodeGenerator;
use super::memory::MemoryError;
use crate::config::Target;
use crate::vm::error::VmError;
use crate::vm::program::{CompileOutcome, CompiledBody, Method, NativeEntry, Program};
use crate::vm::runtime::Runtime;

/// Generates code for `method` without installing it.
pub fn generate(
    program: &Program,
    method: &Method,
    target: Target,
) -> Result<(CodeBuffer, Box<[u64]>), CompileError> {
    let layout = FrameLayout::new(method.local_words as u32);
    match target.resolve() {
        Some(Target::X86_64Sysv) => {
            CodeGenerator::new(Amd64::new(Abi::SysV), program, method).generate()
        }
        Some(Target::X86_64Win64) => {
            CodeGenerator::new(Amd64::new(Abi::Win64), program, method).generate()
        }
        Some(Target::Aarch64) if layout.slots() > MAX_FRAME_SLOTS => {
            Err(CompileError::Unsupported {
                op: format!("frame of {} slots", layout.slots()),
                ip: 0,
            })
        }
        Some(Target::Aarch64) => CodeGenerator::new(Arm64::new(), program, method).generate(),
        Some(Target::Host) | None => Err(CompileError::NoBackend(format!("{:?}", target))),
    }
}

/// Compiles `method` for the configured target and installs it.
///
/// Anything the code generator rejects becomes a soft
/// [`CompileOutcome::Failed`]; only running out of executable memory is
/// an error.
pub fn compile_method(
    runtime: &Arc<Runtime>,
    method: &Arc<Method>,
) -> Result<CompileOutcome, VmError> {
    let config = runtime.config();
    let name = method.qualified_name(runtime.program());

    let (code, consts) = match generate(runtime.program(), method, config.target) {
        Ok(generated) => generated,
        Err(err) => {
            warn!(method = %name, error = %err, "compilation failed");
            return Ok(CompileOutcome::Failed(err.to_string()));
        }
    };

    let ptr = match runtime.pages().install(code.code()) {
        Ok(ptr) => ptr,
        Err(MemoryError::Unsupported) => {
            return Ok(CompileOutcome::Failed(MemoryError::Unsupported.to_string()));
        }
        Err(err) => {
            return Err(VmError::ResourceExhausted {
                message: err.to_string(),
            });
        }
    };
    // SAFETY: `ptr` is the start of the code just installed, which was
    // generated for exactly the `NativeEntry` signature and stays mapped for
    // the life of the process.
    let entry = unsafe { std::mem::transmute::<*const u8, NativeEntry>(ptr) };

    debug!(method = %name, bytes = code.len(), consts = consts.len(), "compiled");
    if config.trace_jit {
        trace!(target: "jit", method = %name, "\n{}", hex_listing(code.code()));
    }
    Ok(CompileOutcome::Compiled(CompiledBody {
        entry,
        code_len: code.len(),
        consts,
    }))
}

/// Result of compiling one method for [`dump`].
#[derive(Debug)]
pub struct Listing {
    pub method: String,
    pub code: Result<Vec<u8>, String>,
}

/// Compiles every method of `program` for `target`. Nothing is installed,
/// so any target works on any host.
pub fn dump(program: &Program, target: Target) -> Vec<Listing> {
    program
        .classes
        .iter()
        .flat_map(|class| class.methods.iter())
        .map(|method| Listing {
            method: method.qualified_name(program),
            code: generate(program, method, target)
                .map(|(code, _)| code.into_code())
                .map_err(|err| err.to_string()),
        })
        .collect()
}

/// Sixteen bytes per line, prefixed by the offset.
pub fn hex_listing(code: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in code.chunks(16).enumerate() {
        let _ = write!(out, "{:06x}:", line * 16);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::asm;
    use crate::vm::{Class, Opcode, ReturnKind};

    fn program() -> Program {
        let mut program = Program::new();
        let mut main = Class::new("Main", None, 0, 0);
        main.add_method(Method::new(
            "main",
            0,
            ReturnKind::Int,
            vec![
                asm::int(7),
                asm::int(3),
                asm::op(Opcode::AddInt),
                asm::rtrn(),
            ],
        ));
        program.add_class(main);
        program
    }

    #[test]
    fn test_every_target_generates() {
        let program = program();
        for target in [Target::X86_64Sysv, Target::X86_64Win64, Target::Aarch64] {
            let listings = dump(&program, target);
            assert_eq!(listings.len(), 1);
            let code = listings[0].code.as_ref().unwrap();
            assert!(!code.is_empty());
        }
    }

    #[test]
    fn test_aarch64_code_is_word_aligned() {
        let program = program();
        let listing = &dump(&program, Target::Aarch64)[0];
        assert_eq!(listing.code.as_ref().unwrap().len() % 4, 0);
    }

    /// Operand stack limit checks in the SysV code for `instrs`, counted by
    /// their `cmp rax, [r11+16]`.
    fn limit_checks(instrs: Vec<crate::vm::Instruction>) -> usize {
        let mut program = Program::new();
        let mut main = Class::new("Main", None, 0, 1);
        main.add_method(Method::new("main", 0, ReturnKind::Int, instrs));
        program.add_class(main);
        let method = program.entry_method().unwrap();
        let (code, _) = generate(&program, method, Target::X86_64Sysv).unwrap();
        code.code()
            .windows(4)
            .filter(|w| *w == [0x49, 0x3B, 0x43, 0x10])
            .count()
    }

    #[test]
    fn test_consecutive_pushes_share_one_limit_check() {
        let pushes: Vec<_> = (0..6).map(asm::int).chain([asm::rtrn()]).collect();
        assert_eq!(limit_checks(pushes), 1);

        // shrinking and regrowing within the checked depth needs nothing new
        let folded = vec![
            asm::int(1),
            asm::int(2),
            asm::op(Opcode::AddInt),
            asm::int(3),
            asm::rtrn(),
        ];
        assert_eq!(limit_checks(folded), 1);
    }

    #[test]
    fn test_stores_split_limit_checks() {
        let code = vec![
            asm::int(5),
            asm::op(Opcode::LoadClsMem),
            asm::store_static(0),
            asm::int(1),
            asm::int(2),
            asm::int(3),
            asm::rtrn(),
        ];
        assert_eq!(limit_checks(code), 2);
    }

    #[test]
    fn test_hex_listing() {
        let text = hex_listing(&[0x55; 18]);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("000000: 55"));
        assert_eq!(lines[1], "000010: 55 55");
    }
}
