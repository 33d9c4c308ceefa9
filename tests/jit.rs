//! Compilation policy and code generation across targets.

use std::sync::Arc;

use stackjit::config::{JitMode, RuntimeConfig, Target};
use stackjit::jit::{self, CompileError};
use stackjit::samples::SAMPLES;
use stackjit::vm::asm;
use stackjit::vm::{Class, CompileOutcome, ExecContext, Method, Opcode, Program, ReturnKind, Runtime};

fn single(instrs: Vec<stackjit::vm::Instruction>) -> Program {
    let mut program = Program::new();
    let mut main = Class::new("Main", None, 0, 0);
    main.add_method(Method::new("main", 0, ReturnKind::Int, instrs));
    program.add_class(main);
    program
}

/// `count` integer values that each need a register of their own, summed
/// after `between` runs.
fn live_ints(count: i64, between: Vec<stackjit::vm::Instruction>) -> Vec<stackjit::vm::Instruction> {
    let mut code = Vec::new();
    for k in 0..count {
        code.extend([asm::int(k * 10), asm::store_local(k)]);
    }
    for k in 0..count {
        code.extend([asm::load_local(k), asm::int(1), asm::op(Opcode::AddInt)]);
    }
    code.extend(between);
    for _ in 1..count {
        code.push(asm::op(Opcode::AddInt));
    }
    code.push(asm::rtrn());
    code
}

/// Runs main under `mode` twice and returns both results, checking the
/// compile outcome is settled after the first run.
fn run_twice(program: Program, mode: JitMode) -> (Vec<i64>, Option<String>) {
    let config = RuntimeConfig::default().with_jit_mode(mode);
    let runtime = Runtime::new(program, config).unwrap();
    let entry = runtime.program().entry_method().cloned().unwrap();
    let mut ctx = ExecContext::new(Arc::clone(&runtime));
    let first = ctx.run(&entry, &[]).unwrap();
    let reason = match entry.compiled() {
        Some(CompileOutcome::Failed(reason)) => Some(reason.clone()),
        _ => None,
    };
    let mut ctx = ExecContext::new(Arc::clone(&runtime));
    assert_eq!(ctx.run(&entry, &[]).unwrap(), first);
    let again = match entry.compiled() {
        Some(CompileOutcome::Failed(reason)) => Some(reason.clone()),
        _ => None,
    };
    assert_eq!(again, reason);
    (first, reason)
}

#[test]
fn test_every_sample_generates_for_every_target() {
    for target in [Target::X86_64Sysv, Target::X86_64Win64, Target::Aarch64] {
        for sample in SAMPLES {
            for listing in jit::dump(&sample.program(), target) {
                let code = listing
                    .code
                    .unwrap_or_else(|e| panic!("{} {} {:?}: {}", sample.name, listing.method, target, e));
                assert!(!code.is_empty());
                if target == Target::Aarch64 {
                    assert_eq!(code.len() % 4, 0);
                }
            }
        }
    }
}

#[test]
fn test_value_across_label_is_rejected() {
    let program = single(vec![asm::int(1), asm::label(0), asm::rtrn()]);
    for target in [Target::X86_64Sysv, Target::Aarch64] {
        let listing = &jit::dump(&program, target)[0];
        assert!(listing.code.is_err(), "{:?}", target);
    }
}

#[test]
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn test_rejected_method_falls_back_to_interpreter() {
    let program = single(vec![asm::int(1), asm::label(0), asm::rtrn()]);
    let config = RuntimeConfig::default().with_jit_mode(JitMode::On);
    let runtime = Runtime::new(program, config).unwrap();
    let entry = runtime.program().entry_method().cloned().unwrap();

    let mut ctx = ExecContext::new(Arc::clone(&runtime));
    assert_eq!(ctx.run(&entry, &[]).unwrap(), vec![1]);
    assert!(matches!(entry.compiled(), Some(CompileOutcome::Failed(_))));

    // no second attempt
    let mut ctx = ExecContext::new(Arc::clone(&runtime));
    assert_eq!(ctx.run(&entry, &[]).unwrap(), vec![1]);
    assert!(matches!(entry.compiled(), Some(CompileOutcome::Failed(_))));
}

#[test]
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn test_method_compiles_once() {
    let program = single(vec![
        asm::int(7),
        asm::int(3),
        asm::op(Opcode::DivInt),
        asm::rtrn(),
    ]);
    let config = RuntimeConfig::default().with_jit_mode(JitMode::On);
    let runtime = Runtime::new(program, config).unwrap();
    let entry = runtime.program().entry_method().cloned().unwrap();

    let mut ctx = ExecContext::new(Arc::clone(&runtime));
    assert_eq!(ctx.run(&entry, &[]).unwrap(), vec![2]);
    let first = match entry.compiled() {
        Some(CompileOutcome::Compiled(body)) => body.entry as usize,
        other => panic!("{:?}", other),
    };
    let mut ctx = ExecContext::new(Arc::clone(&runtime));
    assert_eq!(ctx.run(&entry, &[]).unwrap(), vec![2]);
    match entry.compiled() {
        Some(CompileOutcome::Compiled(body)) => assert_eq!(body.entry as usize, first),
        other => panic!("{:?}", other),
    }
}

#[test]
fn test_auto_mode_waits_for_threshold() {
    let program = single(vec![asm::int(1), asm::rtrn()]);
    let config = RuntimeConfig {
        jit_threshold: 3,
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::new(program, config).unwrap();
    let main = runtime.program().entry_method().cloned().unwrap();
    let mut ctx = ExecContext::new(Arc::clone(&runtime));
    let stack = ctx.stack();

    // plain call sites count calls; nothing compiles before the threshold
    ctx.invoke(&main, std::ptr::null_mut(), false).unwrap();
    ctx.invoke(&main, std::ptr::null_mut(), false).unwrap();
    assert!(main.compiled().is_none());
    ctx.invoke(&main, std::ptr::null_mut(), false).unwrap();
    if Target::Host.resolve().is_some() {
        assert!(main.compiled().is_some());
    }
    assert_eq!(stack.to_vec(), vec![1, 1, 1]);
}

#[test]
fn test_jit_off_never_compiles() {
    let program = single(vec![asm::int(1), asm::rtrn()]);
    let config = RuntimeConfig::default().with_jit_mode(JitMode::Off);
    let runtime = Runtime::new(program, config).unwrap();
    let entry = runtime.program().entry_method().cloned().unwrap();
    let mut ctx = ExecContext::new(Arc::clone(&runtime));
    assert_eq!(ctx.run(&entry, &[]).unwrap(), vec![1]);
    assert!(entry.compiled().is_none());
}

#[test]
fn test_too_many_live_values_exhaust_registers() {
    let program = single(live_ints(12, Vec::new()));
    let method = program.entry_method().unwrap();
    for target in [Target::X86_64Sysv, Target::X86_64Win64, Target::Aarch64] {
        assert!(
            matches!(
                jit::generate(&program, method, target),
                Err(CompileError::RegistersExhausted)
            ),
            "{:?}",
            target
        );
    }
}

#[test]
fn test_too_many_ints_across_a_runtime_call() {
    let between = vec![asm::new_object(0), asm::op(Opcode::PopInt)];
    let program = single(live_ints(7, between));
    let method = program.entry_method().unwrap();
    for target in [Target::X86_64Sysv, Target::X86_64Win64, Target::Aarch64] {
        assert!(
            matches!(
                jit::generate(&program, method, target),
                Err(CompileError::SpillOverflow { ip: 35 })
            ),
            "{:?}",
            target
        );
    }
}

fn live_floats(count: i64) -> Vec<stackjit::vm::Instruction> {
    let mut code = Vec::new();
    for k in 0..count {
        code.extend([asm::int(k + 1), asm::store_local(k)]);
    }
    for k in 0..count {
        code.extend([asm::load_local(k), asm::op(Opcode::I2F)]);
    }
    code.extend([asm::new_object(0), asm::op(Opcode::PopInt)]);
    for _ in 1..count {
        code.push(asm::op(Opcode::AddFloat));
    }
    code.extend([asm::op(Opcode::F2I), asm::rtrn()]);
    code
}

#[test]
fn test_too_many_floats_across_a_runtime_call() {
    let program = single(live_floats(5));
    let method = program.entry_method().unwrap();
    for target in [Target::X86_64Sysv, Target::Aarch64] {
        assert!(
            matches!(
                jit::generate(&program, method, target),
                Err(CompileError::SpillOverflow { .. })
            ),
            "{:?}",
            target
        );
    }
}

#[test]
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn test_soft_failures_run_interpreted_with_the_same_result() {
    let between = vec![asm::new_object(0), asm::op(Opcode::PopInt)];
    let cases = [
        (live_ints(12, Vec::new()), CompileError::RegistersExhausted.to_string()),
        (live_ints(7, between), "too many live values".to_string()),
        (live_floats(5), "too many live values".to_string()),
    ];
    for (code, reason) in cases {
        let (expected, none) = run_twice(single(code.clone()), JitMode::Off);
        assert!(none.is_none());
        let (actual, failed) = run_twice(single(code), JitMode::On);
        assert_eq!(actual, expected);
        let failed = failed.unwrap_or_else(|| panic!("expected a failed compile for {}", reason));
        assert!(failed.contains(&reason), "{} / {}", failed, reason);
    }
}
