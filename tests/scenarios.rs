//! Fault and arithmetic scenarios checked against both engines.

use std::sync::Arc;

use stackjit::config::{JitMode, OnFault, RuntimeConfig};
use stackjit::vm::asm;
use stackjit::vm::{Class, ExecContext, Instruction, Method, Opcode, Program, ReturnKind, Runtime};

fn modes() -> Vec<JitMode> {
    if cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
        vec![JitMode::Off, JitMode::On]
    } else {
        vec![JitMode::Off]
    }
}

fn config(mode: JitMode) -> RuntimeConfig {
    RuntimeConfig {
        on_fault: OnFault::Halt,
        ..RuntimeConfig::default()
    }
    .with_jit_mode(mode)
}

fn runtime(instrs: Vec<Instruction>, config: RuntimeConfig) -> Arc<Runtime> {
    let mut program = Program::new();
    let mut main = Class::new("Main", None, 0, 0);
    main.add_method(Method::new("main", 0, ReturnKind::Int, instrs));
    program.add_class(main);
    Runtime::new(program, config).unwrap()
}

/// Runs main with `below` already on the caller's stack and returns the
/// result together with the final stack.
fn call(instrs: Vec<Instruction>, mode: JitMode, below: &[i64]) -> (Option<i64>, Vec<i64>) {
    call_with(instrs, config(mode), below)
}

fn call_with(instrs: Vec<Instruction>, config: RuntimeConfig, below: &[i64]) -> (Option<i64>, Vec<i64>) {
    let runtime = runtime(instrs, config);
    let main = runtime.program().entry_method().cloned().unwrap();
    let mut ctx = ExecContext::new(Arc::clone(&runtime));
    let stack = ctx.stack();
    for &v in below {
        stack.push(v).unwrap();
    }
    let status = ctx
        .invoke(&main, std::ptr::null_mut(), true)
        .err()
        .map(|e| e.status().unwrap_or(i64::MIN));
    (status, stack.to_vec())
}

#[test]
fn test_divide() {
    let code = vec![asm::int(7), asm::int(3), asm::op(Opcode::DivInt), asm::rtrn()];
    for mode in modes() {
        assert_eq!(call(code.clone(), mode, &[]), (None, vec![2]), "{:?}", mode);
    }
}

#[test]
fn test_divide_by_zero_leaves_caller_stack() {
    let code = vec![asm::int(7), asm::int(0), asm::op(Opcode::DivInt), asm::rtrn()];
    for mode in modes() {
        assert_eq!(call(code.clone(), mode, &[42]), (Some(-4), vec![42]), "{:?}", mode);
    }
}

#[test]
fn test_division_edge_cases() {
    let code = vec![
        asm::int(i64::MIN),
        asm::int(-1),
        asm::op(Opcode::DivInt),
        asm::int(i64::MIN),
        asm::int(-1),
        asm::op(Opcode::ModInt),
        asm::int(-7),
        asm::int(2),
        asm::op(Opcode::ModInt),
        asm::rtrn(),
    ];
    for mode in modes() {
        assert_eq!(
            call(code.clone(), mode, &[]),
            (None, vec![i64::MIN, 0, -1]),
            "{:?}",
            mode
        );
    }
}

#[test]
fn test_float_divide_by_zero() {
    let code = vec![
        asm::float(1.0),
        asm::float(0.0),
        asm::op(Opcode::DivFloat),
        asm::rtrn(),
    ];
    for mode in modes() {
        assert_eq!(call(code.clone(), mode, &[]).0, Some(-4), "{:?}", mode);
    }
}

#[test]
fn test_nil_instance_field() {
    let code = vec![
        asm::int(0),
        Instruction::with(Opcode::LoadClsInstIntVar, 0),
        asm::rtrn(),
    ];
    for mode in modes() {
        assert_eq!(call(code.clone(), mode, &[9, 8]), (Some(-1), vec![9, 8]), "{:?}", mode);
    }
}

fn matrix_read(i: i64, j: i64) -> Vec<Instruction> {
    vec![
        asm::int(4),
        asm::int(3),
        asm::new_array(Opcode::NewIntAry, 2),
        asm::store_local(0),
        asm::int(j),
        asm::int(i),
        asm::load_local(0),
        asm::array_elm(Opcode::LoadIntAryElm, 2),
        asm::rtrn(),
    ]
}

#[test]
fn test_matrix_bounds() {
    for mode in modes() {
        assert_eq!(call(matrix_read(2, 5), mode, &[]).0, Some(-3), "{:?}", mode);
        assert_eq!(call(matrix_read(-1, 0), mode, &[]).0, Some(-2), "{:?}", mode);
        assert_eq!(call(matrix_read(2, 3), mode, &[]), (None, vec![0]), "{:?}", mode);
    }
}

#[test]
fn test_compare_and_branch() {
    // 5 < 3 is false, so the fused branch is not taken
    let code = vec![
        asm::int(5),
        asm::int(3),
        asm::op(Opcode::LesInt),
        asm::jmp_if(6, 1),
        asm::int(10),
        asm::rtrn(),
        asm::label(0),
        asm::int(20),
        asm::rtrn(),
    ];
    for mode in modes() {
        assert_eq!(call(code.clone(), mode, &[]), (None, vec![10]), "{:?}", mode);
    }
}

#[test]
fn test_nan_comparisons() {
    let nan = f64::NAN;
    let code = vec![
        asm::float(nan),
        asm::float(nan),
        asm::op(Opcode::EqlFloat),
        asm::float(nan),
        asm::float(1.0),
        asm::op(Opcode::NeqlFloat),
        asm::float(nan),
        asm::float(1.0),
        asm::op(Opcode::LesFloat),
        asm::rtrn(),
    ];
    for mode in modes() {
        assert_eq!(call(code.clone(), mode, &[]), (None, vec![0, 1, 0]), "{:?}", mode);
    }
}

#[test]
fn test_shifts() {
    let code = vec![
        asm::int(-16),
        asm::int(2),
        asm::op(Opcode::ShrInt),
        asm::int(3),
        asm::int(4),
        asm::op(Opcode::ShlInt),
        asm::rtrn(),
    ];
    for mode in modes() {
        assert_eq!(call(code.clone(), mode, &[]), (None, vec![-4, 48]), "{:?}", mode);
    }
}

/// F2I of `value` once through a local, so nothing is folded, and once as
/// a literal.
fn truncate(value: f64) -> Vec<Instruction> {
    vec![
        asm::float(value),
        asm::store_float_local(0),
        asm::load_float_local(0),
        asm::op(Opcode::F2I),
        asm::float(value),
        asm::op(Opcode::F2I),
        asm::rtrn(),
    ]
}

#[test]
fn test_float_to_int_out_of_range() {
    let two_63 = 9_223_372_036_854_775_808.0;
    let cases = [
        (f64::NAN, i64::MIN),
        (1e300, i64::MIN),
        (-1e300, i64::MIN),
        (two_63, i64::MIN),
        (-two_63, i64::MIN),
        (f64::INFINITY, i64::MIN),
        (-2.9, -2),
        (two_63 - 1024.0, i64::MAX - 1023),
    ];
    for (value, expected) in cases {
        for mode in modes() {
            assert_eq!(
                call(truncate(value), mode, &[]),
                (None, vec![expected, expected]),
                "{} {:?}",
                value,
                mode
            );
        }
    }
}

fn small_stack(mode: JitMode) -> RuntimeConfig {
    RuntimeConfig {
        op_stack_size: 8,
        ..config(mode)
    }
}

#[test]
fn test_operand_stack_overflow() {
    let mut code: Vec<_> = (0..40).map(asm::int).collect();
    code.push(asm::rtrn());
    for mode in modes() {
        assert_eq!(call_with(code.clone(), small_stack(mode), &[]).0, Some(-5), "{:?}", mode);
    }
}

#[test]
fn test_operand_stack_limit_counts_caller_words() {
    // five words fit on an empty stack but not above four caller words
    let mut code: Vec<_> = (0..5).map(asm::int).collect();
    code.push(asm::rtrn());
    for mode in modes() {
        assert_eq!(
            call_with(code.clone(), small_stack(mode), &[]),
            (None, vec![0, 1, 2, 3, 4]),
            "{:?}",
            mode
        );
        assert_eq!(call_with(code.clone(), small_stack(mode), &[6, 7, 8, 9]).0, Some(-5), "{:?}", mode);
    }
}

#[test]
fn test_operand_stack_fills_exactly() {
    // pops make room for later pushes
    let mut code: Vec<_> = (0..8).map(asm::int).collect();
    code.extend([asm::op(Opcode::AddInt), asm::op(Opcode::AddInt), asm::int(100)]);
    code.push(asm::rtrn());
    for mode in modes() {
        assert_eq!(
            call_with(code.clone(), small_stack(mode), &[]),
            (None, vec![0, 1, 2, 3, 4, 18, 100]),
            "{:?}",
            mode
        );
    }
}

#[test]
fn test_overflow_does_not_skip_earlier_stores() {
    // the static store happens before the stack runs out
    let mut code = vec![asm::int(5), asm::op(Opcode::LoadClsMem), asm::store_static(0)];
    code.extend((0..10).map(asm::int));
    code.push(asm::rtrn());
    for mode in modes() {
        let runtime = {
            let mut program = Program::new();
            let mut main = Class::new("Main", None, 0, 1);
            main.add_method(Method::new("main", 0, ReturnKind::Int, code.clone()));
            program.add_class(main);
            Runtime::new(program, small_stack(mode)).unwrap()
        };
        let main = runtime.program().entry_method().cloned().unwrap();
        let mut ctx = ExecContext::new(Arc::clone(&runtime));
        let err = ctx.invoke(&main, std::ptr::null_mut(), true).unwrap_err();
        assert_eq!(err.status(), Some(-5), "{:?}", mode);
        let cls_mem = runtime.class_memory(0) as *const i64;
        assert_eq!(unsafe { *cls_mem }, 5, "{:?}", mode);
    }
}
