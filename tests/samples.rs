//! Every built-in sample, run by the interpreter and by the JIT.
//!
//! Both engines must agree on the final operand stack, the trap output and
//! the fault a program raises.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

use stackjit::config::{JitMode, OnFault, RuntimeConfig};
use stackjit::samples::{Expected, SAMPLES, Sample};
use stackjit::vm::{ExecContext, Runtime, VmError};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(sample: &Sample, mode: JitMode) -> (Result<Vec<i64>, VmError>, String) {
    let config = RuntimeConfig {
        on_fault: OnFault::Halt,
        ..RuntimeConfig::default()
    }
    .with_jit_mode(mode);
    let out = Captured::default();
    let runtime = Runtime::with_output(sample.program(), config, Box::new(out.clone())).unwrap();
    let entry = runtime.program().entry_method().cloned().unwrap();
    let result = ExecContext::new(Arc::clone(&runtime)).run(&entry, &[]);
    let text = String::from_utf8(out.0.lock().clone()).unwrap();
    (result, text)
}

fn check(sample: &Sample, mode: JitMode) {
    let (result, output) = run(sample, mode);
    match sample.expected {
        Expected::Stack(stack) => {
            assert_eq!(result.unwrap(), stack, "{} ({:?})", sample.name, mode)
        }
        Expected::Fault(status) => {
            let err = result.unwrap_err();
            assert_eq!(err.status(), Some(status), "{} ({:?}): {}", sample.name, mode, err);
        }
    }
    assert_eq!(output, sample.output, "{} ({:?})", sample.name, mode);
}

#[test]
fn test_interpreter_runs_every_sample() {
    for sample in SAMPLES {
        check(sample, JitMode::Off);
    }
}

#[test]
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn test_jit_runs_every_sample() {
    for sample in SAMPLES {
        check(sample, JitMode::On);
    }
}

#[test]
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn test_auto_mode_matches_interpreter() {
    for sample in SAMPLES {
        let (interp, interp_out) = run(sample, JitMode::Off);
        let (auto, auto_out) = run(sample, JitMode::Auto);
        match (interp, auto) {
            (Ok(a), Ok(b)) => assert_eq!(a, b, "{}", sample.name),
            (Err(a), Err(b)) => assert!(a.same_kind(&b), "{}: {} vs {}", sample.name, a, b),
            (a, b) => panic!("{}: {:?} vs {:?}", sample.name, a, b),
        }
        assert_eq!(interp_out, auto_out, "{}", sample.name);
    }
}
