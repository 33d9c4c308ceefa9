//! Runtime callback bridge.
//!
//! Every operation too large to inline (allocation, dispatch, casts, string
//! conversion, bulk copies, threads, traps and the float library) lives here.
//! The interpreter calls [`dispatch`] directly; compiled code calls
//! [`native_bridge`], which funnels into the same function.

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{trace, warn};

use super::bytecode::{Instruction, Opcode, TrapCode};
use super::error::VmError;
use super::heap::{self, ElemKind, Handle, Heap};
use super::runtime::ExecContext;
use super::stack::OperandStack;

/// Called by compiled code. Results travel back through the operand stack;
/// a fatal error sets the context's halt word and parks the error for the
/// engine that entered native code.
///
/// # Safety
/// All pointers must be the ones handed to the compiled method by
/// `ExecContext`.
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn native_bridge(
    tag: i64,
    instr: *const Instruction,
    cls_id: i64,
    mthd_id: i64,
    inst: *mut i64,
    op_stack: *mut i64,
    stack_pos: *mut i64,
    ctx: *mut ExecContext,
    call_pos: *mut i64,
    ip: i64,
) {
    // SAFETY: compiled code passes the context it was entered with.
    let Some(ctx) = (unsafe { ctx.as_mut() }) else {
        return;
    };
    // SAFETY: instructions live as long as their method.
    let Some(instr) = (unsafe { instr.as_ref() }) else {
        ctx.set_pending(VmError::Unsupported {
            op: format!("tag {}", tag),
            trace: ctx.trace(),
        });
        return;
    };
    if Opcode::from_tag(tag) != Some(instr.op) {
        ctx.set_pending(VmError::Unsupported {
            op: format!("tag {} for {}", tag, instr.op),
            trace: ctx.trace(),
        });
        return;
    }

    trace!(
        target: "bridge",
        op = %instr.op,
        cls_id,
        mthd_id,
        ip,
        // SAFETY: valid cursor pointer from the caller.
        depth = unsafe { call_pos.as_ref().copied().unwrap_or(0) },
        "native callback"
    );
    if let Some(frame) = ctx.frames.last_mut() {
        frame.ip = ip.max(0) as usize;
    }

    // SAFETY: the stack pointers belong to `ctx`.
    let stack = unsafe { OperandStack::from_raw(op_stack, stack_pos, ctx.stack_capacity()) };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(ctx, stack, instr, inst)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => ctx.set_pending(err.with_trace(ctx.trace())),
        Err(_) => ctx.set_pending(VmError::Unsupported {
            op: format!("panic while executing {}", instr.op),
            trace: ctx.trace(),
        }),
    }
}

fn pop_handle(stack: OperandStack) -> Result<Handle, VmError> {
    Ok(stack.pop()? as Handle)
}

fn pop_non_nil(stack: OperandStack) -> Result<Handle, VmError> {
    let handle = pop_handle(stack)?;
    if handle.is_null() {
        return Err(VmError::nil());
    }
    Ok(handle)
}

/// Executes one bridged operation.
pub fn dispatch(
    ctx: &mut ExecContext,
    stack: OperandStack,
    instr: &Instruction,
    _inst: Handle,
) -> Result<(), VmError> {
    match instr.op {
        Opcode::MthdCall => {
            let runtime = Arc::clone(ctx.runtime());
            let callee = runtime
                .program()
                .method(instr.operand as usize, instr.operand2 as usize)
                .ok_or(VmError::InvalidMethod {
                    class: instr.operand,
                    method: instr.operand2,
                    trace: Vec::new(),
                })?;
            let instance = pop_handle(stack)?;
            let bound = runtime.resolve_virtual(callee, instance);
            ctx.invoke(&bound, instance, instr.operand3 == 1)
        }
        Opcode::DynMthdCall => {
            let packed = stack.pop()?;
            let instance = pop_handle(stack)?;
            let (cls, mthd) = (packed >> 16, packed & 0xFFFF);
            let runtime = Arc::clone(ctx.runtime());
            let callee = runtime
                .program()
                .method(cls as usize, mthd as usize)
                .ok_or(VmError::InvalidMethod {
                    class: cls,
                    method: mthd,
                    trace: Vec::new(),
                })?;
            ctx.invoke(callee, instance, false)
        }
        Opcode::AsyncMthdCall => async_call(ctx, stack, instr),

        Opcode::LoadArySize => {
            let array = pop_non_nil(stack)?;
            // SAFETY: non-nil array handle.
            stack.push(unsafe { heap::array_extent(array, 0) })
        }

        Opcode::NewByteAry => new_array(ctx, stack, instr, ElemKind::Byte),
        Opcode::NewCharAry => new_array(ctx, stack, instr, ElemKind::Char),
        Opcode::NewIntAry => new_array(ctx, stack, instr, ElemKind::Int),
        Opcode::NewFloatAry => new_array(ctx, stack, instr, ElemKind::Float),
        Opcode::NewObjInst => {
            let cls = ctx
                .runtime()
                .program()
                .class(instr.operand as usize)
                .ok_or(VmError::InvalidClass {
                    class: instr.operand,
                    trace: Vec::new(),
                })?;
            let obj = ctx.runtime().heap().alloc_object(cls.id, cls.inst_words)?;
            stack.push(obj as i64)
        }
        Opcode::NewFuncInst => {
            let mem = ctx
                .runtime()
                .heap()
                .alloc_closure(instr.operand.max(0) as usize)?;
            stack.push(mem as i64)
        }

        Opcode::CpyByteAry => copy_array(stack, ElemKind::Byte),
        Opcode::CpyCharAry => copy_array(stack, ElemKind::Char),
        Opcode::CpyIntAry => copy_array(stack, ElemKind::Int),
        Opcode::CpyFloatAry => copy_array(stack, ElemKind::Float),
        Opcode::ZeroByteAry => zero_array(stack, ElemKind::Byte),
        Opcode::ZeroCharAry => zero_array(stack, ElemKind::Char),
        Opcode::ZeroIntAry => zero_array(stack, ElemKind::Int),
        Opcode::ZeroFloatAry => zero_array(stack, ElemKind::Float),

        Opcode::ObjTypeOf => {
            let obj = pop_handle(stack)?;
            // SAFETY: object handles come from the runtime heap.
            let is_a = unsafe { Heap::class_of(obj) }
                .is_some_and(|cls| ctx.runtime().program().is_a(cls, instr.operand as usize));
            stack.push(is_a as i64)
        }
        Opcode::ObjInstCast => {
            let obj = pop_handle(stack)?;
            if obj.is_null() {
                return stack.push(0);
            }
            let program = ctx.runtime().program();
            // SAFETY: non-nil object handle from the runtime heap.
            let from = unsafe { Heap::class_of(obj) };
            match from {
                Some(cls) if program.is_a(cls, instr.operand as usize) => stack.push(obj as i64),
                _ => Err(VmError::InvalidCast {
                    from: from
                        .and_then(|c| program.class(c))
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| "?".to_string()),
                    to: program
                        .class(instr.operand as usize)
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| "?".to_string()),
                    trace: Vec::new(),
                }),
            }
        }

        Opcode::I2S => {
            let text = pop_handle(stack)?;
            let base = stack.pop()?;
            let value = stack.pop()?;
            if !text.is_null() {
                let formatted = match base {
                    2 => format!("{:b}", value),
                    8 => format!("{:o}", value),
                    16 => format!("0x{:x}", value),
                    _ => value.to_string(),
                };
                // SAFETY: non-nil char array handle.
                unsafe { heap::write_char_array(text, &formatted) };
            }
            Ok(())
        }
        Opcode::F2S => {
            let text = pop_handle(stack)?;
            let value = stack.pop_float()?;
            if !text.is_null() {
                // SAFETY: non-nil char array handle.
                unsafe { heap::write_char_array(text, &format!("{:.6}", value)) };
            }
            Ok(())
        }
        Opcode::S2I => {
            let text = pop_non_nil(stack)?;
            let base = stack.pop()?;
            // SAFETY: non-nil char array handle.
            let text = unsafe { heap::read_char_array(text) };
            stack.push(parse_int(&text, base))
        }
        Opcode::S2F => {
            let text = pop_non_nil(stack)?;
            // SAFETY: non-nil char array handle.
            let text = unsafe { heap::read_char_array(text) };
            stack.push_float(text.trim().parse::<f64>().unwrap_or(0.0))
        }

        Opcode::RandFloat => stack.push_float(ctx.runtime().next_random()),
        Opcode::FlorFloat
        | Opcode::CeilFloat
        | Opcode::SinFloat
        | Opcode::CosFloat
        | Opcode::TanFloat
        | Opcode::AsinFloat
        | Opcode::AcosFloat
        | Opcode::AtanFloat
        | Opcode::LogFloat
        | Opcode::SqrtFloat => {
            let value = stack.pop_float()?;
            stack.push_float(unary_math(instr.op, value))
        }
        Opcode::Atan2Float | Opcode::ModFloat | Opcode::PowFloat => {
            let right = stack.pop_float()?;
            let left = stack.pop_float()?;
            let result = match instr.op {
                Opcode::Atan2Float => left.atan2(right),
                Opcode::ModFloat => left % right,
                _ => left.powf(right),
            };
            stack.push_float(result)
        }

        Opcode::ThreadJoin => {
            let thread = pop_non_nil(stack)?;
            // SAFETY: thread objects have at least two words.
            let id = unsafe { *thread };
            ctx.runtime().threads().join(id)
        }
        Opcode::ThreadSleep => {
            let millis = stack.pop()?;
            std::thread::sleep(Duration::from_millis(millis.max(0) as u64));
            Ok(())
        }
        Opcode::ThreadMutex => {
            let obj = pop_non_nil(stack)?;
            let id = ctx.runtime().threads().new_mutex();
            // SAFETY: objects have at least two words.
            unsafe { *obj.add(1) = id };
            Ok(())
        }
        Opcode::CriticalStart => {
            let obj = pop_non_nil(stack)?;
            // SAFETY: objects have at least two words.
            ctx.runtime().threads().lock(unsafe { *obj.add(1) })
        }
        Opcode::CriticalEnd => {
            let obj = pop_non_nil(stack)?;
            // SAFETY: objects have at least two words.
            ctx.runtime().threads().unlock(unsafe { *obj.add(1) })
        }

        Opcode::Trap | Opcode::TrapRtrn => trap(ctx, stack),

        other => Err(VmError::Unsupported {
            op: other.to_string(),
            trace: Vec::new(),
        }),
    }
}

fn unary_math(op: Opcode, value: f64) -> f64 {
    match op {
        Opcode::FlorFloat => value.floor(),
        Opcode::CeilFloat => value.ceil(),
        Opcode::SinFloat => value.sin(),
        Opcode::CosFloat => value.cos(),
        Opcode::TanFloat => value.tan(),
        Opcode::AsinFloat => value.asin(),
        Opcode::AcosFloat => value.acos(),
        Opcode::AtanFloat => value.atan(),
        Opcode::LogFloat => value.ln(),
        _ => value.sqrt(),
    }
}

/// Integer parsing with `0b`, `0o` and `0x` prefixes; 0 when malformed.
fn parse_int(text: &str, base: i64) -> i64 {
    let text = text.trim();
    let (digits, radix) = match text.get(..2) {
        Some("0b") | Some("0B") if text.len() > 2 => (&text[2..], 2),
        Some("0o") | Some("0O") if text.len() > 2 => (&text[2..], 8),
        Some("0x") | Some("0X") if text.len() > 2 => (&text[2..], 16),
        _ => (text, if (2..=36).contains(&base) { base as u32 } else { 10 }),
    };
    i64::from_str_radix(digits, radix).unwrap_or(0)
}

fn new_array(
    ctx: &mut ExecContext,
    stack: OperandStack,
    instr: &Instruction,
    kind: ElemKind,
) -> Result<(), VmError> {
    let dims = instr.operand.max(1) as usize;
    let mut extents = Vec::with_capacity(dims);
    for _ in 0..dims {
        extents.push(stack.pop()?);
    }
    let array = ctx.runtime().heap().alloc_array(kind, &extents)?;
    stack.push(array as i64)
}

fn copy_array(stack: OperandStack, kind: ElemKind) -> Result<(), VmError> {
    let length = stack.pop()?;
    let src_offset = stack.pop()?;
    let src = pop_handle(stack)?;
    let dest_offset = stack.pop()?;
    let dest = pop_handle(stack)?;
    if src.is_null() || dest.is_null() {
        return Err(VmError::nil());
    }

    // SAFETY: both handles are non-nil arrays.
    let (src_len, dest_len) = unsafe {
        match kind {
            ElemKind::Byte | ElemKind::Char => {
                (heap::array_extent(src, 0), heap::array_extent(dest, 0))
            }
            ElemKind::Int | ElemKind::Float => (heap::array_len(src), heap::array_len(dest)),
        }
    };
    let fits = length > 0
        && src_offset >= 0
        && dest_offset >= 0
        && src_offset.checked_add(length).is_some_and(|end| end <= src_len)
        && dest_offset.checked_add(length).is_some_and(|end| end <= dest_len);
    if !fits {
        return stack.push(0);
    }

    let width = kind.width();
    // SAFETY: ranges were checked against both arrays; `copy` handles overlap.
    unsafe {
        let from = heap::array_payload(src).add(src_offset as usize * width);
        let to = heap::array_payload(dest).add(dest_offset as usize * width);
        std::ptr::copy(from, to, length as usize * width);
    }
    stack.push(1)
}

fn zero_array(stack: OperandStack, kind: ElemKind) -> Result<(), VmError> {
    let array = pop_non_nil(stack)?;
    // SAFETY: non-nil array handle; the payload holds `len` elements.
    unsafe {
        let len = heap::array_len(array).max(0) as usize;
        std::ptr::write_bytes(heap::array_payload(array), 0, len * kind.width());
    }
    Ok(())
}

fn async_call(
    ctx: &mut ExecContext,
    stack: OperandStack,
    instr: &Instruction,
) -> Result<(), VmError> {
    let thread = pop_non_nil(stack)?;
    let param = stack.pop()?;
    let runtime = Arc::clone(ctx.runtime());
    let callee = runtime
        .program()
        .method(instr.operand as usize, instr.operand2 as usize)
        .cloned()
        .ok_or(VmError::InvalidMethod {
            class: instr.operand,
            method: instr.operand2,
            trace: Vec::new(),
        })?;
    let name = callee.qualified_name(runtime.program());
    let thread_word = thread as usize;
    let worker_rt = Arc::clone(&runtime);
    let id = runtime.threads().spawn(name, move || {
        let mut worker = ExecContext::new(worker_rt);
        let stack = worker.stack();
        stack.push(param)?;
        let result = worker.invoke(&callee, thread_word as Handle, false);
        if let Err(err) = &result {
            worker.runtime().report_fault(err);
        }
        result
    })?;
    // SAFETY: thread objects have at least two words.
    unsafe { *thread = id };
    Ok(())
}

fn trap(ctx: &mut ExecContext, stack: OperandStack) -> Result<(), VmError> {
    let code = stack.pop()?;
    let Some(trap) = TrapCode::from_i64(code) else {
        return Err(VmError::UnknownTrap {
            code,
            trace: Vec::new(),
        });
    };
    let text = match trap {
        TrapCode::StdOutInt => stack.pop()?.to_string(),
        TrapCode::StdOutFloat => stack.pop_float()?.to_string(),
        TrapCode::StdOutChar => {
            let code = stack.pop()?;
            char::from_u32(code as u32)
                .unwrap_or(char::REPLACEMENT_CHARACTER)
                .to_string()
        }
        TrapCode::StdOutString => {
            let text = pop_handle(stack)?;
            if text.is_null() {
                "Nil".to_string()
            } else {
                // SAFETY: non-nil char array handle.
                unsafe { heap::read_char_array(text) }
            }
        }
        TrapCode::StdOutNewline => "\n".to_string(),
        TrapCode::SysTimeMillis => {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            return stack.push(millis);
        }
    };
    let mut out = ctx.runtime().output();
    if let Err(e) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
        warn!(%e, "trap output failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::vm::program::{Class, Method, Program, ReturnKind};
    use crate::vm::runtime::Runtime;

    fn context() -> ExecContext {
        let mut program = Program::new();
        let mut base = Class::new("Base", None, 2, 0);
        base.add_method(Method::new("run", 1, ReturnKind::Void, vec![]));
        let base_id = program.add_class(base);
        program.add_class(Class::new("Derived", Some(base_id), 2, 0));
        let rt = Runtime::with_output(program, RuntimeConfig::default(), Box::new(std::io::sink()))
            .unwrap();
        ExecContext::new(rt)
    }

    fn run(ctx: &mut ExecContext, instr: Instruction) -> Result<(), VmError> {
        let stack = ctx.stack();
        dispatch(ctx, stack, &instr, std::ptr::null_mut())
    }

    #[test]
    fn test_new_array_pops_extents_outermost_first() {
        let mut ctx = context();
        let stack = ctx.stack();
        stack.push(4).unwrap();
        stack.push(3).unwrap();
        run(&mut ctx, Instruction::with(Opcode::NewIntAry, 2)).unwrap();
        let array = stack.pop().unwrap() as Handle;
        unsafe {
            assert_eq!(heap::array_len(array), 12);
            assert_eq!(heap::array_extent(array, 0), 3);
            assert_eq!(heap::array_extent(array, 1), 4);
        }
        stack.push(array as i64).unwrap();
        run(&mut ctx, Instruction::new(Opcode::LoadArySize)).unwrap();
        assert_eq!(stack.pop().unwrap(), 3);
    }

    #[test]
    fn test_copy_int_array() {
        let mut ctx = context();
        let heap = ctx.runtime().heap();
        let src = heap.alloc_array(ElemKind::Int, &[4]).unwrap();
        let dest = heap.alloc_array(ElemKind::Int, &[4]).unwrap();
        unsafe {
            let payload = heap::array_payload(src) as *mut i64;
            for i in 0..4 {
                *payload.add(i) = i as i64 + 10;
            }
        }
        let stack = ctx.stack();
        for word in [dest as i64, 1, src as i64, 0, 3] {
            stack.push(word).unwrap();
        }
        run(&mut ctx, Instruction::new(Opcode::CpyIntAry)).unwrap();
        assert_eq!(stack.pop().unwrap(), 1);
        unsafe {
            let payload = heap::array_payload(dest) as *const i64;
            assert_eq!(*payload, 0);
            assert_eq!(*payload.add(1), 10);
            assert_eq!(*payload.add(3), 12);
        }

        // range past the end is rejected without copying
        for word in [dest as i64, 2, src as i64, 0, 3] {
            stack.push(word).unwrap();
        }
        run(&mut ctx, Instruction::new(Opcode::CpyIntAry)).unwrap();
        assert_eq!(stack.pop().unwrap(), 0);
    }

    #[test]
    fn test_cast_and_type_of() {
        let mut ctx = context();
        let obj = ctx.runtime().heap().alloc_object(1, 2).unwrap();
        let stack = ctx.stack();

        stack.push(obj as i64).unwrap();
        run(&mut ctx, Instruction::with(Opcode::ObjTypeOf, 0)).unwrap();
        assert_eq!(stack.pop().unwrap(), 1);

        stack.push(obj as i64).unwrap();
        run(&mut ctx, Instruction::with(Opcode::ObjInstCast, 0)).unwrap();
        assert_eq!(stack.pop().unwrap(), obj as i64);

        let base = ctx.runtime().heap().alloc_object(0, 2).unwrap();
        stack.push(base as i64).unwrap();
        let err = run(&mut ctx, Instruction::with(Opcode::ObjInstCast, 1)).unwrap_err();
        assert!(matches!(err, VmError::InvalidCast { ref from, ref to, .. } if from == "Base" && to == "Derived"));

        stack.push(0).unwrap();
        run(&mut ctx, Instruction::with(Opcode::ObjInstCast, 1)).unwrap();
        assert_eq!(stack.pop().unwrap(), 0);
    }

    #[test]
    fn test_string_conversions() {
        let mut ctx = context();
        let text = ctx.runtime().heap().alloc_array(ElemKind::Char, &[16]).unwrap();
        let stack = ctx.stack();

        for word in [255, 16, text as i64] {
            stack.push(word).unwrap();
        }
        run(&mut ctx, Instruction::new(Opcode::I2S)).unwrap();
        assert_eq!(unsafe { heap::read_char_array(text) }, "0xff");

        stack.push(10).unwrap();
        stack.push(text as i64).unwrap();
        run(&mut ctx, Instruction::new(Opcode::S2I)).unwrap();
        assert_eq!(stack.pop().unwrap(), 255);

        unsafe { heap::write_char_array(text, "0b101") };
        stack.push(10).unwrap();
        stack.push(text as i64).unwrap();
        run(&mut ctx, Instruction::new(Opcode::S2I)).unwrap();
        assert_eq!(stack.pop().unwrap(), 5);

        unsafe { heap::write_char_array(text, "abc") };
        stack.push(10).unwrap();
        stack.push(text as i64).unwrap();
        run(&mut ctx, Instruction::new(Opcode::S2I)).unwrap();
        assert_eq!(stack.pop().unwrap(), 0);

        stack.push_float(1.5).unwrap();
        stack.push(text as i64).unwrap();
        run(&mut ctx, Instruction::new(Opcode::F2S)).unwrap();
        stack.push(text as i64).unwrap();
        run(&mut ctx, Instruction::new(Opcode::S2F)).unwrap();
        assert_eq!(stack.pop_float().unwrap(), 1.5);
    }

    #[test]
    fn test_float_library() {
        let mut ctx = context();
        let stack = ctx.stack();
        stack.push_float(2.0).unwrap();
        stack.push_float(10.0).unwrap();
        run(&mut ctx, Instruction::new(Opcode::PowFloat)).unwrap();
        assert_eq!(stack.pop_float().unwrap(), 1024.0);

        stack.push_float(7.5).unwrap();
        stack.push_float(2.0).unwrap();
        run(&mut ctx, Instruction::new(Opcode::ModFloat)).unwrap();
        assert_eq!(stack.pop_float().unwrap(), 1.5);

        stack.push_float(-1.5).unwrap();
        run(&mut ctx, Instruction::new(Opcode::FlorFloat)).unwrap();
        assert_eq!(stack.pop_float().unwrap(), -2.0);
    }

    #[test]
    fn test_mutex_ops_on_object() {
        let mut ctx = context();
        let obj = ctx.runtime().heap().alloc_object(0, 2).unwrap();
        let stack = ctx.stack();
        stack.push(obj as i64).unwrap();
        run(&mut ctx, Instruction::new(Opcode::ThreadMutex)).unwrap();
        assert_ne!(unsafe { *obj.add(1) }, 0);
        stack.push(obj as i64).unwrap();
        run(&mut ctx, Instruction::new(Opcode::CriticalStart)).unwrap();
        stack.push(obj as i64).unwrap();
        run(&mut ctx, Instruction::new(Opcode::CriticalEnd)).unwrap();
    }

    #[test]
    fn test_nil_array_size_fails() {
        let mut ctx = context();
        let stack = ctx.stack();
        stack.push(0).unwrap();
        let err = run(&mut ctx, Instruction::new(Opcode::LoadArySize)).unwrap_err();
        assert!(matches!(err, VmError::NilDereference { .. }));
    }

    #[test]
    fn test_parse_int_prefixes() {
        assert_eq!(parse_int("0x1F", 10), 31);
        assert_eq!(parse_int("0o17", 10), 15);
        assert_eq!(parse_int("-42", 10), -42);
        assert_eq!(parse_int("zz", 36), 1295);
        assert_eq!(parse_int("", 10), 0);
    }
}
