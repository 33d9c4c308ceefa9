//! Bytecode interpreter and the call path shared with compiled code.

use std::sync::Arc;

use tracing::{debug, trace};

use super::bridge;
use super::bytecode::{self, Instruction, MemoryContext, Opcode};
use super::error::VmError;
use super::heap::{self, ElemKind, Handle};
use super::program::Method;
#[cfg(feature = "jit")]
use super::program::{CompileOutcome, CompiledBody};
use super::runtime::ExecContext;
use super::stack::OperandStack;
#[cfg(feature = "jit")]
use crate::config::JitMode;

impl ExecContext {
    /// Runs `method` with its arguments already on the operand stack and
    /// returns the final stack contents.
    pub fn run(&mut self, method: &Arc<Method>, args: &[i64]) -> Result<Vec<i64>, VmError> {
        let stack = self.stack();
        for &arg in args {
            stack.push(arg)?;
        }
        self.invoke(method, std::ptr::null_mut(), true)?;
        Ok(stack.to_vec())
    }

    /// Calls `method`, choosing compiled code when available. On failure the
    /// operand stack is cut back to what the caller had below the arguments.
    pub fn invoke(
        &mut self,
        method: &Arc<Method>,
        instance: Handle,
        native_site: bool,
    ) -> Result<(), VmError> {
        if self.runtime().is_halted() {
            return Err(VmError::Halted);
        }
        let stack = self.stack();
        let floor = stack.len().saturating_sub(method.params);

        #[cfg(feature = "jit")]
        let result = match self.native_body(method, native_site)? {
            Some(body) => self.call_native(body, method, instance),
            None => self.interpret(method, instance),
        };
        #[cfg(not(feature = "jit"))]
        let result = {
            let _ = native_site;
            self.interpret(method, instance)
        };

        if result.is_err() {
            stack.truncate(floor);
        }
        result
    }

    /// Looks up or produces the compiled body for `method`. `Ok(None)` means
    /// interpret.
    #[cfg(feature = "jit")]
    fn native_body<'m>(
        &self,
        method: &'m Arc<Method>,
        native_site: bool,
    ) -> Result<Option<&'m CompiledBody>, VmError> {
        let config = self.runtime().config();
        if config.jit_mode == JitMode::Off || !config.target.is_executable_here() {
            return Ok(None);
        }
        if let Some(outcome) = method.compiled() {
            return Ok(match outcome {
                CompileOutcome::Compiled(body) => Some(body),
                CompileOutcome::Failed(_) => None,
            });
        }
        let wanted = match config.jit_mode {
            JitMode::On => true,
            JitMode::Auto => native_site || method.record_call() >= config.jit_threshold,
            JitMode::Off => false,
        };
        if !wanted {
            return Ok(None);
        }

        let runtime = self.runtime();
        let mut fatal = None;
        let outcome = method.compiled_or_init(|| match crate::jit::compile_method(runtime, method) {
            Ok(outcome) => outcome,
            Err(err) => {
                let reason = err.to_string();
                fatal = Some(err);
                CompileOutcome::Failed(reason)
            }
        });
        if let Some(err) = fatal {
            return Err(err);
        }
        Ok(match outcome {
            CompileOutcome::Compiled(body) => Some(body),
            CompileOutcome::Failed(reason) => {
                debug!(method = %method.qualified_name(runtime.program()), %reason, "falling back to interpreter");
                None
            }
        })
    }

    /// Enters a compiled body.
    #[cfg(feature = "jit")]
    fn call_native(
        &mut self,
        body: &CompiledBody,
        method: &Arc<Method>,
        instance: Handle,
    ) -> Result<(), VmError> {
        let idx = self.push_frame(method, instance)?;
        let cls_mem = self.runtime().class_memory(method.class_id);
        let stack = self.stack();
        let call_pos: *mut i64 = &mut self.call_pos;
        let jit_mem: *mut *mut i64 = &mut self.frames[idx].jit_mem;
        let jit_words: *mut i64 = &mut self.frames[idx].jit_words;
        let ctx: *mut ExecContext = self;

        trace!(target: "jit", method = %method.name, "enter native");
        // SAFETY: the body was generated for this exact signature; every
        // pointer stays valid for the duration of the call because frames
        // never reallocate and the stack storage is owned by `self`.
        let status = unsafe {
            (body.entry)(
                method.class_id as i64,
                method.id as i64,
                cls_mem,
                instance,
                stack.base(),
                stack.pos_ptr(),
                ctx,
                call_pos,
                jit_mem,
                jit_words,
                body.consts.as_ptr(),
            )
        };

        let result = match self.take_pending() {
            Some(err) => Err(err),
            None if status < 0 => Err(VmError::from_status(status)
                .unwrap_or(VmError::Unsupported {
                    op: format!("native status {}", status),
                    trace: Vec::new(),
                })
                .with_trace(self.trace())),
            None => Ok(()),
        };
        self.pop_frame();
        result
    }

    fn interpret(&mut self, method: &Arc<Method>, instance: Handle) -> Result<(), VmError> {
        let idx = self.push_frame(method, instance)?;
        let result = self
            .execute(method, idx)
            .map_err(|err| err.with_trace(self.trace()));
        self.pop_frame();
        result
    }

    fn execute(&mut self, method: &Arc<Method>, idx: usize) -> Result<(), VmError> {
        let instrs = &method.instrs;
        let stack = self.stack();
        let mut ip = 0;

        while ip < instrs.len() {
            let instr = &instrs[ip];
            ip += 1;

            match instr.op {
                // ====================
                // literals and stack
                // ====================
                Opcode::LoadIntLit | Opcode::LoadCharLit => stack.push(instr.operand)?,
                Opcode::LoadFloatLit => stack.push_float(instr.float_operand)?,
                Opcode::PopInt | Opcode::PopFloat => {
                    stack.pop()?;
                }
                Opcode::SwapInt => {
                    let top = stack.pop()?;
                    let below = stack.pop()?;
                    stack.push(top)?;
                    stack.push(below)?;
                }
                Opcode::Lbl => {}

                // ====================
                // variables
                // ====================
                Opcode::LoadIntVar | Opcode::LoadFloatVar => {
                    let value = match instr.context() {
                        MemoryContext::Local => self.local(idx, instr.operand)?,
                        // SAFETY: `field` returns an address inside live memory.
                        _ => unsafe { *field(stack, instr.operand)? },
                    };
                    stack.push(value)?;
                }
                Opcode::StorIntVar | Opcode::StorFloatVar => match instr.context() {
                    MemoryContext::Local => {
                        let value = stack.pop()?;
                        *self.local_mut(idx, instr.operand)? = value;
                    }
                    _ => {
                        let slot = field(stack, instr.operand)?;
                        let value = stack.pop()?;
                        // SAFETY: address inside live memory.
                        unsafe { *slot = value };
                    }
                },
                Opcode::CopyIntVar | Opcode::CopyFloatVar => match instr.context() {
                    MemoryContext::Local => {
                        let value = stack.peek()?;
                        *self.local_mut(idx, instr.operand)? = value;
                    }
                    _ => {
                        let slot = field(stack, instr.operand)?;
                        let value = stack.peek()?;
                        // SAFETY: address inside live memory.
                        unsafe { *slot = value };
                    }
                },
                Opcode::LoadFuncVar => match instr.context() {
                    MemoryContext::Local => {
                        stack.push(self.local(idx, instr.operand + 1)?)?;
                        stack.push(self.local(idx, instr.operand)?)?;
                    }
                    _ => {
                        let slot = field(stack, instr.operand)?;
                        // SAFETY: function fields occupy two words.
                        unsafe {
                            stack.push(*slot.add(1))?;
                            stack.push(*slot)?;
                        }
                    }
                },
                Opcode::StorFuncVar => match instr.context() {
                    MemoryContext::Local => {
                        let first = stack.pop()?;
                        let second = stack.pop()?;
                        *self.local_mut(idx, instr.operand)? = first;
                        *self.local_mut(idx, instr.operand + 1)? = second;
                    }
                    _ => {
                        let slot = field(stack, instr.operand)?;
                        let first = stack.pop()?;
                        let second = stack.pop()?;
                        // SAFETY: function fields occupy two words.
                        unsafe {
                            *slot = first;
                            *slot.add(1) = second;
                        }
                    }
                },
                Opcode::LoadLoclIntVar => stack.push(self.local(idx, instr.operand)?)?,
                Opcode::StorLoclIntVar => {
                    let value = stack.pop()?;
                    *self.local_mut(idx, instr.operand)? = value;
                }
                Opcode::CopyLoclIntVar => {
                    let value = stack.peek()?;
                    *self.local_mut(idx, instr.operand)? = value;
                }
                Opcode::LoadClsInstIntVar => {
                    let slot = field(stack, instr.operand)?;
                    // SAFETY: address inside live memory.
                    stack.push(unsafe { *slot })?;
                }
                Opcode::StorClsInstIntVar => {
                    let slot = field(stack, instr.operand)?;
                    let value = stack.pop()?;
                    // SAFETY: address inside live memory.
                    unsafe { *slot = value };
                }
                Opcode::CopyClsInstIntVar => {
                    let slot = field(stack, instr.operand)?;
                    let value = stack.peek()?;
                    // SAFETY: address inside live memory.
                    unsafe { *slot = value };
                }
                Opcode::LoadClsMem => {
                    stack.push(self.runtime().class_memory(method.class_id) as i64)?
                }
                Opcode::LoadInstMem => stack.push(self.frames[idx].mem[0])?,

                // ====================
                // array elements
                // ====================
                Opcode::LoadByteAryElm => {
                    let elm = element(stack, instr, ElemKind::Byte)?;
                    // SAFETY: bounds checked by `element`.
                    stack.push(unsafe { *elm } as i64)?;
                }
                Opcode::LoadCharAryElm => {
                    let elm = element(stack, instr, ElemKind::Char)?;
                    // SAFETY: bounds checked by `element`.
                    stack.push(unsafe { *(elm as *const u32) } as i64)?;
                }
                Opcode::LoadIntAryElm | Opcode::LoadFloatAryElm => {
                    let elm = element(stack, instr, ElemKind::Int)?;
                    // SAFETY: bounds checked by `element`.
                    stack.push(unsafe { *(elm as *const i64) })?;
                }
                Opcode::StorByteAryElm => {
                    let elm = element(stack, instr, ElemKind::Byte)?;
                    let value = stack.pop()?;
                    // SAFETY: bounds checked by `element`.
                    unsafe { *elm = value as u8 };
                }
                Opcode::StorCharAryElm => {
                    let elm = element(stack, instr, ElemKind::Char)?;
                    let value = stack.pop()?;
                    // SAFETY: bounds checked by `element`.
                    unsafe { *(elm as *mut u32) = value as u32 };
                }
                Opcode::StorIntAryElm | Opcode::StorFloatAryElm => {
                    let elm = element(stack, instr, ElemKind::Int)?;
                    let value = stack.pop()?;
                    // SAFETY: bounds checked by `element`.
                    unsafe { *(elm as *mut i64) = value };
                }

                // ====================
                // integer arithmetic
                // ====================
                Opcode::AddInt
                | Opcode::SubInt
                | Opcode::MulInt
                | Opcode::DivInt
                | Opcode::ModInt
                | Opcode::ShlInt
                | Opcode::ShrInt
                | Opcode::AndInt
                | Opcode::OrInt
                | Opcode::BitAndInt
                | Opcode::BitOrInt
                | Opcode::BitXorInt
                | Opcode::LesInt
                | Opcode::GtrInt
                | Opcode::LesEqlInt
                | Opcode::GtrEqlInt
                | Opcode::EqlInt
                | Opcode::NeqlInt => {
                    let right = stack.pop()?;
                    let left = stack.pop()?;
                    stack.push(int_binary(instr.op, left, right)?)?;
                }
                Opcode::BitNotInt => {
                    let value = stack.pop()?;
                    stack.push(!value)?;
                }

                // ====================
                // float arithmetic
                // ====================
                Opcode::AddFloat | Opcode::SubFloat | Opcode::MulFloat | Opcode::DivFloat => {
                    let right = stack.pop_float()?;
                    let left = stack.pop_float()?;
                    let value = match instr.op {
                        Opcode::AddFloat => left + right,
                        Opcode::SubFloat => left - right,
                        Opcode::MulFloat => left * right,
                        _ => {
                            if right == 0.0 {
                                return Err(VmError::div_zero());
                            }
                            left / right
                        }
                    };
                    stack.push_float(value)?;
                }
                Opcode::LesFloat
                | Opcode::GtrFloat
                | Opcode::LesEqlFloat
                | Opcode::GtrEqlFloat
                | Opcode::EqlFloat
                | Opcode::NeqlFloat => {
                    let right = stack.pop_float()?;
                    let left = stack.pop_float()?;
                    let value = match instr.op {
                        Opcode::LesFloat => left < right,
                        Opcode::GtrFloat => left > right,
                        Opcode::LesEqlFloat => left <= right,
                        Opcode::GtrEqlFloat => left >= right,
                        Opcode::EqlFloat => left == right,
                        _ => left != right,
                    };
                    stack.push(value as i64)?;
                }
                Opcode::I2F => {
                    let value = stack.pop()?;
                    stack.push_float(value as f64)?;
                }
                Opcode::F2I => {
                    let value = stack.pop_float()?;
                    stack.push(bytecode::f2i(value))?;
                }

                // ====================
                // control flow
                // ====================
                Opcode::Jmp => {
                    let taken = instr.operand2 == -1 || stack.pop()? == instr.operand2;
                    if taken {
                        if instr.operand < 0 || instr.operand as usize >= instrs.len() {
                            return Err(VmError::InvalidJump {
                                target: instr.operand,
                                trace: Vec::new(),
                            });
                        }
                        ip = instr.operand as usize;
                    }
                }
                Opcode::Rtrn => return Ok(()),

                // ====================
                // everything else goes through the runtime
                // ====================
                _ => {
                    self.frames[idx].ip = ip;
                    let instance = self.frames[idx].instance();
                    bridge::dispatch(self, stack, instr, instance)?;
                }
            }
        }
        Ok(())
    }

    fn local(&self, idx: usize, slot: i64) -> Result<i64, VmError> {
        usize::try_from(slot)
            .ok()
            .and_then(|slot| self.frames[idx].mem.get(slot + 1).copied())
            .ok_or_else(|| VmError::over(slot, self.frames[idx].mem.len() as i64 - 1))
    }

    fn local_mut(&mut self, idx: usize, slot: i64) -> Result<&mut i64, VmError> {
        let len = self.frames[idx].mem.len() as i64 - 1;
        usize::try_from(slot)
            .ok()
            .and_then(|slot| self.frames[idx].mem.get_mut(slot + 1))
            .ok_or_else(|| VmError::over(slot, len))
    }
}

/// Pops an instance or class memory handle and returns the address of word
/// `slot`. Loaded programs only address fields inside the declared layout.
fn field(stack: OperandStack, slot: i64) -> Result<*mut i64, VmError> {
    let mem = stack.pop()? as Handle;
    if mem.is_null() {
        return Err(VmError::nil());
    }
    Ok(mem.wrapping_add(slot.max(0) as usize))
}

/// Pops an array and its indices and returns the element address.
fn element(stack: OperandStack, instr: &Instruction, kind: ElemKind) -> Result<*mut u8, VmError> {
    let array = stack.pop()? as Handle;
    if array.is_null() {
        return Err(VmError::nil());
    }
    let dims = instr.operand.max(1) as usize;
    let mut index = stack.pop()?;
    for i in 1..dims {
        // SAFETY: non-nil array with `dims` extents.
        let extent = unsafe { heap::array_extent(array, i) };
        index = index.wrapping_mul(extent).wrapping_add(stack.pop()?);
    }
    // SAFETY: non-nil array handle.
    let bound = unsafe { heap::array_len(array) };
    if index < 0 {
        return Err(VmError::under(index));
    }
    if index >= bound {
        return Err(VmError::over(index, bound));
    }
    // SAFETY: 0 <= index < bound.
    Ok(unsafe { heap::array_payload(array).add((index as usize) << kind.shift()) })
}

fn int_binary(op: Opcode, left: i64, right: i64) -> Result<i64, VmError> {
    Ok(match op {
        Opcode::AddInt => left.wrapping_add(right),
        Opcode::SubInt => left.wrapping_sub(right),
        Opcode::MulInt => left.wrapping_mul(right),
        Opcode::DivInt | Opcode::ModInt => {
            if right == 0 {
                return Err(VmError::div_zero());
            }
            if op == Opcode::DivInt {
                left.wrapping_div(right)
            } else {
                left.wrapping_rem(right)
            }
        }
        Opcode::ShlInt => left.wrapping_shl(right as u32),
        Opcode::ShrInt => left.wrapping_shr(right as u32),
        Opcode::AndInt | Opcode::BitAndInt => left & right,
        Opcode::OrInt | Opcode::BitOrInt => left | right,
        Opcode::BitXorInt => left ^ right,
        Opcode::LesInt => (left < right) as i64,
        Opcode::GtrInt => (left > right) as i64,
        Opcode::LesEqlInt => (left <= right) as i64,
        Opcode::GtrEqlInt => (left >= right) as i64,
        Opcode::EqlInt => (left == right) as i64,
        _ => (left != right) as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JitMode, RuntimeConfig};
    use crate::vm::asm;
    use crate::vm::program::{Class, Program, ReturnKind};
    use crate::vm::runtime::Runtime;

    fn single(instrs: Vec<Instruction>) -> (Arc<Runtime>, Arc<Method>) {
        let mut program = Program::new();
        let mut cls = Class::new("Main", None, 2, 1);
        cls.add_method(Method::new("main", 0, ReturnKind::Int, instrs));
        program.add_class(cls);
        let config = RuntimeConfig::default().with_jit_mode(JitMode::Off);
        let rt = Runtime::with_output(program, config, Box::new(std::io::sink())).unwrap();
        let method = rt.program().method(0, 0).unwrap().clone();
        (rt, method)
    }

    fn eval(instrs: Vec<Instruction>) -> Result<Vec<i64>, VmError> {
        let (rt, method) = single(instrs);
        ExecContext::new(rt).run(&method, &[])
    }

    #[test]
    fn test_division_pops_right_first() {
        let stack = eval(vec![asm::int(7), asm::int(3), asm::op(Opcode::DivInt), asm::rtrn()]);
        assert_eq!(stack.unwrap(), vec![2]);
    }

    #[test]
    fn test_division_by_zero_leaves_caller_stack() {
        let err = eval(vec![asm::int(1), asm::int(0), asm::op(Opcode::DivInt), asm::rtrn()])
            .unwrap_err();
        assert!(matches!(err, VmError::DivideByZero { .. }));
        assert_eq!(err.trace(), &["Main:main".to_string()]);
    }

    #[test]
    fn test_wrapping_min_by_minus_one() {
        let stack = eval(vec![
            asm::int(i64::MIN),
            asm::int(-1),
            asm::op(Opcode::DivInt),
            asm::int(i64::MIN),
            asm::int(-1),
            asm::op(Opcode::ModInt),
            asm::rtrn(),
        ]);
        assert_eq!(stack.unwrap(), vec![i64::MIN, 0]);
    }

    #[test]
    fn test_loop_sums_to_ten() {
        // i = 0; sum = 0; while i < 5 { sum += i; i += 1 }
        let stack = eval(vec![
            asm::int(0),
            asm::store_local(0),
            asm::int(0),
            asm::store_local(1),
            asm::label(1),
            asm::load_local(0),
            asm::int(5),
            asm::op(Opcode::LesInt),
            asm::jmp_if(18, 0),
            asm::load_local(1),
            asm::load_local(0),
            asm::op(Opcode::AddInt),
            asm::store_local(1),
            asm::load_local(0),
            asm::int(1),
            asm::op(Opcode::AddInt),
            asm::store_local(0),
            asm::jmp(4),
            asm::label(2),
            asm::load_local(1),
            asm::rtrn(),
        ]);
        assert_eq!(stack.unwrap(), vec![10]);
    }

    #[test]
    fn test_array_bounds_on_flat_index() {
        let build = |i: i64, j: i64| {
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
        };
        assert!(matches!(eval(build(2, 5)), Err(VmError::IndexOverBounds { index: 13, bound: 12, .. })));
        assert!(matches!(eval(build(-1, 0)), Err(VmError::IndexUnderBounds { .. })));
        assert_eq!(eval(build(2, 3)).unwrap(), vec![0]);
    }

    #[test]
    fn test_nil_field_access() {
        let err = eval(vec![asm::int(0), asm::load_field(0), asm::rtrn()]).unwrap_err();
        assert!(matches!(err, VmError::NilDereference { .. }));
    }

    #[test]
    fn test_copy_keeps_value() {
        let stack = eval(vec![
            asm::int(9),
            asm::copy_local(0),
            asm::load_local(0),
            asm::op(Opcode::AddInt),
            asm::rtrn(),
        ]);
        assert_eq!(stack.unwrap(), vec![18]);
    }

    #[test]
    fn test_float_compare_with_nan() {
        let stack = eval(vec![
            asm::float(f64::NAN),
            asm::float(1.0),
            asm::op(Opcode::LesFloat),
            asm::float(f64::NAN),
            asm::float(f64::NAN),
            asm::op(Opcode::NeqlFloat),
            asm::rtrn(),
        ]);
        assert_eq!(stack.unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_bad_jump_target() {
        let err = eval(vec![asm::jmp(42)]).unwrap_err();
        assert!(matches!(err, VmError::InvalidJump { target: 42, .. }));
    }

    #[test]
    fn test_params_consumed_by_leading_stores() {
        let mut program = Program::new();
        let mut cls = Class::new("Main", None, 2, 1);
        cls.add_method(Method::new(
            "main",
            0,
            ReturnKind::Int,
            vec![
                asm::int(20),
                asm::int(22),
                asm::int(0),
                asm::call(0, 1),
                asm::rtrn(),
            ],
        ));
        cls.add_method(Method::new(
            "add",
            2,
            ReturnKind::Int,
            vec![
                asm::store_local(0),
                asm::store_local(1),
                asm::load_local(1),
                asm::load_local(0),
                asm::op(Opcode::SubInt),
                asm::rtrn(),
            ],
        ));
        program.add_class(cls);
        let config = RuntimeConfig::default().with_jit_mode(JitMode::Off);
        let rt = Runtime::with_output(program, config, Box::new(std::io::sink())).unwrap();
        let main = rt.program().method(0, 0).unwrap().clone();
        // the nil instance sits above the arguments
        let mut ctx = ExecContext::new(rt);
        assert_eq!(ctx.run(&main, &[]).unwrap(), vec![-2]);
    }
}
