//! Single-pass code generation over a symbolic operand stack.
//!
//! The generator walks the bytecode once, keeping the top of the operand
//! stack as [`SymValue`]s instead of memory traffic. At every point the real
//! operand stack followed by the symbolic stack equals what the interpreter
//! would hold. Popping past the bottom of the symbolic stack reads the real
//! one, which is how method parameters arrive.

use tracing::trace;

use super::backend::{
    Backend, Cmp, CompileError, EXIT_STATUS, FCmp, FLOAT_SPILL_BASE, FLOAT_SPILL_SLOTS,
    FloatOp, FrameLayout, INT_SPILL_BASE, INT_SPILL_SLOTS, IntOp, Slot, Src, Width,
};
use super::codebuf::CodeBuffer;
use super::fixup::{BranchSite, FaultKind, FixupTable, JumpTarget};
use super::regalloc::{Lease, RegisterAllocator};
use crate::vm::bytecode::{self, Instruction, MemoryContext, Opcode, Produces};
use crate::vm::heap::{self, ElemKind};
use crate::vm::program::{Method, Program, ReturnKind};

/// A value that would be on the interpreter's operand stack.
#[derive(Debug)]
enum SymValue<G, F> {
    Imm(i64),
    Reg(Lease<G>),
    /// Not yet loaded local `k`.
    Slot(u32),
    FloatImm(f64),
    FloatReg(Lease<F>),
    FloatSlot(u32),
}

type Value<B> = SymValue<<B as Backend>::Gpr, <B as Backend>::Fpr>;

pub struct CodeGenerator<'p, B: Backend> {
    backend: B,
    program: &'p Program,
    method: &'p Method,
    layout: FrameLayout,
    stack: Vec<Value<B>>,
    ints: RegisterAllocator<B::Gpr>,
    floats: RegisterAllocator<B::Fpr>,
    fixups: FixupTable,
    ip: usize,
    /// Words above the real stack position known to fit under the limit.
    covered: usize,
    /// Patch point of the newest limit check while it can still be widened.
    reserve: Option<usize>,
}

impl<'p, B: Backend> CodeGenerator<'p, B> {
    pub fn new(backend: B, program: &'p Program, method: &'p Method) -> Self {
        let ints = backend.int_allocator();
        let floats = backend.float_allocator();
        Self {
            backend,
            program,
            method,
            layout: FrameLayout::new(method.local_words as u32),
            stack: Vec::new(),
            ints,
            floats,
            fixups: FixupTable::new(),
            ip: 0,
            covered: 0,
            reserve: None,
        }
    }

    /// Emits the whole method and returns the patched code with its
    /// literal pool.
    pub fn generate(mut self) -> Result<(CodeBuffer, Box<[u64]>), CompileError> {
        self.backend.prologue(&self.layout);

        let method = self.method;
        let mut ip = 0;
        while ip < method.instrs.len() {
            self.ip = ip;
            let instr = &method.instrs[ip];
            trace!(target: "jit", ip, op = %instr.op, depth = self.stack.len(), "emit");
            if writes_memory(instr.op) {
                self.seal();
            }
            ip += self.instruction(instr)?;
            if self.ints.failed() || self.floats.failed() {
                return Err(CompileError::RegistersExhausted);
            }
            self.reserve_depth();
        }
        // falling off the end behaves like RTRN
        self.flush_top(self.stack.len());

        self.fixups.bind(JumpTarget::Exit, self.backend.offset());
        let site = self.backend.status_stub(EXIT_STATUS);
        self.fixups.add(site, JumpTarget::Teardown);
        for kind in FaultKind::ALL {
            self.fixups.bind(JumpTarget::Fault(kind), self.backend.offset());
            let site = self.backend.status_stub(kind.status());
            self.fixups.add(site, JumpTarget::Teardown);
        }
        self.fixups.bind(JumpTarget::Teardown, self.backend.offset());
        self.backend.teardown(&self.layout);

        let (mut buf, consts) = self.backend.finish();
        self.fixups.resolve(&mut buf)?;
        Ok((buf, consts))
    }

    /// Emits one instruction and returns how many instructions it consumed.
    fn instruction(&mut self, instr: &'p Instruction) -> Result<usize, CompileError> {
        use Opcode::*;
        match instr.op {
            LoadIntLit | LoadCharLit => self.stack.push(SymValue::Imm(instr.operand)),
            LoadFloatLit => self.stack.push(SymValue::FloatImm(instr.float_operand)),
            Lbl => {
                if !self.stack.is_empty() {
                    return Err(self.shape("label"));
                }
                self.covered = 0;
                self.seal();
                self.fixups
                    .bind(JumpTarget::Instruction(self.ip), self.backend.offset());
            }

            LoadIntVar | LoadFloatVar | LoadLoclIntVar | LoadClsInstIntVar => {
                self.load_var(instr, instr.op == LoadFloatVar)?
            }
            StorIntVar | StorFloatVar | StorLoclIntVar | StorClsInstIntVar => {
                self.store_var(instr, false)?
            }
            CopyIntVar | CopyFloatVar | CopyLoclIntVar | CopyClsInstIntVar => {
                self.store_var(instr, true)?
            }
            LoadFuncVar => self.load_func_var(instr)?,
            StorFuncVar => self.store_func_var(instr)?,
            LoadClsMem => self.load_frame_slot(Slot::ClsMem),
            LoadInstMem => self.load_frame_slot(Slot::Instance),

            LoadByteAryElm => self.load_element(instr, ElemKind::Byte)?,
            LoadCharAryElm => self.load_element(instr, ElemKind::Char)?,
            LoadIntAryElm => self.load_element(instr, ElemKind::Int)?,
            LoadFloatAryElm => self.load_element(instr, ElemKind::Float)?,
            StorByteAryElm => self.store_element(instr, ElemKind::Byte)?,
            StorCharAryElm => self.store_element(instr, ElemKind::Char)?,
            StorIntAryElm => self.store_element(instr, ElemKind::Int)?,
            StorFloatAryElm => self.store_element(instr, ElemKind::Float)?,
            LoadArySize => {
                let array = self.pop_int_reg()?;
                self.fault_if(FaultKind::Nil, |b| b.nil_check(array.reg()));
                self.backend
                    .load(array.reg(), array.reg(), 16, Width::Word);
                self.stack.push(SymValue::Reg(array));
            }

            AddInt => self.int_binary(IntOp::Add)?,
            SubInt => self.int_binary(IntOp::Sub)?,
            MulInt => self.int_binary(IntOp::Mul)?,
            AndInt | BitAndInt => self.int_binary(IntOp::And)?,
            OrInt | BitOrInt => self.int_binary(IntOp::Or)?,
            BitXorInt => self.int_binary(IntOp::Xor)?,
            ShlInt => self.int_binary(IntOp::Shl)?,
            ShrInt => self.int_binary(IntOp::Shr)?,
            DivInt => self.int_divide(false)?,
            ModInt => self.int_divide(true)?,
            BitNotInt => match self.pop_int()? {
                SymValue::Imm(v) => self.stack.push(SymValue::Imm(!v)),
                other => {
                    let reg = self.into_int_reg(other)?;
                    self.backend.not(reg.reg());
                    self.stack.push(SymValue::Reg(reg));
                }
            },
            EqlInt | NeqlInt | LesInt | GtrInt | LesEqlInt | GtrEqlInt => {
                return self.int_compare(int_cmp(instr.op));
            }

            AddFloat => self.float_binary(FloatOp::Add)?,
            SubFloat => self.float_binary(FloatOp::Sub)?,
            MulFloat => self.float_binary(FloatOp::Mul)?,
            DivFloat => self.float_binary(FloatOp::Div)?,
            EqlFloat | NeqlFloat | LesFloat | GtrFloat | LesEqlFloat | GtrEqlFloat => {
                return self.float_compare(float_cmp(instr.op));
            }
            I2F => match self.pop_int()? {
                SymValue::Imm(v) => self.stack.push(SymValue::FloatImm(v as f64)),
                other => {
                    let src = self.into_int_reg(other)?;
                    let dst = self.floats.acquire();
                    self.backend.i2f(dst.reg(), src.reg());
                    self.ints.release(src);
                    self.stack.push(SymValue::FloatReg(dst));
                }
            },
            F2I => match self.pop_float() {
                SymValue::FloatImm(v) => self.stack.push(SymValue::Imm(bytecode::f2i(v))),
                other => {
                    let src = self.into_float_reg(other)?;
                    let dst = self.ints.acquire();
                    self.backend.f2i(dst.reg(), src.reg());
                    self.floats.release(src);
                    self.stack.push(SymValue::Reg(dst));
                }
            },

            PopInt | PopFloat => match self.stack.pop() {
                Some(value) => self.discard(value),
                None => {
                    self.backend.op_stack_drop();
                    self.popped_real();
                }
            },
            SwapInt => {
                let top = self.pop();
                let below = self.pop();
                self.stack.push(top);
                self.stack.push(below);
            }

            Jmp => self.jump(instr)?,
            Rtrn => {
                self.flush_top(self.stack.len());
                let site = self.backend.jump();
                self.fixups.add(site, JumpTarget::Exit);
            }

            MthdCall => {
                let callee = self
                    .callee(instr.operand, instr.operand2)
                    .ok_or(CompileError::UnknownCallee {
                        class: instr.operand,
                        method: instr.operand2,
                        ip: self.ip,
                    })?;
                let (params, rtrn) = (callee.params, callee.rtrn);
                self.bridge(instr, params + 1, results(rtrn))?;
            }
            DynMthdCall => {
                let params = usize::try_from(instr.operand).unwrap_or(0);
                let rtrn = ReturnKind::from_code(instr.operand2);
                self.bridge(instr, params + 2, results(rtrn))?;
            }

            op => match op.bridge_shape(instr.operand) {
                Some((consumed, Produces::Nothing)) => self.bridge(instr, consumed, &[])?,
                Some((consumed, Produces::Int)) => {
                    self.bridge(instr, consumed, &[Produces::Int])?
                }
                Some((consumed, Produces::Float)) => {
                    self.bridge(instr, consumed, &[Produces::Float])?
                }
                None => {
                    return Err(CompileError::Unsupported {
                        op: op.to_string(),
                        ip: self.ip,
                    });
                }
            },
        }
        Ok(1)
    }

    fn callee(&self, cls: i64, mthd: i64) -> Option<&'p Method> {
        let cls = usize::try_from(cls).ok()?;
        let mthd = usize::try_from(mthd).ok()?;
        self.program.method(cls, mthd).map(|m| m.as_ref())
    }

    fn shape(&self, reason: &'static str) -> CompileError {
        CompileError::StackShape {
            ip: self.ip,
            reason,
        }
    }

    fn fault_if(&mut self, kind: FaultKind, emit: impl FnOnce(&mut B) -> BranchSite) {
        self.seal();
        let site = emit(&mut self.backend);
        self.fixups.add(site, JumpTarget::Fault(kind));
    }

    fn branch_to(&mut self, site: BranchSite, target: usize) {
        self.seal();
        self.fixups.add(site, JumpTarget::Instruction(target));
    }

    // ==================== operand stack limit ====================

    /// Checks that the real stack can take the whole symbolic stack. Growth
    /// with nothing observable in between widens the open check instead of
    /// emitting another one.
    fn reserve_depth(&mut self) {
        let depth = self.stack.len();
        if depth <= self.covered {
            return;
        }
        let words = u32::try_from(depth).unwrap_or(u32::MAX);
        match self.reserve {
            Some(at) => self.backend.patch_reserve(at, words),
            None => {
                let (at, site) = self.backend.op_stack_reserve(words);
                self.fixups
                    .add(site, JumpTarget::Fault(FaultKind::StackOverflow));
                self.reserve = Some(at);
            }
        }
        self.covered = depth;
    }

    /// Closes the open limit check. Called whenever the real stack position
    /// moves or the code does something a later overflow must not precede.
    fn seal(&mut self) {
        self.reserve = None;
    }

    fn popped_real(&mut self) {
        self.covered += 1;
        self.seal();
    }

    fn pop_real(&mut self) -> Value<B> {
        let reg = self.ints.acquire();
        self.backend.op_stack_pop(reg.reg());
        self.popped_real();
        SymValue::Reg(reg)
    }

    fn pop_real_float(&mut self) -> Value<B> {
        let reg = self.floats.acquire();
        self.backend.op_stack_pop_float(reg.reg());
        self.popped_real();
        SymValue::FloatReg(reg)
    }

    // ==================== symbolic stack ====================

    fn pop(&mut self) -> Value<B> {
        match self.stack.pop() {
            Some(value) => value,
            None => self.pop_real(),
        }
    }

    fn pop_float(&mut self) -> Value<B> {
        match self.stack.pop() {
            Some(value) => value,
            None => self.pop_real_float(),
        }
    }

    /// Pops a value as an integer-class operand: `Imm`, `Reg` or `Slot`.
    fn pop_int(&mut self) -> Result<Value<B>, CompileError> {
        let value = self.pop();
        Ok(match value {
            SymValue::FloatImm(v) => SymValue::Imm(v.to_bits() as i64),
            SymValue::FloatSlot(k) => SymValue::Slot(k),
            SymValue::FloatReg(src) => {
                let dst = self.ints.acquire();
                self.backend.float_bits_to_int(dst.reg(), src.reg());
                self.floats.release(src);
                SymValue::Reg(dst)
            }
            other => other,
        })
    }

    fn pop_int_reg(&mut self) -> Result<Lease<B::Gpr>, CompileError> {
        let value = self.pop_int()?;
        self.into_int_reg(value)
    }

    fn discard(&mut self, value: Value<B>) {
        match value {
            SymValue::Reg(reg) => self.ints.release(reg),
            SymValue::FloatReg(reg) => self.floats.release(reg),
            _ => {}
        }
    }

    fn into_int_reg(&mut self, value: Value<B>) -> Result<Lease<B::Gpr>, CompileError> {
        Ok(match value {
            SymValue::Reg(reg) => reg,
            SymValue::Imm(v) => {
                let reg = self.ints.acquire();
                self.backend.load_imm(reg.reg(), v);
                reg
            }
            SymValue::FloatImm(v) => {
                let reg = self.ints.acquire();
                self.backend.load_imm(reg.reg(), v.to_bits() as i64);
                reg
            }
            SymValue::Slot(k) | SymValue::FloatSlot(k) => {
                let reg = self.ints.acquire();
                self.backend.load_slot(reg.reg(), self.layout.local(k));
                reg
            }
            SymValue::FloatReg(src) => {
                let reg = self.ints.acquire();
                self.backend.float_bits_to_int(reg.reg(), src.reg());
                self.floats.release(src);
                reg
            }
        })
    }

    fn into_float_reg(&mut self, value: Value<B>) -> Result<Lease<B::Fpr>, CompileError> {
        Ok(match value {
            SymValue::FloatReg(reg) => reg,
            SymValue::FloatImm(v) => {
                let reg = self.floats.acquire();
                self.backend.load_float_imm(reg.reg(), v)?;
                reg
            }
            SymValue::Imm(v) => {
                let reg = self.floats.acquire();
                self.backend
                    .load_float_imm(reg.reg(), f64::from_bits(v as u64))?;
                reg
            }
            SymValue::Slot(k) | SymValue::FloatSlot(k) => {
                let reg = self.floats.acquire();
                self.backend.fload_slot(reg.reg(), self.layout.local(k));
                reg
            }
            SymValue::Reg(src) => {
                let reg = self.floats.acquire();
                self.backend.int_to_float_bits(reg.reg(), src.reg());
                self.ints.release(src);
                reg
            }
        })
    }

    /// Source operand for an integer-class value.
    fn src(&self, value: &Value<B>) -> Src<B::Gpr> {
        match value {
            SymValue::Imm(v) => Src::Imm(*v),
            SymValue::Reg(reg) => Src::Reg(reg.reg()),
            SymValue::Slot(k) | SymValue::FloatSlot(k) => Src::Slot(self.layout.local(*k)),
            SymValue::FloatImm(v) => Src::Imm(v.to_bits() as i64),
            // callers convert float registers first
            SymValue::FloatReg(_) => Src::Imm(0),
        }
    }

    /// Writes the top `n` symbolic values to the real operand stack,
    /// bottom first.
    fn flush_top(&mut self, n: usize) {
        let start = self.stack.len().saturating_sub(n);
        let values: Vec<_> = self.stack.drain(start..).collect();
        self.covered = self.covered.saturating_sub(values.len());
        self.seal();
        for value in values {
            match value {
                SymValue::FloatReg(reg) => {
                    self.backend.op_stack_push_float(reg.reg());
                    self.floats.release(reg);
                }
                other => {
                    let src = self.src(&other);
                    self.backend.op_stack_push(src);
                    self.discard(other);
                }
            }
        }
    }

    /// Loads every pending read of local `k` before the local changes.
    fn materialize_local(&mut self, k: u32) {
        for i in 0..self.stack.len() {
            match self.stack[i] {
                SymValue::Slot(j) if j == k => {
                    let reg = self.ints.acquire();
                    self.backend.load_slot(reg.reg(), self.layout.local(k));
                    self.stack[i] = SymValue::Reg(reg);
                }
                SymValue::FloatSlot(j) if j == k => {
                    let reg = self.floats.acquire();
                    self.backend.fload_slot(reg.reg(), self.layout.local(k));
                    self.stack[i] = SymValue::FloatReg(reg);
                }
                _ => {}
            }
        }
    }

    /// Turns a pending local read into a register so it survives a store.
    fn pin(&mut self, value: Value<B>) -> Result<Value<B>, CompileError> {
        Ok(match value {
            SymValue::Slot(k) => SymValue::Reg(self.into_int_reg(SymValue::Slot(k))?),
            SymValue::FloatSlot(k) => {
                SymValue::FloatReg(self.into_float_reg(SymValue::FloatSlot(k))?)
            }
            other => other,
        })
    }

    // ==================== variables ====================

    fn local_index(&self, instr: &Instruction) -> Result<u32, CompileError> {
        u32::try_from(instr.operand).map_err(|_| CompileError::Unsupported {
            op: instr.to_string(),
            ip: self.ip,
        })
    }

    fn field_disp(instr: &Instruction, word: i64) -> i32 {
        ((instr.operand.max(0) + word) * 8) as i32
    }

    /// Pops and nil-checks the memory handle of a class or instance access.
    fn pop_handle(&mut self) -> Result<Lease<B::Gpr>, CompileError> {
        let handle = self.pop_int_reg()?;
        self.fault_if(FaultKind::Nil, |b| b.nil_check(handle.reg()));
        Ok(handle)
    }

    fn load_var(&mut self, instr: &Instruction, float: bool) -> Result<(), CompileError> {
        if instr.context() == MemoryContext::Local {
            let k = self.local_index(instr)?;
            self.stack.push(if float {
                SymValue::FloatSlot(k)
            } else {
                SymValue::Slot(k)
            });
            return Ok(());
        }
        let handle = self.pop_handle()?;
        let disp = Self::field_disp(instr, 0);
        if float {
            let dst = self.floats.acquire();
            self.backend.fload(dst.reg(), handle.reg(), disp);
            self.ints.release(handle);
            self.stack.push(SymValue::FloatReg(dst));
        } else {
            self.backend
                .load(handle.reg(), handle.reg(), disp, Width::Word);
            self.stack.push(SymValue::Reg(handle));
        }
        Ok(())
    }

    fn store_var(&mut self, instr: &Instruction, keep: bool) -> Result<(), CompileError> {
        if instr.context() == MemoryContext::Local {
            let k = self.local_index(instr)?;
            let value = self.pop();
            let value = if keep { self.pin(value)? } else { value };
            self.materialize_local(k);
            self.write_local(k, &value);
            if keep {
                self.stack.push(value);
            } else {
                self.discard(value);
            }
            return Ok(());
        }
        let handle = self.pop_handle()?;
        let value = self.pop();
        let value = if keep { self.pin(value)? } else { value };
        self.write_mem(handle.reg(), Self::field_disp(instr, 0), Width::Word, &value);
        self.ints.release(handle);
        if keep {
            self.stack.push(value);
        } else {
            self.discard(value);
        }
        Ok(())
    }

    fn load_func_var(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        if instr.context() == MemoryContext::Local {
            let k = self.local_index(instr)?;
            self.stack.push(SymValue::Slot(k + 1));
            self.stack.push(SymValue::Slot(k));
            return Ok(());
        }
        let handle = self.pop_handle()?;
        let second = self.ints.acquire();
        self.backend.load(
            second.reg(),
            handle.reg(),
            Self::field_disp(instr, 1),
            Width::Word,
        );
        self.backend.load(
            handle.reg(),
            handle.reg(),
            Self::field_disp(instr, 0),
            Width::Word,
        );
        self.stack.push(SymValue::Reg(second));
        self.stack.push(SymValue::Reg(handle));
        Ok(())
    }

    fn store_func_var(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        if instr.context() == MemoryContext::Local {
            let k = self.local_index(instr)?;
            let first = self.pop();
            let first = self.pin(first)?;
            let second = self.pop();
            let second = self.pin(second)?;
            self.materialize_local(k);
            self.materialize_local(k + 1);
            self.write_local(k, &first);
            self.write_local(k + 1, &second);
            self.discard(first);
            self.discard(second);
            return Ok(());
        }
        let handle = self.pop_handle()?;
        let first = self.pop();
        let second = self.pop();
        let base = handle.reg();
        self.write_mem(base, Self::field_disp(instr, 0), Width::Word, &first);
        self.write_mem(base, Self::field_disp(instr, 1), Width::Word, &second);
        self.discard(first);
        self.discard(second);
        self.ints.release(handle);
        Ok(())
    }

    fn load_frame_slot(&mut self, slot: Slot) {
        let dst = self.ints.acquire();
        self.backend.load_slot(dst.reg(), slot.index());
        self.stack.push(SymValue::Reg(dst));
    }

    fn write_local(&mut self, k: u32, value: &Value<B>) {
        let slot = self.layout.local(k);
        match value {
            SymValue::FloatReg(reg) => self.backend.fstore_slot(slot, reg.reg()),
            // a local copied onto itself
            SymValue::Slot(j) | SymValue::FloatSlot(j) if *j == k => {}
            other => {
                let src = self.src(other);
                self.backend.store_slot(slot, src);
            }
        }
    }

    fn write_mem(&mut self, base: B::Gpr, disp: i32, width: Width, value: &Value<B>) {
        match value {
            SymValue::FloatReg(reg) => self.backend.fstore(base, disp, reg.reg()),
            other => {
                let src = self.src(other);
                self.backend.store(base, disp, width, src);
            }
        }
    }

    // ==================== arrays ====================

    /// Pops the array and its indices, checks them and leaves the element
    /// address in the returned register.
    fn element_address(
        &mut self,
        instr: &Instruction,
        kind: ElemKind,
    ) -> Result<Lease<B::Gpr>, CompileError> {
        let dims = instr.operand.max(1) as usize;
        let array = self.pop_int_reg()?;
        self.fault_if(FaultKind::Nil, |b| b.nil_check(array.reg()));

        let index = self.pop_int_reg()?;
        for dim in 1..dims {
            self.backend.mul_extent(index.reg(), array.reg(), dim);
            let next = self.pop_int()?;
            let src = self.src(&next);
            self.backend.int_op(IntOp::Add, index.reg(), src);
            self.discard(next);
        }

        let (under, over) = self.backend.bounds_check(index.reg(), array.reg());
        self.fixups.add(under, JumpTarget::Fault(FaultKind::Under));
        self.fixups.add(over, JumpTarget::Fault(FaultKind::Over));
        let payload = (heap::payload_words(dims) * 8) as i32;
        self.backend
            .index_address(index.reg(), array.reg(), kind.shift(), payload);
        self.ints.release(array);
        Ok(index)
    }

    fn load_element(&mut self, instr: &Instruction, kind: ElemKind) -> Result<(), CompileError> {
        let addr = self.element_address(instr, kind)?;
        match kind {
            ElemKind::Float => {
                let dst = self.floats.acquire();
                self.backend.fload(dst.reg(), addr.reg(), 0);
                self.ints.release(addr);
                self.stack.push(SymValue::FloatReg(dst));
            }
            _ => {
                self.backend
                    .load(addr.reg(), addr.reg(), 0, elem_width(kind));
                self.stack.push(SymValue::Reg(addr));
            }
        }
        Ok(())
    }

    fn store_element(&mut self, instr: &Instruction, kind: ElemKind) -> Result<(), CompileError> {
        let addr = self.element_address(instr, kind)?;
        let value = self.pop();
        self.write_mem(addr.reg(), 0, elem_width(kind), &value);
        self.discard(value);
        self.ints.release(addr);
        Ok(())
    }

    // ==================== arithmetic ====================

    fn int_binary(&mut self, op: IntOp) -> Result<(), CompileError> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        if let (SymValue::Imm(a), SymValue::Imm(b)) = (&left, &right) {
            self.stack.push(SymValue::Imm(op.fold(*a, *b)));
            return Ok(());
        }
        let dst = self.into_int_reg(left)?;
        let src = self.src(&right);
        self.backend.int_op(op, dst.reg(), src);
        self.discard(right);
        self.stack.push(SymValue::Reg(dst));
        Ok(())
    }

    fn int_divide(&mut self, rem: bool) -> Result<(), CompileError> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        if let (SymValue::Imm(a), SymValue::Imm(b)) = (&left, &right) {
            if *b != 0 {
                let folded = if rem { a.wrapping_rem(*b) } else { a.wrapping_div(*b) };
                self.stack.push(SymValue::Imm(folded));
                return Ok(());
            }
        }
        let dst = self.into_int_reg(left)?;
        let src = self.src(&right);
        self.fault_if(FaultKind::DivZero, |b| b.div(dst.reg(), src, rem));
        self.discard(right);
        self.stack.push(SymValue::Reg(dst));
        Ok(())
    }

    /// The conditional jump right after a comparison, as (target, when).
    fn fused_jump(&self) -> Option<&'p Instruction> {
        let method: &'p Method = self.method;
        method
            .instrs
            .get(self.ip + 1)
            .filter(|next| next.op == Opcode::Jmp && (next.operand2 == 0 || next.operand2 == 1))
    }

    fn int_compare(&mut self, cond: Cmp) -> Result<usize, CompileError> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        if let (SymValue::Imm(a), SymValue::Imm(b)) = (&left, &right) {
            self.stack.push(SymValue::Imm(cond.eval(*a, *b) as i64));
            return Ok(1);
        }
        let lhs = self.into_int_reg(left)?;
        let src = self.src(&right);
        self.backend.cmp(lhs.reg(), src);
        self.discard(right);

        if let Some(jmp) = self.fused_jump() {
            self.ints.release(lhs);
            if !self.stack.is_empty() {
                return Err(self.shape("conditional jump"));
            }
            let target = self.label_target(jmp.operand)?;
            let cond = if jmp.operand2 == 1 { cond } else { cond.invert() };
            let site = self.backend.branch(cond);
            self.branch_to(site, target);
            return Ok(2);
        }

        self.backend.set_cond(lhs.reg(), cond);
        self.stack.push(SymValue::Reg(lhs));
        Ok(1)
    }

    fn float_binary(&mut self, op: FloatOp) -> Result<(), CompileError> {
        let right = self.pop_float();
        let left = self.pop_float();
        if let (SymValue::FloatImm(a), SymValue::FloatImm(b)) = (&left, &right) {
            if op != FloatOp::Div || *b != 0.0 {
                self.stack.push(SymValue::FloatImm(op.fold(*a, *b)));
                return Ok(());
            }
        }
        let dst = self.into_float_reg(left)?;
        let src = self.into_float_reg(right)?;
        if op == FloatOp::Div {
            self.fault_if(FaultKind::DivZero, |b| b.fdiv_zero_check(src.reg()));
        }
        self.backend.float_op(op, dst.reg(), src.reg());
        self.floats.release(src);
        self.stack.push(SymValue::FloatReg(dst));
        Ok(())
    }

    fn float_compare(&mut self, cond: FCmp) -> Result<usize, CompileError> {
        let right = self.pop_float();
        let left = self.pop_float();
        if let (SymValue::FloatImm(a), SymValue::FloatImm(b)) = (&left, &right) {
            self.stack.push(SymValue::Imm(cond.eval(*a, *b) as i64));
            return Ok(1);
        }
        let lhs = self.into_float_reg(left)?;
        let rhs = self.into_float_reg(right)?;

        if let Some(jmp) = self.fused_jump() {
            let (l, r) = (lhs.reg(), rhs.reg());
            self.floats.release(lhs);
            self.floats.release(rhs);
            if !self.stack.is_empty() {
                return Err(self.shape("conditional jump"));
            }
            let target = self.label_target(jmp.operand)?;
            for site in self.backend.fcmp_branch(l, r, cond, jmp.operand2 == 1) {
                self.branch_to(site, target);
            }
            return Ok(2);
        }

        let dst = self.ints.acquire();
        self.backend.fcmp_set(dst.reg(), lhs.reg(), rhs.reg(), cond);
        self.floats.release(lhs);
        self.floats.release(rhs);
        self.stack.push(SymValue::Reg(dst));
        Ok(1)
    }

    // ==================== control flow ====================

    fn label_target(&self, target: i64) -> Result<usize, CompileError> {
        usize::try_from(target)
            .ok()
            .filter(|&t| {
                self.method
                    .instrs
                    .get(t)
                    .is_some_and(|instr| instr.op == Opcode::Lbl)
            })
            .ok_or(CompileError::BadJumpTarget {
                ip: self.ip,
                target,
            })
    }

    fn jump(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        if instr.operand2 == -1 {
            if !self.stack.is_empty() {
                return Err(self.shape("jump"));
            }
            let target = self.label_target(instr.operand)?;
            let site = self.backend.jump();
            self.branch_to(site, target);
            return Ok(());
        }

        let value = self.pop_int()?;
        if !self.stack.is_empty() {
            self.discard(value);
            return Err(self.shape("conditional jump"));
        }
        let target = self.label_target(instr.operand)?;
        match value {
            SymValue::Imm(v) => {
                if v == instr.operand2 {
                    let site = self.backend.jump();
                    self.branch_to(site, target);
                }
            }
            other => {
                let reg = self.into_int_reg(other)?;
                self.backend.cmp(reg.reg(), Src::Imm(instr.operand2));
                let site = self.backend.branch(Cmp::Eq);
                self.branch_to(site, target);
                self.ints.release(reg);
            }
        }
        Ok(())
    }

    // ==================== runtime bridge ====================

    /// Calls the runtime for `instr`, which consumes the top `consumed`
    /// words and pushes `produces` (bottom first).
    fn bridge(
        &mut self,
        instr: &'p Instruction,
        consumed: usize,
        produces: &[Produces],
    ) -> Result<(), CompileError> {
        self.flush_top(consumed);

        // registers still on the symbolic stack do not survive the call
        let mut int_spills = Vec::new();
        let mut float_spills = Vec::new();
        for value in &self.stack {
            match value {
                SymValue::Reg(reg) => int_spills.push(reg.reg()),
                SymValue::FloatReg(reg) => float_spills.push(reg.reg()),
                _ => {}
            }
        }
        if int_spills.len() > INT_SPILL_SLOTS as usize
            || float_spills.len() > FLOAT_SPILL_SLOTS as usize
        {
            return Err(CompileError::SpillOverflow { ip: self.ip });
        }
        for (i, &reg) in int_spills.iter().enumerate() {
            self.backend
                .store_slot(INT_SPILL_BASE + i as u32, Src::Reg(reg));
        }
        for (i, &reg) in float_spills.iter().enumerate() {
            self.backend.fstore_slot(FLOAT_SPILL_BASE + i as u32, reg);
        }

        let instr_ptr = instr as *const Instruction as i64;
        let site = self
            .backend
            .call_bridge(instr.op.tag(), instr_ptr, self.ip as i64 + 1);
        self.fixups.add(site, JumpTarget::Exit);
        self.covered = (self.covered + consumed).saturating_sub(produces.len());

        for (i, &reg) in int_spills.iter().enumerate() {
            self.backend.load_slot(reg, INT_SPILL_BASE + i as u32);
        }
        for (i, &reg) in float_spills.iter().enumerate() {
            self.backend.fload_slot(reg, FLOAT_SPILL_BASE + i as u32);
        }

        let mut results = Vec::with_capacity(produces.len());
        for kind in produces.iter().rev() {
            results.push(match kind {
                Produces::Float => self.pop_real_float(),
                _ => self.pop_real(),
            });
        }
        self.stack.extend(results.into_iter().rev());
        Ok(())
    }
}

fn results(rtrn: ReturnKind) -> &'static [Produces] {
    match rtrn {
        ReturnKind::Void => &[],
        ReturnKind::Int => &[Produces::Int],
        ReturnKind::Float => &[Produces::Float],
        ReturnKind::Func => &[Produces::Int, Produces::Int],
    }
}

/// Instructions with effects an operand stack overflow raised after them
/// must not skip.
fn writes_memory(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        StorIntVar
            | StorLoclIntVar
            | StorClsInstIntVar
            | StorFloatVar
            | StorFuncVar
            | CopyIntVar
            | CopyLoclIntVar
            | CopyClsInstIntVar
            | CopyFloatVar
            | StorByteAryElm
            | StorCharAryElm
            | StorIntAryElm
            | StorFloatAryElm
    )
}

fn elem_width(kind: ElemKind) -> Width {
    match kind {
        ElemKind::Byte => Width::Byte,
        ElemKind::Char => Width::Char,
        ElemKind::Int | ElemKind::Float => Width::Word,
    }
}

fn int_cmp(op: Opcode) -> Cmp {
    match op {
        Opcode::EqlInt => Cmp::Eq,
        Opcode::NeqlInt => Cmp::Ne,
        Opcode::LesInt => Cmp::Lt,
        Opcode::GtrInt => Cmp::Gt,
        Opcode::LesEqlInt => Cmp::Le,
        _ => Cmp::Ge,
    }
}

fn float_cmp(op: Opcode) -> FCmp {
    match op {
        Opcode::EqlFloat => FCmp::Eq,
        Opcode::NeqlFloat => FCmp::Ne,
        Opcode::LesFloat => FCmp::Lt,
        Opcode::GtrFloat => FCmp::Gt,
        Opcode::LesEqlFloat => FCmp::Le,
        _ => FCmp::Ge,
    }
}
