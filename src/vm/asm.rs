//! Shorthand constructors for writing bytecode by hand.

use super::bytecode::{Instruction, MemoryContext, Opcode, TrapCode};
use super::program::ReturnKind;

pub fn op(op: Opcode) -> Instruction {
    Instruction::new(op)
}

pub fn int(value: i64) -> Instruction {
    Instruction::with(Opcode::LoadIntLit, value)
}

pub fn char_lit(c: char) -> Instruction {
    Instruction::with(Opcode::LoadCharLit, c as i64)
}

pub fn float(value: f64) -> Instruction {
    Instruction::float(value)
}

pub fn load_local(slot: i64) -> Instruction {
    Instruction::with2(Opcode::LoadIntVar, slot, MemoryContext::Local.encode())
}

pub fn store_local(slot: i64) -> Instruction {
    Instruction::with2(Opcode::StorIntVar, slot, MemoryContext::Local.encode())
}

pub fn copy_local(slot: i64) -> Instruction {
    Instruction::with2(Opcode::CopyIntVar, slot, MemoryContext::Local.encode())
}

pub fn load_float_local(slot: i64) -> Instruction {
    Instruction::with2(Opcode::LoadFloatVar, slot, MemoryContext::Local.encode())
}

pub fn store_float_local(slot: i64) -> Instruction {
    Instruction::with2(Opcode::StorFloatVar, slot, MemoryContext::Local.encode())
}

pub fn load_func_local(slot: i64) -> Instruction {
    Instruction::with2(Opcode::LoadFuncVar, slot, MemoryContext::Local.encode())
}

pub fn store_func_local(slot: i64) -> Instruction {
    Instruction::with2(Opcode::StorFuncVar, slot, MemoryContext::Local.encode())
}

/// Instance field load; expects the instance handle on top of the stack.
pub fn load_field(slot: i64) -> Instruction {
    Instruction::with2(Opcode::LoadIntVar, slot, MemoryContext::Instance.encode())
}

/// Instance field store; instance on top, value below.
pub fn store_field(slot: i64) -> Instruction {
    Instruction::with2(Opcode::StorIntVar, slot, MemoryContext::Instance.encode())
}

pub fn load_static(slot: i64) -> Instruction {
    Instruction::with2(Opcode::LoadIntVar, slot, MemoryContext::Class.encode())
}

pub fn store_static(slot: i64) -> Instruction {
    Instruction::with2(Opcode::StorIntVar, slot, MemoryContext::Class.encode())
}

pub fn jmp(target: i64) -> Instruction {
    Instruction::with2(Opcode::Jmp, target, -1)
}

/// Pops a value and jumps when it equals `when`.
pub fn jmp_if(target: i64, when: i64) -> Instruction {
    Instruction::with2(Opcode::Jmp, target, when)
}

pub fn label(id: i64) -> Instruction {
    Instruction::with(Opcode::Lbl, id)
}

pub fn call(cls: usize, mthd: usize) -> Instruction {
    Instruction::with3(Opcode::MthdCall, cls as i64, mthd as i64, 0)
}

/// Call site that asks for the callee to run as native code.
pub fn native_call(cls: usize, mthd: usize) -> Instruction {
    Instruction::with3(Opcode::MthdCall, cls as i64, mthd as i64, 1)
}

pub fn dyn_call(arg_words: i64, rtrn: ReturnKind) -> Instruction {
    let code = match rtrn {
        ReturnKind::Void => 0,
        ReturnKind::Int => 1,
        ReturnKind::Float => 2,
        ReturnKind::Func => 3,
    };
    Instruction::with2(Opcode::DynMthdCall, arg_words, code)
}

pub fn new_array(op: Opcode, dims: i64) -> Instruction {
    Instruction::with(op, dims)
}

pub fn array_elm(op: Opcode, dims: i64) -> Instruction {
    Instruction::with(op, dims)
}

pub fn new_object(cls: usize) -> Instruction {
    Instruction::with(Opcode::NewObjInst, cls as i64)
}

/// `TRAP` with the trap code already counted in `words`.
pub fn trap(code: TrapCode, words: i64) -> Vec<Instruction> {
    vec![int(code as i64), Instruction::with(Opcode::Trap, words)]
}

pub fn rtrn() -> Instruction {
    op(Opcode::Rtrn)
}
