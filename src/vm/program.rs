//! Loaded program model: classes, methods and their compiled-body slots.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use super::bytecode::{Instruction, MemoryContext, Opcode};
use super::runtime::ExecContext;

/// Signature of a compiled method body.
///
/// Arguments: class id, method id, class memory, instance, operand stack,
/// stack position, execution context, call stack position, locals root,
/// locals word count and the constant pool. Returns a status code.
pub type NativeEntry = unsafe extern "C" fn(
    i64,
    i64,
    *mut i64,
    *mut i64,
    *mut i64,
    *mut i64,
    *mut ExecContext,
    *mut i64,
    *mut *mut i64,
    *mut i64,
    *const u64,
) -> i64;

/// Kind of value a method leaves on the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Int,
    Float,
    /// Function value: packed method id plus closure instance.
    Func,
}

impl ReturnKind {
    /// Operand stack words the return value occupies.
    pub fn words(self) -> usize {
        match self {
            ReturnKind::Void => 0,
            ReturnKind::Int | ReturnKind::Float => 1,
            ReturnKind::Func => 2,
        }
    }

    pub fn from_code(code: i64) -> ReturnKind {
        match code {
            1 => ReturnKind::Int,
            2 => ReturnKind::Float,
            3 => ReturnKind::Func,
            _ => ReturnKind::Void,
        }
    }
}

/// A finished native body. Lives for the rest of the process.
pub struct CompiledBody {
    pub entry: NativeEntry,
    pub code_len: usize,
    /// Literal pool referenced by the code. Its address is baked into the
    /// code on x86-64 and passed as the last argument on AArch64.
    pub consts: Box<[u64]>,
}

impl std::fmt::Debug for CompiledBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledBody")
            .field("entry", &(self.entry as usize as *const u8))
            .field("code_len", &self.code_len)
            .field("consts", &self.consts.len())
            .finish()
    }
}

/// Result of the one and only compilation attempt for a method.
#[derive(Debug)]
pub enum CompileOutcome {
    Compiled(CompiledBody),
    /// Soft failure; the method is interpreted from now on.
    Failed(String),
}

/// A method body.
pub struct Method {
    pub id: usize,
    pub class_id: usize,
    pub name: String,
    /// Operand stack words consumed as arguments.
    pub params: usize,
    pub rtrn: ReturnKind,
    pub is_virtual: bool,
    pub instrs: Vec<Instruction>,
    /// Local variable words, derived from the instruction stream.
    pub local_words: usize,
    compiled: OnceLock<CompileOutcome>,
    calls: AtomicU32,
}

impl Method {
    pub fn new(name: &str, params: usize, rtrn: ReturnKind, instrs: Vec<Instruction>) -> Self {
        let local_words = local_words(&instrs);
        Self {
            id: 0,
            class_id: 0,
            name: name.to_string(),
            params,
            rtrn,
            is_virtual: false,
            instrs,
            local_words,
            compiled: OnceLock::new(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn virtual_method(mut self) -> Self {
        self.is_virtual = true;
        self
    }

    /// The cached compile result, if compilation already happened.
    pub fn compiled(&self) -> Option<&CompileOutcome> {
        self.compiled.get()
    }

    /// Runs `compile` at most once for the lifetime of the method; every
    /// caller observes the same outcome.
    pub fn compiled_or_init<F>(&self, compile: F) -> &CompileOutcome
    where
        F: FnOnce() -> CompileOutcome,
    {
        self.compiled.get_or_init(compile)
    }

    /// Bump the interpreted call counter and return the new count.
    pub fn record_call(&self) -> u32 {
        self.calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// `Class:method` style label used in traces.
    pub fn qualified_name(&self, program: &Program) -> String {
        match program.class(self.class_id) {
            Some(cls) => format!("{}:{}", cls.name, self.name),
            None => self.name.clone(),
        }
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("class_id", &self.class_id)
            .field("name", &self.name)
            .field("params", &self.params)
            .field("rtrn", &self.rtrn)
            .field("instrs", &self.instrs.len())
            .finish()
    }
}

/// Number of local words addressed by `LOCL` variable instructions.
fn local_words(instrs: &[Instruction]) -> usize {
    instrs
        .iter()
        .filter_map(|instr| {
            let width = match instr.op {
                Opcode::LoadIntVar
                | Opcode::StorIntVar
                | Opcode::CopyIntVar
                | Opcode::LoadFloatVar
                | Opcode::StorFloatVar
                | Opcode::CopyFloatVar
                | Opcode::LoadLoclIntVar
                | Opcode::StorLoclIntVar
                | Opcode::CopyLoclIntVar => 1,
                Opcode::LoadFuncVar | Opcode::StorFuncVar => 2,
                _ => return None,
            };
            if instr.context() != MemoryContext::Local || instr.operand < 0 {
                return None;
            }
            Some(instr.operand as usize + width)
        })
        .max()
        .unwrap_or(0)
}

/// A class with instance layout, static layout and methods.
#[derive(Debug)]
pub struct Class {
    pub id: usize,
    pub name: String,
    pub parent: Option<usize>,
    pub inst_words: usize,
    pub cls_words: usize,
    pub methods: Vec<Arc<Method>>,
}

impl Class {
    pub fn new(name: &str, parent: Option<usize>, inst_words: usize, cls_words: usize) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            parent,
            inst_words,
            cls_words,
            methods: Vec::new(),
        }
    }

    /// Adds a method and returns its id within the class.
    pub fn add_method(&mut self, mut method: Method) -> usize {
        method.id = self.methods.len();
        method.class_id = self.id;
        self.methods.push(Arc::new(method));
        self.methods.len() - 1
    }

    pub fn method(&self, id: usize) -> Option<&Arc<Method>> {
        self.methods.get(id)
    }
}

/// An already-loaded and verified program.
#[derive(Debug, Default)]
pub struct Program {
    pub classes: Vec<Class>,
    /// Entry point as (class id, method id).
    pub entry: (usize, usize),
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a class and returns its id. Methods added to the class afterwards
    /// through [`Program::class_mut`] get the right class id.
    pub fn add_class(&mut self, mut class: Class) -> usize {
        class.id = self.classes.len();
        for (i, m) in class.methods.iter_mut().enumerate() {
            if let Some(m) = Arc::get_mut(m) {
                m.id = i;
                m.class_id = class.id;
            }
        }
        self.classes.push(class);
        self.classes.len() - 1
    }

    pub fn class(&self, id: usize) -> Option<&Class> {
        self.classes.get(id)
    }

    pub fn class_mut(&mut self, id: usize) -> Option<&mut Class> {
        self.classes.get_mut(id)
    }

    pub fn method(&self, cls: usize, mthd: usize) -> Option<&Arc<Method>> {
        self.class(cls).and_then(|c| c.method(mthd))
    }

    pub fn entry_method(&self) -> Option<&Arc<Method>> {
        self.method(self.entry.0, self.entry.1)
    }

    /// Is `cls` the class `target` or one of its descendants?
    pub fn is_a(&self, cls: usize, target: usize) -> bool {
        let mut current = Some(cls);
        while let Some(id) = current {
            if id == target {
                return true;
            }
            current = self.class(id).and_then(|c| c.parent);
        }
        false
    }

    /// Finds the implementation of a method named `name` visible from `cls`,
    /// walking parents.
    pub fn find_method(&self, cls: usize, name: &str) -> Option<&Arc<Method>> {
        let mut current = Some(cls);
        while let Some(id) = current {
            let class = self.class(id)?;
            if let Some(m) = class.methods.iter().find(|m| m.name == name) {
                return Some(m);
            }
            current = class.parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::asm;

    #[test]
    fn test_local_words_counts_func_pairs() {
        let m = Method::new(
            "f",
            0,
            ReturnKind::Void,
            vec![
                asm::int(1),
                asm::store_local(2),
                asm::load_func_local(4),
                asm::op(Opcode::Rtrn),
            ],
        );
        assert_eq!(m.local_words, 6);
    }

    #[test]
    fn test_local_words_ignores_instance_slots() {
        let m = Method::new(
            "f",
            0,
            ReturnKind::Void,
            vec![asm::op(Opcode::LoadInstMem), asm::load_field(9), asm::op(Opcode::Rtrn)],
        );
        assert_eq!(m.local_words, 0);
    }

    #[test]
    fn test_find_method_walks_parents() {
        let mut program = Program::new();
        let mut base = Class::new("Shape", None, 1, 0);
        base.add_method(Method::new("area", 1, ReturnKind::Int, vec![]).virtual_method());
        base.add_method(Method::new("name", 1, ReturnKind::Int, vec![]));
        let base_id = program.add_class(base);
        let mut square = Class::new("Square", Some(base_id), 2, 0);
        square.add_method(Method::new("area", 1, ReturnKind::Int, vec![]).virtual_method());
        let square_id = program.add_class(square);

        assert!(program.is_a(square_id, base_id));
        assert!(!program.is_a(base_id, square_id));
        let area = program.find_method(square_id, "area").unwrap();
        assert_eq!(area.class_id, square_id);
        let name = program.find_method(square_id, "name").unwrap();
        assert_eq!(name.class_id, base_id);
    }

    #[test]
    fn test_compile_slot_runs_once() {
        let m = Method::new("f", 0, ReturnKind::Void, vec![asm::op(Opcode::Rtrn)]);
        let mut runs = 0;
        m.compiled_or_init(|| {
            runs += 1;
            CompileOutcome::Failed("no".into())
        });
        m.compiled_or_init(|| {
            runs += 1;
            CompileOutcome::Failed("again".into())
        });
        assert_eq!(runs, 1);
        assert!(matches!(m.compiled(), Some(CompileOutcome::Failed(r)) if r == "no"));
    }
}
