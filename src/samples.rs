//! Built-in sample programs.
//!
//! Each one is small enough to read as bytecode and exercises a different
//! part of the engine. They are also the fixtures the differential tests run
//! through both the interpreter and the JIT.

use crate::vm::asm::{self, int, label, load_local, rtrn, store_local};
use crate::vm::{Class, Instruction, Method, Opcode, Program, ReturnKind, TrapCode};

/// How a sample is expected to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// Final operand stack, bottom first.
    Stack(&'static [i64]),
    /// Native status of the fault it raises.
    Fault(i64),
}

pub struct Sample {
    pub name: &'static str,
    pub about: &'static str,
    pub expected: Expected,
    /// Everything the program writes through traps.
    pub output: &'static str,
    build: fn() -> Program,
}

impl Sample {
    pub fn program(&self) -> Program {
        (self.build)()
    }
}

impl std::fmt::Debug for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sample").field("name", &self.name).finish()
    }
}

pub static SAMPLES: &[Sample] = &[
    Sample {
        name: "factorial",
        about: "recursive 10! through native call sites",
        expected: Expected::Stack(&[3_628_800]),
        output: "",
        build: factorial,
    },
    Sample {
        name: "fibonacci",
        about: "iterative fib(30) over three locals",
        expected: Expected::Stack(&[832_040]),
        output: "",
        build: fibonacci,
    },
    Sample {
        name: "array-sum",
        about: "fill an int array with squares and sum it",
        expected: Expected::Stack(&[285]),
        output: "",
        build: array_sum,
    },
    Sample {
        name: "matrix",
        about: "fill and sum a 3x4 two-dimensional array",
        expected: Expected::Stack(&[138]),
        output: "",
        build: matrix,
    },
    Sample {
        name: "float-math",
        about: "float arithmetic, a float loop and a library call",
        expected: Expected::Stack(&[16, 1]),
        output: "",
        build: float_math,
    },
    Sample {
        name: "virtual",
        about: "virtual dispatch on two subclasses",
        expected: Expected::Stack(&[37]),
        output: "",
        build: virtual_dispatch,
    },
    Sample {
        name: "strings",
        about: "number to string conversion and back",
        expected: Expected::Stack(&[12_346]),
        output: "12345\n2.500000\n",
        build: strings,
    },
    Sample {
        name: "div-zero",
        about: "integer division by a zero local",
        expected: Expected::Fault(-4),
        output: "",
        build: div_zero,
    },
    Sample {
        name: "nil-field",
        about: "field read through a nil reference",
        expected: Expected::Fault(-1),
        output: "",
        build: nil_field,
    },
    Sample {
        name: "bounds",
        about: "array read one past the end",
        expected: Expected::Fault(-3),
        output: "",
        build: bounds,
    },
];

pub fn find(name: &str) -> Option<&'static Sample> {
    SAMPLES.iter().find(|s| s.name == name)
}

fn main_only(instrs: Vec<Instruction>) -> Program {
    let mut program = Program::new();
    let mut main = Class::new("Main", None, 0, 0);
    main.add_method(Method::new("main", 0, ReturnKind::Int, instrs));
    program.add_class(main);
    program
}

fn factorial() -> Program {
    let mut program = Program::new();
    let mut main = Class::new("Main", None, 0, 0);
    main.add_method(Method::new(
        "main",
        0,
        ReturnKind::Int,
        vec![int(10), int(0), asm::native_call(0, 1), rtrn()],
    ));
    main.add_method(Method::new(
        "fact",
        1,
        ReturnKind::Int,
        vec![
            store_local(0),
            load_local(0),
            int(1),
            asm::op(Opcode::LesEqlInt),
            asm::jmp_if(13, 1),
            load_local(0),
            load_local(0),
            int(1),
            asm::op(Opcode::SubInt),
            int(0),
            asm::call(0, 1),
            asm::op(Opcode::MulInt),
            rtrn(),
            label(1),
            int(1),
            rtrn(),
        ],
    ));
    program.add_class(main);
    program
}

fn fibonacci() -> Program {
    main_only(vec![
        int(0),
        store_local(0),
        int(1),
        store_local(1),
        int(0),
        store_local(2),
        label(1),
        load_local(2),
        int(30),
        asm::op(Opcode::LesInt),
        asm::jmp_if(22, 0),
        load_local(0),
        load_local(1),
        asm::op(Opcode::AddInt),
        load_local(1),
        store_local(0),
        store_local(1),
        load_local(2),
        int(1),
        asm::op(Opcode::AddInt),
        store_local(2),
        asm::jmp(6),
        label(2),
        load_local(0),
        rtrn(),
    ])
}

fn array_sum() -> Program {
    main_only(vec![
        int(10),
        asm::new_array(Opcode::NewIntAry, 1),
        store_local(0),
        int(0),
        store_local(1),
        // a[i] = i * i
        label(1),
        load_local(1),
        int(10),
        asm::op(Opcode::LesInt),
        asm::jmp_if(21, 0),
        load_local(1),
        load_local(1),
        asm::op(Opcode::MulInt),
        load_local(1),
        load_local(0),
        asm::array_elm(Opcode::StorIntAryElm, 1),
        load_local(1),
        int(1),
        asm::op(Opcode::AddInt),
        store_local(1),
        asm::jmp(5),
        label(2),
        int(0),
        store_local(2),
        int(0),
        store_local(1),
        // sum over a.length
        label(3),
        load_local(1),
        load_local(0),
        asm::op(Opcode::LoadArySize),
        asm::op(Opcode::LesInt),
        asm::jmp_if(43, 0),
        load_local(2),
        load_local(1),
        load_local(0),
        asm::array_elm(Opcode::LoadIntAryElm, 1),
        asm::op(Opcode::AddInt),
        store_local(2),
        load_local(1),
        int(1),
        asm::op(Opcode::AddInt),
        store_local(1),
        asm::jmp(26),
        label(4),
        load_local(2),
        rtrn(),
    ])
}

fn matrix() -> Program {
    main_only(vec![
        int(4),
        int(3),
        asm::new_array(Opcode::NewIntAry, 2),
        store_local(0),
        int(0),
        store_local(3),
        int(0),
        store_local(1),
        label(1),
        load_local(1),
        int(3),
        asm::op(Opcode::LesInt),
        asm::jmp_if(47, 0),
        int(0),
        store_local(2),
        label(2),
        load_local(2),
        int(4),
        asm::op(Opcode::LesInt),
        asm::jmp_if(41, 0),
        // m[i][j] = i * 10 + j
        load_local(1),
        int(10),
        asm::op(Opcode::MulInt),
        load_local(2),
        asm::op(Opcode::AddInt),
        load_local(2),
        load_local(1),
        load_local(0),
        asm::array_elm(Opcode::StorIntAryElm, 2),
        // total += m[i][j]
        load_local(3),
        load_local(2),
        load_local(1),
        load_local(0),
        asm::array_elm(Opcode::LoadIntAryElm, 2),
        asm::op(Opcode::AddInt),
        store_local(3),
        load_local(2),
        int(1),
        asm::op(Opcode::AddInt),
        store_local(2),
        asm::jmp(15),
        label(3),
        load_local(1),
        int(1),
        asm::op(Opcode::AddInt),
        store_local(1),
        asm::jmp(8),
        label(4),
        load_local(3),
        rtrn(),
    ])
}

fn float_math() -> Program {
    main_only(vec![
        asm::float(1.5),
        asm::store_float_local(0),
        asm::float(2.25),
        asm::store_float_local(1),
        // ((a + b) * 4 - 1) / 2
        asm::load_float_local(0),
        asm::load_float_local(1),
        asm::op(Opcode::AddFloat),
        asm::float(4.0),
        asm::op(Opcode::MulFloat),
        asm::float(1.0),
        asm::op(Opcode::SubFloat),
        asm::float(2.0),
        asm::op(Opcode::DivFloat),
        asm::store_float_local(2),
        int(0),
        store_local(3),
        label(1),
        load_local(3),
        int(10),
        asm::op(Opcode::LesInt),
        asm::jmp_if(30, 0),
        asm::load_float_local(2),
        asm::float(0.5),
        asm::op(Opcode::AddFloat),
        asm::store_float_local(2),
        load_local(3),
        int(1),
        asm::op(Opcode::AddInt),
        store_local(3),
        asm::jmp(16),
        label(2),
        asm::load_float_local(2),
        asm::float(16.0),
        asm::op(Opcode::SqrtFloat),
        asm::op(Opcode::AddFloat),
        asm::store_float_local(2),
        asm::load_float_local(2),
        asm::op(Opcode::F2I),
        asm::load_float_local(2),
        asm::float(16.0),
        asm::op(Opcode::EqlFloat),
        rtrn(),
    ])
}

fn virtual_dispatch() -> Program {
    let mut program = Program::new();
    let mut main = Class::new("Main", None, 0, 0);
    main.add_method(Method::new(
        "main",
        0,
        ReturnKind::Int,
        vec![
            asm::new_object(2),
            store_local(0),
            int(3),
            load_local(0),
            asm::store_field(0),
            int(4),
            load_local(0),
            asm::store_field(1),
            asm::new_object(3),
            store_local(1),
            int(5),
            load_local(1),
            asm::store_field(0),
            load_local(0),
            asm::call(1, 0),
            load_local(1),
            asm::call(1, 0),
            asm::op(Opcode::AddInt),
            rtrn(),
        ],
    ));
    program.add_class(main);

    let mut shape = Class::new("Shape", None, 2, 0);
    shape.add_method(Method::new("area", 0, ReturnKind::Int, vec![int(0), rtrn()]).virtual_method());
    let shape = program.add_class(shape);

    let mut rect = Class::new("Rect", Some(shape), 2, 0);
    rect.add_method(
        Method::new(
            "area",
            0,
            ReturnKind::Int,
            vec![
                asm::op(Opcode::LoadInstMem),
                asm::load_field(0),
                asm::op(Opcode::LoadInstMem),
                asm::load_field(1),
                asm::op(Opcode::MulInt),
                rtrn(),
            ],
        )
        .virtual_method(),
    );
    program.add_class(rect);

    let mut square = Class::new("Square", Some(shape), 2, 0);
    square.add_method(
        Method::new(
            "area",
            0,
            ReturnKind::Int,
            vec![
                asm::op(Opcode::LoadInstMem),
                asm::load_field(0),
                asm::op(Opcode::LoadInstMem),
                asm::load_field(0),
                asm::op(Opcode::MulInt),
                rtrn(),
            ],
        )
        .virtual_method(),
    );
    program.add_class(square);
    program
}

fn strings() -> Program {
    let mut code = vec![
        int(32),
        asm::new_array(Opcode::NewCharAry, 1),
        store_local(0),
        int(12_345),
        int(10),
        load_local(0),
        asm::op(Opcode::I2S),
        load_local(0),
    ];
    code.extend(asm::trap(TrapCode::StdOutString, 2));
    code.extend(asm::trap(TrapCode::StdOutNewline, 1));
    code.extend([
        int(10),
        load_local(0),
        asm::op(Opcode::S2I),
        int(1),
        asm::op(Opcode::AddInt),
        asm::float(2.5),
        load_local(0),
        asm::op(Opcode::F2S),
        load_local(0),
    ]);
    code.extend(asm::trap(TrapCode::StdOutString, 2));
    code.extend(asm::trap(TrapCode::StdOutNewline, 1));
    code.push(rtrn());
    main_only(code)
}

fn div_zero() -> Program {
    main_only(vec![
        int(7),
        store_local(0),
        int(0),
        store_local(1),
        int(100),
        load_local(0),
        load_local(1),
        asm::op(Opcode::DivInt),
        rtrn(),
    ])
}

fn nil_field() -> Program {
    main_only(vec![
        int(0),
        store_local(0),
        load_local(0),
        asm::load_field(1),
        rtrn(),
    ])
}

fn bounds() -> Program {
    main_only(vec![
        int(5),
        asm::new_array(Opcode::NewIntAry, 1),
        store_local(0),
        int(5),
        load_local(0),
        asm::array_elm(Opcode::LoadIntAryElm, 1),
        rtrn(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_unique() {
        for (i, a) in SAMPLES.iter().enumerate() {
            assert!(SAMPLES[i + 1..].iter().all(|b| b.name != a.name));
        }
        assert!(find("matrix").is_some());
        assert!(find("nope").is_none());
    }

    #[test]
    fn test_jumps_target_labels() {
        for sample in SAMPLES {
            let program = sample.program();
            for method in program.classes.iter().flat_map(|c| c.methods.iter()) {
                for instr in method.instrs.iter().filter(|i| i.op == Opcode::Jmp) {
                    let target = &method.instrs[instr.operand as usize];
                    assert_eq!(target.op, Opcode::Lbl, "{} {}", sample.name, method.name);
                }
            }
        }
    }
}
