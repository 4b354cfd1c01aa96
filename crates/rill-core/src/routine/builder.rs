//! Builder for routine declarations.
//!
//! Front ends (and tests) describe a routine through [`RoutineBuilder`]:
//!
//! ```ignore
//! let f = RoutineBuilder::new("f")
//!     .param("x", types.int())
//!     .param("y", types.int())
//!     .returns(types.int())
//!     .emit(OpCode::Add, 0, 1, 2)
//!     .emit(OpCode::Return, 2, 1, 0)
//!     .build();
//! ```
//!
//! The register count defaults to one past the highest register any
//! instruction touches.

use std::sync::{Arc, Weak};

use super::{NativeFn, Param, Routine, RoutineDecl, RoutineFlags};
use crate::Span;
use crate::bytecode::{AnnotatedInstr, Constant, ConstantPool, Instruction, OpCode, classify};
use crate::types::{ClassId, Ty};

#[derive(Debug)]
pub struct RoutineBuilder {
    decl: RoutineDecl,
    span: Span,
    enclosing: Weak<Routine>,
    constants: Vec<Constant>,
    declared_registers: usize,
}

impl RoutineBuilder {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        RoutineBuilder {
            decl: RoutineDecl {
                name: name.into(),
                params: Vec::new(),
                variadic: false,
                ret: None,
                yields: None,
                flags: RoutineFlags::empty(),
                host: None,
                captures: Vec::new(),
                register_count: 0,
                register_types: Vec::new(),
                code: Vec::new(),
                constants: ConstantPool::new(),
                source: Vec::new(),
                def_line: 1,
                file: Arc::from("<script>"),
            },
            span: Span::line(1),
            enclosing: Weak::new(),
            constants: Vec::new(),
            declared_registers: 0,
        }
    }

    pub fn param(mut self, name: &str, ty: Ty) -> Self {
        self.push_param(name, ty, None);
        self
    }

    pub fn param_default(mut self, name: &str, ty: Ty, default: Constant) -> Self {
        self.push_param(name, ty, Some(default));
        self
    }

    fn push_param(&mut self, name: &str, ty: Ty, default: Option<Constant>) {
        let index = self.decl.params.len();
        self.decl.params.push(Param {
            name: Arc::from(name),
            ty: ty.clone(),
            default,
        });
        self.declare(index, ty);
    }

    /// Accept extra trailing arguments, collected into the register after the parameters.
    pub fn variadic(mut self) -> Self {
        self.decl.variadic = true;
        self
    }

    pub fn returns(mut self, ty: Ty) -> Self {
        self.decl.ret = Some(ty);
        self
    }

    /// Mark as a coroutine yielding values of `ty`.
    pub fn yields(mut self, ty: Ty) -> Self {
        self.decl.yields = Some(ty);
        self.decl.flags |= RoutineFlags::COROUTINE;
        self
    }

    pub fn flags(mut self, flags: RoutineFlags) -> Self {
        self.decl.flags |= flags;
        self
    }

    /// Method of class `class`; the first parameter is the receiver.
    pub fn host(mut self, class: ClassId) -> Self {
        self.decl.host = Some(class);
        self.decl.flags |= RoutineFlags::METHOD;
        self
    }

    pub fn capture(mut self, ty: Ty) -> Self {
        self.decl.captures.push(ty);
        self
    }

    /// The routine this closure is defined in.
    pub fn enclosing(mut self, routine: &Arc<Routine>) -> Self {
        self.enclosing = Arc::downgrade(routine);
        self
    }

    /// Declare the static type of a local register.
    pub fn local(mut self, reg: usize, ty: Ty) -> Self {
        self.declare(reg, ty);
        self
    }

    fn declare(&mut self, reg: usize, ty: Ty) {
        if self.decl.register_types.len() <= reg {
            self.decl.register_types.resize(reg + 1, None);
        }
        self.decl.register_types[reg] = Some(ty);
        self.declared_registers = self.declared_registers.max(reg + 1);
    }

    /// Reserve at least `count` registers.
    pub fn registers(mut self, count: usize) -> Self {
        self.declared_registers = self.declared_registers.max(count);
        self
    }

    /// Append a constant; its index is its position in append order.
    pub fn constant(mut self, constant: Constant) -> Self {
        self.constants.push(constant);
        self
    }

    pub fn file(mut self, file: &str) -> Self {
        self.decl.file = Arc::from(file);
        self
    }

    pub fn def_line(mut self, line: u32) -> Self {
        self.decl.def_line = line;
        self
    }

    /// Source text, one entry per line starting at line 1.
    pub fn source(mut self, text: &str) -> Self {
        self.decl.source = text.lines().map(Arc::from).collect();
        self
    }

    /// Line attached to subsequently emitted instructions.
    pub fn line(mut self, line: u32) -> Self {
        self.span = Span::line(line);
        self
    }

    /// Span attached to subsequently emitted instructions.
    pub fn at(mut self, line: u32, col: u32, len: u32) -> Self {
        self.span = Span::new(line, col, len);
        self
    }

    pub fn emit(mut self, op: OpCode, a: u16, b: u16, c: u16) -> Self {
        self.decl
            .code
            .push(AnnotatedInstr::new(Instruction::new(op, a, b, c), self.span));
        self
    }

    /// Number of instructions emitted so far; the index of the next one.
    pub fn pc(&self) -> usize {
        self.decl.code.len()
    }

    fn finish(mut self) -> (RoutineDecl, Weak<Routine>) {
        let touched = self
            .decl
            .code
            .iter()
            .map(|ai| {
                let ops = classify(&ai.instr);
                let read_max = ops.reads.iter().max().map_or(0, |r| r + 1);
                let write_max = ops.write.map_or(0, |w| w as usize + 1);
                read_max.max(write_max)
            })
            .max()
            .unwrap_or(0);
        let count = touched
            .max(self.declared_registers)
            .max(self.decl.params.len() + usize::from(self.decl.variadic));
        self.decl.register_count = count;
        self.decl.register_types.resize(count, None);
        self.decl.constants = ConstantPool::from(self.constants);
        (self.decl, self.enclosing)
    }

    pub fn build(self) -> Arc<Routine> {
        let (decl, enclosing) = self.finish();
        Arc::new(Routine::new(decl, None, enclosing))
    }

    /// Build a routine implemented by a host function.
    pub fn build_native(self, f: NativeFn) -> Arc<Routine> {
        let (decl, enclosing) = self.finish();
        Arc::new(Routine::new(decl, Some(f), enclosing))
    }

    /// Declaration only, for callers that construct the routine themselves.
    pub fn into_decl(self) -> RoutineDecl {
        self.finish().0
    }
}
