//! Type inference and specialization of one routine.
//!
//! ## Algorithm
//!
//! 1. Definite assignment: a forward "possibly assigned" problem is solved
//!    over the routine's flow graph; a read of a register that no path has
//!    written is a use-before-init error at the reading instruction. The check
//!    is skipped when liveness shows nothing but parameters live at entry.
//! 2. A single forward pass in program order carries a type per register
//!    (adopted at the first write, checked at later ones), the set of
//!    registers holding known constants, the known callee of registers
//!    holding routines or classes, and a buffer of coercions to insert.
//!    Each instruction is checked and, where its operand types are proven,
//!    rewritten in place into a specialized opcode.
//! 3. An undeclared register written with two incompatible types is relaxed
//!    to `any` and the pass starts over; registers only ever get weaker, so
//!    this ends after at most one restart per register.
//! 4. Coercions are spliced in, branch targets remapped, and the compiled
//!    body is published on the routine.
//!
//! The first hard failure aborts the routine. In silent mode (probing an
//! overload candidate or a specialization) no diagnostic is built.

mod access;
mod arith;
mod calls;
mod control;
mod rewrite;
mod values;

use std::sync::Arc;

use bumpalo::Bump;
use rill_core::{
    AnnotatedInstr, ClassDef, ClassId, CompiledBody, Constant, ConstantPool, Diagnostic,
    EngineProperties, EngineProperty, InferError, InferErrorKind, Instruction, OpCode,
    OverloadSet, RegSet, Routine, RoutineDecl, Ty, TypeKind, TypeTable, classify,
};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::matcher::{MatchLevel, match_type};
use rewrite::{Insertion, Placement, prune_unreachable, splice};

// ============================================================================
// Environment
// ============================================================================

/// Static description of a global slot.
#[derive(Debug, Clone)]
pub struct GlobalInfo {
    pub ty: Ty,
    /// Value of a constant global; writes to it are rejected.
    pub value: Option<Constant>,
}

/// Options derived from [`EngineProperties`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferOptions {
    pub typed_code: bool,
    pub strict_assignment: bool,
    pub max_depth: usize,
}

impl Default for InferOptions {
    fn default() -> Self {
        InferOptions::from(&EngineProperties::new())
    }
}

impl From<&EngineProperties> for InferOptions {
    fn from(props: &EngineProperties) -> Self {
        InferOptions {
            typed_code: props.flag(EngineProperty::TypedCode),
            strict_assignment: props.flag(EngineProperty::StrictDefiniteAssignment),
            max_depth: props.get(EngineProperty::MaxInferenceDepth),
        }
    }
}

/// What inference needs to know about the program around a routine.
pub trait InferEnv {
    fn global(&self, namespace: usize, slot: usize) -> Option<GlobalInfo>;
    fn class(&self, id: ClassId) -> Option<Arc<ClassDef>>;
    fn options(&self) -> InferOptions;
}

/// A fixed environment, for compiling routines outside a program.
#[derive(Debug, Default)]
pub struct StaticEnv {
    globals: FxHashMap<(usize, usize), GlobalInfo>,
    classes: FxHashMap<ClassId, Arc<ClassDef>>,
    options: InferOptions,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(mut self, namespace: usize, slot: usize, info: GlobalInfo) -> Self {
        self.globals.insert((namespace, slot), info);
        self
    }

    pub fn with_class(mut self, class: Arc<ClassDef>) -> Self {
        self.classes.insert(class.id, class);
        self
    }

    pub fn with_options(mut self, options: InferOptions) -> Self {
        self.options = options;
        self
    }
}

impl InferEnv for StaticEnv {
    fn global(&self, namespace: usize, slot: usize) -> Option<GlobalInfo> {
        self.globals.get(&(namespace, slot)).cloned()
    }

    fn class(&self, id: ClassId) -> Option<Arc<ClassDef>> {
        self.classes.get(&id).cloned()
    }

    fn options(&self) -> InferOptions {
        self.options
    }
}

// ============================================================================
// Session
// ============================================================================

/// State shared by nested, on-demand compilations.
pub struct Session<'e> {
    env: &'e dyn InferEnv,
    options: InferOptions,
    depth: usize,
    /// Routines (by address) whose inference is under way.
    in_progress: FxHashSet<usize>,
    /// Specializations under way: generic routine address and key.
    specializing: FxHashSet<(usize, Vec<rill_core::TypeHash>)>,
    /// Return types expected of closures compiled for a call argument.
    expected: Vec<Ty>,
    silent: usize,
}

impl<'e> Session<'e> {
    pub fn new(env: &'e dyn InferEnv) -> Self {
        Session {
            env,
            options: env.options(),
            depth: 0,
            in_progress: FxHashSet::default(),
            specializing: FxHashSet::default(),
            expected: Vec::new(),
            silent: 0,
        }
    }

    #[inline]
    pub fn env(&self) -> &'e dyn InferEnv {
        self.env
    }

    #[inline]
    pub fn is_silent(&self) -> bool {
        self.silent > 0
    }

    /// Whether `routine` is being inferred further up the stack.
    pub fn in_progress(&self, routine: &Arc<Routine>) -> bool {
        self.in_progress.contains(&(Arc::as_ptr(routine) as usize))
    }

    /// Compile `routine` unless it already is.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn compile(&mut self, routine: &Arc<Routine>) -> Result<Arc<CompiledBody>, InferError> {
        if let Some(body) = routine.body() {
            return Ok(body);
        }
        if routine.native().is_some() {
            return Err(InferError::Silent);
        }
        if self.depth >= self.options.max_depth {
            return Err(InferError::TooDeep(self.options.max_depth));
        }
        let key = Arc::as_ptr(routine) as usize;
        self.in_progress.insert(key);
        self.depth += 1;
        let result = self.infer(routine);
        self.depth -= 1;
        self.in_progress.remove(&key);

        let body = result?;
        tracing::debug!(
            routine = %routine.name(),
            instructions = body.code.len(),
            registers = body.register_count(),
            "inferred routine"
        );
        Ok(routine.install_body(Arc::new(body)))
    }

    /// Compile a closure whose returns must fit `expected`.
    pub fn compile_expecting(
        &mut self,
        routine: &Arc<Routine>,
        expected: Ty,
    ) -> Result<Arc<CompiledBody>, InferError> {
        self.expected.push(expected);
        let result = self.compile(routine);
        self.expected.pop();
        result
    }

    /// Run `f` with diagnostics suppressed.
    pub fn silently<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.silent += 1;
        let result = f(self);
        self.silent -= 1;
        result
    }

    pub(crate) fn begin_specializing(&mut self, key: (usize, Vec<rill_core::TypeHash>)) -> bool {
        self.specializing.insert(key)
    }

    pub(crate) fn end_specializing(&mut self, key: &(usize, Vec<rill_core::TypeHash>)) {
        self.specializing.remove(key);
    }

    fn infer(&mut self, routine: &Arc<Routine>) -> Result<CompiledBody, InferError> {
        let decl = routine.decl();
        check_well_formed(decl, self.is_silent())?;
        control::check_definite_assignment(decl, self.options.strict_assignment, self.is_silent())?;

        let expected = self.expected.last().cloned();
        let mut relaxed = RegSet::new(decl.register_count);
        loop {
            let bump = Bump::new();
            let pass = Pass::new(self, routine, &bump, &relaxed, expected.clone());
            match pass.run() {
                Ok(body) => return Ok(body),
                Err(Abort::Restart(reg)) => {
                    tracing::trace!(routine = %routine.name(), register = reg, "relaxed register to any");
                    if !relaxed.insert(reg) {
                        return Err(InferError::Silent);
                    }
                }
                Err(Abort::Fail(err)) => return Err(err),
            }
        }
    }
}

/// Compile `routine` in a fresh session.
pub fn infer_routine(routine: &Arc<Routine>, env: &dyn InferEnv) -> Result<Arc<CompiledBody>, InferError> {
    Session::new(env).compile(routine)
}

/// Register indices must be in range and the code must not already be specialized.
fn check_well_formed(decl: &RoutineDecl, silent: bool) -> Result<(), InferError> {
    for (pc, ai) in decl.code.iter().enumerate() {
        let ops = classify(&ai.instr);
        let in_range = ops.reads.iter().all(|r| r < decl.register_count)
            && ops.write.is_none_or(|w| (w as usize) < decl.register_count);
        if ai.op().is_specialized() || !in_range {
            return Err(typing_error(
                silent,
                Diagnostic::new(InferErrorKind::InvalidOperation, decl, pc, ai),
            ));
        }
    }
    Ok(())
}

fn typing_error(silent: bool, diagnostic: Diagnostic) -> InferError {
    if silent {
        InferError::Silent
    } else {
        InferError::Typing(Box::new(diagnostic))
    }
}

// ============================================================================
// Pass
// ============================================================================

/// Why the pass stopped early.
pub(crate) enum Abort {
    /// Relax this register to `any` and start over.
    Restart(usize),
    Fail(InferError),
}

impl From<InferError> for Abort {
    fn from(err: InferError) -> Self {
        Abort::Fail(err)
    }
}

pub(crate) type Step = Result<(), Abort>;

/// A statically known callee held in a register.
#[derive(Debug, Clone)]
pub(crate) enum Callee {
    Routine(Arc<Routine>),
    Overloads(Arc<OverloadSet>),
    Class(Arc<ClassDef>),
}

impl Callee {
    fn from_constant(constant: &Constant) -> Option<Callee> {
        match constant {
            Constant::Routine(r) => Some(Callee::Routine(r.clone())),
            Constant::Overloads(o) => Some(Callee::Overloads(o.clone())),
            Constant::Class(c) => Some(Callee::Class(c.clone())),
            _ => None,
        }
    }
}

pub(crate) struct Pass<'p, 'e, 'b> {
    session: &'p mut Session<'e>,
    routine: &'p Arc<Routine>,
    decl: &'p RoutineDecl,
    options: InferOptions,
    code: Vec<AnnotatedInstr>,
    constants: ConstantPool,
    types: Vec<Option<Ty>>,
    /// Registers whose type is fixed by a declaration.
    declared: RegSet,
    /// Number of instructions writing each register.
    writes: Vec<u32>,
    consts: Vec<Option<Constant>>,
    callees: Vec<Option<Callee>>,
    inserts: bumpalo::collections::Vec<'b, Insertion>,
    static_callees: FxHashMap<usize, Arc<Routine>>,
    ret: Option<Ty>,
    expected_return: Option<Ty>,
}

impl<'p, 'e, 'b> Pass<'p, 'e, 'b> {
    fn new(
        session: &'p mut Session<'e>,
        routine: &'p Arc<Routine>,
        bump: &'b Bump,
        relaxed: &RegSet,
        expected_return: Option<Ty>,
    ) -> Self {
        let decl = routine.decl();
        let types_table = TypeTable::global();
        let n = decl.register_count;
        let mut types: Vec<Option<Ty>> = vec![None; n];
        let mut declared = RegSet::new(n);
        for (reg, ty) in decl.register_types.iter().enumerate().take(n) {
            if let Some(ty) = ty {
                types[reg] = Some(ty.strip());
                declared.insert(reg);
            }
        }
        for reg in relaxed.iter() {
            if !declared.contains(reg) {
                types[reg] = Some(types_table.any());
            }
        }
        if decl.variadic && decl.params.len() < n && types[decl.params.len()].is_none() {
            types[decl.params.len()] = Some(types_table.any());
            declared.insert(decl.params.len());
        }

        let mut writes = vec![0u32; n];
        for ai in &decl.code {
            if let Some(w) = classify(&ai.instr).write {
                writes[w as usize] += 1;
            }
        }

        Pass {
            options: session.options,
            session,
            routine,
            decl,
            code: decl.code.clone(),
            constants: decl.constants.clone(),
            types,
            declared,
            writes,
            consts: vec![None; n],
            callees: vec![None; n],
            inserts: bumpalo::collections::Vec::new_in(bump),
            static_callees: FxHashMap::default(),
            ret: decl.ret.clone(),
            expected_return,
        }
    }

    fn run(mut self) -> Result<CompiledBody, Abort> {
        for pc in 0..self.code.len() {
            let instr = self.code[pc].instr;
            self.step(pc, instr)?;
        }
        Ok(self.finish())
    }

    fn step(&mut self, pc: usize, instr: Instruction) -> Step {
        use OpCode::*;
        match instr.op {
            Nop | Goto | Case | Try | EndTry | Raise => Ok(()),
            Data | GetConst => values::infer_load(self, pc, instr),
            GetGlobal | SetGlobal => values::infer_global(self, pc, instr),
            GetCapture | SetCapture => values::infer_capture(self, pc, instr),
            Move | Cast => values::infer_move(self, pc, instr),
            Check => values::infer_check(self, pc, instr),
            NamedArg => values::infer_named_arg(self, pc, instr),
            Tuple | List | Map | Array => values::infer_construct(self, pc, instr),
            Closure => values::infer_closure(self, pc, instr),
            Not | Neg | BitNot => arith::infer_unary(self, pc, instr),
            Add | Sub | Mul | Div | Mod | Pow | And | Or | Lt | Le | Eq | Ne | BitAnd | BitOr
            | BitXor | Shl | Shr => arith::infer_binary(self, pc, instr),
            GetItem | SetItem => access::infer_item(self, pc, instr),
            GetField | SetField => access::infer_field(self, pc, instr),
            Call | MCall => calls::infer_call(self, pc, instr),
            Return => calls::infer_return(self, pc, instr),
            Yield => calls::infer_yield(self, pc, instr),
            Test => control::infer_test(self, pc, instr),
            Switch => control::infer_switch(self, pc, instr),
            Rescue => control::infer_rescue(self, pc, instr),
            // Rejected up front by check_well_formed.
            _ => Err(self.fail(pc, InferErrorKind::InvalidOperation)),
        }
    }

    fn finish(self) -> CompiledBody {
        let types = TypeTable::global();
        let tail_ok = !self.routine.is_coroutine()
            && !self.decl.code.iter().any(|ai| ai.op() == OpCode::Try);
        let (code, static_callees) = splice(&self.code, &self.inserts, self.static_callees);
        let (mut code, static_callees) = prune_unreachable(code, static_callees);
        if tail_ok {
            control::mark_tail_calls(&mut code);
        }

        let register_types: Vec<Ty> = self
            .types
            .into_iter()
            .map(|t| t.unwrap_or_else(|| types.undefined()))
            .collect();
        let mut scalar_registers = RegSet::new(register_types.len());
        for (reg, ty) in register_types.iter().enumerate() {
            if ty.kind().is_scalar() {
                scalar_registers.insert(reg);
            }
        }
        let ret = self.ret.unwrap_or_else(|| types.none());
        CompiledBody {
            code,
            register_types,
            constants: self.constants,
            scalar_registers,
            static_callees,
            signature: self.decl.signature_type(Some(&ret)),
        }
    }

    // ========================================================================
    // Register state
    // ========================================================================

    /// Static type of a register; `?` while unknown.
    pub(crate) fn ty(&self, reg: u16) -> Ty {
        self.types[reg as usize]
            .clone()
            .unwrap_or_else(|| TypeTable::global().undefined())
    }

    #[inline]
    pub(crate) fn kind(&self, reg: u16) -> TypeKind {
        self.types[reg as usize]
            .as_ref()
            .map_or(TypeKind::Undefined, |t| t.kind())
    }

    /// Known constant value of a single-write register.
    pub(crate) fn constant_of(&self, reg: u16) -> Option<&Constant> {
        self.consts.get(reg as usize).and_then(Option::as_ref)
    }

    pub(crate) fn callee_of(&self, reg: u16) -> Option<&Callee> {
        self.callees.get(reg as usize).and_then(Option::as_ref)
    }

    /// Record what a single-write register is known to hold.
    pub(crate) fn remember(&mut self, reg: u16, constant: Option<Constant>) {
        let r = reg as usize;
        if self.writes.get(r) != Some(&1) {
            return;
        }
        if let Some(c) = &constant {
            self.callees[r] = Callee::from_constant(c);
        }
        self.consts[r] = constant.filter(|c| {
            matches!(
                c,
                Constant::None
                    | Constant::Int(_)
                    | Constant::Float(_)
                    | Constant::Double(_)
                    | Constant::Complex(_)
                    | Constant::String(_)
                    | Constant::Enum(..)
            )
        });
    }

    pub(crate) fn remember_callee(&mut self, reg: u16, callee: Callee) {
        if self.writes.get(reg as usize) == Some(&1) {
            self.callees[reg as usize] = Some(callee);
        }
    }

    /// Allocate a temporary register of type `ty`.
    pub(crate) fn temp(&mut self, ty: Ty) -> u16 {
        self.types.push(Some(ty));
        (self.types.len() - 1) as u16
    }

    // ========================================================================
    // Rewriting
    // ========================================================================

    /// Replace the opcode at `pc`, when specialization is enabled.
    pub(crate) fn specialize(&mut self, pc: usize, op: OpCode) {
        if self.options.typed_code {
            self.code[pc].instr.op = op;
        }
    }

    #[inline]
    pub(crate) fn instr_mut(&mut self, pc: usize) -> &mut Instruction {
        &mut self.code[pc].instr
    }

    pub(crate) fn insert_before(&mut self, pc: usize, instr: Instruction) {
        self.inserts.push(Insertion {
            pc,
            placement: Placement::Before,
            instr,
        });
    }

    pub(crate) fn insert_after(&mut self, pc: usize, instr: Instruction) {
        self.inserts.push(Insertion {
            pc,
            placement: Placement::After,
            instr,
        });
    }

    /// Type the register written at `pc` with `ty`.
    ///
    /// Unknown registers adopt `ty`. A numeric value of another numeric kind,
    /// or a dynamically typed value, is written to a temporary first and
    /// converted into the register by an inserted move or cast.
    pub(crate) fn bind(&mut self, pc: usize, dest: u16, ty: &Ty) -> Step {
        let types = TypeTable::global();
        let d = dest as usize;
        let Some(current) = self.types[d].clone() else {
            self.types[d] = Some(ty.strip());
            return Ok(());
        };
        if current.hash() == ty.hash() || current.is_dynamic() {
            return Ok(());
        }
        if current.is_numeric() && ty.is_numeric() {
            let temp = self.temp(ty.clone());
            self.redirect_write(pc, temp);
            let mv = numeric_move(current.kind(), ty.kind());
            self.insert_after(pc, Instruction::new(mv, temp, 0, dest));
            return Ok(());
        }
        match match_type(ty, &current) {
            MatchLevel::Equal | MatchLevel::Subtype | MatchLevel::AnyWildcard => Ok(()),
            MatchLevel::Relaxed => {
                let temp = self.temp(types.any());
                self.redirect_write(pc, temp);
                self.insert_after(pc, Instruction::new(OpCode::Cast, temp, 0, dest));
                Ok(())
            }
            MatchLevel::NoMatch if self.declared.contains(d) => Err(self.fail_with(
                pc,
                InferErrorKind::TypeNotConsistent,
                |diag| diag.mismatch(ty.name(), current.name()),
            )),
            MatchLevel::NoMatch => Err(Abort::Restart(d)),
        }
    }

    /// Bind a `Named` wrapper without unwrapping it; the register holds the
    /// wrapper tuple at run time.
    pub(crate) fn bind_wrapper(&mut self, pc: usize, dest: u16, ty: &Ty) -> Step {
        let d = dest as usize;
        match self.types[d].clone() {
            None => {
                self.types[d] = Some(ty.clone());
                Ok(())
            }
            Some(current) if current.hash() == ty.hash() || current.is_dynamic() => Ok(()),
            Some(current) if self.declared.contains(d) => Err(self.fail_with(
                pc,
                InferErrorKind::TypeNotConsistent,
                |diag| diag.mismatch(ty.name(), current.name()),
            )),
            Some(_) => Err(Abort::Restart(d)),
        }
    }

    fn redirect_write(&mut self, pc: usize, temp: u16) {
        let instr = &mut self.code[pc].instr;
        match instr.op {
            OpCode::Rescue => instr.a = temp,
            _ => instr.c = temp,
        }
    }

    /// A register holding `reg`'s value as `target`, converting before `pc` if needed.
    pub(crate) fn coerce(&mut self, pc: usize, reg: u16, target: &Ty) -> Result<u16, Abort> {
        let source = self.ty(reg);
        if source.hash() == target.hash() || target.is_dynamic() {
            return Ok(reg);
        }
        if source.is_numeric() && target.is_numeric() {
            let temp = self.temp(target.strip());
            let mv = numeric_move(target.kind(), source.kind());
            self.insert_before(pc, Instruction::new(mv, reg, 0, temp));
            return Ok(temp);
        }
        match match_type(&source, target) {
            MatchLevel::Equal | MatchLevel::Subtype | MatchLevel::AnyWildcard => Ok(reg),
            MatchLevel::Relaxed => {
                let temp = self.temp(target.strip());
                self.insert_before(pc, Instruction::new(OpCode::Cast, reg, 0, temp));
                Ok(temp)
            }
            MatchLevel::NoMatch => Err(self.fail_with(pc, InferErrorKind::TypeNotMatching, |d| {
                d.mismatch(source.name(), target.name())
            })),
        }
    }

    // ========================================================================
    // Errors
    // ========================================================================

    pub(crate) fn diagnostic(&self, pc: usize, kind: InferErrorKind) -> Diagnostic {
        Diagnostic::new(kind, self.decl, pc, &self.decl.code[pc])
    }

    pub(crate) fn fail(&self, pc: usize, kind: InferErrorKind) -> Abort {
        self.fail_with(pc, kind, |d| d)
    }

    pub(crate) fn fail_with(
        &self,
        pc: usize,
        kind: InferErrorKind,
        decorate: impl FnOnce(Diagnostic) -> Diagnostic,
    ) -> Abort {
        if self.session.is_silent() {
            return Abort::Fail(InferError::Silent);
        }
        Abort::Fail(InferError::Typing(Box::new(decorate(self.diagnostic(pc, kind)))))
    }

    /// Name of a constant operand, for field access.
    pub(crate) fn constant_name(&self, index: u16) -> Option<Arc<str>> {
        match self.constants.get(index) {
            Some(Constant::String(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Move converting a value of numeric kind `from` into numeric kind `to`.
pub(crate) fn numeric_move(to: TypeKind, from: TypeKind) -> OpCode {
    use OpCode::*;
    match (to, from) {
        (TypeKind::Int, TypeKind::Int) => MoveII,
        (TypeKind::Int, TypeKind::Float) => MoveIF,
        (TypeKind::Int, TypeKind::Double) => MoveID,
        (TypeKind::Float, TypeKind::Int) => MoveFI,
        (TypeKind::Float, TypeKind::Float) => MoveFF,
        (TypeKind::Float, TypeKind::Double) => MoveFD,
        (TypeKind::Double, TypeKind::Int) => MoveDI,
        (TypeKind::Double, TypeKind::Float) => MoveDF,
        (TypeKind::Double, TypeKind::Double) => MoveDD,
        _ => Cast,
    }
}
