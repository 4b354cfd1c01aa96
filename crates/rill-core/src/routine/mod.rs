//! Routines, overload sets and classes.
//!
//! A [`Routine`] starts life as a [`RoutineDecl`] handed over by a front end:
//! unspecialized instructions, declared parameter/return types, constants and
//! source lines. Inference later installs a [`CompiledBody`] exactly once.
//! Generic routines additionally own a cache of per-signature
//! specializations.
//!
//! ## Concurrency
//!
//! Both the compiled body and the specialization cache tolerate races: two
//! threads may compile the same thing, the first to publish wins and the
//! other result is dropped. The specialization lock is only held for the
//! check-and-insert, never across a (possibly recursive) compile.

mod builder;
mod class;
mod overload;

pub use builder::RoutineBuilder;
pub use class::{ClassBuilder, ClassDef, FieldDef, FieldFlags};
pub use overload::{OverloadSet, ParamTrie, TrieNode};

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use crate::bytecode::{AnnotatedInstr, Constant, ConstantPool};
use crate::error::RuntimeError;
use crate::heap::Heap;
use crate::regset::RegSet;
use crate::types::{ClassId, Ty, TypeKind, TypeTable};
use crate::value::Value;
use crate::TypeHash;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RoutineFlags: u16 {
        /// Takes its receiver as the first parameter.
        const METHOD = 1 << 0;
        /// Dispatched through the receiver class's override table.
        const VIRTUAL = 1 << 1;
        /// Calling it creates a suspended process instead of running it.
        const COROUTINE = 1 << 2;
        const CONSTRUCTOR = 1 << 3;
        /// A specialization cloned from a generic routine.
        const SPECIALIZED = 1 << 4;
    }
}

/// A declared parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: Arc<str>,
    pub ty: Ty,
    pub default: Option<Constant>,
}

/// Host function implementing a native routine.
pub type NativeFn = fn(&mut Heap, &[Value]) -> Result<Value, RuntimeError>;

/// Everything a front end supplies about a routine.
#[derive(Debug, Clone)]
pub struct RoutineDecl {
    pub name: Arc<str>,
    pub params: Vec<Param>,
    pub variadic: bool,
    /// Declared return type; `None` means "infer".
    pub ret: Option<Ty>,
    /// Yield type of a coroutine.
    pub yields: Option<Ty>,
    pub flags: RoutineFlags,
    pub host: Option<ClassId>,
    /// Types of captured variables, for closures.
    pub captures: Vec<Ty>,
    pub register_count: usize,
    /// Declared register types; parameters occupy the first slots.
    pub register_types: Vec<Option<Ty>>,
    pub code: Vec<AnnotatedInstr>,
    pub constants: ConstantPool,
    /// Source text by line (index 0 is line 1).
    pub source: Vec<Arc<str>>,
    pub def_line: u32,
    pub file: Arc<str>,
}

impl RoutineDecl {
    /// Source text of a 1-based line.
    pub fn source_line(&self, line: u32) -> Option<&str> {
        line.checked_sub(1)
            .and_then(|i| self.source.get(i as usize))
            .map(|s| s.as_ref())
    }

    /// The routine type: parameter wrappers, var-args marker, return.
    pub fn signature_type(&self, ret: Option<&Ty>) -> Ty {
        let types = TypeTable::global();
        let mut params: Vec<Ty> = self
            .params
            .iter()
            .map(|p| {
                if p.default.is_some() {
                    types.defaulted(&p.name, p.ty.clone())
                } else {
                    types.named(&p.name, p.ty.clone())
                }
            })
            .collect();
        if self.variadic {
            params.push(types.varargs());
        }
        let ret = ret
            .cloned()
            .or_else(|| self.ret.clone())
            .unwrap_or_else(|| types.undefined());
        let ret = match (&self.yields, self.flags.contains(RoutineFlags::COROUTINE)) {
            (Some(y), true) => types.process(y.clone()),
            (None, true) => types.process(types.any()),
            _ => ret,
        };
        types.routine(params, ret)
    }
}

/// The result of inference: specialized code and register types.
#[derive(Debug)]
pub struct CompiledBody {
    pub code: Vec<AnnotatedInstr>,
    pub register_types: Vec<Ty>,
    pub constants: ConstantPool,
    /// Registers only ever holding non-counted scalars; frame teardown skips them.
    pub scalar_registers: RegSet,
    /// Callees resolved during inference, by instruction index.
    pub static_callees: FxHashMap<usize, Arc<Routine>>,
    pub signature: Ty,
}

impl CompiledBody {
    #[inline]
    pub fn register_count(&self) -> usize {
        self.register_types.len()
    }
}

/// A compiled or compilable routine.
pub struct Routine {
    decl: RoutineDecl,
    native: Option<NativeFn>,
    identity: TypeHash,
    signature: RwLock<Ty>,
    body: OnceLock<Arc<CompiledBody>>,
    specializations: Mutex<FxHashMap<Vec<TypeHash>, Arc<Routine>>>,
    enclosing: Weak<Routine>,
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Routine({})", self.signature_text())
    }
}

impl Routine {
    pub fn new(decl: RoutineDecl, native: Option<NativeFn>, enclosing: Weak<Routine>) -> Routine {
        let skip = usize::from(decl.flags.contains(RoutineFlags::METHOD));
        let param_hashes: Vec<TypeHash> = decl
            .params
            .iter()
            .skip(skip)
            .map(|p| p.ty.hash())
            .collect();
        let identity = TypeHash::from_routine(&decl.name, &param_hashes);
        let signature = RwLock::new(decl.signature_type(None));
        Routine {
            decl,
            native,
            identity,
            signature,
            body: OnceLock::new(),
            specializations: Mutex::new(FxHashMap::default()),
            enclosing,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    #[inline]
    pub fn decl(&self) -> &RoutineDecl {
        &self.decl
    }

    #[inline]
    pub fn flags(&self) -> RoutineFlags {
        self.decl.flags
    }

    #[inline]
    pub fn native(&self) -> Option<NativeFn> {
        self.native
    }

    #[inline]
    pub fn is_coroutine(&self) -> bool {
        self.decl.flags.contains(RoutineFlags::COROUTINE)
    }

    /// Name plus parameter shapes, receiver excluded; keys override tables.
    #[inline]
    pub fn identity(&self) -> TypeHash {
        self.identity
    }

    /// Current routine type. Carries the inferred return type once known.
    pub fn signature(&self) -> Ty {
        self.signature
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Declared or inferred return type; `None` while still unknown.
    pub fn return_type(&self) -> Option<Ty> {
        let sig = self.signature();
        sig.ret().filter(|r| r.kind() != TypeKind::Undefined).cloned()
    }

    /// Fix the inferred return type in the shared signature.
    pub fn patch_return_type(&self, ret: &Ty) {
        let sig = self.decl.signature_type(Some(ret));
        *self.signature.write().unwrap_or_else(PoisonError::into_inner) = sig;
    }

    pub fn body(&self) -> Option<Arc<CompiledBody>> {
        self.body.get().cloned()
    }

    pub fn is_compiled(&self) -> bool {
        self.native.is_some() || self.body.get().is_some()
    }

    /// Publish a compiled body. Returns the body that won if another thread got there first.
    pub fn install_body(&self, body: Arc<CompiledBody>) -> Arc<CompiledBody> {
        match self.body.set(body.clone()) {
            Ok(()) => {
                *self.signature.write().unwrap_or_else(PoisonError::into_inner) =
                    body.signature.clone();
                body
            }
            Err(_) => {
                tracing::debug!(routine = %self.name(), "discarded duplicate compiled body");
                self.body.get().cloned().unwrap_or(body)
            }
        }
    }

    /// The routine containing this closure, if it is still alive.
    pub fn enclosing(&self) -> Option<Arc<Routine>> {
        self.enclosing.upgrade()
    }

    pub fn enclosing_weak(&self) -> Weak<Routine> {
        self.enclosing.clone()
    }

    /// Cached specialization for an argument signature.
    pub fn specialization(&self, key: &[TypeHash]) -> Option<Arc<Routine>> {
        self.specializations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Publish a specialization; a concurrent winner is returned instead of `candidate`.
    pub fn insert_specialization(&self, key: Vec<TypeHash>, candidate: Arc<Routine>) -> Arc<Routine> {
        let mut cache = self
            .specializations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let winner = cache.entry(key).or_insert_with(|| candidate.clone()).clone();
        if !Arc::ptr_eq(&winner, &candidate) {
            tracing::debug!(routine = %self.name(), "discarded duplicate specialization");
        }
        winner
    }

    pub fn specialization_count(&self) -> usize {
        self.specializations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// `routine name(params)=>ret`, as shown for rejected overload candidates.
    pub fn signature_text(&self) -> String {
        let sig = self.signature();
        let params: Vec<&str> = sig.params().iter().map(|p| p.name()).collect();
        let keyword = if self.name().chars().all(|c| c.is_alphanumeric() || c == '_') {
            "routine"
        } else {
            "operator"
        };
        let mut text = format!("{keyword} {}({})", self.name(), params.join(","));
        if let Some(ret) = sig.ret().filter(|r| r.kind() != TypeKind::Undefined) {
            let _ = write!(text, "=>{}", ret.name());
        }
        text
    }

    /// Instruction dump of the compiled body (or the declaration when not compiled).
    pub fn disassemble(&self) -> String {
        let body = self.body();
        let code = body.as_ref().map(|b| b.code.as_slice()).unwrap_or(&self.decl.code);
        let mut out = String::new();
        for (pc, ai) in code.iter().enumerate() {
            let _ = writeln!(out, "{pc:4}: {:<24} ; line {}", ai.instr.to_string(), ai.line());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::OpCode;

    fn add_routine() -> Arc<Routine> {
        let types = TypeTable::global();
        RoutineBuilder::new("f")
            .param("x", types.int())
            .param("y", types.int())
            .returns(types.int())
            .emit(OpCode::Add, 0, 1, 2)
            .emit(OpCode::Return, 2, 1, 0)
            .build()
    }

    #[test]
    fn signature_text_lists_parameters() {
        let f = add_routine();
        assert_eq!(f.signature_text(), "routine f(x:int,y:int)=>int");
        assert_eq!(f.decl().register_count, 3);
    }

    #[test]
    fn patching_return_type() {
        let types = TypeTable::global();
        let g = RoutineBuilder::new("g").emit(OpCode::Return, 0, 0, 0).build();
        assert!(g.return_type().is_none());
        g.patch_return_type(&types.none());
        assert_eq!(g.return_type().map(|t| t.kind()), Some(TypeKind::None));
    }

    #[test]
    fn specialization_race_keeps_first() {
        let f = add_routine();
        let key = vec![TypeHash(1)];
        let a = add_routine();
        let b = add_routine();
        let first = f.insert_specialization(key.clone(), a.clone());
        let second = f.insert_specialization(key.clone(), b);
        assert!(Arc::ptr_eq(&first, &a));
        assert!(Arc::ptr_eq(&second, &a));
        assert_eq!(f.specialization_count(), 1);
    }

    #[test]
    fn identity_ignores_receiver() {
        let types = TypeTable::global();
        let base = types.object(ClassId(40), "A", None);
        let derived = types.object(ClassId(41), "B", Some(&base));
        let m1 = RoutineBuilder::new("speak")
            .param("self", base)
            .flags(RoutineFlags::METHOD)
            .build();
        let m2 = RoutineBuilder::new("speak")
            .param("self", derived)
            .flags(RoutineFlags::METHOD)
            .build();
        assert_eq!(m1.identity(), m2.identity());
    }

    #[test]
    fn disassembly_lists_instructions() {
        let f = add_routine();
        let dump = f.disassemble();
        assert!(dump.contains("ADD:0,1,2"));
        assert!(dump.contains("RETURN:2,1,0"));
    }
}
