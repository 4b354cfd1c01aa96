//! End-to-end tests for the execution engine.
//!
//! Each test registers hand-assembled routines with a [`Program`], runs them
//! through a [`Vm`] and checks both the result and the code inference
//! produced for them.

use std::collections::BTreeMap;

use rill::prelude::*;
use rill::rill_core::bytecode::data_kind;
use rill::rill_core::{CaseMode, InferError, InferErrorKind, MapKey, RoutineFlags};

fn vm_for(program: Program) -> Vm {
    Vm::new(Arc::new(program))
}

fn first_routine(program: &Program, name: &str) -> Arc<Routine> {
    program.routines(name).expect("registered routine").routines()[0].clone()
}

// =============================================================================
// Arithmetic
// =============================================================================

#[test]
fn test_typed_integer_addition() {
    let t = TypeTable::global();
    let f = RoutineBuilder::new("f")
        .param("x", t.int())
        .param("y", t.int())
        .returns(t.int())
        .emit(OpCode::Add, 0, 1, 2)
        .emit(OpCode::Return, 2, 1, 0)
        .build();
    let mut program = Program::new();
    program.add_routine(f.clone()).unwrap();
    let mut vm = vm_for(program);

    assert!(matches!(vm.call("f", vec![Value::Int(2), Value::Int(3)]), Ok(Value::Int(5))));
    let body = f.body().expect("compiled on first call");
    assert_eq!(body.code[0].op(), OpCode::AddIII);
}

#[test]
fn test_compile_all_before_running() {
    let t = TypeTable::global();
    let mut program = Program::new();
    program
        .add_routine(
            RoutineBuilder::new("area")
                .param("w", t.double())
                .param("h", t.double())
                .emit(OpCode::Mul, 0, 1, 2)
                .emit(OpCode::Return, 2, 1, 0)
                .build(),
        )
        .unwrap();
    program.compile_all().unwrap();
    let area = first_routine(&program, "area");
    assert!(area.is_compiled());

    let mut vm = vm_for(program);
    assert!(matches!(
        vm.call("area", vec![Value::Double(2.5), Value::Double(4.0)]),
        Ok(Value::Double(d)) if d == 10.0
    ));
}

// =============================================================================
// Calls
// =============================================================================

#[test]
fn test_generic_callee_runs_specialized() {
    let t = TypeTable::global();
    let g = RoutineBuilder::new("g")
        .param("x", t.any())
        .returns(t.any())
        .emit(OpCode::Data, data_kind::INT, 0, 1)
        .emit(OpCode::GetItem, 0, 1, 2)
        .emit(OpCode::Return, 2, 1, 0)
        .build();
    let main = RoutineBuilder::new("main")
        .param("xs", t.list(t.int()))
        .constant(Constant::Routine(g.clone()))
        .emit(OpCode::GetConst, 0, 0, 1)
        .emit(OpCode::Move, 0, 0, 2)
        .emit(OpCode::Call, 1, 1, 3)
        .emit(OpCode::Return, 3, 1, 0)
        .build();
    let mut program = Program::new();
    program.add_routine(g.clone()).unwrap();
    program.add_routine(main).unwrap();
    let mut vm = vm_for(program);

    let xs = vm
        .heap_mut()
        .new_list(t.list(t.int()), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    assert!(matches!(vm.call("main", vec![xs]), Ok(Value::Int(1))));
    assert_eq!(g.specialization_count(), 1);

    // A direct call with another element type adds a second specialization.
    let words = vm.heap_mut().new_list(t.list(t.string()), vec![Value::String(Arc::from("z"))]);
    let word = vm.call("g", vec![words]).unwrap();
    assert_eq!(word.as_str(), Some("z"));
    assert_eq!(g.specialization_count(), 2);

    // A map keyed by strings cannot take `x[0]`: the signature is still cached,
    // running the unspecialized item access that raises at run time.
    for _ in 0..2 {
        let mut entries = BTreeMap::new();
        entries.insert(MapKey::String(Arc::from("a")), Value::Int(9));
        let table = vm.heap_mut().new_map(t.map(t.string(), t.int()), entries);
        let err = vm.call("g", vec![table]).unwrap_err();
        assert_eq!(err.exception().map(|r| r.category.as_str()), Some("Error::Key"));
        assert_eq!(g.specialization_count(), 3);
    }
    assert_eq!(vm.heap().live_count(), 0);
}

#[test]
fn test_overload_selected_by_argument_types() {
    let t = TypeTable::global();
    let h_int = RoutineBuilder::new("h")
        .param("a", t.int())
        .param("b", t.int())
        .returns(t.int())
        .emit(OpCode::Add, 0, 1, 2)
        .emit(OpCode::Return, 2, 1, 0)
        .build();
    let h_str = RoutineBuilder::new("h")
        .param("a", t.string())
        .param("b", t.string())
        .returns(t.string())
        .emit(OpCode::Add, 0, 1, 2)
        .emit(OpCode::Return, 2, 1, 0)
        .build();
    let mut program = Program::new();
    program.add_routine(h_int).unwrap();
    let set = program.add_routine(h_str.clone()).unwrap();
    let main = RoutineBuilder::new("main")
        .constant(Constant::Overloads(set))
        .constant(Constant::string("a"))
        .constant(Constant::string("b"))
        .emit(OpCode::GetConst, 0, 0, 0)
        .emit(OpCode::GetConst, 0, 1, 1)
        .emit(OpCode::GetConst, 0, 2, 2)
        .emit(OpCode::Call, 0, 2, 3)
        .emit(OpCode::Return, 3, 1, 0)
        .build();
    program.add_routine(main.clone()).unwrap();
    let mut vm = vm_for(program);

    let joined = vm.call("main", vec![]).unwrap();
    assert_eq!(joined.as_str(), Some("ab"));
    let body = main.body().unwrap();
    assert_eq!(body.code[3].op(), OpCode::CallTyped);
    assert!(Arc::ptr_eq(&body.static_callees[&3], &h_str));

    assert!(matches!(vm.call("h", vec![Value::Int(4), Value::Int(5)]), Ok(Value::Int(9))));
}

#[test]
fn test_host_function_called_from_script() {
    fn char_count(_heap: &mut Heap, args: &[Value]) -> Result<Value, RuntimeError> {
        match args[0].as_str() {
            Some(s) => Ok(Value::Int(s.chars().count() as i64)),
            None => Err(RuntimeError::type_mismatch("string", "other")),
        }
    }

    let t = TypeTable::global();
    let mut program = Program::new();
    let len = program
        .add_native(
            RoutineBuilder::new("len").param("s", t.string()).returns(t.int()),
            char_count,
        )
        .unwrap();
    program
        .add_routine(
            RoutineBuilder::new("double_len")
                .param("s", t.string())
                .constant(Constant::Overloads(len))
                .emit(OpCode::GetConst, 0, 0, 1)
                .emit(OpCode::Move, 0, 0, 2)
                .emit(OpCode::Call, 1, 1, 3)
                .emit(OpCode::Add, 3, 3, 4)
                .emit(OpCode::Return, 4, 1, 0)
                .build(),
        )
        .unwrap();
    let mut vm = vm_for(program);
    assert!(matches!(
        vm.call("double_len", vec![Value::String(Arc::from("naïve"))]),
        Ok(Value::Int(10))
    ));
}

#[test]
fn test_closure_keeps_its_captures() {
    let t = TypeTable::global();
    let add_k = RoutineBuilder::new("add_k")
        .param("x", t.int())
        .capture(t.int())
        .emit(OpCode::GetCapture, 0, 0, 1)
        .emit(OpCode::Add, 0, 1, 2)
        .emit(OpCode::Return, 2, 1, 0)
        .build();
    let make_adder = RoutineBuilder::new("make_adder")
        .param("k", t.int())
        .constant(Constant::Routine(add_k))
        .emit(OpCode::GetConst, 0, 0, 1)
        .emit(OpCode::Move, 0, 0, 2)
        .emit(OpCode::Closure, 1, 1, 3)
        .emit(OpCode::Return, 3, 1, 0)
        .build();
    let mut program = Program::new();
    program.add_routine(make_adder).unwrap();
    let mut vm = vm_for(program);

    let adder = vm.call("make_adder", vec![Value::Int(10)]).unwrap();
    assert!(matches!(adder, Value::Closure(_)));
    assert!(matches!(vm.call_value(adder.clone(), vec![Value::Int(5)]), Ok(Value::Int(15))));
    assert!(matches!(vm.call_value(adder.clone(), vec![Value::Int(-10)]), Ok(Value::Int(0))));
    vm.release(&adder);
    assert_eq!(vm.heap().live_count(), 0);
}

// =============================================================================
// Classes
// =============================================================================

#[test]
fn test_constructor_initializes_fields() {
    let t = TypeTable::global();
    let builder = ClassBuilder::new(ClassId(20), "Point", None)
        .field("x", t.int(), Constant::Int(0))
        .field("y", t.int(), Constant::Int(0));
    let point = builder.object_type();
    let init = RoutineBuilder::new("Point")
        .param("self", point.clone())
        .param("x", t.int())
        .param("y", t.int())
        .host(ClassId(20))
        .flags(RoutineFlags::CONSTRUCTOR)
        .constant(Constant::string("x"))
        .constant(Constant::string("y"))
        .emit(OpCode::SetField, 1, 0, 0)
        .emit(OpCode::SetField, 2, 1, 0)
        .emit(OpCode::Return, 0, 0, 0)
        .build();
    let class = builder.constructor(init).build();
    let norm = RoutineBuilder::new("manhattan")
        .param("p", point)
        .constant(Constant::string("x"))
        .constant(Constant::string("y"))
        .emit(OpCode::GetField, 0, 0, 1)
        .emit(OpCode::GetField, 0, 1, 2)
        .emit(OpCode::Add, 1, 2, 3)
        .emit(OpCode::Return, 3, 1, 0)
        .build();

    let mut program = Program::new();
    program.add_class(class.clone()).unwrap();
    program.add_routine(norm).unwrap();
    let mut vm = vm_for(program);

    let p = vm.call_value(Value::Class(class), vec![Value::Int(3), Value::Int(4)]).unwrap();
    let fields = match p.handle().and_then(|h| vm.heap().get(h)) {
        Some(HeapObject::Instance(o)) => o.fields.clone(),
        other => panic!("expected an instance, got {other:?}"),
    };
    assert!(matches!(fields.as_slice(), [Value::Int(3), Value::Int(4)]));
    assert!(matches!(vm.call("manhattan", vec![p.clone()]), Ok(Value::Int(7))));
    vm.release(&p);
    assert_eq!(vm.heap().live_count(), 0);
}

#[test]
fn test_objects_without_operators_compare_by_identity() {
    let plain = ClassBuilder::new(ClassId(32), "Plain", None).build();
    let ty = plain.object_type.clone();
    let same = RoutineBuilder::new("same")
        .param("a", ty.clone())
        .param("b", ty.clone())
        .emit(OpCode::Eq, 0, 1, 2)
        .emit(OpCode::Return, 2, 1, 0)
        .build();
    let differ = RoutineBuilder::new("differ")
        .param("a", ty.clone())
        .param("b", ty.clone())
        .emit(OpCode::Ne, 0, 1, 2)
        .emit(OpCode::Return, 2, 1, 0)
        .build();
    let mut program = Program::new();
    program.add_class(plain).unwrap();
    program.add_routine(same).unwrap();
    program.add_routine(differ).unwrap();
    let mut vm = vm_for(program);

    let a = vm.heap_mut().new_instance(ClassId(32), ty.clone(), vec![]);
    let b = vm.heap_mut().new_instance(ClassId(32), ty, vec![]);
    vm.heap_mut().inc_ref(&a);
    vm.heap_mut().inc_ref(&b);
    assert!(matches!(vm.call("same", vec![a.clone(), a.clone()]), Ok(Value::Int(1))));
    assert!(matches!(vm.call("same", vec![a.clone(), b.clone()]), Ok(Value::Int(0))));
    assert!(matches!(vm.call("differ", vec![a.clone(), b.clone()]), Ok(Value::Int(1))));
    vm.release(&a);
    vm.release(&b);
    assert_eq!(vm.heap().live_count(), 0);
}

#[test]
fn test_returned_subtype_matches_declared_type() {
    let t = TypeTable::global();
    let shape = ClassBuilder::new(ClassId(30), "Shape", None).build();
    let square = ClassBuilder::new(ClassId(31), "Square", Some(&shape)).build();
    let upcast = RoutineBuilder::new("upcast")
        .param("s", square.object_type.clone())
        .returns(shape.object_type.clone())
        .emit(OpCode::Return, 0, 1, 0)
        .build();
    let widen = RoutineBuilder::new("widen")
        .param("x", t.int())
        .returns(t.double())
        .emit(OpCode::Return, 0, 1, 0)
        .build();
    let mut program = Program::new();
    program.add_class(shape.clone()).unwrap();
    program.add_class(square.clone()).unwrap();
    program.add_routine(upcast.clone()).unwrap();
    program.add_routine(widen.clone()).unwrap();
    let mut vm = vm_for(program);

    let widened = vm.call("widen", vec![Value::Int(3)]).unwrap();
    assert!(matches!(widened, Value::Double(d) if d == 3.0));
    let declared = widen.return_type().unwrap();
    assert_eq!(vm.heap().type_of(&widened).hash(), declared.hash());

    let s = vm.heap_mut().new_instance(ClassId(31), square.object_type.clone(), vec![]);
    let result = vm.call("upcast", vec![s]).unwrap();
    let declared = upcast.return_type().unwrap();
    assert_eq!(
        rill::rill_infer::match_type(&vm.heap().type_of(&result), &declared),
        rill::rill_infer::MatchLevel::Subtype
    );
    vm.release(&result);
    assert_eq!(vm.heap().live_count(), 0);
}

// =============================================================================
// Control flow
// =============================================================================

/// `pick(x)`: the label index modulo 3 for a matching label, -1 otherwise.
fn switch_program(labels: &[i64]) -> (Program, Arc<Routine>) {
    let t = TypeTable::global();
    let count = labels.len() as u16;
    let blocks = 1 + count;
    let mut b = RoutineBuilder::new("pick").param("x", t.int());
    for &label in labels {
        b = b.constant(Constant::Int(label));
    }
    b = b.emit(OpCode::Switch, 0, blocks + 6, count);
    for i in 0..count {
        b = b.emit(OpCode::Case, i, blocks + 2 * (i % 3), 0);
    }
    for k in 0..3u16 {
        b = b.emit(OpCode::Data, data_kind::INT, k, 1).emit(OpCode::Return, 1, 1, 0);
    }
    let pick = b
        .emit(OpCode::Data, data_kind::INT, (-1i16) as u16, 1)
        .emit(OpCode::Return, 1, 1, 0)
        .build();
    let mut program = Program::new();
    program.add_routine(pick.clone()).unwrap();
    (program, pick)
}

fn picked(vm: &mut Vm, x: i64) -> i64 {
    match vm.call("pick", vec![Value::Int(x)]) {
        Ok(Value::Int(i)) => i,
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn test_dense_switch_uses_a_table() {
    let labels: Vec<i64> = (0..100).collect();
    let (program, pick) = switch_program(&labels);
    let mut vm = vm_for(program);
    for x in [0, 1, 2, 3, 50, 99] {
        assert_eq!(picked(&mut vm, x), x % 3, "x = {x}");
    }
    assert_eq!(picked(&mut vm, 100), -1);
    assert_eq!(picked(&mut vm, -1), -1);

    let body = pick.body().unwrap();
    assert_eq!(body.code[1].instr.c, CaseMode::Table as u16);
}

#[test]
fn test_sparse_switch_is_searched_in_order() {
    let (program, pick) = switch_program(&[1000, 1, 50]);
    let mut vm = vm_for(program);
    assert_eq!(picked(&mut vm, 1000), 0);
    assert_eq!(picked(&mut vm, 1), 1);
    assert_eq!(picked(&mut vm, 50), 2);
    assert_eq!(picked(&mut vm, 7), -1);

    let body = pick.body().unwrap();
    assert!(body.code[1..=3].iter().all(|ai| ai.instr.c == CaseMode::Ordered as u16));
}

#[test]
fn test_coroutine_yields_until_finished() {
    let t = TypeTable::global();
    let counter = RoutineBuilder::new("counter")
        .param("n", t.int())
        .yields(t.int())
        .emit(OpCode::Yield, 0, 1, 1)
        .emit(OpCode::Data, data_kind::INT, 1, 2)
        .emit(OpCode::Add, 0, 2, 3)
        .emit(OpCode::Yield, 3, 1, 1)
        .emit(OpCode::Data, data_kind::INT, 0, 4)
        .emit(OpCode::Return, 4, 1, 0)
        .build();
    let mut program = Program::new();
    program.add_routine(counter).unwrap();
    let mut vm = vm_for(program);

    let Ok(Value::Process(pid)) = vm.call("counter", vec![Value::Int(10)]) else {
        panic!("calling a coroutine returns its process");
    };
    assert_eq!(vm.process_state(pid), Some(ProcessState::Suspended));
    assert!(matches!(vm.resume(pid, vec![]), Ok(Resumed::Yielded(Value::Int(10)))));
    assert!(matches!(vm.resume(pid, vec![]), Ok(Resumed::Yielded(Value::Int(11)))));
    assert!(matches!(vm.resume(pid, vec![]), Ok(Resumed::Finished(Value::Int(0)))));
    assert_eq!(vm.process_state(pid), Some(ProcessState::Finished));
    assert!(matches!(
        vm.resume(pid, vec![]),
        Err(RillError::Resume(_, "process has finished"))
    ));
    assert!(vm.remove_process(pid));
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_use_before_init_is_reported_at_first_call() {
    let t = TypeTable::global();
    let e = RoutineBuilder::new("e")
        .param("x", t.int())
        .source("if x {\n  y = 7\n  return y\n}\nreturn x + y")
        .line(1)
        .emit(OpCode::Test, 0, 3, 0)
        .line(2)
        .emit(OpCode::Data, data_kind::INT, 7, 1)
        .line(3)
        .emit(OpCode::Return, 1, 1, 0)
        .line(5)
        .emit(OpCode::Add, 0, 1, 2)
        .emit(OpCode::Return, 2, 1, 0)
        .build();
    let mut program = Program::new();
    program.add_routine(e.clone()).unwrap();
    let mut vm = vm_for(program);

    let Err(RillError::Infer(err)) = vm.call("e", vec![Value::Int(1)]) else {
        panic!("expected an inference failure");
    };
    assert_eq!(err.kind(), Some(InferErrorKind::NotInitialized));
    let diagnostic = err.diagnostic().expect("typing diagnostic");
    assert_eq!(diagnostic.line(), 5);
    assert_eq!(diagnostic.source.as_deref(), Some("return x + y"));
    assert!(matches!(err, InferError::Typing(_)));
    assert!(!e.is_compiled());
}

#[test]
fn test_uncaught_exception_reaches_the_host() {
    let t = TypeTable::global();
    let at = RoutineBuilder::new("at")
        .param("xs", t.list(t.int()))
        .param("i", t.int())
        .line(12)
        .emit(OpCode::GetItem, 0, 1, 2)
        .emit(OpCode::Return, 2, 1, 0)
        .build();
    let mut program = Program::new();
    program.add_routine(at).unwrap();
    let mut vm = vm_for(program);

    let xs = vm.heap_mut().new_list(t.list(t.int()), vec![Value::Int(1)]);
    let err = vm.call("at", vec![xs, Value::Int(4)]).unwrap_err();
    let report = err.exception().expect("uncaught exception");
    assert_eq!(report.category, "Error::Index");
    assert_eq!(&*report.routine, "at");
    assert_eq!(report.line, 12);
    assert_eq!(vm.heap().live_count(), 0);
}

// =============================================================================
// Memory
// =============================================================================

#[test]
fn test_cycles_are_collected_on_demand() {
    let t = TypeTable::global();
    // xs = {0}; xs[0] = xs
    let knot = RoutineBuilder::new("knot")
        .local(1, t.list(t.any()))
        .emit(OpCode::Data, data_kind::INT, 0, 0)
        .emit(OpCode::List, 0, 1, 1)
        .emit(OpCode::Data, data_kind::INT, 0, 2)
        .emit(OpCode::SetItem, 1, 2, 1)
        .emit(OpCode::Return, 0, 0, 0)
        .build();
    let mut program = Program::new();
    program.set_property(EngineProperty::GcThreshold, 0);
    program.add_routine(knot).unwrap();
    let mut vm = vm_for(program);

    assert!(matches!(vm.call("knot", vec![]), Ok(Value::None)));
    assert_eq!(vm.heap().live_count(), 1);
    assert_eq!(vm.collect_garbage(), 1);
    assert_eq!(vm.heap().live_count(), 0);
    let stats = vm.gc_statistics();
    assert_eq!(stats.collections, 1);
    assert_eq!(stats.total_freed, 1);
}
