//! Performance benchmarks for inference and execution.
//!
//! - Inference: type inference and specialization of a fresh routine
//! - Execution: a counting loop, typed and untyped
//! - Calls: tail-recursive calls through an overload set
//!
//! ## Profiling with Puffin
//!
//! ```bash
//! cargo bench --features profile-with-puffin -- --profile-time 5
//! ```

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rill::prelude::*;
use rill::rill_core::bytecode::data_kind;
use rill::rill_infer::{StaticEnv, infer_routine};
use std::hint::black_box;

#[cfg(feature = "profile-with-puffin")]
static FRAME_VIEW: std::sync::OnceLock<puffin::GlobalFrameView> = std::sync::OnceLock::new();

#[cfg(feature = "profile-with-puffin")]
fn setup_profiler() {
    puffin::set_scopes_on(true);
    FRAME_VIEW.get_or_init(puffin::GlobalFrameView::default);
}

#[cfg(not(feature = "profile-with-puffin"))]
fn setup_profiler() {}

#[cfg(feature = "profile-with-puffin")]
fn end_profiling_frame() {
    puffin::GlobalProfiler::lock().new_frame();
}

#[cfg(not(feature = "profile-with-puffin"))]
fn end_profiling_frame() {}

/// `acc = 0; i = 0; while i < n { acc += i; i += 1 }; return acc`
fn counting_loop() -> Arc<Routine> {
    let t = TypeTable::global();
    RoutineBuilder::new("count")
        .param("n", t.int())
        .emit(OpCode::Data, data_kind::INT, 0, 1)
        .emit(OpCode::Data, data_kind::INT, 0, 2)
        .emit(OpCode::Lt, 2, 0, 3)
        .emit(OpCode::Test, 3, 8, 0)
        .emit(OpCode::Add, 1, 2, 1)
        .emit(OpCode::Data, data_kind::INT, 1, 4)
        .emit(OpCode::Add, 2, 4, 2)
        .emit(OpCode::Goto, 0, 2, 0)
        .emit(OpCode::Return, 1, 1, 0)
        .build()
}

/// `sum(n, acc) = n == 0 ? acc : sum(n - 1, acc + n)`, called through global 0.
fn tail_sum() -> Arc<Routine> {
    let t = TypeTable::global();
    RoutineBuilder::new("sum")
        .param("n", t.int())
        .param("acc", t.int())
        .returns(t.int())
        .emit(OpCode::Data, data_kind::INT, 0, 2)
        .emit(OpCode::Eq, 0, 2, 3)
        .emit(OpCode::Test, 3, 4, 0)
        .emit(OpCode::Return, 1, 1, 0)
        .emit(OpCode::GetGlobal, 0, 0, 4)
        .emit(OpCode::Data, data_kind::INT, 1, 7)
        .emit(OpCode::Sub, 0, 7, 5)
        .emit(OpCode::Add, 1, 0, 6)
        .emit(OpCode::Call, 4, 2, 8)
        .emit(OpCode::Return, 8, 1, 0)
        .build()
}

fn loop_vm(typed: bool) -> Vm {
    let mut program = Program::new();
    program.set_property(EngineProperty::TypedCode, typed as usize);
    program.add_routine(counting_loop()).expect("register count");
    Vm::new(Arc::new(program))
}

fn bench_inference(c: &mut Criterion) {
    setup_profiler();
    let mut group = c.benchmark_group("inference");
    let env = StaticEnv::new();
    group.bench_function("counting_loop", |b| {
        b.iter(|| {
            let routine = counting_loop();
            let body = infer_routine(&routine, &env).expect("infer");
            end_profiling_frame();
            black_box(body)
        })
    });
    group.finish();
}

fn bench_execution(c: &mut Criterion) {
    setup_profiler();
    let mut group = c.benchmark_group("execution");
    let n = 10_000i64;
    group.throughput(Throughput::Elements(n as u64));

    for (label, typed) in [("loop_typed", true), ("loop_untyped", false)] {
        let mut vm = loop_vm(typed);
        group.bench_function(label, |b| {
            b.iter(|| {
                let result = vm.call("count", vec![Value::Int(black_box(n))]).expect("run");
                end_profiling_frame();
                black_box(result)
            })
        });
    }
    group.finish();
}

fn bench_calls(c: &mut Criterion) {
    setup_profiler();
    let mut group = c.benchmark_group("calls");
    let n = 1_000i64;
    group.throughput(Throughput::Elements(n as u64));

    let mut program = Program::new();
    let set = program.add_routine(tail_sum()).expect("register sum");
    program
        .define_constant(MAIN_NAMESPACE, "sum", Constant::Overloads(set))
        .expect("define sum");
    let mut vm = Vm::new(Arc::new(program));
    group.bench_function("tail_recursion", |b| {
        b.iter(|| {
            let result = vm
                .call("sum", vec![Value::Int(black_box(n)), Value::Int(0)])
                .expect("run");
            end_profiling_frame();
            black_box(result)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_inference, bench_execution, bench_calls);
criterion_main!(benches);
