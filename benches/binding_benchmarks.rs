//! Benchmarks for value conversion and native call overhead.
//!
//! ```bash
//! cargo bench --features profile-with-puffin
//! ```

use std::collections::HashMap;
use std::hint::black_box;
use std::rc::Rc;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use scriptbind::{Context, EvalFlags, Func, Runtime};

#[cfg(feature = "profile-with-puffin")]
fn setup_profiler() {
    puffin::set_scopes_on(true);
}

#[cfg(not(feature = "profile-with-puffin"))]
fn setup_profiler() {}

#[cfg(feature = "profile-with-puffin")]
fn end_profiling_frame() {
    puffin::GlobalProfiler::lock().new_frame();
}

#[cfg(not(feature = "profile-with-puffin"))]
fn end_profiling_frame() {}

struct Counter {
    hits: std::cell::Cell<u64>,
}

fn conversion_benchmarks(c: &mut Criterion) {
    setup_profiler();
    let rt = Runtime::new();
    let ctx = Context::new(&rt);

    let mut group = c.benchmark_group("convert/primitives");
    group.bench_function("i32", |b| {
        b.iter(|| {
            let value = ctx.new_value(black_box(42i32)).unwrap();
            black_box(value.to::<i32>().unwrap())
        });
    });
    group.bench_function("string", |b| {
        b.iter(|| {
            let value = ctx.new_value(black_box("a short string")).unwrap();
            black_box(value.to::<String>().unwrap())
        });
    });
    group.finish();

    let mut group = c.benchmark_group("convert/containers");
    let numbers: Vec<f64> = (0..1000).map(f64::from).collect();
    group.throughput(Throughput::Elements(numbers.len() as u64));
    group.bench_function("vec_1000", |b| {
        b.iter(|| {
            let value = ctx.new_value(black_box(&numbers[..])).unwrap();
            black_box(value.to::<Vec<f64>>().unwrap())
        });
    });
    let map: HashMap<String, i32> = (0..100).map(|i| (format!("key{i}"), i)).collect();
    group.throughput(Throughput::Elements(map.len() as u64));
    group.bench_function("map_100", |b| {
        b.iter(|| {
            let value = ctx.new_value(black_box(map.clone())).unwrap();
            black_box(value.to::<HashMap<String, i32>>().unwrap())
        });
        end_profiling_frame();
    });
    group.finish();
}

fn call_benchmarks(c: &mut Criterion) {
    setup_profiler();
    let rt = Runtime::new();
    let ctx = Context::new(&rt);
    ctx.global().set_function("add", |a: i32, b: i32| a + b).unwrap();
    ctx.register_class::<Counter>("Counter")
        .unwrap()
        .constructor(|| Counter { hits: 0.into() })
        .unwrap()
        .method("hit", |c: Rc<Counter>| c.hits.set(c.hits.get() + 1))
        .unwrap()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("call");
    let add = ctx.global().get("add").unwrap();
    group.bench_function("native_from_host", |b| {
        b.iter(|| black_box(add.call((black_box(1), black_box(2))).unwrap()));
    });

    let nested = "add(add(1, 2), add(add(3, 4), 5))";
    group.bench_function("native_from_script", |b| {
        b.iter(|| black_box(ctx.eval(black_box(nested), "<bench>", EvalFlags::TYPE_GLOBAL).unwrap()));
    });

    let square: Func<(f64,), f64> = ctx
        .eval("x => x * x", "<bench>", EvalFlags::TYPE_GLOBAL)
        .unwrap()
        .to()
        .unwrap();
    group.bench_function("script_from_host", |b| {
        b.iter(|| black_box(square.call((black_box(3.0),)).unwrap()));
    });

    let counter = ctx
        .eval("const counter = new Counter(); counter", "<bench>", EvalFlags::TYPE_GLOBAL)
        .unwrap();
    let hit = counter.get("hit").unwrap();
    group.bench_function("bound_method", |b| {
        b.iter(|| black_box(hit.call_with_this(&counter, ()).unwrap()));
        end_profiling_frame();
    });
    group.finish();
}

criterion_group!(benches, conversion_benchmarks, call_benchmarks);
criterion_main!(benches);
