//! Microbenchmarks for the hot interpreter paths: arithmetic, calls, and
//! allocation-heavy collection building. Bodies are written to avoid
//! constant-folding so the measured time reflects actual opcode dispatch.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use ember::diagnostics::CollectingSink;
use ember::vm::Vm;

fn run(bench: &mut criterion::Bencher, source: &str) {
    let mut vm = Vm::with_defaults();
    let mut sink = CollectingSink::default();
    let result = vm.run_source("bench", source, &mut sink).expect("benchmark program must run cleanly");
    black_box(result);

    bench.iter(|| {
        let mut vm = Vm::with_defaults();
        let mut sink = CollectingSink::default();
        black_box(vm.run_source("bench", black_box(source), &mut sink).unwrap());
    });
}

fn fibonacci(c: &mut Criterion) {
    c.bench_function("fib_recursive_20", |b| {
        run(
            b,
            r#"
            fun fib(n) {
                if n < 2 { return n }
                return fib(n - 1) + fib(n - 2)
            }
            fib(20)
            "#,
        );
    });
}

fn loop_arithmetic(c: &mut Criterion) {
    c.bench_function("loop_sum_10k", |b| {
        run(
            b,
            r#"
            var total = 0
            var i = 0
            while i < 10000 {
                total = total + i
                i = i + 1
            }
            total
            "#,
        );
    });
}

fn closures(c: &mut Criterion) {
    c.bench_function("closure_counter_1k", |b| {
        run(
            b,
            r#"
            fun counter() {
                var n = 0
                fun step() { n = n + 1; return n }
                return step
            }
            var c = counter()
            var i = 0
            while i < 1000 { c(); i = i + 1 }
            c()
            "#,
        );
    });
}

fn list_building(c: &mut Criterion) {
    c.bench_function("list_build_2k", |b| {
        run(
            b,
            r#"
            var out = []
            var i = 0
            while i < 2000 {
                out.add(i * 2)
                i = i + 1
            }
            out
            "#,
        );
    });
}

fn method_dispatch(c: &mut Criterion) {
    c.bench_function("method_dispatch_1k", |b| {
        run(
            b,
            r#"
            class Adder {
                construct(n) { this.n = n }
                fun add_to(x) { return x + this.n }
            }
            var a = Adder(7)
            var total = 0
            var i = 0
            while i < 1000 {
                total = a.add_to(total)
                i = i + 1
            }
            total
            "#,
        );
    });
}

criterion_group!(benches, fibonacci, loop_arithmetic, closures, list_building, method_dispatch);
criterion_main!(benches);
