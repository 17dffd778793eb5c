//! Benchmarks for compilation and bytecode execution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rill::{
    compile, BinaryOp, Builtins, Expr, ModuleLoader, Program, ResourceLimits, Span, Stmt, Vm,
};

fn sp() -> Span {
    Span::default()
}

fn int(n: i64) -> Expr {
    Expr::int(n, sp())
}

fn ident(name: &str) -> Expr {
    Expr::ident(name, sp())
}

/// total := 0; for i := 0; i < n; i = i + 1 { total = total + i }
fn loop_sum_program(n: i64) -> Program {
    Program::new(vec![
        Stmt::declare("total", int(0)),
        Stmt::for_loop(
            Some(Stmt::declare("i", int(0))),
            Some(Expr::binary(BinaryOp::Less, ident("i"), int(n))),
            Some(Stmt::expression(Expr::assign(
                ident("i"),
                Expr::binary(BinaryOp::Add, ident("i"), int(1)),
            ))),
            vec![Stmt::expression(Expr::assign(
                ident("total"),
                Expr::binary(BinaryOp::Add, ident("total"), ident("i")),
            ))],
            sp(),
        ),
    ])
}

/// fib := func(n) { if n <= 1 { return n } return fib(n-1) + fib(n-2) }
fn fib_program(n: i64) -> Program {
    Program::new(vec![
        Stmt::declare(
            "fib",
            Expr::func(
                vec!["n"],
                vec![
                    Stmt::if_stmt(
                        Expr::binary(BinaryOp::LessEqual, ident("n"), int(1)),
                        vec![Stmt::ret(Some(ident("n")), sp())],
                        None,
                    ),
                    Stmt::ret(
                        Some(Expr::binary(
                            BinaryOp::Add,
                            Expr::call(
                                ident("fib"),
                                vec![Expr::binary(BinaryOp::Subtract, ident("n"), int(1))],
                            ),
                            Expr::call(
                                ident("fib"),
                                vec![Expr::binary(BinaryOp::Subtract, ident("n"), int(2))],
                            ),
                        )),
                        sp(),
                    ),
                ],
                sp(),
            ),
        ),
        Stmt::declare("result", Expr::call(ident("fib"), vec![int(n)])),
    ])
}

/// Counter closures exercising cell capture on the hot path.
fn closure_program(n: i64) -> Program {
    Program::new(vec![
        Stmt::declare(
            "make",
            Expr::func(
                vec![],
                vec![
                    Stmt::declare("count", int(0)),
                    Stmt::ret(
                        Some(Expr::func(
                            vec![],
                            vec![
                                Stmt::expression(Expr::assign(
                                    ident("count"),
                                    Expr::binary(BinaryOp::Add, ident("count"), int(1)),
                                )),
                                Stmt::ret(Some(ident("count")), sp()),
                            ],
                            sp(),
                        )),
                        sp(),
                    ),
                ],
                sp(),
            ),
        ),
        Stmt::declare("bump", Expr::call(ident("make"), vec![])),
        Stmt::for_loop(
            Some(Stmt::declare("i", int(0))),
            Some(Expr::binary(BinaryOp::Less, ident("i"), int(n))),
            Some(Stmt::expression(Expr::assign(
                ident("i"),
                Expr::binary(BinaryOp::Add, ident("i"), int(1)),
            ))),
            vec![Stmt::expression(Expr::call(ident("bump"), vec![]))],
            sp(),
        ),
    ])
}

fn run(program: &Program) {
    let builtins = Builtins::core();
    let mut loader = ModuleLoader::new();
    let unit = compile(program, &builtins, &mut loader).expect("compile error");
    let mut vm = Vm::new(unit, builtins, loader, ResourceLimits::default());
    vm.run().expect("runtime error");
}

fn loop_sum(c: &mut Criterion) {
    let program = loop_sum_program(10_000);
    c.bench_function("loop_sum_10k", |b| b.iter(|| run(black_box(&program))));
}

fn fib_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("fib_recursive");
    for n in [10, 15, 20] {
        let program = fib_program(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &program, |b, program| {
            b.iter(|| run(black_box(program)))
        });
    }
    group.finish();
}

fn closure_calls(c: &mut Criterion) {
    let program = closure_program(10_000);
    c.bench_function("closure_calls_10k", |b| b.iter(|| run(black_box(&program))));
}

/// Compilation time alone, no execution.
fn compilation_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("compilation_overhead");
    let builtins = Builtins::core();

    let program = fib_program(20);
    group.bench_function("compile_fib", |b| {
        b.iter(|| {
            let mut loader = ModuleLoader::new();
            compile(black_box(&program), &builtins, &mut loader).unwrap()
        })
    });

    let program = loop_sum_program(10_000);
    group.bench_function("compile_loop", |b| {
        b.iter(|| {
            let mut loader = ModuleLoader::new();
            compile(black_box(&program), &builtins, &mut loader).unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, loop_sum, fib_scaling, closure_calls, compilation_overhead);
criterion_main!(benches);
