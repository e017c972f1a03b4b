//! Benchmarks for the partial escape analysis on generated graphs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pea_compiler::ea::PartialEscapePhase;
use pea_compiler::ir::{ArithmeticOp, Graph, GraphBuilder, ValueKind};

/// `count` short-lived points whose fields are summed.
fn generate_allocation_chain(count: usize) -> Graph {
    let mut b = GraphBuilder::new();
    let point = b.add_class("Point", None, &[("x", ValueKind::Int), ("y", ValueKind::Int)]);
    let x = b.field(point, "x").unwrap();
    let mut sum = b.build_int(0);
    for i in 0..count {
        let value = b.build_int(i as i64);
        let alloc = b.build_new_instance(point).unwrap();
        b.build_store_field(alloc, x, value).unwrap();
        let load = b.build_load_field(alloc, x).unwrap();
        sum = b.build_arithmetic(ArithmeticOp::Add, sum, load).unwrap();
    }
    b.build_return(Some(sum)).unwrap();
    b.finish()
}

/// One object updated on both sides of `count` consecutive diamonds.
fn generate_diamonds(count: usize) -> Graph {
    let mut b = GraphBuilder::new();
    let point = b.add_class("Point", None, &[("x", ValueKind::Int), ("y", ValueKind::Int)]);
    let x = b.field(point, "x").unwrap();
    let cond = b.build_parameter(0, ValueKind::Bool);
    let alloc = b.build_new_instance(point).unwrap();
    for i in 0..count {
        let left = b.create_block(&format!("left{}", i));
        let right = b.create_block(&format!("right{}", i));
        let merge = b.create_block(&format!("merge{}", i));
        b.build_if(cond, left, right).unwrap();
        for (block, value) in [(left, 2 * i as i64), (right, 2 * i as i64 + 1)] {
            b.switch_to_block(block);
            let value = b.build_int(value);
            b.build_store_field(alloc, x, value).unwrap();
            b.build_goto(merge).unwrap();
        }
        b.switch_to_block(merge);
    }
    let load = b.build_load_field(alloc, x).unwrap();
    b.build_return(Some(load)).unwrap();
    b.finish()
}

/// A loop incrementing every field of one object.
fn generate_counter_loop(fields: usize) -> Graph {
    let mut b = GraphBuilder::new();
    let names: Vec<String> = (0..fields).map(|i| format!("f{}", i)).collect();
    let layout: Vec<(&str, ValueKind)> = names.iter().map(|n| (n.as_str(), ValueKind::Int)).collect();
    let counters = b.add_class("Counters", None, &layout);
    let cond = b.build_parameter(0, ValueKind::Bool);
    let one = b.build_int(1);
    let alloc = b.build_new_instance(counters).unwrap();
    let header = b.create_block("header");
    let body = b.create_block("body");
    let exit = b.create_block("exit");
    b.build_goto(header).unwrap();
    b.switch_to_block(header);
    b.build_if(cond, body, exit).unwrap();

    b.switch_to_block(body);
    for name in &names {
        let field = b.field(counters, name).unwrap();
        let current = b.build_load_field(alloc, field).unwrap();
        let next = b.build_arithmetic(ArithmeticOp::Add, current, one).unwrap();
        b.build_store_field(alloc, field, next).unwrap();
    }
    b.build_goto(header).unwrap();

    b.switch_to_block(exit);
    let first = b.field(counters, "f0").unwrap();
    let result = b.build_load_field(alloc, first).unwrap();
    b.build_return(Some(result)).unwrap();
    b.finish()
}

fn benchmark_graphs(c: &mut Criterion, name: &str, sizes: &[usize], generate: fn(usize) -> Graph) {
    let mut group = c.benchmark_group(name);
    let phase = PartialEscapePhase::default();

    for size in sizes {
        let graph = generate(*size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &graph, |b, graph| {
            b.iter(|| {
                let mut graph = graph.clone();
                let report = phase.run(black_box(&mut graph));
                black_box(report)
            });
        });
    }

    group.finish();
}

fn benchmark_straight_line(c: &mut Criterion) {
    benchmark_graphs(c, "allocation_chain", &[10, 100, 1000], generate_allocation_chain);
}

fn benchmark_merges(c: &mut Criterion) {
    benchmark_graphs(c, "diamonds", &[10, 50, 200], generate_diamonds);
}

fn benchmark_loops(c: &mut Criterion) {
    benchmark_graphs(c, "counter_loop", &[1, 8, 32], generate_counter_loop);
}

fn benchmark_analyze_only(c: &mut Criterion) {
    let graph = generate_diamonds(50);
    let phase = PartialEscapePhase::default();
    c.bench_function("analyze_diamonds_50", |b| {
        b.iter(|| black_box(phase.analyze(black_box(&graph))));
    });
}

criterion_group!(
    benches,
    benchmark_straight_line,
    benchmark_merges,
    benchmark_loops,
    benchmark_analyze_only
);

criterion_main!(benches);
