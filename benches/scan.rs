//! Scan-kernel throughput over packed widths.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tabula::mem::Allocator;
use tabula::{Acc, Cond, QueryState};

fn build_array(alloc: &mut Allocator, span: i64, n: usize) -> tabula::Column {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let root = tabula::Column::create(alloc, false).unwrap();
    let mut col = tabula::Column::new(root, false, 1000);
    for _ in 0..n {
        col.push(alloc, rng.gen_range(-span..=span)).unwrap();
    }
    col
}

fn bench_count(c: &mut Criterion) {
    let mut grp = c.benchmark_group("count_equal");
    for (label, span) in [("w8", 100i64), ("w16", 20_000), ("w32", 1 << 30)] {
        let mut alloc = Allocator::heap();
        let col = build_array(&mut alloc, span, 100_000);
        grp.bench_with_input(BenchmarkId::from_parameter(label), &span, |b, _| {
            b.iter(|| {
                let mut state = QueryState::count(usize::MAX);
                col.find(&alloc, Cond::Equal, Some(black_box(7)), 0, usize::MAX, &mut state)
                    .unwrap();
                match state.acc {
                    Acc::Count(n) => n,
                    _ => unreachable!(),
                }
            })
        });
    }
    grp.finish();
}

fn bench_sum(c: &mut Criterion) {
    let mut grp = c.benchmark_group("sum_all");
    for (label, span) in [("w8", 100i64), ("w32", 1 << 30)] {
        let mut alloc = Allocator::heap();
        let col = build_array(&mut alloc, span, 100_000);
        grp.bench_with_input(BenchmarkId::from_parameter(label), &span, |b, _| {
            b.iter(|| col.sum(&alloc).unwrap())
        });
    }
    grp.finish();
}

fn bench_find_first(c: &mut Criterion) {
    let mut alloc = Allocator::heap();
    let col = build_array(&mut alloc, 1 << 40, 100_000);
    c.bench_function("find_first_absent", |b| {
        b.iter(|| {
            col.find_first(&alloc, Cond::Equal, Some(black_box(i64::MAX)))
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_count, bench_sum, bench_find_first);
criterion_main!(benches);
