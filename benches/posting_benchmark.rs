use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ngramdb::core::types::DocId;
use ngramdb::index::posting::PostingList;
use rand::Rng;

fn sorted_ids(count: u32, stride: u32) -> Vec<DocId> {
    (0..count).map(|i| DocId(i * stride + 1)).collect()
}

/// Benchmark single-id insertion into a growing delta list
fn bench_posting_add(c: &mut Criterion) {
    c.bench_function("posting_add_sequential", |b| {
        let list = PostingList::with_default_threshold();
        let mut id = 0u32;
        b.iter(|| {
            id += 1;
            list.add(DocId(id));
        });
    });
}

/// Benchmark batch merge at several batch sizes
fn bench_posting_add_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("posting_add_batch");
    for batch_size in [100u32, 1000, 10_000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                b.iter(|| {
                    let list = PostingList::with_default_threshold();
                    list.add_batch(&sorted_ids(batch_size, 3));
                    black_box(list.len())
                });
            },
        );
    }
    group.finish();
}

/// Intersection cost: delta vs bitmap representations
fn bench_posting_intersect(c: &mut Criterion) {
    let mut group = c.benchmark_group("posting_intersect");

    let sparse_a = PostingList::with_default_threshold();
    let sparse_b = PostingList::with_default_threshold();
    sparse_a.add_batch(&sorted_ids(10_000, 7));
    sparse_b.add_batch(&sorted_ids(10_000, 5));
    group.bench_function("delta_delta_10k", |b| {
        b.iter(|| black_box(sparse_a.intersect(&sparse_b).len()));
    });

    let dense_a = PostingList::with_default_threshold();
    let dense_b = PostingList::with_default_threshold();
    dense_a.add_batch(&sorted_ids(50_000, 2));
    dense_b.add_batch(&sorted_ids(50_000, 3));
    dense_a.optimize(100_000);
    dense_b.optimize(160_000);
    group.bench_function("bitmap_bitmap_50k", |b| {
        b.iter(|| black_box(dense_a.intersect(&dense_b).len()));
    });

    group.finish();
}

/// Membership probe across representations and sizes
fn bench_posting_contains(c: &mut Criterion) {
    let mut group = c.benchmark_group("posting_contains");
    let mut rng = rand::thread_rng();

    for &count in [1_000u32, 100_000].iter() {
        let list = PostingList::with_default_threshold();
        list.add_batch(&sorted_ids(count, 2));
        group.bench_with_input(BenchmarkId::new("delta", count), &count, |b, &count| {
            b.iter(|| black_box(list.contains(DocId(rng.gen_range(0..count * 2)))));
        });

        list.optimize(count as u64 * 2);
        group.bench_with_input(BenchmarkId::new("bitmap", count), &count, |b, &count| {
            b.iter(|| black_box(list.contains(DocId(rng.gen_range(0..count * 2)))));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_posting_add,
    bench_posting_add_batch,
    bench_posting_intersect,
    bench_posting_contains
);
criterion_main!(benches);
