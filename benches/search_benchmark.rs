use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ngramdb::core::types::{Attributes, DocId};
use ngramdb::index::inverted::Index;
use ngramdb::query::sorter::ResultSorter;
use ngramdb::query::types::{OrderBy, SortOrder};
use ngramdb::storage::document_store::DocumentStore;
use rand::Rng;

const WORDS: [&str; 12] = [
    "search", "engine", "index", "posting", "query", "cache", "table", "column", "filter",
    "result", "stream", "backup",
];

fn build_index(doc_count: u32) -> Index {
    let index = Index::new(3, 2, 0.18);
    let mut rng = rand::thread_rng();
    let docs: Vec<(DocId, String)> = (1..=doc_count)
        .map(|i| {
            let text: Vec<&str> = (0..8)
                .map(|_| WORDS[rng.gen_range(0..WORDS.len())])
                .collect();
            (DocId(i), text.join(" "))
        })
        .collect();
    index.add_document_batch(&docs);
    index
}

/// AND search across corpus sizes
fn bench_search_and(c: &mut Criterion) {
    let mut group = c.benchmark_group("search_and");
    for &doc_count in [1_000u32, 10_000, 50_000].iter() {
        let index = build_index(doc_count);
        index.optimize(doc_count as u64).unwrap();
        let terms = vec!["sea".to_string(), "ear".to_string(), "arc".to_string()];
        group.bench_with_input(
            BenchmarkId::from_parameter(doc_count),
            &doc_count,
            |b, _| {
                b.iter(|| black_box(index.search_and(&terms, 0, false).len()));
            },
        );
    }
    group.finish();
}

/// Single-term reverse limit: the GetTopN fast path
fn bench_search_top_n(c: &mut Criterion) {
    let index = build_index(50_000);
    index.optimize(50_000).unwrap();
    let terms = vec!["que".to_string()];
    c.bench_function("search_single_term_top100_reverse", |b| {
        b.iter(|| black_box(index.search_and(&terms, 100, true).len()));
    });
}

/// Sort cost with and without the partial-sort path
fn bench_sort_and_paginate(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_and_paginate");
    let store = DocumentStore::new();
    let mut ids = Vec::new();
    let mut rng = rand::thread_rng();
    for _ in 0..100_000 {
        let pk: u64 = rng.gen_range(0..10_000_000);
        if let Ok(id) = store.add_document(&pk.to_string(), Attributes::new()) {
            ids.push(id);
        }
    }
    let order = OrderBy {
        column: String::new(),
        order: SortOrder::Desc,
    };

    group.bench_function("partial_limit_100", |b| {
        b.iter(|| {
            black_box(
                ResultSorter::sort_and_paginate(ids.clone(), &store, Some(&order), 100, 0, "id")
                    .unwrap()
                    .len(),
            )
        });
    });
    group.bench_function("full_limit_1000_offset_90000", |b| {
        b.iter(|| {
            black_box(
                ResultSorter::sort_and_paginate(
                    ids.clone(),
                    &store,
                    Some(&order),
                    1000,
                    90_000,
                    "id",
                )
                .unwrap()
                .len(),
            )
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_search_and,
    bench_search_top_n,
    bench_sort_and_paginate
);
criterion_main!(benches);
