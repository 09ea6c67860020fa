//! Benchmarks for Kusto result table shaping and rendering
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use opskit::kusto::{Column, ResultTable};
use opskit::output::{render, OutputFormat};
use serde_json::{json, Value};

/// Wide table with every third column empty and repeated column names
fn build_table(rows: usize, cols: usize) -> ResultTable {
    let columns = (0..cols)
        .map(|c| Column {
            name: format!("col{}", c % (cols / 2).max(1)),
            column_type: "string".to_string(),
        })
        .collect();
    let rows = (0..rows)
        .map(|r| {
            (0..cols)
                .map(|c| if c % 3 == 0 { Value::Null } else { json!(format!("r{}c{}", r, c)) })
                .collect()
        })
        .collect();
    ResultTable::new("Table_0", columns, rows)
}

fn bench_shaping(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_shaping");

    for rows in [100usize, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*rows as u64));
        group.bench_with_input(BenchmarkId::new("remove_empty_and_dedupe", rows), rows, |b, &rows| {
            let table = build_table(rows, 24);
            b.iter(|| {
                let mut t = table.clone();
                black_box(t.remove_empty_columns());
                t.dedupe_column_names();
                black_box(t)
            });
        });
    }

    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_render");
    let table = build_table(5_000, 12);

    for (label, format) in [("text", OutputFormat::Text), ("json", OutputFormat::Json), ("csv", OutputFormat::Csv)] {
        group.bench_function(label, |b| {
            b.iter(|| {
                let mut buf = Vec::with_capacity(1 << 20);
                render(format, black_box(&table), &mut buf).unwrap();
                black_box(buf)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_shaping, bench_render);
criterion_main!(benches);
