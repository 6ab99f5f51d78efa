//! Benchmarks for the crawler and processing pool.
//!
//! Run with: `cargo bench --bench crawl_and_pool`
//! Results are saved to `target/criterion/` with HTML reports.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use minerfs_core::crawler::{AcceptAll, Crawler};
use minerfs_core::processing_pool::{BatchSink, PoolError, ProcessingPool, ProcessingTask};

/// Creates a temporary directory tree with `count` files for crawl benchmarks.
fn setup_tree(count: usize) -> PathBuf {
    let dir = std::env::temp_dir().join("minerfs_bench");
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    for i in 0..count {
        fs::write(dir.join(format!("file_{i}.txt")), b"x").unwrap();
    }
    dir
}

struct NullSink;
impl BatchSink for NullSink {
    fn update_array(&mut self, statements: &[String]) -> Vec<Result<(), PoolError>> {
        statements.iter().map(|_| Ok(())).collect()
    }
}

fn bench_crawl(c: &mut Criterion) {
    let mut group = c.benchmark_group("crawl");
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

    for count in [100, 500, 2000] {
        let dir = setup_tree(count);
        let root = dir.to_string_lossy().to_string();

        group.bench_with_input(BenchmarkId::new("run", count), &root, |b, root| {
            b.iter(|| {
                runtime.block_on(async {
                    let mut crawler = Crawler::new(Arc::new(AcceptAll));
                    crawler.start(root);
                    crawler.run(false).await;
                    crawler.drain_found()
                })
            });
        });
    }

    group.finish();
}

fn bench_pool_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_flush");

    for batch_size in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("buffered_push_ready", batch_size), &batch_size, |b, &batch_size| {
            b.iter(|| {
                let mut pool = ProcessingPool::new(batch_size * 2, batch_size);
                let mut sink = NullSink;
                for i in 0..batch_size {
                    let mut task = ProcessingTask::new(format!("/bench/{i}"), |_| {});
                    task.payload = Some(format!("UPDATE {{ {i} }}"));
                    pool.push_ready(task, true, &mut sink);
                }
                pool.flush(&mut sink);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_crawl, bench_pool_flush);
criterion_main!(benches);
