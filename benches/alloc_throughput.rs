use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use shalloc::Shalloc;

static SHALLOC: Shalloc = Shalloc::new();

const OPS: u64 = 100_000;

/// shalloc alloc/free throughput.
fn shalloc_allocate_free(size: usize) {
    for _ in 0..OPS {
        let address = SHALLOC.allocate(size);
        black_box(address);
        unsafe { SHALLOC.deallocate(address) };
    }
}

/// libc alloc/free throughput.
#[cfg(unix)]
fn libc_malloc_free(size: usize) {
    for _ in 0..OPS {
        unsafe {
            let address = libc::malloc(size);
            black_box(address);
            libc::free(address);
        }
    }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_throughput");

    for size in [16, 64, 256, 1024, 4096] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("shalloc", size), &size, |b, &size| {
            b.iter(|| shalloc_allocate_free(size))
        });

        #[cfg(unix)]
        group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
            b.iter(|| libc_malloc_free(size))
        });
    }

    group.finish();
}

/// Threads hammering their own CPU heaps concurrently; this is the case the
/// per-CPU sharding exists for.
fn benchmark_threaded_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("threaded_throughput");

    for threads in [2, 4, 8] {
        group.throughput(Throughput::Elements(OPS * threads as u64));

        group.bench_with_input(
            BenchmarkId::new("shalloc", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    std::thread::scope(|scope| {
                        for _ in 0..threads {
                            scope.spawn(|| shalloc_allocate_free(64));
                        }
                    })
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_alloc_throughput,
    benchmark_threaded_throughput
);
criterion_main!(benches);
