//! Benchmarks for the hot paths of the memory core: allocation churn,
//! derivation retain/release, and host transfer.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use vanta_core::prelude::*;

fn fixture() -> Context {
    Context::new(Arc::new(CpuBackend::new()))
}

fn bench_alloc_free(c: &mut Criterion) {
    let ctx = fixture();
    let mut group = c.benchmark_group("alloc_free");
    for &nbytes in &[256usize, 4 << 10, 1 << 20] {
        group.throughput(Throughput::Bytes(nbytes as u64));
        group.bench_with_input(BenchmarkId::from_parameter(nbytes), &nbytes, |b, &n| {
            b.iter(|| {
                let mut arr = DeviceArray::alloc(ElemType::of::<u8>(), [n], &ctx).unwrap();
                arr.free(Stream::of(1)).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_derivation(c: &mut Criterion) {
    let ctx = fixture();
    let base = DeviceArray::alloc(ElemType::of::<u32>(), [64, 64], &ctx).unwrap();

    c.bench_function("view_retain_release", |b| {
        b.iter(|| {
            let v = base.view(&[AxisIndex::At(7)]).unwrap();
            drop(v);
        });
    });
    c.bench_function("reshape_retain_release", |b| {
        b.iter(|| {
            let r = base.reshape(&[-1]).unwrap();
            drop(r);
        });
    });
    c.bench_function("reinterpret_retain_release", |b| {
        b.iter(|| {
            let r = base.reinterpret(ElemType::of::<u8>()).unwrap();
            drop(r);
        });
    });
}

fn bench_transfer(c: &mut Criterion) {
    let ctx = fixture();
    let mut group = c.benchmark_group("host_transfer");
    for &n in &[1usize << 10, 1 << 16] {
        let arr = DeviceArray::alloc(ElemType::of::<u32>(), [n], &ctx).unwrap();
        let data = vec![0xA5A5_A5A5u32; n];
        group.throughput(Throughput::Bytes((n * 4) as u64));
        group.bench_with_input(BenchmarkId::new("h2d", n), &n, |b, _| {
            b.iter(|| arr.write_slice(&data, Stream::of(1)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("d2h", n), &n, |b, _| {
            b.iter(|| arr.read_vec::<u32>(Stream::of(1)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_derivation, bench_transfer);
criterion_main!(benches);
