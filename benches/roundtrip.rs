#![allow(missing_docs)]

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;

use matpar::{
    BufferAllocator, CompressionEnvelope, Dims, MatArray, MatFile, MatPipeline, MatReader,
    MatWriter, PooledAllocator, build_pool,
};

fn generate_file(entries: usize, side: i32) -> MatFile {
    let mut file = MatFile::new();
    for i in 0..entries {
        let data: Vec<f64> = (0..side * side)
            .map(|v| ((v as usize * 31 + i * 7) % 997) as f64)
            .collect();
        file.insert(
            &format!("var_{i}"),
            MatArray::double(Dims::matrix(side, side), data).unwrap(),
        )
        .unwrap();
    }
    file
}

fn bench_write(c: &mut Criterion) {
    let file = generate_file(16, 128);
    let bytes = MatWriter::default().write(&file).unwrap();
    let mut group = c.benchmark_group("write");
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("sequential_raw", |b| {
        b.iter(|| MatWriter::new(CompressionEnvelope::none()).write(black_box(&file)))
    });
    group.bench_function("sequential_deflate", |b| {
        b.iter(|| MatWriter::new(CompressionEnvelope::best_speed()).write(black_box(&file)))
    });

    let pipeline = MatPipeline::new(
        build_pool(4).unwrap(),
        Arc::new(PooledAllocator::default()) as Arc<dyn BufferAllocator>,
    );
    group.bench_function("concurrent_deflate", |b| {
        b.iter(|| {
            let mut out = Vec::new();
            pipeline
                .write(black_box(&file), CompressionEnvelope::best_speed(), &mut out)
                .unwrap();
            out
        })
    });
    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let file = generate_file(16, 128);
    let bytes = MatWriter::new(CompressionEnvelope::best_speed())
        .write(&file)
        .unwrap();
    let mut group = c.benchmark_group("read");
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("sequential", |b| {
        b.iter(|| MatReader::default().read_bytes(black_box(&bytes)).unwrap())
    });

    let pipeline = MatPipeline::new(
        build_pool(4).unwrap(),
        Arc::new(PooledAllocator::default()) as Arc<dyn BufferAllocator>,
    );
    group.bench_function("concurrent", |b| {
        b.iter(|| pipeline.read(black_box(&bytes)).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_write, bench_read);
criterion_main!(benches);
