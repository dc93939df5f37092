//! Concurrent pipeline behavior: byte-identity with the sequential paths,
//! deterministic ordering, first-error capture, and the allocate/release
//! balance across success and failure.

use std::sync::Arc;

use matpar::{
    BufferAllocator, CharEncoding, CompressionEnvelope, Dims, MatArray, MatFile, MatPipeline,
    MatReader, MatWriter, PlainAllocator, PooledAllocator, build_pool,
};

fn sample_file(entries: usize) -> MatFile {
    let mut file = MatFile::new();
    for i in 0..entries {
        let n = (i + 2) as i32;
        let data: Vec<f64> = (0..n * n).map(|v| (v * (i as i32 + 1)) as f64).collect();
        file.insert(&format!("var_{i}"), MatArray::double(Dims::matrix(n, n), data).unwrap())
            .unwrap();
    }
    file
}

#[test]
fn concurrent_write_matches_sequential_bytes() {
    let file = sample_file(8);
    let pool = build_pool(4).unwrap();
    let allocator: Arc<dyn BufferAllocator> = Arc::new(PlainAllocator::new());
    let pipeline = MatPipeline::new(pool, allocator);

    for level in [0u32, 9] {
        let envelope = CompressionEnvelope::new(level).unwrap();
        let sequential = MatWriter::new(envelope).write(&file).unwrap();
        let mut concurrent = Vec::new();
        pipeline.write(&file, envelope, &mut concurrent).unwrap();
        assert_eq!(sequential, concurrent, "level {level}");
    }
}

#[test]
fn concurrent_read_matches_sequential_model() {
    let file = sample_file(6);
    let bytes = MatWriter::new(CompressionEnvelope::best_speed())
        .write(&file)
        .unwrap();

    let sequential = MatReader::default().read_bytes(&bytes).unwrap();
    let pool = build_pool(4).unwrap();
    let allocator: Arc<dyn BufferAllocator> = Arc::new(PlainAllocator::new());
    let concurrent = MatPipeline::new(pool, allocator).read(&bytes).unwrap();

    assert_eq!(sequential.len(), concurrent.len());
    for (a, b) in sequential.entries().iter().zip(concurrent.entries()) {
        assert_eq!(a, b);
    }
}

#[test]
fn buffers_balance_after_successful_runs() {
    let file = sample_file(5);
    let allocator = Arc::new(PooledAllocator::default());
    let pipeline = MatPipeline::new(
        build_pool(3).unwrap(),
        Arc::clone(&allocator) as Arc<dyn BufferAllocator>,
    );

    let mut out = Vec::new();
    pipeline
        .write(&file, CompressionEnvelope::best_speed(), &mut out)
        .unwrap();
    pipeline.read(&out).unwrap();

    let stats = allocator.stats();
    assert!(stats.allocated > 0);
    assert_eq!(stats.allocated, stats.released);
    assert_eq!(stats.live(), 0);
}

#[test]
fn encode_failure_surfaces_first_error_and_balances() {
    let mut file = sample_file(3);
    // ASCII encoding cannot carry this content; the task fails at encode.
    file.insert(
        "bad",
        MatArray::char_rows(&["ünrepresentable"], CharEncoding::Ascii).unwrap(),
    )
    .unwrap();
    for i in 0..3 {
        file.insert(
            &format!("tail_{i}"),
            MatArray::double(Dims::matrix(2, 2), vec![1.0; 4]).unwrap(),
        )
        .unwrap();
    }

    let allocator = Arc::new(PlainAllocator::new());
    let pipeline = MatPipeline::new(
        build_pool(2).unwrap(),
        Arc::clone(&allocator) as Arc<dyn BufferAllocator>,
    );
    let mut out = Vec::new();
    let err = pipeline
        .write(&file, CompressionEnvelope::none(), &mut out)
        .unwrap_err();
    assert!(matches!(err, matpar::MatError::Pipeline(_)));

    let stats = allocator.stats();
    assert_eq!(stats.allocated, stats.released);
}

#[test]
fn allocator_exhaustion_fails_but_releases_everything() {
    let file = sample_file(6);
    // Below the largest single entry's buffer, so that task always fails.
    let allocator = Arc::new(PlainAllocator::with_limit(300));
    let pipeline = MatPipeline::new(
        build_pool(2).unwrap(),
        Arc::clone(&allocator) as Arc<dyn BufferAllocator>,
    );
    let mut out = Vec::new();
    let err = pipeline
        .write(&file, CompressionEnvelope::none(), &mut out)
        .unwrap_err();
    match err {
        matpar::MatError::Pipeline(inner) => {
            assert!(matches!(*inner, matpar::MatError::Resource(_)));
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(allocator.stats().allocated, allocator.stats().released);
}

#[test]
fn corrupt_input_fails_concurrent_read() {
    let file = sample_file(4);
    let mut bytes = MatWriter::new(CompressionEnvelope::best_speed())
        .write(&file)
        .unwrap();
    // Flip a byte inside the first element's compressed payload.
    bytes[140] ^= 0xFF;

    let pipeline = MatPipeline::new(
        build_pool(4).unwrap(),
        Arc::new(PlainAllocator::new()) as Arc<dyn BufferAllocator>,
    );
    let err = pipeline.read(&bytes).unwrap_err();
    assert!(matches!(err, matpar::MatError::Pipeline(_)));
}

#[test]
fn pool_is_reused_across_calls() {
    let pool = build_pool(2).unwrap();
    let allocator: Arc<dyn BufferAllocator> = Arc::new(PooledAllocator::default());
    let pipeline = MatPipeline::new(Arc::clone(&pool), allocator);
    let file = sample_file(3);
    let reference = MatWriter::default().write(&file).unwrap();
    for _ in 0..4 {
        let mut out = Vec::new();
        pipeline
            .write(&file, CompressionEnvelope::none(), &mut out)
            .unwrap();
        assert_eq!(out, reference);
    }
}
