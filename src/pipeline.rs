//! The concurrent codec pipeline.
//!
//! Per-variable compression and decompression are independent, so the
//! pipeline fans each root element out to a caller-owned worker pool and
//! fans the results back in strictly in file order — output never depends
//! on completion order. Framing, subsystem resolution and container
//! mutation stay on the caller thread.
//!
//! Failure semantics follow a capture-first design: the first failing task
//! records its error and raises the abort flag; later tasks skip their
//! work, the fan-in loop drains every slot so each acquired scratch buffer
//! is released exactly once, and the captured error propagates wrapped as
//! [`MatError::Pipeline`].

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace};

use crate::alloc::{BufferAllocator, ScratchBuffer};
use crate::array::MatArray;
use crate::bytes::{SliceSink, SliceSource};
use crate::compression::{CompressionEnvelope, read_enveloped};
use crate::container::{Entry, MatFile};
use crate::element;
use crate::error::{MatError, Result};
use crate::format::FileHeader;
use crate::reader::{assemble, scan_roots};
use crate::subsys::ReferenceRegistry;

/// Builds a worker pool suitable for handing to [`MatPipeline::new`].
///
/// Hosts create the pool once, share it across pipelines and calls, and
/// shut it down by dropping the last handle.
pub fn build_pool(threads: usize) -> Result<Arc<rayon::ThreadPool>> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map(Arc::new)
        .map_err(|e| MatError::Resource(format!("worker pool construction failed: {e}")))
}

/// Shared state between the fan-in loop and the worker tasks.
struct PipelineCtx {
    abort: AtomicBool,
    error: Mutex<Option<MatError>>,
}

impl PipelineCtx {
    fn new() -> Self {
        Self {
            abort: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    fn signal_error(&self, err: MatError) {
        let mut guard = self.error.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_none() {
            *guard = Some(err);
            self.abort.store(true, Ordering::SeqCst);
        }
    }

    fn should_abort(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    fn take_error(&self) -> Option<MatError> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Result of one worker task, parked in its slot until the fan-in reaches
/// it.
enum TaskOutcome<T> {
    /// The task produced a value (and possibly a buffer to flush).
    Done(T),
    /// The task failed or skipped; any acquired buffer still rides along
    /// so the fan-in can release it.
    Aborted(Option<ScratchBuffer>),
}

/// A one-shot rendezvous between a worker and the fan-in loop.
struct TaskSlot<T> {
    state: Mutex<Option<TaskOutcome<T>>>,
    ready: Condvar,
}

impl<T> TaskSlot<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, outcome: TaskOutcome<T>) {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *guard = Some(outcome);
        self.ready.notify_all();
    }

    /// Blocks until the worker completes, taking the outcome.
    fn wait_take(&self) -> TaskOutcome<T> {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            match guard.take() {
                Some(outcome) => return outcome,
                None => guard = self.ready.wait(guard).unwrap_or_else(|p| p.into_inner()),
            }
        }
    }
}

/// Concurrent reader/writer over a caller-owned worker pool.
///
/// The pool outlives individual calls; the pipeline only borrows workers
/// for the duration of one read or write.
#[derive(Clone)]
pub struct MatPipeline {
    pool: Arc<rayon::ThreadPool>,
    allocator: Arc<dyn BufferAllocator>,
}

impl std::fmt::Debug for MatPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MatPipeline(threads={}, allocator={:?})",
            self.pool.current_num_threads(),
            self.allocator
        )
    }
}

impl MatPipeline {
    /// A pipeline over `pool`, sizing scratch buffers from `allocator`.
    pub fn new(pool: Arc<rayon::ThreadPool>, allocator: Arc<dyn BufferAllocator>) -> Self {
        Self { pool, allocator }
    }

    /// The allocator shared with worker tasks.
    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.allocator
    }

    /// Serializes `file` into `sink` with per-entry parallelism.
    ///
    /// Header and framing bytes are written by the caller thread before any
    /// task result is flushed; entry bytes appear in file order regardless
    /// of completion order, so output is byte-identical to
    /// [`crate::writer::MatWriter::write`].
    pub fn write<W: Write>(
        &self,
        file: &MatFile,
        envelope: CompressionEnvelope,
        sink: &mut W,
    ) -> Result<()> {
        sink.write_all(&FileHeader::new().to_bytes())?;
        let entries = file.entries();
        let ctx = PipelineCtx::new();
        let slots: Vec<TaskSlot<(ScratchBuffer, usize)>> =
            (0..entries.len()).map(|_| TaskSlot::new()).collect();

        let mut io_result: Result<()> = Ok(());
        // The scope body runs on the caller thread, so the ordered fan-in
        // below cannot deadlock even on a single-threaded pool.
        self.pool.in_place_scope(|scope| {
            for (index, entry) in entries.iter().enumerate() {
                let slot = &slots[index];
                let ctx = &ctx;
                let allocator = &self.allocator;
                scope.spawn(move |_| {
                    if ctx.should_abort() {
                        slot.complete(TaskOutcome::Aborted(None));
                        return;
                    }
                    trace!("encode task {index}: {:?}", entry.name);
                    match encode_entry(entry, envelope, allocator.as_ref()) {
                        Ok(done) => slot.complete(TaskOutcome::Done(done)),
                        Err((buffer, err)) => {
                            ctx.signal_error(err);
                            slot.complete(TaskOutcome::Aborted(buffer));
                        }
                    }
                });
            }

            // Ordered fan-in: block on each slot in file order, stream the
            // bytes, release the buffer. Slots are drained even after a
            // failure so the allocate/release balance holds.
            for slot in &slots {
                let buffer = match slot.wait_take() {
                    TaskOutcome::Done((buffer, used)) => {
                        if !ctx.should_abort() && io_result.is_ok() {
                            if let Err(e) = sink.write_all(&buffer.as_slice()[..used]) {
                                io_result = Err(e.into());
                            }
                        }
                        Some(buffer)
                    }
                    TaskOutcome::Aborted(buffer) => buffer,
                };
                if let Some(buffer) = buffer {
                    if let Err(e) = self.allocator.release(buffer) {
                        ctx.signal_error(e);
                    }
                }
            }
        });

        if let Some(err) = ctx.take_error() {
            return Err(err.into_pipeline());
        }
        io_result?;
        debug!("pipeline wrote {} entries", entries.len());
        Ok(())
    }

    /// Decodes a whole container with per-element parallelism.
    ///
    /// Top-level tags are pre-scanned on the caller thread; one decode task
    /// runs per root range; results are collected in file order. Subsystem
    /// resolution runs single-threaded strictly after every root task has
    /// completed, since placeholders may surface anywhere in the tree.
    pub fn read(&self, bytes: &[u8]) -> Result<MatFile> {
        let header = FileHeader::from_bytes(bytes)?;
        let ranges = scan_roots(bytes, header.order)?;
        let registry = ReferenceRegistry::new();
        let ctx = PipelineCtx::new();
        let slots: Vec<TaskSlot<(String, MatArray)>> =
            (0..ranges.len()).map(|_| TaskSlot::new()).collect();
        let mut decoded: Vec<(String, MatArray)> = Vec::with_capacity(ranges.len());

        self.pool.in_place_scope(|scope| {
            for (index, range) in ranges.iter().enumerate() {
                let slot = &slots[index];
                let ctx = &ctx;
                let registry = &registry;
                let chunk = &bytes[range.start..range.end];
                let order = header.order;
                scope.spawn(move |_| {
                    if ctx.should_abort() {
                        slot.complete(TaskOutcome::Aborted(None));
                        return;
                    }
                    trace!("decode task {index}: {} bytes", chunk.len());
                    let mut src = SliceSource::new(chunk, order);
                    match read_enveloped(&mut src, registry) {
                        Ok(pair) => slot.complete(TaskOutcome::Done(pair)),
                        Err(err) => {
                            ctx.signal_error(err);
                            slot.complete(TaskOutcome::Aborted(None));
                        }
                    }
                });
            }

            for slot in &slots {
                if let TaskOutcome::Done(pair) = slot.wait_take() {
                    decoded.push(pair);
                }
            }
        });

        if let Some(err) = ctx.take_error() {
            return Err(err.into_pipeline());
        }
        assemble(decoded, &registry, &self.allocator)
    }
}

/// Serializes one entry into a freshly acquired scratch buffer.
///
/// The buffer is sized from `compute_size` plus envelope slack. On failure
/// the buffer, if one was acquired, is handed back to the caller so it can
/// be released with the other drained slots.
fn encode_entry(
    entry: &Entry,
    envelope: CompressionEnvelope,
    allocator: &dyn BufferAllocator,
) -> std::result::Result<(ScratchBuffer, usize), (Option<ScratchBuffer>, MatError)> {
    let raw_size = element::compute_size(&entry.name, &entry.array).map_err(|e| (None, e))?;
    let capacity = envelope.max_encoded_size(raw_size);
    let mut buffer = allocator
        .allocate(capacity as usize)
        .map_err(|e| (None, e))?;
    let mut sink = SliceSink::new(buffer.as_mut_slice(), crate::format::ByteOrder::Little);
    match envelope.write(&entry.name, &entry.array, &mut sink) {
        Ok(()) => {
            let used = sink.written();
            Ok((buffer, used))
        }
        Err(e) => Err((Some(buffer), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::PlainAllocator;
    use crate::array::Dims;

    #[test]
    fn slot_rendezvous_delivers_once() {
        let slot = TaskSlot::new();
        slot.complete(TaskOutcome::Done(41usize));
        match slot.wait_take() {
            TaskOutcome::Done(v) => assert_eq!(v, 41),
            TaskOutcome::Aborted(_) => panic!("expected done"),
        }
    }

    #[test]
    fn ctx_keeps_first_error() {
        let ctx = PipelineCtx::new();
        ctx.signal_error(MatError::format("first"));
        ctx.signal_error(MatError::format("second"));
        match ctx.take_error() {
            Some(MatError::Format(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn single_threaded_pool_does_not_deadlock() {
        let pool = build_pool(1).unwrap();
        let allocator: Arc<dyn BufferAllocator> = Arc::new(PlainAllocator::new());
        let pipeline = MatPipeline::new(pool, allocator);
        let mut file = MatFile::new();
        file.insert(
            "x",
            MatArray::double(Dims::matrix(2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
        )
        .unwrap();
        let mut out = Vec::new();
        pipeline
            .write(&file, CompressionEnvelope::none(), &mut out)
            .unwrap();
        let back = pipeline.read(&out).unwrap();
        assert_eq!(back.len(), 1);
    }
}
