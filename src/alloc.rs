//! Pluggable scratch-buffer allocation.
//!
//! Pipeline tasks never allocate working memory directly; they acquire
//! [`ScratchBuffer`]s from a [`BufferAllocator`] and hand them back when the
//! bytes have been flushed. Allocators are shared across worker threads and
//! must be internally thread-safe. Buffers come back zero-initialized with
//! exactly the requested usable length, whatever storage the allocator
//! recycles underneath.
//!
//! Every allocator keeps an allocate/release balance. A buffer released
//! twice, or one the allocator never produced, is a resource error carrying
//! the buffer id.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{MatError, Result};

/// A transient byte buffer owned by exactly one codec task at a time.
///
/// The usable region is `len()` bytes, zeroed on acquisition. The id is
/// unique within the allocator that produced the buffer.
pub struct ScratchBuffer {
    id: u64,
    data: Vec<u8>,
}

impl ScratchBuffer {
    fn new(id: u64, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// The allocator-assigned identity of this buffer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True for a zero-length buffer.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The usable bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// The usable bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScratchBuffer(id={}, len={})", self.id, self.data.len())
    }
}

/// Counters proving the allocate/release balance of an allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Total `allocate` calls that succeeded.
    pub allocated: u64,
    /// Total `release` calls that succeeded.
    pub released: u64,
}

impl AllocStats {
    /// Buffers currently outstanding.
    pub fn live(&self) -> u64 {
        self.allocated - self.released
    }
}

/// Acquire/release of scratch byte buffers, shared across worker threads.
pub trait BufferAllocator: Send + Sync + fmt::Debug {
    /// Produces a zero-initialized buffer of exactly `len` usable bytes.
    fn allocate(&self, len: usize) -> Result<ScratchBuffer>;

    /// Returns a buffer to the allocator.
    ///
    /// Releasing a buffer twice, or one this allocator did not produce,
    /// fails with [`MatError::Resource`] naming the buffer id.
    fn release(&self, buffer: ScratchBuffer) -> Result<()>;

    /// Current allocate/release counters.
    fn stats(&self) -> AllocStats;
}

/// Shared bookkeeping for both allocator implementations.
#[derive(Debug, Default)]
struct Ledger {
    next_id: AtomicU64,
    allocated: AtomicU64,
    released: AtomicU64,
    live: Mutex<HashSet<u64>>,
}

impl Ledger {
    fn check_out(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        live.insert(id);
        id
    }

    fn check_in(&self, id: u64) -> Result<()> {
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        if !live.remove(&id) {
            return Err(MatError::Resource(format!(
                "buffer {id} released twice or not owned by this allocator"
            )));
        }
        self.released.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> AllocStats {
        AllocStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

/// An allocator backed by plain heap allocations.
///
/// Optionally enforces a cap on live bytes; exceeding it is reported as
/// exhaustion rather than a panic or an OOM abort.
#[derive(Debug, Default)]
pub struct PlainAllocator {
    ledger: Ledger,
    live_bytes: AtomicU64,
    limit_bytes: Option<u64>,
}

impl PlainAllocator {
    /// An unbounded plain allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A plain allocator refusing to hold more than `limit` live bytes.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit_bytes: Some(limit),
            ..Self::default()
        }
    }
}

impl BufferAllocator for PlainAllocator {
    fn allocate(&self, len: usize) -> Result<ScratchBuffer> {
        if let Some(limit) = self.limit_bytes {
            let live = self.live_bytes.load(Ordering::Relaxed);
            if live + len as u64 > limit {
                return Err(MatError::Resource(format!(
                    "allocator exhausted: {live} live bytes + {len} requested exceeds limit {limit}"
                )));
            }
        }
        self.live_bytes.fetch_add(len as u64, Ordering::Relaxed);
        Ok(ScratchBuffer::new(self.ledger.check_out(), vec![0u8; len]))
    }

    fn release(&self, buffer: ScratchBuffer) -> Result<()> {
        self.ledger.check_in(buffer.id)?;
        self.live_bytes
            .fetch_sub(buffer.data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> AllocStats {
        self.ledger.stats()
    }
}

/// An allocator that recycles backing storage between tasks.
///
/// Released vectors are parked in a bounded free list; a later `allocate`
/// reuses the largest-capacity parked vector, resizing and zero-filling it
/// before hand-out so stale task data never leaks into a fresh buffer.
#[derive(Debug)]
pub struct PooledAllocator {
    ledger: Ledger,
    pool: Mutex<Vec<Vec<u8>>>,
    max_parked: usize,
}

impl PooledAllocator {
    /// A pool retaining at most `max_parked` idle buffers.
    pub fn new(max_parked: usize) -> Self {
        Self {
            ledger: Ledger::default(),
            pool: Mutex::new(Vec::new()),
            max_parked,
        }
    }
}

impl Default for PooledAllocator {
    fn default() -> Self {
        Self::new(16)
    }
}

impl BufferAllocator for PooledAllocator {
    fn allocate(&self, len: usize) -> Result<ScratchBuffer> {
        let recycled = {
            let mut pool = self.pool.lock().unwrap_or_else(|p| p.into_inner());
            pool.pop()
        };
        let data = match recycled {
            Some(mut storage) => {
                storage.clear();
                storage.resize(len, 0);
                storage
            }
            None => vec![0u8; len],
        };
        Ok(ScratchBuffer::new(self.ledger.check_out(), data))
    }

    fn release(&self, buffer: ScratchBuffer) -> Result<()> {
        self.ledger.check_in(buffer.id)?;
        let mut pool = self.pool.lock().unwrap_or_else(|p| p.into_inner());
        if pool.len() < self.max_parked {
            pool.push(buffer.data);
        }
        Ok(())
    }

    fn stats(&self) -> AllocStats {
        self.ledger.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(alloc: &dyn BufferAllocator) {
        let mut a = alloc.allocate(64).unwrap();
        assert_eq!(a.len(), 64);
        assert!(a.as_slice().iter().all(|&b| b == 0));
        a.as_mut_slice()[0] = 0xAB;
        let b = alloc.allocate(8).unwrap();
        assert_ne!(a.id(), b.id());
        alloc.release(a).unwrap();
        alloc.release(b).unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.released, 2);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn plain_allocator_balances() {
        exercise(&PlainAllocator::new());
    }

    #[test]
    fn pooled_allocator_balances() {
        exercise(&PooledAllocator::default());
    }

    #[test]
    fn pooled_reuse_is_zeroed() {
        let alloc = PooledAllocator::default();
        let mut a = alloc.allocate(32).unwrap();
        a.as_mut_slice().fill(0xFF);
        alloc.release(a).unwrap();
        let b = alloc.allocate(16).unwrap();
        assert!(b.as_slice().iter().all(|&v| v == 0));
        alloc.release(b).unwrap();
    }

    #[test]
    fn double_release_reports_buffer_id() {
        let alloc = PlainAllocator::new();
        let a = alloc.allocate(4).unwrap();
        let id = a.id();
        // Forge a second handle with the same id to simulate a double free.
        let forged = ScratchBuffer::new(id, Vec::new());
        alloc.release(a).unwrap();
        let err = alloc.release(forged).unwrap_err();
        match err {
            MatError::Resource(msg) => assert!(msg.contains(&id.to_string())),
            other => panic!("expected resource error, got {other}"),
        }
    }

    #[test]
    fn limited_allocator_reports_exhaustion() {
        let alloc = PlainAllocator::with_limit(100);
        let a = alloc.allocate(80).unwrap();
        assert!(matches!(alloc.allocate(40), Err(MatError::Resource(_))));
        alloc.release(a).unwrap();
        let b = alloc.allocate(40).unwrap();
        alloc.release(b).unwrap();
    }
}
