//! The undocumented object subsystem.
//!
//! MAT 5 files store class-instance ("handle") variables in two halves: the
//! visible tree holds opaque reference placeholders, and a trailing unnamed
//! byte-array entry — the subsystem — holds the shared backing data. This
//! module decodes that blob ([`wire`]), walks its five metadata segments
//! ([`segments`]), builds the shared object arena ([`resolver`]) and patches
//! every placeholder through the [`registry`]. [`build`] assembles blobs
//! for writing.

pub mod build;
pub mod registry;
pub mod resolver;
pub mod segments;
pub mod wire;

pub use build::SubsystemBuilder;
pub use registry::{ObjectLink, ReferenceRegistry};
pub use resolver::{ObjectArena, Resolver, SubsystemObject};
pub use segments::{ClassRecord, ObjectRecord, PropertyRecord, SegmentParser, SubsystemMeta};

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::alloc::{BufferAllocator, ScratchBuffer};
use crate::error::{MatError, Result};

struct SubsystemState {
    raw: Mutex<Option<ScratchBuffer>>,
    len: usize,
    allocator: Arc<dyn BufferAllocator>,
    arena: OnceLock<Arc<ObjectArena>>,
}

/// The trailing subsystem entry of a container.
///
/// Owns its raw bytes in an allocator-backed scratch buffer and parses them
/// into an object arena on first use. Cloning shares the state; closing
/// releases the buffer back to the allocator that produced it.
#[derive(Clone)]
pub struct Subsystem {
    inner: Arc<SubsystemState>,
}

impl Subsystem {
    /// Copies `bytes` into a buffer acquired from `allocator`.
    pub fn from_bytes(bytes: &[u8], allocator: Arc<dyn BufferAllocator>) -> Result<Self> {
        let mut buf = allocator.allocate(bytes.len())?;
        buf.as_mut_slice().copy_from_slice(bytes);
        Ok(Self {
            inner: Arc::new(SubsystemState {
                raw: Mutex::new(Some(buf)),
                len: bytes.len(),
                allocator,
                arena: OnceLock::new(),
            }),
        })
    }

    /// Length of the raw blob in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// True for a zero-length blob.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Runs `f` over the raw bytes; fails once the subsystem is closed.
    pub fn with_raw<R>(&self, f: impl FnOnce(&[u8]) -> Result<R>) -> Result<R> {
        let guard = self.inner.raw.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(buf) => f(buf.as_slice()),
            None => Err(MatError::Resource(
                "subsystem buffer already released".into(),
            )),
        }
    }

    /// Parses the blob into its object arena, reusing a previous parse.
    ///
    /// Resolution is single-threaded by contract: the pipeline only calls
    /// this after every root decode task has completed.
    pub fn resolve(&self) -> Result<Arc<ObjectArena>> {
        if let Some(arena) = self.inner.arena.get() {
            return Ok(Arc::clone(arena));
        }
        let arena = self.with_raw(wire::parse_blob)?;
        let _ = self.inner.arena.set(Arc::clone(&arena));
        Ok(arena)
    }

    /// The arena from an earlier [`resolve`](Self::resolve) call, if any.
    pub fn arena(&self) -> Option<Arc<ObjectArena>> {
        self.inner.arena.get().map(Arc::clone)
    }

    /// Releases the raw buffer back to its allocator.
    ///
    /// Idempotent: a second close is a no-op, so container teardown can
    /// retry after partial failures.
    pub fn close(&self) -> Result<()> {
        let buf = {
            let mut guard = self.inner.raw.lock().unwrap_or_else(|p| p.into_inner());
            guard.take()
        };
        match buf {
            Some(buf) => self.inner.allocator.release(buf),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Subsystem(len={}, resolved={})",
            self.inner.len,
            self.inner.arena.get().is_some()
        )
    }
}

impl PartialEq for Subsystem {
    /// Subsystems compare by identity: clones of one subsystem are equal,
    /// distinct parses are not, even over identical bytes.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
