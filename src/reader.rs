//! The read-side engine.
//!
//! Validates the 128-byte header, walks the top-level tags to find root
//! element ranges, decodes each element, and — when the final entry is the
//! unnamed subsystem blob — resolves the object arena and patches every
//! reference placeholder collected along the way.
//!
//! [`MatReader::open`] memory-maps the file; [`MatReader::read_bytes`]
//! works over any in-memory buffer. The concurrent variant lives in
//! [`crate::pipeline`] and shares the pre-scan and assembly steps defined
//! here.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use memmap2::Mmap;

use crate::alloc::{BufferAllocator, PlainAllocator};
use crate::array::{ArrayKind, MatArray, NumericData};
use crate::bytes::{ByteSource, SliceSource};
use crate::compression::read_enveloped;
use crate::container::MatFile;
use crate::error::{MatError, Result};
use crate::format::{ByteOrder, ElementTag, FileHeader, HEADER_SIZE, pad8};
use crate::subsys::{ReferenceRegistry, Subsystem};

/// Byte range of one top-level element, tag included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RootRange {
    pub start: usize,
    pub end: usize,
}

/// Walks top-level tags without materializing any content.
///
/// Each root element advances the cursor by its declared size padded to 8;
/// anything other than a matrix or compressed tag at top level fails.
pub(crate) fn scan_roots(bytes: &[u8], order: ByteOrder) -> Result<Vec<RootRange>> {
    let mut ranges = Vec::new();
    let mut pos = HEADER_SIZE;
    while pos < bytes.len() {
        let mut src = SliceSource::new(&bytes[pos..], order);
        let tag = ElementTag::from_u32(src.peek_u32()?)?;
        if tag != ElementTag::Matrix && tag != ElementTag::Compressed {
            return Err(MatError::format(format!(
                "top-level element at offset {pos} has tag {tag:?}"
            )));
        }
        src.skip(4)?;
        let declared = src.read_u32()? as usize;
        if pos
            .checked_add(8 + declared)
            .filter(|&end| end <= bytes.len())
            .is_none()
        {
            return Err(MatError::format(format!(
                "element at offset {pos} declares {declared} bytes past end of file"
            )));
        }
        // The final element may omit its trailing padding.
        let end = (pos + 8 + pad8(declared as u64) as usize).min(bytes.len());
        ranges.push(RootRange { start: pos, end });
        pos = end;
    }
    Ok(ranges)
}

/// Builds a container from decoded `(name, array)` pairs, converting a
/// trailing unnamed `u8` entry into the subsystem and patching references.
pub(crate) fn assemble(
    decoded: Vec<(String, MatArray)>,
    registry: &ReferenceRegistry,
    allocator: &Arc<dyn BufferAllocator>,
) -> Result<MatFile> {
    let count = decoded.len();
    let mut file = MatFile::new();
    for (index, (name, array)) in decoded.into_iter().enumerate() {
        let is_last = index + 1 == count;
        if name.is_empty() {
            let blob = subsystem_bytes(&array);
            match blob {
                Some(bytes) if is_last => {
                    let subsystem = Subsystem::from_bytes(bytes, Arc::clone(allocator))?;
                    // Resolution runs single-threaded, strictly after every
                    // root element has decoded; placeholders may have come
                    // from anywhere in the tree.
                    if !registry.is_empty() {
                        let arena = subsystem.resolve()?;
                        registry.bind_owned(&arena);
                        debug!(
                            "bound {} reference placeholders against {} objects",
                            registry.len(),
                            arena.len()
                        );
                    }
                    file.set_subsystem(subsystem);
                }
                _ => {
                    return Err(MatError::format(format!(
                        "unnamed root entry at position {index} is not a trailing subsystem"
                    )));
                }
            }
        } else {
            file.insert(&name, array)?;
        }
    }
    if file.subsystem().is_none() && !registry.is_empty() {
        return Err(MatError::format(format!(
            "{} reference placeholders but no subsystem entry to resolve them",
            registry.len()
        )));
    }
    Ok(file)
}

fn subsystem_bytes(array: &MatArray) -> Option<&[u8]> {
    match array.kind() {
        ArrayKind::Numeric(n) if !n.logical && n.imag.is_none() => match &n.real {
            NumericData::U8(bytes) => Some(bytes),
            _ => None,
        },
        _ => None,
    }
}

/// Sequential reader over files or in-memory byte buffers.
#[derive(Debug)]
pub struct MatReader {
    allocator: Arc<dyn BufferAllocator>,
}

impl MatReader {
    /// A reader releasing subsystem buffers through `allocator`.
    pub fn new(allocator: Arc<dyn BufferAllocator>) -> Self {
        Self { allocator }
    }

    /// Decodes a whole container from an in-memory buffer.
    pub fn read_bytes(&self, bytes: &[u8]) -> Result<MatFile> {
        let header = FileHeader::from_bytes(bytes)?;
        let ranges = scan_roots(bytes, header.order)?;
        debug!("scanned {} root elements ({:?})", ranges.len(), header.order);
        let registry = ReferenceRegistry::new();
        let mut decoded = Vec::with_capacity(ranges.len());
        for range in &ranges {
            let mut src = SliceSource::new(&bytes[range.start..range.end], header.order);
            decoded.push(read_enveloped(&mut src, &registry)?);
        }
        assemble(decoded, &registry, &self.allocator)
    }

    /// Memory-maps `path` and decodes it.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<MatFile> {
        let file = File::open(path)?;
        // Safety: the map is read-only and assumed not to be truncated by
        // another process while we parse it, the standard mmap contract.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        self.read_bytes(&mmap)
    }
}

impl Default for MatReader {
    fn default() -> Self {
        Self::new(Arc::new(PlainAllocator::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::TAG_SIZE;

    #[test]
    fn scan_rejects_non_root_tags() {
        let mut bytes = FileHeader::new().to_bytes().to_vec();
        bytes.extend_from_slice(&(ElementTag::Int8 as u32).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert!(scan_roots(&bytes, ByteOrder::Little).is_err());
    }

    #[test]
    fn scan_rejects_truncated_declarations() {
        let mut bytes = FileHeader::new().to_bytes().to_vec();
        bytes.extend_from_slice(&(ElementTag::Matrix as u32).to_le_bytes());
        bytes.extend_from_slice(&64u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(scan_roots(&bytes, ByteOrder::Little).is_err());
    }

    #[test]
    fn scan_finds_consecutive_ranges() {
        let mut bytes = FileHeader::new().to_bytes().to_vec();
        for _ in 0..2 {
            bytes.extend_from_slice(&(ElementTag::Matrix as u32).to_le_bytes());
            bytes.extend_from_slice(&16u32.to_le_bytes());
            bytes.extend_from_slice(&[0u8; 16]);
        }
        let ranges = scan_roots(&bytes, ByteOrder::Little).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, HEADER_SIZE);
        assert_eq!(
            ranges[0].end - ranges[0].start,
            TAG_SIZE as usize + 16
        );
        assert_eq!(ranges[1].end, bytes.len());
    }
}
