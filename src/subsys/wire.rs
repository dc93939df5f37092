//! Byte-level framing of the subsystem blob.
//!
//! The trailing subsystem entry of a container is itself a tiny nested
//! stream: an 8-byte mini header (version, endian marker, reserved zeros)
//! followed by one opaque element — the *file wrapper* — whose content is a
//! cell array laid out as:
//!
//! ```text
//! [0] metadata buffer (u8, the five segments)
//! [1] reserved slot
//! [2..] property heap values
//! [last] defaults cell: one default-property struct per class
//! ```
//!
//! Property records with the cell-heap flag address heap slot `h` as cell
//! `h + CELL_HEAP_OFFSET`.
//!
//! This module also encodes/decodes the u32 metadata array embedded in
//! opaque elements that stand in for class instances: a magic word, the
//! logical dimensions, one object index per instance, and the class index.

use std::sync::Arc;

use crate::array::{ArrayKind, CellArray, Dims, MatArray, NumericData, OpaqueContent};
use crate::bytes::SliceSource;
use crate::element;
use crate::error::{MatError, Result};
use crate::format::{ByteOrder, HEADER_VERSION};
use crate::subsys::registry::ReferenceRegistry;
use crate::subsys::resolver::{ObjectArena, Resolver};
use crate::subsys::segments::SegmentParser;

/// Cell index of the first property-heap slot.
pub const CELL_HEAP_OFFSET: usize = 2;

/// Object-subsystem tag carried by class-instance opaques.
pub const MCOS_TYPE: &str = "MCOS";

/// Class name of the wrapper opaque inside the subsystem blob.
pub const FILE_WRAPPER_CLASS: &str = "FileWrapper__";

/// Magic word opening reference metadata arrays.
pub const REF_MAGIC: u32 = 0xDD00_0000;

/// Size of the mini header leading the subsystem blob.
pub const BLOB_HEADER_SIZE: usize = 8;

/// Decoded payload of a reference metadata array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceMeta {
    /// Class record index.
    pub class_index: u32,
    /// Logical dimensions of the instance array.
    pub dims: Vec<i32>,
    /// One object record index per instance, column-major.
    pub object_indices: Vec<u32>,
}

impl ReferenceMeta {
    /// Attempts to decode `words` as reference metadata.
    ///
    /// Returns `None` when the magic word is absent — the opaque then
    /// carries ordinary metadata and stays raw. A present magic with a
    /// malformed remainder is a format error, not a fallback.
    pub fn decode(words: &[u32]) -> Result<Option<Self>> {
        if words.first() != Some(&REF_MAGIC) {
            return Ok(None);
        }
        let ndims = *words
            .get(1)
            .ok_or_else(|| MatError::format("reference metadata truncated after magic"))?
            as usize;
        if ndims < 2 || words.len() < 2 + ndims {
            return Err(MatError::format("reference metadata dimension list truncated"));
        }
        let dims: Vec<i32> = words[2..2 + ndims].iter().map(|&w| w as i32).collect();
        let count: usize = dims.iter().map(|&d| d.max(0) as usize).product();
        let expected = 2 + ndims + count + 1;
        if words.len() != expected {
            return Err(MatError::format(format!(
                "reference metadata holds {} words, expected {expected}",
                words.len()
            )));
        }
        let object_indices = words[2 + ndims..2 + ndims + count].to_vec();
        let class_index = words[expected - 1];
        Ok(Some(Self {
            class_index,
            dims,
            object_indices,
        }))
    }

    /// Encodes reference metadata back to its u32 array form.
    pub fn encode(class_index: u32, dims: &Dims, object_indices: &[u32]) -> Vec<u32> {
        let mut words = Vec::with_capacity(2 + dims.ndims() + object_indices.len() + 1);
        words.push(REF_MAGIC);
        words.push(dims.ndims() as u32);
        words.extend(dims.as_slice().iter().map(|&d| d as u32));
        words.extend_from_slice(object_indices);
        words.push(class_index);
        words
    }
}

/// Read-only view over the file wrapper's cells.
#[derive(Debug)]
pub struct PropertyHeap<'a> {
    cells: &'a [MatArray],
}

impl<'a> PropertyHeap<'a> {
    /// Wraps the wrapper cell list, validating the fixed slots exist.
    pub fn new(cells: &'a [MatArray]) -> Result<Self> {
        if cells.len() < CELL_HEAP_OFFSET + 1 {
            return Err(MatError::format(format!(
                "file wrapper holds {} cells, too few for the heap layout",
                cells.len()
            )));
        }
        Ok(Self { cells })
    }

    /// The metadata buffer bytes in cell 0.
    pub fn metadata(&self) -> Result<&'a [u8]> {
        match self.cells[0].kind() {
            ArrayKind::Numeric(n) => match &n.real {
                NumericData::U8(bytes) => Ok(bytes),
                _ => Err(MatError::format("metadata cell is not a u8 array")),
            },
            _ => Err(MatError::format("metadata cell is not a numeric array")),
        }
    }

    /// The heap value at a property record's heap index.
    pub fn value(&self, heap_index: u32) -> Result<&'a MatArray> {
        let cell = heap_index as usize + CELL_HEAP_OFFSET;
        // The defaults cell at the tail is not addressable as a heap slot.
        if cell + 1 >= self.cells.len() {
            return Err(MatError::format(format!(
                "heap index {heap_index} addresses cell {cell} beyond the heap"
            )));
        }
        Ok(&self.cells[cell])
    }

    fn defaults_cell(&self) -> Result<&'a CellArray> {
        let last = self
            .cells
            .last()
            .ok_or_else(|| MatError::format("file wrapper has no defaults cell"))?;
        match last.kind() {
            ArrayKind::Cell(c) => Ok(c),
            _ => Err(MatError::format("defaults slot is not a cell array")),
        }
    }

    /// The default-property struct (or empty placeholder) for a 1-based
    /// class id.
    pub fn class_defaults(&self, class_id: u32) -> Result<&'a MatArray> {
        let defaults = self.defaults_cell()?;
        defaults
            .elements()
            .get(class_id as usize - 1)
            .ok_or_else(|| {
                MatError::format(format!(
                    "no default-property slot for class {class_id} (defaults cell holds {})",
                    defaults.elements().len()
                ))
            })
    }
}

/// Parses a subsystem blob into a fully resolved object arena.
///
/// Runs strictly single-threaded. References embedded in heap values are
/// registered with an internal registry and patched with weak back
/// references once the arena is complete, so cyclic graphs resolve without
/// leaking.
pub fn parse_blob(raw: &[u8]) -> Result<Arc<ObjectArena>> {
    let order = blob_order(raw)?;
    let mut src = SliceSource::new(&raw[BLOB_HEADER_SIZE..], order);
    let internal = ReferenceRegistry::new();
    let (name, wrapper) = element::read_element(&mut src, &internal)?;
    if !name.is_empty() {
        return Err(MatError::format("subsystem wrapper element carries a name"));
    }
    let cells = match wrapper.kind() {
        ArrayKind::Opaque(o)
            if o.object_type == MCOS_TYPE && o.class_name == FILE_WRAPPER_CLASS =>
        {
            match &o.content {
                OpaqueContent::Raw(inner) => match inner.kind() {
                    ArrayKind::Cell(c) => c.elements(),
                    _ => {
                        return Err(MatError::format(
                            "file wrapper content is not a cell array",
                        ));
                    }
                },
                OpaqueContent::Reference(_) => {
                    return Err(MatError::format(
                        "file wrapper content is a reference, expected raw cells",
                    ));
                }
            }
        }
        _ => {
            return Err(MatError::format(
                "subsystem blob does not start with a file wrapper opaque",
            ));
        }
    };
    let heap = PropertyHeap::new(cells)?;
    let meta = SegmentParser::parse(heap.metadata()?, order)?;
    let arena = Resolver::build(&meta, &heap)?;
    internal.bind_backref(&arena);
    Ok(arena)
}

/// Reads the blob mini header, returning the byte order of the rest.
pub fn blob_order(raw: &[u8]) -> Result<ByteOrder> {
    if raw.len() < BLOB_HEADER_SIZE {
        return Err(MatError::format("subsystem blob smaller than its header"));
    }
    let order = ByteOrder::from_marker([raw[2], raw[3]])?;
    let ver_raw = [raw[0], raw[1]];
    let version = match order {
        ByteOrder::Little => u16::from_le_bytes(ver_raw),
        ByteOrder::Big => u16::from_be_bytes(ver_raw),
    };
    if version != HEADER_VERSION {
        return Err(MatError::format(format!(
            "unsupported subsystem blob version 0x{version:04x}"
        )));
    }
    if raw[4..BLOB_HEADER_SIZE].iter().any(|&b| b != 0) {
        return Err(MatError::format("non-zero reserved bytes in subsystem blob header"));
    }
    Ok(order)
}

/// Emits the blob mini header for newly built subsystems.
pub fn blob_header(order: ByteOrder) -> [u8; BLOB_HEADER_SIZE] {
    let mut out = [0u8; BLOB_HEADER_SIZE];
    let ver = match order {
        ByteOrder::Little => HEADER_VERSION.to_le_bytes(),
        ByteOrder::Big => HEADER_VERSION.to_be_bytes(),
    };
    out[0..2].copy_from_slice(&ver);
    out[2..4].copy_from_slice(&order.marker());
    out
}
