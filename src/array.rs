//! The in-memory typed-array model.
//!
//! A [`MatArray`] is one variable as it exists between the codec and the
//! host application: dimensions, a global flag, and a kind-specific payload.
//! Payload buffers are stored column-major, exactly as the wire format lays
//! them out, so encode/decode never reorders data.
//!
//! Class-instance ("handle") values are represented by
//! [`OpaqueContent::Reference`] placeholders that the subsystem resolver
//! later binds to a shared object arena; see [`crate::subsys`]. Equality of
//! resolved references is identity-based, which keeps cyclic object graphs
//! safe to compare and traverse.

use indexmap::IndexSet;

use crate::error::{MatError, Result};
use crate::format::{ClassId, ElementTag};
use crate::subsys::{ObjectLink, Subsystem};

/// Ordered dimensions of an array.
///
/// Always at least two entries; the product equals the element count.
/// Immutable after construction except through the append-only
/// [`StreamingMatrix`] builder, which grows the final dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dims(Vec<i32>);

impl Dims {
    /// Validates and wraps a dimension list.
    pub fn new(sizes: Vec<i32>) -> Result<Self> {
        if sizes.len() < 2 {
            return Err(MatError::bounds(format!(
                "arrays need at least 2 dimensions, got {}",
                sizes.len()
            )));
        }
        if sizes.iter().any(|&d| d < 0) {
            return Err(MatError::bounds("negative dimension"));
        }
        Ok(Self(sizes))
    }

    /// A two-dimensional `rows × cols` shape.
    pub fn matrix(rows: i32, cols: i32) -> Self {
        Self(vec![rows.max(0), cols.max(0)])
    }

    /// Total number of elements (product of all dimensions).
    pub fn element_count(&self) -> usize {
        self.0.iter().map(|&d| d as usize).product()
    }

    /// The raw dimension list.
    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.0.len()
    }

    /// Size of the first dimension.
    pub fn rows(&self) -> i32 {
        self.0[0]
    }

    /// Size of the second dimension.
    pub fn cols(&self) -> i32 {
        self.0[1]
    }

    pub(crate) fn grow_last(&mut self, by: i32) {
        if let Some(last) = self.0.last_mut() {
            *last += by;
        }
    }
}

/// Numeric storage classes of dense and sparse matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericClass {
    /// IEEE 754 double precision.
    Double,
    /// IEEE 754 single precision.
    Single,
    /// Signed 8-bit.
    Int8,
    /// Unsigned 8-bit.
    UInt8,
    /// Signed 16-bit.
    Int16,
    /// Unsigned 16-bit.
    UInt16,
    /// Signed 32-bit.
    Int32,
    /// Unsigned 32-bit.
    UInt32,
    /// Signed 64-bit.
    Int64,
    /// Unsigned 64-bit.
    UInt64,
}

impl NumericClass {
    /// Bytes per element.
    pub const fn width(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Single | Self::Int32 | Self::UInt32 => 4,
            Self::Double | Self::Int64 | Self::UInt64 => 8,
        }
    }

    /// The array class id carried in the flags sub-element.
    pub const fn class_id(self) -> ClassId {
        match self {
            Self::Double => ClassId::Double,
            Self::Single => ClassId::Single,
            Self::Int8 => ClassId::Int8,
            Self::UInt8 => ClassId::UInt8,
            Self::Int16 => ClassId::Int16,
            Self::UInt16 => ClassId::UInt16,
            Self::Int32 => ClassId::Int32,
            Self::UInt32 => ClassId::UInt32,
            Self::Int64 => ClassId::Int64,
            Self::UInt64 => ClassId::UInt64,
        }
    }

    /// The element tag used for this class's data sub-element.
    pub const fn data_tag(self) -> ElementTag {
        match self {
            Self::Double => ElementTag::Double,
            Self::Single => ElementTag::Single,
            Self::Int8 => ElementTag::Int8,
            Self::UInt8 => ElementTag::UInt8,
            Self::Int16 => ElementTag::Int16,
            Self::UInt16 => ElementTag::UInt16,
            Self::Int32 => ElementTag::Int32,
            Self::UInt32 => ElementTag::UInt32,
            Self::Int64 => ElementTag::Int64,
            Self::UInt64 => ElementTag::UInt64,
        }
    }

    /// Maps a dense-matrix class id back to its numeric class.
    pub fn from_class_id(id: ClassId) -> Result<Self> {
        Ok(match id {
            ClassId::Double => Self::Double,
            ClassId::Single => Self::Single,
            ClassId::Int8 => Self::Int8,
            ClassId::UInt8 => Self::UInt8,
            ClassId::Int16 => Self::Int16,
            ClassId::UInt16 => Self::UInt16,
            ClassId::Int32 => Self::Int32,
            ClassId::UInt32 => Self::UInt32,
            ClassId::Int64 => Self::Int64,
            ClassId::UInt64 => Self::UInt64,
            other => {
                return Err(MatError::format(format!(
                    "class {other:?} is not a numeric class"
                )));
            }
        })
    }
}

/// A typed column-major value buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum NumericData {
    /// `f64` values.
    F64(Vec<f64>),
    /// `f32` values.
    F32(Vec<f32>),
    /// `i8` values.
    I8(Vec<i8>),
    /// `u8` values.
    U8(Vec<u8>),
    /// `i16` values.
    I16(Vec<i16>),
    /// `u16` values.
    U16(Vec<u16>),
    /// `i32` values.
    I32(Vec<i32>),
    /// `u32` values.
    U32(Vec<u32>),
    /// `i64` values.
    I64(Vec<i64>),
    /// `u64` values.
    U64(Vec<u64>),
}

impl NumericData {
    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            Self::F64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::I8(v) => v.len(),
            Self::U8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::U32(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::U64(v) => v.len(),
        }
    }

    /// True for an empty buffer.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The storage class of this buffer.
    pub fn class(&self) -> NumericClass {
        match self {
            Self::F64(_) => NumericClass::Double,
            Self::F32(_) => NumericClass::Single,
            Self::I8(_) => NumericClass::Int8,
            Self::U8(_) => NumericClass::UInt8,
            Self::I16(_) => NumericClass::Int16,
            Self::U16(_) => NumericClass::UInt16,
            Self::I32(_) => NumericClass::Int32,
            Self::U32(_) => NumericClass::UInt32,
            Self::I64(_) => NumericClass::Int64,
            Self::U64(_) => NumericClass::UInt64,
        }
    }

    /// A zero-filled buffer of `len` values in the given class.
    pub fn zeros(class: NumericClass, len: usize) -> Self {
        match class {
            NumericClass::Double => Self::F64(vec![0.0; len]),
            NumericClass::Single => Self::F32(vec![0.0; len]),
            NumericClass::Int8 => Self::I8(vec![0; len]),
            NumericClass::UInt8 => Self::U8(vec![0; len]),
            NumericClass::Int16 => Self::I16(vec![0; len]),
            NumericClass::UInt16 => Self::U16(vec![0; len]),
            NumericClass::Int32 => Self::I32(vec![0; len]),
            NumericClass::UInt32 => Self::U32(vec![0; len]),
            NumericClass::Int64 => Self::I64(vec![0; len]),
            NumericClass::UInt64 => Self::U64(vec![0; len]),
        }
    }
}

/// Dense numeric matrix payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    /// True when the values carry MATLAB logical semantics.
    pub logical: bool,
    /// Real part, column-major.
    pub real: NumericData,
    /// Imaginary part, present only for complex arrays.
    pub imag: Option<NumericData>,
}

/// Sparse matrix payload in compressed-sparse-column form.
///
/// `col_ptrs` has `cols + 1` entries, monotonic, starting at 0 and ending at
/// the number of stored values. `row_indices` keeps a single placeholder
/// entry even when no value is stored — a wire-format quirk that must
/// round-trip untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseArray {
    /// Logical (pattern) matrix flag.
    pub logical: bool,
    /// Row index of each stored value; length `max(1, nnz)`.
    pub row_indices: Vec<i32>,
    /// Cumulative column start offsets; length `cols + 1`.
    pub col_ptrs: Vec<i32>,
    /// Stored values; length `nnz`.
    pub values: Vec<f64>,
    /// Imaginary parts, present only for complex matrices.
    pub imag: Option<Vec<f64>>,
}

impl SparseArray {
    /// Number of stored (non-zero) values.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// The declared stored-value capacity; never less than one.
    pub fn nz_max(&self) -> u32 {
        self.nnz().max(1) as u32
    }
}

/// Cell array payload: an ordered sequence of owned arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct CellArray {
    elements: Vec<MatArray>,
}

impl CellArray {
    /// One contained array per grid slot, column-major.
    pub fn elements(&self) -> &[MatArray] {
        &self.elements
    }

    /// Mutable access to a slot.
    pub fn element_mut(&mut self, index: usize) -> Option<&mut MatArray> {
        self.elements.get_mut(index)
    }
}

/// Struct array payload.
///
/// Field names are de-duplicated and insertion-ordered, shared by every
/// element; each element holds one value slot per field, in field order.
#[derive(Debug, Clone, PartialEq)]
pub struct StructArray {
    fields: IndexSet<String>,
    elements: Vec<Vec<MatArray>>,
}

impl StructArray {
    /// Builds a struct payload, validating shape consistency.
    pub fn new(fields: Vec<String>, elements: Vec<Vec<MatArray>>) -> Result<Self> {
        let mut set = IndexSet::new();
        for name in fields {
            if !set.insert(name.clone()) {
                return Err(MatError::bounds(format!("duplicate field name {name:?}")));
            }
        }
        for (i, element) in elements.iter().enumerate() {
            if element.len() != set.len() {
                return Err(MatError::bounds(format!(
                    "element {i} has {} values for {} fields",
                    element.len(),
                    set.len()
                )));
            }
        }
        Ok(Self {
            fields: set,
            elements,
        })
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    /// Number of fields.
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Number of struct elements.
    pub fn num_elements(&self) -> usize {
        self.elements.len()
    }

    /// Position of a field in declaration order.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.get_index_of(name)
    }

    /// The value of `name` in element `index`.
    pub fn get(&self, index: usize, name: &str) -> Option<&MatArray> {
        let slot = self.field_index(name)?;
        self.elements.get(index)?.get(slot)
    }

    /// Replaces the value of `name` in element `index`.
    pub fn set(&mut self, index: usize, name: &str, value: MatArray) -> Result<()> {
        let slot = self
            .field_index(name)
            .ok_or_else(|| MatError::bounds(format!("no field named {name:?}")))?;
        let element = self
            .elements
            .get_mut(index)
            .ok_or_else(|| MatError::bounds(format!("element {index} out of range")))?;
        element[slot] = value;
        Ok(())
    }

    /// Appends a field with one value per element.
    pub fn add_field(&mut self, name: &str, values: Vec<MatArray>) -> Result<()> {
        if values.len() != self.elements.len() {
            return Err(MatError::bounds(format!(
                "{} values for {} elements",
                values.len(),
                self.elements.len()
            )));
        }
        if !self.fields.insert(name.to_string()) {
            return Err(MatError::bounds(format!("field {name:?} already exists")));
        }
        for (element, value) in self.elements.iter_mut().zip(values) {
            element.push(value);
        }
        Ok(())
    }

    /// Removes a field from every element in one pass.
    ///
    /// The name set and every element's value list are updated together, so
    /// the name-to-slot mapping is never observable in a half-updated state.
    pub fn remove_field(&mut self, name: &str) -> Result<Vec<MatArray>> {
        let slot = self
            .fields
            .shift_remove_full(name)
            .map(|(idx, _)| idx)
            .ok_or_else(|| MatError::bounds(format!("no field named {name:?}")))?;
        Ok(self
            .elements
            .iter_mut()
            .map(|element| element.remove(slot))
            .collect())
    }
}

/// Legacy class-instance payload: a struct body tagged with a class name.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectStructArray {
    /// The class this instance belongs to.
    pub class_name: String,
    /// The underlying field/value storage.
    pub body: StructArray,
}

/// Text encodings selectable when writing character data.
///
/// Independent of the in-memory representation, which is always a
/// column-major grid of `char`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CharEncoding {
    /// One byte per character; non-ASCII content is rejected at write time.
    Ascii,
    /// Variable-width UTF-8.
    Utf8,
    /// UTF-16 code units; characters outside the BMP are rejected because
    /// surrogate pairs would break the one-unit-per-element grid.
    #[default]
    Utf16,
    /// One 32-bit unit per character.
    Utf32,
}

/// Character array payload: one logical string per row.
#[derive(Debug, Clone, PartialEq)]
pub struct CharArray {
    /// Characters in column-major grid order.
    pub data: Vec<char>,
    /// Encoding applied when the array is written.
    pub encoding: CharEncoding,
}

impl CharArray {
    /// Extracts row `row` of an `rows × cols` grid as a string,
    /// with trailing spaces trimmed.
    pub fn row_string(&self, row: usize, rows: usize) -> String {
        let cols = if rows == 0 { 0 } else { self.data.len() / rows };
        let mut out = String::with_capacity(cols);
        for col in 0..cols {
            out.push(self.data[col * rows + row]);
        }
        out.trim_end().to_string()
    }
}

/// A placeholder for one or more class instances stored in the subsystem.
///
/// Carries the indices recorded in the file plus a link that the resolver
/// binds to the shared object arena. Until the link is bound the reference
/// is "forward": the objects it names may not have been built yet.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    /// Class record index in the subsystem metadata.
    pub class_index: u32,
    /// Object record indices, one per instance, column-major.
    pub object_indices: Vec<u32>,
    /// Binding to the resolved arena; shared by every alias.
    pub link: ObjectLink,
}

impl PartialEq for ObjectRef {
    /// Identity-based comparison: same recorded indices and, when both
    /// sides are resolved, the same arena. Never recurses into object
    /// properties, so cyclic graphs compare in bounded time.
    fn eq(&self, other: &Self) -> bool {
        self.class_index == other.class_index
            && self.object_indices == other.object_indices
            && self.link.same_arena(&other.link)
    }
}

/// Payload of an opaque array.
#[derive(Debug, Clone, PartialEq)]
pub enum OpaqueContent {
    /// A non-subsystem opaque: the raw metadata array is kept as-is.
    Raw(Box<MatArray>),
    /// A subsystem-backed class instance reference.
    Reference(ObjectRef),
}

/// Opaque array payload backing new-style class instances.
#[derive(Debug, Clone, PartialEq)]
pub struct OpaqueArray {
    /// The object subsystem tag, `MCOS` for class instances.
    pub object_type: String,
    /// The instance class name.
    pub class_name: String,
    /// Metadata or reference payload.
    pub content: OpaqueContent,
}

/// Kind-specific payload of a [`MatArray`].
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayKind {
    /// Dense numeric matrix.
    Numeric(NumericArray),
    /// Sparse matrix.
    Sparse(SparseArray),
    /// Cell array.
    Cell(CellArray),
    /// Struct array.
    Struct(StructArray),
    /// Legacy class instance (struct plus class name).
    ObjectStruct(ObjectStructArray),
    /// Character array.
    Char(CharArray),
    /// Opaque array, possibly a subsystem reference.
    Opaque(OpaqueArray),
    /// The trailing subsystem blob of a container.
    Subsystem(Subsystem),
}

/// One variable: dimensions, global flag, and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MatArray {
    dims: Dims,
    global: bool,
    kind: ArrayKind,
}

impl MatArray {
    /// Builds an array after validating that `dims` matches the payload.
    pub fn new(dims: Dims, kind: ArrayKind) -> Result<Self> {
        let count = dims.element_count();
        match &kind {
            ArrayKind::Numeric(n) => {
                if n.real.len() != count {
                    return Err(MatError::bounds(format!(
                        "{count} elements expected, data holds {}",
                        n.real.len()
                    )));
                }
                if let Some(imag) = &n.imag {
                    if imag.len() != count || imag.class() != n.real.class() {
                        return Err(MatError::bounds("imaginary part mismatches real part"));
                    }
                }
            }
            ArrayKind::Sparse(s) => {
                if dims.ndims() != 2 {
                    return Err(MatError::bounds("sparse matrices are two-dimensional"));
                }
                let cols = dims.cols() as usize;
                if s.col_ptrs.len() != cols + 1 {
                    return Err(MatError::bounds(format!(
                        "column pointers: expected {} entries, got {}",
                        cols + 1,
                        s.col_ptrs.len()
                    )));
                }
                let nnz = s.values.len();
                if s.col_ptrs.first() != Some(&0)
                    || s.col_ptrs.last() != Some(&(nnz as i32))
                    || s.col_ptrs.windows(2).any(|w| w[0] > w[1])
                {
                    return Err(MatError::bounds("column pointers are not monotonic"));
                }
                if s.row_indices.len() != nnz.max(1) {
                    return Err(MatError::bounds(format!(
                        "row indices: expected {} entries, got {}",
                        nnz.max(1),
                        s.row_indices.len()
                    )));
                }
                if let Some(imag) = &s.imag {
                    if imag.len() != nnz {
                        return Err(MatError::bounds("imaginary part mismatches values"));
                    }
                }
            }
            ArrayKind::Cell(c) => {
                if c.elements.len() != count {
                    return Err(MatError::bounds(format!(
                        "cell holds {} arrays for {count} slots",
                        c.elements.len()
                    )));
                }
            }
            ArrayKind::Struct(s) => {
                if s.num_elements() != count {
                    return Err(MatError::bounds(format!(
                        "struct holds {} elements for {count} slots",
                        s.num_elements()
                    )));
                }
            }
            ArrayKind::ObjectStruct(o) => {
                if o.body.num_elements() != count {
                    return Err(MatError::bounds(format!(
                        "object holds {} elements for {count} slots",
                        o.body.num_elements()
                    )));
                }
            }
            ArrayKind::Char(c) => {
                if c.data.len() != count {
                    return Err(MatError::bounds(format!(
                        "char grid holds {} characters for {count} slots",
                        c.data.len()
                    )));
                }
            }
            // Opaque dims are nominal (the wire carries none) and the
            // subsystem's dims are those of its raw byte vector.
            ArrayKind::Opaque(_) | ArrayKind::Subsystem(_) => {}
        }
        Ok(Self {
            dims,
            global: false,
            kind,
        })
    }

    /// Wraps a subsystem blob as the container's trailing entry array.
    pub fn subsystem_entry(subsystem: Subsystem) -> Self {
        Self {
            dims: Dims::matrix(1, subsystem.len() as i32),
            global: false,
            kind: ArrayKind::Subsystem(subsystem),
        }
    }

    /// A `0 × 0` double matrix: the canonical empty array.
    pub fn empty() -> Self {
        Self {
            dims: Dims::matrix(0, 0),
            global: false,
            kind: ArrayKind::Numeric(NumericArray {
                logical: false,
                real: NumericData::F64(Vec::new()),
                imag: None,
            }),
        }
    }

    /// A dense double matrix from column-major values.
    pub fn double(dims: Dims, values: Vec<f64>) -> Result<Self> {
        Self::numeric(dims, NumericData::F64(values))
    }

    /// A dense matrix of any numeric class.
    pub fn numeric(dims: Dims, data: NumericData) -> Result<Self> {
        Self::new(
            dims,
            ArrayKind::Numeric(NumericArray {
                logical: false,
                real: data,
                imag: None,
            }),
        )
    }

    /// A complex dense matrix from real and imaginary buffers.
    pub fn complex(dims: Dims, real: NumericData, imag: NumericData) -> Result<Self> {
        Self::new(
            dims,
            ArrayKind::Numeric(NumericArray {
                logical: false,
                real,
                imag: Some(imag),
            }),
        )
    }

    /// A logical matrix stored as `u8` values.
    pub fn logical(dims: Dims, values: Vec<u8>) -> Result<Self> {
        Self::new(
            dims,
            ArrayKind::Numeric(NumericArray {
                logical: true,
                real: NumericData::U8(values),
                imag: None,
            }),
        )
    }

    /// A sparse double matrix from compressed-sparse-column buffers.
    pub fn sparse(
        dims: Dims,
        row_indices: Vec<i32>,
        col_ptrs: Vec<i32>,
        values: Vec<f64>,
    ) -> Result<Self> {
        Self::new(
            dims,
            ArrayKind::Sparse(SparseArray {
                logical: false,
                row_indices,
                col_ptrs,
                values,
                imag: None,
            }),
        )
    }

    /// A cell array; missing trailing slots are filled with empty arrays.
    pub fn cell(dims: Dims, mut elements: Vec<MatArray>) -> Result<Self> {
        let count = dims.element_count();
        if elements.len() > count {
            return Err(MatError::bounds(format!(
                "{} arrays for {count} cell slots",
                elements.len()
            )));
        }
        elements.resize_with(count, MatArray::empty);
        Self::new(dims, ArrayKind::Cell(CellArray { elements }))
    }

    /// A struct array from field names and per-element value lists.
    pub fn structure(
        dims: Dims,
        fields: Vec<String>,
        elements: Vec<Vec<MatArray>>,
    ) -> Result<Self> {
        Self::new(dims, ArrayKind::Struct(StructArray::new(fields, elements)?))
    }

    /// A char array with one row per input string, space padded to the
    /// longest row.
    pub fn char_rows(rows: &[&str], encoding: CharEncoding) -> Result<Self> {
        let nrows = rows.len();
        let chars: Vec<Vec<char>> = rows.iter().map(|r| r.chars().collect()).collect();
        let ncols = chars.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = vec![' '; nrows * ncols];
        for (r, row) in chars.iter().enumerate() {
            for (c, &ch) in row.iter().enumerate() {
                data[c * nrows + r] = ch;
            }
        }
        Self::new(
            Dims::matrix(nrows as i32, ncols as i32),
            ArrayKind::Char(CharArray { data, encoding }),
        )
    }

    /// The dimensions.
    pub fn dims(&self) -> &Dims {
        &self.dims
    }

    /// The kind payload.
    pub fn kind(&self) -> &ArrayKind {
        &self.kind
    }

    /// Mutable access to the kind payload.
    pub fn kind_mut(&mut self) -> &mut ArrayKind {
        &mut self.kind
    }

    /// Marks or clears the global-workspace flag.
    pub fn set_global(&mut self, global: bool) {
        self.global = global;
    }

    /// The wire class id for this array.
    pub fn class_id(&self) -> ClassId {
        match &self.kind {
            ArrayKind::Numeric(n) => n.real.class().class_id(),
            ArrayKind::Sparse(_) => ClassId::Sparse,
            ArrayKind::Cell(_) => ClassId::Cell,
            ArrayKind::Struct(_) => ClassId::Struct,
            ArrayKind::ObjectStruct(_) => ClassId::Object,
            ArrayKind::Char(_) => ClassId::Char,
            ArrayKind::Opaque(_) => ClassId::Opaque,
            ArrayKind::Subsystem(_) => ClassId::UInt8,
        }
    }

    pub(crate) fn with_global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }
}

/// The narrow capability surface needed to emit an array-flags sub-element.
///
/// Adapters that are not full arrays (numeric-library views, test doubles)
/// implement just these four attributes instead of the whole array contract.
pub trait FlagSource {
    /// Logical (boolean-semantics) flag.
    fn is_logical(&self) -> bool;
    /// Global-workspace flag.
    fn is_global(&self) -> bool;
    /// Whether an imaginary part is present.
    fn is_complex(&self) -> bool;
    /// Declared sparse storage capacity; zero for dense arrays.
    fn nz_max(&self) -> u32;
}

impl FlagSource for MatArray {
    fn is_logical(&self) -> bool {
        match &self.kind {
            ArrayKind::Numeric(n) => n.logical,
            ArrayKind::Sparse(s) => s.logical,
            _ => false,
        }
    }

    fn is_global(&self) -> bool {
        self.global
    }

    fn is_complex(&self) -> bool {
        match &self.kind {
            ArrayKind::Numeric(n) => n.imag.is_some(),
            ArrayKind::Sparse(s) => s.imag.is_some(),
            _ => false,
        }
    }

    fn nz_max(&self) -> u32 {
        match &self.kind {
            ArrayKind::Sparse(s) => s.nz_max(),
            _ => 0,
        }
    }
}

/// Append-only builder growing a dense double matrix one column at a time.
///
/// The only sanctioned way to grow a dimension after construction: columns
/// accumulate in-place and `finish` seals the result into an immutable
/// [`MatArray`].
#[derive(Debug)]
pub struct StreamingMatrix {
    rows: usize,
    dims: Dims,
    data: Vec<f64>,
}

impl StreamingMatrix {
    /// A builder for matrices with `rows` rows and, so far, zero columns.
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            dims: Dims::matrix(rows as i32, 0),
            data: Vec::new(),
        }
    }

    /// Appends one column, growing the final dimension by one.
    pub fn append_column(&mut self, column: &[f64]) -> Result<()> {
        if column.len() != self.rows {
            return Err(MatError::bounds(format!(
                "column holds {} values for {} rows",
                column.len(),
                self.rows
            )));
        }
        self.data.extend_from_slice(column);
        self.dims.grow_last(1);
        Ok(())
    }

    /// Number of columns appended so far.
    pub fn cols(&self) -> usize {
        self.dims.cols() as usize
    }

    /// Seals the accumulated columns into a dense double matrix.
    pub fn finish(self) -> Result<MatArray> {
        MatArray::double(self.dims, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_require_two_entries() {
        assert!(Dims::new(vec![3]).is_err());
        assert!(Dims::new(vec![3, -1]).is_err());
        assert_eq!(Dims::new(vec![3, 4]).unwrap().element_count(), 12);
    }

    #[test]
    fn numeric_length_is_validated() {
        assert!(MatArray::double(Dims::matrix(2, 2), vec![1.0; 3]).is_err());
        assert!(MatArray::double(Dims::matrix(2, 2), vec![1.0; 4]).is_ok());
    }

    #[test]
    fn sparse_placeholder_row_index_is_required() {
        // nnz = 0 still needs the single placeholder row index.
        let ok = MatArray::sparse(Dims::matrix(3, 2), vec![0], vec![0, 0, 0], vec![]);
        assert!(ok.is_ok());
        let bad = MatArray::sparse(Dims::matrix(3, 2), vec![], vec![0, 0, 0], vec![]);
        assert!(bad.is_err());
    }

    #[test]
    fn sparse_col_ptrs_must_be_monotonic() {
        let bad = MatArray::sparse(Dims::matrix(3, 2), vec![0, 1], vec![0, 2, 1], vec![1.0, 2.0]);
        assert!(bad.is_err());
    }

    #[test]
    fn struct_remove_field_updates_every_element() {
        let mut s = StructArray::new(
            vec!["a".into(), "b".into(), "c".into()],
            vec![
                vec![MatArray::empty(), MatArray::empty(), MatArray::empty()],
                vec![MatArray::empty(), MatArray::empty(), MatArray::empty()],
            ],
        )
        .unwrap();
        assert_eq!(s.field_index("c"), Some(2));
        s.remove_field("b").unwrap();
        assert_eq!(s.field_index("c"), Some(1));
        assert_eq!(s.num_fields(), 2);
        for i in 0..2 {
            assert!(s.get(i, "a").is_some());
            assert!(s.get(i, "b").is_none());
            assert!(s.get(i, "c").is_some());
        }
    }

    #[test]
    fn struct_rejects_duplicate_fields() {
        assert!(StructArray::new(vec!["x".into(), "x".into()], vec![]).is_err());
    }

    #[test]
    fn char_rows_pad_to_longest() {
        let arr = MatArray::char_rows(&["hi", "there"], CharEncoding::Utf16).unwrap();
        assert_eq!(arr.dims().as_slice(), &[2, 5]);
        if let ArrayKind::Char(c) = arr.kind() {
            assert_eq!(c.row_string(0, 2), "hi");
            assert_eq!(c.row_string(1, 2), "there");
        } else {
            panic!("expected char kind");
        }
    }

    #[test]
    fn streaming_matrix_grows_last_dimension() {
        let mut m = StreamingMatrix::new(3);
        m.append_column(&[1.0, 2.0, 3.0]).unwrap();
        m.append_column(&[4.0, 5.0, 6.0]).unwrap();
        assert!(m.append_column(&[1.0]).is_err());
        let arr = m.finish().unwrap();
        assert_eq!(arr.dims().as_slice(), &[3, 2]);
    }

    #[test]
    fn flags_capability_surface() {
        let mut arr = MatArray::logical(Dims::matrix(1, 2), vec![1, 0]).unwrap();
        arr.set_global(true);
        assert!(arr.is_logical());
        assert!(arr.is_global());
        assert!(!arr.is_complex());
        assert_eq!(arr.nz_max(), 0);
    }
}
