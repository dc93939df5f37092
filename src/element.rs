//! The element codec: one array in, tagged bytes out, and back.
//!
//! An array element is a `Matrix`-tagged unit holding four or more
//! sub-elements: array flags, dimensions, name, then kind-specific data,
//! each independently padded to an 8-byte boundary. [`compute_size`] and
//! [`write_element`] agree bit-for-bit — the pipeline sizes scratch buffers
//! from one and fills them with the other.
//!
//! Reading accepts the packed small-element form (payload folded into the
//! tag word) that some writers emit for sub-elements of four bytes or
//! fewer; writing always uses the general form.

use crate::array::{
    ArrayKind, CharArray, CharEncoding, Dims, FlagSource, MatArray, NumericArray, NumericClass,
    NumericData, ObjectRef, ObjectStructArray, OpaqueArray, OpaqueContent, SparseArray,
    StructArray,
};
use crate::bytes::{ByteSink, ByteSource, SliceSource};
use crate::error::{MatError, Result};
use crate::format::{ArrayFlags, ByteOrder, ClassId, ElementTag, TAG_SIZE, pad8};
use crate::subsys::wire::{MCOS_TYPE, ReferenceMeta};
use crate::subsys::{ObjectLink, ReferenceRegistry};

/// Size of one sub-element: tag plus payload padded to 8.
#[inline]
fn sub_size(payload: u64) -> u64 {
    TAG_SIZE + pad8(payload)
}

/// Exact serialized size of `array` under `name`, outer tag included.
///
/// Recurses through cell, struct and opaque contents; the result equals the
/// byte count [`write_element`] emits for the same inputs.
pub fn compute_size(name: &str, array: &MatArray) -> Result<u64> {
    Ok(TAG_SIZE + body_size(name, array)?)
}

fn body_size(name: &str, array: &MatArray) -> Result<u64> {
    const FLAGS_SIZE: u64 = 16;
    let name_size = sub_size(name.len() as u64);
    let dims_size = |dims: &Dims| sub_size(4 * dims.ndims() as u64);

    Ok(match array.kind() {
        ArrayKind::Numeric(n) => {
            let data = sub_size(n.real.len() as u64 * n.real.class().width() as u64);
            let total = if n.imag.is_some() { data * 2 } else { data };
            FLAGS_SIZE + dims_size(array.dims()) + name_size + total
        }
        ArrayKind::Sparse(s) => {
            let width = if s.logical { 1 } else { 8 };
            let mut data = sub_size(4 * s.row_indices.len() as u64)
                + sub_size(4 * s.col_ptrs.len() as u64)
                + sub_size(width * s.nnz() as u64);
            if s.imag.is_some() {
                data += sub_size(8 * s.nnz() as u64);
            }
            FLAGS_SIZE + dims_size(array.dims()) + name_size + data
        }
        ArrayKind::Cell(c) => {
            let mut data = 0;
            for element in c.elements() {
                data += compute_size("", element)?;
            }
            FLAGS_SIZE + dims_size(array.dims()) + name_size + data
        }
        ArrayKind::Struct(s) => {
            FLAGS_SIZE + dims_size(array.dims()) + name_size + struct_body_size(s)?
        }
        ArrayKind::ObjectStruct(o) => {
            FLAGS_SIZE
                + dims_size(array.dims())
                + name_size
                + sub_size(o.class_name.len() as u64)
                + struct_body_size(&o.body)?
        }
        ArrayKind::Char(c) => {
            FLAGS_SIZE
                + dims_size(array.dims())
                + name_size
                + sub_size(encoded_char_len(c)? as u64)
        }
        ArrayKind::Opaque(o) => {
            let content = match &o.content {
                OpaqueContent::Raw(inner) => compute_size("", inner)?,
                OpaqueContent::Reference(r) => {
                    compute_size("", &reference_content(array.dims(), r)?)?
                }
            };
            FLAGS_SIZE
                + name_size
                + sub_size(o.object_type.len() as u64)
                + sub_size(o.class_name.len() as u64)
                + content
        }
        ArrayKind::Subsystem(s) => {
            FLAGS_SIZE + sub_size(8) + name_size + sub_size(s.len() as u64)
        }
    })
}

fn struct_body_size(s: &StructArray) -> Result<u64> {
    let maxlen = field_name_span(s);
    let mut size = sub_size(4) + sub_size(s.num_fields() as u64 * maxlen as u64);
    for index in 0..s.num_elements() {
        for name in s.field_names() {
            let value = s
                .get(index, name)
                .ok_or_else(|| MatError::bounds(format!("missing field {name:?}")))?;
            size += compute_size("", value)?;
        }
    }
    Ok(size)
}

/// Per-field byte span in the field-names sub-element: longest name plus
/// its terminator.
fn field_name_span(s: &StructArray) -> usize {
    s.field_names().map(str::len).max().unwrap_or(0) + 1
}

fn encoded_char_len(c: &CharArray) -> Result<usize> {
    Ok(match c.encoding {
        CharEncoding::Ascii => {
            if let Some(bad) = c.data.iter().find(|ch| !ch.is_ascii()) {
                return Err(MatError::bounds(format!(
                    "character {bad:?} is not representable in ASCII"
                )));
            }
            c.data.len()
        }
        CharEncoding::Utf8 => c.data.iter().map(|ch| ch.len_utf8()).sum(),
        CharEncoding::Utf16 => {
            if let Some(bad) = c.data.iter().find(|ch| ch.len_utf16() != 1) {
                return Err(MatError::bounds(format!(
                    "character {bad:?} needs a surrogate pair and would break the grid"
                )));
            }
            2 * c.data.len()
        }
        CharEncoding::Utf32 => 4 * c.data.len(),
    })
}

/// The u32 metadata matrix standing in for a reference on the wire.
fn reference_content(dims: &Dims, r: &ObjectRef) -> Result<MatArray> {
    let words = ReferenceMeta::encode(r.class_index, dims, &r.object_indices);
    MatArray::numeric(
        Dims::matrix(words.len() as i32, 1),
        NumericData::U32(words),
    )
}

/// Serializes `array` under `name` into `sink`.
///
/// The sink position must be 8-aligned on entry; every sub-element is
/// padded back to alignment, so nested elements compose without gaps.
pub fn write_element(name: &str, array: &MatArray, sink: &mut dyn ByteSink) -> Result<()> {
    let body = body_size(name, array)?;
    let body = u32::try_from(body)
        .map_err(|_| MatError::bounds(format!("element {name:?} exceeds the 4 GiB tag range")))?;
    sink.write_u32(ElementTag::Matrix as u32)?;
    sink.write_u32(body)?;

    write_flags(sink, array)?;
    match array.kind() {
        // Opaque elements carry no dimensions sub-element; the subsystem
        // blob is framed as a plain u8 vector.
        ArrayKind::Opaque(o) => {
            write_name(sink, name)?;
            write_byte_string(sink, &o.object_type)?;
            write_byte_string(sink, &o.class_name)?;
            match &o.content {
                OpaqueContent::Raw(inner) => write_element("", inner, sink)?,
                OpaqueContent::Reference(r) => {
                    write_element("", &reference_content(array.dims(), r)?, sink)?;
                }
            }
        }
        ArrayKind::Subsystem(s) => {
            write_dims(sink, &[1, s.len() as i32])?;
            write_name(sink, name)?;
            s.with_raw(|raw| {
                write_sub_header(sink, ElementTag::UInt8, raw.len() as u32)?;
                sink.write_bytes(raw)?;
                sink.align8()
            })?;
        }
        kind => {
            write_dims(sink, array.dims().as_slice())?;
            write_name(sink, name)?;
            match kind {
                ArrayKind::Numeric(n) => write_numeric(sink, n)?,
                ArrayKind::Sparse(s) => write_sparse(sink, s)?,
                ArrayKind::Cell(c) => {
                    for element in c.elements() {
                        write_element("", element, sink)?;
                    }
                }
                ArrayKind::Struct(s) => write_struct_body(sink, s)?,
                ArrayKind::ObjectStruct(o) => {
                    write_byte_string(sink, &o.class_name)?;
                    write_struct_body(sink, &o.body)?;
                }
                ArrayKind::Char(c) => write_char(sink, c)?,
                ArrayKind::Opaque(_) | ArrayKind::Subsystem(_) => unreachable!(),
            }
        }
    }
    Ok(())
}

fn write_sub_header(sink: &mut dyn ByteSink, tag: ElementTag, num_bytes: u32) -> Result<()> {
    sink.write_u32(tag as u32)?;
    sink.write_u32(num_bytes)
}

fn write_flags(sink: &mut dyn ByteSink, array: &MatArray) -> Result<()> {
    let flags = ArrayFlags::new(
        array.class_id(),
        array.is_logical(),
        array.is_global(),
        array.is_complex(),
    );
    write_sub_header(sink, ElementTag::UInt32, 8)?;
    sink.write_u32(flags.as_u32())?;
    sink.write_u32(array.nz_max())
}

fn write_dims(sink: &mut dyn ByteSink, dims: &[i32]) -> Result<()> {
    write_sub_header(sink, ElementTag::Int32, 4 * dims.len() as u32)?;
    for &d in dims {
        sink.write_i32(d)?;
    }
    sink.align8()
}

fn write_name(sink: &mut dyn ByteSink, name: &str) -> Result<()> {
    write_sub_header(sink, ElementTag::Int8, name.len() as u32)?;
    sink.write_bytes(name.as_bytes())?;
    sink.align8()
}

/// An `Int8` sub-element holding a bare string (class names, opaque tags).
fn write_byte_string(sink: &mut dyn ByteSink, value: &str) -> Result<()> {
    write_name(sink, value)
}

fn write_numeric(sink: &mut dyn ByteSink, n: &NumericArray) -> Result<()> {
    write_numeric_data(sink, &n.real)?;
    if let Some(imag) = &n.imag {
        write_numeric_data(sink, imag)?;
    }
    Ok(())
}

fn write_numeric_data(sink: &mut dyn ByteSink, data: &NumericData) -> Result<()> {
    let class = data.class();
    write_sub_header(
        sink,
        class.data_tag(),
        (data.len() * class.width()) as u32,
    )?;
    match data {
        NumericData::F64(v) => v.iter().try_for_each(|&x| sink.write_f64(x))?,
        NumericData::F32(v) => v.iter().try_for_each(|&x| sink.write_f32(x))?,
        NumericData::I8(v) => v.iter().try_for_each(|&x| sink.write_i8(x))?,
        NumericData::U8(v) => v.iter().try_for_each(|&x| sink.write_u8(x))?,
        NumericData::I16(v) => v.iter().try_for_each(|&x| sink.write_i16(x))?,
        NumericData::U16(v) => v.iter().try_for_each(|&x| sink.write_u16(x))?,
        NumericData::I32(v) => v.iter().try_for_each(|&x| sink.write_i32(x))?,
        NumericData::U32(v) => v.iter().try_for_each(|&x| sink.write_u32(x))?,
        NumericData::I64(v) => v.iter().try_for_each(|&x| sink.write_i64(x))?,
        NumericData::U64(v) => v.iter().try_for_each(|&x| sink.write_u64(x))?,
    }
    sink.align8()
}

fn write_sparse(sink: &mut dyn ByteSink, s: &SparseArray) -> Result<()> {
    write_sub_header(sink, ElementTag::Int32, 4 * s.row_indices.len() as u32)?;
    for &r in &s.row_indices {
        sink.write_i32(r)?;
    }
    sink.align8()?;

    write_sub_header(sink, ElementTag::Int32, 4 * s.col_ptrs.len() as u32)?;
    for &c in &s.col_ptrs {
        sink.write_i32(c)?;
    }
    sink.align8()?;

    if s.logical {
        write_sub_header(sink, ElementTag::UInt8, s.nnz() as u32)?;
        for &v in &s.values {
            sink.write_u8(u8::from(v != 0.0))?;
        }
    } else {
        write_sub_header(sink, ElementTag::Double, 8 * s.nnz() as u32)?;
        for &v in &s.values {
            sink.write_f64(v)?;
        }
    }
    sink.align8()?;

    if let Some(imag) = &s.imag {
        write_sub_header(sink, ElementTag::Double, 8 * imag.len() as u32)?;
        for &v in imag {
            sink.write_f64(v)?;
        }
        sink.align8()?;
    }
    Ok(())
}

fn write_struct_body(sink: &mut dyn ByteSink, s: &StructArray) -> Result<()> {
    let maxlen = field_name_span(s);
    write_sub_header(sink, ElementTag::Int32, 4)?;
    sink.write_i32(maxlen as i32)?;
    sink.align8()?;

    write_sub_header(sink, ElementTag::Int8, (s.num_fields() * maxlen) as u32)?;
    for name in s.field_names() {
        sink.write_bytes(name.as_bytes())?;
        for _ in name.len()..maxlen {
            sink.write_u8(0)?;
        }
    }
    sink.align8()?;

    for index in 0..s.num_elements() {
        for name in s.field_names() {
            let value = s
                .get(index, name)
                .ok_or_else(|| MatError::bounds(format!("missing field {name:?}")))?;
            write_element("", value, sink)?;
        }
    }
    Ok(())
}

fn write_char(sink: &mut dyn ByteSink, c: &CharArray) -> Result<()> {
    let len = encoded_char_len(c)? as u32;
    match c.encoding {
        CharEncoding::Ascii => {
            write_sub_header(sink, ElementTag::UInt8, len)?;
            for &ch in &c.data {
                sink.write_u8(ch as u8)?;
            }
        }
        CharEncoding::Utf8 => {
            write_sub_header(sink, ElementTag::Utf8, len)?;
            let mut scratch = [0u8; 4];
            for &ch in &c.data {
                sink.write_bytes(ch.encode_utf8(&mut scratch).as_bytes())?;
            }
        }
        CharEncoding::Utf16 => {
            write_sub_header(sink, ElementTag::Utf16, len)?;
            for &ch in &c.data {
                sink.write_u16(ch as u16)?;
            }
        }
        CharEncoding::Utf32 => {
            write_sub_header(sink, ElementTag::Utf32, len)?;
            for &ch in &c.data {
                sink.write_u32(ch as u32)?;
            }
        }
    }
    sink.align8()
}

// --- READ SIDE ---

/// One decoded sub-element: its tag and raw payload bytes.
fn read_sub<'a>(src: &mut SliceSource<'a>) -> Result<(ElementTag, &'a [u8])> {
    let word = src.read_u32()?;
    if word >> 16 != 0 {
        // Packed small-element form: type in the low half-word, length in
        // the high half-word, payload in the next four bytes.
        let tag = ElementTag::from_u32(word & 0xFFFF)?;
        let len = (word >> 16) as usize;
        if len > 4 {
            return Err(MatError::format(format!(
                "small element declares {len} payload bytes"
            )));
        }
        let payload = src.take(4)?;
        Ok((tag, &payload[..len]))
    } else {
        let tag = ElementTag::from_u32(word)?;
        let len = src.read_u32()? as usize;
        let payload = src.take(len)?;
        src.align8()?;
        Ok((tag, payload))
    }
}

fn expect_sub<'a>(
    src: &mut SliceSource<'a>,
    wanted: &[ElementTag],
    what: &str,
) -> Result<(ElementTag, &'a [u8])> {
    let (tag, payload) = read_sub(src)?;
    if !wanted.contains(&tag) {
        return Err(MatError::format(format!(
            "{what}: unexpected sub-element tag {tag:?}"
        )));
    }
    Ok((tag, payload))
}

fn payload_u32s(payload: &[u8], order: ByteOrder) -> Result<Vec<u32>> {
    if payload.len() % 4 != 0 {
        return Err(MatError::format("u32 payload length not a multiple of 4"));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| {
            let raw = [c[0], c[1], c[2], c[3]];
            match order {
                ByteOrder::Little => u32::from_le_bytes(raw),
                ByteOrder::Big => u32::from_be_bytes(raw),
            }
        })
        .collect())
}

fn payload_i32s(payload: &[u8], order: ByteOrder) -> Result<Vec<i32>> {
    Ok(payload_u32s(payload, order)?
        .into_iter()
        .map(|w| w as i32)
        .collect())
}

fn payload_string(payload: &[u8]) -> Result<String> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| MatError::format("string sub-element is not valid UTF-8"))
}

/// Decodes a numeric payload of wire type `tag` into the storage class the
/// array declares, widening or narrowing value-by-value.
///
/// Writers routinely store e.g. double arrays as the smallest lossless
/// integer type; the declared class, not the data tag, decides storage.
fn decode_numeric_as(
    class: NumericClass,
    tag: ElementTag,
    payload: &[u8],
    order: ByteOrder,
) -> Result<NumericData> {
    macro_rules! gather {
        ($ty:ty, $width:expr) => {{
            if payload.len() % $width != 0 {
                return Err(MatError::format(format!(
                    "{:?} payload length {} not a multiple of {}",
                    tag,
                    payload.len(),
                    $width
                )));
            }
            payload
                .chunks_exact($width)
                .map(|c| {
                    let mut raw = [0u8; $width];
                    raw.copy_from_slice(c);
                    match order {
                        ByteOrder::Little => <$ty>::from_le_bytes(raw),
                        ByteOrder::Big => <$ty>::from_be_bytes(raw),
                    }
                })
                .collect::<Vec<$ty>>()
        }};
    }
    macro_rules! convert {
        ($src:expr) => {{
            let src = $src;
            match class {
                NumericClass::Double => NumericData::F64(src.iter().map(|&v| v as f64).collect()),
                NumericClass::Single => NumericData::F32(src.iter().map(|&v| v as f32).collect()),
                NumericClass::Int8 => NumericData::I8(src.iter().map(|&v| v as i8).collect()),
                NumericClass::UInt8 => NumericData::U8(src.iter().map(|&v| v as u8).collect()),
                NumericClass::Int16 => NumericData::I16(src.iter().map(|&v| v as i16).collect()),
                NumericClass::UInt16 => NumericData::U16(src.iter().map(|&v| v as u16).collect()),
                NumericClass::Int32 => NumericData::I32(src.iter().map(|&v| v as i32).collect()),
                NumericClass::UInt32 => NumericData::U32(src.iter().map(|&v| v as u32).collect()),
                NumericClass::Int64 => NumericData::I64(src.iter().map(|&v| v as i64).collect()),
                NumericClass::UInt64 => NumericData::U64(src.iter().map(|&v| v as u64).collect()),
            }
        }};
    }
    Ok(match tag {
        ElementTag::Int8 => convert!(gather!(i8, 1)),
        ElementTag::UInt8 => convert!(gather!(u8, 1)),
        ElementTag::Int16 => convert!(gather!(i16, 2)),
        ElementTag::UInt16 => convert!(gather!(u16, 2)),
        ElementTag::Int32 => convert!(gather!(i32, 4)),
        ElementTag::UInt32 => convert!(gather!(u32, 4)),
        ElementTag::Single => convert!(gather!(f32, 4)),
        ElementTag::Double => convert!(gather!(f64, 8)),
        ElementTag::Int64 => convert!(gather!(i64, 8)),
        ElementTag::UInt64 => convert!(gather!(u64, 8)),
        other => {
            return Err(MatError::format(format!(
                "{other:?} is not a numeric data tag"
            )));
        }
    })
}

/// Decodes one array element from the source.
///
/// Embedded subsystem references are registered with `registry` and left as
/// placeholders; the reader patches them after the subsystem resolves.
/// An unrecognized element or class kind fails the parse — nothing is
/// skipped.
pub fn read_element(
    src: &mut SliceSource<'_>,
    registry: &ReferenceRegistry,
) -> Result<(String, MatArray)> {
    let order = src.order();
    let tag = ElementTag::from_u32(src.read_u32()?)?;
    if tag != ElementTag::Matrix {
        return Err(MatError::format(format!(
            "expected a matrix element, found {tag:?}"
        )));
    }
    let num_bytes = u64::from(src.read_u32()?);
    let end = src.position() + num_bytes;

    let (_, flags_payload) = expect_sub(src, &[ElementTag::UInt32], "array flags")?;
    let flag_words = payload_u32s(flags_payload, order)?;
    if flag_words.len() != 2 {
        return Err(MatError::format("array flags must hold two words"));
    }
    let flags = ArrayFlags::from_u32(flag_words[0]);
    let nz_max = flag_words[1];
    let class = flags.class()?;

    let result = if class == ClassId::Opaque {
        read_opaque(src, registry, &flags)
    } else {
        read_standard(src, registry, order, class, &flags, nz_max)
    };
    // Shape mismatches coming out of the byte stream are malformed input,
    // not caller bugs.
    let (name, array) = result.map_err(|e| match e {
        MatError::Bounds(msg) => MatError::Format(msg),
        other => other,
    })?;

    if src.position() != end {
        return Err(MatError::format(format!(
            "element {name:?} declared {num_bytes} body bytes but decoding consumed {}",
            src.position() + num_bytes - end
        )));
    }
    Ok((name, array.with_global(flags.is_global())))
}

fn read_opaque(
    src: &mut SliceSource<'_>,
    registry: &ReferenceRegistry,
    _flags: &ArrayFlags,
) -> Result<(String, MatArray)> {
    let order = src.order();
    let (_, name_payload) = expect_sub(src, &[ElementTag::Int8, ElementTag::UInt8], "name")?;
    let name = payload_string(name_payload)?;
    let (_, type_payload) =
        expect_sub(src, &[ElementTag::Int8, ElementTag::UInt8], "object type")?;
    let object_type = payload_string(type_payload)?;
    let (_, class_payload) =
        expect_sub(src, &[ElementTag::Int8, ElementTag::UInt8], "class name")?;
    let class_name = payload_string(class_payload)?;
    let (_, content) = read_element(src, registry)?;

    if object_type == MCOS_TYPE {
        if let ArrayKind::Numeric(n) = content.kind() {
            if let NumericData::U32(words) = &n.real {
                if let Some(meta) = ReferenceMeta::decode(words)? {
                    let link = ObjectLink::unbound();
                    registry.register(&link);
                    let array = MatArray::new(
                        Dims::new(meta.dims)?,
                        ArrayKind::Opaque(OpaqueArray {
                            object_type,
                            class_name,
                            content: OpaqueContent::Reference(ObjectRef {
                                class_index: meta.class_index,
                                object_indices: meta.object_indices,
                                link,
                            }),
                        }),
                    )?;
                    return Ok((name, array));
                }
            }
        }
        // Fall through for u32 data without the reference magic, but note
        // the decode above already rejected magic-with-bad-shape.
    }
    let array = MatArray::new(
        Dims::matrix(1, 1),
        ArrayKind::Opaque(OpaqueArray {
            object_type,
            class_name,
            content: OpaqueContent::Raw(Box::new(content)),
        }),
    )?;
    Ok((name, array))
}

fn read_standard(
    src: &mut SliceSource<'_>,
    registry: &ReferenceRegistry,
    order: ByteOrder,
    class: ClassId,
    flags: &ArrayFlags,
    _nz_max: u32,
) -> Result<(String, MatArray)> {
    let (_, dims_payload) = expect_sub(src, &[ElementTag::Int32], "dimensions")?;
    let dim_values = payload_i32s(dims_payload, order)?;
    if dim_values.len() < 2 {
        return Err(MatError::format(format!(
            "dimension sub-element holds {} entries, need at least 2",
            dim_values.len()
        )));
    }
    let dims = Dims::new(dim_values)?;
    let count = dims.element_count();

    let (_, name_payload) = expect_sub(src, &[ElementTag::Int8, ElementTag::UInt8], "name")?;
    let name = payload_string(name_payload)?;

    let kind = match class {
        ClassId::Cell => {
            let mut elements = Vec::with_capacity(count);
            for _ in 0..count {
                let (child_name, child) = read_element(src, registry)?;
                if !child_name.is_empty() {
                    return Err(MatError::format("cell contents must be unnamed"));
                }
                elements.push(child);
            }
            return finish_cell(name, dims, elements);
        }
        ClassId::Struct => {
            let body = read_struct_body(src, registry, count)?;
            ArrayKind::Struct(body)
        }
        ClassId::Object => {
            let (_, class_payload) =
                expect_sub(src, &[ElementTag::Int8, ElementTag::UInt8], "class name")?;
            let class_name = payload_string(class_payload)?;
            let body = read_struct_body(src, registry, count)?;
            ArrayKind::ObjectStruct(ObjectStructArray { class_name, body })
        }
        ClassId::Char => {
            let (tag, payload) = read_sub(src)?;
            let (data, encoding) = decode_chars(tag, payload, order)?;
            if data.len() != count {
                return Err(MatError::format(format!(
                    "char data holds {} characters for {count} slots",
                    data.len()
                )));
            }
            ArrayKind::Char(CharArray { data, encoding })
        }
        ClassId::Sparse => {
            let (_, row_payload) = expect_sub(src, &[ElementTag::Int32], "row indices")?;
            let row_indices = payload_i32s(row_payload, order)?;
            let (_, col_payload) = expect_sub(src, &[ElementTag::Int32], "column pointers")?;
            let col_ptrs = payload_i32s(col_payload, order)?;
            let (vtag, v_payload) = read_sub(src)?;
            let values = match decode_numeric_as(NumericClass::Double, vtag, v_payload, order)? {
                NumericData::F64(v) => v,
                _ => unreachable!(),
            };
            let imag = if flags.is_complex() {
                let (itag, i_payload) = read_sub(src)?;
                match decode_numeric_as(NumericClass::Double, itag, i_payload, order)? {
                    NumericData::F64(v) => Some(v),
                    _ => unreachable!(),
                }
            } else {
                None
            };
            ArrayKind::Sparse(SparseArray {
                logical: flags.is_logical(),
                row_indices,
                col_ptrs,
                values,
                imag,
            })
        }
        numeric => {
            let class = NumericClass::from_class_id(numeric)?;
            let (rtag, r_payload) = read_sub(src)?;
            let real = decode_numeric_as(class, rtag, r_payload, order)?;
            if real.len() != count {
                return Err(MatError::format(format!(
                    "data holds {} values for {count} slots",
                    real.len()
                )));
            }
            let imag = if flags.is_complex() {
                let (itag, i_payload) = read_sub(src)?;
                let imag = decode_numeric_as(class, itag, i_payload, order)?;
                if imag.len() != count {
                    return Err(MatError::format("imaginary part mismatches element count"));
                }
                Some(imag)
            } else {
                None
            };
            ArrayKind::Numeric(NumericArray {
                logical: flags.is_logical(),
                real,
                imag,
            })
        }
    };
    Ok((name, MatArray::new(dims, kind)?))
}

fn finish_cell(name: String, dims: Dims, elements: Vec<MatArray>) -> Result<(String, MatArray)> {
    Ok((name, MatArray::cell(dims, elements)?))
}

fn read_struct_body(
    src: &mut SliceSource<'_>,
    registry: &ReferenceRegistry,
    count: usize,
) -> Result<StructArray> {
    let order = src.order();
    let (_, span_payload) = expect_sub(src, &[ElementTag::Int32], "field name length")?;
    let spans = payload_i32s(span_payload, order)?;
    let span = *spans
        .first()
        .ok_or_else(|| MatError::format("field name length sub-element is empty"))?
        as usize;
    if span == 0 {
        return Err(MatError::format("field name length must be positive"));
    }

    let (_, names_payload) = expect_sub(src, &[ElementTag::Int8, ElementTag::UInt8], "field names")?;
    if names_payload.len() % span != 0 {
        return Err(MatError::format(format!(
            "field names payload {} not divisible by span {span}",
            names_payload.len()
        )));
    }
    let mut fields = Vec::new();
    for raw in names_payload.chunks_exact(span) {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(span);
        fields.push(payload_string(&raw[..end])?);
    }

    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        let mut values = Vec::with_capacity(fields.len());
        for _ in &fields {
            let (child_name, child) = read_element(src, registry)?;
            if !child_name.is_empty() {
                return Err(MatError::format("struct field values must be unnamed"));
            }
            values.push(child);
        }
        elements.push(values);
    }
    StructArray::new(fields, elements)
}

fn decode_chars(
    tag: ElementTag,
    payload: &[u8],
    order: ByteOrder,
) -> Result<(Vec<char>, CharEncoding)> {
    let units_u16 = |payload: &[u8]| -> Result<Vec<u16>> {
        if payload.len() % 2 != 0 {
            return Err(MatError::format("utf16 payload length is odd"));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|c| {
                let raw = [c[0], c[1]];
                match order {
                    ByteOrder::Little => u16::from_le_bytes(raw),
                    ByteOrder::Big => u16::from_be_bytes(raw),
                }
            })
            .collect())
    };
    Ok(match tag {
        ElementTag::Int8 | ElementTag::UInt8 => (
            payload.iter().map(|&b| b as char).collect(),
            CharEncoding::Ascii,
        ),
        ElementTag::Utf8 => (
            std::str::from_utf8(payload)
                .map_err(|_| MatError::format("char data is not valid UTF-8"))?
                .chars()
                .collect(),
            CharEncoding::Utf8,
        ),
        // MATLAB's own writer stores text as plain u16 units; both forms
        // decode as one BMP character per grid slot.
        ElementTag::Utf16 | ElementTag::UInt16 => {
            let mut chars = Vec::new();
            for unit in units_u16(payload)? {
                let ch = char::from_u32(u32::from(unit)).ok_or_else(|| {
                    MatError::format(format!("utf16 unit 0x{unit:04x} is an unpaired surrogate"))
                })?;
                chars.push(ch);
            }
            (chars, CharEncoding::Utf16)
        }
        ElementTag::Utf32 => {
            let words = payload_u32s(payload, order)?;
            let mut chars = Vec::with_capacity(words.len());
            for word in words {
                chars.push(char::from_u32(word).ok_or_else(|| {
                    MatError::format(format!("utf32 word 0x{word:08x} is not a character"))
                })?);
            }
            (chars, CharEncoding::Utf32)
        }
        other => {
            return Err(MatError::format(format!(
                "{other:?} is not a character data tag"
            )));
        }
    })
}
