//! The five-segment metadata buffer of the object subsystem.
//!
//! One flat buffer, in file byte order, walked by a linear state machine:
//!
//! ```text
//! Header → Strings → Classes → Properties(A) → Objects → Properties(B)
//!        → Reserved → Done
//! ```
//!
//! The header carries a version word, the string count and six segment
//! boundary offsets. Boundaries must be non-decreasing and the last must
//! equal the buffer length. Reserved fields and inter-segment padding must
//! be zero; anything else means corruption or an unmodeled feature and
//! fails the parse rather than being guessed at.

use log::trace;

use crate::bytes::{ByteSink, ByteSource, SliceSource, VecSink};
use crate::error::{MatError, Result};
use crate::format::ByteOrder;

/// Required version word of the metadata header.
pub const META_VERSION: u32 = 4;

/// Byte length of the fixed metadata header.
pub const META_HEADER_SIZE: usize = 32;

/// Number of 24-byte reserved bytes leading the objects segment.
const OBJECTS_LEAD_ZEROS: usize = 24;

/// One class record: package and class name, both string-heap indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClassRecord {
    /// String-heap index of the package name; 0 for none.
    pub package_name_index: u32,
    /// String-heap index of the class name.
    pub class_name_index: u32,
}

/// One property record inside a property list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyRecord {
    /// String-heap index of the property name.
    pub name_index: u32,
    /// Interpretation selector for `heap_index`.
    pub flag: u32,
    /// String-heap index, cell-heap index, or inline boolean payload.
    pub heap_index: u32,
}

/// Property value is the string-heap entry named by `heap_index`.
pub const PROP_FLAG_STRING: u32 = 0;
/// Property value lives in the file-wrapper cell heap.
pub const PROP_FLAG_CELL_HEAP: u32 = 1;
/// Property value is the boolean `heap_index != 0`.
pub const PROP_FLAG_BOOL: u32 = 2;

/// One object record.
///
/// `object_id` is recorded by writers but is not reliable as a resolution
/// key; objects are addressed by record position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectRecord {
    /// 1-based class record index.
    pub class_id: u32,
    /// 1-based index into the Properties(A) lists; 0 for none.
    pub props_a: u32,
    /// 1-based index into the Properties(B) lists; 0 for none.
    pub props_b: u32,
    /// Writer-assigned id, observed but unused for resolution.
    pub object_id: u32,
}

/// The decoded metadata buffer.
///
/// Strings, classes and objects are stored 1-indexed with a sentinel at
/// index 0 meaning "no entry", mirroring how the records reference them.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsystemMeta {
    /// String heap; `strings[0]` is the empty string.
    pub strings: Vec<String>,
    /// Class records; `classes[0]` is an all-zero sentinel.
    pub classes: Vec<ClassRecord>,
    /// Property lists from the first property segment, in record order.
    pub props_a: Vec<Vec<PropertyRecord>>,
    /// Object records; `objects[0]` is an all-zero sentinel.
    pub objects: Vec<ObjectRecord>,
    /// Property lists from the second property segment, in record order.
    pub props_b: Vec<Vec<PropertyRecord>>,
}

impl SubsystemMeta {
    /// Looks up a 1-indexed heap string; index 0 is the empty string.
    pub fn string(&self, index: u32) -> Result<&str> {
        self.strings
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| MatError::format(format!("string index {index} out of heap range")))
    }

    /// Number of real (non-sentinel) classes.
    pub fn num_classes(&self) -> usize {
        self.classes.len() - 1
    }

    /// Number of real (non-sentinel) objects.
    pub fn num_objects(&self) -> usize {
        self.objects.len() - 1
    }
}

/// Parser for the five-segment metadata buffer.
#[derive(Debug)]
pub struct SegmentParser;

/// Phases of the segment state machine, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Strings,
    Classes,
    PropertiesA,
    Objects,
    PropertiesB,
    Reserved,
}

impl SegmentParser {
    /// Decodes `buf` into structured records, enforcing every guard.
    pub fn parse(buf: &[u8], order: ByteOrder) -> Result<SubsystemMeta> {
        let mut src = SliceSource::new(buf, order);
        let (num_strings, bounds) = Self::parse_header(&mut src, buf.len())?;

        let mut segment = Segment::Strings;
        trace!("subsystem metadata: entering {segment:?}");
        let strings = Self::parse_strings(&mut src, num_strings, bounds[0])?;

        segment = Segment::Classes;
        trace!("subsystem metadata: entering {segment:?}");
        let classes = Self::parse_classes(&mut src, bounds[1])?;

        segment = Segment::PropertiesA;
        trace!("subsystem metadata: entering {segment:?}");
        let props_a = Self::parse_properties(&mut src, bounds[2])?;

        segment = Segment::Objects;
        trace!("subsystem metadata: entering {segment:?}");
        let objects = Self::parse_objects(&mut src, bounds[3])?;

        segment = Segment::PropertiesB;
        trace!("subsystem metadata: entering {segment:?}");
        let props_b = Self::parse_properties(&mut src, bounds[4])?;

        segment = Segment::Reserved;
        trace!("subsystem metadata: entering {segment:?}");
        if bounds[4] != bounds[5] {
            return Err(MatError::format(format!(
                "reserved segment holds {} bytes; populated reserved data is unsupported",
                bounds[5] - bounds[4]
            )));
        }

        Ok(SubsystemMeta {
            strings,
            classes,
            props_a,
            objects,
            props_b,
        })
    }

    fn parse_header(src: &mut SliceSource<'_>, buf_len: usize) -> Result<(u32, [u64; 6])> {
        if buf_len < META_HEADER_SIZE {
            return Err(MatError::format("metadata buffer smaller than its header"));
        }
        let version = src.read_u32()?;
        if version != META_VERSION {
            return Err(MatError::format(format!(
                "unsupported subsystem metadata version {version}"
            )));
        }
        let num_strings = src.read_u32()?;
        let mut bounds = [0u64; 6];
        for slot in &mut bounds {
            *slot = u64::from(src.read_u32()?);
        }
        let mut prev = META_HEADER_SIZE as u64;
        for (i, &bound) in bounds.iter().enumerate() {
            if bound < prev {
                return Err(MatError::format(format!(
                    "segment boundary {i} ({bound}) precedes offset {prev}"
                )));
            }
            prev = bound;
        }
        if bounds[5] != buf_len as u64 {
            return Err(MatError::format(format!(
                "final segment boundary {} does not match buffer length {buf_len}",
                bounds[5]
            )));
        }
        Ok((num_strings, bounds))
    }

    fn parse_strings(
        src: &mut SliceSource<'_>,
        num_strings: u32,
        end: u64,
    ) -> Result<Vec<String>> {
        let mut strings = Vec::with_capacity(num_strings as usize + 1);
        strings.push(String::new());
        for i in 0..num_strings {
            let mut bytes = Vec::new();
            loop {
                if src.position() >= end {
                    return Err(MatError::format(format!(
                        "string {i} runs past the strings boundary"
                    )));
                }
                match src.read_u8()? {
                    0 => break,
                    b => bytes.push(b),
                }
            }
            let s = String::from_utf8(bytes)
                .map_err(|_| MatError::format(format!("string {i} is not valid UTF-8")))?;
            strings.push(s);
        }
        Self::check_zero_padding(src, end, "strings")?;
        Ok(strings)
    }

    fn parse_classes(src: &mut SliceSource<'_>, end: u64) -> Result<Vec<ClassRecord>> {
        let mut classes = vec![ClassRecord::default()];
        while src.position() < end {
            let package_name_index = src.read_u32()?;
            let class_name_index = src.read_u32()?;
            let reserved = src.read_u64()?;
            if reserved != 0 {
                return Err(MatError::format(format!(
                    "class record {}: non-zero reserved field 0x{reserved:x}",
                    classes.len()
                )));
            }
            classes.push(ClassRecord {
                package_name_index,
                class_name_index,
            });
        }
        if src.position() != end {
            return Err(MatError::format("class records overrun their boundary"));
        }
        Ok(classes)
    }

    fn parse_properties(src: &mut SliceSource<'_>, end: u64) -> Result<Vec<Vec<PropertyRecord>>> {
        let mut lists = Vec::new();
        // Empty segment when the boundaries coincide.
        while src.position() < end {
            let count = src.read_u32()?;
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name_index = src.read_u32()?;
                let flag = src.read_u32()?;
                let heap_index = src.read_u32()?;
                if flag > PROP_FLAG_BOOL {
                    return Err(MatError::format(format!(
                        "property flag {flag} is not a known interpretation"
                    )));
                }
                records.push(PropertyRecord {
                    name_index,
                    flag,
                    heap_index,
                });
            }
            // Records are padded so each list spans an even number of words.
            if (1 + 3 * count as u64) % 2 == 1 {
                let pad = src.read_u32()?;
                if pad != 0 {
                    return Err(MatError::format(format!(
                        "non-zero property padding word 0x{pad:x}"
                    )));
                }
            }
            lists.push(records);
        }
        if src.position() != end {
            return Err(MatError::format("property records overrun their boundary"));
        }
        Ok(lists)
    }

    fn parse_objects(src: &mut SliceSource<'_>, end: u64) -> Result<Vec<ObjectRecord>> {
        if src.position() == end {
            return Ok(vec![ObjectRecord::default()]);
        }
        for i in 0..OBJECTS_LEAD_ZEROS {
            if src.read_u8()? != 0 {
                return Err(MatError::format(format!(
                    "objects segment: non-zero reserved byte at offset {i}"
                )));
            }
        }
        let mut objects = vec![ObjectRecord::default()];
        while src.position() < end {
            let class_id = src.read_u32()?;
            let r0 = src.read_u32()?;
            let r1 = src.read_u32()?;
            if r0 != 0 || r1 != 0 {
                return Err(MatError::format(format!(
                    "object record {}: non-zero reserved words",
                    objects.len()
                )));
            }
            let props_a = src.read_u32()?;
            let props_b = src.read_u32()?;
            let object_id = src.read_u32()?;
            objects.push(ObjectRecord {
                class_id,
                props_a,
                props_b,
                object_id,
            });
        }
        if src.position() != end {
            return Err(MatError::format("object records overrun their boundary"));
        }
        Ok(objects)
    }

    fn check_zero_padding(src: &mut SliceSource<'_>, end: u64, segment: &str) -> Result<()> {
        while src.position() < end {
            let b = src.read_u8()?;
            if b != 0 {
                return Err(MatError::format(format!(
                    "non-zero padding byte 0x{b:02x} after {segment} segment"
                )));
            }
        }
        Ok(())
    }
}

impl SubsystemMeta {
    /// Encodes these records back into a metadata buffer.
    ///
    /// Inverse of [`SegmentParser::parse`]; sentinels at index 0 are not
    /// written.
    pub fn encode(&self, order: ByteOrder) -> Result<Vec<u8>> {
        let mut strings_seg = VecSink::new(order);
        for s in &self.strings[1..] {
            strings_seg.write_bytes(s.as_bytes())?;
            strings_seg.write_u8(0)?;
        }
        strings_seg.align8()?;
        let strings_bytes = strings_seg.into_bytes();

        let mut classes_seg = VecSink::new(order);
        for class in &self.classes[1..] {
            classes_seg.write_u32(class.package_name_index)?;
            classes_seg.write_u32(class.class_name_index)?;
            classes_seg.write_u64(0)?;
        }
        let classes_bytes = classes_seg.into_bytes();

        let props_a_bytes = Self::encode_properties(&self.props_a, order)?;

        let mut objects_seg = VecSink::new(order);
        if self.objects.len() > 1 {
            objects_seg.write_bytes(&[0u8; OBJECTS_LEAD_ZEROS])?;
            for object in &self.objects[1..] {
                objects_seg.write_u32(object.class_id)?;
                objects_seg.write_u32(0)?;
                objects_seg.write_u32(0)?;
                objects_seg.write_u32(object.props_a)?;
                objects_seg.write_u32(object.props_b)?;
                objects_seg.write_u32(object.object_id)?;
            }
        }
        let objects_bytes = objects_seg.into_bytes();

        let props_b_bytes = Self::encode_properties(&self.props_b, order)?;

        let o0 = META_HEADER_SIZE as u64 + strings_bytes.len() as u64;
        let o1 = o0 + classes_bytes.len() as u64;
        let o2 = o1 + props_a_bytes.len() as u64;
        let o3 = o2 + objects_bytes.len() as u64;
        let o4 = o3 + props_b_bytes.len() as u64;
        let o5 = o4;

        let mut out = VecSink::with_capacity(order, o5 as usize);
        out.write_u32(META_VERSION)?;
        out.write_u32((self.strings.len() - 1) as u32)?;
        for bound in [o0, o1, o2, o3, o4, o5] {
            out.write_u32(bound as u32)?;
        }
        out.write_bytes(&strings_bytes)?;
        out.write_bytes(&classes_bytes)?;
        out.write_bytes(&props_a_bytes)?;
        out.write_bytes(&objects_bytes)?;
        out.write_bytes(&props_b_bytes)?;
        Ok(out.into_bytes())
    }

    fn encode_properties(lists: &[Vec<PropertyRecord>], order: ByteOrder) -> Result<Vec<u8>> {
        let mut sink = VecSink::new(order);
        for records in lists {
            sink.write_u32(records.len() as u32)?;
            for record in records {
                sink.write_u32(record.name_index)?;
                sink.write_u32(record.flag)?;
                sink.write_u32(record.heap_index)?;
            }
            if (1 + 3 * records.len() as u64) % 2 == 1 {
                sink.write_u32(0)?;
            }
        }
        Ok(sink.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> SubsystemMeta {
        SubsystemMeta {
            strings: vec![
                String::new(),
                "pkg".into(),
                "Point".into(),
                "x".into(),
                "label".into(),
                "origin".into(),
            ],
            classes: vec![
                ClassRecord::default(),
                ClassRecord {
                    package_name_index: 1,
                    class_name_index: 2,
                },
            ],
            props_a: vec![vec![
                PropertyRecord {
                    name_index: 3,
                    flag: PROP_FLAG_CELL_HEAP,
                    heap_index: 0,
                },
                PropertyRecord {
                    name_index: 4,
                    flag: PROP_FLAG_STRING,
                    heap_index: 5,
                },
            ]],
            objects: vec![
                ObjectRecord::default(),
                ObjectRecord {
                    class_id: 1,
                    props_a: 1,
                    props_b: 0,
                    object_id: 1,
                },
            ],
            props_b: vec![],
        }
    }

    #[test]
    fn encode_parse_round_trip() {
        let meta = sample_meta();
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let bytes = meta.encode(order).unwrap();
            let parsed = SegmentParser::parse(&bytes, order).unwrap();
            assert_eq!(parsed, meta);
        }
    }

    #[test]
    fn bad_version_fails() {
        let mut bytes = sample_meta().encode(ByteOrder::Little).unwrap();
        bytes[0] = 9;
        assert!(SegmentParser::parse(&bytes, ByteOrder::Little).is_err());
    }

    #[test]
    fn decreasing_boundary_fails() {
        let meta = sample_meta();
        let mut bytes = meta.encode(ByteOrder::Little).unwrap();
        // Corrupt the second boundary to precede the first.
        bytes[12..16].copy_from_slice(&1u32.to_le_bytes());
        assert!(SegmentParser::parse(&bytes, ByteOrder::Little).is_err());
    }

    #[test]
    fn truncated_final_boundary_fails() {
        let meta = sample_meta();
        let mut bytes = meta.encode(ByteOrder::Little).unwrap();
        bytes.push(0);
        assert!(SegmentParser::parse(&bytes, ByteOrder::Little).is_err());
    }

    #[test]
    fn unknown_property_flag_fails() {
        let mut meta = sample_meta();
        meta.props_a[0][0].flag = 3;
        let bytes = meta.encode(ByteOrder::Little).unwrap();
        let err = SegmentParser::parse(&bytes, ByteOrder::Little).unwrap_err();
        assert!(matches!(err, MatError::Format(_)));
    }

    #[test]
    fn non_zero_class_reserved_fails() {
        let meta = sample_meta();
        let bytes = meta.encode(ByteOrder::Little).unwrap();
        let classes_start = {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[8..12]);
            u32::from_le_bytes(raw) as usize
        };
        let mut corrupt = bytes;
        corrupt[classes_start + 8] = 1;
        assert!(SegmentParser::parse(&corrupt, ByteOrder::Little).is_err());
    }

    #[test]
    fn empty_property_segment_is_valid() {
        let mut meta = sample_meta();
        meta.props_a = vec![];
        meta.objects[1].props_a = 0;
        let bytes = meta.encode(ByteOrder::Little).unwrap();
        let parsed = SegmentParser::parse(&bytes, ByteOrder::Little).unwrap();
        assert!(parsed.props_a.is_empty());
    }
}
