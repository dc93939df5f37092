//! The deflate compression envelope.
//!
//! A compressed element is an outer tag carrying the compressed byte count,
//! followed by a zlib stream whose plain text is exactly one ordinary
//! element. Level 0 skips the envelope entirely and emits the element raw;
//! levels 1 through 9 trade time for ratio.
//!
//! Reading inflates exactly the declared span and then checks that the
//! inner element consumed every decompressed byte — a mismatch means the
//! stream was truncated or corrupt, and nothing is handed to the container.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::array::MatArray;
use crate::bytes::{ByteSink, ByteSource, SliceSource, VecSink};
use crate::element;
use crate::error::{MatError, Result};
use crate::format::{ElementTag, TAG_SIZE, pad8};
use crate::subsys::ReferenceRegistry;

/// Compression policy for one write pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionEnvelope {
    level: u32,
}

impl CompressionEnvelope {
    /// An envelope at deflate level `level`; 0 disables compression.
    pub fn new(level: u32) -> Result<Self> {
        if level > 9 {
            return Err(MatError::bounds(format!(
                "deflate level {level} outside 0..=9"
            )));
        }
        Ok(Self { level })
    }

    /// No compression: elements are emitted raw.
    pub fn none() -> Self {
        Self { level: 0 }
    }

    /// The fastest compressing level.
    pub fn best_speed() -> Self {
        Self { level: 1 }
    }

    /// The densest level.
    pub fn best_size() -> Self {
        Self { level: 9 }
    }

    /// The configured level.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Upper bound on the encoded size of an element whose raw serialized
    /// size is `raw`; used to size scratch buffers before compressing.
    ///
    /// Deflate can expand incompressible input by a few bytes per block
    /// plus the zlib wrapper; the slack here stays safely above that.
    pub fn max_encoded_size(&self, raw: u64) -> u64 {
        if self.level == 0 {
            raw
        } else {
            TAG_SIZE + pad8(raw + (raw >> 9) + 64)
        }
    }

    /// Serializes `array` under `name` into `sink`, compressed per level.
    pub fn write(&self, name: &str, array: &MatArray, sink: &mut dyn ByteSink) -> Result<()> {
        if self.level == 0 {
            return element::write_element(name, array, sink);
        }
        let mut raw = VecSink::with_capacity(
            sink.order(),
            element::compute_size(name, array)? as usize,
        );
        element::write_element(name, array, &mut raw)?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(raw.as_slice())?;
        let compressed = encoder.finish()?;

        sink.write_u32(ElementTag::Compressed as u32)?;
        sink.write_u32(compressed.len() as u32)?;
        sink.write_bytes(&compressed)?;
        sink.align8()
    }
}

/// Decodes the next root element, unwrapping a compression envelope when
/// one is present.
pub fn read_enveloped(
    src: &mut SliceSource<'_>,
    registry: &ReferenceRegistry,
) -> Result<(String, MatArray)> {
    let tag = ElementTag::from_u32(src.peek_u32()?)?;
    match tag {
        ElementTag::Compressed => {
            src.skip(4)?;
            let declared = src.read_u32()? as usize;
            let compressed = src.take(declared)?;
            src.align8()?;
            let inflated = inflate(compressed)?;
            let mut inner = SliceSource::new(&inflated, src.order());
            let result = element::read_element(&mut inner, registry)?;
            if inner.remaining() != 0 {
                return Err(MatError::format(format!(
                    "decompressed element left {} unconsumed bytes",
                    inner.remaining()
                )));
            }
            Ok(result)
        }
        ElementTag::Matrix => element::read_element(src, registry),
        other => Err(MatError::format(format!(
            "expected a matrix or compressed element at top level, found {other:?}"
        ))),
    }
}

fn inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(compressed)
        .read_to_end(&mut out)
        .map_err(|e| MatError::format(format!("corrupt compressed stream: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Dims;
    use crate::format::ByteOrder;

    fn sample() -> MatArray {
        MatArray::double(Dims::matrix(4, 4), (0..16).map(f64::from).collect()).unwrap()
    }

    #[test]
    fn level_zero_is_the_raw_element() {
        let array = sample();
        let mut plain = VecSink::new(ByteOrder::Little);
        element::write_element("a", &array, &mut plain).unwrap();
        let mut wrapped = VecSink::new(ByteOrder::Little);
        CompressionEnvelope::none()
            .write("a", &array, &mut wrapped)
            .unwrap();
        assert_eq!(plain.as_slice(), wrapped.as_slice());
    }

    #[test]
    fn envelope_round_trip_at_max_level() {
        let array = sample();
        let mut sink = VecSink::new(ByteOrder::Little);
        CompressionEnvelope::best_size()
            .write("a", &array, &mut sink)
            .unwrap();
        let bytes = sink.into_bytes();
        assert_eq!(bytes.len() % 8, 0);
        let mut src = SliceSource::new(&bytes, ByteOrder::Little);
        let (name, out) = read_enveloped(&mut src, &ReferenceRegistry::new()).unwrap();
        assert_eq!(name, "a");
        assert_eq!(out, array);
        assert_eq!(src.remaining(), 0);
    }

    #[test]
    fn truncated_stream_is_a_format_error() {
        let array = sample();
        let mut sink = VecSink::new(ByteOrder::Little);
        CompressionEnvelope::best_speed()
            .write("a", &array, &mut sink)
            .unwrap();
        let mut bytes = sink.into_bytes();
        // Clip into the compressed payload and fix up the declared length.
        bytes.truncate(24);
        let clipped = (bytes.len() - 8) as u32;
        bytes[4..8].copy_from_slice(&clipped.to_le_bytes());
        let mut src = SliceSource::new(&bytes, ByteOrder::Little);
        assert!(matches!(
            read_enveloped(&mut src, &ReferenceRegistry::new()),
            Err(MatError::Format(_))
        ));
    }

    #[test]
    fn rejected_levels() {
        assert!(CompressionEnvelope::new(10).is_err());
        assert!(CompressionEnvelope::new(9).is_ok());
    }

    #[test]
    fn max_encoded_size_covers_incompressible_input() {
        let env = CompressionEnvelope::best_speed();
        for raw in [0u64, 1, 100, 4096, 1 << 20] {
            assert!(env.max_encoded_size(raw) >= raw + 8);
        }
    }
}
