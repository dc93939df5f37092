//! The sequential write-side engine.
//!
//! Serializes a container entry by entry in file order, one compression
//! envelope per root element. The streaming form leaves the header's
//! subsystem-offset field zeroed (readers locate the subsystem
//! positionally); the file form patches the field once the offset is known.
//!
//! The concurrent variant in [`crate::pipeline`] produces byte-identical
//! output for the same container and envelope.

use std::path::Path;

use log::debug;

use crate::array::ArrayKind;
use crate::bytes::{ByteSink, VecSink};
use crate::compression::CompressionEnvelope;
use crate::container::MatFile;
use crate::error::Result;
use crate::format::{ByteOrder, FileHeader, SUBSYS_OFFSET_POS};

/// Sequential writer for whole containers.
#[derive(Debug, Clone, Copy)]
pub struct MatWriter {
    envelope: CompressionEnvelope,
}

impl MatWriter {
    /// A writer compressing every root element with `envelope`.
    pub fn new(envelope: CompressionEnvelope) -> Self {
        Self { envelope }
    }

    /// Serializes the container to bytes, header included.
    ///
    /// The subsystem-offset field stays zero so the result is identical to
    /// what the streaming pipeline emits.
    pub fn write(&self, file: &MatFile) -> Result<Vec<u8>> {
        Ok(self.write_inner(file)?.0)
    }

    /// Serializes the container to `path`, back-patching the header's
    /// subsystem-offset field when a subsystem is present.
    pub fn write_file<P: AsRef<Path>>(&self, file: &MatFile, path: P) -> Result<()> {
        let (mut bytes, subsys_offset) = self.write_inner(file)?;
        if let Some(offset) = subsys_offset {
            bytes[SUBSYS_OFFSET_POS..SUBSYS_OFFSET_POS + 8]
                .copy_from_slice(&offset.to_le_bytes());
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn write_inner(&self, file: &MatFile) -> Result<(Vec<u8>, Option<u64>)> {
        let mut sink = VecSink::new(ByteOrder::Little);
        sink.write_bytes(&FileHeader::new().to_bytes())?;
        let mut subsys_offset = None;
        for entry in file.entries() {
            if matches!(entry.array.kind(), ArrayKind::Subsystem(_)) {
                subsys_offset = Some(sink.position());
            }
            self.envelope.write(&entry.name, &entry.array, &mut sink)?;
        }
        debug!(
            "wrote {} entries, {} bytes, deflate level {}",
            file.len(),
            sink.position(),
            self.envelope.level()
        );
        Ok((sink.into_bytes(), subsys_offset))
    }
}

impl Default for MatWriter {
    fn default() -> Self {
        Self::new(CompressionEnvelope::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{Dims, MatArray};
    use crate::format::{FileHeader, HEADER_SIZE};

    #[test]
    fn output_starts_with_a_valid_header() {
        let mut file = MatFile::new();
        file.insert(
            "x",
            MatArray::double(Dims::matrix(1, 1), vec![2.5]).unwrap(),
        )
        .unwrap();
        let bytes = MatWriter::default().write(&file).unwrap();
        assert!(bytes.len() > HEADER_SIZE);
        let header = FileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.subsys_offset, 0);
        assert_eq!(bytes.len() % 8, 0);
    }

    #[test]
    fn empty_container_is_just_the_header() {
        let bytes = MatWriter::default().write(&MatFile::new()).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
    }
}
