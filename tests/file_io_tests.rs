//! On-disk round trips: memory-mapped reads and the back-patched
//! subsystem-offset field of the file writer.

use std::sync::Arc;

use matpar::subsys::{Subsystem, SubsystemBuilder};
use matpar::{
    BufferAllocator, CompressionEnvelope, Dims, MatArray, MatFile, MatReader, MatWriter,
    PlainAllocator,
};

#[test]
fn write_file_and_mmap_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip.mat");

    let mut file = MatFile::new();
    file.insert(
        "m",
        MatArray::double(Dims::matrix(2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
    )
    .unwrap();
    MatWriter::new(CompressionEnvelope::best_speed())
        .write_file(&file, &path)
        .unwrap();

    let back = MatReader::default().open(&path).unwrap();
    assert_eq!(back.get("m"), file.get("m"));
}

#[test]
fn file_writer_patches_subsystem_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("subsys.mat");

    let mut builder = SubsystemBuilder::new();
    let class = builder.add_class("", "Tag");
    let object = builder.add_object(class).unwrap();
    let reference = builder.reference(class, &[object]).unwrap();
    let blob = builder.finish().unwrap();

    let alloc = Arc::new(PlainAllocator::new());
    let mut file = MatFile::new();
    file.insert("t", reference).unwrap();
    file.set_subsystem(
        Subsystem::from_bytes(&blob, Arc::clone(&alloc) as Arc<dyn BufferAllocator>).unwrap(),
    );
    MatWriter::default().write_file(&file, &path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[116..124]);
    let offset = u64::from_le_bytes(raw);
    assert!(offset >= 128, "offset field should point at the subsystem");
    // The field points exactly at the subsystem element's tag.
    let streaming = MatWriter::default().write(&file).unwrap();
    assert_eq!(bytes.len(), streaming.len());
    assert_eq!(&bytes[offset as usize..], &streaming[offset as usize..]);

    let back = MatReader::default().open(&path).unwrap();
    assert!(back.has_subsystem());
}
