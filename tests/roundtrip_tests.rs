//! Whole-file round trips: every supported kind in, identical model out,
//! declared sizes matching emitted bytes at both ends of the level range.

use matpar::{
    ArrayKind, CharEncoding, CompressionEnvelope, Dims, MatArray, MatFile, MatReader, MatWriter,
    NumericData, Result, SparseBuilder,
};

fn round_trip(entries: Vec<(&str, MatArray)>, level: u32) -> Result<(MatFile, Vec<u8>)> {
    let mut file = MatFile::new();
    for (name, array) in entries {
        file.insert(name, array)?;
    }
    let bytes = MatWriter::new(CompressionEnvelope::new(level)?).write(&file)?;
    let back = MatReader::default().read_bytes(&bytes)?;
    Ok((back, bytes))
}

fn assert_identity(original: &MatArray, level: u32) {
    let (back, _) = round_trip(vec![("x", original.clone())], level).unwrap();
    assert_eq!(
        back.get("x"),
        Some(original),
        "round trip at level {level}"
    );
}

#[test]
fn dense_numeric_kinds_round_trip() {
    let arrays = vec![
        MatArray::double(Dims::matrix(2, 3), vec![1.5, -2.0, 3.25, 0.0, 5.0, -6.5]).unwrap(),
        MatArray::numeric(Dims::matrix(2, 2), NumericData::F32(vec![1.0, 2.0, 3.0, 4.0])).unwrap(),
        MatArray::numeric(Dims::matrix(1, 4), NumericData::I8(vec![-1, 0, 1, 127])).unwrap(),
        MatArray::numeric(Dims::matrix(1, 3), NumericData::U16(vec![0, 512, 65535])).unwrap(),
        MatArray::numeric(Dims::matrix(1, 2), NumericData::I64(vec![i64::MIN, i64::MAX]))
            .unwrap(),
        MatArray::numeric(Dims::matrix(1, 2), NumericData::U64(vec![0, u64::MAX])).unwrap(),
    ];
    for array in arrays {
        assert_identity(&array, 0);
        assert_identity(&array, 9);
    }
}

#[test]
fn complex_and_logical_round_trip() {
    let complex = MatArray::complex(
        Dims::matrix(2, 2),
        NumericData::F64(vec![1.0, 2.0, 3.0, 4.0]),
        NumericData::F64(vec![-1.0, -2.0, -3.0, -4.0]),
    )
    .unwrap();
    assert_identity(&complex, 0);
    assert_identity(&complex, 9);

    let logical = MatArray::logical(Dims::matrix(1, 5), vec![1, 0, 1, 1, 0]).unwrap();
    assert_identity(&logical, 0);
    assert_identity(&logical, 9);
}

#[test]
fn global_flag_survives_round_trip() {
    let mut array = MatArray::double(Dims::matrix(1, 1), vec![42.0]).unwrap();
    array.set_global(true);
    assert_identity(&array, 0);
}

#[test]
fn multi_dimensional_arrays_round_trip() {
    let array = MatArray::double(Dims::new(vec![2, 3, 2]).unwrap(), (0..12).map(f64::from).collect())
        .unwrap();
    assert_identity(&array, 0);
    assert_identity(&array, 9);
}

#[test]
fn sparse_with_and_without_nonzeros() {
    let mut builder = SparseBuilder::new(5, 6).unwrap();
    builder.push(0, 0, 1.0).unwrap();
    builder.push(4, 2, -2.5).unwrap();
    builder.push(2, 2, 8.0).unwrap();
    builder.push(1, 5, 0.25).unwrap();
    let sparse = builder.finish().unwrap();
    assert_identity(&sparse, 0);
    assert_identity(&sparse, 9);

    let empty = SparseBuilder::new(3, 3).unwrap().finish().unwrap();
    assert_identity(&empty, 0);
    assert_identity(&empty, 9);
}

#[test]
fn zero_element_arrays_round_trip() {
    assert_identity(&MatArray::empty(), 0);
    let zero_rows = MatArray::double(Dims::matrix(0, 4), vec![]).unwrap();
    assert_identity(&zero_rows, 0);
    assert_identity(&zero_rows, 9);
}

#[test]
fn nested_cell_round_trip() {
    let inner = MatArray::cell(
        Dims::matrix(1, 2),
        vec![
            MatArray::double(Dims::matrix(1, 1), vec![3.0]).unwrap(),
            MatArray::char_rows(&["ok"], CharEncoding::Utf16).unwrap(),
        ],
    )
    .unwrap();
    let outer = MatArray::cell(
        Dims::matrix(2, 1),
        vec![inner, MatArray::empty()],
    )
    .unwrap();
    assert_identity(&outer, 0);
    assert_identity(&outer, 9);
}

#[test]
fn struct_with_removed_and_readded_field_round_trips() {
    let scalar = |v: f64| MatArray::double(Dims::matrix(1, 1), vec![v]).unwrap();
    let mut array = MatArray::structure(
        Dims::matrix(1, 2),
        vec!["a".into(), "b".into(), "c".into()],
        vec![
            vec![scalar(1.0), scalar(2.0), scalar(3.0)],
            vec![scalar(4.0), scalar(5.0), scalar(6.0)],
        ],
    )
    .unwrap();
    if let ArrayKind::Struct(s) = array.kind_mut() {
        s.remove_field("b").unwrap();
        s.add_field("b", vec![scalar(20.0), scalar(50.0)]).unwrap();
    } else {
        panic!("expected struct kind");
    }
    assert_identity(&array, 0);
    assert_identity(&array, 9);

    let (back, _) = round_trip(vec![("s", array.clone())], 0).unwrap();
    match back.get("s").unwrap().kind() {
        ArrayKind::Struct(s) => {
            let names: Vec<&str> = s.field_names().collect();
            assert_eq!(names, ["a", "c", "b"]);
        }
        other => panic!("unexpected kind {other:?}"),
    }
}

#[test]
fn char_encodings_round_trip() {
    for encoding in [
        CharEncoding::Ascii,
        CharEncoding::Utf8,
        CharEncoding::Utf16,
        CharEncoding::Utf32,
    ] {
        let array = MatArray::char_rows(&["hello", "world"], encoding).unwrap();
        assert_identity(&array, 0);
        assert_identity(&array, 9);
    }
    // Non-ASCII content in the wide encodings.
    for encoding in [CharEncoding::Utf8, CharEncoding::Utf16, CharEncoding::Utf32] {
        let array = MatArray::char_rows(&["grüße", "ψηφία"], encoding).unwrap();
        assert_identity(&array, 0);
    }
}

#[test]
fn size_parity_at_both_level_extremes() {
    let entries: Vec<(&str, MatArray)> = vec![
        (
            "dense",
            MatArray::double(Dims::matrix(4, 4), (0..16).map(f64::from).collect()).unwrap(),
        ),
        (
            "sp",
            MatArray::sparse(
                Dims::matrix(3, 3),
                vec![0, 2],
                vec![0, 1, 1, 2],
                vec![9.0, -1.0],
            )
            .unwrap(),
        ),
        (
            "text",
            MatArray::char_rows(&["parity"], CharEncoding::Utf16).unwrap(),
        ),
    ];

    // Level 0: the file is the header plus exactly the declared sizes.
    let mut file = MatFile::new();
    let mut declared = 128u64;
    for (name, array) in &entries {
        declared += matpar::element::compute_size(name, array).unwrap();
        file.insert(name, array.clone()).unwrap();
    }
    let plain = MatWriter::new(CompressionEnvelope::none()).write(&file).unwrap();
    assert_eq!(plain.len() as u64, declared);

    // Level 9: sizes differ but the file must still parse to the same model.
    let packed = MatWriter::new(CompressionEnvelope::best_size())
        .write(&file)
        .unwrap();
    let back = MatReader::default().read_bytes(&packed).unwrap();
    for (name, array) in &entries {
        assert_eq!(back.get(name), Some(array));
    }
}

#[test]
fn example_scenario_identity_and_sparse() {
    // 3x3 identity-like double plus a 5x6 sparse with 4 non-zeros,
    // deflated at best speed.
    let eye = MatArray::double(
        Dims::matrix(3, 3),
        vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
    )
    .unwrap();
    let mut builder = SparseBuilder::new(5, 6).unwrap();
    builder.push(1, 0, 10.0).unwrap();
    builder.push(0, 1, 20.0).unwrap();
    builder.push(4, 3, 30.0).unwrap();
    builder.push(2, 5, 40.0).unwrap();
    let sparse = builder.finish().unwrap();

    let mut file = MatFile::new();
    file.insert("a", eye.clone()).unwrap();
    file.insert("b", sparse.clone()).unwrap();
    let writer = MatWriter::new(CompressionEnvelope::best_speed());
    let bytes = writer.write(&file).unwrap();

    let back = MatReader::default().read_bytes(&bytes).unwrap();
    let a = back.get("a").unwrap();
    assert_eq!(a.dims().as_slice(), &[3, 3]);
    assert_eq!(a, &eye);
    let b = back.get("b").unwrap();
    assert_eq!(b.dims().as_slice(), &[5, 6]);
    match b.kind() {
        ArrayKind::Sparse(s) => {
            assert_eq!(s.nnz(), 4);
            assert_eq!(s.values, vec![10.0, 20.0, 30.0, 40.0]);
        }
        other => panic!("unexpected kind {other:?}"),
    }

    // Re-serializing the read model matches the first write byte for byte.
    let again = writer.write(&back).unwrap();
    assert_eq!(again.len(), bytes.len());
    assert_eq!(again, bytes);
}
