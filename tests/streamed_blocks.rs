//! Streamed blocks and non-seekable streams

use asdf_rs::{
    ArrayStorage, AsdfConfig, AsdfError, AsdfFile, MemoryStream, OutputStream, WriteOptions,
};
use std::io::{Cursor, Write};
use tempfile::TempDir;

const INDEX_HEADER: &[u8] = b"#ASDF BLOCK INDEX";

fn has_index(bytes: &[u8]) -> bool {
    bytes.windows(INDEX_HEADER.len()).any(|w| w == INDEX_HEADER)
}

#[test]
fn test_streamed_block_is_last_and_unindexed() {
    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    let stream = doc.add_array(b"streamed rows".to_vec());
    let plain = doc.add_array(vec![1; 100]);
    doc.set_array_storage(stream, ArrayStorage::Streamed).unwrap();

    let mut out = MemoryStream::new();
    doc.write_to_stream(&mut out, None, &WriteOptions::new()).unwrap();
    let bytes = out.into_inner();
    assert!(!has_index(&bytes));
    assert!(bytes.ends_with(b"streamed rows"));

    let mut reopened = AsdfFile::from_bytes(bytes).unwrap();
    assert_eq!(reopened.get_array_storage(stream).unwrap(), ArrayStorage::Streamed);
    assert_eq!(&reopened.array(stream).unwrap().bytes().unwrap()[..], b"streamed rows");
    assert_eq!(&reopened.array(plain).unwrap().bytes().unwrap()[..], &[1u8; 100][..]);
}

#[test]
fn test_appending_extends_streamed_array() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("log.asdf");

    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    let rows = doc.add_array(b"row 1;".to_vec());
    doc.set_array_storage(rows, ArrayStorage::Streamed).unwrap();
    doc.write_to(&path, &WriteOptions::new()).unwrap();

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"row 2;row 3;").unwrap();
    drop(file);

    let mut reopened = AsdfFile::open(&path).unwrap();
    assert_eq!(&reopened.array(rows).unwrap().bytes().unwrap()[..], b"row 1;row 2;row 3;");
}

#[test]
fn test_only_one_streamed_array() {
    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    let a = doc.add_array(vec![1]);
    let b = doc.add_array(vec![2]);
    doc.set_array_storage(a, ArrayStorage::Streamed).unwrap();

    let err = doc.set_array_storage(b, ArrayStorage::Streamed).unwrap_err();
    assert!(matches!(err, AsdfError::StorageConstraint(_)));
    assert_eq!(doc.get_array_storage(a).unwrap(), ArrayStorage::Streamed);
    assert_eq!(doc.get_array_storage(b).unwrap(), ArrayStorage::Internal);
}

#[test]
fn test_streamed_arrays_are_never_compressed() {
    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    let a = doc.add_array(vec![7; 1000]);
    doc.set_array_storage(a, ArrayStorage::Streamed).unwrap();

    let mut out = MemoryStream::new();
    let options = WriteOptions::new().all_array_compression(asdf_rs::CompressionLabel::ZLIB);
    doc.write_to_stream(&mut out, None, &options).unwrap();
    let bytes = out.into_inner();
    assert!(bytes.ends_with(&[7u8; 1000]));
}

#[test]
fn test_non_seekable_output_and_input() {
    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    let a = doc.add_array(vec![3; 500]);
    let b = doc.add_array(vec![4; 500]);

    let mut out = OutputStream::new(Vec::new());
    doc.write_to_stream(&mut out, None, &WriteOptions::new()).unwrap();
    let bytes = out.into_inner();
    assert!(!has_index(&bytes));

    let mut reopened = AsdfFile::from_reader(Cursor::new(bytes)).unwrap();
    assert_eq!(&reopened.array(a).unwrap().bytes().unwrap()[..], &[3u8; 500][..]);
    assert_eq!(&reopened.array(b).unwrap().bytes().unwrap()[..], &[4u8; 500][..]);
}

#[cfg(unix)]
#[test]
fn test_write_through_a_pipe() {
    use std::os::unix::net::UnixStream;

    let (writer, reader) = UnixStream::pair().unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let producer = std::thread::spawn(move || {
        let mut doc = AsdfFile::with_config(AsdfConfig::default());
        doc.add_array(vec![1; 64]);
        let rows = doc.add_array(payload);
        doc.set_array_storage(rows, ArrayStorage::Streamed).unwrap();
        let mut out = OutputStream::new(writer);
        doc.write_to_stream(&mut out, None, &WriteOptions::new()).unwrap();
    });

    let mut doc = AsdfFile::from_reader(reader).unwrap();
    producer.join().unwrap();
    let ids = doc.array_ids();
    assert_eq!(&doc.array(ids[0]).unwrap().bytes().unwrap()[..], &[1u8; 64][..]);
    assert_eq!(&doc.array(ids[1]).unwrap().bytes().unwrap()[..], &expected[..]);
}
