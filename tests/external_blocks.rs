//! External block storage and the external block cache

use asdf_rs::core::checksum;
use asdf_rs::core::format::{wrap_tree, BlockHeader, FileHeader};
use asdf_rs::{
    ArrayStorage, AsdfConfig, AsdfError, AsdfFile, MemoryStream, OpenMode, OpenOptions,
    WriteOptions,
};
use tempfile::TempDir;

#[test]
fn test_external_arrays_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("main.asdf");

    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    let inside = doc.add_array(vec![1; 100]);
    let outside = doc.add_array(vec![2; 200]);
    let view = doc.add_view(outside).unwrap();
    doc.set_array_storage(outside, ArrayStorage::External).unwrap();
    doc.write_to(&path, &WriteOptions::new()).unwrap();

    // one file per external block, not per array
    assert!(dir.path().join("main0000.asdf").exists());
    assert!(!dir.path().join("main0001.asdf").exists());
    let tree = std::fs::read(&path).unwrap();
    assert!(String::from_utf8_lossy(&tree).contains(r#""source":"main0000.asdf""#));

    let mut reopened = AsdfFile::open(&path).unwrap();
    assert_eq!(reopened.get_array_storage(outside).unwrap(), ArrayStorage::External);
    assert_eq!(&reopened.array(inside).unwrap().bytes().unwrap()[..], &[1u8; 100][..]);
    assert_eq!(&reopened.array(outside).unwrap().bytes().unwrap()[..], &[2u8; 200][..]);
    assert!(reopened
        .array(view)
        .unwrap()
        .ptr_eq(&reopened.array(outside).unwrap()));
}

#[test]
fn test_external_file_is_a_standalone_document() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("main.asdf");

    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    let id = doc.add_array(b"payload".to_vec());
    doc.set_array_storage(id, ArrayStorage::External).unwrap();
    doc.write_to(&path, &WriteOptions::new()).unwrap();

    let external = AsdfFile::open(dir.path().join("main0000.asdf")).unwrap();
    assert!(external.array_ids().is_empty());
    assert_eq!(external.block_manager().len(), 1);
}

#[test]
fn test_external_storage_needs_a_uri() {
    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    let id = doc.add_array(vec![1, 2, 3]);
    doc.set_array_storage(id, ArrayStorage::External).unwrap();

    let mut out = MemoryStream::new();
    let err = doc
        .write_to_stream(&mut out, None, &WriteOptions::new())
        .unwrap_err();
    assert!(matches!(err, AsdfError::StorageConstraint(_)));
    assert!(out.get_ref().is_empty());
}

#[test]
fn test_reference_to_own_file_uses_first_block() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("self.asdf");

    let payload = b"first internal block";
    let n = payload.len() as u64;
    let mut bytes = FileHeader::default().to_bytes();
    bytes.extend_from_slice(&wrap_tree(
        r##"{"arrays": [{"source": 0}, {"source": "#"}, {"source": "self.asdf"}]}"##,
    ));
    bytes.extend_from_slice(&BlockHeader::new([0; 4], n, n, n, checksum::compute(payload)).to_bytes());
    bytes.extend_from_slice(payload);
    std::fs::write(&path, bytes).unwrap();

    let mut doc = AsdfFile::open(&path).unwrap();
    for id in doc.array_ids() {
        assert_eq!(&doc.array(id).unwrap().bytes().unwrap()[..], payload);
    }
}

#[test]
fn test_missing_external_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dangling.asdf");
    let mut bytes = FileHeader::default().to_bytes();
    bytes.extend_from_slice(&wrap_tree(r#"{"arrays": [{"source": "gone.asdf"}]}"#));
    std::fs::write(&path, bytes).unwrap();

    // opening succeeds; resolution is deferred to first access
    let mut doc = AsdfFile::open(&path).unwrap();
    let ids = doc.array_ids();
    assert!(matches!(doc.array(ids[0]), Err(AsdfError::Io(_))));
}

#[test]
fn test_update_rewrites_external_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("main.asdf");

    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    let kept = doc.add_array(vec![1; 10]);
    let ext = doc.add_array(vec![2; 10]);
    doc.set_array_storage(ext, ArrayStorage::External).unwrap();
    doc.write_to(&path, &WriteOptions::new()).unwrap();

    let mut doc = OpenOptions::new()
        .mode(OpenMode::ReadWrite)
        .config(AsdfConfig::default())
        .open(&path)
        .unwrap();
    doc.array_mut(ext).unwrap()[0] = 42;
    doc.update(&WriteOptions::new()).unwrap();
    drop(doc);

    let mut reopened = AsdfFile::open(&path).unwrap();
    assert_eq!(reopened.array(ext).unwrap().bytes().unwrap()[0], 42);
    assert_eq!(&reopened.array(kept).unwrap().bytes().unwrap()[..], &[1u8; 10][..]);
}
