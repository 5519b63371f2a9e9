//! Configuration: TOML loading, scoped overrides and the global default

use asdf_rs::{
    config_context, get_config, set_global_config, ArrayStorage, AsdfConfig, AsdfError, AsdfFile,
    CompressionLabel, MemoryStream, OpenOptions, Padding, WriteOptions,
};
use std::io::Write;

#[test]
fn test_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
        lazy_load = false
        all_array_compression = "lz4"
        pad_blocks = true
        external_cache_capacity = 8
        "#
    )
    .unwrap();

    let config = AsdfConfig::from_file(file.path()).unwrap();
    assert!(!config.lazy_load);
    assert_eq!(config.all_array_compression, Some(CompressionLabel::LZ4));
    assert_eq!(config.pad_blocks, Padding::Default);
    assert_eq!(config.external_cache_capacity, 8);

    writeln!(file, "external_cache_capacity = 0").unwrap();
    assert!(AsdfConfig::from_file(file.path()).is_err());
}

#[test]
fn test_context_applies_to_new_documents() {
    let bytes = {
        let ctx = config_context();
        ctx.update(|c| {
            c.array_inline_threshold = Some(64);
            c.all_array_compression = Some(CompressionLabel::ZLIB);
        });

        let mut doc = AsdfFile::new();
        doc.add_array(vec![1; 10]);
        doc.add_array(vec![2; 1000]);
        let mut out = MemoryStream::new();
        doc.write_to_stream(&mut out, None, &WriteOptions::new()).unwrap();
        out.into_inner()
    };

    let mut doc = OpenOptions::new()
        .open_stream(Box::new(MemoryStream::from_bytes(bytes)), None)
        .unwrap();
    let ids = doc.array_ids();
    assert_eq!(doc.get_array_storage(ids[0]).unwrap(), ArrayStorage::Inline);
    assert_eq!(doc.get_array_compression(ids[1]).unwrap(), CompressionLabel::ZLIB);
    assert_eq!(&doc.array(ids[1]).unwrap().bytes().unwrap()[..], &[2u8; 1000][..]);
}

#[test]
fn test_document_keeps_its_config() {
    let mut doc = {
        let ctx = config_context();
        ctx.update(|c| c.include_block_index = false);
        AsdfFile::new()
    };
    assert!(get_config().include_block_index);
    assert!(!doc.config().include_block_index);

    doc.add_array(vec![1; 10]);
    let mut out = MemoryStream::new();
    doc.write_to_stream(&mut out, None, &WriteOptions::new()).unwrap();
    let bytes = out.into_inner();
    assert!(!bytes.windows(17).any(|w| w == b"#ASDF BLOCK INDEX"));
}

#[test]
fn test_invalid_overrides() {
    let config = AsdfConfig {
        all_array_storage: Some(ArrayStorage::Streamed),
        ..AsdfConfig::default()
    };
    assert!(matches!(
        OpenOptions::new()
            .config(config)
            .open_stream(Box::new(MemoryStream::new()), None)
            .err()
            .unwrap(),
        AsdfError::Config(_)
    ));
}

#[test]
fn test_global_default() {
    let original = get_config();
    set_global_config(AsdfConfig {
        validate_checksums: true,
        ..original.clone()
    })
    .unwrap();

    // visible on other threads without a context
    let seen = std::thread::spawn(|| get_config().validate_checksums)
        .join()
        .unwrap();
    assert!(seen);

    assert!(set_global_config(AsdfConfig {
        io_block_size: 0,
        ..AsdfConfig::default()
    })
    .is_err());
    set_global_config(original).unwrap();
}
