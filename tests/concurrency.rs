//! Concurrent readers and closed-document behaviour
//!
//! A document is single-writer: sharing one across threads goes through a
//! lock. Independent documents over the same file are fully independent.

use asdf_rs::{AsdfConfig, AsdfError, AsdfFile, OpenMode, OpenOptions, WriteOptions};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;

fn sample(dir: &TempDir, arrays: usize) -> std::path::PathBuf {
    let path = dir.path().join("shared.asdf");
    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    for i in 0..arrays {
        doc.add_array(vec![i as u8; 4096]);
    }
    doc.write_to(&path, &WriteOptions::new()).unwrap();
    path
}

#[test]
fn test_independent_readers() {
    let dir = TempDir::new().unwrap();
    let path = sample(&dir, 16);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let mut doc = OpenOptions::new()
                    .config(AsdfConfig::default())
                    .validate_checksums(true)
                    .open(&path)
                    .unwrap();
                for _ in 0..50 {
                    let ids = doc.array_ids();
                    let pick = rand::random::<usize>() % ids.len();
                    let data = doc.array(ids[pick]).unwrap().to_vec().unwrap();
                    assert!(data.iter().all(|&b| b == pick as u8));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_shared_document_behind_a_lock() {
    let dir = TempDir::new().unwrap();
    let path = sample(&dir, 4);
    let doc = OpenOptions::new()
        .mode(OpenMode::ReadWrite)
        .config(AsdfConfig::default())
        .open(&path)
        .unwrap();
    let doc = Arc::new(Mutex::new(doc));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let doc = Arc::clone(&doc);
            std::thread::spawn(move || {
                for round in 0..20u8 {
                    let mut doc = doc.lock();
                    let ids = doc.array_ids();
                    doc.array_mut(ids[t]).unwrap()[0] = round;
                    if round % 5 == 0 {
                        doc.update(&WriteOptions::new()).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut doc = Arc::try_unwrap(doc).ok().unwrap().into_inner();
    doc.update(&WriteOptions::new()).unwrap();
    drop(doc);

    let mut reopened = AsdfFile::open(&path).unwrap();
    for (t, id) in reopened.array_ids().into_iter().enumerate() {
        let data = reopened.array(id).unwrap().to_vec().unwrap();
        assert_eq!(data[0], 19);
        assert!(data[1..].iter().all(|&b| b == t as u8));
    }
}

#[test]
fn test_closed_document() {
    let dir = TempDir::new().unwrap();
    let path = sample(&dir, 2);

    let mut doc = AsdfFile::open(&path).unwrap();
    let ids = doc.array_ids();
    let loaded = doc.array(ids[0]).unwrap();
    doc.close();
    assert!(doc.is_closed());

    // copied data handed out before closing stays valid
    assert!(!loaded.is_mapped());
    assert_eq!(loaded.to_vec().unwrap(), vec![0u8; 4096]);
    assert!(matches!(doc.array(ids[0]), Err(AsdfError::Closed)));
    assert!(matches!(doc.array(ids[1]), Err(AsdfError::Closed)));
    assert!(matches!(doc.array_mut(ids[1]), Err(AsdfError::Closed)));
    assert!(matches!(
        doc.write_to(dir.path().join("copy.asdf"), &WriteOptions::new()),
        Err(AsdfError::Closed)
    ));
    assert!(matches!(doc.update(&WriteOptions::new()), Err(AsdfError::Closed)));

    // closing twice is harmless
    doc.close();
}

#[test]
fn test_mapped_views_fail_after_close() {
    let dir = TempDir::new().unwrap();
    let path = sample(&dir, 2);

    let mut doc = OpenOptions::new().memmap(true).open(&path).unwrap();
    let ids = doc.array_ids();
    let view = doc.array(ids[0]).unwrap();
    assert!(view.is_mapped());
    assert!(view.bytes().unwrap().iter().all(|&b| b == 0));

    doc.close();
    assert_eq!(view.len(), 4096);
    assert!(matches!(view.bytes(), Err(AsdfError::Closed)));
    assert!(matches!(view.to_vec(), Err(AsdfError::Closed)));
}

#[test]
fn test_mapped_views_fail_after_drop() {
    let dir = TempDir::new().unwrap();
    let path = sample(&dir, 1);

    let view = {
        let mut doc = OpenOptions::new().memmap(true).open(&path).unwrap();
        let ids = doc.array_ids();
        doc.array(ids[0]).unwrap()
    };
    assert!(view.is_mapped());
    assert!(matches!(view.bytes(), Err(AsdfError::Closed)));
}
