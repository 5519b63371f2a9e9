#![no_main]
use arbitrary::Arbitrary;
use asdf_rs::{AsdfConfig, AsdfFile, MemoryStream, WriteOptions};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Op {
    Set(u8, Vec<u8>),
    Add(Vec<u8>),
    Remove(u8),
    Update,
}

// Random edits and updates must keep the document readable
fuzz_target!(|ops: Vec<Op>| {
    let mut doc = AsdfFile::with_config(AsdfConfig::default());
    doc.add_array(vec![1; 100]);
    let mut out = MemoryStream::new();
    doc.write_to_stream(&mut out, None, &WriteOptions::new()).unwrap();
    let mut doc = AsdfFile::from_bytes(out.into_inner()).unwrap();

    let mut expected: Vec<Vec<u8>> = vec![vec![1; 100]];
    let mut ids = doc.array_ids();
    for op in ops.into_iter().take(32) {
        match op {
            Op::Set(i, data) if !ids.is_empty() => {
                let i = i as usize % ids.len();
                doc.set_array(ids[i], data.clone()).unwrap();
                expected[i] = data;
            }
            Op::Add(data) => {
                ids.push(doc.add_array(data.clone()));
                expected.push(data);
            }
            Op::Remove(i) if !ids.is_empty() => {
                let i = i as usize % ids.len();
                doc.remove_array(ids.remove(i)).unwrap();
                expected.remove(i);
            }
            Op::Update => {
                doc.update(&WriteOptions::new()).unwrap();
            }
            _ => {}
        }
    }
    for (id, data) in ids.iter().zip(&expected) {
        assert_eq!(&doc.array(*id).unwrap().bytes().unwrap()[..], &data[..]);
    }
});
