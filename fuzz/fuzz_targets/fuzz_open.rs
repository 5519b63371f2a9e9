#![no_main]
use asdf_rs::{AsdfConfig, MemoryStream, OpenOptions};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must never panic: open, then touch every array
fuzz_target!(|data: &[u8]| {
    for lazy in [true, false] {
        let opened = OpenOptions::new()
            .config(AsdfConfig::default())
            .lazy_load(lazy)
            .open_stream(Box::new(MemoryStream::from_bytes(data.to_vec())), None);
        let Ok(mut doc) = opened else {
            continue;
        };
        for id in doc.array_ids() {
            let _ = doc.array(id);
        }
    }
});
