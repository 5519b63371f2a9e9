#![no_main]
use asdf_rs::core::format::{BlockHeader, BLOCK_PREAMBLE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < BLOCK_PREAMBLE as usize {
        return;
    }
    if let Ok(header) = BlockHeader::parse(data, 0) {
        // anything that parses must re-encode to the same fields
        let again = BlockHeader::parse(&header.to_bytes(), 0).unwrap();
        assert_eq!(header.flags, again.flags);
        assert_eq!(header.used_size, again.used_size);
        assert_eq!(header.checksum, again.checksum);
    }
});
