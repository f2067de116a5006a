#![no_main]

//! Fuzz target for consolidated index header and record decoding
//!
//! Run with: cargo +nightly fuzz run fuzz_index_file

use libfuzzer_sys::fuzz_target;
use volidx_core::store::{decode_record, IndexHeader};

fuzz_target!(|data: &[u8]| {
    let mut reader = data;
    let Ok(header) = IndexHeader::read_from(&mut reader) else {
        return;
    };
    // Decode whatever records follow, ignoring a trailing partial record
    for record in reader.chunks_exact(header.record_len()) {
        let _ = decode_record(record, &header);
    }
});
