#![no_main]

//! Fuzz target for SampleIndexFile::from_cbor()
//!
//! Run with: cargo +nightly fuzz run fuzz_from_cbor

use libfuzzer_sys::fuzz_target;
use volidx_core::SampleIndexFile;

fuzz_target!(|data: &[u8]| {
    // Malformed input must surface as an error, never a panic
    let _ = SampleIndexFile::from_cbor(data);
});
