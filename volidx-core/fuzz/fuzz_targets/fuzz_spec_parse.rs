#![no_main]

//! Fuzz target for index and sample specification parsing
//!
//! Run with: cargo +nightly fuzz run fuzz_spec_parse

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use volidx_core::{IndexSpecification, SampleSpecification};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let origin = Path::new("/fuzz/spec");

    if let Ok(spec) = IndexSpecification::parse_str(text, origin) {
        let _ = IndexSpecification::parse_str(&spec.to_string(), origin);
        assert!(spec.fingerprint_len().is_ok());
    }
    let _ = SampleSpecification::parse_all(text, origin);
});
