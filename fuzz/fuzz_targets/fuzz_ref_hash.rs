//! Fuzz target for ref hash parsing.
//!
//! Ref hashes arrive as strings inside persisted records and store keys;
//! parsing must never panic, and anything accepted must render back to
//! itself.

#![no_main]

use ft_common::RefHash;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    if let Some(hash) = RefHash::parse(data) {
        let rendered = hash.to_string();
        assert_eq!(RefHash::parse(&rendered), Some(hash));
    }
});
