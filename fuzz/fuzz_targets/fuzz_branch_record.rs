//! Fuzz target for stored branch record decoding.
//!
//! Records come back from the store as JSON blobs; decoding must never
//! panic on a corrupt or truncated blob.

#![no_main]

use ft_core::branch::BranchRecord;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Malformed input is an error, never a panic. A record that does
    // decode must re-encode.
    if let Ok(record) = serde_json::from_slice::<BranchRecord>(data) {
        let _ = serde_json::to_vec(&record);
    }
});
