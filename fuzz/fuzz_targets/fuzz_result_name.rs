//! Fuzz target for test result resource name parsing.
//!
//! Resource names arrive from an external results service and feed the
//! invocation claim logic; parsing must never panic.

#![no_main]

use ft_core::ingest::invocation_from_result_name;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Malformed names are an error, never a panic.
    let _ = invocation_from_result_name(data);
});
