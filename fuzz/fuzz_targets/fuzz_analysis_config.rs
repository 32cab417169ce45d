//! Fuzz target for analysis configuration parsing.
//!
//! Deployment configs are JSON; parsing plus validation must never
//! panic, only reject.

#![no_main]

use ft_core::config::AnalysisConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(config) = serde_json::from_slice::<AnalysisConfig>(data) {
        let _ = config.validate();
    }
});
