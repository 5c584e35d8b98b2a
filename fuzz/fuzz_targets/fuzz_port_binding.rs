//! Fuzz target: port binding and IPv4 pool spec parsing.
//!
//! Verifies that arbitrary strings fed to the text parsers never
//! cause panics, UB, or unbounded resource consumption.

#![no_main]

use berth_core::PortBinding;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Errors are expected and fine; only panics are failures.
    let _ = text.parse::<PortBinding>();
    let _ = berth_core::ipv4::parse_pool(text);
});
