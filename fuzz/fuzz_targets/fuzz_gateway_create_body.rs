//! Fuzz target: JSON deserialization of gateway request payloads.
//!
//! Verifies that arbitrary byte sequences fed through the typed request
//! bodies never cause panics, UB, or unbounded resource consumption.

#![no_main]

use berth_gateway::routes::container::CreateBody;
use berth_gateway::routes::scope::ScopeBody;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Errors are expected and fine; only panics are failures. CreateBody
    // pulls in the network attachment and port string fields, ScopeBody
    // the subnet/gateway/pool parsing.
    let _ = serde_json::from_slice::<CreateBody>(data);
    let _ = serde_json::from_slice::<ScopeBody>(data);
});
