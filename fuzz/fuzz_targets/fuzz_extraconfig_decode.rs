//! Fuzz target: flat key/value decoding of `ExecConfig`.
//!
//! Verifies that an arbitrary key/value map fed to the decoder never
//! causes panics, UB, or unbounded resource consumption.

#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Interpret the input as newline-separated "key=value" pairs.
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let mut map = BTreeMap::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.to_owned(), value.to_owned());
        }
    }

    // Errors are expected and fine; only panics are failures.
    let _ = berth_extraconfig::data_version(&map);
    let _ = berth_extraconfig::decode(&map);
});
