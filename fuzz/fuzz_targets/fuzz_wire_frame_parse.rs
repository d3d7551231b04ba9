// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Wire frames arrive as attacker-controlled WS text; parsing must never
    // panic. Signature and AEAD checks are covered by unit tests.
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = serde_json::from_str::<dawn_mesh::core::types::WireFrame>(s);
    }
});
