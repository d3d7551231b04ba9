// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(req) = serde_json::from_str::<dawn_mesh::core::types::RpcRequest>(s) {
            let _ = dawn_mesh::core::types::parse_method(&req.method);
        }
    }
});
