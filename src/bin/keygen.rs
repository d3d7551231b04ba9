// Copyright (c) 2026 Dawn Mesh
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

//! Out-of-band identity generation: creates `vault/node_identity.key` under
//! the given data root and prints the derived node id.

use anyhow::Result;
use dawn_mesh::core::security::identity::NodeIdentity;
use std::path::PathBuf;

fn main() -> Result<()> {
    let data_root = std::env::args().nth(1).unwrap_or_else(|| "data".to_string());
    let identity = NodeIdentity::load_or_create(&PathBuf::from(data_root))?;
    println!("{}", identity.node_id());
    Ok(())
}
