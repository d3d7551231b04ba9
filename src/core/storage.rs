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
#![warn(missing_docs)]

//! Torn-write-safe JSON persistence: write-temp + fsync + rename.

use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("io")]
    Io,
    /// Serialization failure.
    #[error("encode")]
    Encode,
    /// Deserialization failure.
    #[error("decode")]
    Decode,
}

/// Atomically replace `path` with the JSON encoding of `value`.
///
/// The temp file is fsynced before the rename, so a crash leaves either the
/// previous file or the new one, never a torn write.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| StorageError::Io)?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|_| StorageError::Encode)?;

    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| StorageError::Io)?;
        f.write_all(&bytes).map_err(|_| StorageError::Io)?;
        f.sync_all().map_err(|_| StorageError::Io)?;
    }
    fs::rename(&tmp, path).map_err(|_| StorageError::Io)?;
    Ok(())
}

/// Read JSON from `path`; `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(_) => return Err(StorageError::Io),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|_| StorageError::Decode)
}
