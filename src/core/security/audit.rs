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

//! Append-only audit log: JSON lines at `<data_root>/vault/audit.log` with
//! bounded rotation. Appends are short critical sections; queries read the
//! file through an independent handle and never block the append path.

use crate::core::types::{now_ms, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// Default rotation threshold (100 MB).
pub const DEFAULT_MAX_BYTES: u64 = 100 * 1024 * 1024;

/// Audit errors.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Filesystem failure.
    #[error("io")]
    Io,
    /// A stored line failed to parse.
    #[error("corrupt entry")]
    Corrupt,
}

/// Event category.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Connection open/close/handshake outcomes.
    Connection,
    /// Permission checks and denials.
    Authorization,
    /// Trust record mutations.
    Trust,
    /// Signature verification outcomes.
    Signature,
    /// Data-plane events (rate limiting, breaker transitions, storage).
    Data,
}

/// One immutable audit record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Monotonic sequence number.
    pub seq: u64,
    /// Wall-clock milliseconds.
    pub ts_ms: u64,
    /// Category.
    pub kind: AuditKind,
    /// Event name, e.g. `peer_verified`, `access_denied`.
    pub event: String,
    /// Local node id.
    pub node_id: NodeId,
    /// Remote peer, if the event concerns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<NodeId>,
    /// Outcome flag.
    pub success: bool,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, Value>,
}

/// Query filter; unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct AuditQuery {
    /// Restrict to a category.
    pub kind: Option<AuditKind>,
    /// Restrict to an event name.
    pub event: Option<String>,
    /// Restrict to a peer.
    pub peer: Option<NodeId>,
    /// Inclusive lower time bound (ms).
    pub since_ms: Option<u64>,
    /// Inclusive upper time bound (ms).
    pub until_ms: Option<u64>,
    /// Maximum results.
    pub limit: Option<usize>,
}

struct Inner {
    file: fs::File,
    seq: u64,
    bytes: u64,
}

/// Append-only audit log with rotation.
pub struct AuditLog {
    path: PathBuf,
    node_id: NodeId,
    enabled: bool,
    max_bytes: u64,
    inner: Mutex<Inner>,
    write_failed: AtomicBool,
}

impl AuditLog {
    /// Open (or create) the log under `data_root`.
    pub fn open(data_root: &Path, node_id: NodeId, enabled: bool) -> Result<Self, AuditError> {
        Self::open_with_max_bytes(data_root, node_id, enabled, DEFAULT_MAX_BYTES)
    }

    /// Open with an explicit rotation threshold.
    pub fn open_with_max_bytes(
        data_root: &Path,
        node_id: NodeId,
        enabled: bool,
        max_bytes: u64,
    ) -> Result<Self, AuditError> {
        let dir = data_root.join("vault");
        fs::create_dir_all(&dir).map_err(|_| AuditError::Io)?;
        let path = dir.join("audit.log");

        // Resume the sequence from the existing file.
        let seq = match fs::File::open(&path) {
            Ok(f) => BufReader::new(f).lines().count() as u64,
            Err(_) => 0,
        };
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|_| AuditError::Io)?;
        let bytes = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path,
            node_id,
            enabled,
            max_bytes,
            inner: Mutex::new(Inner { file, seq, bytes }),
            write_failed: AtomicBool::new(false),
        })
    }

    /// Append one event. Best effort: a storage failure is logged and flagged
    /// but never propagated to the calling path.
    pub fn record(
        &self,
        kind: AuditKind,
        event: &str,
        peer: Option<&NodeId>,
        success: bool,
        meta: BTreeMap<String, Value>,
    ) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let ev = AuditEvent {
            seq: inner.seq,
            ts_ms: now_ms(),
            kind,
            event: event.to_string(),
            node_id: self.node_id.clone(),
            peer: peer.cloned(),
            success,
            meta,
        };
        let Ok(mut line) = serde_json::to_vec(&ev) else {
            self.write_failed.store(true, Ordering::Relaxed);
            return;
        };
        line.push(b'\n');

        if inner.bytes.saturating_add(line.len() as u64) > self.max_bytes {
            self.rotate(&mut inner);
        }

        match inner.file.write_all(&line).and_then(|_| inner.file.flush()) {
            Ok(()) => {
                let _ = inner.file.sync_data();
                inner.seq += 1;
                inner.bytes += line.len() as u64;
                self.write_failed.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(err = %e, "audit append failed");
                self.write_failed.store(true, Ordering::Relaxed);
            }
        }
    }

    fn rotate(&self, inner: &mut Inner) {
        let rotated = self
            .path
            .with_file_name(format!("audit-{}.log", now_ms()));
        if let Err(e) = fs::rename(&self.path, &rotated) {
            warn!(err = %e, "audit rotation failed");
            return;
        }
        match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(f) => {
                inner.file = f;
                inner.bytes = 0;
            }
            Err(e) => warn!(err = %e, "audit reopen failed"),
        }
    }

    /// True while the last append failed (used by the health aggregate).
    pub fn write_failed(&self) -> bool {
        self.write_failed.load(Ordering::Relaxed)
    }

    /// Whether writes are enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Filtered scan of the current log file; never touches the append handle.
    pub fn query(&self, q: &AuditQuery) -> Result<Vec<AuditEvent>, AuditError> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(_) => return Err(AuditError::Io),
        };
        let limit = q.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|_| AuditError::Io)?;
            if line.trim().is_empty() {
                continue;
            }
            let ev: AuditEvent = serde_json::from_str(&line).map_err(|_| AuditError::Corrupt)?;
            if let Some(k) = q.kind {
                if ev.kind != k {
                    continue;
                }
            }
            if let Some(name) = &q.event {
                if &ev.event != name {
                    continue;
                }
            }
            if let Some(p) = &q.peer {
                if ev.peer.as_ref() != Some(p) {
                    continue;
                }
            }
            if let Some(since) = q.since_ms {
                if ev.ts_ms < since {
                    continue;
                }
            }
            if let Some(until) = q.until_ms {
                if ev.ts_ms > until {
                    continue;
                }
            }
            out.push(ev);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(byte: u8) -> NodeId {
        NodeId::from_public_key(&[byte; 32])
    }

    #[test]
    fn append_and_query_filters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::open(dir.path(), nid(1), true).expect("open");

        log.record(AuditKind::Trust, "peer_verified", Some(&nid(2)), true, BTreeMap::new());
        log.record(
            AuditKind::Authorization,
            "access_denied",
            Some(&nid(3)),
            false,
            BTreeMap::new(),
        );
        log.record(AuditKind::Trust, "peer_demoted", Some(&nid(2)), true, BTreeMap::new());

        let all = log.query(&AuditQuery::default()).expect("query");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].seq, 0);
        assert_eq!(all[2].seq, 2);

        let trust = log
            .query(&AuditQuery {
                kind: Some(AuditKind::Trust),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(trust.len(), 2);

        let denied = log
            .query(&AuditQuery {
                event: Some("access_denied".into()),
                ..Default::default()
            })
            .expect("query");
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].peer, Some(nid(3)));
        assert!(!denied[0].success);
    }

    #[test]
    fn sequence_resumes_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let log = AuditLog::open(dir.path(), nid(1), true).expect("open");
            log.record(AuditKind::Data, "rate_limited", None, false, BTreeMap::new());
        }
        let log = AuditLog::open(dir.path(), nid(1), true).expect("reopen");
        log.record(AuditKind::Data, "rate_limited", None, false, BTreeMap::new());
        let all = log.query(&AuditQuery::default()).expect("query");
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].seq, 1);
    }

    #[test]
    fn rotation_truncates_active_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::open_with_max_bytes(dir.path(), nid(1), true, 256).expect("open");
        for _ in 0..16 {
            log.record(AuditKind::Data, "breaker_open", Some(&nid(4)), false, BTreeMap::new());
        }
        // Active file stays below the threshold; a rotated sibling exists.
        let active = fs::metadata(dir.path().join("vault").join("audit.log")).expect("meta");
        assert!(active.len() <= 512);
        let rotated = fs::read_dir(dir.path().join("vault"))
            .expect("dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("audit-"))
            .count();
        assert!(rotated >= 1);
    }

    #[test]
    fn disabled_log_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = AuditLog::open(dir.path(), nid(1), false).expect("open");
        log.record(AuditKind::Trust, "peer_verified", None, true, BTreeMap::new());
        assert!(log.query(&AuditQuery::default()).expect("query").is_empty());
    }
}
