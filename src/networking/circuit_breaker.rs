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
#![deny(missing_docs)]

//! Per-peer three-state circuit breakers.
//!
//! CLOSED passes calls through and opens after `failure_threshold`
//! consecutive failures. OPEN fails fast for `timeout` seconds, then admits
//! exactly one HALF_OPEN trial; `success_threshold` consecutive successes
//! close it again, one failure re-opens it and resets the timer.

use crate::core::config::CircuitBreakerSection;
use crate::core::security::audit::{AuditKind, AuditLog};
use crate::core::types::NodeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Fail-fast refusal.
#[derive(Debug, Error)]
#[error("circuit open")]
pub struct CircuitOpen {
    /// Seconds until the next trial is admitted.
    pub retry_in: f64,
}

/// Breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// One trial call in flight.
    HalfOpen,
}

impl BreakerState {
    fn name(self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct PeerBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl PeerBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Breaker table keyed by peer node id.
pub struct CircuitBreakers {
    cfg: CircuitBreakerSection,
    peers: Mutex<HashMap<NodeId, PeerBreaker>>,
    audit: Arc<AuditLog>,
}

impl CircuitBreakers {
    /// Build from config.
    pub fn new(cfg: CircuitBreakerSection, audit: Arc<AuditLog>) -> Self {
        Self {
            cfg,
            peers: Mutex::new(HashMap::new()),
            audit,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.cfg.timeout)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, PeerBreaker>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn audit_transition(&self, peer: &NodeId, from: BreakerState, to: BreakerState) {
        let mut meta = BTreeMap::new();
        meta.insert("from".to_string(), serde_json::Value::from(from.name()));
        meta.insert("to".to_string(), serde_json::Value::from(to.name()));
        self.audit.record(
            AuditKind::Data,
            "breaker_transition",
            Some(peer),
            to == BreakerState::Closed,
            meta,
        );
    }

    /// Admit one call for `peer`, or fail fast while the breaker is open.
    pub fn acquire(&self, peer: &NodeId) -> Result<(), CircuitOpen> {
        let transition = {
            let mut peers = self.lock();
            let b = peers.entry(peer.clone()).or_insert_with(PeerBreaker::new);
            match b.state {
                BreakerState::Closed => return Ok(()),
                BreakerState::Open => {
                    let elapsed = b.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                    if elapsed < self.timeout() {
                        return Err(CircuitOpen {
                            retry_in: (self.timeout() - elapsed).as_secs_f64(),
                        });
                    }
                    b.state = BreakerState::HalfOpen;
                    b.probe_in_flight = true;
                    b.consecutive_successes = 0;
                    Some((BreakerState::Open, BreakerState::HalfOpen))
                }
                BreakerState::HalfOpen => {
                    if b.probe_in_flight {
                        return Err(CircuitOpen { retry_in: 0.0 });
                    }
                    b.probe_in_flight = true;
                    None
                }
            }
        };
        if let Some((from, to)) = transition {
            self.audit_transition(peer, from, to);
        }
        Ok(())
    }

    /// Record a successful call.
    pub fn record_success(&self, peer: &NodeId) {
        let transition = {
            let mut peers = self.lock();
            let b = peers.entry(peer.clone()).or_insert_with(PeerBreaker::new);
            b.consecutive_failures = 0;
            match b.state {
                BreakerState::Closed => None,
                BreakerState::HalfOpen => {
                    b.probe_in_flight = false;
                    b.consecutive_successes += 1;
                    if b.consecutive_successes >= self.cfg.success_threshold {
                        b.state = BreakerState::Closed;
                        b.opened_at = None;
                        b.consecutive_successes = 0;
                        Some((BreakerState::HalfOpen, BreakerState::Closed))
                    } else {
                        None
                    }
                }
                // A success while nominally open: treat as a closed trial.
                BreakerState::Open => {
                    b.state = BreakerState::Closed;
                    b.opened_at = None;
                    Some((BreakerState::Open, BreakerState::Closed))
                }
            }
        };
        if let Some((from, to)) = transition {
            self.audit_transition(peer, from, to);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, peer: &NodeId) {
        let transition = {
            let mut peers = self.lock();
            let b = peers.entry(peer.clone()).or_insert_with(PeerBreaker::new);
            match b.state {
                BreakerState::Closed => {
                    b.consecutive_failures += 1;
                    if b.consecutive_failures >= self.cfg.failure_threshold {
                        b.state = BreakerState::Open;
                        b.opened_at = Some(Instant::now());
                        Some((BreakerState::Closed, BreakerState::Open))
                    } else {
                        None
                    }
                }
                BreakerState::HalfOpen => {
                    b.probe_in_flight = false;
                    b.state = BreakerState::Open;
                    b.opened_at = Some(Instant::now());
                    b.consecutive_successes = 0;
                    Some((BreakerState::HalfOpen, BreakerState::Open))
                }
                BreakerState::Open => {
                    b.opened_at = Some(Instant::now());
                    None
                }
            }
        };
        if let Some((from, to)) = transition {
            self.audit_transition(peer, from, to);
        }
    }

    /// Current state for a peer (CLOSED when never seen).
    pub fn state(&self, peer: &NodeId) -> BreakerState {
        self.lock()
            .get(peer)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Number of peers with an OPEN breaker.
    pub fn open_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|b| b.state == BreakerState::Open)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::audit::AuditLog;

    fn breakers(threshold: u32, timeout: f64, successes: u32) -> (tempfile::TempDir, CircuitBreakers) {
        let dir = tempfile::tempdir().expect("tempdir");
        let audit = Arc::new(
            AuditLog::open(dir.path(), NodeId::from_public_key(&[0u8; 32]), true).expect("audit"),
        );
        let cb = CircuitBreakers::new(
            CircuitBreakerSection {
                failure_threshold: threshold,
                timeout,
                success_threshold: successes,
            },
            audit,
        );
        (dir, cb)
    }

    fn nid(byte: u8) -> NodeId {
        NodeId::from_public_key(&[byte; 32])
    }

    #[test]
    fn opens_exactly_at_threshold() {
        let (_dir, cb) = breakers(5, 60.0, 1);
        let peer = nid(1);
        for _ in 0..4 {
            cb.acquire(&peer).expect("closed");
            cb.record_failure(&peer);
        }
        assert_eq!(cb.state(&peer), BreakerState::Closed);
        cb.acquire(&peer).expect("still closed");
        cb.record_failure(&peer);
        assert_eq!(cb.state(&peer), BreakerState::Open);
        assert!(cb.acquire(&peer).is_err());
    }

    #[test]
    fn one_fewer_failure_keeps_it_closed() {
        let (_dir, cb) = breakers(3, 60.0, 1);
        let peer = nid(2);
        for _ in 0..2 {
            cb.record_failure(&peer);
        }
        assert_eq!(cb.state(&peer), BreakerState::Closed);
        assert!(cb.acquire(&peer).is_ok());
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let (_dir, cb) = breakers(1, 0.0, 1);
        let peer = nid(3);
        cb.record_failure(&peer);
        assert_eq!(cb.state(&peer), BreakerState::Open);
        // Zero timeout: first acquire transitions to half-open.
        cb.acquire(&peer).expect("trial");
        assert_eq!(cb.state(&peer), BreakerState::HalfOpen);
        assert!(cb.acquire(&peer).is_err());
        cb.record_success(&peer);
        assert_eq!(cb.state(&peer), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let (_dir, cb) = breakers(1, 0.0, 1);
        let peer = nid(4);
        cb.record_failure(&peer);
        cb.acquire(&peer).expect("trial");
        cb.record_failure(&peer);
        assert_eq!(cb.state(&peer), BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_streak() {
        let (_dir, cb) = breakers(3, 60.0, 1);
        let peer = nid(5);
        cb.record_failure(&peer);
        cb.record_failure(&peer);
        cb.record_success(&peer);
        cb.record_failure(&peer);
        cb.record_failure(&peer);
        assert_eq!(cb.state(&peer), BreakerState::Closed);
    }
}
