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

//! Per-remote-node token bucket rate limiting.
//!
//! A cold bucket holds `max_requests` tokens and refills at
//! `max_requests / time_window` per second up to the `burst` ceiling.

use crate::core::config::RateLimitSection;
use crate::core::types::NodeId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Outcome of a rate check.
#[derive(Clone, Copy, Debug)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Seconds until a token is available; 0 when allowed.
    pub retry_after: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket per remote node id.
pub struct RateLimiter {
    cfg: RateLimitSection,
    buckets: Mutex<HashMap<NodeId, Bucket>>,
}

impl RateLimiter {
    /// Build from config.
    pub fn new(cfg: RateLimitSection) -> Self {
        Self {
            cfg,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn refill_rate(&self) -> f64 {
        f64::from(self.cfg.max_requests) / self.cfg.time_window.max(f64::EPSILON)
    }

    /// Take one token for `node_id`, or report how long until one refills.
    pub fn check(&self, node_id: &NodeId) -> RateDecision {
        self.check_at(node_id, Instant::now())
    }

    fn check_at(&self, node_id: &NodeId, now: Instant) -> RateDecision {
        let rate = self.refill_rate();
        let burst = f64::from(self.cfg.burst);
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(node_id.clone()).or_insert_with(|| Bucket {
            tokens: f64::from(self.cfg.max_requests),
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateDecision {
                allowed: true,
                retry_after: 0.0,
            }
        } else {
            RateDecision {
                allowed: false,
                retry_after: ((1.0 - bucket.tokens) / rate).max(0.0),
            }
        }
    }

    /// Current token count (bounded by `burst`); used by invariant tests.
    pub fn tokens(&self, node_id: &NodeId) -> Option<f64> {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .map(|b| b.tokens)
    }
}
