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

//! Retry policy: exponential backoff with jitter over transient errors only.
//!
//! Circuit-open, signature, rate-limit, and authorization failures are never
//! retried; they surface immediately as `RetryError::Fatal`.

use crate::core::config::RetrySection;
use crate::core::security::crypto::random_u64;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Retry outcome.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All attempts failed with transient errors; wraps the last cause.
    #[error("retry exhausted after {attempts} attempts")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Last transient error.
        #[source]
        last: E,
    },
    /// A non-retryable error surfaced; reported without further attempts.
    #[error(transparent)]
    Fatal(E),
}

impl<E> RetryError<E> {
    /// The wrapped cause, whichever variant.
    pub fn into_cause(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal(e) => e,
        }
    }
}

/// Errors eligible for retry declare themselves transient.
pub trait Retryable {
    /// True for connection refusal, timeout, and generic socket errors.
    fn is_transient(&self) -> bool;
}

/// Exponential backoff policy.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    cfg: RetrySection,
}

impl RetryPolicy {
    /// Build from config.
    pub fn new(cfg: RetrySection) -> Self {
        Self { cfg }
    }

    /// Backoff before attempt `n` (1-based, applied after attempt `n` fails),
    /// jittered +/-25 %.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .cfg
            .initial_delay
            .max(0.0)
            * self.cfg.exponential_base.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.cfg.max_delay.max(0.0));
        // Uniform jitter in [0.75, 1.25).
        let unit = (random_u64() >> 11) as f64 / (1u64 << 53) as f64;
        Duration::from_secs_f64(capped * (0.75 + 0.5 * unit))
    }

    /// Run `op` up to `max_attempts` times, sleeping between transient
    /// failures. Either the operation observably succeeded once, or the final
    /// error is reported.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.cfg.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    if attempt >= attempts {
                        return Err(RetryError::Exhausted { attempts, last: e });
                    }
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) => return Err(RetryError::Fatal(e)),
            }
        }
    }
}
