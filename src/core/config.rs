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

//! Node configuration: YAML file overlaid with `DAWN_*` environment variables.

use crate::core::security::trust::TrustLevel;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Cannot read config file.
    #[error("read config")]
    Read,
    /// Cannot parse YAML.
    #[error("parse config")]
    Parse,
    /// A value failed validation.
    #[error("invalid config value: {0}")]
    Invalid(&'static str),
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str) -> Option<bool> {
    env(key).map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
}

/// Listener and dialing options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Listen URL for the WS transport, `ws://host:port`.
    pub address: String,
    /// If false, permit plaintext framing (non-prod only).
    pub enable_encryption: bool,
    /// Initial peer addresses to dial.
    pub bootstrap_nodes: Vec<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            address: "ws://127.0.0.1:8420".to_string(),
            enable_encryption: true,
            bootstrap_nodes: Vec::new(),
        }
    }
}

/// Trust and audit policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// If true, UNKNOWN peers cannot connect.
    pub reject_unknown: bool,
    /// Level assigned to newly seen nodes.
    pub trust_default: TrustLevel,
    /// Suppress audit writes if false (non-prod only).
    pub audit_log_enabled: bool,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            reject_unknown: false,
            trust_default: TrustLevel::Unknown,
            audit_log_enabled: true,
        }
    }
}

/// Per-remote-node token bucket options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Requests granted to a cold bucket per window.
    pub max_requests: u32,
    /// Refill window, seconds.
    pub time_window: f64,
    /// Bucket ceiling.
    pub burst: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_requests: 60,
            time_window: 60.0,
            burst: 100,
        }
    }
}

/// Per-peer circuit breaker options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before a trial is allowed.
    pub timeout: f64,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: 60.0,
            success_threshold: 1,
        }
    }
}

/// Connection retry options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// First backoff delay, seconds.
    pub initial_delay: f64,
    /// Backoff ceiling, seconds.
    pub max_delay: f64,
    /// Backoff multiplier.
    pub exponential_base: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: 1.0,
            max_delay: 10.0,
            exponential_base: 2.0,
        }
    }
}

/// Resilience knobs (rate limiting, breaker, retry).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    /// Token bucket per remote node.
    pub rate_limit: RateLimitSection,
    /// Per-peer circuit breaker.
    pub circuit_breaker: CircuitBreakerSection,
    /// Outbound connect retry policy.
    pub retry: RetrySection,
}

/// Log plumbing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Filter level (`error` | `warn` | `info` | `debug` | `trace`).
    pub level: String,
    /// `compact` or `json`.
    pub format: String,
    /// Optional log file path (stderr if absent).
    pub file: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
            file: None,
        }
    }
}

/// Health and metrics seam.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    /// TCP port for `/metrics` and health probes; 0 disables the listener.
    pub metrics_port: u16,
    /// Serve the health probe routes.
    pub health_check_enabled: bool,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            metrics_port: 9464,
            health_check_enabled: true,
        }
    }
}

/// Full node configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Listener/dial options.
    pub node: NodeSection,
    /// Trust and audit policy.
    pub security: SecuritySection,
    /// Rate limit, breaker, retry.
    pub resilience: ResilienceSection,
    /// Log plumbing.
    pub logging: LoggingSection,
    /// Health/metrics seam.
    pub observability: ObservabilitySection,
    /// Data root (overridden by `DATA_ROOT`).
    #[serde(skip)]
    pub data_root: PathBuf,
}

impl NodeConfig {
    /// Load from the YAML file at `DAWN_CONFIG` (or `config.yaml` if present),
    /// then overlay environment variables. A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = env("DAWN_CONFIG").unwrap_or_else(|| "config.yaml".to_string());
        let mut cfg: NodeConfig = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_yaml::from_str(&raw).map_err(|_| ConfigError::Parse)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => NodeConfig::default(),
            Err(_) => return Err(ConfigError::Read),
        };
        cfg.overlay_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `DAWN_*` / `DATA_ROOT` overrides on top of file values.
    pub fn overlay_env(&mut self) {
        if let Some(v) = env("DAWN_NODE_ADDRESS") {
            self.node.address = v;
        }
        if let Some(v) = env_bool("DAWN_ENABLE_ENCRYPTION") {
            self.node.enable_encryption = v;
        }
        if let Some(v) = env("DAWN_BOOTSTRAP_NODES") {
            self.node.bootstrap_nodes = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = env_bool("DAWN_REJECT_UNKNOWN") {
            self.security.reject_unknown = v;
        }
        if let Some(v) = env_bool("DAWN_AUDIT_LOG_ENABLED") {
            self.security.audit_log_enabled = v;
        }
        if let Some(v) = env("DAWN_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("DAWN_METRICS_PORT").and_then(|v| v.parse().ok()) {
            self.observability.metrics_port = v;
        }
        self.data_root = env("DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"));
    }

    fn validate(&self) -> Result<(), ConfigError> {
        parse_ws_addr(&self.node.address).ok_or(ConfigError::Invalid("node.address"))?;
        if self.resilience.rate_limit.max_requests == 0 {
            return Err(ConfigError::Invalid("rate_limit.max_requests"));
        }
        if self.resilience.rate_limit.burst < self.resilience.rate_limit.max_requests {
            return Err(ConfigError::Invalid("rate_limit.burst"));
        }
        if self.resilience.retry.exponential_base < 1.0 {
            return Err(ConfigError::Invalid("retry.exponential_base"));
        }
        Ok(())
    }
}

/// Parse `ws://host:port` into a bindable/dialable `host:port`.
pub fn parse_ws_addr(url: &str) -> Option<String> {
    let rest = url.strip_prefix("ws://")?;
    let rest = rest.split('/').next()?;
    let (host, port) = rest.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(rest.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = NodeConfig::default();
        assert!(cfg.node.enable_encryption);
        assert_eq!(cfg.resilience.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.resilience.retry.max_attempts, 3);
        assert!(cfg.security.audit_log_enabled);
    }

    #[test]
    fn yaml_sections_parse() {
        let raw = r#"
node:
  address: "ws://0.0.0.0:9000"
  enable_encryption: true
  bootstrap_nodes: ["ws://10.0.0.1:9000"]
security:
  reject_unknown: true
resilience:
  rate_limit:
    max_requests: 2
    time_window: 60
    burst: 2
"#;
        let cfg: NodeConfig = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(cfg.node.address, "ws://0.0.0.0:9000");
        assert!(cfg.security.reject_unknown);
        assert_eq!(cfg.resilience.rate_limit.max_requests, 2);
        // Untouched sections fall back to defaults.
        assert_eq!(cfg.resilience.circuit_breaker.timeout, 60.0);
    }

    #[test]
    fn ws_addr_parses() {
        assert_eq!(
            parse_ws_addr("ws://127.0.0.1:8420").as_deref(),
            Some("127.0.0.1:8420")
        );
        assert!(parse_ws_addr("http://x:1").is_none());
        assert!(parse_ws_addr("ws://nohost").is_none());
    }
}
