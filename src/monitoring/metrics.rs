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

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Prometheus registration failure.
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Connected peer sessions gauge.
    pub peers_connected: IntGauge,
    /// Known peers in the registry gauge.
    pub peers_known: IntGauge,
    /// Open circuit breakers gauge.
    pub breakers_open: IntGauge,

    /// Inbound requests handled.
    pub requests_inbound_total: IntCounter,
    /// Requests proxied to other nodes.
    pub requests_forwarded_total: IntCounter,
    /// Requests answered with an error.
    pub requests_failed_total: IntCounter,
    /// Rate-limited requests.
    pub rate_limited_total: IntCounter,
    /// Authorization denials.
    pub access_denied_total: IntCounter,
    /// Handshake/frame signature failures.
    pub signature_failures_total: IntCounter,
    /// Malformed JSON-RPC payloads.
    pub parse_errors_total: IntCounter,
    /// Transport-level send/connect failures.
    pub transport_errors_total: IntCounter,
    /// Local handler failures wrapped into internal errors.
    pub handler_errors_total: IntCounter,

    /// Inbound request handling latency.
    pub request_latency_seconds: Histogram,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let peers_connected = IntGauge::new("dawn_peers_connected", "Connected peer sessions")
            .map_err(|_| MetricsError::Prom)?;
        let peers_known = IntGauge::new("dawn_peers_known", "Peers in the registry")
            .map_err(|_| MetricsError::Prom)?;
        let breakers_open = IntGauge::new("dawn_breakers_open", "Open circuit breakers")
            .map_err(|_| MetricsError::Prom)?;

        let requests_inbound_total =
            IntCounter::new("dawn_requests_inbound_total", "Inbound requests handled")
                .map_err(|_| MetricsError::Prom)?;
        let requests_forwarded_total =
            IntCounter::new("dawn_requests_forwarded_total", "Requests proxied to peers")
                .map_err(|_| MetricsError::Prom)?;
        let requests_failed_total =
            IntCounter::new("dawn_requests_failed_total", "Requests answered with an error")
                .map_err(|_| MetricsError::Prom)?;
        let rate_limited_total =
            IntCounter::new("dawn_rate_limited_total", "Rate-limited requests")
                .map_err(|_| MetricsError::Prom)?;
        let access_denied_total =
            IntCounter::new("dawn_access_denied_total", "Authorization denials")
                .map_err(|_| MetricsError::Prom)?;
        let signature_failures_total =
            IntCounter::new("dawn_signature_failures_total", "Signature failures")
                .map_err(|_| MetricsError::Prom)?;
        let parse_errors_total =
            IntCounter::new("dawn_parse_errors_total", "Malformed JSON-RPC payloads")
                .map_err(|_| MetricsError::Prom)?;
        let transport_errors_total =
            IntCounter::new("dawn_transport_errors_total", "Transport failures")
                .map_err(|_| MetricsError::Prom)?;
        let handler_errors_total =
            IntCounter::new("dawn_handler_errors_total", "Local handler failures")
                .map_err(|_| MetricsError::Prom)?;

        let request_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "dawn_request_latency_seconds",
            "Inbound request handling latency",
        ))
        .map_err(|_| MetricsError::Prom)?;

        registry
            .register(Box::new(peers_connected.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(peers_known.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(breakers_open.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(requests_inbound_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(requests_forwarded_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(requests_failed_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(rate_limited_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(access_denied_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(signature_failures_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(parse_errors_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(transport_errors_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(handler_errors_total.clone()))
            .map_err(|_| MetricsError::Prom)?;
        registry
            .register(Box::new(request_latency_seconds.clone()))
            .map_err(|_| MetricsError::Prom)?;

        Ok(Self {
            registry,
            peers_connected,
            peers_known,
            breakers_open,
            requests_inbound_total,
            requests_forwarded_total,
            requests_failed_total,
            rate_limited_total,
            access_denied_total,
            signature_failures_total,
            parse_errors_total,
            transport_errors_total,
            handler_errors_total,
            request_latency_seconds,
        })
    }
}
