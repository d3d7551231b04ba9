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

//! The P2P node: owns every singleton component, accepts inbound sessions,
//! dispatches JSON-RPC between local agents and remote peers, and applies
//! rate limiting, authorization, circuit breaking, and retry along the way.

use crate::core::config::{parse_ws_addr, NodeConfig};
use crate::core::security::audit::{AuditError, AuditKind, AuditLog, AuditQuery};
use crate::core::security::authorizer::{AuthError, Authorizer, Permission};
use crate::core::security::identity::{IdentityError, NodeIdentity};
use crate::core::security::trust::{TrustError, TrustManager};
use crate::core::types::{
    parse_method, MethodTarget, NodeId, RpcError, RpcRequest, RpcResponse, RPC_DRAINING,
    RPC_INTERNAL_ERROR, RPC_METHOD_NOT_FOUND, RPC_PARSE_ERROR, RPC_RATE_LIMITED, RPC_UNAUTHORIZED,
};
use crate::monitoring::metrics::{Metrics, MetricsError};
use crate::networking::agent_registry::{AgentRegistry, Capability, RegistrySnapshot};
use crate::networking::circuit_breaker::{CircuitBreakers, CircuitOpen};
use crate::networking::discovery::{self, DiscoveryConfig, PeerSample, SampledPeer};
use crate::networking::peer_registry::{PeerRegistry, PeerRegistryError};
use crate::networking::rate_limit::RateLimiter;
use crate::networking::retry::{RetryError, RetryPolicy};
use crate::networking::transport::{self, SecureSession, TransportError};
use crate::networking::validator::{PeerValidator, RejectUnknown, ValidatorError};
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Deadline applied to every outbound request.
pub const REQUEST_DEADLINE: Duration = Duration::from_secs(30);
/// Bounded per-session send queue, in frames.
pub const SEND_QUEUE_FRAMES: usize = 256;
/// Grace period for in-flight requests while draining.
const DRAIN_WAIT: Duration = Duration::from_secs(5);

/// Node errors.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Identity could not be loaded or created.
    #[error(transparent)]
    Identity(#[from] IdentityError),
    /// Audit log could not be opened.
    #[error(transparent)]
    Audit(#[from] AuditError),
    /// Trust store failure.
    #[error(transparent)]
    Trust(#[from] TrustError),
    /// Permission store failure.
    #[error(transparent)]
    Auth(#[from] AuthError),
    /// Peer registry failure.
    #[error(transparent)]
    Peers(#[from] PeerRegistryError),
    /// Metrics registration failure.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
    /// A listener could not be bound.
    #[error("listener bind failed")]
    Bind,
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Validator refused the peer.
    #[error(transparent)]
    Validator(#[from] ValidatorError),
    /// Breaker refused the call.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
    /// Connection retries exhausted; wraps the last transport error.
    #[error("retry exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Attempts made.
        attempts: u32,
        /// Last transport error.
        #[source]
        last: TransportError,
    },
    /// No address known for the requested peer.
    #[error("unknown peer")]
    UnknownPeer,
    /// The outbound request deadline elapsed.
    #[error("request timeout")]
    Timeout,
    /// The session closed before the reply arrived.
    #[error("session closed")]
    SessionClosed,
    /// The node is draining and refuses new work.
    #[error("draining")]
    Draining,
}

/// Router lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, not yet serving.
    Initial,
    /// Serving requests.
    Running,
    /// Refusing new inbound requests, finishing in-flight ones.
    Draining,
    /// Fully stopped.
    Stopped,
}

/// Peer connection state, tracked per peer for observability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No session.
    Disconnected,
    /// Dial in progress.
    Connecting,
    /// WebSocket up, key exchange in progress.
    Handshaking,
    /// Session established; sends permitted.
    Connected,
    /// Session ended cleanly.
    Closed,
    /// Session ended with an error.
    Failed,
}

/// Boxed future returned by agent handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

/// A local agent's operation handler. Out-of-scope collaborators implement
/// this seam; handlers receive decoded params and return a result or error.
pub trait AgentHandler: Send + Sync {
    /// Handle `op` with `params`.
    fn call(&self, op: String, params: Value) -> HandlerFuture;
}

impl<F> AgentHandler for F
where
    F: Fn(String, Value) -> HandlerFuture + Send + Sync,
{
    fn call(&self, op: String, params: Value) -> HandlerFuture {
        self(op, params)
    }
}

#[derive(Clone)]
struct SessionHandle {
    out_tx: mpsc::Sender<Value>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>,
}

struct SessionEntry {
    handle: SessionHandle,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

/// The P2P node. Cheap to clone; all state lives behind one `Arc`.
#[derive(Clone)]
pub struct P2pNode {
    inner: Arc<NodeInner>,
}

pub(crate) struct NodeInner {
    cfg: NodeConfig,
    identity: Arc<NodeIdentity>,
    audit: Arc<AuditLog>,
    trust: Arc<TrustManager>,
    authorizer: Arc<Authorizer>,
    validator: Arc<PeerValidator>,
    peers: Arc<PeerRegistry>,
    agents: Arc<AgentRegistry>,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakers>,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,

    sessions: Mutex<HashMap<NodeId, SessionEntry>>,
    conn_states: Mutex<HashMap<NodeId, ConnState>>,
    handlers: RwLock<HashMap<String, Arc<dyn AgentHandler>>>,
    agent_order: Mutex<Vec<String>>,

    lifecycle_tx: watch::Sender<Lifecycle>,
    lifecycle_rx: watch::Receiver<Lifecycle>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    local_addr: SocketAddr,
    ready: AtomicBool,
    in_flight: AtomicU64,
    next_req_id: AtomicU64,
    started_at: Instant,
}

impl P2pNode {
    /// Boot sequence: identity, trust/peer stores, audit log, WS listener,
    /// background tasks (accept loop, registry writer, discovery).
    pub async fn start(cfg: NodeConfig) -> Result<Self, NodeError> {
        let data_root = cfg.data_root.clone();
        let identity = Arc::new(NodeIdentity::load_or_create(&data_root)?);
        let audit = Arc::new(AuditLog::open(
            &data_root,
            identity.node_id().clone(),
            cfg.security.audit_log_enabled,
        )?);
        let trust = Arc::new(
            TrustManager::load(&data_root, audit.clone())?
                .with_default_level(cfg.security.trust_default),
        );
        let authorizer = Arc::new(Authorizer::load(&data_root)?);
        let peers = Arc::new(PeerRegistry::load(&data_root)?);
        let agents = Arc::new(AgentRegistry::new(identity.node_id().clone()));
        let validator = Arc::new(PeerValidator::new(
            trust.clone(),
            audit.clone(),
            RejectUnknown::new(cfg.security.reject_unknown),
        ));
        let limiter = Arc::new(RateLimiter::new(cfg.resilience.rate_limit.clone()));
        let breakers = Arc::new(CircuitBreakers::new(
            cfg.resilience.circuit_breaker.clone(),
            audit.clone(),
        ));
        let retry = RetryPolicy::new(cfg.resilience.retry.clone());
        let metrics = Arc::new(Metrics::new()?);

        let bind = parse_ws_addr(&cfg.node.address).ok_or(NodeError::Bind)?;
        let listener = TcpListener::bind(&bind).await.map_err(|_| NodeError::Bind)?;
        let local_addr = listener.local_addr().map_err(|_| NodeError::Bind)?;

        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Initial);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(NodeInner {
            cfg,
            identity,
            audit,
            trust,
            authorizer,
            validator,
            peers,
            agents,
            limiter,
            breakers,
            retry,
            metrics,
            sessions: Mutex::new(HashMap::new()),
            conn_states: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            agent_order: Mutex::new(Vec::new()),
            lifecycle_tx,
            lifecycle_rx,
            shutdown_tx,
            shutdown_rx,
            local_addr,
            ready: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            next_req_id: AtomicU64::new(0),
            started_at: Instant::now(),
        });
        let node = P2pNode { inner };

        node.inner.peers.spawn_writer(node.inner.shutdown_rx.clone());
        node.spawn_accept_loop(listener);
        node.inner.lifecycle_tx.send_replace(Lifecycle::Running);

        if node.inner.cfg.observability.metrics_port > 0 {
            crate::monitoring::health::spawn(
                node.clone(),
                node.inner.cfg.observability.metrics_port,
                node.inner.cfg.observability.health_check_enabled,
            )
            .await
            .map_err(|_| NodeError::Bind)?;
        }

        discovery::spawn(node.clone(), DiscoveryConfig::from_node_config(&node.inner.cfg));
        info!(node_id = %node.node_id(), addr = %local_addr, "node started");
        Ok(node)
    }

    fn spawn_accept_loop(&self, listener: TcpListener) {
        let node = self.clone();
        tokio::spawn(async move {
            let mut shutdown = node.inner.shutdown_rx.clone();
            loop {
                tokio::select! {
                    res = listener.accept() => {
                        let Ok((stream, remote)) = res else { continue };
                        if *node.inner.lifecycle_rx.borrow() != Lifecycle::Running {
                            continue;
                        }
                        let node = node.clone();
                        tokio::spawn(async move {
                            node.accept_inbound(stream, remote).await;
                        });
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    async fn accept_inbound(&self, stream: TcpStream, remote: SocketAddr) {
        let inner = &self.inner;
        match transport::accept(
            stream,
            inner.identity.clone(),
            &inner.validator,
            inner.cfg.node.enable_encryption,
        )
        .await
        {
            Ok(session) => {
                let peer = session.peer().clone();
                let peer_key = hex::encode(session.peer_public());
                // The validator has accepted the peer; only now does it enter
                // the registry.
                inner.peers.observe(&peer, "", Some(peer_key));
                inner.metrics.peers_known.set(inner.peers.len() as i64);
                self.audit_conn("peer_connected", &peer, true);
                self.install_session(session);
            }
            Err(e) => {
                inner.metrics.signature_failures_total.inc();
                debug!(%remote, err = %e, "inbound handshake failed");
            }
        }
    }

    fn install_session(&self, session: SecureSession) -> SessionHandle {
        let inner = &self.inner;
        let peer = session.peer().clone();
        let (reader, writer) = session.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Value>(SEND_QUEUE_FRAMES);
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(payload) = out_rx.recv().await {
                if let Err(e) = writer.send(&payload).await {
                    debug!(err = %e, "session write failed");
                    break;
                }
            }
            writer.close().await;
        });

        let reader_task = {
            let node = self.clone();
            let peer = peer.clone();
            let pending = pending.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let mut reader = reader;
                let clean = loop {
                    match reader.recv().await {
                        Ok(Some(value)) => {
                            if route_response(&pending, &value) {
                                continue;
                            }
                            node.inner.in_flight.fetch_add(1, Ordering::SeqCst);
                            let reply = node.handle_rpc(&peer, value).await;
                            node.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                            if let Some(reply) = reply {
                                let sent =
                                    tokio::time::timeout(REQUEST_DEADLINE, out_tx.send(reply)).await;
                                match sent {
                                    Ok(Ok(())) => {}
                                    _ => break false,
                                }
                            }
                        }
                        Ok(None) => break true,
                        Err(e) => {
                            node.inner.metrics.transport_errors_total.inc();
                            debug!(peer = %peer, err = %e, "session read failed");
                            break false;
                        }
                    }
                };
                node.teardown_session(&peer, clean);
            })
        };

        let handle = SessionHandle { out_tx, pending };
        let previous = {
            let mut sessions = lock(&inner.sessions);
            sessions.insert(
                peer.clone(),
                SessionEntry {
                    handle: handle.clone(),
                    reader_task,
                    writer_task,
                },
            )
        };
        if let Some(old) = previous {
            old.reader_task.abort();
            old.writer_task.abort();
        } else {
            inner.metrics.peers_connected.inc();
        }
        lock(&inner.conn_states).insert(peer, ConnState::Connected);
        handle
    }

    fn teardown_session(&self, peer: &NodeId, clean: bool) {
        let inner = &self.inner;
        let removed = lock(&inner.sessions).remove(peer);
        if let Some(entry) = removed {
            entry.writer_task.abort();
            inner.metrics.peers_connected.dec();
            lock(&inner.conn_states).insert(
                peer.clone(),
                if clean { ConnState::Closed } else { ConnState::Failed },
            );
            self.audit_conn("peer_disconnected", peer, clean);
        }
    }

    fn session_handle(&self, peer: &NodeId) -> Option<SessionHandle> {
        lock(&self.inner.sessions).get(peer).map(|e| e.handle.clone())
    }

    /// Peers with an established session.
    pub fn connected_peers(&self) -> Vec<NodeId> {
        lock(&self.inner.sessions).keys().cloned().collect()
    }

    /// Per-peer connection states.
    pub fn connection_states(&self) -> HashMap<NodeId, ConnState> {
        lock(&self.inner.conn_states).clone()
    }

    /// Open (or reuse) a session to a peer already known to the registry.
    pub async fn connect_to_peer(&self, peer: &NodeId) -> Result<(), NodeError> {
        if let Some(_handle) = self.session_handle(peer) {
            return Ok(());
        }
        let record = self.inner.peers.get(peer).ok_or(NodeError::UnknownPeer)?;
        self.dial_known_peer(peer, &record.address).await
    }

    async fn dial_known_peer(&self, peer: &NodeId, address: &str) -> Result<(), NodeError> {
        let inner = &self.inner;
        inner.validator.can_connect(peer)?;
        inner.breakers.acquire(peer)?;
        lock(&inner.conn_states).insert(peer.clone(), ConnState::Connecting);

        let result = inner
            .retry
            .run(|| {
                lock(&inner.conn_states).insert(peer.clone(), ConnState::Handshaking);
                transport::connect(
                    address,
                    inner.identity.clone(),
                    &inner.validator,
                    Some(peer),
                    inner.cfg.node.enable_encryption,
                )
            })
            .await;

        match result {
            Ok(session) => {
                inner.breakers.record_success(peer);
                inner
                    .peers
                    .observe(peer, address, Some(hex::encode(session.peer_public())));
                inner.peers.record_success(peer);
                self.audit_conn("peer_connected", peer, true);
                self.install_session(session);
                inner.metrics.breakers_open.set(inner.breakers.open_count() as i64);
                Ok(())
            }
            Err(err) => {
                inner.breakers.record_failure(peer);
                inner.peers.record_failure(peer);
                lock(&inner.conn_states).insert(peer.clone(), ConnState::Failed);
                inner.metrics.transport_errors_total.inc();
                inner.metrics.breakers_open.set(inner.breakers.open_count() as i64);
                self.audit_conn("connect_failed", peer, false);
                Err(match err {
                    RetryError::Exhausted { attempts, last } => {
                        NodeError::RetryExhausted { attempts, last }
                    }
                    RetryError::Fatal(e) => NodeError::Transport(e),
                })
            }
        }
    }

    /// Dial a bare address (bootstrap); the peer's identity is learned from
    /// the handshake. Returns the connected peer id.
    pub async fn connect_to_address(&self, address: &str) -> Result<NodeId, NodeError> {
        let inner = &self.inner;
        let result = inner
            .retry
            .run(|| {
                transport::connect(
                    address,
                    inner.identity.clone(),
                    &inner.validator,
                    None,
                    inner.cfg.node.enable_encryption,
                )
            })
            .await;
        let session = result.map_err(|err| match err {
            RetryError::Exhausted { attempts, last } => NodeError::RetryExhausted { attempts, last },
            RetryError::Fatal(e) => NodeError::Transport(e),
        })?;

        let peer = session.peer().clone();
        inner
            .peers
            .observe(&peer, address, Some(hex::encode(session.peer_public())));
        inner.peers.record_success(&peer);
        inner.breakers.record_success(&peer);
        inner.metrics.peers_known.set(inner.peers.len() as i64);
        self.audit_conn("peer_connected", &peer, true);
        self.install_session(session);
        Ok(peer)
    }

    /// Send a request to a peer and await its reply under the 30 s deadline.
    /// The caller's request id is restored on the returned response.
    pub async fn request_peer(
        &self,
        peer: &NodeId,
        request: RpcRequest,
    ) -> Result<RpcResponse, NodeError> {
        self.connect_to_peer(peer).await?;
        let handle = self.session_handle(peer).ok_or(NodeError::SessionClosed)?;

        let original_id = request.id.clone();
        let internal_id = self.inner.next_req_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut wire = request;
        wire.id = Some(json!(internal_id));

        let (tx, rx) = oneshot::channel();
        lock(&handle.pending).insert(internal_id, tx);

        let payload = match serde_json::to_value(&wire) {
            Ok(v) => v,
            Err(_) => {
                lock(&handle.pending).remove(&internal_id);
                return Err(NodeError::SessionClosed);
            }
        };

        let deadline = Instant::now() + REQUEST_DEADLINE;
        let queued = tokio::time::timeout_at(deadline.into(), handle.out_tx.send(payload)).await;
        match queued {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                lock(&handle.pending).remove(&internal_id);
                return Err(NodeError::SessionClosed);
            }
            Err(_) => {
                lock(&handle.pending).remove(&internal_id);
                self.inner.breakers.record_failure(peer);
                return Err(NodeError::Timeout);
            }
        }

        match tokio::time::timeout_at(deadline.into(), rx).await {
            Ok(Ok(mut resp)) => {
                resp.id = original_id.unwrap_or(Value::Null);
                Ok(resp)
            }
            Ok(Err(_)) => Err(NodeError::SessionClosed),
            Err(_) => {
                // Deadline: cancel the forwarded request and charge the breaker.
                lock(&handle.pending).remove(&internal_id);
                self.inner.breakers.record_failure(peer);
                Err(NodeError::Timeout)
            }
        }
    }

    /// Fire-and-forget notification (no reply expected).
    pub async fn notify_peer(&self, peer: &NodeId, request: RpcRequest) -> Result<(), NodeError> {
        self.connect_to_peer(peer).await?;
        let handle = self.session_handle(peer).ok_or(NodeError::SessionClosed)?;
        let mut wire = request;
        wire.id = None;
        let payload = serde_json::to_value(&wire).map_err(|_| NodeError::SessionClosed)?;
        tokio::time::timeout(REQUEST_DEADLINE, handle.out_tx.send(payload))
            .await
            .map_err(|_| NodeError::Timeout)?
            .map_err(|_| NodeError::SessionClosed)
    }

    /// Register a local agent: installs the handler, enters the distributed
    /// registry, and broadcasts a gossip delta to connected peers.
    pub fn register_local_agent(
        &self,
        agent_id: &str,
        name: &str,
        description: &str,
        capabilities: Vec<Capability>,
        handler: Arc<dyn AgentHandler>,
    ) {
        {
            let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
            handlers.insert(agent_id.to_string(), handler);
        }
        {
            let mut order = lock(&self.inner.agent_order);
            if !order.iter().any(|a| a == agent_id) {
                order.push(agent_id.to_string());
            }
        }
        self.inner
            .agents
            .register_local(agent_id, name, description, capabilities);
        self.broadcast_agent_delta();
    }

    /// Remove a local agent and tombstone it in the distributed registry.
    pub fn unregister_local_agent(&self, agent_id: &str) {
        {
            let mut handlers = self.inner.handlers.write().unwrap_or_else(|e| e.into_inner());
            handlers.remove(agent_id);
        }
        lock(&self.inner.agent_order).retain(|a| a != agent_id);
        self.inner.agents.unregister_local(agent_id);
        self.broadcast_agent_delta();
    }

    fn broadcast_agent_delta(&self) {
        let node = self.clone();
        tokio::spawn(async move {
            let snapshot = node.inner.agents.snapshot();
            let Ok(params) = serde_json::to_value(&snapshot) else { return };
            for peer in node.connected_peers() {
                let req = RpcRequest {
                    jsonrpc: "2.0".to_string(),
                    id: None,
                    method: "gossip/agents".to_string(),
                    params: Some(params.clone()),
                };
                if let Err(e) = node.notify_peer(&peer, req).await {
                    debug!(peer = %peer, err = %e, "agent delta broadcast failed");
                }
            }
        });
    }

    /// Inbound pipeline for one decoded JSON-RPC payload from `sender`.
    /// Returns the reply payload, or `None` for notifications.
    pub async fn handle_rpc(&self, sender: &NodeId, payload: Value) -> Option<Value> {
        let start = Instant::now();
        let inner = &self.inner;
        inner.metrics.requests_inbound_total.inc();

        if *inner.lifecycle_rx.borrow() != Lifecycle::Running {
            let id = payload.get("id").cloned()?;
            return error_value(id, RpcError::new(RPC_DRAINING, "draining"));
        }

        let req: RpcRequest = match serde_json::from_value(payload) {
            Ok(req) => req,
            Err(_) => {
                inner.metrics.parse_errors_total.inc();
                inner.metrics.requests_failed_total.inc();
                return error_value(Value::Null, RpcError::new(RPC_PARSE_ERROR, "parse error"));
            }
        };
        if req.jsonrpc != "2.0" {
            inner.metrics.parse_errors_total.inc();
            inner.metrics.requests_failed_total.inc();
            return error_value(
                req.id.unwrap_or(Value::Null),
                RpcError::new(RPC_PARSE_ERROR, "parse error"),
            );
        }

        let target = match parse_method(&req.method) {
            Ok(t) => t,
            Err(_) => {
                inner.metrics.requests_failed_total.inc();
                return req.id.and_then(|id| {
                    error_value(id, RpcError::new(RPC_METHOD_NOT_FOUND, "method not found"))
                });
            }
        };

        let is_remote_sender = sender != inner.identity.node_id();

        // Rate limit remote senders before anything touches a handler.
        if is_remote_sender {
            let decision = inner.limiter.check(sender);
            if !decision.allowed {
                inner.metrics.rate_limited_total.inc();
                inner.metrics.requests_failed_total.inc();
                let mut meta = BTreeMap::new();
                meta.insert("retry_after".to_string(), json!(decision.retry_after));
                inner
                    .audit
                    .record(AuditKind::Data, "rate_limited", Some(sender), false, meta);
                return req.id.and_then(|id| {
                    error_value(
                        id,
                        RpcError::new(RPC_RATE_LIMITED, "rate limit exceeded")
                            .with_data(json!({ "retry_after": decision.retry_after })),
                    )
                });
            }
        }

        // Authorization gate: exactly one ACCESS_DENIED audit event per denial,
        // and the handler is never invoked. A handshake-verified peer holds
        // PEER_MESSAGE implicitly; agent execution always needs a grant.
        let required = match &target {
            MethodTarget::Node(_) | MethodTarget::Gossip(_) => Permission::PeerMessage,
            MethodTarget::Agent { .. } => Permission::AgentExecute,
        };
        let authorized = !is_remote_sender
            || inner.authorizer.check(sender, required)
            || (required == Permission::PeerMessage
                && inner.trust.level(sender) >= crate::core::security::trust::TrustLevel::Verified);
        if !authorized {
            inner.metrics.access_denied_total.inc();
            inner.metrics.requests_failed_total.inc();
            let mut meta = BTreeMap::new();
            meta.insert("method".to_string(), json!(req.method));
            inner.audit.record(
                AuditKind::Authorization,
                "access_denied",
                Some(sender),
                false,
                meta,
            );
            return req
                .id
                .and_then(|id| error_value(id, RpcError::new(RPC_UNAUTHORIZED, "unauthorized")));
        }

        let outcome = match target {
            MethodTarget::Node(op) => self.handle_node_op(&op, req.params.clone()).await,
            MethodTarget::Gossip(op) => self.handle_gossip_op(&op, req.params.clone()).await,
            MethodTarget::Agent { node: Some(node), .. }
                if &node != inner.identity.node_id() =>
            {
                inner.metrics.requests_forwarded_total.inc();
                let reply = self.forward(&node, req).await;
                inner
                    .metrics
                    .request_latency_seconds
                    .observe(start.elapsed().as_secs_f64());
                return reply;
            }
            MethodTarget::Agent { agent, op, .. } => self.dispatch_local_agent(agent, op, req.params.clone()).await,
        };

        inner
            .metrics
            .request_latency_seconds
            .observe(start.elapsed().as_secs_f64());

        let id = req.id?;
        match outcome {
            Ok(result) => serde_json::to_value(RpcResponse::result(id, result)).ok(),
            Err(err) => {
                inner.metrics.requests_failed_total.inc();
                error_value(id, err)
            }
        }
    }

    async fn forward(&self, target: &NodeId, req: RpcRequest) -> Option<Value> {
        let original_id = req.id.clone();
        if original_id.is_none() {
            // Forwarded notification: best-effort, nothing to proxy back.
            let _ = self.notify_peer(target, req).await;
            return None;
        }
        match self.request_peer(target, req).await {
            // `request_peer` restored the caller's id; proxy unchanged.
            Ok(resp) => serde_json::to_value(resp).ok(),
            Err(e) => {
                self.inner.metrics.requests_failed_total.inc();
                error_value(original_id.unwrap_or(Value::Null), node_error_to_rpc(&e))
            }
        }
    }

    async fn handle_node_op(&self, op: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match op {
            "list_agents" => {
                let available_only = params
                    .as_ref()
                    .and_then(|p| p.get("available_only"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                serde_json::to_value(self.inner.agents.list_agents(available_only))
                    .map_err(|_| RpcError::new(RPC_INTERNAL_ERROR, "internal error"))
            }
            "list_peers" => serde_json::to_value(self.inner.peers.list())
                .map_err(|_| RpcError::new(RPC_INTERNAL_ERROR, "internal error")),
            "get_info" => Ok(json!({
                "node_id": self.node_id().as_str(),
                "address": self.advertised_address(),
                "version": env!("CARGO_PKG_VERSION"),
                "agents": self.inner.agents.len(),
                "peers": self.inner.peers.len(),
            })),
            _ => Err(RpcError::new(RPC_METHOD_NOT_FOUND, "method not found")),
        }
    }

    async fn handle_gossip_op(&self, op: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match op {
            "peers" => {
                let sample: PeerSample = serde_json::from_value(params.unwrap_or(Value::Null))
                    .map_err(|_| RpcError::new(RPC_PARSE_ERROR, "parse error"))?;
                self.merge_peer_sample(&sample);
                let ours = self.peer_sample(discovery::DEFAULT_SAMPLE);
                serde_json::to_value(ours)
                    .map_err(|_| RpcError::new(RPC_INTERNAL_ERROR, "internal error"))
            }
            "agents" => {
                let snapshot: RegistrySnapshot =
                    serde_json::from_value(params.unwrap_or(Value::Null))
                        .map_err(|_| RpcError::new(RPC_PARSE_ERROR, "parse error"))?;
                self.inner
                    .agents
                    .merge(&snapshot)
                    .map_err(|_| RpcError::new(RPC_PARSE_ERROR, "unsupported snapshot"))?;
                serde_json::to_value(self.inner.agents.snapshot())
                    .map_err(|_| RpcError::new(RPC_INTERNAL_ERROR, "internal error"))
            }
            _ => Err(RpcError::new(RPC_METHOD_NOT_FOUND, "method not found")),
        }
    }

    /// Merge an advisory peer sample from gossip or discovery.
    pub fn merge_peer_sample(&self, sample: &PeerSample) {
        for peer in &sample.peers {
            if &peer.node_id == self.node_id() || peer.address.is_empty() {
                continue;
            }
            self.inner.peers.observe(&peer.node_id, &peer.address, None);
        }
        self.inner.metrics.peers_known.set(self.inner.peers.len() as i64);
    }

    /// A bounded sample of known peers for gossip replies.
    pub fn peer_sample(&self, n: usize) -> PeerSample {
        PeerSample {
            version: 1,
            peers: self
                .inner
                .peers
                .sample(n)
                .into_iter()
                .map(|r| SampledPeer {
                    node_id: r.node_id,
                    address: r.address,
                })
                .filter(|p| !p.address.is_empty())
                .collect(),
        }
    }

    async fn dispatch_local_agent(
        &self,
        agent: Option<String>,
        op: String,
        params: Option<Value>,
    ) -> Result<Value, RpcError> {
        let agent_id = match agent {
            Some(a) => a,
            None => lock(&self.inner.agent_order)
                .first()
                .cloned()
                .ok_or_else(|| RpcError::new(RPC_METHOD_NOT_FOUND, "method not found"))?,
        };
        let handler = {
            let handlers = self.inner.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&agent_id).cloned()
        };
        let Some(handler) = handler else {
            return Err(RpcError::new(RPC_METHOD_NOT_FOUND, "method not found"));
        };

        let fut = handler.call(op, params.unwrap_or(Value::Null));
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.inner.metrics.handler_errors_total.inc();
                Err(err)
            }
            Err(_) => {
                self.inner.metrics.handler_errors_total.inc();
                Err(RpcError::new(RPC_INTERNAL_ERROR, "internal error"))
            }
        }
    }

    /// DRAINING: refuse new inbound requests, let in-flight ones finish, then
    /// close every session and stop background tasks.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.lifecycle_tx.send_replace(Lifecycle::Draining);

        let deadline = Instant::now() + DRAIN_WAIT;
        while inner.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let entries: Vec<SessionEntry> = {
            let mut sessions = lock(&inner.sessions);
            sessions.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            entry.reader_task.abort();
            entry.writer_task.abort();
        }
        inner.metrics.peers_connected.set(0);

        let _ = inner.shutdown_tx.send(true);
        let _ = inner.peers.flush();
        inner.lifecycle_tx.send_replace(Lifecycle::Stopped);
        info!(node_id = %self.node_id(), "node stopped");
    }

    fn audit_conn(&self, event: &str, peer: &NodeId, success: bool) {
        self.inner
            .audit
            .record(AuditKind::Connection, event, Some(peer), success, BTreeMap::new());
    }

    /// This node's id.
    pub fn node_id(&self) -> &NodeId {
        self.inner.identity.node_id()
    }

    /// Actual bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Dialable `ws://` URL for the bound listener.
    pub fn advertised_address(&self) -> String {
        format!("ws://{}", self.inner.local_addr)
    }

    /// Lifecycle snapshot.
    pub fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle_rx.borrow()
    }

    /// Ready once bootstrap completed and the listener is bound.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_ready(&self) {
        self.inner.ready.store(true, Ordering::Relaxed);
    }

    /// Seconds since boot.
    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// Shutdown signal receiver for background tasks.
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_rx.clone()
    }

    /// Node configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.inner.cfg
    }

    /// Trust manager.
    pub fn trust(&self) -> &Arc<TrustManager> {
        &self.inner.trust
    }

    /// Authorizer.
    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.inner.authorizer
    }

    /// Audit log.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.inner.audit
    }

    /// Peer registry.
    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.inner.peers
    }

    /// Distributed agent registry.
    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.inner.agents
    }

    /// Circuit breaker table.
    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.inner.breakers
    }

    /// Peer validator.
    pub fn validator(&self) -> &Arc<PeerValidator> {
        &self.inner.validator
    }

    /// Metrics registry.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Count of audit events with the given name (test/ops helper).
    pub fn audit_event_count(&self, event: &str) -> usize {
        self.inner
            .audit
            .query(&AuditQuery {
                event: Some(event.to_string()),
                ..Default::default()
            })
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn route_response(
    pending: &Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>,
    value: &Value,
) -> bool {
    if value.get("method").is_some() {
        return false;
    }
    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        return false;
    };
    if value.get("result").is_none() && value.get("error").is_none() {
        return false;
    }
    let Ok(resp) = serde_json::from_value::<RpcResponse>(value.clone()) else {
        return false;
    };
    if let Some(tx) = lock(pending).remove(&id) {
        let _ = tx.send(resp);
    }
    true
}

fn error_value(id: Value, err: RpcError) -> Option<Value> {
    serde_json::to_value(RpcResponse::error(id, err)).ok()
}

fn node_error_to_rpc(err: &NodeError) -> RpcError {
    match err {
        NodeError::CircuitOpen(open) => RpcError::new(RPC_INTERNAL_ERROR, "circuit open")
            .with_data(json!({ "circuit_state": "open", "retry_in": open.retry_in })),
        NodeError::Timeout => RpcError::new(RPC_INTERNAL_ERROR, "request timeout"),
        NodeError::UnknownPeer => RpcError::new(RPC_INTERNAL_ERROR, "unknown peer"),
        NodeError::Validator(_) => RpcError::new(RPC_UNAUTHORIZED, "unauthorized"),
        _ => RpcError::new(RPC_INTERNAL_ERROR, "transport error"),
    }
}
