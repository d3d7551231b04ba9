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

//! Encrypted WebSocket transport.
//!
//! Every WS text frame carries exactly one JSON wire frame. A connection
//! starts with a signed X25519 key exchange (validated by the peer
//! validator), after which data frames are AES-256-GCM over the inner
//! JSON-RPC payload, signed with the sender's long-term identity. Plaintext
//! data frames exist only for mutually-configured non-production setups and
//! still carry the handshake identification and per-frame signature.

use crate::core::security::crypto::{
    self, derive_shared, hkdf_sha256, sha256, x25519_generate, AeadKey, CryptoError, NONCE_LEN,
};
use crate::core::security::identity::NodeIdentity;
use crate::core::types::{NodeId, WireFrame};
use crate::networking::retry::Retryable;
use crate::networking::validator::{PeerValidator, ValidatorError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    accept_async, connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::debug;

/// Handshake must complete within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// HKDF context string for session keys.
pub const TRANSPORT_INFO: &[u8] = b"dawn-transport-v1";
/// Upper bound for one wire frame (DoS guard).
pub const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level failure.
    #[error("io: {0}")]
    Io(String),
    /// WebSocket protocol failure.
    #[error("websocket: {0}")]
    Ws(String),
    /// Handshake did not complete in time.
    #[error("handshake timeout")]
    Timeout,
    /// Malformed or out-of-order handshake frame.
    #[error("handshake failed")]
    Handshake,
    /// Connected peer is not the one that was dialed.
    #[error("peer mismatch")]
    PeerMismatch,
    /// Frame failed to parse or carried a bad field.
    #[error("frame format")]
    FrameFormat,
    /// Frame exceeds `MAX_FRAME_BYTES`.
    #[error("frame too large")]
    FrameTooLarge,
    /// Plaintext frame on an encryption-required session.
    #[error("plaintext refused")]
    PlaintextRefused,
    /// Session closed by the peer.
    #[error("closed")]
    Closed,
    /// Crypto failure (decrypt, sign, derive).
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Validator refused the peer.
    #[error(transparent)]
    Validator(#[from] ValidatorError),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Io(io) => TransportError::Io(io.to_string()),
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::Ws(other.to_string()),
        }
    }
}

impl Retryable for TransportError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Ws(_) | TransportError::Timeout
        )
    }
}

/// Canonical handshake transcript digest:
/// `SHA-256(x25519_pub || sender_node_id || peer_node_id_or_empty)`.
pub fn handshake_transcript(eph_pub: &[u8], sender: &NodeId, peer: Option<&NodeId>) -> [u8; 32] {
    let mut buf = Vec::with_capacity(eph_pub.len() + 128);
    buf.extend_from_slice(eph_pub);
    buf.extend_from_slice(sender.as_str().as_bytes());
    if let Some(p) = peer {
        buf.extend_from_slice(p.as_str().as_bytes());
    }
    sha256(&buf)
}

/// Session-key salt: the two node ids in sorted order, concatenated.
fn session_salt(a: &NodeId, b: &NodeId) -> Vec<u8> {
    let (lo, hi) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
    let mut salt = Vec::with_capacity(128);
    salt.extend_from_slice(lo.as_str().as_bytes());
    salt.extend_from_slice(hi.as_str().as_bytes());
    salt
}

fn data_frame_digest(nonce: &[u8], ciphertext: &[u8], sender: &NodeId) -> [u8; 32] {
    let mut buf = Vec::with_capacity(nonce.len() + ciphertext.len() + 64);
    buf.extend_from_slice(nonce);
    buf.extend_from_slice(ciphertext);
    buf.extend_from_slice(sender.as_str().as_bytes());
    sha256(&buf)
}

fn plain_frame_digest(payload: &[u8], sender: &NodeId) -> [u8; 32] {
    let mut buf = Vec::with_capacity(payload.len() + 64);
    buf.extend_from_slice(payload);
    buf.extend_from_slice(sender.as_str().as_bytes());
    sha256(&buf)
}

async fn send_frame(sink: &mut SplitSink<WsStream, Message>, frame: &WireFrame) -> Result<(), TransportError> {
    let text = serde_json::to_string(frame).map_err(|_| TransportError::FrameFormat)?;
    if text.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge);
    }
    sink.send(Message::Text(text)).await?;
    Ok(())
}

async fn next_frame(stream: &mut SplitStream<WsStream>) -> Result<Option<WireFrame>, TransportError> {
    while let Some(msg) = stream.next().await {
        match msg? {
            Message::Text(text) => {
                if text.len() > MAX_FRAME_BYTES {
                    return Err(TransportError::FrameTooLarge);
                }
                let frame: WireFrame =
                    serde_json::from_str(&text).map_err(|_| TransportError::FrameFormat)?;
                return Ok(Some(frame));
            }
            // The protocol is JSON text frames only.
            Message::Binary(_) => return Err(TransportError::FrameFormat),
            Message::Close(_) => return Ok(None),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
    Ok(None)
}

/// Writing half of an established session.
pub struct SessionWriter {
    sink: SplitSink<WsStream, Message>,
    seal: Option<AeadKey>,
    identity: Arc<NodeIdentity>,
}

impl SessionWriter {
    /// Queue one inner JSON-RPC payload as a single wire frame.
    pub async fn send(&mut self, payload: &Value) -> Result<(), TransportError> {
        let bytes = serde_json::to_vec(payload).map_err(|_| TransportError::FrameFormat)?;
        let sender = self.identity.node_id().clone();
        let frame = match &self.seal {
            Some(seal) => {
                let (nonce, ciphertext) = seal.seal(&bytes, &[])?;
                let digest = data_frame_digest(&nonce, &ciphertext, &sender);
                WireFrame::Encrypted {
                    nonce: hex::encode(nonce),
                    ciphertext: hex::encode(&ciphertext),
                    signature: hex::encode(self.identity.sign(&digest)),
                    sender: sender.as_str().to_string(),
                }
            }
            None => {
                let digest = plain_frame_digest(&bytes, &sender);
                WireFrame::Plain {
                    payload: payload.clone(),
                    signature: hex::encode(self.identity.sign(&digest)),
                    sender: sender.as_str().to_string(),
                }
            }
        };
        send_frame(&mut self.sink, &frame).await
    }

    /// Close the socket cleanly.
    pub async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

/// Reading half of an established session.
pub struct SessionReader {
    stream: SplitStream<WsStream>,
    open: Option<AeadKey>,
    peer: NodeId,
    peer_public: [u8; 32],
    encrypted: bool,
}

impl SessionReader {
    /// Next decrypted inner payload, in arrival order. `Ok(None)` on a clean
    /// close; any verification or decryption failure is fatal to the session.
    pub async fn recv(&mut self) -> Result<Option<Value>, TransportError> {
        let Some(frame) = next_frame(&mut self.stream).await? else {
            return Ok(None);
        };
        match frame {
            WireFrame::Encrypted {
                nonce,
                ciphertext,
                signature,
                sender,
            } => {
                if !self.encrypted {
                    // This side never derived a session key.
                    return Err(TransportError::FrameFormat);
                }
                if sender != self.peer.as_str() {
                    return Err(TransportError::FrameFormat);
                }
                let nonce_bytes = hex::decode(&nonce).map_err(|_| TransportError::FrameFormat)?;
                let ct = hex::decode(&ciphertext).map_err(|_| TransportError::FrameFormat)?;
                let sig = hex::decode(&signature).map_err(|_| TransportError::FrameFormat)?;
                if nonce_bytes.len() != NONCE_LEN {
                    return Err(TransportError::FrameFormat);
                }
                let digest = data_frame_digest(&nonce_bytes, &ct, &self.peer);
                crypto::ed25519_verify(&self.peer_public, &digest, &sig)?;

                let mut nonce_arr = [0u8; NONCE_LEN];
                nonce_arr.copy_from_slice(&nonce_bytes);
                let open = self.open.as_ref().ok_or(TransportError::FrameFormat)?;
                let plain = open.open(&nonce_arr, &ct, &[])?;
                let value: Value =
                    serde_json::from_slice(&plain).map_err(|_| TransportError::FrameFormat)?;
                Ok(Some(value))
            }
            WireFrame::Plain {
                payload,
                signature,
                sender,
            } => {
                if self.encrypted {
                    return Err(TransportError::PlaintextRefused);
                }
                if sender != self.peer.as_str() {
                    return Err(TransportError::FrameFormat);
                }
                let bytes = serde_json::to_vec(&payload).map_err(|_| TransportError::FrameFormat)?;
                let sig = hex::decode(&signature).map_err(|_| TransportError::FrameFormat)?;
                let digest = plain_frame_digest(&bytes, &self.peer);
                crypto::ed25519_verify(&self.peer_public, &digest, &sig)?;
                Ok(Some(payload))
            }
            // Key exchange after the handshake is a protocol violation.
            WireFrame::KeyExchange { .. } => Err(TransportError::Handshake),
        }
    }

    /// Peer on the other end.
    pub fn peer(&self) -> &NodeId {
        &self.peer
    }
}

/// An established, authenticated session.
pub struct SecureSession {
    reader: SessionReader,
    writer: SessionWriter,
}

impl SecureSession {
    /// Peer node id.
    pub fn peer(&self) -> &NodeId {
        &self.reader.peer
    }

    /// Peer long-term public key as observed in the handshake.
    pub fn peer_public(&self) -> [u8; 32] {
        self.reader.peer_public
    }

    /// Send one inner payload.
    pub async fn send(&mut self, payload: &Value) -> Result<(), TransportError> {
        self.writer.send(payload).await
    }

    /// Receive the next inner payload.
    pub async fn recv(&mut self) -> Result<Option<Value>, TransportError> {
        self.reader.recv().await
    }

    /// Split into independently-owned halves for pump tasks.
    pub fn split(self) -> (SessionReader, SessionWriter) {
        (self.reader, self.writer)
    }

    /// Close the session.
    pub async fn close(&mut self) {
        self.writer.close().await;
    }
}

struct HandshakeOutcome {
    peer: NodeId,
    peer_public: [u8; 32],
    session_key: Option<[u8; 32]>,
}

fn key_exchange_frame(
    identity: &NodeIdentity,
    eph_pub: &[u8; 32],
    known_peer: Option<&NodeId>,
) -> WireFrame {
    let digest = handshake_transcript(eph_pub, identity.node_id(), known_peer);
    WireFrame::KeyExchange {
        public_key: hex::encode(eph_pub),
        node_id: identity.node_id().as_str().to_string(),
        signature: hex::encode(identity.sign(&digest)),
    }
}

fn validate_key_exchange(
    frame: &WireFrame,
    identity: &NodeIdentity,
    validator: &PeerValidator,
) -> Result<(NodeId, Vec<u8>), TransportError> {
    let WireFrame::KeyExchange {
        public_key,
        node_id,
        signature,
    } = frame
    else {
        return Err(TransportError::Handshake);
    };
    let claimed = NodeId::parse(node_id).map_err(|_| TransportError::Handshake)?;
    let their_eph = hex::decode(public_key).map_err(|_| TransportError::Handshake)?;
    if their_eph.len() != 32 {
        return Err(TransportError::Handshake);
    }
    let sig = hex::decode(signature).map_err(|_| TransportError::Handshake)?;

    // The dialer may not have known our id yet; accept either transcript.
    let with_us = handshake_transcript(&their_eph, &claimed, Some(identity.node_id()));
    let without = handshake_transcript(&their_eph, &claimed, None);
    validator.validate_handshake(&claimed, &[with_us, without], &sig)?;
    Ok((claimed, their_eph))
}

async fn run_handshake(
    ws: &mut WsStream,
    identity: &Arc<NodeIdentity>,
    validator: &PeerValidator,
    expected_peer: Option<&NodeId>,
    initiator: bool,
) -> Result<HandshakeOutcome, TransportError> {
    let eph = x25519_generate()?;

    let their_frame = if initiator {
        let my_frame = key_exchange_frame(identity, &eph.public, expected_peer);
        let text = serde_json::to_string(&my_frame).map_err(|_| TransportError::FrameFormat)?;
        ws.send(Message::Text(text)).await?;
        recv_handshake_frame(ws).await?
    } else {
        recv_handshake_frame(ws).await?
    };

    // Pin the dialed identity before any trust bookkeeping happens.
    if let Some(expected) = expected_peer {
        if let WireFrame::KeyExchange { node_id, .. } = &their_frame {
            if node_id != expected.as_str() {
                return Err(TransportError::PeerMismatch);
            }
        }
    }

    let (claimed, their_eph) = validate_key_exchange(&their_frame, identity, validator)?;

    if !initiator {
        // Respond with a transcript that names the now-known dialer.
        let reply = key_exchange_frame(identity, &eph.public, Some(&claimed));
        let text = serde_json::to_string(&reply).map_err(|_| TransportError::FrameFormat)?;
        ws.send(Message::Text(text)).await?;
    }

    let shared = derive_shared(eph, &their_eph)?;
    let salt = session_salt(identity.node_id(), &claimed);
    let session_key = hkdf_sha256(&shared, &salt, TRANSPORT_INFO)?;

    Ok(HandshakeOutcome {
        peer_public: claimed.public_key_bytes(),
        peer: claimed,
        session_key: Some(session_key),
    })
}

async fn recv_handshake_frame(ws: &mut WsStream) -> Result<WireFrame, TransportError> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => {
                if text.len() > MAX_FRAME_BYTES {
                    return Err(TransportError::FrameTooLarge);
                }
                return serde_json::from_str(&text).map_err(|_| TransportError::Handshake);
            }
            Message::Close(_) => return Err(TransportError::Closed),
            Message::Binary(_) => return Err(TransportError::FrameFormat),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
    Err(TransportError::Closed)
}

fn build_session(
    ws: WsStream,
    identity: Arc<NodeIdentity>,
    outcome: HandshakeOutcome,
    encrypted: bool,
) -> Result<SecureSession, TransportError> {
    let (seal, open) = if encrypted {
        let key = outcome.session_key.ok_or(TransportError::Handshake)?;
        (Some(AeadKey::new(&key)?), Some(AeadKey::new(&key)?))
    } else {
        (None, None)
    };
    let (sink, stream) = ws.split();
    Ok(SecureSession {
        reader: SessionReader {
            stream,
            open,
            peer: outcome.peer,
            peer_public: outcome.peer_public,
            encrypted,
        },
        writer: SessionWriter {
            sink,
            seal,
            identity,
        },
    })
}

/// Dial `url` and run the initiator handshake. `expected_peer` pins the
/// remote identity when it is already known.
pub async fn connect(
    url: &str,
    identity: Arc<NodeIdentity>,
    validator: &PeerValidator,
    expected_peer: Option<&NodeId>,
    encrypted: bool,
) -> Result<SecureSession, TransportError> {
    let fut = async {
        let (mut ws, _resp) = connect_async(url).await?;
        let outcome = run_handshake(&mut ws, &identity, validator, expected_peer, true).await?;
        debug!(peer = %outcome.peer, %url, "outbound session established");
        build_session(ws, identity, outcome, encrypted)
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, fut)
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Upgrade an accepted TCP stream and run the responder handshake.
pub async fn accept(
    stream: TcpStream,
    identity: Arc<NodeIdentity>,
    validator: &PeerValidator,
    encrypted: bool,
) -> Result<SecureSession, TransportError> {
    let fut = async {
        let mut ws = accept_async(MaybeTlsStream::Plain(stream)).await?;
        let outcome = run_handshake(&mut ws, &identity, validator, None, false).await?;
        debug!(peer = %outcome.peer, "inbound session established");
        build_session(ws, identity, outcome, encrypted)
    };
    tokio::time::timeout(HANDSHAKE_TIMEOUT, fut)
        .await
        .map_err(|_| TransportError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::security::audit::AuditLog;
    use crate::core::security::trust::TrustManager;
    use crate::networking::validator::RejectUnknown;
    use serde_json::json;
    use tokio::net::TcpListener;

    struct Node {
        _dir: tempfile::TempDir,
        identity: Arc<NodeIdentity>,
        validator: Arc<PeerValidator>,
    }

    fn make_node() -> Node {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = Arc::new(NodeIdentity::load_or_create(dir.path()).expect("identity"));
        let audit = Arc::new(
            AuditLog::open(dir.path(), identity.node_id().clone(), true).expect("audit"),
        );
        let trust = Arc::new(TrustManager::load(dir.path(), audit.clone()).expect("trust"));
        let validator = Arc::new(PeerValidator::new(trust, audit, RejectUnknown::new(false)));
        Node {
            _dir: dir,
            identity,
            validator,
        }
    }

    async fn ws_pair(
        server: &Node,
        client: &Node,
        server_encrypted: bool,
        client_encrypted: bool,
    ) -> (SecureSession, SecureSession) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let s_id = server.identity.clone();
        let s_val = server.validator.clone();
        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            accept(stream, s_id, &s_val, server_encrypted).await
        });

        let client_session = connect(
            &format!("ws://{addr}"),
            client.identity.clone(),
            &client.validator,
            None,
            client_encrypted,
        )
        .await
        .expect("connect");
        let server_session = server_task.await.expect("join").expect("accept handshake");
        (server_session, client_session)
    }

    #[tokio::test]
    async fn encrypted_round_trip() {
        let server = make_node();
        let client = make_node();
        let (mut s, mut c) = ws_pair(&server, &client, true, true).await;

        assert_eq!(s.peer(), client.identity.node_id());
        assert_eq!(c.peer(), server.identity.node_id());

        c.send(&json!({"jsonrpc": "2.0", "id": 1, "method": "node/get_info"}))
            .await
            .expect("send");
        let got = s.recv().await.expect("recv").expect("frame");
        assert_eq!(got["method"], "node/get_info");

        s.send(&json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}))
            .await
            .expect("send");
        let reply = c.recv().await.expect("recv").expect("frame");
        assert_eq!(reply["result"]["ok"], true);
    }

    #[tokio::test]
    async fn dial_with_wrong_pinned_identity_fails() {
        let server = make_node();
        let client = make_node();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let s_id = server.identity.clone();
        let s_val = server.validator.clone();
        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            accept(stream, s_id, &s_val, true).await
        });

        // The pinned id lands in the client's transcript, so the responder
        // rejects the signature and the dial dies before any data frame.
        let wrong = NodeId::from_public_key(&[9u8; 32]);
        let err = connect(
            &format!("ws://{addr}"),
            client.identity.clone(),
            &client.validator,
            Some(&wrong),
            true,
        )
        .await;
        assert!(err.is_err());
        assert!(server_task.await.expect("join").is_err());
    }

    #[tokio::test]
    async fn encrypted_side_refuses_plaintext_frames() {
        let server = make_node();
        let client = make_node();
        // Server requires encryption; client is (mis)configured for plaintext.
        let (mut s, mut c) = ws_pair(&server, &client, true, false).await;

        c.send(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .await
            .expect("send");
        assert!(matches!(
            s.recv().await,
            Err(TransportError::PlaintextRefused)
        ));
    }

    #[tokio::test]
    async fn plaintext_mode_round_trips_when_both_sides_agree() {
        let server = make_node();
        let client = make_node();
        let (mut s, mut c) = ws_pair(&server, &client, false, false).await;

        c.send(&json!({"jsonrpc": "2.0", "id": 7, "method": "echo"}))
            .await
            .expect("send");
        let got = s.recv().await.expect("recv").expect("frame");
        assert_eq!(got["id"], 7);
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let server = make_node();
        let client = make_node();
        let (mut s, mut c) = ws_pair(&server, &client, true, true).await;
        c.close().await;
        drop(c);
        assert!(s.recv().await.expect("recv").is_none());
    }
}
