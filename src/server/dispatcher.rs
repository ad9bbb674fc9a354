//! Connection dispatcher
//!
//! Owns the daemon's socket handling: accepts WebSocket connections, binds
//! each to a session, parses inbound frames, and drains the response queue
//! back to the wire. Every socket write for a connection goes through its
//! single writer task; readers, workers and the drain loop only ever hand
//! frames to that writer's channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ErrorCode;
use crate::protocol::{BinaryFrame, BinaryKind, ClientMessage, ServerMessage};
use crate::server::queue::{QueuedResponse, ResponseEntry, ResponseQueue};
use crate::server::worker::{DispatchError, WorkPayload, WorkerPool};
use crate::session::{SatelliteIdentity, Session, SessionRegistry};
use crate::types::{ClientState, SessionKind};

/// Ceiling on the staged inbound-utterance buffer
const MAX_AUDIO_BUFFER: usize = 8 * 1024 * 1024;

/// Outbound frames funnelled to a connection's writer task
#[derive(Debug)]
pub enum OutboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

struct ConnectionHandle {
    outbound: mpsc::Sender<OutboundFrame>,
}

/// Per-connection state owned by the reader
pub struct ConnState {
    pub conn_id: u64,
    pub session: Arc<Session>,
    /// Compressed audio staged until the end-of-utterance marker
    pub audio_buf: Vec<u8>,
}

/// Shared daemon core: registry, queue, pool, connection table
pub struct DaemonCore {
    pub config: Config,
    pub registry: Arc<SessionRegistry>,
    pub queue: Arc<ResponseQueue>,
    pub pool: WorkerPool,
    connections: tokio::sync::RwLock<HashMap<u64, ConnectionHandle>>,
    next_conn_id: AtomicU64,
}

impl DaemonCore {
    pub fn new(
        config: Config,
        registry: Arc<SessionRegistry>,
        queue: Arc<ResponseQueue>,
        pool: WorkerPool,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            queue,
            pool,
            connections: tokio::sync::RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub async fn register_connection(&self, outbound: mpsc::Sender<OutboundFrame>) -> u64 {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .write()
            .await
            .insert(conn_id, ConnectionHandle { outbound });
        conn_id
    }

    pub async fn unregister_connection(&self, conn_id: u64) {
        self.connections.write().await.remove(&conn_id);
    }

    /// Hand a control frame to a connection's writer. Returns false when the
    /// connection is gone or its writer has backed up.
    pub async fn send_to(&self, conn_id: u64, message: &ServerMessage) -> bool {
        let encoded = match message.encode() {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to encode outbound frame: {e}");
                return false;
            }
        };
        let connections = self.connections.read().await;
        match connections.get(&conn_id) {
            Some(handle) => handle
                .outbound
                .try_send(OutboundFrame::Text(encoded))
                .is_ok(),
            None => false,
        }
    }

    /// Ship an audio chunk to a connection (server-to-client music/TTS path)
    pub async fn send_audio(&self, conn_id: u64, kind: BinaryKind, payload: Vec<u8>) -> bool {
        let frame = BinaryFrame::new(kind, payload).encode();
        let connections = self.connections.read().await;
        match connections.get(&conn_id) {
            Some(handle) => handle
                .outbound
                .try_send(OutboundFrame::Binary(frame))
                .is_ok(),
            None => false,
        }
    }

    /// On accept: create the session, register its token, send the token
    /// and the initial idle state.
    pub async fn accept(&self, conn_id: u64) -> Option<ConnState> {
        let session = match self.registry.create(SessionKind::Websocket) {
            Ok(session) => session,
            Err(e) => {
                warn!("rejecting connection: {e}");
                self.send_to(
                    conn_id,
                    &ServerMessage::Error {
                        code: ErrorCode::SessionLimit,
                        message: "maximum concurrent sessions reached".to_string(),
                        recoverable: Some(false),
                    },
                )
                .await;
                return None;
            }
        };
        session.set_connection(Some(conn_id));
        info!(conn_id, session_id = session.id, "connection accepted");

        self.send_to(
            conn_id,
            &ServerMessage::Session {
                token: session.token.clone(),
            },
        )
        .await;
        self.send_state(conn_id, ClientState::Idle).await;

        Some(ConnState {
            conn_id,
            session,
            audio_buf: Vec::new(),
        })
    }

    async fn send_state(&self, conn_id: u64, state: ClientState) {
        self.send_to(
            conn_id,
            &ServerMessage::State {
                state: state.as_str().to_string(),
                detail: None,
            },
        )
        .await;
    }

    async fn send_error(&self, conn_id: u64, code: ErrorCode, message: impl Into<String>) {
        self.send_to(
            conn_id,
            &ServerMessage::Error {
                code,
                message: message.into(),
                recoverable: Some(code.recoverable()),
            },
        )
        .await;
    }

    /// Dispatch one decoded control frame from a client
    pub async fn handle_message(&self, conn: &mut ConnState, message: ClientMessage) {
        conn.session.touch();
        match message {
            ClientMessage::Text { text } => {
                self.dispatch_work(conn, WorkPayload::Text(text)).await;
            }
            ClientMessage::Cancel => {
                debug!(session_id = conn.session.id, "cancel requested");
                conn.session.request_cancel();
            }
            ClientMessage::Reconnect { token } => {
                self.handle_reconnect(conn, &token).await;
            }
            ClientMessage::Config { volume, model } => {
                if let Some(volume) = volume {
                    debug!(session_id = conn.session.id, volume, "client volume setting noted");
                }
                if model.is_some() {
                    conn.session.set_model_override(model);
                }
            }
            ClientMessage::SatelliteRegister {
                uuid,
                name,
                location,
                tier,
                capabilities,
                reconnect_secret,
            } => {
                let identity = SatelliteIdentity {
                    uuid,
                    name,
                    location,
                    tier,
                    local_asr: capabilities.local_asr,
                    local_tts: capabilities.local_tts,
                    wake_word: capabilities.wake_word,
                };
                self.handle_register(conn, identity, reconnect_secret).await;
            }
            ClientMessage::SatelliteQuery { text } => {
                if conn.session.satellite().is_none() {
                    self.send_error(
                        conn.conn_id,
                        ErrorCode::NotRegistered,
                        "satellite_register required before queries",
                    )
                    .await;
                    return;
                }
                self.dispatch_work(conn, WorkPayload::Text(text)).await;
            }
            ClientMessage::SatellitePing => {
                self.send_to(conn.conn_id, &ServerMessage::SatellitePong).await;
            }
        }
    }

    /// Route one binary frame: stage audio until end-of-utterance, then the
    /// worker takes ownership of the staged buffer.
    pub async fn handle_binary(&self, conn: &mut ConnState, frame: BinaryFrame) {
        conn.session.touch();
        match frame.kind {
            BinaryKind::AudioIn => {
                if conn.audio_buf.len() + frame.payload.len() > MAX_AUDIO_BUFFER {
                    warn!(session_id = conn.session.id, "utterance buffer overflow, dropping");
                    conn.audio_buf.clear();
                    self.send_error(
                        conn.conn_id,
                        ErrorCode::InvalidMessage,
                        "utterance exceeds maximum length",
                    )
                    .await;
                    return;
                }
                conn.audio_buf.extend_from_slice(&frame.payload);
            }
            BinaryKind::EndOfUtterance => {
                let audio = std::mem::take(&mut conn.audio_buf);
                debug!(
                    session_id = conn.session.id,
                    bytes = audio.len(),
                    "end of utterance"
                );
                self.dispatch_work(conn, WorkPayload::Audio(audio)).await;
            }
            BinaryKind::AudioOut | BinaryKind::EndOfAudio => {
                debug!(
                    session_id = conn.session.id,
                    "ignoring server-direction binary frame from client"
                );
            }
        }
    }

    async fn dispatch_work(&self, conn: &ConnState, payload: WorkPayload) {
        match self.pool.dispatch(&conn.session, payload) {
            Ok(()) => {}
            Err(DispatchError::Busy) => {
                self.send_error(
                    conn.conn_id,
                    ErrorCode::RateLimited,
                    "a response is already in flight",
                )
                .await;
            }
            Err(DispatchError::Backlog) => {
                self.send_error(
                    conn.conn_id,
                    ErrorCode::RateLimited,
                    "daemon is at capacity, try again shortly",
                )
                .await;
            }
        }
    }

    /// Resolve a reconnect token. Valid token: adopt the prior session,
    /// replay its history, destroy the ephemeral on-accept session. Unknown
    /// token: keep the ephemeral session and send its token.
    pub async fn handle_reconnect(&self, conn: &mut ConnState, token: &str) {
        // Idempotent when the connection is already bound to this session
        if conn.session.token == token {
            debug!(session_id = conn.session.id, "reconnect to own session is a no-op");
            self.send_to(
                conn.conn_id,
                &ServerMessage::Session {
                    token: conn.session.token.clone(),
                },
            )
            .await;
            self.send_state(conn.conn_id, ClientState::Idle).await;
            return;
        }

        match self.registry.lookup_by_token(token) {
            Some(existing) => {
                info!(
                    conn_id = conn.conn_id,
                    old = conn.session.id,
                    restored = existing.id,
                    "reconnect: adopting prior session"
                );
                self.adopt_session(conn, existing).await;

                self.send_to(
                    conn.conn_id,
                    &ServerMessage::Session {
                        token: conn.session.token.clone(),
                    },
                )
                .await;
                self.replay_history(conn).await;
                self.send_state(conn.conn_id, ClientState::Idle).await;
            }
            None => {
                debug!(conn_id = conn.conn_id, "reconnect token unknown, keeping new session");
                self.send_to(
                    conn.conn_id,
                    &ServerMessage::Session {
                        token: conn.session.token.clone(),
                    },
                )
                .await;
            }
        }
    }

    /// Bind `existing` to this connection and destroy the displaced
    /// ephemeral session immediately.
    async fn adopt_session(&self, conn: &mut ConnState, existing: Arc<Session>) {
        existing.clear_disconnected();
        existing.set_connection(Some(conn.conn_id));
        existing.touch();

        let ephemeral = std::mem::replace(&mut conn.session, existing);
        ephemeral.mark_disconnected();
        ephemeral.set_connection(None);
        let ephemeral_id = ephemeral.id;
        self.registry.release(&ephemeral);
        drop(ephemeral);
        self.registry.destroy(ephemeral_id);
    }

    /// Send the stored conversation back as transcript frames, skipping
    /// system turns, in original order.
    async fn replay_history(&self, conn: &ConnState) {
        for entry in conn.session.replayable_history() {
            self.send_to(
                conn.conn_id,
                &ServerMessage::Transcript {
                    role: entry.role,
                    text: entry.content,
                },
            )
            .await;
        }
    }

    async fn handle_register(
        &self,
        conn: &mut ConnState,
        identity: SatelliteIdentity,
        reconnect_secret: Option<String>,
    ) {
        // A persisted secret reclaims the satellite's prior session across
        // its own restarts.
        if let Some(secret) = reconnect_secret.as_deref() {
            if let Some(existing) = self.registry.lookup_by_secret(secret) {
                if existing.id != conn.session.id {
                    info!(
                        satellite = %identity.name,
                        session_id = existing.id,
                        "satellite reclaimed session by secret"
                    );
                    self.adopt_session(conn, existing).await;
                }
                conn.session.set_kind(SessionKind::Satellite);
                conn.session.set_satellite(identity);
                let session_id = conn.session.id;
                self.send_to(
                    conn.conn_id,
                    &ServerMessage::SatelliteRegisterAck {
                        success: true,
                        session_id,
                        reconnect_secret: None,
                        message: Some("session restored".to_string()),
                    },
                )
                .await;
                return;
            }
        }

        conn.session.set_kind(SessionKind::Satellite);
        info!(
            satellite = %identity.name,
            location = %identity.location,
            tier = identity.tier,
            "satellite registered"
        );
        conn.session.set_satellite(identity);
        let secret = self.registry.issue_secret(conn.session.id);
        self.send_to(
            conn.conn_id,
            &ServerMessage::SatelliteRegisterAck {
                success: true,
                session_id: conn.session.id,
                reconnect_secret: Some(secret),
                message: None,
            },
        )
        .await;
    }

    /// Socket closed: retain the session for reconnect, free staged audio
    pub async fn handle_close(&self, conn: &mut ConnState) {
        info!(
            conn_id = conn.conn_id,
            session_id = conn.session.id,
            "connection closed"
        );
        conn.audio_buf = Vec::new();
        conn.session.touch();
        conn.session.mark_disconnected();
        self.registry.release(&conn.session);
    }

    /// Drain loop body: deliver queued responses to their sessions'
    /// connections, dropping entries whose session has disconnected.
    pub async fn drain_queue(&self) {
        for queued in self.queue.drain() {
            self.deliver(queued).await;
        }
    }

    async fn deliver(&self, queued: QueuedResponse) {
        if queued.session.is_disconnected() {
            // Peer is gone; the entry is freed without sending
            return;
        }
        let Some(conn_id) = queued.session.connection() else {
            return;
        };
        let message = entry_to_message(queued.entry);
        if !self.send_to(conn_id, &message).await {
            debug!(
                session_id = queued.session.id,
                "dropping response for vanished connection"
            );
        }
    }

    /// Run the queue drain until shutdown; one of these per daemon
    pub async fn drain_loop(self: Arc<Self>) {
        loop {
            self.queue.wait().await;
            self.drain_queue().await;
        }
    }
}

/// Map a queued response entry onto its wire message
pub fn entry_to_message(entry: ResponseEntry) -> ServerMessage {
    match entry {
        ResponseEntry::State { state, detail } => ServerMessage::State {
            state: state.as_str().to_string(),
            detail,
        },
        ResponseEntry::Transcript { role, text } => ServerMessage::Transcript { role, text },
        ResponseEntry::Error {
            code,
            message,
            recoverable,
        } => ServerMessage::Error {
            code,
            message,
            recoverable: Some(recoverable),
        },
        ResponseEntry::SessionToken { token } => ServerMessage::Session { token },
        ResponseEntry::StreamStart { stream_id } => ServerMessage::StreamStart { stream_id },
        ResponseEntry::StreamDelta { stream_id, delta } => {
            ServerMessage::StreamDelta { stream_id, delta }
        }
        ResponseEntry::StreamEnd { stream_id } => ServerMessage::StreamEnd { stream_id },
    }
}

/// WebSocket upgrade handler for the daemon endpoint
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(core): State<Arc<DaemonCore>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, core))
}

async fn handle_socket(socket: WebSocket, core: Arc<DaemonCore>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(64);

    // Writer task: the only place this socket is written
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let result = match frame {
                OutboundFrame::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                OutboundFrame::Binary(bytes) => ws_tx.send(Message::Binary(bytes.into())).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    let conn_id = core.register_connection(out_tx).await;
    let Some(mut conn) = core.accept(conn_id).await else {
        core.unregister_connection(conn_id).await;
        let _ = writer.await;
        return;
    };

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => match ClientMessage::decode(&text) {
                Ok(decoded) => core.handle_message(&mut conn, decoded).await,
                Err(e) => {
                    debug!(conn_id, "malformed control frame: {e}");
                    core.send_error(conn_id, ErrorCode::InvalidMessage, e.to_string())
                        .await;
                }
            },
            Ok(Message::Binary(bytes)) => match BinaryFrame::decode(&bytes) {
                Ok(frame) => core.handle_binary(&mut conn, frame).await,
                Err(e) => {
                    debug!(conn_id, "malformed binary frame: {e}");
                    core.send_error(conn_id, ErrorCode::InvalidMessage, e.to_string())
                        .await;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    core.handle_close(&mut conn).await;
    core.unregister_connection(conn_id).await;
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::llm::{
        CancelToken, ChatMessage, LlmBackend, LlmError, StreamOutcome,
    };
    use crate::server::tools::ToolRegistry;
    use crate::server::worker::WorkerContext;
    use crate::types::{Role, SatelliteCapabilities};
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoLlm;

    #[async_trait]
    impl LlmBackend for EchoLlm {
        async fn stream_chat(
            &self,
            messages: &[ChatMessage],
            _tools: &[serde_json::Value],
            _model_override: Option<&str>,
            _cancel: &CancelToken,
            on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<StreamOutcome, LlmError> {
            let last = messages
                .last()
                .and_then(|m| m.content.clone())
                .unwrap_or_default();
            let reply = format!("echo: {last}");
            on_delta(&reply);
            Ok(StreamOutcome {
                content: reply,
                tool_calls: Vec::new(),
            })
        }
    }

    async fn build_core() -> Arc<DaemonCore> {
        let config = Config::default();
        let registry = SessionRegistry::new(8, Duration::from_secs(1800));
        let queue = ResponseQueue::new(64);
        let ctx = WorkerContext::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::new(EchoLlm),
            ToolRegistry::new(),
            None,
            "test".to_string(),
            16_000,
        );
        let pool = WorkerPool::start(2, ctx);
        DaemonCore::new(config, registry, queue, pool)
    }

    /// Register a fake connection; returns its id and the frame receiver
    async fn fake_conn(core: &DaemonCore) -> (u64, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(64);
        let conn_id = core.register_connection(tx).await;
        (conn_id, rx)
    }

    fn decode_frames(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                out.push(ServerMessage::decode(&text).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_accept_sends_token_then_idle() {
        let core = build_core().await;
        let (conn_id, mut rx) = fake_conn(&core).await;
        let conn = core.accept(conn_id).await.unwrap();

        let frames = decode_frames(&mut rx);
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            ServerMessage::Session { token } => {
                assert_eq!(token, &conn.session.token);
                assert_eq!(token.len(), 32);
            }
            other => panic!("expected session frame, got {other:?}"),
        }
        assert!(matches!(&frames[1], ServerMessage::State { state, .. } if state == "idle"));
    }

    #[tokio::test]
    async fn test_session_limit_rejects_with_final_error() {
        let config = Config::default();
        let registry = SessionRegistry::new(1, Duration::from_secs(1800));
        let queue = ResponseQueue::new(64);
        let ctx = WorkerContext::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::new(EchoLlm),
            ToolRegistry::new(),
            None,
            "test".to_string(),
            16_000,
        );
        let pool = WorkerPool::start(1, ctx);
        let core = DaemonCore::new(config, registry, queue, pool);

        let (first_id, _first_rx) = fake_conn(&core).await;
        let _first = core.accept(first_id).await.unwrap();

        let (second_id, mut second_rx) = fake_conn(&core).await;
        assert!(core.accept(second_id).await.is_none());
        let frames = decode_frames(&mut second_rx);
        assert!(matches!(
            &frames[0],
            ServerMessage::Error {
                code: ErrorCode::SessionLimit,
                recoverable: Some(false),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reconnect_replays_history_in_order() {
        let core = build_core().await;

        // First connection builds up history, then drops
        let (conn_id, mut rx) = fake_conn(&core).await;
        let mut conn = core.accept(conn_id).await.unwrap();
        let token = conn.session.token.clone();
        conn.session.append_history(Role::System, "be nice");
        conn.session.append_history(Role::User, "hello");
        conn.session.append_history(Role::Assistant, "hi");
        core.handle_close(&mut conn).await;
        core.unregister_connection(conn_id).await;
        drop(rx);

        // Second connection reconnects with the first session's token
        let (conn2, mut rx2) = fake_conn(&core).await;
        let mut conn = core.accept(conn2).await.unwrap();
        let ephemeral_id = conn.session.id;
        let _ = decode_frames(&mut rx2);

        core.handle_reconnect(&mut conn, &token).await;

        let frames = decode_frames(&mut rx2);
        assert!(matches!(&frames[0], ServerMessage::Session { token: t } if t == &token));
        assert_eq!(
            frames[1],
            ServerMessage::Transcript {
                role: Role::User,
                text: "hello".to_string()
            }
        );
        assert_eq!(
            frames[2],
            ServerMessage::Transcript {
                role: Role::Assistant,
                text: "hi".to_string()
            }
        );
        assert!(matches!(&frames[3], ServerMessage::State { state, .. } if state == "idle"));

        // The ephemeral on-accept session is gone without residue
        assert!(core.registry.get_for_reconnect(ephemeral_id).is_none());
        assert!(!conn.session.is_disconnected());
    }

    #[tokio::test]
    async fn test_reconnect_unknown_token_keeps_ephemeral() {
        let core = build_core().await;
        let (conn_id, mut rx) = fake_conn(&core).await;
        let mut conn = core.accept(conn_id).await.unwrap();
        let own_token = conn.session.token.clone();
        let _ = decode_frames(&mut rx);

        core.handle_reconnect(&mut conn, "00000000000000000000000000000000")
            .await;

        let frames = decode_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], ServerMessage::Session { token } if token == &own_token));
        assert_eq!(conn.session.token, own_token);
    }

    #[tokio::test]
    async fn test_reconnect_idempotent_on_own_token() {
        let core = build_core().await;
        let (conn_id, mut rx) = fake_conn(&core).await;
        let mut conn = core.accept(conn_id).await.unwrap();
        let token = conn.session.token.clone();
        let session_id = conn.session.id;
        let _ = decode_frames(&mut rx);

        core.handle_reconnect(&mut conn, &token).await;

        assert_eq!(conn.session.id, session_id);
        let frames = decode_frames(&mut rx);
        assert!(matches!(&frames[0], ServerMessage::Session { token: t } if t == &token));
        assert!(core.registry.get(session_id).is_some());
    }

    #[tokio::test]
    async fn test_close_retains_session_for_timeout() {
        let core = build_core().await;
        let (conn_id, _rx) = fake_conn(&core).await;
        let mut conn = core.accept(conn_id).await.unwrap();
        let session_id = conn.session.id;

        core.handle_close(&mut conn).await;
        core.unregister_connection(conn_id).await;

        // Not destroyed, only disconnected
        assert!(core.registry.get(session_id).is_none());
        let restored = core.registry.get_for_reconnect(session_id).unwrap();
        assert!(restored.is_disconnected());
    }

    #[tokio::test]
    async fn test_satellite_register_issues_secret() {
        let core = build_core().await;
        let (conn_id, mut rx) = fake_conn(&core).await;
        let mut conn = core.accept(conn_id).await.unwrap();
        let _ = decode_frames(&mut rx);

        core.handle_message(
            &mut conn,
            ClientMessage::SatelliteRegister {
                uuid: "u-1".to_string(),
                name: "kitchen".to_string(),
                location: "kitchen".to_string(),
                tier: 1,
                capabilities: SatelliteCapabilities {
                    local_asr: true,
                    local_tts: true,
                    wake_word: true,
                },
                reconnect_secret: None,
            },
        )
        .await;

        let frames = decode_frames(&mut rx);
        let secret = match &frames[0] {
            ServerMessage::SatelliteRegisterAck {
                success: true,
                session_id,
                reconnect_secret: Some(secret),
                ..
            } => {
                assert_eq!(*session_id, conn.session.id);
                assert_eq!(secret.len(), 64);
                secret.clone()
            }
            other => panic!("expected ack, got {other:?}"),
        };
        assert_eq!(conn.session.kind(), SessionKind::Satellite);

        // Restart: a new connection presents the secret and reclaims
        core.handle_close(&mut conn).await;
        let old_id = conn.session.id;

        let (conn2, mut rx2) = fake_conn(&core).await;
        let mut conn = core.accept(conn2).await.unwrap();
        let _ = decode_frames(&mut rx2);
        core.handle_message(
            &mut conn,
            ClientMessage::SatelliteRegister {
                uuid: "u-1".to_string(),
                name: "kitchen".to_string(),
                location: "kitchen".to_string(),
                tier: 1,
                capabilities: SatelliteCapabilities::default(),
                reconnect_secret: Some(secret),
            },
        )
        .await;

        assert_eq!(conn.session.id, old_id);
        let frames = decode_frames(&mut rx2);
        assert!(matches!(
            &frames[0],
            ServerMessage::SatelliteRegisterAck {
                success: true,
                reconnect_secret: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_satellite_query_requires_registration() {
        let core = build_core().await;
        let (conn_id, mut rx) = fake_conn(&core).await;
        let mut conn = core.accept(conn_id).await.unwrap();
        let _ = decode_frames(&mut rx);

        core.handle_message(
            &mut conn,
            ClientMessage::SatelliteQuery {
                text: "hello".to_string(),
            },
        )
        .await;

        let frames = decode_frames(&mut rx);
        assert!(matches!(
            &frames[0],
            ServerMessage::Error {
                code: ErrorCode::NotRegistered,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let core = build_core().await;
        let (conn_id, mut rx) = fake_conn(&core).await;
        let mut conn = core.accept(conn_id).await.unwrap();
        let _ = decode_frames(&mut rx);

        core.handle_message(&mut conn, ClientMessage::SatellitePing).await;
        let frames = decode_frames(&mut rx);
        assert_eq!(frames, vec![ServerMessage::SatellitePong]);
    }

    #[tokio::test]
    async fn test_audio_accumulation_and_handoff() {
        let core = build_core().await;
        let (conn_id, _rx) = fake_conn(&core).await;
        let mut conn = core.accept(conn_id).await.unwrap();

        core.handle_binary(
            &mut conn,
            BinaryFrame::new(BinaryKind::AudioIn, vec![1, 2]),
        )
        .await;
        core.handle_binary(
            &mut conn,
            BinaryFrame::new(BinaryKind::AudioIn, vec![3, 4]),
        )
        .await;
        assert_eq!(conn.audio_buf, vec![1, 2, 3, 4]);

        core.handle_binary(
            &mut conn,
            BinaryFrame::new(BinaryKind::EndOfUtterance, Vec::new()),
        )
        .await;
        // Ownership moved to the worker; the connection stages afresh
        assert!(conn.audio_buf.is_empty());
    }

    #[tokio::test]
    async fn test_text_query_flows_through_queue_to_connection() {
        let core = build_core().await;
        let (conn_id, mut rx) = fake_conn(&core).await;
        let mut conn = core.accept(conn_id).await.unwrap();
        let _ = decode_frames(&mut rx);

        core.handle_message(
            &mut conn,
            ClientMessage::Text {
                text: "hello".to_string(),
            },
        )
        .await;

        // Let the pool run the pipeline, then drain the queue to the wire
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut frames = Vec::new();
        while std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            core.drain_queue().await;
            frames.extend(decode_frames(&mut rx));
            if frames.iter().any(|f| {
                matches!(f, ServerMessage::Transcript { role: Role::Assistant, .. })
            }) {
                break;
            }
        }

        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::Transcript { role: Role::User, text } if text == "hello"
        )));
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::Transcript { role: Role::Assistant, text } if text == "echo: hello"
        )));
        assert!(frames.iter().any(|f| matches!(f, ServerMessage::StreamStart { .. })));
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerMessage::StreamDelta { delta, .. } if delta == "echo: hello"
        )));
        assert!(frames.iter().any(|f| matches!(f, ServerMessage::StreamEnd { .. })));
    }

    #[tokio::test]
    async fn test_disconnected_session_entries_dropped_at_drain() {
        let core = build_core().await;
        let (conn_id, mut rx) = fake_conn(&core).await;
        let mut conn = core.accept(conn_id).await.unwrap();
        let _ = decode_frames(&mut rx);

        core.queue.enqueue(
            Arc::clone(&conn.session),
            ResponseEntry::Transcript {
                role: Role::Assistant,
                text: "late reply".to_string(),
            },
        );
        conn.session.mark_disconnected();
        core.drain_queue().await;

        assert!(decode_frames(&mut rx).is_empty());
        assert!(core.queue.is_empty());
    }
}
