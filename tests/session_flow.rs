//! End-to-end session flows through the daemon core: accept, query,
//! disconnect, reconnect-with-token, and response-queue saturation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use dawn::config::Config;
use dawn::protocol::{ClientMessage, ServerMessage};
use dawn::server::dispatcher::{DaemonCore, OutboundFrame};
use dawn::server::llm::{CancelToken, ChatMessage, LlmBackend, LlmError, StreamOutcome};
use dawn::server::queue::ResponseEntry;
use dawn::server::{ResponseQueue, ToolRegistry, WorkerContext, WorkerPool};
use dawn::session::SessionRegistry;
use dawn::types::Role;
use dawn::ErrorCode;

/// Deterministic backend: replies "hi" to any prompt, in two deltas
struct CannedLlm;

#[async_trait]
impl LlmBackend for CannedLlm {
    async fn stream_chat(
        &self,
        _messages: &[ChatMessage],
        _tools: &[serde_json::Value],
        _model_override: Option<&str>,
        _cancel: &CancelToken,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<StreamOutcome, LlmError> {
        on_delta("h");
        on_delta("i");
        Ok(StreamOutcome {
            content: "hi".to_string(),
            tool_calls: Vec::new(),
        })
    }
}

fn build_core() -> Arc<DaemonCore> {
    let registry = SessionRegistry::new(8, Duration::from_secs(1800));
    let queue = ResponseQueue::new(64);
    let ctx = WorkerContext::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        Arc::new(CannedLlm),
        ToolRegistry::new(),
        None,
        "You are a voice assistant.".to_string(),
        16_000,
    );
    let pool = WorkerPool::start(2, ctx);
    DaemonCore::new(Config::default(), registry, queue, pool)
}

async fn connect(core: &DaemonCore) -> (u64, mpsc::Receiver<OutboundFrame>) {
    let (tx, rx) = mpsc::channel(256);
    let conn_id = core.register_connection(tx).await;
    (conn_id, rx)
}

fn frames(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let OutboundFrame::Text(text) = frame {
            out.push(ServerMessage::decode(&text).unwrap());
        }
    }
    out
}

/// Pump workers and the drain loop until `pred` matches the frames seen
async fn collect_until(
    core: &DaemonCore,
    rx: &mut mpsc::Receiver<OutboundFrame>,
    pred: impl Fn(&[ServerMessage]) -> bool,
) -> Vec<ServerMessage> {
    let mut seen = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        core.drain_queue().await;
        seen.extend(frames(rx));
        if pred(&seen) {
            break;
        }
    }
    seen
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_chat_disconnect_reconnect_replay() -> anyhow::Result<()> {
    let core = build_core();

    // Connect: the daemon issues a token and an idle state
    let (conn_id, mut rx) = connect(&core).await;
    let mut conn = core.accept(conn_id).await.expect("accept failed");
    let greeting = frames(&mut rx);
    let token = match &greeting[0] {
        ServerMessage::Session { token } => token.clone(),
        other => panic!("expected session frame first, got {other:?}"),
    };

    // One text exchange
    core.handle_message(
        &mut conn,
        ClientMessage::Text {
            text: "hello".to_string(),
        },
    )
    .await;
    let seen = collect_until(&core, &mut rx, |seen| {
        seen.iter()
            .any(|f| matches!(f, ServerMessage::Transcript { role: Role::Assistant, .. }))
    })
    .await;
    assert!(seen.iter().any(|f| matches!(
        f,
        ServerMessage::Transcript { role: Role::User, text } if text == "hello"
    )));
    assert!(seen.iter().any(|f| matches!(
        f,
        ServerMessage::Transcript { role: Role::Assistant, text } if text == "hi"
    )));

    // Disconnect retains the session
    core.handle_close(&mut conn).await;
    core.unregister_connection(conn_id).await;

    // Reconnect on a fresh connection with the stored token
    let (conn2, mut rx2) = connect(&core).await;
    let mut conn = core.accept(conn2).await.expect("second accept failed");
    let _ = frames(&mut rx2);

    core.handle_message(&mut conn, ClientMessage::Reconnect { token: token.clone() })
        .await;

    let replay = frames(&mut rx2);
    assert!(
        matches!(&replay[0], ServerMessage::Session { token: t } if t == &token),
        "expected original token back, got {:?}",
        replay[0]
    );
    assert_eq!(
        replay[1],
        ServerMessage::Transcript {
            role: Role::User,
            text: "hello".to_string()
        }
    );
    assert_eq!(
        replay[2],
        ServerMessage::Transcript {
            role: Role::Assistant,
            text: "hi".to_string()
        }
    );
    assert!(matches!(&replay[3], ServerMessage::State { state, .. } if state == "idle"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_idempotence_and_unknown_token() -> anyhow::Result<()> {
    let core = build_core();
    let (conn_id, mut rx) = connect(&core).await;
    let mut conn = core.accept(conn_id).await.expect("accept failed");
    let own = conn.session.token.clone();
    let _ = frames(&mut rx);

    // Reconnecting to the already-bound session succeeds without rebinding
    core.handle_message(&mut conn, ClientMessage::Reconnect { token: own.clone() })
        .await;
    let seen = frames(&mut rx);
    assert!(matches!(&seen[0], ServerMessage::Session { token } if token == &own));

    // An unknown token keeps the fresh session and returns its token
    core.handle_message(
        &mut conn,
        ClientMessage::Reconnect {
            token: "deadbeefdeadbeefdeadbeefdeadbeef".to_string(),
        },
    )
    .await;
    let seen = frames(&mut rx);
    assert!(matches!(&seen[0], ServerMessage::Session { token } if token == &own));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queue_saturation_delivers_newest_64() -> anyhow::Result<()> {
    let core = build_core();
    let (conn_id, mut rx) = connect(&core).await;
    let conn = core.accept(conn_id).await.expect("accept failed");
    let _ = frames(&mut rx);

    // 65 rapid entries into a capacity-64 queue
    for i in 0..65u32 {
        core.queue.enqueue(
            Arc::clone(&conn.session),
            ResponseEntry::StreamDelta {
                stream_id: i,
                delta: format!("d{i}"),
            },
        );
    }
    assert_eq!(core.queue.dropped_count(), 1);

    core.drain_queue().await;
    let delivered = frames(&mut rx);
    assert_eq!(delivered.len(), 64);
    // Oldest entry gone; order preserved for the rest
    assert!(matches!(
        &delivered[0],
        ServerMessage::StreamDelta { stream_id: 1, .. }
    ));
    assert!(matches!(
        &delivered[63],
        ServerMessage::StreamDelta { stream_id: 64, .. }
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_suppresses_response_frames() -> anyhow::Result<()> {
    let core = build_core();
    let (conn_id, mut rx) = connect(&core).await;
    let mut conn = core.accept(conn_id).await.expect("accept failed");
    let _ = frames(&mut rx);

    // Disconnect immediately after submitting work: the worker observes the
    // flag and goes silent.
    core.handle_message(
        &mut conn,
        ClientMessage::Text {
            text: "doomed".to_string(),
        },
    )
    .await;
    conn.session.mark_disconnected();

    tokio::time::sleep(Duration::from_millis(200)).await;
    core.drain_queue().await;
    let seen = frames(&mut rx);
    assert!(
        seen.is_empty(),
        "no frames may reach a disconnected session, got {seen:?}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_limit_is_terminal_error() -> anyhow::Result<()> {
    let registry = SessionRegistry::new(1, Duration::from_secs(1800));
    let queue = ResponseQueue::new(64);
    let ctx = WorkerContext::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        Arc::new(CannedLlm),
        ToolRegistry::new(),
        None,
        "test".to_string(),
        16_000,
    );
    let pool = WorkerPool::start(1, ctx);
    let core = DaemonCore::new(Config::default(), registry, queue, pool);

    let (first, _first_rx) = connect(&core).await;
    core.accept(first).await.expect("first accept failed");

    let (second, mut second_rx) = connect(&core).await;
    assert!(core.accept(second).await.is_none());
    let seen = frames(&mut second_rx);
    assert!(matches!(
        &seen[0],
        ServerMessage::Error {
            code: ErrorCode::SessionLimit,
            recoverable: Some(false),
            ..
        }
    ));
    Ok(())
}
