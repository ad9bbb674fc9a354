//! Worker pool
//!
//! Bounded pool of tasks running session-scoped pipelines: ASR for buffered
//! audio, then LLM rounds with tool fan-out, with every response chunk
//! published through the response queue. Cancellation is cooperative:
//! workers poll the session's disconnect/cancel flags before the LLM call,
//! between tool rounds and before each outbound chunk, and the LLM client
//! aborts mid-stream through the cancel token.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audio::{Decoder, Pcm16Decoder};
use crate::error::ErrorCode;
use crate::server::llm::{CancelToken, ChatMessage, LlmBackend, LlmError};
use crate::server::queue::{ResponseEntry, ResponseQueue};
use crate::server::tools::{ToolContext, ToolRegistry};
use crate::session::{Session, SessionRegistry};
use crate::types::{ClientState, Role};
use crate::voice::asr::AsrEngine;

/// Upper bound on tool round-trips per work item
const MAX_TOOL_ROUNDS: usize = 4;

/// Pending work items the pool will hold before refusing submissions
const WORK_BACKLOG: usize = 32;

/// What a work item carries. The worker owns the payload memory until it
/// finishes or is cancelled.
pub enum WorkPayload {
    /// WebUI text query
    Text(String),
    /// Buffered utterance audio handed over at end-of-utterance
    Audio(Vec<u8>),
}

pub struct WorkItem {
    pub session: Arc<Session>,
    pub payload: WorkPayload,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// A work item is already in flight for this session
    #[error("session busy")]
    Busy,
    #[error("worker backlog full")]
    Backlog,
}

/// Dependencies shared by every worker
pub struct WorkerContext {
    pub registry: Arc<SessionRegistry>,
    pub queue: Arc<ResponseQueue>,
    pub llm: Arc<dyn LlmBackend>,
    pub tools: ToolRegistry,
    /// Daemon-side recognition for clients without local ASR
    pub asr: Option<tokio::sync::Mutex<Box<dyn AsrEngine>>>,
    pub system_prompt: String,
    pub voice_sample_rate: u32,
    next_stream_id: AtomicU32,
}

impl WorkerContext {
    pub fn new(
        registry: Arc<SessionRegistry>,
        queue: Arc<ResponseQueue>,
        llm: Arc<dyn LlmBackend>,
        tools: ToolRegistry,
        asr: Option<Box<dyn AsrEngine>>,
        system_prompt: String,
        voice_sample_rate: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue,
            llm,
            tools,
            asr: asr.map(tokio::sync::Mutex::new),
            system_prompt,
            voice_sample_rate,
            next_stream_id: AtomicU32::new(1),
        })
    }
}

pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    tx: mpsc::Sender<WorkItem>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(size: usize, ctx: Arc<WorkerContext>) -> Self {
        let (tx, rx) = mpsc::channel::<WorkItem>(WORK_BACKLOG);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(size);
        for worker_id in 0..size.max(1) {
            let rx = Arc::clone(&rx);
            let ctx = Arc::clone(&ctx);
            handles.push(tokio::spawn(async move {
                debug!(worker_id, "worker started");
                loop {
                    let item = { rx.lock().await.recv().await };
                    match item {
                        Some(item) => process_item(&ctx, item).await,
                        None => break,
                    }
                }
                debug!(worker_id, "worker stopped");
            }));
        }
        Self { ctx, tx, handles }
    }

    /// Claim the session and hand a work item to the pool. The claim and
    /// the extra session reference are both undone if the backlog is full.
    pub fn dispatch(
        &self,
        session: &Arc<Session>,
        payload: WorkPayload,
    ) -> Result<(), DispatchError> {
        if !session.try_claim_work() {
            return Err(DispatchError::Busy);
        }
        session.retain();
        let item = WorkItem {
            session: Arc::clone(session),
            payload,
        };
        if let Err(e) = self.tx.try_send(item) {
            let item = match e {
                mpsc::error::TrySendError::Full(item)
                | mpsc::error::TrySendError::Closed(item) => item,
            };
            item.session.finish_work();
            self.ctx.registry.release(&item.session);
            return Err(DispatchError::Backlog);
        }
        Ok(())
    }

    /// Stop accepting work and wait for the workers to drain
    pub async fn shutdown(self) {
        drop(self.tx);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Run one work item to completion. Public for the pool workers and for
/// deterministic pipeline tests.
pub async fn process_item(ctx: &WorkerContext, item: WorkItem) {
    let session = item.session;
    let started = Instant::now();

    run_pipeline(ctx, &session, item.payload, started).await;

    session.clear_cancel();
    session.finish_work();
    ctx.registry.release(&session);
}

async fn run_pipeline(
    ctx: &WorkerContext,
    session: &Arc<Session>,
    payload: WorkPayload,
    started: Instant,
) {
    let cancel = CancelToken::for_session(Arc::clone(session));

    let text = match payload {
        WorkPayload::Text(text) => text,
        WorkPayload::Audio(bytes) => {
            if cancel.is_cancelled() {
                return;
            }
            ctx.queue.enqueue(
                Arc::clone(session),
                ResponseEntry::State {
                    state: ClientState::Processing,
                    detail: None,
                },
            );
            match transcribe(ctx, &bytes).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(session_id = session.id, "daemon-side ASR failed: {e}");
                    emit_error(ctx, session, ErrorCode::AsrFailed, e.to_string());
                    return;
                }
            }
        }
    };

    let text = text.trim().to_string();
    if text.is_empty() {
        debug!(session_id = session.id, "empty query, returning to idle");
        emit_state(ctx, session, ClientState::Idle);
        return;
    }

    if cancel.is_cancelled() {
        debug!(session_id = session.id, "cancelled before model call");
        return;
    }

    ctx.queue.enqueue(
        Arc::clone(session),
        ResponseEntry::Transcript {
            role: Role::User,
            text: text.clone(),
        },
    );
    session.append_history(Role::User, &text);
    session.touch();
    emit_state(ctx, session, ClientState::Responding);

    let stream_id = ctx.next_stream_id.fetch_add(1, Ordering::Relaxed);
    ctx.queue.enqueue(
        Arc::clone(session),
        ResponseEntry::StreamStart { stream_id },
    );

    // System prompt, prior turns, then locally-accumulated tool traffic
    let mut messages = vec![ChatMessage::system(&ctx.system_prompt)];
    messages.extend(session.history().iter().map(ChatMessage::from));

    // Per-session routing decision, set via the client's config message
    let model_override = session.model_override();
    if let Some(model) = &model_override {
        debug!(session_id = session.id, %model, "session model override active");
    }

    let tool_defs = if ctx.tools.is_empty() {
        Vec::new()
    } else {
        ctx.tools.definitions()
    };

    let mut final_text = String::new();
    for round in 0..MAX_TOOL_ROUNDS {
        if cancel.is_cancelled() {
            debug!(session_id = session.id, "cancelled between tool rounds");
            return;
        }

        let queue = Arc::clone(&ctx.queue);
        let delta_session = Arc::clone(session);
        let mut on_delta = move |delta: &str| {
            if delta_session.is_disconnected() {
                return;
            }
            queue.enqueue(
                Arc::clone(&delta_session),
                ResponseEntry::StreamDelta {
                    stream_id,
                    delta: delta.to_string(),
                },
            );
        };

        let outcome = match ctx
            .llm
            .stream_chat(
                &messages,
                &tool_defs,
                model_override.as_deref(),
                &cancel,
                &mut on_delta,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(LlmError::Cancelled) => {
                // Peer is gone; no frame is emitted
                debug!(session_id = session.id, "model call cancelled");
                return;
            }
            Err(LlmError::Timeout(limit)) => {
                warn!(session_id = session.id, "model call exceeded {limit:?}");
                emit_error(
                    ctx,
                    session,
                    ErrorCode::LlmTimeout,
                    format!("model call exceeded {}s", limit.as_secs()),
                );
                return;
            }
            Err(e) => {
                warn!(session_id = session.id, "model call failed: {e}");
                emit_error(ctx, session, ErrorCode::LlmError, e.to_string());
                return;
            }
        };

        if outcome.tool_calls.is_empty() {
            final_text = outcome.content;
            break;
        }

        if round + 1 == MAX_TOOL_ROUNDS {
            warn!(session_id = session.id, "tool round limit reached");
            final_text = outcome.content;
            break;
        }

        info!(
            session_id = session.id,
            count = outcome.tool_calls.len(),
            "executing tool calls"
        );
        let tool_ctx = ToolContext {
            session: Arc::clone(session),
            registry: Arc::clone(&ctx.registry),
            started,
        };
        messages.push(ChatMessage::assistant_tool_calls(
            outcome.tool_calls.clone(),
        ));
        let outcomes = ctx.tools.execute_batch(&outcome.tool_calls, &tool_ctx).await;
        for result in outcomes {
            messages.push(ChatMessage::tool_result(result.call_id, result.output));
        }
    }

    if cancel.is_cancelled() {
        return;
    }

    ctx.queue
        .enqueue(Arc::clone(session), ResponseEntry::StreamEnd { stream_id });
    session.append_history(Role::Assistant, &final_text);
    session.touch();
    ctx.queue.enqueue(
        Arc::clone(session),
        ResponseEntry::Transcript {
            role: Role::Assistant,
            text: final_text,
        },
    );
    emit_state(ctx, session, ClientState::Idle);
}

async fn transcribe(ctx: &WorkerContext, bytes: &[u8]) -> anyhow::Result<String> {
    let Some(asr) = &ctx.asr else {
        anyhow::bail!("no recognition engine configured");
    };
    let mut decoder = Pcm16Decoder::new(1, ctx.voice_sample_rate);
    let mut samples = Vec::new();
    decoder
        .decode(bytes, &mut samples)
        .map_err(|e| anyhow::anyhow!("utterance decode failed: {e}"))?;
    let mut engine = asr.lock().await;
    engine.finalize(&samples).await
}

fn emit_state(ctx: &WorkerContext, session: &Arc<Session>, state: ClientState) {
    ctx.queue.enqueue(
        Arc::clone(session),
        ResponseEntry::State {
            state,
            detail: None,
        },
    );
}

fn emit_error(ctx: &WorkerContext, session: &Arc<Session>, code: ErrorCode, message: String) {
    ctx.queue.enqueue(
        Arc::clone(session),
        ResponseEntry::Error {
            code,
            message,
            recoverable: code.recoverable(),
        },
    );
    emit_state(ctx, session, ClientState::Idle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::llm::{FunctionCall, StreamOutcome, ToolCallOut};
    use crate::types::SessionKind;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Backend replaying a script of round outcomes
    struct ScriptedLlm {
        rounds: StdMutex<Vec<ScriptedRound>>,
        seen_models: StdMutex<Vec<Option<String>>>,
    }

    enum ScriptedRound {
        Content(Vec<&'static str>),
        ToolCalls(Vec<ToolCallOut>),
        Timeout,
        Fail(&'static str),
        /// Emits one delta, then reports cancellation
        CancelAfterOneDelta,
    }

    impl ScriptedLlm {
        fn new(rounds: Vec<ScriptedRound>) -> Arc<Self> {
            Arc::new(Self {
                rounds: StdMutex::new(rounds),
                seen_models: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedLlm {
        async fn stream_chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[serde_json::Value],
            model_override: Option<&str>,
            cancel: &CancelToken,
            on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<StreamOutcome, LlmError> {
            self.seen_models
                .lock()
                .unwrap()
                .push(model_override.map(str::to_string));
            let mut rounds = self.rounds.lock().unwrap();
            if rounds.is_empty() {
                return Ok(StreamOutcome {
                    content: "done".to_string(),
                    tool_calls: Vec::new(),
                });
            }
            let round = rounds.remove(0);
            drop(rounds);
            match round {
                ScriptedRound::Content(deltas) => {
                    let mut content = String::new();
                    for delta in deltas {
                        if cancel.is_cancelled() {
                            return Err(LlmError::Cancelled);
                        }
                        content.push_str(delta);
                        on_delta(delta);
                    }
                    Ok(StreamOutcome {
                        content,
                        tool_calls: Vec::new(),
                    })
                }
                ScriptedRound::ToolCalls(calls) => Ok(StreamOutcome {
                    content: String::new(),
                    tool_calls: calls,
                }),
                ScriptedRound::Timeout => Err(LlmError::Timeout(Duration::from_secs(30))),
                ScriptedRound::Fail(msg) => Err(LlmError::Api(msg.to_string())),
                ScriptedRound::CancelAfterOneDelta => {
                    on_delta("partial");
                    Err(LlmError::Cancelled)
                }
            }
        }
    }

    fn build_ctx(llm: Arc<dyn LlmBackend>, tools: ToolRegistry) -> Arc<WorkerContext> {
        let registry = SessionRegistry::new(8, Duration::from_secs(1800));
        let queue = ResponseQueue::new(256);
        WorkerContext::new(
            registry,
            queue,
            llm,
            tools,
            None,
            "You are a voice assistant.".to_string(),
            16_000,
        )
    }

    fn make_item(ctx: &WorkerContext, text: &str) -> WorkItem {
        let session = ctx.registry.create(SessionKind::Websocket).unwrap();
        assert!(session.try_claim_work());
        session.retain();
        WorkItem {
            session,
            payload: WorkPayload::Text(text.to_string()),
        }
    }

    fn entries(ctx: &WorkerContext) -> Vec<ResponseEntry> {
        ctx.queue.drain().into_iter().map(|q| q.entry).collect()
    }

    #[tokio::test]
    async fn test_text_pipeline_happy_path() {
        let llm = ScriptedLlm::new(vec![ScriptedRound::Content(vec![
            "It is ",
            "ten fifteen.",
        ])]);
        let ctx = build_ctx(llm, ToolRegistry::new());
        let item = make_item(&ctx, "what time is it");
        let session = Arc::clone(&item.session);

        process_item(&ctx, item).await;

        let entries = entries(&ctx);
        assert!(matches!(
            entries[0],
            ResponseEntry::Transcript { role: Role::User, .. }
        ));
        assert!(matches!(
            entries[1],
            ResponseEntry::State { state: ClientState::Responding, .. }
        ));
        assert!(matches!(entries[2], ResponseEntry::StreamStart { .. }));
        assert_eq!(
            entries[3],
            ResponseEntry::StreamDelta {
                stream_id: 1,
                delta: "It is ".to_string()
            }
        );
        assert_eq!(
            entries[4],
            ResponseEntry::StreamDelta {
                stream_id: 1,
                delta: "ten fifteen.".to_string()
            }
        );
        assert!(matches!(entries[5], ResponseEntry::StreamEnd { .. }));
        assert_eq!(
            entries[6],
            ResponseEntry::Transcript {
                role: Role::Assistant,
                text: "It is ten fifteen.".to_string()
            }
        );
        assert!(matches!(
            entries[7],
            ResponseEntry::State { state: ClientState::Idle, .. }
        ));

        // History recorded both turns; busy flag and extra ref released
        assert_eq!(session.history().len(), 2);
        assert!(session.try_claim_work());
        assert_eq!(session.ref_count(), 1);
    }

    #[tokio::test]
    async fn test_llm_timeout_emits_single_recoverable_error() {
        let llm = ScriptedLlm::new(vec![
            ScriptedRound::Timeout,
            ScriptedRound::Content(vec!["recovered"]),
        ]);
        let ctx = build_ctx(llm, ToolRegistry::new());
        let item = make_item(&ctx, "slow question");
        let session = Arc::clone(&item.session);

        process_item(&ctx, item).await;

        let entries = entries(&ctx);
        let errors: Vec<_> = entries
            .iter()
            .filter(|e| matches!(e, ResponseEntry::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            errors[0],
            ResponseEntry::Error {
                code: ErrorCode::LlmTimeout,
                recoverable: true,
                ..
            }
        ));
        assert!(matches!(
            entries.last().unwrap(),
            ResponseEntry::State { state: ClientState::Idle, .. }
        ));
        // No stream end was emitted for the aborted stream
        assert!(!entries.iter().any(|e| matches!(e, ResponseEntry::StreamEnd { .. })));

        // Session remains usable for the next request
        assert!(session.try_claim_work());
        session.retain();
        process_item(
            &ctx,
            WorkItem {
                session: Arc::clone(&session),
                payload: WorkPayload::Text("again".to_string()),
            },
        )
        .await;
        let entries = self::entries(&ctx);
        assert!(entries.iter().any(|e| matches!(
            e,
            ResponseEntry::Transcript { role: Role::Assistant, .. }
        )));
    }

    #[tokio::test]
    async fn test_cancellation_is_silent() {
        let llm = ScriptedLlm::new(vec![ScriptedRound::CancelAfterOneDelta]);
        let ctx = build_ctx(llm, ToolRegistry::new());
        let item = make_item(&ctx, "never mind");
        let session = Arc::clone(&item.session);
        session.mark_disconnected();

        process_item(&ctx, item).await;

        // Cancellation pre-LLM: only the entries from before the disconnect
        // observation may exist; no error, no stream end, no assistant turn.
        let entries = entries(&ctx);
        assert!(!entries.iter().any(|e| matches!(e, ResponseEntry::Error { .. })));
        assert!(!entries.iter().any(|e| matches!(e, ResponseEntry::StreamEnd { .. })));
        assert!(!entries.iter().any(|e| matches!(
            e,
            ResponseEntry::Transcript { role: Role::Assistant, .. }
        )));
        assert_eq!(session.ref_count(), 1);
        assert!(session.try_claim_work());
    }

    #[tokio::test]
    async fn test_client_cancel_flag_aborts_and_clears() {
        let llm = ScriptedLlm::new(vec![ScriptedRound::Content(vec!["ignored"])]);
        let ctx = build_ctx(llm, ToolRegistry::new());
        let item = make_item(&ctx, "question");
        let session = Arc::clone(&item.session);
        session.request_cancel();

        process_item(&ctx, item).await;

        assert!(!session.cancel_requested(), "cancel flag must clear");
        let entries = entries(&ctx);
        assert!(!entries.iter().any(|e| matches!(
            e,
            ResponseEntry::Transcript { role: Role::Assistant, .. }
        )));
    }

    #[tokio::test]
    async fn test_tool_round_then_answer() {
        let calls = vec![ToolCallOut {
            id: "c1".to_string(),
            call_type: "function",
            function: FunctionCall {
                name: "current_time".to_string(),
                arguments: "{}".to_string(),
            },
        }];
        let llm = ScriptedLlm::new(vec![
            ScriptedRound::ToolCalls(calls),
            ScriptedRound::Content(vec!["It is noon."]),
        ]);
        let ctx = build_ctx(llm, ToolRegistry::with_builtins());
        let item = make_item(&ctx, "what time is it");

        process_item(&ctx, item).await;

        let entries = entries(&ctx);
        assert!(entries.iter().any(|e| matches!(
            e,
            ResponseEntry::Transcript { role: Role::Assistant, text } if text == "It is noon."
        )));
    }

    #[tokio::test]
    async fn test_session_model_override_reaches_backend() {
        let llm = ScriptedLlm::new(vec![
            ScriptedRound::Content(vec!["first"]),
            ScriptedRound::Content(vec!["second"]),
        ]);
        let ctx = build_ctx(Arc::clone(&llm) as Arc<dyn LlmBackend>, ToolRegistry::new());

        // Default routing: no override
        let item = make_item(&ctx, "hello");
        let session = Arc::clone(&item.session);
        process_item(&ctx, item).await;
        assert_eq!(llm.seen_models.lock().unwrap().as_slice(), &[None]);

        // The client's config message picked a model for this session
        session.set_model_override(Some("tiny-local".to_string()));
        assert!(session.try_claim_work());
        session.retain();
        process_item(
            &ctx,
            WorkItem {
                session,
                payload: WorkPayload::Text("again".to_string()),
            },
        )
        .await;
        assert_eq!(
            llm.seen_models.lock().unwrap().as_slice(),
            &[None, Some("tiny-local".to_string())]
        );
    }

    #[tokio::test]
    async fn test_llm_error_maps_to_llm_error_code() {
        let llm = ScriptedLlm::new(vec![ScriptedRound::Fail("500: boom")]);
        let ctx = build_ctx(llm, ToolRegistry::new());
        let item = make_item(&ctx, "hi");

        process_item(&ctx, item).await;

        let entries = entries(&ctx);
        assert!(entries.iter().any(|e| matches!(
            e,
            ResponseEntry::Error { code: ErrorCode::LlmError, recoverable: true, .. }
        )));
    }

    #[tokio::test]
    async fn test_empty_text_short_circuits() {
        let llm = ScriptedLlm::new(vec![]);
        let ctx = build_ctx(llm, ToolRegistry::new());
        let item = make_item(&ctx, "   ");
        let session = Arc::clone(&item.session);

        process_item(&ctx, item).await;
        let entries = entries(&ctx);
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            entries[0],
            ResponseEntry::State { state: ClientState::Idle, .. }
        ));
        assert!(session.history().is_empty());
    }

    #[tokio::test]
    async fn test_pool_dispatch_and_busy_rejection() {
        let llm = ScriptedLlm::new(vec![ScriptedRound::Content(vec!["ok"])]);
        let ctx = build_ctx(llm, ToolRegistry::new());
        let pool = WorkerPool::start(2, Arc::clone(&ctx));

        let session = ctx.registry.create(SessionKind::Websocket).unwrap();
        pool.dispatch(&session, WorkPayload::Text("hello".to_string()))
            .unwrap();
        // Second dispatch while the first is (or may be) in flight
        let second = pool.dispatch(&session, WorkPayload::Text("again".to_string()));
        if let Err(e) = second {
            assert!(matches!(e, DispatchError::Busy));
        }

        // Wait for the pipeline to finish
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while session.history().len() < 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.history().len() >= 2);
        pool.shutdown().await;
    }
}
