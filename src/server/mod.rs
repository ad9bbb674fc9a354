//! Daemon runtime
//!
//! Wires the session registry, response queue, worker pool and connection
//! dispatcher together behind one WebSocket endpoint, plus the periodic
//! session reaper and the queue drain loop.

pub mod dispatcher;
pub mod llm;
pub mod queue;
pub mod tools;
pub mod worker;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::session::SessionRegistry;
use crate::voice::asr::{HttpAsr, HttpAsrConfig};

pub use dispatcher::{ws_handler, DaemonCore};
pub use llm::HttpLlm;
pub use queue::ResponseQueue;
pub use tools::ToolRegistry;
pub use worker::{WorkerContext, WorkerPool};

/// How often the registry is swept for expired sessions
const REAP_INTERVAL: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str = "You are a helpful voice assistant. Answers are \
spoken aloud, so keep them short, conversational, and free of markup.";

/// Build the daemon core from configuration
pub fn build_core(config: Config) -> Arc<DaemonCore> {
    let registry = SessionRegistry::new(
        config.daemon.max_sessions,
        Duration::from_secs(config.daemon.session_timeout_secs),
    );
    let queue = ResponseQueue::new(config.daemon.response_queue_capacity);
    let llm = Arc::new(HttpLlm::new(&config.llm));

    // Daemon-side recognition serves clients without local ASR
    let asr = Box::new(HttpAsr::new(HttpAsrConfig {
        sample_rate: config.voice.sample_rate,
        ..Default::default()
    }));

    let ctx = WorkerContext::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        llm,
        ToolRegistry::with_builtins(),
        Some(asr),
        SYSTEM_PROMPT.to_string(),
        config.voice.sample_rate,
    );
    let pool = WorkerPool::start(config.daemon.worker_pool_size, ctx);

    DaemonCore::new(config, registry, queue, pool)
}

/// Start the daemon and serve until the process is stopped
pub async fn start(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.daemon.host, config.daemon.port)
        .parse()
        .context("Invalid daemon bind address")?;
    let core = build_core(config);

    // Queue drain loop: the only path from workers to the wire
    tokio::spawn(Arc::clone(&core).drain_loop());

    // Periodic session reaper
    {
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                interval.tick().await;
                let reaped = core.registry.reap();
                if reaped > 0 {
                    info!(reaped, "reaped expired sessions");
                }
            }
        });
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(core);

    info!("daemon listening on ws://{addr}/ws");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind daemon port")?;
    axum::serve(listener, app)
        .await
        .context("Daemon server failed")?;
    Ok(())
}
