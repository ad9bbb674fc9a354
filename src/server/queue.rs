//! Cross-thread response queue
//!
//! Bounded FIFO carrying typed response entries from worker tasks to the
//! socket I/O side. Enqueue never blocks: when the queue is full the oldest
//! entry is dropped with a warning, because stale UI state accumulating is
//! worse than losing one update. Every enqueue wakes the drain loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::error::ErrorCode;
use crate::session::Session;
use crate::types::{ClientState, Role};

/// Typed payload of one outbound response
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEntry {
    State {
        state: ClientState,
        detail: Option<String>,
    },
    Transcript {
        role: Role,
        text: String,
    },
    Error {
        code: ErrorCode,
        message: String,
        recoverable: bool,
    },
    SessionToken {
        token: String,
    },
    StreamStart {
        stream_id: u32,
    },
    StreamDelta {
        stream_id: u32,
        delta: String,
    },
    StreamEnd {
        stream_id: u32,
    },
}

/// One queued response bound to its originating session
pub struct QueuedResponse {
    pub session: Arc<Session>,
    pub entry: ResponseEntry,
}

pub struct ResponseQueue {
    inner: Mutex<VecDeque<QueuedResponse>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl ResponseQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Thread-safe, non-blocking enqueue with oldest-drop on overflow
    pub fn enqueue(&self, session: Arc<Session>, entry: ResponseEntry) {
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() >= self.capacity {
                let dropped = queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                if let Some(dropped) = dropped {
                    warn!(
                        session_id = dropped.session.id,
                        "response queue full, dropped oldest entry"
                    );
                }
            }
            queue.push_back(QueuedResponse { session, entry });
        }
        self.notify.notify_one();
    }

    /// Take every queued entry in FIFO order
    pub fn drain(&self) -> Vec<QueuedResponse> {
        let mut queue = self.inner.lock().unwrap();
        queue.drain(..).collect()
    }

    /// Wait until an enqueue occurs. A permit is stored if an enqueue beat
    /// the waiter, so wakeups are never lost.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Total entries discarded due to overflow
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
