//! Session registry
//!
//! Process-wide authoritative mapping from session ids and reconnect tokens
//! to session state. Sessions survive transport disconnects: a closed
//! WebSocket marks the session disconnected and it is retained for the
//! session timeout so a client presenting its reconnect token gets its
//! conversation history back. A timed reaper destroys sessions once they
//! are disconnected, unreferenced and idle past the timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{HistoryEntry, Role, SessionKind};

/// Bound on the reconnect-token table; oldest-wins eviction beyond this
pub const MAX_TOKEN_ENTRIES: usize = 16;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("maximum concurrent sessions reached")]
    SessionLimit,
}

/// Metadata a satellite supplies at registration
#[derive(Debug, Clone)]
pub struct SatelliteIdentity {
    pub uuid: String,
    pub name: String,
    pub location: String,
    pub tier: u8,
    pub local_asr: bool,
    pub local_tts: bool,
    pub wake_word: bool,
}

/// One logical conversation endpoint
pub struct Session {
    pub id: u32,
    pub token: String,
    kind: Mutex<SessionKind>,
    history: Mutex<Vec<HistoryEntry>>,
    disconnected: AtomicBool,
    refs: AtomicU32,
    /// One in-flight work item per session
    busy: AtomicBool,
    /// Client asked to abort the in-flight response
    cancel_requested: AtomicBool,
    pending_destroy: AtomicBool,
    last_touch: Mutex<Instant>,
    /// Per-session LLM routing override
    model_override: Mutex<Option<String>>,
    /// Weak back-pointer: id into the dispatcher's connection table
    connection: Mutex<Option<u64>>,
    satellite: Mutex<Option<SatelliteIdentity>>,
}

impl Session {
    fn new(id: u32, token: String, kind: SessionKind) -> Self {
        Self {
            id,
            token,
            kind: Mutex::new(kind),
            history: Mutex::new(Vec::new()),
            disconnected: AtomicBool::new(false),
            refs: AtomicU32::new(1),
            busy: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            pending_destroy: AtomicBool::new(false),
            last_touch: Mutex::new(Instant::now()),
            model_override: Mutex::new(None),
            connection: Mutex::new(None),
            satellite: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> SessionKind {
        *self.kind.lock().unwrap()
    }

    /// A plain WebSocket session becomes a satellite session at registration
    pub fn set_kind(&self, kind: SessionKind) {
        *self.kind.lock().unwrap() = kind;
    }

    /// Cooperative cancel signal observed by workers
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
        *self.connection.lock().unwrap() = None;
    }

    pub fn clear_disconnected(&self) {
        self.disconnected.store(false, Ordering::Release);
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Take an additional reference, e.g. for a work item in flight.
    /// Balanced by `SessionRegistry::release`.
    pub fn retain(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Request cooperative cancellation of the in-flight response
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Clear the cancel flag at pipeline end
    pub fn clear_cancel(&self) {
        self.cancel_requested.store(false, Ordering::Release);
    }

    pub fn touch(&self) {
        *self.last_touch.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_touch.lock().unwrap().elapsed()
    }

    /// Claim the session for one work item; false when one is in flight
    pub fn try_claim_work(&self) -> bool {
        !self.busy.swap(true, Ordering::AcqRel)
    }

    pub fn finish_work(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn append_history(&self, role: Role, content: impl Into<String>) {
        self.history
            .lock()
            .unwrap()
            .push(HistoryEntry::new(role, content));
    }

    /// Full ordered history copy
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().unwrap().clone()
    }

    /// History filtered for transcript replay (system turns skipped)
    pub fn replayable_history(&self) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.role != Role::System)
            .cloned()
            .collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap().clear();
    }

    pub fn set_connection(&self, connection_id: Option<u64>) {
        *self.connection.lock().unwrap() = connection_id;
    }

    pub fn connection(&self) -> Option<u64> {
        *self.connection.lock().unwrap()
    }

    pub fn set_model_override(&self, model: Option<String>) {
        *self.model_override.lock().unwrap() = model;
    }

    pub fn model_override(&self) -> Option<String> {
        self.model_override.lock().unwrap().clone()
    }

    pub fn set_satellite(&self, identity: SatelliteIdentity) {
        *self.satellite.lock().unwrap() = Some(identity);
    }

    pub fn satellite(&self) -> Option<SatelliteIdentity> {
        self.satellite.lock().unwrap().clone()
    }
}

struct TokenEntry {
    token: String,
    session_id: u32,
    created_at: Instant,
}

struct SecretEntry {
    secret: String,
    session_id: u32,
}

/// Registry of live sessions plus the bounded reconnect-token table
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u32, Arc<Session>>>,
    tokens: Mutex<Vec<TokenEntry>>,
    secrets: Mutex<Vec<SecretEntry>>,
    next_id: AtomicU32,
    max_sessions: usize,
    session_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, session_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            tokens: Mutex::new(Vec::new()),
            secrets: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            max_sessions,
            session_timeout,
        })
    }

    /// Create a session with a fresh reconnect token. The returned session
    /// carries one reference owned by the caller.
    pub fn create(&self, kind: SessionKind) -> Result<Arc<Session>, RegistryError> {
        let mut sessions = self.sessions.lock().unwrap();
        let live = sessions
            .values()
            .filter(|s| !s.is_disconnected())
            .count();
        if live >= self.max_sessions {
            warn!(max = self.max_sessions, "session limit reached");
            return Err(RegistryError::SessionLimit);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = generate_token();
        let session = Arc::new(Session::new(id, token.clone(), kind));
        sessions.insert(id, Arc::clone(&session));
        drop(sessions);

        self.insert_token(token, id);
        info!(session_id = id, %kind, "session created");
        Ok(session)
    }

    /// Fast lookup for active sessions; increments the reference count
    pub fn get(&self, id: u32) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&id)?;
        if session.is_disconnected() {
            return None;
        }
        session.refs.fetch_add(1, Ordering::AcqRel);
        Some(Arc::clone(session))
    }

    /// Lookup that also returns disconnected sessions, for reconnects
    pub fn get_for_reconnect(&self, id: u32) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&id)?;
        session.refs.fetch_add(1, Ordering::AcqRel);
        Some(Arc::clone(session))
    }

    /// Resolve a reconnect token to its session; increments the reference
    /// count of the returned session.
    pub fn lookup_by_token(&self, token: &str) -> Option<Arc<Session>> {
        let session_id = {
            let tokens = self.tokens.lock().unwrap();
            tokens
                .iter()
                .find(|entry| entry.token == token)
                .map(|entry| entry.session_id)?
        };
        self.get_for_reconnect(session_id)
    }

    /// Drop one reference; destroys the session if a destroy is pending
    pub fn release(&self, session: &Session) {
        let previous = session.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "session reference underflow");
        if previous == 1 && session.pending_destroy.load(Ordering::Acquire) {
            self.remove(session.id);
        }
    }

    /// Mark for destruction; the actual free happens at zero references
    pub fn destroy(&self, id: u32) {
        let session = {
            let sessions = self.sessions.lock().unwrap();
            match sessions.get(&id) {
                Some(s) => Arc::clone(s),
                None => return,
            }
        };
        session.pending_destroy.store(true, Ordering::Release);
        if session.ref_count() == 0 {
            self.remove(id);
        }
    }

    /// Issue a satellite reconnect secret bound to `session_id`
    pub fn issue_secret(&self, session_id: u32) -> String {
        let secret = generate_secret();
        let mut secrets = self.secrets.lock().unwrap();
        secrets.retain(|entry| entry.session_id != session_id);
        if secrets.len() >= MAX_TOKEN_ENTRIES {
            secrets.remove(0);
        }
        secrets.push(SecretEntry {
            secret: secret.clone(),
            session_id,
        });
        secret
    }

    /// Resolve a persisted satellite secret; increments the reference count
    pub fn lookup_by_secret(&self, secret: &str) -> Option<Arc<Session>> {
        let session_id = {
            let secrets = self.secrets.lock().unwrap();
            secrets
                .iter()
                .find(|entry| entry.secret == secret)
                .map(|entry| entry.session_id)?
        };
        self.get_for_reconnect(session_id)
    }

    /// Destroy sessions that are disconnected, unreferenced and idle past
    /// the timeout. Returns how many were reaped.
    pub fn reap(&self) -> usize {
        let expired: Vec<u32> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|s| {
                    s.is_disconnected()
                        && s.ref_count() == 0
                        && s.idle_for() >= self.session_timeout
                })
                .map(|s| s.id)
                .collect()
        };
        for id in &expired {
            info!(session_id = id, "reaping idle session");
            self.remove(*id);
        }
        expired.len()
    }

    /// Sessions currently in the table, disconnected included
    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().unwrap().is_empty()
    }

    /// Live token mappings (diagnostics and tests)
    pub fn token_count(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }

    fn insert_token(&self, token: String, session_id: u32) {
        let mut tokens = self.tokens.lock().unwrap();
        // At most one live entry per token string
        tokens.retain(|entry| entry.token != token);
        if tokens.len() >= MAX_TOKEN_ENTRIES {
            let oldest = tokens
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(idx, _)| idx);
            if let Some(idx) = oldest {
                let evicted = tokens.remove(idx);
                debug!(session_id = evicted.session_id, "evicted oldest token mapping");
            }
        }
        tokens.push(TokenEntry {
            token,
            session_id,
            created_at: Instant::now(),
        });
    }

    fn remove(&self, id: u32) {
        let removed = self.sessions.lock().unwrap().remove(&id);
        if let Some(session) = removed {
            self.tokens
                .lock()
                .unwrap()
                .retain(|entry| entry.session_id != id);
            self.secrets
                .lock()
                .unwrap()
                .retain(|entry| entry.session_id != id);
            debug!(session_id = session.id, "session destroyed");
        }
    }
}

/// 128-bit random reconnect token as 32 lowercase hex chars
pub fn generate_token() -> String {
    let value: u128 = rand::rng().random();
    format!("{value:032x}")
}

/// 256-bit satellite reconnect secret as 64 lowercase hex chars
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}
