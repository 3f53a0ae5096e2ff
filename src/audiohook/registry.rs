//! # Session Registry
//!
//! Process-wide directory of live AudioHook sessions. This is the only state
//! shared between connections; everything else is owned by the connection task.
//!
//! ## Responsibilities:
//! - **Id reservation**: atomic uniqueness, ids are never handed out twice for
//!   the lifetime of the process
//! - **Admission**: refuses new sessions at capacity or while draining
//! - **Directory**: `get`, `list`, `count` for the diagnostics API
//! - **Close requests**: each session gets a cancellation token derived from a
//!   registry-wide root token; cancelling the root is a shutdown
//! - **Outcomes**: failure counters by error code plus a broadcast channel of
//!   final session summaries
//!
//! ## Thread Safety:
//! Uses `DashMap` (sharded locks) so unrelated sessions never contend on one
//! global lock. No guard is ever held across an `.await`.

use crate::audiohook::message::CloseReason;
use crate::audiohook::session::{SessionIds, SessionState, SessionSummary};
use crate::error::{ErrorCode, ProtocolError};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SUMMARY_CHANNEL_CAPACITY: usize = 256;

/// One registered session.
#[derive(Debug)]
struct SessionEntry {
    reserved_at: DateTime<Utc>,
    cancel: CancellationToken,
    requested_close: Option<CloseReason>,
    /// Latest snapshot published by the owning connection
    snapshot: Option<SessionSummary>,
}

/// What `shutdown` managed to do within its grace period.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub drained: bool,
    pub stragglers: Vec<String>,
}

/// Point-in-time registry counters for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub draining: bool,
    pub opened_total: u64,
    pub closed_total: u64,
    pub errored_total: u64,
    pub status_counts: HashMap<String, usize>,
    pub failures: HashMap<ErrorCode, u64>,
}

pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    /// Every id ever reserved
    used_ids: DashMap<String, DateTime<Utc>>,
    active: AtomicUsize,
    max_concurrent_sessions: usize,
    draining: AtomicBool,
    root: CancellationToken,
    drained: Notify,

    opened_total: AtomicU64,
    closed_total: AtomicU64,
    errored_total: AtomicU64,
    failures: [AtomicU64; ErrorCode::ALL.len()],

    summaries: broadcast::Sender<SessionSummary>,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        let (summaries, _) = broadcast::channel(SUMMARY_CHANNEL_CAPACITY);
        Self {
            sessions: DashMap::new(),
            used_ids: DashMap::new(),
            active: AtomicUsize::new(0),
            max_concurrent_sessions,
            draining: AtomicBool::new(false),
            root: CancellationToken::new(),
            drained: Notify::new(),
            opened_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
            errored_total: AtomicU64::new(0),
            failures: Default::default(),
            summaries,
        }
    }

    /// Claim a session id and admit the session.
    ///
    /// ## Returns:
    /// - **Ok(id)**: the proposed id, or a fresh UUID v4 when none was proposed
    /// - **Err(ProtocolViolation)**: id already used, capacity reached, or draining
    pub fn reserve(&self, proposed: Option<&str>) -> Result<String, ProtocolError> {
        if self.is_draining() {
            return Err(ProtocolError::ProtocolViolation(
                "server is shutting down".to_string(),
            ));
        }

        let id = match proposed {
            Some(id) if id.trim().is_empty() => {
                return Err(ProtocolError::ProtocolViolation("empty session id".to_string()))
            }
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let limit = self.max_concurrent_sessions;
        if self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .is_err()
        {
            return Err(ProtocolError::ProtocolViolation(format!(
                "maximum concurrent sessions ({}) reached",
                limit
            )));
        }

        match self.used_ids.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.active.fetch_sub(1, Ordering::SeqCst);
                return Err(ProtocolError::ProtocolViolation(format!(
                    "session id '{}' already used",
                    id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }

        self.sessions.insert(
            id.clone(),
            SessionEntry {
                reserved_at: Utc::now(),
                cancel: self.root.child_token(),
                requested_close: None,
                snapshot: None,
            },
        );
        self.opened_total.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %id, active = self.count(), "Session id reserved");
        Ok(id)
    }

    /// Publish the latest snapshot of an open session.
    pub fn register(&self, summary: SessionSummary) {
        let Some(id) = summary.session_id.clone() else {
            return;
        };
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.snapshot = Some(summary);
        }
    }

    /// Drop a session from the directory. Safe to call more than once.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            self.active.fetch_sub(1, Ordering::SeqCst);
            debug!(session_id = %session_id, active = self.count(), "Session removed");
            if self.sessions.is_empty() {
                self.drained.notify_waiters();
            }
        }
        removed
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSummary> {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.snapshot.clone())
    }

    /// Snapshots of all sessions that have completed their open handshake.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter_map(|entry| entry.snapshot.clone())
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_concurrent_sessions
    }

    /// Token cancelled when the whole registry shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Token cancelled when this session is asked to close (or on shutdown).
    pub fn close_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.sessions.get(session_id).map(|entry| entry.cancel.clone())
    }

    /// Why the session was asked to close; `Shutdown` when it was the root token.
    pub fn requested_close_reason(&self, session_id: &str) -> CloseReason {
        self.sessions
            .get(session_id)
            .and_then(|entry| entry.requested_close)
            .unwrap_or(CloseReason::Shutdown)
    }

    /// Ask one session to close. The owning connection performs the handshake.
    pub fn request_close(&self, session_id: &str, reason: CloseReason) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.requested_close.get_or_insert(reason);
                entry.cancel.cancel();
                info!(session_id = %session_id, reason = ?reason, "Close requested");
                true
            }
            None => false,
        }
    }

    /// Record how a connection ended and publish its summary.
    pub fn record_outcome(&self, summary: &SessionSummary) {
        match summary.state {
            SessionState::Closed => {
                self.closed_total.fetch_add(1, Ordering::Relaxed);
            }
            SessionState::Errored => {
                self.errored_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        if let Some(code) = summary.error_code {
            self.record_failure(code);
        }
        // No subscribers is fine
        let _ = self.summaries.send(summary.clone());
    }

    pub fn record_failure(&self, code: ErrorCode) {
        if let Some(idx) = ErrorCode::ALL.iter().position(|c| *c == code) {
            self.failures[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn failure_count(&self, code: ErrorCode) -> u64 {
        ErrorCode::ALL
            .iter()
            .position(|c| *c == code)
            .map(|idx| self.failures[idx].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Final summaries of every session that ends from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSummary> {
        self.summaries.subscribe()
    }

    pub fn stats(&self) -> RegistryStats {
        let mut status_counts = HashMap::new();
        for entry in self.sessions.iter() {
            let state = entry
                .snapshot
                .as_ref()
                .map(|s| s.state.as_str())
                .unwrap_or(SessionState::AwaitingOpen.as_str());
            *status_counts.entry(state.to_string()).or_insert(0) += 1;
        }

        RegistryStats {
            active_sessions: self.count(),
            max_sessions: self.max_concurrent_sessions,
            draining: self.is_draining(),
            opened_total: self.opened_total.load(Ordering::Relaxed),
            closed_total: self.closed_total.load(Ordering::Relaxed),
            errored_total: self.errored_total.load(Ordering::Relaxed),
            status_counts,
            failures: ErrorCode::ALL
                .iter()
                .map(|code| (*code, self.failure_count(*code)))
                .collect(),
        }
    }

    /// Stop admitting sessions, ask every live session to close, and wait until
    /// they are gone or `grace` elapses.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.draining.store(true, Ordering::SeqCst);
        info!(active = self.count(), grace_ms = grace.as_millis() as u64, "Draining sessions");
        self.root.cancel();

        let drained = tokio::time::timeout(grace, async {
            loop {
                let notified = self.drained.notified();
                if self.sessions.is_empty() {
                    break;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        let stragglers: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        if drained {
            info!("All sessions drained");
        } else {
            for id in &stragglers {
                let age = self
                    .sessions
                    .get(id)
                    .map(|e| (Utc::now() - e.reserved_at).num_milliseconds())
                    .unwrap_or(0);
                warn!(session_id = %id, age_ms = age, "Session still active after shutdown grace");
            }
        }

        ShutdownReport { drained, stragglers }
    }
}

impl SessionIds for SessionRegistry {
    fn reserve(&self, proposed: Option<&str>) -> Result<String, ProtocolError> {
        SessionRegistry::reserve(self, proposed)
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.count())
            .field("max_concurrent_sessions", &self.max_concurrent_sessions)
            .field("draining", &self.is_draining())
            .finish()
    }
}
