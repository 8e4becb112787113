//! Diagnostics (spec §7 "Observability requirements").
//!
//! Atomic counters plus a small bounded ring buffer of recent outcomes,
//! exposed over HTTP for operators. Grounded on the teacher's
//! `monitoring` module's counter style, trimmed down to the handful of
//! signals this orchestrator actually needs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::{Query, State};
use axum::response::Json;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::redact::{phi_redaction_enabled, redact_e164};
use crate::server::AppState;

const RECENT_FAILURES_CAPACITY: usize = 200;

#[derive(Debug, Clone, Serialize)]
pub struct RecentFailure {
    pub conference_name: String,
    pub reason: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
pub struct Diagnostics {
    accept_retries: AtomicU64,
    accept_failures: AtomicU64,
    db_errors: AtomicU64,
    timeouts: AtomicU64,
    orphan_count: AtomicU64,
    registry_lookup_miss: AtomicU64,
    recent_failures: Mutex<VecDeque<RecentFailure>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_accept_retries(&self) {
        self.accept_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_accept_failures(&self) {
        self.accept_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_db_errors(&self) {
        self.db_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_orphan_count(&self) {
        self.orphan_count.fetch_add(1, Ordering::Relaxed);
    }

    /// spec §9's resolved open question: a failed registry lookup during
    /// accept-exhaustion fallback is a counted, logged event, never a guess.
    pub fn incr_registry_lookup_miss(&self) {
        self.registry_lookup_miss.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, conference_name: impl Into<String>, reason: impl Into<String>) {
        let mut recent = self.recent_failures.lock();
        if recent.len() == RECENT_FAILURES_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(RecentFailure {
            conference_name: conference_name.into(),
            reason: reason.into(),
            at: chrono::Utc::now(),
        });
    }

    fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            accept_retries: self.accept_retries.load(Ordering::Relaxed),
            accept_failures: self.accept_failures.load(Ordering::Relaxed),
            db_errors: self.db_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            orphan_count: self.orphan_count.load(Ordering::Relaxed),
            registry_lookup_miss: self.registry_lookup_miss.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsSnapshot {
    accept_retries: u64,
    accept_failures: u64,
    db_errors: u64,
    timeouts: u64,
    orphan_count: u64,
    registry_lookup_miss: u64,
}

pub async fn get_diagnostics(State(state): State<AppState>) -> Json<DiagnosticsSnapshot> {
    Json(state.diagnostics.snapshot())
}

#[derive(Debug, Serialize)]
pub struct ActiveSessionView {
    conference_name: String,
    caller_e164: String,
    state: String,
    agent_slug: String,
}

pub async fn get_active(State(state): State<AppState>) -> Json<Vec<ActiveSessionView>> {
    let sessions = state.sessions.active_sessions();
    let redact = phi_redaction_enabled();
    Json(
        sessions
            .into_iter()
            .map(|s| ActiveSessionView {
                conference_name: s.conference_name,
                caller_e164: if redact { redact_e164(&s.caller_e164) } else { s.caller_e164 },
                state: s.state.as_str().to_string(),
                agent_slug: s.agent_slug,
            })
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
pub struct RecentFailuresQuery {
    limit: Option<usize>,
}

pub async fn get_recent_failures(
    State(state): State<AppState>,
    Query(q): Query<RecentFailuresQuery>,
) -> Json<Vec<RecentFailure>> {
    let limit = q.limit.unwrap_or(50).min(RECENT_FAILURES_CAPACITY);
    let recent = state.diagnostics.recent_failures.lock();
    Json(recent.iter().rev().take(limit).cloned().collect())
}

pub async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let d = Diagnostics::new();
        d.incr_accept_retries();
        d.incr_accept_retries();
        d.incr_registry_lookup_miss();
        let snap = d.snapshot();
        assert_eq!(snap.accept_retries, 2);
        assert_eq!(snap.registry_lookup_miss, 1);
        assert_eq!(snap.db_errors, 0);
    }

    #[test]
    fn recent_failures_ring_buffer_evicts_oldest() {
        let d = Diagnostics::new();
        for i in 0..(RECENT_FAILURES_CAPACITY + 10) {
            d.record_failure(format!("conf_{i}"), "test");
        }
        let recent = d.recent_failures.lock();
        assert_eq!(recent.len(), RECENT_FAILURES_CAPACITY);
        assert_eq!(recent.front().unwrap().conference_name, "conf_10");
    }
}
