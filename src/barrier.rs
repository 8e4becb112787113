//! Barrier Coordinator (spec §4.4).
//!
//! Each barrier is a one-shot event with a fallback timeout, built on
//! `tokio::sync::Notify` rather than a single-use channel so a resolver that
//! arrives after a timeout has already elapsed is harmless (it just notifies
//! nobody). Barriers must be created before the action that could resolve
//! them; a resolve() call against a barrier that was never created is logged
//! and dropped, matching spec's "bug, not crash" framing.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierKind {
    SessionReady,
    CallerReady,
    HumanAnswered,
}

impl BarrierKind {
    fn fallback(&self) -> Duration {
        match self {
            BarrierKind::SessionReady => Duration::from_secs(3),
            BarrierKind::CallerReady => Duration::from_secs(8),
            BarrierKind::HumanAnswered => Duration::from_secs(45),
        }
    }
}

struct OneShot {
    notify: Arc<Notify>,
    resolved: std::sync::atomic::AtomicBool,
}

impl OneShot {
    fn new() -> Self {
        OneShot {
            notify: Arc::new(Notify::new()),
            resolved: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

/// One barrier table per conference name; a call's three barriers are
/// created together when the call's accept/attach flow begins.
#[derive(Default)]
pub struct BarrierCoordinator {
    barriers: DashMap<(String, BarrierKindKey), Arc<OneShot>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BarrierKindKey {
    SessionReady,
    CallerReady,
    HumanAnswered,
}

impl From<BarrierKind> for BarrierKindKey {
    fn from(k: BarrierKind) -> Self {
        match k {
            BarrierKind::SessionReady => BarrierKindKey::SessionReady,
            BarrierKind::CallerReady => BarrierKindKey::CallerReady,
            BarrierKind::HumanAnswered => BarrierKindKey::HumanAnswered,
        }
    }
}

pub enum BarrierOutcome {
    Resolved,
    TimedOut,
}

impl BarrierCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a barrier. MUST be called before the action that could resolve
    /// it (spec §4.4).
    pub fn create(&self, conference_name: &str, kind: BarrierKind) {
        self.barriers
            .insert((conference_name.to_string(), kind.into()), Arc::new(OneShot::new()));
    }

    /// Resolve a barrier. A resolve against a barrier that doesn't exist is a
    /// logged no-op, not a panic — the upstream event source may have raced
    /// barrier creation.
    pub fn resolve(&self, conference_name: &str, kind: BarrierKind) {
        match self.barriers.get(&(conference_name.to_string(), kind.into())) {
            Some(entry) => {
                entry.resolved.store(true, std::sync::atomic::Ordering::SeqCst);
                entry.notify.notify_waiters();
            }
            None => {
                warn!(
                    "🚫 resolve() for {:?} on {} arrived before the barrier was created; dropping",
                    kind, conference_name
                );
            }
        }
    }

    /// Wait for the barrier to resolve or its fallback timeout to elapse.
    pub async fn wait(&self, conference_name: &str, kind: BarrierKind) -> BarrierOutcome {
        let entry = match self.barriers.get(&(conference_name.to_string(), kind.into())) {
            Some(e) => e.clone(),
            None => {
                warn!("🚫 wait() for {:?} on {} has no barrier; treating as timed out", kind, conference_name);
                return BarrierOutcome::TimedOut;
            }
        };

        if entry.resolved.load(std::sync::atomic::Ordering::SeqCst) {
            return BarrierOutcome::Resolved;
        }

        let notified = entry.notify.notified();
        match timeout(kind.fallback(), notified).await {
            Ok(_) => BarrierOutcome::Resolved,
            Err(_) => {
                warn!("⏱️ barrier {:?} on {} timed out, proceeding", kind, conference_name);
                BarrierOutcome::TimedOut
            }
        }
    }

    pub fn drop_session(&self, conference_name: &str) {
        self.barriers.retain(|(name, _), _| name != conference_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_before_wait_returns_immediately() {
        let coord = BarrierCoordinator::new();
        coord.create("conf_A", BarrierKind::SessionReady);
        coord.resolve("conf_A", BarrierKind::SessionReady);

        let outcome = coord.wait("conf_A", BarrierKind::SessionReady).await;
        assert!(matches!(outcome, BarrierOutcome::Resolved));
    }

    #[tokio::test]
    async fn resolve_after_wait_starts_wakes_waiter() {
        let coord = Arc::new(BarrierCoordinator::new());
        coord.create("conf_B", BarrierKind::CallerReady);

        let waiter = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.wait("conf_B", BarrierKind::CallerReady).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        coord.resolve("conf_B", BarrierKind::CallerReady);

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, BarrierOutcome::Resolved));
    }

    #[tokio::test(start_paused = true)]
    async fn session_ready_falls_back_at_three_seconds() {
        let coord = BarrierCoordinator::new();
        coord.create("conf_C", BarrierKind::SessionReady);

        let start = tokio::time::Instant::now();
        let outcome = coord.wait("conf_C", BarrierKind::SessionReady).await;
        assert!(matches!(outcome, BarrierOutcome::TimedOut));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn resolve_without_create_is_a_dropped_no_op() {
        let coord = BarrierCoordinator::new();
        // Should not panic.
        coord.resolve("conf_ghost", BarrierKind::HumanAnswered);
    }
}
