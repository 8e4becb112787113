//! SIP watchdog (spec §4.3 step D).
//!
//! Independent of the accept handshake: started the moment the SIP dial
//! request is issued, cancelled the moment the realtime webhook arrives.
//! At 15/30/45s it only extends the wait; at 60s it triggers the
//! fallback-to-human TwiML; a 10-minute hard cap terminates an orphaned SIP
//! leg regardless. Modeled on the timer-driven cleanup style of the
//! teacher's lifecycle manager, generalized to per-call cancellable tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{info, warn};

const CHECKPOINTS: [Duration; 3] = [
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(45),
];
const FALLBACK_AT: Duration = Duration::from_secs(60);
const HARD_CAP: Duration = Duration::from_secs(600);

pub enum WatchdogOutcome {
    /// The realtime webhook arrived and cancelled the watchdog before any
    /// checkpoint fired.
    Cancelled,
    /// 60s elapsed with no session bound to the conference.
    FallbackTriggered,
    /// The 10-minute hard cap expired with the SIP leg still orphaned.
    HardCapExpired,
}

/// One watchdog per pending SIP attachment. `is_bound` is polled at each
/// checkpoint; it should return true once a session resolves the conference
/// name to a realtime call id.
pub struct SipWatchdog {
    cancel: Arc<Notify>,
}

impl SipWatchdog {
    pub fn new() -> Self {
        SipWatchdog {
            cancel: Arc::new(Notify::new()),
        }
    }

    pub fn canceller(&self) -> Arc<Notify> {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.notify_waiters();
    }

    /// Run the watchdog loop for `conference_name`. `is_bound` is called at
    /// each checkpoint to decide whether the SIP leg has been attached yet.
    pub async fn run<F>(&self, conference_name: &str, is_bound: F) -> WatchdogOutcome
    where
        F: Fn() -> bool,
    {
        let start = tokio::time::Instant::now();

        for checkpoint in CHECKPOINTS {
            if self.wait_or_cancel(checkpoint_delay(start, checkpoint)).await {
                info!("🛑 watchdog for {} cancelled", conference_name);
                return WatchdogOutcome::Cancelled;
            }
            if is_bound() {
                info!("✅ watchdog for {} sees session bound, cancelling", conference_name);
                return WatchdogOutcome::Cancelled;
            }
            // Not bound yet: extend the wait. Never retry or tear down here.
        }

        if self.wait_or_cancel(checkpoint_delay(start, FALLBACK_AT)).await {
            return WatchdogOutcome::Cancelled;
        }
        if is_bound() {
            return WatchdogOutcome::Cancelled;
        }

        warn!(
            "⚠️ watchdog for {} still unbound at 60s, triggering human fallback",
            conference_name
        );

        if self.wait_or_cancel(checkpoint_delay(start, HARD_CAP)).await {
            return WatchdogOutcome::FallbackTriggered;
        }

        warn!("🔥 watchdog for {} hit the 10-minute hard cap, terminating orphaned SIP leg", conference_name);
        WatchdogOutcome::HardCapExpired
    }

    /// Waits until `deadline_from_start` elapses or the watchdog is
    /// cancelled. Returns true if cancelled.
    async fn wait_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => false,
            _ = self.cancel.notified() => true,
        }
    }
}

impl Default for SipWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

fn checkpoint_delay(start: tokio::time::Instant, checkpoint: Duration) -> Duration {
    checkpoint.saturating_sub(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_watchdog_immediately() {
        let wd = Arc::new(SipWatchdog::new());
        let handle = {
            let wd = wd.clone();
            tokio::spawn(async move { wd.run("conf_X", || false).await })
        };

        tokio::time::sleep(Duration::from_millis(1)).await;
        wd.cancel();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, WatchdogOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoints_never_tear_down_only_fallback_fires_at_60s() {
        let wd = SipWatchdog::new();
        let checkpoints_seen = Arc::new(AtomicBool::new(false));
        let seen = checkpoints_seen.clone();

        let outcome = wd
            .run("conf_Y", move || {
                seen.store(true, Ordering::SeqCst);
                false
            })
            .await;

        assert!(checkpoints_seen.load(Ordering::SeqCst));
        assert!(matches!(outcome, WatchdogOutcome::FallbackTriggered));
    }

    #[tokio::test(start_paused = true)]
    async fn bound_session_cancels_before_fallback() {
        let wd = SipWatchdog::new();
        let outcome = wd.run("conf_Z", || true).await;
        assert!(matches!(outcome, WatchdogOutcome::Cancelled));
    }
}
