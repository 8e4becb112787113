//! Lifecycle Coordinator (spec §4.5).
//!
//! Aggregates termination signals from the carrier, the realtime transport,
//! and the watchdog. Exactly-once semantics come from a per-conference
//! transition guard directly modeled on the teacher's `CallLifecycleManager`
//! and its `is_valid_transition` whitelist — the closest one-to-one mapping
//! in the whole corpus for this component.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::carrier::CarrierClient;
use crate::database::DatabaseManager;
use crate::diagnostics::Diagnostics;
use crate::types::{CallStatus, Disposition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSource {
    CarrierParticipantLeave,
    CarrierConferenceEnd,
    CarrierStatusCallback,
    RealtimeDisconnected,
    WatchdogTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Transferred,
    Failed,
    Timeout,
}

impl Outcome {
    fn disposition(&self) -> Disposition {
        match self {
            Outcome::Completed => Disposition::Completed,
            Outcome::Transferred => Disposition::Transferred,
            Outcome::Failed => Disposition::Failed,
            Outcome::Timeout => Disposition::Completed,
        }
    }
}

/// Guards the single `call-ended` event per CallLog. The first source to
/// arrive wins the terminal transition; every subsequent source may still
/// update auxiliary fields (duration, cost) but not re-fire the event.
pub struct LifecycleCoordinator {
    ended: Mutex<HashSet<String>>,
    db: DatabaseManager,
    carrier: Arc<CarrierClient>,
    diagnostics: Arc<Diagnostics>,
    unit_rate_cents_per_min: f64,
}

impl LifecycleCoordinator {
    pub fn new(db: DatabaseManager, carrier: Arc<CarrierClient>, diagnostics: Arc<Diagnostics>, unit_rate_cents_per_min: f64) -> Self {
        LifecycleCoordinator {
            ended: Mutex::new(HashSet::new()),
            db,
            carrier,
            diagnostics,
            unit_rate_cents_per_min,
        }
    }

    /// Returns true exactly once per conference name: the first caller wins.
    fn claim_termination(&self, conference_name: &str) -> bool {
        self.ended.lock().insert(conference_name.to_string())
    }

    /// Entry point for every termination signal. Spawns the post-call
    /// pipeline on the winning call only; later sources return having done
    /// nothing but logging, matching spec §4.5's "auxiliary fields only".
    pub async fn signal_termination(
        self: &Arc<Self>,
        conference_name: &str,
        source: TerminationSource,
        outcome: Outcome,
    ) {
        if !self.claim_termination(conference_name) {
            info!(
                "ℹ️ termination signal {:?} for {} arrived after call-ended already fired; ignoring",
                source, conference_name
            );
            return;
        }

        info!("📴 call-ended for {} (source={:?}, outcome={:?})", conference_name, source, outcome);

        let status = match outcome {
            Outcome::Failed => CallStatus::Failed,
            _ => CallStatus::Completed,
        };

        if let Err(e) = self
            .db
            .finalize_call_log(conference_name, status, outcome.disposition(), Utc::now())
            .await
        {
            error!("⚠️ failed to finalize call log for {}: {}", conference_name, e);
        }

        let this = self.clone();
        let conference_name = conference_name.to_string();
        tokio::spawn(async move {
            this.run_post_call_pipeline(&conference_name).await;
        });
    }

    /// Post-call pipeline, spec §4.5 steps 1-5. Each step is isolated: a
    /// grading failure must not block ticket push.
    async fn run_post_call_pipeline(&self, conference_name: &str) {
        self.carrier_reconcile(conference_name).await;
        self.recompute_cost(conference_name).await;
        self.finalize_transcript(conference_name).await;
        self.grade(conference_name).await;
        self.push_ticket(conference_name).await;
    }

    async fn carrier_reconcile(&self, conference_name: &str) {
        tokio::time::sleep(Duration::from_secs(3)).await;

        let Ok(Some(log)) = self.db.get_call_log_by_conference(conference_name).await else {
            return;
        };
        let Some(carrier_leg_id) = log.carrier_leg_id.clone() else {
            warn!("⚠️ no carrier leg id recorded for {}, skipping reconcile", conference_name);
            return;
        };

        for delay in [Duration::from_secs(0), Duration::from_secs(15), Duration::from_secs(45), Duration::from_secs(120)] {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
            match self.carrier.reconcile(&carrier_leg_id).await {
                Ok(rec) if rec.data_ready => {
                    if let Err(e) = self
                        .db
                        .apply_carrier_reconciliation(conference_name, rec.duration_seconds, rec.cost_cents)
                        .await
                    {
                        error!("⚠️ failed writing carrier reconciliation for {}: {}", conference_name, e);
                    }
                    return;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("⚠️ carrier reconcile error for {}: {}", conference_name, e);
                    self.diagnostics.incr_db_errors();
                }
            }
        }
        warn!("⚠️ carrier never finalized duration for {}", conference_name);
    }

    /// Agent-side cost: duration * unit rate. Never writes the authoritative
    /// `duration` field (spec §4.6 — only the carrier reconciler may).
    async fn recompute_cost(&self, conference_name: &str) {
        let Ok(Some(log)) = self.db.get_call_log_by_conference(conference_name).await else {
            return;
        };
        let Some(duration) = log.duration_seconds else {
            return;
        };
        let minutes = duration as f64 / 60.0;
        let realtime_cost_cents = (minutes * self.unit_rate_cents_per_min).round() as i64;
        let total = realtime_cost_cents + log.carrier_cost_cents.unwrap_or(0);
        if let Err(e) = sqlx::query("UPDATE call_logs SET realtime_cost_cents = ?, total_cost_cents = ? WHERE conference_name = ?")
            .bind(realtime_cost_cents)
            .bind(total)
            .bind(conference_name)
            .execute(self.db.pool())
            .await
        {
            error!("⚠️ failed to write recomputed cost for {}: {}", conference_name, e);
        }
    }

    /// Poll the transcript for up to 15s, taking the longest non-empty
    /// string seen (spec §4.5 step 3) — the realtime service can keep
    /// streaming transcription-completed events after audio stops.
    async fn finalize_transcript(&self, conference_name: &str) {
        let mut longest = String::new();
        for _ in 0..8 {
            if let Ok(Some(log)) = self.db.get_call_log_by_conference(conference_name).await {
                if log.transcript.len() > longest.len() {
                    longest = log.transcript;
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        info!("📝 transcript finalized for {} ({} chars)", conference_name, longest.len());
    }

    async fn grade(&self, conference_name: &str) {
        let Ok(Some(log)) = self.db.get_call_log_by_conference(conference_name).await else {
            return;
        };
        if log.transcript.len() <= 50 {
            return;
        }
        // External grading service call is out of scope; a length-derived
        // placeholder score keeps the pipeline step exercised end-to-end.
        let quality_score = (log.transcript.len() as f64 / 500.0).min(1.0);
        if let Err(e) = self
            .db
            .set_grade(conference_name, quality_score, "neutral", "resolved")
            .await
        {
            error!("⚠️ failed to write grade for {}: {}", conference_name, e);
        }
    }

    /// Gated on `ticket_number != null AND transcript.length > 50 AND
    /// agent_slug is ticket-creating` (spec §4.6). Runs independently of
    /// grading so a grading failure never blocks it.
    async fn push_ticket(&self, conference_name: &str) {
        let Ok(Some(log)) = self.db.get_call_log_by_conference(conference_name).await else {
            return;
        };
        let Some(ticket_number) = &log.ticket_number else {
            return;
        };
        if log.transcript.len() <= 50 || !crate::types::is_ticket_creating_agent(&log.agent_slug) {
            return;
        }
        info!("🎫 pushing call bundle to ticket {}", ticket_number);
        // External ticketing HTTP client is an out-of-scope collaborator
        // per spec §1; this records intent to push without fabricating a
        // downstream API surface.
    }

    /// Stale-call sweep (spec §4.5): synthesize `call-ended` with
    /// `outcome=timeout` for sessions that have no terminal signal after the
    /// hard wall-clock cap.
    pub async fn sweep_stale(self: &Arc<Self>, conference_names: &[String]) {
        for name in conference_names {
            self.signal_termination(name, TerminationSource::WatchdogTimeout, Outcome::Timeout).await;
        }
    }

    pub fn has_ended(&self, conference_name: &str) -> bool {
        self.ended.lock().contains(conference_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CallLog;

    async fn setup() -> (Arc<LifecycleCoordinator>, DatabaseManager) {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let carrier = Arc::new(CarrierClient::new(crate::config::CarrierConfig {
            account_sid: "AC".into(),
            auth_token: "tok".into(),
            base_url: "http://127.0.0.1:1".into(),
        }));
        let diagnostics = Arc::new(Diagnostics::new());
        let coord = Arc::new(LifecycleCoordinator::new(db.clone(), carrier, diagnostics, 19.0));
        (coord, db)
    }

    #[tokio::test]
    async fn second_termination_source_is_ignored() {
        let (coord, db) = setup().await;
        let log = CallLog::new("conf_once", "no-ivr");
        db.insert_call_log(&log).await.unwrap();

        assert!(coord.claim_termination("conf_once"));
        assert!(!coord.claim_termination("conf_once"));
    }

    #[tokio::test]
    async fn transferred_flag_is_not_part_of_finalize_and_stays_latched() {
        let (_coord, db) = setup().await;
        let log = CallLog::new("conf_transfer", "no-ivr");
        db.insert_call_log(&log).await.unwrap();
        db.mark_transferred_to_human("conf_transfer").await.unwrap();

        db.finalize_call_log("conf_transfer", CallStatus::Completed, Disposition::Completed, Utc::now())
            .await
            .unwrap();

        let reloaded = db.get_call_log_by_conference("conf_transfer").await.unwrap().unwrap();
        assert!(reloaded.transferred_to_human);
    }
}
