//! Accept/Attach Engine (spec §4.3 steps A-D).
//!
//! Step A (incoming-call webhook, session/barrier creation, hold TwiML) lives
//! in `carrier::webhooks`. This module owns steps B through D: the SIP dial,
//! the watchdog that guards it, the accept handshake once the realtime
//! webhook reports the call, and the websocket event loop that resolves the
//! session-ready barrier and streams transcript fragments into the call log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::barrier::{BarrierCoordinator, BarrierKind};
use crate::carrier::{CarrierClient, DialSipParticipant};
use crate::config::Config;
use crate::database::DatabaseManager;
use crate::diagnostics::Diagnostics;
use crate::lifecycle::{LifecycleCoordinator, Outcome, TerminationSource};
use crate::realtime::events::{self, RealtimeEvent};
use crate::realtime::{AgentAudioConfig, RealtimeClient};
use crate::registry::IdentifierRegistry;
use crate::session_store::SessionStore;
use crate::types::{CallLog, IdentifierKind, Session, SessionState};
use crate::watchdog::{SipWatchdog, WatchdogOutcome};

struct PendingAttach {
    watchdog: Arc<SipWatchdog>,
    bound: Arc<AtomicBool>,
}

pub struct AcceptEngine {
    sessions: Arc<SessionStore>,
    registry: Arc<IdentifierRegistry>,
    barriers: Arc<BarrierCoordinator>,
    carrier: Arc<CarrierClient>,
    realtime: Arc<RealtimeClient>,
    diagnostics: Arc<Diagnostics>,
    lifecycle: Arc<LifecycleCoordinator>,
    db: DatabaseManager,
    config: Arc<Config>,
    pending: DashMap<String, PendingAttach>,
}

impl AcceptEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionStore>,
        registry: Arc<IdentifierRegistry>,
        barriers: Arc<BarrierCoordinator>,
        carrier: Arc<CarrierClient>,
        realtime: Arc<RealtimeClient>,
        diagnostics: Arc<Diagnostics>,
        lifecycle: Arc<LifecycleCoordinator>,
        db: DatabaseManager,
        config: Arc<Config>,
    ) -> Self {
        AcceptEngine {
            sessions,
            registry,
            barriers,
            carrier,
            realtime,
            diagnostics,
            lifecycle,
            db,
            config,
            pending: DashMap::new(),
        }
    }

    /// Step B: dial the caller's SIP leg into the mixer, then start the
    /// watchdog. Runs detached from the webhook handler that creates the
    /// session, so the carrier gets its hold TwiML response immediately.
    pub async fn begin_attach(self: Arc<Self>, conference_name: String) {
        let session = match self.sessions.read(&conference_name).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                error!("⚠️ begin_attach called for unknown session {}", conference_name);
                return;
            }
            Err(e) => {
                error!("⚠️ failed to read session {}: {}", conference_name, e);
                return;
            }
        };

        let watchdog = Arc::new(SipWatchdog::new());
        let bound = Arc::new(AtomicBool::new(false));
        self.pending.insert(
            conference_name.clone(),
            PendingAttach {
                watchdog: watchdog.clone(),
                bound: bound.clone(),
            },
        );

        let status_callback = format!("https://{}/conference-events", self.config.domain);
        let dial = DialSipParticipant {
            label: "customer",
            from: &session.caller_e164,
            to: &session.dialed_e164,
            early_media: true,
            call_token: session.call_token.as_deref(),
            status_callback: &status_callback,
        };

        if let Err(e) = self.carrier.dial_sip_participant(&conference_name, &dial).await {
            error!("⚠️ SIP dial failed for {}: {}", conference_name, e);
            self.diagnostics.incr_accept_failures();
            self.diagnostics.record_failure(&conference_name, format!("sip dial failed: {e}"));
            self.pending.remove(&conference_name);
            self.lifecycle
                .signal_termination(&conference_name, TerminationSource::CarrierStatusCallback, Outcome::Failed)
                .await;
            return;
        }

        let bound_check = bound.clone();
        let outcome = watchdog.run(&conference_name, move || bound_check.load(Ordering::SeqCst)).await;
        self.pending.remove(&conference_name);

        match outcome {
            WatchdogOutcome::Cancelled => {}
            WatchdogOutcome::FallbackTriggered => {
                warn!("⚠️ {} unbound at 60s, falling back to human", conference_name);
                self.handle_accept_exhaustion(&conference_name, &session).await;
            }
            WatchdogOutcome::HardCapExpired => {
                self.diagnostics.incr_orphan_count();
                self.lifecycle
                    .signal_termination(&conference_name, TerminationSource::WatchdogTimeout, Outcome::Timeout)
                    .await;
            }
        }
    }

    fn cancel_watchdog(&self, conference_name: &str) {
        if let Some((_, attach)) = self.pending.remove(conference_name) {
            attach.bound.store(true, Ordering::SeqCst);
            attach.watchdog.cancel();
        }
    }

    /// Step C: the realtime webhook told us the call arrived. Resolve the
    /// session, cancel the watchdog, merge the identifier, accept, then wire
    /// up the websocket event loop.
    pub async fn on_realtime_incoming(self: &Arc<Self>, conference_name: &str, realtime_call_id: &str) {
        let Ok(Some(session)) = self.sessions.read(conference_name).await else {
            self.diagnostics.incr_registry_lookup_miss();
            error!("⚠️ realtime incoming call for unknown conference {}", conference_name);
            return;
        };

        if session.state.is_terminal() {
            warn!("⚠️ realtime incoming call for already-terminal session {}", conference_name);
            return;
        }

        self.cancel_watchdog(conference_name);

        // Cache + registry update only; the durable write happens on a
        // background task inside `upsert` and is never awaited here.
        let session = match self
            .sessions
            .upsert(conference_name, |s| s.realtime_call_id = Some(realtime_call_id.to_string()))
            .await
        {
            Ok(s) => s,
            Err(e) => {
                error!("⚠️ failed to merge realtime call id onto {}: {}", conference_name, e);
                return;
            }
        };

        let instructions = format!(
            "You are the after-hours phone assistant for {}. Be concise, warm, and offer to transfer to a human for anything urgent.",
            self.config.domain
        );
        let audio = AgentAudioConfig::pcm_mulaw(&instructions, "alloy");

        if let Err(e) = self.realtime.accept(realtime_call_id, &audio).await {
            warn!("⚠️ accept exhausted for {}: {}", conference_name, e);
            self.diagnostics.incr_accept_failures();
            self.diagnostics.record_failure(conference_name, format!("accept exhausted: {e}"));
            self.handle_accept_exhaustion(conference_name, &session).await;
            return;
        }

        self.barriers.create(conference_name, BarrierKind::HumanAnswered);

        let ws_tx = match self.run_event_loop(conference_name, realtime_call_id).await {
            Ok(tx) => tx,
            Err(e) => {
                error!("⚠️ websocket event loop failed for {}: {}", conference_name, e);
                self.lifecycle
                    .signal_termination(conference_name, TerminationSource::RealtimeDisconnected, Outcome::Failed)
                    .await;
                return;
            }
        };

        // Steps 7-9: wait for session.updated and the caller to join the
        // mixer before letting the agent speak, so the greeting never lands
        // on an unconfigured session or an empty room.
        self.barriers.wait(conference_name, BarrierKind::SessionReady).await;
        self.barriers.wait(conference_name, BarrierKind::CallerReady).await;

        let greeting = serde_json::json!({
            "type": "response.create",
            "response": { "instructions": instructions },
        })
        .to_string();
        if ws_tx.send(Message::Text(greeting)).is_err() {
            error!("⚠️ failed to send greeting for {}: websocket writer gone", conference_name);
        }

        if session.call_log_id.is_none() {
            let log = CallLog::new(conference_name, &session.agent_slug);
            if let Err(e) = self.db.insert_call_log(&log).await {
                error!("⚠️ failed to backfill call log for {}: {}", conference_name, e);
            } else if let Err(e) = self
                .sessions
                .upsert(conference_name, |s| s.call_log_id = Some(log.id.clone()))
                .await
            {
                error!("⚠️ failed to attach call log id onto {}: {}", conference_name, e);
            }
        }
    }

    /// Opens the websocket, wires the reader and a write-side forwarding
    /// task, and returns a sender the caller uses to push frames (the
    /// greeting, and later turns) once the barriers it waits on resolve.
    async fn run_event_loop(
        &self,
        conference_name: &str,
        realtime_call_id: &str,
    ) -> crate::error::Result<mpsc::UnboundedSender<Message>> {
        let url = self.realtime.websocket_url(realtime_call_id);
        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut write, read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(events::run_reader(read, tx));

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let conference_name_owned = conference_name.to_string();
        let db = self.db.clone();
        let barriers = self.barriers.clone();
        let lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    RealtimeEvent::SessionUpdated => barriers.resolve(&conference_name_owned, BarrierKind::SessionReady),
                    RealtimeEvent::TranscriptionCompleted { transcript } | RealtimeEvent::OutputAudioTranscriptDone { transcript } => {
                        if !transcript.is_empty() {
                            if let Err(e) = db.append_transcript(&conference_name_owned, &transcript).await {
                                error!("⚠️ failed to append transcript for {}: {}", conference_name_owned, e);
                            }
                        }
                    }
                    RealtimeEvent::Error { code, message } => {
                        if events::is_non_fatal(&code) {
                            info!("ℹ️ non-fatal realtime error on {}: {} ({})", conference_name_owned, message, code);
                        } else {
                            warn!("⚠️ fatal realtime error on {}: {} ({})", conference_name_owned, message, code);
                            lifecycle
                                .signal_termination(&conference_name_owned, TerminationSource::RealtimeDisconnected, Outcome::Failed)
                                .await;
                            break;
                        }
                    }
                    RealtimeEvent::ResponseDone | RealtimeEvent::SessionCreated | RealtimeEvent::Other => {}
                }
            }
        });

        Ok(out_tx)
    }

    /// §9's resolved open question: when the fallback path can't resolve a
    /// carrier leg id, it logs, counts, and fails outright rather than
    /// guessing a number.
    async fn handle_accept_exhaustion(&self, conference_name: &str, session: &Session) {
        match &session.carrier_leg_id {
            Some(leg_id) => {
                if let Err(e) = self.carrier.update_leg_with_fallback(leg_id, &self.config.human_agent_e164).await {
                    error!("⚠️ human fallback update failed for {}: {}", conference_name, e);
                }
                let _ = self.sessions.upsert(conference_name, |s| s.human_transfer_initiated = true).await;
                if let Err(e) = self.db.mark_transferred_to_human(conference_name).await {
                    error!("⚠️ failed to mark transferred_to_human for {}: {}", conference_name, e);
                }
                self.lifecycle
                    .signal_termination(conference_name, TerminationSource::CarrierStatusCallback, Outcome::Transferred)
                    .await;
            }
            None => {
                self.diagnostics.incr_registry_lookup_miss();
                error!(
                    "⚠️ no carrier leg id on {}, cannot fall back to a human; failing the session",
                    conference_name
                );
                let _ = self
                    .sessions
                    .upsert(conference_name, |s| {
                        s.set_state(SessionState::Failed);
                    })
                    .await;
                self.lifecycle
                    .signal_termination(conference_name, TerminationSource::CarrierStatusCallback, Outcome::Failed)
                    .await;
            }
        }
    }

    pub fn resolve_conference_by_realtime_call_id(&self, realtime_call_id: &str) -> Option<String> {
        self.registry.resolve(IdentifierKind::RealtimeCallId, realtime_call_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CarrierConfig, RealtimeConfig};

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            domain: "after-hours.example.com".into(),
            environment: crate::config::Environment::Development,
            bind_addr: "0.0.0.0:8080".into(),
            database_url: "sqlite::memory:".into(),
            carrier: CarrierConfig {
                account_sid: "AC".into(),
                auth_token: "tok".into(),
                base_url: "http://127.0.0.1:1".into(),
            },
            realtime: RealtimeConfig {
                api_key: "key".into(),
                project_id: "proj".into(),
                webhook_secret: "whsec_x".into(),
                base_url: "http://127.0.0.1:1".into(),
            },
            human_agent_e164: "+19095550000".into(),
            phi_redaction: true,
            realtime_unit_rate_cents_per_min: 19.0,
        })
    }

    async fn engine() -> Arc<AcceptEngine> {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let registry = Arc::new(IdentifierRegistry::new());
        let sessions = Arc::new(SessionStore::new(db.clone(), registry.clone()));
        let barriers = Arc::new(BarrierCoordinator::new());
        let carrier = Arc::new(CarrierClient::new(test_config().carrier.clone()));
        let realtime = Arc::new(RealtimeClient::new(test_config().realtime.clone()));
        let diagnostics = Arc::new(Diagnostics::new());
        let lifecycle = Arc::new(LifecycleCoordinator::new(db.clone(), carrier.clone(), diagnostics.clone(), 19.0));
        Arc::new(AcceptEngine::new(
            sessions,
            registry,
            barriers,
            carrier,
            realtime,
            diagnostics,
            lifecycle,
            db,
            test_config(),
        ))
    }

    #[tokio::test]
    async fn on_realtime_incoming_for_unknown_session_counts_a_registry_miss() {
        let engine = engine().await;
        engine.on_realtime_incoming("conf_ghost", "rtc_1").await;
        // No panic, no session created; diagnostics counted the miss.
        assert!(engine.sessions.read("conf_ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn accept_exhaustion_without_carrier_leg_id_fails_the_session_not_a_guess() {
        let engine = engine().await;
        let session = Session::new("conf_noleg", "+1", "+2");
        engine.sessions.create(session.clone()).await.unwrap();

        engine.handle_accept_exhaustion("conf_noleg", &session).await;

        let reloaded = engine.sessions.read("conf_noleg").await.unwrap().unwrap();
        assert_eq!(reloaded.state, SessionState::Failed);
    }
}
