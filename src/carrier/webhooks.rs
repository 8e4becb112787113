//! Carrier webhook ingress (spec §4.3 step A, §4.4, §4.6).
//!
//! Axum handler wiring style lifted from the teacher's API layer: plain
//! `Form<T>` extractors over the carrier's flat key/value callback payloads,
//! one handler per callback URL.

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};

use crate::barrier::BarrierKind;
use crate::carrier::{mixer_name, twiml_hold_and_join_mixer};
use crate::lifecycle::{Outcome, TerminationSource};
use crate::server::AppState;
use crate::types::{IdentifierKind, Session};

#[derive(Debug, Deserialize)]
pub struct IncomingCallForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "From")]
    from: String,
    #[serde(rename = "To")]
    to: String,
    #[serde(rename = "CallToken")]
    call_token: Option<String>,
}

/// Step A: create the session, register identifiers, create the barriers the
/// rest of the flow depends on, and hand back hold-and-join TwiML immediately
/// — the SIP dial and accept handshake both run detached.
pub async fn incoming_call(State(state): State<AppState>, Form(form): Form<IncomingCallForm>) -> Response {
    let conference_name = mixer_name(&form.call_sid);

    let mut session = Session::new(conference_name.clone(), form.from.clone(), form.to.clone());
    session.carrier_leg_id = Some(form.call_sid.clone());
    session.call_token = form.call_token.clone();

    if let Err(e) = state.sessions.create(session).await {
        warn!("⚠️ failed to create session for incoming call {}: {}", form.call_sid, e);
        return (StatusCode::INTERNAL_SERVER_ERROR, "could not start session").into_response();
    }

    state.barriers.create(&conference_name, BarrierKind::SessionReady);
    state.barriers.create(&conference_name, BarrierKind::CallerReady);

    info!("📥 incoming call {} -> {}", form.call_sid, conference_name);

    let engine = state.accept_engine.clone();
    let cn = conference_name.clone();
    tokio::spawn(async move {
        engine.begin_attach(cn).await;
    });

    let events_url = format!("https://{}/conference-events", state.config.domain);
    let recording_url = format!("https://{}/recording-status", state.config.domain);
    let xml = twiml_hold_and_join_mixer(&conference_name, &events_url, &recording_url);

    (StatusCode::OK, [("Content-Type", "text/xml")], xml).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ConferenceEventForm {
    #[serde(rename = "StatusCallbackEvent")]
    event: String,
    #[serde(rename = "FriendlyName")]
    conference_name: String,
    #[serde(rename = "ConferenceSid")]
    conference_sid: Option<String>,
    #[serde(rename = "ParticipantLabel")]
    participant_label: Option<String>,
}

/// Participant join/leave and conference start/end (spec §4.4). Feeds the
/// Barrier Coordinator on join, the Lifecycle Coordinator on leave/end.
pub async fn conference_events(State(state): State<AppState>, Form(form): Form<ConferenceEventForm>) -> StatusCode {
    let conference_name = form.conference_name.clone();

    if let Some(sid) = &form.conference_sid {
        if let Err(e) = state.registry.merge_identifier(&conference_name, IdentifierKind::MixerId, sid.clone()) {
            warn!("⚠️ mixer id merge failed for {}: {}", conference_name, e);
        }
    }

    match form.event.as_str() {
        "participant-join" => match form.participant_label.as_deref() {
            Some("customer") => state.barriers.resolve(&conference_name, BarrierKind::CallerReady),
            Some("human") => {
                state.barriers.resolve(&conference_name, BarrierKind::HumanAnswered);
                if let Err(e) = state.db.mark_transferred_to_human(&conference_name).await {
                    warn!("⚠️ failed to mark transferred_to_human for {}: {}", conference_name, e);
                    state.diagnostics.incr_db_errors();
                }
            }
            _ => {}
        },
        "participant-leave" => {
            if form.participant_label.as_deref() == Some("customer") {
                state
                    .lifecycle
                    .signal_termination(&conference_name, TerminationSource::CarrierParticipantLeave, Outcome::Completed)
                    .await;
            }
        }
        "conference-end" => {
            state
                .lifecycle
                .signal_termination(&conference_name, TerminationSource::CarrierConferenceEnd, Outcome::Completed)
                .await;
        }
        other => {
            info!("ℹ️ ignoring conference event {} for {}", other, conference_name);
        }
    }

    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct RecordingStatusForm {
    #[serde(rename = "ConferenceSid")]
    conference_sid: String,
    #[serde(rename = "RecordingUrl")]
    recording_url: String,
    #[serde(rename = "RecordingStatus")]
    recording_status: String,
}

pub async fn recording_status(State(state): State<AppState>, Form(form): Form<RecordingStatusForm>) -> StatusCode {
    if form.recording_status != "completed" {
        return StatusCode::OK;
    }

    let Some(conference_name) = state.registry.resolve(IdentifierKind::MixerId, &form.conference_sid) else {
        state.diagnostics.incr_registry_lookup_miss();
        warn!("⚠️ recording status for unknown mixer {}", form.conference_sid);
        return StatusCode::OK;
    };

    if let Err(e) = sqlx::query("UPDATE call_logs SET recording_url = ? WHERE conference_name = ?")
        .bind(&form.recording_url)
        .bind(&conference_name)
        .execute(state.db.pool())
        .await
    {
        warn!("⚠️ failed to record recording url for {}: {}", conference_name, e);
        state.diagnostics.incr_db_errors();
    }

    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct StatusCallbackForm {
    #[serde(rename = "CallSid")]
    call_sid: String,
    #[serde(rename = "CallStatus")]
    call_status: String,
}

/// Terminal carrier status (spec §8: idempotent by CallSid). The lifecycle
/// coordinator's first-wins guard makes a duplicate delivery a no-op.
pub async fn status_callback(State(state): State<AppState>, Form(form): Form<StatusCallbackForm>) -> StatusCode {
    const TERMINAL: &[&str] = &["completed", "busy", "failed", "no-answer", "canceled"];
    if !TERMINAL.contains(&form.call_status.as_str()) {
        return StatusCode::OK;
    }

    let Some(conference_name) = state.registry.resolve(IdentifierKind::CarrierLegId, &form.call_sid) else {
        state.diagnostics.incr_registry_lookup_miss();
        warn!("⚠️ status callback for unknown carrier leg {}", form.call_sid);
        return StatusCode::OK;
    };

    let outcome = match form.call_status.as_str() {
        "completed" => Outcome::Completed,
        _ => Outcome::Failed,
    };

    state
        .lifecycle
        .signal_termination(&conference_name, TerminationSource::CarrierStatusCallback, outcome)
        .await;

    StatusCode::OK
}
