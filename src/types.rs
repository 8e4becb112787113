//! Data model: `Session`, `CallLog`, and the identifier/state enums that tie
//! the orchestration components together.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The four identifier keyspaces the registry indexes on, plus the external
/// ticket number carried on the session but not indexed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifierKind {
    ConferenceName,
    CarrierLegId,
    MixerId,
    RealtimeCallId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Connected,
    Transferring,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initializing => "initializing",
            SessionState::Connected => "connected",
            SessionState::Transferring => "transferring",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "initializing" => SessionState::Initializing,
            "connected" => SessionState::Connected,
            "transferring" => SessionState::Transferring,
            "completed" => SessionState::Completed,
            "failed" => SessionState::Failed,
            _ => return None,
        })
    }
}

/// Per-call durable record. Mirrors spec.md §3 `Session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub conference_name: String,
    pub carrier_leg_id: Option<String>,
    pub realtime_call_id: Option<String>,
    pub mixer_id: Option<String>,
    pub call_log_id: Option<String>,
    pub caller_e164: String,
    pub dialed_e164: String,
    pub call_token: Option<String>,
    pub agent_slug: String,
    pub state: SessionState,
    pub realtime_session_established: bool,
    pub human_transfer_initiated: bool,
    pub transferred_to_human: bool,
    pub last_error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(conference_name: impl Into<String>, caller_e164: impl Into<String>, dialed_e164: impl Into<String>) -> Self {
        let now = Utc::now();
        Session {
            conference_name: conference_name.into(),
            carrier_leg_id: None,
            realtime_call_id: None,
            mixer_id: None,
            call_log_id: None,
            caller_e164: caller_e164.into(),
            dialed_e164: dialed_e164.into(),
            call_token: None,
            agent_slug: "no-ivr".to_string(),
            state: SessionState::Initializing,
            realtime_session_established: false,
            human_transfer_initiated: false,
            transferred_to_human: false,
            last_error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::minutes(30),
        }
    }

    /// Extend `expires_at` to now + 30 min, per §4.2 TTL rule.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.expires_at = self.updated_at + Duration::minutes(30);
    }

    /// Once a terminal state is set, it cannot be overwritten by a
    /// different terminal state (invariant in spec.md §3).
    pub fn set_state(&mut self, state: SessionState) -> bool {
        if self.state.is_terminal() && self.state != state {
            return false;
        }
        self.state = state;
        self.touch();
        true
    }

    pub fn identifiers(&self) -> Vec<(IdentifierKind, String)> {
        let mut out = vec![(IdentifierKind::ConferenceName, self.conference_name.clone())];
        if let Some(v) = &self.carrier_leg_id {
            out.push((IdentifierKind::CarrierLegId, v.clone()));
        }
        if let Some(v) = &self.mixer_id {
            out.push((IdentifierKind::MixerId, v.clone()));
        }
        if let Some(v) = &self.realtime_call_id {
            out.push((IdentifierKind::RealtimeCallId, v.clone()));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Completed,
    Voicemail,
    Busy,
    NoAnswer,
    Failed,
    Transferred,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Completed => "completed",
            Disposition::Voicemail => "voicemail",
            Disposition::Busy => "busy",
            Disposition::NoAnswer => "no_answer",
            Disposition::Failed => "failed",
            Disposition::Transferred => "transferred",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "completed" => Disposition::Completed,
            "voicemail" => Disposition::Voicemail,
            "busy" => Disposition::Busy,
            "no_answer" => Disposition::NoAnswer,
            "failed" => Disposition::Failed,
            "transferred" => Disposition::Transferred,
            _ => return None,
        })
    }
}

/// The canonical, append-only call record. Mirrors spec.md §3 `CallLog`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLog {
    pub id: String,
    pub conference_name: String,
    pub carrier_leg_id: Option<String>,
    pub realtime_call_id: Option<String>,
    pub direction: CallDirection,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub status: CallStatus,
    pub disposition: Option<Disposition>,
    pub answered_by: Option<String>,
    pub transcript: String,
    pub recording_url: Option<String>,
    pub transferred_to_human: bool,
    pub carrier_cost_cents: Option<i64>,
    pub realtime_cost_cents: Option<i64>,
    pub total_cost_cents: Option<i64>,
    pub cost_is_estimated: bool,
    pub quality_score: Option<f64>,
    pub patient_sentiment: Option<String>,
    pub agent_outcome: Option<String>,
    pub ticket_number: Option<String>,
    pub agent_slug: String,
}

impl CallLog {
    pub fn new(conference_name: impl Into<String>, agent_slug: impl Into<String>) -> Self {
        CallLog {
            id: uuid::Uuid::new_v4().to_string(),
            conference_name: conference_name.into(),
            carrier_leg_id: None,
            realtime_call_id: None,
            direction: CallDirection::Inbound,
            start_time: Utc::now(),
            end_time: None,
            duration_seconds: None,
            status: CallStatus::InProgress,
            disposition: None,
            answered_by: None,
            transcript: String::new(),
            recording_url: None,
            transferred_to_human: false,
            carrier_cost_cents: None,
            realtime_cost_cents: None,
            total_cost_cents: None,
            cost_is_estimated: true,
            quality_score: None,
            patient_sentiment: None,
            agent_outcome: None,
            ticket_number: None,
            agent_slug: agent_slug.into(),
        }
    }
}

/// Agents permitted to create tickets at the end of a call (§4.6).
pub fn is_ticket_creating_agent(agent_slug: &str) -> bool {
    agent_slug != "no-ivr"
}

/// Transient side-record created when the agent invokes the escalate tool.
/// Keyed by `realtime_call_id`; consumed by the human-handoff path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationDetail {
    pub realtime_call_id: String,
    pub reason: String,
    pub caller_type: String,
    pub patient_name: Option<String>,
    pub symptom_summary: Option<String>,
    pub created_at: DateTime<Utc>,
}
