//! Durable storage: sqlx against SQLite, with embedded migrations.
//!
//! Grounded on the sibling call-engine's `DatabaseManager` (sqlx, not the
//! experimental `limbo` backend the larger copy used) — same pool-wrapper
//! shape, same `ON CONFLICT ... DO UPDATE` upsert idiom, same `From<sqlx::Error>`
//! conversion, extended here to the two tables this crate actually needs.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::types::{
    CallDirection, CallLog, CallStatus, Disposition, Session, SessionState,
};

#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("🗄️ connecting to database: {}", database_url);
        let pool = SqlitePool::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            OrchestratorError::internal(format!("migration failed: {e}"))
        })?;
        info!("✅ database ready");
        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- active_call_sessions -------------------------------------------

    /// Upsert a session. Used by the session store's background durable
    /// write; failures here are counted by the caller, never fail the call.
    pub async fn upsert_session(&self, s: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO active_call_sessions (
                conference_name, carrier_leg_id, realtime_call_id, mixer_id, call_log_id,
                caller_e164, dialed_e164, call_token, agent_slug, state,
                realtime_session_established, human_transfer_initiated, transferred_to_human,
                last_error, retry_count, created_at, updated_at, expires_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(conference_name) DO UPDATE SET
                carrier_leg_id = excluded.carrier_leg_id,
                realtime_call_id = excluded.realtime_call_id,
                mixer_id = excluded.mixer_id,
                call_log_id = excluded.call_log_id,
                call_token = excluded.call_token,
                agent_slug = excluded.agent_slug,
                state = excluded.state,
                realtime_session_established = excluded.realtime_session_established,
                human_transfer_initiated = excluded.human_transfer_initiated,
                transferred_to_human = excluded.transferred_to_human,
                last_error = excluded.last_error,
                retry_count = excluded.retry_count,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at",
        )
        .bind(&s.conference_name)
        .bind(&s.carrier_leg_id)
        .bind(&s.realtime_call_id)
        .bind(&s.mixer_id)
        .bind(&s.call_log_id)
        .bind(&s.caller_e164)
        .bind(&s.dialed_e164)
        .bind(&s.call_token)
        .bind(&s.agent_slug)
        .bind(s.state.as_str())
        .bind(s.realtime_session_established)
        .bind(s.human_transfer_initiated)
        .bind(s.transferred_to_human)
        .bind(&s.last_error)
        .bind(s.retry_count as i64)
        .bind(s.created_at)
        .bind(s.updated_at)
        .bind(s.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, conference_name: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM active_call_sessions WHERE conference_name = ?")
            .bind(conference_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(session_from_row).transpose()
    }

    pub async fn delete_session(&self, conference_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM active_call_sessions WHERE conference_name = ?")
            .bind(conference_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reload every non-terminal session, for the startup-reload invariant
    /// (spec §8: "every session in non-terminal state at startup is
    /// reloaded from the durable store into the cache").
    pub async fn load_non_terminal_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM active_call_sessions WHERE state IN ('initializing', 'connected', 'transferring')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(session_from_row).collect()
    }

    /// Delete sessions that are expired-and-terminal, or simply stale beyond
    /// the one-hour safety net, per spec §4.2 TTL sweep.
    pub async fn sweep_expired_sessions(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM active_call_sessions
             WHERE (expires_at < datetime('now') AND state IN ('completed', 'failed'))
                OR created_at < datetime('now', '-1 hour')",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- call_logs ---------------------------------------------------------

    pub async fn insert_call_log(&self, log: &CallLog) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_logs (
                id, conference_name, carrier_leg_id, realtime_call_id, direction,
                start_time, end_time, duration_seconds, status, disposition, answered_by,
                transcript, recording_url, transferred_to_human, carrier_cost_cents,
                realtime_cost_cents, total_cost_cents, cost_is_estimated, quality_score,
                patient_sentiment, agent_outcome, ticket_number, agent_slug
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&log.id)
        .bind(&log.conference_name)
        .bind(&log.carrier_leg_id)
        .bind(&log.realtime_call_id)
        .bind(direction_str(log.direction))
        .bind(log.start_time)
        .bind(log.end_time)
        .bind(log.duration_seconds)
        .bind(status_str(log.status))
        .bind(log.disposition.map(|d| d.as_str()))
        .bind(&log.answered_by)
        .bind(&log.transcript)
        .bind(&log.recording_url)
        .bind(log.transferred_to_human)
        .bind(log.carrier_cost_cents)
        .bind(log.realtime_cost_cents)
        .bind(log.total_cost_cents)
        .bind(log.cost_is_estimated)
        .bind(log.quality_score)
        .bind(&log.patient_sentiment)
        .bind(&log.agent_outcome)
        .bind(&log.ticket_number)
        .bind(&log.agent_slug)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_call_log_by_conference(&self, conference_name: &str) -> Result<Option<CallLog>> {
        let row = sqlx::query("SELECT * FROM call_logs WHERE conference_name = ?")
            .bind(conference_name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(call_log_from_row).transpose()
    }

    /// Idempotent carrier-reconcile write: only the carrier reconciler may
    /// write `duration`/cost/`cost_is_estimated` (spec §4.6).
    pub async fn apply_carrier_reconciliation(
        &self,
        conference_name: &str,
        duration_seconds: i64,
        carrier_cost_cents: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE call_logs SET duration_seconds = ?, carrier_cost_cents = ?, cost_is_estimated = 0
             WHERE conference_name = ?",
        )
        .bind(duration_seconds)
        .bind(carrier_cost_cents)
        .bind(conference_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_transcript(&self, conference_name: &str, text: &str) -> Result<()> {
        sqlx::query("UPDATE call_logs SET transcript = transcript || ? WHERE conference_name = ?")
            .bind(text)
            .bind(conference_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Monotonic latch: only ever sets true, matching spec §4.6.
    pub async fn mark_transferred_to_human(&self, conference_name: &str) -> Result<()> {
        sqlx::query(
            "UPDATE call_logs SET transferred_to_human = 1 WHERE conference_name = ? AND transferred_to_human = 0",
        )
        .bind(conference_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finalize_call_log(
        &self,
        conference_name: &str,
        status: CallStatus,
        disposition: Disposition,
        end_time: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE call_logs SET status = ?, disposition = ?, end_time = ? WHERE conference_name = ?",
        )
        .bind(status_str(status))
        .bind(disposition.as_str())
        .bind(end_time)
        .bind(conference_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_grade(
        &self,
        conference_name: &str,
        quality_score: f64,
        sentiment: &str,
        outcome: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE call_logs SET quality_score = ?, patient_sentiment = ?, agent_outcome = ? WHERE conference_name = ?",
        )
        .bind(quality_score)
        .bind(sentiment)
        .bind(outcome)
        .bind(conference_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_ticket_number(&self, conference_name: &str, ticket_number: &str) -> Result<()> {
        sqlx::query("UPDATE call_logs SET ticket_number = ? WHERE conference_name = ?")
            .bind(ticket_number)
            .bind(conference_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn direction_str(d: CallDirection) -> &'static str {
    match d {
        CallDirection::Inbound => "inbound",
        CallDirection::Outbound => "outbound",
    }
}

fn status_str(s: CallStatus) -> &'static str {
    match s {
        CallStatus::InProgress => "in_progress",
        CallStatus::Completed => "completed",
        CallStatus::Failed => "failed",
    }
}

fn session_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Session> {
    let state_str: String = row.try_get("state")?;
    Ok(Session {
        conference_name: row.try_get("conference_name")?,
        carrier_leg_id: row.try_get("carrier_leg_id")?,
        realtime_call_id: row.try_get("realtime_call_id")?,
        mixer_id: row.try_get("mixer_id")?,
        call_log_id: row.try_get("call_log_id")?,
        caller_e164: row.try_get("caller_e164")?,
        dialed_e164: row.try_get("dialed_e164")?,
        call_token: row.try_get("call_token")?,
        agent_slug: row.try_get("agent_slug")?,
        state: SessionState::from_str(&state_str)
            .ok_or_else(|| OrchestratorError::internal(format!("bad session state '{state_str}'")))?,
        realtime_session_established: row.try_get("realtime_session_established")?,
        human_transfer_initiated: row.try_get("human_transfer_initiated")?,
        transferred_to_human: row.try_get("transferred_to_human")?,
        last_error: row.try_get("last_error")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn call_log_from_row(row: sqlx::sqlite::SqliteRow) -> Result<CallLog> {
    let direction_str: String = row.try_get("direction")?;
    let status_str: String = row.try_get("status")?;
    let disposition_str: Option<String> = row.try_get("disposition")?;
    debug!("hydrating call log row");
    Ok(CallLog {
        id: row.try_get("id")?,
        conference_name: row.try_get("conference_name")?,
        carrier_leg_id: row.try_get("carrier_leg_id")?,
        realtime_call_id: row.try_get("realtime_call_id")?,
        direction: match direction_str.as_str() {
            "outbound" => CallDirection::Outbound,
            _ => CallDirection::Inbound,
        },
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        duration_seconds: row.try_get("duration_seconds")?,
        status: match status_str.as_str() {
            "completed" => CallStatus::Completed,
            "failed" => CallStatus::Failed,
            _ => CallStatus::InProgress,
        },
        disposition: disposition_str.as_deref().and_then(Disposition::from_str),
        answered_by: row.try_get("answered_by")?,
        transcript: row.try_get("transcript")?,
        recording_url: row.try_get("recording_url")?,
        transferred_to_human: row.try_get("transferred_to_human")?,
        carrier_cost_cents: row.try_get("carrier_cost_cents")?,
        realtime_cost_cents: row.try_get("realtime_cost_cents")?,
        total_cost_cents: row.try_get("total_cost_cents")?,
        cost_is_estimated: row.try_get("cost_is_estimated")?,
        quality_score: row.try_get("quality_score")?,
        patient_sentiment: row.try_get("patient_sentiment")?,
        agent_outcome: row.try_get("agent_outcome")?,
        ticket_number: row.try_get("ticket_number")?,
        agent_slug: row.try_get("agent_slug")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_read_roundtrips_session() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let session = Session::new("conf_CA1", "+16265551212", "+19095554321");
        db.upsert_session(&session).await.unwrap();

        let loaded = db.get_session("conf_CA1").await.unwrap().unwrap();
        assert_eq!(loaded.conference_name, "conf_CA1");
        assert_eq!(loaded.caller_e164, "+16265551212");
        assert_eq!(loaded.state, SessionState::Initializing);
    }

    #[tokio::test]
    async fn non_terminal_sessions_survive_reload() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let mut connected = Session::new("conf_live", "+1", "+2");
        connected.set_state(SessionState::Connected);
        let mut done = Session::new("conf_done", "+1", "+2");
        done.set_state(SessionState::Completed);

        db.upsert_session(&connected).await.unwrap();
        db.upsert_session(&done).await.unwrap();

        let reloaded = db.load_non_terminal_sessions().await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].conference_name, "conf_live");
    }

    #[tokio::test]
    async fn transferred_to_human_latch_is_monotonic() {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let log = CallLog::new("conf_T", "no-ivr");
        db.insert_call_log(&log).await.unwrap();

        db.mark_transferred_to_human("conf_T").await.unwrap();
        let reloaded = db.get_call_log_by_conference("conf_T").await.unwrap().unwrap();
        assert!(reloaded.transferred_to_human);

        // A second call is a no-op, never flips it back.
        db.mark_transferred_to_human("conf_T").await.unwrap();
        let reloaded = db.get_call_log_by_conference("conf_T").await.unwrap().unwrap();
        assert!(reloaded.transferred_to_human);
    }
}
