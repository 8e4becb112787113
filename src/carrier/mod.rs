//! Carrier control-plane client and TwiML-equivalent response builders
//! (spec §4.3 steps A/B, §6 "Carrier control surface").

pub mod webhooks;

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::CarrierConfig;
use crate::error::{OrchestratorError, Result};
use crate::retry::{backoff_with_jitter, CircuitBreaker};

#[derive(Debug, Clone)]
pub struct CarrierReconciliation {
    pub duration_seconds: i64,
    pub cost_cents: i64,
    pub data_ready: bool,
}

pub struct CarrierClient {
    http: reqwest::Client,
    cfg: CarrierConfig,
    breaker: CircuitBreaker,
}

impl CarrierClient {
    pub fn new(cfg: CarrierConfig) -> Self {
        CarrierClient {
            http: reqwest::Client::new(),
            cfg,
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
        }
    }

    /// Splice a SIP participant into the named mixer (spec §4.3 step B).
    /// Bounded exponential backoff + jitter on transient failure.
    pub async fn dial_sip_participant(&self, conference_name: &str, req: &DialSipParticipant<'_>) -> Result<()> {
        if !self.breaker.allow() {
            return Err(OrchestratorError::internal("carrier circuit breaker open"));
        }

        let url = format!(
            "{}/Conferences/{}/Participants",
            self.cfg.base_url, conference_name
        );

        const MAX_ATTEMPTS: u32 = 4;
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            let resp = self
                .http
                .post(&url)
                .basic_auth(&self.cfg.account_sid, Some(&self.cfg.auth_token))
                .form(req)
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    self.breaker.record_success();
                    info!("📞 dialed SIP participant into {}", conference_name);
                    return Ok(());
                }
                Ok(r) if r.status().is_server_error() => {
                    warn!("⚠️ carrier dial attempt {} got {}", attempt + 1, r.status());
                    last_err = Some(OrchestratorError::internal(format!("carrier dial failed: {}", r.status())));
                }
                Ok(r) => {
                    self.breaker.record_failure();
                    return Err(OrchestratorError::internal(format!("carrier dial rejected: {}", r.status())));
                }
                Err(e) => {
                    warn!("⚠️ carrier dial attempt {} error: {}", attempt + 1, e);
                    last_err = Some(e.into());
                }
            }

            tokio::time::sleep(backoff_with_jitter(attempt, Duration::from_millis(250), Duration::from_secs(3))).await;
        }

        self.breaker.record_failure();
        Err(last_err.unwrap_or_else(|| OrchestratorError::internal("carrier dial exhausted retries")))
    }

    /// Update an existing carrier leg with fallback instructions
    /// (accept-exhaustion path, spec §4.3 step 6).
    pub async fn update_leg_with_fallback(&self, carrier_leg_id: &str, human_e164: &str) -> Result<()> {
        let url = format!("{}/Calls/{}", self.cfg.base_url, carrier_leg_id);
        let twiml = twiml_fallback_to_human(human_e164);

        let resp = self
            .http
            .post(&url)
            .basic_auth(&self.cfg.account_sid, Some(&self.cfg.auth_token))
            .form(&[("Twiml", twiml.as_str())])
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(OrchestratorError::internal(format!(
                "failed to update leg {carrier_leg_id} with fallback: {}",
                resp.status()
            )));
        }
        info!("☎️ updated leg {} with human fallback", carrier_leg_id);
        Ok(())
    }

    /// Fetch the carrier's authoritative record for post-call reconciliation
    /// (spec §4.5 step 1). Returns `data_ready = false` when the carrier
    /// hasn't finalized the record yet.
    pub async fn reconcile(&self, carrier_leg_id: &str) -> Result<CarrierReconciliation> {
        let url = format!("{}/Calls/{}", self.cfg.base_url, carrier_leg_id);
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.cfg.account_sid, Some(&self.cfg.auth_token))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Ok(CarrierReconciliation {
                duration_seconds: 0,
                cost_cents: 0,
                data_ready: false,
            });
        }

        #[derive(serde::Deserialize)]
        struct CarrierCallRecord {
            duration: Option<i64>,
            price_cents: Option<i64>,
        }

        let record: CarrierCallRecord = resp.json().await?;
        match record.duration {
            Some(duration) if duration > 0 => Ok(CarrierReconciliation {
                duration_seconds: duration,
                cost_cents: record.price_cents.unwrap_or(0),
                data_ready: true,
            }),
            _ => Ok(CarrierReconciliation {
                duration_seconds: 0,
                cost_cents: 0,
                data_ready: false,
            }),
        }
    }
}

#[derive(Serialize)]
pub struct DialSipParticipant<'a> {
    #[serde(rename = "Label")]
    pub label: &'a str,
    #[serde(rename = "From")]
    pub from: &'a str,
    #[serde(rename = "To")]
    pub to: &'a str,
    #[serde(rename = "EarlyMedia")]
    pub early_media: bool,
    #[serde(rename = "CallToken")]
    pub call_token: Option<&'a str>,
    #[serde(rename = "ConferenceStatusCallback")]
    pub status_callback: &'a str,
}

/// Deterministic mixer name so later webhooks can reverse-resolve the
/// session (spec §4.3 step A).
pub fn mixer_name(carrier_leg_id: &str) -> String {
    format!("conf_{carrier_leg_id}")
}

/// Build the SIP URI carrying the correlation headers (spec §4.3 step B).
#[allow(clippy::too_many_arguments)]
pub fn build_realtime_sip_uri(
    realtime_sip_host: &str,
    conference_name: &str,
    caller_e164: &str,
    environment: &str,
    agent_slug: Option<&str>,
    contact_id: Option<&str>,
    campaign_id: Option<&str>,
) -> String {
    let mut headers = vec![
        format!("X-conferenceName={}", urlencoding::encode(conference_name)),
        format!("X-CallerPhone={}", urlencoding::encode(caller_e164)),
        format!("X-Environment={}", urlencoding::encode(environment)),
    ];
    if let Some(slug) = agent_slug {
        headers.push(format!("X-agentSlug={}", urlencoding::encode(slug)));
    }
    if let Some(id) = contact_id {
        headers.push(format!("X-contactId={}", urlencoding::encode(id)));
    }
    if let Some(id) = campaign_id {
        headers.push(format!("X-campaignId={}", urlencoding::encode(id)));
    }
    format!("sip:{}?{}", realtime_sip_host, headers.join("&"))
}

/// Step A TwiML: hold phrase + join the named mixer, with status callbacks
/// registered for mixer join/leave/end and recording completion.
pub fn twiml_hold_and_join_mixer(conference_name: &str, events_url: &str, recording_url: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<Response>\
<Say>Please hold while we connect you.</Say>\
<Dial>\
<Conference statusCallback=\"{events_url}\" \
statusCallbackEvent=\"start end join leave\" \
recordingStatusCallback=\"{recording_url}\">{conference_name}</Conference>\
</Dial>\
</Response>"
    )
}

/// Fallback TwiML when accept is exhausted or the SIP watchdog fires at 60s:
/// route the caller to a live human via DTMF/dial action.
pub fn twiml_fallback_to_human(human_e164: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<Response>\
<Say>Connecting you with our on call staff now.</Say>\
<Dial>{human_e164}</Dial>\
</Response>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixer_name_is_deterministic() {
        assert_eq!(mixer_name("CAhappy"), "conf_CAhappy");
    }

    #[test]
    fn sip_uri_carries_required_correlation_headers() {
        let uri = build_realtime_sip_uri(
            "sip.realtime.example.com",
            "conf_CAhappy",
            "+16265551212",
            "production",
            Some("no-ivr"),
            None,
            None,
        );
        assert!(uri.contains("X-conferenceName=conf_CAhappy"));
        assert!(uri.contains("X-CallerPhone=%2B16265551212"));
        assert!(uri.contains("X-Environment=production"));
        assert!(uri.contains("X-agentSlug=no-ivr"));
    }

    #[test]
    fn hold_twiml_contains_conference_and_callbacks() {
        let xml = twiml_hold_and_join_mixer("conf_CAhappy", "https://x/events", "https://x/rec");
        assert!(xml.contains("conf_CAhappy"));
        assert!(xml.contains("https://x/events"));
        assert!(xml.contains("https://x/rec"));
    }

    #[test]
    fn fallback_twiml_dials_human_number() {
        let xml = twiml_fallback_to_human("+19095550000");
        assert!(xml.contains("+19095550000"));
    }
}
