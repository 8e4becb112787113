//! Realtime transport REST client (spec §4.3 steps C/D, §6 "Realtime
//! control surface"). Same reqwest/backoff/circuit-breaker idiom as
//! `carrier::CarrierClient`, since both are external HTTP collaborators
//! the accept engine calls into under retry.

pub mod events;
pub mod webhook;

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::RealtimeConfig;
use crate::error::{OrchestratorError, Result};
use crate::retry::{accept_retry_delay, CircuitBreaker};

pub struct RealtimeClient {
    http: reqwest::Client,
    cfg: RealtimeConfig,
    breaker: CircuitBreaker,
}

#[derive(Debug, Serialize)]
pub struct AgentAudioConfig<'a> {
    pub input_audio_format: &'a str,
    pub output_audio_format: &'a str,
    pub turn_detection: TurnDetection<'a>,
    pub voice: &'a str,
    pub instructions: &'a str,
}

#[derive(Debug, Serialize)]
pub struct TurnDetection<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub eagerness: &'a str,
    pub create_response: bool,
    pub interrupt_response: bool,
}

impl Default for TurnDetection<'static> {
    fn default() -> Self {
        TurnDetection {
            kind: "semantic_vad",
            eagerness: "medium",
            create_response: true,
            interrupt_response: true,
        }
    }
}

impl<'a> AgentAudioConfig<'a> {
    /// PCM mu-law 8kHz, matching the carrier's SIP trunk codec (spec §4.3
    /// step C.5).
    pub fn pcm_mulaw(instructions: &'a str, voice: &'a str) -> Self {
        AgentAudioConfig {
            input_audio_format: "g711_ulaw",
            output_audio_format: "g711_ulaw",
            turn_detection: TurnDetection::default(),
            voice,
            instructions,
        }
    }
}

impl RealtimeClient {
    pub fn new(cfg: RealtimeConfig) -> Self {
        RealtimeClient {
            http: reqwest::Client::new(),
            cfg,
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
        }
    }

    /// Accept an incoming realtime call (spec §4.3 step C.5). Retries only
    /// on 404 — the call record can lag the webhook delivery by a few
    /// hundred milliseconds — up to `MAX_ACCEPT_ATTEMPTS` times. Any other
    /// failure status is terminal immediately.
    pub async fn accept(&self, realtime_call_id: &str, audio: &AgentAudioConfig<'_>) -> Result<()> {
        const MAX_ACCEPT_ATTEMPTS: u32 = 8;

        if !self.breaker.allow() {
            return Err(OrchestratorError::internal("realtime circuit breaker open"));
        }

        let url = format!("{}/v1/realtime/calls/{}/accept", self.cfg.base_url, realtime_call_id);

        for attempt in 0..MAX_ACCEPT_ATTEMPTS {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&self.cfg.api_key)
                .json(audio)
                .send()
                .await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    self.breaker.record_success();
                    info!("✅ accepted realtime call {}", realtime_call_id);
                    return Ok(());
                }
                Ok(r) if r.status() == reqwest::StatusCode::NOT_FOUND => {
                    warn!("⏳ accept attempt {} for {} got 404, retrying", attempt + 1, realtime_call_id);
                    tokio::time::sleep(accept_retry_delay(attempt)).await;
                    continue;
                }
                Ok(r) => {
                    self.breaker.record_failure();
                    return Err(OrchestratorError::accept(format!(
                        "accept rejected for {realtime_call_id}: {}",
                        r.status()
                    )));
                }
                Err(e) => {
                    self.breaker.record_failure();
                    return Err(e.into());
                }
            }
        }

        self.breaker.record_failure();
        Err(OrchestratorError::accept(format!(
            "accept exhausted {MAX_ACCEPT_ATTEMPTS} attempts for {realtime_call_id}"
        )))
    }

    pub async fn hangup(&self, realtime_call_id: &str) -> Result<()> {
        let url = format!("{}/v1/realtime/calls/{}/hangup", self.cfg.base_url, realtime_call_id);
        let resp = self.http.post(&url).bearer_auth(&self.cfg.api_key).send().await?;
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(OrchestratorError::internal(format!(
                "hangup failed for {realtime_call_id}: {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Build the websocket URL for the agent's audio stream, authenticated
    /// the same way as the REST surface.
    pub fn websocket_url(&self, realtime_call_id: &str) -> String {
        let base = self.cfg.base_url.replacen("https://", "wss://", 1).replacen("http://", "ws://", 1);
        format!("{base}/v1/realtime/calls/{realtime_call_id}/ws?key={}", self.cfg.api_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_mulaw_defaults_match_carrier_codec() {
        let audio = AgentAudioConfig::pcm_mulaw("greet the caller", "alloy");
        assert_eq!(audio.input_audio_format, "g711_ulaw");
        assert_eq!(audio.output_audio_format, "g711_ulaw");
        assert_eq!(audio.turn_detection.kind, "semantic_vad");
        assert_eq!(audio.turn_detection.eagerness, "medium");
    }

    #[test]
    fn websocket_url_upgrades_scheme() {
        let client = RealtimeClient::new(RealtimeConfig {
            api_key: "key".into(),
            project_id: "proj".into(),
            webhook_secret: "whsec_x".into(),
            base_url: "https://realtime.example.com".into(),
        });
        let url = client.websocket_url("rtc_123");
        assert!(url.starts_with("wss://realtime.example.com"));
        assert!(url.contains("rtc_123"));
    }
}
