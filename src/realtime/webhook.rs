//! Realtime webhook ingress: signature verification (spec §4.3/§7 item 2)
//! and the `POST /realtime` dispatcher for `realtime.call.incoming` /
//! `realtime.call.disconnected`.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::lifecycle::{Outcome, TerminationSource};
use crate::server::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Verify `id.timestamp.body` against the base64-decoded `whsec_`-prefixed
/// secret, constant-time compare via the HMAC crate's own `verify_slice`.
pub fn verify_signature(secret: &str, id: &str, timestamp: &str, body: &[u8], signature_b64: &str) -> Result<()> {
    let raw_secret = secret
        .strip_prefix("whsec_")
        .ok_or_else(|| OrchestratorError::signature("webhook secret missing whsec_ prefix"))?;
    let key_bytes = base64::engine::general_purpose::STANDARD
        .decode(raw_secret)
        .map_err(|e| OrchestratorError::signature(format!("secret is not valid base64: {e}")))?;

    let mut mac = HmacSha256::new_from_slice(&key_bytes)
        .map_err(|e| OrchestratorError::signature(format!("bad hmac key: {e}")))?;
    mac.update(id.as_bytes());
    mac.update(b".");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);

    let expected = base64::engine::general_purpose::STANDARD
        .decode(signature_b64)
        .map_err(|e| OrchestratorError::signature(format!("signature is not valid base64: {e}")))?;

    mac.verify_slice(&expected)
        .map_err(|_| OrchestratorError::signature("signature mismatch"))
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    call_id: String,
    sip_headers: Option<std::collections::HashMap<String, String>>,
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<StatusCode, OrchestratorError> {
    let signature = headers
        .get("Webhook-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| OrchestratorError::signature("missing Webhook-Signature header"))?;
    let timestamp = headers
        .get("Webhook-Timestamp")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| OrchestratorError::signature("missing Webhook-Timestamp header"))?;
    let webhook_id = headers
        .get("Webhook-Id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| OrchestratorError::signature("missing Webhook-Id header"))?;

    verify_signature(&state.config.realtime.webhook_secret, webhook_id, timestamp, &body, signature)?;

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)?;

    match envelope.kind.as_str() {
        "realtime.call.incoming" => {
            let conference_name = envelope
                .data
                .sip_headers
                .as_ref()
                .and_then(|h| h.get("X-conferenceName"))
                .cloned();

            let Some(conference_name) = conference_name else {
                warn!("⚠️ realtime.call.incoming for {} missing X-conferenceName header", envelope.data.call_id);
                return Ok(StatusCode::OK);
            };

            info!("📡 realtime incoming call {} for {}", envelope.data.call_id, conference_name);
            let engine = state.accept_engine.clone();
            let call_id = envelope.data.call_id.clone();
            tokio::spawn(async move {
                engine.on_realtime_incoming(&conference_name, &call_id).await;
            });
        }
        "realtime.call.disconnected" => {
            if let Some(conference_name) = state.registry.resolve(
                crate::types::IdentifierKind::RealtimeCallId,
                &envelope.data.call_id,
            ) {
                let lifecycle = state.lifecycle.clone();
                tokio::spawn(async move {
                    lifecycle
                        .signal_termination(&conference_name, TerminationSource::RealtimeDisconnected, Outcome::Completed)
                        .await;
                });
            } else {
                state.diagnostics.incr_registry_lookup_miss();
                warn!("⚠️ disconnected event for unknown realtime call {}", envelope.data.call_id);
            }
        }
        other => {
            info!("ℹ️ ignoring unhandled realtime webhook type: {}", other);
        }
    }

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_signature_accepts_matching_mac() {
        let secret = "whsec_c2VjcmV0a2V5";
        let mut mac = HmacSha256::new_from_slice(b"secretkey").unwrap();
        mac.update(b"id1.1700000000.");
        mac.update(b"{}");
        let tag = mac.finalize().into_bytes();
        let sig = base64::engine::general_purpose::STANDARD.encode(tag);

        verify_signature(secret, "id1", "1700000000", b"{}", &sig).unwrap();
    }

    #[test]
    fn verify_signature_rejects_tampered_body() {
        let secret = "whsec_c2VjcmV0a2V5";
        let mut mac = HmacSha256::new_from_slice(b"secretkey").unwrap();
        mac.update(b"id1.1700000000.");
        mac.update(b"{}");
        let tag = mac.finalize().into_bytes();
        let sig = base64::engine::general_purpose::STANDARD.encode(tag);

        assert!(verify_signature(secret, "id1", "1700000000", b"{\"tampered\":true}", &sig).is_err());
    }

    #[test]
    fn verify_signature_rejects_missing_prefix() {
        assert!(verify_signature("not-whsec", "id1", "1700000000", b"{}", "ignored").is_err());
    }
}
