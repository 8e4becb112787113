//! End-to-end scenarios against the axum router, driven the same way the
//! teacher drives its API tests: `tower::ServiceExt::oneshot` over an
//! in-memory SQLite database. The carrier/realtime HTTP clients point at an
//! unreachable loopback address — background dial/accept attempts fail fast
//! and are logged, never blocking the webhook response under test.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use nightline_orchestrator::barrier::BarrierKind;
use nightline_orchestrator::config::{CarrierConfig, Config, Environment, RealtimeConfig};
use nightline_orchestrator::server::{self, AppState};
use tower::ServiceExt;

fn test_config() -> Config {
    Config {
        domain: "after-hours.example.com".into(),
        environment: Environment::Development,
        bind_addr: "0.0.0.0:0".into(),
        database_url: "sqlite::memory:".into(),
        carrier: CarrierConfig {
            account_sid: "ACtest".into(),
            auth_token: "tok".into(),
            base_url: "http://127.0.0.1:1".into(),
        },
        realtime: RealtimeConfig {
            api_key: "key".into(),
            project_id: "proj".into(),
            webhook_secret: "whsec_dGVzdHNlY3JldA==".into(),
            base_url: "http://127.0.0.1:1".into(),
        },
        human_agent_e164: "+19095550000".into(),
        phi_redaction: true,
        realtime_unit_rate_cents_per_min: 19.0,
    }
}

async fn test_state() -> AppState {
    server::build_state(test_config()).await.unwrap()
}

fn form_body(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Scenario 1 (spec §8 happy path, first half): an incoming call webhook
/// creates a session and barriers and returns hold TwiML immediately,
/// without waiting on the carrier dial.
#[tokio::test]
async fn incoming_call_creates_session_and_returns_hold_twiml() {
    let state = test_state().await;
    let app = server::build_router(state.clone());

    let body = form_body(&[("CallSid", "CAhappy"), ("From", "+16265551212"), ("To", "+19095559999")]);
    let req = Request::builder()
        .method("POST")
        .uri("/incoming-call")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();

    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let xml = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(xml.contains("conf_CAhappy"));
    assert!(xml.contains("<Dial>"));

    let session = state.sessions.read("conf_CAhappy").await.unwrap().unwrap();
    assert_eq!(session.caller_e164, "+16265551212");
    assert_eq!(
        state.registry.resolve(nightline_orchestrator::types::IdentifierKind::CarrierLegId, "CAhappy"),
        Some("conf_CAhappy".to_string())
    );
}

/// Scenario: caller hangs up before the accept handshake completes.
/// `participant-leave` for the customer label must terminate the call
/// exactly once even without a realtime call id ever being attached.
#[tokio::test]
async fn caller_hangs_up_before_attach_terminates_the_call() {
    let state = test_state().await;
    let app = server::build_router(state.clone());

    let incoming = form_body(&[("CallSid", "CAbail"), ("From", "+16265551212"), ("To", "+19095559999")]);
    let req = Request::builder()
        .method("POST")
        .uri("/incoming-call")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(incoming))
        .unwrap();
    app.clone().oneshot(req).await.unwrap();

    let leave = form_body(&[
        ("StatusCallbackEvent", "participant-leave"),
        ("FriendlyName", "conf_CAbail"),
        ("ParticipantLabel", "customer"),
    ]);
    let req = Request::builder()
        .method("POST")
        .uri("/conference-events")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(leave))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert!(state.lifecycle.has_ended("conf_CAbail"));
}

/// Scenario: a duplicate terminal `status-callback` for the same CallSid
/// must not double-fire the termination pipeline (spec §8 idempotency).
#[tokio::test]
async fn duplicate_status_callback_is_idempotent() {
    let state = test_state().await;
    let app = server::build_router(state.clone());

    let incoming = form_body(&[("CallSid", "CAdup"), ("From", "+1"), ("To", "+2")]);
    let req = Request::builder()
        .method("POST")
        .uri("/incoming-call")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(incoming))
        .unwrap();
    app.clone().oneshot(req).await.unwrap();

    for _ in 0..2 {
        let cb = form_body(&[("CallSid", "CAdup"), ("CallStatus", "completed")]);
        let req = Request::builder()
            .method("POST")
            .uri("/status-callback")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(cb))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    assert!(state.lifecycle.has_ended("conf_CAdup"));
}

/// Scenario: the stale-call sweep synthesizes call-ended(outcome=timeout)
/// for a session still open past the hard cap, without any carrier or
/// realtime signal ever arriving.
#[tokio::test]
async fn stale_call_sweep_terminates_orphaned_sessions() {
    let state = test_state().await;
    let mut session = nightline_orchestrator::types::Session::new("conf_stale", "+1", "+2");
    session.created_at = chrono::Utc::now() - chrono::Duration::minutes(11);
    state.sessions.create(session).await.unwrap();

    state.lifecycle.sweep_stale(&["conf_stale".to_string()]).await;

    assert!(state.lifecycle.has_ended("conf_stale"));
}

/// Scenario: a human-transfer join resolves the `HumanAnswered` barrier
/// created ahead of time, the way the accept engine creates it once accept
/// succeeds.
#[tokio::test]
async fn human_participant_join_resolves_human_answered_barrier() {
    let state = test_state().await;
    let app = server::build_router(state.clone());

    state.barriers.create("conf_human", BarrierKind::HumanAnswered);

    let join = form_body(&[
        ("StatusCallbackEvent", "participant-join"),
        ("FriendlyName", "conf_human"),
        ("ParticipantLabel", "human"),
    ]);
    let req = Request::builder()
        .method("POST")
        .uri("/conference-events")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(join))
        .unwrap();
    app.oneshot(req).await.unwrap();

    let outcome = state.barriers.wait("conf_human", BarrierKind::HumanAnswered).await;
    assert!(matches!(outcome, nightline_orchestrator::barrier::BarrierOutcome::Resolved));
}

#[tokio::test]
async fn healthz_reports_ok() {
    let state = test_state().await;
    let app = server::build_router(state);

    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
