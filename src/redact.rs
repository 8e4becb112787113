//! PHI redaction (spec §9): a process-wide flag that shortens caller
//! identifiers and transcript excerpts before they reach a log line. Kept as
//! a plain function rather than a custom `tracing::Layer`, since the call
//! sites that need it are few and a direct call is simpler.

use std::sync::atomic::{AtomicBool, Ordering};

static PHI_REDACTION_ENABLED: AtomicBool = AtomicBool::new(true);

pub fn set_phi_redaction(enabled: bool) {
    PHI_REDACTION_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn phi_redaction_enabled() -> bool {
    PHI_REDACTION_ENABLED.load(Ordering::Relaxed)
}

/// Redact an E.164 number to its last 4 digits when the flag is set.
pub fn redact_e164(e164: &str) -> String {
    if !phi_redaction_enabled() {
        return e164.to_string();
    }
    let tail: String = e164.chars().rev().take(4).collect::<String>().chars().rev().collect();
    format!("***{tail}")
}

/// Redact a transcript excerpt to its length only, when the flag is set.
pub fn redact_transcript(transcript: &str) -> String {
    if !phi_redaction_enabled() {
        return transcript.to_string();
    }
    format!("<redacted, {} chars>", transcript.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn redacts_when_enabled() {
        set_phi_redaction(true);
        assert_eq!(redact_e164("+16265551212"), "***1212");
        assert!(redact_transcript("hello doctor").starts_with("<redacted"));
    }

    #[test]
    #[serial]
    fn passes_through_when_disabled() {
        set_phi_redaction(false);
        assert_eq!(redact_e164("+16265551212"), "+16265551212");
        assert_eq!(redact_transcript("hello doctor"), "hello doctor");
        set_phi_redaction(true);
    }
}
