//! Identifier Registry (spec §4.1).
//!
//! Bidirectional index across the four identifier keyspaces. Backed by a
//! lock-striped map (`dashmap`) rather than a single mutator task, per the
//! redesign note in spec §9 — the source's split between an in-process map
//! and a durable store collapses here into this one cache, with the
//! `SessionStore` owning the durable side.

use dashmap::DashMap;
use tracing::{info, warn};

use crate::error::{OrchestratorError, Result};
use crate::types::IdentifierKind;

/// Bindings that arrived before the session they refer to finished
/// registering. Applied the next time `put` runs for that conference name.
#[derive(Default)]
struct PendingBindings {
    by_conference: DashMap<String, Vec<(IdentifierKind, String)>>,
}

pub struct IdentifierRegistry {
    conference_name: DashMap<String, String>,
    carrier_leg_id: DashMap<String, String>,
    mixer_id: DashMap<String, String>,
    realtime_call_id: DashMap<String, String>,
    pending: PendingBindings,
}

impl Default for IdentifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierRegistry {
    pub fn new() -> Self {
        IdentifierRegistry {
            conference_name: DashMap::new(),
            carrier_leg_id: DashMap::new(),
            mixer_id: DashMap::new(),
            realtime_call_id: DashMap::new(),
            pending: PendingBindings::default(),
        }
    }

    fn map_for(&self, kind: IdentifierKind) -> &DashMap<String, String> {
        match kind {
            IdentifierKind::ConferenceName => &self.conference_name,
            IdentifierKind::CarrierLegId => &self.carrier_leg_id,
            IdentifierKind::MixerId => &self.mixer_id,
            IdentifierKind::RealtimeCallId => &self.realtime_call_id,
        }
    }

    /// Insert every identifier currently known on `session`, including any
    /// bindings that arrived early and were queued under its conference name.
    pub fn put(&self, conference_name: &str, identifiers: &[(IdentifierKind, String)]) -> Result<()> {
        for (kind, value) in identifiers {
            self.bind(conference_name, *kind, value.clone())?;
        }
        if let Some((_, queued)) = self.pending.by_conference.remove(conference_name) {
            for (kind, value) in queued {
                self.bind(conference_name, kind, value)?;
            }
        }
        Ok(())
    }

    /// Atomically add a late-arriving identifier to an already-registered
    /// session.
    pub fn merge_identifier(&self, conference_name: &str, kind: IdentifierKind, value: String) -> Result<()> {
        if self.conference_name.contains_key(conference_name) {
            self.bind(conference_name, kind, value)
        } else {
            // Session not registered yet: queue for when `put` runs.
            self.pending
                .by_conference
                .entry(conference_name.to_string())
                .or_default()
                .push((kind, value));
            Ok(())
        }
    }

    fn bind(&self, conference_name: &str, kind: IdentifierKind, value: String) -> Result<()> {
        let map = self.map_for(kind);
        match map.entry(value.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get() != conference_name {
                    warn!(
                        "🚫 identifier collision: {:?}={} already bound to {}, rejecting rebind to {}",
                        kind,
                        value,
                        existing.get(),
                        conference_name
                    );
                    return Err(OrchestratorError::identifier(format!(
                        "{value} already bound to a different session"
                    )));
                }
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(conference_name.to_string());
                Ok(())
            }
        }
    }

    /// Resolve an identifier directly from the in-memory index. Callers that
    /// also have durable fallback (the `SessionStore`) should try this first
    /// and fall back to the DB exactly once on a miss, repopulating via `put`.
    pub fn resolve(&self, kind: IdentifierKind, value: &str) -> Option<String> {
        self.map_for(kind).get(value).map(|v| v.clone())
    }

    /// Remove every index entry referring to `conference_name`.
    pub fn drop_session(&self, conference_name: &str) {
        for map in [
            &self.conference_name,
            &self.carrier_leg_id,
            &self.mixer_id,
            &self.realtime_call_id,
        ] {
            map.retain(|_, v| v != conference_name);
        }
        self.pending.by_conference.remove(conference_name);
        info!("🧹 dropped registry entries for {}", conference_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_resolve_all_identifiers() {
        let reg = IdentifierRegistry::new();
        reg.put(
            "conf_CA1",
            &[
                (IdentifierKind::ConferenceName, "conf_CA1".to_string()),
                (IdentifierKind::CarrierLegId, "CA1".to_string()),
            ],
        )
        .unwrap();

        assert_eq!(
            reg.resolve(IdentifierKind::CarrierLegId, "CA1").as_deref(),
            Some("conf_CA1")
        );
        assert_eq!(
            reg.resolve(IdentifierKind::ConferenceName, "conf_CA1").as_deref(),
            Some("conf_CA1")
        );
    }

    #[test]
    fn first_binding_wins_on_collision() {
        let reg = IdentifierRegistry::new();
        reg.put(
            "conf_A",
            &[(IdentifierKind::CarrierLegId, "CAshared".to_string())],
        )
        .unwrap();

        let err = reg
            .put("conf_B", &[(IdentifierKind::CarrierLegId, "CAshared".to_string())])
            .unwrap_err();
        assert!(err.to_string().contains("already bound"));

        assert_eq!(
            reg.resolve(IdentifierKind::CarrierLegId, "CAshared").as_deref(),
            Some("conf_A")
        );
    }

    #[test]
    fn pending_binding_applied_at_put_time() {
        let reg = IdentifierRegistry::new();
        reg.merge_identifier("conf_late", IdentifierKind::MixerId, "MX1".to_string())
            .unwrap();
        // Not resolvable yet: session not registered.
        assert!(reg.resolve(IdentifierKind::MixerId, "MX1").is_none());

        reg.put(
            "conf_late",
            &[(IdentifierKind::ConferenceName, "conf_late".to_string())],
        )
        .unwrap();

        assert_eq!(
            reg.resolve(IdentifierKind::MixerId, "MX1").as_deref(),
            Some("conf_late")
        );
    }

    #[test]
    fn drop_removes_every_index_entry() {
        let reg = IdentifierRegistry::new();
        reg.put(
            "conf_X",
            &[
                (IdentifierKind::ConferenceName, "conf_X".to_string()),
                (IdentifierKind::CarrierLegId, "CAX".to_string()),
                (IdentifierKind::MixerId, "MXX".to_string()),
                (IdentifierKind::RealtimeCallId, "RCX".to_string()),
            ],
        )
        .unwrap();

        reg.drop_session("conf_X");

        assert!(reg.resolve(IdentifierKind::ConferenceName, "conf_X").is_none());
        assert!(reg.resolve(IdentifierKind::CarrierLegId, "CAX").is_none());
        assert!(reg.resolve(IdentifierKind::MixerId, "MXX").is_none());
        assert!(reg.resolve(IdentifierKind::RealtimeCallId, "RCX").is_none());
    }
}
