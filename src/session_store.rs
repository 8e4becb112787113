//! Session Store (spec §4.2).
//!
//! Dual-write: the cache is updated synchronously, the durable upsert is
//! pushed to a background task so a DB hiccup never blocks call handling.
//! Grounded on the background-task-spawning style in the teacher's
//! orchestrator core, and on the cache-first/durable-fallback split the
//! registry also follows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::database::DatabaseManager;
use crate::error::Result;
use crate::registry::IdentifierRegistry;
use crate::types::Session;

/// Per-conference write lock so concurrent event sources can't interleave
/// partial patches onto the same session (spec §4.2 "Concurrency").
type WriteLocks = DashMap<String, Arc<Mutex<()>>>;

pub struct SessionStore {
    cache: DashMap<String, Session>,
    locks: WriteLocks,
    db: DatabaseManager,
    registry: Arc<IdentifierRegistry>,
    durable_write_failures: Arc<AtomicU64>,
}

impl SessionStore {
    pub fn new(db: DatabaseManager, registry: Arc<IdentifierRegistry>) -> Self {
        SessionStore {
            cache: DashMap::new(),
            locks: DashMap::new(),
            db,
            registry,
            durable_write_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reload all non-terminal sessions from durable storage into the cache.
    /// Called once at startup (spec §8 invariant).
    pub async fn reload_from_durable_store(&self) -> Result<usize> {
        let sessions = self.db.load_non_terminal_sessions().await?;
        let count = sessions.len();
        for session in sessions {
            self.registry.put(&session.conference_name, &session.identifiers())?;
            self.cache.insert(session.conference_name.clone(), session);
        }
        info!("🔁 reloaded {} in-flight sessions from durable store", count);
        Ok(count)
    }

    fn lock_for(&self, conference_name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(conference_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Insert a brand-new session: cache write, registry indexing, and a
    /// synchronous durable insert (there is nothing to race with yet).
    pub async fn create(&self, session: Session) -> Result<()> {
        self.registry.put(&session.conference_name, &session.identifiers())?;
        self.cache.insert(session.conference_name.clone(), session.clone());
        if let Err(e) = self.db.upsert_session(&session).await {
            self.durable_write_failures.fetch_add(1, Ordering::Relaxed);
            warn!("⚠️ durable insert failed for {}: {}", session.conference_name, e);
        }
        Ok(())
    }

    /// Cache-first read with a single durable fallback on miss.
    pub async fn read(&self, conference_name: &str) -> Result<Option<Session>> {
        if let Some(s) = self.cache.get(conference_name) {
            return Ok(Some(s.clone()));
        }
        if let Some(session) = self.db.get_session(conference_name).await? {
            self.registry.put(&session.conference_name, &session.identifiers())?;
            self.cache.insert(conference_name.to_string(), session.clone());
            return Ok(Some(session));
        }
        Ok(None)
    }

    /// Merge `patch` onto the cached record, push any new identifiers into
    /// the registry, and enqueue a background durable upsert. Never blocks
    /// the caller on durable success.
    pub async fn upsert<F>(&self, conference_name: &str, patch: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let lock = self.lock_for(conference_name);
        let _guard = lock.lock().await;

        let mut session = match self.read(conference_name).await? {
            Some(s) => s,
            None => return Err(crate::error::OrchestratorError::not_found(conference_name)),
        };

        patch(&mut session);
        session.touch();

        for (kind, value) in session.identifiers() {
            self.registry.merge_identifier(conference_name, kind, value)?;
        }
        self.cache.insert(conference_name.to_string(), session.clone());

        let db = self.db.clone();
        let to_persist = session.clone();
        let failures = self.durable_write_failures.clone();
        tokio::spawn(async move {
            if let Err(e) = db.upsert_session(&to_persist).await {
                failures.fetch_add(1, Ordering::Relaxed);
                error!("⚠️ background durable upsert failed for {}: {}", to_persist.conference_name, e);
            }
        });

        Ok(session)
    }

    /// Delete the cache/registry entries for a terminal session. The CallLog
    /// persists independently (spec §3 lifecycle).
    pub async fn delete(&self, conference_name: &str) -> Result<()> {
        self.cache.remove(conference_name);
        self.registry.drop_session(conference_name);
        self.locks.remove(conference_name);
        self.db.delete_session(conference_name).await
    }

    pub fn durable_write_failures(&self) -> u64 {
        self.durable_write_failures.load(Ordering::Relaxed)
    }

    /// Periodic TTL sweep: removes durable records that are expired and
    /// terminal, or simply stale past the one-hour safety net.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let removed = self.db.sweep_expired_sessions().await?;
        self.cache.retain(|_, s| s.expires_at > chrono::Utc::now());
        Ok(removed)
    }

    pub fn active_count(&self) -> usize {
        self.cache.len()
    }

    pub fn active_sessions(&self) -> Vec<Session> {
        self.cache.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionState;

    async fn store() -> SessionStore {
        let db = DatabaseManager::new_in_memory().await.unwrap();
        let registry = Arc::new(IdentifierRegistry::new());
        SessionStore::new(db, registry)
    }

    #[tokio::test]
    async fn upsert_then_read_matches_for_observable_fields() {
        let store = store().await;
        let session = Session::new("conf_rt", "+1", "+2");
        store.create(session.clone()).await.unwrap();

        let patched = store
            .upsert("conf_rt", |s| s.carrier_leg_id = Some("CA1".to_string()))
            .await
            .unwrap();
        assert_eq!(patched.carrier_leg_id.as_deref(), Some("CA1"));

        let read_back = store.read("conf_rt").await.unwrap().unwrap();
        assert_eq!(read_back.carrier_leg_id.as_deref(), Some("CA1"));
    }

    #[tokio::test]
    async fn delete_removes_from_cache_and_registry() {
        let store = store().await;
        let mut session = Session::new("conf_done", "+1", "+2");
        session.set_state(SessionState::Completed);
        store.create(session).await.unwrap();

        store.delete("conf_done").await.unwrap();
        assert!(store.read("conf_done").await.unwrap().is_none());
        assert!(store
            .registry
            .resolve(crate::types::IdentifierKind::ConferenceName, "conf_done")
            .is_none());
    }
}
