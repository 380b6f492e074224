//! Upstream session registry.
//!
//! Process-wide pool of [`UpstreamSession`]s keyed by (project-id,
//! server-name). Sessions are created on demand, reused while alive, and
//! evicted by a background sweep once idle past the configured timeout.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use super::UpstreamSession;
use crate::config::Settings;
use crate::error::UpstreamResult;
use crate::store::UpstreamDef;

/// Registry key: (project-id, server-name).
pub type SessionKey = (Uuid, String);

/// Pool of persistent upstream sessions.
pub struct SessionManager {
    /// Guarded by one async mutex so concurrent `get_or_create` calls for
    /// the same key never spawn twice.
    sessions: Mutex<HashMap<SessionKey, Arc<UpstreamSession>>>,
    session_timeout: std::time::Duration,
    cleanup_interval: std::time::Duration,
    cleanup: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(settings: &Settings) -> Self {
        tracing::info!(
            session_timeout_secs = settings.session_timeout.as_secs(),
            cleanup_interval_secs = settings.cleanup_interval.as_secs(),
            "session manager initialized"
        );
        Self {
            sessions: Mutex::new(HashMap::new()),
            session_timeout: settings.session_timeout,
            cleanup_interval: settings.cleanup_interval,
            cleanup: std::sync::Mutex::new(None),
        }
    }

    /// Get the live session for a definition, creating it if absent or
    /// dead.
    ///
    /// Holding the registry lock across creation is what guarantees a
    /// single spawn per key under concurrency.
    pub async fn get_or_create(&self, def: &UpstreamDef) -> UpstreamResult<Arc<UpstreamSession>> {
        let key: SessionKey = (def.project_id, def.name.clone());
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(&key) {
            if existing.is_alive() {
                existing.touch();
                tracing::debug!(server = %def.name, "reusing upstream session");
                return Ok(Arc::clone(existing));
            }
            tracing::warn!(server = %def.name, "session is dead, recreating");
            let dead = sessions.remove(&key).expect("entry present");
            dead.close().await;
        }

        let session = UpstreamSession::start(def, false).await?;
        sessions.insert(key, Arc::clone(&session));
        tracing::info!(server = %def.name, session = %session.session_id(), "created upstream session");
        Ok(session)
    }

    /// Drop a session after a session-fatal error; the next call spawns
    /// fresh.
    pub async fn invalidate(&self, project_id: Uuid, server_name: &str) {
        let key: SessionKey = (project_id, server_name.to_string());
        let removed = self.sessions.lock().await.remove(&key);
        if let Some(session) = removed {
            tracing::info!(server = server_name, "invalidating upstream session");
            session.close().await;
        }
    }

    /// Force-recreate a session, for callers that hit persistent
    /// initialization failures.
    pub async fn recreate(&self, def: &UpstreamDef) -> UpstreamResult<Arc<UpstreamSession>> {
        self.invalidate(def.project_id, &def.name).await;
        self.get_or_create(def).await
    }

    /// Number of pooled sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Close every session whose idle time exceeds the timeout.
    pub async fn cleanup_expired(&self) -> usize {
        let expired: Vec<(SessionKey, Arc<UpstreamSession>)> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<SessionKey> = sessions
                .iter()
                .filter(|(_, s)| s.idle_for() > self.session_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| sessions.remove(&k).map(|s| (k, s)))
                .collect()
        };

        let count = expired.len();
        for ((_, server_name), session) in expired {
            tracing::info!(server = %server_name, "evicting idle upstream session");
            session.close().await;
        }
        count
    }

    /// Start the background eviction sweep.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.cleanup_interval);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = manager.cleanup_expired().await;
                if evicted > 0 {
                    tracing::debug!(count = evicted, "idle session sweep complete");
                }
            }
        });
        *self.cleanup.lock().expect("cleanup lock") = Some(handle);
    }

    /// Close all sessions and stop the sweep.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.cleanup.lock().expect("cleanup lock").take() {
            handle.abort();
        }
        let sessions: Vec<Arc<UpstreamSession>> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
        tracing::info!("session manager stopped");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("session_timeout", &self.session_timeout)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish()
    }
}

// Registry tests drive real `cat` children: the process stays alive reading
// stdin, which exercises the stdio liveness probe.
#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::stdio_upstream;

    fn fast_settings() -> Settings {
        Settings {
            session_timeout: std::time::Duration::from_millis(100),
            cleanup_interval: std::time::Duration::from_millis(20),
            ..Settings::for_testing()
        }
    }

    #[tokio::test]
    async fn test_reuses_live_session() {
        let manager = SessionManager::new(&Settings::for_testing());
        // `cat` stays alive reading stdin, so the session reports Ready.
        let def = stdio_upstream(Uuid::new_v4(), "echo", "cat", vec![]);

        let first = manager.get_or_create(&def).await.unwrap();
        let second = manager.get_or_create(&def).await.unwrap();
        assert_eq!(first.session_id(), second.session_id());
        assert_eq!(manager.session_count().await, 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_spawns_once() {
        let manager = Arc::new(SessionManager::new(&Settings::for_testing()));
        let def = stdio_upstream(Uuid::new_v4(), "echo", "cat", vec![]);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let def = def.clone();
                tokio::spawn(async move { manager.get_or_create(&def).await.unwrap() })
            })
            .collect();

        let mut ids = std::collections::HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap().session_id().to_string());
        }
        assert_eq!(ids.len(), 1);
        assert_eq!(manager.session_count().await, 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced() {
        let manager = SessionManager::new(&Settings::for_testing());
        let def = stdio_upstream(Uuid::new_v4(), "echo", "cat", vec![]);

        let first = manager.get_or_create(&def).await.unwrap();
        first.close().await;
        assert!(!first.is_alive());

        let second = manager.get_or_create(&def).await.unwrap();
        assert_ne!(first.session_id(), second.session_id());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_session() {
        let manager = SessionManager::new(&Settings::for_testing());
        let def = stdio_upstream(Uuid::new_v4(), "echo", "cat", vec![]);

        let first = manager.get_or_create(&def).await.unwrap();
        manager.invalidate(def.project_id, &def.name).await;
        assert_eq!(manager.session_count().await, 0);

        let second = manager.get_or_create(&def).await.unwrap();
        assert_ne!(first.session_id(), second.session_id());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_eviction() {
        let manager = Arc::new(SessionManager::new(&fast_settings()));
        manager.start_cleanup_task();
        let def = stdio_upstream(Uuid::new_v4(), "echo", "cat", vec![]);

        manager.get_or_create(&def).await.unwrap();
        assert_eq!(manager.session_count().await, 1);

        // Past the idle timeout, the sweep closes the session.
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        assert_eq!(manager.session_count().await, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_recently_used_session_survives_sweep() {
        let manager = Arc::new(SessionManager::new(&fast_settings()));
        manager.start_cleanup_task();
        let def = stdio_upstream(Uuid::new_v4(), "echo", "cat", vec![]);

        manager.get_or_create(&def).await.unwrap();
        for _ in 0..6 {
            tokio::time::sleep(std::time::Duration::from_millis(40)).await;
            // Touching through the registry keeps the session warm.
            manager.get_or_create(&def).await.unwrap();
        }
        assert_eq!(manager.session_count().await, 1);

        manager.shutdown().await;
    }
}
