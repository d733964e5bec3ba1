//! Session registry: document name → live [`Session`].
//!
//! The registry is the single registrar for sessions. Creation happens
//! lazily under the write lock (double-checked, so concurrent admissions for
//! the same name share one session). Destruction only happens through idle
//! reclamation:
//!
//! ```text
//! last connection leaves ──► schedule_reclaim() ──► sleep(idle_timeout)
//!                                   ▲                     │
//!      re-join: attach() aborts ────┘                     ▼
//!                                            reclaim(): same session?
//!                                                       still empty?
//!                                                       epoch unchanged?
//!                                                        └─► close + remove
//! ```
//!
//! Lock order is always registry, then session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::session::{Session, SessionState};

/// Maps document names to sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    idle_timeout: Duration,
    broadcast_capacity: usize,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration, broadcast_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
            broadcast_capacity,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Get or lazily create the session for `name`.
    pub async fn get_or_create(&self, name: &str) -> Arc<Session> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(name) {
                return session.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(name) {
            return session.clone();
        }

        let session = Arc::new(Session::new(name, self.broadcast_capacity));
        sessions.insert(name.to_string(), session.clone());
        log::info!("Session {name} created ({} live)", sessions.len());
        session
    }

    /// Look up a live session without creating it.
    pub async fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Destroy the session for `name` if it has no connections right now.
    pub async fn remove(&self, name: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get(name).cloned() else {
            return false;
        };
        let mut state = session.lock().await;
        if state.connection_count() > 0 {
            return false;
        }
        state.close();
        sessions.remove(name);
        log::info!("Session {name} removed");
        true
    }

    /// Arm the idle timer for an empty session.
    ///
    /// Call with the session lock held, right after the last connection
    /// detached. Any earlier timer is replaced.
    pub fn schedule_reclaim(self: &Arc<Self>, session: &Arc<Session>, state: &mut SessionState) {
        let epoch = state.reclaim_epoch();
        let registry = Arc::clone(self);
        let target = Arc::clone(session);
        let idle = self.idle_timeout;

        let task = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            registry.reclaim(&target, epoch).await;
        });
        state.arm_reclaim(task.abort_handle());
        log::debug!(
            "Session {} idle, reclaiming in {:?}",
            session.name(),
            self.idle_timeout
        );
    }

    /// Timer body. Idempotent: a session that was rejoined, already
    /// destroyed, or replaced by a fresh one under the same name is left
    /// alone.
    async fn reclaim(&self, session: &Arc<Session>, epoch: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(session.name()) {
            Some(current) if Arc::ptr_eq(current, session) => {}
            _ => return false,
        }

        let mut state = session.lock().await;
        if state.is_closed() || state.connection_count() > 0 || state.reclaim_epoch() != epoch {
            return false;
        }
        state.close();
        sessions.remove(session.name());
        log::info!(
            "Session {} reclaimed after {:?} idle ({} live)",
            session.name(),
            self.idle_timeout,
            sessions.len()
        );
        true
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Names of all live sessions, sorted.
    pub async fn active_documents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Channel, ConnectionId};

    fn registry(idle_secs: u64) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(Duration::from_secs(idle_secs), 16))
    }

    #[tokio::test]
    async fn test_get_or_create_same_session() {
        let registry = registry(60);
        let a = registry.get_or_create("schedule-cs-100-fall").await;
        let b = registry.get_or_create("schedule-cs-100-fall").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create() {
        let registry = registry(60);
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.get_or_create("doc").await }));
        }
        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap());
        }
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_documents_isolated() {
        let registry = registry(60);
        let a = registry.get_or_create("a").await;
        let b = registry.get_or_create("b").await;
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.active_documents().await, vec!["a", "b"]);
        assert!(registry.get("c").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_only_when_empty() {
        let registry = registry(60);
        let session = registry.get_or_create("doc").await;
        let conn = ConnectionId::new();
        session.lock().await.attach(conn, Channel::Crdt);

        assert!(!registry.remove("doc").await);
        assert_eq!(registry.session_count().await, 1);

        session.lock().await.detach(conn);
        assert!(registry.remove("doc").await);
        assert!(session.lock().await.is_closed());
        assert!(!registry.remove("doc").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_after_idle_window() {
        let registry = registry(60);
        let session = registry.get_or_create("doc").await;
        {
            let mut state = session.lock().await;
            registry.schedule_reclaim(&session, &mut state);
        }

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(registry.session_count().await, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(registry.session_count().await, 0);
        assert!(session.lock().await.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_cancels_reclaim() {
        let registry = registry(60);
        let session = registry.get_or_create("doc").await;
        {
            let mut state = session.lock().await;
            state.doc.set_cell("R1C1", "kept");
            registry.schedule_reclaim(&session, &mut state);
        }

        tokio::time::sleep(Duration::from_secs(30)).await;
        session.lock().await.attach(ConnectionId::new(), Channel::Crdt);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(session.lock().await.doc.cell("R1C1").as_deref(), Some("kept"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_ignores_new_session() {
        let registry = registry(60);
        let old = registry.get_or_create("doc").await;
        let epoch = old.lock().await.reclaim_epoch();

        assert!(registry.remove("doc").await);
        let fresh = registry.get_or_create("doc").await;

        // A timer for the destroyed session must not touch its replacement.
        assert!(!registry.reclaim(&old, epoch).await);
        assert!(Arc::ptr_eq(&registry.get("doc").await.unwrap(), &fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_twice_is_noop() {
        let registry = registry(60);
        let session = registry.get_or_create("doc").await;
        let epoch = session.lock().await.reclaim_epoch();
        assert!(registry.reclaim(&session, epoch).await);
        assert!(!registry.reclaim(&session, epoch).await);
        assert_eq!(registry.session_count().await, 0);
    }
}
