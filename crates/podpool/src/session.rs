//! Session boundary.
//!
//! Maps user-facing session ids to pool pods. The mapping lives in this
//! process only; the pods' ownership labels remain the source of truth.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::info;
use serde::Serialize;

use crate::error::{PoolError, PoolResult};
use crate::pod::{PodPhase, PoolState};
use crate::pool::ClusterPool;

/// A session bound to one pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub pod_id: String,
    pub environment: String,
    pub opened_at: DateTime<Utc>,
}

/// Opens, resolves and closes sessions on top of a [`ClusterPool`].
pub struct SessionManager {
    pool: Arc<ClusterPool>,
    sessions: DashMap<String, SessionRecord>,
}

impl SessionManager {
    pub fn new(pool: Arc<ClusterPool>) -> Self {
        Self {
            pool,
            sessions: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<ClusterPool> {
        &self.pool
    }

    /// Acquire a pod of `environment` and bind a new session to it.
    pub async fn open(&self, environment: Option<&str>) -> PoolResult<SessionRecord> {
        let pod = self.pool.acquire(environment).await?;
        let record = SessionRecord {
            id: format!("ses_{}", uuid::Uuid::new_v4().simple()),
            environment: pod
                .environment()
                .unwrap_or(self.pool.registry().default_id())
                .to_string(),
            pod_id: pod.id,
            opened_at: Utc::now(),
        };
        info!("opened session {} on pod {}", record.id, record.pod_id);
        self.sessions.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, session_id: &str) -> PoolResult<SessionRecord> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PoolError::UnknownSession(session_id.to_string()))
    }

    /// Base URL requests for the session should be proxied to.
    pub async fn url(&self, session_id: &str) -> PoolResult<String> {
        let record = self.get(session_id)?;
        self.pool.resolve(&record.pod_id).await
    }

    /// Phase of the session's pod.
    pub async fn status(&self, session_id: &str) -> PoolResult<PodPhase> {
        let record = self.get(session_id)?;
        self.pool.status(&record.pod_id).await
    }

    /// Forget the session and delete its pod.
    pub async fn close(&self, session_id: &str) -> PoolResult<()> {
        let (_, record) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| PoolError::UnknownSession(session_id.to_string()))?;
        self.pool.stop(&record.pod_id).await;
        info!("closed session {}", record.id);
        Ok(())
    }

    /// Open sessions, oldest first.
    pub fn list(&self) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    /// Drop sessions whose pods have finished or were reclaimed.
    pub async fn prune(&self) -> usize {
        let mut stale = Vec::new();
        for record in self.list() {
            match self.pool.get(&record.pod_id).await {
                Ok(pod) if pod.phase.is_terminal() || pod.pool() == Some(PoolState::Deleting) => {
                    stale.push(record.id)
                }
                Err(e) if e.is_not_found() => stale.push(record.id),
                _ => {}
            }
        }
        for id in &stale {
            self.sessions.remove(id);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::PoolConfig;

    fn manager() -> (Arc<MemoryBackend>, SessionManager) {
        let backend = Arc::new(MemoryBackend::new());
        let pool = ClusterPool::new(backend.clone(), PoolConfig::default()).unwrap();
        (backend, SessionManager::new(Arc::new(pool)))
    }

    #[tokio::test]
    async fn test_open_resolve_close() {
        let (backend, sessions) = manager();

        let record = sessions.open(Some("alpine")).await.unwrap();
        assert_eq!(record.environment, "alpine");
        assert!(sessions.url(&record.id).await.unwrap().starts_with("http://"));
        assert_eq!(sessions.status(&record.id).await.unwrap(), PodPhase::Running);
        assert_eq!(sessions.list(), vec![record.clone()]);

        sessions.close(&record.id).await.unwrap();
        assert!(backend.pods().is_empty());
        assert!(sessions.list().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (_, sessions) = manager();
        assert!(matches!(
            sessions.url("ses_nope").await,
            Err(PoolError::UnknownSession(_))
        ));
        assert!(matches!(
            sessions.close("ses_nope").await,
            Err(PoolError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_prune_drops_finished_sessions() {
        let (backend, sessions) = manager();
        let kept = sessions.open(None).await.unwrap();
        let finished = sessions.open(None).await.unwrap();

        backend.set_phase(&finished.pod_id, PodPhase::Succeeded);
        // The cache may still hold the pod as running
        sessions.pool().refresh().await.unwrap();

        assert_eq!(sessions.prune().await, 1);
        assert_eq!(sessions.list(), vec![kept]);
    }
}
