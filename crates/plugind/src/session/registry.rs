//! Session registry.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Session, SessionCache, SessionError, SessionInfo, SessionPayload};

/// Maps session IDs to live sessions.
///
/// The in-memory map is authoritative for sessions opened by this process;
/// the optional cache is written through and consulted on lookup misses
/// unless the caller passes `ignore_cache`. Cheap to clone.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

#[derive(Default)]
pub(super) struct Inner {
    sessions: DashMap<String, Arc<Session>>,
    cache: Option<Arc<dyn SessionCache>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache: Arc<dyn SessionCache>) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: DashMap::new(),
                cache: Some(cache),
            }),
        }
    }

    pub(super) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Open a session with a fresh ID.
    ///
    /// If the cache write fails the session is not registered.
    pub async fn create(
        &self,
        payload: SessionPayload,
        ignore_cache: bool,
    ) -> Result<Arc<Session>, SessionError> {
        let info = SessionInfo {
            id: Uuid::new_v4().to_string(),
            payload,
        };

        if !ignore_cache && let Some(cache) = &self.inner.cache {
            cache.store(&info).await?;
        }

        let session = Arc::new(Session::new(info, Arc::downgrade(&self.inner)));
        self.inner
            .sessions
            .insert(session.id().to_string(), session.clone());
        debug!(
            session_id = %session.id(),
            plugin = %session.payload().plugin_identity,
            "Session created"
        );
        Ok(session)
    }

    /// Look a session up, falling back to the cache for sessions opened
    /// elsewhere. A session restored from the cache has no runtime bound.
    pub async fn get(
        &self,
        id: &str,
        ignore_cache: bool,
    ) -> Result<Option<Arc<Session>>, SessionError> {
        if let Some(session) = self.inner.sessions.get(id) {
            return Ok(Some(session.clone()));
        }
        if ignore_cache {
            return Ok(None);
        }
        let Some(cache) = &self.inner.cache else {
            return Ok(None);
        };

        Ok(cache
            .load(id)
            .await?
            .map(|info| Arc::new(Session::new(info, Arc::downgrade(&self.inner)))))
    }

    /// Remove a session. Closing an unknown ID is a no-op.
    pub async fn close(&self, id: &str, ignore_cache: bool) -> Option<Arc<Session>> {
        let removed = self.inner.sessions.remove(id).map(|(_, session)| session);
        if let Some(session) = &removed {
            session.mark_closed();
        }

        if !ignore_cache && let Some(cache) = &self.inner.cache {
            if let Err(e) = cache.delete(id).await {
                warn!(session_id = %id, error = %e, "Failed to delete cached session");
            }
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugind_protocol::EventStream;
    use crate::session::tests::{RecordingRuntime, payload};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryCache {
        entries: Mutex<HashMap<String, SessionInfo>>,
        fail_store: bool,
    }

    #[async_trait]
    impl SessionCache for MemoryCache {
        async fn store(&self, info: &SessionInfo) -> Result<(), SessionError> {
            if self.fail_store {
                return Err(SessionError::Cache("unavailable".into()));
            }
            self.entries
                .lock()
                .unwrap()
                .insert(info.id.clone(), info.clone());
            Ok(())
        }

        async fn load(&self, id: &str) -> Result<Option<SessionInfo>, SessionError> {
            Ok(self.entries.lock().unwrap().get(id).cloned())
        }

        async fn delete(&self, id: &str) -> Result<(), SessionError> {
            self.entries.lock().unwrap().remove(id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn create_get_close() {
        let registry = SessionRegistry::new();
        let a = registry.create(payload(), true).await.unwrap();
        let b = registry.create(payload(), true).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);

        let found = registry.get(a.id(), true).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&found, &a));

        assert!(registry.close(a.id(), true).await.is_some());
        assert!(registry.close(a.id(), true).await.is_none());
        assert!(registry.get(a.id(), true).await.unwrap().is_none());
        assert!(a.is_closed());
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn cache_is_written_through_and_consulted() {
        let cache = Arc::new(MemoryCache::default());
        let registry = SessionRegistry::with_cache(cache.clone());
        let session = registry.create(payload(), false).await.unwrap();
        assert!(cache.entries.lock().unwrap().contains_key(session.id()));

        // Another registry sharing the cache resolves it without a runtime.
        let other = SessionRegistry::with_cache(cache.clone());
        let restored = other.get(session.id(), false).await.unwrap().unwrap();
        assert_eq!(restored.id(), session.id());
        assert!(restored.runtime().is_none());
        assert!(other.get(session.id(), true).await.unwrap().is_none());

        registry.close(session.id(), false).await;
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn closing_restored_session_rejects_writes() {
        let cache = Arc::new(MemoryCache::default());
        let registry = SessionRegistry::with_cache(cache.clone());
        let session = registry.create(payload(), false).await.unwrap();

        let other = SessionRegistry::with_cache(cache.clone());
        let restored = other.get(session.id(), false).await.unwrap().unwrap();
        restored.bind_runtime(Arc::new(RecordingRuntime::new()));

        restored.close(false).await;
        assert!(restored.is_closed());
        assert!(matches!(
            restored
                .write(EventStream::Request, &restored.payload().access_action, "x")
                .await,
            Err(SessionError::Closed(_))
        ));
        assert!(cache.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_cache_write_does_not_register() {
        let cache = Arc::new(MemoryCache {
            fail_store: true,
            ..MemoryCache::default()
        });
        let registry = SessionRegistry::with_cache(cache);

        assert!(matches!(
            registry.create(payload(), false).await,
            Err(SessionError::Cache(_))
        ));
        assert!(registry.is_empty());
        assert!(registry.create(payload(), true).await.is_ok());
    }

    #[tokio::test]
    async fn registries_are_independent() {
        let one = SessionRegistry::new();
        let two = SessionRegistry::new();
        let session = one.create(payload(), true).await.unwrap();
        assert!(!two.contains(session.id()));
    }
}
