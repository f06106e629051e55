use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use caseforge_core::error::{CaseforgeError, Result};
use caseforge_core::traits::SessionStore;
use caseforge_core::types::{SessionId, SessionSummary, StateRecord};

/// Process-local session store. Used when persistence is disabled and in tests.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, StateRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, StateRecord>>> {
        self.sessions
            .lock()
            .map_err(|e| CaseforgeError::Persistence(e.to_string()))
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, state: &StateRecord) -> BoxFuture<'_, Result<()>> {
        let state = state.clone();
        Box::pin(async move {
            self.lock()?.insert(state.session_id().clone(), state);
            Ok(())
        })
    }

    fn load(&self, session_id: &SessionId) -> BoxFuture<'_, Result<StateRecord>> {
        let id = session_id.clone();
        Box::pin(async move {
            self.lock()?
                .get(&id)
                .cloned()
                .ok_or_else(|| CaseforgeError::SessionNotFound(id.0.clone()))
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<SessionSummary>>> {
        Box::pin(async move {
            let mut summaries: Vec<SessionSummary> =
                self.lock()?.values().map(SessionSummary::from).collect();
            summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(summaries)
        })
    }

    fn delete(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>> {
        let id = session_id.clone();
        Box::pin(async move { Ok(self.lock()?.remove(&id).is_some()) })
    }

    fn cleanup_expired(&self, cutoff: DateTime<Utc>) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let mut sessions = self.lock()?;
            let before = sessions.len();
            sessions.retain(|_, state| state.updated_at >= cutoff);
            Ok(before - sessions.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseforge_test_utils::encryption_document;

    #[tokio::test]
    async fn test_roundtrip_and_list_order() {
        let store = MemorySessionStore::new();
        let mut first = StateRecord::new(vec![encryption_document()], []);
        first.updated_at = Utc::now() - chrono::Duration::minutes(5);
        let second = StateRecord::new(vec![encryption_document()], []);
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        assert_eq!(store.load(first.session_id()).await.unwrap(), first);
        let listed = store.list().await.unwrap();
        assert_eq!(&listed[0].session_id, second.session_id());
    }

    #[tokio::test]
    async fn test_cleanup_and_delete() {
        let store = MemorySessionStore::new();
        let mut stale = StateRecord::new(vec![], []);
        stale.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.save(&stale).await.unwrap();

        assert_eq!(store.cleanup_expired(Utc::now() - chrono::Duration::hours(1)).await.unwrap(), 1);
        assert!(matches!(
            store.load(stale.session_id()).await,
            Err(CaseforgeError::SessionNotFound(_))
        ));
        assert!(!store.delete(stale.session_id()).await.unwrap());
    }
}
