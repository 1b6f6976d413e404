//! Session ID to state map shared by all connections

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::state::SessionState;
use crate::{Error, Result};

/// Registry of live sessions
///
/// Removal is the single point that decides which teardown trigger wins:
/// only the caller that gets `Some` back from [`Self::remove`] releases the
/// session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionState>>>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session unless `limit` sessions are already registered
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionLimit` when full
    pub async fn insert(&self, state: Arc<SessionState>, limit: usize) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.len() >= limit {
            return Err(Error::SessionLimit(sessions.len()));
        }
        sessions.insert(state.id().to_string(), state);
        Ok(())
    }

    /// Get a session by ID
    pub async fn get(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove a session, returning it if this call removed it
    pub async fn remove(&self, id: &str) -> Option<Arc<SessionState>> {
        self.sessions.write().await.remove(id)
    }

    /// IDs of all registered sessions
    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// All registered sessions
    pub async fn list(&self) -> Vec<Arc<SessionState>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ClientChannel;

    fn session(id: &str) -> Arc<SessionState> {
        let (client, _rx) = ClientChannel::bounded(1);
        Arc::new(SessionState::new(id.to_string(), client))
    }

    #[tokio::test]
    async fn remove_succeeds_once() {
        let registry = SessionRegistry::new();
        registry.insert(session("a"), 8).await.unwrap();

        assert!(registry.remove("a").await.is_some());
        assert!(registry.remove("a").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn insert_respects_limit() {
        let registry = SessionRegistry::new();
        registry.insert(session("a"), 1).await.unwrap();

        let err = registry.insert(session("b"), 1).await.unwrap_err();
        assert!(matches!(err, Error::SessionLimit(1)));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_removal_has_one_winner() {
        let registry = Arc::new(SessionRegistry::new());
        registry.insert(session("a"), 8).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.remove("a").await.is_some() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
