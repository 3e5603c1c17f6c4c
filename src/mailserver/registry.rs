// Registry of identities with a live session
//
// Keeps both directions of the mapping: identity → session (presence and
// eviction) and session id → identity (cleanup on disconnect). At most one
// session is registered per identity; a newer login evicts the older one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A registered session
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: Uuid,
    pub identity: String,
    pub peer: Option<SocketAddr>,
    pub connected_at: SystemTime,
    cancel: CancellationToken,
}

impl SessionEntry {
    /// Ask the owning session task to end
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Result of registering a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub session_id: Uuid,
    /// Session that held the identity before and has been cancelled
    pub evicted: Option<Uuid>,
}

#[derive(Debug, Default)]
struct RegistryState {
    by_identity: HashMap<String, SessionEntry>,
    by_session: HashMap<Uuid, String>,
}

/// Manages all logged-in sessions
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for `identity`. The session ends when `cancel` fires.
    pub async fn register(
        &self,
        identity: &str,
        peer: Option<SocketAddr>,
        cancel: CancellationToken,
    ) -> Registration {
        let entry = SessionEntry {
            id: Uuid::new_v4(),
            identity: identity.to_string(),
            peer,
            connected_at: SystemTime::now(),
            cancel,
        };
        let session_id = entry.id;

        let mut state = self.state.write().await;

        let mut evicted = None;
        if let Some(previous) = state.by_identity.insert(identity.to_string(), entry) {
            state.by_session.remove(&previous.id);
            previous.cancel();
            evicted = Some(previous.id);
        }
        state.by_session.insert(session_id, identity.to_string());

        match evicted {
            Some(old) => tracing::info!(
                "User {} logged in again (session {}), evicting session {}",
                identity,
                session_id,
                old
            ),
            None => tracing::info!("User {} logged in (session {})", identity, session_id),
        }

        Registration {
            session_id,
            evicted,
        }
    }

    /// Remove a session. Returns `false` if it was not (or no longer) registered,
    /// e.g. because a newer login for the same identity replaced it.
    pub async fn unregister(&self, session_id: Uuid) -> bool {
        let mut state = self.state.write().await;

        let Some(identity) = state.by_session.remove(&session_id) else {
            return false;
        };

        if state
            .by_identity
            .get(&identity)
            .is_some_and(|entry| entry.id == session_id)
        {
            state.by_identity.remove(&identity);
        }

        tracing::info!("User {} has quit (session {})", identity, session_id);
        true
    }

    /// Whether `identity` currently has a live session
    pub async fn is_online(&self, identity: &str) -> bool {
        let state = self.state.read().await;
        state.by_identity.contains_key(identity)
    }

    /// Identity owning a session
    pub async fn identity_of(&self, session_id: Uuid) -> Option<String> {
        let state = self.state.read().await;
        state.by_session.get(&session_id).cloned()
    }

    /// The live session of an identity
    pub async fn session_of(&self, identity: &str) -> Option<SessionEntry> {
        let state = self.state.read().await;
        state.by_identity.get(identity).cloned()
    }

    /// All identities with a live session, sorted
    pub async fn online_identities(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut identities: Vec<String> = state.by_identity.keys().cloned().collect();
        identities.sort();
        identities
    }

    /// Get number of registered sessions
    pub async fn session_count(&self) -> usize {
        let state = self.state.read().await;
        state.by_session.len()
    }

    /// Cancel every registered session
    pub async fn cancel_all(&self) {
        let state = self.state.read().await;
        for entry in state.by_identity.values() {
            entry.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = ConnectionRegistry::new();

        let reg = registry
            .register("a@x", None, CancellationToken::new())
            .await;
        assert_eq!(reg.evicted, None);
        assert!(registry.is_online("a@x").await);
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.identity_of(reg.session_id).await.as_deref(), Some("a@x"));

        assert!(registry.unregister(reg.session_id).await);
        assert!(!registry.is_online("a@x").await);
        assert_eq!(registry.session_count().await, 0);

        // Second unregister is a no-op
        assert!(!registry.unregister(reg.session_id).await);
    }

    #[tokio::test]
    async fn test_second_login_evicts_first() {
        let registry = ConnectionRegistry::new();

        let first_token = CancellationToken::new();
        let first = registry.register("a@x", None, first_token.clone()).await;

        let second_token = CancellationToken::new();
        let second = registry.register("a@x", None, second_token.clone()).await;

        assert_eq!(second.evicted, Some(first.session_id));
        assert!(first_token.is_cancelled());
        assert!(!second_token.is_cancelled());
        assert_eq!(registry.session_count().await, 1);

        // The evicted session's cleanup must not remove its successor
        assert!(!registry.unregister(first.session_id).await);
        assert_eq!(
            registry.session_of("a@x").await.map(|e| e.id),
            Some(second.session_id)
        );

        assert!(registry.unregister(second.session_id).await);
        assert!(!registry.is_online("a@x").await);
    }

    #[tokio::test]
    async fn test_online_identities_and_cancel_all() {
        let registry = ConnectionRegistry::new();
        let tokens: Vec<CancellationToken> = (0..3).map(|_| CancellationToken::new()).collect();

        for (identity, token) in ["c@x", "a@x", "b@x"].iter().zip(&tokens) {
            registry.register(identity, None, token.clone()).await;
        }

        assert_eq!(registry.online_identities().await, vec!["a@x", "b@x", "c@x"]);

        registry.cancel_all().await;
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }
}
