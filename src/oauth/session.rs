//! Pending OAuth flows, at most one per provider.
//!
//! A session remembers what `complete_oauth_callback` needs to finish a flow:
//! the expected `state`, the PKCE verifier and the callback listener. Sessions
//! are replaced atomically ("last initiate wins") and removed by session id so
//! a completing old flow never clears a newer one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::OAuthCallbackServer;
use crate::error::{ProtocolError, Result};

/// One in-flight authorization-code flow
#[derive(Clone)]
pub struct PendingOAuthSession {
    pub id: Uuid,
    pub provider: String,
    pub state: String,
    pub code_verifier: Option<String>,
    pub redirect_uri: Option<String>,
    pub listener: Option<Arc<OAuthCallbackServer>>,
    pub created_at: DateTime<Utc>,
    /// Set once a completion has claimed the flow
    claimed: bool,
}

impl PendingOAuthSession {
    pub fn new(provider: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider: provider.into(),
            state: state.into(),
            code_verifier: None,
            redirect_uri: None,
            listener: None,
            created_at: Utc::now(),
            claimed: false,
        }
    }

    pub fn with_code_verifier(mut self, verifier: Option<String>) -> Self {
        self.code_verifier = verifier;
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: Option<String>) -> Self {
        self.redirect_uri = redirect_uri;
        self
    }

    pub fn with_listener(mut self, listener: Option<Arc<OAuthCallbackServer>>) -> Self {
        self.listener = listener;
        self
    }

    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.created_at > ttl
    }

    async fn stop_listener(&self) {
        if let Some(listener) = &self.listener {
            listener.stop().await;
        }
    }
}

impl std::fmt::Debug for PendingOAuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOAuthSession")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("redirect_uri", &self.redirect_uri)
            .field("has_listener", &self.listener.is_some())
            .field("claimed", &self.claimed)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Pending sessions keyed by normalized provider id
pub struct PendingOAuthSessions {
    sessions: Mutex<HashMap<String, PendingOAuthSession>>,
    ttl: Duration,
}

impl PendingOAuthSessions {
    /// # Arguments
    /// * `ttl` - How long an unfinished session stays valid
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Removes and stops the provider's session, if any.
    pub async fn take(&self, provider: &str) -> Option<PendingOAuthSession> {
        let session = self.sessions.lock().await.remove(provider)?;
        session.stop_listener().await;
        Some(session)
    }

    /// Inserts a session, stopping whatever session it displaces.
    ///
    /// Returns the displaced session's id.
    pub async fn insert(&self, session: PendingOAuthSession) -> Option<Uuid> {
        let previous = self
            .sessions
            .lock()
            .await
            .insert(session.provider.clone(), session);

        match previous {
            Some(previous) => {
                previous.stop_listener().await;
                Some(previous.id)
            }
            None => None,
        }
    }

    /// Clone of the provider's current session. Expired sessions are not returned.
    pub async fn get(&self, provider: &str) -> Option<PendingOAuthSession> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(provider)
            .filter(|s| !s.is_expired(Utc::now(), self.ttl))
            .cloned()
    }

    /// Claims the provider's session for completion.
    ///
    /// Only one caller can claim a session; later callers get `AlreadyAwaited`
    /// and the session and its listener are left untouched. A claimed session
    /// can still be replaced by a new initiate.
    pub async fn claim(&self, provider: &str) -> Result<PendingOAuthSession> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(provider)
            .filter(|s| !s.is_expired(Utc::now(), self.ttl))
            .ok_or_else(|| ProtocolError::NoPendingSession(provider.to_string()))?;

        if session.claimed {
            return Err(ProtocolError::AlreadyAwaited.into());
        }
        session.claimed = true;
        Ok(session.clone())
    }

    /// Removes the session only if it is still the one identified by `id`.
    ///
    /// The removed session's listener is stopped. Returns whether anything
    /// was removed.
    pub async fn remove_if_current(&self, provider: &str, id: Uuid) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(provider) {
                Some(current) if current.id == id => sessions.remove(provider),
                _ => None,
            }
        };

        match removed {
            Some(session) => {
                session.stop_listener().await;
                true
            }
            None => false,
        }
    }

    /// Drops sessions older than the TTL and stops their listeners.
    pub async fn prune_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<PendingOAuthSession> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_expired(now, self.ttl))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };

        for session in &expired {
            session.stop_listener().await;
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Pruned expired OAuth sessions");
        }
        expired.len()
    }

    /// Stops and removes every session.
    pub async fn stop_all(&self) {
        let drained: Vec<PendingOAuthSession> =
            self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.stop_listener().await;
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Providers with a pending session, sorted.
    pub async fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        providers.sort();
        providers
    }
}
