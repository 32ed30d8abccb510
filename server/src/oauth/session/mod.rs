use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::{rngs::OsRng, RngCore as _};
use tracing::{debug, info};

use crate::errors::AuthError;
use crate::oauth::jwk::Claims;
use crate::oauth::token::TokenSet;

/// Opaque, unguessable session handle. The only thing the browser ever holds.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Enough to correlate log lines, not enough to hijack
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "SessionId({prefix}..)")
    }
}

/// Server-held record of a logged-in user
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub token_set: TokenSet,
    /// Identity claims from the verified ID token
    pub claims: Claims,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Sessions keyed by [`SessionId`].
///
/// Every operation touches a single entry, so there is no global lock; concurrent
/// requests for different sessions never contend.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<SessionId, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly exchanged token set and return the new id.
    ///
    /// The session lives exactly as long as its access token.
    pub fn create(&self, token_set: TokenSet, claims: Claims) -> SessionId {
        let id = SessionId::generate();
        let session = Session {
            id: id.clone(),
            expires_at: token_set.expires_at,
            token_set,
            claims,
            created_at: Utc::now(),
        };

        info!(session = ?id, sub = %session.claims.sub, "Session created");
        self.sessions.insert(id.clone(), session);
        id
    }

    /// The live session for `id`, if any. Expired sessions are evicted on sight.
    pub fn lookup(&self, id: &SessionId) -> Option<Session> {
        self.find(id).ok()
    }

    /// Like [`lookup`](Self::lookup) but says why there is no session
    pub fn find(&self, id: &SessionId) -> Result<Session, AuthError> {
        let session = self
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AuthError::Unauthorized("unknown session".to_string()))?;

        if session.is_expired(Utc::now()) {
            // Only evict the entry we saw; a concurrent refresh may have replaced it
            self.sessions
                .remove_if(id, |_, current| current.is_expired(Utc::now()));
            debug!(session = ?id, "Session expired");
            return Err(AuthError::SessionExpired);
        }

        Ok(session)
    }

    /// Forget a session. Unknown ids are ignored.
    pub fn invalidate(&self, id: &SessionId) -> Option<Session> {
        let removed = self.sessions.remove(id).map(|(_, session)| session);
        if removed.is_some() {
            info!(session = ?id, "Session invalidated");
        }
        removed
    }

    /// Swap in a refreshed token set, extending the session's lifetime.
    ///
    /// Fails if the session is gone; a refresh must not resurrect a logged-out session.
    pub fn replace_tokens(
        &self,
        id: &SessionId,
        token_set: TokenSet,
        claims: Option<Claims>,
    ) -> Result<Session, AuthError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| AuthError::Unauthorized("unknown session".to_string()))?;

        let session = entry.value_mut();
        session.expires_at = token_set.expires_at;
        session.token_set = token_set;
        if let Some(claims) = claims {
            session.claims = claims;
        }

        Ok(session.clone())
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
