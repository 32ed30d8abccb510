use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;

/// How long a login may sit at the IdP before its pending entry is dropped
pub const PENDING_LOGIN_TTL_MINUTES: i64 = 10;

/// A login that has been sent to the IdP and not yet come back
#[derive(Clone)]
pub struct PendingAuthorization {
    pub state: String,
    /// PKCE verifier. Stays on the backend; only its challenge leaves.
    pub verifier: String,
    pub challenge: String,
    pub redirect_uri: String,
    /// Local path to land on once the session exists
    pub return_to: String,
    pub created_at: DateTime<Utc>,
}

impl PendingAuthorization {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at > Duration::minutes(PENDING_LOGIN_TTL_MINUTES)
    }
}

/// Backend-side store of in-flight logins, keyed by `state`
#[derive(Clone, Default)]
pub struct PendingStore {
    entries: Arc<DashMap<String, PendingAuthorization>>,
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pending: PendingAuthorization) {
        self.entries.insert(pending.state.clone(), pending);
    }

    /// Remove and return the entry for `state`.
    ///
    /// The entry is removed even when it turns out to be expired, so a `state` can be
    /// presented successfully at most once. Concurrent callers race on the removal and
    /// exactly one of them wins.
    pub fn take(&self, state: &str) -> Option<PendingAuthorization> {
        let (_, pending) = self.entries.remove(state)?;

        if pending.is_expired(Utc::now()) {
            debug!("Pending login expired before the callback arrived");
            return None;
        }

        Some(pending)
    }

    /// Drop entries whose TTL has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, pending| !pending.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
