//! Cache of authenticated Proxmox sessions.
//!
//! Keyed by endpoint and credential identity. With a zero TTL nothing is
//! cached and every reconciliation mints a fresh session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::pve::{Credentials, Endpoint, PveError, Session};

#[derive(Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    endpoint: Endpoint,
    identity: String,
}

impl SessionKey {
    fn new(endpoint: &Endpoint, credentials: &Credentials) -> Self {
        Self {
            endpoint: endpoint.clone(),
            identity: credentials.identity().to_string(),
        }
    }
}

struct CachedSession {
    session: Arc<Session>,
    credentials: Credentials,
    minted_at: Instant,
}

/// Sessions shared across reconciliations of the same endpoint.
pub struct SessionCache {
    ttl: Duration,
    entries: Mutex<HashMap<SessionKey, CachedSession>>,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// A cache that never holds a session.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Return a live cached session or authenticate a new one.
    ///
    /// The lock is not held while authenticating, so two callers may race
    /// to mint a session for the same key; the last one wins.
    pub async fn get_or_connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<Session>, PveError> {
        if !self.is_enabled() {
            return Session::connect(endpoint, credentials).await.map(Arc::new);
        }

        let key = SessionKey::new(endpoint, credentials);
        {
            let entries = self.entries.lock().await;
            if let Some(cached) = entries.get(&key) {
                // A changed password invalidates the cached session.
                if cached.credentials == *credentials && cached.minted_at.elapsed() < self.ttl {
                    debug!(endpoint = %endpoint.url, "Reusing cached Proxmox session");
                    return Ok(Arc::clone(&cached.session));
                }
            }
        }

        let session = Arc::new(Session::connect(endpoint, credentials).await?);
        self.entries.lock().await.insert(
            key,
            CachedSession {
                session: Arc::clone(&session),
                credentials: credentials.clone(),
                minted_at: Instant::now(),
            },
        );
        Ok(session)
    }

    /// Drop `session` if it is still the cached one for this endpoint and
    /// identity. A session minted since then is kept.
    pub async fn invalidate(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        session: &Arc<Session>,
    ) {
        let key = SessionKey::new(endpoint, credentials);
        let mut entries = self.entries.lock().await;
        if entries
            .get(&key)
            .is_some_and(|cached| Arc::ptr_eq(&cached.session, session))
        {
            entries.remove(&key);
            debug!(endpoint = %endpoint.url, "Invalidated cached Proxmox session");
        }
    }
}
