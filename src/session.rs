use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;

use crate::api::TokenProvider;
use crate::cache::Clearable;
use crate::clock::Clock;
use crate::storage::{self, StoredSession};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("not signed in")]
    NotSignedIn,
    #[error("session expired; sign in again")]
    Expired,
}

/// Owns the signed-in user's token and every cache that must not outlive it.
pub struct SessionManager {
    store: Arc<storage::Store>,
    clock: Arc<dyn Clock>,
    current: RwLock<Option<StoredSession>>,
    caches: RwLock<Vec<Arc<dyn Clearable>>>,
}

impl SessionManager {
    pub fn new(store: Arc<storage::Store>, clock: Arc<dyn Clock>) -> Result<Self> {
        let current = store.load_session()?;
        Ok(Self {
            store,
            clock,
            current: RwLock::new(current),
            caches: RwLock::new(Vec::new()),
        })
    }

    pub fn register_cache(&self, cache: Arc<dyn Clearable>) {
        self.caches.write().push(cache);
    }

    pub fn login(
        &self,
        access_token: &str,
        email: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<StoredSession> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            bail!("session: access token required");
        }
        let session = StoredSession {
            access_token: access_token.to_string(),
            email: email.trim().to_string(),
            expires_at,
            created_at: self.now(),
        };
        self.store.save_session(&session)?;
        // cached data belongs to whoever was signed in before
        self.clear_caches();
        *self.current.write() = Some(session.clone());
        tracing::info!(email = %session.email, "signed in");
        Ok(session)
    }

    pub fn logout(&self) -> Result<()> {
        self.store.clear_session()?;
        *self.current.write() = None;
        self.clear_caches();
        tracing::info!("signed out");
        Ok(())
    }

    pub fn current(&self) -> Option<StoredSession> {
        self.current.read().clone()
    }

    pub fn active(&self) -> Result<StoredSession, SessionError> {
        let session = self.current().ok_or(SessionError::NotSignedIn)?;
        match session.expires_at {
            Some(expiry) if expiry <= self.now() => Err(SessionError::Expired),
            _ => Ok(session),
        }
    }

    fn clear_caches(&self) {
        for cache in self.caches.read().iter() {
            cache.clear_all();
        }
    }

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.clock.now_ms())
            .single()
            .unwrap_or_else(Utc::now)
    }
}

impl TokenProvider for SessionManager {
    fn token(&self) -> Result<Option<String>> {
        match self.active() {
            Ok(session) => Ok(Some(session.access_token)),
            Err(SessionError::NotSignedIn) => Ok(None),
            Err(SessionError::Expired) => {
                tracing::debug!("session expired");
                Ok(None)
            }
        }
    }
}
