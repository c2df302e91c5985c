//! Pooling of loaded model sessions, keyed by profile.
//!
//! Sessions are expensive (they hold a loaded model), so leases return
//! them to an idle bucket on drop instead of tearing them down. There
//! is no capacity cap; the worker pool bounds concurrency.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::Result;
use crate::profile::ModelProfile;
use crate::session::ModelSession;

/// Constructs a fresh session for a profile when the idle bucket is
/// empty. Typically wired to the model cache and inference backend.
pub type SessionFactory = Box<dyn Fn(ModelProfile) -> Result<ModelSession> + Send + Sync>;

pub struct SessionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buckets: Mutex<HashMap<ModelProfile, Vec<ModelSession>>>,
    factory: SessionFactory,
}

impl SessionPool {
    pub fn new(factory: SessionFactory) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buckets: Mutex::new(HashMap::new()),
                factory,
            }),
        }
    }

    /// Lease a session for `profile`, constructing one if no idle
    /// session exists. Factory errors bubble up and nothing is
    /// checked out.
    pub fn acquire(&self, profile: ModelProfile) -> Result<SessionLease> {
        let reused = self
            .inner
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&profile)
            .and_then(|bucket| bucket.pop());

        let session = match reused {
            Some(session) => session,
            None => (self.inner.factory)(profile)?,
        };

        Ok(SessionLease {
            pool: Arc::clone(&self.inner),
            profile,
            session: Some(session),
        })
    }
}

/// A leased session; returns to the profile's idle bucket when dropped.
pub struct SessionLease {
    pool: Arc<PoolInner>,
    profile: ModelProfile,
    session: Option<ModelSession>,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl Deref for SessionLease {
    type Target = ModelSession;

    fn deref(&self) -> &ModelSession {
        self.session.as_ref().expect("session present until drop")
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut ModelSession {
        self.session.as_mut().expect("session present until drop")
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool
                .buckets
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(self.profile)
                .or_default()
                .push(session);
        }
    }
}
