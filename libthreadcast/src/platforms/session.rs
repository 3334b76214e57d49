//! Adapter-private session cache with single-flight refresh
//!
//! Each adapter owns one cache for its credential. Readers share the cached
//! session; when it is missing or stale exactly one caller runs the refresh
//! while the others wait on the refresh lock and then reuse its result.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::error::Result;

struct Slot<S> {
    current: Option<Arc<S>>,
    /// Last invalidated session, handed to the next refresh (it may still
    /// hold a usable refresh token)
    retired: Option<Arc<S>>,
}

pub struct SessionCache<S> {
    slot: RwLock<Slot<S>>,
    refresh_lock: Mutex<()>,
}

impl<S> Default for SessionCache<S> {
    fn default() -> Self {
        Self {
            slot: RwLock::new(Slot {
                current: None,
                retired: None,
            }),
            refresh_lock: Mutex::new(()),
        }
    }
}

impl<S: Send + Sync> SessionCache<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached session, fresh or not
    pub async fn current(&self) -> Option<Arc<S>> {
        self.slot.read().await.current.clone()
    }

    /// Return the cached session if `is_fresh` accepts it, otherwise refresh
    ///
    /// `refresh` receives the previous session (current or last invalidated)
    /// and is called at most once per stale generation, no matter how many
    /// callers arrive concurrently. A failed refresh leaves the cache as it
    /// was and the error goes to the caller that ran it.
    pub async fn get_or_refresh<F, Fut>(
        &self,
        is_fresh: impl Fn(&S) -> bool,
        refresh: F,
    ) -> Result<Arc<S>>
    where
        F: FnOnce(Option<Arc<S>>) -> Fut,
        Fut: Future<Output = Result<S>>,
    {
        if let Some(session) = self.current().await {
            if is_fresh(&session) {
                return Ok(session);
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Someone else may have refreshed while we waited for the lock
        let previous = {
            let slot = self.slot.read().await;
            if let Some(session) = &slot.current {
                if is_fresh(session) {
                    return Ok(Arc::clone(session));
                }
            }
            slot.current.clone().or_else(|| slot.retired.clone())
        };

        let session = Arc::new(refresh(previous).await?);

        let mut slot = self.slot.write().await;
        slot.current = Some(Arc::clone(&session));
        slot.retired = None;
        Ok(session)
    }

    /// Drop `stale` if it is still the cached session
    ///
    /// Comparison is by identity, so a late rejection of an old session can
    /// never discard a newer one. Returns whether anything was dropped.
    pub async fn invalidate(&self, stale: &Arc<S>) -> bool {
        let mut slot = self.slot.write().await;
        match &slot.current {
            Some(current) if Arc::ptr_eq(current, stale) => {
                slot.retired = slot.current.take();
                true
            }
            _ => false,
        }
    }
}
