//! Process-wide map of live sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use folio_analysis::CancelToken;

/// Non-owning handle to a registered session connection.
#[derive(Clone)]
pub struct SessionHandle {
    epoch: u64,
    pub connected_at: DateTime<Utc>,
    /// Triggered to ask the connection to close (displacement, shutdown).
    pub close: CancelToken,
}

/// Shared registry mapping session id to its live connection handle.
///
/// Iteration works on a snapshot of the ids, so walking the registry never
/// blocks concurrent adds and removes.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, SessionHandle>>>,
    epochs: Arc<AtomicU64>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `session_id`. Returns the new handle plus
    /// the handle it displaced, if the id was already connected.
    pub fn register(&self, session_id: &str) -> (SessionHandle, Option<SessionHandle>) {
        let handle = SessionHandle {
            epoch: self.epochs.fetch_add(1, Ordering::Relaxed),
            connected_at: Utc::now(),
            close: CancelToken::new(),
        };
        let mut map = self.inner.write().expect("registry lock poisoned");
        let displaced = map.insert(session_id.to_string(), handle.clone());
        (handle, displaced)
    }

    /// Remove `session_id`, but only if it is still owned by `handle`.
    /// A connection displaced by a newer one must not tear the newer
    /// registration down.
    pub fn deregister(&self, session_id: &str, handle: &SessionHandle) {
        let mut map = self.inner.write().expect("registry lock poisoned");
        if map
            .get(session_id)
            .is_some_and(|current| current.epoch == handle.epoch)
        {
            map.remove(session_id);
        }
    }

    /// Stable snapshot of the currently registered ids.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let map = self.inner.read().expect("registry lock poisoned");
        map.keys().cloned().collect()
    }

    /// Ask every live connection to close (process teardown).
    pub fn close_all(&self) {
        let handles: Vec<SessionHandle> = {
            let map = self.inner.read().expect("registry lock poisoned");
            map.values().cloned().collect()
        };
        for handle in handles {
            handle.close.trigger();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_deregister() {
        let registry = SessionRegistry::new();
        let (handle, displaced) = registry.register("s-1-aaaa");
        assert!(displaced.is_none());
        assert_eq!(registry.ids(), vec!["s-1-aaaa"]);

        registry.deregister("s-1-aaaa", &handle);
        assert!(registry.is_empty());
    }

    #[test]
    fn reconnect_displaces_previous_handle() {
        let registry = SessionRegistry::new();
        let (old, _) = registry.register("s-1-aaaa");
        let (new, displaced) = registry.register("s-1-aaaa");
        assert!(displaced.is_some());
        assert_eq!(registry.len(), 1);

        // The displaced connection's late deregister must not remove the
        // newer registration.
        registry.deregister("s-1-aaaa", &old);
        assert_eq!(registry.len(), 1);
        registry.deregister("s-1-aaaa", &new);
        assert!(registry.is_empty());
    }
}
