//! Supervised access to sessions shared between threads.
//!
//! A [`Session`] is single-threaded. Callers that need to hand one session to
//! several workers open it through a [`SessionManager`], which keeps it
//! behind `Arc<Mutex<..>>` so access is serialized.

use crate::{Session, SessionConfig};
use docmodel_core::{DocumentStore, Registry, SessionId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A shared, lock-protected session.
pub type SharedSession<S> = Arc<Mutex<Session<S>>>;

/// Opens sessions over one store and keeps them addressable by id.
pub struct SessionManager<S: DocumentStore + Clone> {
    store: S,
    registry: Arc<Registry>,
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionId, SharedSession<S>>>,
}

impl<S: DocumentStore + Clone> SessionManager<S> {
    pub fn new(store: S, registry: Arc<Registry>) -> Self {
        Self::with_config(store, registry, SessionConfig::default())
    }

    pub fn with_config(store: S, registry: Arc<Registry>, config: SessionConfig) -> Self {
        Self {
            store,
            registry,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a new session and register it.
    pub fn open(&self) -> (SessionId, SharedSession<S>) {
        let session = Session::with_config(
            self.store.clone(),
            Arc::clone(&self.registry),
            self.config.clone(),
        );
        let id = session.id();
        let shared = Arc::new(Mutex::new(session));
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(id, Arc::clone(&shared));
        tracing::debug!(session = id, open = sessions.len(), "Session registered");
        (id, shared)
    }

    pub fn get(&self, id: SessionId) -> Option<SharedSession<S>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(&id).cloned()
    }

    /// Unregister a session. Pending changes it still holds are not flushed.
    ///
    /// The map lock is released before the session lock is taken, so a worker
    /// holding its session may still call back into the manager.
    pub fn close(&self, id: SessionId) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        let Some(session) = removed else {
            return false;
        };
        let pending = session
            .lock()
            .map(|s| s.pending_counts().total())
            .unwrap_or_else(|e| e.into_inner().pending_counts().total());
        if pending > 0 {
            tracing::warn!(session = id, pending, "Closing session with unflushed changes");
        }
        true
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
