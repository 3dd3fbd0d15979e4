//! Device id → live session. A device has at most one session; registering a
//! new one evicts the old.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::core::mcp::SessionCloser;

/// What the registry needs from a session.
#[async_trait::async_trait]
pub trait ManagedSession: Send + Sync {
    fn device_id(&self) -> &str;

    /// Cancel the session scope without waiting for teardown.
    fn cancel(&self);

    /// Cancel and close the underlying transport.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

fn same_session(a: &Arc<dyn ManagedSession>, b: &Arc<dyn ManagedSession>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<dyn ManagedSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert `session`, evicting any previous session of the same device.
    /// The evicted session's scope is cancelled before this returns; its
    /// transport is closed in the background.
    pub fn register(&self, session: Arc<dyn ManagedSession>) {
        let device_id = session.device_id().to_string();
        let previous = self.sessions.write().insert(device_id.clone(), Arc::clone(&session));

        if let Some(previous) = previous.filter(|p| !same_session(p, &session)) {
            warn!(device_id = %device_id, "Device already has a session, closing the old one");
            previous.cancel();
            tokio::spawn(async move { previous.close().await });
        }
        info!(device_id = %device_id, "Session registered");
    }

    /// Remove the entry only if it still refers to `session`.
    pub fn unregister_session(&self, session: &Arc<dyn ManagedSession>) -> bool {
        let mut sessions = self.sessions.write();
        let matches = sessions
            .get(session.device_id())
            .is_some_and(|current| same_session(current, session));
        if matches {
            sessions.remove(session.device_id());
            info!(device_id = %session.device_id(), "Session unregistered");
        }
        matches
    }

    pub fn unregister(&self, device_id: &str) -> Option<Arc<dyn ManagedSession>> {
        let removed = self.sessions.write().remove(device_id);
        if removed.is_some() {
            info!(device_id = %device_id, "Session unregistered");
        }
        removed
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<dyn ManagedSession>> {
        self.sessions.read().get(device_id).cloned()
    }

    /// Close and forget the device's session. Idempotent.
    pub async fn close(&self, device_id: &str) -> bool {
        match self.unregister(device_id) {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionCloser for SessionRegistry {
    fn close_session(&self, device_id: &str) -> bool {
        let Some(session) = self.unregister(device_id) else {
            return false;
        };
        session.cancel();
        tokio::spawn(async move { session.close().await });
        true
    }
}
