//! Registry of active sessions by user identity

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::envelope::UserId;
use crate::core::session::Session;
use crate::error::{Result, SignalError};

/// Maps each connected user to their live session
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<UserId, Arc<Session>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any earlier one for the same user.
    ///
    /// The superseded session is returned; the caller must close it.
    pub async fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let mut clients = self.clients.write().await;
        clients
            .insert(session.user_id(), session.clone())
            .filter(|previous| !previous.is_same(&session))
    }

    /// Register a session only if the user has no active one
    pub async fn register_unique(&self, session: Arc<Session>) -> Result<()> {
        let mut clients = self.clients.write().await;
        let user_id = session.user_id();
        if clients.contains_key(&user_id) {
            return Err(SignalError::DuplicateSession(user_id));
        }
        clients.insert(user_id, session);
        Ok(())
    }

    /// Remove the session's entry if it is still the registered one
    pub async fn unregister(&self, session: &Session) -> bool {
        let mut clients = self.clients.write().await;
        let owned = clients
            .get(&session.user_id())
            .map_or(false, |current| current.is_same(session));
        if owned {
            clients.remove(&session.user_id());
        }
        owned
    }

    pub async fn lookup(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.clients.read().await.get(&user_id).cloned()
    }

    /// Point-in-time copy of every registered session
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}
