//! Session registry - indexes registered users by connection id and by name

use super::{RegistrationError, SessionId, UserSession};
use crate::server::ClientConnection;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Both indices live behind one lock so they can never disagree
#[derive(Default)]
struct Indices {
    by_id: HashMap<SessionId, Arc<UserSession>>,
    by_name: HashMap<String, Arc<UserSession>>,
}

/// Registry of all registered users
#[derive(Default)]
pub struct SessionRegistry {
    indices: RwLock<Indices>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user under `name`
    ///
    /// The caller is responsible for telling the client how it went.
    pub async fn register(
        &self,
        id: SessionId,
        name: &str,
        connection: ClientConnection,
    ) -> Result<Arc<UserSession>, RegistrationError> {
        if name.is_empty() {
            return Err(RegistrationError::EmptyName);
        }

        let mut indices = self.indices.write().await;

        if let Some(existing) = indices.by_id.get(&id) {
            return Err(RegistrationError::AlreadyRegistered(
                existing.name().to_string(),
            ));
        }
        if indices.by_name.contains_key(name) {
            return Err(RegistrationError::NameTaken(name.to_string()));
        }

        let session = Arc::new(UserSession::new(id, name.to_string(), connection));
        indices.by_id.insert(id, Arc::clone(&session));
        indices.by_name.insert(name.to_string(), Arc::clone(&session));

        tracing::info!("Registered user '{}' on connection {}", name, id);
        Ok(session)
    }

    /// Remove a session from both indices; absent ids are ignored
    pub async fn unregister(&self, id: &SessionId) -> Option<Arc<UserSession>> {
        let mut indices = self.indices.write().await;
        let session = indices.by_id.remove(id)?;

        // Only drop the name entry if it still belongs to this connection
        if indices
            .by_name
            .get(session.name())
            .is_some_and(|s| s.id() == *id)
        {
            indices.by_name.remove(session.name());
        }

        let lifetime = Utc::now() - session.registered_at();
        tracing::info!(
            "Unregistered user '{}' ({}) after {}s",
            session.name(),
            id,
            lifetime.num_seconds()
        );
        Some(session)
    }

    pub async fn get_by_id(&self, id: &SessionId) -> Option<Arc<UserSession>> {
        self.indices.read().await.by_id.get(id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Arc<UserSession>> {
        self.indices.read().await.by_name.get(name).cloned()
    }

    /// Number of registered users
    pub async fn len(&self) -> usize {
        self.indices.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Registered user names, in no particular order
    pub async fn names(&self) -> Vec<String> {
        self.indices.read().await.by_name.keys().cloned().collect()
    }
}
