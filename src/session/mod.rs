//! User sessions - one per signaling connection that has registered a name

mod registry;

pub use registry::SessionRegistry;

use crate::protocol::ServerMessage;
use crate::server::ClientConnection;
use anyhow::Result;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Identity of a signaling connection
pub type SessionId = Uuid;

/// Registration failures, reported to the sender only
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("empty user name")]
    EmptyName,

    #[error("User {0} is already registered")]
    NameTaken(String),

    #[error("Connection is already registered as {0}")]
    AlreadyRegistered(String),
}

/// Negotiation state carried by a session between `call` and the callee's answer
#[derive(Debug, Default)]
struct PeerState {
    /// Name of the current call partner
    peer: Option<String>,

    /// Caller's offer, held until the callee accepts
    sdp_offer: Option<String>,
}

/// A registered user
pub struct UserSession {
    id: SessionId,
    name: String,
    connection: ClientConnection,
    registered_at: DateTime<Utc>,
    state: Mutex<PeerState>,
}

impl UserSession {
    pub fn new(id: SessionId, name: String, connection: ClientConnection) -> Self {
        Self {
            id,
            name,
            connection,
            registered_at: Utc::now(),
            state: Mutex::new(PeerState::default()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    /// Queue a message on this user's connection
    pub async fn send(&self, msg: ServerMessage) -> Result<()> {
        self.connection.send(msg).await
    }

    /// Queue a message only if the connection has room right now
    pub fn try_send(&self, msg: ServerMessage) -> Result<()> {
        self.connection.try_send(msg)
    }

    /// Current call partner, if any
    pub async fn peer(&self) -> Option<String> {
        self.state.lock().await.peer.clone()
    }

    pub async fn set_peer(&self, peer: Option<String>) {
        self.state.lock().await.peer = peer;
    }

    /// Drop the peer reference only if it still points at `name`
    pub async fn clear_peer_if(&self, name: &str) {
        let mut state = self.state.lock().await;
        if state.peer.as_deref() == Some(name) {
            state.peer = None;
        }
    }

    pub async fn sdp_offer(&self) -> Option<String> {
        self.state.lock().await.sdp_offer.clone()
    }

    pub async fn set_sdp_offer(&self, offer: Option<String>) {
        self.state.lock().await.sdp_offer = offer;
    }
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}
