//! Dispatcher - decodes signaling messages and routes them to the services

use super::ClientConnection;
use crate::call::{CallNegotiator, NegotiationError};
use crate::config::RecordingConfig;
use crate::media::{
    CandidateBuffer, MediaBackend, MediaEvent, MediaOutcome, PipelineCoordinator,
};
use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::session::{SessionId, SessionRegistry};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Stateless routing layer over the registry, candidate buffer,
/// coordinator and negotiator
pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    candidates: Arc<CandidateBuffer>,
    coordinator: Arc<PipelineCoordinator>,
    negotiator: Arc<CallNegotiator>,
}

impl Dispatcher {
    /// Wire up all signaling services around a media backend
    pub fn new(backend: Arc<dyn MediaBackend>, recording: RecordingConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let candidates = Arc::new(CandidateBuffer::new(Arc::clone(&backend)));
        let coordinator = Arc::new(PipelineCoordinator::new(
            backend,
            Arc::clone(&registry),
            Arc::clone(&candidates),
            recording,
        ));
        let negotiator = Arc::new(CallNegotiator::new(
            Arc::clone(&registry),
            Arc::clone(&candidates),
            Arc::clone(&coordinator),
        ));

        Self {
            registry,
            candidates,
            coordinator,
            negotiator,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn candidates(&self) -> &Arc<CandidateBuffer> {
        &self.candidates
    }

    pub fn coordinator(&self) -> &Arc<PipelineCoordinator> {
        &self.coordinator
    }

    pub fn negotiator(&self) -> &Arc<CallNegotiator> {
        &self.negotiator
    }

    /// Handle one inbound text frame
    pub async fn handle_text(&self, conn: &ClientConnection, text: &str) {
        match protocol::decode(text) {
            Ok(msg) => self.dispatch(conn, msg).await,
            Err(e) => {
                tracing::warn!("Connection {} sent an invalid message: {}", conn.id(), e);
                reply(conn, ServerMessage::error(e.to_string())).await;
            }
        }
    }

    /// Route a decoded message
    pub async fn dispatch(&self, conn: &ClientConnection, msg: ClientMessage) {
        let id = conn.id();
        if !matches!(msg, ClientMessage::OnIceCandidate { .. }) {
            tracing::debug!("Connection {} received {:?}", id, msg);
        }

        let kind = msg.kind();
        let result = match msg {
            ClientMessage::Register { name } => {
                self.register(conn, &name).await;
                return;
            }
            ClientMessage::Call { to, sdp_offer, .. } => self.negotiator.call(id, &to, sdp_offer).await,
            ClientMessage::IncomingCallResponse {
                from,
                call_response,
                sdp_offer,
            } => {
                self.negotiator
                    .respond(id, &from, call_response, sdp_offer)
                    .await
            }
            ClientMessage::Play { sdp_offer } => self.negotiator.play(id, sdp_offer).await,
            ClientMessage::Stop => {
                self.negotiator.stop(id).await;
                return;
            }
            ClientMessage::OnIceCandidate { candidate } => {
                if let Err(e) = self.candidates.on_candidate(id, candidate).await {
                    tracing::warn!("Failed to add candidate for {}: {}", id, e);
                }
                return;
            }
        };

        match result {
            Ok(()) => {}
            // Nobody to notify through the negotiator; answer on the raw connection
            Err(NegotiationError::NotRegistered) => {
                let message = NegotiationError::NotRegistered.to_string();
                let response = match kind {
                    "call" => ServerMessage::call_rejected(message),
                    "play" => ServerMessage::play_rejected(message),
                    _ => ServerMessage::error(message),
                };
                reply(conn, response).await;
            }
            Err(e) => tracing::debug!("{} from {} did not go through: {}", kind, id, e),
        }
    }

    async fn register(&self, conn: &ClientConnection, name: &str) {
        let response = match self.registry.register(conn.id(), name, conn.clone()).await {
            Ok(_) => ServerMessage::register_accepted(),
            Err(e) => {
                tracing::info!("Registration of '{}' on {} rejected: {}", name, conn.id(), e);
                ServerMessage::register_rejected(e.to_string())
            }
        };
        reply(conn, response).await;
    }

    /// Connection closed: tear down its call and forget it
    pub async fn disconnect(&self, id: SessionId) {
        self.negotiator.disconnect(id).await;
        self.candidates.clear(&id).await;
        self.registry.unregister(&id).await;
    }

    /// Handle an event raised by the media server
    ///
    /// Routing happens inline and never waits on a connection. Follow-up
    /// work that needs media server replies runs on its own task, returned
    /// so the caller can wait for it if it wants to.
    pub async fn handle_media_event(&self, event: MediaEvent) -> Option<JoinHandle<()>> {
        match self.coordinator.handle_event(event).await? {
            MediaOutcome::MediaReady(handle) => {
                let coordinator = Arc::clone(&self.coordinator);
                Some(tokio::spawn(async move {
                    coordinator.start_media(&handle).await;
                }))
            }
            MediaOutcome::PlaybackFinished(session) => {
                let negotiator = Arc::clone(&self.negotiator);
                Some(tokio::spawn(async move {
                    negotiator.stop(session).await;
                }))
            }
        }
    }
}

async fn reply(conn: &ClientConnection, msg: ServerMessage) {
    if let Err(e) = conn.send(msg).await {
        tracing::warn!("Failed to reply to {}: {}", conn.id(), e);
    }
}
