//! Call negotiation - ringing, accepting, rejecting and hanging up
//!
//! Each session holds at most one pipeline slot. A slot is `Building` while
//! the media server is still wiring the pipeline and `Active` once answers
//! went out. The attempt id stored in a `Building` slot is the generation
//! token: a construction that finishes after its slot was stopped sees the
//! mismatch and releases what it built instead of wiring it into a dead call.
//! Stopping also fires the slot's cancellation token so the construction
//! stops issuing media server requests at its next step.

use crate::media::{CandidateBuffer, MediaError, PipelineCoordinator, PipelineHandle, PipelineKind};
use crate::protocol::{CallDecision, ServerMessage};
use crate::session::{SessionId, SessionRegistry, UserSession};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sent to the remaining party when the other side leaves
pub const HANG_UP_MESSAGE: &str = "remote user hanged out";

/// Sent to the caller when the callee declines
pub const DECLINE_MESSAGE: &str = "user declined";

/// Negotiation failures
///
/// By the time one of these is returned the affected users have already been
/// told; the error is for logging only.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("User {0} is not registered")]
    UnknownCallee(String),

    #[error("unknown from = {0}")]
    UnknownCaller(String),

    #[error("Connection is not registered")]
    NotRegistered,

    #[error("User {0} is busy")]
    PeerUnavailable(String),

    #[error("No pending call from {0}")]
    NoPendingCall(String),

    #[error("{0} sent no SDP offer")]
    MissingOffer(String),

    #[error("There are no recordings")]
    NoRecording,

    #[error("Error {0}")]
    Delivery(String),

    #[error("stopped before the pipeline was ready")]
    Cancelled,

    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone)]
enum PipelineSlot {
    /// Construction in flight
    Building {
        attempt: Uuid,
        partner: Option<SessionId>,
        cancel: CancellationToken,
    },
    /// Answers delivered, media flowing
    Active(Arc<PipelineHandle>),
}

impl PipelineSlot {
    fn is_attempt(&self, id: Uuid) -> bool {
        matches!(self, PipelineSlot::Building { attempt, .. } if *attempt == id)
    }

    /// Whether two slots describe the same call
    fn same_call(&self, other: &PipelineSlot) -> bool {
        match (self, other) {
            (PipelineSlot::Building { attempt: a, .. }, PipelineSlot::Building { attempt: b, .. }) => {
                a == b
            }
            (PipelineSlot::Active(a), PipelineSlot::Active(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Abort an in-flight construction; active pipelines are unaffected
    fn cancel(&self) {
        if let PipelineSlot::Building { cancel, .. } = self {
            cancel.cancel();
        }
    }

    fn partner_of(&self, session: &SessionId) -> Option<SessionId> {
        match self {
            PipelineSlot::Building { partner, .. } => *partner,
            PipelineSlot::Active(handle) => handle.partner_of(session),
        }
    }
}

/// Drives calls between registered users
pub struct CallNegotiator {
    registry: Arc<SessionRegistry>,
    candidates: Arc<CandidateBuffer>,
    coordinator: Arc<PipelineCoordinator>,
    slots: Mutex<HashMap<SessionId, PipelineSlot>>,
}

impl CallNegotiator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        candidates: Arc<CandidateBuffer>,
        coordinator: Arc<PipelineCoordinator>,
    ) -> Self {
        Self {
            registry,
            candidates,
            coordinator,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Ring `callee_name` on behalf of `caller_id`
    pub async fn call(
        &self,
        caller_id: SessionId,
        callee_name: &str,
        sdp_offer: String,
    ) -> Result<(), NegotiationError> {
        self.candidates.clear(&caller_id).await;

        let caller = self
            .registry
            .get_by_id(&caller_id)
            .await
            .ok_or(NegotiationError::NotRegistered)?;

        let result = self.ring(&caller, callee_name, sdp_offer).await;
        if let Err(e) = &result {
            tracing::info!("Call from '{}' to '{}' rejected: {}", caller.name(), callee_name, e);
            notify(&caller, ServerMessage::call_rejected(e.to_string())).await;
        }
        result
    }

    async fn ring(
        &self,
        caller: &Arc<UserSession>,
        callee_name: &str,
        sdp_offer: String,
    ) -> Result<(), NegotiationError> {
        let callee = self
            .registry
            .get_by_name(callee_name)
            .await
            .ok_or_else(|| NegotiationError::UnknownCallee(callee_name.to_string()))?;

        if callee.id() == caller.id() || self.has_pipeline(&caller.id()).await {
            return Err(NegotiationError::PeerUnavailable(caller.name().to_string()));
        }
        if self.has_pipeline(&callee.id()).await {
            return Err(NegotiationError::PeerUnavailable(callee.name().to_string()));
        }

        caller.set_sdp_offer(Some(sdp_offer)).await;
        caller.set_peer(Some(callee.name().to_string())).await;
        callee.set_peer(Some(caller.name().to_string())).await;

        let ringing = ServerMessage::IncomingCall {
            from: caller.name().to_string(),
        };
        if let Err(e) = callee.send(ringing).await {
            caller.set_peer(None).await;
            caller.set_sdp_offer(None).await;
            callee.clear_peer_if(caller.name()).await;
            return Err(NegotiationError::Delivery(e.to_string()));
        }

        tracing::info!("'{}' is calling '{}'", caller.name(), callee.name());
        Ok(())
    }

    /// Callee's answer to a ringing call from `caller_name`
    pub async fn respond(
        &self,
        callee_id: SessionId,
        caller_name: &str,
        decision: CallDecision,
        callee_offer: Option<String>,
    ) -> Result<(), NegotiationError> {
        self.candidates.clear(&callee_id).await;

        let callee = self
            .registry
            .get_by_id(&callee_id)
            .await
            .ok_or(NegotiationError::NotRegistered)?;

        let Some(caller) = self.registry.get_by_name(caller_name).await else {
            let e = NegotiationError::UnknownCaller(caller_name.to_string());
            callee.clear_peer_if(caller_name).await;
            notify(&callee, ServerMessage::stop_communication(Some(e.to_string()))).await;
            return Err(e);
        };

        if caller.peer().await.as_deref() != Some(callee.name()) {
            let e = NegotiationError::NoPendingCall(caller_name.to_string());
            notify(&callee, ServerMessage::stop_communication(Some(e.to_string()))).await;
            return Err(e);
        }

        match decision {
            CallDecision::Reject => {
                caller.set_peer(None).await;
                caller.set_sdp_offer(None).await;
                callee.clear_peer_if(caller.name()).await;
                notify(&caller, ServerMessage::call_rejected(DECLINE_MESSAGE)).await;
                tracing::info!("'{}' declined the call from '{}'", callee.name(), caller.name());
                Ok(())
            }
            CallDecision::Accept => self.accept(&caller, &callee, callee_offer).await,
        }
    }

    async fn accept(
        &self,
        caller: &Arc<UserSession>,
        callee: &Arc<UserSession>,
        callee_offer: Option<String>,
    ) -> Result<(), NegotiationError> {
        let participants = [caller.id(), callee.id()];
        let attempt = Uuid::new_v4();
        let cancel = CancellationToken::new();

        {
            let mut slots = self.slots.lock().await;
            if participants.iter().any(|id| slots.contains_key(id)) {
                drop(slots);
                let e = NegotiationError::PeerUnavailable(caller.name().to_string());
                self.fail_call(caller, callee, &e).await;
                return Err(e);
            }
            slots.insert(
                caller.id(),
                PipelineSlot::Building {
                    attempt,
                    partner: Some(callee.id()),
                    cancel: cancel.clone(),
                },
            );
            slots.insert(
                callee.id(),
                PipelineSlot::Building {
                    attempt,
                    partner: Some(caller.id()),
                    cancel: cancel.clone(),
                },
            );
        }
        callee.set_peer(Some(caller.name().to_string())).await;

        match self.establish(caller, callee, callee_offer, &cancel).await {
            Ok((handle, caller_answer, callee_answer)) => {
                if !self.commit(attempt, &participants, &handle).await {
                    tracing::info!(
                        "Call between '{}' and '{}' was stopped while connecting",
                        caller.name(),
                        callee.name()
                    );
                    self.coordinator.release(&handle).await;
                    return Err(NegotiationError::Cancelled);
                }

                caller.set_sdp_offer(None).await;
                notify(
                    callee,
                    ServerMessage::StartCommunication {
                        sdp_answer: callee_answer,
                    },
                )
                .await;
                notify(caller, ServerMessage::call_accepted(caller_answer)).await;
                tracing::info!("Call established between '{}' and '{}'", caller.name(), callee.name());
                Ok(())
            }
            Err(e) => {
                if self.abandon(attempt, &participants).await {
                    self.fail_call(caller, callee, &e).await;
                    Err(e)
                } else {
                    Err(NegotiationError::Cancelled)
                }
            }
        }
    }

    /// Build the call pipeline and produce both answers
    async fn establish(
        &self,
        caller: &UserSession,
        callee: &UserSession,
        callee_offer: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<(Arc<PipelineHandle>, String, String), NegotiationError> {
        let caller_offer = caller
            .sdp_offer()
            .await
            .ok_or_else(|| NegotiationError::MissingOffer(caller.name().to_string()))?;
        let callee_offer =
            callee_offer.ok_or_else(|| NegotiationError::MissingOffer(callee.name().to_string()))?;

        let handle = self
            .coordinator
            .create_call_pipeline(caller.id(), callee.id(), cancel)
            .await?;

        let answers = async {
            if cancel.is_cancelled() {
                return Err(MediaError::Cancelled);
            }
            let caller_answer = self
                .coordinator
                .generate_answer(&handle, &caller.id(), &caller_offer)
                .await?;
            if cancel.is_cancelled() {
                return Err(MediaError::Cancelled);
            }
            let callee_answer = self
                .coordinator
                .generate_answer(&handle, &callee.id(), &callee_offer)
                .await?;
            Ok::<_, MediaError>((caller_answer, callee_answer))
        }
        .await;

        match answers {
            Ok((caller_answer, callee_answer)) => Ok((handle, caller_answer, callee_answer)),
            Err(e) => {
                self.coordinator.release(&handle).await;
                Err(e.into())
            }
        }
    }

    /// Tell both sides a call attempt failed and return them to idle
    async fn fail_call(&self, caller: &UserSession, callee: &UserSession, error: &NegotiationError) {
        caller.clear_peer_if(callee.name()).await;
        caller.set_sdp_offer(None).await;
        callee.clear_peer_if(caller.name()).await;
        self.candidates.clear(&caller.id()).await;
        self.candidates.clear(&callee.id()).await;

        notify(caller, ServerMessage::call_rejected(error.to_string())).await;
        notify(callee, ServerMessage::stop_communication(Some(error.to_string()))).await;
    }

    /// Replay the most recent recording to `viewer_id`
    pub async fn play(&self, viewer_id: SessionId, sdp_offer: String) -> Result<(), NegotiationError> {
        self.candidates.clear(&viewer_id).await;

        let viewer = self
            .registry
            .get_by_id(&viewer_id)
            .await
            .ok_or(NegotiationError::NotRegistered)?;

        let result = self.start_playback(&viewer, &sdp_offer).await;
        match &result {
            Err(NegotiationError::Cancelled) => {}
            Err(e) => {
                tracing::info!("Playback for '{}' rejected: {}", viewer.name(), e);
                notify(&viewer, ServerMessage::play_rejected(e.to_string())).await;
            }
            Ok(()) => {}
        }
        result
    }

    async fn start_playback(&self, viewer: &UserSession, sdp_offer: &str) -> Result<(), NegotiationError> {
        let source = self
            .coordinator
            .latest_recording()
            .await
            .ok_or(NegotiationError::NoRecording)?;

        let participants = [viewer.id()];
        let attempt = Uuid::new_v4();
        let cancel = CancellationToken::new();
        {
            let mut slots = self.slots.lock().await;
            if slots.contains_key(&viewer.id()) {
                return Err(NegotiationError::PeerUnavailable(viewer.name().to_string()));
            }
            slots.insert(
                viewer.id(),
                PipelineSlot::Building {
                    attempt,
                    partner: None,
                    cancel: cancel.clone(),
                },
            );
        }

        let built: Result<(Arc<PipelineHandle>, String), MediaError> = async {
            let handle = self
                .coordinator
                .create_playback_pipeline(viewer.id(), &source, &cancel)
                .await?;
            if cancel.is_cancelled() {
                self.coordinator.release(&handle).await;
                return Err(MediaError::Cancelled);
            }
            match self
                .coordinator
                .generate_answer(&handle, &viewer.id(), sdp_offer)
                .await
            {
                Ok(answer) => Ok((handle, answer)),
                Err(e) => {
                    self.coordinator.release(&handle).await;
                    Err(e)
                }
            }
        }
        .await;

        match built {
            Ok((handle, answer)) => {
                if !self.commit(attempt, &participants, &handle).await {
                    self.coordinator.release(&handle).await;
                    return Err(NegotiationError::Cancelled);
                }
                notify(viewer, ServerMessage::play_accepted(answer)).await;
                tracing::info!("Playing {} to '{}'", source, viewer.name());
                Ok(())
            }
            Err(e) => {
                if self.abandon(attempt, &participants).await {
                    Err(e.into())
                } else {
                    Err(NegotiationError::Cancelled)
                }
            }
        }
    }

    /// Promote this attempt's slots to active, unless they were stopped meanwhile
    async fn commit(&self, attempt: Uuid, participants: &[SessionId], handle: &Arc<PipelineHandle>) -> bool {
        let mut slots = self.slots.lock().await;
        let still_ours = participants
            .iter()
            .all(|id| slots.get(id).is_some_and(|slot| slot.is_attempt(attempt)));
        if !still_ours {
            return false;
        }
        for id in participants {
            slots.insert(*id, PipelineSlot::Active(Arc::clone(handle)));
        }
        true
    }

    /// Drop this attempt's slots; false if a stop already took them
    async fn abandon(&self, attempt: Uuid, participants: &[SessionId]) -> bool {
        let mut slots = self.slots.lock().await;
        let mut found = false;
        for id in participants {
            if slots.get(id).is_some_and(|slot| slot.is_attempt(attempt)) {
                slots.remove(id);
                found = true;
            }
        }
        found
    }

    /// Tear down whatever pipeline `session_id` is part of
    ///
    /// Returns false if there was nothing to stop. Concurrent stops for the
    /// same call race on the slot table; exactly one of them wins.
    pub async fn stop(&self, session_id: SessionId) -> bool {
        let (slot, partner_id) = {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.remove(&session_id) else {
                return false;
            };
            let partner_id = slot.partner_of(&session_id);
            if let Some(partner_id) = partner_id {
                if slots.get(&partner_id).is_some_and(|s| s.same_call(&slot)) {
                    slots.remove(&partner_id);
                }
            }
            slot.cancel();
            (slot, partner_id)
        };

        // Both sides are idle before the release starts
        if let Some(stopper) = self.registry.get_by_id(&session_id).await {
            stopper.set_peer(None).await;
            stopper.set_sdp_offer(None).await;
        }
        let partner = match partner_id {
            Some(partner_id) => self.registry.get_by_id(&partner_id).await,
            None => None,
        };
        if let Some(partner) = &partner {
            partner.set_peer(None).await;
            partner.set_sdp_offer(None).await;
        }

        let kind = match &slot {
            PipelineSlot::Active(handle) => {
                self.coordinator.release(handle).await;
                Some(handle.kind())
            }
            PipelineSlot::Building { .. } => None,
        };

        if let Some(partner_id) = partner_id {
            self.candidates.clear(&partner_id).await;
            if let Some(partner) = &partner {
                notify(
                    partner,
                    ServerMessage::stop_communication(Some(HANG_UP_MESSAGE.to_string())),
                )
                .await;
            }
        }
        self.candidates.clear(&session_id).await;

        match kind {
            Some(PipelineKind::Playback) => tracing::info!("Stopped playback for {}", session_id),
            Some(PipelineKind::Call) => tracing::info!("Call ended by {}", session_id),
            None => tracing::info!("Call setup cancelled by {}", session_id),
        }
        true
    }

    /// Connection went away: stop its pipeline and release anyone it was ringing
    pub async fn disconnect(&self, session_id: SessionId) {
        self.stop(session_id).await;

        let Some(session) = self.registry.get_by_id(&session_id).await else {
            return;
        };
        let Some(peer_name) = session.peer().await else {
            return;
        };
        session.set_peer(None).await;

        if let Some(peer) = self.registry.get_by_name(&peer_name).await {
            if peer.peer().await.as_deref() == Some(session.name()) {
                peer.set_peer(None).await;
                peer.set_sdp_offer(None).await;
                notify(
                    &peer,
                    ServerMessage::stop_communication(Some(HANG_UP_MESSAGE.to_string())),
                )
                .await;
            }
        }
    }

    /// Whether the session has a pipeline, built or in construction
    pub async fn has_pipeline(&self, session_id: &SessionId) -> bool {
        self.slots.lock().await.contains_key(session_id)
    }

    /// The session's established pipeline, if any
    pub async fn active_pipeline(&self, session_id: &SessionId) -> Option<Arc<PipelineHandle>> {
        match self.slots.lock().await.get(session_id) {
            Some(PipelineSlot::Active(handle)) => Some(Arc::clone(handle)),
            _ => None,
        }
    }
}

/// Best-effort delivery; a closed connection is cleaned up by its own disconnect
async fn notify(user: &UserSession, msg: ServerMessage) {
    if let Err(e) = user.send(msg).await {
        tracing::warn!("Failed to notify '{}': {}", user.name(), e);
    }
}
