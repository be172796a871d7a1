//! Candidate buffer - holds browser candidates until their endpoint exists

use super::{MediaBackend, MediaError, MediaObjectId};
use crate::protocol::IceCandidate;
use crate::session::SessionId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Where a session's candidates currently go
#[derive(Debug)]
enum Slot {
    /// No endpoint yet; candidates wait here in receipt order
    Queued(Vec<IceCandidate>),

    /// Endpoint exists; candidates are forwarded straight to it
    Attached(MediaObjectId),
}

/// Per-session candidate routing
///
/// Each session gets its own slot lock, held across the backend call, so
/// enqueue, flush and forward for one session are strictly ordered while
/// different sessions proceed in parallel.
pub struct CandidateBuffer {
    backend: Arc<dyn MediaBackend>,
    slots: Mutex<HashMap<SessionId, Arc<Mutex<Slot>>>>,
}

impl CandidateBuffer {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            slots: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, session: &SessionId) -> Arc<Mutex<Slot>> {
        let mut slots = self.slots.lock().await;
        Arc::clone(
            slots
                .entry(*session)
                .or_insert_with(|| Arc::new(Mutex::new(Slot::Queued(Vec::new())))),
        )
    }

    /// Forward a candidate to the session's endpoint, or queue it
    pub async fn on_candidate(
        &self,
        session: SessionId,
        candidate: IceCandidate,
    ) -> Result<(), MediaError> {
        let slot = self.slot(&session).await;
        let mut slot = slot.lock().await;

        match &mut *slot {
            Slot::Attached(endpoint) => {
                tracing::debug!("Forwarding candidate for {} to {}", session, endpoint);
                self.backend.add_candidate(endpoint, &candidate).await
            }
            Slot::Queued(queue) => {
                queue.push(candidate);
                tracing::debug!("Queued candidate for {} ({} waiting)", session, queue.len());
                Ok(())
            }
        }
    }

    /// Attach an endpoint and drain anything queued for it, oldest first
    ///
    /// Returns how many queued candidates were forwarded. A cancelled
    /// construction leaves the slot alone, so candidates queued for a newer
    /// attempt stay queued.
    pub async fn flush(
        &self,
        session: &SessionId,
        endpoint: &MediaObjectId,
        cancel: &CancellationToken,
    ) -> Result<usize, MediaError> {
        let slot = self.slot(session).await;
        let mut slot = slot.lock().await;
        if cancel.is_cancelled() {
            return Err(MediaError::Cancelled);
        }

        let queued = match std::mem::replace(&mut *slot, Slot::Attached(endpoint.clone())) {
            Slot::Queued(queue) => queue,
            Slot::Attached(previous) => {
                tracing::warn!(
                    "Session {} moved from endpoint {} to {} without a clear",
                    session,
                    previous,
                    endpoint
                );
                Vec::new()
            }
        };

        for candidate in &queued {
            self.backend.add_candidate(endpoint, candidate).await?;
        }

        if !queued.is_empty() {
            tracing::debug!(
                "Flushed {} queued candidates for {} to {}",
                queued.len(),
                session,
                endpoint
            );
        }
        Ok(queued.len())
    }

    /// Discard queued candidates and any endpoint attachment
    ///
    /// Returns how many queued candidates were dropped.
    pub async fn clear(&self, session: &SessionId) -> usize {
        let removed = self.slots.lock().await.remove(session);
        let Some(slot) = removed else {
            return 0;
        };

        let dropped = match &*slot.lock().await {
            Slot::Queued(queue) => queue.len(),
            Slot::Attached(_) => 0,
        };
        if dropped > 0 {
            tracing::debug!("Discarded {} queued candidates for {}", dropped, session);
        }
        dropped
    }

    /// Detach `endpoint` from the session, leaving any newer attachment alone
    pub async fn detach(&self, session: &SessionId, endpoint: &MediaObjectId) {
        let mut slots = self.slots.lock().await;
        let attached_here = match slots.get(session) {
            Some(slot) => matches!(&*slot.lock().await, Slot::Attached(current) if current == endpoint),
            None => false,
        };
        if attached_here {
            slots.remove(session);
        }
    }

    /// Number of candidates waiting for the session's endpoint
    pub async fn queued_len(&self, session: &SessionId) -> usize {
        let slot = self.slots.lock().await.get(session).cloned();
        match slot {
            Some(slot) => match &*slot.lock().await {
                Slot::Queued(queue) => queue.len(),
                Slot::Attached(_) => 0,
            },
            None => 0,
        }
    }

    /// Endpoint the session's candidates are currently forwarded to
    pub async fn attached_endpoint(&self, session: &SessionId) -> Option<MediaObjectId> {
        let slot = self.slots.lock().await.get(session).cloned()?;
        let slot = slot.lock().await;
        match &*slot {
            Slot::Attached(endpoint) => Some(endpoint.clone()),
            Slot::Queued(_) => None,
        }
    }
}
