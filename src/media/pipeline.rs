//! Pipeline handles and the ICE readiness barrier

use super::MediaObjectId;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Identity of one pipeline construction; doubles as its generation token
pub type PipelineId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    /// Two browsers mixed together and recorded
    Call,
    /// One browser watching the latest recording
    Playback,
}

/// Rendezvous on "gathering complete" from every participant
///
/// Fires exactly once, when the last outstanding participant reports in,
/// whatever the arrival order.
#[derive(Debug)]
pub struct IceReadiness {
    flags: Vec<(SessionId, bool)>,
    fired: bool,
}

impl IceReadiness {
    pub fn pair(caller: SessionId, callee: SessionId) -> Self {
        Self {
            flags: vec![(caller, false), (callee, false)],
            fired: false,
        }
    }

    pub fn single(viewer: SessionId) -> Self {
        Self {
            flags: vec![(viewer, false)],
            fired: false,
        }
    }

    /// Record that `session` finished gathering
    ///
    /// Returns true only for the report that completes the barrier.
    pub fn mark_done(&mut self, session: &SessionId) -> bool {
        match self.flags.iter_mut().find(|(id, _)| id == session) {
            Some((_, done)) => *done = true,
            None => return false,
        }

        if !self.fired && self.flags.iter().all(|(_, done)| *done) {
            self.fired = true;
            return true;
        }
        false
    }

    pub fn is_complete(&self) -> bool {
        self.fired
    }
}

/// A fully wired pipeline, shared by the one or two sessions using it
#[derive(Debug)]
pub struct PipelineHandle {
    id: PipelineId,
    kind: PipelineKind,
    pipeline: MediaObjectId,
    endpoints: HashMap<SessionId, MediaObjectId>,
    recorder: Option<MediaObjectId>,
    recording_uri: Option<String>,
    player: Option<MediaObjectId>,
    readiness: Mutex<IceReadiness>,
    released: AtomicBool,
    created_at: DateTime<Utc>,
}

impl PipelineHandle {
    /// Two-party call with its recorder
    pub fn call(
        pipeline: MediaObjectId,
        caller: (SessionId, MediaObjectId),
        callee: (SessionId, MediaObjectId),
        recorder: MediaObjectId,
        recording_uri: String,
    ) -> Self {
        let readiness = IceReadiness::pair(caller.0, callee.0);
        Self {
            id: Uuid::new_v4(),
            kind: PipelineKind::Call,
            pipeline,
            endpoints: HashMap::from([caller, callee]),
            recorder: Some(recorder),
            recording_uri: Some(recording_uri),
            player: None,
            readiness: Mutex::new(readiness),
            released: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    /// Single viewer fed from a player
    pub fn playback(
        pipeline: MediaObjectId,
        viewer: (SessionId, MediaObjectId),
        player: MediaObjectId,
    ) -> Self {
        let readiness = IceReadiness::single(viewer.0);
        Self {
            id: Uuid::new_v4(),
            kind: PipelineKind::Playback,
            pipeline,
            endpoints: HashMap::from([viewer]),
            recorder: None,
            recording_uri: None,
            player: Some(player),
            readiness: Mutex::new(readiness),
            released: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn pipeline(&self) -> &MediaObjectId {
        &self.pipeline
    }

    pub fn endpoint(&self, session: &SessionId) -> Option<&MediaObjectId> {
        self.endpoints.get(session)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = (&SessionId, &MediaObjectId)> {
        self.endpoints.iter()
    }

    pub fn participants(&self) -> Vec<SessionId> {
        self.endpoints.keys().copied().collect()
    }

    /// The other participant of a call
    pub fn partner_of(&self, session: &SessionId) -> Option<SessionId> {
        if !self.endpoints.contains_key(session) {
            return None;
        }
        self.endpoints.keys().find(|id| *id != session).copied()
    }

    pub fn recorder(&self) -> Option<&MediaObjectId> {
        self.recorder.as_ref()
    }

    pub fn recording_uri(&self) -> Option<&str> {
        self.recording_uri.as_deref()
    }

    pub fn player(&self) -> Option<&MediaObjectId> {
        self.player.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Feed the readiness barrier; true when media should start now
    pub async fn mark_gathering_done(&self, session: &SessionId) -> bool {
        self.readiness.lock().await.mark_done(session)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Claim the right to release; only the first caller gets true
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }
}
