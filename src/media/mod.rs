//! Media plumbing - the external media server seam and everything the
//! signaling core builds on top of it
//!
//! The media server does the actual transcoding, ICE and DTLS work. This
//! module only knows how to ask it for elements, wire them together and
//! listen to what they report back:
//! - [`MediaBackend`] is the async interface to the media server
//! - [`CandidateBuffer`] holds browser candidates until an endpoint exists
//! - [`PipelineCoordinator`] builds, wires and releases call and playback pipelines

mod candidates;
mod coordinator;
pub mod kurento;
mod pipeline;

pub use candidates::CandidateBuffer;
pub use coordinator::{MediaOutcome, PipelineCoordinator};
pub use kurento::KurentoClient;
pub use pipeline::{IceReadiness, PipelineHandle, PipelineId, PipelineKind};

use crate::protocol::IceCandidate;
use crate::session::SessionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reference to an object living inside the media server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaObjectId(String);

impl MediaObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MediaObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failures reported by, or while talking to, the media server
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("{operation} failed: {message}")]
    Rejected { operation: String, message: String },

    #[error("media server connection lost: {0}")]
    Transport(String),

    #[error("media server did not answer {0} in time")]
    Timeout(String),

    #[error("unexpected media server reply: {0}")]
    Protocol(String),

    #[error("no media endpoint for session {0}")]
    NoEndpoint(SessionId),

    #[error("pipeline has already been released")]
    Released,

    #[error("construction was cancelled")]
    Cancelled,
}

/// Events a media element can be subscribed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaEventKind {
    IceCandidateFound,
    IceGatheringDone,
    EndOfStream,
}

/// Event raised by the media server for a subscribed element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    /// An endpoint discovered a local connectivity candidate
    IceCandidateFound {
        source: MediaObjectId,
        candidate: IceCandidate,
    },

    /// An endpoint finished candidate discovery
    IceGatheringDone { source: MediaObjectId },

    /// A player reached the end of its source
    EndOfStream { source: MediaObjectId },
}

impl MediaEvent {
    /// Element that raised the event
    pub fn source(&self) -> &MediaObjectId {
        match self {
            MediaEvent::IceCandidateFound { source, .. }
            | MediaEvent::IceGatheringDone { source }
            | MediaEvent::EndOfStream { source } => source,
        }
    }
}

/// Asynchronous interface to the media server
///
/// Every call may fail. Events for subscribed elements are delivered
/// out-of-band on the channel the implementation was constructed with.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn create_pipeline(&self) -> Result<MediaObjectId, MediaError>;

    /// WebRTC endpoint terminating one browser's media
    async fn create_endpoint(&self, pipeline: &MediaObjectId) -> Result<MediaObjectId, MediaError>;

    /// Server-side mixing hub
    async fn create_mixer(&self, pipeline: &MediaObjectId) -> Result<MediaObjectId, MediaError>;

    /// One branch of a mixing hub
    async fn create_mixer_port(&self, mixer: &MediaObjectId) -> Result<MediaObjectId, MediaError>;

    async fn create_recorder(
        &self,
        pipeline: &MediaObjectId,
        destination_uri: &str,
    ) -> Result<MediaObjectId, MediaError>;

    async fn create_player_source(
        &self,
        pipeline: &MediaObjectId,
        source_uri: &str,
    ) -> Result<MediaObjectId, MediaError>;

    /// Route media flowing out of `source` into `sink`
    async fn connect(&self, source: &MediaObjectId, sink: &MediaObjectId) -> Result<(), MediaError>;

    async fn subscribe(&self, object: &MediaObjectId, kind: MediaEventKind) -> Result<(), MediaError>;

    async fn add_candidate(
        &self,
        endpoint: &MediaObjectId,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError>;

    /// Hand the browser's offer to an endpoint and get its answer back
    async fn process_offer(&self, endpoint: &MediaObjectId, offer: &str) -> Result<String, MediaError>;

    async fn gather_candidates(&self, endpoint: &MediaObjectId) -> Result<(), MediaError>;

    async fn record(&self, recorder: &MediaObjectId) -> Result<(), MediaError>;

    async fn play(&self, player: &MediaObjectId) -> Result<(), MediaError>;

    async fn stop(&self, element: &MediaObjectId) -> Result<(), MediaError>;

    /// Release an object and everything it owns
    async fn release(&self, object: &MediaObjectId) -> Result<(), MediaError>;
}
