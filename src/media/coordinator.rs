//! Pipeline coordinator - builds, wires and releases media pipelines
//!
//! Construction is a straight sequence of backend calls. Every object
//! created along the way is pushed onto a rollback stack; if any step fails
//! the stack is unwound in reverse before the error is returned, so a failed
//! attempt never leaves anything behind in the media server. The same
//! unwinding happens when the attempt's cancellation token fires between steps.
//!
//! Event handling never waits on a browser or on the media server: outbound
//! messages are queued with `try_send`, and work that needs a media server
//! reply is handed back to the caller as a [`MediaOutcome`].

use super::{
    CandidateBuffer, MediaBackend, MediaError, MediaEvent, MediaEventKind, MediaObjectId,
    PipelineHandle, PipelineKind,
};
use crate::config::RecordingConfig;
use crate::protocol::ServerMessage;
use crate::session::{SessionId, SessionRegistry};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Follow-up work an event asks of the layer above
#[derive(Debug, Clone)]
pub enum MediaOutcome {
    /// Every participant finished gathering; recording or playback can start
    MediaReady(Arc<PipelineHandle>),
    /// Playback for this session reached the end and should be stopped
    PlaybackFinished(SessionId),
}

/// Bail out between construction steps once the attempt was stopped
fn checkpoint(cancel: &CancellationToken) -> Result<(), MediaError> {
    if cancel.is_cancelled() {
        Err(MediaError::Cancelled)
    } else {
        Ok(())
    }
}

/// Which session and pipeline an element's events belong to
#[derive(Clone)]
struct EventRoute {
    session: SessionId,
    handle: Arc<PipelineHandle>,
}

enum Undo {
    Release(MediaObjectId),
    Detach(SessionId, MediaObjectId),
}

/// Everything a construction attempt has done so far
struct Rollback {
    undo: Vec<Undo>,
}

impl Rollback {
    fn new() -> Self {
        Self { undo: Vec::new() }
    }

    fn created(&mut self, object: MediaObjectId) -> MediaObjectId {
        self.undo.push(Undo::Release(object.clone()));
        object
    }

    fn attached(&mut self, session: SessionId, endpoint: &MediaObjectId) {
        self.undo.push(Undo::Detach(session, endpoint.clone()));
    }

    async fn unwind(self, backend: &dyn MediaBackend, candidates: &CandidateBuffer) {
        for step in self.undo.into_iter().rev() {
            match step {
                Undo::Release(object) => {
                    if let Err(e) = backend.release(&object).await {
                        tracing::warn!("Rollback could not release {}: {}", object, e);
                    }
                }
                Undo::Detach(session, endpoint) => candidates.detach(&session, &endpoint).await,
            }
        }
    }
}

/// Builds call and playback pipelines and routes their events
pub struct PipelineCoordinator {
    backend: Arc<dyn MediaBackend>,
    registry: Arc<SessionRegistry>,
    candidates: Arc<CandidateBuffer>,
    recording: RecordingConfig,
    routes: RwLock<HashMap<MediaObjectId, EventRoute>>,
    latest_recording: RwLock<Option<String>>,
}

impl PipelineCoordinator {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        registry: Arc<SessionRegistry>,
        candidates: Arc<CandidateBuffer>,
        recording: RecordingConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            candidates,
            recording,
            routes: RwLock::new(HashMap::new()),
            latest_recording: RwLock::new(None),
        }
    }

    /// Build a recorded two-party call
    pub async fn create_call_pipeline(
        &self,
        caller: SessionId,
        callee: SessionId,
        cancel: &CancellationToken,
    ) -> Result<Arc<PipelineHandle>, MediaError> {
        let mut rollback = Rollback::new();
        let built = self
            .build_call(&mut rollback, caller, callee, cancel)
            .await
            .and_then(|handle| checkpoint(cancel).map(|()| handle));
        match built {
            Ok(handle) => {
                let handle = Arc::new(handle);
                self.install_routes(&handle).await;
                tracing::info!(
                    "Call pipeline {} ready for {} and {}",
                    handle.pipeline(),
                    caller,
                    callee
                );
                Ok(handle)
            }
            Err(MediaError::Cancelled) => {
                tracing::info!("Call pipeline for {} and {} cancelled", caller, callee);
                rollback.unwind(self.backend.as_ref(), &self.candidates).await;
                Err(MediaError::Cancelled)
            }
            Err(e) => {
                tracing::error!("Call pipeline for {} and {} failed: {}", caller, callee, e);
                rollback.unwind(self.backend.as_ref(), &self.candidates).await;
                Err(e)
            }
        }
    }

    /// Build a playback pipeline reading `source_uri`
    pub async fn create_playback_pipeline(
        &self,
        viewer: SessionId,
        source_uri: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<PipelineHandle>, MediaError> {
        let mut rollback = Rollback::new();
        let built = self
            .build_playback(&mut rollback, viewer, source_uri, cancel)
            .await
            .and_then(|handle| checkpoint(cancel).map(|()| handle));
        match built {
            Ok(handle) => {
                let handle = Arc::new(handle);
                self.install_routes(&handle).await;
                tracing::info!(
                    "Playback pipeline {} ready for {} ({})",
                    handle.pipeline(),
                    viewer,
                    source_uri
                );
                Ok(handle)
            }
            Err(MediaError::Cancelled) => {
                tracing::info!("Playback pipeline for {} cancelled", viewer);
                rollback.unwind(self.backend.as_ref(), &self.candidates).await;
                Err(MediaError::Cancelled)
            }
            Err(e) => {
                tracing::error!("Playback pipeline for {} failed: {}", viewer, e);
                rollback.unwind(self.backend.as_ref(), &self.candidates).await;
                Err(e)
            }
        }
    }

    async fn build_call(
        &self,
        rollback: &mut Rollback,
        caller: SessionId,
        callee: SessionId,
        cancel: &CancellationToken,
    ) -> Result<PipelineHandle, MediaError> {
        let backend = self.backend.as_ref();

        let pipeline = rollback.created(backend.create_pipeline().await?);
        let caller_endpoint = self.build_endpoint(rollback, &pipeline, caller, cancel).await?;
        let callee_endpoint = self.build_endpoint(rollback, &pipeline, callee, cancel).await?;

        checkpoint(cancel)?;
        let mixer = rollback.created(backend.create_mixer(&pipeline).await?);
        checkpoint(cancel)?;
        let caller_port = rollback.created(backend.create_mixer_port(&mixer).await?);
        let callee_port = rollback.created(backend.create_mixer_port(&mixer).await?);
        let recorder_port = rollback.created(backend.create_mixer_port(&mixer).await?);

        checkpoint(cancel)?;
        let recording_uri = self.recording.uri_for(&Uuid::new_v4().to_string());
        let recorder = rollback.created(backend.create_recorder(&pipeline, &recording_uri).await?);
        checkpoint(cancel)?;
        backend.connect(&recorder_port, &recorder).await?;

        backend.connect(&caller_endpoint, &caller_port).await?;
        backend.connect(&callee_endpoint, &callee_port).await?;
        backend.connect(&caller_port, &caller_endpoint).await?;
        backend.connect(&callee_port, &callee_endpoint).await?;

        checkpoint(cancel)?;
        backend
            .subscribe(&caller_endpoint, MediaEventKind::IceGatheringDone)
            .await?;
        backend
            .subscribe(&callee_endpoint, MediaEventKind::IceGatheringDone)
            .await?;

        Ok(PipelineHandle::call(
            pipeline,
            (caller, caller_endpoint),
            (callee, callee_endpoint),
            recorder,
            recording_uri,
        ))
    }

    async fn build_playback(
        &self,
        rollback: &mut Rollback,
        viewer: SessionId,
        source_uri: &str,
        cancel: &CancellationToken,
    ) -> Result<PipelineHandle, MediaError> {
        let backend = self.backend.as_ref();

        let pipeline = rollback.created(backend.create_pipeline().await?);
        let endpoint = self.build_endpoint(rollback, &pipeline, viewer, cancel).await?;

        checkpoint(cancel)?;
        let player = rollback.created(backend.create_player_source(&pipeline, source_uri).await?);
        backend.subscribe(&player, MediaEventKind::EndOfStream).await?;
        backend.connect(&player, &endpoint).await?;
        backend
            .subscribe(&endpoint, MediaEventKind::IceGatheringDone)
            .await?;

        Ok(PipelineHandle::playback(pipeline, (viewer, endpoint), player))
    }

    /// Create a participant's endpoint and drain their queued candidates into it
    async fn build_endpoint(
        &self,
        rollback: &mut Rollback,
        pipeline: &MediaObjectId,
        session: SessionId,
        cancel: &CancellationToken,
    ) -> Result<MediaObjectId, MediaError> {
        checkpoint(cancel)?;
        let endpoint = rollback.created(self.backend.create_endpoint(pipeline).await?);
        checkpoint(cancel)?;
        self.backend
            .subscribe(&endpoint, MediaEventKind::IceCandidateFound)
            .await?;

        rollback.attached(session, &endpoint);
        self.candidates.flush(&session, &endpoint, cancel).await?;
        Ok(endpoint)
    }

    async fn install_routes(&self, handle: &Arc<PipelineHandle>) {
        let mut routes = self.routes.write().await;
        for (session, endpoint) in handle.endpoints() {
            routes.insert(
                endpoint.clone(),
                EventRoute {
                    session: *session,
                    handle: Arc::clone(handle),
                },
            );
        }
        if let (Some(player), Some(viewer)) = (handle.player(), handle.participants().first()) {
            routes.insert(
                player.clone(),
                EventRoute {
                    session: *viewer,
                    handle: Arc::clone(handle),
                },
            );
        }
    }

    /// Process the browser's offer on its endpoint and start gathering
    pub async fn generate_answer(
        &self,
        handle: &PipelineHandle,
        session: &SessionId,
        offer: &str,
    ) -> Result<String, MediaError> {
        if handle.is_released() {
            return Err(MediaError::Released);
        }
        let endpoint = handle
            .endpoint(session)
            .ok_or(MediaError::NoEndpoint(*session))?;

        let answer = self.backend.process_offer(endpoint, offer).await?;
        self.backend.gather_candidates(endpoint).await?;
        Ok(answer)
    }

    /// Stop media and release the pipeline; repeated calls are no-ops
    pub async fn release(&self, handle: &PipelineHandle) {
        if !handle.mark_released() {
            tracing::debug!("Pipeline {} already released", handle.pipeline());
            return;
        }

        self.routes
            .write()
            .await
            .retain(|_, route| route.handle.id() != handle.id());

        for (session, endpoint) in handle.endpoints() {
            self.candidates.detach(session, endpoint).await;
        }

        if let Some(recorder) = handle.recorder() {
            if let Err(e) = self.backend.stop(recorder).await {
                tracing::warn!("Failed to stop recorder {}: {}", recorder, e);
            }
        }
        if let Some(player) = handle.player() {
            if let Err(e) = self.backend.stop(player).await {
                tracing::warn!("Failed to stop player {}: {}", player, e);
            }
        }
        if let Err(e) = self.backend.release(handle.pipeline()).await {
            tracing::warn!("Failed to release pipeline {}: {}", handle.pipeline(), e);
        }

        let lifetime = Utc::now() - handle.created_at();
        tracing::info!(
            "Released {:?} pipeline {} after {}s",
            handle.kind(),
            handle.pipeline(),
            lifetime.num_seconds()
        );
    }

    /// Route a media server event to whoever owns its source element
    pub async fn handle_event(&self, event: MediaEvent) -> Option<MediaOutcome> {
        let route = self.routes.read().await.get(event.source()).cloned();
        let Some(route) = route else {
            tracing::debug!("Dropping event from unrouted element {}", event.source());
            return None;
        };
        if route.handle.is_released() {
            return None;
        }

        match event {
            MediaEvent::IceCandidateFound { candidate, .. } => {
                self.deliver(&route.session, ServerMessage::IceCandidate { candidate })
                    .await;
                None
            }
            MediaEvent::IceGatheringDone { source } => {
                tracing::debug!("Gathering done on {} for {}", source, route.session);
                if route.handle.mark_gathering_done(&route.session).await {
                    Some(MediaOutcome::MediaReady(route.handle))
                } else {
                    None
                }
            }
            MediaEvent::EndOfStream { source } => {
                tracing::info!("Player {} reached end of stream", source);
                self.deliver(&route.session, ServerMessage::StopPlay).await;
                Some(MediaOutcome::PlaybackFinished(route.session))
            }
        }
    }

    /// Queue a message for a session without waiting on its connection
    ///
    /// A full outbound queue drops the message for that session only.
    async fn deliver(&self, session: &SessionId, msg: ServerMessage) {
        match self.registry.get_by_id(session).await {
            Some(user) => {
                if let Err(e) = user.try_send(msg) {
                    tracing::warn!("Dropped media event for {}: {}", session, e);
                }
            }
            None => tracing::debug!("Media event for departed session {}", session),
        }
    }

    /// Everyone is connected: start recording or playing
    pub async fn start_media(&self, handle: &PipelineHandle) {
        if handle.is_released() {
            return;
        }
        match handle.kind() {
            PipelineKind::Call => {
                let Some(recorder) = handle.recorder() else {
                    return;
                };
                match self.backend.record(recorder).await {
                    Ok(()) => {
                        let uri = handle.recording_uri().map(str::to_string);
                        tracing::info!("Recording started: {}", uri.as_deref().unwrap_or("?"));
                        *self.latest_recording.write().await = uri;
                    }
                    Err(e) => tracing::error!("Failed to start recorder {}: {}", recorder, e),
                }
            }
            PipelineKind::Playback => {
                let Some(player) = handle.player() else {
                    return;
                };
                match self.backend.play(player).await {
                    Ok(()) => tracing::info!("Playback started on {}", player),
                    Err(e) => tracing::error!("Failed to start player {}: {}", player, e),
                }
            }
        }
    }

    /// URI of the most recent recording that actually started
    pub async fn latest_recording(&self) -> Option<String> {
        self.latest_recording.read().await.clone()
    }

    /// Number of elements whose events are currently routed
    pub async fn routed_elements(&self) -> usize {
        self.routes.read().await.len()
    }
}
