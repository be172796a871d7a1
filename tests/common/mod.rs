//! Shared test helpers: a scripted media backend and connection plumbing

#![allow(dead_code)]

use async_trait::async_trait;
use callrec::config::RecordingConfig;
use callrec::media::{MediaBackend, MediaError, MediaEventKind, MediaObjectId};
use callrec::protocol::{IceCandidate, ServerMessage};
use callrec::server::{ClientConnection, Dispatcher};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

/// One recorded backend invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    pub op: &'static str,
    pub args: Vec<String>,
}

/// Pause point inside a backend call
#[derive(Clone, Default)]
pub struct Gate {
    /// Signalled once the gated call has been entered
    pub reached: Arc<Notify>,
    /// Signal to let the gated call continue
    pub release: Arc<Notify>,
}

/// In-memory media backend that records every call and fails on demand
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<BackendCall>>,
    counts: Mutex<HashMap<&'static str, usize>>,
    failures: Mutex<HashMap<&'static str, usize>>,
    created: Mutex<Vec<MediaObjectId>>,
    gates: Mutex<HashMap<&'static str, Gate>>,
    next_id: AtomicU64,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the `nth` (1-based) invocation of `op` fail
    pub fn fail_on(&self, op: &'static str, nth: usize) {
        self.failures.lock().unwrap().insert(op, nth);
    }

    /// Hold the next invocation of `op` until the gate is released
    ///
    /// Only `create_endpoint`, `create_mixer`, `create_player_source`,
    /// `process_offer`, `stop` and `release` honour gates.
    pub fn gate(&self, op: &'static str) -> Gate {
        let gate = Gate::default();
        self.gates.lock().unwrap().insert(op, gate.clone());
        gate
    }

    async fn pass_gate(&self, op: &'static str) {
        let gate = self.gates.lock().unwrap().remove(op);
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Arguments of every invocation of `op`, in order
    pub fn calls_of(&self, op: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op)
            .map(|c| c.args)
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls_of(op).len()
    }

    /// Every object successfully created, in creation order
    pub fn created(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|id| id.to_string())
            .collect()
    }

    /// Every object released, in release order
    pub fn released(&self) -> Vec<String> {
        self.calls_of("release")
            .into_iter()
            .map(|args| args[0].clone())
            .collect()
    }

    /// Candidate strings handed to `endpoint`, in order
    pub fn candidates_for(&self, endpoint: &str) -> Vec<String> {
        self.calls_of("add_candidate")
            .into_iter()
            .filter(|args| args[0] == endpoint)
            .map(|args| args[1].clone())
            .collect()
    }

    fn invoke(&self, op: &'static str, args: Vec<String>) -> Result<(), MediaError> {
        self.calls.lock().unwrap().push(BackendCall { op, args });

        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(op).or_insert(0);
        *count += 1;

        if self.failures.lock().unwrap().get(op) == Some(count) {
            return Err(MediaError::Rejected {
                operation: op.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn create(&self, op: &'static str, prefix: &str, args: Vec<String>) -> Result<MediaObjectId, MediaError> {
        self.invoke(op, args)?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = MediaObjectId::new(format!("{prefix}-{n}"));
        self.created.lock().unwrap().push(id.clone());
        Ok(id)
    }
}

#[async_trait]
impl MediaBackend for FakeBackend {
    async fn create_pipeline(&self) -> Result<MediaObjectId, MediaError> {
        self.create("create_pipeline", "pipeline", vec![])
    }

    async fn create_endpoint(&self, pipeline: &MediaObjectId) -> Result<MediaObjectId, MediaError> {
        self.pass_gate("create_endpoint").await;
        self.create("create_endpoint", "endpoint", vec![pipeline.to_string()])
    }

    async fn create_mixer(&self, pipeline: &MediaObjectId) -> Result<MediaObjectId, MediaError> {
        self.pass_gate("create_mixer").await;
        self.create("create_mixer", "mixer", vec![pipeline.to_string()])
    }

    async fn create_mixer_port(&self, mixer: &MediaObjectId) -> Result<MediaObjectId, MediaError> {
        self.create("create_mixer_port", "port", vec![mixer.to_string()])
    }

    async fn create_recorder(
        &self,
        pipeline: &MediaObjectId,
        destination_uri: &str,
    ) -> Result<MediaObjectId, MediaError> {
        self.create(
            "create_recorder",
            "recorder",
            vec![pipeline.to_string(), destination_uri.to_string()],
        )
    }

    async fn create_player_source(
        &self,
        pipeline: &MediaObjectId,
        source_uri: &str,
    ) -> Result<MediaObjectId, MediaError> {
        self.pass_gate("create_player_source").await;
        self.create(
            "create_player_source",
            "player",
            vec![pipeline.to_string(), source_uri.to_string()],
        )
    }

    async fn connect(&self, source: &MediaObjectId, sink: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke("connect", vec![source.to_string(), sink.to_string()])
    }

    async fn subscribe(&self, object: &MediaObjectId, kind: MediaEventKind) -> Result<(), MediaError> {
        self.invoke("subscribe", vec![object.to_string(), format!("{kind:?}")])
    }

    async fn add_candidate(
        &self,
        endpoint: &MediaObjectId,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        self.invoke(
            "add_candidate",
            vec![endpoint.to_string(), candidate.candidate.clone()],
        )
    }

    async fn process_offer(&self, endpoint: &MediaObjectId, offer: &str) -> Result<String, MediaError> {
        self.pass_gate("process_offer").await;
        self.invoke("process_offer", vec![endpoint.to_string(), offer.to_string()])?;
        Ok(format!("answer-to-{offer}"))
    }

    async fn gather_candidates(&self, endpoint: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke("gather_candidates", vec![endpoint.to_string()])
    }

    async fn record(&self, recorder: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke("record", vec![recorder.to_string()])
    }

    async fn play(&self, player: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke("play", vec![player.to_string()])
    }

    async fn stop(&self, element: &MediaObjectId) -> Result<(), MediaError> {
        self.pass_gate("stop").await;
        self.invoke("stop", vec![element.to_string()])
    }

    async fn release(&self, object: &MediaObjectId) -> Result<(), MediaError> {
        self.pass_gate("release").await;
        self.invoke("release", vec![object.to_string()])
    }
}

/// Dispatcher over a fresh fake backend
pub fn dispatcher() -> (Arc<FakeBackend>, Arc<Dispatcher>) {
    let backend = FakeBackend::new();
    let dispatcher = Arc::new(Dispatcher::new(backend.clone(), RecordingConfig::default()));
    (backend, dispatcher)
}

/// A connection whose outbound messages land in the returned receiver
pub fn connection() -> (ClientConnection, mpsc::Receiver<ServerMessage>) {
    connection_with_capacity(64)
}

/// Like [`connection`], with an outbound queue of `capacity` messages
pub fn connection_with_capacity(capacity: usize) -> (ClientConnection, mpsc::Receiver<ServerMessage>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ClientConnection::new(tx), rx)
}

/// Connect and register `name`, swallowing the register response
pub async fn registered(
    dispatcher: &Dispatcher,
    name: &str,
) -> (ClientConnection, mpsc::Receiver<ServerMessage>) {
    registered_with_capacity(dispatcher, name, 64).await
}

/// Like [`registered`], with an outbound queue of `capacity` messages
pub async fn registered_with_capacity(
    dispatcher: &Dispatcher,
    name: &str,
    capacity: usize,
) -> (ClientConnection, mpsc::Receiver<ServerMessage>) {
    let (conn, mut rx) = connection_with_capacity(capacity);
    dispatcher
        .registry()
        .register(conn.id(), name, conn.clone())
        .await
        .expect("registration should succeed");
    drain(&mut rx);
    (conn, rx)
}

/// Everything queued on a receiver right now
pub fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    messages
}

pub fn candidate(text: &str) -> IceCandidate {
    IceCandidate::new(text)
}
