//! Kurento media server client
//!
//! Speaks Kurento's JSON-RPC 2.0 protocol over a WebSocket: `create`,
//! `invoke`, `subscribe` and `release` requests, matched to responses by
//! request id, plus `onEvent` notifications for subscribed elements.

use super::{MediaBackend, MediaError, MediaEvent, MediaEventKind, MediaObjectId};
use crate::protocol::IceCandidate;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

/// Error object of a JSON-RPC response
#[derive(Debug, Clone, PartialEq, Eq)]
struct RpcError {
    code: i64,
    message: String,
}

/// A frame received from the media server
#[derive(Debug, PartialEq)]
enum Incoming {
    Response {
        id: u64,
        result: Result<Value, RpcError>,
    },
    Event(MediaEvent),
    Ignored,
}

/// Wire name of a subscribable event
fn event_type(kind: MediaEventKind) -> &'static str {
    match kind {
        MediaEventKind::IceCandidateFound => "IceCandidateFound",
        MediaEventKind::IceGatheringDone => "IceGatheringDone",
        MediaEventKind::EndOfStream => "EndOfStream",
    }
}

/// Classify a text frame from the media server
fn parse_incoming(text: &str) -> Incoming {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        tracing::warn!("Unparseable frame from media server: {}", text);
        return Incoming::Ignored;
    };

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let result = match frame.get("error") {
            Some(error) => Err(RpcError {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
        };
        return Incoming::Response { id, result };
    }

    if frame.get("method").and_then(Value::as_str) == Some("onEvent") {
        if let Some(event) = frame.pointer("/params/value").and_then(parse_event) {
            return Incoming::Event(event);
        }
    }

    Incoming::Ignored
}

fn parse_event(value: &Value) -> Option<MediaEvent> {
    let data = value.get("data");
    let source = value
        .get("object")
        .or_else(|| data.and_then(|d| d.get("source")))
        .and_then(Value::as_str)
        .map(MediaObjectId::new)?;

    match value.get("type").and_then(Value::as_str)? {
        "IceCandidateFound" => {
            let candidate: IceCandidate =
                serde_json::from_value(data?.get("candidate")?.clone()).ok()?;
            Some(MediaEvent::IceCandidateFound { source, candidate })
        }
        "IceGatheringDone" => Some(MediaEvent::IceGatheringDone { source }),
        "EndOfStream" => Some(MediaEvent::EndOfStream { source }),
        other => {
            tracing::debug!("Ignoring media event {} from {}", other, source);
            None
        }
    }
}

/// Connection to a Kurento media server
pub struct KurentoClient {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    session_id: Mutex<Option<String>>,
    request_timeout: Duration,
    media_profile: String,
}

impl KurentoClient {
    /// Connect and start pumping frames; subscribed events go to `events`
    ///
    /// The event channel is unbounded so the reader never stops delivering
    /// responses while events wait to be routed.
    pub async fn connect(
        uri: &str,
        request_timeout: Duration,
        events: mpsc::UnboundedSender<MediaEvent>,
    ) -> Result<Self> {
        let (socket, _) = tokio_tungstenite::connect_async(uri)
            .await
            .with_context(|| format!("Could not find media server at address {uri}"))?;
        tracing::info!("Connected to media server at {}", uri);

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    tracing::error!("Failed to write to media server: {}", e);
                    break;
                }
            }
            tracing::debug!("Media server writer task finished");
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match parse_incoming(&text) {
                        Incoming::Response { id, result } => {
                            match reader_pending.lock().await.remove(&id) {
                                Some(waiter) => {
                                    let _ = waiter.send(result);
                                }
                                None => tracing::debug!("Late response for request {}", id),
                            }
                        }
                        Incoming::Event(event) => {
                            if events.send(event).is_err() {
                                tracing::warn!("Media event receiver is gone");
                            }
                        }
                        Incoming::Ignored => {}
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("Media server connection error: {}", e);
                        break;
                    }
                }
            }

            // Dropping the waiters fails every in-flight request
            reader_pending.lock().await.clear();
            tracing::warn!("Media server connection closed");
        });

        Ok(Self {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            session_id: Mutex::new(None),
            request_timeout,
            media_profile: "MP4".to_string(),
        })
    }

    /// Container profile used for new recorders
    pub fn with_media_profile(mut self, profile: impl Into<String>) -> Self {
        self.media_profile = profile.into();
        self
    }

    async fn request(
        &self,
        method: &str,
        mut params: Value,
        operation: String,
    ) -> Result<Value, MediaError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(session) = self.session_id.lock().await.clone() {
            params["sessionId"] = Value::String(session);
        }
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outbound.send(Message::Text(frame.to_string())).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(MediaError::Transport("writer has stopped".to_string()));
        }

        let result = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return Err(MediaError::Transport("connection closed".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(MediaError::Timeout(operation));
            }
        };

        let value = result.map_err(|e| MediaError::Rejected {
            operation,
            message: format!("{} (code {})", e.message, e.code),
        })?;

        if let Some(session) = value.get("sessionId").and_then(Value::as_str) {
            let mut current = self.session_id.lock().await;
            if current.as_deref() != Some(session) {
                *current = Some(session.to_string());
            }
        }
        Ok(value)
    }

    async fn create(&self, kind: &str, constructor_params: Value) -> Result<MediaObjectId, MediaError> {
        let operation = format!("create {kind}");
        let result = self
            .request(
                "create",
                json!({ "type": kind, "constructorParams": constructor_params, "properties": {} }),
                operation.clone(),
            )
            .await?;

        result
            .get("value")
            .and_then(Value::as_str)
            .map(MediaObjectId::new)
            .ok_or_else(|| MediaError::Protocol(format!("{operation} returned no object id")))
    }

    async fn invoke(
        &self,
        object: &MediaObjectId,
        operation: &str,
        operation_params: Value,
    ) -> Result<Value, MediaError> {
        self.request(
            "invoke",
            json!({
                "object": object.as_str(),
                "operation": operation,
                "operationParams": operation_params,
            }),
            format!("{operation} on {object}"),
        )
        .await
    }
}

#[async_trait]
impl MediaBackend for KurentoClient {
    async fn create_pipeline(&self) -> Result<MediaObjectId, MediaError> {
        self.create("MediaPipeline", json!({})).await
    }

    async fn create_endpoint(&self, pipeline: &MediaObjectId) -> Result<MediaObjectId, MediaError> {
        self.create("WebRtcEndpoint", json!({ "mediaPipeline": pipeline.as_str() }))
            .await
    }

    async fn create_mixer(&self, pipeline: &MediaObjectId) -> Result<MediaObjectId, MediaError> {
        self.create("Composite", json!({ "mediaPipeline": pipeline.as_str() }))
            .await
    }

    async fn create_mixer_port(&self, mixer: &MediaObjectId) -> Result<MediaObjectId, MediaError> {
        self.create("HubPort", json!({ "hub": mixer.as_str() })).await
    }

    async fn create_recorder(
        &self,
        pipeline: &MediaObjectId,
        destination_uri: &str,
    ) -> Result<MediaObjectId, MediaError> {
        self.create(
            "RecorderEndpoint",
            json!({
                "mediaPipeline": pipeline.as_str(),
                "uri": destination_uri,
                "mediaProfile": self.media_profile,
            }),
        )
        .await
    }

    async fn create_player_source(
        &self,
        pipeline: &MediaObjectId,
        source_uri: &str,
    ) -> Result<MediaObjectId, MediaError> {
        self.create(
            "PlayerEndpoint",
            json!({ "mediaPipeline": pipeline.as_str(), "uri": source_uri }),
        )
        .await
    }

    async fn connect(&self, source: &MediaObjectId, sink: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke(source, "connect", json!({ "sink": sink.as_str() }))
            .await
            .map(drop)
    }

    async fn subscribe(&self, object: &MediaObjectId, kind: MediaEventKind) -> Result<(), MediaError> {
        let event = event_type(kind);
        self.request(
            "subscribe",
            json!({ "type": event, "object": object.as_str() }),
            format!("subscribe {event} on {object}"),
        )
        .await
        .map(drop)
    }

    async fn add_candidate(
        &self,
        endpoint: &MediaObjectId,
        candidate: &IceCandidate,
    ) -> Result<(), MediaError> {
        self.invoke(endpoint, "addIceCandidate", json!({ "candidate": candidate }))
            .await
            .map(drop)
    }

    async fn process_offer(&self, endpoint: &MediaObjectId, offer: &str) -> Result<String, MediaError> {
        let result = self
            .invoke(endpoint, "processOffer", json!({ "offer": offer }))
            .await?;
        result
            .get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| MediaError::Protocol(format!("processOffer on {endpoint} returned no answer")))
    }

    async fn gather_candidates(&self, endpoint: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke(endpoint, "gatherCandidates", json!({}))
            .await
            .map(drop)
    }

    async fn record(&self, recorder: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke(recorder, "record", json!({})).await.map(drop)
    }

    async fn play(&self, player: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke(player, "play", json!({})).await.map(drop)
    }

    async fn stop(&self, element: &MediaObjectId) -> Result<(), MediaError> {
        self.invoke(element, "stop", json!({})).await.map(drop)
    }

    async fn release(&self, object: &MediaObjectId) -> Result<(), MediaError> {
        self.request(
            "release",
            json!({ "object": object.as_str() }),
            format!("release {object}"),
        )
        .await
        .map(drop)
    }
}
