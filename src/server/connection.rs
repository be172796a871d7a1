//! Client connection handling

use crate::protocol::{encode, ServerMessage};
use crate::session::SessionId;
use anyhow::{anyhow, Result};
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Outbound side of a connected browser
#[derive(Debug, Clone)]
pub struct ClientConnection {
    /// Unique connection identifier, doubles as the session id
    id: SessionId,

    /// Channel to send messages to this client
    sender: mpsc::Sender<ServerMessage>,
}

impl ClientConnection {
    /// Create a new client connection with a fresh id
    pub fn new(sender: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    /// Get client ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Send a message to the client
    pub async fn send(&self, msg: ServerMessage) -> Result<()> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| anyhow!("connection {} is closed", self.id))
    }

    /// Queue a message without waiting for room in the outbound queue
    pub fn try_send(&self, msg: ServerMessage) -> Result<()> {
        self.sender.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => anyhow!("outbound queue of connection {} is full", self.id),
            TrySendError::Closed(_) => anyhow!("connection {} is closed", self.id),
        })
    }
}

/// Task to write outgoing messages to the client as text frames
pub async fn client_writer_task<W>(mut writer: W, mut receiver: mpsc::Receiver<ServerMessage>)
where
    W: Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    while let Some(msg) = receiver.recv().await {
        match encode(&msg) {
            Ok(text) => {
                if let Err(e) = writer.send(Message::Text(text)).await {
                    tracing::error!("Failed to write message to client: {}", e);
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
            }
        }
    }

    let _ = writer.close().await;
    tracing::debug!("Client writer task finished");
}
