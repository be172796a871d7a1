//! WebSocket listener and server main loop

use super::connection::{client_writer_task, ClientConnection};
use super::Dispatcher;
use crate::config::ServerConfig;
use crate::media::MediaEvent;
use crate::protocol::ServerMessage;
use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

/// Signaling server: accepts browser connections and pumps media events
pub struct SignalingServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    media_events: mpsc::UnboundedReceiver<MediaEvent>,
}

impl SignalingServer {
    /// Create a new signaling server
    pub fn new(
        config: ServerConfig,
        dispatcher: Arc<Dispatcher>,
        media_events: mpsc::UnboundedReceiver<MediaEvent>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            media_events,
        }
    }

    /// Bind the configured address and run until shutdown
    pub async fn run(self, shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.listen_addr))?;
        self.serve(listener, shutdown_rx).await
    }

    /// Run on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Signaling server listening on ws://{}{}", local_addr, self.config.ws_path);

        let Self {
            config,
            dispatcher,
            mut media_events,
        } = self;

        // Media server events are routed in arrival order on their own task
        let event_dispatcher = Arc::clone(&dispatcher);
        let event_task = tokio::spawn(async move {
            while let Some(event) = media_events.recv().await {
                let _ = event_dispatcher.handle_media_event(event).await;
            }
            tracing::info!("Media event loop finished");
        });

        let config = Arc::new(config);

        // Main server loop
        loop {
            tokio::select! {
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }

                // Accept new connections
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            let dispatcher = Arc::clone(&dispatcher);
                            let config = Arc::clone(&config);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, addr, dispatcher, &config).await {
                                    tracing::warn!("Client {} error: {:#}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        event_task.abort();
        Ok(())
    }
}

/// Handle a single browser connection from upgrade to close
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    config: &ServerConfig,
) -> Result<()> {
    let ws_path = config.ws_path.clone();
    let socket = tokio_tungstenite::accept_hdr_async(
        stream,
        move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() == ws_path {
                Ok(response)
            } else {
                let mut rejection =
                    ErrorResponse::new(Some(format!("no signaling endpoint at {}", request.uri().path())));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        },
    )
    .await
    .context("WebSocket handshake failed")?;

    let (writer, mut reader) = socket.split();

    // Create message channel for this client
    let (tx, rx) = mpsc::channel::<ServerMessage>(config.outbound_queue);
    let client = ClientConnection::new(tx);
    let session_id = client.id();
    tracing::info!("Connection received from {} with sessionId {}", addr, session_id);

    // Spawn writer task
    let writer_handle = tokio::spawn(client_writer_task(writer, rx));

    // Messages from one connection are handled strictly in order
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatcher.handle_text(&client, &text).await,
            Ok(Message::Binary(_)) => {
                let _ = client
                    .send(ServerMessage::error("binary frames are not supported"))
                    .await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Connection {} error: {}", session_id, e);
                break;
            }
        }
    }

    tracing::info!("Connection {} closed", session_id);
    dispatcher.disconnect(session_id).await;

    drop(client);
    writer_handle.abort();

    Ok(())
}
