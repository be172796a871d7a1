//! Integration tests for the WebSocket server

mod common;

use callrec::config::{Config, ServerConfig};
use callrec::media::MediaEvent;
use callrec::protocol::ServerMessage;
use callrec::server::{Dispatcher, SignalingServer};
use common::FakeBackend;
use futures_util::{SinkExt, StreamExt};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    backend: Arc<FakeBackend>,
    dispatcher: Arc<Dispatcher>,
    events: mpsc::UnboundedSender<MediaEvent>,
    shutdown: mpsc::Sender<()>,
}

async fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (backend, dispatcher) = common::dispatcher();
    let (events, event_rx) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = mpsc::channel::<()>(1);

    let server = SignalingServer::new(ServerConfig::default(), Arc::clone(&dispatcher), event_rx);
    tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

    TestServer {
        addr,
        backend,
        dispatcher,
        events,
        shutdown,
    }
}

async fn connect(server: &TestServer) -> Client {
    let url = format!("ws://{}/one2onecomposrec", server.addr);
    let (socket, _) = timeout(Duration::from_secs(2), connect_async(url))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    socket
}

async fn send(client: &mut Client, text: &str) {
    client.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next server message, skipping control frames
async fn recv(client: &mut Client) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("no message within timeout")
            .expect("stream ended")
            .expect("read failed");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("server sent invalid JSON");
        }
    }
}

async fn register(client: &mut Client, name: &str) {
    send(client, &format!(r#"{{"id":"register","name":"{name}"}}"#)).await;
    assert_eq!(recv(client).await, ServerMessage::register_accepted());
}

#[tokio::test]
async fn test_call_over_websocket() {
    let server = start_server().await;
    let mut alice = connect(&server).await;
    let mut bob = connect(&server).await;
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;

    send(&mut alice, r#"{"id":"call","from":"alice","to":"bob","sdpOffer":"offer-a"}"#).await;
    assert_eq!(
        recv(&mut bob).await,
        ServerMessage::IncomingCall {
            from: "alice".to_string()
        }
    );

    send(
        &mut bob,
        r#"{"id":"incomingCallResponse","from":"alice","callResponse":"accept","sdpOffer":"offer-b"}"#,
    )
    .await;
    assert_eq!(
        recv(&mut bob).await,
        ServerMessage::StartCommunication {
            sdp_answer: "answer-to-offer-b".to_string()
        }
    );
    assert_eq!(
        recv(&mut alice).await,
        ServerMessage::call_accepted("answer-to-offer-a".to_string())
    );

    // Both sides finish gathering; recording starts
    let registry = server.dispatcher.registry();
    let alice_id = registry.get_by_name("alice").await.unwrap().id();
    let bob_id = registry.get_by_name("bob").await.unwrap().id();
    let pipeline = server
        .dispatcher
        .negotiator()
        .active_pipeline(&alice_id)
        .await
        .unwrap();
    for id in [alice_id, bob_id] {
        let source = pipeline.endpoint(&id).unwrap().clone();
        server
            .events
            .send(MediaEvent::IceGatheringDone { source })
            .unwrap();
    }
    let latest = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(uri) = server.dispatcher.coordinator().latest_recording().await {
                return uri;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("recording never started");
    assert_eq!(Some(latest.as_str()), pipeline.recording_uri());

    // Closing one socket hangs up the other side
    alice.close(None).await.unwrap();
    assert_eq!(
        recv(&mut bob).await,
        ServerMessage::stop_communication(Some("remote user hanged out".to_string()))
    );
    assert!(pipeline.is_released());
    assert_eq!(server.backend.count("record"), 1);

    let _ = server.shutdown.send(()).await;
}

#[tokio::test]
async fn test_invalid_message_gets_error_reply() {
    let server = start_server().await;
    let mut client = connect(&server).await;

    send(&mut client, r#"{"id":"dance"}"#).await;
    assert_eq!(recv(&mut client).await, ServerMessage::error("Invalid message dance"));

    client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    assert!(matches!(recv(&mut client).await, ServerMessage::Error { .. }));

    let _ = server.shutdown.send(()).await;
}

#[tokio::test]
async fn test_wrong_path_is_refused() {
    let server = start_server().await;

    let url = format!("ws://{}/elsewhere", server.addr);
    let result = timeout(Duration::from_secs(2), connect_async(url))
        .await
        .expect("handshake timed out");

    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 404);
        }
        Err(other) => panic!("Unexpected error: {other}"),
        Ok(_) => panic!("Upgrade on the wrong path should fail"),
    }

    let _ = server.shutdown.send(()).await;
}

#[tokio::test]
async fn test_closed_connection_is_unregistered() {
    let server = start_server().await;
    let mut client = connect(&server).await;
    register(&mut client, "alice").await;

    client.close(None).await.unwrap();

    let gone = timeout(Duration::from_secs(2), async {
        while !server.dispatcher.registry().is_empty().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "registry should be empty after close");

    let _ = server.shutdown.send(()).await;
}

#[test]
fn test_config_file_overrides_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[server]
listen_addr = "127.0.0.1:9000"

[recording]
uri_prefix = "file:///var/recordings/call"
extension = "webm"
media_profile = "WEBM"
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();

    assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
    assert_eq!(config.server.ws_path, "/one2onecomposrec");
    assert_eq!(config.media.ws_uri, "ws://localhost:8888/kurento");
    assert_eq!(
        config.recording.uri_for("x"),
        "file:///var/recordings/call-x.webm"
    );
}

#[test]
fn test_missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    assert!(Config::load(Some(missing.as_path())).is_err());
}
