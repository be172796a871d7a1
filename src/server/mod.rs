//! Server module - WebSocket listener, connection handling and message dispatch

mod connection;
mod dispatcher;
mod listener;

pub use connection::ClientConnection;
pub use dispatcher::Dispatcher;
pub use listener::SignalingServer;
