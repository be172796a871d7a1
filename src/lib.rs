//! callrec - one-to-one call signaling with composite recording and playback
//!
//! This crate provides the signaling core for browser-to-browser calls whose
//! media is relayed, mixed and recorded by an external media server:
//! - Session registry (who is connected under which name)
//! - Candidate buffering until media endpoints exist
//! - Pipeline construction, teardown and event routing
//! - The call negotiation state machine
//! - WebSocket transport and message dispatch
//!
//! # Architecture
//!
//! Browsers connect over WebSocket and exchange JSON messages with the
//! server. The server never touches media itself: it drives a Kurento media
//! server through the [`media::MediaBackend`] trait and relays SDP and ICE
//! candidates between the browsers and the endpoints it creates there.

pub mod call;
pub mod config;
pub mod media;
pub mod protocol;
pub mod server;
pub mod session;
