//! Message types for the signaling protocol

use serde::{Deserialize, Serialize};

/// Messages sent from a browser peer to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Claim a user name for this connection
    Register {
        #[serde(default)]
        name: String,
    },

    /// Ring another registered user
    #[serde(rename_all = "camelCase")]
    Call {
        to: String,
        /// Caller's own name as the browser sees it; the registered name wins
        #[serde(default)]
        from: Option<String>,
        sdp_offer: String,
    },

    /// Callee's answer to an incoming call
    #[serde(rename_all = "camelCase")]
    IncomingCallResponse {
        from: String,
        call_response: CallDecision,
        #[serde(default)]
        sdp_offer: Option<String>,
    },

    /// Replay the most recent recording
    #[serde(rename_all = "camelCase")]
    Play { sdp_offer: String },

    /// Hang up or stop playback
    Stop,

    /// Connectivity candidate discovered by the browser
    OnIceCandidate { candidate: IceCandidate },
}

impl ClientMessage {
    /// Wire discriminant of this message
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::Call { .. } => "call",
            ClientMessage::IncomingCallResponse { .. } => "incomingCallResponse",
            ClientMessage::Play { .. } => "play",
            ClientMessage::Stop => "stop",
            ClientMessage::OnIceCandidate { .. } => "onIceCandidate",
        }
    }
}

/// Messages sent from the server to a browser peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Outcome of a register request
    RegisterResponse {
        response: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Someone is calling
    IncomingCall { from: String },

    /// Outcome of a call, delivered to the caller
    #[serde(rename_all = "camelCase")]
    CallResponse {
        response: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Call established, delivered to the callee
    #[serde(rename_all = "camelCase")]
    StartCommunication { sdp_answer: String },

    /// Call torn down
    StopCommunication {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Outcome of a play request
    #[serde(rename_all = "camelCase")]
    PlayResponse {
        response: ResponseStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdp_answer: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Playback reached the end of the recording
    StopPlay,

    /// Connectivity candidate discovered by the media server
    IceCandidate { candidate: IceCandidate },

    /// Request could not be processed
    Error { message: String },
}

impl ServerMessage {
    pub fn register_accepted() -> Self {
        ServerMessage::RegisterResponse {
            response: ResponseStatus::Accepted,
            message: None,
        }
    }

    pub fn register_rejected(message: impl Into<String>) -> Self {
        ServerMessage::RegisterResponse {
            response: ResponseStatus::Rejected,
            message: Some(message.into()),
        }
    }

    pub fn call_accepted(sdp_answer: String) -> Self {
        ServerMessage::CallResponse {
            response: ResponseStatus::Accepted,
            sdp_answer: Some(sdp_answer),
            message: None,
        }
    }

    pub fn call_rejected(message: impl Into<String>) -> Self {
        ServerMessage::CallResponse {
            response: ResponseStatus::Rejected,
            sdp_answer: None,
            message: Some(message.into()),
        }
    }

    pub fn stop_communication(message: Option<String>) -> Self {
        ServerMessage::StopCommunication { message }
    }

    pub fn play_accepted(sdp_answer: String) -> Self {
        ServerMessage::PlayResponse {
            response: ResponseStatus::Accepted,
            sdp_answer: Some(sdp_answer),
            message: None,
        }
    }

    pub fn play_rejected(message: impl Into<String>) -> Self {
        ServerMessage::PlayResponse {
            response: ResponseStatus::Rejected,
            sdp_answer: None,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Accepted/rejected flag carried by response messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Accepted,
    Rejected,
}

/// Callee's decision on an incoming call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDecision {
    Accept,
    Reject,
}

/// Opaque connectivity candidate, in the shape browsers emit it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}
