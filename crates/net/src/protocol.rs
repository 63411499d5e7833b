//! Wire protocol message types
//!
//! Signaling messages are `{"event": <name>, "data": <payload>}` objects.
//! Control messages are `{"action": <name>, ...}` requests answered by a
//! [`ControlResponse`]. Both ride on the length-prefixed frame codec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use livecourse_core::{
    Error as CoreError, NewSession, ParticipantInfo, SessionFilter, SessionId,
    TransportDescriptor,
};

/// Longest accepted chat message, in characters
pub const MAX_CHAT_CHARS: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMeeting {
    pub meeting_code: String,
    pub participant_id: String,
    #[serde(default)]
    pub participant_name: String,
    #[serde(default)]
    pub is_host: bool,
}

/// Client to server signaling events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinMeeting(JoinMeeting),
    ChatMessage {
        message: String,
    },
    Offer {
        sdp: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    Answer {
        sdp: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    IceCandidate {
        candidate: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    ToggleAudio {
        enabled: bool,
    },
    ToggleVideo {
        enabled: bool,
    },
    StartScreenShare {},
    StopScreenShare {},
    ScreenShareOffer {
        sdp: Value,
    },
    ScreenShareAnswer {
        sdp: Value,
    },
    ScreenShareIceCandidate {
        candidate: Value,
    },
    CreateTransport {},
    LeaveMeeting {},
    Ping {},
}

impl ClientEvent {
    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinMeeting(_) => "join-meeting",
            ClientEvent::ChatMessage { .. } => "chat-message",
            ClientEvent::Offer { .. } => "offer",
            ClientEvent::Answer { .. } => "answer",
            ClientEvent::IceCandidate { .. } => "ice-candidate",
            ClientEvent::ToggleAudio { .. } => "toggle-audio",
            ClientEvent::ToggleVideo { .. } => "toggle-video",
            ClientEvent::StartScreenShare {} => "start-screen-share",
            ClientEvent::StopScreenShare {} => "stop-screen-share",
            ClientEvent::ScreenShareOffer { .. } => "screen-share-offer",
            ClientEvent::ScreenShareAnswer { .. } => "screen-share-answer",
            ClientEvent::ScreenShareIceCandidate { .. } => "screen-share-ice-candidate",
            ClientEvent::CreateTransport {} => "create-transport",
            ClientEvent::LeaveMeeting {} => "leave-meeting",
            ClientEvent::Ping {} => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedMeeting {
    pub meeting_code: String,
    pub participant_id: String,
    pub participant_name: String,
    pub participant_count: usize,
    pub is_host: bool,
    pub router_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeft {
    pub participant_id: String,
    pub participant_name: String,
    pub left_at: DateTime<Utc>,
    pub was_host: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub message: String,
    pub sender: String,
    pub sender_id: String,
    pub is_host: bool,
    pub timestamp: DateTime<Utc>,
}

/// SDP forwarded from another participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedSdp {
    pub sdp: Value,
    pub from: String,
    pub from_name: String,
}

/// ICE candidate forwarded from another participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayedCandidate {
    pub candidate: Value,
    pub from: String,
    pub from_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioToggle {
    pub participant_id: String,
    pub participant_name: String,
    pub audio_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoToggle {
    pub participant_id: String,
    pub participant_name: String,
    pub video_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenShareStarted {
    pub host_id: String,
    pub host_name: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenShareStopped {
    pub host_id: String,
    pub host_name: String,
    pub stopped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub success: bool,
    pub message: String,
}

/// Error reported to a signaling client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// Server to client signaling events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    JoinedMeeting(JoinedMeeting),
    CurrentParticipants(Vec<ParticipantInfo>),
    ParticipantJoined(ParticipantInfo),
    ParticipantLeft(ParticipantLeft),
    ChatMessage(ChatMessage),
    Offer(RelayedSdp),
    Answer(RelayedSdp),
    IceCandidate(RelayedCandidate),
    ParticipantAudioToggle(AudioToggle),
    ParticipantVideoToggle(VideoToggle),
    ScreenShareStarted(ScreenShareStarted),
    ScreenShareStopped(ScreenShareStopped),
    ScreenShareStartedConfirmation(Confirmation),
    ScreenShareStoppedConfirmation(Confirmation),
    ScreenShareOffer(RelayedSdp),
    ScreenShareAnswer(RelayedSdp),
    ScreenShareIceCandidate(RelayedCandidate),
    TransportCreated(TransportDescriptor),
    Pong {},
    Error(WireError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    pub session_id: SessionId,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSession {
    pub session_id: SessionId,
    #[serde(default)]
    pub user_id: String,
}

/// Session management requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum ControlRequest {
    CreateSession(NewSession),
    GetSession(SessionRef),
    ListSessions(SessionFilter),
    StartSession(StartSession),
    LeaveSession(SessionRef),
    ResumeSession(SessionRef),
    CompleteSession(SessionRef),
    JoinSession(JoinSession),
    SessionStatus(SessionRef),
}

impl ControlRequest {
    pub fn action(&self) -> &'static str {
        match self {
            ControlRequest::CreateSession(_) => "create-session",
            ControlRequest::GetSession(_) => "get-session",
            ControlRequest::ListSessions(_) => "list-sessions",
            ControlRequest::StartSession(_) => "start-session",
            ControlRequest::LeaveSession(_) => "leave-session",
            ControlRequest::ResumeSession(_) => "resume-session",
            ControlRequest::CompleteSession(_) => "complete-session",
            ControlRequest::JoinSession(_) => "join-session",
            ControlRequest::SessionStatus(_) => "session-status",
        }
    }
}

/// Failure details of a [`ControlResponse`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlFailure {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_start_at: Option<DateTime<Utc>>,
}

impl From<&CoreError> for ControlFailure {
    fn from(err: &CoreError) -> Self {
        let can_start_at = match err {
            CoreError::TooEarly { earliest } => Some(*earliest),
            _ => None,
        };
        Self {
            kind: err.code().to_string(),
            message: err.to_string(),
            can_start_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlFailure>,
}

impl ControlResponse {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(failure: ControlFailure) -> Self {
        Self {
            success: false,
            message: failure.message.clone(),
            data: None,
            error: Some(failure),
        }
    }
}
