//! Recording model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    Recording,
    Paused,
    Completed,
    Discarded,
    /// Stop timed out; the backend may still finalize the file
    Unknown,
}

impl RecordingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordingStatus::Recording => "recording",
            RecordingStatus::Paused => "paused",
            RecordingStatus::Completed => "completed",
            RecordingStatus::Discarded => "discarded",
            RecordingStatus::Unknown => "unknown",
        }
    }

    /// Recording or paused; a session holds at most one of these
    pub fn is_live(self) -> bool {
        matches!(self, RecordingStatus::Recording | RecordingStatus::Paused)
    }
}

/// A host-only recording of a live course
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording {
    pub session_id: SessionId,
    pub file_name: String,
    pub status: RecordingStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
    pub size_bytes: Option<u64>,
    pub url: Option<String>,
}

impl Recording {
    pub fn started(session_id: SessionId, file_name: String, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            file_name,
            status: RecordingStatus::Recording,
            started_at,
            ended_at: None,
            duration_seconds: None,
            size_bytes: None,
            url: None,
        }
    }
}
